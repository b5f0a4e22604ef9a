//! Arbitrary-precision signed supply quantities.
//!
//! All issuance and burn figures are carried as [`Amount`]s so that running
//! totals survive values outside the `u64` range and negative accumulations
//! (a chain that burns more than it issues has a negative delta).
//!
//! The wire form is a `0x`-prefixed lowercase hex magnitude, with a leading
//! `-` for negative values. Checkpoint and API encodings that need the sign
//! carried out-of-band split it off themselves (see the checkpoint module).

use std::fmt;
use std::ops::{Add, AddAssign, Neg, Sub, SubAssign};

use num_bigint::{BigInt, BigUint, Sign};
use num_traits::{Signed, Zero};
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use thiserror::Error;

/// An arbitrary-precision signed quantity of wei.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Amount(BigInt);

/// Failure to parse an [`Amount`] from its hex wire form.
#[derive(Debug, Error, PartialEq, Eq)]
#[error("invalid amount literal {0:?}")]
pub struct ParseAmountError(String);

impl Amount {
    /// The zero quantity.
    pub fn zero() -> Self {
        Self(BigInt::zero())
    }

    pub fn is_zero(&self) -> bool {
        self.0.is_zero()
    }

    pub fn is_negative(&self) -> bool {
        self.0.is_negative()
    }

    /// Absolute magnitude.
    pub fn abs(&self) -> Self {
        Self(self.0.abs())
    }

    /// Encode as `0x`-prefixed hex, `-`-prefixed when negative.
    pub fn to_hex(&self) -> String {
        if self.0.is_negative() {
            format!("-0x{:x}", self.0.magnitude())
        } else {
            format!("0x{:x}", self.0.magnitude())
        }
    }

    /// Decode the hex wire form produced by [`Amount::to_hex`].
    pub fn from_hex(literal: &str) -> Result<Self, ParseAmountError> {
        let err = || ParseAmountError(literal.to_string());

        let (sign, rest) = match literal.strip_prefix('-') {
            Some(rest) => (Sign::Minus, rest),
            None => (Sign::Plus, literal),
        };
        let digits = rest
            .strip_prefix("0x")
            .or_else(|| rest.strip_prefix("0X"))
            .ok_or_else(err)?;
        if digits.is_empty() {
            return Err(err());
        }

        let magnitude = BigUint::parse_bytes(digits.as_bytes(), 16).ok_or_else(err)?;
        if magnitude.is_zero() {
            return Ok(Self::zero());
        }
        Ok(Self(BigInt::from_biguint(sign, magnitude)))
    }
}

impl From<u64> for Amount {
    fn from(value: u64) -> Self {
        Self(BigInt::from(value))
    }
}

impl From<i64> for Amount {
    fn from(value: i64) -> Self {
        Self(BigInt::from(value))
    }
}

impl fmt::Display for Amount {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

impl Add for Amount {
    type Output = Amount;

    fn add(self, rhs: Amount) -> Amount {
        Amount(self.0 + rhs.0)
    }
}

impl Add<&Amount> for Amount {
    type Output = Amount;

    fn add(self, rhs: &Amount) -> Amount {
        Amount(self.0 + &rhs.0)
    }
}

impl Sub for Amount {
    type Output = Amount;

    fn sub(self, rhs: Amount) -> Amount {
        Amount(self.0 - rhs.0)
    }
}

impl Sub<&Amount> for Amount {
    type Output = Amount;

    fn sub(self, rhs: &Amount) -> Amount {
        Amount(self.0 - &rhs.0)
    }
}

impl AddAssign<&Amount> for Amount {
    fn add_assign(&mut self, rhs: &Amount) {
        self.0 += &rhs.0;
    }
}

impl AddAssign for Amount {
    fn add_assign(&mut self, rhs: Amount) {
        self.0 += rhs.0;
    }
}

impl SubAssign<&Amount> for Amount {
    fn sub_assign(&mut self, rhs: &Amount) {
        self.0 -= &rhs.0;
    }
}

impl SubAssign for Amount {
    fn sub_assign(&mut self, rhs: Amount) {
        self.0 -= rhs.0;
    }
}

impl Neg for Amount {
    type Output = Amount;

    fn neg(self) -> Amount {
        Amount(-self.0)
    }
}

impl Serialize for Amount {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&self.to_hex())
    }
}

impl<'de> Deserialize<'de> for Amount {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let literal = String::deserialize(deserializer)?;
        Amount::from_hex(&literal).map_err(serde::de::Error::custom)
    }
}
