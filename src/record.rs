//! Per-block supply records and block identifiers.
//!
//! One [`SupplyRecord`] is decoded from each line of the tracer's JSONL
//! output. Records are immutable once decoded: the tracker clones them into
//! its history and never edits them.

use std::fmt;

use serde::{Deserialize, Deserializer, Serialize, Serializer};

use crate::amount::Amount;

/// Opaque 32-byte block identifier.
///
/// The all-zero hash is distinguished: it marks the uninitialised head and
/// the claimed parent of a genesis record.
#[derive(Clone, Copy, Default, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct BlockHash([u8; 32]);

impl BlockHash {
    pub const ZERO: BlockHash = BlockHash([0u8; 32]);

    pub fn new(bytes: [u8; 32]) -> Self {
        Self(bytes)
    }

    pub fn is_zero(&self) -> bool {
        *self == Self::ZERO
    }

    pub fn as_bytes(&self) -> &[u8; 32] {
        &self.0
    }
}

impl From<[u8; 32]> for BlockHash {
    fn from(bytes: [u8; 32]) -> Self {
        Self(bytes)
    }
}

impl fmt::Display for BlockHash {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "0x{}", hex::encode(self.0))
    }
}

impl fmt::Debug for BlockHash {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Display::fmt(self, f)
    }
}

impl Serialize for BlockHash {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&self.to_string())
    }
}

impl<'de> Deserialize<'de> for BlockHash {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let literal = String::deserialize(deserializer)?;
        let digits = literal
            .strip_prefix("0x")
            .or_else(|| literal.strip_prefix("0X"))
            .ok_or_else(|| serde::de::Error::custom("block hash must be 0x-prefixed hex"))?;
        let bytes = hex::decode(digits).map_err(serde::de::Error::custom)?;
        let bytes: [u8; 32] = bytes
            .try_into()
            .map_err(|_| serde::de::Error::custom("block hash must be 32 bytes"))?;
        Ok(Self(bytes))
    }
}

/// Additive supply contributions of one block.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Issuance {
    /// Pre-mined allocation credited at genesis.
    #[serde(default)]
    pub genesis_alloc: Amount,

    /// Consensus-layer block reward.
    #[serde(default)]
    pub reward: Amount,

    /// Validator withdrawals processed in the block.
    #[serde(default)]
    pub withdrawals: Amount,
}

impl Issuance {
    /// Sum of all issuance categories.
    pub fn total(&self) -> Amount {
        self.genesis_alloc.clone() + &self.reward + &self.withdrawals
    }
}

/// Subtractive supply contributions of one block.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Burn {
    /// Base fee burned per EIP-1559.
    #[serde(default)]
    pub eip1559: Amount,

    /// Blob fee burned per EIP-4844.
    #[serde(default)]
    pub blob: Amount,

    /// Anything else the tracer classifies as destroyed.
    #[serde(default)]
    pub misc: Amount,
}

impl Burn {
    /// Sum of all burn categories.
    pub fn total(&self) -> Amount {
        self.eip1559.clone() + &self.blob + &self.misc
    }
}

/// The net supply effect of a single block, together with its identity.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SupplyRecord {
    #[serde(rename = "blockNumber")]
    pub number: u64,

    pub hash: BlockHash,

    pub parent_hash: BlockHash,

    #[serde(default)]
    pub issuance: Issuance,

    #[serde(default)]
    pub burn: Burn,
}

impl SupplyRecord {
    /// Net signed supply change of this block: issuance minus burn.
    pub fn delta(&self) -> Amount {
        self.issuance.total() - self.burn.total()
    }
}
