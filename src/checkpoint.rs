//! Durable projection of the tracker state.
//!
//! [`TotalSupply`] is the single wire shape for both the checkpoint file and
//! the API response body: head identity plus the seven totals. The delta is
//! hex-encoded as an absolute magnitude with its sign carried in a separate
//! `deltaSign` field, for compatibility with previously persisted state.
//! Checkpoints additionally carry the name of the last fully-consumed log
//! file; API responses omit it.
//!
//! Loading a checkpoint restores head and totals only. The block history is
//! not persisted, so a resumed tracker can extend the checkpointed head but
//! cannot reorganise across it.

use std::path::Path;

use serde::{Deserialize, Serialize};

use crate::amount::Amount;
use crate::record::{BlockHash, Burn, Issuance};
use crate::tracker::{HeadInfo, SupplyTotals};

/// Sign marker accompanying the hex-encoded delta magnitude.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum DeltaSign {
    #[serde(rename = "+")]
    Positive,
    #[serde(rename = "-")]
    Negative,
}

/// Head identity and running totals in wire form.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TotalSupply {
    pub block_number: u64,
    pub hash: BlockHash,
    pub parent_hash: BlockHash,

    /// Absolute magnitude of the net supply change.
    pub delta: Amount,
    pub delta_sign: DeltaSign,

    pub issuance: Issuance,
    pub burn: Burn,

    /// Last fully-consumed rotated log file. `None` in API responses.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub file: Option<String>,
}

impl TotalSupply {
    /// Project the tracker state into wire form.
    pub fn from_state(head: &HeadInfo, totals: &SupplyTotals, file: Option<String>) -> Self {
        let delta_sign = if totals.delta.is_negative() {
            DeltaSign::Negative
        } else {
            DeltaSign::Positive
        };
        Self {
            block_number: head.number,
            hash: head.hash,
            parent_hash: head.parent_hash,
            delta: totals.delta.abs(),
            delta_sign,
            issuance: totals.issuance.clone(),
            burn: totals.burn.clone(),
            file,
        }
    }

    /// Reassemble the tracker state, recombining the delta with its sign.
    pub fn into_state(self) -> (HeadInfo, SupplyTotals, Option<String>) {
        let head = HeadInfo {
            number: self.block_number,
            hash: self.hash,
            parent_hash: self.parent_hash,
        };
        let delta = match self.delta_sign {
            DeltaSign::Positive => self.delta,
            DeltaSign::Negative => -self.delta,
        };
        let totals = SupplyTotals {
            delta,
            issuance: self.issuance,
            burn: self.burn,
        };
        (head, totals, self.file)
    }

    /// Load a checkpoint, or `None` if the file does not exist yet.
    pub fn load(path: &Path) -> anyhow::Result<Option<Self>> {
        if !path.exists() {
            return Ok(None);
        }
        let content = std::fs::read_to_string(path)?;
        Ok(Some(serde_json::from_str(&content)?))
    }

    /// Persist atomically: write a temp file, then rename over the target.
    pub fn save(&self, path: &Path) -> anyhow::Result<()> {
        let content = serde_json::to_string_pretty(self)?;

        let temp_path = path.with_extension("tmp");
        std::fs::write(&temp_path, &content)?;
        std::fs::rename(&temp_path, path)?;

        tracing::debug!("Saved state at block {} to {:?}", self.block_number, path);
        Ok(())
    }

    /// Human-readable multi-line summary for the status command.
    pub fn summary(&self) -> String {
        let sign = match self.delta_sign {
            DeltaSign::Positive => "",
            DeltaSign::Negative => "-",
        };
        format!(
            "Supply state:\n  Block: {} ({})\n  Delta: {}{} wei\n  Issuance: genesis {}, rewards {}, withdrawals {}\n  Burn: eip1559 {}, blob {}, misc {}\n  Last consumed file: {}",
            self.block_number,
            self.hash,
            sign,
            self.delta,
            self.issuance.genesis_alloc,
            self.issuance.reward,
            self.issuance.withdrawals,
            self.burn.eip1559,
            self.burn.blob,
            self.burn.misc,
            self.file.as_deref().unwrap_or("none"),
        )
    }
}
