//! Daemon configuration.

use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

/// Tracker configuration, loadable from a TOML file.
///
/// Every field has a default, so an empty file (or no file at all) yields a
/// working configuration; CLI flags override individual fields on top.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TrackerConfig {
    /// File to read supply records from. Rotated siblings sharing its stem
    /// prefix and extension are discovered in the same directory.
    #[serde(default = "default_supply_file")]
    pub supply_file: PathBuf,

    /// File the latest aggregate state is persisted to between runs.
    #[serde(default = "default_state_file")]
    pub state_file: PathBuf,

    /// Port the HTTP state endpoint listens on.
    #[serde(default = "default_api_port")]
    pub api_port: u16,

    /// Seconds to wait for new lines when tailing the live log file.
    #[serde(default = "default_poll_interval")]
    pub poll_interval_secs: u64,
}

fn default_supply_file() -> PathBuf {
    PathBuf::from("supply.jsonl")
}

fn default_state_file() -> PathBuf {
    PathBuf::from("state.json")
}

fn default_api_port() -> u16 {
    8080
}

fn default_poll_interval() -> u64 {
    1
}

impl Default for TrackerConfig {
    fn default() -> Self {
        Self {
            supply_file: default_supply_file(),
            state_file: default_state_file(),
            api_port: default_api_port(),
            poll_interval_secs: default_poll_interval(),
        }
    }
}

impl TrackerConfig {
    /// Load configuration from a TOML file.
    pub fn from_file(path: &Path) -> anyhow::Result<Self> {
        let content = std::fs::read_to_string(path)?;
        let config: TrackerConfig = toml::from_str(&content)?;
        config.validate()?;
        Ok(config)
    }

    /// Validate the configuration.
    pub fn validate(&self) -> anyhow::Result<()> {
        if self.supply_file.file_name().is_none() {
            anyhow::bail!("supply_file must name a file, got {:?}", self.supply_file);
        }
        if self.state_file.file_name().is_none() {
            anyhow::bail!("state_file must name a file, got {:?}", self.state_file);
        }
        if self.api_port == 0 {
            anyhow::bail!("api_port must be non-zero");
        }
        if self.poll_interval_secs == 0 {
            anyhow::bail!("poll_interval_secs must be at least 1");
        }
        Ok(())
    }
}
