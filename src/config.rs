//! Node configuration, loadable from JSON.

use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::chunk::{BLOCK_SIZE_LOG_MAX, BLOCK_SIZE_LOG_MIN, CHUNK_SIZE_MIN};
use crate::dfu::{DfuSrvConfig, DistributorConfig};
use crate::network::{Addr, ADDR_UNASSIGNED};
use crate::sim::SimConfig;

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),

    #[error("Parse error: {0}")]
    Parse(#[from] serde_json::Error),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

pub type ConfigResult<T> = Result<T, ConfigError>;

/// Everything one mesh node needs: its own target role, its distributor
/// role, and the simulated channel when run under `dfu-sim`.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct NodeConfig {
    /// Unicast address of this node
    pub addr: Addr,

    /// Directory for persisted transfer records; in-memory when unset
    pub settings_dir: Option<PathBuf>,

    pub target: DfuSrvConfig,

    pub distributor: DistributorConfig,

    pub sim: SimConfig,
}

impl Default for NodeConfig {
    fn default() -> Self {
        Self {
            addr: 0x0001,
            settings_dir: None,
            target: DfuSrvConfig::default(),
            distributor: DistributorConfig::default(),
            sim: SimConfig::default(),
        }
    }
}

impl NodeConfig {
    pub fn from_json(json: &str) -> ConfigResult<Self> {
        let config: NodeConfig = serde_json::from_str(json)?;
        config.validate()?;
        Ok(config)
    }

    pub fn load(path: impl AsRef<Path>) -> ConfigResult<Self> {
        let json = std::fs::read_to_string(path.as_ref())?;
        tracing::debug!(path = %path.as_ref().display(), "Loading node configuration");
        Self::from_json(&json)
    }

    pub fn save(&self, path: impl AsRef<Path>) -> ConfigResult<()> {
        std::fs::write(path, serde_json::to_string_pretty(self)?)?;
        Ok(())
    }

    pub fn validate(&self) -> ConfigResult<()> {
        if self.addr == ADDR_UNASSIGNED {
            return Err(ConfigError::InvalidConfig("node address is unassigned".into()));
        }

        let caps = &self.target.blob.caps;
        if caps.block_size_log_min > caps.block_size_log_max
            || caps.block_size_log_min < BLOCK_SIZE_LOG_MIN
            || caps.block_size_log_max > BLOCK_SIZE_LOG_MAX
        {
            return Err(ConfigError::InvalidConfig(format!(
                "block size log range {}..={} outside {}..={}",
                caps.block_size_log_min, caps.block_size_log_max, BLOCK_SIZE_LOG_MIN, BLOCK_SIZE_LOG_MAX
            )));
        }
        if caps.max_chunk_size < CHUNK_SIZE_MIN || caps.max_chunks == 0 {
            return Err(ConfigError::InvalidConfig("chunk limits too small".into()));
        }
        if self.target.blob.suspend_after_windows == 0 {
            return Err(ConfigError::InvalidConfig(
                "suspend_after_windows must be at least 1".into(),
            ));
        }
        if self.distributor.max_receivers == 0 || self.distributor.slot_capacity == 0 {
            return Err(ConfigError::InvalidConfig(
                "distributor needs room for receivers and slots".into(),
            ));
        }
        if !(0.0..=1.0).contains(&self.sim.loss_rate) {
            return Err(ConfigError::InvalidConfig(format!(
                "loss rate {} outside 0..=1",
                self.sim.loss_rate
            )));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn test_partial_json_uses_defaults() {
        let config = NodeConfig::from_json(
            r#"{ "addr": 4096, "distributor": { "max_receivers": 4, "slot_capacity": 2,
                 "client": { "blob": { "retries": 5, "max_targets": 8,
                   "max_consecutive_timeouts": 2, "max_block_passes": 8, "prefill_pull": true },
                   "max_refresh_polls": 3 } } }"#,
        )
        .unwrap();
        assert_eq!(config.addr, 0x1000);
        assert_eq!(config.distributor.max_receivers, 4);
        assert_eq!(config.distributor.client.blob.retries, 5);
        assert!(config.distributor.client.blob.prefill_pull);
        assert_eq!(config.target.settings_key, DfuSrvConfig::default().settings_key);
        assert_eq!(config.sim.loss_rate, 0.0);
    }

    #[test]
    fn test_validation() {
        assert!(matches!(
            NodeConfig::from_json(r#"{ "addr": 0 }"#),
            Err(ConfigError::InvalidConfig(_))
        ));
        assert!(matches!(
            NodeConfig::from_json("{ not json"),
            Err(ConfigError::Parse(_))
        ));

        let mut config = NodeConfig::default();
        config.target.blob.caps.block_size_log_min = 13;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_save_and_load() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("node.json");

        let mut config = NodeConfig::default();
        config.addr = 0x0042;
        config.sim = SimConfig::with_loss(0.05);
        config.save(&path).unwrap();

        let loaded = NodeConfig::load(&path).unwrap();
        assert_eq!(loaded.addr, 0x0042);
        assert_eq!(loaded.sim.loss_rate, 0.05);
        assert!(matches!(
            NodeConfig::load(dir.path().join("missing.json")),
            Err(ConfigError::Io(_))
        ));
    }
}
