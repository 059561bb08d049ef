//! Engine configuration

use serde::{Deserialize, Serialize};
use std::path::Path;
use thiserror::Error;

use crate::handle::MAX_LAYER_ID;

/// Configuration error types
#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
    #[error("Invalid configuration file: {0}")]
    Parse(#[from] serde_json::Error),
    #[error("Invalid value for {field}: {reason}")]
    Invalid {
        field: &'static str,
        reason: String,
    },
}

/// Engine configuration
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    /// Name of the top-level directory that becomes the snapshot root
    pub snapshot_root_name: String,
    /// Maximum number of live layers, base included
    pub max_layers: usize,
    /// Page capacity; falls back to the block device size
    pub capacity_blocks: Option<u64>,
    /// Let rmdir remove directories that still hold entries
    pub relaxed_rmdir: bool,
    /// Attribute cache lifetime handed to the kernel (in seconds)
    pub attr_ttl_secs: u64,
    /// Longest accepted entry name
    pub max_name_len: usize,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            snapshot_root_name: "layers".to_string(),
            max_layers: 1024,
            capacity_blocks: None,
            relaxed_rmdir: false,
            attr_ttl_secs: 1,
            max_name_len: 255,
        }
    }
}

impl EngineConfig {
    /// Load a JSON configuration file; missing fields take their defaults
    pub fn from_json_file(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let data = std::fs::read_to_string(path)?;
        let config: Self = serde_json::from_str(&data)?;
        config.validate()?;
        Ok(config)
    }

    /// Check value ranges
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.max_layers == 0 || self.max_layers > MAX_LAYER_ID as usize {
            return Err(ConfigError::Invalid {
                field: "max_layers",
                reason: format!("must be between 1 and {MAX_LAYER_ID}"),
            });
        }
        if self.snapshot_root_name.is_empty() || self.snapshot_root_name.contains('/') {
            return Err(ConfigError::Invalid {
                field: "snapshot_root_name",
                reason: "must be a single path component".to_string(),
            });
        }
        if self.max_name_len == 0 {
            return Err(ConfigError::Invalid {
                field: "max_name_len",
                reason: "must be positive".to_string(),
            });
        }
        Ok(())
    }
}
