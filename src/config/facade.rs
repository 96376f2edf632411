//! ConfigLoader facade delegating to merge service.

use super::merge::service::MergeService;
use super::MeshConfig;
use crate::error::NodeError;
use std::path::Path;

/// Configuration loader facade.
pub struct ConfigLoader;

impl ConfigLoader {
    /// Load configuration from the user config file and environment.
    pub fn load() -> Result<MeshConfig, NodeError> {
        let config = MergeService::load().map_err(|e| NodeError::Config(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    /// Load configuration from a specific file.
    pub fn load_from_file(path: &Path) -> Result<MeshConfig, NodeError> {
        let config = MergeService::load_from_file(path).map_err(|e| NodeError::Config(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    /// Create default configuration.
    pub fn default() -> MeshConfig {
        MeshConfig::default()
    }
}
