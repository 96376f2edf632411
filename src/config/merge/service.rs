//! MergeService: orchestrates sources, applies merge policy, deserializes to MeshConfig.

use crate::config::merge::builder_with_defaults;
use crate::config::sources::{environment, file};
use crate::config::MeshConfig;
use config::ConfigError;
use std::path::Path;

/// Merge service for config composition.
pub struct MergeService;

impl MergeService {
    /// Precedence: defaults (lowest) -> user config file -> environment (highest).
    pub fn load() -> Result<MeshConfig, ConfigError> {
        let mut builder = builder_with_defaults()?;
        if let Some(path) = file::default_path() {
            builder = file::add_to_builder(builder, &path, false)?;
        }
        let builder = environment::add_to_builder(builder)?;
        builder.build()?.try_deserialize()
    }

    /// Load a specific file with environment overlay. The file must exist.
    pub fn load_from_file(path: &Path) -> Result<MeshConfig, ConfigError> {
        let builder = builder_with_defaults()?;
        let builder = file::add_to_builder(builder, path, true)?;
        let builder = environment::add_to_builder(builder)?;
        builder.build()?.try_deserialize()
    }
}
