//! Merge policy: compiled-in defaults form the lowest layer.

pub mod service;

use crate::config::MeshConfig;
use config::builder::DefaultState;
use config::{Config, ConfigBuilder, ConfigError};

pub fn builder_with_defaults() -> Result<ConfigBuilder<DefaultState>, ConfigError> {
    let defaults = Config::try_from(&MeshConfig::default())?;
    Ok(Config::builder().add_source(defaults))
}
