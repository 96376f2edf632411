//! TOML file source

use config::builder::DefaultState;
use config::{ConfigBuilder, ConfigError, File, FileFormat};
use std::path::{Path, PathBuf};

/// `$XDG_CONFIG_HOME/agentmesh/config.toml` or the platform equivalent.
pub fn default_path() -> Option<PathBuf> {
    directories::ProjectDirs::from("", "agentmesh", "agentmesh")
        .map(|dirs| dirs.config_dir().join("config.toml"))
}

/// Add a TOML file. A missing file is an error only when `required`.
pub fn add_to_builder(
    builder: ConfigBuilder<DefaultState>,
    path: &Path,
    required: bool,
) -> Result<ConfigBuilder<DefaultState>, ConfigError> {
    let name = path
        .to_str()
        .ok_or_else(|| ConfigError::Message(format!("config path {:?} is not valid UTF-8", path)))?;
    Ok(builder.add_source(
        File::new(name, FileFormat::Toml).required(required),
    ))
}
