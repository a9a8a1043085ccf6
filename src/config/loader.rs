// src/config/loader.rs

use std::fs;
use std::path::{Path, PathBuf};

use tracing::debug;

use crate::config::model::{ConfigFile, RawConfigFile};
use crate::errors::Result;

/// Load a configuration file and return the raw `RawConfigFile`.
///
/// This only performs TOML deserialization; use [`load_and_validate`] for
/// reference and schedule checks.
pub fn load_from_path(path: impl AsRef<Path>) -> Result<RawConfigFile> {
    let path = path.as_ref();
    let contents = fs::read_to_string(path)?;
    let config: RawConfigFile = toml::from_str(&contents)?;
    debug!(path = %path.display(), "config parsed");
    Ok(config)
}

/// Load a configuration file and validate it.
///
/// This is the entry point for the rest of the application:
/// - reads TOML and applies defaults,
/// - checks references between devices, images, profiles and engines,
/// - checks cron expressions, timestamps and regex patterns.
pub fn load_and_validate(path: impl AsRef<Path>) -> Result<ConfigFile> {
    let raw_config = load_from_path(&path)?;
    let config = ConfigFile::try_from(raw_config)?;
    Ok(config)
}

/// `Fleetcast.toml` in the current working directory.
pub fn default_config_path() -> PathBuf {
    PathBuf::from("Fleetcast.toml")
}
