//! Config file loading.

use super::SupervisorConfig;
use crate::error::ConfigError;
use std::fs;
use std::path::{Path, PathBuf};

/// Supported on-disk formats, chosen by file extension.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConfigFormat {
    Toml,
    Json,
}

/// Get the per-user config path: ~/.config/train-supervisor/config.toml
pub fn get_global_config_path() -> Result<PathBuf, ConfigError> {
    let config_dir = dirs::config_dir().ok_or_else(|| {
        ConfigError::ValidationFailed("Cannot determine user config directory".to_string())
    })?;

    Ok(config_dir.join("train-supervisor").join("config.toml"))
}

/// Validate config path (.toml or .json extension required).
pub fn validate_config_path(path: &Path) -> Result<ConfigFormat, ConfigError> {
    if path.as_os_str().is_empty() {
        return Err(ConfigError::ValidationFailed(
            "Configuration path cannot be empty".to_string(),
        ));
    }

    match path.extension() {
        Some(ext) if ext == "toml" => Ok(ConfigFormat::Toml),
        Some(ext) if ext == "json" => Ok(ConfigFormat::Json),
        Some(ext) => Err(ConfigError::ValidationFailed(format!(
            "Configuration file must have .toml or .json extension, got .{}",
            ext.to_string_lossy()
        ))),
        None => Err(ConfigError::ValidationFailed(
            "Configuration file must have .toml or .json extension".to_string(),
        )),
    }
}

/// Load config from a TOML or JSON file.
pub fn load_config_from_file(path: &Path) -> Result<SupervisorConfig, ConfigError> {
    let format = validate_config_path(path)?;

    let content = fs::read_to_string(path).map_err(|e| {
        if e.kind() == std::io::ErrorKind::NotFound {
            ConfigError::FileNotFound(format!(
                "Configuration file not found at: {}",
                path.display()
            ))
        } else {
            ConfigError::IoError(e)
        }
    })?;

    let config: SupervisorConfig = match format {
        ConfigFormat::Toml => toml::from_str(&content)?,
        ConfigFormat::Json => serde_json::from_str(&content)?,
    };

    Ok(config)
}

/// Where the active configuration came from.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConfigSource {
    /// Passed with `--config`
    Explicit(PathBuf),
    /// Per-user config file
    User(PathBuf),
    Defaults,
}

impl std::fmt::Display for ConfigSource {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ConfigSource::Explicit(path) | ConfigSource::User(path) => {
                write!(f, "{}", path.display())
            }
            ConfigSource::Defaults => write!(f, "built-in defaults"),
        }
    }
}

/// Pick the configuration to run with.
///
/// An explicit path must exist. Without one, the per-user file is used when
/// present, otherwise built-in defaults. Nothing is logged here: this runs
/// before the run-log logger exists, so callers report the returned source.
pub fn resolve_config(
    explicit: Option<&Path>,
) -> Result<(SupervisorConfig, ConfigSource), ConfigError> {
    if let Some(path) = explicit {
        let config = load_config_from_file(path)?;
        return Ok((config, ConfigSource::Explicit(path.to_path_buf())));
    }

    match get_global_config_path() {
        Ok(path) if path.exists() => {
            let config = load_config_from_file(&path)?;
            Ok((config, ConfigSource::User(path)))
        }
        _ => Ok((SupervisorConfig::default(), ConfigSource::Defaults)),
    }
}
