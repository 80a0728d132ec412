//! Unified error type hierarchy for the training supervisor
//!
//! Provides structured error handling with ConfigError, CheckpointError and
//! SupervisorError.

use std::io;
use std::path::PathBuf;
use thiserror::Error;

/// Configuration file parsing and validation errors.
#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("Configuration file not found: {0}")]
    FileNotFound(String),

    #[error("Invalid JSON in config: {0}")]
    InvalidJson(#[from] serde_json::Error),

    #[error("Invalid TOML in config: {0}")]
    InvalidToml(#[from] toml::de::Error),

    #[error("Configuration validation failed: {0}")]
    ValidationFailed(String),

    #[error("Invalid stale-file pattern '{pattern}': {reason}")]
    InvalidPattern { pattern: String, reason: String },

    #[error("IO error during config operations: {0}")]
    IoError(#[from] io::Error),
}

/// Checkpoint discovery and cleanup errors.
///
/// These never stop the restart loop; the supervisor logs them and moves on.
#[derive(Error, Debug)]
pub enum CheckpointError {
    #[error("Failed to read checkpoint root {path}: {source}")]
    ReadRoot {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    #[error("Failed to remove {path}: {source}")]
    RemoveFailed {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
}

/// Errors raised while supervising the training process.
#[derive(Error, Debug)]
pub enum SupervisorError {
    #[error("Failed to spawn '{cmd}': {source}")]
    SpawnFailed {
        cmd: String,
        #[source]
        source: io::Error,
    },

    #[error("Failed to wait for training process: {0}")]
    WaitFailed(#[source] io::Error),

    #[error("Failed to signal process group {pgid}: {reason}")]
    SignalFailed { pgid: i32, reason: String },

    #[error("Log collector error: {0}")]
    LogCollector(String),

    #[error(transparent)]
    Config(#[from] ConfigError),

    #[error(transparent)]
    Checkpoint(#[from] CheckpointError),

    #[error("I/O error: {0}")]
    Io(#[from] io::Error),
}

/// Top-level result type for supervisor operations.
pub type Result<T> = std::result::Result<T, SupervisorError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_config_error_display() {
        let err = ConfigError::FileNotFound("/etc/supervisor.toml".to_string());
        assert_eq!(
            err.to_string(),
            "Configuration file not found: /etc/supervisor.toml"
        );
    }

    #[test]
    fn test_spawn_error_display() {
        let err = SupervisorError::SpawnFailed {
            cmd: "torchrun".to_string(),
            source: io::Error::new(io::ErrorKind::NotFound, "No such file or directory"),
        };
        assert_eq!(
            err.to_string(),
            "Failed to spawn 'torchrun': No such file or directory"
        );
    }

    #[test]
    fn test_config_error_is_transparent() {
        let err: SupervisorError =
            ConfigError::ValidationFailed("workers must be greater than zero".to_string()).into();
        assert_eq!(
            err.to_string(),
            "Configuration validation failed: workers must be greater than zero"
        );
    }

    #[test]
    fn test_result_type_err() {
        let result: Result<i32> = Err(SupervisorError::LogCollector("closed".to_string()));
        assert!(result.is_err());
    }
}
