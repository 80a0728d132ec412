//! Configuration for the training supervisor.
//!
//! Everything an operator might want to tune lives in [`SupervisorConfig`]:
//! the training command line, where checkpoints are found and which stale
//! files get scrubbed from them, the run log path and the retry timings.
//!
//! # Module Structure
//!
//! - `loader`: Loads and saves configuration files (TOML or JSON)
//!
//! # Configuration Flow
//!
//! 1. `loader::resolve_config` picks an explicit file, the per-user file, or defaults
//! 2. CLI overrides are applied on top in `main.rs`
//! 3. `SupervisorConfig::validate` rejects unusable settings before the loop starts

pub mod loader;

use crate::orchestrator::checkpoint::StalePatterns;
use crate::error::ConfigError;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::PathBuf;
use std::time::Duration;

/// The external training command.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct CommandSpec {
    /// Launcher program, e.g. `torchrun`.
    pub program: String,
    /// Flag that sets the worker-process count.
    pub workers_flag: String,
    pub workers: u32,
    /// Positional training script / target.
    pub script: String,
    /// Arguments appended after the script.
    pub extra_args: Vec<String>,
    pub working_dir: Option<PathBuf>,
    pub env: BTreeMap<String, String>,
}

impl Default for CommandSpec {
    fn default() -> Self {
        CommandSpec {
            program: "torchrun".to_string(),
            workers_flag: "--nproc_per_node".to_string(),
            workers: 4,
            script: "train.py".to_string(),
            extra_args: Vec::new(),
            working_dir: None,
            env: BTreeMap::new(),
        }
    }
}

impl CommandSpec {
    /// Arguments passed to `program`, in order.
    pub fn args(&self) -> Vec<String> {
        let mut args = Vec::with_capacity(3 + self.extra_args.len());
        if !self.workers_flag.is_empty() {
            args.push(self.workers_flag.clone());
            args.push(self.workers.to_string());
        }
        args.push(self.script.clone());
        args.extend(self.extra_args.iter().cloned());
        args
    }

    /// Human-readable command line for logs.
    pub fn display(&self) -> String {
        let mut parts = vec![self.program.clone()];
        parts.extend(self.args());
        parts.join(" ")
    }
}

/// Where checkpoints live and what to scrub from the newest one.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct CheckpointSettings {
    pub root: PathBuf,
    pub prefix: String,
    /// Shell globs of files removed before each run.
    pub stale_patterns: Vec<String>,
}

impl Default for CheckpointSettings {
    fn default() -> Self {
        CheckpointSettings {
            root: PathBuf::from("./output"),
            prefix: "checkpoint-".to_string(),
            stale_patterns: vec![
                "rng_state*".to_string(),
                "optimizer.*".to_string(),
                "scheduler.*".to_string(),
            ],
        }
    }
}

/// Top-level supervisor configuration.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SupervisorConfig {
    pub command: CommandSpec,
    pub checkpoint: CheckpointSettings,
    /// Append-only log receiving every run's combined output.
    pub log_file: PathBuf,
    /// Runs shorter than this are reported as fast failures.
    pub fast_failure_threshold_secs: u64,
    pub restart_delay_secs: u64,
    /// Stop after this many consecutive fast failures. `None` retries forever.
    pub max_consecutive_fast_failures: Option<u32>,
    /// Time between SIGTERM and SIGKILL when tearing down the child group.
    pub kill_grace_secs: u64,
}

impl Default for SupervisorConfig {
    fn default() -> Self {
        SupervisorConfig {
            command: CommandSpec::default(),
            checkpoint: CheckpointSettings::default(),
            log_file: PathBuf::from("./train.log"),
            fast_failure_threshold_secs: 120,
            restart_delay_secs: 10,
            max_consecutive_fast_failures: None,
            kill_grace_secs: 10,
        }
    }
}

/// Timing and cap settings consumed by the restart loop.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct RetryPolicy {
    pub restart_delay: Duration,
    pub fast_failure_threshold: Duration,
    pub max_consecutive_fast_failures: Option<u32>,
}

impl RetryPolicy {
    /// A run counts as a fast failure when it ended strictly before the threshold.
    pub fn is_fast_failure(&self, elapsed: Duration) -> bool {
        elapsed < self.fast_failure_threshold
    }
}

impl Default for RetryPolicy {
    fn default() -> Self {
        SupervisorConfig::default().retry_policy()
    }
}

impl SupervisorConfig {
    pub fn retry_policy(&self) -> RetryPolicy {
        RetryPolicy {
            restart_delay: Duration::from_secs(self.restart_delay_secs),
            fast_failure_threshold: Duration::from_secs(self.fast_failure_threshold_secs),
            max_consecutive_fast_failures: self.max_consecutive_fast_failures,
        }
    }

    pub fn kill_grace(&self) -> Duration {
        Duration::from_secs(self.kill_grace_secs)
    }

    /// Reject settings the supervisor cannot run with.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.command.program.trim().is_empty() {
            return Err(ConfigError::ValidationFailed(
                "command.program cannot be empty".to_string(),
            ));
        }

        if self.command.workers == 0 {
            return Err(ConfigError::ValidationFailed(
                "command.workers must be greater than zero".to_string(),
            ));
        }

        if self.checkpoint.prefix.is_empty() {
            return Err(ConfigError::ValidationFailed(
                "checkpoint.prefix cannot be empty".to_string(),
            ));
        }

        if self.log_file.as_os_str().is_empty() {
            return Err(ConfigError::ValidationFailed(
                "log_file cannot be empty".to_string(),
            ));
        }

        if self.max_consecutive_fast_failures == Some(0) {
            return Err(ConfigError::ValidationFailed(
                "max_consecutive_fast_failures must be at least 1 when set".to_string(),
            ));
        }

        StalePatterns::compile(&self.checkpoint.stale_patterns)?;

        Ok(())
    }
}
