//! Training Supervisor
//!
//! Keeps a long-running training job alive: before every launch it scrubs
//! stale optimizer/scheduler/RNG state from the newest checkpoint, runs the
//! training command in its own process group with output teed to an
//! append-only log, classifies the exit code, and restarts after a fixed
//! delay until the command succeeds or the operator interrupts it.
//!
//! The system is organized into functional modules:
//! - **error**: Unified error type hierarchy
//! - **models**: Exit classification, run reports and summaries
//! - **config**: Supervisor configuration and file loading
//! - **log_collector**: Append-only run log and `log` crate backend
//! - **system**: Shutdown signals and process-group signalling
//! - **orchestrator**: Checkpoint cleanup, process execution and the restart loop

pub mod error;
pub mod models;

pub mod config;

pub mod system;

pub mod log_collector;

pub mod orchestrator;

// Re-export the log crate for macro usage
pub use log;

pub use log_collector::{LogCollector, LogLine, LogSource};

// ============================================================================
// PUBLIC RE-EXPORTS FOR CONVENIENCE
// ============================================================================

pub use error::{CheckpointError, ConfigError, Result, SupervisorError};

pub use models::{
    ExitClass, LaunchResult, RunReport, SupervisorOutcome, SupervisorSummary,
};

pub use config::{CheckpointSettings, CommandSpec, RetryPolicy, SupervisorConfig};

pub use orchestrator::{
    CheckpointTarget, CommandLauncher, StalePatterns, Supervisor, TrainingLauncher,
};

/// Library version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
