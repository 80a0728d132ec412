//! Core data types for the training supervisor.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::PathBuf;
use std::time::Duration;

/// Exit codes at or above this value are reported by the shell as `128 + signal`.
pub const SIGNAL_EXIT_BASE: i32 = 128;

/// Exit code reported when the training command could not be started at all.
pub const SPAWN_FAILURE_EXIT_CODE: i32 = 127;

/// Classification of a single training run's exit code.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ExitClass {
    /// Exit code 0.
    Success,
    /// Exit code >= 128; `signal` is `code - 128`.
    Signaled { signal: i32 },
    /// Any other nonzero exit code.
    Failed { code: i32 },
}

impl ExitClass {
    /// Classify a raw exit code.
    pub fn from_code(code: i32) -> Self {
        if code == 0 {
            ExitClass::Success
        } else if code >= SIGNAL_EXIT_BASE {
            ExitClass::Signaled {
                signal: code - SIGNAL_EXIT_BASE,
            }
        } else {
            ExitClass::Failed { code }
        }
    }

    pub fn is_success(&self) -> bool {
        matches!(self, ExitClass::Success)
    }

    /// Signal number for signal deaths, `None` otherwise.
    pub fn signal(&self) -> Option<i32> {
        match self {
            ExitClass::Signaled { signal } => Some(*signal),
            _ => None,
        }
    }

    /// Operator-facing explanation of the exit.
    pub fn diagnostic(&self) -> String {
        match self {
            ExitClass::Success => "Training completed successfully".to_string(),
            ExitClass::Signaled { signal: 9 } => {
                "Killed by SIGKILL (signal 9): likely out of memory or manual termination"
                    .to_string()
            }
            ExitClass::Signaled { signal: 11 } => {
                "Segmentation fault (signal 11): invalid memory access".to_string()
            }
            ExitClass::Signaled { signal } => format!("Terminated by signal {}", signal),
            ExitClass::Failed { code } => format!("Failed with exit code {}", code),
        }
    }
}

impl fmt::Display for ExitClass {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ExitClass::Success => write!(f, "success"),
            ExitClass::Signaled { signal } => write!(f, "signal {}", signal),
            ExitClass::Failed { code } => write!(f, "exit {}", code),
        }
    }
}

/// What a launcher reports back for one attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LaunchResult {
    /// The command exited on its own with this code.
    Exited(i32),
    /// The run was torn down because the supervisor was interrupted.
    Cancelled,
}

/// Record of one completed (non-cancelled) training run.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RunReport {
    /// 1-based attempt number within this supervisor invocation.
    pub attempt: u32,
    pub exit_code: i32,
    pub class: ExitClass,
    pub elapsed: Duration,
    /// Checkpoint directory that was cleaned before the run, if any.
    pub checkpoint: Option<PathBuf>,
    /// Stale state files removed before the run.
    pub removed_files: Vec<PathBuf>,
    /// Whether the run ended before the fast-failure threshold.
    pub fast_failure: bool,
}

/// How the supervisor loop terminated.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum SupervisorOutcome {
    /// The training command exited with status 0.
    Succeeded,
    /// The supervisor received an interrupt.
    Interrupted,
    /// The configured consecutive fast-failure cap was reached.
    FastFailureLimit,
}

impl SupervisorOutcome {
    /// Process exit code the binary should return for this outcome.
    pub fn exit_code(&self) -> u8 {
        match self {
            SupervisorOutcome::Succeeded => 0,
            SupervisorOutcome::FastFailureLimit => 1,
            SupervisorOutcome::Interrupted => 130,
        }
    }
}

/// Final summary returned by the supervisor loop.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SupervisorSummary {
    pub outcome: SupervisorOutcome,
    /// Number of restarts performed after non-success runs.
    pub restart_count: u64,
    /// Number of runs launched, including a cancelled one.
    pub attempts: u32,
    pub total_elapsed: Duration,
    pub last_report: Option<RunReport>,
}
