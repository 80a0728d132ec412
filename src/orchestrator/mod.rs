//! Supervision loop: clean checkpoint -> launch -> classify -> retry.
//!
//! [`Supervisor`] owns every piece of per-invocation state (restart counter,
//! consecutive fast failures, timing) as locals of [`Supervisor::run`]. The
//! training command itself is abstracted behind [`TrainingLauncher`] so the
//! loop can be driven by a real process ([`executor::CommandLauncher`]) or by
//! a scripted stand-in.

pub mod checkpoint;
pub mod executor;

use std::future::Future;
use std::path::PathBuf;
use tokio::sync::watch;
use tokio::time::Instant;

pub use checkpoint::{find_latest_checkpoint, prepare_latest_checkpoint, remove_stale_state, StalePatterns};
pub use executor::{run_training, CommandLauncher};

use crate::config::{RetryPolicy, SupervisorConfig};
use crate::error::Result;
use crate::models::{
    ExitClass, LaunchResult, RunReport, SupervisorOutcome, SupervisorSummary,
};
use crate::orchestrator::checkpoint::CleanupReport;
use crate::system::wait_for_cancel;

/// Something that can run one training attempt to completion.
pub trait TrainingLauncher {
    /// Run attempt number `attempt` (1-based) and report how it ended.
    ///
    /// Implementations must stop the run and return
    /// [`LaunchResult::Cancelled`] once `cancel_rx` turns `true`.
    fn launch(
        &mut self,
        attempt: u32,
        cancel_rx: watch::Receiver<bool>,
    ) -> impl Future<Output = Result<LaunchResult>> + Send;

    /// Short description for log lines.
    fn describe(&self) -> String {
        "training command".to_string()
    }
}

/// Checkpoint locations the loop scrubs before every launch.
#[derive(Debug, Clone)]
pub struct CheckpointTarget {
    pub root: PathBuf,
    pub prefix: String,
    pub patterns: StalePatterns,
}

impl CheckpointTarget {
    pub fn from_config(config: &SupervisorConfig) -> Result<Self> {
        Ok(CheckpointTarget {
            root: config.checkpoint.root.clone(),
            prefix: config.checkpoint.prefix.clone(),
            patterns: StalePatterns::compile(&config.checkpoint.stale_patterns)?,
        })
    }

    /// Best-effort cleanup; failures are logged and never stop the loop.
    fn prepare(&self) -> CleanupReport {
        match prepare_latest_checkpoint(&self.root, &self.prefix, &self.patterns) {
            Ok(report) => {
                match &report.checkpoint {
                    Some(dir) if report.removed.is_empty() => {
                        log::info!("Latest checkpoint: {} (nothing to clean)", dir.display());
                    }
                    Some(dir) => {
                        log::info!(
                            "Latest checkpoint: {} (removed {} stale state file(s))",
                            dir.display(),
                            report.removed.len()
                        );
                        for path in &report.removed {
                            log::debug!("Removed {}", path.display());
                        }
                    }
                    None => {
                        log::info!("No checkpoint found under {}", self.root.display());
                    }
                }
                report
            }
            Err(e) => {
                log::warn!("Checkpoint cleanup skipped: {}", e);
                CleanupReport::default()
            }
        }
    }
}

/// Restarts a training command until it succeeds or is interrupted.
pub struct Supervisor<L: TrainingLauncher> {
    launcher: L,
    checkpoints: CheckpointTarget,
    policy: RetryPolicy,
    cancel_rx: watch::Receiver<bool>,
}

impl<L: TrainingLauncher> Supervisor<L> {
    pub fn new(
        launcher: L,
        checkpoints: CheckpointTarget,
        policy: RetryPolicy,
        cancel_rx: watch::Receiver<bool>,
    ) -> Self {
        Supervisor {
            launcher,
            checkpoints,
            policy,
            cancel_rx,
        }
    }

    pub fn launcher(&self) -> &L {
        &self.launcher
    }

    /// Run the restart loop to completion.
    ///
    /// Returns `Err` only for supervisor-side failures (for example the
    /// child could not be waited on); every exit code of the training
    /// command is handled inside the loop.
    pub async fn run(&mut self) -> Result<SupervisorSummary> {
        let started = Instant::now();
        let mut restart_count: u64 = 0;
        let mut consecutive_fast_failures: u32 = 0;
        let mut attempt: u32 = 0;
        let mut last_report: Option<RunReport> = None;

        log::info!(
            "Supervising '{}' (restart delay {:?}, fast-failure threshold {:?})",
            self.launcher.describe(),
            self.policy.restart_delay,
            self.policy.fast_failure_threshold
        );

        loop {
            if *self.cancel_rx.borrow() {
                return Ok(summary(SupervisorOutcome::Interrupted, restart_count, attempt, started, last_report));
            }

            attempt += 1;
            let run_started = Instant::now();
            let cleanup = self.checkpoints.prepare();

            log::info!("Starting attempt {} (restarts so far: {})", attempt, restart_count);
            let launched = self.launcher.launch(attempt, self.cancel_rx.clone()).await?;
            let elapsed = run_started.elapsed();

            let exit_code = match launched {
                LaunchResult::Exited(code) => code,
                LaunchResult::Cancelled => {
                    log::warn!("Attempt {} interrupted after {:?}", attempt, elapsed);
                    return Ok(summary(SupervisorOutcome::Interrupted, restart_count, attempt, started, last_report));
                }
            };

            let class = ExitClass::from_code(exit_code);
            let fast_failure = !class.is_success() && self.policy.is_fast_failure(elapsed);
            let report = RunReport {
                attempt,
                exit_code,
                class,
                elapsed,
                checkpoint: cleanup.checkpoint,
                removed_files: cleanup.removed,
                fast_failure,
            };

            match class {
                ExitClass::Success => {
                    log::info!(
                        "Training completed successfully on attempt {} after {:?} ({} restart(s), {:?} total)",
                        attempt,
                        elapsed,
                        restart_count,
                        started.elapsed()
                    );
                    return Ok(summary(SupervisorOutcome::Succeeded, restart_count, attempt, started, Some(report)));
                }
                ExitClass::Signaled { .. } => {
                    log::error!("Attempt {}: {} (exit code {})", attempt, class.diagnostic(), exit_code);
                }
                ExitClass::Failed { .. } => {
                    log::error!("Attempt {}: {} after {:?}", attempt, class.diagnostic(), elapsed);
                }
            }

            if fast_failure {
                consecutive_fast_failures += 1;
                log::warn!(
                    "Run ended after {:?}, under the {:?} threshold ({} in a row): this usually means a configuration problem rather than a crash mid-training",
                    elapsed,
                    self.policy.fast_failure_threshold,
                    consecutive_fast_failures
                );
            } else {
                consecutive_fast_failures = 0;
            }

            restart_count += 1;
            last_report = Some(report);

            if let Some(max) = self.policy.max_consecutive_fast_failures {
                if consecutive_fast_failures >= max {
                    log::error!(
                        "Giving up after {} consecutive fast failures",
                        consecutive_fast_failures
                    );
                    return Ok(summary(SupervisorOutcome::FastFailureLimit, restart_count, attempt, started, last_report));
                }
            }

            log::info!("Restarting in {:?}", self.policy.restart_delay);
            tokio::select! {
                _ = tokio::time::sleep(self.policy.restart_delay) => {}
                _ = wait_for_cancel(&mut self.cancel_rx) => {
                    log::warn!("Interrupted while waiting to restart");
                    return Ok(summary(SupervisorOutcome::Interrupted, restart_count, attempt, started, last_report));
                }
            }
        }
    }
}

fn summary(
    outcome: SupervisorOutcome,
    restart_count: u64,
    attempts: u32,
    started: Instant,
    last_report: Option<RunReport>,
) -> SupervisorSummary {
    SupervisorSummary {
        outcome,
        restart_count,
        attempts,
        total_elapsed: started.elapsed(),
        last_report,
    }
}
