//! System module: shutdown signals, cancellation plumbing, process-group signalling

use crate::error::SupervisorError;
use nix::errno::Errno;
use nix::sys::signal::{killpg, Signal};
use nix::unistd::Pid;
use std::sync::atomic::{AtomicI32, Ordering};
use std::sync::Arc;
use tokio::sync::watch;

/// Process group of the training run currently in flight.
///
/// Set by the executor while a child is alive and read by the shutdown
/// handler, which has to kill the group itself before a forced exit.
#[derive(Debug, Clone, Default)]
pub struct ActiveGroup(Arc<AtomicI32>);

impl ActiveGroup {
    pub fn set(&self, pgid: u32) {
        self.0.store(i32::try_from(pgid).unwrap_or(0), Ordering::SeqCst);
    }

    pub fn clear(&self) {
        self.0.store(0, Ordering::SeqCst);
    }

    pub fn get(&self) -> Option<u32> {
        let raw = self.0.load(Ordering::SeqCst);
        u32::try_from(raw).ok().filter(|&pgid| pgid > 0)
    }
}

/// SIGKILL the in-flight run, if any. Used when there is no time left for
/// the SIGTERM grace period.
pub fn kill_active_group(group: &ActiveGroup) -> Result<Option<u32>, SupervisorError> {
    let Some(pgid) = group.get() else {
        return Ok(None);
    };
    signal_process_group(pgid, Signal::SIGKILL)?;
    group.clear();
    Ok(Some(pgid))
}

/// Resolve once SIGINT or SIGTERM arrives.
pub async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(err) = tokio::signal::ctrl_c().await {
            log::error!("Unable to install Ctrl+C handler: {}", err);
            std::future::pending::<()>().await;
        }
    };

    let terminate = async {
        use tokio::signal::unix::{signal, SignalKind};

        match signal(SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
            }
            Err(err) => {
                log::error!("Unable to install SIGTERM handler: {}", err);
                std::future::pending::<()>().await;
            }
        }
    };

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }
}

/// Spawn a task that flips `cancel_tx` to `true` on the first shutdown signal.
///
/// A second signal while the child is still being torn down kills the
/// training process group outright and exits with status 130.
pub fn install_shutdown_handler(
    cancel_tx: watch::Sender<bool>,
    group: ActiveGroup,
) -> tokio::task::JoinHandle<()> {
    tokio::spawn(async move {
        shutdown_signal().await;
        log::warn!("Interrupt received, stopping training run");
        let _ = cancel_tx.send(true);

        shutdown_signal().await;
        log::error!("Second interrupt received, exiting without waiting for cleanup");
        match kill_active_group(&group) {
            Ok(Some(pgid)) => eprintln!("[Main] Killed training process group {}", pgid),
            Ok(None) => {}
            Err(e) => eprintln!("[Main] ERROR: {}", e),
        }
        std::process::exit(130);
    })
}

/// Resolve once the cancel flag is `true`.
///
/// If every sender is gone the flag can never change, so this pends forever.
pub async fn wait_for_cancel(cancel_rx: &mut watch::Receiver<bool>) {
    loop {
        if *cancel_rx.borrow_and_update() {
            return;
        }
        if cancel_rx.changed().await.is_err() {
            std::future::pending::<()>().await;
        }
    }
}

/// Send `signal` to every process in group `pgid`.
///
/// A group that has already exited is not an error.
pub fn signal_process_group(pgid: u32, signal: Signal) -> Result<(), SupervisorError> {
    let raw = i32::try_from(pgid).map_err(|_| SupervisorError::SignalFailed {
        pgid: -1,
        reason: format!("process group id {} out of range", pgid),
    })?;

    match killpg(Pid::from_raw(raw), signal) {
        Ok(()) | Err(Errno::ESRCH) => Ok(()),
        Err(e) => Err(SupervisorError::SignalFailed {
            pgid: raw,
            reason: e.to_string(),
        }),
    }
}
