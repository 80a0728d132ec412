//! Training process execution: spawning, output streaming, teardown.
//!
//! The child is started as the leader of its own process group so that the
//! launcher's worker processes can be signalled together. Combined output is
//! streamed line by line through the [`LogCollector`], which echoes it to the
//! terminal and appends it to the run log.

use crate::config::CommandSpec;
use crate::error::SupervisorError;
use crate::log_collector::{LogCollector, LogSource};
use crate::models::{LaunchResult, SIGNAL_EXIT_BASE, SPAWN_FAILURE_EXIT_CODE};
use crate::orchestrator::TrainingLauncher;
use crate::system::{signal_process_group, wait_for_cancel, ActiveGroup};
use nix::sys::signal::Signal;
use std::os::unix::process::ExitStatusExt;
use std::process::{ExitStatus, Stdio};
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncReadExt};
use tokio::process::{Child, Command};
use tokio::sync::watch;
use tokio::task::JoinHandle;

/// How long to keep reading output after the leader has exited.
const OUTPUT_DRAIN_TIMEOUT: Duration = Duration::from_secs(5);

/// Map an exit status to the shell convention: the code itself, or
/// `128 + signal` when the process was killed by a signal.
pub fn exit_code_of(status: ExitStatus) -> i32 {
    match status.code() {
        Some(code) => code,
        None => SIGNAL_EXIT_BASE + status.signal().unwrap_or(0),
    }
}

/// Run the training command once and wait for it to finish.
///
/// # Arguments
/// * `spec` - Command line, working directory and environment
/// * `collector` - Receives every line the child writes to stdout/stderr
/// * `cancel_rx` - When it turns `true` the whole process group is torn down
/// * `kill_grace` - Time between SIGTERM and SIGKILL during teardown
/// * `group` - Holds the child's process group while it runs
///
/// # Returns
/// * `Ok(LaunchResult::Exited(code))` when the child exits on its own
/// * `Ok(LaunchResult::Cancelled)` when cancellation tore it down
/// * `Err(SupervisorError::SpawnFailed)` if the program could not be started
pub async fn run_training(
    spec: &CommandSpec,
    collector: &LogCollector,
    mut cancel_rx: watch::Receiver<bool>,
    kill_grace: Duration,
    group: &ActiveGroup,
) -> Result<LaunchResult, SupervisorError> {
    let mut command = Command::new(&spec.program);
    command.args(spec.args());
    if let Some(dir) = &spec.working_dir {
        command.current_dir(dir);
    }
    command.envs(&spec.env);

    command.stdin(Stdio::null());
    command.stdout(Stdio::piped());
    command.stderr(Stdio::piped());
    // New group with pgid == child pid
    command.process_group(0);
    command.kill_on_drop(true);

    let mut child = command.spawn().map_err(|source| SupervisorError::SpawnFailed {
        cmd: spec.display(),
        source,
    })?;
    let pgid = child.id();
    log::debug!("Spawned '{}' as process group {:?}", spec.display(), pgid);
    let published = pgid.map(|pgid| PublishedGroup::new(group, pgid));

    let stdout_task = child
        .stdout
        .take()
        .map(|out| tokio::spawn(pump_output(out, LogSource::Stdout, collector.clone())));
    let stderr_task = child
        .stderr
        .take()
        .map(|err| tokio::spawn(pump_output(err, LogSource::Stderr, collector.clone())));

    let waited = tokio::select! {
        status = child.wait() => Some(status),
        _ = wait_for_cancel(&mut cancel_rx) => None,
    };

    let result = match waited {
        Some(status) => {
            let status = status.map_err(SupervisorError::WaitFailed)?;
            // Workers that outlived the launcher would hold GPUs and pipes
            if let Some(pgid) = pgid {
                if let Err(e) = signal_process_group(pgid, Signal::SIGKILL) {
                    log::warn!("Failed to sweep leftover processes: {}", e);
                }
            }
            LaunchResult::Exited(exit_code_of(status))
        }
        None => {
            log::warn!("Cancellation requested, terminating process group {:?}", pgid);
            terminate_group(&mut child, pgid, kill_grace).await?;
            LaunchResult::Cancelled
        }
    };

    drop(published);

    for task in [stdout_task, stderr_task].into_iter().flatten() {
        drain(task).await;
    }

    Ok(result)
}

/// Keeps the group published in an [`ActiveGroup`] until dropped, so every
/// return path clears it.
struct PublishedGroup<'a> {
    group: &'a ActiveGroup,
}

impl<'a> PublishedGroup<'a> {
    fn new(group: &'a ActiveGroup, pgid: u32) -> Self {
        group.set(pgid);
        PublishedGroup { group }
    }
}

impl Drop for PublishedGroup<'_> {
    fn drop(&mut self) {
        self.group.clear();
    }
}

/// SIGTERM the group, escalate to SIGKILL after `grace`, and reap the leader.
async fn terminate_group(
    child: &mut Child,
    pgid: Option<u32>,
    grace: Duration,
) -> Result<(), SupervisorError> {
    let Some(pgid) = pgid else {
        // Already reaped
        return Ok(());
    };

    signal_process_group(pgid, Signal::SIGTERM)?;

    match tokio::time::timeout(grace, child.wait()).await {
        Ok(status) => {
            let status = status.map_err(SupervisorError::WaitFailed)?;
            log::info!("Training process stopped ({})", status);
        }
        Err(_) => {
            log::warn!(
                "Process group {} still alive after {:?}, sending SIGKILL",
                pgid,
                grace
            );
            signal_process_group(pgid, Signal::SIGKILL)?;
            child.wait().await.map_err(SupervisorError::WaitFailed)?;
        }
    }

    // Anything that ignored SIGTERM but outlived the leader
    signal_process_group(pgid, Signal::SIGKILL)
}

/// Read buffer for child output.
const READ_CHUNK: usize = 8 * 1024;

/// Echo raw output as it arrives and record it in the run log line by line.
async fn pump_output<R>(mut reader: R, source: LogSource, collector: LogCollector)
where
    R: AsyncRead + Unpin,
{
    let mut buf = vec![0u8; READ_CHUNK];
    let mut lines = LineSplitter::default();
    loop {
        match reader.read(&mut buf).await {
            Ok(0) => break,
            Ok(n) => {
                collector.echo_raw(source, &buf[..n]);
                for line in lines.push(&buf[..n]) {
                    collector.log_output(source, line);
                }
            }
            Err(e) => {
                collector.log_str(format!("{:?} read error: {}", source, e));
                break;
            }
        }
    }
    if let Some(rest) = lines.finish() {
        collector.log_output(source, rest);
    }
}

/// Splits a byte stream into log lines ending at `\n` or `\r`.
///
/// `\r\n` counts as one terminator, so Windows-style output does not leave
/// blank lines behind.
#[derive(Debug, Default)]
struct LineSplitter {
    pending: Vec<u8>,
    after_cr: bool,
}

impl LineSplitter {
    fn push(&mut self, chunk: &[u8]) -> Vec<String> {
        let mut out = Vec::new();
        for &byte in chunk {
            match byte {
                b'\n' if self.after_cr && self.pending.is_empty() => {
                    self.after_cr = false;
                }
                b'\n' | b'\r' => {
                    out.push(String::from_utf8_lossy(&self.pending).into_owned());
                    self.pending.clear();
                    self.after_cr = byte == b'\r';
                }
                _ => {
                    self.pending.push(byte);
                    self.after_cr = false;
                }
            }
        }
        out
    }

    /// Whatever is left once the stream closes without a terminator.
    fn finish(&mut self) -> Option<String> {
        if self.pending.is_empty() {
            return None;
        }
        let rest = String::from_utf8_lossy(&self.pending).into_owned();
        self.pending.clear();
        Some(rest)
    }
}

async fn drain(task: JoinHandle<()>) {
    let abort = task.abort_handle();
    if tokio::time::timeout(OUTPUT_DRAIN_TIMEOUT, task).await.is_err() {
        log::warn!("Output stream still open after the training process exited, detaching");
        abort.abort();
    }
}

/// Production launcher: runs a [`CommandSpec`] with output teed to a [`LogCollector`].
pub struct CommandLauncher {
    spec: CommandSpec,
    collector: LogCollector,
    kill_grace: Duration,
    group: ActiveGroup,
}

impl CommandLauncher {
    pub fn new(spec: CommandSpec, collector: LogCollector, kill_grace: Duration) -> Self {
        CommandLauncher {
            spec,
            collector,
            kill_grace,
            group: ActiveGroup::default(),
        }
    }

    /// Publish the running child's process group through `group`.
    pub fn with_active_group(mut self, group: ActiveGroup) -> Self {
        self.group = group;
        self
    }

    pub fn spec(&self) -> &CommandSpec {
        &self.spec
    }
}

impl TrainingLauncher for CommandLauncher {
    async fn launch(
        &mut self,
        attempt: u32,
        cancel_rx: watch::Receiver<bool>,
    ) -> Result<LaunchResult, SupervisorError> {
        self.collector.begin_run(attempt, &self.spec.display());

        match run_training(&self.spec, &self.collector, cancel_rx, self.kill_grace, &self.group).await {
            // A missing binary is treated like any other failed run
            Err(SupervisorError::SpawnFailed { cmd, source }) => {
                log::error!("Failed to spawn '{}': {}", cmd, source);
                Ok(LaunchResult::Exited(SPAWN_FAILURE_EXIT_CODE))
            }
            other => other,
        }
    }

    fn describe(&self) -> String {
        self.spec.display()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_exit_code_of_normal_exit() {
        // Raw wait status: exit code lives in bits 8..16
        let status = ExitStatus::from_raw(3 << 8);
        assert_eq!(exit_code_of(status), 3);
        assert_eq!(exit_code_of(ExitStatus::from_raw(0)), 0);
    }

    #[test]
    fn test_exit_code_of_signal_death() {
        assert_eq!(exit_code_of(ExitStatus::from_raw(9)), 137);
        assert_eq!(exit_code_of(ExitStatus::from_raw(11)), 139);
    }

    #[test]
    fn test_line_splitter_ends_lines_on_carriage_return() {
        let mut lines = LineSplitter::default();
        assert_eq!(lines.push(b"10%\r20%\r"), vec!["10%", "20%"]);
        assert_eq!(lines.push(b"30%\n"), vec!["30%"]);
        assert_eq!(lines.finish(), None);
    }

    #[test]
    fn test_line_splitter_crlf_and_blank_lines() {
        let mut lines = LineSplitter::default();
        assert_eq!(lines.push(b"a\r\nb\n\nc"), vec!["a", "b", ""]);
        assert_eq!(lines.finish(), Some("c".to_string()));
    }

    #[test]
    fn test_line_splitter_across_chunks() {
        let mut lines = LineSplitter::default();
        assert!(lines.push(b"epoch 1 lo").is_empty());
        assert_eq!(lines.push(b"ss=0.5\r"), vec!["epoch 1 loss=0.5"]);
        // The \n of a split \r\n is not a second line
        assert!(lines.push(b"\n").is_empty());
        assert_eq!(lines.push(b"\xffdone\n"), vec!["\u{fffd}done"]);
    }

    #[test]
    fn test_launcher_describe_uses_command_line() {
        let temp_dir = tempfile::TempDir::new().unwrap();
        let collector = LogCollector::new(temp_dir.path().join("t.log"))
            .unwrap()
            .with_echo(false);
        let launcher =
            CommandLauncher::new(CommandSpec::default(), collector, Duration::from_secs(1));
        assert_eq!(launcher.describe(), "torchrun --nproc_per_node 4 train.py");
    }
}
