//! Append-only run log shared by the supervisor and the training process.
//!
//! # Architecture
//!
//! ```text
//! child stdout/stderr      log::info!/warn!/error!
//!          |                         |
//!          +-----> [LogCollector] <--+
//!                        | (crossbeam unbounded channel)
//!                        v
//!                 [writer thread] ---> train.log (append, never truncated)
//! ```
//!
//! Child output is echoed to the terminal untouched, stdout to stdout and
//! stderr to stderr. Supervisor records go to stderr with a timestamp. Every
//! line also lands in the log file as `[HH:MM:SS.mmm] message`.
//!
//! The file is only written by the background thread, so appends stay in
//! the order they were sent.

use crate::error::SupervisorError;
use chrono::Local;
use crossbeam_channel::{unbounded, Sender};
use log::{LevelFilter, Log, Metadata, Record};
use std::fs::OpenOptions;
use std::io::Write;
use std::path::{Path, PathBuf};

/// Where a line came from.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum LogSource {
    Supervisor,
    Stdout,
    Stderr,
}

/// A log line with metadata
#[derive(Clone, Debug)]
pub struct LogLine {
    pub message: String,
    pub source: LogSource,
    /// Timestamp of when the line was received
    pub timestamp: String,
}

impl LogLine {
    pub fn new(source: LogSource, message: String) -> Self {
        LogLine {
            message,
            source,
            timestamp: Local::now().format("%H:%M:%S%.3f").to_string(),
        }
    }

    fn render(&self) -> String {
        format!("[{}] {}\n", self.timestamp, self.message)
    }
}

enum LogMessage {
    Line(LogLine),
    /// Flush marker; the writer answers once everything before it is on disk
    Flush(tokio::sync::oneshot::Sender<()>),
}

/// Unified logger that tees to the terminal and the run log file
pub struct LogCollector {
    tx: Sender<LogMessage>,
    log_path: PathBuf,
    echo: bool,
    level: LevelFilter,
}

impl LogCollector {
    /// Open (or create) `log_path` for appending and start the writer thread.
    pub fn new(log_path: impl AsRef<Path>) -> Result<Self, SupervisorError> {
        let log_path = log_path.as_ref().to_path_buf();

        if let Some(parent) = log_path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent).map_err(|e| {
                    SupervisorError::LogCollector(format!(
                        "Failed to create log directory {}: {}",
                        parent.display(),
                        e
                    ))
                })?;
            }
        }

        // Open here so a bad path fails startup instead of the writer thread
        let mut file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&log_path)
            .map_err(|e| {
                SupervisorError::LogCollector(format!(
                    "Failed to open log file {}: {}",
                    log_path.display(),
                    e
                ))
            })?;

        let (tx, rx) = unbounded::<LogMessage>();
        let thread_path = log_path.clone();

        std::thread::Builder::new()
            .name("log-writer".to_string())
            .spawn(move || {
                while let Ok(msg) = rx.recv() {
                    match msg {
                        LogMessage::Line(line) => {
                            let result = file
                                .write_all(line.render().as_bytes())
                                .and_then(|_| file.flush());
                            if let Err(e) = result {
                                eprintln!(
                                    "[Log] Failed to write to {}: {}",
                                    thread_path.display(),
                                    e
                                );
                            }
                        }
                        LogMessage::Flush(done) => {
                            let _ = file.sync_data();
                            let _ = done.send(());
                        }
                    }
                }
            })
            .map_err(|e| {
                SupervisorError::LogCollector(format!("Failed to start log writer: {}", e))
            })?;

        Ok(LogCollector {
            tx,
            log_path,
            echo: true,
            level: LevelFilter::Info,
        })
    }

    /// Enable or disable terminal echo. File writes are unaffected.
    pub fn with_echo(mut self, echo: bool) -> Self {
        self.echo = echo;
        self
    }

    /// Maximum level accepted through the `log` facade.
    pub fn with_level(mut self, level: LevelFilter) -> Self {
        self.level = level;
        self
    }

    pub fn level(&self) -> LevelFilter {
        self.level
    }

    pub fn log_path(&self) -> &Path {
        &self.log_path
    }

    /// Send a log line (non-blocking)
    pub fn log(&self, line: LogLine) {
        let _ = self.tx.send(LogMessage::Line(line));
    }

    /// Record a supervisor message in the file only.
    pub fn log_str(&self, message: impl Into<String>) {
        self.log(LogLine::new(LogSource::Supervisor, message.into()));
    }

    /// Append one line of child output to the file.
    pub fn log_output(&self, source: LogSource, line: impl Into<String>) {
        self.log(LogLine::new(source, line.into()));
    }

    /// Pass child output through to the terminal exactly as it arrived.
    ///
    /// Carriage-return progress bars redraw in place; nothing is buffered
    /// until a newline.
    pub fn echo_raw(&self, source: LogSource, bytes: &[u8]) {
        if !self.echo {
            return;
        }
        let result = match source {
            LogSource::Stdout => {
                let mut out = std::io::stdout().lock();
                out.write_all(bytes).and_then(|_| out.flush())
            }
            _ => {
                let mut err = std::io::stderr().lock();
                err.write_all(bytes).and_then(|_| err.flush())
            }
        };
        // Closed terminal: the run log still gets everything
        let _ = result;
    }

    /// Write the banner that separates runs in the file.
    pub fn begin_run(&self, attempt: u32, command_line: &str) {
        self.log_str(format!("===== attempt {}: {} =====", attempt, command_line));
    }

    /// Wait for all pending lines to be written to disk.
    pub async fn wait_for_empty(&self) -> Result<(), SupervisorError> {
        let (done_tx, done_rx) = tokio::sync::oneshot::channel();

        self.tx
            .send(LogMessage::Flush(done_tx))
            .map_err(|e| SupervisorError::LogCollector(format!("Failed to send flush marker: {}", e)))?;

        done_rx
            .await
            .map_err(|e| SupervisorError::LogCollector(format!("Flush signal interrupted: {}", e)))
    }
}

impl Clone for LogCollector {
    fn clone(&self) -> Self {
        LogCollector {
            tx: self.tx.clone(),
            log_path: self.log_path.clone(),
            echo: self.echo,
            level: self.level,
        }
    }
}

/// Wires log::info!(), log::warn!(), log::error!() into the run log
impl Log for LogCollector {
    fn enabled(&self, metadata: &Metadata) -> bool {
        metadata.level() <= self.level
    }

    fn log(&self, record: &Record) {
        if !self.enabled(record.metadata()) {
            return;
        }

        let line = LogLine::new(
            LogSource::Supervisor,
            format!("[{}] {}", record.level(), record.args()),
        );
        if self.echo {
            eprint!("{}", line.render());
        }
        LogCollector::log(self, line);
    }

    fn flush(&self) {}
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;
    use tempfile::TempDir;

    #[tokio::test]
    async fn test_log_collector_creates_parent_directories() {
        let temp_dir = TempDir::new().unwrap();
        let log_path = temp_dir.path().join("logs/run/train.log");

        let collector = LogCollector::new(&log_path).unwrap().with_echo(false);
        collector.log_str("hello");
        collector.wait_for_empty().await.unwrap();

        assert!(log_path.exists());
        let content = fs::read_to_string(&log_path).unwrap();
        assert!(content.ends_with("] hello\n"), "unexpected content: {}", content);
    }

    #[tokio::test]
    async fn test_log_collector_appends_across_instances() {
        let temp_dir = TempDir::new().unwrap();
        let log_path = temp_dir.path().join("train.log");
        fs::write(&log_path, "previous run\n").unwrap();

        let first = LogCollector::new(&log_path).unwrap().with_echo(false);
        first.log_output(LogSource::Stdout, "step 1");
        first.wait_for_empty().await.unwrap();

        let second = LogCollector::new(&log_path).unwrap().with_echo(false);
        second.log_output(LogSource::Stderr, "step 2");
        second.wait_for_empty().await.unwrap();

        let content = fs::read_to_string(&log_path).unwrap();
        let lines: Vec<_> = content.lines().collect();
        assert_eq!(lines.len(), 3);
        assert_eq!(lines[0], "previous run");
        assert!(lines[1].ends_with("step 1"));
        assert!(lines[2].ends_with("step 2"));
    }

    #[tokio::test]
    async fn test_log_collector_preserves_order() {
        let temp_dir = TempDir::new().unwrap();
        let log_path = temp_dir.path().join("order.log");
        let collector = LogCollector::new(&log_path).unwrap().with_echo(false);

        for i in 0..1000 {
            collector.log_output(LogSource::Stdout, format!("line {}", i));
        }
        collector.wait_for_empty().await.unwrap();

        let content = fs::read_to_string(&log_path).unwrap();
        for (i, line) in content.lines().enumerate() {
            assert!(line.ends_with(&format!("line {}", i)), "out of order: {}", line);
        }
        assert_eq!(content.lines().count(), 1000);
    }

    #[tokio::test]
    async fn test_log_facade_respects_level() {
        let temp_dir = TempDir::new().unwrap();
        let log_path = temp_dir.path().join("level.log");
        let collector = LogCollector::new(&log_path)
            .unwrap()
            .with_echo(false)
            .with_level(LevelFilter::Warn);

        Log::log(
            &collector,
            &Record::builder()
                .level(log::Level::Info)
                .args(format_args!("quiet"))
                .build(),
        );
        Log::log(
            &collector,
            &Record::builder()
                .level(log::Level::Warn)
                .args(format_args!("loud"))
                .build(),
        );
        collector.wait_for_empty().await.unwrap();

        let content = fs::read_to_string(&log_path).unwrap();
        assert!(!content.contains("quiet"));
        assert!(content.contains("[WARN] loud"));
    }

    #[test]
    fn test_invalid_log_path_fails_fast() {
        let temp_dir = TempDir::new().unwrap();
        let blocker = temp_dir.path().join("file");
        fs::write(&blocker, "x").unwrap();

        let result = LogCollector::new(blocker.join("train.log"));
        assert!(matches!(result, Err(SupervisorError::LogCollector(_))));
    }
}
