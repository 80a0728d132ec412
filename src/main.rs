use std::path::PathBuf;
use std::process::ExitCode;

use anyhow::Context;
use clap::Parser;
use log::LevelFilter;

use train_supervisor::config::loader::{resolve_config, ConfigSource};
use train_supervisor::system::{install_shutdown_handler, ActiveGroup};
use train_supervisor::{
    CheckpointTarget, CommandLauncher, LogCollector, Supervisor, SupervisorConfig,
};

/// Restart a training command until it exits successfully.
#[derive(Parser, Debug)]
#[command(name = "train_supervisor", version, about, long_about = None)]
struct Cli {
    /// Configuration file (.toml or .json)
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Training launcher program
    #[arg(long)]
    program: Option<String>,

    /// Number of worker processes passed to the launcher
    #[arg(short, long)]
    workers: Option<u32>,

    /// Training script / target
    #[arg(short, long)]
    script: Option<String>,

    /// Directory containing checkpoint subdirectories
    #[arg(long)]
    checkpoint_root: Option<PathBuf>,

    /// Append-only log file for training output
    #[arg(long)]
    log_file: Option<PathBuf>,

    /// Seconds to wait between restarts
    #[arg(long)]
    restart_delay: Option<u64>,

    /// Runs shorter than this many seconds are reported as fast failures
    #[arg(long)]
    fast_failure_threshold: Option<u64>,

    /// Stop after this many consecutive fast failures (default: never stop)
    #[arg(long)]
    max_fast_failures: Option<u32>,

    /// Increase log verbosity (-v debug, -vv trace)
    #[arg(short, long, action = clap::ArgAction::Count)]
    verbose: u8,

    /// Extra arguments appended after the training script
    #[arg(last = true)]
    extra_args: Vec<String>,
}

impl Cli {
    fn apply(&self, config: &mut SupervisorConfig) {
        if let Some(program) = &self.program {
            config.command.program = program.clone();
        }
        if let Some(workers) = self.workers {
            config.command.workers = workers;
        }
        if let Some(script) = &self.script {
            config.command.script = script.clone();
        }
        if let Some(root) = &self.checkpoint_root {
            config.checkpoint.root = root.clone();
        }
        if let Some(log_file) = &self.log_file {
            config.log_file = log_file.clone();
        }
        if let Some(delay) = self.restart_delay {
            config.restart_delay_secs = delay;
        }
        if let Some(threshold) = self.fast_failure_threshold {
            config.fast_failure_threshold_secs = threshold;
        }
        if self.max_fast_failures.is_some() {
            config.max_consecutive_fast_failures = self.max_fast_failures;
        }
        if !self.extra_args.is_empty() {
            config.command.extra_args = self.extra_args.clone();
        }
    }

    fn level(&self) -> LevelFilter {
        match self.verbose {
            0 => LevelFilter::Info,
            1 => LevelFilter::Debug,
            _ => LevelFilter::Trace,
        }
    }
}

fn load_config(cli: &Cli) -> anyhow::Result<(SupervisorConfig, ConfigSource)> {
    let (mut config, source) =
        resolve_config(cli.config.as_deref()).context("Failed to load configuration")?;
    cli.apply(&mut config);
    config.validate().context("Invalid configuration")?;
    Ok((config, source))
}

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();

    let (config, source) = match load_config(&cli) {
        Ok(loaded) => loaded,
        Err(e) => {
            eprintln!("[Main] ERROR: {:#}", e);
            return ExitCode::from(2);
        }
    };

    match run(config, source, cli.level()).await {
        Ok(code) => ExitCode::from(code),
        Err(e) => {
            eprintln!("[Main] ERROR: {:#}", e);
            ExitCode::FAILURE
        }
    }
}

async fn run(config: SupervisorConfig, source: ConfigSource, level: LevelFilter) -> anyhow::Result<u8> {
    // Wire LogCollector as the global logger so every log::*! call reaches the run log
    let collector = LogCollector::new(&config.log_file)
        .context("Failed to open run log")?
        .with_level(level);
    log::set_boxed_logger(Box::new(collector.clone()))
        .map(|()| log::set_max_level(level))
        .context("Failed to install logger")?;

    log::info!("Configuration: {}", source);
    log::info!("Run log: {}", collector.log_path().display());

    let (cancel_tx, cancel_rx) = tokio::sync::watch::channel(false);
    let group = ActiveGroup::default();
    install_shutdown_handler(cancel_tx, group.clone());

    let checkpoints = CheckpointTarget::from_config(&config)?;
    let launcher = CommandLauncher::new(config.command.clone(), collector.clone(), config.kill_grace())
        .with_active_group(group);
    let mut supervisor = Supervisor::new(launcher, checkpoints, config.retry_policy(), cancel_rx);

    let result = supervisor.run().await;
    if let Ok(summary) = &result {
        log::info!(
            "Supervisor finished: {:?} after {} attempt(s), {} restart(s), {:?}",
            summary.outcome,
            summary.attempts,
            summary.restart_count,
            summary.total_elapsed
        );
    }

    if let Err(e) = collector.wait_for_empty().await {
        eprintln!("[Main] WARNING: Failed to flush run log: {}", e);
    }

    let summary = result.context("Supervisor stopped unexpectedly")?;
    Ok(summary.outcome.exit_code())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_cli_overrides_config() {
        let cli = Cli::try_parse_from([
            "train_supervisor",
            "--workers",
            "8",
            "--script",
            "finetune.py",
            "--max-fast-failures",
            "3",
            "--",
            "--bf16",
        ])
        .unwrap();

        let mut config = SupervisorConfig::default();
        cli.apply(&mut config);
        assert_eq!(config.command.workers, 8);
        assert_eq!(config.command.script, "finetune.py");
        assert_eq!(config.command.extra_args, vec!["--bf16"]);
        assert_eq!(config.max_consecutive_fast_failures, Some(3));
        assert_eq!(config.restart_delay_secs, 10);
    }

    #[test]
    fn test_cli_without_flags_keeps_config() {
        let cli = Cli::try_parse_from(["train_supervisor"]).unwrap();
        let mut config = SupervisorConfig::default();
        cli.apply(&mut config);
        assert_eq!(config, SupervisorConfig::default());
        assert_eq!(cli.level(), LevelFilter::Info);
    }

    #[test]
    fn test_load_config_reports_explicit_source() {
        let temp_dir = tempfile::TempDir::new().unwrap();
        let path = temp_dir.path().join("run.toml");
        std::fs::write(&path, "restart_delay_secs = 1\n").unwrap();

        let path_arg = path.to_string_lossy().to_string();
        let cli = Cli::try_parse_from(["train_supervisor", "--config", &path_arg, "--workers", "2"])
            .unwrap();
        let (config, source) = load_config(&cli).unwrap();
        assert_eq!(config.restart_delay_secs, 1);
        assert_eq!(config.command.workers, 2);
        assert_eq!(source, ConfigSource::Explicit(path));
    }

    #[test]
    fn test_cli_verbosity() {
        let cli = Cli::try_parse_from(["train_supervisor", "-vv"]).unwrap();
        assert_eq!(cli.level(), LevelFilter::Trace);
    }
}
