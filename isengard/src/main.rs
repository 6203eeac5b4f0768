//! isengard - log forwarding agent
//!
//! Tails every file in a directory, picks up new files as they appear and
//! ships each appended line to the configured sinks until terminated.
//!
//! Uses XDG Base Directory specification for file locations:
//! - Config: $XDG_CONFIG_HOME/isengard/config.toml (~/.config/isengard/config.toml)
//! - Logs: $XDG_STATE_HOME/isengard/isengard.log (~/.local/state/isengard/isengard.log)

mod process_lock;

use std::path::PathBuf;

use anyhow::{Context, Result};
use clap::Parser;
use isengard_core::config::BackendConfig;
use isengard_core::shutdown::wait_for_shutdown_signal;
use isengard_core::{connectors, Agent, Config};

use crate::process_lock::acquire_directory_lock;

#[derive(Parser)]
#[command(name = "isengard")]
#[command(about = "Tail a directory of log files and forward every line to remote sinks")]
#[command(version)]
struct Args {
    /// Path to the configuration file
    #[arg(short, long, env = "ISENGARD_CONFIG_FILE")]
    config: Option<PathBuf>,

    /// Validate the configuration and exit
    #[arg(long)]
    check: bool,

    /// Verbose output (debug level logging)
    #[arg(short, long)]
    verbose: bool,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    let config_path = args.config.clone().unwrap_or_else(Config::config_path);
    let mut config = Config::load(Some(&config_path))
        .with_context(|| format!("failed to load configuration from {}", config_path.display()))?;

    if args.check {
        print_summary(&config, &config_path);
        return Ok(());
    }

    if args.verbose {
        config.logging.level = "debug".to_string();
    }
    let _log_guard =
        isengard_core::logging::init(&config.logging).context("failed to initialize logging")?;

    tracing::info!(agent = %config.name, config = %config_path.display(), "isengard starting");

    let lock =
        acquire_directory_lock(&config.directory).context("failed to acquire process lock")?;
    tracing::debug!(lock = %lock.path().display(), "Directory lock held");

    let sinks =
        connectors::create_connectors(&config.sinks).context("failed to create connectors")?;
    let agent = Agent::from_config(&config, sinks).context("failed to assemble pipeline")?;
    let coordinator = agent.start().await.context("failed to start pipeline")?;

    let report = coordinator.run(wait_for_shutdown_signal()).await;

    for (sink, stats) in &report.dispatch {
        tracing::info!(
            sink = %sink,
            sent = stats.sent,
            failed = stats.failed,
            filtered = stats.filtered,
            "Sink totals"
        );
    }
    if !report.is_clean() {
        tracing::warn!(
            aborted_tasks = report.aborted_tasks,
            close_failures = report.close_failures.len(),
            "Shutdown was not clean"
        );
    }

    drop(lock);
    tracing::info!("isengard stopped");
    Ok(())
}

/// Print what `--check` validated.
fn print_summary(config: &Config, path: &std::path::Path) {
    println!("Configuration OK: {}", path.display());
    println!("  Agent:     {}", config.name);
    println!("  Directory: {}", config.directory.display());
    if let Some(pattern) = &config.file_pattern {
        println!("  Files:     {}", pattern);
    }
    println!("  Poll:      {}ms", config.tail.poll_interval_ms);
    if let Some(timeout) = config.tail.missing_timeout_secs {
        println!("  Missing:   give up after {}s", timeout);
    }
    if config.logging.file {
        println!("  Log file:  {}.<date>", isengard_core::logging::log_file_path().display());
    }
    if let Some(pattern) = &config.pattern {
        println!("  Pattern:   {} (on mismatch: {:?})", pattern.template, pattern.on_mismatch);
    }

    println!("  Sinks:     {}", config.sinks.len());
    for sink in &config.sinks {
        let target = match &sink.backend {
            BackendConfig::S3(s3) => format!("{}/{}/{}", s3.endpoint, s3.bucket, s3.key_prefix),
            BackendConfig::Kafka(kafka) => format!("{} topic {}", kafka.bootstrap_servers(), kafka.topic),
            BackendConfig::Rollbar(rollbar) => rollbar.url.clone(),
        };
        let levels = if sink.levels.is_empty() {
            "all levels".to_string()
        } else {
            sink.levels.join(",")
        };
        println!(
            "    - {} [{}] -> {} ({}, buffer {}, {:?})",
            sink.name,
            sink.kind(),
            target,
            levels,
            sink.buffer,
            sink.overflow
        );
    }
}
