//! taskgridd — the TaskGrid daemon.
//!
//! # Usage
//!
//! ```text
//! taskgridd run --config taskgrid.toml --tasks tasks.jsonl --exit-when-idle
//! taskgridd check-config --config taskgrid.toml --print
//! ```
//!
//! Each line of the tasks file is a JSON task submission, e.g.
//! `{"task_type": "shell", "payload": {"command": "echo hi"}}`.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::Context;
use clap::{Parser, Subcommand};
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::sync::watch;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

use taskgrid_core::{GridConfig, TaskSubmission};
use taskgrid_scheduler::TaskScheduler;
use taskgridd::{CommandAdapter, Grid};

const DEFAULT_FILTER: &str = "info,taskgrid=debug,taskgridd=debug";

#[derive(Parser)]
#[command(name = "taskgridd", about = "TaskGrid daemon")]
struct Cli {
    /// Emit logs as JSON lines.
    #[arg(long, global = true)]
    log_json: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Bootstrap the configured clusters and schedule tasks.
    Run {
        /// Grid configuration (TOML). Defaults apply when omitted.
        #[arg(long)]
        config: Option<PathBuf>,

        /// Task submissions, one JSON object per line.
        #[arg(long)]
        tasks: Option<PathBuf>,

        /// Stop once every task has completed, failed, or been cancelled.
        #[arg(long)]
        exit_when_idle: bool,

        /// Write Prometheus metrics to this file on every metrics tick.
        #[arg(long)]
        metrics_file: Option<PathBuf>,

        /// Print every grid event to stdout as a JSON line.
        #[arg(long)]
        emit_events: bool,

        /// Shell used to run each task's `payload.command`.
        #[arg(long, default_value = "sh")]
        shell: String,
    },
    /// Validate a configuration file.
    CheckConfig {
        #[arg(long)]
        config: PathBuf,

        /// Print the configuration with every default filled in.
        #[arg(long)]
        print: bool,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    init_tracing(cli.log_json);

    match cli.command {
        Command::Run {
            config,
            tasks,
            exit_when_idle,
            metrics_file,
            emit_events,
            shell,
        } => {
            let opts = RunOptions {
                exit_when_idle,
                metrics_file,
                emit_events,
                shell,
            };
            run(config, tasks, opts).await
        }
        Command::CheckConfig { config, print } => check_config(&config, print),
    }
}

fn init_tracing(json: bool) {
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(DEFAULT_FILTER));
    let builder = tracing_subscriber::fmt().with_env_filter(filter);
    if json {
        builder.json().init();
    } else {
        builder.init();
    }
}

struct RunOptions {
    exit_when_idle: bool,
    metrics_file: Option<PathBuf>,
    emit_events: bool,
    shell: String,
}

async fn run(
    config_path: Option<PathBuf>,
    tasks_path: Option<PathBuf>,
    opts: RunOptions,
) -> anyhow::Result<()> {
    info!("TaskGrid daemon starting");

    let config = match &config_path {
        Some(path) => GridConfig::from_file(path)
            .with_context(|| format!("failed to load config {}", path.display()))?,
        None => GridConfig::default(),
    };

    let mut grid = Grid::new(config, Arc::new(CommandAdapter::with_shell(&opts.shell)));
    if let Some(path) = opts.metrics_file {
        grid = grid.with_prometheus_file(path);
    }
    grid.bootstrap().await?;

    if opts.emit_events {
        let mut rx = grid.events().subscribe();
        tokio::spawn(async move {
            loop {
                match rx.recv().await {
                    Ok(event) => match serde_json::to_string(&event) {
                        Ok(line) => println!("{line}"),
                        Err(e) => warn!(error = %e, "failed to encode event"),
                    },
                    Err(tokio::sync::broadcast::error::RecvError::Lagged(missed)) => {
                        warn!(missed, "event printer lagged");
                    }
                    Err(tokio::sync::broadcast::error::RecvError::Closed) => break,
                }
            }
        });
    }

    if let Some(path) = &tasks_path {
        submit_tasks(grid.scheduler(), path).await?;
    }

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            let _ = shutdown_tx.send(true);
        }
    });

    if opts.exit_when_idle {
        grid.run_until_idle(shutdown_rx).await?;
    } else {
        grid.run(shutdown_rx).await?;
    }

    info!("TaskGrid daemon stopped");
    Ok(())
}

/// Submit every line of a JSON-lines file. Invalid lines are logged and
/// skipped.
async fn submit_tasks(scheduler: &TaskScheduler, path: &Path) -> anyhow::Result<()> {
    let file = tokio::fs::File::open(path)
        .await
        .with_context(|| format!("failed to open tasks file {}", path.display()))?;
    let mut lines = BufReader::new(file).lines();

    let mut accepted = 0usize;
    let mut rejected = 0usize;
    let mut line_no = 0usize;
    while let Some(line) = lines.next_line().await? {
        line_no += 1;
        if line.trim().is_empty() {
            continue;
        }
        let submission: TaskSubmission = match serde_json::from_str(&line) {
            Ok(s) => s,
            Err(e) => {
                warn!(line = line_no, error = %e, "skipping malformed task");
                rejected += 1;
                continue;
            }
        };
        match scheduler.submit(submission).await {
            Ok(_) => accepted += 1,
            Err(e) => {
                warn!(line = line_no, error = %e, "task rejected");
                rejected += 1;
            }
        }
    }

    info!(accepted, rejected, path = %path.display(), "tasks loaded");
    Ok(())
}

fn check_config(path: &Path, print: bool) -> anyhow::Result<()> {
    let config = GridConfig::from_file(path)
        .with_context(|| format!("invalid config {}", path.display()))?;
    if print {
        println!("{}", config.to_toml_string()?);
    } else {
        println!(
            "✓ {} is valid ({} cluster(s))",
            path.display(),
            config.clusters.len()
        );
    }
    Ok(())
}
