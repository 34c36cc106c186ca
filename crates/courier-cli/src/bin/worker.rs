//! courier-worker: claim and process work orders until a stop condition.

use std::process::ExitCode;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::Parser;
use courier_cli::{CommonArgs, init_logging, open_worker_store, spawn_signal_handler};
use courier_core::app::WorkerLoop;
use courier_core::config::CourierConfig;
use courier_core::domain::{ConfigError, WorkerId};
use courier_core::impls::CommandExecutor;
use courier_core::ports::SystemClock;

#[derive(Debug, Parser)]
#[command(name = "courier-worker", version, about = "Process work orders from a shared repository")]
struct Cli {
    #[command(flatten)]
    common: CommonArgs,

    /// Stop after this many completed work orders
    #[arg(long)]
    max_work: Option<u32>,

    /// Stop after this many consecutive polls without work
    #[arg(long)]
    max_failures: Option<u32>,

    /// Stop after this long without a completion
    #[arg(long)]
    max_idle_hours: Option<f64>,

    /// Seconds between polls of an empty queue
    #[arg(long)]
    poll_interval: Option<f64>,

    /// Command run per work order (order JSON on stdin, result JSON on stdout)
    #[arg(long, value_name = "COMMAND")]
    executor: Option<String>,
}

impl Cli {
    fn config(&self) -> Result<CourierConfig> {
        let mut config = self.common.load_config()?;
        let worker = &mut config.worker;
        if let Some(n) = self.max_work {
            worker.max_work_orders = n;
        }
        if let Some(n) = self.max_failures {
            worker.max_consecutive_failures = n;
        }
        if let Some(hours) = self.max_idle_hours {
            worker.max_idle = Duration::try_from_secs_f64(hours * 3600.0)
                .map_err(|_| ConfigError::invalid("worker.max_idle_hours", format!("{hours}")))?;
        }
        if let Some(secs) = self.poll_interval {
            worker.poll_interval = Duration::try_from_secs_f64(secs)
                .map_err(|_| ConfigError::invalid("worker.poll_interval_secs", format!("{secs}")))?;
        }
        if let Some(command) = &self.executor {
            worker.executor_command = Some(command.clone());
        }
        config.validate()?;
        Ok(config)
    }
}

async fn run(cli: Cli) -> Result<bool> {
    let config = cli.config()?;
    let executor = config
        .worker
        .executor_command
        .as_deref()
        .and_then(|line| CommandExecutor::from_command_line(line, config.worker.executor_timeout))
        .ok_or_else(|| {
            ConfigError::invalid(
                "worker.executor_command",
                "required (use --executor or the config file)",
            )
        })?;

    let worker_id = WorkerId::for_this_process();
    tracing::info!(worker_id = %worker_id, environment = %config.environment, "starting worker");
    let store = open_worker_store(&config, &worker_id, &SystemClock).await?;
    let shutdown = spawn_signal_handler();

    let report = WorkerLoop::new(&config, worker_id, store, Arc::new(executor), Arc::new(SystemClock))
        .run(shutdown)
        .await
        .context("worker stopped on an unrecoverable error")?;

    let json = serde_json::to_string_pretty(&report.session)?;
    println!("{json}");
    tracing::info!(reason = %report.stop_reason, export = %report.export_path.display(), "session exported");
    Ok(report.stop_reason.is_graceful())
}

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();
    if let Err(e) = init_logging(cli.common.debug) {
        eprintln!("{e:#}");
        return ExitCode::FAILURE;
    }
    match run(cli).await {
        Ok(true) => ExitCode::SUCCESS,
        Ok(false) => ExitCode::FAILURE,
        Err(e) => {
            tracing::error!("{e:#}");
            ExitCode::FAILURE
        }
    }
}
