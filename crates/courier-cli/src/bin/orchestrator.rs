//! courier-orchestrator: reclaim stale claims, promote retries, archive,
//! replenish.

use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Arc;

use anyhow::Result;
use clap::Parser;
use courier_cli::{CommonArgs, init_logging, open_store, spawn_signal_handler};
use courier_core::app::{BucketCounts, Orchestrator};
use courier_core::impls::SeedFileSource;
use courier_core::ports::SystemClock;

#[derive(Debug, Parser)]
#[command(name = "courier-orchestrator", version, about = "Maintain the shared work order repository")]
struct Cli {
    #[command(flatten)]
    common: CommonArgs,

    /// Stop after this many cycles (default: run until interrupted)
    #[arg(long)]
    max_cycles: Option<u64>,

    /// JSON array of seeds used to replenish `available`
    #[arg(long, value_name = "PATH")]
    seed_file: Option<PathBuf>,

    /// Print bucket counts and exit
    #[arg(long)]
    status: bool,
}

async fn run(cli: Cli) -> Result<bool> {
    let mut config = cli.common.load_config()?;
    if let Some(path) = &cli.seed_file {
        config.orchestrator.seed_file = Some(path.clone());
    }
    config.validate()?;

    let store = open_store(&config).await?;

    if cli.status {
        let counts = BucketCounts::collect(store.as_ref()).await?;
        println!("{}", serde_json::to_string_pretty(&counts)?);
        return Ok(true);
    }

    let mut orchestrator = Orchestrator::new(&config, store, Arc::new(SystemClock));
    match &config.orchestrator.seed_file {
        Some(path) => {
            orchestrator = orchestrator.with_source(Arc::new(SeedFileSource::new(path.clone())));
        }
        None => tracing::info!("no seed file configured, replenishment disabled"),
    }

    let summary = orchestrator.run(cli.max_cycles, spawn_signal_handler()).await;
    println!("{}", serde_json::to_string_pretty(&summary)?);
    Ok(summary.failed_cycles < summary.cycles_run || summary.cycles_run == 0)
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
