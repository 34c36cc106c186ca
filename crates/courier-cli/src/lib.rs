//! Shared plumbing for the courier binaries: logging, signals, config.

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::Args;
use courier_core::app::{HistoryOutcome, SessionExport, StopReason};
use courier_core::config::{CourierConfig, Environment};
use courier_core::domain::WorkerId;
use courier_core::impls::GitWorkStore;
use courier_core::ports::{Clock, WorkStore};
use tokio::signal;
use tokio::sync::watch;
use tracing_subscriber::{EnvFilter, layer::SubscriberExt, util::SubscriberInitExt};

/// Flags both binaries accept.
#[derive(Debug, Clone, Args)]
pub struct CommonArgs {
    /// Shared work order repository (https://, ssh://, git@, file:// or a local path)
    #[arg(long)]
    pub repo_url: String,

    /// Environment preset
    #[arg(long, default_value = "production")]
    pub environment: Environment,

    /// TOML file layered on top of the preset
    #[arg(long, value_name = "PATH")]
    pub config: Option<PathBuf>,

    /// Local clone directory
    #[arg(long, value_name = "DIR")]
    pub workdir: Option<PathBuf>,

    /// Debug logging (RUST_LOG still wins when set)
    #[arg(long)]
    pub debug: bool,
}

impl CommonArgs {
    /// Preset + TOML + the common overrides. Not validated yet; callers
    /// apply their own overrides first.
    pub fn load_config(&self) -> Result<CourierConfig> {
        let mut config = CourierConfig::load(self.environment, self.config.as_deref())
            .context("loading configuration")?;
        config.store.repo_url = self.repo_url.clone();
        if let Some(dir) = &self.workdir {
            config.store.workdir = dir.clone();
        }
        Ok(config)
    }
}

pub fn init_logging(debug: bool) -> Result<()> {
    let default_level = if debug { "debug" } else { "info" };
    let env_filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_level));

    // logs on stderr; stdout carries the JSON summary
    tracing_subscriber::registry()
        .with(env_filter)
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
        .try_init()
        .context("initialising logging")?;
    Ok(())
}

pub async fn open_store(config: &CourierConfig) -> Result<Arc<dyn WorkStore>> {
    let store = GitWorkStore::open(&config.store)
        .await
        .with_context(|| format!("opening work order repository {}", config.store.repo_url))?;
    Ok(Arc::new(store))
}

/// [`open_store`] for a worker. If the store cannot be opened, a session
/// export stopped with `infrastructure_failure` is written before the error
/// is returned.
pub async fn open_worker_store(
    config: &CourierConfig,
    worker_id: &WorkerId,
    clock: &dyn Clock,
) -> Result<Arc<dyn WorkStore>> {
    let err = match open_store(config).await {
        Ok(store) => return Ok(store),
        Err(err) => err,
    };

    let now = clock.now();
    let mut session = SessionExport::new(worker_id.clone(), config.environment.as_str(), now);
    session.counters.infra_failures += 1;
    session.record(None, HistoryOutcome::InfrastructureError, now, Some(format!("{err:#}")));
    session.finish(StopReason::InfrastructureFailure, now);
    match session.write_to(&config.worker.export_dir).await {
        Ok(path) => tracing::info!(export = %path.display(), "session exported"),
        Err(export_err) => tracing::error!(error = %export_err, "session export failed"),
    }
    Err(err)
}

/// First Ctrl-C / SIGTERM requests a graceful stop; the second exits at once.
pub fn spawn_signal_handler() -> watch::Receiver<bool> {
    let (tx, rx) = watch::channel(false);
    tokio::spawn(async move {
        wait_for_shutdown_signal().await;
        tracing::info!("shutdown requested, finishing current work (again to force)");
        // ignore send error: the run may already be over
        let _ = tx.send(true);

        wait_for_shutdown_signal().await;
        tracing::warn!("second shutdown signal, exiting immediately");
        std::process::exit(130);
    });
    rx
}

async fn wait_for_shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            tracing::error!(error = %e, "cannot listen for Ctrl-C");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut sigterm) => {
                sigterm.recv().await;
            }
            Err(e) => {
                tracing::error!(error = %e, "cannot listen for SIGTERM");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {}
        _ = terminate => {}
    }
}
