//! EPMT daemon - long-running job pipeline driver
//!
//! Runs the ingest/post-process/analyze/retire loop against the metric
//! store, serves health and Prometheus endpoints, and terminates
//! gracefully on the first signal (forcing exit on the second).

use anyhow::{Context, Result};
use epmt_core::{
    daemon::{self, DaemonConfig, ShutdownToken},
    health::{components, HealthRegistry},
    ingest::{IngestConfig, Ingester},
    lifecycle::{Orchestrator, RetentionConfig},
    observability::{PipelineMetrics, StructuredLogger},
    stats::OutlierConfig,
    store::MemoryStore,
};
use std::fs;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;
use tracing::{info, warn};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

mod api;
mod config;

const DAEMON_VERSION: &str = env!("CARGO_PKG_VERSION");

#[tokio::main]
async fn main() -> Result<()> {
    // Initialize tracing with JSON output and env filter
    tracing_subscriber::registry()
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .with(fmt::layer().json())
        .init();

    info!("Starting epmtd");

    let settings = config::DaemonSettings::load()?;
    info!(instance = %settings.instance, "Daemon configured");
    std::env::set_var("EPMT_INSTANCE", &settings.instance);

    write_pid_file(&settings.pid_file)?;

    // Initialize health registry
    let health_registry = HealthRegistry::new();
    health_registry.register(components::INGEST).await;
    health_registry.register(components::POST_PROCESS).await;
    health_registry.register(components::ANALYZE).await;
    health_registry.register(components::RETIRE).await;
    health_registry.register(components::STORE).await;

    // Initialize metrics and structured logging
    let metrics = PipelineMetrics::new();
    let logger = StructuredLogger::new(&settings.instance);
    logger.log_startup(DAEMON_VERSION);

    // Wire the pipeline against the in-memory store
    let store = Arc::new(MemoryStore::new());
    let orchestrator = Orchestrator::new(
        store.clone(),
        OutlierConfig::default(),
        RetentionConfig {
            retire_jobs_after_days: settings.retire_jobs_after_days,
            retire_models_after_days: settings.retire_models_after_days,
        },
    );
    let ingester = Arc::new(Ingester::new(
        store,
        IngestConfig {
            scratch_dir: settings.scratch_dir.clone(),
            quarantine_dir: settings.quarantine_dir.clone(),
            on_corrupt: epmt_core::ingest::CorruptArchivePolicy::Quarantine,
            concurrency: settings.ingest_concurrency,
            ..Default::default()
        },
    ));
    let daemon_config = DaemonConfig {
        interval: Duration::from_secs(settings.interval_secs),
        niters: settings.niters,
        spool_dir: settings.spool_dir.clone(),
        ..Default::default()
    };

    // Start health and metrics server
    let app_state = Arc::new(api::AppState::new(health_registry.clone(), metrics));
    let api_handle = tokio::spawn(api::serve(settings.api_port, app_state));

    // First signal drains the current iteration; a second one forces exit
    let shutdown = ShutdownToken::new();
    spawn_signal_handler(shutdown.clone(), logger.clone());

    health_registry.set_ready(true).await;

    let stats = daemon::run(&orchestrator, &ingester, &daemon_config, shutdown).await;
    info!(
        iterations = stats.iterations,
        overruns = stats.overruns,
        "Daemon loop finished"
    );

    api_handle.abort();
    remove_pid_file(&settings.pid_file);
    logger.log_shutdown("graceful");
    Ok(())
}

/// Record the daemon's pid so the CLI can stop and query it
fn write_pid_file(path: &Path) -> Result<()> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent)
            .with_context(|| format!("Failed to create {}", parent.display()))?;
    }
    fs::write(path, std::process::id().to_string())
        .with_context(|| format!("Failed to write pid file {}", path.display()))?;
    info!(path = %path.display(), pid = std::process::id(), "Wrote pid file");
    Ok(())
}

fn remove_pid_file(path: &Path) {
    if let Err(e) = fs::remove_file(path) {
        warn!(path = %path.display(), error = %e, "Failed to remove pid file");
    }
}

fn spawn_signal_handler(shutdown: ShutdownToken, logger: StructuredLogger) {
    tokio::spawn(async move {
        #[cfg(unix)]
        let mut sigterm = {
            use tokio::signal::unix::{signal, SignalKind};
            signal(SignalKind::terminate()).expect("failed to install SIGTERM handler")
        };

        loop {
            #[cfg(unix)]
            tokio::select! {
                _ = tokio::signal::ctrl_c() => {}
                _ = sigterm.recv() => {}
            }
            #[cfg(not(unix))]
            let _ = tokio::signal::ctrl_c().await;

            let count = shutdown.trigger();
            if count >= 2 {
                logger.log_shutdown("forced");
                std::process::exit(130);
            }
            info!("Termination signal received, finishing current iteration");
        }
    });
}
