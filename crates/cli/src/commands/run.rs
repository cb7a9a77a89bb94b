//! Bounded batch runs of the daemon loop

use crate::output::{self, OutputFormat};
use anyhow::Result;
use epmt_core::{
    daemon::{self, DaemonConfig, ShutdownToken},
    ingest::{IngestConfig, Ingester},
    lifecycle::{Orchestrator, RetentionConfig},
    stats::OutlierConfig,
    store::{JobSelector, MemoryStore, MetricStore},
};
use serde::Serialize;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tabled::Tabled;

pub struct RunOptions {
    pub spool: PathBuf,
    pub niters: u64,
    pub interval_secs: u64,
    pub retire_jobs_after_days: f64,
    pub retire_models_after_days: f64,
}

#[derive(Tabled, Serialize)]
struct BatchRow {
    #[tabled(rename = "Iterations")]
    iterations: u64,
    #[tabled(rename = "Overruns")]
    overruns: u64,
    #[tabled(rename = "Staged")]
    staged: usize,
    #[tabled(rename = "Analyzed")]
    analyzed: usize,
}

/// Run the daemon loop in-process for a bounded number of iterations
pub async fn run_batch(options: RunOptions, format: OutputFormat) -> Result<()> {
    let store = Arc::new(MemoryStore::new());
    let orchestrator = Orchestrator::new(
        store.clone(),
        OutlierConfig::default(),
        RetentionConfig {
            retire_jobs_after_days: options.retire_jobs_after_days,
            retire_models_after_days: options.retire_models_after_days,
        },
    );
    let ingester = Arc::new(Ingester::new(store.clone(), IngestConfig::default()));
    let config = DaemonConfig {
        interval: Duration::from_secs(options.interval_secs),
        niters: options.niters,
        spool_dir: Some(options.spool),
        ..Default::default()
    };

    // Ctrl-C maps onto the same graceful token the daemon uses
    let shutdown = ShutdownToken::new();
    let trigger = shutdown.clone();
    tokio::spawn(async move {
        loop {
            if tokio::signal::ctrl_c().await.is_err() {
                return;
            }
            if trigger.trigger() >= 2 {
                std::process::exit(130);
            }
        }
    });

    let stats = daemon::run(&orchestrator, &ingester, &config, shutdown).await;

    let staged = store.select_jobs(JobSelector::Staged).await?.len();
    let analyzed = store.select_jobs(JobSelector::Analyzed).await?.len();
    output::print_table(
        &[BatchRow {
            iterations: stats.iterations,
            overruns: stats.overruns,
            staged,
            analyzed,
        }],
        format,
    );
    output::print_success("Batch run complete");
    Ok(())
}
