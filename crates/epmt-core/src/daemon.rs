//! Daemon control loop
//!
//! Runs the pipeline stages in fixed order on a budgeted interval:
//! ingest scan -> post-process -> analyze -> retire. Termination is driven
//! by a [`ShutdownToken`] passed in explicitly and checked at the top of
//! every iteration, so a triggered shutdown lets the running iteration
//! finish its started work.

use crate::ingest::{jobid_from_archive, Ingester};
use crate::lifecycle::Orchestrator;
use crate::observability::PipelineMetrics;
use crate::store::JobSelector;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Notify;
use tokio::time::Instant;
use tracing::{debug, info, warn};

/// Daemon loop settings
#[derive(Debug, Clone)]
pub struct DaemonConfig {
    /// Fixed per-iteration time budget; the loop sleeps whatever the
    /// iteration left of it
    pub interval: Duration,
    /// Maximum iterations; 0 means unbounded
    pub niters: u64,
    /// Directory scanned for new `.tgz` archives each iteration
    pub spool_dir: Option<PathBuf>,
    pub ingest_enabled: bool,
    pub post_process_enabled: bool,
    pub analyze_enabled: bool,
    pub retire_enabled: bool,
}

impl Default for DaemonConfig {
    fn default() -> Self {
        Self {
            interval: Duration::from_secs(10),
            niters: 0,
            spool_dir: None,
            ingest_enabled: true,
            post_process_enabled: true,
            analyze_enabled: true,
            retire_enabled: true,
        }
    }
}

/// Shared termination flag observed at iteration boundaries
///
/// The binary's signal handler calls [`ShutdownToken::trigger`]; the loop
/// never installs handlers or global state of its own.
#[derive(Clone, Default)]
pub struct ShutdownToken {
    flag: Arc<AtomicBool>,
    count: Arc<AtomicU32>,
    notify: Arc<Notify>,
}

impl ShutdownToken {
    pub fn new() -> Self {
        Self::default()
    }

    /// Request termination; returns how many times it has been requested,
    /// letting the caller escalate a repeated request to a forced exit
    pub fn trigger(&self) -> u32 {
        self.flag.store(true, Ordering::SeqCst);
        let count = self.count.fetch_add(1, Ordering::SeqCst) + 1;
        self.notify.notify_waiters();
        count
    }

    pub fn is_triggered(&self) -> bool {
        self.flag.load(Ordering::SeqCst)
    }

    /// Wait until termination is requested
    pub async fn wait(&self) {
        while !self.is_triggered() {
            self.notify.notified().await;
        }
    }
}

/// Loop statistics returned when the daemon exits
#[derive(Debug, Default)]
pub struct DaemonStats {
    pub iterations: u64,
    /// Iterations that exceeded the time budget
    pub overruns: u64,
}

/// Run the daemon loop until the iteration bound or a shutdown request
pub async fn run(
    orchestrator: &Orchestrator,
    ingester: &Arc<Ingester>,
    config: &DaemonConfig,
    shutdown: ShutdownToken,
) -> DaemonStats {
    info!(
        interval_secs = config.interval.as_secs(),
        niters = config.niters,
        "Starting daemon loop"
    );

    let metrics = PipelineMetrics::new();
    let mut stats = DaemonStats::default();
    loop {
        if shutdown.is_triggered() {
            info!(
                iterations = stats.iterations,
                "Termination requested, exiting daemon loop gracefully"
            );
            break;
        }

        let started = Instant::now();
        run_iteration(orchestrator, ingester, config).await;
        stats.iterations += 1;
        metrics.inc_daemon_iterations();
        if let Ok(staged) = orchestrator.store().select_jobs(JobSelector::Staged).await {
            metrics.set_staged_jobs(staged.len() as i64);
        }

        if config.niters > 0 && stats.iterations >= config.niters {
            info!(iterations = stats.iterations, "Iteration bound reached");
            break;
        }

        let elapsed = started.elapsed();
        if elapsed >= config.interval {
            stats.overruns += 1;
            metrics.inc_daemon_overruns();
            warn!(
                elapsed_ms = elapsed.as_millis(),
                budget_ms = config.interval.as_millis(),
                "Iteration overran its budget, skipping sleep"
            );
            continue;
        }
        tokio::select! {
            _ = tokio::time::sleep(config.interval - elapsed) => {}
            _ = shutdown.wait() => {}
        }
    }
    stats
}

/// One iteration: the enabled sub-stages in fixed order
async fn run_iteration(
    orchestrator: &Orchestrator,
    ingester: &Arc<Ingester>,
    config: &DaemonConfig,
) {
    if config.ingest_enabled {
        if let Some(spool) = &config.spool_dir {
            ingest_scan(orchestrator, ingester, spool).await;
        }
    }
    if config.post_process_enabled {
        orchestrator.post_process(None, false).await;
    }
    if config.analyze_enabled {
        orchestrator.analyze(None, false).await;
    }
    if config.retire_enabled {
        if let Err(e) = orchestrator.retire(false).await {
            warn!(error = %e, "Retirement pass failed");
        }
    }
}

/// Submit new archives from the spool directory and clear the ingested ones
async fn ingest_scan(orchestrator: &Orchestrator, ingester: &Arc<Ingester>, spool: &Path) {
    let archives = scan_spool(spool);
    if archives.is_empty() {
        return;
    }
    debug!(count = archives.len(), "Found archives in spool directory");

    let report = orchestrator.ingest(ingester, &archives).await;
    for path in &archives {
        let Some(jobid) = jobid_from_archive(path) else {
            continue;
        };
        if report.succeeded.contains(&jobid) || report.already_present.contains(&jobid) {
            if let Err(e) = fs::remove_file(path) {
                warn!(path = %path.display(), error = %e, "Failed to clear spooled archive");
            }
        }
    }
}

fn scan_spool(spool: &Path) -> Vec<PathBuf> {
    let Ok(entries) = fs::read_dir(spool) else {
        return Vec::new();
    };
    let mut archives: Vec<PathBuf> = entries
        .filter_map(|entry| entry.ok())
        .map(|entry| entry.path())
        .filter(|path| {
            path.extension().and_then(|e| e.to_str()) == Some("tgz")
                || path
                    .file_name()
                    .and_then(|n| n.to_str())
                    .is_some_and(|n| n.ends_with(".tar.gz"))
        })
        .collect();
    archives.sort();
    archives
}
