//! Observability infrastructure for the pipeline daemon
//!
//! Provides:
//! - Prometheus metrics (stage latencies, ingest/quarantine counters,
//!   outlier counts, staged-job gauge)
//! - Structured JSON logging with tracing

use prometheus::{
    register_histogram_vec, register_int_counter, register_int_counter_vec, register_int_gauge,
    HistogramVec, IntCounter, IntCounterVec, IntGauge,
};
use std::sync::OnceLock;
use tracing::{info, warn};

/// Default histogram buckets for stage latencies (in seconds)
const LATENCY_BUCKETS: &[f64] = &[
    0.001, 0.005, 0.01, 0.05, 0.1, 0.25, 0.5, 1.0, 2.5, 5.0, 10.0, 30.0,
];

/// Global metrics instance (registered once)
static GLOBAL_METRICS: OnceLock<PipelineMetricsInner> = OnceLock::new();

/// Inner metrics structure that holds the actual Prometheus metrics
struct PipelineMetricsInner {
    stage_latency_seconds: HistogramVec,
    jobs_ingested: IntCounter,
    jobs_by_stage: IntCounterVec,
    archives_quarantined: IntCounter,
    files_quarantined: IntCounter,
    outliers_detected: IntCounter,
    stage_failures: IntCounterVec,
    staged_jobs: IntGauge,
    daemon_iterations: IntCounter,
    daemon_overruns: IntCounter,
}

impl PipelineMetricsInner {
    fn new() -> Self {
        Self {
            stage_latency_seconds: register_histogram_vec!(
                "epmt_stage_latency_seconds",
                "Time spent running one pipeline stage over a batch",
                &["stage"],
                LATENCY_BUCKETS.to_vec()
            )
            .expect("Failed to register stage_latency_seconds"),

            jobs_ingested: register_int_counter!(
                "epmt_jobs_ingested_total",
                "Total number of job archives ingested"
            )
            .expect("Failed to register jobs_ingested"),

            jobs_by_stage: register_int_counter_vec!(
                "epmt_jobs_processed_total",
                "Jobs successfully advanced, by stage",
                &["stage"]
            )
            .expect("Failed to register jobs_by_stage"),

            archives_quarantined: register_int_counter!(
                "epmt_archives_quarantined_total",
                "Corrupted job archives quarantined or rejected"
            )
            .expect("Failed to register archives_quarantined"),

            files_quarantined: register_int_counter!(
                "epmt_counter_files_quarantined_total",
                "Per-host counter files rejected during collation"
            )
            .expect("Failed to register files_quarantined"),

            outliers_detected: register_int_counter!(
                "epmt_outliers_detected_total",
                "Jobs flagged as outliers by at least one method"
            )
            .expect("Failed to register outliers_detected"),

            stage_failures: register_int_counter_vec!(
                "epmt_stage_failures_total",
                "Per-job stage failures, by stage",
                &["stage"]
            )
            .expect("Failed to register stage_failures"),

            staged_jobs: register_int_gauge!(
                "epmt_staged_jobs",
                "Jobs currently staged and awaiting post-processing"
            )
            .expect("Failed to register staged_jobs"),

            daemon_iterations: register_int_counter!(
                "epmt_daemon_iterations_total",
                "Completed daemon loop iterations"
            )
            .expect("Failed to register daemon_iterations"),

            daemon_overruns: register_int_counter!(
                "epmt_daemon_overruns_total",
                "Daemon iterations that exceeded their time budget"
            )
            .expect("Failed to register daemon_overruns"),
        }
    }
}

/// Pipeline metrics for Prometheus exposition
///
/// This is a lightweight handle to the global metrics instance.
/// Multiple clones share the same underlying metrics.
#[derive(Clone)]
pub struct PipelineMetrics {
    _private: (),
}

impl Default for PipelineMetrics {
    fn default() -> Self {
        Self::new()
    }
}

impl PipelineMetrics {
    /// Create a new metrics handle (initializes global metrics if needed)
    pub fn new() -> Self {
        GLOBAL_METRICS.get_or_init(PipelineMetricsInner::new);
        Self { _private: () }
    }

    fn inner(&self) -> &PipelineMetricsInner {
        GLOBAL_METRICS.get().expect("Metrics not initialized")
    }

    /// Record a stage latency observation
    pub fn observe_stage_latency(&self, stage: &str, duration_secs: f64) {
        self.inner()
            .stage_latency_seconds
            .with_label_values(&[stage])
            .observe(duration_secs);
    }

    /// Increment ingested-jobs counter
    pub fn inc_jobs_ingested(&self) {
        self.inner().jobs_ingested.inc();
    }

    /// Record jobs that advanced through a stage
    pub fn add_jobs_processed(&self, stage: &str, count: u64) {
        self.inner()
            .jobs_by_stage
            .with_label_values(&[stage])
            .inc_by(count);
    }

    /// Increment the quarantined-archives counter
    pub fn inc_archives_quarantined(&self) {
        self.inner().archives_quarantined.inc();
    }

    /// Record counter files rejected during collation
    pub fn add_files_quarantined(&self, count: u64) {
        self.inner().files_quarantined.inc_by(count);
    }

    /// Increment the outlier counter
    pub fn inc_outliers_detected(&self) {
        self.inner().outliers_detected.inc();
    }

    /// Record per-job stage failures
    pub fn add_stage_failures(&self, stage: &str, count: u64) {
        self.inner()
            .stage_failures
            .with_label_values(&[stage])
            .inc_by(count);
    }

    /// Update the staged-jobs gauge
    pub fn set_staged_jobs(&self, count: i64) {
        self.inner().staged_jobs.set(count);
    }

    /// Increment the daemon iteration counter
    pub fn inc_daemon_iterations(&self) {
        self.inner().daemon_iterations.inc();
    }

    /// Increment the daemon overrun counter
    pub fn inc_daemon_overruns(&self) {
        self.inner().daemon_overruns.inc();
    }
}

/// Structured logger for pipeline events
///
/// Provides consistent JSON-formatted logging for submissions, stage
/// transitions, and outlier verdicts.
#[derive(Clone)]
pub struct StructuredLogger {
    instance: String,
}

impl StructuredLogger {
    pub fn new(instance: impl Into<String>) -> Self {
        Self {
            instance: instance.into(),
        }
    }

    /// Log a job submission event
    pub fn log_submission(&self, jobid: &str, num_procs: usize, staged: bool) {
        info!(
            event = "job_submitted",
            instance = %self.instance,
            jobid = %jobid,
            num_procs = num_procs,
            staged = staged,
            "Job archive ingested"
        );
    }

    /// Log a stage batch summary
    pub fn log_stage_summary(&self, stage: &str, attempted: usize, succeeded: usize) {
        if succeeded < attempted {
            warn!(
                event = "stage_summary",
                instance = %self.instance,
                stage = %stage,
                attempted = attempted,
                succeeded = succeeded,
                failed = attempted - succeeded,
                "Stage completed with failures"
            );
        } else {
            info!(
                event = "stage_summary",
                instance = %self.instance,
                stage = %stage,
                attempted = attempted,
                succeeded = succeeded,
                "Stage completed"
            );
        }
    }

    /// Log an outlier verdict
    pub fn log_outlier(&self, jobid: &str, method: &str, top_feature: &str, score: f64) {
        warn!(
            event = "outlier_detected",
            instance = %self.instance,
            jobid = %jobid,
            method = %method,
            top_feature = %top_feature,
            score = score,
            "Job flagged as outlier"
        );
    }

    /// Log a retirement pass
    pub fn log_retirement(&self, jobs_deleted: usize, models_deleted: usize, dry_run: bool) {
        info!(
            event = "retirement",
            instance = %self.instance,
            jobs_deleted = jobs_deleted,
            models_deleted = models_deleted,
            dry_run = dry_run,
            "Retirement pass finished"
        );
    }

    /// Log daemon startup
    pub fn log_startup(&self, version: &str) {
        info!(
            event = "daemon_started",
            instance = %self.instance,
            version = %version,
            "Pipeline daemon started"
        );
    }

    /// Log daemon shutdown
    pub fn log_shutdown(&self, reason: &str) {
        info!(
            event = "daemon_shutdown",
            instance = %self.instance,
            reason = %reason,
            "Pipeline daemon shutting down"
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_pipeline_metrics_creation() {
        // Metrics register against the global Prometheus registry once per
        // process; this exercises the handle surface.
        let metrics = PipelineMetrics::new();

        metrics.observe_stage_latency("post_process", 0.05);
        metrics.inc_jobs_ingested();
        metrics.add_jobs_processed("analyze", 3);
        metrics.inc_archives_quarantined();
        metrics.add_files_quarantined(2);
        metrics.inc_outliers_detected();
        metrics.add_stage_failures("post_process", 1);
        metrics.set_staged_jobs(4);
        metrics.inc_daemon_iterations();
        metrics.inc_daemon_overruns();
    }

    #[test]
    fn test_structured_logger_creation() {
        let logger = StructuredLogger::new("epmtd-1");
        assert_eq!(logger.instance, "epmtd-1");
    }
}
