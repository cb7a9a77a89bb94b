//! Job lifecycle orchestration
//!
//! Drives jobs through ingest -> post-process -> analyze -> retire. Each
//! stage processes a batch of jobs independently: a failing job is logged,
//! left in its prior state, and never aborts the rest of the batch.

use crate::ingest::{IngestReport, Ingester};
use crate::models::{Job, JobAnalysis, ReferenceModel};
use crate::observability::{PipelineMetrics, StructuredLogger};
use crate::proctree::build_tree;
use crate::stats::{build_model, rank_features, score_job, OutlierConfig, StatsError};
use crate::store::{JobSelector, MetricStore};
use crate::tags::encode_tags;
use anyhow::{anyhow, Context, Result};
use chrono::Utc;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Instant;
use tracing::{debug, error, info, warn};

/// Age thresholds for retirement, in days; 0 disables a class
#[derive(Debug, Clone)]
pub struct RetentionConfig {
    pub retire_jobs_after_days: f64,
    pub retire_models_after_days: f64,
}

impl Default for RetentionConfig {
    fn default() -> Self {
        Self {
            retire_jobs_after_days: 0.0,
            retire_models_after_days: 0.0,
        }
    }
}

/// Outcome of one stage over a batch of jobs
#[derive(Debug)]
pub struct StageSummary {
    pub stage: &'static str,
    /// Jobs the stage was asked to (or chose to) process
    pub attempted: Vec<String>,
    /// Jobs that completed the stage, including idempotent no-ops
    pub succeeded: Vec<String>,
}

impl StageSummary {
    fn new(stage: &'static str, attempted: Vec<String>) -> Self {
        Self {
            stage,
            attempted,
            succeeded: Vec::new(),
        }
    }

    /// Jobs that should have advanced but did not
    pub fn failed(&self) -> Vec<String> {
        self.attempted
            .iter()
            .filter(|id| !self.succeeded.contains(id))
            .cloned()
            .collect()
    }
}

/// Outcome of a retirement pass
#[derive(Debug, Default)]
pub struct RetireSummary {
    pub dry_run: bool,
    /// Jobs eligible (and, unless dry-run, deleted)
    pub jobs: Vec<String>,
    /// Models eligible (and, unless dry-run, deleted)
    pub models: Vec<u64>,
    pub jobs_deleted: usize,
    pub models_deleted: usize,
}

/// Sequences jobs through their lifecycle stages
pub struct Orchestrator {
    store: Arc<dyn MetricStore>,
    outlier: OutlierConfig,
    retention: RetentionConfig,
    metrics: PipelineMetrics,
    logger: StructuredLogger,
}

impl Orchestrator {
    pub fn new(
        store: Arc<dyn MetricStore>,
        outlier: OutlierConfig,
        retention: RetentionConfig,
    ) -> Self {
        let instance =
            std::env::var("EPMT_INSTANCE").unwrap_or_else(|_| "epmtd".to_string());
        Self {
            store,
            outlier,
            retention,
            metrics: PipelineMetrics::new(),
            logger: StructuredLogger::new(instance),
        }
    }

    pub fn store(&self) -> Arc<dyn MetricStore> {
        Arc::clone(&self.store)
    }

    /// Submit archives, then post-process the newly ingested jobs when the
    /// ingest configuration asks for it
    pub async fn ingest(&self, ingester: &Arc<Ingester>, paths: &[PathBuf]) -> IngestReport {
        let report = ingester.submit_archives(paths).await;
        for (path, reason) in &report.failed {
            error!(path = %path.display(), reason = %reason, "Archive submission failed");
        }
        if ingester.config().post_process && !report.succeeded.is_empty() {
            self.post_process(Some(&report.succeeded), false).await;
        }
        report
    }

    /// Build process trees and aggregate sums for a batch of jobs
    ///
    /// With no explicit ids, every staged job is processed. Re-invoking on
    /// an already post-processed job is a no-op success unless forced.
    pub async fn post_process(&self, jobids: Option<&[String]>, force: bool) -> StageSummary {
        let started = Instant::now();
        let attempted = self.batch(jobids, JobSelector::Staged).await;
        let mut summary = StageSummary::new("post_process", attempted);
        for jobid in summary.attempted.clone() {
            match self.post_process_job(&jobid, force).await {
                Ok(()) => summary.succeeded.push(jobid),
                Err(e) => warn!(jobid = %jobid, error = %e, "Post-processing failed"),
            }
        }
        self.finish_stage(&summary, started);
        summary
    }

    async fn post_process_job(&self, jobid: &str, force: bool) -> Result<()> {
        let mut job = self.fetch_job(jobid).await?;
        if job.is_post_processed && !force {
            debug!(jobid = %jobid, "Already post-processed, skipping");
            return Ok(());
        }

        let mut procs = self.store.drain_staged(jobid).await?;
        if procs.is_empty() {
            procs = self.store.fetch_processes(jobid).await?;
        }
        let sums = build_tree(&mut procs).context("tree construction failed")?;

        if job.start.is_none() {
            job.start = procs.iter().filter_map(|p| p.start).min();
        }
        if job.end.is_none() {
            job.end = procs.iter().filter_map(|p| p.end).max();
        }
        job.proc_sums = Some(sums);
        job.is_staged = true;
        job.is_post_processed = true;
        job.updated_at = Utc::now();
        self.store.update_job_with_processes(job, procs).await?;
        Ok(())
    }

    /// Score a batch of jobs against their tag class's reference model
    pub async fn analyze(&self, jobids: Option<&[String]>, force: bool) -> StageSummary {
        let started = Instant::now();
        let attempted = self.batch(jobids, JobSelector::Unanalyzed).await;
        let mut summary = StageSummary::new("analyze", attempted);
        for jobid in summary.attempted.clone() {
            match self.analyze_job(&jobid, force).await {
                Ok(()) => summary.succeeded.push(jobid),
                Err(e) => warn!(jobid = %jobid, error = %e, "Analysis failed"),
            }
        }
        self.finish_stage(&summary, started);
        summary
    }

    async fn analyze_job(&self, jobid: &str, force: bool) -> Result<()> {
        let mut job = self.fetch_job(jobid).await?;
        if job.is_analyzed && !force {
            debug!(jobid = %jobid, "Already analyzed, skipping");
            return Ok(());
        }
        if !job.is_post_processed {
            return Err(StatsError::NotPostProcessed(job.jobid.clone()).into());
        }

        let model = self.find_or_build_model(&job).await?;
        let verdicts = score_job(&job, &model, &self.outlier)?;
        let report = rank_features(&job, &model)?;

        let outlier_methods: Vec<&str> = verdicts
            .iter()
            .filter(|v| v.is_outlier)
            .map(|v| v.method.as_str())
            .collect();
        if !outlier_methods.is_empty() {
            self.metrics.inc_outliers_detected();
            if let Some((feature, score)) = report.ranking.first() {
                for method in &outlier_methods {
                    self.logger.log_outlier(jobid, method, feature, *score);
                }
            }
        }

        job.analysis = Some(JobAnalysis {
            model_ids: vec![model.id],
            verdicts,
            root_cause: report.ranking,
            analyzed_at: Utc::now(),
        });
        job.is_analyzed = true;
        job.updated_at = Utc::now();
        self.store.update_job(job).await?;
        Ok(())
    }

    /// Look up the reference model for the job's tag class, building it on
    /// demand from the post-processed population with the same tags
    async fn find_or_build_model(&self, job: &Job) -> Result<ReferenceModel> {
        let signature = encode_tags(&job.tags);
        if let Some(model) = self.store.find_model_by_signature(&signature).await? {
            debug!(model = model.id, signature = %signature, "Reusing reference model");
            return Ok(model);
        }

        let mut population = Vec::new();
        for jobid in self.store.select_jobs(JobSelector::All).await? {
            if jobid == job.jobid {
                continue;
            }
            if let Some(other) = self.store.get_job(&jobid).await? {
                if other.is_post_processed && encode_tags(&other.tags) == signature {
                    population.push(other);
                }
            }
        }
        if population.len() < self.outlier.min_reference_jobs {
            return Err(StatsError::PopulationTooSmall {
                needed: self.outlier.min_reference_jobs,
                got: population.len(),
            }
            .into());
        }

        let refs: Vec<&Job> = population.iter().collect();
        let mut model = build_model(
            0,
            signature.clone(),
            job.tags.clone(),
            &refs,
            &self.outlier.features,
            &self.outlier,
        )?;
        model.id = self.store.insert_model(model.clone()).await?;
        Ok(model)
    }

    /// Retire jobs and reference models past their age thresholds
    ///
    /// A job still referenced by a surviving model is never deleted; it
    /// becomes eligible once the model retires in the same (or an earlier)
    /// pass. `dry_run` counts without deleting.
    pub async fn retire(&self, dry_run: bool) -> Result<RetireSummary> {
        let now = Utc::now();
        let mut summary = RetireSummary {
            dry_run,
            ..Default::default()
        };

        if self.retention.retire_models_after_days > 0.0 {
            for model in self.store.list_models().await? {
                if model.age_days(now) > self.retention.retire_models_after_days {
                    summary.models.push(model.id);
                }
            }
        }

        if self.retention.retire_jobs_after_days > 0.0 {
            for jobid in self.store.select_jobs(JobSelector::All).await? {
                let job = match self.store.get_job(&jobid).await? {
                    Some(job) => job,
                    None => continue,
                };
                if job.age_days(now) <= self.retention.retire_jobs_after_days {
                    continue;
                }
                let referencing = self.store.models_using_job(&jobid).await?;
                let blocking: Vec<u64> = referencing
                    .into_iter()
                    .filter(|id| !summary.models.contains(id))
                    .collect();
                if blocking.is_empty() {
                    summary.jobs.push(jobid);
                } else {
                    info!(
                        jobid = %jobid,
                        models = ?blocking,
                        "Retirement blocked by surviving reference models"
                    );
                }
            }
        }

        if dry_run {
            self.logger
                .log_retirement(summary.jobs.len(), summary.models.len(), true);
            return Ok(summary);
        }

        summary.models_deleted = self.store.delete_models(&summary.models).await?;
        summary.jobs_deleted = self.store.delete_jobs(&summary.jobs).await?;
        self.logger
            .log_retirement(summary.jobs_deleted, summary.models_deleted, false);
        Ok(summary)
    }

    fn finish_stage(&self, summary: &StageSummary, started: Instant) {
        let failed = summary.attempted.len() - summary.succeeded.len();
        self.metrics
            .observe_stage_latency(summary.stage, started.elapsed().as_secs_f64());
        self.metrics
            .add_jobs_processed(summary.stage, summary.succeeded.len() as u64);
        if failed > 0 {
            self.metrics.add_stage_failures(summary.stage, failed as u64);
        }
        self.logger.log_stage_summary(
            summary.stage,
            summary.attempted.len(),
            summary.succeeded.len(),
        );
    }

    async fn batch(&self, jobids: Option<&[String]>, selector: JobSelector) -> Vec<String> {
        match jobids {
            Some(ids) => ids.to_vec(),
            None => match self.store.select_jobs(selector).await {
                Ok(ids) => ids,
                Err(e) => {
                    error!(error = %e, "Failed to select jobs for stage");
                    Vec::new()
                }
            },
        }
    }

    async fn fetch_job(&self, jobid: &str) -> Result<Job> {
        self.store
            .get_job(jobid)
            .await?
            .ok_or_else(|| anyhow!("job {} not found", jobid))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::Process;
    use crate::store::MemoryStore;
    use chrono::{Duration, TimeZone};

    fn proc(id: u64, jobid: &str, pid: u32, ppid: u32, start: i64, cpu: f64) -> Process {
        let mut p = Process::new(id, jobid);
        p.pid = pid;
        p.ppid = ppid;
        p.host = "nodeA".to_string();
        p.start = Some(Utc.timestamp_opt(start, 0).unwrap());
        p.end = Some(Utc.timestamp_opt(start + 60, 0).unwrap());
        p.threads_sums.insert("usertime".to_string(), cpu);
        p
    }

    fn staged_job(jobid: &str, tag: &str) -> Job {
        let mut job = Job::new(jobid);
        job.is_staged = true;
        job.tags.insert("exp".to_string(), tag.to_string());
        job
    }

    fn orchestrator(store: Arc<MemoryStore>) -> Orchestrator {
        let outlier = OutlierConfig {
            min_reference_jobs: 3,
            features: vec!["duration".to_string(), "cpu_time".to_string()],
            ..Default::default()
        };
        Orchestrator::new(store, outlier, RetentionConfig::default())
    }

    async fn seed_staged(store: &Arc<MemoryStore>, jobid: &str, tag: &str, cpu: f64) {
        let procs = vec![
            proc(1, jobid, 100, 1, 1000, cpu),
            proc(2, jobid, 200, 100, 1010, cpu / 2.0),
        ];
        store
            .insert_job(staged_job(jobid, tag), procs, true)
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn test_post_process_builds_sums() {
        let store = Arc::new(MemoryStore::new());
        seed_staged(&store, "1", "a", 4.0).await;
        let orch = orchestrator(store.clone());

        let summary = orch.post_process(None, false).await;
        assert_eq!(summary.succeeded, vec!["1"]);
        assert!(summary.failed().is_empty());

        let job = store.get_job("1").await.unwrap().unwrap();
        assert!(job.is_post_processed);
        let sums = job.proc_sums.unwrap();
        assert_eq!(sums.num_procs, 2);
        assert_eq!(sums.metrics.get("cpu_time"), Some(&6.0));

        let procs = store.fetch_processes("1").await.unwrap();
        let root = procs.iter().find(|p| p.pid == 100).unwrap();
        assert_eq!(root.inclusive_cpu_time, Some(6.0));
    }

    #[tokio::test]
    async fn test_post_process_idempotent_without_force() {
        let store = Arc::new(MemoryStore::new());
        seed_staged(&store, "1", "a", 4.0).await;
        let orch = orchestrator(store.clone());

        orch.post_process(None, false).await;
        let before = store.get_job("1").await.unwrap().unwrap().updated_at;

        // Second pass reports success without recomputing
        let summary = orch.post_process(Some(&["1".to_string()]), false).await;
        assert_eq!(summary.succeeded, vec!["1"]);
        let after = store.get_job("1").await.unwrap().unwrap().updated_at;
        assert_eq!(before, after);
    }

    #[tokio::test]
    async fn test_one_bad_job_does_not_block_batch() {
        let store = Arc::new(MemoryStore::new());
        seed_staged(&store, "good", "a", 4.0).await;
        // Self-parented process: integrity error for this job only
        store
            .insert_job(
                staged_job("bad", "a"),
                vec![proc(1, "bad", 100, 100, 1000, 1.0)],
                true,
            )
            .await
            .unwrap();
        let orch = orchestrator(store.clone());

        let summary = orch.post_process(None, false).await;
        assert_eq!(summary.succeeded, vec!["good"]);
        assert_eq!(summary.failed(), vec!["bad"]);

        let bad = store.get_job("bad").await.unwrap().unwrap();
        assert!(!bad.is_post_processed, "failed job stays in prior state");
    }

    #[tokio::test]
    async fn test_analyze_builds_model_on_demand() {
        let store = Arc::new(MemoryStore::new());
        for i in 0..3 {
            seed_staged(&store, &format!("ref{}", i), "a", 4.0 + i as f64).await;
        }
        seed_staged(&store, "candidate", "a", 400.0).await;
        let orch = orchestrator(store.clone());
        orch.post_process(None, false).await;

        let summary = orch.analyze(Some(&["candidate".to_string()]), false).await;
        assert_eq!(summary.succeeded, vec!["candidate"]);

        let job = store.get_job("candidate").await.unwrap().unwrap();
        assert!(job.is_analyzed);
        let analysis = job.analysis.unwrap();
        assert_eq!(analysis.model_ids.len(), 1);
        assert!(!analysis.root_cause.is_empty());

        let model = store.get_model(analysis.model_ids[0]).await.unwrap().unwrap();
        assert_eq!(model.jobids.len(), 3);
        assert!(!model.jobids.contains("candidate"));
    }

    #[tokio::test]
    async fn test_analyze_reuses_existing_model() {
        let store = Arc::new(MemoryStore::new());
        for i in 0..3 {
            seed_staged(&store, &format!("ref{}", i), "a", 4.0 + i as f64).await;
        }
        seed_staged(&store, "c1", "a", 10.0).await;
        seed_staged(&store, "c2", "a", 11.0).await;
        let orch = orchestrator(store.clone());
        orch.post_process(None, false).await;

        orch.analyze(Some(&["c1".to_string()]), false).await;
        orch.analyze(Some(&["c2".to_string()]), false).await;

        assert_eq!(store.list_models().await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_analyze_small_population_is_reported_failure() {
        let store = Arc::new(MemoryStore::new());
        seed_staged(&store, "lonely", "unique-tag", 4.0).await;
        let orch = orchestrator(store.clone());
        orch.post_process(None, false).await;

        let summary = orch.analyze(None, false).await;
        assert_eq!(summary.failed(), vec!["lonely"]);
        let job = store.get_job("lonely").await.unwrap().unwrap();
        assert!(!job.is_analyzed, "failed job stays in prior state");
    }

    async fn age_job(store: &Arc<MemoryStore>, jobid: &str, days: i64) {
        let mut job = store.get_job(jobid).await.unwrap().unwrap();
        job.end = Some(Utc::now() - Duration::days(days));
        store.update_job(job).await.unwrap();
    }

    #[tokio::test]
    async fn test_retirement_guard_and_release() {
        let store = Arc::new(MemoryStore::new());
        for i in 0..3 {
            seed_staged(&store, &format!("ref{}", i), "a", 4.0 + i as f64).await;
        }
        seed_staged(&store, "candidate", "a", 10.0).await;
        let outlier = OutlierConfig {
            min_reference_jobs: 3,
            features: vec!["duration".to_string()],
            ..Default::default()
        };
        let retention = RetentionConfig {
            retire_jobs_after_days: 30.0,
            retire_models_after_days: 0.0,
        };
        let orch = Orchestrator::new(store.clone(), outlier, retention);
        orch.post_process(None, false).await;
        orch.analyze(Some(&["candidate".to_string()]), false).await;

        // All reference jobs well past the threshold; the candidate is fresh
        for i in 0..3 {
            age_job(&store, &format!("ref{}", i), 90).await;
        }
        age_job(&store, "candidate", 0).await;

        let summary = orch.retire(false).await.unwrap();
        assert_eq!(summary.jobs_deleted, 0, "model-referenced jobs survive");

        // Remove the model; the same pass now deletes the jobs
        let models = store.list_models().await.unwrap();
        store
            .delete_models(&models.iter().map(|m| m.id).collect::<Vec<_>>())
            .await
            .unwrap();
        let summary = orch.retire(false).await.unwrap();
        assert_eq!(summary.jobs_deleted, 3);
    }

    #[tokio::test]
    async fn test_retire_dry_run_counts_only() {
        let store = Arc::new(MemoryStore::new());
        seed_staged(&store, "old", "a", 4.0).await;
        let retention = RetentionConfig {
            retire_jobs_after_days: 30.0,
            retire_models_after_days: 0.0,
        };
        let orch = Orchestrator::new(store.clone(), OutlierConfig::default(), retention);
        orch.post_process(None, false).await;
        age_job(&store, "old", 90).await;

        let summary = orch.retire(true).await.unwrap();
        assert_eq!(summary.jobs, vec!["old"]);
        assert_eq!(summary.jobs_deleted, 0);
        assert!(store.get_job("old").await.unwrap().is_some());
    }

    #[tokio::test]
    async fn test_retire_disabled_when_threshold_zero() {
        let store = Arc::new(MemoryStore::new());
        seed_staged(&store, "old", "a", 4.0).await;
        let orch = orchestrator(store.clone());
        orch.post_process(None, false).await;
        age_job(&store, "old", 3650).await;

        let summary = orch.retire(false).await.unwrap();
        assert!(summary.jobs.is_empty());
        assert!(store.get_job("old").await.unwrap().is_some());
    }

    #[tokio::test]
    async fn test_model_retirement_by_age() {
        let store = Arc::new(MemoryStore::new());
        for i in 0..3 {
            seed_staged(&store, &format!("ref{}", i), "a", 4.0 + i as f64).await;
        }
        seed_staged(&store, "candidate", "a", 10.0).await;
        let outlier = OutlierConfig {
            min_reference_jobs: 3,
            features: vec!["duration".to_string()],
            ..Default::default()
        };
        let retention = RetentionConfig {
            retire_jobs_after_days: 0.0,
            retire_models_after_days: 30.0,
        };
        let orch = Orchestrator::new(store.clone(), outlier, retention);
        orch.post_process(None, false).await;
        orch.analyze(Some(&["candidate".to_string()]), false).await;

        // Backdate the model past its threshold
        let mut models = store.list_models().await.unwrap();
        let mut model = models.remove(0);
        model.created_at = Utc::now() - Duration::days(90);
        let old_id = model.id;
        store.delete_models(&[old_id]).await.unwrap();
        let new_id = store.insert_model(model).await.unwrap();

        let summary = orch.retire(false).await.unwrap();
        assert_eq!(summary.models, vec![new_id]);
        assert_eq!(summary.models_deleted, 1);
    }
}
