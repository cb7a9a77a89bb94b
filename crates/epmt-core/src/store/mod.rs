//! Storage collaborator for jobs, processes, and reference models
//!
//! The pipeline only ever talks to the [`MetricStore`] capability trait;
//! nothing outside this module names a concrete backend. Mutations are
//! scoped per job (or per archive) so a crash mid-stage leaves the job in
//! its prior state rather than partially updated.

mod memory;

pub use memory::MemoryStore;

use crate::models::{Job, Process, ReferenceModel};
use async_trait::async_trait;
use thiserror::Error;

/// Storage failures
#[derive(Debug, Error)]
pub enum StoreError {
    #[error("job {0} already exists")]
    Duplicate(String),
    #[error("job {0} not found")]
    JobNotFound(String),
    #[error("reference model {0} not found")]
    ModelNotFound(u64),
    #[error("storage unavailable: {0}")]
    Unavailable(String),
}

/// Job selection by lifecycle state
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum JobSelector {
    All,
    /// Submitted, raw processes not yet loaded
    Unprocessed,
    /// Processes loaded, tree not yet built
    Staged,
    /// Post-processed but not yet analyzed
    Unanalyzed,
    /// Analyzed and not retired
    Analyzed,
}

impl JobSelector {
    pub fn matches(&self, job: &Job) -> bool {
        match self {
            JobSelector::All => true,
            JobSelector::Unprocessed => !job.is_staged && !job.is_post_processed,
            JobSelector::Staged => job.is_staged && !job.is_post_processed,
            JobSelector::Unanalyzed => job.is_post_processed && !job.is_analyzed,
            JobSelector::Analyzed => job.is_analyzed && !job.is_retired,
        }
    }
}

/// Capability interface over durable job/process/model storage
#[async_trait]
pub trait MetricStore: Send + Sync {
    /// Whether multiple submissions may write concurrently; ingestion
    /// clamps its worker count to 1 when this is false
    fn supports_concurrent_writers(&self) -> bool {
        false
    }

    /// Insert a new job and its processes in one atomic unit
    ///
    /// Processes land in the staging table when `staged` is set, the
    /// process table otherwise. A job id that already exists is a
    /// `Duplicate` error.
    async fn insert_job(
        &self,
        job: Job,
        procs: Vec<Process>,
        staged: bool,
    ) -> Result<(), StoreError>;

    async fn get_job(&self, jobid: &str) -> Result<Option<Job>, StoreError>;

    /// Ids of jobs matching the selector, sorted for determinism
    async fn select_jobs(&self, selector: JobSelector) -> Result<Vec<String>, StoreError>;

    async fn update_job(&self, job: Job) -> Result<(), StoreError>;

    /// Replace a job's processes and update the job record atomically
    async fn update_job_with_processes(
        &self,
        job: Job,
        procs: Vec<Process>,
    ) -> Result<(), StoreError>;

    /// Processes of a job, ordered by `(start, id)`
    async fn fetch_processes(&self, jobid: &str) -> Result<Vec<Process>, StoreError>;

    /// Remove and return the job's staged processes (empty when none)
    async fn drain_staged(&self, jobid: &str) -> Result<Vec<Process>, StoreError>;

    /// Delete jobs and cascade their processes; returns the count deleted
    async fn delete_jobs(&self, jobids: &[String]) -> Result<usize, StoreError>;

    /// Insert a model, assigning and returning its id
    async fn insert_model(&self, model: ReferenceModel) -> Result<u64, StoreError>;

    async fn get_model(&self, id: u64) -> Result<Option<ReferenceModel>, StoreError>;

    /// Find a model by its tag signature (see [`crate::tags::encode_tags`])
    async fn find_model_by_signature(
        &self,
        signature: &str,
    ) -> Result<Option<ReferenceModel>, StoreError>;

    async fn list_models(&self) -> Result<Vec<ReferenceModel>, StoreError>;

    /// Ids of models trained on the given job
    async fn models_using_job(&self, jobid: &str) -> Result<Vec<u64>, StoreError>;

    /// Delete models by id; returns the count deleted
    async fn delete_models(&self, ids: &[u64]) -> Result<usize, StoreError>;
}
