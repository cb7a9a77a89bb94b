//! In-memory storage backend
//!
//! Backs the whole store with one `RwLock`-guarded table set, which makes
//! every trait operation a single critical section and therefore an atomic
//! unit of work per job.

use super::{JobSelector, MetricStore, StoreError};
use crate::models::{Job, Process, ReferenceModel};
use crate::tags::encode_tags;
use async_trait::async_trait;
use std::collections::HashMap;
use tokio::sync::RwLock;

#[derive(Default)]
struct Inner {
    jobs: HashMap<String, Job>,
    procs: HashMap<String, Vec<Process>>,
    staged: HashMap<String, Vec<Process>>,
    models: HashMap<u64, ReferenceModel>,
    next_model_id: u64,
}

/// In-memory [`MetricStore`] implementation
#[derive(Default)]
pub struct MemoryStore {
    inner: RwLock<Inner>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }
}

fn order_processes(procs: &mut [Process]) {
    procs.sort_by(|a, b| match (a.start, b.start) {
        (None, None) => a.id.cmp(&b.id),
        (None, Some(_)) => std::cmp::Ordering::Less,
        (Some(_), None) => std::cmp::Ordering::Greater,
        (Some(x), Some(y)) => x.cmp(&y).then(a.id.cmp(&b.id)),
    });
}

#[async_trait]
impl MetricStore for MemoryStore {
    fn supports_concurrent_writers(&self) -> bool {
        true
    }

    async fn insert_job(
        &self,
        job: Job,
        procs: Vec<Process>,
        staged: bool,
    ) -> Result<(), StoreError> {
        let mut inner = self.inner.write().await;
        if inner.jobs.contains_key(&job.jobid) {
            return Err(StoreError::Duplicate(job.jobid));
        }
        let jobid = job.jobid.clone();
        inner.jobs.insert(jobid.clone(), job);
        if staged {
            inner.staged.insert(jobid, procs);
        } else {
            inner.procs.insert(jobid, procs);
        }
        Ok(())
    }

    async fn get_job(&self, jobid: &str) -> Result<Option<Job>, StoreError> {
        let inner = self.inner.read().await;
        Ok(inner.jobs.get(jobid).cloned())
    }

    async fn select_jobs(&self, selector: JobSelector) -> Result<Vec<String>, StoreError> {
        let inner = self.inner.read().await;
        let mut ids: Vec<String> = inner
            .jobs
            .values()
            .filter(|job| selector.matches(job))
            .map(|job| job.jobid.clone())
            .collect();
        ids.sort();
        Ok(ids)
    }

    async fn update_job(&self, job: Job) -> Result<(), StoreError> {
        let mut inner = self.inner.write().await;
        if !inner.jobs.contains_key(&job.jobid) {
            return Err(StoreError::JobNotFound(job.jobid));
        }
        inner.jobs.insert(job.jobid.clone(), job);
        Ok(())
    }

    async fn update_job_with_processes(
        &self,
        job: Job,
        mut procs: Vec<Process>,
    ) -> Result<(), StoreError> {
        let mut inner = self.inner.write().await;
        if !inner.jobs.contains_key(&job.jobid) {
            return Err(StoreError::JobNotFound(job.jobid));
        }
        order_processes(&mut procs);
        let jobid = job.jobid.clone();
        inner.jobs.insert(jobid.clone(), job);
        inner.staged.remove(&jobid);
        inner.procs.insert(jobid, procs);
        Ok(())
    }

    async fn fetch_processes(&self, jobid: &str) -> Result<Vec<Process>, StoreError> {
        let inner = self.inner.read().await;
        if !inner.jobs.contains_key(jobid) {
            return Err(StoreError::JobNotFound(jobid.to_string()));
        }
        let mut procs = inner.procs.get(jobid).cloned().unwrap_or_default();
        order_processes(&mut procs);
        Ok(procs)
    }

    async fn drain_staged(&self, jobid: &str) -> Result<Vec<Process>, StoreError> {
        let mut inner = self.inner.write().await;
        if !inner.jobs.contains_key(jobid) {
            return Err(StoreError::JobNotFound(jobid.to_string()));
        }
        Ok(inner.staged.remove(jobid).unwrap_or_default())
    }

    async fn delete_jobs(&self, jobids: &[String]) -> Result<usize, StoreError> {
        let mut inner = self.inner.write().await;
        let mut deleted = 0;
        for jobid in jobids {
            if inner.jobs.remove(jobid).is_some() {
                inner.procs.remove(jobid);
                inner.staged.remove(jobid);
                deleted += 1;
            }
        }
        Ok(deleted)
    }

    async fn insert_model(&self, mut model: ReferenceModel) -> Result<u64, StoreError> {
        let mut inner = self.inner.write().await;
        inner.next_model_id += 1;
        let id = inner.next_model_id;
        model.id = id;
        inner.models.insert(id, model);
        Ok(id)
    }

    async fn get_model(&self, id: u64) -> Result<Option<ReferenceModel>, StoreError> {
        let inner = self.inner.read().await;
        Ok(inner.models.get(&id).cloned())
    }

    async fn find_model_by_signature(
        &self,
        signature: &str,
    ) -> Result<Option<ReferenceModel>, StoreError> {
        let inner = self.inner.read().await;
        Ok(inner
            .models
            .values()
            .filter(|model| encode_tags(&model.tags) == signature)
            .max_by_key(|model| model.id)
            .cloned())
    }

    async fn list_models(&self) -> Result<Vec<ReferenceModel>, StoreError> {
        let inner = self.inner.read().await;
        let mut models: Vec<ReferenceModel> = inner.models.values().cloned().collect();
        models.sort_by_key(|m| m.id);
        Ok(models)
    }

    async fn models_using_job(&self, jobid: &str) -> Result<Vec<u64>, StoreError> {
        let inner = self.inner.read().await;
        let mut ids: Vec<u64> = inner
            .models
            .values()
            .filter(|model| model.jobids.contains(jobid))
            .map(|model| model.id)
            .collect();
        ids.sort_unstable();
        Ok(ids)
    }

    async fn delete_models(&self, ids: &[u64]) -> Result<usize, StoreError> {
        let mut inner = self.inner.write().await;
        let mut deleted = 0;
        for id in ids {
            if inner.models.remove(id).is_some() {
                deleted += 1;
            }
        }
        Ok(deleted)
    }
}
