//! Core data models for the job performance pipeline

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};

/// Free-form tag set, serialized as `key1:value1;key2:value2`
pub type TagMap = BTreeMap<String, String>;

/// Lifecycle state of a job, derived from its stage flags
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LifecycleState {
    /// Submitted but raw processes not yet loaded
    Unprocessed,
    /// Raw processes loaded, tree not yet built
    Staged,
    /// Tree built, aggregate sums populated
    PostProcessed,
    /// Outlier/root-cause results attached
    Analyzed,
    /// Eligible for deletion per age policy
    Retired,
}

/// One monitored batch/interactive execution
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Job {
    /// External scheduler job id
    pub jobid: String,
    pub submit: Option<DateTime<Utc>>,
    pub start: Option<DateTime<Utc>>,
    pub end: Option<DateTime<Utc>>,
    pub exitcode: i32,
    pub tags: TagMap,
    /// Environment snapshot captured at submission
    pub env: BTreeMap<String, String>,
    /// Environment delta against the submitting shell
    pub env_changes: BTreeMap<String, String>,
    /// Aggregate metrics over all processes; unset until post-processing
    pub proc_sums: Option<ProcSums>,
    pub is_staged: bool,
    pub is_post_processed: bool,
    pub is_analyzed: bool,
    pub is_retired: bool,
    /// Outlier/root-cause results from the last analysis pass
    pub analysis: Option<JobAnalysis>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Job {
    /// Create a freshly submitted job with no stage flags set
    pub fn new(jobid: impl Into<String>) -> Self {
        let now = Utc::now();
        Self {
            jobid: jobid.into(),
            submit: None,
            start: None,
            end: None,
            exitcode: 0,
            tags: TagMap::new(),
            env: BTreeMap::new(),
            env_changes: BTreeMap::new(),
            proc_sums: None,
            is_staged: false,
            is_post_processed: false,
            is_analyzed: false,
            is_retired: false,
            analysis: None,
            created_at: now,
            updated_at: now,
        }
    }

    /// Derive the lifecycle state from the stage flags
    pub fn state(&self) -> LifecycleState {
        if self.is_retired {
            LifecycleState::Retired
        } else if self.is_analyzed {
            LifecycleState::Analyzed
        } else if self.is_post_processed {
            LifecycleState::PostProcessed
        } else if self.is_staged {
            LifecycleState::Staged
        } else {
            LifecycleState::Unprocessed
        }
    }

    /// Wall-clock duration in seconds, when both endpoints are known
    pub fn duration_secs(&self) -> Option<f64> {
        match (self.start, self.end) {
            (Some(s), Some(e)) => Some((e - s).num_milliseconds() as f64 / 1000.0),
            _ => None,
        }
    }

    /// Age in days from the job's end (falling back to creation time)
    pub fn age_days(&self, now: DateTime<Utc>) -> f64 {
        let anchor = self.end.unwrap_or(self.created_at);
        (now - anchor).num_seconds().max(0) as f64 / 86_400.0
    }
}

/// Aggregate metrics rolled up from a job's processes
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ProcSums {
    /// Sum of each numeric per-process metric across the job
    pub metrics: BTreeMap<String, f64>,
    pub num_procs: usize,
    pub num_hosts: usize,
    /// De-duplicated, sorted tag sets collected across processes
    pub all_proc_tags: Vec<TagMap>,
}

/// One OS process observed during a job
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Process {
    /// Per-job-unique id (arena index, not the OS pid)
    pub id: u64,
    pub jobid: String,
    pub host: String,
    pub exename: String,
    pub path: String,
    pub args: String,
    pub pid: u32,
    pub ppid: u32,
    pub pgid: u32,
    pub sid: u32,
    /// Generation counter as reported by the collector
    pub gen: u32,
    /// Depth in the reconstructed forest (roots are 0)
    pub depth: u32,
    pub numtids: u32,
    pub start: Option<DateTime<Utc>>,
    pub end: Option<DateTime<Utc>>,
    pub exitcode: i32,
    pub tags: TagMap,
    /// Per-process metric totals summed over the process's thread rows
    pub threads_sums: BTreeMap<String, f64>,
    /// Exclusive CPU time (own threads only); set by post-processing
    pub cpu_time: Option<f64>,
    /// Own cost plus the inclusive cost of all descendants
    pub inclusive_cpu_time: Option<f64>,
    pub parent_id: Option<u64>,
    pub children_ids: BTreeSet<u64>,
    pub ancestor_ids: BTreeSet<u64>,
    pub descendant_ids: BTreeSet<u64>,
}

impl Process {
    pub fn new(id: u64, jobid: impl Into<String>) -> Self {
        Self {
            id,
            jobid: jobid.into(),
            host: String::new(),
            exename: String::new(),
            path: String::new(),
            args: String::new(),
            pid: 0,
            ppid: 0,
            pgid: 0,
            sid: 0,
            gen: 0,
            depth: 0,
            numtids: 0,
            start: None,
            end: None,
            exitcode: 0,
            tags: TagMap::new(),
            threads_sums: BTreeMap::new(),
            cpu_time: None,
            inclusive_cpu_time: None,
            parent_id: None,
            children_ids: BTreeSet::new(),
            ancestor_ids: BTreeSet::new(),
            descendant_ids: BTreeSet::new(),
        }
    }
}

/// Per-feature descriptive statistics captured at model creation
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FeatureStats {
    pub count: usize,
    pub mean: f64,
    /// Population standard deviation (not sample-corrected)
    pub std: f64,
    pub min: f64,
    pub max: f64,
    pub median: f64,
    /// Median absolute deviation
    pub mad: f64,
    /// Lower IQR anchor percentile value
    pub q_low: f64,
    /// Upper IQR anchor percentile value
    pub q_high: f64,
}

/// A named statistical snapshot of a job population
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReferenceModel {
    pub id: u64,
    pub name: String,
    /// Tag filter that selected the population
    pub tags: TagMap,
    /// Jobs the model was trained on
    pub jobids: BTreeSet<String>,
    pub features: Vec<String>,
    pub stats: BTreeMap<String, FeatureStats>,
    pub created_at: DateTime<Utc>,
}

impl ReferenceModel {
    /// Age in days since creation
    pub fn age_days(&self, now: DateTime<Utc>) -> f64 {
        (now - self.created_at).num_seconds().max(0) as f64 / 86_400.0
    }
}

/// Outcome of one outlier method over a job's features
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MethodVerdict {
    pub method: String,
    /// Per-feature score and flag
    pub features: Vec<FeatureFlag>,
    /// True if any non-blacklisted feature was flagged
    pub is_outlier: bool,
}

/// One feature's score under one outlier method
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FeatureFlag {
    pub feature: String,
    pub score: f64,
    pub flagged: bool,
}

/// Results attached to a job by the analyze stage
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JobAnalysis {
    /// Weak references to the reference models used (id, never ownership)
    pub model_ids: Vec<u64>,
    pub verdicts: Vec<MethodVerdict>,
    /// Root-cause ranking, sorted descending by score
    pub root_cause: Vec<(String, f64)>,
    pub analyzed_at: DateTime<Utc>,
}
