//! Job-archive ingestion
//!
//! Submits `.tgz` job archives: unpack, collate the per-host counter files,
//! roll thread rows up into process records, and load the job into the
//! store in one atomic unit. Multiple archives may be submitted
//! concurrently up to a configured limit when the store supports
//! concurrent writers.

use crate::collate::{collate_dir, CollateConfig, CollateError};
use crate::models::{Job, Process};
use crate::observability::{PipelineMetrics, StructuredLogger};
use crate::store::{MetricStore, StoreError};
use crate::tags::{decode_tags, tags_from_env};
use chrono::{DateTime, TimeZone, Utc};
use dashmap::DashMap;
use flate2::read::GzDecoder;
use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use thiserror::Error;
use tokio::sync::Semaphore;
use tokio::task::JoinSet;
use tracing::{debug, info, warn};

/// Identifying columns preceding the counter columns, in wire order
pub const IDENT_COLUMNS: &[&str] = &[
    "tags", "hostname", "exename", "path", "args", "exitcode", "pid", "generation", "ppid",
    "pgid", "sid", "numtids",
];

/// Counter columns that must not be summed across thread rows
const NON_SUMMABLE: &[&str] = &["tid", "start", "end"];

/// Optional environment snapshot carried inside an archive
const ENV_FILE: &str = "job_env.json";

/// Optional environment delta carried inside an archive
const ENV_CHANGES_FILE: &str = "job_env_changes.json";

/// What to do with an archive that fails validation
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CorruptArchivePolicy {
    /// Leave the archive in place
    Keep,
    /// Delete the archive
    Remove,
    /// Move the archive into the quarantine directory
    Quarantine,
}

/// Ingestion settings
#[derive(Debug, Clone)]
pub struct IngestConfig {
    /// Working area for unpacked archives
    pub scratch_dir: PathBuf,
    /// Target directory for quarantined archives
    pub quarantine_dir: Option<PathBuf>,
    pub on_corrupt: CorruptArchivePolicy,
    /// Collect per-archive failures and keep going, or abort the call
    pub keep_going: bool,
    /// Re-ingest a job id that already exists
    pub force: bool,
    /// Trigger post-processing immediately after submission
    pub post_process: bool,
    /// Maximum concurrent archive submissions
    pub concurrency: usize,
    pub collate: CollateConfig,
}

impl Default for IngestConfig {
    fn default() -> Self {
        Self {
            scratch_dir: std::env::temp_dir().join("epmt-ingest"),
            quarantine_dir: None,
            on_corrupt: CorruptArchivePolicy::Keep,
            keep_going: true,
            force: false,
            post_process: false,
            concurrency: 1,
            collate: CollateConfig::default(),
        }
    }
}

/// Per-archive ingestion failures
#[derive(Debug, Error)]
pub enum IngestError {
    #[error("corrupted archive {path}: {reason}")]
    CorruptArchive { path: PathBuf, reason: String },
    #[error("archive {0} has no job id in its file name")]
    NoJobId(PathBuf),
    #[error("job {0} is already being submitted")]
    InFlight(String),
    #[error("collation failed: {0}")]
    Collate(#[from] CollateError),
    #[error("row {line}: {reason}")]
    RowParse { line: usize, reason: String },
    #[error("collated file is missing column {0}")]
    MissingColumn(String),
    #[error(transparent)]
    Store(#[from] StoreError),
    #[error("ingest I/O error: {0}")]
    Io(String),
}

/// Result of submitting one archive
#[derive(Debug)]
pub enum SubmitOutcome {
    Ingested { jobid: String, num_procs: usize },
    /// The job id already exists; submission is a retry-safe no-op
    AlreadyPresent(String),
}

/// Batch submission summary
#[derive(Debug, Default)]
pub struct IngestReport {
    pub succeeded: Vec<String>,
    pub already_present: Vec<String>,
    pub failed: Vec<(PathBuf, String)>,
    /// True when `keep_going=false` cut the batch short
    pub aborted: bool,
}

/// Archive submission engine
pub struct Ingester {
    store: Arc<dyn MetricStore>,
    config: IngestConfig,
    /// Guards against two concurrent submissions of the same job id
    in_flight: DashMap<String, ()>,
    metrics: PipelineMetrics,
    logger: StructuredLogger,
}

impl Ingester {
    pub fn new(store: Arc<dyn MetricStore>, config: IngestConfig) -> Self {
        let instance =
            std::env::var("EPMT_INSTANCE").unwrap_or_else(|_| "epmtd".to_string());
        Self {
            store,
            config,
            in_flight: DashMap::new(),
            metrics: PipelineMetrics::new(),
            logger: StructuredLogger::new(instance),
        }
    }

    pub fn config(&self) -> &IngestConfig {
        &self.config
    }

    /// Submit a batch of archives, bounded by the configured concurrency
    ///
    /// Concurrency is clamped to 1 when the store does not support
    /// concurrent writers, and the batch runs sequentially under
    /// `keep_going=false` so the abort point is deterministic.
    pub async fn submit_archives(self: &Arc<Self>, paths: &[PathBuf]) -> IngestReport {
        let mut report = IngestReport::default();
        let workers = if self.store.supports_concurrent_writers() {
            self.config.concurrency.max(1)
        } else {
            1
        };

        if workers == 1 || !self.config.keep_going {
            for (idx, path) in paths.iter().enumerate() {
                match self.submit_archive(path).await {
                    Ok(SubmitOutcome::Ingested { jobid, .. }) => report.succeeded.push(jobid),
                    Ok(SubmitOutcome::AlreadyPresent(jobid)) => {
                        report.already_present.push(jobid);
                        if !self.config.keep_going && idx + 1 < paths.len() {
                            warn!("Existing job aborts remaining archives in this call");
                            report.aborted = true;
                            break;
                        }
                    }
                    Err(e) => {
                        report.failed.push((path.clone(), e.to_string()));
                        if !self.config.keep_going && idx + 1 < paths.len() {
                            report.aborted = true;
                            break;
                        }
                    }
                }
            }
            return report;
        }

        let semaphore = Arc::new(Semaphore::new(workers));
        let mut tasks = JoinSet::new();
        for path in paths {
            let ingester = Arc::clone(self);
            let semaphore = Arc::clone(&semaphore);
            let path = path.clone();
            tasks.spawn(async move {
                let _permit = semaphore.acquire().await.ok();
                let outcome = ingester.submit_archive(&path).await;
                (path, outcome)
            });
        }
        while let Some(joined) = tasks.join_next().await {
            match joined {
                Ok((_, Ok(SubmitOutcome::Ingested { jobid, .. }))) => {
                    report.succeeded.push(jobid)
                }
                Ok((_, Ok(SubmitOutcome::AlreadyPresent(jobid)))) => {
                    report.already_present.push(jobid)
                }
                Ok((path, Err(e))) => report.failed.push((path, e.to_string())),
                Err(e) => warn!(error = %e, "Submission task panicked"),
            }
        }
        report.succeeded.sort();
        report.already_present.sort();
        report
    }

    /// Submit one archive
    pub async fn submit_archive(&self, path: &Path) -> Result<SubmitOutcome, IngestError> {
        let jobid = jobid_from_archive(path).ok_or_else(|| IngestError::NoJobId(path.into()))?;

        if self.in_flight.insert(jobid.clone(), ()).is_some() {
            return Err(IngestError::InFlight(jobid));
        }
        let result = self.submit_inner(path, &jobid).await;
        self.in_flight.remove(&jobid);
        result
    }

    async fn submit_inner(&self, path: &Path, jobid: &str) -> Result<SubmitOutcome, IngestError> {
        if self.store.get_job(jobid).await?.is_some() {
            if self.config.force {
                info!(jobid = %jobid, "Replacing existing job (forced)");
                self.store.delete_jobs(&[jobid.to_string()]).await?;
            } else {
                info!(jobid = %jobid, "Job already present, skipping archive");
                return Ok(SubmitOutcome::AlreadyPresent(jobid.to_string()));
            }
        }

        let unpack_dir = self.config.scratch_dir.join(format!("{}.unpack", jobid));
        let _ = fs::remove_dir_all(&unpack_dir);
        if let Err(e) = self.unpack(path, &unpack_dir) {
            self.apply_corrupt_policy(path);
            return Err(e);
        }

        let result = self.load_unpacked(&unpack_dir, jobid).await;
        let _ = fs::remove_dir_all(&unpack_dir);
        match result {
            Ok((num_procs, staged)) => {
                self.metrics.inc_jobs_ingested();
                self.logger.log_submission(jobid, num_procs, staged);
                Ok(SubmitOutcome::Ingested {
                    jobid: jobid.to_string(),
                    num_procs,
                })
            }
            Err(e) => {
                // Validation failures count as a corrupted archive
                if matches!(
                    e,
                    IngestError::CorruptArchive { .. }
                        | IngestError::Collate(_)
                        | IngestError::RowParse { .. }
                        | IngestError::MissingColumn(_)
                ) {
                    self.apply_corrupt_policy(path);
                }
                Err(e)
            }
        }
    }

    fn unpack(&self, path: &Path, unpack_dir: &Path) -> Result<(), IngestError> {
        fs::create_dir_all(unpack_dir).map_err(|e| IngestError::Io(e.to_string()))?;
        let file = fs::File::open(path).map_err(|e| IngestError::CorruptArchive {
            path: path.into(),
            reason: e.to_string(),
        })?;
        let mut archive = tar::Archive::new(GzDecoder::new(file));
        archive
            .unpack(unpack_dir)
            .map_err(|e| IngestError::CorruptArchive {
                path: path.into(),
                reason: e.to_string(),
            })
    }

    async fn load_unpacked(
        &self,
        unpack_dir: &Path,
        jobid: &str,
    ) -> Result<(usize, bool), IngestError> {
        // Counter files live under a top-level directory named for the job,
        // which is also where the job id authoritatively comes from
        let job_dir = unpack_dir.join(jobid);
        let job_dir = if job_dir.is_dir() { job_dir } else { unpack_dir.to_path_buf() };

        let mut collate_config = self.config.collate.clone();
        collate_config.output = None;
        let outcome = collate_dir(&job_dir, &collate_config)?;
        let merged = outcome.output.ok_or_else(|| IngestError::CorruptArchive {
            path: job_dir.clone(),
            reason: "collation produced no output".to_string(),
        })?;
        if !outcome.quarantined.is_empty() {
            self.metrics
                .add_files_quarantined(outcome.quarantined.len() as u64);
        }
        for rejection in &outcome.quarantined {
            warn!(
                jobid = %jobid,
                path = %rejection.path.display(),
                reason = %rejection.reason,
                "Counter file quarantined during ingest"
            );
        }

        let procs = parse_collated(&merged, jobid, self.config.collate.delimiter)?;

        let mut job = Job::new(jobid);
        job.submit = Some(Utc::now());
        job.start = procs.iter().filter_map(|p| p.start).min();
        job.end = procs.iter().filter_map(|p| p.end).max();
        job.exitcode = procs.first().map(|p| p.exitcode).unwrap_or(0);
        job.env = read_json_map(&job_dir.join(ENV_FILE));
        job.env_changes = read_json_map(&job_dir.join(ENV_CHANGES_FILE));
        job.tags = match job.env.get(crate::tags::TAGS_ENV_VAR) {
            Some(raw) => decode_tags(raw),
            None => tags_from_env().unwrap_or_default(),
        };
        job.is_staged = true;

        let num_procs = procs.len();
        let use_staging =
            self.config.concurrency > 1 && self.store.supports_concurrent_writers();
        self.store.insert_job(job, procs, use_staging).await?;
        Ok((num_procs, use_staging))
    }

    fn apply_corrupt_policy(&self, path: &Path) {
        self.metrics.inc_archives_quarantined();
        match self.config.on_corrupt {
            CorruptArchivePolicy::Keep => {}
            CorruptArchivePolicy::Remove => {
                if let Err(e) = fs::remove_file(path) {
                    warn!(path = %path.display(), error = %e, "Failed to remove corrupt archive");
                }
            }
            CorruptArchivePolicy::Quarantine => {
                let Some(dir) = &self.config.quarantine_dir else {
                    warn!("Quarantine policy configured without a quarantine directory");
                    return;
                };
                if let Err(e) = fs::create_dir_all(dir) {
                    warn!(error = %e, "Failed to create quarantine directory");
                    return;
                }
                let name = path.file_name().map(|n| n.to_os_string()).unwrap_or_default();
                let target = dir.join(name);
                match fs::copy(path, &target) {
                    Ok(_) => {
                        let _ = fs::remove_file(path);
                        debug!(path = %path.display(), target = %target.display(), "Archive quarantined");
                    }
                    Err(e) => {
                        warn!(path = %path.display(), error = %e, "Failed to quarantine archive")
                    }
                }
            }
        }
    }
}

/// Derive the job id from the archive name (`692500.tgz` -> `692500`)
pub(crate) fn jobid_from_archive(path: &Path) -> Option<String> {
    let stem = path.file_stem()?.to_str()?;
    let stem = stem.strip_suffix(".tar").unwrap_or(stem);
    if stem.is_empty() {
        None
    } else {
        Some(stem.to_string())
    }
}

fn read_json_map(path: &Path) -> BTreeMap<String, String> {
    let Ok(content) = fs::read_to_string(path) else {
        return BTreeMap::new();
    };
    match serde_json::from_str(&content) {
        Ok(map) => map,
        Err(e) => {
            warn!(path = %path.display(), error = %e, "Ignoring malformed environment file");
            BTreeMap::new()
        }
    }
}

/// Parse the collated file and roll thread rows up into process records
///
/// Rows belonging to one process share `(hostname, pid, start)`. Summable
/// counter columns are accumulated into the process's thread sums; `start`
/// takes the minimum, `end` the maximum, `tid` is dropped, and `numtids`
/// becomes the row count of the group.
fn parse_collated(
    path: &Path,
    jobid: &str,
    delimiter: char,
) -> Result<Vec<Process>, IngestError> {
    let content = fs::read_to_string(path).map_err(|e| IngestError::Io(e.to_string()))?;
    let mut lines = content
        .lines()
        .enumerate()
        .filter(|(_, l)| !l.trim().is_empty() && !l.starts_with('#'));

    let (_, header) = lines.next().ok_or_else(|| IngestError::RowParse {
        line: 0,
        reason: "empty collated file".to_string(),
    })?;
    let columns: Vec<&str> = header.split(delimiter).collect();
    for (pos, expected) in IDENT_COLUMNS.iter().enumerate() {
        if columns.get(pos) != Some(expected) {
            return Err(IngestError::MissingColumn(expected.to_string()));
        }
    }
    let metric_names: Vec<String> = columns[IDENT_COLUMNS.len()..]
        .iter()
        .map(|s| s.to_string())
        .collect();

    // Group key -> (template process, summable sums, start min, end max, rows)
    struct Group {
        proc: Process,
        sums: BTreeMap<String, f64>,
        start: Option<f64>,
        end: Option<f64>,
        rows: u32,
    }
    let mut groups: BTreeMap<(String, u32, String), Group> = BTreeMap::new();

    for (idx, line) in lines {
        let fields: Vec<&str> = line.split(delimiter).collect();
        if fields.len() != columns.len() {
            return Err(IngestError::RowParse {
                line: idx + 1,
                reason: format!("{} fields, header has {}", fields.len(), columns.len()),
            });
        }
        let ident = &fields[..IDENT_COLUMNS.len()];
        let pid = parse_u32(ident[6], idx, "pid")?;

        let mut metrics: BTreeMap<&str, f64> = BTreeMap::new();
        for (name, raw) in metric_names.iter().zip(&fields[IDENT_COLUMNS.len()..]) {
            let value = if raw.is_empty() {
                0.0
            } else {
                raw.parse::<f64>().map_err(|_| IngestError::RowParse {
                    line: idx + 1,
                    reason: format!("column {} is not numeric: {:?}", name, raw),
                })?
            };
            metrics.insert(name.as_str(), value);
        }

        let start_key = metrics
            .get("start")
            .map(|v| format!("{}", v))
            .unwrap_or_default();
        let key = (ident[1].to_string(), pid, start_key);

        let group = groups.entry(key).or_insert_with(|| {
            let mut proc = Process::new(0, jobid);
            proc.tags = decode_tags(ident[0]);
            proc.host = ident[1].to_string();
            proc.exename = ident[2].to_string();
            proc.path = ident[3].to_string();
            proc.args = ident[4].to_string();
            proc.pid = pid;
            Group {
                proc,
                sums: BTreeMap::new(),
                start: None,
                end: None,
                rows: 0,
            }
        });
        group.proc.exitcode = ident[5].parse::<i32>().unwrap_or(0);
        group.proc.gen = parse_u32(ident[7], idx, "generation")?;
        group.proc.ppid = parse_u32(ident[8], idx, "ppid")?;
        group.proc.pgid = parse_u32(ident[9], idx, "pgid")?;
        group.proc.sid = parse_u32(ident[10], idx, "sid")?;
        group.rows += 1;

        for (name, value) in metrics {
            match name {
                "start" => {
                    group.start = Some(group.start.map_or(value, |s: f64| s.min(value)));
                }
                "end" => {
                    group.end = Some(group.end.map_or(value, |e: f64| e.max(value)));
                }
                _ if NON_SUMMABLE.contains(&name) => {}
                _ => *group.sums.entry(name.to_string()).or_insert(0.0) += value,
            }
        }
    }

    let mut procs = Vec::with_capacity(groups.len());
    for (id, (_, group)) in groups.into_iter().enumerate() {
        let mut proc = group.proc;
        proc.id = id as u64 + 1;
        proc.numtids = group.rows;
        proc.start = group.start.and_then(ts_from_secs);
        proc.end = group.end.and_then(ts_from_secs);
        proc.threads_sums = group.sums;
        procs.push(proc);
    }
    debug!(jobid = %jobid, procs = procs.len(), "Parsed collated counter file");
    Ok(procs)
}

fn parse_u32(raw: &str, line: usize, column: &str) -> Result<u32, IngestError> {
    raw.parse::<u32>().map_err(|_| IngestError::RowParse {
        line: line + 1,
        reason: format!("column {} is not an integer: {:?}", column, raw),
    })
}

/// Epoch seconds (fractional) to a UTC timestamp
fn ts_from_secs(secs: f64) -> Option<DateTime<Utc>> {
    let whole = secs.floor() as i64;
    let nanos = ((secs - whole as f64) * 1e9) as u32;
    Utc.timestamp_opt(whole, nanos).single()
}
