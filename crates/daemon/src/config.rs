//! Daemon configuration

use anyhow::Result;
use serde::Deserialize;
use std::path::PathBuf;

/// Daemon configuration, loaded from `EPMT_`-prefixed environment variables
#[derive(Debug, Clone, Deserialize)]
pub struct DaemonSettings {
    /// Instance name used in structured log events
    #[serde(default = "default_instance")]
    pub instance: String,

    /// API server port for health/metrics
    #[serde(default = "default_api_port")]
    pub api_port: u16,

    /// Per-iteration time budget in seconds
    #[serde(default = "default_interval")]
    pub interval_secs: u64,

    /// Iteration bound; 0 runs unbounded
    #[serde(default)]
    pub niters: u64,

    /// Directory scanned for new job archives
    #[serde(default)]
    pub spool_dir: Option<PathBuf>,

    /// Working area for unpacked archives
    #[serde(default = "default_scratch_dir")]
    pub scratch_dir: PathBuf,

    /// Target directory for corrupted archives
    #[serde(default)]
    pub quarantine_dir: Option<PathBuf>,

    /// Pid lock file; also the handle for `epmt daemon stop`/`status`
    #[serde(default = "default_pid_file")]
    pub pid_file: PathBuf,

    /// Concurrent archive submissions per ingest scan
    #[serde(default = "default_ingest_concurrency")]
    pub ingest_concurrency: usize,

    /// Job retirement age in days; 0 disables
    #[serde(default)]
    pub retire_jobs_after_days: f64,

    /// Reference-model retirement age in days; 0 disables
    #[serde(default)]
    pub retire_models_after_days: f64,
}

fn default_instance() -> String {
    std::env::var("HOSTNAME").unwrap_or_else(|_| "epmtd".to_string())
}

fn default_api_port() -> u16 {
    8090
}

fn default_interval() -> u64 {
    10
}

fn default_scratch_dir() -> PathBuf {
    std::env::temp_dir().join("epmt-ingest")
}

/// Default pid lock file location, shared with the CLI's daemon control
pub fn default_pid_file() -> PathBuf {
    std::env::temp_dir().join("epmtd.pid")
}

fn default_ingest_concurrency() -> usize {
    1
}

impl Default for DaemonSettings {
    fn default() -> Self {
        Self {
            instance: default_instance(),
            api_port: default_api_port(),
            interval_secs: default_interval(),
            niters: 0,
            spool_dir: None,
            scratch_dir: default_scratch_dir(),
            quarantine_dir: None,
            pid_file: default_pid_file(),
            ingest_concurrency: default_ingest_concurrency(),
            retire_jobs_after_days: 0.0,
            retire_models_after_days: 0.0,
        }
    }
}

impl DaemonSettings {
    /// Load configuration from the environment
    pub fn load() -> Result<Self> {
        let config = config::Config::builder()
            .add_source(config::Environment::with_prefix("EPMT"))
            .build()?;

        Ok(config.try_deserialize().unwrap_or_default())
    }
}
