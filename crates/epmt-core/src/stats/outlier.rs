//! Outlier detection against a reference model
//!
//! Three independent detectors are supported; a job may be run through any
//! subset of them. A job is an outlier under a method when any configured,
//! non-blacklisted feature is flagged.
//!
//! Zero-spread convention: when the reference spread (std or MAD) is zero,
//! a candidate equal to the center scores 0.0 (no signal) and any other
//! candidate scores infinity (always flagged). No division happens in that
//! branch.

use super::{reference::job_feature, StatsError, DEFAULT_FEATURES};
use crate::models::{FeatureFlag, FeatureStats, Job, MethodVerdict, ReferenceModel};
use serde::{Deserialize, Serialize};

/// Consistency constant relating the MAD to the standard deviation
const MAD_SCALE: f64 = 0.6745;

/// Default |z| threshold for the plain z-score detector
const DEFAULT_Z_THRESHOLD: f64 = 3.0;

/// Default |score| threshold for the modified z-score detector
const DEFAULT_MODIFIED_Z_THRESHOLD: f64 = 3.5;

/// Outlier detection methods
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OutlierMethod {
    ZScore,
    ModifiedZScore,
    Iqr,
}

impl std::fmt::Display for OutlierMethod {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            OutlierMethod::ZScore => write!(f, "z_score"),
            OutlierMethod::ModifiedZScore => write!(f, "modified_z_score"),
            OutlierMethod::Iqr => write!(f, "iqr"),
        }
    }
}

/// Outlier-engine settings
#[derive(Debug, Clone)]
pub struct OutlierConfig {
    pub z_threshold: f64,
    pub modified_z_threshold: f64,
    /// IQR whisker multiplier
    pub iqr_k: f64,
    /// Percentiles anchoring the IQR test
    pub iqr_low_pct: f64,
    pub iqr_high_pct: f64,
    /// Features scored by the detectors
    pub features: Vec<String>,
    /// Features excluded from the outlier verdict
    pub blacklist: Vec<String>,
    /// Detectors to run during analysis
    pub methods: Vec<OutlierMethod>,
    /// Minimum population size before a reference model is built
    pub min_reference_jobs: usize,
}

impl Default for OutlierConfig {
    fn default() -> Self {
        Self {
            z_threshold: DEFAULT_Z_THRESHOLD,
            modified_z_threshold: DEFAULT_MODIFIED_Z_THRESHOLD,
            iqr_k: 1.5,
            iqr_low_pct: 20.0,
            iqr_high_pct: 80.0,
            features: DEFAULT_FEATURES.iter().map(|s| s.to_string()).collect(),
            blacklist: Vec::new(),
            methods: vec![
                OutlierMethod::ZScore,
                OutlierMethod::ModifiedZScore,
                OutlierMethod::Iqr,
            ],
            min_reference_jobs: 10,
        }
    }
}

/// Deviation over spread with the zero-spread convention applied
fn spread_score(deviation: f64, spread: f64, scale: f64) -> f64 {
    if spread.abs() < f64::EPSILON {
        if deviation.abs() < f64::EPSILON {
            0.0
        } else {
            f64::INFINITY * deviation.signum()
        }
    } else {
        scale * deviation / spread
    }
}

/// Plain z-score of a candidate value against the reference
pub fn z_score(value: f64, stats: &FeatureStats) -> f64 {
    spread_score(value - stats.mean, stats.std, 1.0)
}

/// Modified z-score: `0.6745 * (v - median) / MAD`
pub fn modified_z_score(value: f64, stats: &FeatureStats) -> f64 {
    spread_score(value - stats.median, stats.mad, MAD_SCALE)
}

/// IQR test: flagged outside `[q_low - k*iqr, q_high + k*iqr]`
///
/// The score is the distance past the violated bound in IQR units (0.0
/// inside the fence; infinity when the reference IQR collapses to zero).
fn iqr_score(value: f64, stats: &FeatureStats, k: f64) -> (f64, bool) {
    let iqr = stats.q_high - stats.q_low;
    let low = stats.q_low - k * iqr;
    let high = stats.q_high + k * iqr;
    if value >= low && value <= high {
        return (0.0, false);
    }
    let excess = if value < low { low - value } else { value - high };
    if iqr.abs() < f64::EPSILON {
        (f64::INFINITY, true)
    } else {
        (excess / iqr, true)
    }
}

/// Score a candidate job's features against a reference model
///
/// Every configured feature must exist on both the candidate and the model;
/// a mismatch is a precondition failure and nothing is scored.
pub fn score_job(
    job: &Job,
    model: &ReferenceModel,
    config: &OutlierConfig,
) -> Result<Vec<MethodVerdict>, StatsError> {
    if !job.is_post_processed {
        return Err(StatsError::NotPostProcessed(job.jobid.clone()));
    }
    if config.features.is_empty() {
        return Err(StatsError::NoFeatures);
    }

    // Validate feature columns up front so no partial verdicts are produced
    let mut candidate: Vec<(String, f64, &FeatureStats)> = Vec::new();
    for feature in &config.features {
        let stats = model
            .stats
            .get(feature)
            .ok_or_else(|| StatsError::FeatureMismatch {
                feature: feature.clone(),
            })?;
        let value = job_feature(job, feature).ok_or_else(|| StatsError::MissingFeature {
            jobid: job.jobid.clone(),
            feature: feature.clone(),
        })?;
        candidate.push((feature.clone(), value, stats));
    }

    let mut verdicts = Vec::with_capacity(config.methods.len());
    for method in &config.methods {
        let mut features = Vec::with_capacity(candidate.len());
        let mut is_outlier = false;
        for (feature, value, stats) in &candidate {
            let (score, flagged) = match method {
                OutlierMethod::ZScore => {
                    let score = z_score(*value, stats);
                    (score, score.abs() > config.z_threshold)
                }
                OutlierMethod::ModifiedZScore => {
                    let score = modified_z_score(*value, stats);
                    (score, score.abs() > config.modified_z_threshold)
                }
                OutlierMethod::Iqr => iqr_score(*value, stats, config.iqr_k),
            };
            if flagged && !config.blacklist.contains(feature) {
                is_outlier = true;
            }
            features.push(FeatureFlag {
                feature: feature.clone(),
                score,
                flagged,
            });
        }
        verdicts.push(MethodVerdict {
            method: method.to_string(),
            features,
            is_outlier,
        });
    }
    Ok(verdicts)
}
