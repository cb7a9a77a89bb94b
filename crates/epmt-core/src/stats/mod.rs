//! Statistics and outlier engine
//!
//! This module provides:
//! - Descriptive statistics and reference-model construction over a job
//!   population
//! - Outlier detection (z-score, modified z-score, IQR) of a candidate job
//!   against a reference model
//! - Root-cause ranking of the features driving an outlier call

mod outlier;
mod reference;
mod rootcause;

pub use outlier::{score_job, z_score, modified_z_score, OutlierConfig, OutlierMethod};
pub use reference::{build_model, describe, job_feature, percentile, DEFAULT_FEATURES};
pub use rootcause::{rank_features, RootCauseReport, RootCauseRow};

use thiserror::Error;

/// Precondition failures of the statistics engine
///
/// These are reported before any computation is attempted; they never
/// leave partial state behind.
#[derive(Debug, Error)]
pub enum StatsError {
    #[error("reference population is empty")]
    EmptyPopulation,
    #[error("reference population has {got} jobs, {needed} required")]
    PopulationTooSmall { needed: usize, got: usize },
    #[error("no features configured")]
    NoFeatures,
    #[error("job {jobid} has no value for feature {feature}")]
    MissingFeature { jobid: String, feature: String },
    #[error("feature {feature} is not part of the reference model")]
    FeatureMismatch { feature: String },
    #[error("job {0} has not been post-processed")]
    NotPostProcessed(String),
}
