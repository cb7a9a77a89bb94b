//! Reference-model construction
//!
//! A reference model is a named snapshot of per-feature descriptive
//! statistics over a chosen job population, captured once at creation and
//! used as the comparison baseline for outlier scoring.

use super::{OutlierConfig, StatsError};
use crate::models::{FeatureStats, Job, ReferenceModel, TagMap};
use chrono::Utc;
use std::collections::{BTreeMap, BTreeSet};
use tracing::info;

/// Aggregate features scored by default
pub const DEFAULT_FEATURES: &[&str] = &["duration", "cpu_time", "num_procs"];

/// Extract one numeric aggregate feature from a post-processed job
///
/// `duration` is derived from the job's endpoints, `num_procs` and
/// `num_hosts` from the rollup, and anything else is looked up in the
/// summed metrics.
pub fn job_feature(job: &Job, feature: &str) -> Option<f64> {
    match feature {
        "duration" => job.duration_secs(),
        "num_procs" => job.proc_sums.as_ref().map(|s| s.num_procs as f64),
        "num_hosts" => job.proc_sums.as_ref().map(|s| s.num_hosts as f64),
        _ => job
            .proc_sums
            .as_ref()
            .and_then(|s| s.metrics.get(feature).copied()),
    }
}

/// Descriptive statistics of one feature's values
///
/// Standard deviation is the population form (not sample-corrected), for
/// consistency across small populations. Returns `None` for an empty slice.
pub fn describe(values: &[f64], q_low_pct: f64, q_high_pct: f64) -> Option<FeatureStats> {
    if values.is_empty() {
        return None;
    }
    let count = values.len();
    let mean = values.iter().sum::<f64>() / count as f64;
    let variance = values.iter().map(|v| (v - mean).powi(2)).sum::<f64>() / count as f64;

    let mut sorted = values.to_vec();
    sorted.sort_by(|a, b| a.partial_cmp(b).unwrap_or(std::cmp::Ordering::Equal));
    let median = percentile(&sorted, 50.0);

    let mut deviations: Vec<f64> = sorted.iter().map(|v| (v - median).abs()).collect();
    deviations.sort_by(|a, b| a.partial_cmp(b).unwrap_or(std::cmp::Ordering::Equal));
    let mad = percentile(&deviations, 50.0);

    Some(FeatureStats {
        count,
        mean,
        std: variance.sqrt(),
        min: sorted[0],
        max: sorted[count - 1],
        median,
        mad,
        q_low: percentile(&sorted, q_low_pct),
        q_high: percentile(&sorted, q_high_pct),
    })
}

/// Linear-interpolation percentile over an ascending-sorted slice
pub fn percentile(sorted: &[f64], p: f64) -> f64 {
    if sorted.is_empty() {
        return 0.0;
    }
    let rank = (p / 100.0).clamp(0.0, 1.0) * (sorted.len() - 1) as f64;
    let low = rank.floor() as usize;
    let high = rank.ceil() as usize;
    if low == high {
        sorted[low]
    } else {
        let weight = rank - low as f64;
        sorted[low] * (1.0 - weight) + sorted[high] * weight
    }
}

/// Build a reference model from a job population
///
/// Every job must carry a value for every requested feature; a missing
/// value is a precondition failure and no model is produced.
pub fn build_model(
    id: u64,
    name: impl Into<String>,
    tags: TagMap,
    jobs: &[&Job],
    features: &[String],
    config: &OutlierConfig,
) -> Result<ReferenceModel, StatsError> {
    if jobs.is_empty() {
        return Err(StatsError::EmptyPopulation);
    }
    if features.is_empty() {
        return Err(StatsError::NoFeatures);
    }

    let mut stats: BTreeMap<String, FeatureStats> = BTreeMap::new();
    for feature in features {
        let mut values = Vec::with_capacity(jobs.len());
        for job in jobs {
            let value =
                job_feature(job, feature).ok_or_else(|| StatsError::MissingFeature {
                    jobid: job.jobid.clone(),
                    feature: feature.clone(),
                })?;
            values.push(value);
        }
        let described = describe(&values, config.iqr_low_pct, config.iqr_high_pct)
            .ok_or(StatsError::EmptyPopulation)?;
        stats.insert(feature.clone(), described);
    }

    let model = ReferenceModel {
        id,
        name: name.into(),
        tags,
        jobids: jobs.iter().map(|j| j.jobid.clone()).collect::<BTreeSet<_>>(),
        features: features.to_vec(),
        stats,
        created_at: Utc::now(),
    };
    info!(
        model = %model.name,
        jobs = model.jobids.len(),
        features = model.features.len(),
        "Built reference model"
    );
    Ok(model)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::ProcSums;

    fn post_processed_job(jobid: &str, duration: i64, cpu: f64, procs: usize) -> Job {
        use chrono::TimeZone;
        let mut job = Job::new(jobid);
        job.start = Some(Utc.timestamp_opt(1000, 0).unwrap());
        job.end = Some(Utc.timestamp_opt(1000 + duration, 0).unwrap());
        let mut sums = ProcSums {
            num_procs: procs,
            num_hosts: 1,
            ..Default::default()
        };
        sums.metrics.insert("cpu_time".to_string(), cpu);
        job.proc_sums = Some(sums);
        job.is_post_processed = true;
        job
    }

    #[test]
    fn test_describe_known_values() {
        let values: Vec<f64> = (1..=5).map(|v| v as f64).collect();
        let stats = describe(&values, 20.0, 80.0).unwrap();
        assert_eq!(stats.count, 5);
        assert!((stats.mean - 3.0).abs() < 1e-9);
        // Population std of 1..5 is sqrt(2)
        assert!((stats.std - 2.0_f64.sqrt()).abs() < 1e-9);
        assert_eq!(stats.min, 1.0);
        assert_eq!(stats.max, 5.0);
        assert_eq!(stats.median, 3.0);
        assert_eq!(stats.mad, 1.0);
    }

    #[test]
    fn test_describe_empty_is_none() {
        assert!(describe(&[], 20.0, 80.0).is_none());
    }

    #[test]
    fn test_percentile_interpolates() {
        let sorted = vec![10.0, 20.0, 30.0, 40.0];
        assert_eq!(percentile(&sorted, 0.0), 10.0);
        assert_eq!(percentile(&sorted, 100.0), 40.0);
        assert!((percentile(&sorted, 50.0) - 25.0).abs() < 1e-9);
    }

    #[test]
    fn test_job_feature_lookup() {
        let job = post_processed_job("1", 600, 42.5, 7);
        assert_eq!(job_feature(&job, "duration"), Some(600.0));
        assert_eq!(job_feature(&job, "cpu_time"), Some(42.5));
        assert_eq!(job_feature(&job, "num_procs"), Some(7.0));
        assert_eq!(job_feature(&job, "no_such_metric"), None);
    }

    #[test]
    fn test_build_model_over_population() {
        let jobs: Vec<Job> = (0..10)
            .map(|i| post_processed_job(&format!("j{}", i), 100 + i, 10.0 + i as f64, 4))
            .collect();
        let refs: Vec<&Job> = jobs.iter().collect();
        let features: Vec<String> = DEFAULT_FEATURES.iter().map(|s| s.to_string()).collect();

        let model = build_model(
            1,
            "exp:spinup",
            TagMap::new(),
            &refs,
            &features,
            &OutlierConfig::default(),
        )
        .unwrap();

        assert_eq!(model.jobids.len(), 10);
        let duration = model.stats.get("duration").unwrap();
        assert_eq!(duration.count, 10);
        assert!((duration.mean - 104.5).abs() < 1e-9);
    }

    #[test]
    fn test_build_model_empty_population_fails() {
        let features = vec!["duration".to_string()];
        let result = build_model(
            1,
            "m",
            TagMap::new(),
            &[],
            &features,
            &OutlierConfig::default(),
        );
        assert!(matches!(result, Err(StatsError::EmptyPopulation)));
    }

    #[test]
    fn test_build_model_missing_feature_fails() {
        let job = Job::new("bare");
        let features = vec!["duration".to_string()];
        let result = build_model(
            1,
            "m",
            TagMap::new(),
            &[&job],
            &features,
            &OutlierConfig::default(),
        );
        assert!(matches!(result, Err(StatsError::MissingFeature { .. })));
    }
}
