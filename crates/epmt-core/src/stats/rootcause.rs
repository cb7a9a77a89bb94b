//! Root-cause ranking
//!
//! Orders features by how far a candidate's deviation exceeds what is
//! already normal inside the reference population: a feature whose
//! candidate z-score lands beyond the population's own most extreme
//! z-score ranks higher than one still inside it.

use super::{reference::job_feature, z_score, StatsError};
use crate::models::{FeatureStats, Job, ReferenceModel};
use serde::{Deserialize, Serialize};

/// One feature's row in the reconstructed inspection table
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RootCauseRow {
    pub feature: String,
    pub count: usize,
    pub mean: f64,
    pub std: f64,
    pub min: f64,
    pub max: f64,
    pub candidate: f64,
    pub z_score: f64,
    pub z_score_diff: f64,
}

/// Root-cause analysis output
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RootCauseReport {
    /// `(feature, score)` pairs sorted descending by score
    pub ranking: Vec<(String, f64)>,
    /// Descriptive statistics plus candidate/z-score rows, for inspection
    pub table: Vec<RootCauseRow>,
}

/// Most extreme |z| already present inside the reference population
///
/// Computable from the stored stats: the farthest of min and max from the
/// mean, in standard deviations. Zero spread means every reference value
/// sits at the mean, so nothing is extreme.
fn max_reference_z(stats: &FeatureStats) -> f64 {
    if stats.std.abs() < f64::EPSILON {
        return 0.0;
    }
    let below = stats.mean - stats.min;
    let above = stats.max - stats.mean;
    below.max(above) / stats.std
}

/// Rank the features most responsible for a candidate's deviation
pub fn rank_features(job: &Job, model: &ReferenceModel) -> Result<RootCauseReport, StatsError> {
    if !job.is_post_processed {
        return Err(StatsError::NotPostProcessed(job.jobid.clone()));
    }
    if model.features.is_empty() {
        return Err(StatsError::NoFeatures);
    }

    let mut table = Vec::with_capacity(model.features.len());
    for feature in &model.features {
        let stats = model
            .stats
            .get(feature)
            .ok_or_else(|| StatsError::FeatureMismatch {
                feature: feature.clone(),
            })?;
        let candidate = job_feature(job, feature).ok_or_else(|| StatsError::MissingFeature {
            jobid: job.jobid.clone(),
            feature: feature.clone(),
        })?;

        let z = z_score(candidate, stats);
        let score = (z.abs() - max_reference_z(stats)).abs();
        table.push(RootCauseRow {
            feature: feature.clone(),
            count: stats.count,
            mean: stats.mean,
            std: stats.std,
            min: stats.min,
            max: stats.max,
            candidate,
            z_score: z,
            z_score_diff: score,
        });
    }

    let mut ranking: Vec<(String, f64)> = table
        .iter()
        .map(|row| (row.feature.clone(), row.z_score_diff))
        .collect();
    ranking.sort_by(|a, b| b.1.partial_cmp(&a.1).unwrap_or(std::cmp::Ordering::Equal));

    Ok(RootCauseReport { ranking, table })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{ProcSums, TagMap};
    use crate::stats::{build_model, OutlierConfig};
    use chrono::{TimeZone, Utc};

    fn job_with(jobid: &str, duration: i64, cpu: f64) -> Job {
        let mut job = Job::new(jobid);
        job.start = Some(Utc.timestamp_opt(0, 0).unwrap());
        job.end = Some(Utc.timestamp_opt(duration, 0).unwrap());
        let mut sums = ProcSums {
            num_procs: 4,
            num_hosts: 1,
            ..Default::default()
        };
        sums.metrics.insert("cpu_time".to_string(), cpu);
        job.proc_sums = Some(sums);
        job.is_post_processed = true;
        job
    }

    fn model() -> ReferenceModel {
        // duration varies 100..119; cpu_time varies 10..29
        let jobs: Vec<Job> = (0..20)
            .map(|i| job_with(&format!("r{}", i), 100 + i, 10.0 + i as f64))
            .collect();
        let refs: Vec<&Job> = jobs.iter().collect();
        let features = vec!["duration".to_string(), "cpu_time".to_string()];
        build_model(
            1,
            "ref",
            TagMap::new(),
            &refs,
            &features,
            &OutlierConfig::default(),
        )
        .unwrap()
    }

    #[test]
    fn test_extreme_feature_ranks_strictly_higher() {
        let model = model();
        // duration far beyond the reference's own extremes; cpu_time typical
        let candidate = job_with("victim", 500, 20.0);

        let report = rank_features(&candidate, &model).unwrap();
        assert_eq!(report.ranking[0].0, "duration");
        assert!(report.ranking[0].1 > report.ranking[1].1);
    }

    #[test]
    fn test_table_carries_candidate_and_z_rows() {
        let model = model();
        let candidate = job_with("victim", 500, 20.0);
        let report = rank_features(&candidate, &model).unwrap();

        let duration = report
            .table
            .iter()
            .find(|row| row.feature == "duration")
            .unwrap();
        assert_eq!(duration.count, 20);
        assert_eq!(duration.candidate, 500.0);
        assert!(duration.z_score > 0.0);
        assert!((duration.z_score.abs() - max_reference_z(model.stats.get("duration").unwrap())
            - duration.z_score_diff)
            .abs()
            < 1e-9);
    }

    #[test]
    fn test_max_reference_z_zero_spread() {
        let stats = FeatureStats {
            count: 5,
            mean: 4.0,
            std: 0.0,
            min: 4.0,
            max: 4.0,
            median: 4.0,
            mad: 0.0,
            q_low: 4.0,
            q_high: 4.0,
        };
        assert_eq!(max_reference_z(&stats), 0.0);
    }

    #[test]
    fn test_unknown_feature_is_mismatch() {
        let mut model = model();
        model.features.push("ghost".to_string());
        let candidate = job_with("victim", 110, 15.0);
        let result = rank_features(&candidate, &model);
        assert!(matches!(result, Err(StatsError::FeatureMismatch { .. })));
    }
}
