//! Archive submission command

use crate::output::{self, color_status, format_score, OutputFormat};
use anyhow::{bail, Result};
use epmt_core::{
    ingest::{IngestConfig, Ingester},
    lifecycle::{Orchestrator, RetentionConfig},
    stats::{rank_features, OutlierConfig},
    store::{JobSelector, MemoryStore, MetricStore},
};
use serde::Serialize;
use std::path::PathBuf;
use std::sync::Arc;
use tabled::Tabled;

pub struct SubmitOptions {
    pub fail_fast: bool,
    pub force: bool,
    pub concurrency: usize,
    pub post_process: bool,
    pub analyze: bool,
    pub report: bool,
}

#[derive(Tabled, Serialize)]
struct SubmissionRow {
    #[tabled(rename = "Job")]
    jobid: String,
    #[tabled(rename = "Status")]
    status: String,
    #[tabled(rename = "Detail")]
    detail: String,
}

#[derive(Tabled, Serialize)]
struct RootCauseDisplayRow {
    #[tabled(rename = "Feature")]
    feature: String,
    #[tabled(rename = "Count")]
    count: usize,
    #[tabled(rename = "Mean")]
    mean: String,
    #[tabled(rename = "Std")]
    std: String,
    #[tabled(rename = "Min")]
    min: String,
    #[tabled(rename = "Max")]
    max: String,
    #[tabled(rename = "Candidate")]
    candidate: String,
    #[tabled(rename = "Z-score")]
    z_score: String,
    #[tabled(rename = "Z-diff")]
    z_score_diff: String,
}

/// Submit archives, optionally driving them through post-process/analyze
pub async fn submit(
    archives: &[PathBuf],
    options: SubmitOptions,
    format: OutputFormat,
) -> Result<()> {
    let store = Arc::new(MemoryStore::new());
    let orchestrator = Orchestrator::new(
        store.clone(),
        OutlierConfig::default(),
        RetentionConfig::default(),
    );
    let ingester = Arc::new(Ingester::new(
        store.clone(),
        IngestConfig {
            keep_going: !options.fail_fast,
            force: options.force,
            concurrency: options.concurrency,
            post_process: options.post_process,
            ..Default::default()
        },
    ));

    let report = orchestrator.ingest(&ingester, archives).await;

    let mut rows: Vec<SubmissionRow> = Vec::new();
    for jobid in &report.succeeded {
        rows.push(SubmissionRow {
            jobid: jobid.clone(),
            status: color_status("ingested"),
            detail: String::new(),
        });
    }
    for jobid in &report.already_present {
        rows.push(SubmissionRow {
            jobid: jobid.clone(),
            status: color_status("already_present"),
            detail: String::new(),
        });
    }
    for (path, reason) in &report.failed {
        rows.push(SubmissionRow {
            jobid: path.display().to_string(),
            status: color_status("failed"),
            detail: reason.clone(),
        });
    }
    output::print_table(&rows, format);
    if report.aborted {
        output::print_warning("Batch aborted before all archives were processed");
    }

    if options.analyze {
        if !options.post_process {
            orchestrator.post_process(None, false).await;
        }
        let summary = orchestrator.analyze(None, false).await;
        for jobid in &summary.failed() {
            output::print_warning(&format!("Analysis failed for job {}", jobid));
        }
        if options.report {
            print_reports(&store, format).await?;
        }
    }

    if !report.failed.is_empty() {
        bail!("{} archive(s) failed to ingest", report.failed.len());
    }
    output::print_success(&format!(
        "{} job(s) ingested, {} already present",
        report.succeeded.len(),
        report.already_present.len()
    ));
    Ok(())
}

/// Print the root-cause inspection table for every analyzed job
async fn print_reports(store: &Arc<MemoryStore>, format: OutputFormat) -> Result<()> {
    for jobid in store.select_jobs(JobSelector::Analyzed).await? {
        let Some(job) = store.get_job(&jobid).await? else {
            continue;
        };
        let Some(analysis) = &job.analysis else {
            continue;
        };

        let outliers: Vec<&str> = analysis
            .verdicts
            .iter()
            .filter(|v| v.is_outlier)
            .map(|v| v.method.as_str())
            .collect();
        if outliers.is_empty() {
            output::print_info(&format!("Job {}: no outlier methods fired", jobid));
        } else {
            output::print_warning(&format!(
                "Job {}: flagged by {}",
                jobid,
                outliers.join(", ")
            ));
        }

        let Some(model_id) = analysis.model_ids.first() else {
            continue;
        };
        let Some(model) = store.get_model(*model_id).await? else {
            output::print_warning(&format!(
                "Job {}: reference model {} has been retired",
                jobid, model_id
            ));
            continue;
        };
        let report = rank_features(&job, &model)?;
        let rows: Vec<RootCauseDisplayRow> = report
            .table
            .iter()
            .map(|row| RootCauseDisplayRow {
                feature: row.feature.clone(),
                count: row.count,
                mean: format_score(row.mean),
                std: format_score(row.std),
                min: format_score(row.min),
                max: format_score(row.max),
                candidate: format_score(row.candidate),
                z_score: format_score(row.z_score),
                z_score_diff: format_score(row.z_score_diff),
            })
            .collect();
        output::print_table(&rows, format);
    }
    Ok(())
}
