//! Per-host counter-file collation
//!
//! Merges the per-host CSV counter files belonging to one job into a single
//! consistent file: comments first, the master header once, then every data
//! row in input order. Files that fail validation are quarantined rather
//! than aborting the batch, unless `keep_going` is off.

#[cfg(test)]
mod tests;

use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};
use thiserror::Error;
use tracing::{debug, info, warn};

/// Marker embedded in output file names; inputs carrying it are refused
const COLLATED_MARKER: &str = "-collated";

/// Suffix appended to quarantined copies in the error directory
const ERROR_SUFFIX: &str = ".error";

/// Collector naming convention fragment used to select files in directory mode
const NAMING_FRAGMENT: &str = "-papiex-";

/// Collation settings
#[derive(Debug, Clone)]
pub struct CollateConfig {
    /// Field delimiter within data rows
    pub delimiter: char,
    /// Prefix marking comment lines, captured and passed through unmodified
    pub comment_marker: String,
    /// Collect bad files and keep collating, or abort on the first bad file
    pub keep_going: bool,
    /// Where to move unusable files; `None` leaves them in place
    pub error_dir: Option<PathBuf>,
    /// Explicit output path; derived from the first input when `None`
    pub output: Option<PathBuf>,
}

impl Default for CollateConfig {
    fn default() -> Self {
        Self {
            delimiter: ',',
            comment_marker: "#".to_string(),
            keep_going: true,
            error_dir: None,
            output: None,
        }
    }
}

/// Fatal collation failures (per-file problems go to the quarantine list)
#[derive(Debug, Error)]
pub enum CollateError {
    #[error("no input files to collate")]
    NoInputFiles,
    #[error("input {0} is already a collated file")]
    CollatedInput(PathBuf),
    #[error("output path {0} already exists")]
    OutputExists(PathBuf),
    #[error("no usable input files; all {0} inputs were rejected")]
    NoUsableFiles(usize),
    #[error("output row count {actual} does not match expected {expected}")]
    RowCountMismatch { expected: usize, actual: usize },
    #[error("collation I/O error: {0}")]
    Io(String),
}

/// Why a particular input file was rejected
#[derive(Debug, Clone, Error)]
pub enum RejectReason {
    #[error("unreadable: {0}")]
    Unreadable(String),
    #[error("no header line found")]
    MissingHeader,
    #[error("header mismatch: expected {expected:?}, found {found:?}")]
    HeaderMismatch { expected: String, found: String },
    #[error("line {line}: {found} fields, header has {expected}")]
    FieldCountMismatch {
        line: usize,
        expected: usize,
        found: usize,
    },
}

/// A quarantined input file and the reason it was unusable
#[derive(Debug, Clone)]
pub struct FileRejection {
    pub path: PathBuf,
    pub reason: RejectReason,
}

/// Result payload of a collation call
#[derive(Debug)]
pub struct CollationOutcome {
    /// True when a merged output file was produced
    pub ok: bool,
    pub output: Option<PathBuf>,
    pub quarantined: Vec<FileRejection>,
}

/// One parsed input file
struct SourceFile {
    path: PathBuf,
    comments: Vec<String>,
    header: String,
    rows: Vec<String>,
}

impl SourceFile {
    /// Non-blank line count: comments + header + rows
    fn line_count(&self) -> usize {
        self.comments.len() + 1 + self.rows.len()
    }
}

/// Collate every counter file in a directory
///
/// Selects `*.csv` files matching the collector naming convention, sorted
/// lexicographically, and hands them to [`collate_files`].
pub fn collate_dir(dir: &Path, config: &CollateConfig) -> Result<CollationOutcome, CollateError> {
    let mut paths = Vec::new();
    let entries = fs::read_dir(dir).map_err(|e| CollateError::Io(e.to_string()))?;
    for entry in entries {
        let entry = entry.map_err(|e| CollateError::Io(e.to_string()))?;
        let path = entry.path();
        let name = match path.file_name().and_then(|n| n.to_str()) {
            Some(n) => n,
            None => continue,
        };
        if name.ends_with(".csv") && name.contains(NAMING_FRAGMENT) && !name.contains(COLLATED_MARKER)
        {
            paths.push(path);
        }
    }
    paths.sort();
    collate_files(&paths, config)
}

/// Collate an explicit, ordered list of counter files
///
/// The first file's header becomes the master header; every other file must
/// match it byte-for-byte. Duplicate paths are deduplicated with a warning.
pub fn collate_files(
    paths: &[PathBuf],
    config: &CollateConfig,
) -> Result<CollationOutcome, CollateError> {
    if paths.is_empty() {
        return Err(CollateError::NoInputFiles);
    }

    let mut seen: Vec<&PathBuf> = Vec::new();
    let mut inputs: Vec<&PathBuf> = Vec::new();
    for path in paths {
        if seen.contains(&path) {
            warn!(path = %path.display(), "Duplicate input path, skipping");
            continue;
        }
        if file_name(path).contains(COLLATED_MARKER) {
            return Err(CollateError::CollatedInput(path.clone()));
        }
        seen.push(path);
        inputs.push(path);
    }

    let output = match &config.output {
        Some(path) => path.clone(),
        None => derive_output_path(inputs[0]),
    };
    if output.exists() {
        return Err(CollateError::OutputExists(output));
    }

    let mut sources: Vec<SourceFile> = Vec::new();
    let mut quarantined: Vec<FileRejection> = Vec::new();
    let mut master: Option<String> = None;

    for path in &inputs {
        match parse_source(path, config) {
            Ok(source) => {
                let Some(expected) = master.clone() else {
                    master = Some(source.header.clone());
                    sources.push(source);
                    continue;
                };
                if expected == source.header {
                    sources.push(source);
                    continue;
                }
                let rejection = FileRejection {
                    path: (*path).clone(),
                    reason: RejectReason::HeaderMismatch {
                        expected,
                        found: source.header,
                    },
                };
                if !handle_rejection(rejection, config, &mut quarantined) {
                    return Ok(CollationOutcome {
                        ok: false,
                        output: None,
                        quarantined,
                    });
                }
            }
            Err(reason) => {
                let rejection = FileRejection {
                    path: (*path).clone(),
                    reason,
                };
                if !handle_rejection(rejection, config, &mut quarantined) {
                    return Ok(CollationOutcome {
                        ok: false,
                        output: None,
                        quarantined,
                    });
                }
            }
        }
    }

    if sources.is_empty() {
        return Err(CollateError::NoUsableFiles(inputs.len()));
    }
    let master = sources[0].header.clone();

    write_output(&output, &sources, &master)?;
    verify_output(&output, &sources)?;

    info!(
        output = %output.display(),
        files = sources.len(),
        quarantined = quarantined.len(),
        "Collation complete"
    );

    Ok(CollationOutcome {
        ok: true,
        output: Some(output),
        quarantined,
    })
}

/// Record a rejection; returns false when the batch must stop
fn handle_rejection(
    rejection: FileRejection,
    config: &CollateConfig,
    quarantined: &mut Vec<FileRejection>,
) -> bool {
    warn!(
        path = %rejection.path.display(),
        reason = %rejection.reason,
        "Rejecting counter file"
    );
    if let Some(error_dir) = &config.error_dir {
        quarantine_file(&rejection.path, error_dir);
    }
    quarantined.push(rejection);
    config.keep_going
}

/// Copy a bad file into the error directory with an `.error` suffix and
/// remove the original; failures here are logged, not fatal
fn quarantine_file(path: &Path, error_dir: &Path) {
    if let Err(e) = fs::create_dir_all(error_dir) {
        warn!(error = %e, "Failed to create error directory");
        return;
    }
    let target = error_dir.join(format!("{}{}", file_name(path), ERROR_SUFFIX));
    match fs::copy(path, &target) {
        Ok(_) => {
            if let Err(e) = fs::remove_file(path) {
                warn!(path = %path.display(), error = %e, "Failed to remove quarantined file");
            } else {
                debug!(path = %path.display(), target = %target.display(), "Quarantined file");
            }
        }
        Err(e) => warn!(path = %path.display(), error = %e, "Failed to copy file to error dir"),
    }
}

/// Parse one counter file into comments, header, and validated rows
fn parse_source(path: &Path, config: &CollateConfig) -> Result<SourceFile, RejectReason> {
    let content = fs::read_to_string(path).map_err(|e| RejectReason::Unreadable(e.to_string()))?;

    let mut comments = Vec::new();
    let mut header: Option<String> = None;
    let mut rows = Vec::new();
    let mut field_count = 0usize;

    for (idx, line) in content.lines().enumerate() {
        if line.trim().is_empty() {
            continue;
        }
        if line.starts_with(&config.comment_marker) {
            comments.push(line.to_string());
            continue;
        }
        match &header {
            None => {
                field_count = line.matches(config.delimiter).count() + 1;
                header = Some(line.to_string());
            }
            Some(_) => {
                let found = line.matches(config.delimiter).count() + 1;
                if found != field_count {
                    return Err(RejectReason::FieldCountMismatch {
                        line: idx + 1,
                        expected: field_count,
                        found,
                    });
                }
                rows.push(line.to_string());
            }
        }
    }

    let header = header.ok_or(RejectReason::MissingHeader)?;
    Ok(SourceFile {
        path: path.to_path_buf(),
        comments,
        header,
        rows,
    })
}

/// Write comments, the master header, then all rows, atomically (tmp + rename)
fn write_output(
    output: &Path,
    sources: &[SourceFile],
    master: &str,
) -> Result<(), CollateError> {
    if let Some(parent) = output.parent() {
        fs::create_dir_all(parent).map_err(|e| CollateError::Io(e.to_string()))?;
    }
    let temp = output.with_extension("tmp");
    {
        let mut file = fs::File::create(&temp).map_err(|e| CollateError::Io(e.to_string()))?;
        for source in sources {
            for comment in &source.comments {
                writeln!(file, "{}", comment).map_err(|e| CollateError::Io(e.to_string()))?;
            }
        }
        writeln!(file, "{}", master).map_err(|e| CollateError::Io(e.to_string()))?;
        for source in sources {
            for row in &source.rows {
                writeln!(file, "{}", row).map_err(|e| CollateError::Io(e.to_string()))?;
            }
        }
        file.sync_all().map_err(|e| CollateError::Io(e.to_string()))?;
    }
    fs::rename(&temp, output).map_err(|e| CollateError::Io(e.to_string()))?;
    Ok(())
}

/// Re-read the output and check the row-count invariant:
/// `lines(output) == sum(lines(inputs)) - (contributing - 1)`
fn verify_output(output: &Path, sources: &[SourceFile]) -> Result<(), CollateError> {
    let expected: usize =
        sources.iter().map(SourceFile::line_count).sum::<usize>() - (sources.len() - 1);
    let content = fs::read_to_string(output).map_err(|e| CollateError::Io(e.to_string()))?;
    let actual = content.lines().filter(|l| !l.trim().is_empty()).count();
    if actual != expected {
        // Do not leave an inconsistent output behind
        let _ = fs::remove_file(output);
        return Err(CollateError::RowCountMismatch { expected, actual });
    }
    debug!(
        sources = sources.len(),
        rows = actual,
        first = %sources[0].path.display(),
        "Row-count invariant verified"
    );
    Ok(())
}

/// Derive `<host>-papiex-<jobid>-collated.csv` from the first input path
///
/// The host prefix comes from the file name up to the naming fragment; the
/// job id from the parent directory name.
fn derive_output_path(first: &Path) -> PathBuf {
    let name = file_name(first);
    let host = name.split(NAMING_FRAGMENT).next().unwrap_or("unknown");
    let jobid = first
        .parent()
        .and_then(|p| p.file_name())
        .and_then(|n| n.to_str())
        .unwrap_or("unknown");
    let dir = first.parent().map(Path::to_path_buf).unwrap_or_default();
    dir.join(format!("{}-papiex-{}{}.csv", host, jobid, COLLATED_MARKER))
}

fn file_name(path: &Path) -> String {
    path.file_name()
        .and_then(|n| n.to_str())
        .unwrap_or_default()
        .to_string()
}
