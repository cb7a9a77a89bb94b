use super::*;
use std::fs;
use tempfile::TempDir;

fn write_file(dir: &Path, name: &str, content: &str) -> PathBuf {
    let path = dir.join(name);
    fs::write(&path, content).unwrap();
    path
}

fn job_dir(root: &TempDir) -> PathBuf {
    let dir = root.path().join("692500");
    fs::create_dir_all(&dir).unwrap();
    dir
}

const HEADER: &str = "tags,hostname,exename,path,args,exitcode,pid,generation,ppid,pgid,sid,numtids,tid,start,end,usertime,systemtime";

fn row(host: &str, pid: u32) -> String {
    format!(
        ",{},bash,/bin/bash,,0,{},0,1,100,100,1,{},1000,2000,5.0,1.0",
        host, pid, pid
    )
}

fn counter_file(host: &str, pids: &[u32]) -> String {
    let mut out = format!("# collector v1\n{}\n", HEADER);
    for pid in pids {
        out.push_str(&row(host, *pid));
        out.push('\n');
    }
    out
}

#[test]
fn test_collate_two_files_row_count_invariant() {
    let root = TempDir::new().unwrap();
    let dir = job_dir(&root);
    let f1 = write_file(&dir, "nodeA-papiex-692500-0.csv", &counter_file("nodeA", &[10, 11]));
    let f2 = write_file(&dir, "nodeB-papiex-692500-0.csv", &counter_file("nodeB", &[20]));

    let outcome = collate_files(&[f1, f2], &CollateConfig::default()).unwrap();
    assert!(outcome.ok);
    assert!(outcome.quarantined.is_empty());

    let output = outcome.output.unwrap();
    let content = fs::read_to_string(&output).unwrap();
    let lines: Vec<&str> = content.lines().collect();
    // 2 comments + 1 header + 3 rows
    assert_eq!(lines.len(), 6);
    assert_eq!(lines[2], HEADER);
    assert!(lines[3].contains("nodeA"));
    assert!(lines[5].contains("nodeB"));
}

#[test]
fn test_output_name_derived_from_host_and_job_dir() {
    let root = TempDir::new().unwrap();
    let dir = job_dir(&root);
    let f1 = write_file(&dir, "nodeA-papiex-692500-0.csv", &counter_file("nodeA", &[10]));

    let outcome = collate_files(&[f1], &CollateConfig::default()).unwrap();
    let output = outcome.output.unwrap();
    assert_eq!(
        output.file_name().unwrap().to_str().unwrap(),
        "nodeA-papiex-692500-collated.csv"
    );
}

#[test]
fn test_collation_idempotent_byte_identical() {
    let root = TempDir::new().unwrap();
    let dir = job_dir(&root);
    let f1 = write_file(&dir, "nodeA-papiex-692500-0.csv", &counter_file("nodeA", &[10, 11]));
    let f2 = write_file(&dir, "nodeB-papiex-692500-0.csv", &counter_file("nodeB", &[20]));
    let files = vec![f1, f2];

    let first = collate_files(&files, &CollateConfig::default()).unwrap();
    let path = first.output.unwrap();
    let first_bytes = fs::read(&path).unwrap();

    fs::remove_file(&path).unwrap();
    let second = collate_files(&files, &CollateConfig::default()).unwrap();
    let second_bytes = fs::read(second.output.unwrap()).unwrap();

    assert_eq!(first_bytes, second_bytes);
}

#[test]
fn test_existing_output_is_an_error() {
    let root = TempDir::new().unwrap();
    let dir = job_dir(&root);
    let f1 = write_file(&dir, "nodeA-papiex-692500-0.csv", &counter_file("nodeA", &[10]));
    write_file(&dir, "nodeA-papiex-692500-collated.csv", "stale");

    let result = collate_files(&[f1], &CollateConfig::default());
    assert!(matches!(result, Err(CollateError::OutputExists(_))));
}

#[test]
fn test_header_mismatch_keep_going_quarantines() {
    let root = TempDir::new().unwrap();
    let dir = job_dir(&root);
    let f1 = write_file(&dir, "nodeA-papiex-692500-0.csv", &counter_file("nodeA", &[10]));
    let f2 = write_file(
        &dir,
        "nodeB-papiex-692500-0.csv",
        "othercol1,othercol2\na,b\n",
    );

    let outcome = collate_files(&[f1, f2.clone()], &CollateConfig::default()).unwrap();
    assert!(outcome.ok);
    assert_eq!(outcome.quarantined.len(), 1);
    assert_eq!(outcome.quarantined[0].path, f2);
    assert!(matches!(
        outcome.quarantined[0].reason,
        RejectReason::HeaderMismatch { .. }
    ));

    // Output still produced from the good file
    let content = fs::read_to_string(outcome.output.unwrap()).unwrap();
    assert!(content.contains("nodeA"));
    assert!(!content.contains("othercol1"));
}

#[test]
fn test_header_mismatch_fail_fast_produces_no_output() {
    let root = TempDir::new().unwrap();
    let dir = job_dir(&root);
    let f1 = write_file(&dir, "nodeA-papiex-692500-0.csv", &counter_file("nodeA", &[10]));
    let f2 = write_file(&dir, "nodeB-papiex-692500-0.csv", "other\nx\n");

    let config = CollateConfig {
        keep_going: false,
        ..Default::default()
    };
    let outcome = collate_files(&[f1, f2], &config).unwrap();
    assert!(!outcome.ok);
    assert!(outcome.output.is_none());
    assert_eq!(outcome.quarantined.len(), 1);
    assert!(!dir.join("nodeA-papiex-692500-collated.csv").exists());
}

#[test]
fn test_field_count_mismatch_is_rejected() {
    let root = TempDir::new().unwrap();
    let dir = job_dir(&root);
    let f1 = write_file(&dir, "nodeA-papiex-692500-0.csv", &counter_file("nodeA", &[10]));
    let mut bad = format!("{}\n", HEADER);
    bad.push_str("only,three,fields\n");
    let f2 = write_file(&dir, "nodeB-papiex-692500-0.csv", &bad);

    let outcome = collate_files(&[f1, f2], &CollateConfig::default()).unwrap();
    assert!(outcome.ok);
    assert_eq!(outcome.quarantined.len(), 1);
    assert!(matches!(
        outcome.quarantined[0].reason,
        RejectReason::FieldCountMismatch { line: 2, .. }
    ));
}

#[test]
fn test_duplicate_paths_deduplicated() {
    let root = TempDir::new().unwrap();
    let dir = job_dir(&root);
    let f1 = write_file(&dir, "nodeA-papiex-692500-0.csv", &counter_file("nodeA", &[10]));

    let outcome = collate_files(&[f1.clone(), f1], &CollateConfig::default()).unwrap();
    assert!(outcome.ok);
    assert!(outcome.quarantined.is_empty());

    let content = fs::read_to_string(outcome.output.unwrap()).unwrap();
    // 1 comment + header + 1 row, not doubled
    assert_eq!(content.lines().count(), 3);
}

#[test]
fn test_collated_input_rejected_outright() {
    let root = TempDir::new().unwrap();
    let dir = job_dir(&root);
    let f1 = write_file(&dir, "nodeA-papiex-692500-0.csv", &counter_file("nodeA", &[10]));
    let collated = write_file(
        &dir,
        "nodeA-papiex-692500-collated.csv",
        &counter_file("nodeA", &[10]),
    );

    let result = collate_files(&[f1, collated], &CollateConfig::default());
    assert!(matches!(result, Err(CollateError::CollatedInput(_))));
}

#[test]
fn test_error_dir_receives_bad_file() {
    let root = TempDir::new().unwrap();
    let dir = job_dir(&root);
    let error_dir = root.path().join("errors");
    let f1 = write_file(&dir, "nodeA-papiex-692500-0.csv", &counter_file("nodeA", &[10]));
    let f2 = write_file(&dir, "nodeB-papiex-692500-0.csv", "bogus\nrow,with,fields\n");

    let config = CollateConfig {
        error_dir: Some(error_dir.clone()),
        ..Default::default()
    };
    let outcome = collate_files(&[f1, f2.clone()], &config).unwrap();
    assert_eq!(outcome.quarantined.len(), 1);
    assert!(error_dir.join("nodeB-papiex-692500-0.csv.error").exists());
    assert!(!f2.exists(), "bad file should be removed from input location");
}

#[test]
fn test_all_inputs_bad_is_fatal() {
    let root = TempDir::new().unwrap();
    let dir = job_dir(&root);
    let f1 = write_file(&dir, "nodeA-papiex-692500-0.csv", "");
    let f2 = write_file(&dir, "nodeB-papiex-692500-0.csv", "# only a comment\n");

    let result = collate_files(&[f1, f2], &CollateConfig::default());
    assert!(matches!(result, Err(CollateError::NoUsableFiles(2))));
}

#[test]
fn test_blank_lines_stripped_and_comments_kept() {
    let root = TempDir::new().unwrap();
    let dir = job_dir(&root);
    let content = format!("\n# one\n\n{}\n\n{}\n\n", HEADER, row("nodeA", 10));
    let f1 = write_file(&dir, "nodeA-papiex-692500-0.csv", &content);

    let outcome = collate_files(&[f1], &CollateConfig::default()).unwrap();
    let merged = fs::read_to_string(outcome.output.unwrap()).unwrap();
    let lines: Vec<&str> = merged.lines().collect();
    assert_eq!(lines.len(), 3);
    assert_eq!(lines[0], "# one");
    assert_eq!(lines[1], HEADER);
}

#[test]
fn test_collate_dir_selects_by_convention_sorted() {
    let root = TempDir::new().unwrap();
    let dir = job_dir(&root);
    write_file(&dir, "nodeB-papiex-692500-0.csv", &counter_file("nodeB", &[20]));
    write_file(&dir, "nodeA-papiex-692500-0.csv", &counter_file("nodeA", &[10]));
    write_file(&dir, "notes.txt", "ignore me");
    write_file(&dir, "random.csv", "no,convention\n1,2\n");

    let outcome = collate_dir(&dir, &CollateConfig::default()).unwrap();
    assert!(outcome.ok);
    let content = fs::read_to_string(outcome.output.unwrap()).unwrap();
    let lines: Vec<&str> = content.lines().collect();
    // Lexicographic order: nodeA's row precedes nodeB's
    let a = lines.iter().position(|l| l.contains("nodeA") && l.contains(",10,")).unwrap();
    let b = lines.iter().position(|l| l.contains("nodeB")).unwrap();
    assert!(a < b);
    assert!(!content.contains("convention"));
}
