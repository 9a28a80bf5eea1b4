//! CLI test cases.
//!
//! The `run` subcommand needs a live chat completions endpoint, so the tests
//! here stick to the offline surface: argument parsing, the consolidated
//! merge, and the review tooling. A batch CSV fixture is built on the fly in
//! a temp directory.

use std::{fs, path::Path, process::Command};

use assert_cmd::prelude::*;
use predicates::prelude::*;

/// Create a new `Command` with our binary.
fn cmd() -> Command {
    Command::cargo_bin("kartei-ocr").unwrap()
}

/// Write a minimal batch export under `<output>/csv/`.
fn write_batch_fixture(output_dir: &Path, batch: &str, filename: &str, komponist: &str) {
    let csv_dir = output_dir.join("csv");
    fs::create_dir_all(&csv_dir).unwrap();
    let header = "Datei,Batch,Signatur,Komponist,Titel,Textanfang,Verlag,Material,Textdichter,Bearbeiter,Bemerkungen";
    let row = format!("{filename},{batch},Spez.12.433,\"{komponist}\",,,,,,,");
    fs::write(
        csv_dir.join(format!("{batch}.csv")),
        format!("\u{feff}{header}\n{row}\n"),
    )
    .unwrap();
}

#[test]
fn test_help() {
    cmd().arg("--help").assert().success();
}

#[test]
fn test_version() {
    cmd().arg("--version").assert().success();
}

#[test]
fn test_run_requires_input_dir() {
    cmd().arg("run").assert().failure();
}

#[test]
fn test_merge_consolidates_batch_exports() {
    let dir = tempfile::tempdir().unwrap();
    write_batch_fixture(dir.path(), "Batch_01", "0001.jpg", "Lincke, Paul");
    write_batch_fixture(dir.path(), "Batch_02", "0002.jpg", "Lehár, Franz");

    cmd()
        .arg("merge")
        .arg("--output")
        .arg(dir.path())
        .assert()
        .success();

    let merged = fs::read_to_string(dir.path().join("metadata_vlm_complete.csv")).unwrap();
    assert!(merged.starts_with('\u{feff}'));
    assert!(merged.contains("0001.jpg"));
    assert!(merged.contains("0002.jpg"));
}

#[test]
fn test_review_batches_lists_exports() {
    let dir = tempfile::tempdir().unwrap();
    write_batch_fixture(dir.path(), "Batch_01", "0001.jpg", "Lincke, Paul");
    write_batch_fixture(dir.path(), "Batch_02", "0002.jpg", "Lehár, Franz");

    cmd()
        .arg("review")
        .arg("batches")
        .arg("--output")
        .arg(dir.path())
        .assert()
        .success()
        .stdout(predicate::str::contains("Batch_01").and(predicate::str::contains("Batch_02")));
}

#[test]
fn test_review_stats_reports_field_presence() {
    let dir = tempfile::tempdir().unwrap();
    write_batch_fixture(dir.path(), "Batch_01", "0001.jpg", "Lincke, Paul");

    cmd()
        .arg("review")
        .arg("stats")
        .arg("Batch_01")
        .arg("--output")
        .arg(dir.path())
        .assert()
        .success()
        .stdout(
            predicate::str::contains("Batch_01: 1 cards")
                .and(predicate::str::contains("Komponist: 1")),
        );
}

#[test]
fn test_review_apply_updates_exports() {
    let dir = tempfile::tempdir().unwrap();
    write_batch_fixture(dir.path(), "Batch_01", "0001.jpg", "Linke");

    let corrections = dir.path().join("corrections.jsonl");
    fs::write(
        &corrections,
        r#"{"batch":"Batch_01","filename":"0001.jpg","field":"Komponist","value":"Lincke, Paul"}"#,
    )
    .unwrap();

    cmd()
        .arg("review")
        .arg("apply")
        .arg(&corrections)
        .arg("--output")
        .arg(dir.path())
        .assert()
        .success();

    let batch_csv = fs::read_to_string(dir.path().join("csv/Batch_01.csv")).unwrap();
    assert!(batch_csv.contains("Lincke, Paul"));
    let merged = fs::read_to_string(dir.path().join("metadata_vlm_complete.csv")).unwrap();
    assert!(merged.contains("Lincke, Paul"));
}
