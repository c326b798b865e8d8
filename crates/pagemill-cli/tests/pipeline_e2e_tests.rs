//! End-to-end tests for the pagemill binary
//!
//! These tests drive the real executable against manifests in temporary
//! folders:
//! - Scanning a documents folder and reading status back
//! - Draining a step in-process and with a worker pool
//! - Batch stages, resume, and per-item failures
//! - Resetting failed items
//! - Exit codes for usage and fatal errors

use assert_cmd::Command;
use predicates::prelude::*;
use serde_json::Value;
use std::fs;
use std::path::{Path, PathBuf};
use tempfile::TempDir;

fn pagemill(cwd: &Path) -> Command {
    let mut cmd = Command::cargo_bin("pagemill").unwrap();
    cmd.current_dir(cwd)
        .env("PAGEMILL_NO_PROGRESS", "1")
        .env("NO_COLOR", "1")
        .env_remove("PAGEMILL_WORKER")
        .env_remove("PAGEMILL_WORKER_ID")
        .env("PAGEMILL_BASE_DELAY_MS", "5");
    cmd
}

/// `project/documents/<box>/<n>.jpg` for every name given
fn project_with(names: &[&str]) -> TempDir {
    let dir = TempDir::new().unwrap();
    for name in names {
        let path = dir.path().join("documents").join(name);
        fs::create_dir_all(path.parent().unwrap()).unwrap();
        fs::write(&path, name.as_bytes()).unwrap();
    }
    dir
}

fn scan(dir: &TempDir, steps: &[&str]) -> PathBuf {
    let mut cmd = pagemill(dir.path());
    cmd.args(["scan", "documents"]);
    for step in steps {
        cmd.args(["--step", step]);
    }
    cmd.assert().success();
    dir.path().join("manifest.jsonl")
}

fn status_json(dir: &TempDir, step: &str) -> Value {
    let output = pagemill(dir.path())
        .args(["status", "--json", "--step", step])
        .output()
        .unwrap();
    assert!(output.status.success());
    let summaries: Value = serde_json::from_slice(&output.stdout).unwrap();
    summaries[0].clone()
}

fn manifest_lines(path: &Path) -> Vec<Value> {
    fs::read_to_string(path)
        .unwrap()
        .lines()
        .map(|l| serde_json::from_str(l).unwrap())
        .collect()
}

// ============================================================================
// Scan and status
// ============================================================================

#[test]
fn test_scan_then_status() {
    let dir = project_with(&["box1/p2.jpg", "box1/p10.jpg", "box2/p1.png", "notes.txt"]);
    let manifest = scan(&dir, &["rotate"]);

    let lines = manifest_lines(&manifest);
    let files: Vec<&str> = lines
        .iter()
        .filter(|l| l["type"] == "file")
        .map(|l| l["input_path"].as_str().unwrap())
        .collect();
    assert_eq!(
        files,
        vec!["documents/box1/p2.jpg", "documents/box1/p10.jpg", "documents/box2/p1.png"]
    );

    pagemill(dir.path())
        .arg("status")
        .assert()
        .success()
        .stdout(predicate::str::contains("rotate"))
        .stdout(predicate::str::contains("Pending:     3"));
}

#[test]
fn test_rescan_keeps_step_state() {
    let dir = project_with(&["a.jpg"]);
    scan(&dir, &["rotate"]);
    pagemill(dir.path()).args(["run", "rotate", "--workers", "1"]).assert().success();

    fs::write(dir.path().join("documents/b.jpg"), b"b").unwrap();
    scan(&dir, &["rotate"]);

    let summary = status_json(&dir, "rotate");
    assert_eq!(summary["done"], 1);
    assert_eq!(summary["pending"], 1);
}

// ============================================================================
// Run
// ============================================================================

#[test]
fn test_run_single_worker_copies_everything() {
    let dir = project_with(&["box1/a.jpg", "box1/b.jpg", "box2/c.jpg"]);
    scan(&dir, &[]);

    pagemill(dir.path())
        .args(["run", "copy", "--workers", "1"])
        .assert()
        .success()
        .stdout(predicate::str::contains("Processed: 3"))
        .stdout(predicate::str::contains("Total:     3"))
        .stdout(predicate::str::contains("Step:      3 done, 0 failed, 0 remaining"));

    assert_eq!(
        fs::read(dir.path().join("copy/documents/box2/c.jpg")).unwrap(),
        b"box2/c.jpg"
    );
    let summary = status_json(&dir, "copy");
    assert_eq!(summary["done"], 3);
    assert_eq!(summary["pending"], 0);

    pagemill(dir.path())
        .args(["run", "copy", "--workers", "1"])
        .assert()
        .success()
        .stdout(predicate::str::contains("Nothing to do"));
}

#[test]
fn test_worker_pool_processes_each_item_once() {
    let names: Vec<String> = (0..24).map(|i| format!("box/p{i}.jpg")).collect();
    let refs: Vec<&str> = names.iter().map(String::as_str).collect();
    let dir = project_with(&refs);
    let manifest = scan(&dir, &["copy"]);

    pagemill(dir.path())
        .args(["run", "copy", "--workers", "3"])
        .assert()
        .success();

    let summary = status_json(&dir, "copy");
    assert_eq!(summary["done"], 24);
    assert_eq!(summary["processing"], 0);

    let workers: std::collections::HashSet<String> = manifest_lines(&manifest)
        .iter()
        .filter(|l| l["type"] == "file")
        .map(|l| l["steps"]["copy"]["worker"].as_str().unwrap().to_string())
        .collect();
    assert!(workers.iter().all(|w| ["0", "1", "2"].contains(&w.as_str())));
    for name in &names {
        assert!(dir.path().join("copy/documents").join(name).exists());
    }
}

#[test]
fn test_failed_items_do_not_fail_the_run_and_can_be_reset() {
    let dir = project_with(&["a.jpg", "b.jpg"]);
    scan(&dir, &["copy"]);
    fs::remove_file(dir.path().join("documents/b.jpg")).unwrap();

    pagemill(dir.path())
        .args(["run", "copy", "--workers", "1"])
        .assert()
        .success()
        .stdout(predicate::str::contains("Processed: 1"))
        .stdout(predicate::str::contains("Failed:    1"))
        .stdout(predicate::str::contains("documents/b.jpg: cannot copy"))
        .stdout(predicate::str::contains("pagemill reset copy"));

    pagemill(dir.path())
        .args(["status", "--step", "copy"])
        .assert()
        .success()
        .stdout(predicate::str::contains("documents/b.jpg"))
        .stdout(predicate::str::contains("pagemill reset copy"));

    // Errored items are terminal until reset
    pagemill(dir.path())
        .args(["run", "copy", "--workers", "1"])
        .assert()
        .success()
        .stdout(predicate::str::contains("Nothing to do"));

    fs::write(dir.path().join("documents/b.jpg"), b"b").unwrap();
    pagemill(dir.path())
        .args(["reset", "copy"])
        .assert()
        .success()
        .stdout(predicate::str::contains("1 items"));
    pagemill(dir.path())
        .args(["run", "copy", "--workers", "1"])
        .assert()
        .success();

    let summary = status_json(&dir, "copy");
    assert_eq!(summary["done"], 2);
    assert_eq!(summary["error"], 0);
}

#[test]
fn test_enqueue_enables_step() {
    let dir = project_with(&["a.jpg", "b.jpg"]);
    scan(&dir, &[]);

    pagemill(dir.path())
        .args(["enqueue", "ocr"])
        .assert()
        .success()
        .stdout(predicate::str::contains("2 files enabled"));
    assert_eq!(status_json(&dir, "ocr")["pending"], 2);
}

// ============================================================================
// Batch
// ============================================================================

#[test]
fn test_batch_from_directory_then_resume_skips_done() {
    let dir = project_with(&["a.jpg", "b.jpg", "c.jpg"]);

    pagemill(dir.path())
        .args(["batch", "clean", "--input-dir", "documents", "--output", "out", "--batch-size", "2"])
        .assert()
        .success()
        .stdout(predicate::str::contains("Processed: 3"));

    assert!(dir.path().join("out/a.jpg").exists());
    assert_eq!(manifest_lines(&dir.path().join("out/clean_manifest.jsonl")).len(), 3);
    assert!(dir.path().join("out/clean_progress.jsonl").exists());

    fs::write(dir.path().join("documents/d.jpg"), b"d").unwrap();
    pagemill(dir.path())
        .args(["batch", "clean", "--input-dir", "documents", "--output", "out"])
        .assert()
        .success()
        .stdout(predicate::str::contains("Resuming 'clean'"))
        .stdout(predicate::str::contains("Processed: 1"))
        .stdout(predicate::str::contains("Skipped:   3"));
}

#[test]
fn test_batch_from_upstream_manifest() {
    let dir = project_with(&["a.jpg", "b.jpg"]);
    scan(&dir, &[]);

    pagemill(dir.path())
        .args([
            "batch",
            "clean",
            "--input-manifest",
            "manifest.jsonl",
            "--use-source",
            "--base",
            ".",
            "--output",
            "cleaned",
        ])
        .assert()
        .success()
        .stdout(predicate::str::contains("Total:     2"));

    assert!(dir.path().join("cleaned/documents/a.jpg").exists());
}

#[cfg(unix)]
#[test]
fn test_batch_command_failures_are_listed() {
    let dir = project_with(&["a.jpg", "b.jpg"]);

    pagemill(dir.path())
        .args([
            "batch",
            "inspect",
            "--input-dir",
            "documents",
            "--output",
            "out",
            "--processor",
            "command",
            "--exec",
            "false {input}",
        ])
        .assert()
        .success()
        .stdout(predicate::str::contains("Failed:    2"))
        .stdout(predicate::str::contains("'false' exited with 1"));
}

// ============================================================================
// Errors
// ============================================================================

#[test]
fn test_missing_subcommand_is_usage_error() {
    let dir = TempDir::new().unwrap();
    pagemill(dir.path())
        .assert()
        .code(2)
        .stderr(predicate::str::contains("subcommand is required"));
}

#[test]
fn test_command_processor_without_exec_is_usage_error() {
    let dir = project_with(&["a.jpg"]);
    scan(&dir, &["x"]);
    pagemill(dir.path())
        .args(["run", "x", "--processor", "command"])
        .assert()
        .code(2)
        .stderr(predicate::str::contains("--exec"));
}

#[test]
fn test_missing_manifest_is_fatal() {
    let dir = TempDir::new().unwrap();
    pagemill(dir.path())
        .args(["status", "--manifest", "nope.jsonl"])
        .assert()
        .code(1)
        .stderr(predicate::str::contains("File not found"));

    pagemill(dir.path())
        .args(["batch", "clean", "--input-manifest", "nope.jsonl", "--output", "out"])
        .assert()
        .code(1);
}

#[test]
fn test_malformed_manifest_is_reported() {
    let dir = TempDir::new().unwrap();
    fs::write(dir.path().join("manifest.jsonl"), "{\"input_path\":\"a\",\"type\":\"file\"}\nnot json\n").unwrap();
    pagemill(dir.path())
        .arg("status")
        .assert()
        .code(1)
        .stderr(predicate::str::contains("line 2"));
}
