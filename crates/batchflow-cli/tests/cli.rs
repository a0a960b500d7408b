//! End-to-end tests for the batchflow binary
//!
//! Jobs run with `--dry-run` so no database is needed. Logs go to stderr,
//! which keeps `--json` output on stdout parseable.

use assert_cmd::Command;
use predicates::prelude::*;
use std::path::{Path, PathBuf};
use tempfile::TempDir;

fn batchflow() -> Command {
    let mut cmd = Command::cargo_bin("batchflow").unwrap();
    cmd.env("LOG_LEVEL", "warn")
        .env("ETL_RETRY_MAX_ATTEMPTS", "1")
        .env_remove("DATABASE_URL")
        .env_remove("BATCHFLOW_JOBS");
    cmd
}

fn write_csv(dir: &Path, name: &str, contents: &str) -> PathBuf {
    let path = dir.join(name);
    std::fs::write(&path, contents).unwrap();
    path
}

fn write_jobs(dir: &Path, yaml: &str) -> PathBuf {
    let path = dir.join("jobs.yaml");
    std::fs::write(&path, yaml).unwrap();
    path
}

fn file_job(name: &str, csv: &Path, table: &str, extra: &str) -> String {
    format!(
        "{name}:\n  source:\n    source_kind: file\n    paths: ['{}']\n  target_table: {table}\n  load_strategy: replace\n{extra}",
        csv.display()
    )
}

#[test]
fn test_no_arguments_prints_help() {
    batchflow()
        .assert()
        .failure()
        .stderr(predicate::str::contains("Usage"));
}

#[test]
fn test_validate_lists_jobs() {
    let dir = TempDir::new().unwrap();
    let csv = write_csv(dir.path(), "users.csv", "id,name\n1,ann\n");
    let jobs = write_jobs(dir.path(), &file_job("users", &csv, "raw_data.users", ""));

    batchflow()
        .args(["validate", "--jobs"])
        .arg(&jobs)
        .assert()
        .success()
        .stdout(predicate::str::contains("users"))
        .stdout(predicate::str::contains("raw_data.users"))
        .stdout(predicate::str::contains("1 job(s) valid"));
}

#[test]
fn test_validate_reports_every_problem_with_exit_code_two() {
    let dir = TempDir::new().unwrap();
    let jobs = write_jobs(
        dir.path(),
        "orders:\n  source:\n    source_kind: file\n    paths: [orders.csv]\n  target_table: orders\n  load_strategy: upsert\n\
         users:\n  source:\n    source_kind: file\n    paths: [users.csv]\n  target_table: staging.users\n  load_strategy: append\n",
    );

    batchflow()
        .args(["validate", "--jobs"])
        .arg(&jobs)
        .assert()
        .code(2)
        .stderr(predicate::str::contains("upsert requires conflict_key"))
        .stderr(predicate::str::contains("staging"));
}

#[test]
fn test_dry_run_prints_json_summary() {
    let dir = TempDir::new().unwrap();
    let csv = write_csv(dir.path(), "users.csv", "id,name\n1,ann\n2,bob\n3,cy\n");
    let jobs = write_jobs(dir.path(), &file_job("users", &csv, "raw_data.users", ""));

    let output = batchflow()
        .args(["run", "--dry-run", "--json", "--jobs"])
        .arg(&jobs)
        .output()
        .unwrap();

    assert!(output.status.success(), "{}", String::from_utf8_lossy(&output.stderr));
    let summary: serde_json::Value = serde_json::from_slice(&output.stdout).unwrap();
    assert_eq!(summary["success"], true);
    assert_eq!(summary["jobs"][0]["job_name"], "users");
    assert_eq!(summary["jobs"][0]["status"], "success");
    assert_eq!(summary["jobs"][0]["records_loaded"], 3);
}

#[test]
fn test_failed_job_exits_with_one_and_siblings_still_run() {
    let dir = TempDir::new().unwrap();
    let good = write_csv(dir.path(), "users.csv", "id,name\n1,ann\n");
    let bad = write_csv(dir.path(), "orders.csv", "id,amount\n1,12.5\n2,lots\n");
    let yaml = format!(
        "{}{}",
        file_job(
            "orders",
            &bad,
            "processed_data.orders",
            "  transform_spec:\n    - { op: coerce, column: amount, to: float }\n"
        ),
        file_job("users", &good, "raw_data.users", "")
    );
    let jobs = write_jobs(dir.path(), &yaml);

    batchflow()
        .args(["run", "--dry-run", "--jobs"])
        .arg(&jobs)
        .assert()
        .code(1)
        .stdout(predicate::str::contains("orders"))
        .stdout(predicate::str::contains("failed"))
        .stdout(predicate::str::contains("users"))
        .stdout(predicate::str::contains("success"));
}

#[test]
fn test_only_selects_jobs() {
    let dir = TempDir::new().unwrap();
    let users = write_csv(dir.path(), "users.csv", "id\n1\n");
    let teams = write_csv(dir.path(), "teams.csv", "id\n1\n2\n");
    let yaml = format!(
        "{}{}",
        file_job("users", &users, "users", ""),
        file_job("teams", &teams, "teams", "")
    );
    let jobs = write_jobs(dir.path(), &yaml);

    let output = batchflow()
        .args(["run", "--dry-run", "--json", "--only", "teams", "--jobs"])
        .arg(&jobs)
        .output()
        .unwrap();

    assert!(output.status.success());
    let summary: serde_json::Value = serde_json::from_slice(&output.stdout).unwrap();
    let jobs = summary["jobs"].as_array().unwrap();
    assert_eq!(jobs.len(), 1);
    assert_eq!(jobs[0]["job_name"], "teams");
}

#[test]
fn test_unknown_only_job_exits_with_two() {
    let dir = TempDir::new().unwrap();
    let csv = write_csv(dir.path(), "users.csv", "id\n1\n");
    let jobs = write_jobs(dir.path(), &file_job("users", &csv, "users", ""));

    batchflow()
        .args(["run", "--dry-run", "--only", "payments", "--jobs"])
        .arg(&jobs)
        .assert()
        .code(2)
        .stderr(predicate::str::contains("unknown job 'payments'"));
}

#[test]
fn test_history_without_database_fails() {
    batchflow()
        .args(["history", "--job", "users"])
        .assert()
        .code(2)
        .stderr(predicate::str::contains("DATABASE_URL"));
}
