//! Integration tests for the convoy binary

use assert_cmd::Command;
use predicates::prelude::*;

#[test]
fn test_help_output() {
    let mut cmd = Command::cargo_bin("convoy").unwrap();
    cmd.arg("--help")
        .assert()
        .success()
        .stdout(predicate::str::contains("Usage: convoy"));
}

#[test]
fn test_version_output() {
    let mut cmd = Command::cargo_bin("convoy").unwrap();
    cmd.arg("--version")
        .assert()
        .success()
        .stdout(predicate::str::contains("convoy"));
}

#[test]
fn test_process_reports_every_item() {
    let mut cmd = Command::cargo_bin("convoy").unwrap();
    cmd.args(["--workers", "2", "process", "--items", "6", "--limit", "2", "--delay-ms", "1"])
        .assert()
        .success()
        .stdout(predicate::str::contains("Processed 6 item(s)"));
}

#[test]
fn test_process_surfaces_injected_failure() {
    let mut cmd = Command::cargo_bin("convoy").unwrap();
    cmd.args(["--workers", "2", "process", "--items", "3", "--limit", "2", "--fail-on", "2"])
        .assert()
        .failure()
        .stderr(predicate::str::contains("item 2 failed"));
}

#[test]
fn test_zero_limit_rejected() {
    let mut cmd = Command::cargo_bin("convoy").unwrap();
    cmd.args(["process", "--limit", "0"])
        .assert()
        .failure()
        .stderr(predicate::str::contains("--limit must be at least 1"));
}

#[test]
fn test_group_times_out() {
    let mut cmd = Command::cargo_bin("convoy").unwrap();
    cmd.args(["--workers", "1", "group", "--units", "2", "--step-ms", "200", "--timeout-ms", "50"])
        .assert()
        .failure()
        .stderr(predicate::str::contains("timed out"));
}

#[test]
fn test_tick_stops_after_count() {
    let mut cmd = Command::cargo_bin("convoy").unwrap();
    cmd.args(["--workers", "1", "tick", "--interval-ms", "5", "--count", "3"])
        .assert()
        .success()
        .stdout(predicate::str::contains("tick 3"))
        .stdout(predicate::str::contains("tick 4").not());
}
