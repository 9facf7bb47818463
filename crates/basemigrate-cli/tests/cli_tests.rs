//! CLI integration tests for basemigrate.
//!
//! These tests verify command-line argument parsing, help output,
//! and exit codes for configuration errors. No live endpoints needed.

use assert_cmd::Command;
use predicates::prelude::*;
use std::io::Write;

/// Get a command for the basemigrate binary.
fn cmd() -> Command {
    Command::cargo_bin("basemigrate").unwrap()
}

#[test]
fn test_help_shows_all_commands() {
    cmd()
        .arg("--help")
        .assert()
        .success()
        .stdout(predicate::str::contains("run"))
        .stdout(predicate::str::contains("check"));
}

#[test]
fn test_run_subcommand_help() {
    cmd()
        .args(["run", "--help"])
        .assert()
        .success()
        .stdout(predicate::str::contains("--dry-run"))
        .stdout(predicate::str::contains("--yes"))
        .stdout(predicate::str::contains("--temp-dir"));
}

#[test]
fn test_version_flag() {
    cmd()
        .arg("--version")
        .assert()
        .success()
        .stdout(predicate::str::contains("basemigrate"));
}

#[test]
fn test_missing_config_file_fails() {
    cmd()
        .args(["--config", "/nonexistent/config.yaml", "check"])
        .assert()
        .failure()
        .stderr(predicate::str::contains("Error"));
}

#[test]
fn test_invalid_config_reports_validation_error() {
    let mut file = tempfile::NamedTempFile::new().unwrap();
    // Both credential schemes set on source: must be rejected.
    writeln!(
        file,
        "source:\n  db_url: postgres://u:p@db.src.example.com/postgres\n  api_url: https://src.example.com\n  service_key: a\n  secret_key: b\ntarget:\n  db_url: postgres://u:p@db.dst.example.com/postgres\n  api_url: https://dst.example.com\n  service_key: c\n"
    )
    .unwrap();

    cmd()
        .args(["--config", file.path().to_str().unwrap(), "check"])
        .assert()
        .failure()
        .code(2)
        .stderr(predicate::str::contains("mutually exclusive"));
}

#[test]
fn test_bad_verbosity_defaults_to_info() {
    // Unknown verbosity is tolerated, not an error; missing config is the
    // failure we expect here.
    cmd()
        .args(["--verbosity", "chatty", "--config", "/nonexistent.yaml", "check"])
        .assert()
        .failure();
}
