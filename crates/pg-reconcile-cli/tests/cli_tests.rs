//! CLI integration tests for pg-reconcile.
//!
//! These tests verify command-line argument parsing, help output,
//! and exit codes for error conditions that do not need a database.

use assert_cmd::Command;
use predicates::prelude::*;
use std::io::Write;

/// Get a command for the pg-reconcile binary.
fn cmd() -> Command {
    Command::cargo_bin("pg-reconcile").unwrap()
}

fn config_file(yaml: &str) -> tempfile::NamedTempFile {
    let mut file = tempfile::NamedTempFile::new().unwrap();
    write!(file, "{}", yaml).unwrap();
    file
}

const JOBS: &str = r#"
store:
  url: postgres://app@127.0.0.1:1/portal
  connect_timeout_secs: 1
dedup:
  - name: submissions
    table: submissions
    recency_column: submittedAt
    key: [userId, formId]
relink:
  - name: interns
    child:
      table: Intern
      link_column: userId
      match_column: email
    parent:
      table: User
      match_column: email
schema_patch:
  - name: auth
    steps:
      - add_column: { table: users, column: emailVerified, type: boolean }
"#;

// =============================================================================
// Help and Version Tests
// =============================================================================

#[test]
fn test_help_shows_all_commands() {
    cmd()
        .arg("--help")
        .assert()
        .success()
        .stdout(predicate::str::contains("dedup"))
        .stdout(predicate::str::contains("relink"))
        .stdout(predicate::str::contains("rename"))
        .stdout(predicate::str::contains("schema-patch"))
        .stdout(predicate::str::contains("clear-sessions"))
        .stdout(predicate::str::contains("audit"))
        .stdout(predicate::str::contains("health-check"));
}

#[test]
fn test_dedup_subcommand_help() {
    cmd()
        .args(["dedup", "--help"])
        .assert()
        .success()
        .stdout(predicate::str::contains("--dry-run"))
        .stdout(predicate::str::contains("<JOB>"));
}

#[test]
fn test_clear_sessions_subcommand_help() {
    cmd()
        .args(["clear-sessions", "--help"])
        .assert()
        .success()
        .stdout(predicate::str::contains("--yes"))
        .stdout(predicate::str::contains("--all-idle"))
        .stdout(predicate::str::contains("--min-age-secs"));
}

#[test]
fn test_schema_patch_has_no_escalation_flag() {
    cmd()
        .args(["schema-patch", "--help"])
        .assert()
        .success()
        .stdout(predicate::str::contains("--yes").not());
}

#[test]
fn test_version_flag() {
    cmd()
        .arg("--version")
        .assert()
        .success()
        .stdout(predicate::str::contains("pg-reconcile"));
}

// =============================================================================
// Global Flags Tests
// =============================================================================

#[test]
fn test_global_flags_exist() {
    cmd()
        .arg("--help")
        .assert()
        .success()
        .stdout(predicate::str::contains("--output-json"))
        .stdout(predicate::str::contains("--database-url"))
        .stdout(predicate::str::contains("--log-format"))
        .stdout(predicate::str::contains("[default: text]"))
        .stdout(predicate::str::contains("--verbosity"))
        .stdout(predicate::str::contains("[default: info]"));
}

#[test]
fn test_config_default_path() {
    cmd()
        .arg("--help")
        .assert()
        .success()
        .stdout(predicate::str::contains("[default: reconcile.yaml]"));
}

#[test]
fn test_short_config_flag() {
    cmd()
        .args(["-c", "some_config.yaml", "--help"])
        .assert()
        .success();
}

// =============================================================================
// Exit Code Tests
// =============================================================================

#[test]
fn test_missing_config_exits_with_code_7() {
    // Missing file is an IO error (code 7), not config error (code 1)
    cmd()
        .args(["--config", "nonexistent_config_file.yaml", "health-check"])
        .assert()
        .code(7);
}

#[test]
fn test_invalid_yaml_exits_with_code_1() {
    let file = config_file("invalid: yaml: content: [\n");
    cmd()
        .args(["--config", file.path().to_str().unwrap(), "health-check"])
        .assert()
        .code(1);
}

#[test]
fn test_empty_config_exits_with_code_1() {
    let file = tempfile::NamedTempFile::new().unwrap();
    cmd()
        .args(["--config", file.path().to_str().unwrap(), "health-check"])
        .assert()
        .code(1);
}

#[test]
fn test_invalid_job_exits_with_code_1() {
    // A dedup job without a key
    let file = config_file(
        "dedup:\n  - name: broken\n    table: t\n    recency_column: ts\n    key: []\n",
    );
    cmd()
        .args(["--config", file.path().to_str().unwrap(), "list"])
        .assert()
        .code(1)
        .stderr(predicate::str::contains("dedup 'broken'"));
}

#[test]
fn test_unknown_job_exits_with_code_1() {
    let file = config_file(JOBS);
    cmd()
        .args(["--config", file.path().to_str().unwrap(), "dedup", "nope"])
        .assert()
        .code(1)
        .stderr(predicate::str::contains("No dedup job named 'nope'"));
}

#[test]
fn test_audit_resolves_relink_jobs() {
    let file = config_file(JOBS);
    cmd()
        .args(["--config", file.path().to_str().unwrap(), "audit", "submissions"])
        .assert()
        .code(1)
        .stderr(predicate::str::contains("No relink job named 'submissions'"));
}

#[test]
fn test_clear_sessions_requires_confirmation() {
    let file = config_file(JOBS);
    cmd()
        .args(["--config", file.path().to_str().unwrap(), "clear-sessions", "auth"])
        .assert()
        .code(1)
        .stderr(predicate::str::contains("--yes"));
}

#[test]
fn test_unreachable_database_exits_with_code_2() {
    let file = config_file(JOBS);
    cmd()
        .env_remove("DATABASE_URL")
        .args(["--config", file.path().to_str().unwrap(), "health-check"])
        .assert()
        .code(2);
}

// =============================================================================
// List
// =============================================================================

#[test]
fn test_list_shows_jobs_without_connecting() {
    let file = config_file(JOBS);
    cmd()
        .args(["--config", file.path().to_str().unwrap(), "list"])
        .assert()
        .success()
        .stdout(predicate::str::contains("dedup"))
        .stdout(predicate::str::contains("submissions"))
        .stdout(predicate::str::contains("schema-patch"))
        .stdout(predicate::str::contains("auth"));
}

// =============================================================================
// No Subcommand Tests
// =============================================================================

#[test]
fn test_no_subcommand_shows_help() {
    cmd()
        .assert()
        .failure()
        .stderr(predicate::str::contains("Usage:"));
}
