//! CLI integration tests for dbclone.
//!
//! These tests verify command-line argument parsing, help output,
//! exit codes for error conditions, and a few commands against SQLite files.

use assert_cmd::Command;
use predicates::prelude::*;
use std::io::Write;
use std::path::Path;

/// Get a command for the dbclone binary.
fn cmd() -> Command {
    Command::cargo_bin("dbclone").unwrap()
}

/// Write a config cloning one SQLite file into another.
fn sqlite_config(dir: &Path, extra: &str) -> tempfile::NamedTempFile {
    let mut file = tempfile::NamedTempFile::new().unwrap();
    write!(
        file,
        r#"
source:
  name: source
  driver: sqlite
  database: {source}
targets:
  - name: replica
    driver: sqlite
    database: {target}
{extra}
"#,
        source = dir.join("source.db").display(),
        target = dir.join("target.db").display(),
        extra = extra,
    )
    .unwrap();
    file
}

// =============================================================================
// Help and Version Tests
// =============================================================================

#[test]
fn test_help_shows_all_commands() {
    cmd()
        .arg("--help")
        .assert()
        .success()
        .stdout(predicate::str::contains("run"))
        .stdout(predicate::str::contains("validate"))
        .stdout(predicate::str::contains("health-check"))
        .stdout(predicate::str::contains("inspect"))
        .stdout(predicate::str::contains("ddl"));
}

#[test]
fn test_run_subcommand_help() {
    cmd()
        .args(["run", "--help"])
        .assert()
        .success()
        .stdout(predicate::str::contains("--workers"))
        .stdout(predicate::str::contains("--chunk-size"))
        .stdout(predicate::str::contains("--mode"));
}

#[test]
fn test_version_flag() {
    cmd()
        .arg("--version")
        .assert()
        .success()
        .stdout(predicate::str::contains("dbclone"));
}

// =============================================================================
// Global Flags Tests
// =============================================================================

#[test]
fn test_global_flags_and_defaults() {
    cmd()
        .arg("--help")
        .assert()
        .success()
        .stdout(predicate::str::contains("--shutdown-timeout"))
        .stdout(predicate::str::contains("[default: 60]"))
        .stdout(predicate::str::contains("--log-format"))
        .stdout(predicate::str::contains("[default: text]"))
        .stdout(predicate::str::contains("--verbosity"))
        .stdout(predicate::str::contains("[default: info]"))
        .stdout(predicate::str::contains("--output-json"))
        .stdout(predicate::str::contains("--state-file"))
        .stdout(predicate::str::contains("config.yaml"));
}

#[test]
fn test_unknown_log_format_is_rejected() {
    cmd()
        .args(["--log-format", "xml", "health-check"])
        .assert()
        .failure()
        .stderr(predicate::str::contains("xml"));
}

// =============================================================================
// Exit Code Tests
// =============================================================================

#[test]
fn test_missing_config_exits_with_code_1() {
    cmd()
        .args(["--config", "nonexistent_config_file.yaml", "health-check"])
        .assert()
        .code(1);
}

#[test]
fn test_invalid_yaml_exits_with_code_2() {
    let mut file = tempfile::NamedTempFile::new().unwrap();
    writeln!(file, "invalid: yaml: content: [").unwrap();

    cmd()
        .args(["--config", file.path().to_str().unwrap(), "health-check"])
        .assert()
        .code(2);
}

#[test]
fn test_config_without_targets_exits_with_code_2() {
    let mut file = tempfile::NamedTempFile::new().unwrap();
    writeln!(file, "source:").unwrap();
    writeln!(file, "  name: source").unwrap();
    writeln!(file, "  driver: sqlite").unwrap();
    writeln!(file, "  database: source.db").unwrap();
    writeln!(file, "targets: []").unwrap();

    cmd()
        .args(["--config", file.path().to_str().unwrap(), "health-check"])
        .assert()
        .code(2)
        .stderr(predicate::str::contains("target"));
}

#[test]
fn test_zero_chunk_size_override_exits_with_code_2() {
    let dir = tempfile::tempdir().unwrap();
    let config = sqlite_config(dir.path(), "");

    cmd()
        .args(["--config", config.path().to_str().unwrap()])
        .args(["run", "--chunk-size", "0"])
        .assert()
        .code(2);
}

#[test]
fn test_unknown_mode_is_rejected() {
    cmd()
        .args(["run", "--mode", "merge"])
        .assert()
        .failure()
        .stderr(predicate::str::contains("merge"));
}

#[test]
fn test_unknown_dialect_is_rejected() {
    cmd()
        .args(["ddl", "--dialect", "oracle"])
        .assert()
        .failure()
        .stderr(predicate::str::contains("oracle"));
}

// =============================================================================
// SQLite Commands
// =============================================================================

#[test]
fn test_health_check_sqlite_is_healthy() {
    let dir = tempfile::tempdir().unwrap();
    let config = sqlite_config(dir.path(), "");

    cmd()
        .args(["--config", config.path().to_str().unwrap(), "health-check"])
        .assert()
        .success()
        .stdout(predicate::str::contains("source (sqlite): OK"))
        .stdout(predicate::str::contains("replica (sqlite): OK"))
        .stdout(predicate::str::contains("HEALTHY"));
}

#[test]
fn test_inspect_empty_database_prints_json() {
    let dir = tempfile::tempdir().unwrap();
    let config = sqlite_config(dir.path(), "");

    cmd()
        .args(["--config", config.path().to_str().unwrap()])
        .args(["inspect", "--connection", "replica"])
        .assert()
        .success()
        .stdout(predicate::str::contains("\"tables\": []"));
}

#[test]
fn test_inspect_unknown_connection_exits_with_code_2() {
    let dir = tempfile::tempdir().unwrap();
    let config = sqlite_config(dir.path(), "");

    cmd()
        .args(["--config", config.path().to_str().unwrap()])
        .args(["inspect", "--connection", "missing"])
        .assert()
        .code(2)
        .stderr(predicate::str::contains("No connection named 'missing'"));
}

#[test]
fn test_run_empty_source_completes() {
    let dir = tempfile::tempdir().unwrap();
    let state = dir.path().join("run.json");
    let config = sqlite_config(dir.path(), "options:\n  synchronize_table_schema: DROP_CREATE");

    cmd()
        .args(["--config", config.path().to_str().unwrap()])
        .args(["--state-file", state.to_str().unwrap(), "--output-json", "run"])
        .assert()
        .success()
        .stdout(predicate::str::contains("\"status\": \"COMPLETED\""));

    let record = std::fs::read_to_string(&state).unwrap();
    assert!(record.contains("\"COMPLETED\""));
    assert!(record.contains("\"hmac\""));
}
