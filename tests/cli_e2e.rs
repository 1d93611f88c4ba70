//! End-to-end CLI tests for the hashfetch binary.

use assert_cmd::Command;
use predicates::prelude::*;
use tempfile::TempDir;

const HASH: &str = "0123456789abcdef0123456789abcdef";

/// Command isolated from the user's config, key and database.
fn hashfetch(dir: &TempDir) -> Command {
    let mut cmd = Command::cargo_bin("hashfetch").unwrap();
    cmd.env("XDG_CONFIG_HOME", dir.path())
        .env("HOME", dir.path())
        .env_remove("HASHFETCH_PRIMARY_KEY")
        .env_remove("RUST_LOG")
        .arg("--db")
        .arg(dir.path().join("hashfetch.db"));
    cmd
}

#[test]
fn test_binary_help_lists_subcommands() {
    let mut cmd = Command::cargo_bin("hashfetch").unwrap();
    cmd.arg("--help")
        .assert()
        .success()
        .stdout(predicate::str::contains("fetch"))
        .stdout(predicate::str::contains("reactivate"))
        .stdout(predicate::str::contains("quota"));
}

#[test]
fn test_binary_version_displays_version() {
    let mut cmd = Command::cargo_bin("hashfetch").unwrap();
    cmd.arg("--version")
        .assert()
        .success()
        .stdout(predicate::str::contains("hashfetch"));
}

#[test]
fn test_binary_invalid_flag_returns_error() {
    let mut cmd = Command::cargo_bin("hashfetch").unwrap();
    cmd.arg("--invalid-flag")
        .assert()
        .failure()
        .stderr(predicate::str::contains("error"));
}

#[test]
fn test_status_on_empty_database() {
    let dir = TempDir::new().unwrap();
    hashfetch(&dir)
        .arg("status")
        .assert()
        .success()
        .stdout(predicate::str::contains("No downloads recorded."));
}

#[test]
fn test_status_json_on_empty_database_is_empty_array() {
    let dir = TempDir::new().unwrap();
    hashfetch(&dir)
        .args(["status", "--json"])
        .assert()
        .success()
        .stdout(predicate::str::contains("[]"));
}

#[test]
fn test_status_unknown_hash_fails() {
    let dir = TempDir::new().unwrap();
    hashfetch(&dir)
        .args(["status", HASH])
        .assert()
        .failure()
        .stderr(predicate::str::contains("no download recorded"));
}

#[test]
fn test_malformed_hash_rejected() {
    let dir = TempDir::new().unwrap();
    hashfetch(&dir)
        .args(["fetch", "xyz"])
        .assert()
        .failure()
        .stderr(predicate::str::contains("32-character hex hash"));
}

#[test]
fn test_quota_without_observations() {
    let dir = TempDir::new().unwrap();
    hashfetch(&dir)
        .arg("quota")
        .assert()
        .success()
        .stdout(predicate::str::contains("No quota observed yet."));
}

#[test]
fn test_fetch_without_sources_fails_and_records_error() {
    let dir = TempDir::new().unwrap();
    hashfetch(&dir)
        .args(["fetch", "--no-progress", HASH])
        .assert()
        .failure()
        .stdout(predicate::str::contains("error"));

    hashfetch(&dir)
        .args(["status", HASH])
        .assert()
        .success()
        .stdout(predicate::str::contains(HASH));
}

#[test]
fn test_missing_explicit_config_fails() {
    let dir = TempDir::new().unwrap();
    hashfetch(&dir)
        .arg("--config")
        .arg(dir.path().join("absent.toml"))
        .arg("status")
        .assert()
        .failure()
        .stderr(predicate::str::contains("failed to load configuration"));
}
