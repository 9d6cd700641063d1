//! Command-line behaviour of the tokenwatch binary

use predicates::prelude::*;
use tempfile::TempDir;

#[test]
fn test_help_lists_commands() {
    let mut cmd = assert_cmd::cargo_bin_cmd!("tokenwatch");
    cmd.arg("--help");
    cmd.assert()
        .success()
        .stdout(predicate::str::contains("agent"))
        .stdout(predicate::str::contains("watchdog"))
        .stdout(predicate::str::contains("config"))
        .stdout(predicate::str::contains("ping"))
        .stdout(predicate::str::contains("scan"));
}

#[test]
fn test_version_flag() {
    let mut cmd = assert_cmd::cargo_bin_cmd!("tokenwatch");
    cmd.arg("--version");
    cmd.assert()
        .success()
        .stdout(predicate::str::contains(env!("CARGO_PKG_VERSION")));
}

#[test]
fn test_watchdog_help_shows_options() {
    let mut cmd = assert_cmd::cargo_bin_cmd!("tokenwatch");
    cmd.args(["watchdog", "--help"]);
    cmd.assert()
        .success()
        .stdout(predicate::str::contains("--no-backoff"))
        .stdout(predicate::str::contains("--slow"))
        .stdout(predicate::str::contains("--port"));
}

#[test]
fn test_unknown_service_verb_fails() {
    let mut cmd = assert_cmd::cargo_bin_cmd!("tokenwatch");
    cmd.args(["agent", "restart"]);
    cmd.assert()
        .failure()
        .stderr(predicate::str::contains("invalid value 'restart'"));
}

#[test]
fn test_period_and_slow_conflict() {
    let mut cmd = assert_cmd::cargo_bin_cmd!("tokenwatch");
    cmd.args(["watchdog", "run", "--slow", "--period", "7"]);
    cmd.assert().failure().stderr(predicate::str::contains("cannot be used with"));
}

#[test]
fn test_config_push_rejects_malformed_file() {
    let temp_dir = TempDir::new().expect("Failed to create temp directory");
    let file = temp_dir.path().join("push.json");
    std::fs::write(&file, "{ \"reloadTime\": ").unwrap();

    let mut cmd = assert_cmd::cargo_bin_cmd!("tokenwatch");
    cmd.args(["config", "push", "--file"]).arg(&file);
    cmd.assert()
        .failure()
        .stderr(predicate::str::contains("Invalid configuration"));
}

#[test]
fn test_config_push_missing_file() {
    let temp_dir = TempDir::new().expect("Failed to create temp directory");

    let mut cmd = assert_cmd::cargo_bin_cmd!("tokenwatch");
    cmd.args(["config", "push", "--file"]).arg(temp_dir.path().join("absent.json"));
    cmd.assert()
        .failure()
        .stderr(predicate::str::contains("Failed to read"));
}

#[test]
fn test_scan_with_empty_allow_list() {
    let temp_dir = TempDir::new().expect("Failed to create temp directory");
    let config = temp_dir.path().join("config.json");
    std::fs::write(&config, r#"{"reloadTime": "5s", "possibleVendors": []}"#).unwrap();

    let mut cmd = assert_cmd::cargo_bin_cmd!("tokenwatch");
    cmd.args(["scan", "--config"]).arg(&config);
    cmd.assert()
        .success()
        .stdout(predicate::str::contains("No token devices found."))
        .stdout(predicate::str::contains("Candidates: 0 devices"));
}

#[test]
fn test_scan_json_output() {
    let temp_dir = TempDir::new().expect("Failed to create temp directory");
    let config = temp_dir.path().join("config.json");
    std::fs::write(&config, r#"{"possibleVendors": []}"#).unwrap();

    let mut cmd = assert_cmd::cargo_bin_cmd!("tokenwatch");
    cmd.args(["scan", "--json", "--config"]).arg(&config);
    let output = cmd.assert().success().get_output().stdout.clone();

    let value: serde_json::Value = serde_json::from_slice(&output).unwrap();
    assert_eq!(value["summary"]["candidates"], 0);
    assert_eq!(value["devices"].as_array().map(Vec::len), Some(0));
}

#[test]
fn test_scan_rejects_invalid_interval() {
    let temp_dir = TempDir::new().expect("Failed to create temp directory");
    let config = temp_dir.path().join("config.json");
    std::fs::write(&config, r#"{"reloadTime": "10m"}"#).unwrap();

    let mut cmd = assert_cmd::cargo_bin_cmd!("tokenwatch");
    cmd.args(["scan", "--config"]).arg(&config);
    cmd.assert()
        .failure()
        .stderr(predicate::str::contains("Failed to load configuration"));
}
