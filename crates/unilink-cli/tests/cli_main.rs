//! Basic CLI tests for the unilink command-line interface.

use std::io::Write;

use assert_cmd::Command;
use predicates::prelude::*;

fn unilink() -> Command {
    let mut cmd = Command::cargo_bin("unilink").unwrap();
    cmd.env_remove("UNILINK_CONFIG").env_remove("UNILINK_LOG_JSON");
    cmd
}

/// Test that the CLI binary exists and shows help.
#[test]
fn test_cli_help() {
    unilink()
        .arg("--help")
        .assert()
        .success()
        .stdout(predicate::str::contains("config"))
        .stdout(predicate::str::contains("strategies"))
        .stdout(predicate::str::contains("simulate"));
}

#[test]
fn test_cli_version() {
    unilink()
        .arg("--version")
        .assert()
        .success()
        .stdout(predicate::str::contains("unilink"));
}

#[test]
fn test_no_subcommand_shows_error() {
    unilink().assert().failure();
}

#[test]
fn test_config_show_prints_defaults() {
    unilink()
        .args(["config", "show"])
        .assert()
        .success()
        .stdout(predicate::str::contains("[communicator]"))
        .stdout(predicate::str::contains("reevaluation_threshold = 60"));
}

#[test]
fn test_config_validate_accepts_partial_file() {
    let mut file = tempfile::NamedTempFile::new().unwrap();
    writeln!(file, "[queue]\nmax_size = 5").unwrap();

    unilink()
        .args(["config", "validate"])
        .arg(file.path())
        .assert()
        .success()
        .stdout(predicate::str::contains("ok"))
        .stdout(predicate::str::contains("queue max size 5"));
}

#[test]
fn test_config_validate_rejects_bad_threshold() {
    let mut file = tempfile::NamedTempFile::new().unwrap();
    writeln!(file, "[communicator]\nreevaluation_threshold = 150").unwrap();

    unilink()
        .args(["config", "validate"])
        .arg(file.path())
        .assert()
        .failure();
}

#[test]
fn test_strategies_pick_matter_for_reliability() {
    unilink()
        .args([
            "strategies",
            "--device-type",
            "light",
            "--protocols",
            "ble,mqtt,zigbee",
            "--priority",
            "reliability",
        ])
        .assert()
        .success()
        .stdout(predicate::str::contains("reliability_first"))
        .stdout(predicate::str::contains("Selected matter"));
}

#[test]
fn test_strategies_reject_unknown_protocol() {
    unilink()
        .args(["strategies", "--protocols", "carrier-pigeon"])
        .assert()
        .failure();
}

#[test]
fn test_simulate_json_summary() {
    let output = unilink()
        .args(["simulate", "--json"])
        .assert()
        .success()
        .get_output()
        .stdout
        .clone();
    let summary: serde_json::Value = serde_json::from_slice(&output).unwrap();

    assert_eq!(summary["discovered"].as_array().unwrap().len(), 1);
    let connections = summary["connections"].as_array().unwrap();
    assert_eq!(connections.len(), 4);
    assert!(connections.iter().all(|c| c["connected"] == true));
    let results = summary["results"].as_array().unwrap();
    assert!(results.iter().all(|r| r["status"] == "completed"));
}
