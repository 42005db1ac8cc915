//! E2E tests for the `leasehold` binary.

use assert_cmd::cargo::cargo_bin_cmd;
use predicates::prelude::PredicateBooleanExt;
use predicates::str::contains;
use std::time::Duration;

/// Command isolated from the user's global config, run from an empty
/// project directory.
fn leasehold_cmd() -> (assert_cmd::Command, tempfile::TempDir) {
    let tmp = tempfile::tempdir().expect("create temp project dir");
    let mut cmd: assert_cmd::Command = cargo_bin_cmd!("leasehold");
    cmd.timeout(Duration::from_secs(20));
    cmd.env_remove("RUST_LOG");
    cmd.args([
        "--no-global-config",
        "-C",
        tmp.path().to_str().expect("valid utf8"),
    ]);
    (cmd, tmp)
}

#[test]
fn prints_active_reservations() {
    let (mut cmd, _guard) = leasehold_cmd();
    cmd.args(["-r", "2", "-u", "3", "-n", "8", "--cycle-millis", "10"])
        .assert()
        .success()
        .stdout(contains("STATE"))
        .stdout(contains("Active"))
        .stdout(contains("Failed").not());
}

#[test]
fn oversized_demand_fails_cleanly() {
    let (mut cmd, _guard) = leasehold_cmd();
    cmd.args(["-u", "50", "-n", "6"])
        .assert()
        .success()
        .stdout(contains("Failed"));
}

#[test]
fn json_output_is_parseable() {
    let (mut cmd, _guard) = leasehold_cmd();
    let output = cmd.args(["--json", "-n", "8"]).output().expect("run leasehold");
    assert!(output.status.success());
    let records: serde_json::Value =
        serde_json::from_slice(&output.stdout).expect("stdout is JSON");
    let records = records.as_array().expect("array of records");
    assert_eq!(records.len(), 1);
    assert_eq!(records[0]["state"], "Active");
}

#[test]
fn project_config_is_honoured() {
    let (mut cmd, guard) = leasehold_cmd();
    let dir = guard.path().join(".leasehold");
    std::fs::create_dir_all(&dir).unwrap();
    std::fs::write(
        dir.join("config.toml"),
        "[actor]\ncycle_millis = 42\n\n[policy.inventory]\ngpu = 4\n",
    )
    .unwrap();
    cmd.arg("--print-config")
        .assert()
        .success()
        .stdout(contains("cycle_millis = 42"))
        .stdout(contains("gpu = 4"))
        .stdout(contains("vm = ").not());
}

#[test]
fn file_store_keeps_reservations_across_runs() {
    let (mut first, guard) = leasehold_cmd();
    let data = guard.path().join("data");
    let data = data.to_str().expect("valid utf8").to_string();
    first
        .args(["--data-dir", &data, "-n", "8"])
        .assert()
        .success()
        .stdout(contains("Active"));
    assert!(guard.path().join("data").join("controller").exists());

    let (mut second, _other) = leasehold_cmd();
    let output = second
        .args(["--data-dir", &data, "-n", "8", "--json"])
        .output()
        .expect("run leasehold");
    assert!(output.status.success());
    let records: serde_json::Value = serde_json::from_slice(&output.stdout).unwrap();
    assert_eq!(records.as_array().map(Vec::len), Some(2));
}
