use assert_cmd::prelude::*;
use std::process::Command;

#[test]
fn check_config_accepts_valid_file() {
    let dir = tempfile::tempdir().expect("tempdir");
    let path = dir.path().join("config.json");
    std::fs::write(&path, r#"{"maxOps": 20, "eulaAcceptance": true}"#).expect("write config");

    let assert = Command::cargo_bin("wayfinder")
        .expect("binary")
        .args(["--config", path.to_str().expect("utf8 path"), "check-config"])
        .assert()
        .success();

    let stdout = String::from_utf8_lossy(&assert.get_output().stdout).to_string();
    assert!(stdout.contains("configuration OK"), "stdout: {stdout}");
}

#[test]
fn check_config_reports_ignored_values() {
    let dir = tempfile::tempdir().expect("tempdir");
    let path = dir.path().join("config.json");
    std::fs::write(
        &path,
        r#"{"maxOps": 0, "autoMonitorThreshold": "EXTREME"}"#,
    )
    .expect("write config");

    let assert = Command::cargo_bin("wayfinder")
        .expect("binary")
        .args(["--config", path.to_str().expect("utf8 path"), "check-config"])
        .assert()
        .success();

    let stdout = String::from_utf8_lossy(&assert.get_output().stdout).to_string();
    assert!(stdout.contains("ignored value(s)"), "stdout: {stdout}");
    assert!(stdout.contains("maxOps"), "stdout: {stdout}");
}

#[test]
fn build_info_prints_version() {
    let assert = Command::cargo_bin("wayfinder")
        .expect("binary")
        .arg("build-info")
        .assert()
        .success();

    let stdout = String::from_utf8_lossy(&assert.get_output().stdout).to_string();
    assert!(stdout.starts_with("wayfinder "), "stdout: {stdout}");
}
