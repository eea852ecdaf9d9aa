use assert_cmd::prelude::*;
use predicates::prelude::*;
use rstest::rstest;
use std::fs;
use std::process::Command;
use tempfile::tempdir;

/// A single poll is never enough for the simulated head to travel, so the
/// first motor wait times out and surfaces as an I/O error.
#[rstest]
fn motor_timeout_bubbles_to_cli() {
    let dir = tempdir().unwrap();
    let toml = r#"
[device]
model = "canon-lide-110"

[scan]
resolution = 150
mode = "color"
width_mm = 10.0
height_mm = 4.0

[timeouts]
poll_retries = 1
poll_interval_ms = 0
"#;
    let cfg = dir.path().join("cfg.toml");
    fs::write(&cfg, toml).unwrap();

    let mut cmd = Command::cargo_bin("genesys").unwrap();
    cmd.arg("--config").arg(&cfg).arg("scan");
    cmd.assert()
        .code(11)
        .stderr(predicate::str::contains("What happened:"))
        .stderr(predicate::str::contains("poll_retries"));
}
