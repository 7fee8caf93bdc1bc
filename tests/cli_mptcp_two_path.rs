use serde_json::Value;
use std::fs;
use std::path::PathBuf;
use std::process::Command;
use std::time::{SystemTime, UNIX_EPOCH};

fn unique_temp_dir(prefix: &str) -> PathBuf {
    let nanos = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .expect("time went backwards")
        .as_nanos();
    let dir = std::env::temp_dir().join(format!(
        "mptcp-sim-{prefix}-{}-{nanos}",
        std::process::id()
    ));
    fs::create_dir_all(&dir).expect("create temp dir");
    dir
}

fn write_file(dir: &PathBuf, name: &str, contents: &str) -> PathBuf {
    let path = dir.join(name);
    fs::write(&path, contents).expect("write temp file");
    path
}

#[test]
fn two_path_transfer_reports_intact_data_and_writes_viz_json() {
    let dir = unique_temp_dir("two-path-viz");
    let out_json = dir.join("viz.json");

    let output = Command::new(env!("CARGO_BIN_EXE_mptcp_two_path"))
        .args([
            "--bytes",
            "200000",
            "--bandwidth-mbps",
            "10",
            "--viz-json",
            out_json.to_str().unwrap(),
        ])
        .output()
        .expect("run mptcp_two_path");

    assert!(
        output.status.success(),
        "mptcp_two_path failed: {}",
        String::from_utf8_lossy(&output.stderr)
    );
    let stdout = String::from_utf8_lossy(&output.stdout);
    assert!(stdout.contains("bytes_received=200000"), "stdout: {stdout}");
    assert!(stdout.contains("data_ok=true"), "stdout: {stdout}");
    assert!(stdout.contains("closed=true"), "stdout: {stdout}");

    let text = fs::read_to_string(&out_json).expect("read viz json");
    let v: Value = serde_json::from_str(&text).expect("parse viz json");
    let arr = v.as_array().expect("viz json must be an array");
    assert!(!arr.is_empty(), "viz json should not be empty");
    assert_eq!(arr[0]["kind"], "meta");
    assert!(arr.iter().any(|e| e["kind"] == "mapping_added"));

    let _ = fs::remove_dir_all(&dir);
}

#[test]
fn config_file_and_flags_select_scheduler_and_single_path() {
    let dir = unique_temp_dir("two-path-config");
    let config = write_file(
        &dir,
        "mptcp.json",
        r#"
{
    "scheduler": "round_robin",
    "congestion_control": "uncoupled",
    "tcp": { "mss": 1000 }
}
        "#,
    );

    let output = Command::new(env!("CARGO_BIN_EXE_mptcp_two_path"))
        .args([
            "--bytes",
            "50000",
            "--config",
            config.to_str().unwrap(),
            "--single-path",
        ])
        .output()
        .expect("run mptcp_two_path");

    assert!(
        output.status.success(),
        "mptcp_two_path failed: {}",
        String::from_utf8_lossy(&output.stderr)
    );
    let stdout = String::from_utf8_lossy(&output.stdout);
    assert!(stdout.contains("data_ok=true"), "stdout: {stdout}");
    assert!(stdout.contains("subflows=1"), "stdout: {stdout}");

    let _ = fs::remove_dir_all(&dir);
}

#[test]
fn malformed_config_file_fails() {
    let dir = unique_temp_dir("two-path-bad-config");
    let config = write_file(&dir, "mptcp.json", r#"{ "scheduler": "fastest" }"#);

    let output = Command::new(env!("CARGO_BIN_EXE_mptcp_two_path"))
        .args(["--bytes", "1000", "--config", config.to_str().unwrap()])
        .output()
        .expect("run mptcp_two_path");

    assert!(!output.status.success(), "unknown scheduler name should be rejected");

    let _ = fs::remove_dir_all(&dir);
}
