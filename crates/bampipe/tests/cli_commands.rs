#![cfg(feature = "cli")]

use std::path::PathBuf;
use std::process::{Command, Output};

const TABLE: &str = r#"{
    "num_pipes": 8,
    "fifo_base_addr": 301989888,
    "pipes": [
        { "label": "hsusb-a2-in-0", "mem_type": "system", "bam": "hsusb",
          "peer": "a2", "dir": "peer_to_local", "pipe_num": 0,
          "src_phys_addr": 305659904, "src_pipe_index": 5,
          "dst_phys_addr": 305397760, "dst_pipe_index": 0,
          "data_fifo_size": 4096, "desc_fifo_size": 512 },
        { "label": "hsic-a2-in-0", "mem_type": "off_chip", "bam": "hsic",
          "peer": "a2", "dir": "peer_to_local", "pipe_num": 0,
          "src_phys_addr": 318767104, "src_pipe_index": 6,
          "dst_phys_addr": 319815680, "dst_pipe_index": 1,
          "data_fifo_offset": 8192, "data_fifo_size": 2048,
          "desc_fifo_offset": 10240, "desc_fifo_size": 512 }
    ]
}"#;

fn unique_temp_dir(tag: &str) -> PathBuf {
    let dir = std::env::temp_dir().join(format!(
        "bampipe-cli-{tag}-{}-{}",
        std::process::id(),
        std::time::SystemTime::now()
            .duration_since(std::time::UNIX_EPOCH)
            .expect("time should be after epoch")
            .as_nanos()
    ));
    std::fs::create_dir_all(&dir).expect("temp dir should be creatable");
    dir
}

fn write_table(tag: &str, contents: &str) -> (PathBuf, PathBuf) {
    let dir = unique_temp_dir(tag);
    let path = dir.join("pipes.json");
    std::fs::write(&path, contents).expect("table should be writable");
    (dir, path)
}

fn bampipe(args: &[&str]) -> Output {
    Command::new(env!("CARGO_BIN_EXE_bampipe"))
        .args(["--log-level", "error"])
        .args(args)
        .output()
        .expect("bampipe should run")
}

#[test]
fn check_reports_valid_table_as_json() {
    let (dir, path) = write_table("check", TABLE);
    let output = bampipe(&["--format", "json", "check", path.to_str().unwrap()]);

    assert!(output.status.success());
    let stdout = String::from_utf8_lossy(&output.stdout);
    assert!(stdout.contains("pipe-table-check.schema.json"));
    assert!(stdout.contains("\"valid\":true"));
    assert!(stdout.contains("\"label\":\"hsic-a2-in-0\""));

    let _ = std::fs::remove_dir_all(&dir);
}

#[test]
fn check_rejects_malformed_table_with_data_invalid() {
    let (dir, path) = write_table("invalid", r#"{ "num_pipes": 8, "pipes": [ { "label": "x" } ] }"#);
    let output = bampipe(&["check", path.to_str().unwrap()]);

    assert_eq!(output.status.code(), Some(60));
    let stderr = String::from_utf8_lossy(&output.stderr);
    assert!(stderr.contains("error:"));

    let _ = std::fs::remove_dir_all(&dir);
}

#[test]
fn check_missing_file_is_a_failure() {
    let dir = unique_temp_dir("missing");
    let path = dir.join("absent.json");
    let output = bampipe(&["check", path.to_str().unwrap()]);

    assert_eq!(output.status.code(), Some(1));

    let _ = std::fs::remove_dir_all(&dir);
}

#[test]
fn timers_apply_settings_and_print_them() {
    let (dir, path) = write_table("timers", TABLE);
    let output = bampipe(&[
        "--format",
        "pretty",
        "timers",
        path.to_str().unwrap(),
        "--set",
        "hsusb 100,hsic 0",
    ]);

    assert!(output.status.success());
    let stdout = String::from_utf8_lossy(&output.stdout);
    assert!(stdout.contains("hsusb: 100ms"));
    assert!(stdout.contains("hsic: 0ms"));

    let _ = std::fs::remove_dir_all(&dir);
}

#[test]
fn timers_unknown_instance_is_a_usage_error() {
    let (dir, path) = write_table("timers-bad", TABLE);
    let output = bampipe(&["timers", path.to_str().unwrap(), "--set", "ufs 1"]);

    assert_eq!(output.status.code(), Some(64));

    let _ = std::fs::remove_dir_all(&dir);
}

#[test]
fn timers_help_prints_usage() {
    let (dir, path) = write_table("timers-help", TABLE);
    let output = bampipe(&["timers", path.to_str().unwrap(), "--set", "help"]);

    assert!(output.status.success());
    let stdout = String::from_utf8_lossy(&output.stdout);
    assert!(stdout.starts_with("Usage:"));

    let _ = std::fs::remove_dir_all(&dir);
}

#[test]
fn simulate_connects_every_pipe() {
    let (dir, path) = write_table("simulate", TABLE);
    let output = bampipe(&["--format", "json", "simulate", path.to_str().unwrap()]);

    assert!(output.status.success());
    let stdout = String::from_utf8_lossy(&output.stdout);
    let report: serde_json::Value =
        serde_json::from_str(stdout.trim()).expect("report should be json");
    assert_eq!(report["counters_consistent"], serde_json::Value::Bool(true));
    let pipes = report["pipes"].as_array().expect("pipes should be an array");
    assert_eq!(pipes.len(), 2);
    assert!(pipes.iter().all(|pipe| pipe["connected"] == true));
    assert!(report["disconnected"]
        .as_array()
        .expect("instances should be an array")
        .iter()
        .all(|inst| inst["enabled_pipes"] == 0));

    let _ = std::fs::remove_dir_all(&dir);
}

#[test]
fn simulate_with_handshake_records_a_full_cycle() {
    let (dir, path) = write_table("handshake", TABLE);
    let output = bampipe(&[
        "--format",
        "json",
        "simulate",
        path.to_str().unwrap(),
        "--handshake",
    ]);

    assert!(output.status.success());
    let report: serde_json::Value =
        serde_json::from_slice(&output.stdout).expect("report should be json");
    let handshake = report["handshake"]
        .as_array()
        .expect("handshake should be an array");
    let init = serde_json::Value::from("init");
    assert_eq!(handshake.first().map(|t| &t["from"]), Some(&init));
    assert_eq!(handshake.last().map(|t| &t["to"]), Some(&init));

    let _ = std::fs::remove_dir_all(&dir);
}

#[test]
fn version_prints_package_version() {
    let output = bampipe(&["version"]);

    assert!(output.status.success());
    let stdout = String::from_utf8_lossy(&output.stdout);
    assert_eq!(
        stdout.trim(),
        format!("bampipe {}", env!("CARGO_PKG_VERSION"))
    );
}
