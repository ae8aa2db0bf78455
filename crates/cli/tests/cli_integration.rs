// PicoCheck - QEMU Board Smoke Tests
// Copyright (C) 2026 Andrii Shylenko
//
// This software is released under the MIT License.
// See the LICENSE file in the project root for full license information.

use serde_json::Value;
use std::path::PathBuf;
use std::process::{Command, Output};

fn picocheck(args: &[&str]) -> Output {
    Command::new(env!("CARGO_BIN_EXE_picocheck"))
        .args(args)
        .output()
        .expect("Failed to execute command")
}

fn stdout_json(output: &Output) -> Value {
    serde_json::from_slice(&output.stdout).unwrap_or_else(|e| {
        panic!(
            "stdout is not JSON ({}): {}\nstderr: {}",
            e,
            String::from_utf8_lossy(&output.stdout),
            String::from_utf8_lossy(&output.stderr)
        )
    })
}

fn workspace_root() -> PathBuf {
    PathBuf::from(env!("CARGO_MANIFEST_DIR"))
        .parent()
        .unwrap()
        .parent()
        .unwrap()
        .to_path_buf()
}

#[test]
fn test_help_lists_subcommands() {
    let output = picocheck(&["--help"]);
    assert!(output.status.success());
    let stdout = String::from_utf8_lossy(&output.stdout);
    assert!(stdout.contains("test"));
    assert!(stdout.contains("flash"));
    assert!(stdout.contains("fetch"));
}

#[test]
fn test_flash_pads_to_pico_size() {
    let dir = tempfile::tempdir().unwrap();
    let input = dir.path().join("hello_serial.bin");
    let output_path = dir.path().join("raspi_pico_flash.bin");
    std::fs::write(&input, vec![0xA5; 1000]).unwrap();

    let output = picocheck(&[
        "flash",
        "--input",
        input.to_str().unwrap(),
        "--output",
        output_path.to_str().unwrap(),
    ]);

    assert!(output.status.success());
    let report = stdout_json(&output);
    assert_eq!(report["size"], 2 * 1024 * 1024);
    assert_eq!(report["payload_len"], 1000);
    assert_eq!(report["padding_len"], 2 * 1024 * 1024 - 1000);

    let image = std::fs::read(&output_path).unwrap();
    assert_eq!(image.len(), 2 * 1024 * 1024);
    assert!(image[..1000].iter().all(|&b| b == 0xA5));
    assert!(image[1000..].iter().all(|&b| b == 0));
}

#[test]
fn test_flash_custom_size() {
    let dir = tempfile::tempdir().unwrap();
    let input = dir.path().join("fw.bin");
    let output_path = dir.path().join("flash.bin");
    std::fs::write(&input, b"boot").unwrap();

    let output = picocheck(&[
        "flash",
        "--input",
        input.to_str().unwrap(),
        "--output",
        output_path.to_str().unwrap(),
        "--size",
        "4KiB",
    ]);

    assert!(output.status.success());
    assert_eq!(std::fs::metadata(&output_path).unwrap().len(), 4096);
}

#[test]
fn test_flash_rejects_oversized_input() {
    let dir = tempfile::tempdir().unwrap();
    let input = dir.path().join("fw.bin");
    let output_path = dir.path().join("flash.bin");
    std::fs::write(&input, vec![0xFF; 2 * 1024 * 1024 + 1]).unwrap();

    let output = picocheck(&[
        "flash",
        "--input",
        input.to_str().unwrap(),
        "--output",
        output_path.to_str().unwrap(),
    ]);

    assert_eq!(output.status.code(), Some(2));
    assert!(String::from_utf8_lossy(&output.stderr).contains("too large"));
    assert!(!output_path.exists());
}

#[test]
fn test_flash_invalid_size() {
    let dir = tempfile::tempdir().unwrap();
    let input = dir.path().join("fw.bin");
    std::fs::write(&input, b"boot").unwrap();

    let output = picocheck(&[
        "flash",
        "--input",
        input.to_str().unwrap(),
        "--output",
        dir.path().join("flash.bin").to_str().unwrap(),
        "--size",
        "lots",
    ]);

    assert_eq!(output.status.code(), Some(2));
}

#[test]
fn test_fetch_local_asset_into_cache() {
    let dir = tempfile::tempdir().unwrap();
    let asset = dir.path().join("hello_serial.bin");
    std::fs::write(&asset, b"abc").unwrap();
    let cache = dir.path().join("cache");

    // SHA-1("abc")
    let output = picocheck(&[
        "fetch",
        "--url",
        asset.to_str().unwrap(),
        "--sha1",
        "a9993e364706816aba3e25717850c26c9cd0d89d",
        "--cache-dir",
        cache.to_str().unwrap(),
    ]);

    assert!(output.status.success());
    let report = stdout_json(&output);
    let cached = PathBuf::from(report["path"].as_str().unwrap());
    assert!(cached.starts_with(&cache));
    assert_eq!(std::fs::read(&cached).unwrap(), b"abc");
}

#[test]
fn test_fetch_hash_mismatch() {
    let dir = tempfile::tempdir().unwrap();
    let asset = dir.path().join("hello_serial.bin");
    std::fs::write(&asset, b"not the pico firmware").unwrap();

    let output = picocheck(&[
        "fetch",
        "--url",
        asset.to_str().unwrap(),
        "--sha1",
        "b1e9ff03e92320553d653d4f1de5375a325c44f9",
        "--cache-dir",
        dir.path().join("cache").to_str().unwrap(),
    ]);

    assert_eq!(output.status.code(), Some(2));
    assert!(String::from_utf8_lossy(&output.stderr).contains("Hash mismatch"));
}

#[test]
fn test_invalid_scenario_writes_config_error() {
    let dir = tempfile::tempdir().unwrap();
    let script = dir.path().join("scenario.yaml");
    std::fs::write(
        &script,
        r#"
schema_version: "2.0"
name: broken
inputs:
  asset:
    url: "hello_serial.bin"
assertions:
  - console_contains: "Hello, world!"
"#,
    )
    .unwrap();
    let artifacts = dir.path().join("artifacts");

    let output = picocheck(&[
        "test",
        "--script",
        script.to_str().unwrap(),
        "--output-dir",
        artifacts.to_str().unwrap(),
    ]);

    assert_eq!(output.status.code(), Some(2));
    let result: Value =
        serde_json::from_str(&std::fs::read_to_string(artifacts.join("result.json")).unwrap())
            .unwrap();
    assert_eq!(result["status"], "error");
    assert_eq!(result["stop_reason"], "config_error");
    assert!(result["message"]
        .as_str()
        .unwrap()
        .contains("Unsupported schema_version"));

    let junit = std::fs::read_to_string(artifacts.join("junit.xml")).unwrap();
    assert!(junit.contains("<error message=\"config error\">"));
    assert_eq!(std::fs::read(artifacts.join("console.log")).unwrap(), b"");
}

#[test]
fn test_missing_scenario_file() {
    let dir = tempfile::tempdir().unwrap();
    let junit = dir.path().join("reports").join("junit.xml");

    let output = picocheck(&[
        "test",
        "--script",
        dir.path().join("nope.yaml").to_str().unwrap(),
        "--junit",
        junit.to_str().unwrap(),
    ]);

    assert_eq!(output.status.code(), Some(2));
    assert!(junit.exists());
}

#[test]
fn test_zero_timeout_rejected() {
    let script = workspace_root().join("configs/scenarios/raspi_pico_serial.yaml");
    let output = picocheck(&[
        "test",
        "--script",
        script.to_str().unwrap(),
        "--timeout-ms",
        "0",
    ]);
    assert_eq!(output.status.code(), Some(2));
}
