// PicoCheck - QEMU Board Smoke Tests
// Copyright (C) 2026 Andrii Shylenko
//
// This software is released under the MIT License.
// See the LICENSE file in the project root for full license information.

use picocheck_config::{AssetSpec, Scenario, StopReason};
use picocheck_core::{
    run_scenario, AssetError, AssetFetcher, ConsoleStream, ConsoleWatcher, EmulatorError,
    EmulatorHandle, ScenarioError,
};
use std::path::{Path, PathBuf};
use std::sync::mpsc::Sender;

/// Serves a fixed local file regardless of the requested URL.
struct FixtureFetcher {
    path: PathBuf,
}

impl AssetFetcher for FixtureFetcher {
    fn fetch(&self, _asset: &AssetSpec) -> Result<PathBuf, AssetError> {
        Ok(self.path.clone())
    }
}

struct FailingFetcher;

impl AssetFetcher for FailingFetcher {
    fn fetch(&self, asset: &AssetSpec) -> Result<PathBuf, AssetError> {
        Err(AssetError::Download {
            url: asset.url.clone(),
            message: "connection refused".to_string(),
        })
    }
}

/// In-process emulator replaying scripted console output.
#[derive(Default)]
struct ScriptedEmulator {
    args: Vec<String>,
    output: Vec<&'static str>,
    exit_after_output: bool,
    fail_launch: bool,
    launches: usize,
    shutdowns: usize,
    running: bool,
    tx: Option<Sender<Vec<u8>>>,
    console: Option<ConsoleStream>,
}

impl ScriptedEmulator {
    fn printing(output: &[&'static str]) -> Self {
        Self {
            output: output.to_vec(),
            ..Self::default()
        }
    }
}

impl EmulatorHandle for ScriptedEmulator {
    fn add_arg(&mut self, arg: &str) {
        self.args.push(arg.to_string());
    }

    fn reset_args(&mut self) {
        self.args.clear();
    }

    fn command_line(&self) -> Vec<String> {
        std::iter::once("qemu-system-arm".to_string())
            .chain(self.args.iter().cloned())
            .collect()
    }

    fn launch(&mut self) -> Result<(), EmulatorError> {
        self.launches += 1;
        if self.fail_launch {
            return Err(EmulatorError::Launch {
                binary: "qemu-system-arm".to_string(),
                source: std::io::Error::new(std::io::ErrorKind::NotFound, "not found"),
            });
        }
        let (tx, console) = ConsoleStream::channel();
        for chunk in &self.output {
            tx.send(chunk.as_bytes().to_vec()).unwrap();
        }
        if !self.exit_after_output {
            self.tx = Some(tx);
        }
        self.console = Some(console);
        self.running = true;
        Ok(())
    }

    fn console(&self) -> Option<&ConsoleStream> {
        self.console.as_ref()
    }

    fn is_running(&mut self) -> bool {
        self.running
    }

    fn shutdown(&mut self) -> Result<(), EmulatorError> {
        self.shutdowns += 1;
        self.running = false;
        self.tx = None;
        Ok(())
    }
}

fn scenario(extra: &str) -> Scenario {
    let yaml = format!(
        r#"
schema_version: "1.0"
name: raspi_pico_serial
tags: ["arch:arm", "machine:raspi_pico"]
inputs:
  asset:
    url: "https://example.invalid/hello_serial.bin"
  flash_size: "64KiB"
limits:
  wall_time_ms: 300
{extra}
"#
    );
    Scenario::from_yaml(&yaml).unwrap()
}

const HELLO: &str = r#"
assertions:
  - console_contains: "Hello, world!"
"#;

fn firmware(dir: &Path) -> FixtureFetcher {
    let path = dir.join("hello_serial.bin");
    std::fs::write(&path, [0x00, 0x20, 0x04, 0x20, 0xEF, 0x01, 0x00, 0x10]).unwrap();
    FixtureFetcher { path }
}

#[test]
fn test_pattern_seen_passes_and_shuts_down() {
    let dir = tempfile::tempdir().unwrap();
    let fetcher = firmware(dir.path());
    let mut emulator = ScriptedEmulator::printing(&["boot\r\n", "Hello, ", "world!\r\n"]);
    let mut watcher = ConsoleWatcher::new();

    let report = run_scenario(&scenario(HELLO), &fetcher, &mut emulator, &mut watcher);

    assert!(report.passed(), "{:?}", report.outcome);
    assert_eq!(report.stop_reason(), StopReason::PatternMatched);
    assert_eq!(report.matches.len(), 1);
    assert_eq!(report.matches[0].offset, 6);
    assert_eq!(emulator.launches, 1);
    assert_eq!(emulator.shutdowns, 1);
    assert!(!emulator.is_running());
}

#[test]
fn test_drive_and_display_arguments() {
    let dir = tempfile::tempdir().unwrap();
    let fetcher = firmware(dir.path());
    let mut emulator = ScriptedEmulator::printing(&["Hello, world!"]);
    let mut watcher = ConsoleWatcher::new();

    let report = run_scenario(&scenario(HELLO), &fetcher, &mut emulator, &mut watcher);

    let flash = report.flash.as_ref().unwrap();
    assert_eq!(flash.path, dir.path().join("raspi_pico_flash.bin"));
    assert_eq!(flash.total_len(), 64 * 1024);
    assert_eq!(
        emulator.args,
        vec![
            "-drive".to_string(),
            format!("if=mtd,format=raw,file={}", flash.path.display()),
            "-nographic".to_string(),
        ]
    );
    assert_eq!(report.command_line[0], "qemu-system-arm");
    assert_eq!(report.flash_sha256.as_ref().unwrap().len(), 64);

    let image = std::fs::read(&flash.path).unwrap();
    assert_eq!(image.len(), 64 * 1024);
    assert_eq!(&image[..8], &[0x00, 0x20, 0x04, 0x20, 0xEF, 0x01, 0x00, 0x10]);
    assert!(image[8..].iter().all(|&b| b == 0));
}

#[test]
fn test_reused_emulator_gets_one_drive() {
    let dir = tempfile::tempdir().unwrap();
    let fetcher = firmware(dir.path());
    let mut emulator = ScriptedEmulator::printing(&["Hello, world!"]);

    for _ in 0..2 {
        let report = run_scenario(
            &scenario(HELLO),
            &fetcher,
            &mut emulator,
            &mut ConsoleWatcher::new(),
        );
        assert!(report.passed(), "{:?}", report.outcome);
        assert_eq!(report.command_line.len(), 4);
    }
    assert_eq!(emulator.launches, 2);
    assert_eq!(emulator.args.len(), 3);
    assert_eq!(emulator.args.iter().filter(|a| *a == "-drive").count(), 1);
}

#[test]
fn test_asset_named_like_flash_image_is_not_overwritten() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("raspi_pico_flash.bin");
    let firmware = [0x00, 0x20, 0x04, 0x20];
    std::fs::write(&path, firmware).unwrap();
    let fetcher = FixtureFetcher { path: path.clone() };
    let mut emulator = ScriptedEmulator::printing(&["Hello, world!"]);
    let mut watcher = ConsoleWatcher::new();

    let report = run_scenario(&scenario(HELLO), &fetcher, &mut emulator, &mut watcher);

    assert!(matches!(report.outcome, Err(ScenarioError::Config(_))));
    assert_eq!(report.stop_reason(), StopReason::ConfigError);
    assert!(report.flash.is_none());
    assert_eq!(std::fs::read(&path).unwrap(), firmware);
    assert_eq!(emulator.launches, 0);
}

#[test]
fn test_timeout_still_shuts_down() {
    let dir = tempfile::tempdir().unwrap();
    let fetcher = firmware(dir.path());
    let mut emulator = ScriptedEmulator::printing(&["boot\r\n", "idle\r\n"]);
    let mut watcher = ConsoleWatcher::new();

    let report = run_scenario(&scenario(HELLO), &fetcher, &mut emulator, &mut watcher);

    assert!(matches!(
        report.outcome,
        Err(ScenarioError::PatternTimeout { ref pattern, .. }) if pattern == "Hello, world!"
    ));
    assert_eq!(report.stop_reason(), StopReason::WallTime);
    assert_eq!(emulator.shutdowns, 1);
    assert!(!emulator.is_running());
    assert_eq!(watcher.transcript_text(), "boot\r\nidle\r\n");
}

#[test]
fn test_emulator_exit_before_pattern() {
    let dir = tempfile::tempdir().unwrap();
    let fetcher = firmware(dir.path());
    let mut emulator = ScriptedEmulator::printing(&["qemu-system-arm: -machine raspi_pico: unsupported"]);
    emulator.exit_after_output = true;
    let mut watcher = ConsoleWatcher::new();

    let report = run_scenario(&scenario(HELLO), &fetcher, &mut emulator, &mut watcher);

    assert!(matches!(report.outcome, Err(ScenarioError::EmulatorExited { .. })));
    assert_eq!(emulator.shutdowns, 1);
}

#[test]
fn test_failure_pattern_aborts_run() {
    let dir = tempfile::tempdir().unwrap();
    let fetcher = firmware(dir.path());
    let mut emulator = ScriptedEmulator::printing(&["*** PANIC ***\r\n", "Hello, world!\r\n"]);
    let mut watcher = ConsoleWatcher::new();
    let extra = r#"
assertions:
  - console_contains: "Hello, world!"
  - console_not_contains: "PANIC"
"#;

    let report = run_scenario(&scenario(extra), &fetcher, &mut emulator, &mut watcher);

    assert!(matches!(
        report.outcome,
        Err(ScenarioError::FailurePattern { ref pattern }) if pattern == "PANIC"
    ));
    assert!(report.outcome.as_ref().unwrap_err().is_assertion_failure());
    assert_eq!(emulator.shutdowns, 1);
}

#[test]
fn test_multiple_patterns_in_order() {
    let dir = tempfile::tempdir().unwrap();
    let fetcher = firmware(dir.path());
    let mut emulator = ScriptedEmulator::printing(&["clocks up\r\n", "Hello, world!\r\n"]);
    let mut watcher = ConsoleWatcher::new();
    let extra = r#"
assertions:
  - console_contains: "clocks up"
  - console_contains: "Hello, world!"
"#;

    let report = run_scenario(&scenario(extra), &fetcher, &mut emulator, &mut watcher);

    assert!(report.passed(), "{:?}", report.outcome);
    assert_eq!(report.matches.len(), 2);
    assert!(report.matches[0].offset < report.matches[1].offset);
}

#[test]
fn test_asset_failure_never_launches() {
    let mut emulator = ScriptedEmulator::printing(&["Hello, world!"]);
    let mut watcher = ConsoleWatcher::new();

    let report = run_scenario(&scenario(HELLO), &FailingFetcher, &mut emulator, &mut watcher);

    assert!(matches!(report.outcome, Err(ScenarioError::AssetFetch(_))));
    assert_eq!(report.stop_reason(), StopReason::AssetError);
    assert_eq!(emulator.launches, 0);
    assert_eq!(emulator.shutdowns, 0);
}

#[test]
fn test_oversized_firmware_is_image_error() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("hello_serial.bin");
    std::fs::write(&path, vec![0xFF; 64 * 1024 + 1]).unwrap();
    let fetcher = FixtureFetcher { path };
    let mut emulator = ScriptedEmulator::printing(&["Hello, world!"]);
    let mut watcher = ConsoleWatcher::new();

    let report = run_scenario(&scenario(HELLO), &fetcher, &mut emulator, &mut watcher);

    assert!(matches!(
        report.outcome,
        Err(ScenarioError::ImageBuild(picocheck_flash::FlashImageError::TooLarge { .. }))
    ));
    assert_eq!(report.stop_reason(), StopReason::ImageError);
    assert!(!dir.path().join("raspi_pico_flash.bin").exists());
    assert_eq!(emulator.launches, 0);
}

#[test]
fn test_launch_failure_is_reported() {
    let dir = tempfile::tempdir().unwrap();
    let fetcher = firmware(dir.path());
    let mut emulator = ScriptedEmulator {
        fail_launch: true,
        ..ScriptedEmulator::default()
    };
    let mut watcher = ConsoleWatcher::new();

    let report = run_scenario(&scenario(HELLO), &fetcher, &mut emulator, &mut watcher);

    assert!(matches!(report.outcome, Err(ScenarioError::Launch(_))));
    assert_eq!(report.stop_reason(), StopReason::LaunchError);
    assert_eq!(emulator.shutdowns, 0);
}
