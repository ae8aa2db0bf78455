// PicoCheck - QEMU Board Smoke Tests
// Copyright (C) 2026 Andrii Shylenko
//
// This software is released under the MIT License.
// See the LICENSE file in the project root for full license information.

use crate::asset::{AssetError, AssetFetcher};
use crate::console::{ConsoleWatcher, PatternMatch, WatchError};
use crate::emulator::{EmulatorError, EmulatorHandle, RunningEmulator};
use picocheck_config::{Scenario, StopReason};
use picocheck_flash::{build_flash_image, FlashImage, FlashImageError, RASPI_PICO_FLASH_SIZE};
use sha2::{Digest, Sha256};
use std::path::{Path, PathBuf};
use std::time::{Duration, Instant};
use tracing::{error, info};

#[derive(Debug, thiserror::Error)]
pub enum ScenarioError {
    #[error("Invalid scenario: {0}")]
    Config(String),
    #[error("Asset fetch failed: {0}")]
    AssetFetch(#[from] AssetError),
    #[error("Flash image build failed: {0}")]
    ImageBuild(#[from] FlashImageError),
    #[error("Emulator launch failed: {0}")]
    Launch(#[source] EmulatorError),
    #[error("Timed out after {waited:?} waiting for console pattern {pattern:?}")]
    PatternTimeout { pattern: String, waited: Duration },
    #[error("Failure pattern {pattern:?} appeared on the console")]
    FailurePattern { pattern: String },
    #[error("Emulator exited before console pattern {pattern:?} appeared")]
    EmulatorExited { pattern: String },
    #[error("Emulator shutdown failed: {0}")]
    Shutdown(#[source] EmulatorError),
}

impl From<WatchError> for ScenarioError {
    fn from(e: WatchError) -> Self {
        match e {
            WatchError::Timeout { pattern, waited } => Self::PatternTimeout { pattern, waited },
            WatchError::FailurePattern { pattern, .. } => Self::FailurePattern { pattern },
            WatchError::StreamClosed { pattern } => Self::EmulatorExited { pattern },
        }
    }
}

impl ScenarioError {
    pub fn stop_reason(&self) -> StopReason {
        match self {
            Self::Config(_) => StopReason::ConfigError,
            Self::AssetFetch(_) => StopReason::AssetError,
            Self::ImageBuild(_) => StopReason::ImageError,
            Self::Launch(_) | Self::Shutdown(_) => StopReason::LaunchError,
            Self::PatternTimeout { .. } => StopReason::WallTime,
            Self::FailurePattern { .. } => StopReason::FailurePattern,
            Self::EmulatorExited { .. } => StopReason::EmulatorExited,
        }
    }

    /// True for failures of the firmware under test rather than of the harness.
    pub fn is_assertion_failure(&self) -> bool {
        matches!(
            self,
            Self::PatternTimeout { .. } | Self::FailurePattern { .. } | Self::EmulatorExited { .. }
        )
    }
}

/// Everything observed during one scenario run, including partial progress on failure.
#[derive(Debug)]
pub struct ScenarioReport {
    pub name: String,
    pub asset: Option<PathBuf>,
    pub flash: Option<FlashImage>,
    pub flash_sha256: Option<String>,
    pub command_line: Vec<String>,
    pub matches: Vec<PatternMatch>,
    pub elapsed: Duration,
    pub outcome: Result<(), ScenarioError>,
}

impl ScenarioReport {
    fn new(name: &str) -> Self {
        Self {
            name: name.to_string(),
            asset: None,
            flash: None,
            flash_sha256: None,
            command_line: Vec::new(),
            matches: Vec::new(),
            elapsed: Duration::ZERO,
            outcome: Ok(()),
        }
    }

    pub fn passed(&self) -> bool {
        self.outcome.is_ok()
    }

    pub fn stop_reason(&self) -> StopReason {
        match &self.outcome {
            Ok(()) => StopReason::PatternMatched,
            Err(e) => e.stop_reason(),
        }
    }
}

/// Fetches the firmware, builds the flash image, boots it and waits for the
/// scenario's console patterns.
///
/// The emulator is shut down on every path once it has been launched. Arguments
/// added by an earlier run on the same `emulator` are dropped first, so the
/// handle can be reused across scenarios.
pub fn run_scenario<E: EmulatorHandle>(
    scenario: &Scenario,
    fetcher: &dyn AssetFetcher,
    emulator: &mut E,
    watcher: &mut ConsoleWatcher,
) -> ScenarioReport {
    let start = Instant::now();
    let mut report = ScenarioReport::new(&scenario.name);
    info!("Running scenario '{}'", scenario.name);

    let outcome = execute(scenario, fetcher, emulator, watcher, &mut report);
    report.outcome = outcome;
    report.elapsed = start.elapsed();

    match &report.outcome {
        Ok(()) => info!("Scenario '{}' passed in {:?}", scenario.name, report.elapsed),
        Err(e) => error!("Scenario '{}' failed: {}", scenario.name, e),
    }
    report
}

fn execute<E: EmulatorHandle>(
    scenario: &Scenario,
    fetcher: &dyn AssetFetcher,
    emulator: &mut E,
    watcher: &mut ConsoleWatcher,
    report: &mut ScenarioReport,
) -> Result<(), ScenarioError> {
    let asset = fetcher.fetch(&scenario.inputs.asset)?;
    report.asset = Some(asset.clone());

    let flash_size = scenario
        .inputs
        .flash_size_bytes()
        .map_err(|e| ScenarioError::Config(format!("{:#}", e)))?
        .unwrap_or(RASPI_PICO_FLASH_SIZE);
    let flash_path = absolute(
        &asset
            .parent()
            .unwrap_or_else(|| Path::new("."))
            .join(&scenario.inputs.flash_image),
    );
    if flash_path == absolute(&asset) {
        return Err(ScenarioError::Config(format!(
            "Flash image {:?} would overwrite the fetched asset",
            flash_path
        )));
    }
    let flash = build_flash_image(&asset, &flash_path, flash_size)?;
    report.flash_sha256 = Some(flash_digest(&flash.path)?);
    report.flash = Some(flash);

    let drive = format!("if=mtd,format=raw,file={}", flash_path.display());
    emulator.reset_args();
    emulator.add_args(&["-drive", &drive]);
    emulator.add_arg("-nographic");
    report.command_line = emulator.command_line();

    let running = RunningEmulator::launch(emulator).map_err(ScenarioError::Launch)?;
    let console = running
        .console()
        .ok_or(ScenarioError::Launch(EmulatorError::NotRunning))?;

    let deadline = Instant::now() + Duration::from_millis(scenario.limits.wall_time_ms);
    let failures: Vec<&str> = scenario.failure_patterns().collect();
    for pattern in scenario.success_patterns() {
        let remaining = deadline.saturating_duration_since(Instant::now());
        let matched = watcher.wait_for_any(console, pattern, &failures, remaining)?;
        info!("Console matched {:?} after {:?}", pattern, matched.elapsed);
        report.matches.push(matched);
    }

    running.shutdown().map_err(ScenarioError::Shutdown)
}

fn absolute(path: &Path) -> PathBuf {
    if path.is_absolute() {
        return path.to_path_buf();
    }
    match std::env::current_dir() {
        Ok(cwd) => cwd.join(path),
        Err(_) => path.to_path_buf(),
    }
}

fn flash_digest(path: &Path) -> Result<String, FlashImageError> {
    let io_error = |source| FlashImageError::Io {
        path: path.to_path_buf(),
        source,
    };
    let mut file = std::fs::File::open(path).map_err(io_error)?;
    let mut hasher = Sha256::new();
    std::io::copy(&mut file, &mut hasher).map_err(io_error)?;
    Ok(format!("{:x}", hasher.finalize()))
}
