// PicoCheck - QEMU Board Smoke Tests
// Copyright (C) 2026 Andrii Shylenko
//
// This software is released under the MIT License.
// See the LICENSE file in the project root for full license information.

use clap::{Parser, Subcommand};
use std::path::{Path, PathBuf};
use std::process::ExitCode;
use std::time::Duration;
use tracing::{error, info};

use picocheck_config::{ConsoleAssertion, Scenario, StopReason};
use picocheck_core::{
    run_scenario, CachedAssetFetcher, ConsoleWatcher, QemuMachine, ScenarioError, ScenarioReport,
};

mod report;
mod tools;

use report::{AssertionResult, FlashSummary, OutputTargets, TestConfig, TestResult};

pub(crate) const EXIT_PASS: u8 = 0;
pub(crate) const EXIT_ASSERT_FAIL: u8 = 1;
pub(crate) const EXIT_CONFIG_ERROR: u8 = 2;
pub(crate) const EXIT_RUNTIME_ERROR: u8 = 3;

#[derive(Parser, Debug)]
#[command(
    author,
    version,
    about = "PicoCheck: boot firmware under QEMU and check its console",
    long_about = None
)]
struct Cli {
    /// Enable debug logging
    #[arg(short, long, global = true)]
    trace: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Run a boot smoke test scenario (YAML).
    Test(TestArgs),

    /// Pad a raw firmware binary into a flash image.
    Flash(tools::FlashArgs),

    /// Download (or copy) an asset into the cache and verify its hash.
    Fetch(tools::FetchArgs),
}

#[derive(Parser, Debug)]
struct TestArgs {
    /// Path to the scenario (YAML)
    #[arg(short = 'c', long)]
    script: PathBuf,

    /// Directory to write test artifacts (result.json, console.log, junit.xml)
    #[arg(long)]
    output_dir: Option<PathBuf>,

    /// Optional path to write a JUnit XML report for CI systems
    #[arg(long)]
    junit: Option<PathBuf>,

    /// Asset cache directory (default: $PICOCHECK_CACHE_DIR or the user cache dir)
    #[arg(long)]
    cache_dir: Option<PathBuf>,

    /// Override the emulator binary
    #[arg(long)]
    emulator: Option<String>,

    /// Override the console wait budget in milliseconds
    #[arg(long)]
    timeout_ms: Option<u64>,

    /// Only run when the scenario carries all of these tags (key:value)
    #[arg(long, value_delimiter = ',')]
    tags: Vec<String>,

    /// Disable console stdout echo (still captured for assertions/artifacts)
    #[arg(long)]
    no_console_stdout: bool,
}

impl TestArgs {
    fn targets(&self) -> OutputTargets<'_> {
        OutputTargets {
            output_dir: self.output_dir.as_deref(),
            junit: self.junit.as_deref(),
        }
    }
}

fn main() -> ExitCode {
    let cli = Cli::parse();

    let level = if cli.trace {
        tracing::Level::DEBUG
    } else {
        tracing::Level::INFO
    };
    // Stdout carries the console echo and JSON reports.
    tracing_subscriber::fmt()
        .with_max_level(level)
        .with_writer(std::io::stderr)
        .init();

    match cli.command {
        Commands::Test(args) => run_test(args),
        Commands::Flash(args) => tools::run_flash(args),
        Commands::Fetch(args) => tools::run_fetch(args),
    }
}

fn run_test(args: TestArgs) -> ExitCode {
    let mut scenario = match Scenario::from_file(&args.script) {
        Ok(s) => s,
        Err(e) => {
            let msg = format!("{:#}", e);
            error!("{}", msg);
            write_config_error_outputs(&args, None, msg);
            return ExitCode::from(EXIT_CONFIG_ERROR);
        }
    };

    if let Some(binary) = &args.emulator {
        scenario.emulator.binary = binary.clone();
    }
    if let Some(timeout_ms) = args.timeout_ms {
        if timeout_ms == 0 {
            let msg = "--timeout-ms must be greater than zero".to_string();
            error!("{}", msg);
            write_config_error_outputs(&args, Some(&scenario), msg);
            return ExitCode::from(EXIT_CONFIG_ERROR);
        }
        scenario.limits.wall_time_ms = timeout_ms;
    }

    if !scenario.matches_tags(&args.tags) {
        let missing: Vec<&str> = args
            .tags
            .iter()
            .map(String::as_str)
            .filter(|t| !scenario.tags.iter().any(|have| have == t))
            .collect();
        let msg = format!("tags not matched: {}", missing.join(", "));
        info!("Skipping scenario '{}' ({})", scenario.name, msg);
        let result = TestResult {
            message: Some(msg),
            ..base_result("skip", StopReason::Skipped, &args, Some(&scenario))
        };
        report::write_outputs(&args.targets(), &result, b"");
        return ExitCode::from(EXIT_PASS);
    }

    let cache_dir = args
        .cache_dir
        .clone()
        .unwrap_or_else(CachedAssetFetcher::default_cache_dir);
    info!("Asset cache: {:?}", cache_dir);
    let fetcher = CachedAssetFetcher::new(cache_dir).with_base_dir(script_dir(&args.script));

    let mut emulator = QemuMachine::from_config(&scenario.emulator)
        .with_shutdown_timeout(Duration::from_millis(scenario.limits.shutdown_timeout_ms));
    let mut watcher = ConsoleWatcher::new();
    watcher.set_echo_stdout(!args.no_console_stdout);

    let run = run_scenario(&scenario, &fetcher, &mut emulator, &mut watcher);
    let (status, code) = classify(&run.outcome);

    let result = TestResult {
        message: run.outcome.as_ref().err().map(|e| e.to_string()),
        duration_ms: run.elapsed.as_millis() as u64,
        assertions: if status == "error" {
            Vec::new()
        } else {
            assertion_results(&scenario, &run)
        },
        flash: flash_summary(&run),
        command_line: run.command_line.clone(),
        config: TestConfig {
            asset: run.asset.clone(),
            ..test_config(&args, Some(&scenario))
        },
        ..base_result(status, run.stop_reason(), &args, Some(&scenario))
    };
    report::write_outputs(&args.targets(), &result, watcher.transcript());

    ExitCode::from(code)
}

fn classify(outcome: &Result<(), ScenarioError>) -> (&'static str, u8) {
    match outcome {
        Ok(()) => ("pass", EXIT_PASS),
        Err(e) if e.is_assertion_failure() => ("fail", EXIT_ASSERT_FAIL),
        Err(ScenarioError::Launch(_) | ScenarioError::Shutdown(_)) => {
            ("error", EXIT_RUNTIME_ERROR)
        }
        Err(_) => ("error", EXIT_CONFIG_ERROR),
    }
}

/// `console_contains` entries pass in order as their patterns are matched.
fn assertion_results(scenario: &Scenario, run: &ScenarioReport) -> Vec<AssertionResult> {
    let tripped = match &run.outcome {
        Err(ScenarioError::FailurePattern { pattern }) => Some(pattern.as_str()),
        _ => None,
    };
    let mut matches = run.matches.iter();
    scenario
        .assertions
        .iter()
        .map(|assertion| match assertion {
            ConsoleAssertion::Contains(_) => {
                let matched = matches.next();
                AssertionResult {
                    assertion: assertion.clone(),
                    passed: matched.is_some(),
                    offset: matched.map(|m| m.offset),
                }
            }
            ConsoleAssertion::NotContains(a) => AssertionResult {
                assertion: assertion.clone(),
                passed: tripped != Some(a.console_not_contains.as_str()),
                offset: None,
            },
        })
        .collect()
}

fn flash_summary(run: &ScenarioReport) -> Option<FlashSummary> {
    let flash = run.flash.as_ref()?;
    Some(FlashSummary {
        path: flash.path.clone(),
        payload_len: flash.payload_len,
        size: flash.total_len(),
        sha256: run.flash_sha256.clone().unwrap_or_default(),
    })
}

fn base_result(
    status: &str,
    stop_reason: StopReason,
    args: &TestArgs,
    scenario: Option<&Scenario>,
) -> TestResult {
    TestResult {
        result_schema_version: report::RESULT_SCHEMA_VERSION.to_string(),
        status: status.to_string(),
        stop_reason,
        message: None,
        duration_ms: 0,
        wall_time_ms: scenario.map(|s| s.limits.wall_time_ms).unwrap_or_default(),
        assertions: Vec::new(),
        flash: None,
        command_line: Vec::new(),
        config: test_config(args, scenario),
    }
}

fn test_config(args: &TestArgs, scenario: Option<&Scenario>) -> TestConfig {
    TestConfig {
        script: args.script.clone(),
        scenario: scenario.map(|s| s.name.clone()).unwrap_or_default(),
        asset_url: scenario
            .map(|s| s.inputs.asset.url.clone())
            .unwrap_or_default(),
        asset: None,
        tags: scenario.map(|s| s.tags.clone()).unwrap_or_default(),
    }
}

fn write_config_error_outputs(args: &TestArgs, scenario: Option<&Scenario>, message: String) {
    let result = TestResult {
        message: Some(message),
        ..base_result("error", StopReason::ConfigError, args, scenario)
    };
    report::write_outputs(&args.targets(), &result, b"");
}

/// Relative asset paths in a scenario are resolved against its directory.
fn script_dir(script_path: &Path) -> PathBuf {
    script_path
        .parent()
        .unwrap_or_else(|| Path::new("."))
        .to_path_buf()
}
