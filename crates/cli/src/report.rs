// PicoCheck - QEMU Board Smoke Tests
// Copyright (C) 2026 Andrii Shylenko
//
// This software is released under the MIT License.
// See the LICENSE file in the project root for full license information.

//! Run artifacts: `result.json`, `console.log` and the JUnit report.

use picocheck_config::{ConsoleAssertion, StopReason};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;
use tracing::error;

pub const RESULT_SCHEMA_VERSION: &str = "1.0";

#[derive(Debug, Serialize, Deserialize)]
pub struct TestResult {
    pub result_schema_version: String,
    pub status: String,
    pub stop_reason: StopReason,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
    pub duration_ms: u64,
    pub wall_time_ms: u64,
    pub assertions: Vec<AssertionResult>,
    pub flash: Option<FlashSummary>,
    pub command_line: Vec<String>,
    pub config: TestConfig,
}

#[derive(Debug, Serialize, Deserialize, Clone)]
pub struct AssertionResult {
    pub assertion: ConsoleAssertion,
    pub passed: bool,
    /// Console offset of the match for `console_contains`.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub offset: Option<usize>,
}

#[derive(Debug, Serialize, Deserialize, Clone)]
pub struct FlashSummary {
    pub path: PathBuf,
    pub payload_len: u64,
    pub size: u64,
    pub sha256: String,
}

#[derive(Debug, Serialize, Deserialize, Clone, Default)]
pub struct TestConfig {
    pub script: PathBuf,
    pub scenario: String,
    pub asset_url: String,
    pub asset: Option<PathBuf>,
    pub tags: Vec<String>,
}

/// Where the artifacts of one run go.
pub struct OutputTargets<'a> {
    pub output_dir: Option<&'a Path>,
    pub junit: Option<&'a Path>,
}

/// Best-effort: failures are logged and never change the exit code.
pub fn write_outputs(targets: &OutputTargets<'_>, result: &TestResult, console: &[u8]) {
    if let Some(output_dir) = targets.output_dir {
        if let Err(e) = std::fs::create_dir_all(output_dir) {
            error!("Failed to create output directory {:?}: {}", output_dir, e);
        } else {
            let result_path = output_dir.join("result.json");
            match std::fs::File::create(&result_path) {
                Ok(f) => {
                    if let Err(e) = serde_json::to_writer_pretty(f, result) {
                        error!("Failed to write result.json: {}", e);
                    }
                }
                Err(e) => error!("Failed to create result.json: {}", e),
            }

            if let Err(e) = std::fs::write(output_dir.join("console.log"), console) {
                error!("Failed to write console.log: {}", e);
            }

            if let Err(e) = write_junit_xml(&output_dir.join("junit.xml"), result) {
                error!("Failed to write junit.xml: {}", e);
            }
        }
    }

    if let Some(junit_path) = targets.junit {
        if let Some(parent) = junit_path.parent() {
            let _ = std::fs::create_dir_all(parent);
        }
        if let Err(e) = write_junit_xml(junit_path, result) {
            error!("Failed to write JUnit report {:?}: {}", junit_path, e);
        }
    }
}

pub fn xml_escape(s: &str) -> String {
    s.replace('&', "&amp;")
        .replace('<', "&lt;")
        .replace('>', "&gt;")
        .replace('"', "&quot;")
        .replace('\'', "&apos;")
}

pub fn write_junit_xml(path: &Path, result: &TestResult) -> std::io::Result<()> {
    std::fs::write(path, render_junit_xml(result))
}

fn render_junit_xml(result: &TestResult) -> String {
    let details = failure_details(result);
    let time_secs = Duration::from_millis(result.duration_ms).as_secs_f64();
    let suite = if result.config.scenario.is_empty() {
        "picocheck"
    } else {
        result.config.scenario.as_str()
    };

    let mut tests: u64 = 0;
    let mut failures: u64 = 0;
    let mut errors: u64 = 0;
    let mut skipped: u64 = 0;
    let mut testcases = String::new();

    // The "run" testcase carries harness errors and failures no assertion explains.
    tests += 1;
    testcases.push_str(&format!(
        "  <testcase classname=\"picocheck\" name=\"run\" time=\"{:.6}\">\n",
        time_secs
    ));
    match result.status.as_str() {
        "error" => {
            errors += 1;
            let err_type = if result.stop_reason == StopReason::LaunchError {
                "runtime error"
            } else {
                "config error"
            };
            testcases.push_str(&format!(
                "    <error message=\"{}\">{}</error>\n",
                xml_escape(err_type),
                xml_escape(&details)
            ));
        }
        "skip" => {
            skipped += 1;
            testcases.push_str(&format!(
                "    <skipped message=\"{}\"/>\n",
                xml_escape(result.message.as_deref().unwrap_or("skipped"))
            ));
        }
        "fail" if result.assertions.iter().all(|a| a.passed) => {
            failures += 1;
            testcases.push_str(&format!(
                "    <failure message=\"{}\">{}</failure>\n",
                xml_escape(&format!("{:?}", result.stop_reason)),
                xml_escape(&details)
            ));
        }
        _ => {}
    }
    testcases.push_str("  </testcase>\n");

    for (idx, a) in result.assertions.iter().enumerate() {
        tests += 1;
        let name = format!("assertion {}: {}", idx + 1, assertion_short_name(&a.assertion));
        testcases.push_str(&format!(
            "  <testcase classname=\"picocheck\" name=\"{}\" time=\"0.000000\">\n",
            xml_escape(&name)
        ));
        if !a.passed {
            failures += 1;
            testcases.push_str(&format!(
                "    <failure message=\"assertion failed\">{}</failure>\n",
                xml_escape(&format!("{}\n\n{}", name, details))
            ));
        }
        testcases.push_str("  </testcase>\n");
    }

    let mut xml = String::new();
    xml.push_str(r#"<?xml version="1.0" encoding="UTF-8"?>"#);
    xml.push('\n');
    xml.push_str(&format!(
        r#"<testsuite name="{}" tests="{}" failures="{}" errors="{}" skipped="{}" time="{:.6}">"#,
        xml_escape(suite),
        tests,
        failures,
        errors,
        skipped,
        time_secs
    ));
    xml.push('\n');
    xml.push_str("  <properties>\n");
    for (name, value) in [
        ("result_schema_version", RESULT_SCHEMA_VERSION.to_string()),
        ("stop_reason", format!("{:?}", result.stop_reason)),
        ("asset_url", result.config.asset_url.clone()),
        (
            "flash_sha256",
            result
                .flash
                .as_ref()
                .map(|f| f.sha256.clone())
                .unwrap_or_default(),
        ),
    ] {
        xml.push_str(&format!(
            "    <property name=\"{}\" value=\"{}\"/>\n",
            name,
            xml_escape(&value)
        ));
    }
    xml.push_str("  </properties>\n");
    xml.push_str(&testcases);
    xml.push_str("</testsuite>\n");
    xml
}

fn failure_details(result: &TestResult) -> String {
    let mut details = String::new();
    details.push_str(&format!("result_schema_version={}\n", RESULT_SCHEMA_VERSION));
    details.push_str(&format!("stop_reason={:?}\n", result.stop_reason));
    if let Some(msg) = &result.message {
        details.push_str(&format!("message={}\n", msg));
    }
    details.push_str(&format!("wall_time_ms={}\n", result.wall_time_ms));
    details.push_str(&format!("script={}\n", result.config.script.display()));
    details.push_str(&format!("asset_url={}\n", result.config.asset_url));
    if let Some(flash) = &result.flash {
        details.push_str(&format!("flash={}\n", flash.path.display()));
        details.push_str(&format!("flash_sha256={}\n", flash.sha256));
    }
    if !result.command_line.is_empty() {
        details.push_str(&format!("command_line={}\n", result.command_line.join(" ")));
    }
    details
}

fn assertion_short_name(assertion: &ConsoleAssertion) -> String {
    const MAX_LEN: usize = 120;
    let s = match assertion {
        ConsoleAssertion::Contains(a) => format!("console_contains: {}", a.console_contains),
        ConsoleAssertion::NotContains(a) => {
            format!("console_not_contains: {}", a.console_not_contains)
        }
    };

    if s.chars().count() <= MAX_LEN {
        return s;
    }

    let mut truncated = s.chars().take(MAX_LEN - 1).collect::<String>();
    truncated.push('…');
    truncated
}
