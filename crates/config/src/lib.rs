// PicoCheck - QEMU Board Smoke Tests
// Copyright (C) 2026 Andrii Shylenko
//
// This software is released under the MIT License.
// See the LICENSE file in the project root for full license information.

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::path::Path;

pub const SCHEMA_VERSION: &str = "1.0";
pub const DEFAULT_FLASH_IMAGE_NAME: &str = "raspi_pico_flash.bin";
pub const DEFAULT_EMULATOR_BINARY: &str = "qemu-system-arm";
pub const DEFAULT_MACHINE: &str = "raspi_pico";
pub const DEFAULT_WALL_TIME_MS: u64 = 5_000;
pub const DEFAULT_SHUTDOWN_TIMEOUT_MS: u64 = 3_000;

fn default_flash_image() -> String {
    DEFAULT_FLASH_IMAGE_NAME.to_string()
}

fn default_binary() -> String {
    DEFAULT_EMULATOR_BINARY.to_string()
}

fn default_machine() -> Option<String> {
    Some(DEFAULT_MACHINE.to_string())
}

fn default_wall_time_ms() -> u64 {
    DEFAULT_WALL_TIME_MS
}

fn default_shutdown_timeout_ms() -> u64 {
    DEFAULT_SHUTDOWN_TIMEOUT_MS
}

/// Firmware asset to fetch before the run.
#[derive(Debug, Serialize, Deserialize, Clone, PartialEq, Eq)]
#[serde(deny_unknown_fields)]
pub struct AssetSpec {
    pub url: String,
    #[serde(default)]
    pub sha1: Option<String>,
}

impl AssetSpec {
    /// Last path segment of the URL, without query or fragment.
    pub fn file_name(&self) -> &str {
        let trimmed = self
            .url
            .split(['?', '#'])
            .next()
            .unwrap_or_default()
            .trim_end_matches('/');
        match trimmed.rsplit(['/', '\\']).next() {
            Some(name) if !name.is_empty() => name,
            _ => "asset.bin",
        }
    }
}

#[derive(Debug, Serialize, Deserialize, Clone)]
#[serde(deny_unknown_fields)]
pub struct ScenarioInputs {
    pub asset: AssetSpec,
    #[serde(default = "default_flash_image")]
    pub flash_image: String,
    /// Human readable size, e.g. "2MiB". Defaults to the Pico flash size.
    #[serde(default)]
    pub flash_size: Option<String>,
}

impl ScenarioInputs {
    pub fn flash_size_bytes(&self) -> Result<Option<u64>> {
        self.flash_size
            .as_deref()
            .map(parse_size)
            .transpose()
            .context("Invalid 'flash_size'")
    }
}

#[derive(Debug, Serialize, Deserialize, Clone)]
#[serde(deny_unknown_fields)]
pub struct EmulatorConfig {
    #[serde(default = "default_binary")]
    pub binary: String,
    #[serde(default = "default_machine")]
    pub machine: Option<String>,
    /// Arguments placed before the machine selection and the generated drive arguments.
    #[serde(default)]
    pub args: Vec<String>,
}

impl Default for EmulatorConfig {
    fn default() -> Self {
        Self {
            binary: default_binary(),
            machine: default_machine(),
            args: Vec::new(),
        }
    }
}

#[derive(Debug, Serialize, Deserialize, Clone, PartialEq, Eq)]
#[serde(deny_unknown_fields)]
pub struct ScenarioLimits {
    #[serde(default = "default_wall_time_ms")]
    pub wall_time_ms: u64,
    #[serde(default = "default_shutdown_timeout_ms")]
    pub shutdown_timeout_ms: u64,
}

impl Default for ScenarioLimits {
    fn default() -> Self {
        Self {
            wall_time_ms: default_wall_time_ms(),
            shutdown_timeout_ms: default_shutdown_timeout_ms(),
        }
    }
}

#[derive(Debug, Serialize, Deserialize, Clone, PartialEq)]
#[serde(rename_all = "snake_case")]
pub enum StopReason {
    /// Runner failed before the emulator was started (script parse/validation error).
    ConfigError,
    AssetError,
    ImageError,
    LaunchError,
    PatternMatched,
    WallTime,
    FailurePattern,
    EmulatorExited,
    Skipped,
}

#[derive(Debug, Serialize, Deserialize, Clone, PartialEq, Eq)]
#[serde(deny_unknown_fields)]
pub struct ConsoleContainsAssertion {
    pub console_contains: String,
}

#[derive(Debug, Serialize, Deserialize, Clone, PartialEq, Eq)]
#[serde(deny_unknown_fields)]
pub struct ConsoleNotContainsAssertion {
    pub console_not_contains: String,
}

#[derive(Debug, Serialize, Deserialize, Clone, PartialEq, Eq)]
#[serde(untagged)]
pub enum ConsoleAssertion {
    Contains(ConsoleContainsAssertion),
    NotContains(ConsoleNotContainsAssertion),
}

#[derive(Debug, Serialize, Deserialize, Clone)]
#[serde(deny_unknown_fields)]
pub struct Scenario {
    pub schema_version: String,
    pub name: String,
    #[serde(default)]
    pub tags: Vec<String>,
    pub inputs: ScenarioInputs,
    #[serde(default)]
    pub emulator: EmulatorConfig,
    #[serde(default)]
    pub limits: ScenarioLimits,
    #[serde(default)]
    pub assertions: Vec<ConsoleAssertion>,
}

impl Scenario {
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let contents = std::fs::read_to_string(&path)
            .with_context(|| format!("Failed to read scenario at {:?}", path.as_ref()))?;
        let scenario = Self::from_yaml(&contents)
            .with_context(|| format!("Invalid scenario {:?}", path.as_ref()))?;
        tracing::debug!(
            "Loaded scenario '{}' ({} assertions)",
            scenario.name,
            scenario.assertions.len()
        );
        Ok(scenario)
    }

    pub fn from_yaml(yaml: &str) -> Result<Self> {
        let scenario: Self =
            serde_yaml::from_str(yaml).context("Failed to parse Scenario YAML")?;
        scenario.validate()?;
        Ok(scenario)
    }

    pub fn validate(&self) -> Result<()> {
        if self.schema_version != SCHEMA_VERSION {
            anyhow::bail!(
                "Unsupported schema_version '{}'. Supported versions: '{}'",
                self.schema_version,
                SCHEMA_VERSION
            );
        }

        if self.name.trim().is_empty() {
            anyhow::bail!("Scenario 'name' cannot be empty");
        }

        if self.inputs.asset.url.trim().is_empty() {
            anyhow::bail!("Input 'asset.url' cannot be empty");
        }

        if let Some(hash) = &self.inputs.asset.sha1 {
            if !is_sha1_hex(hash) {
                anyhow::bail!(
                    "Input 'asset.sha1' must be 40 hexadecimal characters, got '{}'",
                    hash
                );
            }
        }

        let image = self.inputs.flash_image.trim();
        if image.is_empty() || image.contains(['/', '\\']) {
            anyhow::bail!(
                "Input 'flash_image' must be a plain file name, got '{}'",
                self.inputs.flash_image
            );
        }
        if image == self.inputs.asset.file_name() {
            anyhow::bail!(
                "Input 'flash_image' must differ from the asset file name '{}'",
                image
            );
        }

        if self.inputs.flash_size_bytes()? == Some(0) {
            anyhow::bail!("Input 'flash_size' must be greater than zero");
        }

        if self.emulator.binary.trim().is_empty() {
            anyhow::bail!("Emulator 'binary' cannot be empty");
        }

        if self.limits.wall_time_ms == 0 {
            anyhow::bail!("Limit 'wall_time_ms' must be greater than zero");
        }

        for tag in &self.tags {
            if split_tag(tag).is_none() {
                anyhow::bail!("Tag '{}' must have the form 'key:value'", tag);
            }
        }

        if self.success_patterns().next().is_none() {
            anyhow::bail!("At least one 'console_contains' assertion is required");
        }

        for assertion in &self.assertions {
            let pattern = match assertion {
                ConsoleAssertion::Contains(a) => &a.console_contains,
                ConsoleAssertion::NotContains(a) => &a.console_not_contains,
            };
            if pattern.is_empty() {
                anyhow::bail!("Console assertion patterns cannot be empty");
            }
        }

        Ok(())
    }

    /// Patterns that must appear, in order.
    pub fn success_patterns(&self) -> impl Iterator<Item = &str> {
        self.assertions.iter().filter_map(|a| match a {
            ConsoleAssertion::Contains(a) => Some(a.console_contains.as_str()),
            ConsoleAssertion::NotContains(_) => None,
        })
    }

    /// Patterns that fail the run as soon as they appear.
    pub fn failure_patterns(&self) -> impl Iterator<Item = &str> {
        self.assertions.iter().filter_map(|a| match a {
            ConsoleAssertion::NotContains(a) => Some(a.console_not_contains.as_str()),
            ConsoleAssertion::Contains(_) => None,
        })
    }

    pub fn tag(&self, key: &str) -> Option<&str> {
        self.tags
            .iter()
            .filter_map(|t| split_tag(t))
            .find(|(k, _)| *k == key)
            .map(|(_, v)| v)
    }

    /// True when the scenario carries every tag in `filter`.
    pub fn matches_tags<S: AsRef<str>>(&self, filter: &[S]) -> bool {
        filter
            .iter()
            .all(|wanted| self.tags.iter().any(|t| t == wanted.as_ref()))
    }
}

fn split_tag(tag: &str) -> Option<(&str, &str)> {
    let (key, value) = tag.split_once(':')?;
    if key.trim().is_empty() || value.trim().is_empty() {
        return None;
    }
    Some((key, value))
}

pub fn is_sha1_hex(s: &str) -> bool {
    s.len() == 40 && s.chars().all(|c| c.is_ascii_hexdigit())
}

pub fn parse_size(size_str: &str) -> Result<u64> {
    use human_size::{Byte, Size, SpecificSize};
    let s: Size = size_str
        .parse()
        .map_err(|e| anyhow::anyhow!("Invalid size format: {}", e))?;
    let bytes: SpecificSize<Byte> = s.into();
    let value = bytes.value();
    if !value.is_finite() || value < 0.0 || value.fract() != 0.0 || value >= u64::MAX as f64 {
        anyhow::bail!("Size '{}' is not a whole number of bytes", size_str);
    }
    Ok(value as u64)
}
