// PicoCheck - QEMU Board Smoke Tests
// Copyright (C) 2026 Andrii Shylenko
//
// This software is released under the MIT License.
// See the LICENSE file in the project root for full license information.

pub mod asset;
pub mod console;
pub mod emulator;
pub mod scenario;

pub use asset::{AssetError, AssetFetcher, CachedAssetFetcher};
pub use console::{ConsoleRead, ConsoleStream, ConsoleWatcher, PatternMatch, WatchError};
pub use emulator::{EmulatorError, EmulatorHandle, QemuMachine, RunningEmulator};
pub use scenario::{run_scenario, ScenarioError, ScenarioReport};
