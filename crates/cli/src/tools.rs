// PicoCheck - QEMU Board Smoke Tests
// Copyright (C) 2026 Andrii Shylenko
//
// This software is released under the MIT License.
// See the LICENSE file in the project root for full license information.

use clap::Parser;
use picocheck_config::{parse_size, AssetSpec};
use picocheck_core::{AssetFetcher, CachedAssetFetcher};
use picocheck_flash::{build_flash_image, RASPI_PICO_FLASH_SIZE};
use serde::Serialize;
use std::path::PathBuf;
use std::process::ExitCode;
use tracing::error;

use crate::{EXIT_CONFIG_ERROR, EXIT_PASS};

#[derive(Parser, Debug)]
pub struct FlashArgs {
    /// Raw firmware binary to place at the start of flash
    #[arg(short, long)]
    pub input: PathBuf,

    /// Path of the flash image to write
    #[arg(short, long)]
    pub output: PathBuf,

    /// Flash size, e.g. "2MiB" (default: Raspberry Pi Pico flash)
    #[arg(long)]
    pub size: Option<String>,
}

#[derive(Parser, Debug)]
pub struct FetchArgs {
    /// Asset URL, `file://` URL or local path
    #[arg(long)]
    pub url: String,

    /// Expected SHA-1 of the asset (40 hex characters)
    #[arg(long)]
    pub sha1: Option<String>,

    /// Asset cache directory (default: $PICOCHECK_CACHE_DIR or the user cache dir)
    #[arg(long)]
    pub cache_dir: Option<PathBuf>,
}

#[derive(Serialize)]
struct FlashReport {
    path: PathBuf,
    payload_len: u64,
    padding_len: u64,
    size: u64,
}

#[derive(Serialize)]
struct FetchReport {
    url: String,
    path: PathBuf,
}

pub fn run_flash(args: FlashArgs) -> ExitCode {
    let flash_size = match args.size.as_deref().map(parse_size).transpose() {
        Ok(size) => size.unwrap_or(RASPI_PICO_FLASH_SIZE),
        Err(e) => {
            error!("Invalid --size: {:#}", e);
            return ExitCode::from(EXIT_CONFIG_ERROR);
        }
    };

    match build_flash_image(&args.input, &args.output, flash_size) {
        Ok(image) => print_json(&FlashReport {
            size: image.total_len(),
            path: image.path,
            payload_len: image.payload_len,
            padding_len: image.padding_len,
        }),
        Err(e) => {
            error!("{}", e);
            ExitCode::from(EXIT_CONFIG_ERROR)
        }
    }
}

pub fn run_fetch(args: FetchArgs) -> ExitCode {
    let cache_dir = args
        .cache_dir
        .unwrap_or_else(CachedAssetFetcher::default_cache_dir);
    let fetcher = CachedAssetFetcher::new(cache_dir);
    let asset = AssetSpec {
        url: args.url,
        sha1: args.sha1,
    };

    match fetcher.fetch(&asset) {
        Ok(path) => print_json(&FetchReport {
            url: asset.url,
            path,
        }),
        Err(e) => {
            error!("{}", e);
            ExitCode::from(EXIT_CONFIG_ERROR)
        }
    }
}

fn print_json<T: Serialize>(value: &T) -> ExitCode {
    match serde_json::to_string_pretty(value) {
        Ok(json) => {
            println!("{}", json);
            ExitCode::from(EXIT_PASS)
        }
        Err(e) => {
            error!("Failed to serialize report: {}", e);
            ExitCode::from(EXIT_CONFIG_ERROR)
        }
    }
}
