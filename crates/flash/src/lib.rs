// PicoCheck - QEMU Board Smoke Tests
// Copyright (C) 2026 Andrii Shylenko
//
// This software is released under the MIT License.
// See the LICENSE file in the project root for full license information.

use std::fs;
use std::io::{self, Read};
use std::path::{Path, PathBuf};
use tracing::{debug, info};

/// Size of the external QSPI flash on the Raspberry Pi Pico (W25Q16JV).
pub const RASPI_PICO_FLASH_SIZE: u64 = 2 * 1024 * 1024;

#[derive(Debug, thiserror::Error)]
pub enum FlashImageError {
    #[error("Firmware too large: {size} bytes, flash holds {capacity} bytes")]
    TooLarge { size: u64, capacity: u64 },
    #[error("Flash size of {capacity} bytes does not fit in memory")]
    CapacityOverflow { capacity: u64 },
    #[error("Flash image {path:?} would overwrite its own source")]
    SameFile { path: PathBuf },
    #[error("I/O error on {path:?}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
}

impl FlashImageError {
    fn io(path: &Path, source: std::io::Error) -> Self {
        Self::Io {
            path: path.to_path_buf(),
            source,
        }
    }
}

/// Summary of a flash image written to disk.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FlashImage {
    pub path: PathBuf,
    pub payload_len: u64,
    pub padding_len: u64,
}

impl FlashImage {
    pub fn total_len(&self) -> u64 {
        self.payload_len + self.padding_len
    }
}

/// Right-pads `payload` with zeroes so the result is exactly `flash_size` bytes.
pub fn pad_to_flash(mut payload: Vec<u8>, flash_size: u64) -> Result<Vec<u8>, FlashImageError> {
    let size = payload.len() as u64;
    if size > flash_size {
        return Err(FlashImageError::TooLarge {
            size,
            capacity: flash_size,
        });
    }
    let overflow = || FlashImageError::CapacityOverflow {
        capacity: flash_size,
    };
    let len = usize::try_from(flash_size).map_err(|_| overflow())?;
    payload
        .try_reserve_exact(len - payload.len())
        .map_err(|_| overflow())?;
    payload.resize(len, 0);
    Ok(payload)
}

/// Builds a flash image at `target` from the firmware at `source`.
///
/// The source is only ever opened for reading and is streamed into the
/// target; the zero padding is produced by extending the file. An oversized
/// source is rejected before `target` is created, so a failed build never
/// leaves a truncated image behind.
pub fn build_flash_image(
    source: &Path,
    target: &Path,
    flash_size: u64,
) -> Result<FlashImage, FlashImageError> {
    let file = fs::File::open(source).map_err(|e| FlashImageError::io(source, e))?;
    let size = file
        .metadata()
        .map_err(|e| FlashImageError::io(source, e))?
        .len();
    debug!(
        "Firmware {:?}: {} bytes, flash capacity {} bytes",
        source, size, flash_size
    );
    if size > flash_size {
        return Err(FlashImageError::TooLarge {
            size,
            capacity: flash_size,
        });
    }
    if is_same_file(source, target) {
        return Err(FlashImageError::SameFile {
            path: target.to_path_buf(),
        });
    }

    let mut out = fs::File::create(target).map_err(|e| FlashImageError::io(target, e))?;
    // One byte past capacity detects a source that grew after the size check.
    let payload_len = io::copy(&mut file.take(flash_size.saturating_add(1)), &mut out)
        .map_err(|e| FlashImageError::io(source, e))?;
    if payload_len > flash_size {
        drop(out);
        let _ = fs::remove_file(target);
        return Err(FlashImageError::TooLarge {
            size: payload_len,
            capacity: flash_size,
        });
    }
    out.set_len(flash_size)
        .and_then(|()| out.sync_all())
        .map_err(|e| FlashImageError::io(target, e))?;

    let flash = FlashImage {
        path: target.to_path_buf(),
        payload_len,
        padding_len: flash_size - payload_len,
    };
    info!(
        "Flash image written to {:?} ({} payload + {} padding bytes)",
        flash.path, flash.payload_len, flash.padding_len
    );
    Ok(flash)
}

fn is_same_file(source: &Path, target: &Path) -> bool {
    match (fs::canonicalize(source), fs::canonicalize(target)) {
        (Ok(a), Ok(b)) => a == b,
        _ => false,
    }
}
