// PicoCheck - QEMU Board Smoke Tests
// Copyright (C) 2026 Andrii Shylenko
//
// This software is released under the MIT License.
// See the LICENSE file in the project root for full license information.

use picocheck_config::{is_sha1_hex, AssetSpec};
use sha1::{Digest, Sha1};
use std::fs;
use std::io::{self, Read};
use std::path::{Path, PathBuf};
use tracing::{debug, info, warn};

/// Environment variable overriding the default asset cache location.
pub const CACHE_DIR_ENV: &str = "PICOCHECK_CACHE_DIR";

#[derive(Debug, thiserror::Error)]
pub enum AssetError {
    #[error("Invalid asset hash '{0}' (expected 40 hex characters)")]
    InvalidHash(String),
    #[error("Failed to download {url}: {message}")]
    Download { url: String, message: String },
    #[error("Hash mismatch for {url}: expected {expected}, got {actual}")]
    HashMismatch {
        url: String,
        expected: String,
        actual: String,
    },
    #[error("I/O error on {path:?}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
}

impl AssetError {
    fn io(path: &Path, source: io::Error) -> Self {
        Self::Io {
            path: path.to_path_buf(),
            source,
        }
    }
}

/// Resolves a firmware asset to a verified local file.
pub trait AssetFetcher {
    fn fetch(&self, asset: &AssetSpec) -> Result<PathBuf, AssetError>;
}

enum AssetSource<'a> {
    Remote(&'a str),
    Local(PathBuf),
}

/// Fetcher backed by an on-disk cache keyed by content hash.
///
/// Layout: `<cache>/<sha1>/<file name>` for hashed assets and
/// `<cache>/by-url/<sha1 of url>/<file name>` otherwise. Remote assets are
/// downloaded with `ureq`; `file://` URLs and plain paths are copied in so the
/// flash image can be built next to the asset without touching the source tree.
#[derive(Debug, Clone)]
pub struct CachedAssetFetcher {
    cache_dir: PathBuf,
    base_dir: Option<PathBuf>,
}

impl CachedAssetFetcher {
    pub fn new(cache_dir: impl Into<PathBuf>) -> Self {
        Self {
            cache_dir: cache_dir.into(),
            base_dir: None,
        }
    }

    /// Directory relative local paths are resolved against.
    pub fn with_base_dir(mut self, base_dir: impl Into<PathBuf>) -> Self {
        self.base_dir = Some(base_dir.into());
        self
    }

    pub fn cache_dir(&self) -> &Path {
        &self.cache_dir
    }

    pub fn default_cache_dir() -> PathBuf {
        if let Some(dir) = std::env::var_os(CACHE_DIR_ENV) {
            return PathBuf::from(dir);
        }
        if let Some(dir) = std::env::var_os("XDG_CACHE_HOME") {
            return PathBuf::from(dir).join("picocheck");
        }
        if let Some(home) = std::env::var_os("HOME") {
            return PathBuf::from(home).join(".cache").join("picocheck");
        }
        std::env::temp_dir().join("picocheck-cache")
    }

    fn source<'a>(&self, url: &'a str) -> AssetSource<'a> {
        if url.starts_with("http://") || url.starts_with("https://") {
            return AssetSource::Remote(url);
        }
        let path = Path::new(url.strip_prefix("file://").unwrap_or(url));
        match &self.base_dir {
            Some(base) if path.is_relative() => AssetSource::Local(base.join(path)),
            _ => AssetSource::Local(path.to_path_buf()),
        }
    }

    fn slot(&self, asset: &AssetSpec, expected: Option<&str>) -> PathBuf {
        let dir = match expected {
            Some(hash) => self.cache_dir.join(hash),
            None => self
                .cache_dir
                .join("by-url")
                .join(sha1_hex(asset.url.as_bytes())),
        };
        dir.join(asset.file_name())
    }
}

impl AssetFetcher for CachedAssetFetcher {
    fn fetch(&self, asset: &AssetSpec) -> Result<PathBuf, AssetError> {
        let expected = match asset.sha1.as_deref() {
            Some(hash) if is_sha1_hex(hash) => Some(hash.to_ascii_lowercase()),
            Some(hash) => return Err(AssetError::InvalidHash(hash.to_string())),
            None => None,
        };
        let source = self.source(&asset.url);
        let path = self.slot(asset, expected.as_deref());

        if path.is_file() {
            match (&expected, &source) {
                (Some(hash), _) => {
                    if file_sha1(&path)? == *hash {
                        debug!("Asset cache hit: {:?}", path);
                        return Ok(path);
                    }
                    warn!("Cached asset {:?} failed verification, fetching again", path);
                }
                (None, AssetSource::Remote(_)) => {
                    debug!("Asset cache hit (unverified): {:?}", path);
                    return Ok(path);
                }
                (None, AssetSource::Local(_)) => {}
            }
        }

        let dir = path.parent().unwrap_or(self.cache_dir.as_path());
        fs::create_dir_all(dir).map_err(|e| AssetError::io(dir, e))?;
        let partial = path.with_extension("part");

        match &source {
            AssetSource::Remote(url) => {
                info!("Downloading {}", url);
                download(url, &partial)?;
            }
            AssetSource::Local(src) => {
                debug!("Copying asset from {:?}", src);
                fs::copy(src, &partial).map_err(|e| AssetError::io(src, e))?;
            }
        }

        let actual = file_sha1(&partial)?;
        if let Some(hash) = &expected {
            if actual != *hash {
                let _ = fs::remove_file(&partial);
                return Err(AssetError::HashMismatch {
                    url: asset.url.clone(),
                    expected: hash.clone(),
                    actual,
                });
            }
        }

        fs::rename(&partial, &path).map_err(|e| AssetError::io(&path, e))?;
        info!("Asset {} cached at {:?} (sha1 {})", asset.url, path, actual);
        Ok(path)
    }
}

fn download(url: &str, dest: &Path) -> Result<(), AssetError> {
    let failed = |message: String| AssetError::Download {
        url: url.to_string(),
        message,
    };
    let response = ureq::get(url).call().map_err(|e| failed(e.to_string()))?;
    let mut reader = response.into_reader();
    let mut file = fs::File::create(dest).map_err(|e| AssetError::io(dest, e))?;
    if let Err(e) = io::copy(&mut reader, &mut file) {
        drop(file);
        let _ = fs::remove_file(dest);
        return Err(failed(e.to_string()));
    }
    Ok(())
}

pub fn sha1_hex(bytes: &[u8]) -> String {
    let mut hasher = Sha1::new();
    hasher.update(bytes);
    format!("{:x}", hasher.finalize())
}

pub fn file_sha1(path: &Path) -> Result<String, AssetError> {
    let mut file = fs::File::open(path).map_err(|e| AssetError::io(path, e))?;
    let mut hasher = Sha1::new();
    let mut buf = [0u8; 64 * 1024];
    loop {
        let n = file.read(&mut buf).map_err(|e| AssetError::io(path, e))?;
        if n == 0 {
            break;
        }
        hasher.update(&buf[..n]);
    }
    Ok(format!("{:x}", hasher.finalize()))
}
