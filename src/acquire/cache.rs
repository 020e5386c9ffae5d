//! On-disk image cache.
//!
//! Layout: `<root>/<version>/<filename>` with a `<filename>.sha256` sidecar in
//! manifest format. Downloads land in a hidden, uniquely named sibling and
//! are published by rename, so readers never observe a partial image and
//! concurrent builds need no lock.

use anyhow::{Context, Result};
use sha2::{Digest, Sha256};
use std::fs::{self, File};
use std::io::{BufReader, Read};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use super::manifest::{format_line, ChecksumManifest};
use crate::artifact::filesystem::{atomic_move, remove_file_if_exists};

const PARTIAL_MARKER: &str = ".part-";

#[derive(Debug, Clone)]
pub struct ImageCache {
    root: PathBuf,
}

impl ImageCache {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn image_path(&self, version: &str, filename: &str) -> PathBuf {
        self.root.join(version).join(filename)
    }

    /// A fresh, unique partial-download path next to the final image.
    pub fn partial_path(&self, version: &str, filename: &str) -> PathBuf {
        self.root
            .join(version)
            .join(tmp_name(&format!(".{filename}")))
    }

    /// Digest recorded for `image`, if a well-formed sidecar exists.
    pub fn read_sidecar(&self, image: &Path) -> Option<String> {
        let text = fs::read_to_string(sidecar_path(image)).ok()?;
        let name = image.file_name()?.to_str()?;
        ChecksumManifest::parse(&text).lookup(name).map(str::to_string)
    }

    pub fn write_sidecar(&self, image: &Path, digest: &str) -> Result<()> {
        write_checksum_file(image, digest)
    }

    /// Remove `image` and its sidecar. Missing files are not an error.
    pub fn remove(&self, image: &Path) -> Result<()> {
        remove_file_if_exists(image)?;
        remove_file_if_exists(&sidecar_path(image))
    }

    /// Delete cached images, sidecars and leftover partial downloads whose
    /// modification time is older than `max_age`. Returns how many files went.
    pub fn evict_older_than(&self, max_age: Duration) -> Result<usize> {
        if !self.root.is_dir() {
            return Ok(0);
        }
        let cutoff = SystemTime::now()
            .checked_sub(max_age)
            .unwrap_or(UNIX_EPOCH);
        let mut removed = 0;

        for entry in walkdir::WalkDir::new(&self.root).min_depth(2).max_depth(2) {
            let entry = entry.with_context(|| format!("Failed to scan {}", self.root.display()))?;
            if !entry.file_type().is_file() {
                continue;
            }
            let modified = entry
                .metadata()
                .ok()
                .and_then(|m| m.modified().ok())
                .unwrap_or(SystemTime::now());
            if modified >= cutoff {
                continue;
            }
            let path = entry.path();
            fs::remove_file(path)
                .with_context(|| format!("Failed to evict {}", path.display()))?;
            log::info!("evicted {}", path.display());
            removed += 1;
        }

        // Drop version directories left empty.
        if let Ok(dirs) = fs::read_dir(&self.root) {
            for dir in dirs.flatten() {
                let _ = fs::remove_dir(dir.path());
            }
        }
        Ok(removed)
    }
}

/// `<path>.sha256`
pub fn sidecar_path(path: &Path) -> PathBuf {
    let mut name = path.file_name().unwrap_or_default().to_os_string();
    name.push(".sha256");
    path.with_file_name(name)
}

/// Write a one-line manifest for `path` next to it, atomically.
pub fn write_checksum_file(path: &Path, digest: &str) -> Result<()> {
    let name = path
        .file_name()
        .and_then(|n| n.to_str())
        .with_context(|| format!("Non UTF-8 file name: {}", path.display()))?;
    let sidecar = sidecar_path(path);
    let tmp = sidecar.with_file_name(tmp_name(&format!(".{name}.sha256")));
    fs::write(&tmp, format_line(digest, name))
        .with_context(|| format!("Failed to write {}", tmp.display()))?;
    atomic_move(&tmp, &sidecar)
}

/// Streaming SHA-256 of a file. Returns `(hex digest, size)`.
pub fn sha256_file(path: &Path) -> Result<(String, u64)> {
    let f = File::open(path).with_context(|| format!("Failed to open {}", path.display()))?;
    let mut r = BufReader::new(f);
    let mut hasher = Sha256::new();
    let mut buf = vec![0u8; 1024 * 1024];
    let mut size = 0u64;
    loop {
        let n = r.read(&mut buf)?;
        if n == 0 {
            break;
        }
        hasher.update(&buf[..n]);
        size += n as u64;
    }
    Ok((format!("{:x}", hasher.finalize()), size))
}

pub(crate) fn is_partial_name(name: &str) -> bool {
    name.starts_with('.') && name.contains(PARTIAL_MARKER)
}

fn tmp_name(prefix: &str) -> String {
    static SEQ: AtomicU64 = AtomicU64::new(0);
    let n = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_nanos();
    let seq = SEQ.fetch_add(1, Ordering::Relaxed);
    format!("{prefix}{PARTIAL_MARKER}{n}-{}-{seq}", std::process::id())
}
