//! In-memory mirror for tests.

use std::collections::HashMap;
use std::io::Write;
use std::path::Path;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::time::Duration;

use sha2::{Digest, Sha256};

use super::manifest::format_line;
use super::mirror::{open_partial, DownloadError, MirrorClient};
use super::MANIFEST_NAME;
use crate::cancel::CancelToken;

#[derive(Default)]
pub(crate) struct FakeMirror {
    files: HashMap<String, Vec<u8>>,
    /// Number of `fetch_to` calls that fail after writing half the remainder.
    fail_first: u32,
    latency: Duration,
    requests: AtomicU32,
    fetches: AtomicU32,
    resumed: AtomicBool,
}

impl FakeMirror {
    pub(crate) fn new() -> Self {
        Self::default()
    }

    /// Publish `body` as `<base>/<version>/<filename>` plus a SHA256SUMS entry.
    pub(crate) fn with_release(mut self, base: &str, version: &str, filename: &str, body: &[u8]) -> Self {
        let digest = format!("{:x}", Sha256::digest(body));
        self.files
            .insert(format!("{base}/{version}/{filename}"), body.to_vec());
        self.files.insert(
            format!("{base}/{version}/{MANIFEST_NAME}"),
            format_line(&digest, filename).into_bytes(),
        );
        self
    }

    /// Replace the body at `url` without touching the manifest.
    pub(crate) fn serving(mut self, url: &str, body: &[u8]) -> Self {
        self.files.insert(url.to_string(), body.to_vec());
        self
    }

    pub(crate) fn without_manifest(mut self) -> Self {
        self.files.retain(|url, _| !url.ends_with(MANIFEST_NAME));
        self
    }

    pub(crate) fn failing_first(mut self, n: u32) -> Self {
        self.fail_first = n;
        self
    }

    pub(crate) fn with_latency(mut self, latency: Duration) -> Self {
        self.latency = latency;
        self
    }

    /// Total requests of any kind.
    pub(crate) fn requests(&self) -> u32 {
        self.requests.load(Ordering::SeqCst)
    }

    pub(crate) fn fetch_attempts(&self) -> u32 {
        self.fetches.load(Ordering::SeqCst)
    }

    pub(crate) fn resumed(&self) -> bool {
        self.resumed.load(Ordering::SeqCst)
    }

    fn body(&self, url: &str) -> Result<&Vec<u8>, DownloadError> {
        self.requests.fetch_add(1, Ordering::SeqCst);
        self.files.get(url).ok_or_else(|| DownloadError::NotFound {
            url: url.to_string(),
        })
    }
}

impl MirrorClient for FakeMirror {
    fn exists(&self, url: &str) -> Result<bool, DownloadError> {
        Ok(self.body(url).is_ok())
    }

    fn fetch_text(&self, url: &str) -> Result<String, DownloadError> {
        Ok(String::from_utf8_lossy(self.body(url)?).into_owned())
    }

    fn fetch_to(&self, url: &str, dest: &Path, cancel: &CancelToken) -> Result<u64, DownloadError> {
        let call = self.fetches.fetch_add(1, Ordering::SeqCst);
        let body = self.body(url)?;
        let offset = dest.metadata().map(|m| m.len()).unwrap_or(0);
        if offset > 0 {
            self.resumed.store(true, Ordering::SeqCst);
        }
        let start = (offset as usize).min(body.len());
        let remaining = &body[start..];

        let mut file = open_partial(dest, true)?;
        if call < self.fail_first {
            file.write_all(&remaining[..remaining.len() / 2])?;
            return Err(DownloadError::Http {
                url: url.to_string(),
                reason: "connection reset".to_string(),
            });
        }
        for chunk in remaining.chunks(64 * 1024) {
            if cancel.is_cancelled() {
                return Err(DownloadError::Cancelled);
            }
            if !self.latency.is_zero() {
                std::thread::sleep(self.latency);
            }
            file.write_all(chunk)?;
        }
        Ok(body.len() as u64)
    }
}
