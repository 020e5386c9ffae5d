//! Source image acquisition.
//!
//! Finds the requested release on the primary mirror (falling back to the
//! archive mirror), downloads it with bounded, resumable retry, checks it
//! against the release's `SHA256SUMS`, and publishes it into the cache.
//!
//! A cached image is reused without touching the network when its digest
//! still matches the sidecar written when it was first verified.

pub mod cache;
pub mod manifest;
pub mod mirror;
pub mod retry;

#[cfg(test)]
pub(crate) mod fake;

use std::path::PathBuf;
use std::time::SystemTime;

use crate::artifact::filesystem::atomic_move;
use crate::cancel::CancelToken;
use crate::config::BuildConfig;
use crate::error::{BuildError, BuildResult};

use cache::{sha256_file, ImageCache};
use manifest::ChecksumManifest;
use mirror::MirrorClient;
use retry::RetryFailure;

/// Releases known to be published with a live-server image.
pub const KNOWN_VERSIONS: &[&str] = &[
    "20.04.6", "22.04.4", "22.04.5", "24.04", "24.04.1", "24.04.2", "24.10",
];

pub const MANIFEST_NAME: &str = "SHA256SUMS";

/// A verified (or knowingly unverified) image in the cache.
#[derive(Debug, Clone)]
pub struct SourceImage {
    pub version: String,
    /// Mirror the image came from; `None` for a cache hit.
    pub mirror_base_url: Option<String>,
    pub cache_path: PathBuf,
    pub expected_sha256: Option<String>,
    pub cached_at: SystemTime,
}

pub struct Acquirer<'a> {
    config: &'a BuildConfig,
    mirror: &'a dyn MirrorClient,
    cache: ImageCache,
    cancel: CancelToken,
}

impl<'a> Acquirer<'a> {
    pub fn new(config: &'a BuildConfig, mirror: &'a dyn MirrorClient, cancel: CancelToken) -> Self {
        Self {
            config,
            mirror,
            cache: ImageCache::new(&config.cache_dir),
            cancel,
        }
    }

    pub fn acquire(&self) -> BuildResult<SourceImage> {
        let filename = self.config.image_filename();
        let cached = self.cache.image_path(&self.config.version, &filename);

        if let Some(hit) = self.cache_hit(&cached)? {
            return Ok(hit);
        }
        self.cancel.check()?;

        let base = self.resolve_mirror(&filename)?;
        let url = format!("{base}/{}/{filename}", self.config.version);

        let expected = if self.config.verify_checksum {
            self.expected_digest(&base, &filename)
        } else {
            None
        };

        if cached.exists() && !self.config.no_cache {
            if let Some(expected) = &expected {
                let actual = self.digest(&cached, &url)?;
                if &actual == expected {
                    log::info!("cached {} matches the published checksum", cached.display());
                    self.cache
                        .write_sidecar(&cached, &actual)
                        .map_err(|e| cache_failure(&url, e))?;
                    return Ok(self.source(&cached, Some(base), Some(actual)));
                }
                log::warn!(
                    "cached {} is corrupt (sha256 {actual}, expected {expected}); re-downloading",
                    cached.display()
                );
                self.cache
                    .remove(&cached)
                    .map_err(|e| cache_failure(&url, e))?;
            }
        }

        let partial = self.download(&url, &filename)?;

        let (actual, size) = match sha256_file(&partial) {
            Ok(v) => v,
            Err(e) => {
                let _ = std::fs::remove_file(&partial);
                return Err(cache_failure(&url, e));
            }
        };
        match &expected {
            Some(expected) if expected != &actual => {
                let _ = std::fs::remove_file(&partial);
                return Err(BuildError::ChecksumMismatch {
                    file: cached,
                    expected: expected.clone(),
                    actual,
                });
            }
            Some(_) => log::info!("sha256 verified ({size} bytes)"),
            None if self.config.verify_checksum => {
                log::warn!("no published checksum for {filename}; image is unverified")
            }
            None => {}
        }

        if let Err(e) = atomic_move(&partial, &cached) {
            let _ = std::fs::remove_file(&partial);
            return Err(cache_failure(&url, e));
        }
        self.cache
            .write_sidecar(&cached, &actual)
            .map_err(|e| cache_failure(&url, e))?;
        log::info!("cached {}", cached.display());

        Ok(self.source(&cached, Some(base), expected))
    }

    fn cache_hit(&self, cached: &std::path::Path) -> BuildResult<Option<SourceImage>> {
        if self.config.no_cache || !cached.exists() {
            return Ok(None);
        }
        if !self.config.verify_checksum {
            log::info!("using cached {} (verification disabled)", cached.display());
            return Ok(Some(self.source(cached, None, None)));
        }
        let Some(recorded) = self.cache.read_sidecar(cached) else {
            log::debug!("{} has no checksum sidecar", cached.display());
            return Ok(None);
        };
        let actual = self.digest(cached, &cached.display().to_string())?;
        if actual == recorded {
            log::info!("using cached {}", cached.display());
            return Ok(Some(self.source(cached, None, Some(actual))));
        }
        log::warn!(
            "cached {} no longer matches its recorded checksum",
            cached.display()
        );
        Ok(None)
    }

    /// First mirror that publishes the image.
    fn resolve_mirror(&self, filename: &str) -> BuildResult<String> {
        let mut bases = vec![self.config.mirror_url.clone()];
        if self.config.archive_mirror_url != self.config.mirror_url {
            bases.push(self.config.archive_mirror_url.clone());
        }

        let mut tried = Vec::new();
        let mut last_error = None;
        for base in bases {
            let url = format!("{base}/{}/{filename}", self.config.version);
            match self.mirror.exists(&url) {
                Ok(true) => {
                    log::info!("found {url}");
                    return Ok(base);
                }
                Ok(false) => log::debug!("{url} not found"),
                Err(e) => {
                    log::warn!("probing {url} failed: {e}");
                    last_error = Some((url.clone(), e));
                }
            }
            tried.push(url);
        }

        if let Some((url, e)) = last_error {
            return Err(BuildError::DownloadFailure {
                url,
                attempts: 1,
                reason: e.to_string(),
            });
        }
        Err(BuildError::VersionNotFound {
            version: self.config.version.clone(),
            tried,
            known: KNOWN_VERSIONS.iter().map(|v| v.to_string()).collect(),
        })
    }

    /// Published digest for `filename`; failures only downgrade verification.
    fn expected_digest(&self, base: &str, filename: &str) -> Option<String> {
        let url = format!("{base}/{}/{MANIFEST_NAME}", self.config.version);
        match self.mirror.fetch_text(&url) {
            Ok(text) => {
                let manifest = ChecksumManifest::parse(&text);
                let digest = manifest.lookup(filename).map(str::to_string);
                if digest.is_none() {
                    log::warn!("{url} has no entry for {filename}");
                }
                digest
            }
            Err(e) => {
                log::warn!("checksum manifest unavailable ({e}); continuing without verification");
                None
            }
        }
    }

    fn download(&self, url: &str, filename: &str) -> BuildResult<PathBuf> {
        let partial = self.cache.partial_path(&self.config.version, filename);
        if let Some(parent) = partial.parent() {
            std::fs::create_dir_all(parent)
                .map_err(|e| cache_failure(url, anyhow::Error::new(e)))?;
        }

        let policy = self.config.retry;
        let result = policy.run(&self.cancel, |attempt| {
            log::info!("downloading {url} (attempt {attempt}/{})", policy.attempts);
            self.mirror.fetch_to(url, &partial, &self.cancel)
        });

        match result {
            Ok(bytes) => {
                log::debug!("downloaded {bytes} bytes to {}", partial.display());
                Ok(partial)
            }
            Err(failure) => {
                let _ = std::fs::remove_file(&partial);
                Err(match failure {
                    RetryFailure::Cancelled => BuildError::Cancelled,
                    RetryFailure::Exhausted { attempts, last } => BuildError::DownloadFailure {
                        url: url.to_string(),
                        attempts,
                        reason: last.to_string(),
                    },
                })
            }
        }
    }

    fn digest(&self, path: &std::path::Path, url: &str) -> BuildResult<String> {
        sha256_file(path)
            .map(|(digest, _)| digest)
            .map_err(|e| cache_failure(url, e))
    }

    fn source(
        &self,
        path: &std::path::Path,
        mirror: Option<String>,
        expected: Option<String>,
    ) -> SourceImage {
        let cached_at = path
            .metadata()
            .and_then(|m| m.modified())
            .unwrap_or_else(|_| SystemTime::now());
        SourceImage {
            version: self.config.version.clone(),
            mirror_base_url: mirror,
            cache_path: path.to_path_buf(),
            expected_sha256: expected,
            cached_at,
        }
    }
}

fn cache_failure(url: &str, err: anyhow::Error) -> BuildError {
    BuildError::DownloadFailure {
        url: url.to_string(),
        attempts: 0,
        reason: format!("cache: {err:#}"),
    }
}
