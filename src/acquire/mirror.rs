//! Mirror access.
//!
//! The acquisition logic only talks to [`MirrorClient`], so tests can swap
//! the network for an in-memory mirror.

use std::fs::{File, OpenOptions};
use std::io::{Read, Write};
use std::path::Path;
use std::time::Duration;

use crate::cancel::CancelToken;

const CHUNK: usize = 1024 * 1024;

/// Errors from a single mirror request.
#[derive(Debug, thiserror::Error)]
pub enum DownloadError {
    #[error("not found: {url}")]
    NotFound { url: String },

    #[error("request to {url} failed: {reason}")]
    Http { url: String, reason: String },

    #[error("I/O error writing download: {0}")]
    Io(#[from] std::io::Error),

    #[error("download interrupted")]
    Cancelled,
}

pub trait MirrorClient: Send + Sync {
    /// Whether `url` exists (HEAD). A 404 is `Ok(false)`.
    fn exists(&self, url: &str) -> Result<bool, DownloadError>;

    /// Fetch a small text resource.
    fn fetch_text(&self, url: &str) -> Result<String, DownloadError>;

    /// Download `url` into `dest`, resuming from `dest`'s current length.
    ///
    /// Returns the final length of `dest`. A server that ignores the range
    /// request restarts the file from zero.
    fn fetch_to(&self, url: &str, dest: &Path, cancel: &CancelToken) -> Result<u64, DownloadError>;
}

/// `ureq`-backed mirror client.
///
/// `timeout` bounds connecting and waiting for response headers, and the
/// whole of a probe or manifest request. An image body has no total limit.
#[derive(Clone)]
pub struct HttpMirror {
    agent: ureq::Agent,
    timeout: Duration,
}

impl HttpMirror {
    pub fn new(timeout: Duration) -> Self {
        let config = ureq::Agent::config_builder()
            .timeout_global(None)
            .timeout_connect(Some(timeout))
            .timeout_recv_response(Some(timeout))
            .build();
        Self {
            agent: ureq::Agent::new_with_config(config),
            timeout,
        }
    }
}

impl MirrorClient for HttpMirror {
    fn exists(&self, url: &str) -> Result<bool, DownloadError> {
        let request = self
            .agent
            .head(url)
            .config()
            .timeout_global(Some(self.timeout))
            .build();
        match request.call() {
            Ok(_) => Ok(true),
            Err(e) => match map_ureq_error(url, &e) {
                DownloadError::NotFound { .. } => Ok(false),
                other => Err(other),
            },
        }
    }

    fn fetch_text(&self, url: &str) -> Result<String, DownloadError> {
        let response = self
            .agent
            .get(url)
            .config()
            .timeout_global(Some(self.timeout))
            .build()
            .call()
            .map_err(|e| map_ureq_error(url, &e))?;
        response
            .into_body()
            .read_to_string()
            .map_err(|e| DownloadError::Http {
                url: url.to_owned(),
                reason: e.to_string(),
            })
    }

    fn fetch_to(&self, url: &str, dest: &Path, cancel: &CancelToken) -> Result<u64, DownloadError> {
        let offset = partial_len(dest);
        let mut request = self.agent.get(url);
        if offset > 0 {
            request = request.header("Range", format!("bytes={offset}-"));
        }

        let response = match request.call() {
            Ok(response) => response,
            // The partial file already holds the whole body.
            Err(ureq::Error::StatusCode(416)) if offset > 0 => return Ok(offset),
            Err(e) => return Err(map_ureq_error(url, &e)),
        };

        let resumed = offset > 0 && response.status().as_u16() == 206;
        if offset > 0 && !resumed {
            log::debug!("{url} ignored the range request; restarting");
        }
        let mut file = open_partial(dest, resumed)?;
        let mut body = response.into_body();
        let mut reader = body.as_reader();
        copy_chunks(&mut reader, &mut file, cancel)?;
        file.sync_all()?;
        Ok(partial_len(dest))
    }
}

fn partial_len(dest: &Path) -> u64 {
    dest.metadata().map(|m| m.len()).unwrap_or(0)
}

/// Open `dest` for appending, or truncated when `append` is false.
pub(crate) fn open_partial(dest: &Path, append: bool) -> std::io::Result<File> {
    OpenOptions::new()
        .create(true)
        .write(true)
        .append(append)
        .truncate(!append)
        .open(dest)
}

/// Stream `reader` into `out`, checking `cancel` between chunks.
pub(crate) fn copy_chunks(
    reader: &mut dyn Read,
    out: &mut dyn Write,
    cancel: &CancelToken,
) -> Result<u64, DownloadError> {
    let mut buf = vec![0u8; CHUNK];
    let mut total = 0u64;
    loop {
        if cancel.is_cancelled() {
            return Err(DownloadError::Cancelled);
        }
        let n = reader.read(&mut buf)?;
        if n == 0 {
            return Ok(total);
        }
        out.write_all(&buf[..n])?;
        total += n as u64;
    }
}

fn map_ureq_error(url: &str, err: &ureq::Error) -> DownloadError {
    match err {
        ureq::Error::StatusCode(404) => DownloadError::NotFound {
            url: url.to_owned(),
        },
        other => DownloadError::Http {
            url: url.to_owned(),
            reason: other.to_string(),
        },
    }
}
