//! Cleanup that runs on every exit path.
//!
//! [`SecureTeardown`] is created before the first stage. Dropping it (on
//! error, panic unwinding or cancellation) or calling [`SecureTeardown::finish`]
//! shreds registered credential-bearing files, removes the working tree and
//! clears the credential variables from the environment. Nothing here fails:
//! problems become warnings in the [`TeardownReport`].

use anyhow::{Context, Result};
use std::fs::{self, OpenOptions};
use std::io::{Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};
use tempfile::TempDir;

use crate::artifact::filesystem::make_tree_writable;
use crate::overlay::credentials::CredentialVar;

/// Overwrite patterns, one pass each.
const SHRED_PASSES: [u8; 3] = [0x00, 0xFF, 0x00];
const SHRED_CHUNK: usize = 64 * 1024;

/// What teardown did.
#[derive(Debug, Default, Clone)]
pub struct TeardownReport {
    pub shredded: Vec<PathBuf>,
    pub removed_tree: Option<PathBuf>,
    pub cleared_vars: Vec<&'static str>,
    pub warnings: Vec<String>,
}

impl TeardownReport {
    pub fn is_clean(&self) -> bool {
        self.warnings.is_empty()
    }

    fn warn(&mut self, msg: String) {
        log::warn!("teardown: {msg}");
        self.warnings.push(msg);
    }
}

#[derive(Debug, Default)]
pub struct SecureTeardown {
    work_tree: Option<TempDir>,
    secret_files: Vec<PathBuf>,
    finished: bool,
}

impl SecureTeardown {
    pub fn new() -> Self {
        Self::default()
    }

    /// Create the working tree under `parent`, owned by this guard.
    pub fn create_work_tree(&mut self, parent: &Path) -> Result<PathBuf> {
        fs::create_dir_all(parent)
            .with_context(|| format!("Failed to create {}", parent.display()))?;
        let dir = tempfile::Builder::new()
            .prefix("autoiso-work-")
            .tempdir_in(parent)
            .with_context(|| format!("Failed to create a working tree in {}", parent.display()))?;
        let path = dir.path().to_path_buf();
        log::debug!("working tree {}", path.display());
        self.work_tree = Some(dir);
        Ok(path)
    }

    pub fn work_tree(&self) -> Option<&Path> {
        self.work_tree.as_ref().map(TempDir::path)
    }

    /// Shred `path` before the tree is removed.
    pub fn register_secret_file(&mut self, path: impl Into<PathBuf>) {
        self.secret_files.push(path.into());
    }

    pub fn finish(mut self) -> TeardownReport {
        self.run()
    }

    fn run(&mut self) -> TeardownReport {
        self.finished = true;
        let mut report = TeardownReport::default();

        for path in std::mem::take(&mut self.secret_files) {
            if !path.exists() {
                continue;
            }
            match shred_file(&path) {
                Ok(()) => report.shredded.push(path),
                Err(err) => report.warn(format!("{err:#}")),
            }
        }

        if let Some(dir) = self.work_tree.take() {
            let path = dir.path().to_path_buf();
            if let Err(err) = make_tree_writable(&path) {
                report.warn(format!("{err:#}"));
            }
            match dir.close() {
                Ok(()) => report.removed_tree = Some(path),
                Err(err) => report.warn(format!("Failed to remove {}: {err}", path.display())),
            }
        }

        for var in CredentialVar::ALL {
            let name = var.env_name();
            if std::env::var_os(name).is_some() {
                std::env::remove_var(name);
                report.cleared_vars.push(name);
            }
        }

        log::debug!(
            "teardown: {} file(s) shredded, tree {}, {} variable(s) cleared",
            report.shredded.len(),
            if report.removed_tree.is_some() { "removed" } else { "absent" },
            report.cleared_vars.len()
        );
        report
    }
}

impl Drop for SecureTeardown {
    fn drop(&mut self) {
        if !self.finished {
            self.run();
        }
    }
}

/// Overwrite a file in place with each pass pattern, syncing after each,
/// then delete it.
pub fn shred_file(path: &Path) -> Result<()> {
    let mut file = OpenOptions::new()
        .write(true)
        .open(path)
        .with_context(|| format!("Failed to open {} for shredding", path.display()))?;
    let len = file.metadata()?.len();

    for pattern in SHRED_PASSES {
        file.seek(SeekFrom::Start(0))?;
        let chunk = vec![pattern; SHRED_CHUNK];
        let mut left = len;
        while left > 0 {
            let n = left.min(SHRED_CHUNK as u64) as usize;
            file.write_all(&chunk[..n])?;
            left -= n as u64;
        }
        file.sync_all()
            .with_context(|| format!("Failed to sync {}", path.display()))?;
    }
    drop(file);
    fs::remove_file(path).with_context(|| format!("Failed to remove {}", path.display()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::overlay::credentials::{ENV_PASSWORD, ENV_SSH_KEY};
    use std::os::unix::fs::PermissionsExt;

    #[test]
    fn test_shred_file() {
        let temp = TempDir::new().unwrap();
        let path = temp.path().join("user-data");
        fs::write(&path, vec![b'p'; 200_000]).unwrap();
        shred_file(&path).unwrap();
        assert!(!path.exists());
    }

    #[test]
    fn test_finish_removes_everything() {
        let parent = TempDir::new().unwrap();
        temp_env::with_vars(
            [(ENV_PASSWORD, Some("Valid@Pass123!")), (ENV_SSH_KEY, Some("ssh-ed25519 AAAA"))],
            || {
                let mut teardown = SecureTeardown::new();
                let tree = teardown.create_work_tree(parent.path()).unwrap();
                fs::create_dir_all(tree.join("nocloud")).unwrap();
                let secret = tree.join("nocloud/user-data");
                fs::write(&secret, "password: hash").unwrap();
                teardown.register_secret_file(&secret);
                // Read-only leftovers from the source medium.
                fs::create_dir_all(tree.join("casper")).unwrap();
                fs::set_permissions(tree.join("casper"), fs::Permissions::from_mode(0o555))
                    .unwrap();

                let report = teardown.finish();

                assert!(report.is_clean(), "{:?}", report.warnings);
                assert_eq!(report.shredded, vec![secret]);
                assert_eq!(report.removed_tree, Some(tree.clone()));
                assert!(!tree.exists());
                assert_eq!(report.cleared_vars, vec![ENV_PASSWORD, ENV_SSH_KEY]);
                assert!(std::env::var_os(ENV_PASSWORD).is_none());
                assert!(std::env::var_os(ENV_SSH_KEY).is_none());
            },
        );
    }

    #[test]
    fn test_drop_runs_teardown() {
        let parent = TempDir::new().unwrap();
        temp_env::with_var(ENV_PASSWORD, Some("Valid@Pass123!"), || {
            let tree = {
                let mut teardown = SecureTeardown::new();
                teardown.create_work_tree(parent.path()).unwrap()
            };
            assert!(!tree.exists());
            assert!(std::env::var_os(ENV_PASSWORD).is_none());
        });
    }

    #[test]
    fn test_missing_secret_file_is_not_a_warning() {
        // Holds the environment lock, since finish() clears variables.
        temp_env::with_vars_unset([ENV_PASSWORD, ENV_SSH_KEY], || {
            let mut teardown = SecureTeardown::new();
            teardown.register_secret_file("/nonexistent/user-data");
            let report = teardown.finish();
            assert!(report.is_clean());
            assert!(report.shredded.is_empty());
            assert!(report.removed_tree.is_none());
        });
    }
}
