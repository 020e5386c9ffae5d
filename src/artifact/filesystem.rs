//! Filesystem utilities for working trees.
//!
//! Common operations used by extraction, injection and composition.

use anyhow::{Context, Result};
use std::fs;
use std::os::unix::fs::PermissionsExt;
use std::path::Path;

use crate::cancel::CancelToken;

/// Recursively copy a directory, preserving symlinks.
///
/// Unlike `fs::copy`, this properly handles:
/// - Nested directories and dotfiles
/// - Symbolic links (preserved, not followed)
/// - File permissions
///
/// Checks `cancel` before every entry. Returns the number of entries copied.
///
/// # Example
///
/// ```rust,ignore
/// use autoiso_builder::artifact::filesystem::copy_dir_recursive;
/// use std::path::Path;
///
/// copy_dir_recursive(Path::new("/mnt/iso"), Path::new("/tmp/tree"), &cancel)?;
/// ```
pub fn copy_dir_recursive(src: &Path, dst: &Path, cancel: &CancelToken) -> Result<usize> {
    if !dst.exists() {
        fs::create_dir_all(dst)
            .with_context(|| format!("Failed to create directory: {}", dst.display()))?;
    }

    let mut copied = 0;
    for entry in fs::read_dir(src)
        .with_context(|| format!("Failed to read directory: {}", src.display()))?
    {
        cancel.check()?;
        let entry = entry?;
        let src_path = entry.path();
        let dst_path = dst.join(entry.file_name());

        let file_type = entry.file_type()?;

        if file_type.is_symlink() {
            let target = fs::read_link(&src_path)?;
            if dst_path.exists() || dst_path.is_symlink() {
                fs::remove_file(&dst_path)?;
            }
            std::os::unix::fs::symlink(&target, &dst_path)
                .with_context(|| format!("Failed to create symlink: {}", dst_path.display()))?;
            copied += 1;
        } else if file_type.is_dir() {
            copied += 1 + copy_dir_recursive(&src_path, &dst_path, cancel)?;
            // Read-only media hand out r-x directories; keep them enterable and writable.
            let mode = fs::metadata(&src_path)?.permissions().mode() | 0o700;
            fs::set_permissions(&dst_path, fs::Permissions::from_mode(mode))?;
        } else {
            fs::copy(&src_path, &dst_path)
                .with_context(|| format!("Failed to copy file: {}", src_path.display()))?;
            copied += 1;
        }
    }

    Ok(copied)
}

/// Give the owner write access to everything under `root` (symlinks excluded).
pub fn make_tree_writable(root: &Path) -> Result<()> {
    for entry in walkdir::WalkDir::new(root).follow_links(false) {
        let entry = entry.with_context(|| format!("Failed to walk {}", root.display()))?;
        if entry.file_type().is_symlink() {
            continue;
        }
        let extra = if entry.file_type().is_dir() { 0o700 } else { 0o600 };
        let mode = entry.metadata()?.permissions().mode();
        if mode & extra != extra {
            fs::set_permissions(entry.path(), fs::Permissions::from_mode(mode | extra))
                .with_context(|| format!("Failed to chmod {}", entry.path().display()))?;
        }
    }
    Ok(())
}

/// Atomically move a file by renaming, with fallback to copy+delete.
///
/// Used for the "build to a temp name, then publish" pattern of cached
/// downloads and output images.
pub fn atomic_move(src: &Path, dst: &Path) -> Result<()> {
    if let Some(parent) = dst.parent() {
        fs::create_dir_all(parent)?;
    }
    match fs::rename(src, dst) {
        Ok(()) => Ok(()),
        Err(_) => {
            // Different filesystem, fall back to copy+delete
            fs::copy(src, dst)
                .with_context(|| format!("Failed to copy {} to {}", src.display(), dst.display()))?;
            fs::remove_file(src)
                .with_context(|| format!("Failed to remove {}", src.display()))?;
            Ok(())
        }
    }
}

/// Remove a file, treating "already gone" as success.
pub fn remove_file_if_exists(path: &Path) -> Result<()> {
    match fs::remove_file(path) {
        Err(e) if e.kind() != std::io::ErrorKind::NotFound => {
            Err(e).with_context(|| format!("Failed to remove {}", path.display()))
        }
        _ => Ok(()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_copy_dir_recursive() {
        let temp = TempDir::new().unwrap();
        let src = temp.path().join("src");
        let dst = temp.path().join("dst");

        fs::create_dir_all(src.join("subdir")).unwrap();
        fs::create_dir_all(src.join(".disk")).unwrap();
        fs::write(src.join("file.txt"), "hello").unwrap();
        fs::write(src.join("subdir/nested.txt"), "world").unwrap();
        fs::write(src.join(".disk/info"), "Ubuntu-Server").unwrap();
        std::os::unix::fs::symlink("file.txt", src.join("link")).unwrap();

        let copied = copy_dir_recursive(&src, &dst, &CancelToken::new()).unwrap();

        assert_eq!(copied, 6);
        assert!(dst.join("file.txt").exists());
        assert!(dst.join("subdir/nested.txt").exists());
        assert!(dst.join(".disk/info").exists());
        assert!(dst.join("link").is_symlink());
        assert_eq!(fs::read_link(dst.join("link")).unwrap().to_str().unwrap(), "file.txt");
    }

    #[test]
    fn test_copy_dir_recursive_cancelled() {
        let temp = TempDir::new().unwrap();
        let src = temp.path().join("src");
        fs::create_dir_all(&src).unwrap();
        fs::write(src.join("a"), "a").unwrap();
        let cancel = CancelToken::new();
        cancel.cancel();
        assert!(copy_dir_recursive(&src, &temp.path().join("dst"), &cancel).is_err());
    }

    #[test]
    fn test_make_tree_writable() {
        let temp = TempDir::new().unwrap();
        let dir = temp.path().join("ro");
        fs::create_dir_all(&dir).unwrap();
        fs::write(dir.join("grub.cfg"), "menuentry").unwrap();
        fs::set_permissions(dir.join("grub.cfg"), fs::Permissions::from_mode(0o444)).unwrap();
        fs::set_permissions(&dir, fs::Permissions::from_mode(0o555)).unwrap();

        make_tree_writable(temp.path()).unwrap();

        let file_mode = fs::metadata(dir.join("grub.cfg")).unwrap().permissions().mode();
        let dir_mode = fs::metadata(&dir).unwrap().permissions().mode();
        assert_eq!(file_mode & 0o600, 0o600);
        assert_eq!(dir_mode & 0o700, 0o700);
        fs::write(dir.join("grub.cfg"), "patched").unwrap();
    }

    #[test]
    fn test_atomic_move() {
        let temp = TempDir::new().unwrap();
        let src = temp.path().join("src.txt");
        let dst = temp.path().join("nested/dst.txt");

        fs::write(&src, "content").unwrap();
        atomic_move(&src, &dst).unwrap();

        assert!(!src.exists());
        assert_eq!(fs::read_to_string(&dst).unwrap(), "content");
    }

    #[test]
    fn test_remove_file_if_exists() {
        let temp = TempDir::new().unwrap();
        let path = temp.path().join("gone");
        remove_file_if_exists(&path).unwrap();
        fs::write(&path, "x").unwrap();
        remove_file_if_exists(&path).unwrap();
        assert!(!path.exists());
    }
}
