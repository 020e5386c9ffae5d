//! Unpack a source image into a working tree.
//!
//! Two strategies sit behind [`Extractor`]: a privileged loop mount and the
//! built-in ISO9660 reader. The strategy is picked once from the
//! [`BackendSelection`]; a failure in one never falls back to the other.

use anyhow::{Context, Result};
use std::fs;
use std::path::{Path, PathBuf};

use super::filesystem::{copy_dir_recursive, make_tree_writable};
use super::iso::UEFI_CANDIDATES;
use super::iso9660::reader::IsoReader;
use crate::cancel::CancelToken;
use crate::error::{BuildError, BuildResult};
use crate::preflight::{BackendSelection, ExtractionMode};
use crate::process::Cmd;

/// Where a UEFI image recovered from the boot catalog is placed.
const RECOVERED_EFI_IMAGE: &str = "boot/grub/efi.img";

pub trait Extractor {
    fn name(&self) -> &'static str;

    /// Copy the full contents of `image` into `tree`. Returns the entry count.
    fn extract(&self, image: &Path, tree: &Path, cancel: &CancelToken) -> Result<usize>;
}

/// `losetup` + read-only `mount`, then a recursive copy.
#[derive(Debug, Default)]
pub struct LoopMount;

/// Mount-free extraction with the ISO9660 reader.
#[derive(Debug, Default)]
pub struct SoftwareReader;

impl Extractor for LoopMount {
    fn name(&self) -> &'static str {
        "loop mount"
    }

    fn extract(&self, image: &Path, tree: &Path, cancel: &CancelToken) -> Result<usize> {
        let device = LoopDevice::attach(image)?;
        let mount_point = tempfile::Builder::new()
            .prefix("autoiso-mnt-")
            .tempdir()
            .context("Failed to create mount point")?;
        let mounted = Mount::new(&device.path, mount_point.path())?;
        let copied = copy_dir_recursive(&mounted.path, tree, cancel)?;
        drop(mounted);
        drop(device);
        Ok(copied)
    }
}

impl Extractor for SoftwareReader {
    fn name(&self) -> &'static str {
        "iso9660 reader"
    }

    fn extract(&self, image: &Path, tree: &Path, cancel: &CancelToken) -> Result<usize> {
        let mut reader = IsoReader::open(image)?;
        if !reader.has_rock_ridge() {
            log::warn!("{} has no Rock Ridge data; using ISO9660 names", image.display());
        }
        reader.extract_all(tree, cancel)
    }
}

/// The extractor for a detected mode.
pub fn extractor_for(mode: ExtractionMode) -> Box<dyn Extractor> {
    match mode {
        ExtractionMode::Privileged => Box::new(LoopMount),
        ExtractionMode::SoftwareOnly => Box::new(SoftwareReader),
    }
}

/// Unpack `image` into `tree` with the selected backend and make the result
/// owner-writable.
pub fn extract_image(
    selection: &BackendSelection,
    image: &Path,
    tree: &Path,
    cancel: &CancelToken,
) -> BuildResult<usize> {
    let extractor = extractor_for(selection.extraction_mode);
    log::info!("Extracting {} ({})", image.display(), extractor.name());

    let result = (|| -> Result<usize> {
        fs::create_dir_all(tree)
            .with_context(|| format!("Failed to create {}", tree.display()))?;
        let count = extractor.extract(image, tree, cancel)?;
        make_tree_writable(tree)?;
        recover_efi_image(image, tree)?;
        Ok(count)
    })();

    match result {
        Ok(count) => {
            log::info!("Extracted {count} entries into {}", tree.display());
            Ok(count)
        }
        Err(err) => Err(BuildError::extraction(image, err)),
    }
}

/// Newer images keep the UEFI boot image in an appended partition that the
/// file tree does not list. Dump it from the boot catalog so the tree can be
/// recomposed.
pub fn recover_efi_image(image: &Path, tree: &Path) -> Result<Option<PathBuf>> {
    if UEFI_CANDIDATES.iter().any(|rel| tree.join(rel).is_file()) {
        return Ok(None);
    }
    let mut reader = IsoReader::open(image)?;
    let Some(entry) = reader.boot_catalog()?.and_then(|c| c.uefi) else {
        return Ok(None);
    };
    if entry.sector_count == 0 {
        log::warn!("UEFI boot entry has no length; not recovering it");
        return Ok(None);
    }
    let bytes = reader.read_bytes(entry.load_rba, usize::from(entry.sector_count) * 512)?;
    let dest = tree.join(RECOVERED_EFI_IMAGE);
    if let Some(parent) = dest.parent() {
        fs::create_dir_all(parent)?;
    }
    fs::write(&dest, bytes).with_context(|| format!("Failed to write {}", dest.display()))?;
    log::info!("Recovered UEFI boot image into {}", dest.display());
    Ok(Some(dest))
}

/// Read-only loop device, detached on drop.
struct LoopDevice {
    path: PathBuf,
}

impl LoopDevice {
    fn attach(image: &Path) -> Result<Self> {
        let result = Cmd::new("losetup")
            .args(["--find", "--show", "--read-only"])
            .arg_path(image)
            .error_msg(format!("losetup failed for {}", image.display()))
            .run()?;
        let device = result.stdout.trim();
        if device.is_empty() {
            anyhow::bail!("losetup printed no device for {}", image.display());
        }
        log::debug!("attached {} to {device}", image.display());
        Ok(Self {
            path: PathBuf::from(device),
        })
    }
}

impl Drop for LoopDevice {
    fn drop(&mut self) {
        if let Err(err) = Cmd::new("losetup").arg("-d").arg_path(&self.path).run() {
            log::warn!("Failed to detach {}: {err:#}", self.path.display());
        }
    }
}

/// Read-only mount, unmounted on drop.
struct Mount {
    path: PathBuf,
}

impl Mount {
    fn new(device: &Path, mount_point: &Path) -> Result<Self> {
        Cmd::new("mount")
            .args(["-o", "ro"])
            .arg_path(device)
            .arg_path(mount_point)
            .error_msg(format!("mount of {} failed", device.display()))
            .run()?;
        Ok(Self {
            path: mount_point.to_path_buf(),
        })
    }
}

impl Drop for Mount {
    fn drop(&mut self) {
        if let Err(err) = Cmd::new("umount").arg_path(&self.path).run() {
            log::warn!("Failed to unmount {}: {err:#}", self.path.display());
        }
    }
}
