//! Rebuild a bootable image from a working tree and verify it.

use anyhow::{bail, Context, Result};
use std::collections::HashMap;
use std::fs;
use std::path::{Path, PathBuf};

use super::filesystem::{atomic_move, remove_file_if_exists};
use super::iso::{volume_id, BootEntryInfo, BootLayout, OutputImage};
use super::iso9660::eltorito::{same_boot_image, CatalogEntry};
use super::iso9660::reader::{EntryKind, IsoEntry, IsoReader};
use super::iso9660::writer::write_image;
use super::iso_utils::{generate_iso_checksum, run_native_tool};
use crate::cancel::CancelToken;
use crate::error::{BuildError, BuildResult};
use crate::preflight::{BackendSelection, ToolId};

/// How the image gets authored.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CompositionBackend {
    Native(ToolId),
    Software,
}

impl CompositionBackend {
    pub fn from_selection(selection: &BackendSelection) -> Self {
        match selection.composition_tool {
            Some(tool) => Self::Native(tool),
            None => Self::Software,
        }
    }

    fn name(self) -> &'static str {
        match self {
            Self::Native(tool) => tool.command(),
            Self::Software => "built-in iso9660 writer",
        }
    }
}

pub struct Composer<'a> {
    backend: CompositionBackend,
    cancel: &'a CancelToken,
}

impl<'a> Composer<'a> {
    pub fn new(selection: &BackendSelection, cancel: &'a CancelToken) -> Self {
        Self {
            backend: CompositionBackend::from_selection(selection),
            cancel,
        }
    }

    pub fn backend(&self) -> CompositionBackend {
        self.backend
    }

    /// Author `tree` into `output`, verify the result and write its checksum
    /// sidecar. On failure nothing is left at `output`.
    pub fn compose(&self, tree: &Path, label: &str, output: &Path) -> BuildResult<OutputImage> {
        let partial = partial_path(output);
        log::info!("Composing {} ({})", output.display(), self.backend.name());

        match self.compose_inner(tree, label, &partial, output) {
            Ok(image) => Ok(image),
            Err(err) => {
                for path in [partial.as_path(), output] {
                    if let Err(e) = remove_file_if_exists(path) {
                        log::warn!("{e:#}");
                    }
                }
                Err(BuildError::composition(output, err))
            }
        }
    }

    fn compose_inner(
        &self,
        tree: &Path,
        label: &str,
        partial: &Path,
        output: &Path,
    ) -> Result<OutputImage> {
        let layout = BootLayout::detect(tree)?;
        if let Some(parent) = output.parent() {
            fs::create_dir_all(parent)
                .with_context(|| format!("Failed to create {}", parent.display()))?;
        }
        remove_file_if_exists(partial)?;

        let vol = volume_id(label);
        match self.backend {
            CompositionBackend::Native(tool) => {
                // The tool writes its own catalog; a stale copy from the
                // source image would collide with it.
                remove_file_if_exists(&tree.join(&layout.catalog))?;
                self.cancel.check()?;
                run_native_tool(tool, tree, partial, &vol, &layout)?;
            }
            CompositionBackend::Software => {
                write_image(tree, partial, &vol, Some(&layout), self.cancel)?;
            }
        }

        self.cancel.check()?;
        let (bios, uefi) = verify_image(partial, tree, &layout)?;
        atomic_move(partial, output)?;
        let (sha256, _) = generate_iso_checksum(output)?;

        log::info!(
            "Composed {} (BIOS {} at {}, UEFI {} at {})",
            output.display(),
            bios.path.display(),
            bios.load_rba,
            uefi.path.display(),
            uefi.load_rba
        );
        Ok(OutputImage {
            path: output.to_path_buf(),
            volume_label: label.to_string(),
            bios_boot_entry: bios,
            uefi_boot_entry: uefi,
            sha256,
        })
    }
}

/// `<output>.partial`
pub fn partial_path(output: &Path) -> PathBuf {
    let mut name = output.file_name().unwrap_or_default().to_os_string();
    name.push(".partial");
    output.with_file_name(name)
}

/// Read `image` back: both boot entries must resolve to the tree's boot
/// files and every tree entry must be listed.
pub fn verify_image(
    image: &Path,
    tree: &Path,
    layout: &BootLayout,
) -> Result<(BootEntryInfo, BootEntryInfo)> {
    let mut reader = IsoReader::open(image)?;
    let catalog = reader
        .boot_catalog()?
        .context("image has no El Torito boot catalog")?;
    let bios = catalog.bios.context("boot catalog has no BIOS entry")?;
    let uefi = catalog.uefi.context("boot catalog has no UEFI entry")?;
    let entries = reader.entries()?;

    let bios_image = tree.join(&layout.bios_image);
    let bios_info = check_boot_entry(&mut reader, &entries, &bios, &bios_image, true)?;
    let efi_image = tree.join(&layout.efi_image);
    let uefi_info = check_boot_entry(&mut reader, &entries, &uefi, &efi_image, false)?;

    let listed: HashMap<&Path, &IsoEntry> =
        entries.iter().map(|e| (e.path.as_path(), e)).collect();
    for entry in walkdir::WalkDir::new(tree).min_depth(1).follow_links(false) {
        let entry = entry.with_context(|| format!("Failed to walk {}", tree.display()))?;
        let rel = entry.path().strip_prefix(tree)?;
        let Some(found) = listed.get(rel) else {
            bail!("{} is missing from the image", rel.display());
        };
        if entry.file_type().is_file() && rel != layout.catalog {
            let size = entry.metadata()?.len();
            if found.size() != size {
                bail!(
                    "{} has {} bytes in the image, {size} in the tree",
                    rel.display(),
                    found.size()
                );
            }
        }
    }

    Ok((bios_info, uefi_info))
}

fn check_boot_entry(
    reader: &mut IsoReader,
    entries: &[IsoEntry],
    entry: &CatalogEntry,
    tree_file: &Path,
    info_table: bool,
) -> Result<BootEntryInfo> {
    let (path, extents) = entries
        .iter()
        .find_map(|e| match &e.kind {
            EntryKind::File { extents } if extents.first().map(|x| x.0) == Some(entry.load_rba) => {
                Some((&e.path, extents))
            }
            _ => None,
        })
        .with_context(|| format!("boot entry at LBA {} points at no file", entry.load_rba))?;

    let mut in_image = Vec::new();
    reader.copy_file(extents, &mut in_image)?;
    let in_tree = fs::read(tree_file)
        .with_context(|| format!("Failed to read {}", tree_file.display()))?;
    let same = if info_table {
        same_boot_image(&in_image, &in_tree)
    } else {
        in_image == in_tree
    };
    if !same {
        bail!(
            "boot entry at LBA {} ({}) differs from {}",
            entry.load_rba,
            path.display(),
            tree_file.display()
        );
    }
    Ok(BootEntryInfo {
        path: path.clone(),
        load_rba: entry.load_rba,
        sector_count: entry.sector_count,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::artifact::extract::extract_image;
    use crate::preflight::ExtractionMode;
    use std::os::unix::fs::symlink;
    use tempfile::TempDir;

    fn software() -> BackendSelection {
        BackendSelection {
            extraction_mode: ExtractionMode::SoftwareOnly,
            composition_tool: None,
        }
    }

    fn tree(root: &Path) {
        for dir in ["isolinux", "boot/grub", ".disk", "casper", "pool/main/o/openssh", "nocloud"] {
            fs::create_dir_all(root.join(dir)).unwrap();
        }
        let bios: Vec<u8> = (0..4096u32).map(|i| (i % 251) as u8).collect();
        fs::write(root.join("isolinux/isolinux.bin"), bios).unwrap();
        fs::write(root.join("isolinux/boot.cat"), vec![0u8; 2048]).unwrap();
        fs::write(root.join("boot/grub/efi.img"), vec![0xef; 10_000]).unwrap();
        fs::write(root.join("boot/grub/grub.cfg"), "menuentry \"Install\" {}\n").unwrap();
        fs::write(root.join(".disk/info"), "Ubuntu-Server").unwrap();
        fs::write(root.join("casper/vmlinuz"), vec![7u8; 70_000]).unwrap();
        fs::write(root.join("casper/empty"), b"").unwrap();
        fs::write(
            root.join("pool/main/o/openssh/openssh-server_9.6p1-3ubuntu13_amd64.deb"),
            b"deb",
        )
        .unwrap();
        fs::write(root.join("nocloud/user-data"), "#cloud-config\nautoinstall:\n  version: 1\n")
            .unwrap();
        symlink("casper/vmlinuz", root.join("vmlinuz")).unwrap();
    }

    fn snapshot(root: &Path, skip: &[&str]) -> Vec<(PathBuf, String)> {
        let mut out = Vec::new();
        for entry in walkdir::WalkDir::new(root).min_depth(1).sort_by_file_name() {
            let entry = entry.unwrap();
            let rel = entry.path().strip_prefix(root).unwrap().to_path_buf();
            if skip.iter().any(|s| rel == Path::new(s)) {
                continue;
            }
            let kind = if entry.file_type().is_symlink() {
                format!("link:{}", fs::read_link(entry.path()).unwrap().display())
            } else if entry.file_type().is_dir() {
                "dir".to_string()
            } else {
                format!("file:{:?}", fs::read(entry.path()).unwrap())
            };
            out.push((rel, kind));
        }
        out
    }

    #[test]
    fn test_software_round_trip() {
        let temp = TempDir::new().unwrap();
        let src = temp.path().join("tree");
        tree(&src);
        let before = snapshot(&src, &["isolinux/isolinux.bin", "isolinux/boot.cat"]);

        let cancel = CancelToken::new();
        let output = temp.path().join("out/web-ubuntu-24.04.1-20260307.iso");
        let image = Composer::new(&software(), &cancel)
            .compose(&src, "web-ubuntu-24.04.1-20260307", &output)
            .unwrap();

        assert_eq!(image.path, output);
        assert_eq!(image.bios_boot_entry.path, Path::new("isolinux/isolinux.bin"));
        assert_eq!(image.bios_boot_entry.sector_count, 4);
        assert_eq!(image.uefi_boot_entry.path, Path::new("boot/grub/efi.img"));
        assert!(!partial_path(&output).exists());
        assert_eq!(
            fs::read_to_string(temp.path().join("out/web-ubuntu-24.04.1-20260307.iso.sha256"))
                .unwrap(),
            format!("{}  web-ubuntu-24.04.1-20260307.iso\n", image.sha256)
        );

        let back = temp.path().join("back");
        extract_image(&software(), &output, &back, &cancel).unwrap();
        assert_eq!(
            snapshot(&back, &["isolinux/isolinux.bin", "isolinux/boot.cat"]),
            before
        );
        assert!(same_boot_image(
            &fs::read(back.join("isolinux/isolinux.bin")).unwrap(),
            &fs::read(src.join("isolinux/isolinux.bin")).unwrap()
        ));
        assert_eq!(
            IsoReader::open(&output).unwrap().volume_id(),
            "web-ubuntu-24.04.1-20260307"
        );
    }

    #[test]
    fn test_missing_boot_files_is_composition_failure() {
        let temp = TempDir::new().unwrap();
        let src = temp.path().join("tree");
        fs::create_dir_all(src.join("isolinux")).unwrap();
        fs::write(src.join("isolinux/isolinux.bin"), vec![1u8; 2048]).unwrap();

        let output = temp.path().join("out.iso");
        let cancel = CancelToken::new();
        let err = Composer::new(&software(), &cancel)
            .compose(&src, "label", &output)
            .unwrap_err();
        assert_eq!(err.class(), "CompositionFailure");
        assert!(err.to_string().contains("UEFI"));
        assert!(!output.exists());
        assert!(!partial_path(&output).exists());
    }

    #[test]
    fn test_cancelled_composition_leaves_nothing() {
        let temp = TempDir::new().unwrap();
        let src = temp.path().join("tree");
        tree(&src);
        let output = temp.path().join("out.iso");
        let cancel = CancelToken::new();
        cancel.cancel();

        let err = Composer::new(&software(), &cancel)
            .compose(&src, "label", &output)
            .unwrap_err();
        assert!(matches!(err, BuildError::Cancelled));
        assert!(!output.exists());
        assert!(!partial_path(&output).exists());
    }

    #[test]
    fn test_verify_rejects_tree_drift() {
        let temp = TempDir::new().unwrap();
        let src = temp.path().join("tree");
        tree(&src);
        let output = temp.path().join("out.iso");
        let cancel = CancelToken::new();
        Composer::new(&software(), &cancel)
            .compose(&src, "label", &output)
            .unwrap();

        let layout = BootLayout::detect(&src).unwrap();
        fs::write(src.join("added-later"), "x").unwrap();
        let err = verify_image(&output, &src, &layout).unwrap_err();
        assert!(err.to_string().contains("added-later"));

        fs::remove_file(src.join("added-later")).unwrap();
        fs::write(src.join("boot/grub/efi.img"), vec![0u8; 10_000]).unwrap();
        let err = verify_image(&output, &src, &layout).unwrap_err();
        assert!(err.to_string().contains("differs"));
    }

    #[test]
    fn test_backend_from_selection() {
        let mut selection = software();
        assert_eq!(CompositionBackend::from_selection(&selection), CompositionBackend::Software);
        selection.composition_tool = Some(ToolId::Xorriso);
        assert_eq!(
            CompositionBackend::from_selection(&selection),
            CompositionBackend::Native(ToolId::Xorriso)
        );
    }
}
