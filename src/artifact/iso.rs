//! Output image description: volume label, boot layout, boot entries.

use anyhow::{bail, Result};
use std::path::{Path, PathBuf};
use time::Date;

/// Longest volume identifier the primary descriptor can hold.
pub const MAX_VOLUME_ID: usize = 32;

/// BIOS boot images and their catalog paths, in preference order.
const BIOS_CANDIDATES: &[(&str, &str)] = &[
    ("isolinux/isolinux.bin", "isolinux/boot.cat"),
    ("boot/grub/i386-pc/eltorito.img", "boot.catalog"),
];

/// UEFI boot images, in preference order.
pub const UEFI_CANDIDATES: &[&str] = &["boot/grub/efi.img", "EFI/boot/efiboot.img"];

/// Boot files of a tree, relative to its root.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BootLayout {
    pub bios_image: PathBuf,
    pub catalog: PathBuf,
    pub efi_image: PathBuf,
}

impl BootLayout {
    /// Find the BIOS and UEFI boot images in `tree`. Both are required.
    pub fn detect(tree: &Path) -> Result<Self> {
        let bios = BIOS_CANDIDATES
            .iter()
            .find(|(image, _)| tree.join(image).is_file());
        let efi = UEFI_CANDIDATES
            .iter()
            .find(|image| tree.join(image).is_file());

        match (bios, efi) {
            (Some((bios, catalog)), Some(efi)) => Ok(Self {
                bios_image: PathBuf::from(bios),
                catalog: PathBuf::from(catalog),
                efi_image: PathBuf::from(efi),
            }),
            (None, _) => bail!(
                "no BIOS boot image in the tree (looked for {})",
                BIOS_CANDIDATES
                    .iter()
                    .map(|(image, _)| *image)
                    .collect::<Vec<_>>()
                    .join(", ")
            ),
            (_, None) => bail!(
                "no UEFI boot image in the tree (looked for {})",
                UEFI_CANDIDATES.join(", ")
            ),
        }
    }
}

/// One El Torito entry of a produced image.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BootEntryInfo {
    pub path: PathBuf,
    pub load_rba: u32,
    pub sector_count: u16,
}

/// A composed, verified image.
#[derive(Debug, Clone)]
pub struct OutputImage {
    pub path: PathBuf,
    pub volume_label: String,
    pub bios_boot_entry: BootEntryInfo,
    pub uefi_boot_entry: BootEntryInfo,
    pub sha256: String,
}

/// `<profile>-ubuntu-<version>-<YYYYMMDD>`
pub fn volume_label(profile: &str, version: &str, date: Date) -> String {
    format!(
        "{profile}-ubuntu-{version}-{:04}{:02}{:02}",
        date.year(),
        u8::from(date.month()),
        date.day()
    )
}

/// The label as stored in the volume descriptor: ASCII, at most 32 bytes.
pub fn volume_id(label: &str) -> String {
    label
        .chars()
        .map(|c| if c.is_ascii_graphic() { c } else { '_' })
        .take(MAX_VOLUME_ID)
        .collect()
}
