//! El Torito boot record, boot catalog and boot info table.

use anyhow::{bail, Result};

use super::{le_u16, le_u32, SECTOR_USIZE, STANDARD_ID, VD_BOOT_RECORD};

pub const BOOT_SYSTEM_ID: &str = "EL TORITO SPECIFICATION";

pub const PLATFORM_X86: u8 = 0x00;
pub const PLATFORM_EFI: u8 = 0xEF;

const HEADER_VALIDATION: u8 = 0x01;
const HEADER_MORE: u8 = 0x90;
const HEADER_FINAL: u8 = 0x91;
const BOOTABLE: u8 = 0x88;
const KEY: [u8; 2] = [0x55, 0xAA];

/// Sectors of the BIOS image loaded by firmware (512-byte units).
pub const BIOS_LOAD_SECTORS: u16 = 4;

/// Boot info table: 56 bytes at offset 8 of a no-emulation image.
pub const INFO_TABLE_START: usize = 8;
pub const INFO_TABLE_END: usize = 64;

/// One bootable catalog entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CatalogEntry {
    pub platform: u8,
    /// LBA (2048-byte sectors) of the boot image.
    pub load_rba: u32,
    /// Virtual 512-byte sectors to load.
    pub sector_count: u16,
}

/// Bootable entries found in a catalog.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct BootCatalog {
    pub bios: Option<CatalogEntry>,
    pub uefi: Option<CatalogEntry>,
}

/// Boot record volume descriptor pointing at the catalog.
pub fn boot_record(catalog_lba: u32) -> Vec<u8> {
    let mut vd = vec![0u8; SECTOR_USIZE];
    vd[0] = VD_BOOT_RECORD;
    vd[1..6].copy_from_slice(STANDARD_ID);
    vd[6] = 1;
    vd[7..7 + BOOT_SYSTEM_ID.len()].copy_from_slice(BOOT_SYSTEM_ID.as_bytes());
    vd[71..75].copy_from_slice(&catalog_lba.to_le_bytes());
    vd
}

/// Catalog LBA if `vd` is an El Torito boot record.
pub fn parse_boot_record(vd: &[u8]) -> Option<u32> {
    if vd.len() < 75 || vd[0] != VD_BOOT_RECORD || &vd[1..6] != STANDARD_ID {
        return None;
    }
    if !vd[7..39].starts_with(BOOT_SYSTEM_ID.as_bytes()) {
        return None;
    }
    Some(le_u32(vd, 71))
}

fn checksum_16(data: &[u8]) -> u16 {
    data.chunks_exact(2)
        .fold(0u16, |sum, w| sum.wrapping_add(u16::from_le_bytes([w[0], w[1]])))
}

fn write_entry(dst: &mut [u8], entry: &CatalogEntry) {
    dst[0] = BOOTABLE;
    dst[1] = 0; // no emulation
    dst[6..8].copy_from_slice(&entry.sector_count.to_le_bytes());
    dst[8..12].copy_from_slice(&entry.load_rba.to_le_bytes());
}

/// A one-sector catalog: default x86 entry plus a final EFI section.
pub fn build_catalog(bios: &CatalogEntry, uefi: &CatalogEntry) -> Vec<u8> {
    let mut cat = vec![0u8; SECTOR_USIZE];

    cat[0] = HEADER_VALIDATION;
    cat[1] = PLATFORM_X86;
    cat[30..32].copy_from_slice(&KEY);
    let sum = checksum_16(&cat[..32]);
    cat[28..30].copy_from_slice(&0u16.wrapping_sub(sum).to_le_bytes());

    write_entry(&mut cat[32..64], bios);

    cat[64] = HEADER_FINAL;
    cat[65] = PLATFORM_EFI;
    cat[66..68].copy_from_slice(&1u16.to_le_bytes());
    write_entry(&mut cat[96..128], uefi);

    cat
}

/// Parse a catalog sector.
pub fn parse_catalog(cat: &[u8]) -> Result<BootCatalog> {
    if cat.len() < 64 {
        bail!("boot catalog truncated");
    }
    if cat[0] != HEADER_VALIDATION || cat[30..32] != KEY {
        bail!("boot catalog has no validation entry");
    }
    if checksum_16(&cat[..32]) != 0 {
        bail!("boot catalog validation checksum is wrong");
    }

    let mut out = BootCatalog::default();
    let default = &cat[32..64];
    if default[0] == BOOTABLE {
        out.assign(CatalogEntry {
            platform: cat[1],
            load_rba: le_u32(default, 8),
            sector_count: le_u16(default, 6),
        });
    }

    let mut at = 64;
    while at + 32 <= cat.len() {
        let header = cat[at];
        if header != HEADER_MORE && header != HEADER_FINAL {
            break;
        }
        let platform = cat[at + 1];
        let count = le_u16(cat, at + 2) as usize;
        at += 32;
        for _ in 0..count {
            if at + 32 > cat.len() {
                break;
            }
            let e = &cat[at..at + 32];
            // Skip section entry extensions.
            if e[0] == 0x44 {
                at += 32;
                continue;
            }
            if e[0] == BOOTABLE {
                out.assign(CatalogEntry {
                    platform,
                    load_rba: le_u32(e, 8),
                    sector_count: le_u16(e, 6),
                });
            }
            at += 32;
        }
        if header == HEADER_FINAL {
            break;
        }
    }
    Ok(out)
}

impl BootCatalog {
    fn assign(&mut self, entry: CatalogEntry) {
        let slot = if entry.platform == PLATFORM_EFI {
            &mut self.uefi
        } else {
            &mut self.bios
        };
        if slot.is_none() {
            *slot = Some(entry);
        }
    }
}

/// Fill the boot info table of a no-emulation image in place.
pub fn patch_boot_info_table(image: &mut [u8], pvd_lba: u32, file_lba: u32) -> Result<()> {
    if image.len() < INFO_TABLE_END {
        bail!("boot image is too small for a boot info table ({} bytes)", image.len());
    }
    let checksum = image[INFO_TABLE_END..]
        .chunks(4)
        .map(|w| {
            let mut word = [0u8; 4];
            word[..w.len()].copy_from_slice(w);
            u32::from_le_bytes(word)
        })
        .fold(0u32, u32::wrapping_add);
    let len = image.len() as u32;
    let table = &mut image[INFO_TABLE_START..INFO_TABLE_END];
    table.fill(0);
    table[0..4].copy_from_slice(&pvd_lba.to_le_bytes());
    table[4..8].copy_from_slice(&file_lba.to_le_bytes());
    table[8..12].copy_from_slice(&len.to_le_bytes());
    table[12..16].copy_from_slice(&checksum.to_le_bytes());
    Ok(())
}

/// Equal outside the boot info table.
pub fn same_boot_image(a: &[u8], b: &[u8]) -> bool {
    if a.len() != b.len() {
        return false;
    }
    if a.len() < INFO_TABLE_END {
        return a == b;
    }
    a[..INFO_TABLE_START] == b[..INFO_TABLE_START] && a[INFO_TABLE_END..] == b[INFO_TABLE_END..]
}
