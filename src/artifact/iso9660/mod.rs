//! Minimal ISO9660 + Rock Ridge + El Torito support.
//!
//! [`reader`] unpacks an existing image without mounting it; [`writer`]
//! lays out a new hybrid-bootable image from a directory tree. Both work on
//! 2048-byte logical sectors and stream file contents.

pub mod eltorito;
pub mod reader;
pub mod rrip;
pub mod writer;

use anyhow::{bail, Result};
use time::OffsetDateTime;

pub const SECTOR: u64 = 2048;
pub const SECTOR_USIZE: usize = SECTOR as usize;

/// First volume descriptor sector; 0..16 is the system area.
pub const FIRST_DESCRIPTOR_LBA: u32 = 16;
pub const STANDARD_ID: &[u8; 5] = b"CD001";

pub const VD_BOOT_RECORD: u8 = 0;
pub const VD_PRIMARY: u8 = 1;
pub const VD_TERMINATOR: u8 = 255;

/// Directory record flags.
pub const FLAG_HIDDEN: u8 = 0x01;
pub const FLAG_DIRECTORY: u8 = 0x02;
pub const FLAG_ASSOCIATED: u8 = 0x04;
pub const FLAG_MULTI_EXTENT: u8 = 0x80;

/// Offset of the root directory record inside the primary descriptor.
pub const PVD_ROOT_RECORD: usize = 156;

/// Maximum size of a single directory record.
pub const MAX_RECORD_LEN: usize = 255;

pub(crate) fn sectors_for(len: u64) -> u64 {
    len.div_ceil(SECTOR)
}

pub(crate) fn put_u16_both(dst: &mut [u8], value: u16) {
    dst[0..2].copy_from_slice(&value.to_le_bytes());
    dst[2..4].copy_from_slice(&value.to_be_bytes());
}

pub(crate) fn put_u32_both(dst: &mut [u8], value: u32) {
    dst[0..4].copy_from_slice(&value.to_le_bytes());
    dst[4..8].copy_from_slice(&value.to_be_bytes());
}

pub(crate) fn le_u16(src: &[u8], at: usize) -> u16 {
    u16::from_le_bytes([src[at], src[at + 1]])
}

pub(crate) fn le_u32(src: &[u8], at: usize) -> u32 {
    u32::from_le_bytes([src[at], src[at + 1], src[at + 2], src[at + 3]])
}

/// Space-padded ASCII field.
pub(crate) fn put_str(dst: &mut [u8], value: &str) {
    dst.fill(b' ');
    let bytes = value.as_bytes();
    let n = bytes.len().min(dst.len());
    dst[..n].copy_from_slice(&bytes[..n]);
}

/// Trimmed contents of a space-padded ASCII field.
pub(crate) fn get_str(src: &[u8]) -> String {
    String::from_utf8_lossy(src)
        .trim_end_matches([' ', '\0'])
        .to_string()
}

/// 7-byte directory record timestamp (UTC).
pub(crate) fn record_datetime(t: OffsetDateTime) -> [u8; 7] {
    [
        (t.year() - 1900).clamp(0, 255) as u8,
        u8::from(t.month()),
        t.day(),
        t.hour(),
        t.minute(),
        t.second(),
        0,
    ]
}

/// 17-byte volume descriptor timestamp (UTC). `None` renders "not specified".
pub(crate) fn descriptor_datetime(t: Option<OffsetDateTime>) -> [u8; 17] {
    let mut out = [b'0'; 17];
    out[16] = 0;
    if let Some(t) = t {
        let text = format!(
            "{:04}{:02}{:02}{:02}{:02}{:02}{:02}",
            t.year().clamp(0, 9999),
            u8::from(t.month()),
            t.day(),
            t.hour(),
            t.minute(),
            t.second(),
            t.millisecond() / 10
        );
        out[..16].copy_from_slice(&text.as_bytes()[..16]);
    }
    out
}

/// A parsed directory record.
#[derive(Debug, Clone)]
pub(crate) struct DirRecord {
    pub extent: u32,
    pub size: u32,
    pub flags: u8,
    pub identifier: Vec<u8>,
    /// System use area (Rock Ridge lives here).
    pub system_use: Vec<u8>,
}

impl DirRecord {
    pub fn parse(raw: &[u8]) -> Result<Self> {
        if raw.len() < 34 {
            bail!("directory record too short ({} bytes)", raw.len());
        }
        let len = raw[0] as usize;
        let id_len = raw[32] as usize;
        if len > raw.len() || 33 + id_len > len {
            bail!("malformed directory record (len {len}, identifier {id_len})");
        }
        let su_start = 33 + id_len + usize::from(id_len % 2 == 0);
        Ok(Self {
            extent: le_u32(raw, 2),
            size: le_u32(raw, 10),
            flags: raw[25],
            identifier: raw[33..33 + id_len].to_vec(),
            system_use: raw.get(su_start..len).unwrap_or_default().to_vec(),
        })
    }

    pub fn is_dir(&self) -> bool {
        self.flags & FLAG_DIRECTORY != 0
    }

    /// The `.` and `..` entries.
    pub fn is_self_or_parent(&self) -> bool {
        self.identifier == [0] || self.identifier == [1]
    }
}

/// Encode one directory record.
pub(crate) fn encode_record(
    extent: u32,
    size: u32,
    flags: u8,
    recorded: &[u8; 7],
    identifier: &[u8],
    system_use: &[u8],
) -> Result<Vec<u8>> {
    let pad = usize::from(identifier.len() % 2 == 0);
    let mut len = 33 + identifier.len() + pad + system_use.len();
    len += len % 2;
    if len > MAX_RECORD_LEN {
        bail!(
            "directory record for '{}' needs {len} bytes (max {MAX_RECORD_LEN}); name or link target too long",
            String::from_utf8_lossy(identifier)
        );
    }
    let mut rec = vec![0u8; len];
    rec[0] = len as u8;
    put_u32_both(&mut rec[2..10], extent);
    put_u32_both(&mut rec[10..18], size);
    rec[18..25].copy_from_slice(recorded);
    rec[25] = flags;
    put_u16_both(&mut rec[28..32], 1);
    rec[32] = identifier.len() as u8;
    rec[33..33 + identifier.len()].copy_from_slice(identifier);
    let su = 33 + identifier.len() + pad;
    rec[su..su + system_use.len()].copy_from_slice(system_use);
    Ok(rec)
}

/// Identifier cleanup for images without Rock Ridge: `VMLINUZ.;1` -> `vmlinuz`.
pub(crate) fn clean_identifier(raw: &[u8], is_dir: bool) -> String {
    let name = String::from_utf8_lossy(raw);
    let name = if is_dir {
        name.as_ref()
    } else {
        let base = name.split(';').next().unwrap_or_default();
        base.strip_suffix('.').unwrap_or(base)
    };
    name.to_ascii_lowercase()
}
