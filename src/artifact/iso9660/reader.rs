//! Mount-free ISO9660 reader.

use anyhow::{bail, Context, Result};
use std::collections::HashSet;
use std::fs::{self, File};
use std::io::{Read, Seek, SeekFrom, Write};
use std::os::unix::fs::{symlink, PermissionsExt};
use std::path::{Component, Path, PathBuf};

use super::eltorito::{self, BootCatalog};
use super::rrip::Decoder;
use super::{
    clean_identifier, get_str, DirRecord, FIRST_DESCRIPTOR_LBA, FLAG_ASSOCIATED,
    FLAG_MULTI_EXTENT, PVD_ROOT_RECORD, SECTOR, SECTOR_USIZE, STANDARD_ID, VD_PRIMARY,
    VD_TERMINATOR,
};
use crate::cancel::CancelToken;

const MAX_DEPTH: usize = 64;
const MAX_DESCRIPTORS: u32 = 64;

/// What a tree entry is.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum EntryKind {
    Directory,
    /// `(lba, length)` extents in order.
    File { extents: Vec<(u32, u32)> },
    Symlink { target: String },
}

/// One entry of the image's tree, path relative to the root.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IsoEntry {
    pub path: PathBuf,
    pub kind: EntryKind,
    pub mode: Option<u32>,
}

impl IsoEntry {
    pub fn size(&self) -> u64 {
        match &self.kind {
            EntryKind::File { extents } => extents.iter().map(|(_, len)| u64::from(*len)).sum(),
            _ => 0,
        }
    }
}

pub struct IsoReader {
    file: File,
    volume_id: String,
    root: DirRecord,
    catalog_lba: Option<u32>,
    /// Bytes to skip at the start of each system use area; `None` without Rock Ridge.
    susp_skip: Option<usize>,
}

impl IsoReader {
    pub fn open(path: &Path) -> Result<Self> {
        let file = File::open(path).with_context(|| format!("Failed to open {}", path.display()))?;
        let mut reader = Self {
            file,
            volume_id: String::new(),
            root: DirRecord {
                extent: 0,
                size: 0,
                flags: 0,
                identifier: Vec::new(),
                system_use: Vec::new(),
            },
            catalog_lba: None,
            susp_skip: None,
        };
        reader.read_descriptors()?;
        reader.detect_rock_ridge()?;
        Ok(reader)
    }

    pub fn volume_id(&self) -> &str {
        &self.volume_id
    }

    pub fn has_rock_ridge(&self) -> bool {
        self.susp_skip.is_some()
    }

    fn read_descriptors(&mut self) -> Result<()> {
        let mut found_primary = false;
        for i in 0..MAX_DESCRIPTORS {
            let vd = self.read_at(u64::from(FIRST_DESCRIPTOR_LBA + i) * SECTOR, SECTOR_USIZE)?;
            if &vd[1..6] != STANDARD_ID {
                bail!("not an ISO9660 image (no CD001 at sector {})", FIRST_DESCRIPTOR_LBA + i);
            }
            match vd[0] {
                VD_PRIMARY if !found_primary => {
                    self.volume_id = get_str(&vd[40..72]);
                    self.root = DirRecord::parse(&vd[PVD_ROOT_RECORD..PVD_ROOT_RECORD + 34])
                        .context("bad root directory record")?;
                    found_primary = true;
                }
                VD_TERMINATOR => break,
                _ => {
                    if let Some(lba) = eltorito::parse_boot_record(&vd) {
                        self.catalog_lba = Some(lba);
                    }
                }
            }
        }
        if !found_primary {
            bail!("no primary volume descriptor");
        }
        Ok(())
    }

    /// Rock Ridge is announced by `SP` in the root's `.` record.
    fn detect_rock_ridge(&mut self) -> Result<()> {
        let sector = self.read_at(u64::from(self.root.extent) * SECTOR, SECTOR_USIZE)?;
        let len = sector[0] as usize;
        if len == 0 {
            bail!("empty root directory");
        }
        let dot = DirRecord::parse(&sector[..len])?;
        let rr = super::rrip::decode(&dot.system_use);
        self.susp_skip = rr.sp_skip.map(usize::from);
        log::debug!(
            "volume '{}': rock ridge {}",
            self.volume_id,
            if self.has_rock_ridge() { "present" } else { "absent" }
        );
        Ok(())
    }

    fn read_at(&mut self, offset: u64, len: usize) -> Result<Vec<u8>> {
        let mut buf = vec![0u8; len];
        self.file.seek(SeekFrom::Start(offset))?;
        self.file
            .read_exact(&mut buf)
            .with_context(|| format!("short read at byte {offset}"))?;
        Ok(buf)
    }

    /// Raw bytes at `lba`.
    pub fn read_bytes(&mut self, lba: u32, len: usize) -> Result<Vec<u8>> {
        self.read_at(u64::from(lba) * SECTOR, len)
    }

    pub fn boot_catalog(&mut self) -> Result<Option<BootCatalog>> {
        match self.catalog_lba {
            Some(lba) => {
                let sector = self.read_bytes(lba, SECTOR_USIZE)?;
                eltorito::parse_catalog(&sector).map(Some)
            }
            None => Ok(None),
        }
    }

    /// Records of one directory extent, without `.` and `..`.
    fn read_dir(&mut self, extent: u32, size: u32) -> Result<Vec<DirRecord>> {
        let data = self.read_at(u64::from(extent) * SECTOR, size as usize)?;
        let mut records = Vec::new();
        for sector in data.chunks(SECTOR_USIZE) {
            let mut at = 0;
            while at < sector.len() {
                let len = sector[at] as usize;
                if len == 0 {
                    break;
                }
                if at + len > sector.len() {
                    bail!("directory record crosses a sector boundary at extent {extent}");
                }
                let rec = DirRecord::parse(&sector[at..at + len])?;
                if !rec.is_self_or_parent() {
                    records.push(rec);
                }
                at += len;
            }
        }
        Ok(records)
    }

    /// Rock Ridge data for a record, following `CE` continuation areas.
    fn rock_ridge(&mut self, rec: &DirRecord) -> Result<super::rrip::RockRidge> {
        let Some(skip) = self.susp_skip else {
            return Ok(Default::default());
        };
        let mut decoder = Decoder::default();
        let mut next = decoder.feed(rec.system_use.get(skip..).unwrap_or_default());
        let mut hops = 0;
        while let Some(ce) = next {
            hops += 1;
            if hops > 16 {
                bail!("too many Rock Ridge continuation areas");
            }
            let area = self.read_at(
                u64::from(ce.block) * SECTOR + u64::from(ce.offset),
                ce.length as usize,
            )?;
            next = decoder.feed(&area);
        }
        Ok(decoder.finish())
    }

    /// Size of the directory whose extent starts at `lba`, from its `.` record.
    fn dir_size_at(&mut self, lba: u32) -> Result<u32> {
        let sector = self.read_bytes(lba, SECTOR_USIZE)?;
        let len = sector[0] as usize;
        if len == 0 {
            bail!("relocated directory at {lba} is empty");
        }
        Ok(DirRecord::parse(&sector[..len])?.size)
    }

    /// Walk the whole tree, parents before children.
    pub fn entries(&mut self) -> Result<Vec<IsoEntry>> {
        let mut out = Vec::new();
        let mut seen = HashSet::from([self.root.extent]);
        let root = (self.root.extent, self.root.size);
        self.walk(root, Path::new(""), 0, &mut seen, &mut out)?;
        Ok(out)
    }

    fn walk(
        &mut self,
        (extent, size): (u32, u32),
        parent: &Path,
        depth: usize,
        seen: &mut HashSet<u32>,
        out: &mut Vec<IsoEntry>,
    ) -> Result<()> {
        if depth > MAX_DEPTH {
            bail!("directory nesting deeper than {MAX_DEPTH} at {}", parent.display());
        }
        let records = self.read_dir(extent, size)?;
        let mut i = 0;
        while i < records.len() {
            let rec = &records[i];
            i += 1;
            if rec.flags & FLAG_ASSOCIATED != 0 {
                continue;
            }

            let rr = self.rock_ridge(rec)?;
            if rr.relocated {
                // Reached through its CL placeholder instead.
                continue;
            }
            let name = match rr.name.clone() {
                Some(name) => name,
                None => clean_identifier(&rec.identifier, rec.is_dir()),
            };
            let path = parent.join(safe_name(&name, parent)?);

            if let Some(target) = rr.symlink {
                out.push(IsoEntry {
                    path,
                    kind: EntryKind::Symlink { target },
                    mode: rr.mode,
                });
                continue;
            }

            let child_dir = match rr.child_link {
                Some(lba) => Some((lba, self.dir_size_at(lba)?)),
                None if rec.is_dir() => Some((rec.extent, rec.size)),
                None => None,
            };
            if let Some((child, child_size)) = child_dir {
                if !seen.insert(child) {
                    bail!("directory loop at {}", path.display());
                }
                out.push(IsoEntry {
                    path: path.clone(),
                    kind: EntryKind::Directory,
                    mode: rr.mode,
                });
                self.walk((child, child_size), &path, depth + 1, seen, out)?;
                continue;
            }

            let mut extents = vec![(rec.extent, rec.size)];
            let mut flags = rec.flags;
            while flags & FLAG_MULTI_EXTENT != 0 {
                let Some(more) = records.get(i) else {
                    bail!("multi-extent file {} is truncated", path.display());
                };
                extents.push((more.extent, more.size));
                flags = more.flags;
                i += 1;
            }
            out.push(IsoEntry {
                path,
                kind: EntryKind::File { extents },
                mode: rr.mode,
            });
        }
        Ok(())
    }

    /// Copy one file's extents into `out`.
    pub fn copy_file(&mut self, extents: &[(u32, u32)], out: &mut dyn Write) -> Result<u64> {
        let mut total = 0;
        for &(lba, len) in extents {
            self.file.seek(SeekFrom::Start(u64::from(lba) * SECTOR))?;
            let copied = std::io::copy(&mut (&mut self.file).take(u64::from(len)), out)?;
            if copied != u64::from(len) {
                bail!("extent at {lba} is truncated ({copied} of {len} bytes)");
            }
            total += copied;
        }
        Ok(total)
    }

    /// Recreate the whole tree under `dest`. Returns the number of entries.
    pub fn extract_all(&mut self, dest: &Path, cancel: &CancelToken) -> Result<usize> {
        let entries = self.entries()?;
        fs::create_dir_all(dest)?;
        for entry in &entries {
            cancel.check()?;
            let target = dest.join(&entry.path);
            match &entry.kind {
                EntryKind::Directory => {
                    fs::create_dir_all(&target)
                        .with_context(|| format!("Failed to create {}", target.display()))?;
                }
                EntryKind::Symlink { target: link } => {
                    symlink(link, &target)
                        .with_context(|| format!("Failed to create symlink {}", target.display()))?;
                }
                EntryKind::File { extents } => {
                    let mut file = File::create(&target)
                        .with_context(|| format!("Failed to create {}", target.display()))?;
                    self.copy_file(extents, &mut file)
                        .with_context(|| format!("Failed to extract {}", entry.path.display()))?;
                }
            }
            let mode = match (&entry.kind, entry.mode) {
                (EntryKind::Symlink { .. }, _) | (_, None) => continue,
                // Children still have to be created inside it.
                (EntryKind::Directory, Some(mode)) => mode | 0o700,
                (_, Some(mode)) => mode,
            };
            fs::set_permissions(&target, fs::Permissions::from_mode(mode & 0o7777))?;
        }
        Ok(entries.len())
    }
}

/// Reject names that would escape the destination.
fn safe_name<'a>(name: &'a str, parent: &Path) -> Result<&'a str> {
    let mut components = Path::new(name).components();
    match (components.next(), components.next()) {
        (Some(Component::Normal(_)), None) if !name.contains('/') => Ok(name),
        _ => bail!("unsafe entry name {name:?} in {}", parent.display()),
    }
}
