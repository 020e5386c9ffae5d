//! ISO9660 image writer with Rock Ridge names and an El Torito catalog.
//!
//! Layout, in write order: system area, primary volume descriptor, boot
//! record, terminator, L and M path tables, directory extents (breadth
//! first), boot catalog, file extents. Every position is computed before the
//! first byte is written, so the output is produced in one sequential pass.

use anyhow::{bail, Context, Result};
use std::collections::{HashMap, HashSet, VecDeque};
use std::fs::{self, File};
use std::io::{BufWriter, Read, Write};
use std::os::unix::fs::MetadataExt;
use std::path::{Path, PathBuf};
use time::OffsetDateTime;

use super::eltorito::{self, CatalogEntry, BIOS_LOAD_SECTORS, PLATFORM_EFI, PLATFORM_X86};
use super::rrip;
use super::{
    descriptor_datetime, encode_record, put_str, put_u16_both, put_u32_both, record_datetime,
    sectors_for, FIRST_DESCRIPTOR_LBA, FLAG_DIRECTORY, PVD_ROOT_RECORD, SECTOR, SECTOR_USIZE,
    STANDARD_ID, VD_PRIMARY, VD_TERMINATOR,
};
use crate::artifact::iso::BootLayout;
use crate::cancel::CancelToken;

const SYSTEM_ID: &str = "LINUX";
const APPLICATION_ID: &str = "AUTOISO-BUILDER";
const MAX_DIR_ID: usize = 31;
const MAX_FILE_BASE: usize = 24;
const MAX_FILE_EXT: usize = 6;
/// BIOS boot images are patched in memory.
const MAX_BIOS_IMAGE: u64 = 16 * 1024 * 1024;

const S_IFDIR: u32 = 0o040000;

#[derive(Debug)]
enum Kind {
    Dir { children: Vec<usize> },
    File { source: PathBuf, size: u64 },
    Symlink { target: String },
    Catalog,
}

#[derive(Debug)]
struct Node {
    name: String,
    identifier: Vec<u8>,
    parent: usize,
    mode: u32,
    kind: Kind,
    extent: u32,
    size: u32,
}

impl Node {
    fn is_dir(&self) -> bool {
        matches!(self.kind, Kind::Dir { .. })
    }
}

/// Build a bootable image of `root` at `out`.
pub fn write_image(
    root: &Path,
    out: &Path,
    volume_id: &str,
    boot: Option<&BootLayout>,
    cancel: &CancelToken,
) -> Result<()> {
    let mut plan = Plan::scan(root, boot)?;
    plan.assign_identifiers();
    plan.layout(boot.is_some())?;
    plan.write(out, volume_id, boot, cancel)
}

struct Plan {
    nodes: Vec<Node>,
    /// Directory node indices, breadth first. Path table order.
    dirs: Vec<usize>,
    bios: Option<usize>,
    efi: Option<usize>,
    catalog: Option<usize>,
    stamp: [u8; 7],
    now: OffsetDateTime,
    boot_record_lba: Option<u32>,
    terminator_lba: u32,
    path_table_size: u32,
    l_table_lba: u32,
    m_table_lba: u32,
    total_sectors: u32,
}

impl Plan {
    fn scan(root: &Path, boot: Option<&BootLayout>) -> Result<Self> {
        let now = OffsetDateTime::now_utc();
        let root_meta = fs::metadata(root)
            .with_context(|| format!("Failed to read {}", root.display()))?;
        let mut nodes = vec![Node {
            name: String::new(),
            identifier: vec![0],
            parent: 0,
            mode: root_meta.mode(),
            kind: Kind::Dir {
                children: Vec::new(),
            },
            extent: 0,
            size: 0,
        }];
        let mut index: HashMap<PathBuf, usize> = HashMap::from([(PathBuf::new(), 0)]);

        for entry in walkdir::WalkDir::new(root)
            .min_depth(1)
            .follow_links(false)
            .sort_by_file_name()
        {
            let entry = entry.with_context(|| format!("Failed to scan {}", root.display()))?;
            let rel = entry.path().strip_prefix(root)?.to_path_buf();
            let name = entry
                .file_name()
                .to_str()
                .with_context(|| format!("non UTF-8 name: {}", rel.display()))?
                .to_string();
            let parent = rel
                .parent()
                .and_then(|p| index.get(p).copied())
                .with_context(|| format!("parent of {} was not scanned", rel.display()))?;
            let meta = entry.metadata()?;
            let ft = entry.file_type();
            let kind = if ft.is_dir() {
                Kind::Dir {
                    children: Vec::new(),
                }
            } else if ft.is_symlink() {
                let target = fs::read_link(entry.path())?;
                Kind::Symlink {
                    target: target
                        .to_str()
                        .with_context(|| format!("non UTF-8 link target in {}", rel.display()))?
                        .to_string(),
                }
            } else if ft.is_file() {
                if meta.len() > u64::from(u32::MAX) {
                    bail!(
                        "{} is {} bytes; files of 4 GiB or more are not supported",
                        rel.display(),
                        meta.len()
                    );
                }
                Kind::File {
                    source: entry.path().to_path_buf(),
                    size: meta.len(),
                }
            } else {
                log::warn!("skipping special file {}", rel.display());
                continue;
            };

            let id = nodes.len();
            nodes.push(Node {
                name,
                identifier: Vec::new(),
                parent,
                mode: meta.mode(),
                kind,
                extent: 0,
                size: 0,
            });
            if let Kind::Dir { children } = &mut nodes[parent].kind {
                children.push(id);
            }
            index.insert(rel, id);
        }

        let mut plan = Self {
            nodes,
            dirs: Vec::new(),
            bios: None,
            efi: None,
            catalog: None,
            stamp: record_datetime(now),
            now,
            boot_record_lba: None,
            terminator_lba: 0,
            path_table_size: 0,
            l_table_lba: 0,
            m_table_lba: 0,
            total_sectors: 0,
        };

        if let Some(boot) = boot {
            let lookup = |path: &Path, what: &str| -> Result<usize> {
                match index.get(path) {
                    Some(&id) if matches!(plan.nodes[id].kind, Kind::File { .. }) => Ok(id),
                    _ => bail!("{what} {} is not a regular file in the tree", path.display()),
                }
            };
            let bios = lookup(&boot.bios_image, "BIOS boot image")?;
            let efi = lookup(&boot.efi_image, "UEFI boot image")?;
            plan.bios = Some(bios);
            plan.efi = Some(efi);
            plan.catalog = Some(plan.add_catalog(&index, &boot.catalog)?);
        }
        Ok(plan)
    }

    /// Reuse an existing node for the catalog or add one.
    fn add_catalog(&mut self, index: &HashMap<PathBuf, usize>, path: &Path) -> Result<usize> {
        if let Some(&id) = index.get(path) {
            if self.nodes[id].is_dir() {
                bail!("boot catalog path {} is a directory", path.display());
            }
            self.nodes[id].kind = Kind::Catalog;
            return Ok(id);
        }
        let parent_path = path.parent().unwrap_or(Path::new(""));
        let parent = match index.get(parent_path) {
            Some(&id) if self.nodes[id].is_dir() => id,
            _ => bail!("boot catalog directory {} does not exist", parent_path.display()),
        };
        let name = path
            .file_name()
            .and_then(|n| n.to_str())
            .with_context(|| format!("bad boot catalog path {}", path.display()))?
            .to_string();
        let id = self.nodes.len();
        self.nodes.push(Node {
            name,
            identifier: Vec::new(),
            parent,
            mode: 0o100444,
            kind: Kind::Catalog,
            extent: 0,
            size: SECTOR as u32,
        });
        if let Kind::Dir { children } = &mut self.nodes[parent].kind {
            children.push(id);
        }
        Ok(id)
    }

    /// Unique ISO identifiers per directory; children sorted by identifier.
    fn assign_identifiers(&mut self) {
        for dir in 0..self.nodes.len() {
            let Kind::Dir { children } = &self.nodes[dir].kind else {
                continue;
            };
            let mut children = children.clone();
            let mut taken = HashSet::new();
            for &child in &children {
                let node = &self.nodes[child];
                let id = unique_identifier(&node.name, node.is_dir(), &mut taken);
                self.nodes[child].identifier = id.into_bytes();
            }
            children.sort_by(|a, b| self.nodes[*a].identifier.cmp(&self.nodes[*b].identifier));
            self.nodes[dir].kind = Kind::Dir { children };
        }
    }

    fn children(&self, dir: usize) -> &[usize] {
        match &self.nodes[dir].kind {
            Kind::Dir { children } => children,
            _ => &[],
        }
    }

    fn links(&self, id: usize) -> u32 {
        match &self.nodes[id].kind {
            Kind::Dir { children } => {
                2 + children.iter().filter(|c| self.nodes[**c].is_dir()).count() as u32
            }
            _ => 1,
        }
    }

    fn flags(&self, id: usize) -> u8 {
        if self.nodes[id].is_dir() {
            FLAG_DIRECTORY
        } else {
            0
        }
    }

    /// System use area of the record naming `id` inside its parent.
    fn child_system_use(&self, id: usize) -> Result<Vec<u8>> {
        let node = &self.nodes[id];
        let mut su = rrip::px(node.mode, self.links(id));
        su.extend(rrip::nm(&node.name)?);
        if let Kind::Symlink { target } = &node.kind {
            su.extend(rrip::sl(target)?);
        }
        Ok(su)
    }

    /// All records of directory `dir`, in order.
    fn dir_records(&self, dir: usize) -> Result<Vec<Vec<u8>>> {
        let node = &self.nodes[dir];
        let parent = &self.nodes[node.parent];

        let mut dot_su = Vec::new();
        if dir == 0 {
            dot_su.extend(rrip::sp());
        }
        dot_su.extend(rrip::px(node.mode | S_IFDIR, self.links(dir)));
        if dir == 0 {
            dot_su.extend(rrip::er());
        }
        let dotdot_su = rrip::px(parent.mode | S_IFDIR, self.links(node.parent));

        let mut records = vec![
            encode_record(node.extent, node.size, FLAG_DIRECTORY, &self.stamp, &[0], &dot_su)?,
            encode_record(
                parent.extent,
                parent.size,
                FLAG_DIRECTORY,
                &self.stamp,
                &[1],
                &dotdot_su,
            )?,
        ];
        for &child in self.children(dir) {
            let c = &self.nodes[child];
            records.push(encode_record(
                c.extent,
                c.size,
                self.flags(child),
                &self.stamp,
                &c.identifier,
                &self.child_system_use(child)?,
            )?);
        }
        Ok(records)
    }

    fn path_table(&self, big_endian: bool) -> Result<Vec<u8>> {
        let mut number: HashMap<usize, u16> = HashMap::new();
        let mut table = Vec::new();
        for (i, &dir) in self.dirs.iter().enumerate() {
            let Ok(n) = u16::try_from(i + 1) else {
                bail!(
                    "{} directories exceed the path table limit of {}",
                    self.dirs.len(),
                    u16::MAX
                );
            };
            number.insert(dir, n);
            let node = &self.nodes[dir];
            let parent_number = number.get(&node.parent).copied().unwrap_or(1);
            let id: &[u8] = if dir == 0 { &[0] } else { &node.identifier };
            table.push(id.len() as u8);
            table.push(0);
            if big_endian {
                table.extend_from_slice(&node.extent.to_be_bytes());
                table.extend_from_slice(&parent_number.to_be_bytes());
            } else {
                table.extend_from_slice(&node.extent.to_le_bytes());
                table.extend_from_slice(&parent_number.to_le_bytes());
            }
            table.extend_from_slice(id);
            if id.len() % 2 == 1 {
                table.push(0);
            }
        }
        Ok(table)
    }

    fn layout(&mut self, bootable: bool) -> Result<()> {
        let mut queue = VecDeque::from([0usize]);
        while let Some(dir) = queue.pop_front() {
            self.dirs.push(dir);
            for &child in self.children(dir) {
                if self.nodes[child].is_dir() {
                    queue.push_back(child);
                }
            }
        }

        // Directory sizes only depend on record lengths, not positions.
        for i in 0..self.dirs.len() {
            let dir = self.dirs[i];
            let lens: Vec<usize> = self.dir_records(dir)?.iter().map(Vec::len).collect();
            self.nodes[dir].size = (packed_sectors(&lens) * SECTOR) as u32;
        }

        let mut lba = FIRST_DESCRIPTOR_LBA + 1;
        if bootable {
            self.boot_record_lba = Some(lba);
            lba += 1;
        }
        self.terminator_lba = lba;
        lba += 1;

        self.path_table_size = self.path_table(false)?.len() as u32;
        let table_sectors = sectors_for(u64::from(self.path_table_size)).max(1) as u32;
        self.l_table_lba = lba;
        lba += table_sectors;
        self.m_table_lba = lba;
        lba += table_sectors;

        for i in 0..self.dirs.len() {
            let dir = self.dirs[i];
            self.nodes[dir].extent = lba;
            lba += (u64::from(self.nodes[dir].size) / SECTOR) as u32;
        }

        if let Some(cat) = self.catalog {
            self.nodes[cat].extent = lba;
            self.nodes[cat].size = SECTOR as u32;
            lba += 1;
        }

        for id in 0..self.nodes.len() {
            if let Kind::File { size, .. } = self.nodes[id].kind {
                if size == 0 {
                    continue;
                }
                self.nodes[id].extent = lba;
                self.nodes[id].size = size as u32;
                lba = lba
                    .checked_add(sectors_for(size) as u32)
                    .context("image exceeds the ISO9660 size limit")?;
            }
        }
        if bootable {
            self.efi_load_sectors()?;
        }
        self.total_sectors = lba;
        Ok(())
    }

    /// 512-byte sectors the UEFI catalog entry loads.
    fn efi_load_sectors(&self) -> Result<u16> {
        let efi = self.efi.context("boot catalog without a UEFI image")?;
        let size = u64::from(self.nodes[efi].size);
        let sectors = sectors_for(size) * (SECTOR / 512);
        u16::try_from(sectors).map_err(|_| {
            anyhow::anyhow!(
                "UEFI boot image {} is {size} bytes; a catalog entry loads at most {} bytes",
                self.nodes[efi].name,
                u64::from(u16::MAX) * 512
            )
        })
    }

    fn catalog_bytes(&self) -> Result<Vec<u8>> {
        let bios = self.bios.context("boot catalog without a BIOS image")?;
        let efi = self.efi.context("boot catalog without a UEFI image")?;
        Ok(eltorito::build_catalog(
            &CatalogEntry {
                platform: PLATFORM_X86,
                load_rba: self.nodes[bios].extent,
                sector_count: BIOS_LOAD_SECTORS,
            },
            &CatalogEntry {
                platform: PLATFORM_EFI,
                load_rba: self.nodes[efi].extent,
                sector_count: self.efi_load_sectors()?,
            },
        ))
    }

    fn primary_descriptor(&self, volume_id: &str) -> Result<Vec<u8>> {
        let mut vd = vec![0u8; SECTOR_USIZE];
        vd[0] = VD_PRIMARY;
        vd[1..6].copy_from_slice(STANDARD_ID);
        vd[6] = 1;
        put_str(&mut vd[8..40], SYSTEM_ID);
        put_str(&mut vd[40..72], volume_id);
        put_u32_both(&mut vd[80..88], self.total_sectors);
        put_u16_both(&mut vd[120..124], 1);
        put_u16_both(&mut vd[124..128], 1);
        put_u16_both(&mut vd[128..132], SECTOR as u16);
        put_u32_both(&mut vd[132..140], self.path_table_size);
        vd[140..144].copy_from_slice(&self.l_table_lba.to_le_bytes());
        vd[148..152].copy_from_slice(&self.m_table_lba.to_be_bytes());
        let root = &self.nodes[0];
        let root_record = encode_record(root.extent, root.size, FLAG_DIRECTORY, &self.stamp, &[0], &[])?;
        vd[PVD_ROOT_RECORD..PVD_ROOT_RECORD + root_record.len()].copy_from_slice(&root_record);
        put_str(&mut vd[190..318], volume_id);
        put_str(&mut vd[318..446], "");
        put_str(&mut vd[446..574], APPLICATION_ID);
        put_str(&mut vd[574..702], APPLICATION_ID);
        put_str(&mut vd[702..813], "");
        vd[813..830].copy_from_slice(&descriptor_datetime(Some(self.now)));
        vd[830..847].copy_from_slice(&descriptor_datetime(Some(self.now)));
        vd[847..864].copy_from_slice(&descriptor_datetime(None));
        vd[864..881].copy_from_slice(&descriptor_datetime(None));
        vd[881] = 1;
        Ok(vd)
    }

    fn write(
        &self,
        out: &Path,
        volume_id: &str,
        boot: Option<&BootLayout>,
        cancel: &CancelToken,
    ) -> Result<()> {
        let file = File::create(out).with_context(|| format!("Failed to create {}", out.display()))?;
        let mut w = SectorWriter::new(BufWriter::new(file));

        w.zeros(u64::from(FIRST_DESCRIPTOR_LBA) * SECTOR)?;
        w.sector(FIRST_DESCRIPTOR_LBA, &self.primary_descriptor(volume_id)?)?;
        if let (Some(lba), Some(cat)) = (self.boot_record_lba, self.catalog) {
            w.sector(lba, &eltorito::boot_record(self.nodes[cat].extent))?;
        }
        let mut terminator = vec![0u8; SECTOR_USIZE];
        terminator[0] = VD_TERMINATOR;
        terminator[1..6].copy_from_slice(STANDARD_ID);
        terminator[6] = 1;
        w.sector(self.terminator_lba, &terminator)?;

        w.sector(self.l_table_lba, &self.path_table(false)?)?;
        w.sector(self.m_table_lba, &self.path_table(true)?)?;

        for &dir in &self.dirs {
            let node = &self.nodes[dir];
            let extent = pack_records(&self.dir_records(dir)?);
            if extent.len() as u64 != u64::from(node.size) {
                bail!("directory {} changed size during layout", node.name);
            }
            w.sector(node.extent, &extent)?;
        }

        if let Some(cat) = self.catalog {
            let bytes = self.catalog_bytes()?;
            w.sector(self.nodes[cat].extent, &bytes)?;
        }

        let mut written = 0usize;
        for (id, node) in self.nodes.iter().enumerate() {
            let Kind::File { source, size } = &node.kind else {
                continue;
            };
            cancel.check()?;
            if *size == 0 {
                continue;
            }
            if Some(id) == self.bios {
                let mut image = read_small(source, *size)?;
                eltorito::patch_boot_info_table(&mut image, FIRST_DESCRIPTOR_LBA, node.extent)
                    .with_context(|| format!("patching {}", source.display()))?;
                w.sector(node.extent, &image)?;
            } else {
                w.file(node.extent, source, *size)?;
            }
            written += 1;
        }

        if w.position() != u64::from(self.total_sectors) * SECTOR {
            bail!("image layout mismatch: wrote {} bytes", w.position());
        }
        w.finish()?;
        log::debug!(
            "wrote {} ({} sectors, {} directories, {written} files, boot: {})",
            out.display(),
            self.total_sectors,
            self.dirs.len(),
            boot.map(|b| b.bios_image.display().to_string())
                .unwrap_or_else(|| "none".into())
        );
        Ok(())
    }
}

/// Sectors needed when records may not straddle a sector boundary.
fn packed_sectors(lens: &[usize]) -> u64 {
    let mut sectors = 1u64;
    let mut at = 0usize;
    for &len in lens {
        if at + len > SECTOR_USIZE {
            sectors += 1;
            at = 0;
        }
        at += len;
    }
    sectors
}

fn pack_records(records: &[Vec<u8>]) -> Vec<u8> {
    let mut out = vec![0u8; SECTOR_USIZE];
    let mut base = 0usize;
    let mut at = 0usize;
    for rec in records {
        if at + rec.len() > SECTOR_USIZE {
            base += SECTOR_USIZE;
            out.resize(base + SECTOR_USIZE, 0);
            at = 0;
        }
        out[base + at..base + at + rec.len()].copy_from_slice(rec);
        at += rec.len();
    }
    out
}

fn read_small(path: &Path, size: u64) -> Result<Vec<u8>> {
    if size > MAX_BIOS_IMAGE {
        bail!("BIOS boot image {} is too large ({size} bytes)", path.display());
    }
    let data = fs::read(path).with_context(|| format!("Failed to read {}", path.display()))?;
    if data.len() as u64 != size {
        bail!("{} changed while the image was written", path.display());
    }
    Ok(data)
}

/// Sequential writer that checks every piece lands at its planned sector.
struct SectorWriter<W: Write> {
    inner: W,
    pos: u64,
}

impl<W: Write> SectorWriter<W> {
    fn new(inner: W) -> Self {
        Self { inner, pos: 0 }
    }

    fn position(&self) -> u64 {
        self.pos
    }

    fn zeros(&mut self, len: u64) -> Result<()> {
        let block = [0u8; SECTOR_USIZE];
        let mut left = len;
        while left > 0 {
            let n = left.min(SECTOR) as usize;
            self.inner.write_all(&block[..n])?;
            left -= n as u64;
        }
        self.pos += len;
        Ok(())
    }

    fn seek_check(&self, lba: u32) -> Result<()> {
        if self.pos != u64::from(lba) * SECTOR {
            bail!("layout error: at byte {} but sector {lba} was planned", self.pos);
        }
        Ok(())
    }

    fn pad(&mut self) -> Result<()> {
        let rem = self.pos % SECTOR;
        if rem != 0 {
            self.zeros(SECTOR - rem)?;
        }
        Ok(())
    }

    /// Write `data` at `lba`, padded to a whole sector.
    fn sector(&mut self, lba: u32, data: &[u8]) -> Result<()> {
        self.seek_check(lba)?;
        self.inner.write_all(data)?;
        self.pos += data.len() as u64;
        self.pad()
    }

    fn file(&mut self, lba: u32, source: &Path, size: u64) -> Result<()> {
        self.seek_check(lba)?;
        let f = File::open(source).with_context(|| format!("Failed to open {}", source.display()))?;
        let copied = std::io::copy(&mut f.take(size), &mut self.inner)?;
        if copied != size {
            bail!("{} changed while the image was written", source.display());
        }
        self.pos += copied;
        self.pad()
    }

    fn finish(mut self) -> Result<()> {
        self.inner.flush()?;
        Ok(())
    }
}

fn map_char(c: char) -> char {
    if c.is_ascii_alphanumeric() {
        c.to_ascii_uppercase()
    } else {
        '_'
    }
}

fn truncated(s: &str, max: usize) -> String {
    s.chars().take(max).collect()
}

/// Level-2 style identifier, unique within `taken`.
fn unique_identifier(name: &str, is_dir: bool, taken: &mut HashSet<String>) -> String {
    let (base, ext) = if is_dir {
        (name.chars().map(map_char).collect::<String>(), String::new())
    } else {
        match name.rfind('.') {
            Some(dot) if dot > 0 => (
                name[..dot].chars().map(map_char).collect(),
                truncated(&name[dot + 1..].chars().map(map_char).collect::<String>(), MAX_FILE_EXT),
            ),
            _ => (name.chars().map(map_char).collect(), String::new()),
        }
    };
    let base = if base.is_empty() { "_".to_string() } else { base };
    let limit = if is_dir { MAX_DIR_ID } else { MAX_FILE_BASE };

    let render = |base: &str| {
        if is_dir {
            base.to_string()
        } else {
            format!("{base}.{ext}")
        }
    };

    let mut candidate = truncated(&base, limit);
    let mut n = 1u32;
    while taken.contains(&render(&candidate)) {
        let suffix = format!("_{n}");
        candidate = format!("{}{suffix}", truncated(&base, limit.saturating_sub(suffix.len())));
        n += 1;
    }
    let key = render(&candidate);
    taken.insert(key.clone());
    if is_dir {
        key
    } else {
        format!("{key};1")
    }
}

#[cfg(test)]
mod tests {
    use super::super::reader::{EntryKind, IsoReader};
    use super::*;
    use std::os::unix::fs::symlink;

    #[test]
    fn identifiers_are_unique_and_bounded() {
        let mut taken = HashSet::new();
        assert_eq!(unique_identifier("grub.cfg", false, &mut taken), "GRUB.CFG;1");
        assert_eq!(unique_identifier("GRUB.cfg", false, &mut taken), "GRUB_1.CFG;1");
        assert_eq!(unique_identifier(".disk", true, &mut taken), "_DISK");
        assert_eq!(unique_identifier("vmlinuz", false, &mut taken), "VMLINUZ.;1");

        let long = "linux-modules-extra-6.8.0-41-generic_6.8.0-41.41_amd64.deb";
        let id = unique_identifier(long, false, &mut taken);
        assert!(id.len() <= 33, "{id}");
        assert!(id.ends_with(".DEB;1"));
    }

    #[test]
    fn records_never_straddle_sectors() {
        let records: Vec<Vec<u8>> = (0..40).map(|_| vec![1u8; 100]).collect();
        let packed = pack_records(&records);
        let lens: Vec<usize> = records.iter().map(Vec::len).collect();
        assert_eq!(packed.len() as u64, packed_sectors(&lens) * SECTOR);
        // 20 records fit in the first sector, the rest in the second.
        assert_eq!(packed.len(), 2 * SECTOR_USIZE);
        assert_eq!(packed[2000], 0);
        assert_eq!(packed[SECTOR_USIZE], 1);
    }

    #[test]
    fn plain_tree_reads_back() {
        let dir = tempfile::tempdir().unwrap();
        let tree = dir.path().join("tree");
        fs::create_dir_all(tree.join("casper")).unwrap();
        fs::create_dir_all(tree.join(".disk")).unwrap();
        fs::write(tree.join(".disk/info"), b"Ubuntu-Server 24.04.1 LTS").unwrap();
        fs::write(tree.join("casper/vmlinuz"), vec![0xAB; 5000]).unwrap();
        fs::write(tree.join("empty"), b"").unwrap();
        symlink("casper/vmlinuz", tree.join("kernel")).unwrap();

        let out = dir.path().join("plain.iso");
        write_image(&tree, &out, "PLAIN", None, &CancelToken::new()).unwrap();
        assert_eq!(fs::metadata(&out).unwrap().len() % SECTOR, 0);

        let mut reader = IsoReader::open(&out).unwrap();
        assert_eq!(reader.volume_id(), "PLAIN");
        assert!(reader.has_rock_ridge());
        assert!(reader.boot_catalog().unwrap().is_none());

        let entries = reader.entries().unwrap();
        let find = |p: &str| entries.iter().find(|e| e.path == Path::new(p)).unwrap();
        assert_eq!(find("casper").kind, EntryKind::Directory);
        assert_eq!(find("casper/vmlinuz").size(), 5000);
        assert_eq!(find("empty").size(), 0);
        assert_eq!(
            find("kernel").kind,
            EntryKind::Symlink {
                target: "casper/vmlinuz".into()
            }
        );
        assert_eq!(find(".disk/info").size(), 25);
    }

    #[test]
    fn large_directories_span_sectors() {
        let dir = tempfile::tempdir().unwrap();
        let tree = dir.path().join("pool");
        fs::create_dir_all(&tree).unwrap();
        for i in 0..200 {
            fs::write(tree.join(format!("package-{i:03}_1.0_amd64.deb")), format!("{i}")).unwrap();
        }
        let out = dir.path().join("pool.iso");
        write_image(&tree, &out, "POOL", None, &CancelToken::new()).unwrap();

        let entries = IsoReader::open(&out).unwrap().entries().unwrap();
        assert_eq!(entries.len(), 200);
        assert!(entries
            .iter()
            .any(|e| e.path == Path::new("package-199_1.0_amd64.deb")));
    }

    #[test]
    fn missing_boot_image_fails() {
        let dir = tempfile::tempdir().unwrap();
        let tree = dir.path().join("tree");
        fs::create_dir_all(tree.join("isolinux")).unwrap();
        let boot = BootLayout {
            bios_image: "isolinux/isolinux.bin".into(),
            catalog: "isolinux/boot.cat".into(),
            efi_image: "boot/grub/efi.img".into(),
        };
        let err = write_image(&tree, &dir.path().join("x.iso"), "X", Some(&boot), &CancelToken::new())
            .unwrap_err();
        assert!(err.to_string().contains("BIOS boot image"));
    }

    #[test]
    fn path_table_rejects_too_many_directories() {
        let dir = tempfile::tempdir().unwrap();
        let mut plan = Plan::scan(dir.path(), None).unwrap();
        plan.assign_identifiers();
        plan.dirs = vec![0; usize::from(u16::MAX)];
        assert!(plan.path_table(false).is_ok());

        plan.dirs.push(0);
        let err = plan.path_table(true).unwrap_err();
        assert!(err.to_string().contains("path table limit"), "{err:#}");
    }

    #[test]
    fn oversized_efi_image_is_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let tree = dir.path().join("tree");
        fs::create_dir_all(tree.join("isolinux")).unwrap();
        fs::create_dir_all(tree.join("boot/grub")).unwrap();
        fs::write(tree.join("isolinux/isolinux.bin"), vec![0x90; 2048]).unwrap();
        // One byte past what a 16-bit count of 512-byte sectors can load.
        File::create(tree.join("boot/grub/efi.img"))
            .unwrap()
            .set_len(u64::from(u16::MAX) * 512 + 1)
            .unwrap();
        let boot = BootLayout::detect(&tree).unwrap();
        let out = dir.path().join("x.iso");

        let err = write_image(&tree, &out, "X", Some(&boot), &CancelToken::new()).unwrap_err();
        assert!(err.to_string().contains("UEFI boot image"), "{err:#}");
        assert!(!out.exists());
    }

    #[test]
    fn cancelled_write_stops() {
        let dir = tempfile::tempdir().unwrap();
        let tree = dir.path().join("tree");
        fs::create_dir_all(&tree).unwrap();
        fs::write(tree.join("a"), b"a").unwrap();
        let cancel = CancelToken::new();
        cancel.cancel();
        assert!(write_image(&tree, &dir.path().join("x.iso"), "X", None, &cancel).is_err());
    }
}
