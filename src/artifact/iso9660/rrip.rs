//! Rock Ridge (RRIP 1.10 over SUSP) system use entries.
//!
//! Decoding covers what is needed to reproduce a POSIX tree: names (`NM`),
//! symlinks (`SL`), modes (`PX`), continuation areas (`CE`) and directory
//! relocation (`CL`/`RE`). Encoding emits `SP`, `ER`, `PX`, `NM` and `SL`.

use anyhow::{bail, Result};

use super::{le_u32, put_u32_both};

pub const ER_IDENTIFIER: &str = "RRIP_1991A";
const ER_DESCRIPTOR: &str = "ROCK RIDGE 1.10 POSIX SEMANTICS";
const ER_SOURCE: &str = "SEE PUBLISHER";

const NM_CONTINUE: u8 = 0x01;
const NM_CURRENT: u8 = 0x02;
const NM_PARENT: u8 = 0x04;

const SL_CONTINUE: u8 = 0x01;
const SL_CURRENT: u8 = 0x02;
const SL_PARENT: u8 = 0x04;
const SL_ROOT: u8 = 0x08;

/// Continuation area pointer from a `CE` entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Continuation {
    pub block: u32,
    pub offset: u32,
    pub length: u32,
}

/// Everything Rock Ridge says about one directory record.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RockRidge {
    pub name: Option<String>,
    pub symlink: Option<String>,
    pub mode: Option<u32>,
    /// Placeholder for a directory relocated to this location.
    pub child_link: Option<u32>,
    /// This directory was moved here from deeper in the tree.
    pub relocated: bool,
    /// `SP` present: the volume uses SUSP. Only meaningful on the root `.`.
    pub sp_skip: Option<u8>,
    pub continuation: Option<Continuation>,
}

impl RockRidge {
    pub fn is_empty(&self) -> bool {
        self == &Self::default()
    }
}

/// State kept across a record's primary area and its continuation areas.
#[derive(Debug, Default)]
pub struct Decoder {
    pub out: RockRidge,
    name: Vec<u8>,
    name_done: bool,
    link: Vec<String>,
    link_part: Vec<u8>,
    link_component_open: bool,
    link_root: bool,
}

impl Decoder {
    /// Feed one system use area. Returns the continuation to read next, if any.
    pub fn feed(&mut self, area: &[u8]) -> Option<Continuation> {
        self.out.continuation = None;
        let mut at = 0;
        while at + 4 <= area.len() {
            let sig = [area[at], area[at + 1]];
            let len = area[at + 2] as usize;
            if len < 4 || at + len > area.len() {
                break;
            }
            let body = &area[at + 4..at + len];
            match &sig {
                b"SP" if body.len() >= 3 && body[0] == 0xBE && body[1] == 0xEF => {
                    self.out.sp_skip = Some(body[2]);
                }
                b"NM" if !body.is_empty() => self.feed_name(body),
                b"SL" if !body.is_empty() => self.feed_link(body),
                b"PX" if body.len() >= 4 => self.out.mode = Some(le_u32(body, 0)),
                b"CE" if body.len() >= 24 => {
                    self.out.continuation = Some(Continuation {
                        block: le_u32(body, 0),
                        offset: le_u32(body, 8),
                        length: le_u32(body, 16),
                    });
                }
                b"CL" if body.len() >= 4 => self.out.child_link = Some(le_u32(body, 0)),
                b"RE" => self.out.relocated = true,
                b"ST" => break,
                _ => {}
            }
            at += len;
        }
        self.out.continuation
    }

    fn feed_name(&mut self, body: &[u8]) {
        let flags = body[0];
        if flags & (NM_CURRENT | NM_PARENT) != 0 || self.name_done {
            return;
        }
        self.name.extend_from_slice(&body[1..]);
        if flags & NM_CONTINUE == 0 {
            self.name_done = true;
        }
        self.out.name = Some(String::from_utf8_lossy(&self.name).into_owned());
    }

    fn feed_link(&mut self, body: &[u8]) {
        let mut at = 1;
        while at + 2 <= body.len() {
            let flags = body[at];
            let len = body[at + 1] as usize;
            let Some(content) = body.get(at + 2..at + 2 + len) else {
                break;
            };
            if flags & SL_ROOT != 0 {
                self.link.clear();
                self.link_root = true;
            } else if flags & SL_CURRENT != 0 {
                self.link.push(".".into());
            } else if flags & SL_PARENT != 0 {
                self.link.push("..".into());
            } else {
                self.link_part.extend_from_slice(content);
                self.link_component_open = flags & SL_CONTINUE != 0;
                if !self.link_component_open {
                    let part = std::mem::take(&mut self.link_part);
                    self.link.push(String::from_utf8_lossy(&part).into_owned());
                }
            }
            at += 2 + len;
        }
        let joined = self.link.join("/");
        self.out.symlink = Some(if self.link_root {
            format!("/{joined}")
        } else {
            joined
        });
    }

    pub fn finish(self) -> RockRidge {
        self.out
    }
}

/// Decode a single area with no continuation following.
pub fn decode(area: &[u8]) -> RockRidge {
    let mut decoder = Decoder::default();
    decoder.feed(area);
    decoder.finish()
}

fn entry(sig: &[u8; 2], version: u8, body: &[u8]) -> Vec<u8> {
    let mut out = Vec::with_capacity(4 + body.len());
    out.extend_from_slice(sig);
    out.push((4 + body.len()) as u8);
    out.push(version);
    out.extend_from_slice(body);
    out
}

/// `SP`: SUSP indicator, first entry of the root `.` record.
pub fn sp() -> Vec<u8> {
    entry(b"SP", 1, &[0xBE, 0xEF, 0])
}

/// `ER`: announces RRIP 1.10.
pub fn er() -> Vec<u8> {
    let mut body = vec![
        ER_IDENTIFIER.len() as u8,
        ER_DESCRIPTOR.len() as u8,
        ER_SOURCE.len() as u8,
        1,
    ];
    body.extend_from_slice(ER_IDENTIFIER.as_bytes());
    body.extend_from_slice(ER_DESCRIPTOR.as_bytes());
    body.extend_from_slice(ER_SOURCE.as_bytes());
    entry(b"ER", 1, &body)
}

/// `PX` with the 1.10 layout (mode, links, uid, gid).
pub fn px(mode: u32, links: u32) -> Vec<u8> {
    let mut body = [0u8; 32];
    put_u32_both(&mut body[0..8], mode);
    put_u32_both(&mut body[8..16], links);
    entry(b"PX", 1, &body)
}

pub fn nm(name: &str) -> Result<Vec<u8>> {
    if name.len() > 250 {
        bail!("name too long for Rock Ridge: {name}");
    }
    let mut body = vec![0u8];
    body.extend_from_slice(name.as_bytes());
    Ok(entry(b"NM", 1, &body))
}

pub fn sl(target: &str) -> Result<Vec<u8>> {
    let mut body = vec![0u8];
    let (root, rest) = match target.strip_prefix('/') {
        Some(rest) => (true, rest),
        None => (false, target),
    };
    if root {
        body.extend_from_slice(&[SL_ROOT, 0]);
    }
    for part in rest.split('/').filter(|p| !p.is_empty()) {
        match part {
            "." => body.extend_from_slice(&[SL_CURRENT, 0]),
            ".." => body.extend_from_slice(&[SL_PARENT, 0]),
            name => {
                if name.len() > 255 {
                    bail!("symlink component too long: {name}");
                }
                body.push(0);
                body.push(name.len() as u8);
                body.extend_from_slice(name.as_bytes());
            }
        }
    }
    if body.len() + 4 > 255 {
        bail!("symlink target too long for Rock Ridge: {target}");
    }
    Ok(entry(b"SL", 1, &body))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn encoded_entries_decode() {
        let mut area = sp();
        area.extend(px(0o100644, 1));
        area.extend(nm("vmlinuz-6.8.0-generic").unwrap());
        let rr = decode(&area);
        assert_eq!(rr.sp_skip, Some(0));
        assert_eq!(rr.mode, Some(0o100644));
        assert_eq!(rr.name.as_deref(), Some("vmlinuz-6.8.0-generic"));
        assert!(rr.symlink.is_none());
    }

    #[test]
    fn symlink_targets_survive() {
        for target in ["../casper/vmlinuz", "/usr/lib/grub", "./dists/noble", "stable"] {
            let rr = decode(&sl(target).unwrap());
            assert_eq!(rr.symlink.as_deref(), Some(target));
        }
    }

    #[test]
    fn split_names_and_links_are_joined() {
        let mut decoder = Decoder::default();
        decoder.feed(&entry(b"NM", 1, b"\x01long-"));
        decoder.feed(&entry(b"NM", 1, b"\x00name"));
        decoder.feed(&entry(b"SL", 1, b"\x01\x01\x03abc"));
        decoder.feed(&entry(b"SL", 1, b"\x00\x00\x03def\x00\x01g"));
        let rr = decoder.finish();
        assert_eq!(rr.name.as_deref(), Some("long-name"));
        assert_eq!(rr.symlink.as_deref(), Some("abcdef/g"));
    }

    #[test]
    fn continuation_and_relocation() {
        let mut ce_body = [0u8; 24];
        put_u32_both(&mut ce_body[0..8], 40);
        put_u32_both(&mut ce_body[8..16], 100);
        put_u32_both(&mut ce_body[16..24], 64);
        let mut area = entry(b"CE", 1, &ce_body);
        area.extend(entry(b"RE", 1, &[]));
        let mut cl = [0u8; 8];
        put_u32_both(&mut cl, 77);
        area.extend(entry(b"CL", 1, &cl));

        let rr = decode(&area);
        assert_eq!(
            rr.continuation,
            Some(Continuation {
                block: 40,
                offset: 100,
                length: 64
            })
        );
        assert!(rr.relocated);
        assert_eq!(rr.child_link, Some(77));
    }

    #[test]
    fn er_fits_with_sp_and_px_in_root_record() {
        assert!(33 + 1 + sp().len() + er().len() + px(0o40755, 2).len() <= 255);
        assert!(decode(&er()).is_empty());
    }
}
