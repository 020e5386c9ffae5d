//! `SHA256SUMS` manifest parsing.
//!
//! Lines are `<hex>  <name>` (text mode) or `<hex> *<name>` (binary mode).
//! The same format is used for the cache and output sidecars.

/// Ordered `(digest, filename)` pairs. Lookups are by exact filename.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ChecksumManifest {
    entries: Vec<(String, String)>,
}

impl ChecksumManifest {
    pub fn parse(text: &str) -> Self {
        let mut entries = Vec::new();
        for (lineno, line) in text.lines().enumerate() {
            let line = line.trim();
            if line.is_empty() || line.starts_with('#') {
                continue;
            }
            match parse_line(line) {
                Some(entry) => entries.push(entry),
                None => log::debug!("SHA256SUMS line {} ignored: {line}", lineno + 1),
            }
        }
        Self { entries }
    }

    /// Digest for `filename`, lowercase hex.
    pub fn lookup(&self, filename: &str) -> Option<&str> {
        self.entries
            .iter()
            .find(|(_, name)| name == filename)
            .map(|(digest, _)| digest.as_str())
    }

    #[cfg(test)]
    pub(crate) fn len(&self) -> usize {
        self.entries.len()
    }
}

fn parse_line(line: &str) -> Option<(String, String)> {
    let (digest, rest) = line.split_once(char::is_whitespace)?;
    if !is_hex_64(digest) {
        return None;
    }
    let name = rest.trim_start();
    let name = name.strip_prefix('*').unwrap_or(name);
    if name.is_empty() {
        return None;
    }
    Some((digest.to_ascii_lowercase(), name.to_string()))
}

/// Render one manifest line.
pub fn format_line(digest: &str, filename: &str) -> String {
    format!("{digest}  {filename}\n")
}

pub(crate) fn is_hex_64(s: &str) -> bool {
    s.len() == 64 && s.chars().all(|c| c.is_ascii_hexdigit())
}
