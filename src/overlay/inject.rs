//! Write the overlay into a working tree and point the boot loaders at it.
//!
//! The overlay becomes a NoCloud datasource at `/nocloud/` on the medium.
//! Kernel command lines in the grub and isolinux configs gain
//! `autoinstall ds=nocloud;s=/cdrom/nocloud/` so the installer runs
//! unattended from that datasource.

use serde_yaml::value::TaggedValue;
use serde_yaml::{Mapping, Value};
use std::fs;
use std::path::{Path, PathBuf};

use super::credentials::{CredentialSet, CredentialVar, ProcessedCredentials};
use super::{OverlayDocument, AUTOINSTALL_KEY, CLOUD_CONFIG_HEADER};
use crate::error::{BuildError, BuildResult, CredentialViolation};

pub const NOCLOUD_DIR: &str = "nocloud";
pub const DATASOURCE: &str = "ds=nocloud;s=/cdrom/nocloud/";

const GRUB_CONFIGS: &[&str] = &["boot/grub/grub.cfg", "boot/grub/loopback.cfg"];
const ISOLINUX_CONFIGS: &[&str] = &["isolinux/txt.cfg"];

/// What injection wrote.
#[derive(Debug, Clone)]
pub struct InjectionReport {
    pub user_data: PathBuf,
    pub meta_data: PathBuf,
    pub patched_boot_configs: Vec<PathBuf>,
    /// Set when `user_data` carries processed credentials.
    pub templated: bool,
}

/// Render `doc` (templating it with `credentials` if it has placeholders),
/// write it to `<tree>/nocloud/` and patch the boot configs.
pub fn inject(
    tree: &Path,
    doc: &OverlayDocument,
    credentials: Option<&CredentialSet>,
    instance_id: &str,
) -> BuildResult<InjectionReport> {
    let required = doc.placeholders();
    let templated = !required.is_empty();

    let rendered = if templated {
        let empty = CredentialSet::default();
        let credentials = credentials.unwrap_or(&empty);
        let processed = credentials.process(&required)?;
        let text = render(
            &substitute(doc.body(), &processed),
            &substitute(doc.extra(), &processed),
        )?;
        check_for_leaks(&text, credentials)?;
        text
    } else {
        render(doc.body(), doc.extra())?
    };

    let dir = tree.join(NOCLOUD_DIR);
    let user_data = dir.join("user-data");
    let meta_data = dir.join("meta-data");
    let write = |path: &Path, text: &str| {
        fs::write(path, text).map_err(|e| BuildError::validation(path, format!("cannot write: {e}")))
    };
    fs::create_dir_all(&dir).map_err(|e| BuildError::validation(&dir, format!("cannot create: {e}")))?;
    write(&user_data, &rendered)?;
    write(&meta_data, &format!("instance-id: {instance_id}\n"))?;
    log::info!(
        "Wrote {}{}",
        user_data.display(),
        if templated { " (templated)" } else { "" }
    );

    let patched_boot_configs = patch_boot_configs(tree)?;
    if patched_boot_configs.is_empty() {
        log::warn!("No boot configuration was patched; the installer will not start unattended");
    }

    Ok(InjectionReport {
        user_data,
        meta_data,
        patched_boot_configs,
        templated,
    })
}

/// Replace every whole-scalar placeholder with its processed value.
fn substitute(body: &Mapping, processed: &ProcessedCredentials) -> Mapping {
    body.iter()
        .map(|(k, v)| (k.clone(), substitute_value(v, processed)))
        .collect()
}

fn substitute_value(value: &Value, processed: &ProcessedCredentials) -> Value {
    match value {
        Value::String(s) => match CredentialVar::from_placeholder(s).and_then(|v| processed.get(v)) {
            Some(replacement) => Value::String(replacement.to_string()),
            None => value.clone(),
        },
        Value::Sequence(items) => Value::Sequence(
            items
                .iter()
                .map(|v| substitute_value(v, processed))
                .collect(),
        ),
        Value::Mapping(map) => Value::Mapping(substitute(map, processed)),
        Value::Tagged(tagged) => Value::Tagged(Box::new(TaggedValue {
            tag: tagged.tag.clone(),
            value: substitute_value(&tagged.value, processed),
        })),
        _ => value.clone(),
    }
}

/// `#cloud-config` header, the body under `autoinstall:`, then any other
/// top-level keys.
fn render(body: &Mapping, extra: &Mapping) -> BuildResult<String> {
    let mut root = Mapping::new();
    root.insert(Value::from(AUTOINSTALL_KEY), Value::Mapping(body.clone()));
    for (key, value) in extra {
        root.insert(key.clone(), value.clone());
    }
    let yaml = serde_yaml::to_string(&root).map_err(|e| BuildError::Config {
        reason: format!("cannot serialize overlay: {e}"),
    })?;
    Ok(format!("{CLOUD_CONFIG_HEADER}\n{yaml}"))
}

fn check_for_leaks(rendered: &str, credentials: &CredentialSet) -> BuildResult<()> {
    let violations: Vec<_> = credentials
        .secrets()
        .into_iter()
        .filter(|(_, secret)| !secret.is_empty() && rendered.contains(secret))
        .map(|(field, _)| CredentialViolation::PlaintextLeak { field })
        .collect();
    if violations.is_empty() {
        Ok(())
    } else {
        Err(BuildError::CredentialValidationFailure { violations })
    }
}

/// Patch every known boot config present in `tree`. Returns the changed files.
pub fn patch_boot_configs(tree: &Path) -> BuildResult<Vec<PathBuf>> {
    let grub_args = format!("autoinstall {}", DATASOURCE.replace(';', "\\;"));
    let isolinux_args = format!("autoinstall {DATASOURCE}");

    let mut patched = Vec::new();
    let targets = GRUB_CONFIGS
        .iter()
        .map(|rel| (rel, &["linux", "linuxefi"][..], grub_args.as_str()))
        .chain(
            ISOLINUX_CONFIGS
                .iter()
                .map(|rel| (rel, &["append"][..], isolinux_args.as_str())),
        );

    for (rel, directives, args) in targets {
        let path = tree.join(rel);
        if !path.is_file() {
            continue;
        }
        let text = fs::read_to_string(&path)
            .map_err(|e| BuildError::validation(&path, format!("cannot read: {e}")))?;
        let updated = patch_kernel_lines(&text, directives, args);
        if updated != text {
            fs::write(&path, updated)
                .map_err(|e| BuildError::validation(&path, format!("cannot write: {e}")))?;
            log::info!("Patched kernel command line in {rel}");
            patched.push(path);
        }
    }
    Ok(patched)
}

/// Add `args` to every line whose first word is one of `directives`, before
/// a `---` separator when there is one. Lines that already request an
/// autoinstall are left alone.
pub fn patch_kernel_lines(text: &str, directives: &[&str], args: &str) -> String {
    let mut out = String::with_capacity(text.len() + 64);
    for line in text.split_inclusive('\n') {
        let (body, eol) = match line.strip_suffix('\n') {
            Some(body) => (body, "\n"),
            None => (line, ""),
        };
        let mut words = body.split_whitespace();
        let is_kernel_line = words.next().is_some_and(|w| directives.contains(&w));
        let already = body.split_whitespace().any(|w| w == "autoinstall");
        if !is_kernel_line || already {
            out.push_str(line);
            continue;
        }
        match separator_at(body) {
            Some(at) => {
                out.push_str(&body[..at]);
                out.push_str(args);
                out.push(' ');
                out.push_str(&body[at..]);
            }
            None => {
                out.push_str(body.trim_end());
                out.push(' ');
                out.push_str(args);
            }
        }
        out.push_str(eol);
    }
    out
}

/// Byte offset of a standalone `---` word.
fn separator_at(line: &str) -> Option<usize> {
    let mut from = 0;
    while let Some(found) = line[from..].find("---") {
        let at = from + found;
        let before = line[..at].chars().next_back();
        let after = line[at + 3..].chars().next();
        if before.is_some_and(char::is_whitespace) && after.map_or(true, char::is_whitespace) {
            return Some(at);
        }
        from = at + 3;
    }
    None
}
