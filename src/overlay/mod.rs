//! The autoinstall overlay: parsing, validation, credential templating and
//! injection into a working tree.
//!
//! - [`validate`] - Structural checks before any disk I/O
//! - [`credentials`] - Environment-sourced credentials, rules and hashing
//! - [`inject`] - NoCloud user-data/meta-data and boot command lines

pub mod credentials;
pub mod inject;
pub mod validate;

use serde_yaml::{Mapping, Value};
use std::collections::BTreeSet;
use std::fs;
use std::path::{Path, PathBuf};

use crate::error::{BuildError, BuildResult};
use credentials::CredentialVar;

/// Top-level key wrapping the installer configuration.
pub const AUTOINSTALL_KEY: &str = "autoinstall";
pub const CLOUD_CONFIG_HEADER: &str = "#cloud-config";
pub const SCHEMA_VERSION: u64 = 1;

/// A parsed overlay document.
#[derive(Debug, Clone)]
pub struct OverlayDocument {
    path: PathBuf,
    body: Mapping,
    /// Cloud-config keys beside an `autoinstall:` wrapper.
    extra: Mapping,
}

impl OverlayDocument {
    /// Read and parse. Bad syntax or a non-mapping root is always fatal.
    pub fn load(path: &Path) -> BuildResult<Self> {
        let text = fs::read_to_string(path)
            .map_err(|e| BuildError::validation(path, format!("cannot read overlay: {e}")))?;
        Self::parse(path, &text)
    }

    pub fn parse(path: &Path, text: &str) -> BuildResult<Self> {
        let root: Value = serde_yaml::from_str(text)
            .map_err(|e| BuildError::validation(path, format!("malformed YAML: {e}")))?;
        let Value::Mapping(mut root) = root else {
            return Err(BuildError::validation(path, "document root is not a mapping"));
        };
        let (body, extra) = match root.remove(AUTOINSTALL_KEY) {
            Some(Value::Mapping(body)) => (body, root),
            Some(_) => {
                return Err(BuildError::validation(
                    path,
                    format!("'{AUTOINSTALL_KEY}' is not a mapping"),
                ))
            }
            None => (root, Mapping::new()),
        };
        Ok(Self {
            path: path.to_path_buf(),
            body,
            extra,
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// The installer configuration, with any `autoinstall:` wrapper removed.
    pub fn body(&self) -> &Mapping {
        &self.body
    }

    /// Top-level cloud-config keys kept next to `autoinstall:`. Empty for a
    /// bare document.
    pub fn extra(&self) -> &Mapping {
        &self.extra
    }

    /// Credential variables named by whole-scalar placeholders.
    pub fn placeholders(&self) -> BTreeSet<CredentialVar> {
        let mut found = BTreeSet::new();
        for value in self.body.values().chain(self.extra.values()) {
            collect_placeholders(value, &mut found);
        }
        found
    }

    pub fn is_templated(&self) -> bool {
        !self.placeholders().is_empty()
    }
}

fn collect_placeholders(value: &Value, found: &mut BTreeSet<CredentialVar>) {
    match value {
        Value::String(s) => {
            if let Some(var) = CredentialVar::from_placeholder(s) {
                found.insert(var);
            }
        }
        Value::Sequence(items) => items.iter().for_each(|v| collect_placeholders(v, found)),
        Value::Mapping(map) => map.values().for_each(|v| collect_placeholders(v, found)),
        Value::Tagged(tagged) => collect_placeholders(&tagged.value, found),
        _ => {}
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn wrapped_and_bare_documents() {
        let wrapped = OverlayDocument::parse(
            Path::new("a.yaml"),
            "#cloud-config\nautoinstall:\n  version: 1\n  identity: {hostname: web}\n",
        )
        .unwrap();
        assert_eq!(wrapped.body().get("version").and_then(Value::as_u64), Some(1));

        assert!(wrapped.extra().is_empty());

        let bare = OverlayDocument::parse(Path::new("b.yaml"), "version: 1\nidentity: {}\n").unwrap();
        assert!(bare.body().contains_key("identity"));
        assert!(bare.extra().is_empty());
    }

    #[test]
    fn keys_beside_the_wrapper_are_kept() {
        let doc = OverlayDocument::parse(
            Path::new("c.yaml"),
            "#cloud-config\nssh_pwauth: false\nautoinstall:\n  version: 1\n\
             write_files:\n  - path: /etc/motd\n    content: \"${AUTOINSTALL_USERNAME}\"\n",
        )
        .unwrap();
        assert!(!doc.body().contains_key("ssh_pwauth"));
        assert_eq!(doc.extra().get("ssh_pwauth").and_then(Value::as_bool), Some(false));
        assert!(doc.extra().contains_key("write_files"));
        assert_eq!(doc.placeholders(), BTreeSet::from([CredentialVar::Username]));
    }

    #[test]
    fn syntax_and_shape_errors() {
        let err = OverlayDocument::parse(Path::new("bad.yaml"), "version: [1\n").unwrap_err();
        assert_eq!(err.class(), "ValidationFailure");
        assert!(err.to_string().contains("malformed YAML"));

        let err = OverlayDocument::parse(Path::new("list.yaml"), "- a\n- b\n").unwrap_err();
        assert!(err.to_string().contains("not a mapping"));

        let err = OverlayDocument::parse(Path::new("w.yaml"), "autoinstall: 3\n").unwrap_err();
        assert!(err.to_string().contains("'autoinstall' is not a mapping"));
    }

    #[test]
    fn placeholders_are_whole_scalars() {
        let doc = OverlayDocument::parse(
            Path::new("t.yaml"),
            r#"
version: 1
identity:
  hostname: web
  username: "${AUTOINSTALL_USERNAME}"
  password: "${AUTOINSTALL_PASSWORD}"
ssh:
  authorized-keys:
    - "${AUTOINSTALL_SSH_KEY}"
late-commands:
  - "echo ${AUTOINSTALL_ROOT_PASSWORD} > /dev/null"
"#,
        )
        .unwrap();
        assert!(doc.is_templated());
        assert_eq!(
            doc.placeholders(),
            BTreeSet::from([
                CredentialVar::Username,
                CredentialVar::Password,
                CredentialVar::SshKey
            ])
        );

        let plain = OverlayDocument::parse(Path::new("p.yaml"), "version: 1\n").unwrap();
        assert!(!plain.is_templated());
    }
}
