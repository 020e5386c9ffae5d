//! Structural validation of the overlay document.
//!
//! Only the keys the pipeline depends on are checked; the rest of the
//! installer schema is opaque here.

use serde_yaml::Value;
use std::path::Path;

use super::{OverlayDocument, SCHEMA_VERSION};
use crate::error::{BuildError, BuildResult};
use crate::preflight::HostProbe;
use crate::process::Cmd;

/// Stricter validator shipped with the Ubuntu installer tooling.
pub const EXTERNAL_VALIDATOR: &str = "validate-autoinstall-user-data";

const RECOMMENDED_IDENTITY_KEYS: &[&str] = &["hostname", "username", "password"];

#[derive(Debug, Clone, Copy, Default)]
pub struct ValidationOptions {
    /// Skip everything except syntax parsing.
    pub skip: bool,
    /// Treat a failing external validator as fatal.
    pub strict_external: bool,
}

/// Parse and validate the overlay at `path`.
pub fn validate_overlay(
    path: &Path,
    options: ValidationOptions,
    probe: &dyn HostProbe,
) -> BuildResult<OverlayDocument> {
    let doc = OverlayDocument::load(path)?;
    if options.skip {
        log::warn!("Overlay validation skipped; only syntax was checked");
        return Ok(doc);
    }

    check_structure(&doc)?;
    run_external_validator(path, options.strict_external, probe)?;
    log::info!("Overlay {} is valid", path.display());
    Ok(doc)
}

/// Required keys are fatal, recommended identity keys are warnings.
pub fn check_structure(doc: &OverlayDocument) -> BuildResult<()> {
    let path = doc.path();
    let body = doc.body();

    match body.get("version") {
        None => return Err(BuildError::validation(path, "missing required key 'version'")),
        Some(v) if v.as_u64() == Some(SCHEMA_VERSION) => {}
        Some(v) => {
            return Err(BuildError::validation(
                path,
                format!(
                    "unsupported version {}; expected {SCHEMA_VERSION}",
                    render_scalar(v)
                ),
            ))
        }
    }

    let identity = match body.get("identity") {
        None => return Err(BuildError::validation(path, "missing required key 'identity'")),
        Some(Value::Mapping(identity)) => identity,
        Some(_) => return Err(BuildError::validation(path, "'identity' must be a mapping")),
    };
    for key in RECOMMENDED_IDENTITY_KEYS {
        if !identity.contains_key(*key) {
            log::warn!("identity.{key} is not set in {}", path.display());
        }
    }
    Ok(())
}

fn run_external_validator(path: &Path, strict: bool, probe: &dyn HostProbe) -> BuildResult<()> {
    let Some(tool) = probe.find_command(EXTERNAL_VALIDATOR) else {
        log::debug!("{EXTERNAL_VALIDATOR} not found; skipping external validation");
        return Ok(());
    };

    let outcome = Cmd::new(&tool).arg_path(path).allow_fail().run();
    let reason = match outcome {
        Ok(result) if result.success() => return Ok(()),
        Ok(result) => format!(
            "{EXTERNAL_VALIDATOR} rejected the overlay: {}",
            result.stderr.trim()
        ),
        Err(err) => format!("{EXTERNAL_VALIDATOR} could not run: {err:#}"),
    };

    if strict {
        return Err(BuildError::validation(path, reason));
    }
    log::warn!("{reason}");
    log::warn!(
        "Continuing anyway; set [validation] strict_external = true to make this fatal"
    );
    Ok(())
}

fn render_scalar(value: &Value) -> String {
    serde_yaml::to_string(value)
        .map(|s| s.trim().to_string())
        .unwrap_or_else(|_| "<unprintable>".to_string())
}
