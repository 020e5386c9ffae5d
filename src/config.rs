//! Build configuration.
//!
//! One immutable [`BuildConfig`] is resolved at startup and passed by
//! reference to every stage. Sources, lowest precedence first: built-in
//! defaults, an optional TOML file, `AUTOISO_*` environment overrides, and
//! finally the invocation parameters.

use serde::Deserialize;
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::acquire::retry::RetryPolicy;
use crate::error::{BuildError, BuildResult};
use crate::preflight::{BackendPreferences, CompositionPreference, ExtractionPreference};

pub const DEFAULT_VERSION: &str = "24.04.1";
pub const DEFAULT_ARCH: &str = "amd64";
pub const DEFAULT_MIRROR: &str = "https://releases.ubuntu.com";
pub const DEFAULT_ARCHIVE_MIRROR: &str = "https://old-releases.ubuntu.com/releases";
pub const DEFAULT_DOWNLOAD_TIMEOUT_SECS: u64 = 60;

pub const ENV_VERSION: &str = "AUTOISO_VERSION";
pub const ENV_MIRROR: &str = "AUTOISO_MIRROR";
pub const ENV_CACHE_DIR: &str = "AUTOISO_CACHE_DIR";
pub const ENV_OUTPUT_DIR: &str = "AUTOISO_OUTPUT_DIR";

/// Resolved, immutable configuration for one build.
#[derive(Debug, Clone)]
pub struct BuildConfig {
    pub version: String,
    pub arch: String,
    pub mirror_url: String,
    pub archive_mirror_url: String,
    pub overlay_path: PathBuf,
    pub profile: String,
    pub output_dir: PathBuf,
    pub cache_dir: PathBuf,
    pub work_dir: PathBuf,
    pub skip_validation: bool,
    pub no_cache: bool,
    pub verify_checksum: bool,
    pub retry: RetryPolicy,
    pub download_timeout: Duration,
    pub cache_max_age: Option<Duration>,
    pub backend: BackendPreferences,
    pub strict_external_validation: bool,
}

impl BuildConfig {
    /// File name of the live-server image on the mirror.
    pub fn image_filename(&self) -> String {
        format!("ubuntu-{}-live-server-{}.iso", self.version, self.arch)
    }
}

/// Parameters handed over by the command-line layer.
#[derive(Debug, Clone, Default)]
pub struct Invocation {
    pub version: Option<String>,
    pub mirror_url: Option<String>,
    pub overlay_path: PathBuf,
    pub output_dir: Option<PathBuf>,
    pub cache_dir: Option<PathBuf>,
    pub profile: Option<String>,
    pub skip_validation: bool,
    pub no_cache: bool,
    /// `None` keeps the default (verification on).
    pub verify_checksum: Option<bool>,
    pub config_file: Option<PathBuf>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ConfigFile {
    #[serde(default)]
    image: ImageToml,
    #[serde(default)]
    paths: PathsToml,
    #[serde(default)]
    download: DownloadToml,
    #[serde(default)]
    cache: CacheToml,
    #[serde(default)]
    backend: BackendToml,
    #[serde(default)]
    validation: ValidationToml,
}

#[derive(Debug, Default, Deserialize)]
#[serde(deny_unknown_fields)]
struct ImageToml {
    version: Option<String>,
    arch: Option<String>,
    mirror: Option<String>,
    archive_mirror: Option<String>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(deny_unknown_fields)]
struct PathsToml {
    cache_dir: Option<PathBuf>,
    output_dir: Option<PathBuf>,
    work_dir: Option<PathBuf>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(deny_unknown_fields)]
struct DownloadToml {
    attempts: Option<u32>,
    delay_secs: Option<u64>,
    timeout_secs: Option<u64>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(deny_unknown_fields)]
struct CacheToml {
    max_age_days: Option<u64>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(deny_unknown_fields)]
struct BackendToml {
    extraction: Option<String>,
    composition: Option<String>,
    software_fallback: Option<bool>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(deny_unknown_fields)]
struct ValidationToml {
    strict_external: Option<bool>,
}

pub fn load_config_file(path: &Path) -> BuildResult<ConfigFile> {
    let text = fs::read_to_string(path).map_err(|e| BuildError::Config {
        reason: format!("reading config '{}': {e}", path.display()),
    })?;
    toml::from_str(&text).map_err(|e| BuildError::Config {
        reason: format!("parsing config '{}': {e}", path.display()),
    })
}

/// Resolve the final configuration from the process environment.
pub fn resolve(invocation: &Invocation) -> BuildResult<BuildConfig> {
    let file = match &invocation.config_file {
        Some(path) => load_config_file(path)?,
        None => ConfigFile::default(),
    };
    resolve_with(invocation, file, |key| std::env::var(key).ok())
}

/// Resolve with an explicit environment lookup.
pub fn resolve_with(
    invocation: &Invocation,
    file: ConfigFile,
    env: impl Fn(&str) -> Option<String>,
) -> BuildResult<BuildConfig> {
    let env = |key: &str| env(key).filter(|v| !v.trim().is_empty());

    let version = invocation
        .version
        .clone()
        .or_else(|| env(ENV_VERSION))
        .or(file.image.version)
        .unwrap_or_else(|| DEFAULT_VERSION.to_string());
    validate_version(&version)?;

    let arch = file.image.arch.unwrap_or_else(|| DEFAULT_ARCH.to_string());
    if arch.is_empty() || !arch.chars().all(|c| c.is_ascii_alphanumeric()) {
        return Err(config_error(format!("invalid architecture '{arch}'")));
    }

    let mirror_url = invocation
        .mirror_url
        .clone()
        .or_else(|| env(ENV_MIRROR))
        .or(file.image.mirror)
        .unwrap_or_else(|| DEFAULT_MIRROR.to_string());
    let archive_mirror_url = file
        .image
        .archive_mirror
        .unwrap_or_else(|| DEFAULT_ARCHIVE_MIRROR.to_string());

    let cache_dir = invocation
        .cache_dir
        .clone()
        .or_else(|| env(ENV_CACHE_DIR).map(PathBuf::from))
        .or(file.paths.cache_dir)
        .unwrap_or_else(default_cache_dir);
    let output_dir = invocation
        .output_dir
        .clone()
        .or_else(|| env(ENV_OUTPUT_DIR).map(PathBuf::from))
        .or(file.paths.output_dir)
        .unwrap_or_else(|| PathBuf::from("output"));
    let work_dir = file.paths.work_dir.unwrap_or_else(std::env::temp_dir);

    let profile = match &invocation.profile {
        Some(p) => p.clone(),
        None => profile_from_overlay(&invocation.overlay_path)?,
    };
    validate_profile(&profile)?;

    let defaults = RetryPolicy::default();
    let retry = RetryPolicy {
        attempts: file.download.attempts.unwrap_or(defaults.attempts),
        delay: file
            .download
            .delay_secs
            .map(Duration::from_secs)
            .unwrap_or(defaults.delay),
    };
    if retry.attempts == 0 {
        return Err(config_error("download.attempts must be at least 1"));
    }

    let backend = BackendPreferences {
        extraction: match file.backend.extraction.as_deref() {
            Some(raw) => ExtractionPreference::parse(raw).map_err(config_error)?,
            None => ExtractionPreference::Auto,
        },
        composition: match file.backend.composition.as_deref() {
            Some(raw) => CompositionPreference::parse(raw).map_err(config_error)?,
            None => CompositionPreference::Auto,
        },
        software_fallback: file.backend.software_fallback.unwrap_or(true),
    };

    Ok(BuildConfig {
        version,
        arch,
        mirror_url: mirror_url.trim_end_matches('/').to_string(),
        archive_mirror_url: archive_mirror_url.trim_end_matches('/').to_string(),
        overlay_path: invocation.overlay_path.clone(),
        profile,
        output_dir,
        cache_dir,
        work_dir,
        skip_validation: invocation.skip_validation,
        no_cache: invocation.no_cache,
        verify_checksum: invocation.verify_checksum.unwrap_or(true),
        retry,
        download_timeout: Duration::from_secs(
            file.download
                .timeout_secs
                .unwrap_or(DEFAULT_DOWNLOAD_TIMEOUT_SECS),
        ),
        cache_max_age: file
            .cache
            .max_age_days
            .map(|days| Duration::from_secs(days * 24 * 60 * 60)),
        backend,
        strict_external_validation: file.validation.strict_external.unwrap_or(false),
    })
}

fn default_cache_dir() -> PathBuf {
    dirs::cache_dir()
        .unwrap_or_else(std::env::temp_dir)
        .join("autoiso-builder")
}

fn config_error(reason: impl Into<String>) -> BuildError {
    BuildError::Config {
        reason: reason.into(),
    }
}

/// Versions are used as cache path segments and URL segments.
fn validate_version(version: &str) -> BuildResult<()> {
    let ok = !version.is_empty()
        && version.chars().all(|c| c.is_ascii_digit() || c == '.')
        && !version.starts_with('.')
        && !version.contains("..");
    if !ok {
        return Err(config_error(format!(
            "invalid Ubuntu version '{version}' (expected e.g. 24.04.1)"
        )));
    }
    Ok(())
}

fn validate_profile(profile: &str) -> BuildResult<()> {
    let ok = !profile.is_empty()
        && profile
            .chars()
            .all(|c| c.is_ascii_lowercase() || c.is_ascii_digit() || c == '-' || c == '_');
    if !ok {
        return Err(config_error(format!(
            "invalid profile name '{profile}' (lowercase letters, digits, '-', '_')"
        )));
    }
    Ok(())
}

/// `profiles/web-server.yaml` -> `web-server`.
fn profile_from_overlay(overlay: &Path) -> BuildResult<String> {
    let stem = overlay
        .file_stem()
        .and_then(|s| s.to_str())
        .filter(|s| !s.is_empty())
        .ok_or_else(|| {
            config_error(format!(
                "cannot derive a profile name from '{}'",
                overlay.display()
            ))
        })?;
    let stem = stem.strip_suffix("-user-data").unwrap_or(stem);
    Ok(stem
        .chars()
        .map(|c| {
            let c = c.to_ascii_lowercase();
            if c.is_ascii_alphanumeric() || c == '-' || c == '_' {
                c
            } else {
                '-'
            }
        })
        .collect())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn invocation() -> Invocation {
        Invocation {
            overlay_path: PathBuf::from("profiles/Web Server.yaml"),
            ..Default::default()
        }
    }

    #[test]
    fn defaults_apply_without_sources() {
        let config = resolve_with(&invocation(), ConfigFile::default(), |_| None).unwrap();
        assert_eq!(config.version, DEFAULT_VERSION);
        assert_eq!(config.mirror_url, DEFAULT_MIRROR);
        assert_eq!(config.profile, "web-server");
        assert!(config.verify_checksum);
        assert_eq!(config.retry.attempts, 3);
        assert_eq!(config.retry.delay, Duration::from_secs(5));
        assert_eq!(
            config.image_filename(),
            format!("ubuntu-{DEFAULT_VERSION}-live-server-amd64.iso")
        );
    }

    #[test]
    fn precedence_is_file_then_env_then_invocation() {
        let file: ConfigFile = toml::from_str(
            r#"
            [image]
            version = "20.04.6"
            mirror = "https://file.example/ubuntu/"

            [download]
            attempts = 5
            delay_secs = 1

            [backend]
            extraction = "software"
            composition = "xorriso"
            "#,
        )
        .unwrap();
        let env: HashMap<&str, &str> = HashMap::from([(ENV_VERSION, "22.04.5")]);
        let mut inv = invocation();
        inv.mirror_url = Some("https://cli.example".into());

        let config = resolve_with(&inv, file, |k| env.get(k).map(|v| v.to_string())).unwrap();
        assert_eq!(config.version, "22.04.5");
        assert_eq!(config.mirror_url, "https://cli.example");
        assert_eq!(config.retry.attempts, 5);
        assert_eq!(config.backend.extraction, ExtractionPreference::Software);
        assert_eq!(
            config.backend.composition,
            CompositionPreference::Tool(crate::preflight::ToolId::Xorriso)
        );
    }

    #[test]
    fn unknown_keys_are_rejected() {
        let parsed: Result<ConfigFile, _> = toml::from_str("[image]\nflavour = \"desktop\"\n");
        assert!(parsed.is_err());
    }

    #[test]
    fn path_like_versions_are_rejected() {
        let mut inv = invocation();
        inv.version = Some("../../etc".into());
        let err = resolve_with(&inv, ConfigFile::default(), |_| None).unwrap_err();
        assert_eq!(err.class(), "ConfigError");
    }

    #[test]
    fn zero_attempts_is_a_config_error() {
        let file: ConfigFile = toml::from_str("[download]\nattempts = 0\n").unwrap();
        assert!(resolve_with(&invocation(), file, |_| None).is_err());
    }
}
