//! Host capability detection.
//!
//! Decides, once per run, how the image is unpacked and how it is rebuilt.
//! The result is an immutable [`BackendSelection`] handed to every later
//! stage by reference; nothing downstream probes the host again.
//!
//! # Example
//!
//! ```rust,ignore
//! use autoiso_builder::preflight::{detect, BackendPreferences, SystemProbe};
//!
//! let selection = detect(&BackendPreferences::default(), &SystemProbe)?;
//! println!("{selection}");
//! ```

use std::fmt;
use std::path::{Path, PathBuf};

use anyhow::{bail, Result};

use crate::error::{BuildError, BuildResult};

/// Loop device control node; its presence means loop devices can be attached.
pub const LOOP_CONTROL: &str = "/dev/loop-control";

/// Tools needed for the privileged (loop mount) extraction path.
///
/// Each tuple is (command_name, package_name).
pub const PRIVILEGED_TOOLS: &[(&str, &str)] = &[
    ("losetup", "util-linux"),
    ("mount", "util-linux"),
    ("umount", "util-linux"),
];

/// Disk-image authoring tools, in preference order.
pub const TOOL_PREFERENCE: &[ToolId] = &[ToolId::Genisoimage, ToolId::Mkisofs, ToolId::Xorriso];

/// A supported ISO authoring tool.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ToolId {
    Genisoimage,
    Mkisofs,
    Xorriso,
}

impl ToolId {
    pub fn command(self) -> &'static str {
        match self {
            Self::Genisoimage => "genisoimage",
            Self::Mkisofs => "mkisofs",
            Self::Xorriso => "xorriso",
        }
    }

    pub fn package(self) -> &'static str {
        match self {
            Self::Genisoimage => "genisoimage",
            Self::Mkisofs => "cdrtools",
            Self::Xorriso => "xorriso",
        }
    }

    fn from_command(name: &str) -> Option<Self> {
        TOOL_PREFERENCE
            .iter()
            .copied()
            .find(|tool| tool.command() == name)
    }
}

/// How the source image is unpacked.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExtractionMode {
    /// Loop device + read-only mount.
    Privileged,
    /// Built-in ISO9660 reader, no OS mount.
    SoftwareOnly,
}

/// Backends chosen for this run.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BackendSelection {
    pub extraction_mode: ExtractionMode,
    /// `None` selects the built-in ISO9660 writer.
    pub composition_tool: Option<ToolId>,
}

impl fmt::Display for BackendSelection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let extraction = match self.extraction_mode {
            ExtractionMode::Privileged => "loop mount",
            ExtractionMode::SoftwareOnly => "built-in ISO9660 reader",
        };
        let composition = match self.composition_tool {
            Some(tool) => tool.command(),
            None => "built-in ISO9660 writer",
        };
        write!(f, "extract via {extraction}, compose via {composition}")
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ExtractionPreference {
    #[default]
    Auto,
    Privileged,
    Software,
}

impl ExtractionPreference {
    pub fn parse(raw: &str) -> std::result::Result<Self, String> {
        match raw.trim().to_ascii_lowercase().as_str() {
            "auto" => Ok(Self::Auto),
            "privileged" | "mount" => Ok(Self::Privileged),
            "software" => Ok(Self::Software),
            other => Err(format!(
                "unsupported backend.extraction '{other}' (expected auto, privileged or software)"
            )),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum CompositionPreference {
    #[default]
    Auto,
    Software,
    Tool(ToolId),
}

impl CompositionPreference {
    pub fn parse(raw: &str) -> std::result::Result<Self, String> {
        match raw.trim().to_ascii_lowercase().as_str() {
            "auto" => Ok(Self::Auto),
            "software" => Ok(Self::Software),
            other => ToolId::from_command(other).map(Self::Tool).ok_or_else(|| {
                format!(
                    "unsupported backend.composition '{other}' (expected auto, software, genisoimage, mkisofs or xorriso)"
                )
            }),
        }
    }
}

/// Backend preferences from configuration.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BackendPreferences {
    pub extraction: ExtractionPreference,
    pub composition: CompositionPreference,
    /// Whether the built-in reader may be used for extraction.
    pub software_fallback: bool,
}

impl Default for BackendPreferences {
    fn default() -> Self {
        Self {
            extraction: ExtractionPreference::Auto,
            composition: CompositionPreference::Auto,
            software_fallback: true,
        }
    }
}

/// Read-only view of the host, so detection can be tested.
pub trait HostProbe {
    fn is_root(&self) -> bool;
    fn path_exists(&self, path: &Path) -> bool;
    fn find_command(&self, name: &str) -> Option<PathBuf>;
}

/// The real host.
#[derive(Debug, Clone, Copy, Default)]
pub struct SystemProbe;

impl HostProbe for SystemProbe {
    fn is_root(&self) -> bool {
        // SAFETY: geteuid has no preconditions and cannot fail.
        unsafe { libc::geteuid() == 0 }
    }

    fn path_exists(&self, path: &Path) -> bool {
        path.exists()
    }

    fn find_command(&self, name: &str) -> Option<PathBuf> {
        which::which(name).ok()
    }
}

/// Check if a command exists on the host system.
pub fn command_exists(cmd: &str) -> bool {
    SystemProbe.find_command(cmd).is_some()
}

/// Check that specific tools are available.
///
/// # Returns
///
/// * `Ok(())` if all tools are found
/// * `Err` with list of missing tools and their packages
pub fn check_required_tools(probe: &dyn HostProbe, tools: &[(&str, &str)]) -> Result<()> {
    let missing: Vec<String> = tools
        .iter()
        .filter(|(tool, _)| probe.find_command(tool).is_none())
        .map(|(tool, package)| format!("  {} (install: {})", tool, package))
        .collect();

    if !missing.is_empty() {
        bail!("Missing required host tools:\n{}", missing.join("\n"));
    }

    Ok(())
}

/// Why the privileged path is unusable, or `None` if it is usable.
fn privileged_blocker(probe: &dyn HostProbe) -> Option<String> {
    if !probe.is_root() {
        return Some("not running as root".to_string());
    }
    if !probe.path_exists(Path::new(LOOP_CONTROL)) {
        return Some(format!("{LOOP_CONTROL} is missing"));
    }
    check_required_tools(probe, PRIVILEGED_TOOLS)
        .err()
        .map(|e| e.to_string())
}

/// Probe the host and pick backends.
///
/// Fails with `BackendUnavailable` when no allowed extraction path exists or a
/// forced backend is missing. Has no side effects.
pub fn detect(prefs: &BackendPreferences, probe: &dyn HostProbe) -> BuildResult<BackendSelection> {
    let blocker = privileged_blocker(probe);

    let extraction_mode = match (prefs.extraction, &blocker) {
        (ExtractionPreference::Privileged, None) => ExtractionMode::Privileged,
        (ExtractionPreference::Privileged, Some(reason)) => {
            return Err(BuildError::BackendUnavailable {
                reason: format!("privileged extraction was requested but {reason}"),
            });
        }
        (ExtractionPreference::Auto, None) => ExtractionMode::Privileged,
        (ExtractionPreference::Auto | ExtractionPreference::Software, _)
            if prefs.software_fallback =>
        {
            ExtractionMode::SoftwareOnly
        }
        (_, reason) => {
            return Err(BuildError::BackendUnavailable {
                reason: format!(
                    "no extraction backend: loop mount unusable ({}) and the software reader is disabled",
                    reason.as_deref().unwrap_or("not selected")
                ),
            });
        }
    };

    let composition_tool = match prefs.composition {
        CompositionPreference::Software => None,
        CompositionPreference::Auto => TOOL_PREFERENCE
            .iter()
            .copied()
            .find(|tool| probe.find_command(tool.command()).is_some()),
        CompositionPreference::Tool(tool) => {
            if probe.find_command(tool.command()).is_none() {
                return Err(BuildError::BackendUnavailable {
                    reason: format!(
                        "{} was requested for composition but is not installed (install: {})",
                        tool.command(),
                        tool.package()
                    ),
                });
            }
            Some(tool)
        }
    };

    let selection = BackendSelection {
        extraction_mode,
        composition_tool,
    };
    if let (ExtractionMode::SoftwareOnly, Some(reason)) = (extraction_mode, blocker) {
        log::debug!("loop mount unavailable: {reason}");
    }
    log::info!("backends: {selection}");
    Ok(selection)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashSet;

    struct FakeHost {
        root: bool,
        loop_control: bool,
        commands: HashSet<&'static str>,
    }

    impl FakeHost {
        fn new(root: bool, loop_control: bool, commands: &[&'static str]) -> Self {
            Self {
                root,
                loop_control,
                commands: commands.iter().copied().collect(),
            }
        }
    }

    impl HostProbe for FakeHost {
        fn is_root(&self) -> bool {
            self.root
        }

        fn path_exists(&self, path: &Path) -> bool {
            self.loop_control && path == Path::new(LOOP_CONTROL)
        }

        fn find_command(&self, name: &str) -> Option<PathBuf> {
            self.commands
                .contains(name)
                .then(|| PathBuf::from("/usr/bin").join(name))
        }
    }

    const MOUNT_TOOLS: &[&str] = &["losetup", "mount", "umount"];

    #[test]
    fn test_command_exists() {
        assert!(command_exists("ls"));
        assert!(!command_exists("definitely_not_a_real_command_12345"));
    }

    #[test]
    fn test_check_required_tools_failure_lists_package() {
        let host = FakeHost::new(true, true, &["mount"]);
        let err = check_required_tools(&host, PRIVILEGED_TOOLS).unwrap_err();
        let msg = err.to_string();
        assert!(msg.contains("losetup (install: util-linux)"));
        assert!(!msg.contains("  mount "));
    }

    #[test]
    fn root_with_loop_devices_is_privileged() {
        let host = FakeHost::new(true, true, MOUNT_TOOLS);
        let sel = detect(&BackendPreferences::default(), &host).unwrap();
        assert_eq!(sel.extraction_mode, ExtractionMode::Privileged);
        assert_eq!(sel.composition_tool, None);
    }

    #[test]
    fn unprivileged_falls_back_to_software() {
        let host = FakeHost::new(false, true, &["losetup", "mount", "umount", "xorriso"]);
        let sel = detect(&BackendPreferences::default(), &host).unwrap();
        assert_eq!(sel.extraction_mode, ExtractionMode::SoftwareOnly);
        assert_eq!(sel.composition_tool, Some(ToolId::Xorriso));
    }

    #[test]
    fn tools_follow_preference_order() {
        let host = FakeHost::new(false, false, &["xorriso", "mkisofs"]);
        let sel = detect(&BackendPreferences::default(), &host).unwrap();
        assert_eq!(sel.composition_tool, Some(ToolId::Mkisofs));
    }

    #[test]
    fn no_extraction_path_is_backend_unavailable() {
        let host = FakeHost::new(false, false, &[]);
        let prefs = BackendPreferences {
            software_fallback: false,
            ..Default::default()
        };
        let err = detect(&prefs, &host).unwrap_err();
        assert_eq!(err.class(), "BackendUnavailable");
    }

    #[test]
    fn forced_privileged_without_root_fails() {
        let host = FakeHost::new(false, true, MOUNT_TOOLS);
        let prefs = BackendPreferences {
            extraction: ExtractionPreference::Privileged,
            ..Default::default()
        };
        assert!(matches!(
            detect(&prefs, &host),
            Err(BuildError::BackendUnavailable { .. })
        ));
    }

    #[test]
    fn forced_missing_tool_fails() {
        let host = FakeHost::new(false, false, &["genisoimage"]);
        let prefs = BackendPreferences {
            composition: CompositionPreference::Tool(ToolId::Xorriso),
            ..Default::default()
        };
        let err = detect(&prefs, &host).unwrap_err();
        assert!(err.to_string().contains("xorriso"));
    }

    #[test]
    fn software_composition_ignores_installed_tools() {
        let host = FakeHost::new(false, false, &["genisoimage"]);
        let prefs = BackendPreferences {
            composition: CompositionPreference::Software,
            extraction: ExtractionPreference::Software,
            software_fallback: true,
        };
        let sel = detect(&prefs, &host).unwrap();
        assert_eq!(sel.composition_tool, None);
        assert_eq!(sel.extraction_mode, ExtractionMode::SoftwareOnly);
    }

    #[test]
    fn preferences_parse() {
        assert_eq!(
            ExtractionPreference::parse("Mount").unwrap(),
            ExtractionPreference::Privileged
        );
        assert_eq!(
            CompositionPreference::parse("genisoimage").unwrap(),
            CompositionPreference::Tool(ToolId::Genisoimage)
        );
        assert!(CompositionPreference::parse("hdiutil").is_err());
    }
}
