//! Thin builder around `std::process::Command` for host tools.
//!
//! Captures stdout/stderr and turns a non-zero exit into an error carrying
//! the caller's message plus the tool's stderr.

use anyhow::{bail, Context, Result};
use std::ffi::{OsStr, OsString};
use std::path::Path;
use std::process::{Command, ExitStatus};

/// Captured result of a finished command.
#[derive(Debug)]
pub struct CmdResult {
    pub status: ExitStatus,
    pub stdout: String,
    pub stderr: String,
}

impl CmdResult {
    pub fn success(&self) -> bool {
        self.status.success()
    }
}

/// Command builder.
///
/// ```rust,ignore
/// Cmd::new("umount")
///     .arg_path(mount_point)
///     .error_msg("umount failed")
///     .run()?;
/// ```
#[derive(Debug)]
pub struct Cmd {
    program: OsString,
    args: Vec<OsString>,
    error_msg: Option<String>,
    allow_fail: bool,
}

impl Cmd {
    pub fn new(program: impl AsRef<OsStr>) -> Self {
        Self {
            program: program.as_ref().to_os_string(),
            args: Vec::new(),
            error_msg: None,
            allow_fail: false,
        }
    }

    pub fn arg(mut self, arg: impl AsRef<OsStr>) -> Self {
        self.args.push(arg.as_ref().to_os_string());
        self
    }

    pub fn args<I, S>(mut self, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: AsRef<OsStr>,
    {
        self.args
            .extend(args.into_iter().map(|a| a.as_ref().to_os_string()));
        self
    }

    pub fn arg_path(self, path: &Path) -> Self {
        self.arg(path.as_os_str())
    }

    /// Message used when the command exits non-zero.
    pub fn error_msg(mut self, msg: impl Into<String>) -> Self {
        self.error_msg = Some(msg.into());
        self
    }

    /// Return the result even when the exit status is non-zero.
    pub fn allow_fail(mut self) -> Self {
        self.allow_fail = true;
        self
    }

    /// Rendered command line, for logs.
    pub fn display(&self) -> String {
        std::iter::once(&self.program)
            .chain(self.args.iter())
            .map(|s| s.to_string_lossy().into_owned())
            .collect::<Vec<_>>()
            .join(" ")
    }

    pub fn run(self) -> Result<CmdResult> {
        log::debug!("running: {}", self.display());
        let output = Command::new(&self.program)
            .args(&self.args)
            .output()
            .with_context(|| format!("failed to spawn {}", self.program.to_string_lossy()))?;

        let result = CmdResult {
            status: output.status,
            stdout: String::from_utf8_lossy(&output.stdout).into_owned(),
            stderr: String::from_utf8_lossy(&output.stderr).into_owned(),
        };

        if !result.success() && !self.allow_fail {
            let msg = self.error_msg.unwrap_or_else(|| {
                format!("{} exited with {}", self.program.to_string_lossy(), result.status)
            });
            bail!("{}\n{}", msg, result.stderr.trim());
        }

        Ok(result)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_run_captures_stdout() {
        let result = Cmd::new("echo").arg("hello").run().unwrap();
        assert!(result.success());
        assert_eq!(result.stdout.trim(), "hello");
    }

    #[test]
    fn test_failure_carries_message() {
        let err = Cmd::new("sh")
            .args(["-c", "echo boom >&2; exit 3"])
            .error_msg("shell step failed")
            .run()
            .unwrap_err();
        let msg = format!("{err:#}");
        assert!(msg.contains("shell step failed"));
        assert!(msg.contains("boom"));
    }

    #[test]
    fn test_allow_fail_returns_status() {
        let result = Cmd::new("sh").args(["-c", "exit 2"]).allow_fail().run().unwrap();
        assert!(!result.success());
    }
}
