//! Fatal error classes of the image build pipeline.
//!
//! Every variant renders with its class name as a prefix so the failing
//! stage is unambiguous from stderr alone. Helpers inside a stage work with
//! `anyhow::Result` and are folded into the stage's class at the boundary
//! (see [`BuildError::extraction`] and friends).

use std::fmt;
use std::path::{Path, PathBuf};

/// Result alias for pipeline stages.
pub type BuildResult<T> = std::result::Result<T, BuildError>;

/// A fatal pipeline error. All variants terminate the run after teardown.
#[derive(Debug, thiserror::Error)]
pub enum BuildError {
    #[error(
        "VersionNotFound: Ubuntu {version} is not published on {}; known-good versions: {}",
        .tried.join(", "),
        .known.join(", ")
    )]
    VersionNotFound {
        version: String,
        tried: Vec<String>,
        known: Vec<String>,
    },

    #[error("DownloadFailure: {url} failed after {attempts} attempt(s): {reason}")]
    DownloadFailure {
        url: String,
        attempts: u32,
        reason: String,
    },

    #[error(
        "ChecksumMismatch: {} expected sha256 {expected}, got {actual}",
        .file.display()
    )]
    ChecksumMismatch {
        file: PathBuf,
        expected: String,
        actual: String,
    },

    #[error("BackendUnavailable: {reason}")]
    BackendUnavailable { reason: String },

    #[error("ValidationFailure: {}: {reason}", .path.display())]
    ValidationFailure { path: PathBuf, reason: String },

    #[error("CredentialValidationFailure: {}", join_violations(.violations))]
    CredentialValidationFailure { violations: Vec<CredentialViolation> },

    #[error("ExtractionFailure: {}: {reason}", .image.display())]
    ExtractionFailure { image: PathBuf, reason: String },

    #[error("CompositionFailure: {}: {reason}", .output.display())]
    CompositionFailure { output: PathBuf, reason: String },

    #[error("ConfigError: {reason}")]
    Config { reason: String },

    #[error("Cancelled: interrupted before the build completed")]
    Cancelled,
}

impl BuildError {
    /// Short class name, identical to the message prefix.
    pub fn class(&self) -> &'static str {
        match self {
            Self::VersionNotFound { .. } => "VersionNotFound",
            Self::DownloadFailure { .. } => "DownloadFailure",
            Self::ChecksumMismatch { .. } => "ChecksumMismatch",
            Self::BackendUnavailable { .. } => "BackendUnavailable",
            Self::ValidationFailure { .. } => "ValidationFailure",
            Self::CredentialValidationFailure { .. } => "CredentialValidationFailure",
            Self::ExtractionFailure { .. } => "ExtractionFailure",
            Self::CompositionFailure { .. } => "CompositionFailure",
            Self::Config { .. } => "ConfigError",
            Self::Cancelled => "Cancelled",
        }
    }

    pub(crate) fn validation(path: &Path, reason: impl fmt::Display) -> Self {
        Self::ValidationFailure {
            path: path.to_path_buf(),
            reason: reason.to_string(),
        }
    }

    /// Fold a helper error into `ExtractionFailure`, keeping `Cancelled`.
    pub(crate) fn extraction(image: &Path, err: anyhow::Error) -> Self {
        match err.downcast::<BuildError>() {
            Ok(inner) => inner,
            Err(err) => Self::ExtractionFailure {
                image: image.to_path_buf(),
                reason: format!("{err:#}"),
            },
        }
    }

    /// Fold a helper error into `CompositionFailure`, keeping `Cancelled`.
    pub(crate) fn composition(output: &Path, err: anyhow::Error) -> Self {
        match err.downcast::<BuildError>() {
            Ok(inner) => inner,
            Err(err) => Self::CompositionFailure {
                output: output.to_path_buf(),
                reason: format!("{err:#}"),
            },
        }
    }
}

/// One violated credential rule. Several can be reported at once.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum CredentialViolation {
    #[error("{variable} is referenced by the overlay but not set")]
    Missing { variable: String },

    #[error("username must start with a lowercase letter")]
    UsernameStart,

    #[error("username may only contain lowercase letters, digits, '_' and '-'")]
    UsernameCharacters,

    #[error("username must be at most {max} characters (got {len})")]
    UsernameTooLong { len: usize, max: usize },

    #[error("{field} must not be blank")]
    PasswordBlank { field: &'static str },

    #[error("{field} must be at least {min} characters (got {len})")]
    PasswordTooShort {
        field: &'static str,
        len: usize,
        min: usize,
    },

    #[error("{field} must contain an uppercase letter")]
    PasswordNoUppercase { field: &'static str },

    #[error("{field} must contain a lowercase letter")]
    PasswordNoLowercase { field: &'static str },

    #[error("{field} must contain a digit")]
    PasswordNoDigit { field: &'static str },

    #[error("{field} must contain a symbol")]
    PasswordNoSymbol { field: &'static str },

    #[error("ssh key type '{found}' is not one of ssh-rsa, ssh-ed25519, ecdsa-sha2-nistp*")]
    SshKeyType { found: String },

    #[error("ssh key material is not valid base64")]
    SshKeyMaterial,

    #[error("plaintext {field} would be written into the overlay")]
    PlaintextLeak { field: &'static str },

    #[error("password hashing failed: {reason}")]
    HashFailure { reason: String },
}

fn join_violations(violations: &[CredentialViolation]) -> String {
    violations
        .iter()
        .map(ToString::to_string)
        .collect::<Vec<_>>()
        .join("; ")
}
