//! Credentials for templated profiles.
//!
//! Values come only from the process environment. Plaintext lives in
//! zeroizing buffers and leaves this module only as a SHA-512 crypt hash
//! (passwords) or a normalized `<type> <base64>` line (ssh key).

use base64::engine::general_purpose::STANDARD;
use base64::Engine as _;
use sha_crypt::{sha512_simple, Sha512Params, ROUNDS_DEFAULT};
use std::collections::{BTreeMap, BTreeSet};
use std::fmt;
use zeroize::Zeroizing;

use crate::error::{BuildError, BuildResult, CredentialViolation};

pub const ENV_USERNAME: &str = "AUTOINSTALL_USERNAME";
pub const ENV_PASSWORD: &str = "AUTOINSTALL_PASSWORD";
pub const ENV_SSH_KEY: &str = "AUTOINSTALL_SSH_KEY";
pub const ENV_ROOT_PASSWORD: &str = "AUTOINSTALL_ROOT_PASSWORD";

pub const MAX_USERNAME_LEN: usize = 32;
pub const MIN_PASSWORD_LEN: usize = 12;

const SSH_KEY_TYPES: &[&str] = &[
    "ssh-rsa",
    "ssh-ed25519",
    "ecdsa-sha2-nistp256",
    "ecdsa-sha2-nistp384",
    "ecdsa-sha2-nistp521",
];

/// One of the four credential variables a placeholder can name.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum CredentialVar {
    Username,
    Password,
    SshKey,
    RootPassword,
}

impl CredentialVar {
    pub const ALL: [CredentialVar; 4] = [
        Self::Username,
        Self::Password,
        Self::SshKey,
        Self::RootPassword,
    ];

    pub fn env_name(self) -> &'static str {
        match self {
            Self::Username => ENV_USERNAME,
            Self::Password => ENV_PASSWORD,
            Self::SshKey => ENV_SSH_KEY,
            Self::RootPassword => ENV_ROOT_PASSWORD,
        }
    }

    pub fn from_env_name(name: &str) -> Option<Self> {
        Self::ALL.into_iter().find(|v| v.env_name() == name)
    }

    /// The placeholder text, `${VAR}`.
    pub fn placeholder(self) -> String {
        format!("${{{}}}", self.env_name())
    }

    /// Parse a whole scalar as a placeholder.
    pub fn from_placeholder(scalar: &str) -> Option<Self> {
        let name = scalar.strip_prefix("${")?.strip_suffix('}')?;
        Self::from_env_name(name)
    }
}

impl fmt::Display for CredentialVar {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.env_name())
    }
}

/// Raw credential values as read from the environment.
#[derive(Default)]
pub struct CredentialSet {
    username: Option<String>,
    password: Option<Zeroizing<String>>,
    ssh_key: Option<Zeroizing<String>>,
    root_password: Option<Zeroizing<String>>,
}

impl fmt::Debug for CredentialSet {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CredentialSet")
            .field("username", &self.username)
            .field("password", &self.password.as_ref().map(|_| "<redacted>"))
            .field("ssh_key", &self.ssh_key.as_ref().map(|_| "<redacted>"))
            .field("root_password", &self.root_password.as_ref().map(|_| "<redacted>"))
            .finish()
    }
}

impl CredentialSet {
    /// Read the four variables from the process environment.
    pub fn from_env() -> Self {
        Self::from_lookup(|name| std::env::var(name).ok())
    }

    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Self {
        Self {
            username: lookup(ENV_USERNAME),
            password: lookup(ENV_PASSWORD).map(Zeroizing::new),
            ssh_key: lookup(ENV_SSH_KEY).map(Zeroizing::new),
            root_password: lookup(ENV_ROOT_PASSWORD).map(Zeroizing::new),
        }
    }

    fn raw(&self, var: CredentialVar) -> Option<&str> {
        match var {
            CredentialVar::Username => self.username.as_deref(),
            CredentialVar::Password => self.password.as_deref().map(String::as_str),
            CredentialVar::SshKey => self.ssh_key.as_deref().map(String::as_str),
            CredentialVar::RootPassword => self.root_password.as_deref().map(String::as_str),
        }
    }

    /// Check every variable in `required`; all violations are collected.
    pub fn validate(&self, required: &BTreeSet<CredentialVar>) -> Vec<CredentialViolation> {
        let mut violations = Vec::new();
        for &var in required {
            let Some(value) = self.raw(var) else {
                violations.push(CredentialViolation::Missing {
                    variable: var.env_name().to_string(),
                });
                continue;
            };
            match var {
                CredentialVar::Username => violations.extend(validate_username(value)),
                CredentialVar::Password => violations.extend(validate_password("password", value)),
                CredentialVar::RootPassword => {
                    violations.extend(validate_password("root password", value))
                }
                CredentialVar::SshKey => {
                    if let Err(v) = normalize_ssh_key(value) {
                        violations.extend(v);
                    }
                }
            }
        }
        violations
    }

    /// Validate then turn each required variable into its persisted form.
    pub fn process(&self, required: &BTreeSet<CredentialVar>) -> BuildResult<ProcessedCredentials> {
        let violations = self.validate(required);
        if !violations.is_empty() {
            return Err(BuildError::CredentialValidationFailure { violations });
        }

        let mut values = BTreeMap::new();
        for &var in required {
            let Some(raw) = self.raw(var) else { continue };
            let processed = match var {
                CredentialVar::Username => raw.to_string(),
                CredentialVar::Password | CredentialVar::RootPassword => hash_password(raw)?,
                CredentialVar::SshKey => normalize_ssh_key(raw)
                    .map_err(|violations| BuildError::CredentialValidationFailure { violations })?,
            };
            values.insert(var, processed);
        }
        Ok(ProcessedCredentials { values })
    }

    /// Plaintext that must never reach a persisted file, with a label.
    pub(crate) fn secrets(&self) -> Vec<(&'static str, &str)> {
        let mut out = Vec::new();
        if let Some(p) = self.raw(CredentialVar::Password) {
            out.push(("password", p));
        }
        if let Some(p) = self.raw(CredentialVar::RootPassword) {
            out.push(("root password", p));
        }
        if let Some(key) = self.raw(CredentialVar::SshKey) {
            let raw = key.trim();
            // The normalized form is a prefix of a commented key, so only the
            // full input counts as a leak.
            if normalize_ssh_key(raw).is_ok_and(|n| n != raw) {
                out.push(("ssh key", raw));
            }
        }
        out
    }
}

/// Values ready to be written into the overlay.
#[derive(Debug, Default)]
pub struct ProcessedCredentials {
    values: BTreeMap<CredentialVar, String>,
}

impl ProcessedCredentials {
    pub fn get(&self, var: CredentialVar) -> Option<&str> {
        self.values.get(&var).map(String::as_str)
    }
}

pub fn validate_username(name: &str) -> Vec<CredentialViolation> {
    let mut violations = Vec::new();
    if !name.starts_with(|c: char| c.is_ascii_lowercase()) {
        violations.push(CredentialViolation::UsernameStart);
    }
    if !name
        .chars()
        .all(|c| c.is_ascii_lowercase() || c.is_ascii_digit() || c == '_' || c == '-')
    {
        violations.push(CredentialViolation::UsernameCharacters);
    }
    let len = name.chars().count();
    if len > MAX_USERNAME_LEN {
        violations.push(CredentialViolation::UsernameTooLong {
            len,
            max: MAX_USERNAME_LEN,
        });
    }
    violations
}

pub fn validate_password(field: &'static str, password: &str) -> Vec<CredentialViolation> {
    if password.trim().is_empty() {
        return vec![CredentialViolation::PasswordBlank { field }];
    }
    let mut violations = Vec::new();
    let len = password.chars().count();
    if len < MIN_PASSWORD_LEN {
        violations.push(CredentialViolation::PasswordTooShort {
            field,
            len,
            min: MIN_PASSWORD_LEN,
        });
    }
    if !password.chars().any(|c| c.is_uppercase()) {
        violations.push(CredentialViolation::PasswordNoUppercase { field });
    }
    if !password.chars().any(|c| c.is_lowercase()) {
        violations.push(CredentialViolation::PasswordNoLowercase { field });
    }
    if !password.chars().any(|c| c.is_ascii_digit()) {
        violations.push(CredentialViolation::PasswordNoDigit { field });
    }
    if !password
        .chars()
        .any(|c| !c.is_alphanumeric() && !c.is_whitespace())
    {
        violations.push(CredentialViolation::PasswordNoSymbol { field });
    }
    violations
}

/// `<type> <base64> [comment]` to `<type> <base64>`.
///
/// The material must decode and name the same key type in its first field.
pub fn normalize_ssh_key(raw: &str) -> Result<String, Vec<CredentialViolation>> {
    let mut parts = raw.split_whitespace();
    let key_type = parts.next().unwrap_or_default();
    if !SSH_KEY_TYPES.contains(&key_type) {
        return Err(vec![CredentialViolation::SshKeyType {
            found: key_type.to_string(),
        }]);
    }
    let material = parts.next().unwrap_or_default();
    let decoded = STANDARD
        .decode(material)
        .map_err(|_| vec![CredentialViolation::SshKeyMaterial])?;
    if embedded_key_type(&decoded) != Some(key_type.as_bytes()) {
        return Err(vec![CredentialViolation::SshKeyMaterial]);
    }
    Ok(format!("{key_type} {material}"))
}

/// First length-prefixed string of an ssh wire-format public key.
fn embedded_key_type(blob: &[u8]) -> Option<&[u8]> {
    let len = u32::from_be_bytes(blob.get(..4)?.try_into().ok()?) as usize;
    blob.get(4..4 + len)
}

/// SHA-512 crypt (`$6$`) with a random salt.
pub fn hash_password(password: &str) -> BuildResult<String> {
    let failure = |reason: String| BuildError::CredentialValidationFailure {
        violations: vec![CredentialViolation::HashFailure { reason }],
    };
    let params = Sha512Params::new(ROUNDS_DEFAULT).map_err(|e| failure(format!("{e:?}")))?;
    sha512_simple(password, &params).map_err(|e| failure(format!("{e:?}")))
}
