//! Sandbox and cache identifiers.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

use crate::error::{CinderError, CinderResult};

/// A validated sandbox ID.
///
/// Sandbox IDs name directories on disk, so they must:
/// - Be 1-64 characters long
/// - Contain only alphanumeric characters, hyphens, and underscores
/// - Start with an alphanumeric character
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct SandboxId(String);

impl SandboxId {
    /// Maximum length of a sandbox ID.
    pub const MAX_LENGTH: usize = 64;

    /// Create a new sandbox ID, validating the format.
    ///
    /// # Errors
    ///
    /// Returns an error if the ID format is invalid.
    pub fn new(id: impl Into<String>) -> CinderResult<Self> {
        let id = id.into();
        validate_component("sandbox ID", &id, Self::MAX_LENGTH)?;
        Ok(Self(id))
    }

    /// Generate a new random sandbox ID.
    #[must_use]
    pub fn generate() -> Self {
        Self(short_hex())
    }

    /// Get the sandbox ID as a string slice.
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for SandboxId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl FromStr for SandboxId {
    type Err = CinderError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::new(s)
    }
}

impl AsRef<str> for SandboxId {
    fn as_ref(&self) -> &str {
        &self.0
    }
}

/// A fresh cache generation identifier.
///
/// Each process-wide template cache uses one, so files from an earlier
/// generation are never mistaken for current ones.
#[must_use]
pub fn cache_identifier() -> String {
    uuid::Uuid::new_v4().to_string()
}

/// A 12-character hex string derived from a UUID v4.
#[must_use]
pub fn short_hex() -> String {
    let uuid = uuid::Uuid::new_v4();
    hex::encode(&uuid.as_bytes()[..6])
}

/// Validate an identifier that becomes a single path component.
///
/// # Errors
///
/// Returns [`CinderError::Config`] naming `what` if the component is empty,
/// too long, or contains characters outside `[A-Za-z0-9._-]`, or is `.`/`..`.
pub fn validate_component(what: &str, value: &str, max_len: usize) -> CinderResult<()> {
    let invalid = || CinderError::Config {
        message: format!("invalid {what}: {value:?}"),
    };

    if value.is_empty() || value.len() > max_len || value == "." || value == ".." {
        return Err(invalid());
    }

    if !value.starts_with(|c: char| c.is_ascii_alphanumeric()) {
        return Err(invalid());
    }

    if !value
        .chars()
        .all(|c| c.is_ascii_alphanumeric() || matches!(c, '-' | '_' | '.'))
    {
        return Err(invalid());
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn valid_sandbox_ids() {
        assert!(SandboxId::new("abc123").is_ok());
        assert!(SandboxId::new("sbx-1").is_ok());
        assert!(SandboxId::new("sbx_1").is_ok());
        assert!(SandboxId::new("ivqthmy6bs9pmj0xtqv8n-3").is_ok());
    }

    #[test]
    fn invalid_sandbox_ids() {
        assert!(SandboxId::new("").is_err());
        assert!(SandboxId::new("-invalid").is_err());
        assert!(SandboxId::new("../escape").is_err());
        assert!(SandboxId::new("a/b").is_err());
        assert!(SandboxId::new("a".repeat(65)).is_err());
    }

    #[test]
    fn generate_sandbox_id() {
        let id1 = SandboxId::generate();
        let id2 = SandboxId::generate();
        assert_ne!(id1, id2);
        assert_eq!(id1.as_str().len(), 12);
    }

    #[test]
    fn version_components() {
        assert!(validate_component("kernel version", "vmlinux-6.1.102", 128).is_ok());
        assert!(validate_component("kernel version", "..", 128).is_err());
    }

    #[test]
    fn cache_identifiers_differ() {
        assert_ne!(cache_identifier(), cache_identifier());
    }
}
