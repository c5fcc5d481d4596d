//! Domain newtypes with validation
//!
//! Strongly-typed wrappers for the identifiers and version markers that
//! flow between the remote source, the caches and the engine. Each newtype
//! rejects empty values at construction time.

use std::fmt::{self, Display, Formatter};
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use uuid::Uuid;

use super::errors::DomainError;

// ============================================================================
// Opaque string markers
// ============================================================================

macro_rules! opaque_string {
    ($(#[$meta:meta])* $name:ident, $what:literal) => {
        $(#[$meta])*
        #[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
        #[serde(try_from = "String", into = "String")]
        pub struct $name(String);

        impl $name {
            #[doc = concat!("Create a new ", stringify!($name))]
            ///
            /// # Errors
            /// Returns an error if the value is empty or only whitespace
            pub fn new(value: impl Into<String>) -> Result<Self, DomainError> {
                let value = value.into();
                if value.trim().is_empty() {
                    return Err(DomainError::InvalidId(format!("{} cannot be empty", $what)));
                }
                Ok(Self(value))
            }

            /// Get the inner string reference
            #[must_use]
            pub fn as_str(&self) -> &str {
                &self.0
            }
        }

        impl Display for $name {
            fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
                f.write_str(&self.0)
            }
        }

        impl FromStr for $name {
            type Err = DomainError;

            fn from_str(s: &str) -> Result<Self, Self::Err> {
                Self::new(s)
            }
        }

        impl TryFrom<String> for $name {
            type Error = DomainError;

            fn try_from(s: String) -> Result<Self, Self::Error> {
                Self::new(s)
            }
        }

        impl From<$name> for String {
            fn from(v: $name) -> Self {
                v.0
            }
        }
    };
}

opaque_string!(
    /// Opaque identity of a remote folder, file or media item
    ///
    /// Stable across runs; the engine never interprets its contents.
    RemoteId,
    "Remote ID"
);

opaque_string!(
    /// Version marker of a remote folder listing (etag-like)
    ///
    /// Equal tags mean the folder's direct children are unchanged.
    ChangeTag,
    "Change tag"
);

opaque_string!(
    /// Content-identity marker of a remote media item
    ///
    /// Two items with equal fingerprints are content-identical.
    Fingerprint,
    "Fingerprint"
);

// ============================================================================
// AccountKey
// ============================================================================

/// Identity of a configured remote account (usually the login e-mail)
///
/// One backup run may be active per account at any time. The key also
/// derives the default per-account directory name under the backup root.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct AccountKey(String);

impl AccountKey {
    /// Create a new AccountKey
    ///
    /// # Errors
    /// Returns error if the key is empty or contains a path separator
    pub fn new(key: impl Into<String>) -> Result<Self, DomainError> {
        let key = key.into();
        if key.trim().is_empty() {
            return Err(DomainError::InvalidId(
                "Account key cannot be empty".to_string(),
            ));
        }
        if key.contains('/') || key.contains('\\') {
            return Err(DomainError::InvalidId(format!(
                "Account key must not contain path separators: {key}"
            )));
        }
        Ok(Self(key))
    }

    /// Get the inner string reference
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Filesystem-safe directory name for this account
    ///
    /// `jane.doe@example.com` becomes `jane_doe_at_example_com`.
    #[must_use]
    pub fn destination_key(&self) -> String {
        self.0.replace('@', "_at_").replace('.', "_")
    }
}

impl Display for AccountKey {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl FromStr for AccountKey {
    type Err = DomainError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::new(s)
    }
}

impl TryFrom<String> for AccountKey {
    type Error = DomainError;

    fn try_from(s: String) -> Result<Self, Self::Error> {
        Self::new(s)
    }
}

impl From<AccountKey> for String {
    fn from(key: AccountKey) -> Self {
        key.0
    }
}

// ============================================================================
// RunId
// ============================================================================

/// Identifier for a single backup run
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct RunId(Uuid);

impl RunId {
    /// Create a new random RunId
    #[must_use]
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }

    /// Get the inner UUID value
    #[must_use]
    pub const fn as_uuid(&self) -> &Uuid {
        &self.0
    }
}

impl Default for RunId {
    fn default() -> Self {
        Self::new()
    }
}

impl Display for RunId {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl FromStr for RunId {
    type Err = DomainError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Uuid::parse_str(s)
            .map(Self)
            .map_err(|e| DomainError::InvalidId(format!("Invalid RunId: {e}")))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_remote_id_rejects_empty() {
        assert!(RemoteId::new("").is_err());
        assert!(RemoteId::new("   ").is_err());
        assert_eq!(RemoteId::new("FOLDER::abc").unwrap().as_str(), "FOLDER::abc");
    }

    #[test]
    fn test_change_tag_equality() {
        let a = ChangeTag::new("42").unwrap();
        let b: ChangeTag = "42".parse().unwrap();
        assert_eq!(a, b);
        assert_ne!(a, ChangeTag::new("43").unwrap());
    }

    #[test]
    fn test_fingerprint_serde_roundtrip() {
        let fp = Fingerprint::new("AXk3").unwrap();
        let json = serde_json::to_string(&fp).unwrap();
        assert_eq!(json, "\"AXk3\"");
        let back: Fingerprint = serde_json::from_str(&json).unwrap();
        assert_eq!(fp, back);
        assert!(serde_json::from_str::<Fingerprint>("\"\"").is_err());
    }

    #[test]
    fn test_account_destination_key() {
        let key = AccountKey::new("jane.doe@example.com").unwrap();
        assert_eq!(key.destination_key(), "jane_doe_at_example_com");
    }

    #[test]
    fn test_account_key_rejects_separators() {
        assert!(AccountKey::new("a/b").is_err());
        assert!(AccountKey::new("").is_err());
    }

    #[test]
    fn test_run_id_parse() {
        let id = RunId::new();
        let parsed: RunId = id.to_string().parse().unwrap();
        assert_eq!(id, parsed);
        assert!("nope".parse::<RunId>().is_err());
    }
}
