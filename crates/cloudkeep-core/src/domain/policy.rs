//! Sync policies
//!
//! A sync policy decides what happens to a local file whose remote
//! counterpart has disappeared. Each backup kind carries its own policy.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use super::errors::DomainError;

/// The two kinds of backup a run performs
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BackupKind {
    /// Hierarchical file tree
    Drive,
    /// Flat media library
    Photos,
}

impl BackupKind {
    /// Directory name used under backup and archive roots
    pub fn dir_name(&self) -> &'static str {
        match self {
            BackupKind::Drive => "drive",
            BackupKind::Photos => "photos",
        }
    }

    /// Policy applied when the configuration does not name one
    pub fn default_policy(&self) -> SyncPolicy {
        match self {
            BackupKind::Drive => SyncPolicy::Delete,
            BackupKind::Photos => SyncPolicy::Keep,
        }
    }
}

impl fmt::Display for BackupKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            BackupKind::Drive => write!(f, "Drive"),
            BackupKind::Photos => write!(f, "Photos"),
        }
    }
}

/// What to do with local files that no longer exist remotely
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SyncPolicy {
    /// Leave the local file untouched
    Keep,
    /// Remove the local file
    Delete,
    /// Move the local file to the mirrored path under the archive root
    Archive,
}

impl fmt::Display for SyncPolicy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            SyncPolicy::Keep => "keep",
            SyncPolicy::Delete => "delete",
            SyncPolicy::Archive => "archive",
        };
        write!(f, "{}", s)
    }
}

impl FromStr for SyncPolicy {
    type Err = DomainError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "keep" => Ok(SyncPolicy::Keep),
            "delete" => Ok(SyncPolicy::Delete),
            "archive" => Ok(SyncPolicy::Archive),
            other => Err(DomainError::InvalidPolicy(other.to_string())),
        }
    }
}
