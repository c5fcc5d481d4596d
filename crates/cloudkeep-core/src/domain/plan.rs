//! Resolved backup plan
//!
//! A [`BackupPlan`] is the immutable configuration snapshot a single run
//! executes. It is built from the YAML configuration before the run starts
//! and never changes while the run is in flight.

use std::path::PathBuf;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use super::exclusion::ExclusionRule;
use super::newtypes::AccountKey;
use super::policy::{BackupKind, SyncPolicy};
use super::remote::LibrarySelector;

/// Which top-level Drive folders a run covers
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "mode", content = "entries", rename_all = "snake_case")]
pub enum FolderSelection {
    /// Every top-level folder, resolved at run time
    All,
    /// Top-level folders by name
    Names(Vec<String>),
    /// Slash-separated paths resolved name by name from the drive root
    Paths(Vec<String>),
}

impl Default for FolderSelection {
    fn default() -> Self {
        FolderSelection::All
    }
}

/// Drive part of a plan
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DrivePlan {
    pub folders: FolderSelection,
    pub policy: SyncPolicy,
}

/// Photos part of a plan
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PhotosPlan {
    /// Libraries to back up, in order
    pub libraries: Vec<LibrarySelector>,
    pub policy: SyncPolicy,
}

/// Engine tuning values copied from configuration
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EngineSettings {
    /// Maximum concurrent fetches
    pub fetch_concurrency: usize,
    /// Size of one streamed chunk in bytes
    pub chunk_size: usize,
    /// Retries for transient errors per item
    pub max_retries: u32,
    /// First backoff delay; doubled on every retry
    pub retry_base_delay: Duration,
}

impl Default for EngineSettings {
    fn default() -> Self {
        Self {
            fetch_concurrency: 4,
            chunk_size: 256 * 1024,
            max_retries: 3,
            retry_base_delay: Duration::from_millis(1000),
        }
    }
}

/// Everything one run needs to know
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BackupPlan {
    pub account: AccountKey,
    /// Per-account backup directory
    pub destination: PathBuf,
    /// Per-account archive directory
    pub archive_root: PathBuf,
    pub exclusions: Vec<ExclusionRule>,
    pub drive: Option<DrivePlan>,
    pub photos: Option<PhotosPlan>,
    pub settings: EngineSettings,
    /// Count what would happen without touching disk or caches
    pub dry_run: bool,
}

impl BackupPlan {
    /// Create a plan with both kinds disabled
    pub fn new(account: AccountKey, destination: PathBuf, archive_root: PathBuf) -> Self {
        Self {
            account,
            destination,
            archive_root,
            exclusions: Vec::new(),
            drive: None,
            photos: None,
            settings: EngineSettings::default(),
            dry_run: false,
        }
    }

    /// Local directory mirroring a backup kind
    pub fn kind_dir(&self, kind: BackupKind) -> PathBuf {
        self.destination.join(kind.dir_name())
    }

    /// Archive directory for a backup kind
    pub fn archive_dir(&self, kind: BackupKind) -> PathBuf {
        self.archive_root.join(kind.dir_name())
    }

    /// Local directory a media library is filed into
    pub fn library_dir(&self, library: &LibrarySelector) -> PathBuf {
        self.kind_dir(BackupKind::Photos)
            .join(library_dir_name(library))
    }

    /// Archive directory for a media library
    pub fn library_archive_dir(&self, library: &LibrarySelector) -> PathBuf {
        self.archive_dir(BackupKind::Photos)
            .join(library_dir_name(library))
    }

    /// Whether the plan has anything to do
    pub fn is_empty(&self) -> bool {
        self.drive.is_none() && self.photos.is_none()
    }
}

/// Directory name for a media library under the photos directory
pub fn library_dir_name(library: &LibrarySelector) -> &'static str {
    match library {
        LibrarySelector::Personal => "library",
        LibrarySelector::Shared(_) => "shared-library",
    }
}
