//! Run report
//!
//! The outcome of a run as written back to the status store and shown to
//! users: timestamps, terminal status, per-kind counters and the list of
//! items that could not be backed up.

use std::fmt;

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};

use super::newtypes::{AccountKey, RunId};
use super::policy::BackupKind;

/// Terminal status of a run
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RunStatus {
    /// Everything backed up
    Success,
    /// Completed, but some items failed or were skipped
    SuccessWithWarnings,
    /// Aborted by an authentication or fatal disk error
    Error,
    /// Stopped by the user
    Cancelled,
}

impl RunStatus {
    /// Whether the run reached its end
    pub fn is_success(&self) -> bool {
        matches!(self, RunStatus::Success | RunStatus::SuccessWithWarnings)
    }
}

impl fmt::Display for RunStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            RunStatus::Success => "success",
            RunStatus::SuccessWithWarnings => "success_with_warnings",
            RunStatus::Error => "error",
            RunStatus::Cancelled => "cancelled",
        };
        write!(f, "{}", s)
    }
}

/// Counters for one backup kind
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct KindStats {
    /// Items that reached a terminal outcome, including unchanged ones
    pub processed: u64,
    /// Items downloaded (or copied from a duplicate)
    pub fetched: u64,
    /// Items left out: no filename, or download fallbacks exhausted
    pub skipped: u64,
    /// Items whose download failed
    pub failed: u64,
    /// Local files deleted by reconciliation
    pub removed: u64,
    /// Local files moved to the archive by reconciliation
    pub archived: u64,
    /// Bytes downloaded
    pub bytes: u64,
}

impl KindStats {
    /// Add another set of counters to this one
    pub fn merge(&mut self, other: &KindStats) {
        self.processed += other.processed;
        self.fetched += other.fetched;
        self.skipped += other.skipped;
        self.failed += other.failed;
        self.removed += other.removed;
        self.archived += other.archived;
        self.bytes += other.bytes;
    }
}

/// An item that could not be backed up
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ItemFailure {
    pub kind: BackupKind,
    /// Path relative to the kind's backup directory
    pub path: String,
    pub reason: String,
}

/// Outcome of one run
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RunReport {
    pub run_id: RunId,
    pub account: AccountKey,
    pub started_at: DateTime<Utc>,
    pub finished_at: Option<DateTime<Utc>>,
    pub status: RunStatus,
    /// Human-readable summary
    pub message: String,
    /// Drive counters, when the Drive backup was enabled
    pub drive: Option<KindStats>,
    /// Photos counters, when the Photos backup was enabled
    pub photos: Option<KindStats>,
    /// Shared folders that were not traversed
    pub skipped_shared: Vec<String>,
    pub failures: Vec<ItemFailure>,
    pub dry_run: bool,
}

impl RunReport {
    /// Start a report for a run beginning now
    pub fn start(run_id: RunId, account: AccountKey, dry_run: bool) -> Self {
        Self {
            run_id,
            account,
            started_at: Utc::now(),
            finished_at: None,
            status: RunStatus::Success,
            message: String::new(),
            drive: None,
            photos: None,
            skipped_shared: Vec::new(),
            failures: Vec::new(),
            dry_run,
        }
    }

    /// Counters for a kind, creating them on first use
    pub fn stats_mut(&mut self, kind: BackupKind) -> &mut KindStats {
        let slot = match kind {
            BackupKind::Drive => &mut self.drive,
            BackupKind::Photos => &mut self.photos,
        };
        slot.get_or_insert_with(KindStats::default)
    }

    /// Total bytes downloaded across kinds
    pub fn total_bytes(&self) -> u64 {
        self.drive.map_or(0, |s| s.bytes) + self.photos.map_or(0, |s| s.bytes)
    }

    /// Wall-clock duration, once finished
    pub fn duration(&self) -> Option<Duration> {
        self.finished_at.map(|end| end - self.started_at)
    }

    /// Close the report
    ///
    /// `fatal` carries the reason for an aborted run. Otherwise the status
    /// is derived from the failure list and the cancellation flag.
    pub fn finish(&mut self, cancelled: bool, fatal: Option<String>) {
        self.finished_at = Some(Utc::now());
        self.status = if let Some(reason) = &fatal {
            self.message = reason.clone();
            RunStatus::Error
        } else if cancelled {
            RunStatus::Cancelled
        } else if self.failures.is_empty() {
            RunStatus::Success
        } else {
            RunStatus::SuccessWithWarnings
        };

        if fatal.is_some() {
            let summary = self.summary();
            if !summary.is_empty() {
                self.message = format!("{} ({summary})", self.message);
            }
        } else if cancelled {
            let summary = self.summary();
            self.message = if summary.is_empty() {
                "Cancelled by user".to_string()
            } else {
                format!("Cancelled by user. {summary}")
            };
        } else {
            let summary = self.summary();
            self.message = if summary.is_empty() {
                "Nothing to back up.".to_string()
            } else {
                summary
            };
        }
    }

    /// Per-kind counters formatted as one line
    pub fn summary(&self) -> String {
        let mut parts = Vec::new();
        for (kind, stats) in [(BackupKind::Drive, self.drive), (BackupKind::Photos, self.photos)] {
            if let Some(s) = stats {
                parts.push(format!(
                    "{kind}: {} fetched, {} removed, {} archived, {} skipped, {} failed",
                    s.fetched, s.removed, s.archived, s.skipped, s.failed
                ));
            }
        }
        parts.join(" | ")
    }
}
