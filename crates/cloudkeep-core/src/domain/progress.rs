//! Run progress
//!
//! Progress is ephemeral: a [`RunProgress`] value is rebuilt for every run
//! by folding [`ProgressEvent`]s into it, and observers only ever see the
//! latest value.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::policy::BackupKind;

/// Stage of a run
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Phase {
    Preparing,
    Drive,
    Photos,
    Finishing,
    Done,
}

/// What happened to a single remote item
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ItemAction {
    /// Downloaded to disk
    Fetched { bytes: u64 },
    /// Copied from another local file with the same fingerprint
    Deduplicated,
    /// Local copy already current
    Unchanged,
    /// Would be fetched, but the run is a dry run
    WouldFetch,
    /// Not fetched after exhausting fallbacks
    Skipped { reason: String },
    /// Failed permanently
    Failed { reason: String },
}

/// One progress notification
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum ProgressEvent {
    PhaseStarted {
        phase: Phase,
    },
    ScopeStarted {
        kind: BackupKind,
        scope: String,
    },
    ItemFinished {
        kind: BackupKind,
        path: String,
        action: ItemAction,
    },
    Reconciled {
        kind: BackupKind,
        scope: String,
        removed: u64,
        archived: u64,
    },
    SkippedShared {
        path: String,
    },
    CancelRequested,
    Warning {
        message: String,
    },
}

/// Latest known state of a run, as shown to polling observers
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RunProgress {
    pub phase: Phase,
    /// Folder or library currently being processed
    pub scope: Option<String>,
    /// Last item that reached a terminal outcome
    pub current_item: Option<String>,
    /// Items that reached a terminal outcome so far
    pub processed: u64,
    pub drive_bytes: u64,
    pub photos_bytes: u64,
    pub started_at: DateTime<Utc>,
    pub cancel_requested: bool,
}

impl RunProgress {
    /// Fresh progress for a run starting at `started_at`
    pub fn new(started_at: DateTime<Utc>) -> Self {
        Self {
            phase: Phase::Preparing,
            scope: None,
            current_item: None,
            processed: 0,
            drive_bytes: 0,
            photos_bytes: 0,
            started_at,
            cancel_requested: false,
        }
    }

    /// Fold one event into the progress state
    pub fn apply(&mut self, event: &ProgressEvent) {
        match event {
            ProgressEvent::PhaseStarted { phase } => {
                self.phase = *phase;
                self.scope = None;
            }
            ProgressEvent::ScopeStarted { scope, .. } => {
                self.scope = Some(scope.clone());
            }
            ProgressEvent::ItemFinished { kind, path, action } => {
                self.processed += 1;
                self.current_item = Some(path.clone());
                if let ItemAction::Fetched { bytes } = action {
                    match kind {
                        BackupKind::Drive => self.drive_bytes += bytes,
                        BackupKind::Photos => self.photos_bytes += bytes,
                    }
                }
            }
            ProgressEvent::CancelRequested => self.cancel_requested = true,
            ProgressEvent::Reconciled { .. }
            | ProgressEvent::SkippedShared { .. }
            | ProgressEvent::Warning { .. } => {}
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn apply_counts_items_and_bytes() {
        let mut progress = RunProgress::new(Utc::now());
        progress.apply(&ProgressEvent::PhaseStarted {
            phase: Phase::Drive,
        });
        progress.apply(&ProgressEvent::ItemFinished {
            kind: BackupKind::Drive,
            path: "Docs/a.txt".into(),
            action: ItemAction::Fetched { bytes: 10 },
        });
        progress.apply(&ProgressEvent::ItemFinished {
            kind: BackupKind::Photos,
            path: "2024/01/01/b.jpg".into(),
            action: ItemAction::Unchanged,
        });

        assert_eq!(progress.phase, Phase::Drive);
        assert_eq!(progress.processed, 2);
        assert_eq!(progress.drive_bytes, 10);
        assert_eq!(progress.photos_bytes, 0);
        assert_eq!(progress.current_item.as_deref(), Some("2024/01/01/b.jpg"));
    }

    #[test]
    fn cancel_flag_is_sticky() {
        let mut progress = RunProgress::new(Utc::now());
        progress.apply(&ProgressEvent::CancelRequested);
        progress.apply(&ProgressEvent::PhaseStarted {
            phase: Phase::Finishing,
        });
        assert!(progress.cancel_requested);
    }
}
