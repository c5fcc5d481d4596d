//! cloudkeep Sync - Incremental backup and reconciliation engine
//!
//! Provides:
//! - Exclusion matching against paths relative to a backup root
//! - Streaming, atomic downloads with retry and fallback
//! - A tree walker for Drive-like sources and a flat iterator for
//!   Photos-like sources, both driven by change-detection caches
//! - Reconciliation of local files that disappeared remotely
//!
//! ## Modules
//!
//! - [`engine`] - Run orchestration, one run per account at a time
//! - [`tree`] - Recursive descent over a remote tree
//! - [`flat`] - Single pass over a media library enumeration
//! - [`fetch`] - Streams one remote item to disk
//! - [`reconcile`] - Applies keep / delete / archive to vanished files
//! - [`seen`] - Seen-set builder and its sealed snapshot
//! - [`exclude`] - Compiled exclusion rules
//! - [`mirror`] - Directory-backed remote source
//! - [`storage`] - Local backup usage statistics

pub mod context;
pub mod engine;
pub mod exclude;
pub mod fetch;
pub mod flat;
pub mod mirror;
pub mod progress;
pub mod reconcile;
pub mod retry;
pub mod seen;
pub mod storage;
pub mod tree;

use std::path::PathBuf;

use thiserror::Error;

use cloudkeep_core::ports::SourceError;

pub use engine::{BackupEngine, RunRegistry};
pub use exclude::{is_excluded, ExclusionSet};
pub use fetch::{FetchExecutor, FetchOutcome, FetchResult};
pub use progress::TracingProgressSink;
pub use reconcile::{ReconcileResult, Reconciler};
pub use seen::{SealedSeenSet, SeenSetBuilder};

/// Errors that can occur during a backup run
#[derive(Debug, Error)]
pub enum SyncError {
    /// Another run for the same account is in flight
    #[error("A backup run is already in progress for {0}")]
    AlreadyRunning(String),

    /// The remote source reported an error
    #[error(transparent)]
    Source(#[from] SourceError),

    /// No space left while writing a single item
    #[error("Disk full while writing {0}")]
    DiskFull(PathBuf),

    /// The destination cannot be written; the run must stop
    #[error("Cannot write to {path}: {source}")]
    DiskFatal {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    /// A local file operation failed for one file
    #[error("Local I/O error at {path}: {source}")]
    LocalIo {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    /// Cache or status storage failed
    #[error("Cache error: {0}")]
    Cache(String),

    /// Cancellation was observed
    #[error("Run cancelled")]
    Cancelled,
}

impl SyncError {
    /// Whether the same operation may succeed when retried
    pub fn is_transient(&self) -> bool {
        matches!(self, SyncError::Source(e) if e.is_transient())
    }

    /// Whether the error ends the whole run rather than a single item
    pub fn is_run_fatal(&self) -> bool {
        matches!(
            self,
            SyncError::Source(SourceError::AuthExpired(_)) | SyncError::DiskFatal { .. }
        )
    }

    /// Classify an error raised while writing a local file
    ///
    /// Running out of space fails only the current item, as does any error
    /// tied to one path (a directory where a file should go, a file where a
    /// directory should go, a name the filesystem rejects). A read-only or
    /// failing device makes the whole destination unusable.
    pub fn from_write(path: PathBuf, err: std::io::Error) -> Self {
        match err.raw_os_error() {
            Some(libc::ENOSPC) | Some(libc::EDQUOT) => SyncError::DiskFull(path),
            Some(libc::EROFS) | Some(libc::EIO) => SyncError::DiskFatal { path, source: err },
            _ => SyncError::LocalIo { path, source: err },
        }
    }

    /// Error for a destination root that cannot be created or written
    pub fn destination(path: PathBuf, err: std::io::Error) -> Self {
        SyncError::DiskFatal { path, source: err }
    }
}
