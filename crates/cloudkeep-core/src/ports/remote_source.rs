//! Remote source ports (driving the backup)
//!
//! The remote client owns authentication, multi-factor challenges and
//! session persistence. The engine only lists, resolves and downloads.
//!
//! ## Design Notes
//!
//! - Unlike the storage ports, these traits return a typed [`SourceError`]
//!   so the engine can decide between retrying, falling back, skipping and
//!   aborting without inspecting error strings.
//! - Downloads are exposed as `AsyncRead` streams; the engine decides the
//!   chunk size and where the bytes land.
//! - `enumerate_items` is single-pass. Restarting it re-enumerates from
//!   the beginning.

use async_trait::async_trait;
use futures_util::stream::BoxStream;
use thiserror::Error;
use tokio::io::AsyncRead;

use crate::domain::{LibrarySelector, RemoteId, RemoteItem, RemoteNode};

/// Byte stream of a remote file or media item
pub type RemoteReader = Box<dyn AsyncRead + Send + Unpin>;

/// Lazy, single-pass enumeration of a media library
pub type ItemStream = BoxStream<'static, Result<RemoteItem, SourceError>>;

/// Errors reported by a remote source
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum SourceError {
    /// Network hiccup, timeout, rate limit or server error; worth retrying
    #[error("Transient remote error: {0}")]
    Transient(String),

    /// The node or item does not exist under the given identity
    #[error("Remote item not found: {0}")]
    NotFound(String),

    /// The session is no longer valid; the user must re-authenticate
    #[error("Authentication expired: {0}")]
    AuthExpired(String),

    /// Any other permanent failure
    #[error("Remote error: {0}")]
    Other(String),
}

impl SourceError {
    /// Whether retrying the same request may succeed
    pub fn is_transient(&self) -> bool {
        matches!(self, SourceError::Transient(_))
    }
}

/// Port for a hierarchical remote file tree
#[async_trait]
pub trait ITreeSource: Send + Sync {
    /// Identity of the top-level folder
    async fn root_id(&self) -> Result<RemoteId, SourceError>;

    /// Direct children of a folder
    async fn list_children(&self, node_id: &RemoteId) -> Result<Vec<RemoteNode>, SourceError>;

    /// Fresh metadata for a single node
    async fn get_node(&self, node_id: &RemoteId) -> Result<RemoteNode, SourceError>;

    /// Open a download stream
    ///
    /// # Arguments
    ///
    /// * `node_id` - Identity of the file node
    /// * `alt_id` - Alternate download key to use instead of the primary id
    async fn open_stream(
        &self,
        node_id: &RemoteId,
        alt_id: Option<&str>,
    ) -> Result<RemoteReader, SourceError>;
}

/// Port for a flat remote media library
#[async_trait]
pub trait IMediaLibrary: Send + Sync {
    /// Whether the library exists for this account
    async fn has_library(&self, library: &LibrarySelector) -> Result<bool, SourceError>;

    /// Enumerate every item of a library
    async fn enumerate_items(&self, library: &LibrarySelector) -> Result<ItemStream, SourceError>;

    /// Open a download stream for an item's original
    async fn open_item(&self, item: &RemoteItem) -> Result<RemoteReader, SourceError>;
}
