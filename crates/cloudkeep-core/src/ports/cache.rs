//! Change-detection cache ports
//!
//! Two cache flavors share one contract shape: a folder cache keyed by
//! folder identity storing the last seen change tag, and an item cache
//! keyed by media item identity storing the fingerprint, size and local
//! path of the last fetch.
//!
//! ## Design Notes
//!
//! - `get` and `put` operate on in-memory state loaded when the cache is
//!   opened; they never block on storage.
//! - `flush` writes every pending change in one atomic step. Until it
//!   returns, the persisted version is the one from the previous flush.
//! - Entries are not evicted when their folder or item disappears; stale
//!   entries cost only storage.

use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::domain::{AccountKey, ChangeTag, Fingerprint, LibrarySelector, RemoteId};

/// Folder cache entry
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FolderCacheEntry {
    pub change_tag: ChangeTag,
    pub recorded_at: DateTime<Utc>,
}

impl FolderCacheEntry {
    /// Entry recorded now
    pub fn new(change_tag: ChangeTag) -> Self {
        Self {
            change_tag,
            recorded_at: Utc::now(),
        }
    }

    /// Valid iff the stored tag equals the folder's current tag
    pub fn is_valid_for(&self, current: Option<&ChangeTag>) -> bool {
        current == Some(&self.change_tag)
    }
}

/// Item cache entry
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ItemCacheEntry {
    pub fingerprint: Option<Fingerprint>,
    /// Path relative to the library directory, `/`-separated
    pub local_path: String,
    pub size: Option<u64>,
    pub recorded_at: DateTime<Utc>,
}

impl ItemCacheEntry {
    /// Valid iff both fingerprint and size equal the item's current values
    pub fn is_valid_for(&self, fingerprint: Option<&Fingerprint>, size: Option<u64>) -> bool {
        self.fingerprint.as_ref() == fingerprint && self.size == size
    }
}

/// Folder change-tag cache for one account
#[async_trait]
pub trait IFolderCache: Send + Sync {
    fn get(&self, folder_id: &RemoteId) -> Option<FolderCacheEntry>;

    fn put(&self, folder_id: &RemoteId, entry: FolderCacheEntry);

    /// Persist all pending changes atomically
    async fn flush(&self) -> anyhow::Result<()>;
}

/// Fingerprint cache for one media library
#[async_trait]
pub trait IItemCache: Send + Sync {
    fn get(&self, item_id: &RemoteId) -> Option<ItemCacheEntry>;

    fn put(&self, item_id: &RemoteId, entry: ItemCacheEntry);

    /// Persist all pending changes atomically
    async fn flush(&self) -> anyhow::Result<()>;
}

/// Opens the caches a run needs
#[async_trait]
pub trait ICacheStore: Send + Sync {
    /// Folder cache for an account's tree
    async fn folder_cache(&self, account: &AccountKey) -> anyhow::Result<Arc<dyn IFolderCache>>;

    /// Item cache for one of an account's libraries
    async fn item_cache(
        &self,
        account: &AccountKey,
        library: &LibrarySelector,
    ) -> anyhow::Result<Arc<dyn IItemCache>>;
}
