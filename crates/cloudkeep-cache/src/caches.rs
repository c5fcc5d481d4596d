//! SQLite implementations of the change-detection cache ports
//!
//! Both caches follow the same lifecycle:
//!
//! 1. `load` reads every row of the account or library into memory.
//! 2. `get`/`put` work on the in-memory map; `put` marks the key dirty.
//! 3. `flush` upserts all dirty keys inside one transaction.
//!
//! ## Type Mapping
//!
//! | Domain Type    | SQL Type | Strategy                                 |
//! |----------------|----------|------------------------------------------|
//! | RemoteId       | TEXT     | `.as_str()` / `RemoteId::new()`           |
//! | ChangeTag      | TEXT     | `.as_str()` / `ChangeTag::new()`          |
//! | Fingerprint    | TEXT     | `.as_str()` / `Fingerprint::new()`, NULL |
//! | u64 size       | INTEGER  | `i64` conversion, NULL when unknown      |
//! | DateTime<Utc>  | TEXT     | RFC 3339                                 |
//!
//! Rows that fail to decode are skipped with a warning: a missing entry
//! only costs a re-check, never correctness.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use dashmap::{DashMap, DashSet};
use sqlx::sqlite::SqliteRow;
use sqlx::{Row, SqlitePool};
use tracing::{debug, warn};

use cloudkeep_core::domain::{ChangeTag, Fingerprint, RemoteId};
use cloudkeep_core::ports::{FolderCacheEntry, IFolderCache, IItemCache, ItemCacheEntry};

use crate::CacheError;

// ============================================================================
// Helper functions for type conversion
// ============================================================================

fn parse_timestamp(raw: &str) -> Result<DateTime<Utc>, CacheError> {
    DateTime::parse_from_rfc3339(raw)
        .map(|dt| dt.with_timezone(&Utc))
        .map_err(|e| CacheError::CorruptRow(format!("Invalid timestamp '{raw}': {e}")))
}

fn size_to_sql(size: Option<u64>) -> Option<i64> {
    size.map(|s| i64::try_from(s).unwrap_or(i64::MAX))
}

fn size_from_sql(size: Option<i64>) -> Option<u64> {
    size.and_then(|s| u64::try_from(s).ok())
}

fn folder_from_row(row: &SqliteRow) -> Result<(RemoteId, FolderCacheEntry), CacheError> {
    let id: String = row.try_get("folder_id")?;
    let tag: String = row.try_get("change_tag")?;
    let recorded_at: String = row.try_get("recorded_at")?;

    let id = RemoteId::new(id).map_err(|e| CacheError::CorruptRow(e.to_string()))?;
    let change_tag =
        ChangeTag::new(tag).map_err(|e| CacheError::CorruptRow(e.to_string()))?;

    Ok((
        id,
        FolderCacheEntry {
            change_tag,
            recorded_at: parse_timestamp(&recorded_at)?,
        },
    ))
}

fn item_from_row(row: &SqliteRow) -> Result<(RemoteId, ItemCacheEntry), CacheError> {
    let id: String = row.try_get("item_id")?;
    let fingerprint: Option<String> = row.try_get("fingerprint")?;
    let local_path: String = row.try_get("local_path")?;
    let size: Option<i64> = row.try_get("size")?;
    let recorded_at: String = row.try_get("recorded_at")?;

    let id = RemoteId::new(id).map_err(|e| CacheError::CorruptRow(e.to_string()))?;
    let fingerprint = fingerprint
        .map(Fingerprint::new)
        .transpose()
        .map_err(|e| CacheError::CorruptRow(e.to_string()))?;

    Ok((
        id,
        ItemCacheEntry {
            fingerprint,
            local_path,
            size: size_from_sql(size),
            recorded_at: parse_timestamp(&recorded_at)?,
        },
    ))
}

/// Snapshot the dirty keys together with their current entries
fn pending<V: Clone>(entries: &DashMap<RemoteId, V>, dirty: &DashSet<RemoteId>) -> Vec<(RemoteId, V)> {
    dirty
        .iter()
        .filter_map(|key| {
            entries
                .get(key.key())
                .map(|entry| (key.key().clone(), entry.value().clone()))
        })
        .collect()
}

// ============================================================================
// SqliteFolderCache
// ============================================================================

/// Folder change-tag cache for one account
pub struct SqliteFolderCache {
    pool: SqlitePool,
    entries: DashMap<RemoteId, FolderCacheEntry>,
    dirty: DashSet<RemoteId>,
}

impl SqliteFolderCache {
    /// Load every stored folder entry into memory
    ///
    /// # Errors
    ///
    /// Returns `CacheError::QueryFailed` if the table cannot be read.
    pub async fn load(pool: SqlitePool) -> Result<Self, CacheError> {
        let rows = sqlx::query("SELECT folder_id, change_tag, recorded_at FROM folder_cache")
            .fetch_all(&pool)
            .await?;

        let entries = DashMap::with_capacity(rows.len());
        for row in &rows {
            match folder_from_row(row) {
                Ok((id, entry)) => {
                    entries.insert(id, entry);
                }
                Err(e) => warn!(error = %e, "Skipping unreadable folder cache row"),
            }
        }

        debug!(entries = entries.len(), "Folder cache loaded");

        Ok(Self {
            pool,
            entries,
            dirty: DashSet::new(),
        })
    }

    /// Number of entries held in memory
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Whether the cache holds no entries
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Number of entries written by `put` but not yet flushed
    pub fn pending_len(&self) -> usize {
        self.dirty.len()
    }

    /// Delete persisted entries recorded before `cutoff`
    ///
    /// Best-effort maintenance; correctness never depends on it.
    pub async fn prune_older_than(&self, cutoff: DateTime<Utc>) -> Result<u64, CacheError> {
        let result = sqlx::query("DELETE FROM folder_cache WHERE recorded_at < ?")
            .bind(cutoff.to_rfc3339())
            .execute(&self.pool)
            .await?;
        self.entries
            .retain(|id, entry| entry.recorded_at >= cutoff || self.dirty.contains(id));
        Ok(result.rows_affected())
    }

    async fn write_pending(&self) -> Result<usize, CacheError> {
        let pending = pending(&self.entries, &self.dirty);
        if pending.is_empty() {
            return Ok(0);
        }

        let mut tx = self.pool.begin().await?;
        for (id, entry) in &pending {
            sqlx::query(
                "INSERT INTO folder_cache (folder_id, change_tag, recorded_at) VALUES (?, ?, ?)
                 ON CONFLICT(folder_id) DO UPDATE SET
                    change_tag = excluded.change_tag,
                    recorded_at = excluded.recorded_at",
            )
            .bind(id.as_str())
            .bind(entry.change_tag.as_str())
            .bind(entry.recorded_at.to_rfc3339())
            .execute(&mut *tx)
            .await?;
        }
        tx.commit().await?;

        for (id, _) in &pending {
            self.dirty.remove(id);
        }
        Ok(pending.len())
    }
}

#[async_trait]
impl IFolderCache for SqliteFolderCache {
    fn get(&self, folder_id: &RemoteId) -> Option<FolderCacheEntry> {
        self.entries.get(folder_id).map(|e| e.value().clone())
    }

    fn put(&self, folder_id: &RemoteId, entry: FolderCacheEntry) {
        self.entries.insert(folder_id.clone(), entry);
        self.dirty.insert(folder_id.clone());
    }

    async fn flush(&self) -> anyhow::Result<()> {
        let written = self.write_pending().await?;
        debug!(written, "Folder cache flushed");
        Ok(())
    }
}

// ============================================================================
// SqliteItemCache
// ============================================================================

/// Fingerprint cache for one media library of one account
pub struct SqliteItemCache {
    pool: SqlitePool,
    library: String,
    entries: DashMap<RemoteId, ItemCacheEntry>,
    dirty: DashSet<RemoteId>,
}

impl SqliteItemCache {
    /// Load every stored entry of `library` into memory
    ///
    /// # Arguments
    ///
    /// * `pool` - Connection pool of the account's cache database
    /// * `library` - Library key, as produced by `LibrarySelector::cache_key`
    ///
    /// # Errors
    ///
    /// Returns `CacheError::QueryFailed` if the table cannot be read.
    pub async fn load(pool: SqlitePool, library: impl Into<String>) -> Result<Self, CacheError> {
        let library = library.into();
        let rows = sqlx::query(
            "SELECT item_id, fingerprint, local_path, size, recorded_at
             FROM item_cache WHERE library = ?",
        )
        .bind(&library)
        .fetch_all(&pool)
        .await?;

        let entries = DashMap::with_capacity(rows.len());
        for row in &rows {
            match item_from_row(row) {
                Ok((id, entry)) => {
                    entries.insert(id, entry);
                }
                Err(e) => warn!(library = %library, error = %e, "Skipping unreadable item cache row"),
            }
        }

        debug!(library = %library, entries = entries.len(), "Item cache loaded");

        Ok(Self {
            pool,
            library,
            entries,
            dirty: DashSet::new(),
        })
    }

    /// Number of entries held in memory
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Whether the cache holds no entries
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Number of entries written by `put` but not yet flushed
    pub fn pending_len(&self) -> usize {
        self.dirty.len()
    }

    /// Delete persisted entries of this library recorded before `cutoff`
    pub async fn prune_older_than(&self, cutoff: DateTime<Utc>) -> Result<u64, CacheError> {
        let result = sqlx::query("DELETE FROM item_cache WHERE library = ? AND recorded_at < ?")
            .bind(&self.library)
            .bind(cutoff.to_rfc3339())
            .execute(&self.pool)
            .await?;
        self.entries
            .retain(|id, entry| entry.recorded_at >= cutoff || self.dirty.contains(id));
        Ok(result.rows_affected())
    }

    async fn write_pending(&self) -> Result<usize, CacheError> {
        let pending = pending(&self.entries, &self.dirty);
        if pending.is_empty() {
            return Ok(0);
        }

        let mut tx = self.pool.begin().await?;
        for (id, entry) in &pending {
            sqlx::query(
                "INSERT INTO item_cache (library, item_id, fingerprint, local_path, size, recorded_at)
                 VALUES (?, ?, ?, ?, ?, ?)
                 ON CONFLICT(library, item_id) DO UPDATE SET
                    fingerprint = excluded.fingerprint,
                    local_path = excluded.local_path,
                    size = excluded.size,
                    recorded_at = excluded.recorded_at",
            )
            .bind(&self.library)
            .bind(id.as_str())
            .bind(entry.fingerprint.as_ref().map(|f| f.as_str()))
            .bind(&entry.local_path)
            .bind(size_to_sql(entry.size))
            .bind(entry.recorded_at.to_rfc3339())
            .execute(&mut *tx)
            .await?;
        }
        tx.commit().await?;

        for (id, _) in &pending {
            self.dirty.remove(id);
        }
        Ok(pending.len())
    }
}

#[async_trait]
impl IItemCache for SqliteItemCache {
    fn get(&self, item_id: &RemoteId) -> Option<ItemCacheEntry> {
        self.entries.get(item_id).map(|e| e.value().clone())
    }

    fn put(&self, item_id: &RemoteId, entry: ItemCacheEntry) {
        self.entries.insert(item_id.clone(), entry);
        self.dirty.insert(item_id.clone());
    }

    async fn flush(&self) -> anyhow::Result<()> {
        let written = self.write_pending().await?;
        debug!(library = %self.library, written, "Item cache flushed");
        Ok(())
    }
}
