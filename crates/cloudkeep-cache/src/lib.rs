//! cloudkeep Cache - Change-detection state persistence
//!
//! SQLite-based storage for:
//! - Folder change tags (tree source)
//! - Item fingerprints and resolved local paths (flat source)
//! - Last-run status per account
//!
//! ## Architecture
//!
//! This crate implements the `ICacheStore`, `IFolderCache`, `IItemCache`
//! and `IRunStatusStore` ports from `cloudkeep-core` using SQLite as the
//! storage backend. It is a driven (secondary) adapter in the hexagonal
//! architecture.
//!
//! Caches are loaded into memory when opened and written back with
//! `flush`, which commits every pending entry in a single transaction.
//! A run that crashes before flushing leaves the previous cache intact.
//!
//! ## Key Components
//!
//! - [`DatabasePool`] - Pool setup and versioned schema upgrades
//! - [`SqliteCacheStore`] - Opens one cache database per account
//! - [`SqliteFolderCache`] / [`SqliteItemCache`] - The two cache flavors
//! - [`SqliteRunStatusStore`] - Last-run status write-back
//! - [`CacheError`] - Error types for cache operations
//!
//! ## Usage
//!
//! ```no_run
//! use std::path::Path;
//! use cloudkeep_cache::SqliteCacheStore;
//! use cloudkeep_core::domain::AccountKey;
//! use cloudkeep_core::ports::ICacheStore;
//!
//! # async fn example() -> anyhow::Result<()> {
//! let store = SqliteCacheStore::new(Path::new("/home/user/.local/share/cloudkeep/state"));
//! let account = AccountKey::new("me@example.com")?;
//! let folders = store.folder_cache(&account).await?;
//! folders.flush().await?;
//! # Ok(())
//! # }
//! ```

pub mod caches;
pub mod pool;
pub mod run_status;
pub mod store;

pub use caches::{SqliteFolderCache, SqliteItemCache};
pub use pool::DatabasePool;
pub use run_status::SqliteRunStatusStore;
pub use store::SqliteCacheStore;

/// Errors raised by the state databases
#[derive(Debug, thiserror::Error)]
pub enum CacheError {
    /// The database file or its directory could not be opened
    #[error("cannot open state database: {0}")]
    ConnectionFailed(String),

    #[error("state query failed: {0}")]
    QueryFailed(String),

    /// The schema could not be brought up to date
    #[error("state schema upgrade failed: {0}")]
    MigrationFailed(String),

    /// A stored row no longer decodes into a domain value
    #[error("corrupt state row: {0}")]
    CorruptRow(String),
}

impl From<sqlx::Error> for CacheError {
    fn from(e: sqlx::Error) -> Self {
        CacheError::QueryFailed(e.to_string())
    }
}
