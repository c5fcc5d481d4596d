//! Per-account cache databases
//!
//! Each account gets its own SQLite file at
//! `<state_dir>/<destination key>/cache.db` holding its folder cache and
//! the item caches of all its libraries. Pools are opened lazily and
//! reused for the lifetime of the store.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::Context;
use async_trait::async_trait;
use dashmap::DashMap;
use sqlx::SqlitePool;

use cloudkeep_core::domain::{AccountKey, LibrarySelector};
use cloudkeep_core::ports::{ICacheStore, IFolderCache, IItemCache};

use crate::caches::{SqliteFolderCache, SqliteItemCache};
use crate::pool::DatabasePool;
use crate::CacheError;

/// File name of an account's cache database
const CACHE_DB_FILE: &str = "cache.db";

/// Opens cache databases by account
pub struct SqliteCacheStore {
    /// `None` keeps every database in memory
    state_dir: Option<PathBuf>,
    pools: DashMap<AccountKey, SqlitePool>,
}

impl SqliteCacheStore {
    /// Store rooted at `state_dir`
    pub fn new(state_dir: &Path) -> Self {
        Self {
            state_dir: Some(state_dir.to_path_buf()),
            pools: DashMap::new(),
        }
    }

    /// Store whose databases live in memory for as long as the store does
    pub fn in_memory() -> Self {
        Self {
            state_dir: None,
            pools: DashMap::new(),
        }
    }

    /// Path of the cache database for an account, if file-backed
    pub fn database_path(&self, account: &AccountKey) -> Option<PathBuf> {
        self.state_dir.as_ref().map(|dir| {
            dir.join(account.destination_key())
                .join(CACHE_DB_FILE)
        })
    }

    async fn pool_for(&self, account: &AccountKey) -> Result<SqlitePool, CacheError> {
        if let Some(pool) = self.pools.get(account) {
            return Ok(pool.value().clone());
        }

        let db = match self.database_path(account) {
            Some(path) => DatabasePool::new(&path).await?,
            None => DatabasePool::in_memory().await?,
        };
        let pool = self
            .pools
            .entry(account.clone())
            .or_insert_with(|| db.pool().clone())
            .value()
            .clone();
        Ok(pool)
    }
}

#[async_trait]
impl ICacheStore for SqliteCacheStore {
    async fn folder_cache(&self, account: &AccountKey) -> anyhow::Result<Arc<dyn IFolderCache>> {
        let pool = self
            .pool_for(account)
            .await
            .with_context(|| format!("Failed to open cache database for {account}"))?;
        let cache = SqliteFolderCache::load(pool)
            .await
            .with_context(|| format!("Failed to load folder cache for {account}"))?;
        Ok(Arc::new(cache))
    }

    async fn item_cache(
        &self,
        account: &AccountKey,
        library: &LibrarySelector,
    ) -> anyhow::Result<Arc<dyn IItemCache>> {
        let pool = self
            .pool_for(account)
            .await
            .with_context(|| format!("Failed to open cache database for {account}"))?;
        let cache = SqliteItemCache::load(pool, library.cache_key())
            .await
            .with_context(|| format!("Failed to load item cache for {account} ({library})"))?;
        Ok(Arc::new(cache))
    }
}
