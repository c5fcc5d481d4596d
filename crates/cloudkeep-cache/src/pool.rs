//! SQLite pool setup shared by the cache and status databases
//!
//! Every database file goes through [`DatabasePool::new`], which creates the
//! parent directory, opens the file in WAL mode and brings the schema up to
//! [`SCHEMA_VERSION`]. The applied version is kept in `PRAGMA user_version`,
//! so reopening an existing database only runs the steps it is missing.

use std::path::Path;
use std::time::Duration;

use sqlx::sqlite::{
    SqliteConnectOptions, SqliteJournalMode, SqlitePool, SqlitePoolOptions, SqliteSynchronous,
};
use tracing::{debug, info};

use crate::CacheError;

/// Schema steps in application order, keyed by the version they produce
const MIGRATIONS: &[(i64, &str)] = &[(1, include_str!("migrations/20261019_initial.sql"))];

/// Version of a fully migrated database
pub const SCHEMA_VERSION: i64 = 1;

/// Connections per file-backed database: one writer (flush) plus readers
const MAX_CONNECTIONS: u32 = 4;

/// How long a connection waits on a lock held by another process
const BUSY_TIMEOUT: Duration = Duration::from_secs(5);

/// An open, migrated SQLite database
pub struct DatabasePool {
    pool: SqlitePool,
}

impl DatabasePool {
    /// Open (or create) the database at `db_path`
    ///
    /// # Errors
    ///
    /// `CacheError::ConnectionFailed` when the directory or file cannot be
    /// opened, `CacheError::MigrationFailed` when the schema cannot be
    /// brought up to date.
    pub async fn new(db_path: &Path) -> Result<Self, CacheError> {
        if let Some(parent) = db_path.parent() {
            std::fs::create_dir_all(parent).map_err(|e| {
                CacheError::ConnectionFailed(format!(
                    "cannot create state directory {}: {}",
                    parent.display(),
                    e
                ))
            })?;
        }

        // A flush is a single transaction; NORMAL keeps it atomic under WAL.
        let options = SqliteConnectOptions::new()
            .filename(db_path)
            .create_if_missing(true)
            .journal_mode(SqliteJournalMode::Wal)
            .synchronous(SqliteSynchronous::Normal)
            .busy_timeout(BUSY_TIMEOUT);

        let pool = SqlitePoolOptions::new()
            .max_connections(MAX_CONNECTIONS)
            .connect_with(options)
            .await
            .map_err(|e| {
                CacheError::ConnectionFailed(format!("cannot open {}: {}", db_path.display(), e))
            })?;

        let applied = migrate(&pool).await?;
        info!(path = %db_path.display(), applied, "Opened state database");
        Ok(Self { pool })
    }

    /// A private in-memory database, alive for as long as the pool is
    ///
    /// SQLite in-memory databases belong to a single connection, so the pool
    /// holds exactly one and never retires it.
    pub async fn in_memory() -> Result<Self, CacheError> {
        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .min_connections(1)
            .idle_timeout(None)
            .max_lifetime(None)
            .connect("sqlite::memory:")
            .await
            .map_err(|e| CacheError::ConnectionFailed(format!("in-memory database: {}", e)))?;

        migrate(&pool).await?;
        Ok(Self { pool })
    }

    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }

    /// Schema version recorded in the database
    pub async fn schema_version(&self) -> Result<i64, CacheError> {
        user_version(&self.pool).await
    }
}

async fn user_version(pool: &SqlitePool) -> Result<i64, CacheError> {
    let version: i64 = sqlx::query_scalar("PRAGMA user_version")
        .fetch_one(pool)
        .await?;
    Ok(version)
}

/// Apply the migrations newer than the database, returning how many ran
async fn migrate(pool: &SqlitePool) -> Result<usize, CacheError> {
    let current = user_version(pool).await?;
    if current > SCHEMA_VERSION {
        return Err(CacheError::MigrationFailed(format!(
            "database schema {current} is newer than this build ({SCHEMA_VERSION})"
        )));
    }

    let mut applied = 0;
    for (version, sql) in MIGRATIONS.iter().filter(|(v, _)| *v > current) {
        sqlx::raw_sql(sql).execute(pool).await.map_err(|e| {
            CacheError::MigrationFailed(format!("schema step {version}: {e}"))
        })?;
        sqlx::query(&format!("PRAGMA user_version = {version}"))
            .execute(pool)
            .await
            .map_err(|e| CacheError::MigrationFailed(format!("schema step {version}: {e}")))?;
        debug!(version, "Applied schema step");
        applied += 1;
    }
    Ok(applied)
}
