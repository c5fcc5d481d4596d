//! SQLite implementation of IRunStatusStore
//!
//! One row per account. `record_started` marks the account as running;
//! `record_finished` replaces the row with the final status, message and
//! the full report serialized as JSON.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::{Row, SqlitePool};

use cloudkeep_core::domain::{AccountKey, RunId, RunReport};
use cloudkeep_core::ports::IRunStatusStore;

use crate::CacheError;

/// Status value stored while a run is in flight
const STATUS_RUNNING: &str = "running";

/// SQLite-based run status store
pub struct SqliteRunStatusStore {
    pool: SqlitePool,
}

impl SqliteRunStatusStore {
    /// Creates a new store with the given connection pool
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    /// Raw status column of an account (`running`, `success`, ...)
    pub async fn status(&self, account: &AccountKey) -> Result<Option<String>, CacheError> {
        let row = sqlx::query("SELECT status FROM run_status WHERE account = ?")
            .bind(account.as_str())
            .fetch_optional(&self.pool)
            .await?;
        Ok(row.map(|r| r.try_get::<String, _>("status")).transpose()?)
    }
}

#[async_trait]
impl IRunStatusStore for SqliteRunStatusStore {
    async fn record_started(
        &self,
        account: &AccountKey,
        run_id: RunId,
        started_at: DateTime<Utc>,
    ) -> anyhow::Result<()> {
        // Keep the previous report so status queries still show the last
        // finished run while a new one is in flight.
        sqlx::query(
            "INSERT INTO run_status (account, run_id, started_at, status)
             VALUES (?, ?, ?, ?)
             ON CONFLICT(account) DO UPDATE SET
                run_id = excluded.run_id,
                started_at = excluded.started_at,
                finished_at = NULL,
                status = excluded.status",
        )
        .bind(account.as_str())
        .bind(run_id.to_string())
        .bind(started_at.to_rfc3339())
        .bind(STATUS_RUNNING)
        .execute(&self.pool)
        .await
        .map_err(CacheError::from)?;
        Ok(())
    }

    async fn record_finished(&self, report: &RunReport) -> anyhow::Result<()> {
        let json = serde_json::to_string(report)
            .map_err(|e| CacheError::CorruptRow(e.to_string()))?;

        sqlx::query(
            "INSERT INTO run_status (account, run_id, started_at, finished_at, status, message, report)
             VALUES (?, ?, ?, ?, ?, ?, ?)
             ON CONFLICT(account) DO UPDATE SET
                run_id = excluded.run_id,
                started_at = excluded.started_at,
                finished_at = excluded.finished_at,
                status = excluded.status,
                message = excluded.message,
                report = excluded.report",
        )
        .bind(report.account.as_str())
        .bind(report.run_id.to_string())
        .bind(report.started_at.to_rfc3339())
        .bind(report.finished_at.map(|t| t.to_rfc3339()))
        .bind(report.status.to_string())
        .bind(&report.message)
        .bind(json)
        .execute(&self.pool)
        .await
        .map_err(CacheError::from)?;
        Ok(())
    }

    async fn last_report(&self, account: &AccountKey) -> anyhow::Result<Option<RunReport>> {
        let row = sqlx::query("SELECT report FROM run_status WHERE account = ?")
            .bind(account.as_str())
            .fetch_optional(&self.pool)
            .await
            .map_err(CacheError::from)?;

        let Some(row) = row else {
            return Ok(None);
        };
        let json: Option<String> = row.try_get("report").map_err(CacheError::from)?;
        match json {
            Some(json) => {
                let report = serde_json::from_str(&json)
                    .map_err(|e| CacheError::CorruptRow(e.to_string()))?;
                Ok(Some(report))
            }
            None => Ok(None),
        }
    }
}
