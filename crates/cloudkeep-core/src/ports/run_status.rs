//! Run status port
//!
//! Persists the last-run fields of each account: when a run started, how
//! it ended and its report.
//!
//! ## Design Notes
//!
//! - Uses `anyhow::Result` because storage failures are adapter-specific.

use async_trait::async_trait;
use chrono::{DateTime, Utc};

use crate::domain::{AccountKey, RunId, RunReport};

/// Storage for per-account run status
#[async_trait]
pub trait IRunStatusStore: Send + Sync {
    /// Mark a run as in progress
    async fn record_started(
        &self,
        account: &AccountKey,
        run_id: RunId,
        started_at: DateTime<Utc>,
    ) -> anyhow::Result<()>;

    /// Store the final report of a run
    async fn record_finished(&self, report: &RunReport) -> anyhow::Result<()>;

    /// Most recent finished report for an account
    async fn last_report(&self, account: &AccountKey) -> anyhow::Result<Option<RunReport>>;
}
