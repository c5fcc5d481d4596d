//! Per-run shared state
//!
//! A [`RunContext`] is created once per run and shared (behind an `Arc`)
//! by the tree walker, the flat iterator and their fetch tasks.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use tokio::sync::{OwnedSemaphorePermit, Semaphore};
use tokio_util::sync::CancellationToken;

use cloudkeep_core::domain::{AccountKey, BackupPlan, ProgressEvent, RunId, RunProgress};

use crate::exclude::ExclusionSet;
use crate::fetch::FetchExecutor;
use crate::progress::ProgressReporter;
use crate::retry::RetryPolicy;

pub struct RunContext {
    pub run_id: RunId,
    pub account: AccountKey,
    pub dry_run: bool,
    pub exclusions: ExclusionSet,
    pub executor: FetchExecutor,
    /// Retry policy for listings and enumerations
    pub retry: RetryPolicy,
    cancel: CancellationToken,
    cancel_reported: AtomicBool,
    progress: ProgressReporter,
    /// Shared by every fetch of the run, whatever its scope
    fetch_slots: Arc<Semaphore>,
}

impl RunContext {
    pub fn new(
        run_id: RunId,
        plan: &BackupPlan,
        cancel: CancellationToken,
        progress: ProgressReporter,
    ) -> Self {
        let settings = &plan.settings;
        Self {
            run_id,
            account: plan.account.clone(),
            dry_run: plan.dry_run,
            exclusions: ExclusionSet::new(plan.exclusions.clone()),
            executor: FetchExecutor::from_settings(settings),
            retry: RetryPolicy::new(settings.max_retries, settings.retry_base_delay),
            cancel,
            cancel_reported: AtomicBool::new(false),
            progress,
            fetch_slots: Arc::new(Semaphore::new(settings.fetch_concurrency.max(1))),
        }
    }

    /// Whether cancellation was requested
    ///
    /// The first positive answer is published as a progress event.
    pub fn is_cancelled(&self) -> bool {
        let cancelled = self.cancel.is_cancelled();
        if cancelled && !self.cancel_reported.swap(true, Ordering::SeqCst) {
            self.progress.emit(ProgressEvent::CancelRequested);
        }
        cancelled
    }

    /// Wait for a fetch slot
    ///
    /// Returns `None` when the run is cancelled while waiting.
    pub async fn fetch_slot(&self) -> Option<OwnedSemaphorePermit> {
        tokio::select! {
            biased;
            _ = self.cancel.cancelled() => {
                self.is_cancelled();
                None
            }
            permit = Arc::clone(&self.fetch_slots).acquire_owned() => permit.ok(),
        }
    }

    pub fn emit(&self, event: ProgressEvent) {
        self.progress.emit(event);
    }

    pub fn progress(&self) -> RunProgress {
        self.progress.snapshot()
    }
}
