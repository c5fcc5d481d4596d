//! Backup engine
//!
//! The [`BackupEngine`] runs one [`BackupPlan`] for one account: the Drive
//! part through the tree walker, then the Photos part library by library
//! through the flat iterator.
//!
//! ## Run Flow
//!
//! 1. **Admission**: a second run for an account that is already running is
//!    rejected with [`SyncError::AlreadyRunning`]
//! 2. **Drive**: walk the selected folders, reconciling folder by folder
//! 3. **Photos**: one pass per library
//! 4. **Bookkeeping**: flush caches (also after cancellation, never in a dry
//!    run), finish the report, write the run status
//!
//! ## Outcomes
//!
//! Item failures never abort a run. Expired authentication or an unusable
//! destination stop it with [`RunStatus::Error`]; cancellation stops it
//! with [`RunStatus::Cancelled`] and skips every pending reconciliation.
//!
//! [`RunStatus::Error`]: cloudkeep_core::domain::RunStatus::Error
//! [`RunStatus::Cancelled`]: cloudkeep_core::domain::RunStatus::Cancelled

use std::path::PathBuf;
use std::sync::Arc;

use chrono::Utc;
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use tokio::sync::watch;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use cloudkeep_core::domain::{
    AccountKey, BackupKind, BackupPlan, KindStats, Phase, ProgressEvent, RunId, RunProgress,
    RunReport, SyncPolicy,
};
use cloudkeep_core::ports::{
    ICacheStore, IMediaLibrary, IProgressSink, IRunStatusStore, ITreeSource, SourceError,
};

use crate::context::RunContext;
use crate::flat::FlatIterator;
use crate::progress::ProgressReporter;
use crate::reconcile::Reconciler;
use crate::tree::TreeWalker;
use crate::SyncError;

// ============================================================================
// Run registry
// ============================================================================

/// Accounts with a run in flight, and their progress
#[derive(Debug, Default)]
pub struct RunRegistry {
    runs: Arc<DashMap<AccountKey, watch::Receiver<RunProgress>>>,
}

/// Releases an account's slot in the registry when dropped
#[derive(Debug)]
pub struct RunGuard {
    runs: Arc<DashMap<AccountKey, watch::Receiver<RunProgress>>>,
    account: AccountKey,
}

impl Drop for RunGuard {
    fn drop(&mut self) {
        self.runs.remove(&self.account);
    }
}

impl RunRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Claim the run slot of an account
    ///
    /// # Errors
    ///
    /// Returns [`SyncError::AlreadyRunning`] if the account already has a
    /// run in flight.
    pub fn register(
        &self,
        account: &AccountKey,
        progress: watch::Receiver<RunProgress>,
    ) -> Result<RunGuard, SyncError> {
        match self.runs.entry(account.clone()) {
            Entry::Occupied(_) => Err(SyncError::AlreadyRunning(account.to_string())),
            Entry::Vacant(slot) => {
                slot.insert(progress);
                Ok(RunGuard {
                    runs: Arc::clone(&self.runs),
                    account: account.clone(),
                })
            }
        }
    }

    pub fn is_running(&self, account: &AccountKey) -> bool {
        self.runs.contains_key(account)
    }

    /// Progress receiver of an account's current run
    pub fn observe(&self, account: &AccountKey) -> Option<watch::Receiver<RunProgress>> {
        self.runs.get(account).map(|entry| entry.value().clone())
    }
}

// ============================================================================
// BackupEngine
// ============================================================================

/// Runs backup plans against a tree source and a media library
pub struct BackupEngine {
    tree: Arc<dyn ITreeSource>,
    media: Arc<dyn IMediaLibrary>,
    caches: Arc<dyn ICacheStore>,
    status: Option<Arc<dyn IRunStatusStore>>,
    sink: Arc<dyn IProgressSink>,
    registry: Arc<RunRegistry>,
}

impl BackupEngine {
    pub fn new(
        tree: Arc<dyn ITreeSource>,
        media: Arc<dyn IMediaLibrary>,
        caches: Arc<dyn ICacheStore>,
        sink: Arc<dyn IProgressSink>,
    ) -> Self {
        Self {
            tree,
            media,
            caches,
            status: None,
            sink,
            registry: Arc::new(RunRegistry::new()),
        }
    }

    /// Write run status to `store` at the start and end of every run
    #[must_use]
    pub fn with_status_store(mut self, store: Arc<dyn IRunStatusStore>) -> Self {
        self.status = Some(store);
        self
    }

    pub fn registry(&self) -> Arc<RunRegistry> {
        Arc::clone(&self.registry)
    }

    /// Progress of an account's current run, if one is in flight
    pub fn observe(&self, account: &AccountKey) -> Option<watch::Receiver<RunProgress>> {
        self.registry.observe(account)
    }

    /// Run a backup plan
    ///
    /// # Errors
    ///
    /// Returns [`SyncError::AlreadyRunning`] if the account already has a run
    /// in flight. Every other outcome, including fatal ones, is described by
    /// the returned report.
    #[tracing::instrument(skip(self, plan, cancel), fields(account = %plan.account, dry_run = plan.dry_run))]
    pub async fn run(
        &self,
        plan: &BackupPlan,
        cancel: CancellationToken,
    ) -> Result<RunReport, SyncError> {
        let run_id = RunId::new();
        let started_at = Utc::now();
        let (reporter, progress_rx) =
            ProgressReporter::new(RunProgress::new(started_at), Arc::clone(&self.sink));
        let _guard = self.registry.register(&plan.account, progress_rx)?;

        let mut report = RunReport::start(run_id, plan.account.clone(), plan.dry_run);
        report.started_at = started_at;
        if let Some(status) = &self.status {
            if let Err(e) = status.record_started(&plan.account, run_id, started_at).await {
                warn!(error = %e, "Failed to record run start");
            }
        }

        info!(%run_id, "Backup run started");
        let ctx = Arc::new(RunContext::new(run_id, plan, cancel, reporter));

        let fatal = match self.run_parts(&ctx, plan, &mut report).await {
            Ok(()) => None,
            Err(e) => {
                error!(error = %e, "Backup run aborted");
                Some(fatal_message(&e))
            }
        };

        ctx.emit(ProgressEvent::PhaseStarted {
            phase: Phase::Finishing,
        });
        report.finish(ctx.is_cancelled(), fatal);
        info!(
            status = %report.status,
            bytes = report.total_bytes(),
            "{}",
            report.message
        );

        if let Some(status) = &self.status {
            if let Err(e) = status.record_finished(&report).await {
                warn!(error = %e, "Failed to record run result");
            }
        }
        ctx.emit(ProgressEvent::PhaseStarted { phase: Phase::Done });
        Ok(report)
    }

    async fn run_parts(
        &self,
        ctx: &Arc<RunContext>,
        plan: &BackupPlan,
        report: &mut RunReport,
    ) -> Result<(), SyncError> {
        if let Some(drive) = &plan.drive {
            ctx.emit(ProgressEvent::PhaseStarted {
                phase: Phase::Drive,
            });
            report.drive = Some(KindStats::default());

            let cache = self
                .caches
                .folder_cache(&plan.account)
                .await
                .map_err(|e| SyncError::Cache(format!("{e:#}")))?;
            let walker = TreeWalker::new(
                Arc::clone(ctx),
                Arc::clone(&self.tree),
                Arc::clone(&cache),
                reconciler(
                    plan,
                    BackupKind::Drive,
                    drive.policy,
                    plan.archive_dir(BackupKind::Drive),
                ),
                plan.kind_dir(BackupKind::Drive),
            );
            let walked = walker.walk(&drive.folders, report).await;

            if !plan.dry_run {
                if let Err(e) = cache.flush().await {
                    warn!(error = %e, "Failed to persist the folder cache");
                }
            }
            walked?;
        }

        if let Some(photos) = &plan.photos {
            if ctx.is_cancelled() {
                return Ok(());
            }
            ctx.emit(ProgressEvent::PhaseStarted {
                phase: Phase::Photos,
            });
            report.photos = Some(KindStats::default());

            for library in &photos.libraries {
                if ctx.is_cancelled() {
                    break;
                }
                let cache = self
                    .caches
                    .item_cache(&plan.account, library)
                    .await
                    .map_err(|e| SyncError::Cache(format!("{e:#}")))?;
                let iterator = FlatIterator::new(
                    Arc::clone(ctx),
                    Arc::clone(&self.media),
                    Arc::clone(&cache),
                    reconciler(
                        plan,
                        BackupKind::Photos,
                        photos.policy,
                        plan.library_archive_dir(library),
                    ),
                    library.clone(),
                    plan.library_dir(library),
                );
                let passed = iterator.run(report).await;

                if !plan.dry_run {
                    if let Err(e) = cache.flush().await {
                        warn!(library = %library, error = %e, "Failed to persist the item cache");
                    }
                }
                passed?;
            }
        }
        Ok(())
    }
}

fn reconciler(
    plan: &BackupPlan,
    kind: BackupKind,
    policy: SyncPolicy,
    archive_dir: PathBuf,
) -> Reconciler {
    Reconciler::new(kind, policy, archive_dir, plan.dry_run)
}

/// Message stored in the report of an aborted run
fn fatal_message(err: &SyncError) -> String {
    match err {
        SyncError::Source(SourceError::AuthExpired(reason)) => {
            format!("Authentication expired ({reason}), re-authenticate the account and run again")
        }
        other => other.to_string(),
    }
}
