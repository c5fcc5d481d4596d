//! Tree walker
//!
//! Recursive descent over a Drive-like remote tree. Each folder is handled
//! in the same order:
//!
//! 1. list children (retried on transient errors)
//! 2. apply exclusions; shared-with-me subfolders are recorded and skipped
//! 3. clear local entries whose type no longer matches the remote child,
//!    then compare file children against the local copies
//! 4. fetch the changed ones concurrently, bounded by the run's fetch slots
//! 5. wait for every fetch of the folder to reach a terminal outcome
//! 6. seal the seen set and reconcile the folder
//! 7. record the folder's change tag if every file child resolved
//! 8. descend into the subfolders
//!
//! Folders are processed one at a time from an explicit stack, so a deep
//! tree never grows the async call stack.

use std::path::PathBuf;
use std::sync::Arc;

use tokio::task::JoinSet;
use tracing::{debug, info, warn};

use cloudkeep_core::domain::{
    BackupKind, FolderSelection, ItemAction, ItemFailure, KindStats, ProgressEvent, RemoteId,
    RemoteNode, RunReport,
};
use cloudkeep_core::ports::{FolderCacheEntry, IFolderCache, ITreeSource};

use crate::context::RunContext;
use crate::exclude::join_relative;
use crate::fetch::{
    ensure_writable_root, local_matches_size, local_needs_update, FetchOutcome, FetchResult,
};
use crate::reconcile::{prune_empty_dirs, ReconcileResult, Reconciler};
use crate::retry::with_retry;
use crate::seen::{SealedSeenSet, SeenSetBuilder};
use crate::SyncError;

const KIND: BackupKind = BackupKind::Drive;

/// A folder waiting to be processed
#[derive(Debug, Clone)]
struct FolderTask {
    node: RemoteNode,
    /// Path relative to the drive directory
    relative: String,
    local: PathBuf,
}

/// Result of one spawned fetch
struct FetchDone {
    relative: String,
    result: Result<FetchResult, SyncError>,
}

/// Walks the selected folders of one account's tree
pub struct TreeWalker {
    ctx: Arc<RunContext>,
    source: Arc<dyn ITreeSource>,
    cache: Arc<dyn IFolderCache>,
    reconciler: Reconciler,
    /// Local drive directory of the account
    local_root: PathBuf,
}

impl TreeWalker {
    pub fn new(
        ctx: Arc<RunContext>,
        source: Arc<dyn ITreeSource>,
        cache: Arc<dyn IFolderCache>,
        reconciler: Reconciler,
        local_root: PathBuf,
    ) -> Self {
        Self {
            ctx,
            source,
            cache,
            reconciler,
            local_root,
        }
    }

    /// Back up the selected folders
    ///
    /// Item failures are recorded in `report`; only run-fatal errors
    /// (expired authentication, unusable destination) are returned.
    pub async fn walk(
        &self,
        selection: &FolderSelection,
        report: &mut RunReport,
    ) -> Result<(), SyncError> {
        if !self.ctx.dry_run {
            ensure_writable_root(&self.local_root).await?;
        }
        let (roots, top_level) = self.resolve_roots(selection, report).await?;
        info!(
            folders = roots.len(),
            policy = %self.reconciler.policy(),
            "Starting drive backup"
        );

        let mut stack: Vec<FolderTask> = roots.into_iter().rev().collect();
        while let Some(task) = stack.pop() {
            if self.ctx.is_cancelled() {
                info!("Cancelled, not descending further");
                return Ok(());
            }
            let subfolders = self.process_folder(task, report).await?;
            stack.extend(subfolders.into_iter().rev());
        }

        if self.ctx.is_cancelled() {
            return Ok(());
        }

        // Top-level folders deleted remotely are only detectable when
        // every top-level folder is selected.
        if let Some(seen) = top_level {
            let result = self
                .reconciler
                .reconcile_orphan_dirs(&self.local_root, "", &seen, &self.ctx.exclusions)
                .await;
            self.record_reconcile("/", result, report);
        }

        if !self.ctx.dry_run {
            let pruned = prune_empty_dirs(&self.local_root).await;
            if pruned > 0 {
                debug!(pruned, "Removed empty directories");
            }
        }
        Ok(())
    }

    /// Resolve the selection to root folder tasks
    ///
    /// For [`FolderSelection::All`] the sealed seen set of the top level is
    /// returned as well.
    async fn resolve_roots(
        &self,
        selection: &FolderSelection,
        report: &mut RunReport,
    ) -> Result<(Vec<FolderTask>, Option<SealedSeenSet>), SyncError> {
        let root_id = match with_retry("resolve drive root", self.ctx.retry, || async {
            Ok(self.source.root_id().await?)
        })
        .await
        {
            Ok(id) => id,
            Err(e) => return self.root_failure(e, report),
        };

        let top = match self.list(&root_id).await {
            Ok(children) => children,
            Err(e) => return self.root_failure(e, report),
        };

        match selection {
            FolderSelection::All => {
                let mut seen = SeenSetBuilder::new();
                let mut tasks = Vec::new();
                for node in top.into_iter().filter(RemoteNode::is_folder) {
                    let name = node.name.clone();
                    if self.skip_folder(&node, &name, report) {
                        seen.protect(name);
                        continue;
                    }
                    seen.folder(name.clone());
                    tasks.push(self.task(node, name));
                }
                Ok((tasks, Some(seen.seal())))
            }
            FolderSelection::Names(names) => {
                let mut tasks = Vec::new();
                for name in names {
                    match top.iter().find(|n| n.is_folder() && &n.name == name) {
                        Some(node) if !self.skip_folder(node, name, report) => {
                            tasks.push(self.task(node.clone(), name.clone()));
                        }
                        Some(_) => {}
                        None => self.missing_root(name, report),
                    }
                }
                Ok((tasks, None))
            }
            FolderSelection::Paths(paths) => {
                let mut tasks = Vec::new();
                for path in paths {
                    match self.resolve_path(&top, path).await {
                        Ok(Some(node)) => {
                            let relative = path.trim_matches('/').to_string();
                            if !self.skip_folder(&node, &relative, report) {
                                tasks.push(self.task(node, relative));
                            }
                        }
                        Ok(None) => self.missing_root(path, report),
                        Err(e) if e.is_run_fatal() => return Err(e),
                        Err(e) => self.fail(path, &e.to_string(), report),
                    }
                }
                Ok((tasks, None))
            }
        }
    }

    /// Resolve a slash path name by name, starting from the top level
    async fn resolve_path(
        &self,
        top: &[RemoteNode],
        path: &str,
    ) -> Result<Option<RemoteNode>, SyncError> {
        let mut segments = path.split('/').filter(|s| !s.is_empty());
        let Some(first) = segments.next() else {
            return Ok(None);
        };
        let mut current = match top.iter().find(|n| n.is_folder() && n.name == first) {
            Some(node) => node.clone(),
            None => return Ok(None),
        };

        for segment in segments {
            let children = self.list(&current.id).await?;
            match children
                .into_iter()
                .find(|n| n.is_folder() && n.name == segment)
            {
                Some(node) => current = node,
                None => return Ok(None),
            }
        }
        Ok(Some(current))
    }

    fn task(&self, node: RemoteNode, relative: String) -> FolderTask {
        FolderTask {
            local: self.local_root.join(&relative),
            node,
            relative,
        }
    }

    /// Whether a folder is left out of traversal, recording why
    fn skip_folder(&self, node: &RemoteNode, relative: &str, report: &mut RunReport) -> bool {
        if node.is_shared_folder() {
            info!(path = relative, "Skipping folder shared with this account");
            report.skipped_shared.push(relative.to_string());
            self.ctx.emit(ProgressEvent::SkippedShared {
                path: relative.to_string(),
            });
            return true;
        }
        if self.ctx.exclusions.prunes_folder(relative) {
            debug!(path = relative, "Folder excluded");
            return true;
        }
        false
    }

    fn root_failure<T>(&self, err: SyncError, report: &mut RunReport) -> Result<T, SyncError>
    where
        T: Default,
    {
        if err.is_run_fatal() {
            return Err(err);
        }
        warn!(error = %err, "Cannot list the drive root");
        self.fail("/", &err.to_string(), report);
        Ok(T::default())
    }

    fn missing_root(&self, name: &str, report: &mut RunReport) {
        warn!(folder = name, "Selected folder not found on the remote");
        self.fail(name, "selected folder not found on the remote", report);
    }

    async fn list(&self, id: &RemoteId) -> Result<Vec<RemoteNode>, SyncError> {
        with_retry("list folder", self.ctx.retry, || async {
            Ok(self.source.list_children(id).await?)
        })
        .await
    }

    /// Process one folder, returning its subfolders
    async fn process_folder(
        &self,
        folder: FolderTask,
        report: &mut RunReport,
    ) -> Result<Vec<FolderTask>, SyncError> {
        self.ctx.emit(ProgressEvent::ScopeStarted {
            kind: KIND,
            scope: folder.relative.clone(),
        });

        let children = match self.list(&folder.node.id).await {
            Ok(children) => children,
            Err(e) if e.is_run_fatal() => return Err(e),
            Err(e) => {
                warn!(path = %folder.relative, error = %e, "Cannot list folder, skipping it");
                self.fail(&folder.relative, &e.to_string(), report);
                return Ok(Vec::new());
            }
        };

        let cache_hit = self
            .cache
            .get(&folder.node.id)
            .is_some_and(|entry| entry.is_valid_for(folder.node.change_tag.as_ref()));
        debug!(path = %folder.relative, children = children.len(), cache_hit, "Listed folder");

        let mut seen = SeenSetBuilder::new();
        let mut subfolders = Vec::new();
        let mut fetches: JoinSet<FetchDone> = JoinSet::new();
        let mut stats = KindStats::default();
        let mut clean = true;
        let mut conflicts = ReconcileResult::default();

        for child in children {
            // clearing type conflicts is reconciliation too
            if self.ctx.is_cancelled() {
                break;
            }
            let relative = join_relative(&folder.relative, &child.name);

            if child.is_folder() {
                if self.skip_folder(&child, &relative, report) {
                    seen.protect(child.name.clone());
                    continue;
                }
                let local = folder.local.join(&child.name);
                if !self
                    .reconciler
                    .clear_type_conflict(&local, &relative, true, &self.ctx.exclusions, &mut conflicts)
                    .await
                {
                    clean = false;
                    seen.file(child.name.clone());
                    self.fail(&relative, "local file in the way of a remote folder", report);
                    continue;
                }
                seen.folder(child.name.clone());
                subfolders.push(FolderTask {
                    local,
                    node: child,
                    relative,
                });
                continue;
            }

            if self.ctx.exclusions.is_excluded(&relative) {
                debug!(path = %relative, "Excluded");
                continue;
            }
            seen.file(child.name.clone());

            let local = folder.local.join(&child.name);
            if !self
                .reconciler
                .clear_type_conflict(&local, &relative, false, &self.ctx.exclusions, &mut conflicts)
                .await
            {
                clean = false;
                seen.protect(child.name.clone());
                let reason = "local folder in the way of a remote file".to_string();
                stats.failed += 1;
                self.fail(&relative, &reason, report);
                self.item_finished(&relative, ItemAction::Failed { reason }, &mut stats);
                continue;
            }
            let needs_fetch = if cache_hit {
                !local_matches_size(&local, child.size).await
            } else {
                local_needs_update(&local, child.size, child.modified).await
            };

            if !needs_fetch {
                self.item_finished(&relative, ItemAction::Unchanged, &mut stats);
                continue;
            }
            if self.ctx.dry_run {
                stats.fetched += 1;
                self.item_finished(&relative, ItemAction::WouldFetch, &mut stats);
                continue;
            }
            if self.ctx.is_cancelled() {
                break;
            }
            let Some(permit) = self.ctx.fetch_slot().await else {
                break;
            };

            let source = Arc::clone(&self.source);
            let executor = self.ctx.executor.clone();
            fetches.spawn(async move {
                let result = executor
                    .fetch_node(source.as_ref(), &child, &relative, &local)
                    .await;
                drop(permit);
                FetchDone { relative, result }
            });
        }

        // Every fetch targeting this folder must finish before the seen
        // set is sealed.
        let mut fatal = None;
        while let Some(joined) = fetches.join_next().await {
            let done = match joined {
                Ok(done) => done,
                Err(e) => {
                    warn!(path = %folder.relative, error = %e, "Fetch task aborted");
                    clean = false;
                    stats.failed += 1;
                    self.fail(&folder.relative, &format!("fetch task aborted: {e}"), report);
                    continue;
                }
            };
            match done.result {
                Ok(FetchResult {
                    bytes_written,
                    outcome: FetchOutcome::Written,
                }) => {
                    stats.fetched += 1;
                    stats.bytes += bytes_written;
                    self.item_finished(
                        &done.relative,
                        ItemAction::Fetched {
                            bytes: bytes_written,
                        },
                        &mut stats,
                    );
                }
                Ok(FetchResult {
                    outcome: FetchOutcome::Skipped { reason },
                    ..
                }) => {
                    clean = false;
                    stats.skipped += 1;
                    self.fail(&done.relative, &reason, report);
                    self.item_finished(&done.relative, ItemAction::Skipped { reason }, &mut stats);
                }
                Err(e) if e.is_run_fatal() => {
                    fatal.get_or_insert(e);
                }
                Err(e) => {
                    clean = false;
                    stats.failed += 1;
                    warn!(path = %done.relative, error = %e, "Fetch failed");
                    let reason = e.to_string();
                    self.fail(&done.relative, &reason, report);
                    self.item_finished(&done.relative, ItemAction::Failed { reason }, &mut stats);
                }
            }
        }

        report.stats_mut(KIND).merge(&stats);
        self.record_reconcile(&folder.relative, conflicts, report);

        if let Some(err) = fatal {
            return Err(err);
        }
        if self.ctx.is_cancelled() {
            return Ok(Vec::new());
        }

        let seen = seen.seal();
        let mut result = self
            .reconciler
            .reconcile_files(&folder.local, &folder.relative, &seen, &self.ctx.exclusions)
            .await;
        result.merge(
            self.reconciler
                .reconcile_orphan_dirs(&folder.local, &folder.relative, &seen, &self.ctx.exclusions)
                .await,
        );
        self.record_reconcile(&folder.relative, result, report);

        if clean && !self.ctx.dry_run {
            if let Some(tag) = &folder.node.change_tag {
                self.cache
                    .put(&folder.node.id, FolderCacheEntry::new(tag.clone()));
            }
        }

        Ok(subfolders)
    }

    fn item_finished(&self, relative: &str, action: ItemAction, stats: &mut KindStats) {
        stats.processed += 1;
        self.ctx.emit(ProgressEvent::ItemFinished {
            kind: KIND,
            path: relative.to_string(),
            action,
        });
    }

    fn record_reconcile(&self, scope: &str, result: ReconcileResult, report: &mut RunReport) {
        let stats = report.stats_mut(KIND);
        stats.removed += result.removed;
        stats.archived += result.archived;
        stats.failed += result.failures.len() as u64;
        if result.changed() {
            self.ctx.emit(ProgressEvent::Reconciled {
                kind: KIND,
                scope: scope.to_string(),
                removed: result.removed,
                archived: result.archived,
            });
        }
        report.failures.extend(result.failures);
    }

    fn fail(&self, path: &str, reason: &str, report: &mut RunReport) {
        report.failures.push(ItemFailure {
            kind: KIND,
            path: path.to_string(),
            reason: reason.to_string(),
        });
    }
}
