//! Flat iterator
//!
//! Single pass over a media library enumeration. Items are filed by date
//! into `<library dir>/<YYYY>/<MM>/<DD>/<filename>` (or
//! `unknown_date/<filename>`), with one seen set per day directory.
//!
//! Reconciliation of the library runs only after the enumeration was
//! exhausted without error and produced at least one item, so a failed or
//! empty listing can never remove local files.

use std::collections::{BTreeMap, HashMap, HashSet};
use std::path::{Path, PathBuf};
use std::sync::Arc;

use chrono::{DateTime, Utc};
use futures_util::{FutureExt, StreamExt};
use tokio::task::{JoinError, JoinSet};
use tracing::{debug, info, warn};

use cloudkeep_core::domain::{
    BackupKind, Fingerprint, ItemAction, ItemFailure, KindStats, LibrarySelector, ProgressEvent,
    RemoteId, RemoteItem, RunReport,
};
use cloudkeep_core::ports::{IItemCache, IMediaLibrary, ItemCacheEntry, ItemStream};

use crate::context::RunContext;
use crate::exclude::join_relative;
use crate::fetch::{
    ensure_writable_root, is_temp_name, local_matches_size, temp_path_for, FetchOutcome,
    FetchResult,
};
use crate::reconcile::{prune_empty_dirs, ReconcileResult, Reconciler};
use crate::retry::with_retry;
use crate::seen::SeenSetBuilder;
use crate::SyncError;

const KIND: BackupKind = BackupKind::Photos;

/// Directory for items without any usable date
pub const UNKNOWN_DATE_DIR: &str = "unknown_date";

/// Day directory of an item, relative to the library directory
pub fn day_dir(date: Option<DateTime<Utc>>) -> String {
    match date {
        Some(date) => date.format("%Y/%m/%d").to_string(),
        None => UNKNOWN_DATE_DIR.to_string(),
    }
}

/// `stem_N.ext` variant of a file name
pub fn suffixed_name(filename: &str, n: u32) -> String {
    match filename.rsplit_once('.') {
        Some((stem, ext)) if !stem.is_empty() => format!("{stem}_{n}.{ext}"),
        _ => format!("{filename}_{n}"),
    }
}

/// Result of one spawned fetch
struct FetchDone {
    item_id: RemoteId,
    relative: String,
    fingerprint: Option<Fingerprint>,
    size: Option<u64>,
    result: Result<FetchResult, SyncError>,
}

/// Mutable state of one library pass
#[derive(Default)]
struct PassState {
    stats: KindStats,
    /// Seen set per day directory
    days: BTreeMap<String, SeenSetBuilder>,
    /// Relative paths assigned during this pass
    claimed: HashSet<String>,
    /// Local copies known to hold a fingerprint's content
    by_fingerprint: HashMap<Fingerprint, PathBuf>,
    items_seen: u64,
    enumeration_complete: bool,
    fatal: Option<SyncError>,
}

/// Backs up one media library
pub struct FlatIterator {
    ctx: Arc<RunContext>,
    library: Arc<dyn IMediaLibrary>,
    cache: Arc<dyn IItemCache>,
    reconciler: Reconciler,
    selector: LibrarySelector,
    /// Local directory of the library
    local_root: PathBuf,
}

impl FlatIterator {
    pub fn new(
        ctx: Arc<RunContext>,
        library: Arc<dyn IMediaLibrary>,
        cache: Arc<dyn IItemCache>,
        reconciler: Reconciler,
        selector: LibrarySelector,
        local_root: PathBuf,
    ) -> Self {
        Self {
            ctx,
            library,
            cache,
            reconciler,
            selector,
            local_root,
        }
    }

    /// Back up the library
    ///
    /// Item failures are recorded in `report`; only run-fatal errors are
    /// returned.
    pub async fn run(&self, report: &mut RunReport) -> Result<(), SyncError> {
        let scope = self.selector.to_string();
        self.ctx.emit(ProgressEvent::ScopeStarted {
            kind: KIND,
            scope: scope.clone(),
        });

        match self.open_library().await {
            Ok(Some(stream)) => {
                if !self.ctx.dry_run {
                    ensure_writable_root(&self.local_root).await?;
                }
                let state = self.pass(stream, report).await;
                self.finish(state, &scope, report).await
            }
            Ok(None) => {
                let message = format!("{scope} library not available for this account");
                info!("{message}");
                self.ctx.emit(ProgressEvent::Warning { message });
                Ok(())
            }
            Err(e) if e.is_run_fatal() => Err(e),
            Err(e) => {
                warn!(library = %scope, error = %e, "Cannot enumerate library");
                self.fail(&mut report.failures, &scope, &e.to_string());
                Ok(())
            }
        }
    }

    async fn open_library(&self) -> Result<Option<ItemStream>, SyncError> {
        let selector = &self.selector;
        let exists = with_retry("check library", self.ctx.retry, || async {
            Ok(self.library.has_library(selector).await?)
        })
        .await?;
        if !exists {
            return Ok(None);
        }
        let stream = with_retry("enumerate library", self.ctx.retry, || async {
            Ok(self.library.enumerate_items(selector).await?)
        })
        .await?;
        Ok(Some(stream))
    }

    async fn pass(
        &self,
        mut stream: ItemStream,
        report: &mut RunReport,
    ) -> PassState {
        let mut state = PassState::default();
        let mut fetches: JoinSet<FetchDone> = JoinSet::new();

        loop {
            if self.ctx.is_cancelled() {
                break;
            }
            let item = match stream.next().await {
                None => {
                    state.enumeration_complete = true;
                    break;
                }
                Some(Ok(item)) => item,
                Some(Err(e)) => {
                    let err = SyncError::from(e);
                    if err.is_run_fatal() {
                        state.fatal = Some(err);
                    } else {
                        warn!(library = %self.selector, error = %err, "Enumeration interrupted");
                        self.fail(&mut report.failures, &self.selector.to_string(), &err.to_string());
                    }
                    break;
                }
            };
            state.items_seen += 1;

            let planned = self.plan_item(item, &mut state).await;
            if state.fatal.is_some() {
                break;
            }
            if let Some(task) = planned {
                let Some(permit) = self.ctx.fetch_slot().await else {
                    break;
                };
                let library = Arc::clone(&self.library);
                let executor = self.ctx.executor.clone();
                fetches.spawn(async move {
                    let (item, relative, local) = task;
                    let result = executor.fetch_item(library.as_ref(), &item, &local).await;
                    drop(permit);
                    FetchDone {
                        item_id: item.id,
                        relative,
                        fingerprint: item.fingerprint,
                        size: item.size,
                        result,
                    }
                });
            }

            while let Some(Some(joined)) = fetches.join_next().now_or_never() {
                self.settle(joined, &mut state, report);
            }
        }

        while let Some(joined) = fetches.join_next().await {
            self.settle(joined, &mut state, report);
        }
        state
    }

    /// Decide what to do with one item
    ///
    /// Returns the fetch to schedule, if any.
    async fn plan_item(
        &self,
        item: RemoteItem,
        state: &mut PassState,
    ) -> Option<(RemoteItem, String, PathBuf)> {
        if item.filename.trim().is_empty() {
            state.stats.skipped += 1;
            self.item_finished(
                item.id.as_str(),
                ItemAction::Skipped {
                    reason: "item has no filename".into(),
                },
                &mut state.stats,
            );
            return None;
        }

        let day = day_dir(item.best_date());
        if self
            .ctx
            .exclusions
            .is_excluded(&join_relative(&day, &item.filename))
        {
            debug!(item = %item.id, filename = %item.filename, "Excluded");
            return None;
        }

        let cached = self.cache.get(&item.id);
        let relative = self.resolve_path(&day, &item.filename, cached.as_ref(), state);
        let file_name = relative
            .rsplit_once('/')
            .map_or(relative.as_str(), |(_, name)| name)
            .to_string();
        state.days.entry(day).or_default().file(file_name);
        let local = self.local_root.join(&relative);

        if self.is_current(&item, &relative, cached.as_ref(), &local).await {
            if let Some(fp) = &item.fingerprint {
                state.by_fingerprint.insert(fp.clone(), local);
            }
            self.item_finished(&relative, ItemAction::Unchanged, &mut state.stats);
            return None;
        }

        if self.ctx.dry_run {
            state.stats.fetched += 1;
            self.item_finished(&relative, ItemAction::WouldFetch, &mut state.stats);
            return None;
        }

        if let Some(source) = item
            .fingerprint
            .as_ref()
            .and_then(|fp| state.by_fingerprint.get(fp))
            .filter(|source| **source != local)
            .cloned()
        {
            match copy_local(&source, &local, item.best_date()).await {
                Ok(()) => {
                    debug!(from = %source.display(), to = %relative, "Copied duplicate locally");
                    self.remember(&item.id, item.fingerprint.clone(), &relative, item.size);
                    state.stats.fetched += 1;
                    self.item_finished(&relative, ItemAction::Deduplicated, &mut state.stats);
                    return None;
                }
                Err(e) if e.is_run_fatal() => {
                    state.fatal.get_or_insert(e);
                    return None;
                }
                Err(e) => {
                    debug!(error = %e, "Local duplicate copy failed, downloading instead");
                }
            }
        }

        if self.ctx.is_cancelled() {
            return None;
        }
        Some((item, relative, local))
    }

    /// Pick the relative path for an item
    ///
    /// A cached path in the same day directory wins, so collision suffixes
    /// stay stable across runs.
    fn resolve_path(
        &self,
        day: &str,
        filename: &str,
        cached: Option<&ItemCacheEntry>,
        state: &mut PassState,
    ) -> String {
        if let Some(entry) = cached {
            let in_day = entry
                .local_path
                .rsplit_once('/')
                .is_some_and(|(dir, _)| dir == day);
            if in_day && !state.claimed.contains(&entry.local_path) {
                state.claimed.insert(entry.local_path.clone());
                return entry.local_path.clone();
            }
        }

        let mut candidate = join_relative(day, filename);
        let mut n = 1;
        while state.claimed.contains(&candidate) {
            candidate = join_relative(day, &suffixed_name(filename, n));
            n += 1;
        }
        state.claimed.insert(candidate.clone());
        candidate
    }

    /// Whether the local copy already matches the item
    async fn is_current(
        &self,
        item: &RemoteItem,
        relative: &str,
        cached: Option<&ItemCacheEntry>,
        local: &Path,
    ) -> bool {
        match cached {
            Some(entry) => {
                entry.local_path == relative
                    && entry.is_valid_for(item.fingerprint.as_ref(), item.size)
                    && match item.size {
                        Some(size) => local_matches_size(local, size).await,
                        None => tokio::fs::metadata(local).await.is_ok_and(|m| m.is_file()),
                    }
            }
            // Without a cache entry a same-size local file is adopted.
            None => match item.size {
                Some(size) if local_matches_size(local, size).await => {
                    if !self.ctx.dry_run {
                        self.remember(&item.id, item.fingerprint.clone(), relative, item.size);
                    }
                    true
                }
                _ => false,
            },
        }
    }

    fn settle(
        &self,
        joined: Result<FetchDone, JoinError>,
        state: &mut PassState,
        report: &mut RunReport,
    ) {
        let done = match joined {
            Ok(done) => done,
            Err(e) => {
                state.stats.failed += 1;
                let reason = format!("fetch task aborted: {e}");
                self.fail(&mut report.failures, &self.selector.to_string(), &reason);
                return;
            }
        };

        match done.result {
            Ok(FetchResult {
                bytes_written,
                outcome: FetchOutcome::Written,
            }) => {
                self.remember(&done.item_id, done.fingerprint.clone(), &done.relative, done.size);
                if let Some(fp) = done.fingerprint {
                    state
                        .by_fingerprint
                        .insert(fp, self.local_root.join(&done.relative));
                }
                state.stats.fetched += 1;
                state.stats.bytes += bytes_written;
                self.item_finished(
                    &done.relative,
                    ItemAction::Fetched {
                        bytes: bytes_written,
                    },
                    &mut state.stats,
                );
            }
            Ok(FetchResult {
                outcome: FetchOutcome::Skipped { reason },
                ..
            }) => {
                state.stats.skipped += 1;
                self.fail(&mut report.failures, &done.relative, &reason);
                self.item_finished(&done.relative, ItemAction::Skipped { reason }, &mut state.stats);
            }
            Err(e) if e.is_run_fatal() => {
                state.fatal.get_or_insert(e);
            }
            Err(e) => {
                warn!(path = %done.relative, error = %e, "Fetch failed");
                let reason = e.to_string();
                state.stats.failed += 1;
                self.fail(&mut report.failures, &done.relative, &reason);
                self.item_finished(&done.relative, ItemAction::Failed { reason }, &mut state.stats);
            }
        }
    }

    async fn finish(
        &self,
        mut state: PassState,
        scope: &str,
        report: &mut RunReport,
    ) -> Result<(), SyncError> {
        report.stats_mut(KIND).merge(&state.stats);
        info!(
            library = scope,
            items = state.items_seen,
            fetched = state.stats.fetched,
            failed = state.stats.failed,
            "Library pass finished"
        );

        if let Some(err) = state.fatal {
            return Err(err);
        }
        if self.ctx.is_cancelled() {
            return Ok(());
        }
        if !state.enumeration_complete || state.items_seen == 0 {
            info!(library = scope, "Incomplete or empty enumeration, not reconciling");
            return Ok(());
        }

        let mut result = ReconcileResult::default();
        for (dir, relative) in local_dirs(&self.local_root).await {
            let seen = state.days.remove(&relative).unwrap_or_default().seal();
            result.merge(
                self.reconciler
                    .reconcile_files(&dir, &relative, &seen, &self.ctx.exclusions)
                    .await,
            );
        }

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

        if !self.ctx.dry_run {
            prune_empty_dirs(&self.local_root).await;
        }
        Ok(())
    }

    fn remember(
        &self,
        item_id: &RemoteId,
        fingerprint: Option<Fingerprint>,
        relative: &str,
        size: Option<u64>,
    ) {
        self.cache.put(
            item_id,
            ItemCacheEntry {
                fingerprint,
                local_path: relative.to_string(),
                size,
                recorded_at: Utc::now(),
            },
        );
    }

    fn item_finished(&self, path: &str, action: ItemAction, stats: &mut KindStats) {
        stats.processed += 1;
        self.ctx.emit(ProgressEvent::ItemFinished {
            kind: KIND,
            path: path.to_string(),
            action,
        });
    }

    fn fail(&self, failures: &mut Vec<ItemFailure>, path: &str, reason: &str) {
        failures.push(ItemFailure {
            kind: KIND,
            path: path.to_string(),
            reason: reason.to_string(),
        });
    }
}

/// Copy a local file atomically, preserving `modified` when given
async fn copy_local(
    from: &Path,
    to: &Path,
    modified: Option<DateTime<Utc>>,
) -> Result<(), SyncError> {
    if let Some(parent) = to.parent() {
        tokio::fs::create_dir_all(parent)
            .await
            .map_err(|e| SyncError::from_write(parent.to_path_buf(), e))?;
    }
    let tmp = temp_path_for(to);
    if let Err(e) = tokio::fs::copy(from, &tmp).await {
        let _ = tokio::fs::remove_file(&tmp).await;
        return Err(SyncError::LocalIo {
            path: from.to_path_buf(),
            source: e,
        });
    }
    if let Some(modified) = modified {
        set_mtime(&tmp, modified).await;
    }
    if let Err(e) = tokio::fs::rename(&tmp, to).await {
        let _ = tokio::fs::remove_file(&tmp).await;
        return Err(SyncError::from_write(to.to_path_buf(), e));
    }
    Ok(())
}

async fn set_mtime(path: &Path, modified: DateTime<Utc>) {
    let opened = tokio::fs::OpenOptions::new().write(true).open(path).await;
    let result = match opened {
        Ok(file) => file.into_std().await.set_modified(modified.into()),
        Err(e) => Err(e),
    };
    if let Err(e) = result {
        warn!(path = %path.display(), error = %e, "Could not set modification time");
    }
}

/// Every directory below `root` (excluding `root`), with its relative path
async fn local_dirs(root: &Path) -> Vec<(PathBuf, String)> {
    let root = root.to_path_buf();
    let walk = tokio::task::spawn_blocking(move || {
        let mut dirs = Vec::new();
        let mut stack = vec![(root, String::new())];
        while let Some((dir, relative)) = stack.pop() {
            let Ok(entries) = std::fs::read_dir(&dir) else {
                continue;
            };
            for entry in entries.flatten() {
                let name = entry.file_name().to_string_lossy().into_owned();
                if is_temp_name(&name) || !entry.file_type().is_ok_and(|t| t.is_dir()) {
                    continue;
                }
                let child = (entry.path(), join_relative(&relative, &name));
                dirs.push(child.clone());
                stack.push(child);
            }
        }
        dirs.sort_by(|a, b| a.1.cmp(&b.1));
        dirs
    });
    walk.await.unwrap_or_default()
}
