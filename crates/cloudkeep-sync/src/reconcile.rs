//! Reconciler
//!
//! Applies the sync policy to local files whose remote counterpart is gone.
//!
//! ## Scope
//!
//! File reconciliation is non-recursive: one call handles the files
//! directly inside one directory. [`Reconciler::reconcile_orphan_dirs`]
//! handles the other case, local subdirectories whose remote folder
//! disappeared, by applying the policy to every file below them.
//!
//! Engine temp files and excluded paths are never touched. Names protected
//! in the seen set (skipped shared folders, excluded subfolders) are never
//! treated as orphans.

use std::io;
use std::path::{Path, PathBuf};

use tracing::{debug, info, warn};

use cloudkeep_core::domain::{BackupKind, ItemFailure, SyncPolicy};

use crate::exclude::{join_relative, ExclusionSet};
use crate::fetch::{is_temp_name, temp_path_for};
use crate::seen::SealedSeenSet;

/// Counts of one reconciliation pass
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ReconcileResult {
    pub removed: u64,
    pub archived: u64,
    pub failures: Vec<ItemFailure>,
}

impl ReconcileResult {
    pub fn merge(&mut self, other: ReconcileResult) {
        self.removed += other.removed;
        self.archived += other.archived;
        self.failures.extend(other.failures);
    }

    /// Whether anything was removed or archived
    pub fn changed(&self) -> bool {
        self.removed + self.archived > 0
    }
}

/// Applies one policy for one backup kind
#[derive(Debug, Clone)]
pub struct Reconciler {
    kind: BackupKind,
    policy: SyncPolicy,
    archive_dir: PathBuf,
    dry_run: bool,
}

impl Reconciler {
    /// # Arguments
    ///
    /// * `kind` - Backup kind, used in failure records
    /// * `policy` - What to do with vanished files
    /// * `archive_dir` - Archive counterpart of the kind's local root
    /// * `dry_run` - Count actions without performing them
    pub fn new(kind: BackupKind, policy: SyncPolicy, archive_dir: PathBuf, dry_run: bool) -> Self {
        Self {
            kind,
            policy,
            archive_dir,
            dry_run,
        }
    }

    pub fn policy(&self) -> SyncPolicy {
        self.policy
    }

    /// Reconcile the files directly inside `dir`
    ///
    /// `relative` is the path of `dir` relative to the kind's local root;
    /// it is used for exclusion checks and for the archive location.
    pub async fn reconcile_files(
        &self,
        dir: &Path,
        relative: &str,
        seen: &SealedSeenSet,
        exclusions: &ExclusionSet,
    ) -> ReconcileResult {
        let mut result = ReconcileResult::default();
        if self.policy == SyncPolicy::Keep {
            return result;
        }

        for name in self.local_entries(dir, false).await {
            if seen.has_file(&name) {
                continue;
            }
            let rel = join_relative(relative, &name);
            if exclusions.is_excluded(&rel) {
                continue;
            }
            self.apply(&dir.join(&name), &rel, &mut result).await;
        }

        result
    }

    /// Reconcile subdirectories of `dir` that are no longer remote folders
    pub async fn reconcile_orphan_dirs(
        &self,
        dir: &Path,
        relative: &str,
        seen: &SealedSeenSet,
        exclusions: &ExclusionSet,
    ) -> ReconcileResult {
        let mut result = ReconcileResult::default();
        if self.policy == SyncPolicy::Keep {
            return result;
        }

        for name in self.local_entries(dir, true).await {
            if seen.keeps_folder(&name) {
                continue;
            }
            let rel = join_relative(relative, &name);
            if exclusions.prunes_folder(&rel) {
                continue;
            }
            info!(path = %rel, policy = %self.policy, "Remote folder gone");
            self.apply_tree(dir.join(&name), rel, exclusions, &mut result)
                .await;
        }

        result
    }

    /// Free `path` for a remote entry of the other type
    ///
    /// A remote file may replace a local directory of the same name, and a
    /// remote folder may replace a local file. The local entry gets the
    /// policy like any vanished item. Returns whether `path` is free (or
    /// already of the wanted type) afterwards; under keep, or when the
    /// directory still holds excluded files, the local entry stays and the
    /// caller must skip the remote one.
    pub async fn clear_type_conflict(
        &self,
        path: &Path,
        relative: &str,
        want_dir: bool,
        exclusions: &ExclusionSet,
        result: &mut ReconcileResult,
    ) -> bool {
        let is_dir = match tokio::fs::symlink_metadata(path).await {
            Ok(meta) => meta.is_dir(),
            Err(e) if e.kind() == io::ErrorKind::NotFound => return true,
            Err(e) => {
                self.fail(relative, "inspect", &e, result);
                return false;
            }
        };
        if is_dir == want_dir {
            return true;
        }

        if self.policy == SyncPolicy::Keep {
            warn!(path = relative, "Local entry has the wrong type, keeping it");
            return false;
        }
        info!(path = relative, policy = %self.policy, local_dir = is_dir, "Remote type changed");

        if is_dir {
            self.apply_tree(path.to_path_buf(), relative.to_string(), exclusions, result)
                .await;
            if self.dry_run {
                return true;
            }
            prune_empty_dirs(path).await;
            match tokio::fs::remove_dir(path).await {
                Ok(()) => true,
                Err(e) => {
                    self.fail(relative, "remove directory", &e, result);
                    false
                }
            }
        } else {
            let failures = result.failures.len();
            self.apply(path, relative, result).await;
            self.dry_run || result.failures.len() == failures
        }
    }

    /// Apply the policy to every non-excluded file below `dir`
    async fn apply_tree(
        &self,
        dir: PathBuf,
        relative: String,
        exclusions: &ExclusionSet,
        result: &mut ReconcileResult,
    ) {
        let mut stack = vec![(dir, relative)];
        while let Some((dir, relative)) = stack.pop() {
            for name in self.local_entries(&dir, false).await {
                let rel = join_relative(&relative, &name);
                if !exclusions.is_excluded(&rel) {
                    self.apply(&dir.join(&name), &rel, result).await;
                }
            }
            for name in self.local_entries(&dir, true).await {
                let rel = join_relative(&relative, &name);
                if !exclusions.prunes_folder(&rel) {
                    stack.push((dir.join(&name), rel));
                }
            }
        }
    }

    async fn apply(&self, path: &Path, relative: &str, result: &mut ReconcileResult) {
        if self.dry_run {
            debug!(path = relative, policy = %self.policy, "Dry run: would reconcile");
            match self.policy {
                SyncPolicy::Delete => result.removed += 1,
                SyncPolicy::Archive => result.archived += 1,
                SyncPolicy::Keep => {}
            }
            return;
        }

        match self.policy {
            SyncPolicy::Keep => {}
            SyncPolicy::Delete => match tokio::fs::remove_file(path).await {
                Ok(()) => {
                    info!(path = relative, "Deleted (removed remotely)");
                    result.removed += 1;
                }
                Err(e) => self.fail(relative, "delete", &e, result),
            },
            SyncPolicy::Archive => {
                let target = self.archive_dir.join(relative);
                match move_file(path, &target).await {
                    Ok(()) => {
                        info!(path = relative, target = %target.display(), "Archived (removed remotely)");
                        result.archived += 1;
                    }
                    Err(e) => self.fail(relative, "archive", &e, result),
                }
            }
        }
    }

    fn fail(&self, relative: &str, action: &str, err: &io::Error, result: &mut ReconcileResult) {
        warn!(path = relative, error = %err, "Failed to {action}");
        result.failures.push(ItemFailure {
            kind: self.kind,
            path: relative.to_string(),
            reason: format!("{action} failed: {err}"),
        });
    }

    /// Sorted names of regular files (`dirs == false`) or directories
    /// directly inside `dir`, skipping engine temp files
    async fn local_entries(&self, dir: &Path, dirs: bool) -> Vec<String> {
        let mut names = Vec::new();
        let mut entries = match tokio::fs::read_dir(dir).await {
            Ok(entries) => entries,
            Err(e) if e.kind() == io::ErrorKind::NotFound => return names,
            Err(e) => {
                warn!(dir = %dir.display(), error = %e, "Cannot list local directory");
                return names;
            }
        };

        while let Ok(Some(entry)) = entries.next_entry().await {
            let Ok(file_type) = entry.file_type().await else {
                continue;
            };
            let name = entry.file_name().to_string_lossy().into_owned();
            if is_temp_name(&name) {
                continue;
            }
            let wanted = if dirs {
                file_type.is_dir()
            } else {
                file_type.is_file()
            };
            if wanted {
                names.push(name);
            }
        }
        names.sort();
        names
    }
}

/// Move `from` to `to`, overwriting an existing target
///
/// Falls back to copy, fsync, rename, remove when a rename crosses
/// filesystems. If the final remove fails the copy is kept and the error
/// is returned, so the file exists twice rather than not at all.
pub async fn move_file(from: &Path, to: &Path) -> io::Result<()> {
    if let Some(parent) = to.parent() {
        tokio::fs::create_dir_all(parent).await?;
    }

    match tokio::fs::rename(from, to).await {
        Ok(()) => return Ok(()),
        Err(e) if e.raw_os_error() == Some(libc::EXDEV) => {
            debug!(from = %from.display(), "Cross-device move, copying");
        }
        Err(e) => return Err(e),
    }

    copy_into_place(from, to).await?;
    tokio::fs::remove_file(from).await
}

/// Copy `from` to a temp sibling of `to`, fsync it, then rename over `to`
///
/// An existing `to` is replaced only by a complete copy.
async fn copy_into_place(from: &Path, to: &Path) -> io::Result<()> {
    let tmp = temp_path_for(to);
    let copied = async {
        tokio::fs::copy(from, &tmp).await?;
        tokio::fs::File::open(&tmp).await?.sync_all().await?;
        tokio::fs::rename(&tmp, to).await
    }
    .await;
    if copied.is_err() {
        let _ = tokio::fs::remove_file(&tmp).await;
    }
    copied
}

/// Remove empty directories below `root`, deepest first
///
/// `root` itself is kept. Returns the number of directories removed.
pub async fn prune_empty_dirs(root: &Path) -> u64 {
    let root = root.to_path_buf();
    match tokio::task::spawn_blocking(move || prune_blocking(&root, true)).await {
        Ok(count) => count,
        Err(e) => {
            warn!(error = %e, "Empty directory pruning panicked");
            0
        }
    }
}

fn prune_blocking(dir: &Path, is_root: bool) -> u64 {
    let Ok(entries) = std::fs::read_dir(dir) else {
        return 0;
    };

    let mut removed = 0;
    let mut remaining = 0;
    for entry in entries.flatten() {
        let path = entry.path();
        if entry.file_type().map(|t| t.is_dir()).unwrap_or(false) {
            removed += prune_blocking(&path, false);
            if path.exists() {
                remaining += 1;
            }
        } else {
            remaining += 1;
        }
    }

    if !is_root && remaining == 0 && std::fs::remove_dir(dir).is_ok() {
        debug!(dir = %dir.display(), "Removed empty directory");
        removed += 1;
    }
    removed
}

#[cfg(test)]
mod tests {
    use tempfile::TempDir;

    use cloudkeep_core::domain::ExclusionRule;

    use super::*;
    use crate::seen::SeenSetBuilder;

    fn touch(path: &Path) {
        std::fs::create_dir_all(path.parent().unwrap()).unwrap();
        std::fs::write(path, b"x").unwrap();
    }

    fn seen(files: &[&str], folders: &[&str]) -> SealedSeenSet {
        let mut builder = SeenSetBuilder::new();
        for f in files {
            builder.file(*f);
        }
        for f in folders {
            builder.folder(*f);
        }
        builder.seal()
    }

    #[tokio::test]
    async fn delete_removes_only_unseen_files() {
        let dir = TempDir::new().unwrap();
        let local = dir.path().join("drive/Docs");
        touch(&local.join("keep.txt"));
        touch(&local.join("gone.txt"));
        touch(&local.join(".gone.txt.abc.cktmp"));

        let reconciler = Reconciler::new(
            BackupKind::Drive,
            SyncPolicy::Delete,
            dir.path().join("archive"),
            false,
        );
        let result = reconciler
            .reconcile_files(&local, "Docs", &seen(&["keep.txt"], &[]), &ExclusionSet::default())
            .await;

        assert_eq!(result.removed, 1);
        assert!(local.join("keep.txt").exists());
        assert!(!local.join("gone.txt").exists());
        assert!(local.join(".gone.txt.abc.cktmp").exists());
    }

    #[tokio::test]
    async fn keep_touches_nothing() {
        let dir = TempDir::new().unwrap();
        touch(&dir.path().join("gone.txt"));

        let reconciler =
            Reconciler::new(BackupKind::Photos, SyncPolicy::Keep, dir.path().join("a"), false);
        let result = reconciler
            .reconcile_files(dir.path(), "", &seen(&[], &[]), &ExclusionSet::default())
            .await;

        assert_eq!(result, ReconcileResult::default());
        assert!(dir.path().join("gone.txt").exists());
    }

    #[tokio::test]
    async fn archive_mirrors_relative_path_and_overwrites() {
        let dir = TempDir::new().unwrap();
        let local = dir.path().join("drive/Docs/sub");
        let archive = dir.path().join("archive/drive");
        std::fs::create_dir_all(&local).unwrap();
        std::fs::write(local.join("a.txt"), b"new").unwrap();
        std::fs::create_dir_all(archive.join("Docs/sub")).unwrap();
        std::fs::write(archive.join("Docs/sub/a.txt"), b"old").unwrap();

        let reconciler = Reconciler::new(BackupKind::Drive, SyncPolicy::Archive, archive.clone(), false);
        let result = reconciler
            .reconcile_files(&local, "Docs/sub", &seen(&[], &[]), &ExclusionSet::default())
            .await;

        assert_eq!(result.archived, 1);
        assert!(!local.join("a.txt").exists());
        assert_eq!(std::fs::read(archive.join("Docs/sub/a.txt")).unwrap(), b"new");
    }

    #[tokio::test]
    async fn excluded_files_are_invisible() {
        let dir = TempDir::new().unwrap();
        touch(&dir.path().join("Docs/a.tmp"));
        touch(&dir.path().join("Docs/b.txt"));

        let exclusions = ExclusionSet::new(vec![ExclusionRule::parse("Docs/*.tmp").unwrap()]);
        let reconciler =
            Reconciler::new(BackupKind::Drive, SyncPolicy::Delete, dir.path().join("x"), false);
        let result = reconciler
            .reconcile_files(&dir.path().join("Docs"), "Docs", &seen(&[], &[]), &exclusions)
            .await;

        assert_eq!(result.removed, 1);
        assert!(dir.path().join("Docs/a.tmp").exists());
    }

    #[tokio::test]
    async fn orphan_dirs_get_the_policy_but_protected_names_do_not() {
        let dir = TempDir::new().unwrap();
        let root = dir.path().join("drive");
        touch(&root.join("Docs/old/deep/a.txt"));
        touch(&root.join("Docs/live/b.txt"));
        touch(&root.join("Docs/shared/c.txt"));

        let mut builder = SeenSetBuilder::new();
        builder.folder("live");
        builder.protect("shared");
        let seen = builder.seal();

        let archive = dir.path().join("archive/drive");
        let reconciler = Reconciler::new(BackupKind::Drive, SyncPolicy::Archive, archive.clone(), false);
        let result = reconciler
            .reconcile_orphan_dirs(&root.join("Docs"), "Docs", &seen, &ExclusionSet::default())
            .await;

        assert_eq!(result.archived, 1);
        assert!(archive.join("Docs/old/deep/a.txt").exists());
        assert!(root.join("Docs/live/b.txt").exists());
        assert!(root.join("Docs/shared/c.txt").exists());

        assert_eq!(prune_empty_dirs(&root).await, 2);
        assert!(!root.join("Docs/old").exists());
        assert!(root.join("Docs").exists());
    }

    #[tokio::test]
    async fn copy_into_place_replaces_target_without_leftovers() {
        let dir = TempDir::new().unwrap();
        let from = dir.path().join("a.txt");
        let to = dir.path().join("archive/a.txt");
        std::fs::write(&from, b"new").unwrap();
        touch(&to);

        copy_into_place(&from, &to).await.unwrap();

        assert_eq!(std::fs::read(&to).unwrap(), b"new");
        assert_eq!(std::fs::read_dir(to.parent().unwrap()).unwrap().count(), 1);
    }

    #[tokio::test]
    async fn failed_copy_leaves_target_intact() {
        let dir = TempDir::new().unwrap();
        let to = dir.path().join("archive/a.txt");
        std::fs::create_dir_all(to.parent().unwrap()).unwrap();
        std::fs::write(&to, b"old").unwrap();

        let err = copy_into_place(&dir.path().join("missing.txt"), &to).await;

        assert!(err.is_err());
        assert_eq!(std::fs::read(&to).unwrap(), b"old");
        assert_eq!(std::fs::read_dir(to.parent().unwrap()).unwrap().count(), 1);
    }

    #[tokio::test]
    async fn directory_replaced_by_file_is_cleared_under_delete() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("Docs/sub");
        touch(&path.join("deep/a.txt"));
        touch(&path.join("b.txt"));

        let reconciler =
            Reconciler::new(BackupKind::Drive, SyncPolicy::Delete, dir.path().join("x"), false);
        let mut result = ReconcileResult::default();
        let free = reconciler
            .clear_type_conflict(&path, "Docs/sub", false, &ExclusionSet::default(), &mut result)
            .await;

        assert!(free);
        assert_eq!(result.removed, 2);
        assert!(!path.exists());
    }

    #[tokio::test]
    async fn file_replaced_by_folder_is_archived() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("drive/Docs/sub");
        touch(&path);
        let archive = dir.path().join("archive/drive");

        let reconciler = Reconciler::new(BackupKind::Drive, SyncPolicy::Archive, archive.clone(), false);
        let mut result = ReconcileResult::default();
        let free = reconciler
            .clear_type_conflict(&path, "Docs/sub", true, &ExclusionSet::default(), &mut result)
            .await;

        assert!(free);
        assert_eq!(result.archived, 1);
        assert!(archive.join("Docs/sub").is_file());
        assert!(!path.exists());
    }

    #[tokio::test]
    async fn type_conflict_under_keep_leaves_the_entry() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("sub");
        touch(&path);

        let reconciler =
            Reconciler::new(BackupKind::Drive, SyncPolicy::Keep, dir.path().join("x"), false);
        let mut result = ReconcileResult::default();

        assert!(
            !reconciler
                .clear_type_conflict(&path, "sub", true, &ExclusionSet::default(), &mut result)
                .await
        );
        assert!(path.is_file());
        // matching type and absent paths need nothing
        assert!(
            reconciler
                .clear_type_conflict(&path, "sub", false, &ExclusionSet::default(), &mut result)
                .await
        );
        assert!(
            reconciler
                .clear_type_conflict(&dir.path().join("none"), "none", true, &ExclusionSet::default(), &mut result)
                .await
        );
    }

    #[tokio::test]
    async fn excluded_files_keep_a_conflicting_directory() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("sub");
        touch(&path.join("a.tmp"));
        touch(&path.join("b.txt"));

        let exclusions = ExclusionSet::new(vec![ExclusionRule::parse("sub/*.tmp").unwrap()]);
        let reconciler =
            Reconciler::new(BackupKind::Drive, SyncPolicy::Delete, dir.path().join("x"), false);
        let mut result = ReconcileResult::default();
        let free = reconciler
            .clear_type_conflict(&path, "sub", false, &exclusions, &mut result)
            .await;

        assert!(!free);
        assert_eq!(result.removed, 1);
        assert!(path.join("a.tmp").exists());
        assert_eq!(result.failures.len(), 1);
    }

    #[tokio::test]
    async fn dry_run_counts_without_acting() {
        let dir = TempDir::new().unwrap();
        touch(&dir.path().join("gone.txt"));

        let reconciler =
            Reconciler::new(BackupKind::Drive, SyncPolicy::Delete, dir.path().join("a"), true);
        let result = reconciler
            .reconcile_files(dir.path(), "", &seen(&[], &[]), &ExclusionSet::default())
            .await;

        assert_eq!(result.removed, 1);
        assert!(dir.path().join("gone.txt").exists());
    }
}
