//! Seen sets
//!
//! A seen set records which remote names currently exist in one
//! destination directory. It is filled while a folder or library is being
//! processed and consumed once by reconciliation.
//!
//! The two phases are separate types: [`SeenSetBuilder`] is mutable and
//! cannot be reconciled against; [`SealedSeenSet`] is immutable and can
//! only be obtained by consuming a builder with [`SeenSetBuilder::seal`].
//! Callers seal a builder only after every fetch that targets the
//! directory has reached a terminal outcome.

use std::collections::HashSet;

/// Mutable seen set under construction
#[derive(Debug, Default)]
pub struct SeenSetBuilder {
    files: HashSet<String>,
    folders: HashSet<String>,
    protected: HashSet<String>,
}

impl SeenSetBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record a remote file name
    pub fn file(&mut self, name: impl Into<String>) {
        self.files.insert(name.into());
    }

    /// Record a remote subfolder name
    pub fn folder(&mut self, name: impl Into<String>) {
        self.folders.insert(name.into());
    }

    /// Record a name that reconciliation must never touch, such as a shared
    /// folder that was skipped or an excluded subfolder
    pub fn protect(&mut self, name: impl Into<String>) {
        self.protected.insert(name.into());
    }

    /// Whether a file name has already been recorded
    pub fn contains_file(&self, name: &str) -> bool {
        self.files.contains(name)
    }

    pub fn file_count(&self) -> usize {
        self.files.len()
    }

    /// Freeze the set for reconciliation
    #[must_use]
    pub fn seal(self) -> SealedSeenSet {
        SealedSeenSet {
            files: self.files,
            folders: self.folders,
            protected: self.protected,
        }
    }
}

/// Immutable, complete seen set of one directory
#[derive(Debug)]
pub struct SealedSeenSet {
    files: HashSet<String>,
    folders: HashSet<String>,
    protected: HashSet<String>,
}

impl SealedSeenSet {
    /// Whether a local file of this name still exists remotely
    pub fn has_file(&self, name: &str) -> bool {
        self.files.contains(name)
    }

    /// Whether a local subdirectory must be left alone
    pub fn keeps_folder(&self, name: &str) -> bool {
        self.folders.contains(name) || self.protected.contains(name)
    }

    pub fn file_count(&self) -> usize {
        self.files.len()
    }
}
