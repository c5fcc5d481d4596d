//! Compiled exclusion rules
//!
//! Exclusions apply uniformly at every depth because rules always see the
//! full path relative to the backup root (`Documents/sub/a.tmp` for Drive,
//! `2024/03/15/IMG_1.JPG` for Photos), never just a basename. Excluded
//! paths are invisible to both fetching and reconciliation.

use cloudkeep_core::domain::exclusion::normalize_path;
use cloudkeep_core::domain::ExclusionRule;

/// Returns `true` if any rule matches `relative_path`
///
/// Pure and order-independent.
pub fn is_excluded(relative_path: &str, rules: &[ExclusionRule]) -> bool {
    let path = normalize_path(relative_path);
    rules.iter().any(|rule| rule.matches(&path))
}

/// A set of exclusion rules for one run
#[derive(Debug, Clone, Default)]
pub struct ExclusionSet {
    rules: Vec<ExclusionRule>,
}

impl ExclusionSet {
    pub fn new(rules: Vec<ExclusionRule>) -> Self {
        Self { rules }
    }

    /// Whether a file at `relative_path` is excluded
    pub fn is_excluded(&self, relative_path: &str) -> bool {
        is_excluded(relative_path, &self.rules)
    }

    /// Whether a folder at `relative_path` is removed from traversal
    pub fn prunes_folder(&self, relative_path: &str) -> bool {
        self.rules
            .iter()
            .any(|rule| rule.prunes_folder(relative_path))
    }

    /// The rules matching `relative_path`, for diagnostics
    pub fn matching_rules(&self, relative_path: &str) -> Vec<&ExclusionRule> {
        self.rules
            .iter()
            .filter(|rule| rule.matches(relative_path))
            .collect()
    }

    pub fn is_empty(&self) -> bool {
        self.rules.is_empty()
    }

    pub fn len(&self) -> usize {
        self.rules.len()
    }
}

/// Join a parent relative path and a child name with `/`
pub fn join_relative(parent: &str, name: &str) -> String {
    if parent.is_empty() {
        name.to_string()
    } else {
        format!("{parent}/{name}")
    }
}
