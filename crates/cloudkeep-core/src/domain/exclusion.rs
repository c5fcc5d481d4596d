//! Exclusion rules
//!
//! Rules are matched against the path relative to a backup root, using `/`
//! as separator regardless of platform. A rule containing `*`, `?` or `[`
//! is a glob; anything else is a literal path prefix.

use std::fmt;

use glob::{MatchOptions, Pattern};
use serde::{Deserialize, Serialize};

use super::errors::DomainError;

/// Glob options shared by every rule: `*` and `?` never cross `/`.
const MATCH_OPTIONS: MatchOptions = MatchOptions {
    case_sensitive: true,
    require_literal_separator: true,
    require_literal_leading_dot: false,
};

/// A single exclusion rule
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub enum ExclusionRule {
    /// Glob matched against the full relative path
    Glob(Pattern),
    /// Path prefix matched on whole segments
    Literal(String),
}

impl ExclusionRule {
    /// Parse a rule as written in the configuration
    ///
    /// # Errors
    /// Returns `DomainError::InvalidExclusionRule` for empty rules or globs
    /// that do not compile.
    pub fn parse(raw: &str) -> Result<Self, DomainError> {
        let normalized = normalize_path(raw);
        if normalized.is_empty() {
            return Err(DomainError::InvalidExclusionRule {
                rule: raw.to_string(),
                reason: "rule is empty".to_string(),
            });
        }

        if normalized.contains(['*', '?', '[']) {
            let pattern =
                Pattern::new(&normalized).map_err(|e| DomainError::InvalidExclusionRule {
                    rule: raw.to_string(),
                    reason: e.msg.to_string(),
                })?;
            Ok(ExclusionRule::Glob(pattern))
        } else {
            Ok(ExclusionRule::Literal(normalized))
        }
    }

    /// Whether this rule matches a file or folder at `relative_path`
    pub fn matches(&self, relative_path: &str) -> bool {
        let path = normalize_path(relative_path);
        self.matches_normalized(&path)
    }

    /// Whether this rule removes a whole folder from traversal
    ///
    /// Literal rules prune the folder they name. Glob rules prune a folder
    /// only when they match its path and their last segment is more than
    /// bare wildcards, so `Photos/*` excludes the files directly inside
    /// `Photos/` while `**/node_modules` prunes every `node_modules` folder.
    pub fn prunes_folder(&self, relative_path: &str) -> bool {
        let path = normalize_path(relative_path);
        match self {
            ExclusionRule::Literal(_) => self.matches_normalized(&path),
            ExclusionRule::Glob(pattern) => {
                let last = pattern.as_str().rsplit('/').next().unwrap_or_default();
                let names_something = last.chars().any(|c| !matches!(c, '*' | '?'));
                names_something && pattern.matches_with(&path, MATCH_OPTIONS)
            }
        }
    }

    /// The rule as normalized text
    pub fn as_str(&self) -> &str {
        match self {
            ExclusionRule::Glob(pattern) => pattern.as_str(),
            ExclusionRule::Literal(prefix) => prefix,
        }
    }

    fn matches_normalized(&self, path: &str) -> bool {
        match self {
            ExclusionRule::Glob(pattern) => pattern.matches_with(path, MATCH_OPTIONS),
            ExclusionRule::Literal(prefix) => {
                path == prefix
                    || (path.len() > prefix.len()
                        && path.starts_with(prefix.as_str())
                        && path.as_bytes()[prefix.len()] == b'/')
            }
        }
    }
}

impl fmt::Display for ExclusionRule {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl TryFrom<String> for ExclusionRule {
    type Error = DomainError;

    fn try_from(s: String) -> Result<Self, Self::Error> {
        Self::parse(&s)
    }
}

impl From<ExclusionRule> for String {
    fn from(rule: ExclusionRule) -> Self {
        rule.as_str().to_string()
    }
}

/// Normalize a relative path: `/` separators, no leading `./` or `/`,
/// no trailing `/`, no surrounding whitespace.
pub fn normalize_path(raw: &str) -> String {
    let replaced = raw.trim().replace('\\', "/");
    let mut path = replaced.as_str();
    while let Some(rest) = path.strip_prefix("./") {
        path = rest;
    }
    path.trim_matches('/').to_string()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn rule(s: &str) -> ExclusionRule {
        ExclusionRule::parse(s).unwrap()
    }

    #[test]
    fn parse_distinguishes_glob_and_literal() {
        assert!(matches!(rule("*.tmp"), ExclusionRule::Glob(_)));
        assert!(matches!(rule("a/b?"), ExclusionRule::Glob(_)));
        assert!(matches!(rule("Documents/old"), ExclusionRule::Literal(_)));
    }

    #[test]
    fn parse_rejects_empty_and_broken_globs() {
        assert!(ExclusionRule::parse("").is_err());
        assert!(ExclusionRule::parse(" / ").is_err());
        assert!(ExclusionRule::parse("[a").is_err());
    }

    #[test]
    fn literal_matches_whole_segments_only() {
        let r = rule("Documents/subfolder");
        assert!(r.matches("Documents/subfolder"));
        assert!(r.matches("Documents/subfolder/x.txt"));
        assert!(r.matches("Documents/subfolder/deep/y.txt"));
        assert!(!r.matches("Documents/subfolder2/x.txt"));
        assert!(!r.matches("Documents"));
    }

    #[test]
    fn glob_star_stays_in_one_segment() {
        let r = rule("Medien/*");
        assert!(r.matches("Medien/a.jpg"));
        assert!(!r.matches("Medien/sub/a.jpg"));

        let deep = rule("Medien/**");
        assert!(deep.matches("Medien/sub/a.jpg"));
    }

    #[test]
    fn glob_matches_full_path_not_basename() {
        let r = rule("Documents/subfolder/*.tmp");
        assert!(r.matches("Documents/subfolder/a.tmp"));
        assert!(!r.matches("Documents/other/a.tmp"));
        assert!(!r.matches("a.tmp"));
    }

    #[test]
    fn paths_and_rules_are_normalized() {
        let r = rule("/Documents/old/");
        assert!(r.matches("Documents\\old\\file.txt"));
        assert!(r.matches("./Documents/old"));
        assert_eq!(r.to_string(), "Documents/old");
    }

    #[test]
    fn folder_pruning() {
        assert!(rule("Documents/old").prunes_folder("Documents/old"));
        assert!(rule("**/node_modules").prunes_folder("code/app/node_modules"));
        assert!(!rule("Medien/*").prunes_folder("Medien/sub"));
        assert!(!rule("**").prunes_folder("anything"));
    }

    #[test]
    fn rules_deserialize_from_strings() {
        let rules: Vec<ExclusionRule> =
            serde_yaml::from_str("- \"*.tmp\"\n- Documents/old\n").unwrap();
        assert_eq!(rules.len(), 2);
        assert!(serde_yaml::from_str::<Vec<ExclusionRule>>("- \"[x\"\n").is_err());
    }
}
