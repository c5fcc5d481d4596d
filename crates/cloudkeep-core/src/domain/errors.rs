//! Domain error types
//!
//! This module defines error types specific to domain operations,
//! including validation failures and malformed rules or identifiers.

use thiserror::Error;

/// Errors that can occur in domain operations
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum DomainError {
    /// Invalid relative path format or content
    #[error("Invalid path: {0}")]
    InvalidPath(String),

    /// Exclusion rule that cannot be compiled
    #[error("Invalid exclusion rule '{rule}': {reason}")]
    InvalidExclusionRule {
        /// The rule as written by the user
        rule: String,
        /// Why it was rejected
        reason: String,
    },

    /// Unknown sync policy name
    #[error("Invalid sync policy: {0}")]
    InvalidPolicy(String),

    /// Empty or malformed remote identifier
    #[error("Invalid remote ID: {0}")]
    InvalidRemoteId(String),

    /// ID parsing error
    #[error("Invalid ID format: {0}")]
    InvalidId(String),

    /// Generic validation failure
    #[error("Validation failed: {0}")]
    ValidationFailed(String),
}
