//! Domain entities and business rules
//!
//! This module contains the core domain types for cloudkeep:
//! - Newtypes for remote identifiers, change tags and fingerprints
//! - Remote tree nodes and flat media items with their extra metadata
//! - Exclusion rules and sync policies
//! - The resolved backup plan a run executes
//! - Ephemeral run progress and the persisted run report
//! - Domain-specific error types

pub mod errors;
pub mod exclusion;
pub mod newtypes;
pub mod plan;
pub mod policy;
pub mod progress;
pub mod remote;
pub mod report;

// Re-export commonly used types
pub use errors::DomainError;
pub use exclusion::ExclusionRule;
pub use newtypes::*;
pub use plan::{library_dir_name, BackupPlan, DrivePlan, EngineSettings, FolderSelection, PhotosPlan};
pub use policy::{BackupKind, SyncPolicy};
pub use progress::{ItemAction, Phase, ProgressEvent, RunProgress};
pub use remote::{ExtraMetadata, LibrarySelector, NodeKind, Ownership, RemoteItem, RemoteNode};
pub use report::{ItemFailure, KindStats, RunReport, RunStatus};
