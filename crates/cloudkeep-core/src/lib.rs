//! cloudkeep Core - Domain types and port definitions
//!
//! This crate contains the hexagonal architecture core with:
//! - **Domain types** - `RemoteNode`, `RemoteItem`, `ExclusionRule`, `SyncPolicy`,
//!   `BackupPlan`, `RunProgress`, `RunReport`
//! - **Port definitions** - Traits for adapters: `ITreeSource`, `IMediaLibrary`,
//!   `IFolderCache`, `IItemCache`, `ICacheStore`, `IRunStatusStore`, `IProgressSink`
//! - **Configuration** - YAML configuration with validation and a builder
//!
//! # Architecture
//!
//! The domain module contains pure data and rules with no I/O.
//! Ports define trait interfaces that adapter crates implement: the cache
//! crate persists change-detection state, the sync crate drives a backup
//! run against whichever remote source adapter it is given.

pub mod config;
pub mod domain;
pub mod ports;
