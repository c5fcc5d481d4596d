//! Port definitions (hexagonal architecture interfaces)
//!
//! This module defines the port traits that form the boundaries of the
//! hexagonal architecture. Ports are interfaces that the engine depends
//! on, but whose implementations live in adapter crates.
//!
//! ## Ports Overview
//!
//! - [`ITreeSource`] - Hierarchical (Drive-like) remote listing and download
//! - [`IMediaLibrary`] - Flat (Photos-like) remote enumeration and download
//! - [`IFolderCache`] / [`IItemCache`] - Change-detection caches
//! - [`ICacheStore`] - Opens the caches for an account or library
//! - [`IRunStatusStore`] - Write-back of last-run status
//! - [`IProgressSink`] - Progress and event delivery

pub mod cache;
pub mod progress;
pub mod remote_source;
pub mod run_status;

pub use cache::{FolderCacheEntry, ICacheStore, IFolderCache, IItemCache, ItemCacheEntry};
pub use progress::IProgressSink;
pub use remote_source::{IMediaLibrary, ITreeSource, ItemStream, RemoteReader, SourceError};
pub use run_status::IRunStatusStore;
