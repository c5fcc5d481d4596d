//! Remote source data model
//!
//! Metadata shapes returned by remote sources vary with account, region
//! and sharing status. Each type here carries the fields the engine
//! relies on as required members, and everything else in an
//! [`ExtraMetadata`] side channel with typed, defaulting accessors.

use std::collections::BTreeMap;
use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::newtypes::{ChangeTag, Fingerprint, RemoteId};

// ============================================================================
// ExtraMetadata
// ============================================================================

/// Source-specific metadata the engine does not model explicitly
///
/// Accessors never assume a key is present: they return `None` or the
/// caller-provided default.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ExtraMetadata(BTreeMap<String, serde_json::Value>);

impl ExtraMetadata {
    /// Create an empty side channel
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert or replace a value, returning `self` for chaining
    #[must_use]
    pub fn with(mut self, key: impl Into<String>, value: impl Into<serde_json::Value>) -> Self {
        self.0.insert(key.into(), value.into());
        self
    }

    /// Raw access to a value
    pub fn get(&self, key: &str) -> Option<&serde_json::Value> {
        self.0.get(key)
    }

    /// String value, if present and a string
    pub fn str(&self, key: &str) -> Option<&str> {
        self.0.get(key).and_then(|v| v.as_str())
    }

    /// Boolean value, or `default` when absent or of another type
    pub fn bool_or(&self, key: &str, default: bool) -> bool {
        self.0.get(key).and_then(|v| v.as_bool()).unwrap_or(default)
    }

    /// Unsigned integer value, or `default` when absent or of another type
    pub fn u64_or(&self, key: &str, default: u64) -> u64 {
        self.0.get(key).and_then(|v| v.as_u64()).unwrap_or(default)
    }

    /// Number of entries
    pub fn len(&self) -> usize {
        self.0.len()
    }

    /// Whether no extra metadata is present
    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

// ============================================================================
// Ownership
// ============================================================================

/// Who owns a remote node or item
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Ownership {
    /// Owned by the backed-up account
    #[default]
    Owned,
    /// Shared with the account by someone else
    SharedWithMe {
        /// Display name or address of the owner, when the source reports it
        owner: Option<String>,
    },
}

impl Ownership {
    /// Whether this is content shared by another account
    pub fn is_shared_with_me(&self) -> bool {
        matches!(self, Ownership::SharedWithMe { .. })
    }
}

// ============================================================================
// RemoteNode (tree source)
// ============================================================================

/// Kind of a node in the remote tree
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum NodeKind {
    Folder,
    File,
}

impl fmt::Display for NodeKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            NodeKind::Folder => write!(f, "folder"),
            NodeKind::File => write!(f, "file"),
        }
    }
}

/// A folder or file in a Drive-like remote hierarchy
///
/// Children of a folder are not embedded; they are listed lazily through
/// the tree source port.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RemoteNode {
    /// Stable identity
    pub id: RemoteId,
    /// Name as shown in the remote listing
    pub name: String,
    /// Folder or file
    pub kind: NodeKind,
    /// Size in bytes (0 for folders)
    pub size: u64,
    /// Listing version marker; folders only, may be absent
    pub change_tag: Option<ChangeTag>,
    /// Parent folder, used to re-resolve the node when a download fails
    pub parent_id: Option<RemoteId>,
    /// Alternate download key some sources accept when the primary id fails
    pub alt_id: Option<String>,
    /// Remote modification time
    pub modified: Option<DateTime<Utc>>,
    /// Owned by the account or shared with it
    #[serde(default)]
    pub ownership: Ownership,
    /// Source-specific fields
    #[serde(default)]
    pub extra: ExtraMetadata,
}

impl RemoteNode {
    /// Create a folder node with only the required fields set
    pub fn folder(id: RemoteId, name: impl Into<String>) -> Self {
        Self {
            id,
            name: name.into(),
            kind: NodeKind::Folder,
            size: 0,
            change_tag: None,
            parent_id: None,
            alt_id: None,
            modified: None,
            ownership: Ownership::Owned,
            extra: ExtraMetadata::new(),
        }
    }

    /// Create a file node with only the required fields set
    pub fn file(id: RemoteId, name: impl Into<String>, size: u64) -> Self {
        Self {
            kind: NodeKind::File,
            size,
            ..Self::folder(id, name)
        }
    }

    /// Whether this node is a folder
    pub fn is_folder(&self) -> bool {
        self.kind == NodeKind::Folder
    }

    /// Whether this node is a folder shared by another account
    ///
    /// Such folders are never traversed or reconciled.
    pub fn is_shared_folder(&self) -> bool {
        self.is_folder() && self.ownership.is_shared_with_me()
    }
}

// ============================================================================
// RemoteItem (flat source)
// ============================================================================

/// Which media library a flat enumeration covers
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(tag = "type", content = "id", rename_all = "snake_case")]
pub enum LibrarySelector {
    /// The account's own library
    Personal,
    /// A shared (family) library identified by the source
    Shared(String),
}

impl LibrarySelector {
    /// Stable key used to separate per-library cache entries
    pub fn cache_key(&self) -> String {
        match self {
            LibrarySelector::Personal => "personal".to_string(),
            LibrarySelector::Shared(id) => format!("shared:{id}"),
        }
    }
}

impl fmt::Display for LibrarySelector {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            LibrarySelector::Personal => write!(f, "personal library"),
            LibrarySelector::Shared(id) => write!(f, "shared library {id}"),
        }
    }
}

/// A media item in a flat, enumerable remote library
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RemoteItem {
    /// Stable identity, unique within one library pass
    pub id: RemoteId,
    /// Display filename; may be empty for broken items
    pub filename: String,
    /// Capture date reported by the asset itself
    pub asset_date: Option<DateTime<Utc>>,
    /// Creation date of the remote record
    pub created: Option<DateTime<Utc>>,
    /// Date the item was added to the library
    pub added: Option<DateTime<Utc>>,
    /// Declared size in bytes
    pub size: Option<u64>,
    /// Content fingerprint
    pub fingerprint: Option<Fingerprint>,
    /// Owned by the account or contributed by another library member
    #[serde(default)]
    pub ownership: Ownership,
    /// Source-specific fields
    #[serde(default)]
    pub extra: ExtraMetadata,
}

impl RemoteItem {
    /// Create an item with only identity and filename set
    pub fn new(id: RemoteId, filename: impl Into<String>) -> Self {
        Self {
            id,
            filename: filename.into(),
            asset_date: None,
            created: None,
            added: None,
            size: None,
            fingerprint: None,
            ownership: Ownership::Owned,
            extra: ExtraMetadata::new(),
        }
    }

    /// The date used to file this item: asset date, then creation, then added
    pub fn best_date(&self) -> Option<DateTime<Utc>> {
        self.asset_date.or(self.created).or(self.added)
    }
}
