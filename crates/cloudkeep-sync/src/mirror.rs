//! Directory-backed remote sources (driven adapters)
//!
//! Implements [`ITreeSource`] and [`IMediaLibrary`] on top of a local
//! directory, so a backup can be taken from a mounted export, a second
//! disk or a test fixture with the same engine that talks to a cloud
//! client.
//!
//! ## Layout
//!
//! - Tree source: any directory. Node ids are `/`-separated paths relative
//!   to it; the root id is [`ROOT_ID`]. A folder containing a
//!   [`SHARED_MARKER`] file is reported as shared with the account.
//! - Media library: `<root>/personal` for the personal library and
//!   `<root>/shared/<id>` for a shared library. Every file below a library
//!   directory is one item whose id is its path relative to `<root>`; its
//!   fingerprint is the SHA-256 of its content.
//!
//! ## Design Decisions
//!
//! - **Folder change tags**: SHA-256 over the sorted `(name, kind, size,
//!   mtime)` of the direct children, so a tag changes exactly when the
//!   listing changes.
//! - **No escapes**: ids containing `..` or absolute components resolve to
//!   not-found.

use std::io;
use std::path::{Component, Path, PathBuf};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use futures_util::stream::{self, StreamExt};
use sha2::{Digest, Sha256};
use tracing::{debug, instrument};

use cloudkeep_core::domain::{
    ChangeTag, Fingerprint, LibrarySelector, Ownership, RemoteId, RemoteItem, RemoteNode,
};
use cloudkeep_core::ports::{IMediaLibrary, ITreeSource, ItemStream, RemoteReader, SourceError};

use crate::exclude::join_relative;
use crate::fetch::is_temp_name;

/// Id of the tree root
pub const ROOT_ID: &str = "/";

/// File marking a folder as shared with the account
pub const SHARED_MARKER: &str = ".cloudkeep-shared";

fn io_error(path: &Path, err: io::Error) -> SourceError {
    let message = format!("{}: {err}", path.display());
    match err.kind() {
        io::ErrorKind::NotFound => SourceError::NotFound(message),
        io::ErrorKind::Interrupted | io::ErrorKind::TimedOut | io::ErrorKind::WouldBlock => {
            SourceError::Transient(message)
        }
        _ => SourceError::Other(message),
    }
}

fn id(value: impl Into<String>) -> Result<RemoteId, SourceError> {
    RemoteId::new(value).map_err(|e| SourceError::Other(e.to_string()))
}

/// Resolve a relative id below `root`, rejecting escapes
fn resolve(root: &Path, relative: &str) -> Result<PathBuf, SourceError> {
    let relative = Path::new(relative);
    if relative
        .components()
        .any(|c| !matches!(c, Component::Normal(_)))
    {
        return Err(SourceError::NotFound(relative.display().to_string()));
    }
    Ok(root.join(relative))
}

fn is_hidden_entry(name: &str) -> bool {
    name == SHARED_MARKER || is_temp_name(name)
}

// ============================================================================
// Tree source
// ============================================================================

/// Tree source backed by a local directory
#[derive(Debug, Clone)]
pub struct DirectoryTreeSource {
    root: PathBuf,
}

impl DirectoryTreeSource {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    fn path_of(&self, node_id: &RemoteId) -> Result<PathBuf, SourceError> {
        match node_id.as_str() {
            ROOT_ID => Ok(self.root.clone()),
            other => resolve(&self.root, other),
        }
    }

    async fn node_at(
        &self,
        relative: &str,
        parent: Option<RemoteId>,
    ) -> Result<RemoteNode, SourceError> {
        let path = if relative.is_empty() {
            self.root.clone()
        } else {
            resolve(&self.root, relative)?
        };
        let meta = tokio::fs::metadata(&path)
            .await
            .map_err(|e| io_error(&path, e))?;
        let node_id = id(if relative.is_empty() { ROOT_ID } else { relative })?;
        let name = relative.rsplit('/').next().unwrap_or_default().to_string();
        let modified = meta.modified().ok().map(DateTime::<Utc>::from);

        if meta.is_dir() {
            let shared = tokio::fs::try_exists(path.join(SHARED_MARKER))
                .await
                .unwrap_or(false);
            Ok(RemoteNode {
                change_tag: Some(folder_tag(&path).await?),
                parent_id: parent,
                modified,
                ownership: if shared {
                    Ownership::SharedWithMe { owner: None }
                } else {
                    Ownership::Owned
                },
                ..RemoteNode::folder(node_id, name)
            })
        } else {
            Ok(RemoteNode {
                parent_id: parent,
                modified,
                ..RemoteNode::file(node_id, name, meta.len())
            })
        }
    }
}

/// Change tag of a directory listing
async fn folder_tag(dir: &Path) -> Result<ChangeTag, SourceError> {
    let mut entries = Vec::new();
    let mut listing = tokio::fs::read_dir(dir)
        .await
        .map_err(|e| io_error(dir, e))?;
    while let Some(entry) = listing.next_entry().await.map_err(|e| io_error(dir, e))? {
        let name = entry.file_name().to_string_lossy().into_owned();
        if is_temp_name(&name) {
            continue;
        }
        let meta = entry.metadata().await.map_err(|e| io_error(dir, e))?;
        let mtime = meta
            .modified()
            .ok()
            .map(|t| DateTime::<Utc>::from(t).timestamp_millis())
            .unwrap_or_default();
        entries.push(format!("{name}\0{}\0{}\0{mtime}", meta.is_dir(), meta.len()));
    }
    entries.sort();

    let mut hasher = Sha256::new();
    for entry in &entries {
        hasher.update(entry.as_bytes());
        hasher.update(b"\n");
    }
    ChangeTag::new(format!("{:x}", hasher.finalize())).map_err(|e| SourceError::Other(e.to_string()))
}

#[async_trait]
impl ITreeSource for DirectoryTreeSource {
    async fn root_id(&self) -> Result<RemoteId, SourceError> {
        if !tokio::fs::metadata(&self.root)
            .await
            .map_err(|e| io_error(&self.root, e))?
            .is_dir()
        {
            return Err(SourceError::Other(format!(
                "{} is not a directory",
                self.root.display()
            )));
        }
        id(ROOT_ID)
    }

    #[instrument(skip(self, node_id), fields(node = %node_id))]
    async fn list_children(&self, node_id: &RemoteId) -> Result<Vec<RemoteNode>, SourceError> {
        let dir = self.path_of(node_id)?;
        let prefix = match node_id.as_str() {
            ROOT_ID => "",
            other => other,
        };

        let mut names = Vec::new();
        let mut listing = tokio::fs::read_dir(&dir)
            .await
            .map_err(|e| io_error(&dir, e))?;
        while let Some(entry) = listing.next_entry().await.map_err(|e| io_error(&dir, e))? {
            let name = entry.file_name().to_string_lossy().into_owned();
            if !is_hidden_entry(&name) {
                names.push(name);
            }
        }
        names.sort();

        let mut children = Vec::with_capacity(names.len());
        for name in names {
            let relative = join_relative(prefix, &name);
            children.push(self.node_at(&relative, Some(node_id.clone())).await?);
        }
        debug!(count = children.len(), "Listed directory");
        Ok(children)
    }

    async fn get_node(&self, node_id: &RemoteId) -> Result<RemoteNode, SourceError> {
        let relative = match node_id.as_str() {
            ROOT_ID => "",
            other => other,
        };
        let parent = match relative.rsplit_once('/') {
            Some((parent, _)) => Some(id(parent)?),
            None if relative.is_empty() => None,
            None => Some(id(ROOT_ID)?),
        };
        self.node_at(relative, parent).await
    }

    async fn open_stream(
        &self,
        node_id: &RemoteId,
        alt_id: Option<&str>,
    ) -> Result<RemoteReader, SourceError> {
        let path = match alt_id {
            Some(alt) => resolve(&self.root, alt)?,
            None => self.path_of(node_id)?,
        };
        let file = tokio::fs::File::open(&path)
            .await
            .map_err(|e| io_error(&path, e))?;
        Ok(Box::new(file))
    }
}

// ============================================================================
// Media library
// ============================================================================

/// Media libraries backed by local directories
#[derive(Debug, Clone)]
pub struct DirectoryMediaLibrary {
    root: PathBuf,
}

impl DirectoryMediaLibrary {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    /// Directory of a library, relative to the media root
    pub fn library_relative(library: &LibrarySelector) -> String {
        match library {
            LibrarySelector::Personal => "personal".to_string(),
            LibrarySelector::Shared(library_id) => format!("shared/{library_id}"),
        }
    }

    /// Directory holding a library's files
    pub fn library_path(&self, library: &LibrarySelector) -> Result<PathBuf, SourceError> {
        resolve(&self.root, &Self::library_relative(library))
    }
}

/// Scan a library directory into items, blocking
///
/// `id_prefix` is the library directory relative to the media root.
fn scan_library(dir: &Path, id_prefix: &str) -> io::Result<Vec<RemoteItem>> {
    let mut files = Vec::new();
    let mut stack = vec![(dir.to_path_buf(), id_prefix.to_string())];
    while let Some((current, relative)) = stack.pop() {
        for entry in std::fs::read_dir(&current)? {
            let entry = entry?;
            let name = entry.file_name().to_string_lossy().into_owned();
            if is_hidden_entry(&name) {
                continue;
            }
            let child = join_relative(&relative, &name);
            if entry.file_type()?.is_dir() {
                stack.push((entry.path(), child));
            } else {
                files.push((entry.path(), child, name));
            }
        }
    }
    files.sort_by(|a, b| a.1.cmp(&b.1));

    let mut items = Vec::with_capacity(files.len());
    for (path, relative, name) in files {
        let meta = std::fs::metadata(&path)?;
        let digest = file_digest(&path)?;
        let (Ok(item_id), Ok(fingerprint)) = (
            RemoteId::new(relative),
            Fingerprint::new(digest),
        ) else {
            continue;
        };
        let mut item = RemoteItem::new(item_id, name);
        item.created = meta.modified().ok().map(DateTime::<Utc>::from);
        item.size = Some(meta.len());
        item.fingerprint = Some(fingerprint);
        items.push(item);
    }
    Ok(items)
}

/// SHA-256 of a file's content, read in buffered chunks
fn file_digest(path: &Path) -> io::Result<String> {
    let mut reader = io::BufReader::new(std::fs::File::open(path)?);
    let mut hasher = Sha256::new();
    io::copy(&mut reader, &mut hasher)?;
    Ok(format!("{:x}", hasher.finalize()))
}

#[async_trait]
impl IMediaLibrary for DirectoryMediaLibrary {
    async fn has_library(&self, library: &LibrarySelector) -> Result<bool, SourceError> {
        let path = self.library_path(library)?;
        Ok(tokio::fs::metadata(&path)
            .await
            .map(|m| m.is_dir())
            .unwrap_or(false))
    }

    #[instrument(skip(self, library), fields(library = %library))]
    async fn enumerate_items(&self, library: &LibrarySelector) -> Result<ItemStream, SourceError> {
        let path = self.library_path(library)?;
        let scan_path = path.clone();
        let prefix = Self::library_relative(library);
        let items = tokio::task::spawn_blocking(move || scan_library(&scan_path, &prefix))
            .await
            .map_err(|e| SourceError::Other(e.to_string()))?
            .map_err(|e| io_error(&path, e))?;
        debug!(count = items.len(), "Enumerated library");
        Ok(stream::iter(items.into_iter().map(Ok)).boxed())
    }

    async fn open_item(&self, item: &RemoteItem) -> Result<RemoteReader, SourceError> {
        let path = resolve(&self.root, item.id.as_str())?;
        let file = tokio::fs::File::open(&path)
            .await
            .map_err(|e| io_error(&path, e))?;
        Ok(Box::new(file))
    }
}

#[cfg(test)]
mod tests {
    use tempfile::TempDir;
    use tokio::io::AsyncReadExt;

    use cloudkeep_core::domain::NodeKind;

    use super::*;

    fn tree() -> (TempDir, DirectoryTreeSource) {
        let dir = TempDir::new().unwrap();
        std::fs::create_dir_all(dir.path().join("Docs/sub")).unwrap();
        std::fs::create_dir_all(dir.path().join("Team")).unwrap();
        std::fs::write(dir.path().join("Docs/a.txt"), b"alpha").unwrap();
        std::fs::write(dir.path().join("Team").join(SHARED_MARKER), b"").unwrap();
        let source = DirectoryTreeSource::new(dir.path());
        (dir, source)
    }

    #[tokio::test]
    async fn lists_children_with_tags_and_ownership() {
        let (_dir, source) = tree();
        let root = source.root_id().await.unwrap();
        let top = source.list_children(&root).await.unwrap();

        let names: Vec<_> = top.iter().map(|n| n.name.as_str()).collect();
        assert_eq!(names, ["Docs", "Team"]);
        assert!(top[0].change_tag.is_some());
        assert!(!top[0].is_shared_folder());
        assert!(top[1].is_shared_folder());

        let docs = source.list_children(&top[0].id).await.unwrap();
        let file = docs.iter().find(|n| n.name == "a.txt").unwrap();
        assert_eq!(file.kind, NodeKind::File);
        assert_eq!(file.size, 5);
        assert_eq!(file.id.as_str(), "Docs/a.txt");
        assert_eq!(file.parent_id.as_ref().map(|p| p.as_str()), Some("Docs"));
    }

    #[tokio::test]
    async fn folder_tag_changes_with_listing() {
        let (dir, source) = tree();
        let docs = RemoteId::new("Docs").unwrap();
        let before = source.get_node(&docs).await.unwrap().change_tag;
        assert_eq!(before, source.get_node(&docs).await.unwrap().change_tag);

        std::fs::write(dir.path().join("Docs/b.txt"), b"beta").unwrap();
        assert_ne!(before, source.get_node(&docs).await.unwrap().change_tag);
    }

    #[tokio::test]
    async fn streams_and_rejects_escapes() {
        let (_dir, source) = tree();
        let mut reader = source
            .open_stream(&RemoteId::new("Docs/a.txt").unwrap(), None)
            .await
            .unwrap();
        let mut content = String::new();
        reader.read_to_string(&mut content).await.unwrap();
        assert_eq!(content, "alpha");

        let escape = source
            .open_stream(&RemoteId::new("../etc/passwd").unwrap(), None)
            .await;
        assert!(matches!(escape, Err(SourceError::NotFound(_))));
    }

    #[test]
    fn digest_spans_buffer_chunks() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("big.bin");
        let content: Vec<u8> = (0..100_000u32).map(|i| (i % 251) as u8).collect();
        std::fs::write(&path, &content).unwrap();

        assert_eq!(
            file_digest(&path).unwrap(),
            format!("{:x}", Sha256::digest(&content))
        );
    }

    #[tokio::test]
    async fn media_library_items() {
        let dir = TempDir::new().unwrap();
        std::fs::create_dir_all(dir.path().join("personal/trip")).unwrap();
        std::fs::write(dir.path().join("personal/trip/IMG_1.JPG"), b"jpeg").unwrap();
        std::fs::write(dir.path().join("personal/IMG_2.JPG"), b"jpeg").unwrap();
        let library = DirectoryMediaLibrary::new(dir.path());

        assert!(library.has_library(&LibrarySelector::Personal).await.unwrap());
        assert!(!library
            .has_library(&LibrarySelector::Shared("fam".into()))
            .await
            .unwrap());

        let items: Vec<_> = library
            .enumerate_items(&LibrarySelector::Personal)
            .await
            .unwrap()
            .collect()
            .await;
        let items: Vec<RemoteItem> = items.into_iter().map(Result::unwrap).collect();
        assert_eq!(items.len(), 2);
        assert_eq!(items[0].id.as_str(), "personal/IMG_2.JPG");
        assert_eq!(items[1].filename, "IMG_1.JPG");
        // same content, same fingerprint
        assert_eq!(items[0].fingerprint, items[1].fingerprint);
        assert!(items[0].best_date().is_some());

        let mut reader = library.open_item(&items[1]).await.unwrap();
        let mut buf = Vec::new();
        reader.read_to_end(&mut buf).await.unwrap();
        assert_eq!(buf, b"jpeg");
    }
}
