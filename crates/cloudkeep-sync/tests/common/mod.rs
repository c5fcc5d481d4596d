//! In-memory remote and harness shared by the engine integration tests
//!
//! [`FakeRemote`] implements both source ports. Tree node ids are the
//! node's path (the root is `root`); media item ids are arbitrary. Faults
//! can be injected per id, and every stream that reaches its end writes a
//! `fetched:<id>` line to the shared journal.

#![allow(dead_code)]

use std::collections::{BTreeMap, HashMap};
use std::io;
use std::path::PathBuf;
use std::pin::Pin;
use std::sync::{Arc, Mutex};
use std::task::{Context, Poll};
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, TimeZone, Utc};
use futures_util::stream::{self, StreamExt};
use tempfile::TempDir;
use tokio::io::{AsyncRead, ReadBuf};
use tokio_util::sync::CancellationToken;

use cloudkeep_cache::SqliteCacheStore;
use cloudkeep_core::domain::{
    AccountKey, BackupPlan, ChangeTag, DrivePlan, EngineSettings, Fingerprint, FolderSelection,
    LibrarySelector, Ownership, PhotosPlan, ProgressEvent, RemoteId, RemoteItem, RemoteNode,
    RunReport, SyncPolicy,
};
use cloudkeep_core::ports::{
    IMediaLibrary, IProgressSink, ITreeSource, ItemStream, RemoteReader, SourceError,
};
use cloudkeep_sync::BackupEngine;

pub const ROOT: &str = "root";

pub fn rid(s: &str) -> RemoteId {
    RemoteId::new(s).unwrap()
}

pub fn day(y: i32, m: u32, d: u32) -> DateTime<Utc> {
    Utc.with_ymd_and_hms(y, m, d, 12, 0, 0).unwrap()
}

/// Injected failure for one id
#[derive(Debug, Clone)]
pub enum Fault {
    /// Every download fails as not found
    NotFound,
    /// Downloads fail as not found unless the alternate id is used
    NotFoundUnlessAlt,
    /// The next `n` downloads fail transiently
    Transient(u32),
    /// Downloads fail with a permanent error
    Permanent,
    /// Every call fails with an expired session
    AuthExpired,
    /// The first download moves the node to the given id and fails as not
    /// found; later listings show the new id
    Reissued(String),
}

struct TreeEntry {
    node: RemoteNode,
    content: Vec<u8>,
    children: Vec<String>,
    version: u64,
}

struct MediaEntry {
    item: RemoteItem,
    content: Vec<u8>,
}

#[derive(Default)]
struct State {
    tree: HashMap<String, TreeEntry>,
    libraries: HashMap<LibrarySelector, Vec<MediaEntry>>,
    faults: HashMap<String, Fault>,
    list_faults: HashMap<String, SourceError>,
    enumeration_error: Option<(usize, SourceError)>,
    delays: HashMap<String, Duration>,
    opens: HashMap<String, u32>,
}

/// In-memory tree source and media library
#[derive(Clone)]
pub struct FakeRemote {
    state: Arc<Mutex<State>>,
    pub journal: Arc<Mutex<Vec<String>>>,
}

impl Default for FakeRemote {
    fn default() -> Self {
        Self::new()
    }
}

impl FakeRemote {
    pub fn new() -> Self {
        let mut state = State::default();
        state.tree.insert(
            ROOT.to_string(),
            TreeEntry {
                node: RemoteNode {
                    change_tag: Some(ChangeTag::new("root-0").unwrap()),
                    ..RemoteNode::folder(rid(ROOT), "")
                },
                content: Vec::new(),
                children: Vec::new(),
                version: 0,
            },
        );
        Self {
            state: Arc::new(Mutex::new(state)),
            journal: Arc::new(Mutex::new(Vec::new())),
        }
    }

    fn split(path: &str) -> (String, String) {
        match path.rsplit_once('/') {
            Some((parent, name)) => (parent.to_string(), name.to_string()),
            None => (ROOT.to_string(), path.to_string()),
        }
    }

    fn bump(state: &mut State, folder: &str) {
        if let Some(entry) = state.tree.get_mut(folder) {
            entry.version += 1;
            entry.node.change_tag =
                Some(ChangeTag::new(format!("{folder}-{}", entry.version)).unwrap());
        }
    }

    fn insert(&self, path: &str, node: RemoteNode, content: Vec<u8>) {
        let (parent, _) = Self::split(path);
        let mut state = self.state.lock().unwrap();
        let parent_entry = state.tree.get_mut(&parent).expect("parent folder exists");
        if !parent_entry.children.iter().any(|c| c == path) {
            parent_entry.children.push(path.to_string());
        }
        state.tree.insert(
            path.to_string(),
            TreeEntry {
                node,
                content,
                children: Vec::new(),
                version: 0,
            },
        );
        Self::bump(&mut state, &parent);
    }

    pub fn add_folder(&self, path: &str) {
        let (parent, name) = Self::split(path);
        let node = RemoteNode {
            change_tag: Some(ChangeTag::new(format!("{path}-0")).unwrap()),
            parent_id: Some(rid(&parent)),
            ..RemoteNode::folder(rid(path), name)
        };
        self.insert(path, node, Vec::new());
    }

    pub fn add_shared_folder(&self, path: &str) {
        self.add_folder(path);
        let mut state = self.state.lock().unwrap();
        if let Some(entry) = state.tree.get_mut(path) {
            entry.node.ownership = Ownership::SharedWithMe {
                owner: Some("friend@example.com".into()),
            };
        }
    }

    pub fn add_file(&self, path: &str, content: &[u8]) {
        let (parent, name) = Self::split(path);
        let node = RemoteNode {
            parent_id: Some(rid(&parent)),
            modified: Some(day(2024, 1, 1)),
            ..RemoteNode::file(rid(path), name, content.len() as u64)
        };
        self.insert(path, node, content.to_vec());
    }

    pub fn set_alt_id(&self, path: &str, alt: &str) {
        let mut state = self.state.lock().unwrap();
        if let Some(entry) = state.tree.get_mut(path) {
            entry.node.alt_id = Some(alt.to_string());
        }
    }

    /// Replace a file's content, moving its modification time forward
    pub fn set_content(&self, path: &str, content: &[u8]) {
        let (parent, _) = Self::split(path);
        let mut state = self.state.lock().unwrap();
        if let Some(entry) = state.tree.get_mut(path) {
            entry.content = content.to_vec();
            entry.node.size = content.len() as u64;
            entry.node.modified = Some(day(2024, 6, 1));
        }
        Self::bump(&mut state, &parent);
    }

    /// Replace a file's content and size, leaving its modification time
    /// and the parent folder's change tag alone
    pub fn set_content_keeping_tag(&self, path: &str, content: &[u8]) {
        let mut state = self.state.lock().unwrap();
        if let Some(entry) = state.tree.get_mut(path) {
            entry.content = content.to_vec();
            entry.node.size = content.len() as u64;
        }
    }

    /// Move a file node to a new id, keeping its name and parent
    fn reissue(state: &mut State, old: &str, new: &str) {
        let Some(mut entry) = state.tree.remove(old) else {
            return;
        };
        entry.node.id = rid(new);
        let parent = entry.node.parent_id.clone();
        state.tree.insert(new.to_string(), entry);
        if let Some(parent) = parent.and_then(|p| state.tree.get_mut(p.as_str())) {
            for child in parent.children.iter_mut().filter(|c| c.as_str() == old) {
                *child = new.to_string();
            }
        }
    }

    /// Remove a node and everything below it
    pub fn remove(&self, path: &str) {
        let (parent, _) = Self::split(path);
        let mut state = self.state.lock().unwrap();
        let mut pending = vec![path.to_string()];
        while let Some(p) = pending.pop() {
            if let Some(entry) = state.tree.remove(&p) {
                pending.extend(entry.children);
            }
        }
        if let Some(entry) = state.tree.get_mut(&parent) {
            entry.children.retain(|c| c != path);
        }
        Self::bump(&mut state, &parent);
    }

    pub fn add_item(&self, library: LibrarySelector, item: RemoteItem, content: &[u8]) {
        let mut state = self.state.lock().unwrap();
        state
            .libraries
            .entry(library)
            .or_default()
            .push(MediaEntry {
                item,
                content: content.to_vec(),
            });
    }

    pub fn remove_item(&self, library: &LibrarySelector, id: &str) {
        let mut state = self.state.lock().unwrap();
        if let Some(items) = state.libraries.get_mut(library) {
            items.retain(|e| e.item.id.as_str() != id);
        }
    }

    pub fn reverse_items(&self, library: &LibrarySelector) {
        let mut state = self.state.lock().unwrap();
        if let Some(items) = state.libraries.get_mut(library) {
            items.reverse();
        }
    }

    pub fn update_item(&self, library: &LibrarySelector, id: &str, fingerprint: &str, content: &[u8]) {
        let mut state = self.state.lock().unwrap();
        if let Some(entry) = state
            .libraries
            .get_mut(library)
            .and_then(|items| items.iter_mut().find(|e| e.item.id.as_str() == id))
        {
            entry.item.fingerprint = Some(Fingerprint::new(fingerprint).unwrap());
            entry.item.size = Some(content.len() as u64);
            entry.content = content.to_vec();
        }
    }

    pub fn fault(&self, id: &str, fault: Fault) {
        self.state.lock().unwrap().faults.insert(id.to_string(), fault);
    }

    pub fn clear_fault(&self, id: &str) {
        self.state.lock().unwrap().faults.remove(id);
    }

    pub fn fail_listing(&self, id: &str, err: SourceError) {
        self.state
            .lock()
            .unwrap()
            .list_faults
            .insert(id.to_string(), err);
    }

    /// Make enumerations fail after `after` items
    pub fn fail_enumeration(&self, after: usize, err: SourceError) {
        self.state.lock().unwrap().enumeration_error = Some((after, err));
    }

    pub fn delay(&self, id: &str, delay: Duration) {
        self.state.lock().unwrap().delays.insert(id.to_string(), delay);
    }

    /// Number of download streams opened for an id
    pub fn opens(&self, id: &str) -> u32 {
        self.state.lock().unwrap().opens.get(id).copied().unwrap_or(0)
    }

    pub fn total_opens(&self) -> u32 {
        self.state.lock().unwrap().opens.values().sum()
    }

    pub fn journal(&self) -> Vec<String> {
        self.journal.lock().unwrap().clone()
    }

    /// Apply the fault registered for `id`, if any
    fn check_fault(&self, id: &str, alt: Option<&str>) -> Result<(), SourceError> {
        let mut state = self.state.lock().unwrap();
        match state.faults.get_mut(id) {
            None => Ok(()),
            Some(Fault::NotFound) => Err(SourceError::NotFound(id.to_string())),
            Some(Fault::NotFoundUnlessAlt) if alt.is_some() => Ok(()),
            Some(Fault::NotFoundUnlessAlt) => Err(SourceError::NotFound(id.to_string())),
            Some(Fault::Transient(0)) => Ok(()),
            Some(Fault::Transient(n)) => {
                *n -= 1;
                Err(SourceError::Transient(format!("503 for {id}")))
            }
            Some(Fault::Permanent) => Err(SourceError::Other(format!("corrupt {id}"))),
            Some(Fault::AuthExpired) => Err(SourceError::AuthExpired("session expired".into())),
            Some(Fault::Reissued(_)) => Err(SourceError::NotFound(id.to_string())),
        }
    }

    async fn open(&self, id: &str, alt: Option<&str>, content: Vec<u8>) -> Result<RemoteReader, SourceError> {
        let delay = {
            let mut state = self.state.lock().unwrap();
            *state.opens.entry(id.to_string()).or_default() += 1;
            state.delays.get(id).copied()
        };
        self.check_fault(id, alt)?;
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }
        Ok(Box::new(JournalReader {
            inner: io::Cursor::new(content),
            name: id.to_string(),
            journal: Arc::clone(&self.journal),
            done: false,
        }))
    }
}

/// Reader that journals reaching end of stream
struct JournalReader {
    inner: io::Cursor<Vec<u8>>,
    name: String,
    journal: Arc<Mutex<Vec<String>>>,
    done: bool,
}

impl AsyncRead for JournalReader {
    fn poll_read(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        let this = &mut *self;
        let before = buf.filled().len();
        let polled = Pin::new(&mut this.inner).poll_read(cx, buf);
        if let Poll::Ready(Ok(())) = polled {
            if buf.filled().len() == before && !this.done {
                this.done = true;
                this.journal
                    .lock()
                    .unwrap()
                    .push(format!("fetched:{}", this.name));
            }
        }
        polled
    }
}

#[async_trait]
impl ITreeSource for FakeRemote {
    async fn root_id(&self) -> Result<RemoteId, SourceError> {
        Ok(rid(ROOT))
    }

    async fn list_children(&self, node_id: &RemoteId) -> Result<Vec<RemoteNode>, SourceError> {
        let state = self.state.lock().unwrap();
        if let Some(err) = state.list_faults.get(node_id.as_str()) {
            return Err(err.clone());
        }
        let entry = state
            .tree
            .get(node_id.as_str())
            .ok_or_else(|| SourceError::NotFound(node_id.to_string()))?;
        Ok(entry
            .children
            .iter()
            .filter_map(|c| state.tree.get(c).map(|e| e.node.clone()))
            .collect())
    }

    async fn get_node(&self, node_id: &RemoteId) -> Result<RemoteNode, SourceError> {
        let state = self.state.lock().unwrap();
        state
            .tree
            .get(node_id.as_str())
            .map(|e| e.node.clone())
            .ok_or_else(|| SourceError::NotFound(node_id.to_string()))
    }

    async fn open_stream(
        &self,
        node_id: &RemoteId,
        alt_id: Option<&str>,
    ) -> Result<RemoteReader, SourceError> {
        let content = {
            let mut state = self.state.lock().unwrap();
            if let Some(Fault::Reissued(new)) = state.faults.get(node_id.as_str()).cloned() {
                state.faults.remove(node_id.as_str());
                *state.opens.entry(node_id.to_string()).or_default() += 1;
                Self::reissue(&mut state, node_id.as_str(), &new);
                return Err(SourceError::NotFound(node_id.to_string()));
            }
            state
                .tree
                .get(node_id.as_str())
                .map(|e| e.content.clone())
                .ok_or_else(|| SourceError::NotFound(node_id.to_string()))?
        };
        self.open(node_id.as_str(), alt_id, content).await
    }
}

#[async_trait]
impl IMediaLibrary for FakeRemote {
    async fn has_library(&self, library: &LibrarySelector) -> Result<bool, SourceError> {
        Ok(self.state.lock().unwrap().libraries.contains_key(library))
    }

    async fn enumerate_items(&self, library: &LibrarySelector) -> Result<ItemStream, SourceError> {
        let state = self.state.lock().unwrap();
        let mut results: Vec<Result<RemoteItem, SourceError>> = state
            .libraries
            .get(library)
            .map(|items| items.iter().map(|e| Ok(e.item.clone())).collect())
            .unwrap_or_default();
        if let Some((after, err)) = &state.enumeration_error {
            results.truncate(*after);
            results.push(Err(err.clone()));
        }
        Ok(stream::iter(results).boxed())
    }

    async fn open_item(&self, item: &RemoteItem) -> Result<RemoteReader, SourceError> {
        let content = {
            let state = self.state.lock().unwrap();
            state
                .libraries
                .values()
                .flatten()
                .find(|e| e.item.id == item.id)
                .map(|e| e.content.clone())
                .ok_or_else(|| SourceError::NotFound(item.id.to_string()))?
        };
        self.open(item.id.as_str(), None, content).await
    }
}

/// Media item with a date, size and fingerprint
pub fn item(id: &str, filename: &str, date: Option<DateTime<Utc>>, content: &[u8]) -> RemoteItem {
    let mut item = RemoteItem::new(rid(id), filename);
    item.asset_date = date;
    item.size = Some(content.len() as u64);
    item.fingerprint = Some(Fingerprint::new(format!("fp-{}", String::from_utf8_lossy(content))).unwrap());
    item
}

// ============================================================================
// Progress recording
// ============================================================================

/// Sink that keeps every event and journals reconciliations
pub struct RecordingSink {
    pub events: Mutex<Vec<ProgressEvent>>,
    journal: Arc<Mutex<Vec<String>>>,
    /// Cancelled on the first finished item, when set
    cancel_on_item: Mutex<Option<CancellationToken>>,
}

impl RecordingSink {
    pub fn new(journal: Arc<Mutex<Vec<String>>>) -> Self {
        Self {
            events: Mutex::new(Vec::new()),
            journal,
            cancel_on_item: Mutex::new(None),
        }
    }

    pub fn cancel_on_first_item(&self, token: CancellationToken) {
        *self.cancel_on_item.lock().unwrap() = Some(token);
    }

    pub fn events(&self) -> Vec<ProgressEvent> {
        self.events.lock().unwrap().clone()
    }
}

impl IProgressSink for RecordingSink {
    fn report(&self, event: &ProgressEvent) {
        match event {
            ProgressEvent::Reconciled { scope, .. } => {
                self.journal
                    .lock()
                    .unwrap()
                    .push(format!("reconciled:{scope}"));
            }
            ProgressEvent::ItemFinished { .. } => {
                if let Some(token) = self.cancel_on_item.lock().unwrap().as_ref() {
                    token.cancel();
                }
            }
            _ => {}
        }
        self.events.lock().unwrap().push(event.clone());
    }
}

// ============================================================================
// Harness
// ============================================================================

pub struct Harness {
    pub dir: TempDir,
    pub remote: FakeRemote,
    pub sink: Arc<RecordingSink>,
    pub caches: Arc<SqliteCacheStore>,
    pub engine: BackupEngine,
}

impl Harness {
    pub fn new() -> Self {
        let remote = FakeRemote::new();
        let sink = Arc::new(RecordingSink::new(Arc::clone(&remote.journal)));
        let caches = Arc::new(SqliteCacheStore::in_memory());
        let engine = BackupEngine::new(
            Arc::new(remote.clone()),
            Arc::new(remote.clone()),
            caches.clone(),
            sink.clone(),
        );
        Self {
            dir: TempDir::new().unwrap(),
            remote,
            sink,
            caches,
            engine,
        }
    }

    pub fn account(&self) -> AccountKey {
        AccountKey::new("user@example.com").unwrap()
    }

    pub fn backup_dir(&self) -> PathBuf {
        self.dir.path().join("backup")
    }

    pub fn archive_dir(&self) -> PathBuf {
        self.dir.path().join("archive")
    }

    pub fn drive_dir(&self) -> PathBuf {
        self.backup_dir().join("drive")
    }

    pub fn library_dir(&self) -> PathBuf {
        self.backup_dir().join("photos").join("library")
    }

    fn base_plan(&self) -> BackupPlan {
        let mut plan = BackupPlan::new(self.account(), self.backup_dir(), self.archive_dir());
        plan.settings = EngineSettings {
            fetch_concurrency: 4,
            chunk_size: 7,
            max_retries: 3,
            retry_base_delay: Duration::from_millis(1),
        };
        plan
    }

    pub fn drive_plan(&self, policy: SyncPolicy) -> BackupPlan {
        let mut plan = self.base_plan();
        plan.drive = Some(DrivePlan {
            folders: FolderSelection::All,
            policy,
        });
        plan
    }

    pub fn photos_plan(&self, policy: SyncPolicy) -> BackupPlan {
        let mut plan = self.base_plan();
        plan.photos = Some(PhotosPlan {
            libraries: vec![LibrarySelector::Personal],
            policy,
        });
        plan
    }

    pub async fn run(&self, plan: &BackupPlan) -> RunReport {
        self.engine
            .run(plan, CancellationToken::new())
            .await
            .expect("run admitted")
    }
}

/// Relative paths of every file below `root`, sorted
pub fn local_files(root: &std::path::Path) -> Vec<String> {
    let mut files = BTreeMap::new();
    let mut stack = vec![(root.to_path_buf(), String::new())];
    while let Some((dir, rel)) = stack.pop() {
        let Ok(entries) = std::fs::read_dir(&dir) else {
            continue;
        };
        for entry in entries.flatten() {
            let name = entry.file_name().to_string_lossy().into_owned();
            let child = if rel.is_empty() {
                name
            } else {
                format!("{rel}/{name}")
            };
            if entry.file_type().unwrap().is_dir() {
                stack.push((entry.path(), child));
            } else {
                files.insert(child, ());
            }
        }
    }
    files.into_keys().collect()
}
