//! Fetch executor
//!
//! Streams a single remote item to local disk.
//!
//! ## Design Decisions
//!
//! - **Atomic placement**: bytes go to a uniquely named temporary file in
//!   the destination directory, which is fsynced and renamed over the
//!   target only once the stream completed with the expected size. An
//!   existing local copy is never partially overwritten.
//! - **Bounded memory**: one buffer of the configured chunk size per fetch.
//! - **Retry**: transient remote errors (including short reads) are retried
//!   with exponential backoff, re-opening the stream every attempt.
//! - **Tree fallback**: a not-found error for a path containing
//!   URL-sensitive characters triggers re-resolution from the parent
//!   listing, then a retry with the node's alternate id. Exhausting both
//!   marks the item skipped rather than failing the run.

use std::future::Future;
use std::io;
use std::path::{Path, PathBuf};
use std::time::SystemTime;

use chrono::{DateTime, Utc};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tracing::{debug, info, instrument, warn};

use cloudkeep_core::domain::{EngineSettings, RemoteId, RemoteItem, RemoteNode};
use cloudkeep_core::ports::{IMediaLibrary, ITreeSource, RemoteReader, SourceError};

use crate::retry::{with_retry, RetryPolicy};
use crate::SyncError;

/// Suffix of the engine's temporary files
pub const TEMP_SUFFIX: &str = ".cktmp";

/// Characters that break download URLs of some remote sources
pub const URL_SENSITIVE_CHARS: &[char] = &['#', '%', '&', '+', '?', ';', '[', ']', '{', '}', '`'];

/// Tolerance when comparing local and remote modification times
const MTIME_TOLERANCE_SECS: i64 = 2;

/// How a fetch ended
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FetchOutcome {
    /// The destination now holds the remote content
    Written,
    /// Every fallback failed; the item was not written
    Skipped { reason: String },
}

/// Result of one fetch
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FetchResult {
    pub bytes_written: u64,
    pub outcome: FetchOutcome,
}

impl FetchResult {
    fn written(bytes_written: u64) -> Self {
        Self {
            bytes_written,
            outcome: FetchOutcome::Written,
        }
    }
}

/// Whether `name` is one of the engine's temporary files
pub fn is_temp_name(name: &str) -> bool {
    name.ends_with(TEMP_SUFFIX)
}

/// Whether a relative path contains a URL-sensitive character
pub fn has_url_sensitive_chars(relative_path: &str) -> bool {
    relative_path.contains(URL_SENSITIVE_CHARS)
}

/// Temporary sibling of `destination`, unique per call
pub fn temp_path_for(destination: &Path) -> PathBuf {
    let name = destination
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_default();
    let unique = uuid::Uuid::new_v4().simple().to_string();
    destination.with_file_name(format!(".{name}.{}{TEMP_SUFFIX}", &unique[..12]))
}

/// Whether the local copy of a tree file differs from the remote node
///
/// Missing file, different size, or modification times more than two
/// seconds apart (when the remote reports one).
pub async fn local_needs_update(local: &Path, size: u64, modified: Option<DateTime<Utc>>) -> bool {
    let Ok(meta) = tokio::fs::metadata(local).await else {
        return true;
    };
    if !meta.is_file() || meta.len() != size {
        return true;
    }
    match (modified, meta.modified()) {
        (Some(remote), Ok(local_mtime)) => {
            let local_mtime: DateTime<Utc> = local_mtime.into();
            (remote - local_mtime).num_seconds().abs() > MTIME_TOLERANCE_SECS
        }
        (Some(_), Err(_)) => true,
        (None, _) => false,
    }
}

/// Whether a local file exists with exactly `size` bytes
pub async fn local_matches_size(local: &Path, size: u64) -> bool {
    matches!(tokio::fs::metadata(local).await, Ok(meta) if meta.is_file() && meta.len() == size)
}

/// Create a kind's local root and check that it accepts new files
///
/// Failures here concern the whole destination and end the run.
pub async fn ensure_writable_root(root: &Path) -> Result<(), SyncError> {
    tokio::fs::create_dir_all(root)
        .await
        .map_err(|e| SyncError::destination(root.to_path_buf(), e))?;
    let marker = temp_path_for(&root.join("write-check"));
    tokio::fs::File::create(&marker)
        .await
        .map_err(|e| SyncError::destination(root.to_path_buf(), e))?;
    if let Err(e) = tokio::fs::remove_file(&marker).await {
        debug!(path = %marker.display(), error = %e, "Could not remove write check file");
    }
    Ok(())
}

/// Streams remote items to disk
#[derive(Debug, Clone)]
pub struct FetchExecutor {
    chunk_size: usize,
    retry: RetryPolicy,
}

impl FetchExecutor {
    pub fn new(chunk_size: usize, retry: RetryPolicy) -> Self {
        Self {
            chunk_size: chunk_size.max(1),
            retry,
        }
    }

    /// Executor configured from engine settings
    pub fn from_settings(settings: &EngineSettings) -> Self {
        Self::new(
            settings.chunk_size,
            RetryPolicy::new(settings.max_retries, settings.retry_base_delay),
        )
    }

    /// Fetch a stream to `destination`
    ///
    /// `open` is called once per attempt and must return a fresh stream.
    ///
    /// # Arguments
    ///
    /// * `label` - Name used in log lines
    /// * `open` - Opens the remote stream
    /// * `destination` - Final local path
    /// * `expected_size` - Declared remote size, checked against bytes read
    /// * `modified` - Remote modification time applied to the local file
    ///
    /// # Errors
    ///
    /// Returns the last remote error once retries are exhausted, or the
    /// local write error as classified by [`SyncError::from_write`].
    pub async fn fetch<O, Fut>(
        &self,
        label: &str,
        mut open: O,
        destination: &Path,
        expected_size: Option<u64>,
        modified: Option<DateTime<Utc>>,
    ) -> Result<FetchResult, SyncError>
    where
        O: FnMut() -> Fut,
        Fut: Future<Output = Result<RemoteReader, SourceError>>,
    {
        let bytes = with_retry(label, self.retry, || {
            let stream = open();
            async move {
                let reader = stream.await?;
                self.write_stream(reader, destination, expected_size, modified)
                    .await
            }
        })
        .await?;

        debug!(path = %destination.display(), bytes, "Fetched");
        Ok(FetchResult::written(bytes))
    }

    /// Fetch a tree node, applying the special-character fallbacks
    #[instrument(skip(self, source, node, destination), fields(path = relative_path))]
    pub async fn fetch_node(
        &self,
        source: &dyn ITreeSource,
        node: &RemoteNode,
        relative_path: &str,
        destination: &Path,
    ) -> Result<FetchResult, SyncError> {
        let first = self
            .fetch_node_with(source, &node.id, None, node, destination)
            .await;

        let message = match first {
            Err(SyncError::Source(SourceError::NotFound(message)))
                if has_url_sensitive_chars(relative_path) =>
            {
                message
            }
            other => return other,
        };

        warn!(
            path = relative_path,
            error = %message,
            "Download failed for a path with special characters, trying fallbacks"
        );

        // (a) re-resolve the node from its parent listing
        let fresh = self.reresolve(source, node).await;
        if let Some(fresh) = &fresh {
            match self
                .fetch_node_with(source, &fresh.id, None, fresh, destination)
                .await
            {
                Ok(result) => {
                    info!(path = relative_path, "Download succeeded after re-resolving");
                    return Ok(result);
                }
                Err(SyncError::Source(e)) if !e.is_transient() && !is_auth(&e) => {
                    debug!(path = relative_path, error = %e, "Re-resolved download failed");
                }
                Err(e) => return Err(e),
            }
        }

        // (b) alternate identity as download key
        let current = fresh.as_ref().unwrap_or(node);
        if let Some(alt) = current.alt_id.as_deref().or(node.alt_id.as_deref()) {
            match self
                .fetch_node_with(source, &current.id, Some(alt), current, destination)
                .await
            {
                Ok(result) => {
                    info!(path = relative_path, "Download succeeded with alternate id");
                    return Ok(result);
                }
                Err(SyncError::Source(e)) if !e.is_transient() && !is_auth(&e) => {
                    debug!(path = relative_path, error = %e, "Alternate-id download failed");
                }
                Err(e) => return Err(e),
            }
        }

        let reason = format!(
            "download failed after fallbacks ({message}); renaming the containing folder \
             to avoid special characters usually fixes this"
        );
        warn!(path = relative_path, "{reason}");
        Ok(FetchResult {
            bytes_written: 0,
            outcome: FetchOutcome::Skipped { reason },
        })
    }

    /// Fetch a media item's original
    #[instrument(skip(self, library, item, destination), fields(item = %item.id))]
    pub async fn fetch_item(
        &self,
        library: &dyn IMediaLibrary,
        item: &RemoteItem,
        destination: &Path,
    ) -> Result<FetchResult, SyncError> {
        self.fetch(
            &item.filename,
            || library.open_item(item),
            destination,
            item.size,
            item.best_date(),
        )
        .await
    }

    async fn fetch_node_with(
        &self,
        source: &dyn ITreeSource,
        id: &RemoteId,
        alt_id: Option<&str>,
        node: &RemoteNode,
        destination: &Path,
    ) -> Result<FetchResult, SyncError> {
        self.fetch(
            &node.name,
            || source.open_stream(id, alt_id),
            destination,
            Some(node.size),
            node.modified,
        )
        .await
    }

    async fn reresolve(&self, source: &dyn ITreeSource, node: &RemoteNode) -> Option<RemoteNode> {
        if let Some(parent) = &node.parent_id {
            match source.list_children(parent).await {
                Ok(children) => {
                    return children
                        .into_iter()
                        .find(|c| c.name == node.name && !c.is_folder());
                }
                Err(e) => debug!(error = %e, "Parent listing failed during re-resolution"),
            }
        }
        source.get_node(&node.id).await.ok()
    }

    async fn write_stream(
        &self,
        mut reader: RemoteReader,
        destination: &Path,
        expected_size: Option<u64>,
        modified: Option<DateTime<Utc>>,
    ) -> Result<u64, SyncError> {
        let dir = destination.parent().ok_or_else(|| SyncError::LocalIo {
            path: destination.to_path_buf(),
            source: io::Error::new(io::ErrorKind::InvalidInput, "destination has no parent"),
        })?;
        tokio::fs::create_dir_all(dir)
            .await
            .map_err(|e| SyncError::from_write(dir.to_path_buf(), e))?;

        let tmp = temp_path_for(destination);
        let written = self
            .copy_to_temp(&mut reader, &tmp, expected_size, modified)
            .await;

        let bytes = match written {
            Ok(bytes) => bytes,
            Err(e) => {
                let _ = tokio::fs::remove_file(&tmp).await;
                return Err(e);
            }
        };

        if let Err(e) = tokio::fs::rename(&tmp, destination).await {
            let _ = tokio::fs::remove_file(&tmp).await;
            return Err(SyncError::from_write(destination.to_path_buf(), e));
        }
        Ok(bytes)
    }

    async fn copy_to_temp(
        &self,
        reader: &mut RemoteReader,
        tmp: &Path,
        expected_size: Option<u64>,
        modified: Option<DateTime<Utc>>,
    ) -> Result<u64, SyncError> {
        let write_err = |e: io::Error| SyncError::from_write(tmp.to_path_buf(), e);

        let mut file = tokio::fs::File::create(tmp).await.map_err(write_err)?;
        let mut buf = vec![0u8; self.chunk_size];
        let mut total: u64 = 0;

        loop {
            let n = reader.read(&mut buf).await.map_err(|e| {
                SyncError::Source(SourceError::Transient(format!("stream interrupted: {e}")))
            })?;
            if n == 0 {
                break;
            }
            file.write_all(&buf[..n]).await.map_err(write_err)?;
            total += n as u64;
        }

        if let Some(expected) = expected_size {
            if total != expected {
                return Err(SyncError::Source(SourceError::Transient(format!(
                    "short read: got {total} of {expected} bytes"
                ))));
            }
        }

        file.flush().await.map_err(write_err)?;
        file.sync_all().await.map_err(write_err)?;

        if let Some(modified) = modified {
            let std_file = file.into_std().await;
            if let Err(e) = std_file.set_modified(SystemTime::from(modified)) {
                warn!(path = %tmp.display(), error = %e, "Could not set modification time");
            }
        }

        Ok(total)
    }
}

fn is_auth(err: &SourceError) -> bool {
    matches!(err, SourceError::AuthExpired(_))
}
