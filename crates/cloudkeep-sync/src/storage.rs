//! Local backup usage statistics

use std::io;
use std::path::Path;

use serde::Serialize;

use cloudkeep_core::domain::BackupKind;

use crate::fetch::is_temp_name;

/// File count and size of one backup kind
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct KindUsage {
    pub files: u64,
    pub bytes: u64,
}

/// Usage of one account's backup directory
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct StorageUsage {
    pub drive: KindUsage,
    pub photos: KindUsage,
}

impl StorageUsage {
    pub fn total_bytes(&self) -> u64 {
        self.drive.bytes + self.photos.bytes
    }
}

/// Count files and bytes below an account's backup directory
///
/// Missing directories count as empty. Engine temp files are ignored.
pub async fn storage_usage(destination: &Path) -> io::Result<StorageUsage> {
    let destination = destination.to_path_buf();
    tokio::task::spawn_blocking(move || {
        Ok(StorageUsage {
            drive: usage_of(&destination.join(BackupKind::Drive.dir_name()))?,
            photos: usage_of(&destination.join(BackupKind::Photos.dir_name()))?,
        })
    })
    .await
    .map_err(io::Error::other)?
}

fn usage_of(root: &Path) -> io::Result<KindUsage> {
    let mut usage = KindUsage::default();
    let mut stack = vec![root.to_path_buf()];
    while let Some(dir) = stack.pop() {
        let entries = match std::fs::read_dir(&dir) {
            Ok(entries) => entries,
            Err(e) if e.kind() == io::ErrorKind::NotFound => continue,
            Err(e) => return Err(e),
        };
        for entry in entries {
            let entry = entry?;
            let file_type = entry.file_type()?;
            if file_type.is_dir() {
                stack.push(entry.path());
            } else if file_type.is_file()
                && !is_temp_name(&entry.file_name().to_string_lossy())
            {
                usage.files += 1;
                usage.bytes += entry.metadata()?.len();
            }
        }
    }
    Ok(usage)
}
