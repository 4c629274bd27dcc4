//! Directory-of-files backend

use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};

use async_trait::async_trait;
use tokio::fs;
use tracing::{debug, info, warn};

use super::{matches_prefix, StorageBackend};
use crate::error::StorageError;

const TEMP_PREFIX: char = '.';
const TEMP_SUFFIX: &str = ".tmp";

/// One file per storage key under `root`
#[derive(Debug)]
pub struct FileBackend {
    root: PathBuf,
    temp_seq: AtomicU64,
}

impl FileBackend {
    pub fn new(root: PathBuf) -> Self {
        Self {
            root,
            temp_seq: AtomicU64::new(0),
        }
    }

    /// Ensure the storage directory exists and drop temp files left behind
    /// by earlier processes
    pub async fn init(&self) -> Result<(), StorageError> {
        let io_err = |e| StorageError::new(self.root.display().to_string(), e);
        fs::create_dir_all(&self.root).await.map_err(io_err)?;

        let mut removed = 0u64;
        let mut dir = fs::read_dir(&self.root).await.map_err(io_err)?;
        while let Some(entry) = dir.next_entry().await.map_err(io_err)? {
            let Some(name) = entry.file_name().to_str().map(str::to_string) else {
                continue;
            };
            if !is_stale_temp(&name, std::process::id()) {
                continue;
            }
            match fs::remove_file(entry.path()).await {
                Ok(()) => removed += 1,
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
                Err(e) => warn!(name = %name, error = %e, "Failed to remove stale temp file"),
            }
        }

        info!(root = ?self.root, stale_temp_removed = removed, "File storage initialized");
        Ok(())
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    fn path_for(&self, storage_key: &str) -> PathBuf {
        self.root.join(storage_key)
    }

    /// Short fixed-shape name, independent of the key length
    fn temp_path(&self) -> PathBuf {
        let seq = self.temp_seq.fetch_add(1, Ordering::Relaxed);
        self.root
            .join(format!("{}{}-{}{}", TEMP_PREFIX, std::process::id(), seq, TEMP_SUFFIX))
    }

    /// Names of visible regular files in the root, in directory order.
    async fn entries(
        &self,
        prefix: Option<&str>,
    ) -> Result<Vec<(String, fs::DirEntry)>, StorageError> {
        let io_err = |e| StorageError::new(self.root.display().to_string(), e);
        let mut dir = match fs::read_dir(&self.root).await {
            Ok(dir) => dir,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(io_err(e)),
        };

        let mut out = Vec::new();
        while let Some(entry) = dir.next_entry().await.map_err(io_err)? {
            let Some(name) = entry.file_name().to_str().map(str::to_string) else {
                continue;
            };
            if name.starts_with(TEMP_PREFIX) || !matches_prefix(&name, prefix) {
                continue;
            }
            match entry.file_type().await {
                Ok(t) if t.is_file() => out.push((name, entry)),
                Ok(_) => {}
                Err(e) => debug!(name = %name, error = %e, "Skipping unreadable directory entry"),
            }
        }
        Ok(out)
    }
}

/// `.{pid}-{seq}.tmp` written by a process other than `current_pid`
fn is_stale_temp(name: &str, current_pid: u32) -> bool {
    let Some(stem) = name
        .strip_prefix(TEMP_PREFIX)
        .and_then(|rest| rest.strip_suffix(TEMP_SUFFIX))
    else {
        return false;
    };
    let Some((pid, seq)) = stem.split_once('-') else {
        return false;
    };
    if seq.is_empty() || !seq.bytes().all(|b| b.is_ascii_digit()) {
        return false;
    }
    matches!(pid.parse::<u32>(), Ok(pid) if pid != current_pid)
}

#[async_trait]
impl StorageBackend for FileBackend {
    async fn write_blob(&self, storage_key: &str, bytes: &[u8]) -> Result<(), StorageError> {
        let temp = self.temp_path();
        if let Err(e) = fs::write(&temp, bytes).await {
            let _ = fs::remove_file(&temp).await;
            return Err(StorageError::new(storage_key, e));
        }
        if let Err(e) = fs::rename(&temp, self.path_for(storage_key)).await {
            warn!(storage_key, error = %e, "Failed to move record into place");
            let _ = fs::remove_file(&temp).await;
            return Err(StorageError::new(storage_key, e));
        }
        Ok(())
    }

    async fn read_blob(&self, storage_key: &str) -> Result<Option<Vec<u8>>, StorageError> {
        match fs::read(self.path_for(storage_key)).await {
            Ok(data) => Ok(Some(data)),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(StorageError::new(storage_key, e)),
        }
    }

    async fn delete_blob(&self, storage_key: &str) -> Result<(), StorageError> {
        match fs::remove_file(self.path_for(storage_key)).await {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(StorageError::new(storage_key, e)),
        }
    }

    async fn list_blob_keys(&self, prefix: Option<&str>) -> Result<Vec<String>, StorageError> {
        Ok(self
            .entries(prefix)
            .await?
            .into_iter()
            .map(|(name, _)| name)
            .collect())
    }

    async fn total_bytes(&self, prefix: Option<&str>) -> Result<u64, StorageError> {
        let mut total = 0;
        for (name, entry) in self.entries(prefix).await? {
            match entry.metadata().await {
                Ok(meta) => total += meta.len(),
                // Deleted between listing and stat
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
                Err(e) => return Err(StorageError::new(name, e)),
            }
        }
        Ok(total)
    }
}
