//! Storage backends: flat string keys mapped to byte blobs.
//!
//! [`FileBackend`] keeps one file per key in a directory; [`MemoryBackend`]
//! substitutes a map for tests. Both give read-your-writes consistency within
//! a process and replace blobs atomically.

mod file;
mod memory;

pub use file::FileBackend;
pub use memory::MemoryBackend;

use async_trait::async_trait;

use crate::error::StorageError;

#[async_trait]
pub trait StorageBackend: Send + Sync {
    /// Store `bytes` under `storage_key`, replacing any previous blob.
    /// Readers observe either the old or the new blob, never a mix.
    async fn write_blob(&self, storage_key: &str, bytes: &[u8]) -> Result<(), StorageError>;

    async fn read_blob(&self, storage_key: &str) -> Result<Option<Vec<u8>>, StorageError>;

    /// Idempotent: removing an absent key succeeds.
    async fn delete_blob(&self, storage_key: &str) -> Result<(), StorageError>;

    async fn list_blob_keys(&self, prefix: Option<&str>) -> Result<Vec<String>, StorageError>;

    async fn total_bytes(&self, prefix: Option<&str>) -> Result<u64, StorageError>;
}

fn matches_prefix(storage_key: &str, prefix: Option<&str>) -> bool {
    prefix.map_or(true, |p| storage_key.starts_with(p))
}
