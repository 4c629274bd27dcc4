//! In-memory backend

use std::collections::HashMap;

use async_trait::async_trait;
use tokio::sync::RwLock;

use super::{matches_prefix, StorageBackend};
use crate::error::StorageError;

#[derive(Debug, Default)]
pub struct MemoryBackend {
    blobs: RwLock<HashMap<String, Vec<u8>>>,
}

impl MemoryBackend {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl StorageBackend for MemoryBackend {
    async fn write_blob(&self, storage_key: &str, bytes: &[u8]) -> Result<(), StorageError> {
        let mut blobs = self.blobs.write().await;
        blobs.insert(storage_key.to_string(), bytes.to_vec());
        Ok(())
    }

    async fn read_blob(&self, storage_key: &str) -> Result<Option<Vec<u8>>, StorageError> {
        let blobs = self.blobs.read().await;
        Ok(blobs.get(storage_key).cloned())
    }

    async fn delete_blob(&self, storage_key: &str) -> Result<(), StorageError> {
        let mut blobs = self.blobs.write().await;
        blobs.remove(storage_key);
        Ok(())
    }

    async fn list_blob_keys(&self, prefix: Option<&str>) -> Result<Vec<String>, StorageError> {
        let blobs = self.blobs.read().await;
        Ok(blobs
            .keys()
            .filter(|k| matches_prefix(k, prefix))
            .cloned()
            .collect())
    }

    async fn total_bytes(&self, prefix: Option<&str>) -> Result<u64, StorageError> {
        let blobs = self.blobs.read().await;
        Ok(blobs
            .iter()
            .filter(|(k, _)| matches_prefix(k, prefix))
            .map(|(_, v)| v.len() as u64)
            .sum())
    }
}
