//! Entry store: typed records on top of a storage backend.
//!
//! Writes and deletes for one `(group, key)` are serialized through a per-key
//! async mutex; different keys never share a lock. Reads take no lock, since
//! backends replace blobs atomically.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use tokio::sync::{Mutex, OwnedMutexGuard};
use tracing::{debug, warn};

use crate::codec::RecordCodec;
use crate::error::{DecodeError, Result, StorageError};
use crate::key::RecordKey;
use crate::storage::StorageBackend;
use crate::types::CacheRecord;

/// What a conditional eviction did with one key
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Eviction {
    Evicted,
    Live,
    /// Nothing stored under the key any more
    Gone,
    /// Stored bytes could not be decoded; left in place
    Undecodable,
}

pub struct EntryStore {
    backend: Arc<dyn StorageBackend>,
    codec: RecordCodec,
    locks: DashMap<String, Arc<Mutex<()>>>,
}

/// Holds a key's write lock and drops the lock entry once nobody else wants it.
struct KeyGuard<'a> {
    locks: &'a DashMap<String, Arc<Mutex<()>>>,
    storage_key: &'a str,
    guard: Option<OwnedMutexGuard<()>>,
}

impl Drop for KeyGuard<'_> {
    fn drop(&mut self) {
        self.guard.take();
        self.locks
            .remove_if(self.storage_key, |_, lock| Arc::strong_count(lock) == 1);
    }
}

impl EntryStore {
    pub fn new(backend: Arc<dyn StorageBackend>, codec: RecordCodec) -> Self {
        Self {
            backend,
            codec,
            locks: DashMap::new(),
        }
    }

    pub fn codec(&self) -> &RecordCodec {
        &self.codec
    }

    async fn lock<'a>(&'a self, storage_key: &'a str) -> KeyGuard<'a> {
        // Exists before the wait so a caller cancelled while queued still
        // cleans up the table entry.
        let mut key_guard = KeyGuard {
            locks: &self.locks,
            storage_key,
            guard: None,
        };
        let lock = self
            .locks
            .entry(storage_key.to_string())
            .or_insert_with(|| Arc::new(Mutex::new(())))
            .clone();
        key_guard.guard = Some(lock.lock_owned().await);
        key_guard
    }

    /// Read a record without judging its expiry. Missing and undecodable
    /// blobs both come back as `None`.
    pub async fn get(&self, key: &RecordKey) -> std::result::Result<Option<CacheRecord>, StorageError> {
        let storage_key = key.storage_key();
        let Some(bytes) = self.backend.read_blob(&storage_key).await? else {
            return Ok(None);
        };

        match self.codec.decode(&bytes) {
            Ok(record) if record.group == key.group() && record.key == key.key() => Ok(Some(record)),
            Ok(record) => {
                warn!(
                    key = %key,
                    stored = %record.record_key(),
                    "Stored record belongs to a different key, treating as miss"
                );
                Ok(None)
            }
            Err(DecodeError::MissingKey) => {
                warn!(key = %key, "Record is encrypted and no key is configured, treating as miss");
                Ok(None)
            }
            Err(e) => {
                warn!(key = %key, error = %e, "Failed to decode record, treating as miss");
                Ok(None)
            }
        }
    }

    /// Serialize and store a record under its own `(group, key)`. A failed
    /// write leaves any previous record in place.
    pub async fn put(&self, record: &CacheRecord) -> Result<()> {
        let storage_key = record.record_key().storage_key();
        let bytes = self.codec.encode(record)?;

        let _guard = self.lock(&storage_key).await;
        self.backend.write_blob(&storage_key, &bytes).await?;
        debug!(
            key = %record.record_key(),
            size = bytes.len(),
            encrypted = record.encrypted,
            "Stored record"
        );
        Ok(())
    }

    /// Remove a record; absent keys are fine.
    pub async fn delete(&self, key: &RecordKey) -> std::result::Result<(), StorageError> {
        let storage_key = key.storage_key();
        let _guard = self.lock(&storage_key).await;
        self.backend.delete_blob(&storage_key).await?;
        debug!(key = %key, "Deleted record");
        Ok(())
    }

    /// Delete the record only if it is expired at `now`. The check and the
    /// delete happen under the key's lock, so a record rewritten concurrently
    /// is judged on its new creation time.
    pub async fn evict_if_expired(
        &self,
        key: &RecordKey,
        now: DateTime<Utc>,
    ) -> std::result::Result<Eviction, StorageError> {
        let storage_key = key.storage_key();
        let _guard = self.lock(&storage_key).await;

        let Some(bytes) = self.backend.read_blob(&storage_key).await? else {
            return Ok(Eviction::Gone);
        };
        let header = match self.codec.decode_header(&bytes) {
            Ok(header) => header,
            Err(e) => {
                warn!(key = %key, error = %e, "Skipping undecodable record");
                return Ok(Eviction::Undecodable);
            }
        };
        if !header.is_expired(now) {
            return Ok(Eviction::Live);
        }

        self.backend.delete_blob(&storage_key).await?;
        debug!(key = %key, created_at = %header.created_at, "Evicted expired record");
        Ok(Eviction::Evicted)
    }

    /// Every stored key, optionally restricted to one group. Order is
    /// unspecified; blobs whose names are not record keys are skipped.
    ///
    /// Names with a digested part are resolved through the record header.
    pub async fn list_keys(&self, group: Option<&str>) -> std::result::Result<Vec<RecordKey>, StorageError> {
        let mut keys = Vec::new();
        for name in self.list_names(group).await? {
            if let Some(key) = RecordKey::from_storage_key(&name) {
                keys.push(key);
            } else if let Some(key) = self.key_from_header(&name).await? {
                keys.push(key);
            }
        }
        Ok(keys)
    }

    async fn list_names(&self, group: Option<&str>) -> std::result::Result<Vec<String>, StorageError> {
        let prefix = group.map(RecordKey::group_prefix);
        let names = self.backend.list_blob_keys(prefix.as_deref()).await?;
        Ok(names
            .into_iter()
            .filter(|name| RecordKey::is_storage_key(name))
            .collect())
    }

    async fn key_from_header(&self, storage_key: &str) -> std::result::Result<Option<RecordKey>, StorageError> {
        let Some(bytes) = self.backend.read_blob(storage_key).await? else {
            return Ok(None);
        };
        match self.codec.decode_header(&bytes) {
            Ok(header) => {
                let key = RecordKey::new(header.group, header.key);
                if key.storage_key() == storage_key {
                    Ok(Some(key))
                } else {
                    warn!(storage_key, stored = %key, "Record header does not match its name, skipping");
                    Ok(None)
                }
            }
            Err(e) => {
                warn!(storage_key, error = %e, "Skipping record with unreadable header");
                Ok(None)
            }
        }
    }

    /// Bytes occupied by the matching records
    pub async fn size_of(&self, group: Option<&str>) -> std::result::Result<u64, StorageError> {
        let prefix = group.map(RecordKey::group_prefix);
        self.backend.total_bytes(prefix.as_deref()).await
    }

    /// Delete every record in scope regardless of expiry; returns how many
    /// keys were removed.
    ///
    /// Works on stored names, so undecodable records go too.
    pub async fn clear(&self, group: Option<&str>) -> std::result::Result<u64, StorageError> {
        let mut removed = 0;
        for name in self.list_names(group).await? {
            let _guard = self.lock(&name).await;
            self.backend.delete_blob(&name).await?;
            removed += 1;
        }
        debug!(group = group.unwrap_or("*"), removed, "Cleared records");
        Ok(removed)
    }

    #[cfg(test)]
    pub(crate) fn lock_entries(&self) -> usize {
        self.locks.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cipher::KeyedCipher;
    use crate::error::CacheError;
    use crate::storage::{FileBackend, MemoryBackend};
    use async_trait::async_trait;
    use chrono::TimeDelta;
    use std::time::Duration;
    use tempfile::tempdir;

    fn memory_store() -> (Arc<MemoryBackend>, EntryStore) {
        let backend = Arc::new(MemoryBackend::new());
        let store = EntryStore::new(backend.clone(), RecordCodec::plaintext());
        (backend, store)
    }

    fn record(group: &str, key: &str, ttl: Option<Duration>, now: DateTime<Utc>) -> CacheRecord {
        CacheRecord::new(&RecordKey::new(group, key), b"value".to_vec(), now).with_ttl(ttl)
    }

    #[tokio::test]
    async fn test_put_get_delete() {
        let (_, store) = memory_store();
        let now = Utc::now();
        let rec = record("users", "1", None, now);

        store.put(&rec).await.unwrap();
        assert_eq!(store.get(&rec.record_key()).await.unwrap(), Some(rec.clone()));

        store.delete(&rec.record_key()).await.unwrap();
        assert_eq!(store.get(&rec.record_key()).await.unwrap(), None);
        store.delete(&rec.record_key()).await.unwrap();
        assert_eq!(store.lock_entries(), 0);
    }

    #[tokio::test]
    async fn test_get_does_not_check_expiry() {
        let (_, store) = memory_store();
        let long_ago = Utc::now() - TimeDelta::hours(1);
        let rec = record("g", "k", Some(Duration::from_millis(1)), long_ago);

        store.put(&rec).await.unwrap();
        assert_eq!(store.get(&rec.record_key()).await.unwrap(), Some(rec));
    }

    #[tokio::test]
    async fn test_corrupt_blob_reads_as_miss() {
        let (backend, store) = memory_store();
        let key = RecordKey::new("g", "k");
        backend
            .write_blob(&key.storage_key(), b"not a record")
            .await
            .unwrap();

        assert_eq!(store.get(&key).await.unwrap(), None);
    }

    #[tokio::test]
    async fn test_encrypted_record_without_key_reads_as_miss() {
        let backend = Arc::new(MemoryBackend::new());
        let cipher = Arc::new(KeyedCipher::from_passphrase("secret").unwrap());
        let writer = EntryStore::new(backend.clone(), RecordCodec::new(Some(cipher)));
        let reader = EntryStore::new(backend, RecordCodec::plaintext());

        let rec = record("g", "k", None, Utc::now()).encrypted(true);
        writer.put(&rec).await.unwrap();

        assert_eq!(writer.get(&rec.record_key()).await.unwrap(), Some(rec.clone()));
        assert_eq!(reader.get(&rec.record_key()).await.unwrap(), None);
    }

    #[tokio::test]
    async fn test_put_encrypted_without_key_fails() {
        let (backend, store) = memory_store();
        let rec = record("g", "k", None, Utc::now()).encrypted(true);

        let err = store.put(&rec).await.unwrap_err();
        assert!(matches!(err, CacheError::MissingEncryptionKey));
        assert!(backend.list_blob_keys(None).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_list_keys_by_group() {
        let (_, store) = memory_store();
        let now = Utc::now();
        for i in 0..3 {
            store.put(&record("A", &i.to_string(), None, now)).await.unwrap();
        }
        store.put(&record("B", "0", None, now)).await.unwrap();
        store.put(&record("", "loose", None, now)).await.unwrap();

        let mut a = store.list_keys(Some("A")).await.unwrap();
        a.sort();
        assert_eq!(
            a,
            vec![
                RecordKey::new("A", "0"),
                RecordKey::new("A", "1"),
                RecordKey::new("A", "2")
            ]
        );
        assert_eq!(store.list_keys(Some("")).await.unwrap(), vec![RecordKey::ungrouped("loose")]);
        assert_eq!(store.list_keys(None).await.unwrap().len(), 5);
        assert!(store.size_of(Some("A")).await.unwrap() > 0);
        assert_eq!(store.size_of(Some("missing")).await.unwrap(), 0);
    }

    #[tokio::test]
    async fn test_evict_if_expired() {
        let (_, store) = memory_store();
        let now = Utc::now();
        let expired = record("g", "old", Some(Duration::from_millis(1)), now - TimeDelta::seconds(1));
        let live = record("g", "new", Some(Duration::from_secs(60)), now);
        let forever = record("g", "forever", None, now - TimeDelta::days(30));
        for rec in [&expired, &live, &forever] {
            store.put(rec).await.unwrap();
        }

        assert_eq!(
            store.evict_if_expired(&expired.record_key(), now).await.unwrap(),
            Eviction::Evicted
        );
        assert_eq!(
            store.evict_if_expired(&live.record_key(), now).await.unwrap(),
            Eviction::Live
        );
        assert_eq!(
            store.evict_if_expired(&forever.record_key(), now).await.unwrap(),
            Eviction::Live
        );
        assert_eq!(
            store.evict_if_expired(&expired.record_key(), now).await.unwrap(),
            Eviction::Gone
        );
    }

    #[tokio::test]
    async fn test_evict_skips_undecodable() {
        let (backend, store) = memory_store();
        let key = RecordKey::new("g", "junk");
        backend.write_blob(&key.storage_key(), b"junk").await.unwrap();

        assert_eq!(
            store.evict_if_expired(&key, Utc::now()).await.unwrap(),
            Eviction::Undecodable
        );
        assert!(backend.read_blob(&key.storage_key()).await.unwrap().is_some());
    }

    #[tokio::test]
    async fn test_evict_encrypted_without_key() {
        let backend = Arc::new(MemoryBackend::new());
        let cipher = Arc::new(KeyedCipher::from_passphrase("secret").unwrap());
        let writer = EntryStore::new(backend.clone(), RecordCodec::new(Some(cipher)));
        let sweeper = EntryStore::new(backend, RecordCodec::plaintext());

        let now = Utc::now();
        let rec = record("g", "k", Some(Duration::ZERO), now).encrypted(true);
        writer.put(&rec).await.unwrap();

        assert_eq!(
            sweeper.evict_if_expired(&rec.record_key(), now).await.unwrap(),
            Eviction::Evicted
        );
    }

    #[tokio::test]
    async fn test_clear_group() {
        let (_, store) = memory_store();
        let now = Utc::now();
        for i in 0..4 {
            store.put(&record("A", &i.to_string(), None, now)).await.unwrap();
        }
        store.put(&record("B", "0", None, now)).await.unwrap();

        assert_eq!(store.clear(Some("A")).await.unwrap(), 4);
        assert!(store.list_keys(Some("A")).await.unwrap().is_empty());
        assert_eq!(store.list_keys(Some("B")).await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_long_key_on_file_backend() {
        let dir = tempdir().unwrap();
        let backend = Arc::new(FileBackend::new(dir.path().to_path_buf()));
        backend.init().await.unwrap();
        let store = EntryStore::new(backend, RecordCodec::plaintext());

        let long = format!("https://example.org/api/v1/occurrences?q={}", "x".repeat(260));
        assert!(long.len() >= 300);
        let rec = record(
            "occurrences",
            &long,
            Some(Duration::from_millis(1)),
            Utc::now() - TimeDelta::seconds(10),
        );

        store.put(&rec).await.unwrap();
        assert_eq!(store.get(&rec.record_key()).await.unwrap(), Some(rec.clone()));
        assert_eq!(store.list_keys(Some("occurrences")).await.unwrap(), vec![rec.record_key()]);
        assert_eq!(store.list_keys(None).await.unwrap(), vec![rec.record_key()]);
        assert!(store.size_of(Some("occurrences")).await.unwrap() > 0);

        assert_eq!(
            store.evict_if_expired(&rec.record_key(), Utc::now()).await.unwrap(),
            Eviction::Evicted
        );
        assert!(store.list_keys(None).await.unwrap().is_empty());
        assert_eq!(std::fs::read_dir(dir.path()).unwrap().count(), 0);
    }

    #[tokio::test]
    async fn test_long_keys_with_shared_prefix_stay_distinct() {
        let (_, store) = memory_store();
        let now = Utc::now();
        let base = "k".repeat(200);
        let first = record("g", &format!("{}-1", base), None, now);
        let second = record("g", &format!("{}-2", base), None, now);
        store.put(&first).await.unwrap();
        store.put(&second).await.unwrap();

        assert_eq!(store.get(&first.record_key()).await.unwrap(), Some(first.clone()));
        assert_eq!(store.get(&second.record_key()).await.unwrap(), Some(second.clone()));
        let mut keys = store.list_keys(Some("g")).await.unwrap();
        keys.sort();
        assert_eq!(keys, vec![first.record_key(), second.record_key()]);
    }

    #[tokio::test]
    async fn test_clear_removes_undecodable_records() {
        let (backend, store) = memory_store();
        backend
            .write_blob(&RecordKey::new("A", "junk").storage_key(), b"junk")
            .await
            .unwrap();
        store.put(&record("A", "ok", None, Utc::now())).await.unwrap();
        store.put(&record("B", "ok", None, Utc::now())).await.unwrap();

        assert_eq!(store.clear(Some("A")).await.unwrap(), 2);
        assert_eq!(backend.list_blob_keys(None).await.unwrap().len(), 1);
        assert_eq!(store.lock_entries(), 0);
    }

    #[tokio::test]
    async fn test_cancelled_lock_waiter_leaves_no_entry() {
        let (_, store) = memory_store();
        let store = Arc::new(store);
        let storage_key = RecordKey::new("g", "k").storage_key();

        let holder = store.lock(&storage_key).await;
        let waiter = {
            let store = store.clone();
            let storage_key = storage_key.clone();
            tokio::spawn(async move {
                let _guard = store.lock(&storage_key).await;
            })
        };
        for _ in 0..5 {
            tokio::task::yield_now().await;
        }

        // Release, then cancel the waiter before it runs again
        drop(holder);
        waiter.abort();
        let _ = waiter.await;

        assert_eq!(store.lock_entries(), 0);
    }

    #[tokio::test]
    async fn test_other_keys_proceed_while_one_is_locked() {
        let (_, store) = memory_store();
        let busy = RecordKey::new("g", "busy").storage_key();
        let _held = store.lock(&busy).await;

        let other = record("g", "free", None, Utc::now());
        tokio::time::timeout(Duration::from_secs(1), async {
            store.put(&other).await.unwrap();
            assert_eq!(store.get(&other.record_key()).await.unwrap(), Some(other.clone()));
            store.delete(&other.record_key()).await.unwrap();
        })
        .await
        .expect("operations on another key must not wait");
    }

    struct FailingWrites(MemoryBackend);

    #[async_trait]
    impl StorageBackend for FailingWrites {
        async fn write_blob(&self, storage_key: &str, _bytes: &[u8]) -> std::result::Result<(), StorageError> {
            Err(StorageError::new(
                storage_key,
                std::io::Error::new(std::io::ErrorKind::Other, "disk full"),
            ))
        }
        async fn read_blob(&self, k: &str) -> std::result::Result<Option<Vec<u8>>, StorageError> {
            self.0.read_blob(k).await
        }
        async fn delete_blob(&self, k: &str) -> std::result::Result<(), StorageError> {
            self.0.delete_blob(k).await
        }
        async fn list_blob_keys(&self, p: Option<&str>) -> std::result::Result<Vec<String>, StorageError> {
            self.0.list_blob_keys(p).await
        }
        async fn total_bytes(&self, p: Option<&str>) -> std::result::Result<u64, StorageError> {
            self.0.total_bytes(p).await
        }
    }

    #[tokio::test]
    async fn test_failed_write_keeps_previous_record() {
        let inner = MemoryBackend::new();
        let old = record("g", "k", None, Utc::now());
        let bytes = RecordCodec::plaintext().encode(&old).unwrap();
        inner.write_blob(&old.record_key().storage_key(), &bytes).await.unwrap();

        let store = EntryStore::new(Arc::new(FailingWrites(inner)), RecordCodec::plaintext());
        let mut new = old.clone();
        new.payload = b"new".to_vec();

        let err = store.put(&new).await.unwrap_err();
        assert!(matches!(err, CacheError::Storage(_)));
        assert_eq!(store.get(&old.record_key()).await.unwrap(), Some(old));
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_concurrent_overwrites_never_tear() {
        let dir = tempdir().unwrap();
        let backend = Arc::new(FileBackend::new(dir.path().to_path_buf()));
        backend.init().await.unwrap();
        let store = Arc::new(EntryStore::new(backend, RecordCodec::plaintext()));
        let key = RecordKey::new("g", "hot");

        let mut tasks = Vec::new();
        for i in 0..8u8 {
            let store = store.clone();
            let key = key.clone();
            tasks.push(tokio::spawn(async move {
                for _ in 0..20 {
                    let rec = CacheRecord::new(&key, vec![i; 4096], Utc::now());
                    store.put(&rec).await.unwrap();
                    if let Some(read) = store.get(&key).await.unwrap() {
                        let first = read.payload[0];
                        assert!(read.payload.iter().all(|b| *b == first));
                        assert_eq!(read.payload.len(), 4096);
                    }
                }
            }));
        }
        for task in tasks {
            task.await.unwrap();
        }
        assert_eq!(store.list_keys(None).await.unwrap(), vec![key]);
        assert_eq!(store.lock_entries(), 0);
    }
}
