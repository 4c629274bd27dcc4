//! Typed cache facade over the entry store, loader and evictor

use std::future::Future;
use std::sync::Arc;

use chrono::Utc;
use serde::de::DeserializeOwned;
use serde::Serialize;
use tracing::{debug, info};

use crate::cipher::{Cipher, KeyedCipher};
use crate::codec::RecordCodec;
use crate::config::{CacheConfig, ReadOptions};
use crate::error::{BoxError, Result};
use crate::evictor::{Evictor, EvictorHandle, SweepReport};
use crate::expiry::is_expired;
use crate::key::RecordKey;
use crate::loader::{Fetched, LoaderCoordinator, Origin};
use crate::storage::{FileBackend, StorageBackend};
use crate::store::EntryStore;
use crate::types::{CacheRecord, CacheStats, Counters};

/// A persistent cache of serde values, one record per `(group, key)`
pub struct PersistentCache {
    config: CacheConfig,
    store: Arc<EntryStore>,
    loader: LoaderCoordinator,
    evictor: Arc<Evictor>,
    counters: Arc<Counters>,
}

impl PersistentCache {
    /// Open a cache rooted at `config.root`, creating the directory if needed
    pub async fn open(config: CacheConfig) -> Result<Self> {
        config.validate()?;
        let backend = FileBackend::new(config.root.clone());
        backend.init().await?;
        Self::with_backend(config, Arc::new(backend))
    }

    /// Build a cache over any backend; `config.root` is ignored.
    pub fn with_backend(config: CacheConfig, backend: Arc<dyn StorageBackend>) -> Result<Self> {
        config.validate()?;
        let cipher = match config.encryption_key.as_deref() {
            Some(passphrase) => Some(Arc::new(KeyedCipher::from_passphrase(passphrase)?) as Arc<dyn Cipher>),
            None => None,
        };
        let store = Arc::new(EntryStore::new(backend, RecordCodec::new(cipher)));
        let counters = Arc::new(Counters::default());
        let loader = LoaderCoordinator::new(
            Arc::clone(&store),
            config.loader_settings(),
            Arc::clone(&counters),
        );
        let evictor = Arc::new(Evictor::new(Arc::clone(&store), Arc::clone(&counters)));

        info!(
            encrypted = config.encryption_key.is_some(),
            sweep_interval = ?config.sweep_interval,
            "Cache opened"
        );

        Ok(Self {
            config,
            store,
            loader,
            evictor,
            counters,
        })
    }

    pub fn config(&self) -> &CacheConfig {
        &self.config
    }

    /// Return the live value for `(group, key)`, or produce it with `loader`.
    /// Concurrent callers for the same key share a single loader run.
    pub async fn read_with_loader<T, F, Fut, E>(
        &self,
        group: &str,
        key: &str,
        options: &ReadOptions,
        loader: F,
    ) -> Result<T>
    where
        T: Serialize + DeserializeOwned + Send + 'static,
        F: FnOnce() -> Fut + Send + 'static,
        Fut: Future<Output = std::result::Result<T, E>> + Send + 'static,
        E: Into<BoxError> + Send + 'static,
    {
        let key = RecordKey::new(group, key);
        let fetched = self
            .read_raw_with_loader(&key, options, move || async move {
                let value = loader().await.map_err(Into::<BoxError>::into)?;
                Ok::<_, BoxError>(serde_json::to_vec(&value)?)
            })
            .await?;

        Ok(serde_json::from_slice(&fetched.record.payload)?)
    }

    /// Byte-level [`read_with_loader`](Self::read_with_loader) for callers
    /// that bring their own value encoding.
    pub async fn read_raw_with_loader<F, Fut, E>(
        &self,
        key: &RecordKey,
        options: &ReadOptions,
        loader: F,
    ) -> Result<Fetched>
    where
        F: FnOnce() -> Fut + Send + 'static,
        Fut: Future<Output = std::result::Result<Vec<u8>, E>> + Send + 'static,
        E: Into<BoxError> + Send + 'static,
    {
        let fetched = self
            .loader
            .read_with_loader(key, options, Utc::now(), loader)
            .await?;

        match fetched.origin {
            Origin::Cache => Counters::bump(&self.counters.hits),
            Origin::Loader => {
                Counters::bump(&self.counters.misses);
                self.check_storage_growth().await;
            }
            Origin::Expired => Counters::bump(&self.counters.misses),
        }
        Ok(fetched)
    }

    /// Live value for `(group, key)`, if any. Expired records read as absent.
    pub async fn get<T: DeserializeOwned>(&self, group: &str, key: &str) -> Result<Option<T>> {
        let key = RecordKey::new(group, key);
        match self.store.get(&key).await? {
            Some(record) if !is_expired(&record, Utc::now()) => {
                Counters::bump(&self.counters.hits);
                debug!(key = %key, "Cache hit");
                Ok(Some(serde_json::from_slice(&record.payload)?))
            }
            _ => {
                Counters::bump(&self.counters.misses);
                debug!(key = %key, "Cache miss");
                Ok(None)
            }
        }
    }

    /// Store `value`, replacing any previous record for `(group, key)`
    pub async fn put<T: Serialize>(
        &self,
        group: &str,
        key: &str,
        value: &T,
        options: &ReadOptions,
    ) -> Result<()> {
        let key = RecordKey::new(group, key);
        let payload = serde_json::to_vec(value)?;
        let record = CacheRecord::new(&key, payload, Utc::now())
            .with_ttl(options.ttl)
            .encrypted(options.encrypt);

        self.store.put(&record).await?;
        self.check_storage_growth().await;
        Ok(())
    }

    pub async fn invalidate(&self, group: &str, key: &str) -> Result<()> {
        self.store.delete(&RecordKey::new(group, key)).await?;
        Ok(())
    }

    /// Delete every record in `group`, expired or not. Returns how many were removed.
    pub async fn invalidate_group(&self, group: &str) -> Result<u64> {
        let removed = self.store.clear(Some(group)).await?;
        info!(group, removed, "Invalidated group");
        Ok(removed)
    }

    pub async fn invalidate_all(&self) -> Result<u64> {
        let removed = self.store.clear(None).await?;
        info!(removed, "Invalidated all records");
        Ok(removed)
    }

    /// Evict expired records now, in one group or across all of them
    pub async fn sweep(&self, group: Option<&str>) -> Result<SweepReport> {
        Ok(self.evictor.sweep(group, Utc::now()).await?)
    }

    /// Bytes occupied in storage by one group, or by everything
    pub async fn size(&self, group: Option<&str>) -> Result<u64> {
        Ok(self.store.size_of(group).await?)
    }

    /// Stored keys, expired or not, in one group or across all of them
    pub async fn keys(&self, group: Option<&str>) -> Result<Vec<RecordKey>> {
        Ok(self.store.list_keys(group).await?)
    }

    pub async fn stats(&self) -> Result<CacheStats> {
        let entries = self.store.list_keys(None).await?.len();
        let total_size = self.store.size_of(None).await?;
        Ok(self.counters.snapshot(entries, total_size))
    }

    /// Start sweeping every `sweep_interval` in the background.
    /// Must be called from within a Tokio runtime.
    pub fn start_evictor(&self) -> Result<EvictorHandle> {
        self.evictor.spawn(self.config.sweep_interval)
    }

    /// Loads currently running
    pub fn loads_in_flight(&self) -> usize {
        self.loader.in_flight()
    }

    async fn check_storage_growth(&self) {
        let Some(limit) = self.config.max_storage_bytes else {
            return;
        };
        match self.store.size_of(None).await {
            Ok(total) if total > limit => {
                debug!(total, limit, "Storage over limit, requesting sweep");
                self.evictor.request_sweep();
            }
            Ok(_) => {}
            Err(e) => debug!(error = %e, "Could not measure storage size"),
        }
    }
}

impl std::fmt::Debug for PersistentCache {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PersistentCache")
            .field("config", &self.config)
            .finish_non_exhaustive()
    }
}
