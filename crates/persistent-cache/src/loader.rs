//! Loader coordination: at most one load in flight per `(group, key)`.
//!
//! A miss spawns the load as its own task and publishes a shared handle to it
//! in the in-flight table. Every caller that arrives while the load runs
//! awaits that same handle. The task clears its table entry when it finishes,
//! panics or is aborted, so a dropped caller can never strand the key.

use std::future::Future;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use futures::future::{BoxFuture, FutureExt, Shared};
use tracing::{debug, warn};

use crate::config::ReadOptions;
use crate::error::{BoxError, CacheError, LoadError, Result};
use crate::expiry::is_expired;
use crate::key::RecordKey;
use crate::store::EntryStore;
use crate::types::{CacheRecord, Counters};

type LoadOutcome = std::result::Result<Fetched, LoadError>;
type SharedLoad = Shared<BoxFuture<'static, LoadOutcome>>;

/// Where a value handed back by [`LoaderCoordinator::read_with_loader`] came from
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Origin {
    /// Live record already in storage
    Cache,
    /// Produced by the loader and written to storage
    Loader,
    /// Expired record served because the loader failed
    Expired,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Fetched {
    pub record: CacheRecord,
    pub origin: Origin,
}

struct InFlight {
    id: u64,
    load: SharedLoad,
}

/// Behaviour knobs taken from [`CacheConfig`](crate::CacheConfig)
#[derive(Debug, Clone, Default)]
pub struct LoaderSettings {
    pub load_timeout: Option<Duration>,
    pub use_expired_data_if_loader_fails: bool,
}

pub struct LoaderCoordinator {
    store: Arc<EntryStore>,
    in_flight: Arc<DashMap<RecordKey, InFlight>>,
    next_id: AtomicU64,
    settings: LoaderSettings,
    counters: Arc<Counters>,
}

/// Removes the in-flight entry when the load task ends, however it ends.
struct InFlightGuard {
    table: Arc<DashMap<RecordKey, InFlight>>,
    key: RecordKey,
    id: u64,
}

impl Drop for InFlightGuard {
    fn drop(&mut self) {
        self.table.remove_if(&self.key, |_, entry| entry.id == self.id);
    }
}

impl LoaderCoordinator {
    pub fn new(store: Arc<EntryStore>, settings: LoaderSettings, counters: Arc<Counters>) -> Self {
        Self {
            store,
            in_flight: Arc::new(DashMap::new()),
            next_id: AtomicU64::new(0),
            settings,
            counters,
        }
    }

    /// Number of loads currently running
    pub fn in_flight(&self) -> usize {
        self.in_flight.len()
    }

    /// Return the live record for `key`, or run `loader` once on behalf of
    /// every concurrent caller and store what it produces with
    /// `created_at = now`.
    ///
    /// Must be called from within a Tokio runtime.
    pub async fn read_with_loader<F, Fut, E>(
        &self,
        key: &RecordKey,
        options: &ReadOptions,
        now: DateTime<Utc>,
        loader: F,
    ) -> Result<Fetched>
    where
        F: FnOnce() -> Fut + Send + 'static,
        Fut: Future<Output = std::result::Result<Vec<u8>, E>> + Send + 'static,
        E: Into<BoxError> + Send + 'static,
    {
        if options.encrypt && !self.store.codec().can_encrypt() {
            return Err(CacheError::MissingEncryptionKey);
        }

        if let Some(load) = self.attach(key) {
            debug!(key = %key, "Joining in-flight load");
            return load.await.map_err(CacheError::from);
        }

        let existing = self.store.get(key).await?;
        if let Some(record) = &existing {
            if !is_expired(record, now) {
                debug!(key = %key, "Cache hit");
                return Ok(Fetched {
                    record: record.clone(),
                    origin: Origin::Cache,
                });
            }
            debug!(key = %key, "Cached record expired");
        }

        let load = match self.in_flight.entry(key.clone()) {
            Entry::Occupied(entry) => {
                debug!(key = %key, "Joining in-flight load");
                entry.get().load.clone()
            }
            Entry::Vacant(entry) => {
                let id = self.next_id.fetch_add(1, Ordering::Relaxed);
                let load = self.start(key.clone(), id, options.clone(), now, existing, loader);
                entry.insert(InFlight {
                    id,
                    load: load.clone(),
                });
                load
            }
        };

        load.await.map_err(CacheError::from)
    }

    fn attach(&self, key: &RecordKey) -> Option<SharedLoad> {
        self.in_flight.get(key).map(|entry| entry.load.clone())
    }

    fn start<F, Fut, E>(
        &self,
        key: RecordKey,
        id: u64,
        options: ReadOptions,
        now: DateTime<Utc>,
        stale: Option<CacheRecord>,
        loader: F,
    ) -> SharedLoad
    where
        F: FnOnce() -> Fut + Send + 'static,
        Fut: Future<Output = std::result::Result<Vec<u8>, E>> + Send + 'static,
        E: Into<BoxError> + Send + 'static,
    {
        let guard = InFlightGuard {
            table: Arc::clone(&self.in_flight),
            key: key.clone(),
            id,
        };
        let store = Arc::clone(&self.store);
        let settings = self.settings.clone();
        let counters = Arc::clone(&self.counters);

        let task = tokio::spawn(async move {
            let _guard = guard;
            run_load(&store, &settings, &counters, &key, &options, now, stale, loader).await
        });

        async move {
            match task.await {
                Ok(outcome) => outcome,
                Err(e) if e.is_panic() => Err(LoadError::Panicked),
                Err(_) => Err(LoadError::Cancelled),
            }
        }
        .boxed()
        .shared()
    }
}

#[allow(clippy::too_many_arguments)]
async fn run_load<F, Fut, E>(
    store: &EntryStore,
    settings: &LoaderSettings,
    counters: &Counters,
    key: &RecordKey,
    options: &ReadOptions,
    now: DateTime<Utc>,
    stale: Option<CacheRecord>,
    loader: F,
) -> LoadOutcome
where
    F: FnOnce() -> Fut,
    Fut: Future<Output = std::result::Result<Vec<u8>, E>>,
    E: Into<BoxError>,
{
    // A load for this key may have settled between our miss and registering
    // this one.
    match store.get(key).await {
        Ok(Some(record)) if !is_expired(&record, now) => {
            return Ok(Fetched {
                record,
                origin: Origin::Cache,
            })
        }
        Ok(_) => {}
        Err(e) => return Err(LoadError::Storage(e.to_string())),
    }

    Counters::bump(&counters.loads);
    let produced = match settings.load_timeout {
        Some(limit) => match tokio::time::timeout(limit, loader()).await {
            Ok(result) => result.map_err(|e| LoadError::from_boxed(e.into())),
            Err(_) => Err(LoadError::TimedOut(limit)),
        },
        None => loader().await.map_err(|e| LoadError::from_boxed(e.into())),
    };

    let payload = match produced {
        Ok(payload) => payload,
        Err(err) => {
            Counters::bump(&counters.load_failures);
            if let (true, Some(record)) = (settings.use_expired_data_if_loader_fails, stale) {
                warn!(key = %key, error = %err, "Loader failed, serving expired record");
                return Ok(Fetched {
                    record,
                    origin: Origin::Expired,
                });
            }
            warn!(key = %key, error = %err, "Loader failed");
            return Err(err);
        }
    };

    let record = CacheRecord::new(key, payload, now)
        .with_ttl(options.ttl)
        .encrypted(options.encrypt);
    if let Err(e) = store.put(&record).await {
        Counters::bump(&counters.load_failures);
        warn!(key = %key, error = %e, "Failed to store loaded record");
        return Err(LoadError::Storage(e.to_string()));
    }

    debug!(key = %key, ttl = ?options.ttl, "Loaded and stored record");
    Ok(Fetched {
        record,
        origin: Origin::Loader,
    })
}
