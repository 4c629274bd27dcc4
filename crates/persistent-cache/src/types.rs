//! Cache types

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use crate::key::RecordKey;

/// One persisted cache entry
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CacheRecord {
    pub key: String,
    /// Empty string means ungrouped
    pub group: String,
    pub created_at: DateTime<Utc>,
    /// `None` never expires by time
    pub ttl: Option<Duration>,
    pub encrypted: bool,
    pub payload: Vec<u8>,
}

impl CacheRecord {
    pub fn new(key: &RecordKey, payload: Vec<u8>, created_at: DateTime<Utc>) -> Self {
        Self {
            key: key.key().to_string(),
            group: key.group().to_string(),
            created_at,
            ttl: None,
            encrypted: false,
            payload,
        }
    }

    pub fn with_ttl(mut self, ttl: Option<Duration>) -> Self {
        self.ttl = ttl;
        self
    }

    pub fn encrypted(mut self, encrypted: bool) -> Self {
        self.encrypted = encrypted;
        self
    }

    pub fn record_key(&self) -> RecordKey {
        RecordKey::new(&self.group, &self.key)
    }
}

/// Statistics about the cache
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct CacheStats {
    pub entries: usize,
    pub total_size: u64,
    pub hits: u64,
    pub misses: u64,
    /// Loader invocations, not callers served by them
    pub loads: u64,
    pub load_failures: u64,
    pub evicted: u64,
}

/// Shared atomic counters behind [`CacheStats`]
#[derive(Debug, Default)]
pub struct Counters {
    pub(crate) hits: AtomicU64,
    pub(crate) misses: AtomicU64,
    pub(crate) loads: AtomicU64,
    pub(crate) load_failures: AtomicU64,
    pub(crate) evicted: AtomicU64,
}

impl Counters {
    pub(crate) fn bump(counter: &AtomicU64) {
        counter.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn add(counter: &AtomicU64, n: u64) {
        counter.fetch_add(n, Ordering::Relaxed);
    }

    /// Snapshot the counters; `entries` and `total_size` come from storage.
    pub fn snapshot(&self, entries: usize, total_size: u64) -> CacheStats {
        CacheStats {
            entries,
            total_size,
            hits: self.hits.load(Ordering::Relaxed),
            misses: self.misses.load(Ordering::Relaxed),
            loads: self.loads.load(Ordering::Relaxed),
            load_failures: self.load_failures.load(Ordering::Relaxed),
            evicted: self.evicted.load(Ordering::Relaxed),
        }
    }
}
