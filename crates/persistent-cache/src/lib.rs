//! Disk-backed key/value cache with per-entry TTL, group eviction and
//! encryption at rest
//!
//! Each `(group, key)` is persisted as one blob. Concurrent misses on the same
//! key share a single loader run, and a background sweep deletes expired
//! records one group or one key at a time without blocking readers.

mod cache;
mod cipher;
mod codec;
mod config;
mod error;
mod evictor;
mod expiry;
mod key;
mod loader;
pub mod storage;
mod store;
mod types;

pub use cache::PersistentCache;
pub use cipher::{Cipher, KeyedCipher};
pub use codec::{RecordCodec, RecordHeader};
pub use config::{CacheConfig, ReadOptions};
pub use error::{AuthenticationError, BoxError, CacheError, DecodeError, LoadError, Result, StorageError};
pub use evictor::{Evictor, EvictorHandle, SweepReport};
pub use expiry::{expires_at, is_expired, is_expired_at};
pub use key::RecordKey;
pub use loader::{Fetched, LoaderCoordinator, LoaderSettings, Origin};
pub use store::{EntryStore, Eviction};
pub use types::{CacheRecord, CacheStats, Counters};
