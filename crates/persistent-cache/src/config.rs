//! Cache configuration

use std::path::PathBuf;
use std::time::Duration;

use crate::error::{CacheError, Result};
use crate::loader::LoaderSettings;

const DEFAULT_ROOT: &str = "./cache/records";
const DEFAULT_SWEEP_INTERVAL: Duration = Duration::from_secs(60);

/// Immutable configuration for a [`PersistentCache`](crate::PersistentCache)
#[derive(Clone)]
pub struct CacheConfig {
    /// Directory holding one file per record
    pub root: PathBuf,
    /// Passphrase for encryption at rest; records asking for encryption
    /// fail to write without it
    pub encryption_key: Option<String>,
    /// Upper bound on one loader run
    pub load_timeout: Option<Duration>,
    /// Period of the background sweep
    pub sweep_interval: Duration,
    /// Wake the background sweep early once storage grows past this
    pub max_storage_bytes: Option<u64>,
    /// Serve an expired record instead of a loader failure
    pub use_expired_data_if_loader_fails: bool,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            root: PathBuf::from(DEFAULT_ROOT),
            encryption_key: None,
            load_timeout: None,
            sweep_interval: DEFAULT_SWEEP_INTERVAL,
            max_storage_bytes: None,
            use_expired_data_if_loader_fails: false,
        }
    }
}

impl CacheConfig {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self {
            root: root.into(),
            ..Self::default()
        }
    }

    pub fn with_encryption_key(mut self, key: impl Into<String>) -> Self {
        self.encryption_key = Some(key.into());
        self
    }

    pub fn with_load_timeout(mut self, timeout: Duration) -> Self {
        self.load_timeout = Some(timeout);
        self
    }

    pub fn with_sweep_interval(mut self, interval: Duration) -> Self {
        self.sweep_interval = interval;
        self
    }

    pub fn with_max_storage_bytes(mut self, bytes: u64) -> Self {
        self.max_storage_bytes = Some(bytes);
        self
    }

    pub fn with_expired_data_if_loader_fails(mut self, enabled: bool) -> Self {
        self.use_expired_data_if_loader_fails = enabled;
        self
    }

    /// Reject settings the cache cannot run with
    pub fn validate(&self) -> Result<()> {
        if self.sweep_interval.is_zero() {
            return Err(CacheError::Config("sweep interval must be positive".to_string()));
        }
        Ok(())
    }

    pub(crate) fn loader_settings(&self) -> LoaderSettings {
        LoaderSettings {
            load_timeout: self.load_timeout,
            use_expired_data_if_loader_fails: self.use_expired_data_if_loader_fails,
        }
    }

    /// Load configuration from environment variables:
    /// `CACHE_DIR`, `CACHE_ENCRYPTION_KEY`, `CACHE_SWEEP_INTERVAL_SECS`,
    /// `CACHE_MAX_BYTES`, `CACHE_LOAD_TIMEOUT_SECS`, `CACHE_USE_EXPIRED_ON_FAILURE`.
    pub fn from_env() -> Result<Self> {
        Self::from_lookup(|name| std::env::var(name).ok())
    }

    fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self> {
        let mut config = Self::default();

        if let Some(dir) = lookup("CACHE_DIR") {
            config.root = PathBuf::from(dir);
        }
        config.encryption_key = lookup("CACHE_ENCRYPTION_KEY").filter(|k| !k.is_empty());
        if let Some(secs) = parse_u64(&lookup, "CACHE_SWEEP_INTERVAL_SECS")? {
            config.sweep_interval = Duration::from_secs(secs);
        }
        config.max_storage_bytes = parse_u64(&lookup, "CACHE_MAX_BYTES")?;
        config.load_timeout = parse_u64(&lookup, "CACHE_LOAD_TIMEOUT_SECS")?.map(Duration::from_secs);
        config.use_expired_data_if_loader_fails = lookup("CACHE_USE_EXPIRED_ON_FAILURE")
            .map(|v| v == "1" || v.eq_ignore_ascii_case("true"))
            .unwrap_or(false);

        config.validate()?;
        Ok(config)
    }
}

fn parse_u64(lookup: &impl Fn(&str) -> Option<String>, name: &str) -> Result<Option<u64>> {
    lookup(name)
        .map(|raw| {
            raw.parse::<u64>()
                .map_err(|e| CacheError::Config(format!("{}={:?}: {}", name, raw, e)))
        })
        .transpose()
}

impl std::fmt::Debug for CacheConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CacheConfig")
            .field("root", &self.root)
            .field("encryption_key", &self.encryption_key.as_ref().map(|_| "<redacted>"))
            .field("load_timeout", &self.load_timeout)
            .field("sweep_interval", &self.sweep_interval)
            .field("max_storage_bytes", &self.max_storage_bytes)
            .field(
                "use_expired_data_if_loader_fails",
                &self.use_expired_data_if_loader_fails,
            )
            .finish()
    }
}

/// Per-call options for reads that may load and for writes
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ReadOptions {
    /// `None` keeps the record until it is invalidated
    pub ttl: Option<Duration>,
    pub encrypt: bool,
}

impl ReadOptions {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_ttl(mut self, ttl: Duration) -> Self {
        self.ttl = Some(ttl);
        self
    }

    pub fn encrypted(mut self) -> Self {
        self.encrypt = true;
        self
    }
}
