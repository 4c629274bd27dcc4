//! Error types for the persistent cache

use std::sync::Arc;
use std::time::Duration;

use thiserror::Error;

pub type BoxError = Box<dyn std::error::Error + Send + Sync>;

/// Failure reported by a [`StorageBackend`](crate::storage::StorageBackend).
#[derive(Error, Debug)]
#[error("storage error on '{storage_key}': {source}")]
pub struct StorageError {
    pub storage_key: String,
    #[source]
    pub source: std::io::Error,
}

impl StorageError {
    pub fn new(storage_key: impl Into<String>, source: std::io::Error) -> Self {
        Self {
            storage_key: storage_key.into(),
            source,
        }
    }
}

/// Why a stored blob could not be turned back into a record.
///
/// Read paths treat every variant as a miss.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum DecodeError {
    #[error("corrupt record: {0}")]
    Corrupt(String),

    #[error("record is encrypted but no encryption key is configured")]
    MissingKey,
}

/// The encryption transform rejected a sealed payload.
#[derive(Error, Debug, Clone, Copy, PartialEq, Eq)]
#[error("payload failed authentication")]
pub struct AuthenticationError;

impl From<AuthenticationError> for DecodeError {
    fn from(_: AuthenticationError) -> Self {
        DecodeError::Corrupt("payload failed authentication".to_string())
    }
}

/// Outcome of a failed load, shared by every caller waiting on that load.
#[derive(Error, Debug, Clone)]
pub enum LoadError {
    #[error("loader failed: {0}")]
    Failed(Arc<dyn std::error::Error + Send + Sync>),

    #[error("loader timed out after {0:?}")]
    TimedOut(Duration),

    #[error("loader panicked")]
    Panicked,

    #[error("load was cancelled")]
    Cancelled,

    #[error("loaded value could not be stored: {0}")]
    Storage(String),
}

impl LoadError {
    /// Wrap any loader error.
    pub fn failed<E>(err: E) -> Self
    where
        E: std::error::Error + Send + Sync + 'static,
    {
        LoadError::Failed(Arc::new(err))
    }

    pub fn from_boxed(err: BoxError) -> Self {
        LoadError::Failed(Arc::from(err))
    }
}

#[derive(Error, Debug)]
pub enum CacheError {
    #[error(transparent)]
    Storage(#[from] StorageError),

    #[error(transparent)]
    Load(#[from] LoadError),

    #[error("encryption requested but no encryption key is configured")]
    MissingEncryptionKey,

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Serialization error: {0}")]
    Serialization(String),
}

impl From<serde_json::Error> for CacheError {
    fn from(err: serde_json::Error) -> Self {
        CacheError::Serialization(err.to_string())
    }
}

impl From<tracing_subscriber::filter::ParseError> for CacheError {
    fn from(err: tracing_subscriber::filter::ParseError) -> Self {
        CacheError::Config(err.to_string())
    }
}

pub type Result<T> = std::result::Result<T, CacheError>;
