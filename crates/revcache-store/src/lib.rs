//! # Revcache Store
//!
//! Named key→response stores for the revcache background worker.
//!
//! ## Architecture
//!
//! ```text
//! CacheStorage (all named stores)
//!     ├── "runtime-revision"      ──► CacheStore: cache key → FetchResponse
//!     ├── "font-cache"            ──► CacheStore
//!     ├── "external-image-cache"  ──► CacheStore
//!     └── "precache-v2-…"         ──► CacheStore
//!
//! ExpirationRegistry (separate bookkeeping, keyed by store name)
//!     └── url → last-used timestamp
//! ```
//!
//! Stores are never merged. Deleting a store does not touch its expiration
//! bookkeeping; callers that wipe a store must clear both.

use std::path::PathBuf;
use std::sync::Arc;

use async_trait::async_trait;
use revcache_net::FetchResponse;
use serde::{Deserialize, Serialize};
use thiserror::Error;

pub mod disk;
pub mod expiration;
pub mod memory;

pub use disk::DiskCacheStorage;
pub use expiration::{ExpirationPolicy, ExpirationRegistry};
pub use memory::{MemoryCache, MemoryCacheStorage};

// ==================== Errors ====================

/// Errors that can occur in cache store operations.
#[derive(Error, Debug)]
pub enum StoreError {
    /// Bulk listing refused because the store holds too many entries.
    #[error("Operation too large: {count} keys exceed the listing limit of {limit}")]
    EnumerationLimit { count: usize, limit: usize },

    #[error("Quota exceeded in cache {0}")]
    QuotaExceeded(String),

    #[error("IO error at {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Serialization error: {0}")]
    Serialization(String),

    #[error("Cache error: {0}")]
    Other(String),
}

impl StoreError {
    /// Whether a caller can fall back to per-key lookups.
    pub fn is_enumeration_limit(&self) -> bool {
        matches!(self, StoreError::EnumerationLimit { .. })
    }
}

// ==================== Entries ====================

/// A stored response together with the key it was stored under.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CacheEntry {
    /// Cache key.
    pub key: String,

    /// Stored response.
    pub response: FetchResponse,

    /// Cached at timestamp (ms since epoch).
    pub cached_at: u64,
}

impl CacheEntry {
    pub fn new(key: &str, response: FetchResponse) -> Self {
        Self {
            key: key.to_string(),
            response,
            cached_at: revcache_common::unix_millis(),
        }
    }
}

/// Limits a backend imposes, mirroring what a browser's cache storage
/// enforces.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct StoreLimits {
    /// `keys()` fails once a store holds more entries than this.
    pub max_listed_keys: Option<usize>,
    /// `put()` of a new key fails once a store holds this many entries.
    pub max_entries: Option<usize>,
}

// ==================== Traits ====================

/// One named store.
#[async_trait]
pub trait CacheStore: Send + Sync {
    /// Store name.
    fn name(&self) -> &str;

    /// Look up a key.
    async fn match_key(&self, key: &str) -> Result<Option<FetchResponse>, StoreError>;

    /// Store a response, replacing any previous one under the same key.
    async fn put(&self, key: &str, response: FetchResponse) -> Result<(), StoreError>;

    /// Delete a key. Returns whether it was present.
    async fn delete(&self, key: &str) -> Result<bool, StoreError>;

    /// List every key. May fail with [`StoreError::EnumerationLimit`].
    async fn keys(&self) -> Result<Vec<String>, StoreError>;

    /// Check a single key without listing the store.
    async fn contains(&self, key: &str) -> Result<bool, StoreError> {
        Ok(self.match_key(key).await?.is_some())
    }
}

/// The set of all named stores.
#[async_trait]
pub trait CacheStorage: Send + Sync {
    /// Open a store, creating it if it doesn't exist.
    async fn open(&self, name: &str) -> Result<Arc<dyn CacheStore>, StoreError>;

    /// Check if a store exists.
    async fn has(&self, name: &str) -> Result<bool, StoreError>;

    /// Delete a store and all its entries. Returns whether it existed.
    async fn delete(&self, name: &str) -> Result<bool, StoreError>;

    /// Names of all existing stores.
    async fn keys(&self) -> Result<Vec<String>, StoreError>;
}
