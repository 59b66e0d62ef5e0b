//! In-memory cache storage.

use std::sync::Arc;

use async_trait::async_trait;
use hashbrown::HashMap;
use revcache_net::FetchResponse;
use tokio::sync::RwLock;
use tracing::trace;

use crate::{CacheEntry, CacheStorage, CacheStore, StoreError, StoreLimits};

/// A store held in memory.
#[derive(Debug, Default)]
pub struct MemoryCache {
    name: String,
    limits: StoreLimits,
    entries: RwLock<HashMap<String, CacheEntry>>,
}

impl MemoryCache {
    /// Create a new store.
    pub fn new(name: &str, limits: StoreLimits) -> Self {
        Self {
            name: name.to_string(),
            limits,
            entries: RwLock::new(HashMap::new()),
        }
    }

    /// Number of entries.
    pub async fn len(&self) -> usize {
        self.entries.read().await.len()
    }

    /// Check if empty.
    pub async fn is_empty(&self) -> bool {
        self.entries.read().await.is_empty()
    }
}

#[async_trait]
impl CacheStore for MemoryCache {
    fn name(&self) -> &str {
        &self.name
    }

    async fn match_key(&self, key: &str) -> Result<Option<FetchResponse>, StoreError> {
        let entries = self.entries.read().await;
        Ok(entries.get(key).map(|e| e.response.clone().into_cached()))
    }

    async fn put(&self, key: &str, response: FetchResponse) -> Result<(), StoreError> {
        let mut entries = self.entries.write().await;
        if let Some(max) = self.limits.max_entries {
            if entries.len() >= max && !entries.contains_key(key) {
                return Err(StoreError::QuotaExceeded(self.name.clone()));
            }
        }
        trace!(cache = %self.name, key, "Storing entry");
        entries.insert(key.to_string(), CacheEntry::new(key, response));
        Ok(())
    }

    async fn delete(&self, key: &str) -> Result<bool, StoreError> {
        Ok(self.entries.write().await.remove(key).is_some())
    }

    async fn keys(&self) -> Result<Vec<String>, StoreError> {
        let entries = self.entries.read().await;
        if let Some(limit) = self.limits.max_listed_keys {
            if entries.len() > limit {
                return Err(StoreError::EnumerationLimit {
                    count: entries.len(),
                    limit,
                });
            }
        }
        Ok(entries.keys().cloned().collect())
    }

    async fn contains(&self, key: &str) -> Result<bool, StoreError> {
        Ok(self.entries.read().await.contains_key(key))
    }
}

/// All named stores, held in memory.
#[derive(Debug, Default)]
pub struct MemoryCacheStorage {
    limits: StoreLimits,
    caches: RwLock<HashMap<String, Arc<MemoryCache>>>,
}

impl MemoryCacheStorage {
    /// Create new cache storage.
    pub fn new() -> Self {
        Self::default()
    }

    /// Create cache storage whose stores enforce the given limits.
    pub fn with_limits(limits: StoreLimits) -> Self {
        Self {
            limits,
            caches: RwLock::new(HashMap::new()),
        }
    }

    /// Open a store as its concrete type.
    pub async fn open_memory(&self, name: &str) -> Arc<MemoryCache> {
        let mut caches = self.caches.write().await;
        Arc::clone(
            caches
                .entry(name.to_string())
                .or_insert_with(|| Arc::new(MemoryCache::new(name, self.limits))),
        )
    }
}

#[async_trait]
impl CacheStorage for MemoryCacheStorage {
    async fn open(&self, name: &str) -> Result<Arc<dyn CacheStore>, StoreError> {
        Ok(self.open_memory(name).await)
    }

    async fn has(&self, name: &str) -> Result<bool, StoreError> {
        Ok(self.caches.read().await.contains_key(name))
    }

    async fn delete(&self, name: &str) -> Result<bool, StoreError> {
        Ok(self.caches.write().await.remove(name).is_some())
    }

    async fn keys(&self) -> Result<Vec<String>, StoreError> {
        Ok(self.caches.read().await.keys().cloned().collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn response(url: &str) -> FetchResponse {
        FetchResponse::new(url, 200, "body")
    }

    #[tokio::test]
    async fn test_put_and_match() {
        let cache = MemoryCache::new("runtime-revision", StoreLimits::default());
        cache
            .put("https://example.com/a.png?__WB_REVISION__=r1", response("https://example.com/a.png"))
            .await
            .unwrap();

        let hit = cache
            .match_key("https://example.com/a.png?__WB_REVISION__=r1")
            .await
            .unwrap()
            .unwrap();
        assert!(hit.from_cache);
        assert!(cache
            .match_key("https://example.com/a.png?__WB_REVISION__=r2")
            .await
            .unwrap()
            .is_none());
    }

    #[tokio::test]
    async fn test_delete() {
        let cache = MemoryCache::new("v1", StoreLimits::default());
        cache.put("k", response("https://example.com/k")).await.unwrap();
        assert!(cache.delete("k").await.unwrap());
        assert!(!cache.delete("k").await.unwrap());
        assert!(cache.is_empty().await);
    }

    #[tokio::test]
    async fn test_keys_respects_listing_limit() {
        let limits = StoreLimits {
            max_listed_keys: Some(2),
            ..Default::default()
        };
        let cache = MemoryCache::new("runtime-revision", limits);
        for key in ["a", "b", "c"] {
            cache.put(key, response(key)).await.unwrap();
        }

        let err = cache.keys().await.unwrap_err();
        assert!(err.is_enumeration_limit());
        assert!(cache.contains("c").await.unwrap());
    }

    #[tokio::test]
    async fn test_put_respects_entry_quota() {
        let limits = StoreLimits {
            max_entries: Some(1),
            ..Default::default()
        };
        let cache = MemoryCache::new("external-image-cache", limits);
        cache.put("a", response("a")).await.unwrap();
        cache.put("a", response("a")).await.unwrap();
        assert!(matches!(
            cache.put("b", response("b")).await,
            Err(StoreError::QuotaExceeded(_))
        ));
    }

    #[tokio::test]
    async fn test_storage_open_has_delete() {
        let storage = MemoryCacheStorage::new();
        assert!(!storage.has("font-cache").await.unwrap());

        let store = storage.open("font-cache").await.unwrap();
        store.put("k", response("k")).await.unwrap();
        assert!(storage.has("font-cache").await.unwrap());

        let again = storage.open("font-cache").await.unwrap();
        assert!(again.contains("k").await.unwrap());

        assert!(storage.delete("font-cache").await.unwrap());
        assert!(!storage.has("font-cache").await.unwrap());
        assert!(storage.keys().await.unwrap().is_empty());
    }
}
