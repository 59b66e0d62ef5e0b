//! Expiration bookkeeping for stores that must not grow without bound.
//!
//! Timestamps live apart from the stores themselves: deleting a store leaves
//! its bookkeeping behind until [`ExpirationRegistry::delete`] is called.

use std::time::Duration;

use hashbrown::HashMap;
use serde::{Deserialize, Serialize};
use tokio::sync::RwLock;
use tracing::{debug, info, warn};

use crate::{CacheStorage, CacheStore, StoreError};

/// When entries in an expiring store are reaped.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ExpirationPolicy {
    /// Entries unused for longer than this are removed.
    #[serde(with = "secs")]
    pub max_age: Option<Duration>,
    /// At most this many entries are kept, least recently used go first.
    pub max_entries: Option<usize>,
    /// Drop the whole store when a write hits the storage quota.
    pub purge_on_quota_error: bool,
}

impl Default for ExpirationPolicy {
    fn default() -> Self {
        Self {
            max_age: Some(Duration::from_secs(7 * 24 * 60 * 60)),
            max_entries: Some(100),
            purge_on_quota_error: true,
        }
    }
}

mod secs {
    use serde::{Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S: Serializer>(value: &Option<Duration>, s: S) -> Result<S::Ok, S::Error> {
        match value {
            Some(d) => s.serialize_some(&d.as_secs()),
            None => s.serialize_none(),
        }
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Option<Duration>, D::Error> {
        Ok(Option::<u64>::deserialize(d)?.map(Duration::from_secs))
    }
}

/// Last-used timestamps per store name and URL.
#[derive(Debug, Default)]
pub struct ExpirationRegistry {
    timestamps: RwLock<HashMap<String, HashMap<String, u64>>>,
}

impl ExpirationRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record that `url` in `cache_name` was used at `now_ms`.
    pub async fn update_timestamp(&self, cache_name: &str, url: &str, now_ms: u64) {
        self.timestamps
            .write()
            .await
            .entry(cache_name.to_string())
            .or_default()
            .insert(url.to_string(), now_ms);
    }

    /// Remove and return the URLs that the policy says must go.
    ///
    /// Age is checked first; the survivors are then trimmed to
    /// `max_entries`, oldest first.
    pub async fn take_expired(
        &self,
        cache_name: &str,
        policy: &ExpirationPolicy,
        now_ms: u64,
    ) -> Vec<String> {
        let mut all = self.timestamps.write().await;
        let Some(entries) = all.get_mut(cache_name) else {
            return Vec::new();
        };
        let expired = select_expired(entries, policy, now_ms);
        for url in &expired {
            entries.remove(url);
        }
        expired
    }

    /// The URLs the policy says must go, without forgetting them.
    pub async fn find_expired(
        &self,
        cache_name: &str,
        policy: &ExpirationPolicy,
        now_ms: u64,
    ) -> Vec<String> {
        self.timestamps
            .read()
            .await
            .get(cache_name)
            .map_or_else(Vec::new, |entries| select_expired(entries, policy, now_ms))
    }

    /// Forget one URL of a store.
    pub async fn forget(&self, cache_name: &str, url: &str) -> bool {
        self.timestamps
            .write()
            .await
            .get_mut(cache_name)
            .is_some_and(|entries| entries.remove(url).is_some())
    }

    /// Reap expired entries from `store`, returning the deleted URLs.
    ///
    /// A URL is forgotten only once its store entry is gone. A failed delete
    /// is logged and the URL stays tracked, so the next pass retries it.
    pub async fn expire_entries(
        &self,
        store: &dyn CacheStore,
        policy: &ExpirationPolicy,
        now_ms: u64,
    ) -> Vec<String> {
        let candidates = self.find_expired(store.name(), policy, now_ms).await;
        let mut deleted = Vec::with_capacity(candidates.len());
        for url in candidates {
            match store.delete(&url).await {
                Ok(_) => {
                    self.forget(store.name(), &url).await;
                    deleted.push(url);
                }
                Err(e) => warn!(cache = %store.name(), url = %url, error = %e, "Could not expire entry"),
            }
        }
        if !deleted.is_empty() {
            debug!(cache = %store.name(), count = deleted.len(), "Expired entries");
        }
        deleted
    }

    /// Drop the whole store and its bookkeeping after a quota failure.
    pub async fn purge_store(
        &self,
        storage: &dyn CacheStorage,
        cache_name: &str,
    ) -> Result<(), StoreError> {
        info!(cache = %cache_name, "Purging store after quota error");
        storage.delete(cache_name).await?;
        self.delete(cache_name).await;
        Ok(())
    }

    /// Forget all bookkeeping for a store. Returns whether any existed.
    pub async fn delete(&self, cache_name: &str) -> bool {
        self.timestamps.write().await.remove(cache_name).is_some()
    }

    /// Number of URLs tracked for a store.
    pub async fn tracked(&self, cache_name: &str) -> usize {
        self.timestamps
            .read()
            .await
            .get(cache_name)
            .map_or(0, |entries| entries.len())
    }
}

/// Newest first, ties broken by URL so the outcome is stable.
fn select_expired(
    entries: &HashMap<String, u64>,
    policy: &ExpirationPolicy,
    now_ms: u64,
) -> Vec<String> {
    let mut by_age: Vec<(&String, u64)> = entries.iter().map(|(u, t)| (u, *t)).collect();
    by_age.sort_by(|a, b| b.1.cmp(&a.1).then_with(|| a.0.cmp(b.0)));

    let mut expired = Vec::new();
    let mut kept = 0usize;
    for (url, used_at) in by_age {
        let too_old = policy
            .max_age
            .is_some_and(|age| now_ms.saturating_sub(used_at) > age.as_millis() as u64);
        let over_limit = policy.max_entries.is_some_and(|max| kept >= max);
        if too_old || over_limit {
            expired.push(url.clone());
        } else {
            kept += 1;
        }
    }
    expired
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{MemoryCache, MemoryCacheStorage, StoreLimits};
    use async_trait::async_trait;
    use revcache_net::FetchResponse;

    const DAY_MS: u64 = 24 * 60 * 60 * 1000;

    #[test]
    fn test_default_policy() {
        let policy = ExpirationPolicy::default();
        assert_eq!(policy.max_age, Some(Duration::from_secs(604_800)));
        assert_eq!(policy.max_entries, Some(100));
        assert!(policy.purge_on_quota_error);
    }

    #[tokio::test]
    async fn test_old_entries_expire() {
        let registry = ExpirationRegistry::new();
        let policy = ExpirationPolicy::default();
        registry.update_timestamp("img", "https://cdn.example.com/old.png", 0).await;
        registry
            .update_timestamp("img", "https://cdn.example.com/new.png", 7 * DAY_MS)
            .await;

        let expired = registry.take_expired("img", &policy, 8 * DAY_MS).await;
        assert_eq!(expired, vec!["https://cdn.example.com/old.png".to_string()]);
        assert_eq!(registry.tracked("img").await, 1);
    }

    #[tokio::test]
    async fn test_max_entries_drops_least_recent() {
        let registry = ExpirationRegistry::new();
        let policy = ExpirationPolicy {
            max_age: None,
            max_entries: Some(2),
            purge_on_quota_error: false,
        };
        for (i, url) in ["a", "b", "c"].iter().enumerate() {
            registry.update_timestamp("img", url, i as u64).await;
        }

        let expired = registry.take_expired("img", &policy, 10).await;
        assert_eq!(expired, vec!["a".to_string()]);
    }

    #[tokio::test]
    async fn test_expire_entries_deletes_from_store() {
        let storage = MemoryCacheStorage::with_limits(StoreLimits::default());
        let store = storage.open("img").await.unwrap();
        store.put("a", FetchResponse::empty()).await.unwrap();
        store.put("b", FetchResponse::empty()).await.unwrap();

        let registry = ExpirationRegistry::new();
        registry.update_timestamp("img", "a", 0).await;
        registry.update_timestamp("img", "b", 8 * DAY_MS).await;

        let expired = registry
            .expire_entries(store.as_ref(), &ExpirationPolicy::default(), 8 * DAY_MS)
            .await;
        assert_eq!(expired, vec!["a".to_string()]);
        assert!(!store.contains("a").await.unwrap());
        assert!(store.contains("b").await.unwrap());
    }

    /// Refuses to delete one key.
    struct LockedEntry {
        inner: MemoryCache,
        locked: &'static str,
    }

    #[async_trait]
    impl CacheStore for LockedEntry {
        fn name(&self) -> &str {
            self.inner.name()
        }

        async fn match_key(&self, key: &str) -> Result<Option<FetchResponse>, StoreError> {
            self.inner.match_key(key).await
        }

        async fn put(&self, key: &str, response: FetchResponse) -> Result<(), StoreError> {
            self.inner.put(key, response).await
        }

        async fn delete(&self, key: &str) -> Result<bool, StoreError> {
            if key == self.locked {
                return Err(StoreError::Other("locked".to_string()));
            }
            self.inner.delete(key).await
        }

        async fn keys(&self) -> Result<Vec<String>, StoreError> {
            self.inner.keys().await
        }
    }

    #[tokio::test]
    async fn test_failed_delete_stays_tracked() {
        let store = LockedEntry {
            inner: MemoryCache::new("img", StoreLimits::default()),
            locked: "a",
        };
        let registry = ExpirationRegistry::new();
        for url in ["a", "b", "c"] {
            store.put(url, FetchResponse::empty()).await.unwrap();
            registry.update_timestamp("img", url, 0).await;
        }
        let policy = ExpirationPolicy::default();

        let mut expired = registry.expire_entries(&store, &policy, 8 * DAY_MS).await;
        expired.sort();
        assert_eq!(expired, vec!["b".to_string(), "c".to_string()]);
        assert_eq!(store.keys().await.unwrap(), vec!["a".to_string()]);
        assert_eq!(registry.tracked("img").await, 1);

        // The next pass still sees the entry and retries it.
        assert_eq!(
            registry.find_expired("img", &policy, 8 * DAY_MS).await,
            vec!["a".to_string()]
        );
        assert!(registry.expire_entries(&store, &policy, 8 * DAY_MS).await.is_empty());
        assert_eq!(registry.tracked("img").await, 1);
    }

    #[tokio::test]
    async fn test_delete_clears_bookkeeping_only() {
        let storage = MemoryCacheStorage::new();
        storage.open("img").await.unwrap();
        let registry = ExpirationRegistry::new();
        registry.update_timestamp("img", "a", 0).await;

        assert!(registry.delete("img").await);
        assert_eq!(registry.tracked("img").await, 0);
        assert!(storage.has("img").await.unwrap());
        assert!(!registry.delete("img").await);
    }

    #[tokio::test]
    async fn test_purge_store() {
        let storage = MemoryCacheStorage::new();
        storage.open("img").await.unwrap();
        let registry = ExpirationRegistry::new();
        registry.update_timestamp("img", "a", 0).await;

        registry.purge_store(&storage, "img").await.unwrap();
        assert!(!storage.has("img").await.unwrap());
        assert_eq!(registry.tracked("img").await, 0);
    }

    #[test]
    fn test_policy_from_json() {
        let policy: ExpirationPolicy = serde_json::from_str(r#"{"max_age": 60}"#).unwrap();
        assert_eq!(policy.max_age, Some(Duration::from_secs(60)));
        assert_eq!(policy.max_entries, Some(100));
    }
}
