//! Plain cache-first, used for fonts.

use std::sync::Arc;

use async_trait::async_trait;
use revcache_net::{FetchResponse, Fetcher};
use revcache_store::{CacheStorage, CacheStore};
use tracing::{trace, warn};

use super::{match_or_miss, open_or_warn, FetchEvent, Strategy};
use crate::error::SwResult;

/// Serve from the store; on a miss fetch and store `200` responses under
/// the request URL.
pub struct CacheFirst {
    storage: Arc<dyn CacheStorage>,
    fetcher: Arc<dyn Fetcher>,
    cache_name: String,
}

impl CacheFirst {
    pub fn new(
        storage: Arc<dyn CacheStorage>,
        fetcher: Arc<dyn Fetcher>,
        cache_name: impl Into<String>,
    ) -> Self {
        Self {
            storage,
            fetcher,
            cache_name: cache_name.into(),
        }
    }
}

#[async_trait]
impl Strategy for CacheFirst {
    fn cache_name(&self) -> Option<&str> {
        Some(&self.cache_name)
    }

    async fn handle(&self, event: &FetchEvent) -> SwResult<FetchResponse> {
        let key = event.url().as_str();
        let store = open_or_warn(self.storage.as_ref(), &self.cache_name).await;

        if let Some(store) = &store {
            if let Some(hit) = match_or_miss(store.as_ref(), key).await {
                trace!(cache = %self.cache_name, key, "Cache hit");
                return Ok(hit);
            }
        }

        let response = self.fetcher.fetch(event.request.clone()).await?;
        if response.status == 200 {
            if let Some(store) = store {
                if let Err(e) = store.put(key, response.clone()).await {
                    warn!(cache = %self.cache_name, key, error = %e, "Could not cache response");
                }
            }
        }
        Ok(response)
    }
}

#[cfg(test)]
mod tests {
    use revcache_net::{Request, RequestDestination};
    use revcache_store::MemoryCacheStorage;

    use super::*;
    use crate::strategy::testing::ScriptedFetcher;

    fn font_event() -> FetchEvent {
        FetchEvent::new(
            Request::parse("https://fonts.example.net/inter.woff2")
                .unwrap()
                .destination(RequestDestination::Font),
        )
    }

    #[tokio::test]
    async fn test_second_request_is_served_from_cache() {
        let fetcher = Arc::new(ScriptedFetcher::new());
        let strategy = CacheFirst::new(
            Arc::new(MemoryCacheStorage::new()),
            fetcher.clone(),
            "font-cache",
        );

        let first = strategy.handle(&font_event()).await.unwrap();
        let second = strategy.handle(&font_event()).await.unwrap();
        assert!(!first.from_cache);
        assert!(second.from_cache);
        assert_eq!(fetcher.calls(), 1);
    }

    #[tokio::test]
    async fn test_network_failure_is_an_error() {
        let fetcher = Arc::new(ScriptedFetcher::new());
        fetcher.go_offline("https://fonts.example.net/inter.woff2");
        let strategy = CacheFirst::new(Arc::new(MemoryCacheStorage::new()), fetcher, "font-cache");

        assert!(strategy.handle(&font_event()).await.is_err());
    }
}
