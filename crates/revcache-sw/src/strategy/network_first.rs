//! Network-first with expiration, used for images from other origins.

use std::sync::Arc;

use async_trait::async_trait;
use revcache_net::{FetchResponse, Fetcher};
use revcache_store::{CacheStorage, CacheStore, ExpirationPolicy, ExpirationRegistry, StoreError};
use tracing::{debug, warn};

use super::{match_or_miss, open_or_warn, FetchEvent, Strategy};
use crate::error::SwResult;

/// Prefer the network. Successful responses are stored and the store is
/// trimmed to the expiration policy; when the network fails the stored copy
/// is served instead and counts as a use.
pub struct NetworkFirst {
    storage: Arc<dyn CacheStorage>,
    fetcher: Arc<dyn Fetcher>,
    expiration: Arc<ExpirationRegistry>,
    policy: ExpirationPolicy,
    cache_name: String,
}

impl NetworkFirst {
    pub fn new(
        storage: Arc<dyn CacheStorage>,
        fetcher: Arc<dyn Fetcher>,
        expiration: Arc<ExpirationRegistry>,
        policy: ExpirationPolicy,
        cache_name: impl Into<String>,
    ) -> Self {
        Self {
            storage,
            fetcher,
            expiration,
            policy,
            cache_name: cache_name.into(),
        }
    }

    async fn store_response(&self, store: &dyn CacheStore, key: &str, response: FetchResponse) {
        match store.put(key, response).await {
            Ok(()) => {
                let now = revcache_common::unix_millis();
                self.expiration
                    .update_timestamp(&self.cache_name, key, now)
                    .await;
                self.expiration
                    .expire_entries(store, &self.policy, now)
                    .await;
            }
            Err(StoreError::QuotaExceeded(_)) if self.policy.purge_on_quota_error => {
                if let Err(e) = self
                    .expiration
                    .purge_store(self.storage.as_ref(), &self.cache_name)
                    .await
                {
                    warn!(cache = %self.cache_name, error = %e, "Quota purge failed");
                }
            }
            Err(e) => warn!(cache = %self.cache_name, key, error = %e, "Could not cache response"),
        }
    }
}

#[async_trait]
impl Strategy for NetworkFirst {
    fn cache_name(&self) -> Option<&str> {
        Some(&self.cache_name)
    }

    async fn handle(&self, event: &FetchEvent) -> SwResult<FetchResponse> {
        let key = event.url().as_str();
        let store = open_or_warn(self.storage.as_ref(), &self.cache_name).await;

        match self.fetcher.fetch(event.request.clone()).await {
            Ok(response) => {
                if response.status == 200 {
                    if let Some(store) = &store {
                        self.store_response(store.as_ref(), key, response.clone())
                            .await;
                    }
                }
                Ok(response)
            }
            Err(e) => {
                if let Some(store) = &store {
                    if let Some(hit) = match_or_miss(store.as_ref(), key).await {
                        debug!(url = %key, error = %e, "Network failed, serving cached copy");
                        self.expiration
                            .update_timestamp(&self.cache_name, key, revcache_common::unix_millis())
                            .await;
                        return Ok(hit);
                    }
                }
                Err(e.into())
            }
        }
    }
}
