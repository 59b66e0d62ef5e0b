//! Cache-first strategy for manifest-listed runtime assets.
//!
//! The cache key carries the revision, so a hit is always current and is
//! returned without revalidation. A miss goes to the network with
//! same-origin credentials and the response is written back in a detached
//! task. A failed fetch never surfaces as an error: every window client is
//! told what kind of resource failed and the caller gets an empty response.

use std::sync::Arc;

use async_trait::async_trait;
use revcache_net::{CredentialsMode, FetchResponse, Fetcher};
use revcache_store::{CacheStorage, CacheStore};
use tracing::{debug, trace, warn};

use super::{match_or_miss, open_or_warn, FetchEvent, Strategy};
use crate::cache_key::CacheKey;
use crate::clients::ClientNotifier;
use crate::error::SwResult;
use crate::manifest::ManifestIndex;
use crate::messages::{FetchErrorCategory, OutboundMessage};

pub struct RevisionCacheFirst {
    manifest: Arc<ManifestIndex>,
    storage: Arc<dyn CacheStorage>,
    fetcher: Arc<dyn Fetcher>,
    notifier: ClientNotifier,
    cache_name: String,
}

impl RevisionCacheFirst {
    pub fn new(
        manifest: Arc<ManifestIndex>,
        storage: Arc<dyn CacheStorage>,
        fetcher: Arc<dyn Fetcher>,
        notifier: ClientNotifier,
        cache_name: impl Into<String>,
    ) -> Self {
        Self {
            manifest,
            storage,
            fetcher,
            notifier,
            cache_name: cache_name.into(),
        }
    }

    /// Whether a URL is routed here.
    pub fn applies_to(&self, url: &str) -> bool {
        self.manifest.has_runtime(url)
    }

    fn key_for(&self, event: &FetchEvent) -> CacheKey {
        let revision = self
            .manifest
            .runtime_entry(event.url().as_str())
            .and_then(|entry| entry.revision.as_deref());
        CacheKey::encode(event.url(), revision)
    }

    /// Write back without holding up the response. Only complete `200`
    /// responses are stored.
    fn spawn_write_back(&self, key: CacheKey, response: &FetchResponse) {
        if response.status != 200 {
            trace!(key = %key, status = response.status, "Not caching response");
            return;
        }
        let storage = Arc::clone(&self.storage);
        let cache_name = self.cache_name.clone();
        let response = response.clone();
        tokio::spawn(async move {
            let Some(store) = open_or_warn(storage.as_ref(), &cache_name).await else {
                return;
            };
            match store.put(key.as_str(), response).await {
                Ok(()) => trace!(key = %key, "Stored"),
                Err(e) => warn!(key = %key, error = %e, "Write-back failed"),
            }
        });
    }
}

#[async_trait]
impl Strategy for RevisionCacheFirst {
    fn cache_name(&self) -> Option<&str> {
        Some(&self.cache_name)
    }

    async fn handle(&self, event: &FetchEvent) -> SwResult<FetchResponse> {
        let key = self.key_for(event);

        if let Some(store) = open_or_warn(self.storage.as_ref(), &self.cache_name).await {
            if let Some(hit) = match_or_miss(store.as_ref(), key.as_str()).await {
                trace!(key = %key, "Cache hit");
                return Ok(hit.into_cached());
            }
        }

        let request = event
            .request
            .clone()
            .credentials(CredentialsMode::SameOrigin);
        match self.fetcher.fetch(request).await {
            Ok(response) => {
                self.spawn_write_back(key, &response);
                Ok(response)
            }
            Err(e) => {
                let category = FetchErrorCategory::classify(event.url());
                debug!(url = %event.url(), ?category, error = %e, "Fetch failed");
                self.notifier
                    .broadcast(OutboundMessage::FetchError(category))
                    .await;
                Ok(FetchResponse::empty())
            }
        }
    }
}
