//! Request handling strategies.
//!
//! Each strategy answers one fetch event. Routing decides which one runs;
//! a strategy only ever sees requests its route matched.

use std::sync::Arc;

use async_trait::async_trait;
use revcache_net::{FetchResponse, Fetcher, Request, RequestDestination};
use revcache_store::{CacheStorage, CacheStore};
use tracing::warn;
use url::Url;

use crate::error::SwResult;

pub mod cache_first;
pub mod network_first;
pub mod precache;
pub mod revision;

pub use cache_first::CacheFirst;
pub use network_first::NetworkFirst;
pub use precache::PrecacheController;
pub use revision::RevisionCacheFirst;

/// A fetch event.
#[derive(Debug, Clone)]
pub struct FetchEvent {
    /// The intercepted request.
    pub request: Request,

    /// Client ID.
    pub client_id: Option<String>,
}

impl FetchEvent {
    pub fn new(request: Request) -> Self {
        Self {
            request,
            client_id: None,
        }
    }

    pub fn url(&self) -> &Url {
        &self.request.url
    }

    pub fn destination(&self) -> RequestDestination {
        self.request.destination
    }
}

/// Produces a response for a routed request.
#[async_trait]
pub trait Strategy: Send + Sync {
    /// Store the strategy reads and writes, if any.
    fn cache_name(&self) -> Option<&str> {
        None
    }

    async fn handle(&self, event: &FetchEvent) -> SwResult<FetchResponse>;
}

/// Straight to the network. Nothing is cached.
pub struct NetworkOnly {
    fetcher: Arc<dyn Fetcher>,
}

impl NetworkOnly {
    pub fn new(fetcher: Arc<dyn Fetcher>) -> Self {
        Self { fetcher }
    }
}

#[async_trait]
impl Strategy for NetworkOnly {
    async fn handle(&self, event: &FetchEvent) -> SwResult<FetchResponse> {
        Ok(self.fetcher.fetch(event.request.clone()).await?)
    }
}

/// Open a store, treating failure as "no store" so the request can still
/// go to the network.
pub(crate) async fn open_or_warn(
    storage: &dyn CacheStorage,
    name: &str,
) -> Option<Arc<dyn CacheStore>> {
    match storage.open(name).await {
        Ok(store) => Some(store),
        Err(e) => {
            warn!(cache = %name, error = %e, "Could not open store");
            None
        }
    }
}

/// Look up a key, treating a store error as a miss.
pub(crate) async fn match_or_miss(store: &dyn CacheStore, key: &str) -> Option<FetchResponse> {
    match store.match_key(key).await {
        Ok(hit) => hit,
        Err(e) => {
            warn!(cache = %store.name(), key, error = %e, "Cache lookup failed");
            None
        }
    }
}
