//! Precache: essential assets fetched at install and served cache-first.
//!
//! A request matches when any of its URL variations is listed in the
//! precache manifest. Variations are tried in order:
//!
//! 1. the URL without its fragment
//! 2. the same with `utm_*` and `fbclid` query parameters removed
//! 3. for paths ending in `/`, the directory index `index.html`
//! 4. otherwise, the clean URL with `.html` appended

use std::sync::Arc;

use async_trait::async_trait;
use futures::future::try_join_all;
use hashbrown::HashSet;
use revcache_net::{CredentialsMode, FetchResponse, Fetcher, Request};
use revcache_store::{CacheStorage, CacheStore};
use tracing::{debug, info, trace, warn};
use url::Url;

use super::{match_or_miss, open_or_warn, FetchEvent, Strategy};
use crate::cache_key::CacheKey;
use crate::error::{SwError, SwResult};
use crate::manifest::{ManifestEntry, ManifestIndex, ManifestSource};

const DIRECTORY_INDEX: &str = "index.html";

/// Outcome of [`PrecacheController::install`].
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct InstallReport {
    /// Keys fetched and stored by this install.
    pub updated: Vec<String>,
    /// Keys that were already present.
    pub not_updated: Vec<String>,
}

pub struct PrecacheController {
    manifest: Arc<ManifestIndex>,
    storage: Arc<dyn CacheStorage>,
    fetcher: Arc<dyn Fetcher>,
    cache_name: String,
}

impl PrecacheController {
    pub fn new(
        manifest: Arc<ManifestIndex>,
        storage: Arc<dyn CacheStorage>,
        fetcher: Arc<dyn Fetcher>,
        cache_name: impl Into<String>,
    ) -> Self {
        Self {
            manifest,
            storage,
            fetcher,
            cache_name: cache_name.into(),
        }
    }

    /// Cache key of the precached asset serving `url`, if any.
    pub fn key_for(&self, url: &Url) -> Option<CacheKey> {
        url_variations(url).into_iter().find_map(|candidate| {
            self.manifest
                .get(candidate.as_str())
                .filter(|e| e.source == ManifestSource::Precache)
                .map(|e| e.cache_key())
        })
    }

    fn expected_keys(&self) -> HashSet<String> {
        self.manifest
            .precache_entries()
            .map(|e| e.cache_key().into_string())
            .collect()
    }

    /// Fetch and store every precache entry not already stored. Any failed
    /// fetch or non-ok response fails the install.
    pub async fn install(&self) -> SwResult<InstallReport> {
        let store = self.storage.open(&self.cache_name).await?;

        let outcomes = try_join_all(
            self.manifest
                .precache_entries()
                .map(|entry| self.install_entry(store.as_ref(), entry)),
        )
        .await?;

        let mut report = InstallReport::default();
        for (key, fetched) in outcomes {
            if fetched {
                report.updated.push(key.into_string());
            } else {
                report.not_updated.push(key.into_string());
            }
        }
        info!(
            cache = %self.cache_name,
            updated = report.updated.len(),
            not_updated = report.not_updated.len(),
            "Precache installed"
        );
        Ok(report)
    }

    /// Returns the entry's key and whether it had to be fetched.
    async fn install_entry(
        &self,
        store: &dyn CacheStore,
        entry: &ManifestEntry,
    ) -> SwResult<(CacheKey, bool)> {
        let key = entry.cache_key();
        if store.contains(key.as_str()).await? {
            return Ok((key, false));
        }
        let request = Request::get(entry.url.clone()).credentials(CredentialsMode::SameOrigin);
        let response = self.fetcher.fetch(request).await?;
        if !response.ok() {
            return Err(SwError::BadPrecacheResponse {
                url: entry.url.to_string(),
                status: response.status,
            });
        }
        store.put(key.as_str(), response).await?;
        trace!(key = %key, "Precached");
        Ok((key, true))
    }

    /// Delete stored keys that the current precache manifest no longer
    /// lists. Returns the deleted keys.
    pub async fn cleanup(&self) -> SwResult<Vec<String>> {
        let store = self.storage.open(&self.cache_name).await?;
        let expected = self.expected_keys();

        let mut deleted = Vec::new();
        for key in store.keys().await? {
            if expected.contains(&key) {
                continue;
            }
            match store.delete(&key).await {
                Ok(_) => deleted.push(key),
                Err(e) => warn!(key = %key, error = %e, "Could not delete outdated precache entry"),
            }
        }
        if !deleted.is_empty() {
            info!(cache = %self.cache_name, count = deleted.len(), "Removed outdated precache entries");
        }
        Ok(deleted)
    }
}

#[async_trait]
impl Strategy for PrecacheController {
    fn cache_name(&self) -> Option<&str> {
        Some(&self.cache_name)
    }

    async fn handle(&self, event: &FetchEvent) -> SwResult<FetchResponse> {
        if let Some(key) = self.key_for(event.url()) {
            if let Some(store) = open_or_warn(self.storage.as_ref(), &self.cache_name).await {
                if let Some(hit) = match_or_miss(store.as_ref(), key.as_str()).await {
                    return Ok(hit);
                }
            }
            debug!(key = %key, "Precached entry missing, using network");
        }
        Ok(self.fetcher.fetch(event.request.clone()).await?)
    }
}

fn is_ignored_param(name: &str) -> bool {
    name.starts_with("utm_") || name == "fbclid"
}

/// Candidate manifest URLs for a request URL, most specific first.
pub fn url_variations(url: &Url) -> Vec<Url> {
    let mut base = url.clone();
    base.set_fragment(None);

    let mut variations = vec![base.clone()];

    let mut stripped = base.clone();
    let kept: Vec<(String, String)> = base
        .query_pairs()
        .filter(|(name, _)| !is_ignored_param(name))
        .map(|(name, value)| (name.into_owned(), value.into_owned()))
        .collect();
    if kept.is_empty() {
        stripped.set_query(None);
    } else {
        stripped.query_pairs_mut().clear().extend_pairs(kept);
    }
    if stripped != base {
        variations.push(stripped.clone());
    }

    if stripped.path().ends_with('/') {
        let mut index = stripped.clone();
        index.set_path(&format!("{}{}", stripped.path(), DIRECTORY_INDEX));
        variations.push(index);
    } else {
        let mut clean = stripped.clone();
        clean.set_path(&format!("{}.html", stripped.path()));
        variations.push(clean);
    }

    variations
}
