//! Manifest index: absolute URL → revision, built once at startup.
//!
//! Two manifests feed the index. The precache manifest lists essential
//! assets as `{url, revision}` objects; the runtime manifest lists optional
//! assets as `[route, revision]` pairs whose routes are relative to the
//! deployment origin. A URL listed twice keeps its last entry.

use std::path::Path;

use hashbrown::{HashMap, HashSet};
use serde::{Deserialize, Serialize};
use tracing::{debug, info};
use url::Url;

use crate::cache_key::CacheKey;
use crate::error::{SwError, SwResult};

/// Which manifest an entry came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ManifestSource {
    Precache,
    Runtime,
}

/// An entry of the precache manifest as shipped.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PrecacheEntry {
    pub url: String,
    #[serde(default)]
    pub revision: Option<String>,
}

/// An entry of the runtime manifest as shipped: `[route, revision]`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RuntimeRoute(pub String, pub String);

/// One resolved manifest entry.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ManifestEntry {
    pub url: Url,
    pub revision: Option<String>,
    pub source: ManifestSource,
}

impl ManifestEntry {
    pub fn cache_key(&self) -> CacheKey {
        CacheKey::encode(&self.url, self.revision.as_deref())
    }
}

/// Immutable URL → revision index.
#[derive(Debug, Clone, Default)]
pub struct ManifestIndex {
    entries: Vec<ManifestEntry>,
    by_url: HashMap<String, usize>,
}

impl ManifestIndex {
    /// Build the index. Precache URLs are resolved against `origin` (absolute
    /// ones pass through); runtime routes are appended to the origin.
    pub fn build(
        origin: &Url,
        precache: &[PrecacheEntry],
        runtime: &[RuntimeRoute],
    ) -> SwResult<Self> {
        let mut index = Self::default();

        for entry in precache {
            let url = origin
                .join(&entry.url)
                .map_err(|e| SwError::invalid_url(&entry.url, e))?;
            index.insert(ManifestEntry {
                url,
                revision: entry.revision.clone(),
                source: ManifestSource::Precache,
            });
        }

        let base = origin.origin().ascii_serialization();
        for RuntimeRoute(route, revision) in runtime {
            let joined = format!("{}/{}", base, route.trim_start_matches('/'));
            let url = Url::parse(&joined).map_err(|e| SwError::invalid_url(&joined, e))?;
            index.insert(ManifestEntry {
                url,
                revision: Some(revision.clone()),
                source: ManifestSource::Runtime,
            });
        }

        debug!(
            precache = index.precache_entries().count(),
            runtime = index.runtime_entries().count(),
            "Manifest index built"
        );
        Ok(index)
    }

    /// Build the index from the JSON manifest files. A manifest with no
    /// path configured counts as empty; a configured file that cannot be
    /// read is an error.
    pub fn load(
        origin: &Url,
        precache_path: Option<&Path>,
        runtime_path: Option<&Path>,
    ) -> SwResult<Self> {
        let precache: Vec<PrecacheEntry> = match precache_path {
            Some(path) => read_json(path)?,
            None => Vec::new(),
        };
        let runtime: Vec<RuntimeRoute> = match runtime_path {
            Some(path) => read_json(path)?,
            None => Vec::new(),
        };
        info!(
            precache = precache.len(),
            runtime = runtime.len(),
            "Loaded manifests"
        );
        Self::build(origin, &precache, &runtime)
    }

    fn insert(&mut self, entry: ManifestEntry) {
        match self.by_url.get(entry.url.as_str()) {
            Some(&i) => self.entries[i] = entry,
            None => {
                self.by_url.insert(entry.url.as_str().to_string(), self.entries.len());
                self.entries.push(entry);
            }
        }
    }

    /// Look up an entry by absolute URL.
    pub fn get(&self, url: &str) -> Option<&ManifestEntry> {
        self.by_url.get(url).map(|&i| &self.entries[i])
    }

    /// Look up a runtime-manifest entry.
    pub fn runtime_entry(&self, url: &str) -> Option<&ManifestEntry> {
        self.get(url).filter(|e| e.source == ManifestSource::Runtime)
    }

    /// Whether the runtime manifest lists this URL.
    pub fn has_runtime(&self, url: &str) -> bool {
        self.runtime_entry(url).is_some()
    }

    pub fn runtime_entries(&self) -> impl Iterator<Item = &ManifestEntry> {
        self.entries
            .iter()
            .filter(|e| e.source == ManifestSource::Runtime)
    }

    pub fn precache_entries(&self) -> impl Iterator<Item = &ManifestEntry> {
        self.entries
            .iter()
            .filter(|e| e.source == ManifestSource::Precache)
    }

    /// Every key the runtime store may legitimately hold.
    pub fn runtime_keys(&self) -> Vec<CacheKey> {
        self.runtime_entries().map(ManifestEntry::cache_key).collect()
    }

    /// [`Self::runtime_keys`] as a set of plain strings.
    pub fn runtime_key_set(&self) -> HashSet<String> {
        self.runtime_entries()
            .map(|e| e.cache_key().into_string())
            .collect()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

fn read_json<T: serde::de::DeserializeOwned>(path: &Path) -> SwResult<T> {
    let text = std::fs::read_to_string(path).map_err(|source| SwError::Io {
        path: path.to_path_buf(),
        source,
    })?;
    serde_json::from_str(&text)
        .map_err(|e| SwError::Manifest(format!("{}: {}", path.display(), e)))
}
