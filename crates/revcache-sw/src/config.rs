//! Worker configuration

use std::path::{Path, PathBuf};

use regex::Regex;
use revcache_net::LoaderConfig;
use revcache_store::ExpirationPolicy;
use serde::{Deserialize, Serialize};
use url::Url;

use crate::error::{SwError, SwResult};

const DEFAULT_PREFETCH_CONCURRENCY: usize = 5;
const DEFAULT_LEGACY_PATTERN: &str = r"\d+\.\d+\.\d+";

/// Worker configuration. Only `origin` is required in a config file.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkerConfig {
    /// Origin the worker is deployed at; runtime routes are relative to it
    pub origin: Url,

    /// Names of the cache stores
    #[serde(default)]
    pub caches: CacheNames,

    /// Number of concurrent prefetch workers
    #[serde(default = "default_prefetch_concurrency")]
    pub prefetch_concurrency: usize,

    /// Stores whose name matches this are legacy and purged on activation
    #[serde(default = "default_legacy_pattern")]
    pub legacy_cache_pattern: String,

    /// Expiration for the external image store
    #[serde(default)]
    pub image_expiration: ExpirationPolicy,

    /// Network loader settings
    #[serde(default)]
    pub loader: LoaderConfig,

    /// Precache manifest file
    #[serde(default)]
    pub precache_manifest: Option<PathBuf>,

    /// Runtime manifest file
    #[serde(default)]
    pub runtime_manifest: Option<PathBuf>,

    /// Directory for persistent stores; in-memory stores when unset
    #[serde(default)]
    pub cache_dir: Option<PathBuf>,
}

fn default_prefetch_concurrency() -> usize {
    DEFAULT_PREFETCH_CONCURRENCY
}

fn default_legacy_pattern() -> String {
    DEFAULT_LEGACY_PATTERN.to_string()
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct CacheNames {
    /// Revisioned runtime assets
    pub runtime: String,

    /// Fonts
    pub fonts: String,

    /// Images from other origins
    pub external_images: String,

    /// Prefix of the precache store; the origin is appended
    pub precache_prefix: String,
}

impl Default for CacheNames {
    fn default() -> Self {
        Self {
            runtime: "runtime-revision".to_string(),
            fonts: "font-cache".to_string(),
            external_images: "external-image-cache".to_string(),
            precache_prefix: "precache-v2".to_string(),
        }
    }
}

impl WorkerConfig {
    /// Defaults for everything but the origin.
    pub fn new(origin: Url) -> Self {
        Self {
            origin,
            caches: CacheNames::default(),
            prefetch_concurrency: DEFAULT_PREFETCH_CONCURRENCY,
            legacy_cache_pattern: default_legacy_pattern(),
            image_expiration: ExpirationPolicy::default(),
            loader: LoaderConfig::default(),
            precache_manifest: None,
            runtime_manifest: None,
            cache_dir: None,
        }
    }

    /// Load from a JSON file; fields other than `origin` take their
    /// defaults when missing.
    pub fn load(path: &Path) -> SwResult<Self> {
        let text = std::fs::read_to_string(path).map_err(|source| SwError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        let mut config: Self = serde_json::from_str(&text)
            .map_err(|e| SwError::Config(format!("{}: {}", path.display(), e)))?;

        // Relative manifest and cache paths are relative to the config file.
        if let Some(dir) = path.parent() {
            for p in [
                &mut config.precache_manifest,
                &mut config.runtime_manifest,
                &mut config.cache_dir,
            ]
            .into_iter()
            .flatten()
            {
                if p.is_relative() {
                    *p = dir.join(&*p);
                }
            }
        }

        config.validate()?;
        Ok(config)
    }

    /// Reject settings the worker cannot run with.
    pub fn validate(&self) -> SwResult<()> {
        if self.prefetch_concurrency == 0 {
            return Err(SwError::Config(
                "prefetch_concurrency must be at least 1".to_string(),
            ));
        }
        self.legacy_pattern()?;
        Ok(())
    }

    pub fn legacy_pattern(&self) -> SwResult<Regex> {
        Ok(Regex::new(&self.legacy_cache_pattern)?)
    }

    /// Name of the precache store, scoped to the origin.
    pub fn precache_name(&self) -> String {
        format!("{}-{}", self.caches.precache_prefix, self.origin)
    }

    /// Loader settings with the origin filled in when unset.
    pub fn loader_config(&self) -> LoaderConfig {
        let mut loader = self.loader.clone();
        if loader.origin.is_none() {
            loader.origin = Some(self.origin.clone());
        }
        loader
    }
}
