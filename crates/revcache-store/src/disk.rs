//! Cache storage persisted to a directory tree.
//!
//! Layout: one directory per store (name percent-encoded), one JSON file per
//! entry named by the xxh3 hash of its key. Each file carries its full key,
//! so a hash collision reads as a miss instead of returning the wrong entry.
//! Only `open` creates a store directory; a handle whose store was deleted
//! drops its writes.

use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use async_trait::async_trait;
use revcache_net::FetchResponse;
use tokio::fs;
use tracing::{debug, warn};
use xxhash_rust::xxh3::xxh3_64;

use crate::{CacheEntry, CacheStorage, CacheStore, StoreError, StoreLimits};

const ENTRY_EXT: &str = "json";

fn io_err(path: &Path, source: std::io::Error) -> StoreError {
    StoreError::Io {
        path: path.to_path_buf(),
        source,
    }
}

/// A store backed by one directory.
#[derive(Debug)]
pub struct DiskCache {
    name: String,
    dir: PathBuf,
    limits: StoreLimits,
}

impl DiskCache {
    fn entry_path(&self, key: &str) -> PathBuf {
        self.dir
            .join(format!("{:016x}.{}", xxh3_64(key.as_bytes()), ENTRY_EXT))
    }

    async fn read_entry(path: &Path) -> Result<Option<CacheEntry>, StoreError> {
        match fs::read(path).await {
            Ok(bytes) => serde_json::from_slice(&bytes)
                .map(Some)
                .map_err(|e| StoreError::Serialization(format!("{}: {}", path.display(), e))),
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(None),
            Err(e) => Err(io_err(path, e)),
        }
    }

    async fn entry_files(&self) -> Result<Vec<PathBuf>, StoreError> {
        let mut files = Vec::new();
        let mut dir = match fs::read_dir(&self.dir).await {
            Ok(dir) => dir,
            Err(e) if e.kind() == ErrorKind::NotFound => return Ok(files),
            Err(e) => return Err(io_err(&self.dir, e)),
        };
        while let Some(item) = dir.next_entry().await.map_err(|e| io_err(&self.dir, e))? {
            let path = item.path();
            if path.extension().is_some_and(|ext| ext == ENTRY_EXT) {
                files.push(path);
            }
        }
        Ok(files)
    }
}

#[async_trait]
impl CacheStore for DiskCache {
    fn name(&self) -> &str {
        &self.name
    }

    async fn match_key(&self, key: &str) -> Result<Option<FetchResponse>, StoreError> {
        let entry = Self::read_entry(&self.entry_path(key)).await?;
        Ok(entry
            .filter(|e| e.key == key)
            .map(|e| e.response.into_cached()))
    }

    async fn put(&self, key: &str, response: FetchResponse) -> Result<(), StoreError> {
        // A handle that outlived its store writes into nothing.
        if !fs::try_exists(&self.dir).await.map_err(|e| io_err(&self.dir, e))? {
            debug!(cache = %self.name, key, "Store was deleted; dropping write");
            return Ok(());
        }

        let path = self.entry_path(key);
        if let Some(max) = self.limits.max_entries {
            let exists = fs::try_exists(&path).await.map_err(|e| io_err(&path, e))?;
            if !exists && self.entry_files().await?.len() >= max {
                return Err(StoreError::QuotaExceeded(self.name.clone()));
            }
        }

        let bytes = serde_json::to_vec(&CacheEntry::new(key, response))
            .map_err(|e| StoreError::Serialization(e.to_string()))?;

        // Write-then-rename so a crash never leaves a torn entry behind.
        let tmp = path.with_extension("tmp");
        let written = match fs::write(&tmp, bytes).await {
            Ok(()) => fs::rename(&tmp, &path).await.map_err(|e| (path.as_path(), e)),
            Err(e) => Err((tmp.as_path(), e)),
        };
        match written {
            Ok(()) => Ok(()),
            Err((_, e)) if e.kind() == ErrorKind::NotFound => {
                debug!(cache = %self.name, key, "Store deleted during write; dropping it");
                Ok(())
            }
            Err((at, e)) => Err(io_err(at, e)),
        }
    }

    async fn delete(&self, key: &str) -> Result<bool, StoreError> {
        let path = self.entry_path(key);
        match Self::read_entry(&path).await? {
            Some(entry) if entry.key == key => {}
            _ => return Ok(false),
        }
        match fs::remove_file(&path).await {
            Ok(()) => Ok(true),
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(false),
            Err(e) => Err(io_err(&path, e)),
        }
    }

    async fn keys(&self) -> Result<Vec<String>, StoreError> {
        let files = self.entry_files().await?;
        if let Some(limit) = self.limits.max_listed_keys {
            if files.len() > limit {
                return Err(StoreError::EnumerationLimit {
                    count: files.len(),
                    limit,
                });
            }
        }

        let mut keys = Vec::with_capacity(files.len());
        for path in files {
            match Self::read_entry(&path).await {
                Ok(Some(entry)) => keys.push(entry.key),
                Ok(None) => {}
                Err(e) => warn!(cache = %self.name, error = %e, "Skipping unreadable entry"),
            }
        }
        Ok(keys)
    }

    async fn contains(&self, key: &str) -> Result<bool, StoreError> {
        Ok(Self::read_entry(&self.entry_path(key))
            .await?
            .is_some_and(|e| e.key == key))
    }
}

/// All named stores under one root directory.
#[derive(Debug, Clone)]
pub struct DiskCacheStorage {
    root: PathBuf,
    limits: StoreLimits,
}

impl DiskCacheStorage {
    /// Create storage rooted at `root`. The directory is created lazily.
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self {
            root: root.into(),
            limits: StoreLimits::default(),
        }
    }

    /// Apply limits to every store opened from here on.
    pub fn with_limits(mut self, limits: StoreLimits) -> Self {
        self.limits = limits;
        self
    }

    fn store_dir(&self, name: &str) -> PathBuf {
        self.root.join(urlencoding::encode(name).as_ref())
    }
}

#[async_trait]
impl CacheStorage for DiskCacheStorage {
    async fn open(&self, name: &str) -> Result<Arc<dyn CacheStore>, StoreError> {
        let dir = self.store_dir(name);
        fs::create_dir_all(&dir).await.map_err(|e| io_err(&dir, e))?;
        Ok(Arc::new(DiskCache {
            name: name.to_string(),
            dir,
            limits: self.limits,
        }))
    }

    async fn has(&self, name: &str) -> Result<bool, StoreError> {
        let dir = self.store_dir(name);
        fs::try_exists(&dir).await.map_err(|e| io_err(&dir, e))
    }

    async fn delete(&self, name: &str) -> Result<bool, StoreError> {
        let dir = self.store_dir(name);
        match fs::remove_dir_all(&dir).await {
            Ok(()) => {
                debug!(cache = %name, "Removed store directory");
                Ok(true)
            }
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(false),
            Err(e) => Err(io_err(&dir, e)),
        }
    }

    async fn keys(&self) -> Result<Vec<String>, StoreError> {
        let mut names = Vec::new();
        let mut dir = match fs::read_dir(&self.root).await {
            Ok(dir) => dir,
            Err(e) if e.kind() == ErrorKind::NotFound => return Ok(names),
            Err(e) => return Err(io_err(&self.root, e)),
        };
        while let Some(item) = dir.next_entry().await.map_err(|e| io_err(&self.root, e))? {
            let is_dir = item
                .file_type()
                .await
                .map_err(|e| io_err(&item.path(), e))?
                .is_dir();
            if !is_dir {
                continue;
            }
            let raw = item.file_name().to_string_lossy().into_owned();
            match urlencoding::decode(&raw) {
                Ok(name) => names.push(name.into_owned()),
                Err(_) => warn!(dir = %raw, "Ignoring store directory with undecodable name"),
            }
        }
        Ok(names)
    }
}
