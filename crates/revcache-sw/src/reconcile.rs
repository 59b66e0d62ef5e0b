//! Activation-time garbage collection.
//!
//! The runtime store only ever holds keys bound to a revision. When a
//! revision changes, or a URL leaves the manifest, the old key becomes
//! unreachable; reconciliation deletes every stored key the current
//! manifest does not produce. Deletions run concurrently and a failed one
//! is logged and skipped, so a pass may finish partially.

use std::sync::Arc;

use futures::future::join_all;
use hashbrown::HashSet;
use regex::Regex;
use revcache_store::{CacheStorage, CacheStore};
use tracing::{debug, info, warn};

use crate::error::SwResult;
use crate::manifest::ManifestIndex;

/// Outcome of one reconciliation pass.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ReconcileReport {
    /// Keys found in the store.
    pub examined: usize,
    /// Stale keys deleted.
    pub deleted: Vec<String>,
    /// Stale keys whose deletion failed.
    pub failed: Vec<String>,
}

pub struct CacheReconciler {
    manifest: Arc<ManifestIndex>,
    storage: Arc<dyn CacheStorage>,
    cache_name: String,
}

impl CacheReconciler {
    pub fn new(
        manifest: Arc<ManifestIndex>,
        storage: Arc<dyn CacheStorage>,
        cache_name: impl Into<String>,
    ) -> Self {
        Self {
            manifest,
            storage,
            cache_name: cache_name.into(),
        }
    }

    /// Delete every runtime-store key that is not a valid manifest key.
    pub async fn reconcile(&self) -> SwResult<ReconcileReport> {
        let store = self.storage.open(&self.cache_name).await?;
        reconcile_store(store.as_ref(), &self.manifest.runtime_key_set()).await
    }
}

/// Delete from `store` every key not in `valid`.
pub async fn reconcile_store(
    store: &dyn CacheStore,
    valid: &HashSet<String>,
) -> SwResult<ReconcileReport> {
    let present = store.keys().await?;
    let examined = present.len();
    let stale: Vec<String> = present
        .into_iter()
        .filter(|key| !valid.contains(key))
        .collect();

    let results = join_all(stale.iter().map(|key| store.delete(key))).await;

    let mut report = ReconcileReport {
        examined,
        ..Default::default()
    };
    for (key, result) in stale.into_iter().zip(results) {
        match result {
            Ok(_) => {
                info!(cache = %store.name(), key = %key, "Deleted stale entry");
                report.deleted.push(key);
            }
            Err(e) => {
                warn!(cache = %store.name(), key = %key, error = %e, "Could not delete stale entry");
                report.failed.push(key);
            }
        }
    }
    debug!(
        cache = %store.name(),
        examined = report.examined,
        deleted = report.deleted.len(),
        failed = report.failed.len(),
        "Reconciled"
    );
    Ok(report)
}

/// Delete every store whose name matches the legacy pattern. Returns the
/// names deleted.
pub async fn purge_legacy(storage: &dyn CacheStorage, pattern: &Regex) -> SwResult<Vec<String>> {
    let mut purged = Vec::new();
    for name in storage.keys().await? {
        if !pattern.is_match(&name) {
            continue;
        }
        match storage.delete(&name).await {
            Ok(_) => {
                info!(cache = %name, "Purged legacy store");
                purged.push(name);
            }
            Err(e) => warn!(cache = %name, error = %e, "Could not purge legacy store"),
        }
    }
    Ok(purged)
}
