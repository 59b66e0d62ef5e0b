//! Full wipe: the last-resort recovery path.
//!
//! Deletes every store together with its expiration bookkeeping,
//! deregisters the worker and reloads every window client. Nothing is
//! recoverable afterwards. Any failure aborts the reset.

use std::sync::Arc;

use revcache_store::{CacheStorage, ExpirationRegistry};
use tracing::{info, warn};

use crate::clients::ClientNotifier;
use crate::error::SwResult;
use crate::registration::Registration;

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ResetReport {
    /// Stores deleted.
    pub deleted: Vec<String>,
    /// Clients asked to reload.
    pub reloaded: usize,
}

pub struct ResetCoordinator {
    storage: Arc<dyn CacheStorage>,
    expiration: Arc<ExpirationRegistry>,
    registration: Arc<Registration>,
    notifier: ClientNotifier,
}

impl ResetCoordinator {
    pub fn new(
        storage: Arc<dyn CacheStorage>,
        expiration: Arc<ExpirationRegistry>,
        registration: Arc<Registration>,
        notifier: ClientNotifier,
    ) -> Self {
        Self {
            storage,
            expiration,
            registration,
            notifier,
        }
    }

    pub async fn reset_all(&self) -> SwResult<ResetReport> {
        warn!(scope = %self.registration.scope, "Resetting all caches");

        let mut deleted = Vec::new();
        for name in self.storage.keys().await? {
            self.storage.delete(&name).await?;
            self.expiration.delete(&name).await;
            info!(cache = %name, "Deleted store");
            deleted.push(name);
        }

        if !self.registration.unregister() {
            warn!("Worker was already deregistered");
        }
        let reloaded = self.notifier.reload_all().await;
        info!(stores = deleted.len(), reloaded, "Reset complete");

        Ok(ResetReport { deleted, reloaded })
    }
}
