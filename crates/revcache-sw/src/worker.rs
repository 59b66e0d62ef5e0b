//! The offline worker: lifecycle, request routing and message dispatch.

use std::sync::Arc;

use revcache_net::{FetchResponse, Fetcher, RequestDestination};
use revcache_store::{CacheStorage, ExpirationRegistry};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::clients::{ClientNotifier, Clients};
use crate::config::WorkerConfig;
use crate::error::SwResult;
use crate::manifest::ManifestIndex;
use crate::messages::InboundMessage;
use crate::prefetch::{PrefetchPool, PrefetchReport};
use crate::reconcile::{purge_legacy, CacheReconciler, ReconcileReport};
use crate::registration::{Registration, WorkerState};
use crate::reset::{ResetCoordinator, ResetReport};
use crate::router::{Route, Router};
use crate::strategy::precache::InstallReport;
use crate::strategy::{
    CacheFirst, FetchEvent, NetworkFirst, NetworkOnly, PrecacheController, RevisionCacheFirst,
};

/// What handling an inbound message started or did.
#[derive(Debug)]
pub enum Dispatch {
    /// A prefetch run is executing in the background.
    Prefetch(JoinHandle<PrefetchReport>),
    /// Cancellation was requested; `true` if a run was tracked.
    Cancelled(bool),
    /// The reset finished.
    Reset(ResetReport),
    /// The worker is redundant and no longer handles messages.
    Ignored,
}

/// Outcome of activation. Each step runs independently; a failed step is
/// logged and left as `None`.
#[derive(Debug, Clone, Default)]
pub struct ActivationReport {
    pub reconcile: Option<ReconcileReport>,
    pub precache_removed: Option<Vec<String>>,
    pub legacy_purged: Option<Vec<String>>,
}

pub struct OfflineWorker {
    config: WorkerConfig,
    manifest: Arc<ManifestIndex>,
    storage: Arc<dyn CacheStorage>,
    registration: Arc<Registration>,
    clients: Arc<Clients>,
    router: Router,
    precache: Arc<PrecacheController>,
    reconciler: CacheReconciler,
    prefetch: Arc<PrefetchPool>,
    reset: ResetCoordinator,
}

impl OfflineWorker {
    /// Wire a worker. Routes are registered in priority order: precache,
    /// revisioned runtime assets, fonts, images, then the network.
    pub fn new(
        config: WorkerConfig,
        manifest: ManifestIndex,
        storage: Arc<dyn CacheStorage>,
        fetcher: Arc<dyn Fetcher>,
    ) -> SwResult<Self> {
        config.validate()?;

        let manifest = Arc::new(manifest);
        let expiration = Arc::new(ExpirationRegistry::new());
        let registration = Arc::new(Registration::new(config.origin.clone()));
        let clients = Arc::new(Clients::new());
        let notifier = ClientNotifier::new(Arc::clone(&clients));
        let names = &config.caches;

        let precache = Arc::new(PrecacheController::new(
            Arc::clone(&manifest),
            Arc::clone(&storage),
            Arc::clone(&fetcher),
            config.precache_name(),
        ));
        let revision = Arc::new(RevisionCacheFirst::new(
            Arc::clone(&manifest),
            Arc::clone(&storage),
            Arc::clone(&fetcher),
            notifier.clone(),
            names.runtime.clone(),
        ));

        let mut router = Router::new();
        let precache_match = Arc::clone(&precache);
        router.register(Route::new(
            "precache",
            move |e: &FetchEvent| precache_match.key_for(e.url()).is_some(),
            precache.clone(),
        ));
        let revision_match = Arc::clone(&revision);
        router.register(Route::new(
            "revision",
            move |e: &FetchEvent| revision_match.applies_to(e.url().as_str()),
            revision,
        ));
        router.register(Route::for_destination(
            "fonts",
            RequestDestination::Font,
            Arc::new(CacheFirst::new(
                Arc::clone(&storage),
                Arc::clone(&fetcher),
                names.fonts.clone(),
            )),
        ));
        router.register(Route::for_destination(
            "images",
            RequestDestination::Image,
            Arc::new(NetworkFirst::new(
                Arc::clone(&storage),
                Arc::clone(&fetcher),
                Arc::clone(&expiration),
                config.image_expiration.clone(),
                names.external_images.clone(),
            )),
        ));
        router.set_default_handler(Arc::new(NetworkOnly::new(Arc::clone(&fetcher))));

        let reconciler = CacheReconciler::new(
            Arc::clone(&manifest),
            Arc::clone(&storage),
            names.runtime.clone(),
        );
        let prefetch = Arc::new(
            PrefetchPool::new(
                Arc::clone(&manifest),
                Arc::clone(&storage),
                fetcher,
                notifier.clone(),
                names.runtime.clone(),
            )
            .with_concurrency(config.prefetch_concurrency),
        );
        let reset = ResetCoordinator::new(
            Arc::clone(&storage),
            expiration,
            Arc::clone(&registration),
            notifier,
        );

        Ok(Self {
            config,
            manifest,
            storage,
            registration,
            clients,
            router,
            precache,
            reconciler,
            prefetch,
            reset,
        })
    }

    pub fn config(&self) -> &WorkerConfig {
        &self.config
    }

    pub fn manifest(&self) -> &Arc<ManifestIndex> {
        &self.manifest
    }

    pub fn registration(&self) -> &Arc<Registration> {
        &self.registration
    }

    pub fn clients(&self) -> &Arc<Clients> {
        &self.clients
    }

    pub fn router(&self) -> &Router {
        &self.router
    }

    pub fn prefetch_pool(&self) -> &Arc<PrefetchPool> {
        &self.prefetch
    }

    /// Precache essential assets. A failed install leaves the worker
    /// redundant. On success the worker does not wait for older versions.
    pub async fn install(&self) -> SwResult<InstallReport> {
        self.registration.transition(WorkerState::Installing)?;
        match self.precache.install().await {
            Ok(report) => {
                self.registration.transition(WorkerState::Installed)?;
                info!(scope = %self.registration.scope, "Installed; skipping wait");
                Ok(report)
            }
            Err(e) => {
                warn!(error = %e, "Install failed");
                self.registration.unregister();
                Err(e)
            }
        }
    }

    /// Reconcile the runtime store, drop outdated precache entries and
    /// purge legacy stores, all concurrently.
    pub async fn activate(&self) -> SwResult<ActivationReport> {
        self.registration.transition(WorkerState::Activating)?;
        let legacy = self.config.legacy_pattern()?;

        let (reconcile, precache, purged) = futures::join!(
            self.reconciler.reconcile(),
            self.precache.cleanup(),
            purge_legacy(self.storage.as_ref(), &legacy),
        );

        let report = ActivationReport {
            reconcile: log_step("reconcile", reconcile),
            precache_removed: log_step("precache cleanup", precache),
            legacy_purged: log_step("legacy purge", purged),
        };
        self.registration.transition(WorkerState::Activated)?;
        info!(scope = %self.registration.scope, "Activated");
        Ok(report)
    }

    /// Answer a request. Never fails; unroutable or failed requests get a
    /// network-error response.
    pub async fn handle_fetch(&self, event: FetchEvent) -> FetchResponse {
        self.router.handle(&event).await
    }

    pub async fn handle_message(&self, message: InboundMessage) -> SwResult<Dispatch> {
        if self.registration.is_redundant() {
            debug!(?message, "Worker is redundant; ignoring message");
            return Ok(Dispatch::Ignored);
        }
        match message {
            InboundMessage::CacheRoutes { route_regex } => {
                let handle = self.prefetch.start(&route_regex).await?;
                Ok(Dispatch::Prefetch(handle))
            }
            InboundMessage::CancelCacheRoutes => Ok(Dispatch::Cancelled(self.prefetch.cancel().await)),
            InboundMessage::Reset => Ok(Dispatch::Reset(self.reset.reset_all().await?)),
        }
    }

    /// Parse and handle a JSON message.
    pub async fn handle_message_json(&self, text: &str) -> SwResult<Dispatch> {
        let message = InboundMessage::from_json(text)?;
        self.handle_message(message).await
    }
}

fn log_step<T>(step: &str, result: SwResult<T>) -> Option<T> {
    match result {
        Ok(value) => Some(value),
        Err(e) => {
            warn!(step, error = %e, "Activation step failed");
            None
        }
    }
}
