//! # Revcache Worker
//!
//! Background worker that keeps a document viewer usable offline.
//!
//! ## Features
//!
//! - **Revisioned caching**: manifest-listed assets are cached under keys
//!   that embed their revision, so a hit is always current
//! - **Reconciliation**: stale revisions are reaped on activation
//! - **Prefetch**: clients can download a pattern-selected subset of the
//!   manifest in the background, with progress and cancellation
//! - **Routing**: precache, revisioned assets, fonts and images each have
//!   their own strategy and store
//! - **Reset**: wipe everything and deregister
//!
//! ## Architecture
//!
//! ```text
//! OfflineWorker
//!     ├── Registration (parsed → … → activated → redundant)
//!     ├── Router
//!     │       ├── precache        → PrecacheController
//!     │       ├── runtime manifest → RevisionCacheFirst
//!     │       ├── font            → CacheFirst
//!     │       ├── image           → NetworkFirst (+ expiration)
//!     │       └── default         → NetworkOnly
//!     ├── CacheReconciler (activate)
//!     ├── PrefetchPool (CACHE_ROUTES / CANCEL_CACHE_ROUTES)
//!     ├── ResetCoordinator (RESET)
//!     └── ClientNotifier → Clients
//! ```

pub mod cache_key;
pub mod clients;
pub mod config;
pub mod error;
pub mod manifest;
pub mod messages;
pub mod prefetch;
pub mod reconcile;
pub mod registration;
pub mod reset;
pub mod router;
pub mod strategy;
pub mod worker;

pub use cache_key::{strip_revision, CacheKey, REVISION_PARAM};
pub use clients::{Client, ClientEvent, ClientMatchOptions, ClientNotifier, ClientType, Clients};
pub use config::{CacheNames, WorkerConfig};
pub use error::{SwError, SwResult};
pub use manifest::{ManifestEntry, ManifestIndex, ManifestSource, PrecacheEntry, RuntimeRoute};
pub use messages::{
    FetchErrorCategory, InboundMessage, OutboundMessage, PrefetchFailure, ProgressState,
};
pub use prefetch::{AbortToken, PrefetchPool, PrefetchReport};
pub use reconcile::{CacheReconciler, ReconcileReport};
pub use registration::{Registration, WorkerState};
pub use reset::{ResetCoordinator, ResetReport};
pub use router::{Route, Router};
pub use strategy::{FetchEvent, Strategy};
pub use worker::{ActivationReport, Dispatch, OfflineWorker};
