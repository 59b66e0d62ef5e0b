//! Bulk prefetch of manifest assets on request.
//!
//! A run selects the runtime-manifest keys matching a pattern that are not
//! stored yet and downloads them with a fixed number of workers sharing one
//! queue. Every completed item bumps a shared counter and broadcasts the new
//! progress; the counter, the queue and the broadcast sit behind one lock so
//! observers see strictly increasing values.
//!
//! A worker whose item fails stops; the others keep draining the queue. The
//! failures of a run are reported together once every worker has stopped.
//!
//! Cancellation is cooperative: workers check the abort token before taking
//! the next item, so fetches already under way finish and are stored.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use futures::future::join_all;
use hashbrown::HashSet;
use regex::Regex;
use revcache_net::{CredentialsMode, Fetcher, Request};
use revcache_store::{CacheStorage, CacheStore};
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tracing::{debug, info, trace, warn};

use crate::cache_key::CacheKey;
use crate::clients::ClientNotifier;
use crate::error::SwResult;
use crate::manifest::ManifestIndex;
use crate::messages::{OutboundMessage, PrefetchFailure, ProgressState};

/// Number of concurrent prefetch workers.
pub const DEFAULT_CONCURRENCY: usize = 5;

/// Cancellation flag for one prefetch run.
#[derive(Debug, Clone, Default)]
pub struct AbortToken(Arc<AtomicBool>);

impl AbortToken {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn abort(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    pub fn is_aborted(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }

    /// Whether both tokens belong to the same run.
    pub fn same_run(&self, other: &AbortToken) -> bool {
        Arc::ptr_eq(&self.0, &other.0)
    }
}

/// Outcome of one prefetch run.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PrefetchReport {
    pub total: usize,
    pub fetched: usize,
    pub failures: Vec<PrefetchFailure>,
    pub cancelled: bool,
}

/// State shared by the workers of one run.
struct WorkQueue {
    remaining: Vec<CacheKey>,
    fetched: usize,
    total: usize,
}

pub struct PrefetchPool {
    manifest: Arc<ManifestIndex>,
    storage: Arc<dyn CacheStorage>,
    fetcher: Arc<dyn Fetcher>,
    notifier: ClientNotifier,
    cache_name: String,
    concurrency: usize,
    current: Mutex<Option<AbortToken>>,
}

impl PrefetchPool {
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
            concurrency: DEFAULT_CONCURRENCY,
            current: Mutex::new(None),
        }
    }

    pub fn with_concurrency(mut self, concurrency: usize) -> Self {
        self.concurrency = concurrency.max(1);
        self
    }

    /// Track a new run. The previously tracked token, if any, is replaced
    /// without being aborted, so an earlier run keeps going untracked.
    pub async fn begin(&self) -> AbortToken {
        let token = AbortToken::new();
        if let Some(previous) = self.current.lock().await.replace(token.clone()) {
            if !previous.is_aborted() {
                debug!("Replacing tracked prefetch without cancelling it");
            }
        }
        token
    }

    /// Abort the tracked run and clear the slot. Returns whether a run was
    /// tracked.
    pub async fn cancel(&self) -> bool {
        match self.current.lock().await.take() {
            Some(token) => {
                token.abort();
                info!("Prefetch cancelled");
                true
            }
            None => false,
        }
    }

    /// The tracked run's token.
    pub async fn current(&self) -> Option<AbortToken> {
        self.current.lock().await.clone()
    }

    /// Clear the slot if it still tracks `token`.
    async fn finish(&self, token: &AbortToken) {
        let mut current = self.current.lock().await;
        if current.as_ref().is_some_and(|t| t.same_run(token)) {
            *current = None;
        }
    }

    /// Compile the pattern, track a new run and execute it in a background
    /// task. An invalid pattern is reported to clients and returned.
    pub async fn start(self: &Arc<Self>, route_regex: &str) -> SwResult<JoinHandle<PrefetchReport>> {
        let pattern = match Regex::new(route_regex) {
            Ok(pattern) => pattern,
            Err(e) => {
                warn!(pattern = route_regex, error = %e, "Invalid prefetch pattern");
                self.notifier
                    .broadcast(OutboundMessage::CacheRoutesError {
                        errors: vec![PrefetchFailure::new("", &e)],
                    })
                    .await;
                return Err(e.into());
            }
        };

        let token = self.begin().await;
        let pool = Arc::clone(self);
        Ok(tokio::spawn(async move {
            let report = match pool.run(&pattern, &token).await {
                Ok(report) => report,
                Err(e) => {
                    warn!(error = %e, "Prefetch aborted before any work");
                    let failure = PrefetchFailure::new("", &e);
                    pool.notifier
                        .broadcast(OutboundMessage::CacheRoutesError {
                            errors: vec![failure.clone()],
                        })
                        .await;
                    PrefetchReport {
                        failures: vec![failure],
                        cancelled: token.is_aborted(),
                        ..Default::default()
                    }
                }
            };
            pool.finish(&token).await;
            report
        }))
    }

    /// Execute one run to completion.
    pub async fn run(&self, pattern: &Regex, token: &AbortToken) -> SwResult<PrefetchReport> {
        let store = self.storage.open(&self.cache_name).await?;

        let snapshot: Option<HashSet<String>> = match store.keys().await {
            Ok(keys) => Some(keys.into_iter().collect()),
            Err(e) if e.is_enumeration_limit() => {
                warn!(cache = %self.cache_name, error = %e, "Falling back to per-key checks");
                None
            }
            Err(e) => return Err(e.into()),
        };

        let work: Vec<CacheKey> = self
            .manifest
            .runtime_entries()
            .filter(|entry| {
                let key = entry.cache_key();
                pattern.is_match(key.as_str()) || pattern.is_match(entry.url.as_str())
            })
            .map(|entry| entry.cache_key())
            .filter(|key| {
                snapshot
                    .as_ref()
                    .map_or(true, |present| !present.contains(key.as_str()))
            })
            .collect();
        let total = work.len();
        info!(
            total,
            fallback = snapshot.is_none(),
            pattern = %pattern,
            "Prefetch starting"
        );

        self.notifier
            .broadcast(OutboundMessage::CacheRoutesProgress(ProgressState {
                fetched: 0,
                total,
            }))
            .await;
        if total == 0 {
            return Ok(PrefetchReport::default());
        }

        let queue = Mutex::new(WorkQueue {
            remaining: work,
            fetched: 0,
            total,
        });
        let fallback = snapshot.is_none();
        let workers = (0..self.concurrency)
            .map(|id| self.worker(id, &queue, store.as_ref(), token, fallback));
        let failures: Vec<PrefetchFailure> = join_all(workers)
            .await
            .into_iter()
            .filter_map(Result::err)
            .collect();

        if !failures.is_empty() {
            warn!(count = failures.len(), "Prefetch finished with failures");
            self.notifier
                .broadcast(OutboundMessage::CacheRoutesError {
                    errors: failures.clone(),
                })
                .await;
        }

        let fetched = queue.lock().await.fetched;
        let report = PrefetchReport {
            total,
            fetched,
            failures,
            cancelled: token.is_aborted(),
        };
        info!(
            fetched = report.fetched,
            total = report.total,
            cancelled = report.cancelled,
            "Prefetch finished"
        );
        Ok(report)
    }

    /// One worker: take items until the queue is empty or the run is
    /// aborted. The first failed item ends the worker.
    async fn worker(
        &self,
        id: usize,
        queue: &Mutex<WorkQueue>,
        store: &dyn CacheStore,
        token: &AbortToken,
        fallback: bool,
    ) -> Result<(), PrefetchFailure> {
        loop {
            let key = {
                let mut queue = queue.lock().await;
                if token.is_aborted() {
                    trace!(worker = id, "Stopping on abort");
                    return Ok(());
                }
                match queue.remaining.pop() {
                    Some(key) => key,
                    None => return Ok(()),
                }
            };

            let fail = |reason: &dyn std::fmt::Display| {
                debug!(worker = id, key = %key, error = %reason, "Prefetch item failed");
                PrefetchFailure::new(key.as_str(), reason)
            };

            let url = key.fetch_url().map_err(|e| fail(&e))?;

            if fallback && store.contains(key.as_str()).await.map_err(|e| fail(&e))? {
                trace!(worker = id, key = %key, "Already cached");
                self.advance(queue).await;
                continue;
            }

            let request = Request::get(url).credentials(CredentialsMode::SameOrigin);
            let response = self.fetcher.fetch(request).await.map_err(|e| fail(&e))?;
            store
                .put(key.as_str(), response)
                .await
                .map_err(|e| fail(&e))?;
            self.advance(queue).await;
        }
    }

    /// Count one finished item and report it.
    async fn advance(&self, queue: &Mutex<WorkQueue>) {
        let mut queue = queue.lock().await;
        queue.fetched += 1;
        let progress = ProgressState {
            fetched: queue.fetched,
            total: queue.total,
        };
        self.notifier
            .broadcast(OutboundMessage::CacheRoutesProgress(progress))
            .await;
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use revcache_net::FetchResponse;
    use revcache_store::{MemoryCacheStorage, StoreLimits};
    use tokio::sync::mpsc::UnboundedReceiver;
    use url::Url;

    use super::*;
    use crate::clients::{ClientEvent, ClientType, Clients};
    use crate::error::SwError;
    use crate::manifest::RuntimeRoute;
    use crate::strategy::testing::ScriptedFetcher;

    const ORIGIN: &str = "https://example.com/";

    struct Fixture {
        pool: Arc<PrefetchPool>,
        fetcher: Arc<ScriptedFetcher>,
        storage: Arc<MemoryCacheStorage>,
        events: UnboundedReceiver<ClientEvent>,
    }

    async fn fixture(routes: &[&str], fetcher: ScriptedFetcher, storage: MemoryCacheStorage) -> Fixture {
        let routes: Vec<RuntimeRoute> = routes
            .iter()
            .map(|r| RuntimeRoute(r.to_string(), "r1".to_string()))
            .collect();
        let origin = Url::parse(ORIGIN).unwrap();
        let manifest = ManifestIndex::build(&origin, &[], &routes).unwrap();
        let clients = Arc::new(Clients::new());
        let (_client, events) = clients.connect(origin, ClientType::Window).await;
        let fetcher = Arc::new(fetcher);
        let storage = Arc::new(storage);
        let pool = PrefetchPool::new(
            Arc::new(manifest),
            storage.clone(),
            fetcher.clone(),
            ClientNotifier::new(clients),
            "runtime-revision",
        );
        Fixture {
            pool: Arc::new(pool),
            fetcher,
            storage,
            events,
        }
    }

    fn images(n: usize) -> Vec<String> {
        (0..n).map(|i| format!("img/{i}.png")).collect()
    }

    fn drain(events: &mut UnboundedReceiver<ClientEvent>) -> Vec<OutboundMessage> {
        let mut out = Vec::new();
        while let Ok(ClientEvent::Message(m)) = events.try_recv() {
            out.push(m);
        }
        out
    }

    fn progress(messages: &[OutboundMessage]) -> Vec<(usize, usize)> {
        messages
            .iter()
            .filter_map(|m| match m {
                OutboundMessage::CacheRoutesProgress(p) => Some((p.fetched, p.total)),
                _ => None,
            })
            .collect()
    }

    async fn run(pool: &PrefetchPool, pattern: &str) -> PrefetchReport {
        let token = pool.begin().await;
        pool.run(&Regex::new(pattern).unwrap(), &token).await.unwrap()
    }

    #[tokio::test]
    async fn test_single_item_progress() {
        let mut f = fixture(&["a.png", "b.json"], ScriptedFetcher::new(), MemoryCacheStorage::new()).await;

        let report = run(&f.pool, r"/a\.png$").await;
        assert_eq!(report.total, 1);
        assert_eq!(report.fetched, 1);
        assert_eq!(progress(&drain(&mut f.events)), vec![(0, 1), (1, 1)]);

        let store = f.storage.open_memory("runtime-revision").await;
        assert!(store
            .contains("https://example.com/a.png?__WB_REVISION__=r1")
            .await
            .unwrap());
        assert_eq!(f.fetcher.seen()[0].0, "https://example.com/a.png");
    }

    #[tokio::test]
    async fn test_progress_is_strictly_increasing() {
        let routes = images(23);
        let routes: Vec<&str> = routes.iter().map(String::as_str).collect();
        let mut f = fixture(
            &routes,
            ScriptedFetcher::with_delay(Duration::from_millis(1)),
            MemoryCacheStorage::new(),
        )
        .await;

        let report = run(&f.pool, "img/").await;
        assert_eq!((report.fetched, report.total), (23, 23));
        assert!(report.failures.is_empty());

        let seen = progress(&drain(&mut f.events));
        let expected: Vec<(usize, usize)> = (0..=23).map(|i| (i, 23)).collect();
        assert_eq!(seen, expected);
        assert_eq!(f.storage.open_memory("runtime-revision").await.len().await, 23);
    }

    #[tokio::test]
    async fn test_already_cached_keys_are_skipped() {
        let f = fixture(&["a.png", "b.png"], ScriptedFetcher::new(), MemoryCacheStorage::new()).await;
        f.storage
            .open_memory("runtime-revision")
            .await
            .put(
                "https://example.com/a.png?__WB_REVISION__=r1",
                FetchResponse::new("https://example.com/a.png", 200, "x"),
            )
            .await
            .unwrap();

        let report = run(&f.pool, r"\.png").await;
        assert_eq!(report.total, 1);
        assert_eq!(f.fetcher.calls(), 1);
    }

    #[tokio::test]
    async fn test_nothing_to_do_reports_zero() {
        let mut f = fixture(&["a.png"], ScriptedFetcher::new(), MemoryCacheStorage::new()).await;
        let report = run(&f.pool, "nomatch").await;
        assert_eq!(report, PrefetchReport::default());
        assert_eq!(progress(&drain(&mut f.events)), vec![(0, 0)]);
        assert_eq!(f.fetcher.calls(), 0);
    }

    #[tokio::test]
    async fn test_enumeration_limit_falls_back_to_per_key_checks() {
        let storage = MemoryCacheStorage::with_limits(StoreLimits {
            max_listed_keys: Some(0),
            max_entries: None,
        });
        let mut f = fixture(&["a.png", "b.png", "c.png"], ScriptedFetcher::new(), storage).await;
        f.storage
            .open_memory("runtime-revision")
            .await
            .put(
                "https://example.com/b.png?__WB_REVISION__=r1",
                FetchResponse::new("https://example.com/b.png", 200, "x"),
            )
            .await
            .unwrap();

        let report = run(&f.pool, r"\.png").await;
        // Every match is counted; the cached one is skipped without a fetch.
        assert_eq!((report.fetched, report.total), (3, 3));
        assert_eq!(f.fetcher.calls(), 2);
        assert_eq!(progress(&drain(&mut f.events)).last(), Some(&(3, 3)));
    }

    #[tokio::test]
    async fn test_failures_are_batched_once() {
        let routes = images(8);
        let routes: Vec<&str> = routes.iter().map(String::as_str).collect();
        let fetcher = ScriptedFetcher::new();
        fetcher.go_offline("https://example.com/img/2.png");
        fetcher.go_offline("https://example.com/img/5.png");
        let mut f = fixture(&routes, fetcher, MemoryCacheStorage::new()).await;

        let report = run(&f.pool, "img/").await;
        assert_eq!(report.failures.len(), 2);
        assert_eq!(report.fetched, 6);

        let messages = drain(&mut f.events);
        let batches: Vec<&OutboundMessage> = messages
            .iter()
            .filter(|m| matches!(m, OutboundMessage::CacheRoutesError { .. }))
            .collect();
        assert_eq!(batches.len(), 1);
        match batches[0] {
            OutboundMessage::CacheRoutesError { errors } => {
                let mut keys: Vec<&str> = errors.iter().map(|e| e.key.as_str()).collect();
                keys.sort();
                assert_eq!(
                    keys,
                    vec![
                        "https://example.com/img/2.png?__WB_REVISION__=r1",
                        "https://example.com/img/5.png?__WB_REVISION__=r1",
                    ]
                );
            }
            _ => unreachable!(),
        }
    }

    #[tokio::test]
    async fn test_cancel_stops_taking_work() {
        let routes = images(40);
        let routes: Vec<&str> = routes.iter().map(String::as_str).collect();
        let mut f = fixture(
            &routes,
            ScriptedFetcher::with_delay(Duration::from_millis(20)),
            MemoryCacheStorage::new(),
        )
        .await;

        let handle = f.pool.start("img/").await.unwrap();

        // Wait for the first completed item, then cancel.
        let mut observed = 0;
        while observed == 0 {
            match f.events.recv().await {
                Some(ClientEvent::Message(OutboundMessage::CacheRoutesProgress(p))) => {
                    observed = p.fetched
                }
                Some(_) => {}
                None => panic!("client channel closed"),
            }
        }
        assert!(f.pool.cancel().await);
        let cancelled_at = f.fetcher.calls();

        let report = handle.await.unwrap();
        assert!(report.cancelled);
        assert!(report.fetched < 40);
        // Only fetches already under way when the token was set complete.
        assert_eq!(f.fetcher.calls(), cancelled_at);
        assert!(report.fetched <= cancelled_at);
        assert!(f.pool.current().await.is_none());
    }

    #[tokio::test]
    async fn test_begin_replaces_without_cancelling() {
        let f = fixture(&[], ScriptedFetcher::new(), MemoryCacheStorage::new()).await;
        let first = f.pool.begin().await;
        let second = f.pool.begin().await;

        assert!(!first.is_aborted());
        assert!(f.pool.current().await.unwrap().same_run(&second));

        assert!(f.pool.cancel().await);
        assert!(second.is_aborted());
        assert!(!first.is_aborted());
        assert!(!f.pool.cancel().await);
    }

    #[tokio::test]
    async fn test_finished_run_clears_slot() {
        let f = fixture(&["a.png"], ScriptedFetcher::new(), MemoryCacheStorage::new()).await;
        let report = f.pool.start("a").await.unwrap().await.unwrap();
        assert_eq!(report.fetched, 1);
        assert!(f.pool.current().await.is_none());
    }

    #[tokio::test]
    async fn test_invalid_pattern_is_reported() {
        let mut f = fixture(&["a.png"], ScriptedFetcher::new(), MemoryCacheStorage::new()).await;
        assert!(matches!(
            f.pool.start("(").await,
            Err(SwError::InvalidPattern(_))
        ));
        assert!(matches!(
            drain(&mut f.events).as_slice(),
            [OutboundMessage::CacheRoutesError { .. }]
        ));
        assert!(f.pool.current().await.is_none());
    }
}
