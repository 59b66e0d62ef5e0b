//! End-to-end scenarios through the public worker API.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use revcache_net::{FetchResponse, Fetcher, NetError, Request};
use revcache_store::{CacheStorage, CacheStore, DiskCacheStorage, MemoryCacheStorage, StoreLimits};
use revcache_sw::{
    ClientEvent, ClientType, Dispatch, FetchEvent, ManifestIndex, OfflineWorker, OutboundMessage,
    RuntimeRoute, WorkerConfig,
};
use tokio::sync::mpsc::UnboundedReceiver;
use url::Url;

const ORIGIN: &str = "https://viewer.example.com/";

/// Serves every URL with its own address as body and records calls.
#[derive(Default)]
struct RecordingFetcher {
    calls: AtomicUsize,
    urls: Mutex<Vec<String>>,
}

impl RecordingFetcher {
    fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }

    fn calls_to(&self, url: &str) -> usize {
        self.urls.lock().unwrap().iter().filter(|u| *u == url).count()
    }
}

#[async_trait]
impl Fetcher for RecordingFetcher {
    async fn fetch(&self, request: Request) -> Result<FetchResponse, NetError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        let url = request.url.to_string();
        self.urls.lock().unwrap().push(url.clone());
        Ok(FetchResponse::new(url.clone(), 200, url))
    }
}

fn config() -> WorkerConfig {
    WorkerConfig::new(Url::parse(ORIGIN).unwrap())
}

fn manifest(routes: &[(&str, &str)]) -> ManifestIndex {
    let routes: Vec<RuntimeRoute> = routes
        .iter()
        .map(|(route, rev)| RuntimeRoute(route.to_string(), rev.to_string()))
        .collect();
    ManifestIndex::build(&config().origin, &[], &routes).unwrap()
}

async fn start(
    routes: &[(&str, &str)],
    storage: Arc<dyn CacheStorage>,
    fetcher: Arc<RecordingFetcher>,
) -> (OfflineWorker, UnboundedReceiver<ClientEvent>) {
    let worker = OfflineWorker::new(config(), manifest(routes), storage, fetcher).unwrap();
    worker.install().await.unwrap();
    worker.activate().await.unwrap();
    let (_client, events) = worker
        .clients()
        .connect(Url::parse(ORIGIN).unwrap(), ClientType::Window)
        .await;
    (worker, events)
}

fn messages(events: &mut UnboundedReceiver<ClientEvent>) -> Vec<OutboundMessage> {
    let mut out = Vec::new();
    while let Ok(event) = events.try_recv() {
        if let ClientEvent::Message(message) = event {
            out.push(message);
        }
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

fn get(url: &str) -> FetchEvent {
    FetchEvent::new(Request::parse(url).unwrap())
}

async fn prefetch(worker: &OfflineWorker, pattern: &str) -> revcache_sw::PrefetchReport {
    let message = format!(r#"{{"type":"CACHE_ROUTES","payload":{{"routeRegex":"{pattern}"}}}}"#);
    match worker.handle_message_json(&message).await.unwrap() {
        Dispatch::Prefetch(handle) => handle.await.unwrap(),
        other => panic!("expected a prefetch, got {other:?}"),
    }
}

#[tokio::test]
async fn prefetched_asset_is_served_without_network() {
    let fetcher = Arc::new(RecordingFetcher::default());
    let (worker, mut events) = start(
        &[("a.png", "r1"), ("b.json", "r1")],
        Arc::new(MemoryCacheStorage::new()),
        fetcher.clone(),
    )
    .await;

    let report = prefetch(&worker, r"/a\\.png$").await;
    assert_eq!((report.fetched, report.total), (1, 1));
    assert_eq!(progress(&messages(&mut events)), vec![(0, 1), (1, 1)]);

    let before = fetcher.calls();
    let response = worker
        .handle_fetch(get("https://viewer.example.com/a.png"))
        .await;
    assert!(response.from_cache);
    assert_eq!(&response.body[..], b"https://viewer.example.com/a.png");
    assert_eq!(fetcher.calls(), before);
}

#[tokio::test]
async fn revision_change_is_reconciled_on_activation() {
    let storage: Arc<dyn CacheStorage> = Arc::new(MemoryCacheStorage::new());
    let fetcher = Arc::new(RecordingFetcher::default());
    let url = "https://viewer.example.com/b.json";

    let (v1, _events) = start(&[("b.json", "r1")], storage.clone(), fetcher.clone()).await;
    v1.handle_fetch(get(url)).await;

    let store = storage.open("runtime-revision").await.unwrap();
    let old_key = "https://viewer.example.com/b.json?__WB_REVISION__=r1";
    for _ in 0..100 {
        if store.contains(old_key).await.unwrap() {
            break;
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
    assert!(store.contains(old_key).await.unwrap());

    // A new deployment ships r2; activating it reaps the r1 entry.
    let (v2, _events) = start(&[("b.json", "r2")], storage.clone(), fetcher.clone()).await;
    assert!(store.keys().await.unwrap().is_empty());

    let response = v2.handle_fetch(get(url)).await;
    assert!(!response.from_cache);
    assert_eq!(fetcher.calls_to(url), 2);
}

#[tokio::test]
async fn disk_store_over_listing_limit_uses_per_key_checks() {
    let dir = tempfile::tempdir().unwrap();
    let storage = Arc::new(DiskCacheStorage::new(dir.path()).with_limits(StoreLimits {
        max_listed_keys: Some(1),
        max_entries: None,
    }));
    let fetcher = Arc::new(RecordingFetcher::default());
    let routes = [("doc/1.json", "a"), ("doc/2.json", "a"), ("doc/3.json", "a")];
    let (worker, mut events) = start(&routes, storage, fetcher.clone()).await;

    // Two entries already stored put the store over its listing limit.
    prefetch(&worker, r"doc/[12]").await;
    assert_eq!(fetcher.calls(), 2);
    messages(&mut events);

    let report = prefetch(&worker, "doc/").await;
    assert_eq!((report.fetched, report.total), (3, 3));
    assert_eq!(fetcher.calls(), 3);
    assert_eq!(progress(&messages(&mut events)).last(), Some(&(3, 3)));
}

#[tokio::test]
async fn reset_wipes_and_deregisters() {
    let storage: Arc<dyn CacheStorage> = Arc::new(MemoryCacheStorage::new());
    let fetcher = Arc::new(RecordingFetcher::default());
    let (worker, mut events) = start(&[("a.png", "r1")], storage.clone(), fetcher).await;
    prefetch(&worker, "a").await;
    messages(&mut events);

    match worker.handle_message_json(r#"{"type":"RESET"}"#).await.unwrap() {
        Dispatch::Reset(report) => assert!(report.deleted.contains(&"runtime-revision".to_string())),
        other => panic!("expected a reset, got {other:?}"),
    }
    assert!(storage.keys().await.unwrap().is_empty());
    assert_eq!(
        events.recv().await,
        Some(ClientEvent::Navigate(Url::parse(ORIGIN).unwrap()))
    );
    assert!(worker.registration().is_redundant());
    assert!(matches!(
        worker.handle_message_json(r#"{"type":"CACHE_ROUTES","payload":{"routeRegex":"a"}}"#).await,
        Ok(Dispatch::Ignored)
    ));
}
