//! Revcache host
//!
//! Runs one offline worker outside a browser. The worker is installed and
//! activated from a config file, one window client is connected, and each
//! stdin line is handled as an inbound message. Everything the worker sends
//! to the client is printed to stdout as one JSON object per line; logs go
//! to stderr.
//!
//! ```text
//! $ echo '{"type":"CACHE_ROUTES","payload":{"routeRegex":"img/"}}' | revcache-host worker.json
//! {"type":"CACHE_ROUTES_PROGRESS","payload":{"fetched":0,"fetchTotal":2}}
//! {"type":"CACHE_ROUTES_PROGRESS","payload":{"fetched":1,"fetchTotal":2}}
//! {"type":"CACHE_ROUTES_PROGRESS","payload":{"fetched":2,"fetchTotal":2}}
//! ```

use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Arc;

use clap::Parser;
use revcache_common::{init_logging, LogConfig, LogFormat};
use revcache_net::ResourceLoader;
use revcache_store::{CacheStorage, DiskCacheStorage, MemoryCacheStorage};
use revcache_sw::{
    ClientEvent, ClientType, Dispatch, ManifestIndex, OfflineWorker, SwError, SwResult,
    WorkerConfig,
};
use serde_json::json;
use tokio::io::{AsyncBufReadExt, BufReader};
use tracing::{debug, error, info, warn};
use url::Url;

#[derive(Parser, Debug)]
#[command(name = "revcache-host", version, about = "Run a revcache worker over stdin/stdout")]
struct Cli {
    /// Worker configuration file (JSON).
    config: PathBuf,

    /// Log format: pretty, compact or json.
    #[arg(long, default_value = "compact", value_parser = parse_log_format)]
    log_format: LogFormat,

    /// Enable debug-level logs.
    #[arg(short, long)]
    verbose: bool,

    /// Location of the connected client. Defaults to the worker origin.
    #[arg(long)]
    client_url: Option<Url>,
}

fn parse_log_format(name: &str) -> Result<LogFormat, String> {
    LogFormat::from_name(name).ok_or_else(|| format!("unknown log format '{name}'"))
}

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();

    let log = if cli.verbose {
        LogConfig::debug()
    } else {
        LogConfig::default()
    };
    if let Err(e) = init_logging(log.with_format(cli.log_format)) {
        eprintln!("failed to initialise logging: {e}");
    }

    match run(cli).await {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            error!(error = %e, "revcache-host failed");
            ExitCode::FAILURE
        }
    }
}

async fn run(cli: Cli) -> SwResult<()> {
    let config = WorkerConfig::load(&cli.config)?;
    info!(origin = %config.origin, config = %cli.config.display(), "Starting worker");

    let manifest = ManifestIndex::load(
        &config.origin,
        config.precache_manifest.as_deref(),
        config.runtime_manifest.as_deref(),
    )?;
    let storage: Arc<dyn CacheStorage> = match &config.cache_dir {
        Some(dir) => {
            info!(dir = %dir.display(), "Using on-disk stores");
            Arc::new(DiskCacheStorage::new(dir))
        }
        None => Arc::new(MemoryCacheStorage::new()),
    };
    let fetcher = Arc::new(ResourceLoader::new(config.loader_config())?);

    let worker = OfflineWorker::new(config, manifest, storage, fetcher)?;
    worker.install().await?;
    worker.activate().await?;

    let page = cli
        .client_url
        .unwrap_or_else(|| worker.config().origin.clone());
    let (client, mut events) = worker.clients().connect(page, ClientType::Window).await;
    let printer = tokio::spawn(async move {
        while let Some(event) = events.recv().await {
            print_event(&event);
        }
    });

    let mut prefetches = Vec::new();
    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    while let Some(line) = lines.next_line().await.map_err(|source| SwError::Io {
        path: PathBuf::from("<stdin>"),
        source,
    })? {
        let line = line.trim();
        if line.is_empty() {
            continue;
        }
        match worker.handle_message_json(line).await {
            Ok(Dispatch::Prefetch(handle)) => prefetches.push(handle),
            Ok(Dispatch::Reset(report)) => {
                info!(stores = report.deleted.len(), "Reset finished");
            }
            Ok(other) => debug!(?other, "Message handled"),
            Err(e) => warn!(error = %e, "Message rejected"),
        }
    }

    debug!(pending = prefetches.len(), "Input closed; waiting for prefetches");
    for handle in prefetches {
        match handle.await {
            Ok(report) => info!(
                fetched = report.fetched,
                total = report.total,
                failures = report.failures.len(),
                cancelled = report.cancelled,
                "Prefetch done"
            ),
            Err(e) => warn!(error = %e, "Prefetch task failed"),
        }
    }

    // The printer stops once the last sender is gone.
    worker.clients().disconnect(&client.id).await;
    drop(client);
    drop(worker);
    if let Err(e) = printer.await {
        warn!(error = %e, "Printer task failed");
    }
    Ok(())
}

fn print_event(event: &ClientEvent) {
    let line = match event {
        ClientEvent::Message(message) => message.to_json(),
        ClientEvent::Navigate(url) => {
            serde_json::to_string(&json!({"type": "NAVIGATE", "payload": url.as_str()}))
        }
    };
    match line {
        Ok(line) => println!("{line}"),
        Err(e) => warn!(error = %e, "Could not encode client event"),
    }
}
