use std::io::Write;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result, bail};
use clap::Parser;
use nostr::Event;
use nostr_client::{MemoryCache, NegentropySync, PoolConfig, RelayPool, SyncConfig, SyncOptions};
use serde_json::{Value, json};
use tracing::{info, warn};

/// Reconcile a local event set against relays with NIP-77.
#[derive(Parser, Debug)]
#[command(name = "nostr-sync")]
struct Args {
    /// Relay URLs (ws:// or wss://).
    #[arg(required = true)]
    relays: Vec<String>,

    /// NIP-01 filter as JSON. Repeat for several filters.
    #[arg(long = "filter", default_value = "{}")]
    filters: Vec<String>,

    /// JSON file holding the local events (an array of events).
    #[arg(long)]
    events: Option<PathBuf>,

    /// Only report need/have; do not fetch missing events.
    #[arg(long)]
    no_fetch: bool,

    /// Frame size limit in bytes (0 disables it).
    #[arg(long)]
    frame_size_limit: Option<u64>,

    /// Abort the whole sync after this many seconds, keeping partial results.
    #[arg(long)]
    timeout_secs: Option<u64>,
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .init();

    let args = Args::parse();
    let config = SyncConfig::from_env().context("load NOSTR_SYNC_* settings")?;

    let filters = args
        .filters
        .iter()
        .map(|raw| {
            serde_json::from_str::<Value>(raw).with_context(|| format!("parse filter {raw}"))
        })
        .collect::<Result<Vec<_>>>()?;
    if filters.iter().any(|filter| !filter.is_object()) {
        bail!("every --filter must be a JSON object");
    }

    let local_events = match &args.events {
        Some(path) => {
            let raw = std::fs::read_to_string(path)
                .with_context(|| format!("read {}", path.display()))?;
            serde_json::from_str::<Vec<Event>>(&raw)
                .with_context(|| format!("parse events in {}", path.display()))?
        }
        None => Vec::new(),
    };
    info!(events = local_events.len(), "loaded local events");
    let cache = Arc::new(MemoryCache::with_events(local_events));

    let pool = RelayPool::new(PoolConfig::default());
    for url in &args.relays {
        pool.add_relay(url)
            .await
            .with_context(|| format!("add relay {url}"))?;
    }
    if let Err(error) = pool.connect_all().await {
        warn!("{error}");
    }

    let mut sync = NegentropySync::new(config).with_cache(cache.clone());
    sync.add_pool(&pool).await;

    let mut options = SyncOptions::new()
        .auto_fetch(!args.no_fetch)
        .on_relay_error(|url, error| warn!("relay {url} failed: {error}"));
    options.frame_size_limit = args.frame_size_limit;
    if let Some(seconds) = args.timeout_secs {
        options = options.overall_timeout(Duration::from_secs(seconds));
    }

    let result = sync.sync(filters, options).await?;

    let reports: Vec<Value> = result
        .reports
        .iter()
        .map(|report| {
            json!({
                "url": report.url,
                "outcome": format!("{:?}", report.outcome),
                "need": report.need,
                "have": report.have,
                "fetched": report.fetched,
                "rounds": report.stats.rounds,
                "bytesSent": report.stats.bytes_sent,
                "bytesReceived": report.stats.bytes_received,
                "error": report.error,
            })
        })
        .collect();
    let summary = json!({
        "need": result.need,
        "have": result.have,
        "fetched": result.events.len(),
        "cached": cache.len().await,
        "relays": reports,
    });

    {
        let mut stdout = std::io::stdout().lock();
        serde_json::to_writer_pretty(&mut stdout, &summary)?;
        writeln!(stdout)?;
    }

    if let Err(error) = pool.disconnect_all().await {
        warn!("disconnect failed: {error}");
    }
    Ok(())
}
