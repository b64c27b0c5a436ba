//! liqmap - Real-time liquidation pipeline
//!
//! One market-wide WebSocket ingest from the venue's forced-order stream,
//! an in-memory windowed store, and priority fan-out to REST/WebSocket
//! consumers.
//!
//! Usage:
//!   liqmap --bind 0.0.0.0:3000 --symbols BTCUSDT,ETHUSDT,SOLUSDT
//!
//! Environment:
//!   LIQ_SYMBOLS - Comma-separated symbol filter
//!   LIQ_FEED_URL - Venue stream URL override
//!   RUST_LOG - Tracing filter (default: liqmap_backend=debug)

use std::{path::Path, sync::Arc, time::Duration};

use anyhow::{Context, Result};
use clap::Parser;
use dotenv::dotenv;
use tokio::{net::TcpListener, sync::broadcast::error::RecvError, time::interval};
use tower_http::{cors::CorsLayer, trace::TraceLayer};
use tracing::{info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use liqmap_backend::{
    api,
    broadcast::{BroadcastConfig, BroadcastManager, MessagePriority},
    feed::{FeedConfig, LiquidationFeed},
    models::WsServerMessage,
    store::{LiquidationStore, StoreConfig},
};

#[derive(Parser, Debug)]
#[command(name = "liqmap")]
#[command(about = "Real-time liquidation heatmap backend")]
struct Args {
    /// Address to bind the API server on
    #[arg(long, env = "LIQ_BIND", default_value = "0.0.0.0:3000")]
    bind: String,

    /// Symbols to publish (comma-separated). The venue stream is always
    /// market-wide; this filter is applied before anything is stored.
    #[arg(
        long,
        env = "LIQ_SYMBOLS",
        default_value = "BTCUSDT,ETHUSDT,SOLUSDT,XRPUSDT"
    )]
    symbols: String,

    /// Notional size (quote currency) at which an event is fanned out at
    /// high priority
    #[arg(long, env = "LIQ_HIGH_PRIORITY_NOTIONAL", default_value = "1000000")]
    high_priority_notional: f64,

    /// Interval between stats frames pushed to WebSocket clients
    #[arg(long, env = "LIQ_STATS_INTERVAL_SECS", default_value = "10")]
    stats_interval_secs: u64,
}

#[tokio::main]
async fn main() -> Result<()> {
    load_env();
    init_tracing();

    let args = Args::parse();

    info!("🚀 liqmap starting - liquidation feed → windowed store → fan-out");

    let symbols: Vec<String> = args
        .symbols
        .split(',')
        .map(|s| s.trim().to_uppercase())
        .filter(|s| !s.is_empty())
        .collect();
    if symbols.is_empty() {
        warn!("⚠️  Symbol filter is empty - no events will be published");
    }

    let store = Arc::new(LiquidationStore::new(StoreConfig::from_env()));
    let feed = Arc::new(LiquidationFeed::new(FeedConfig::from_env()));
    let broadcast = Arc::new(BroadcastManager::new(BroadcastConfig::from_env()));

    feed.start(&symbols);
    info!("📡 Feed filter: {} symbols", symbols.len());

    // Pipeline: feed events land in the store and fan out to subscribers
    tokio::spawn(ingest_pipeline(
        feed.clone(),
        store.clone(),
        broadcast.clone(),
        args.high_priority_notional,
    ));

    // Periodic stats frames keep idle dashboards fresh
    tokio::spawn(stats_publisher(
        store.clone(),
        feed.clone(),
        broadcast.clone(),
        args.stats_interval_secs,
    ));

    // Retention sweep forgets symbols that went quiet
    tokio::spawn(store_sweeper(store.clone()));

    let app = api::create_router(store, feed.clone(), broadcast)
        .layer(TraceLayer::new_for_http())
        .layer(CorsLayer::permissive());

    let listener = TcpListener::bind(&args.bind)
        .await
        .with_context(|| format!("failed to bind {}", args.bind))?;
    info!("🎯 API server listening on {}", args.bind);

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal(feed))
        .await
        .context("Server error")?;

    Ok(())
}

/// Drain the feed channel into the store and fan events out to WebSocket
/// subscribers. Large liquidations jump the queue.
async fn ingest_pipeline(
    feed: Arc<LiquidationFeed>,
    store: Arc<LiquidationStore>,
    broadcast: Arc<BroadcastManager>,
    high_priority_notional: f64,
) {
    let mut events = feed.subscribe();

    loop {
        match events.recv().await {
            Ok(event) => {
                store.add_event(event.clone());

                let priority = if event.notional_value >= high_priority_notional {
                    MessagePriority::High
                } else {
                    MessagePriority::Normal
                };
                match serde_json::to_string(&WsServerMessage::Liquidation(event)) {
                    Ok(payload) => {
                        broadcast.broadcast_all(payload, priority);
                    }
                    Err(e) => warn!(error = %e, "event_serialize_failed"),
                }
            }
            Err(RecvError::Lagged(skipped)) => {
                warn!(skipped, "ingest_lagged");
            }
            Err(RecvError::Closed) => break,
        }
    }
}

/// Push a stats frame to every subscriber at low priority.
async fn stats_publisher(
    store: Arc<LiquidationStore>,
    feed: Arc<LiquidationFeed>,
    broadcast: Arc<BroadcastManager>,
    interval_secs: u64,
) {
    let mut ticker = interval(Duration::from_secs(interval_secs.max(1)));
    loop {
        ticker.tick().await;
        if broadcast.subscriber_count() == 0 {
            continue;
        }
        match serde_json::to_string(&api::stats_message(&store, &feed)) {
            Ok(payload) => {
                broadcast.broadcast_all(payload, MessagePriority::Low);
            }
            Err(e) => warn!(error = %e, "stats_serialize_failed"),
        }
    }
}

/// Periodic retention sweep across all symbol windows.
async fn store_sweeper(store: Arc<LiquidationStore>) {
    let sweep_secs = store.config().sweep_interval_secs.max(1);
    let mut ticker = interval(Duration::from_secs(sweep_secs));
    loop {
        ticker.tick().await;
        let evicted = store.sweep();
        if evicted > 0 {
            info!(evicted, "store_sweep");
        }
    }
}

/// Resolve on ctrl-c, stopping the feed first so the venue socket closes
/// with a normal close frame.
async fn shutdown_signal(feed: Arc<LiquidationFeed>) {
    let _ = tokio::signal::ctrl_c().await;
    info!("shutdown signal received");
    feed.stop();
}

/// Initialize tracing with enhanced observability
fn init_tracing() {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "liqmap_backend=debug,liqmap=debug,tower_http=debug".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();
}

fn load_env() {
    // 1) Standard dotenv search (cwd + parents)
    let _ = dotenv();

    // 2) Also try the manifest directory (common when run with
    // --manifest-path from elsewhere)
    let manifest_dir = Path::new(env!("CARGO_MANIFEST_DIR"));
    let candidates = [manifest_dir.join(".env"), manifest_dir.join("../.env")];

    for p in candidates {
        if p.exists() {
            let _ = dotenv::from_path(&p);
        }
    }
}
