//! End-to-end pipeline tests: raw venue frames through parsing, windowed
//! storage, derived views, and the broadcast fan-out.
//!
//! No network involved: frames are injected exactly as the venue would
//! send them, and WebSocket transports are replaced with recording fakes.

use std::sync::{
    atomic::{AtomicBool, Ordering},
    Arc,
};
use std::time::{Duration, Instant};

use async_trait::async_trait;
use chrono::Utc;
use parking_lot::Mutex;

use liqmap_backend::api;
use liqmap_backend::broadcast::{
    BroadcastConfig, BroadcastManager, MessagePriority, SubscriberTransport,
};
use liqmap_backend::feed::binance::parse_force_order;
use liqmap_backend::feed::{FeedConfig, LiquidationFeed};
use liqmap_backend::models::{LiquidationEvent, LookbackWindow, Side, WsServerMessage};
use liqmap_backend::store::{HeatmapParams, LeverageTier, LiquidationStore, StoreConfig};

/// A venue frame as the market-wide forced-order stream emits it,
/// including fields the parser does not care about.
fn force_order_frame(symbol: &str, side: &str, price: f64, qty: f64, time_ms: i64) -> String {
    format!(
        r#"{{"e":"forceOrder","E":{time_ms},"o":{{"s":"{symbol}","S":"{side}","o":"LIMIT","f":"IOC","q":"{qty}","p":"{price}","ap":"{price}","X":"FILLED","l":"{qty}","z":"{qty}","T":{time_ms}}}}}"#
    )
}

#[test]
fn test_frames_flow_into_windowed_views() {
    let store = LiquidationStore::new(StoreConfig::default());
    let now = Utc::now().timestamp_millis();

    // Three clustered SOL liquidations, as in a cascade around 100
    let frames = [
        force_order_frame("SOLUSDT", "SELL", 100.0, 50.0, now - 60_000),
        force_order_frame("SOLUSDT", "SELL", 100.1, 30.0, now - 30_000),
        force_order_frame("SOLUSDT", "BUY", 100.2, 20.0, now - 5_000),
    ];
    for raw in &frames {
        let event = parse_force_order(raw)
            .and_then(|m| m.into_event())
            .expect("venue frame should parse");
        store.add_event(event);
    }

    let events = store.events("SOLUSDT", LookbackWindow::OneHour);
    assert_eq!(events.len(), 3, "all in-window events should be returned");
    assert!(
        events.windows(2).all(|w| w[0].timestamp <= w[1].timestamp),
        "events should come back in arrival order"
    );
    assert_eq!(events[0].side, Side::Sell);

    let heatmap = store.heatmap(
        "SOLUSDT",
        LookbackWindow::OneHour,
        &HeatmapParams {
            bandwidth: 1.0,
            price_range: 2.0,
            reference_price: None,
        },
    );
    assert!(
        (heatmap.statistics.total_volume - 100.0).abs() < 1e-9,
        "total volume should be the sum of quantities"
    );

    // Density concentrates into one dominant bucket near the cluster center
    let max = heatmap
        .buckets
        .iter()
        .max_by(|a, b| a.volume.partial_cmp(&b.volume).unwrap())
        .expect("heatmap should have buckets");
    assert!(
        (max.price - 100.1).abs() <= 0.5,
        "dominant bucket should sit near the cluster center, got {}",
        max.price
    );
    let top_count = heatmap
        .buckets
        .iter()
        .filter(|b| (b.volume - max.volume).abs() < 1e-9)
        .count();
    assert_eq!(top_count, 1, "the dominant bucket should be unique");

    let tiers = store.leverage_distribution("SOLUSDT", LookbackWindow::OneHour);
    assert_eq!(tiers.len(), 5, "every tier should be present");
    let total_pct: f64 = tiers.iter().map(|t| t.percentage).sum();
    assert!(
        (total_pct - 100.0).abs() < 1e-6,
        "percentages should sum to 100, got {total_pct}"
    );
    let extreme = tiers
        .iter()
        .find(|t| t.tier == LeverageTier::Extreme)
        .unwrap();
    assert_eq!(
        extreme.count, 3,
        "small-notional orders all map to the extreme tier"
    );
}

#[test]
fn test_stats_frame_reflects_store_contents() {
    let store = LiquidationStore::default();
    let feed = LiquidationFeed::new(FeedConfig::default());
    store.add_event(LiquidationEvent::new(
        "BTCUSDT",
        Side::Sell,
        40_000.0,
        0.5,
        Utc::now(),
    ));

    let frame = api::stats_message(&store, &feed);
    let json = serde_json::to_value(&frame).unwrap();
    assert_eq!(json["type"], "stats");
    assert_eq!(json["connected"], false);
    assert_eq!(json["tracked_symbols"], 1);
    assert_eq!(json["total_events"], 1);
}

#[test]
fn test_ws_payloads_carry_type_tags() {
    let event = LiquidationEvent::new("ETHUSDT", Side::Buy, 2_500.0, 4.0, Utc::now());
    let raw = serde_json::to_string(&WsServerMessage::Liquidation(event)).unwrap();
    let json: serde_json::Value = serde_json::from_str(&raw).unwrap();

    assert_eq!(json["type"], "liquidation");
    assert_eq!(json["symbol"], "ETHUSDT");
    assert_eq!(json["side"], "BUY");
    assert!(json.get("estimatedLeverage").is_some());

    let pong = serde_json::to_value(&WsServerMessage::Pong { timestamp: 7 }).unwrap();
    assert_eq!(pong["type"], "pong");
    assert_eq!(pong["timestamp"], 7);
}

// ===== Broadcast fan-out =====

#[derive(Default)]
struct RecordingTransport {
    ready: AtomicBool,
    sent: Mutex<Vec<String>>,
}

impl RecordingTransport {
    fn ready() -> Arc<Self> {
        let t = Self::default();
        t.ready.store(true, Ordering::SeqCst);
        Arc::new(t)
    }

    fn stalled() -> Arc<Self> {
        Arc::new(Self::default())
    }

    fn sent(&self) -> Vec<String> {
        self.sent.lock().clone()
    }
}

#[async_trait]
impl SubscriberTransport for RecordingTransport {
    fn is_ready(&self) -> bool {
        self.ready.load(Ordering::SeqCst)
    }

    async fn send(&self, payload: &str) -> anyhow::Result<()> {
        self.sent.lock().push(payload.to_string());
        Ok(())
    }
}

async fn wait_until(limit_ms: u64, mut cond: impl FnMut() -> bool) -> bool {
    let deadline = Instant::now() + Duration::from_millis(limit_ms);
    while Instant::now() < deadline {
        if cond() {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
    cond()
}

#[tokio::test]
async fn test_fan_out_isolates_stalled_subscribers_and_prioritizes_whales() {
    let manager = Arc::new(BroadcastManager::new(BroadcastConfig {
        queue_capacity: 2,
        drain_poll_ms: 5,
    }));
    let healthy = RecordingTransport::ready();
    let stalled = RecordingTransport::stalled();
    manager.register(healthy.clone());
    let stalled_id = manager.register(stalled.clone());

    // Background stats frames go out at low priority and pile up on the
    // stalled subscriber only
    for i in 0..4 {
        manager.broadcast_all(format!(r#"{{"type":"stats","seq":{i}}}"#), MessagePriority::Low);
        tokio::task::yield_now().await;
    }
    assert!(wait_until(2_000, || healthy.sent().len() == 4).await);

    let stats = manager
        .subscriber_stats()
        .into_iter()
        .find(|s| s.id == stalled_id)
        .unwrap();
    assert_eq!(stats.queued, 2, "stalled queue should cap at capacity");
    assert_eq!(stats.dropped, 2);

    // A whale liquidation goes out at high priority and displaces the
    // oldest queued stats frame instead of being lost
    let whale = LiquidationEvent::new("BTCUSDT", Side::Sell, 40_000.0, 100.0, Utc::now());
    let payload = serde_json::to_string(&WsServerMessage::Liquidation(whale)).unwrap();
    let outcome = manager.broadcast_all(payload.clone(), MessagePriority::High);
    assert_eq!(outcome.evicted, 1);
    assert_eq!(outcome.queued, 2);

    assert!(wait_until(2_000, || healthy.sent().len() == 5).await);

    // Once the stalled transport recovers, the whale event leads the drain
    stalled.ready.store(true, Ordering::SeqCst);
    assert!(wait_until(2_000, || stalled.sent().len() == 2).await);
    let drained = stalled.sent();
    assert_eq!(drained[0], payload, "high priority drains first");
    assert!(drained[1].contains(r#""seq":1"#), "oldest surviving low follows");
}
