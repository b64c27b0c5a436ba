use axum::{
    extract::{
        ws::{Message, WebSocket, WebSocketUpgrade},
        Path, Query, State,
    },
    http::StatusCode,
    response::{IntoResponse, Json, Response},
    routing::get,
    Router,
};
use chrono::Utc;
use futures_util::{stream::SplitSink, SinkExt, StreamExt};
use serde::{Deserialize, Serialize};
use serde_json::json;
use std::sync::Arc;
use tracing::info;

use crate::broadcast::{
    BroadcastManager, BroadcastStats, SubscriberId, SubscriberStats, SubscriberTransport,
};
use crate::feed::{ConnectionStatus, LiquidationFeed};
use crate::models::{LiquidationEvent, LookbackWindow, WsServerMessage};
use crate::store::{Heatmap, HeatmapParams, LeverageTierStat, LiquidationStore, StoreStats};

/// Default kernel width when the query omits `bandwidth`: 0.5% of the
/// reference price.
const DEFAULT_BANDWIDTH_PCT: f64 = 0.005;
/// Default half-extent of the price axis when the query omits `range`: 5%
/// of the reference price.
const DEFAULT_RANGE_PCT: f64 = 0.05;

/// Shared application state
#[derive(Clone)]
pub struct AppState {
    pub store: Arc<LiquidationStore>,
    pub feed: Arc<LiquidationFeed>,
    pub broadcast: Arc<BroadcastManager>,
}

/// Create the API router
pub fn create_router(
    store: Arc<LiquidationStore>,
    feed: Arc<LiquidationFeed>,
    broadcast: Arc<BroadcastManager>,
) -> Router {
    let state = AppState {
        store,
        feed,
        broadcast,
    };

    Router::new()
        .route("/health", get(health_check))
        .route("/api/status", get(get_status))
        .route("/api/symbols", get(get_symbols).post(update_symbols))
        .route("/api/liquidations/:symbol", get(get_liquidations))
        .route("/api/heatmap/:symbol", get(get_heatmap))
        .route("/api/leverage/:symbol", get(get_leverage))
        .route("/ws", get(websocket_handler))
        .with_state(state)
}

// ===== Route Handlers =====

/// Health check endpoint
async fn health_check() -> Json<HealthResponse> {
    Json(HealthResponse {
        status: "healthy".to_string(),
        version: env!("CARGO_PKG_VERSION").to_string(),
    })
}

/// Full pipeline status: feed connection, store counters, broadcast health
async fn get_status(State(state): State<AppState>) -> Json<StatusResponse> {
    Json(StatusResponse {
        feed: state.feed.status(),
        store: state.store.stats(),
        broadcast: state.broadcast.stats(),
        subscribers: state.broadcast.subscriber_stats(),
    })
}

/// Symbols currently holding data plus the active feed filter
async fn get_symbols(State(state): State<AppState>) -> Json<SymbolsResponse> {
    let symbols = state.store.tracked_symbols();
    Json(SymbolsResponse {
        count: symbols.len(),
        symbols,
        filter: state.feed.filter_symbols(),
    })
}

/// Adjust the feed's symbol filter at runtime, without reconnecting
async fn update_symbols(
    State(state): State<AppState>,
    Json(update): Json<SymbolUpdate>,
) -> Json<SymbolsResponse> {
    if !update.add.is_empty() {
        state.feed.add_symbols(&update.add);
    }
    if !update.remove.is_empty() {
        state.feed.remove_symbols(&update.remove);
    }

    let symbols = state.store.tracked_symbols();
    Json(SymbolsResponse {
        count: symbols.len(),
        symbols,
        filter: state.feed.filter_symbols(),
    })
}

/// Recent liquidations for one symbol within a lookback window
async fn get_liquidations(
    State(state): State<AppState>,
    Path(symbol): Path<String>,
    Query(params): Query<WindowQuery>,
) -> Result<Json<EventsResponse>, ApiError> {
    let window = parse_window(params.window.as_deref())?;
    let events = state.store.events(&symbol, window);

    Ok(Json(EventsResponse {
        symbol: symbol.to_uppercase(),
        window: window.as_str(),
        count: events.len(),
        events,
    }))
}

/// Kernel-smoothed liquidation heatmap for one symbol
async fn get_heatmap(
    State(state): State<AppState>,
    Path(symbol): Path<String>,
    Query(params): Query<HeatmapQuery>,
) -> Result<Json<HeatmapResponse>, ApiError> {
    let window = parse_window(params.window.as_deref())?;
    for (name, value) in [
        ("bandwidth", params.bandwidth),
        ("range", params.range),
        ("reference", params.reference),
    ] {
        if let Some(v) = value {
            // Negated comparison so NaN fails validation too
            if !(v > 0.0) {
                return Err(ApiError::BadRequest(format!("{name} must be positive")));
            }
        }
    }

    let kernel = resolve_heatmap_params(&params, state.store.last_price(&symbol));
    Ok(Json(HeatmapResponse {
        symbol: symbol.to_uppercase(),
        window: window.as_str(),
        heatmap: state.store.heatmap(&symbol, window, &kernel),
    }))
}

/// Leverage tier distribution for one symbol
async fn get_leverage(
    State(state): State<AppState>,
    Path(symbol): Path<String>,
    Query(params): Query<WindowQuery>,
) -> Result<Json<LeverageResponse>, ApiError> {
    let window = parse_window(params.window.as_deref())?;

    Ok(Json(LeverageResponse {
        symbol: symbol.to_uppercase(),
        window: window.as_str(),
        tiers: state.store.leverage_distribution(&symbol, window),
    }))
}

fn parse_window(raw: Option<&str>) -> Result<LookbackWindow, ApiError> {
    match raw {
        None => Ok(LookbackWindow::OneHour),
        Some(raw) => raw
            .parse()
            .map_err(|e: crate::models::WindowParseError| ApiError::BadRequest(e.to_string())),
    }
}

/// Resolve kernel parameters, scaling omitted knobs from the reference
/// price so one set of defaults works across price regimes.
fn resolve_heatmap_params(query: &HeatmapQuery, last_price: Option<f64>) -> HeatmapParams {
    let reference = query.reference.or(last_price);
    HeatmapParams {
        bandwidth: query
            .bandwidth
            .or(reference.map(|r| r * DEFAULT_BANDWIDTH_PCT))
            .unwrap_or(0.0),
        price_range: query
            .range
            .or(reference.map(|r| r * DEFAULT_RANGE_PCT))
            .unwrap_or(0.0),
        reference_price: reference,
    }
}

// ===== WebSocket =====

/// WebSocket endpoint for the live liquidation stream
async fn websocket_handler(ws: WebSocketUpgrade, State(state): State<AppState>) -> Response {
    ws.on_upgrade(move |socket| handle_socket(socket, state))
}

/// Per-connection glue: the write half becomes a broadcast transport
/// drained by the manager; this task keeps the read half for client
/// pings and disconnect detection.
async fn handle_socket(socket: WebSocket, state: AppState) {
    let (sender, mut receiver) = socket.split();
    let transport = Arc::new(WsTransport {
        sender: tokio::sync::Mutex::new(sender),
    });
    let id = state.broadcast.register(transport);
    info!(subscriber = %id, "ws_client_connected");

    // One stats frame up front so dashboards render before the first event
    if let Ok(payload) = serde_json::to_string(&stats_message(&state.store, &state.feed)) {
        state.broadcast.safe_send(id, payload);
    }

    while let Some(Ok(message)) = receiver.next().await {
        match message {
            Message::Text(text) => handle_client_text(&state, id, &text),
            Message::Close(_) => break,
            _ => {}
        }
    }

    state.broadcast.unregister(id);
    info!(subscriber = %id, "ws_client_disconnected");
}

/// Client messages: both `{"type":"ping"}` and legacy plain-text `ping`
/// get a pong queued behind whatever is already in flight.
fn handle_client_text(state: &AppState, id: SubscriberId, text: &str) {
    let parsed: Option<serde_json::Value> = serde_json::from_str(text).ok();
    let is_ping = match &parsed {
        Some(v) => v.get("type").and_then(|t| t.as_str()) == Some("ping"),
        None => text == "ping",
    };
    if !is_ping {
        return;
    }

    // Echo the client timestamp when present so clients can measure latency
    let timestamp = parsed
        .as_ref()
        .and_then(|v| v.get("timestamp"))
        .and_then(|t| t.as_i64())
        .unwrap_or_else(|| Utc::now().timestamp_millis());

    let pong = WsServerMessage::Pong { timestamp };
    if let Ok(payload) = serde_json::to_string(&pong) {
        state.broadcast.safe_send(id, payload);
    }
}

/// Snapshot stats frame, also pushed periodically to every subscriber.
pub fn stats_message(store: &LiquidationStore, feed: &LiquidationFeed) -> WsServerMessage {
    let stats = store.stats();
    WsServerMessage::Stats {
        connected: feed.is_connected(),
        tracked_symbols: stats.symbols,
        total_events: stats.total_events as u64,
        timestamp: Utc::now().timestamp_millis(),
    }
}

/// Adapter from the broadcast transport seam onto an axum WebSocket sink.
struct WsTransport {
    sender: tokio::sync::Mutex<SplitSink<WebSocket, Message>>,
}

#[async_trait::async_trait]
impl SubscriberTransport for WsTransport {
    // The sink applies backpressure inside send itself, so readiness is
    // always immediate here.
    fn is_ready(&self) -> bool {
        true
    }

    async fn send(&self, payload: &str) -> anyhow::Result<()> {
        self.sender
            .lock()
            .await
            .send(Message::Text(payload.to_string()))
            .await
            .map_err(|e| anyhow::anyhow!("ws send failed: {e}"))
    }
}

// ===== Request/Response Types =====

#[derive(Deserialize)]
struct WindowQuery {
    /// Lookback window label: "1h", "4h", or "24h" (default "1h")
    window: Option<String>,
}

#[derive(Deserialize)]
struct HeatmapQuery {
    window: Option<String>,
    /// Smoothing kernel width in quote currency
    bandwidth: Option<f64>,
    /// Half-extent of the price axis around the reference
    range: Option<f64>,
    /// Price to center the grid on (default: last observed liquidation)
    reference: Option<f64>,
}

#[derive(Deserialize)]
struct SymbolUpdate {
    #[serde(default)]
    add: Vec<String>,
    #[serde(default)]
    remove: Vec<String>,
}

#[derive(Serialize)]
struct HealthResponse {
    status: String,
    version: String,
}

#[derive(Serialize)]
struct StatusResponse {
    feed: ConnectionStatus,
    store: StoreStats,
    broadcast: BroadcastStats,
    subscribers: Vec<SubscriberStats>,
}

#[derive(Serialize)]
struct SymbolsResponse {
    count: usize,
    symbols: Vec<String>,
    filter: Vec<String>,
}

#[derive(Serialize)]
struct EventsResponse {
    symbol: String,
    window: &'static str,
    count: usize,
    events: Vec<LiquidationEvent>,
}

#[derive(Serialize)]
struct HeatmapResponse {
    symbol: String,
    window: &'static str,
    #[serde(flatten)]
    heatmap: Heatmap,
}

#[derive(Serialize)]
struct LeverageResponse {
    symbol: String,
    window: &'static str,
    tiers: Vec<LeverageTierStat>,
}

// ===== Error Handling =====

#[derive(Debug)]
enum ApiError {
    BadRequest(String),
    #[allow(dead_code)] // Reserved for resource-style endpoints
    NotFound(String),
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let (status, message) = match self {
            ApiError::BadRequest(msg) => (StatusCode::BAD_REQUEST, msg),
            ApiError::NotFound(msg) => (StatusCode::NOT_FOUND, msg),
        };

        let body = Json(json!({
            "error": message,
        }));

        (status, body).into_response()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::broadcast::BroadcastConfig;
    use crate::feed::FeedConfig;
    use crate::models::Side;
    use crate::store::heatmap::MAX_BUCKETS_PER_SIDE;
    use axum::body::Body;
    use axum::http::Request;
    use tower::ServiceExt;

    fn test_app() -> Router {
        let store = Arc::new(LiquidationStore::default());
        let feed = Arc::new(LiquidationFeed::new(FeedConfig::default()));
        let broadcast = Arc::new(BroadcastManager::new(BroadcastConfig::default()));
        create_router(store, feed, broadcast)
    }

    #[tokio::test]
    async fn test_health_endpoint_responds() {
        let response = test_app()
            .oneshot(
                Request::builder()
                    .uri("/health")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();

        assert_eq!(response.status(), StatusCode::OK);
    }

    #[tokio::test]
    async fn test_invalid_window_is_rejected() {
        let response = test_app()
            .oneshot(
                Request::builder()
                    .uri("/api/liquidations/BTCUSDT?window=7d")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();

        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
    }

    #[tokio::test]
    async fn test_unknown_symbol_returns_empty_payload() {
        let response = test_app()
            .oneshot(
                Request::builder()
                    .uri("/api/liquidations/NOPEUSDT")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();

        assert_eq!(response.status(), StatusCode::OK);
        let body = axum::body::to_bytes(response.into_body(), usize::MAX)
            .await
            .unwrap();
        let json: serde_json::Value = serde_json::from_slice(&body).unwrap();
        assert_eq!(json["count"], 0);
    }

    #[tokio::test]
    async fn test_extreme_heatmap_ratio_returns_bounded_grid() {
        let store = Arc::new(LiquidationStore::default());
        store.add_event(LiquidationEvent::new(
            "BTCUSDT",
            Side::Sell,
            50_000.0,
            2.0,
            Utc::now(),
        ));
        let feed = Arc::new(LiquidationFeed::new(FeedConfig::default()));
        let broadcast = Arc::new(BroadcastManager::new(BroadcastConfig::default()));
        let app = create_router(store, feed, broadcast);

        let response = app
            .oneshot(
                Request::builder()
                    .uri("/api/heatmap/BTCUSDT?bandwidth=1e-300&range=1")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();

        assert_eq!(response.status(), StatusCode::OK);
        let body = axum::body::to_bytes(response.into_body(), usize::MAX)
            .await
            .unwrap();
        let json: serde_json::Value = serde_json::from_slice(&body).unwrap();
        let buckets = json["buckets"].as_array().unwrap();
        assert!(buckets.len() <= 2 * MAX_BUCKETS_PER_SIDE as usize + 1);
    }

    #[test]
    fn test_window_parsing() {
        assert_eq!(parse_window(None).unwrap(), LookbackWindow::OneHour);
        assert_eq!(
            parse_window(Some("24h")).unwrap(),
            LookbackWindow::TwentyFourHours
        );
        assert!(parse_window(Some("7d")).is_err());
    }

    #[test]
    fn test_heatmap_defaults_scale_with_reference() {
        let query = HeatmapQuery {
            window: None,
            bandwidth: None,
            range: None,
            reference: None,
        };
        let params = resolve_heatmap_params(&query, Some(40_000.0));
        assert!((params.bandwidth - 200.0).abs() < 1e-9);
        assert!((params.price_range - 2_000.0).abs() < 1e-9);
        assert_eq!(params.reference_price, Some(40_000.0));
    }

    #[test]
    fn test_explicit_heatmap_params_win_over_defaults() {
        let query = HeatmapQuery {
            window: None,
            bandwidth: Some(1.5),
            range: Some(10.0),
            reference: Some(100.0),
        };
        let params = resolve_heatmap_params(&query, Some(40_000.0));
        assert_eq!(params.bandwidth, 1.5);
        assert_eq!(params.price_range, 10.0);
        assert_eq!(params.reference_price, Some(100.0));
    }

    #[test]
    fn test_missing_reference_degrades_to_zeroed_kernel() {
        let query = HeatmapQuery {
            window: None,
            bandwidth: None,
            range: None,
            reference: None,
        };
        let params = resolve_heatmap_params(&query, None);
        assert_eq!(params.bandwidth, 0.0);
        assert_eq!(params.price_range, 0.0);
        assert!(params.reference_price.is_none());
    }

    #[test]
    fn test_bad_request_maps_to_400() {
        let resp = ApiError::BadRequest("nope".to_string()).into_response();
        assert_eq!(resp.status(), StatusCode::BAD_REQUEST);
    }
}
