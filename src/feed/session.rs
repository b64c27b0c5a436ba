//! Liquidation feed session management
//!
//! Fault-tolerant connection lifecycle for the upstream liquidation stream:
//! - State machine with well-defined transitions
//! - Exponential backoff, capped and reset on successful connect
//! - Heartbeat monitoring (ping/pong)
//! - Atomic counters exposed as a cloneable status snapshot
//!
//! A quiet feed is a valid market state: liquidations can stop for minutes
//! on end, so connection health is judged by ping/pong only, never by data
//! arrival.

use std::{
    sync::atomic::{AtomicI64, AtomicU64, Ordering},
    time::{Duration, Instant},
};

use chrono::{DateTime, TimeZone, Utc};
use parking_lot::{Mutex, RwLock};
use serde::Serialize;
use tracing::info;

// =============================================================================
// CONFIGURATION
// =============================================================================

/// Feed connection configuration
#[derive(Debug, Clone)]
pub struct FeedConfig {
    /// Upstream stream URL (venue-wide liquidation orders).
    pub url: String,

    // Backoff parameters
    pub backoff_base_ms: u64,
    pub backoff_max_ms: u64,

    // Connection timeouts
    pub connect_timeout_ms: u64,

    // Heartbeat parameters
    pub ping_interval_ms: u64,
    pub pong_timeout_ms: u64,

    /// Capacity of the event broadcast channel.
    pub channel_capacity: usize,
}

impl Default for FeedConfig {
    fn default() -> Self {
        Self {
            url: "wss://fstream.binance.com/ws/!forceOrder@arr".to_string(),

            // Backoff: 100ms base, doubling, 30s cap
            backoff_base_ms: 100,
            backoff_max_ms: 30_000,

            // Timeouts
            connect_timeout_ms: 10_000,

            // Heartbeat
            ping_interval_ms: 30_000,
            pong_timeout_ms: 10_000,

            channel_capacity: 1024,
        }
    }
}

impl FeedConfig {
    /// Load from environment with defaults
    pub fn from_env() -> Self {
        let mut config = Self::default();

        if let Ok(v) = std::env::var("LIQ_FEED_URL") {
            if !v.is_empty() {
                config.url = v;
            }
        }
        if let Ok(v) = std::env::var("LIQ_FEED_BACKOFF_BASE_MS") {
            config.backoff_base_ms = v.parse().unwrap_or(config.backoff_base_ms);
        }
        if let Ok(v) = std::env::var("LIQ_FEED_BACKOFF_MAX_MS") {
            config.backoff_max_ms = v.parse().unwrap_or(config.backoff_max_ms);
        }
        if let Ok(v) = std::env::var("LIQ_FEED_CONNECT_TIMEOUT_MS") {
            config.connect_timeout_ms = v.parse().unwrap_or(config.connect_timeout_ms);
        }
        if let Ok(v) = std::env::var("LIQ_FEED_PING_INTERVAL_MS") {
            config.ping_interval_ms = v.parse().unwrap_or(config.ping_interval_ms);
        }
        if let Ok(v) = std::env::var("LIQ_FEED_PONG_TIMEOUT_MS") {
            config.pong_timeout_ms = v.parse().unwrap_or(config.pong_timeout_ms);
        }

        config
    }
}

// =============================================================================
// STATE MACHINE
// =============================================================================

/// Connection state machine states
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FeedState {
    /// No connection attempt made yet
    Idle,
    /// TCP + TLS + WebSocket upgrade in progress
    Connecting,
    /// Connected and receiving the liquidation stream
    Streaming,
    /// Connection lost, waiting out the backoff timer
    Reconnecting,
    /// Graceful shutdown requested
    Shutdown,
}

impl FeedState {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Idle => "IDLE",
            Self::Connecting => "CONNECTING",
            Self::Streaming => "STREAMING",
            Self::Reconnecting => "RECONNECTING",
            Self::Shutdown => "SHUTDOWN",
        }
    }
}

impl std::fmt::Display for FeedState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Reason for state transition (for logging/metrics)
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransitionReason {
    Started,
    ConnectSuccess,
    ConnectTimeout,
    ConnectFailed,
    PongTimeout,
    ServerClose,
    NetworkError,
    StreamEnded,
    ShutdownRequested,
}

impl std::fmt::Display for TransitionReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Started => write!(f, "started"),
            Self::ConnectSuccess => write!(f, "connect_ok"),
            Self::ConnectTimeout => write!(f, "connect_timeout"),
            Self::ConnectFailed => write!(f, "connect_failed"),
            Self::PongTimeout => write!(f, "pong_timeout"),
            Self::ServerClose => write!(f, "server_close"),
            Self::NetworkError => write!(f, "network_error"),
            Self::StreamEnded => write!(f, "stream_ended"),
            Self::ShutdownRequested => write!(f, "shutdown"),
        }
    }
}

// =============================================================================
// EXPONENTIAL BACKOFF
// =============================================================================

/// Backoff calculator: `min(base * 2^attempt, max)`, no jitter.
///
/// The schedule is deterministic and non-decreasing so operators can read a
/// reconnect trace and know exactly which attempt they are looking at.
#[derive(Debug)]
pub struct BackoffCalculator {
    base_ms: u64,
    max_ms: u64,
    attempt: u32,
}

impl BackoffCalculator {
    pub fn new(config: &FeedConfig) -> Self {
        Self {
            base_ms: config.backoff_base_ms,
            max_ms: config.backoff_max_ms,
            attempt: 0,
        }
    }

    /// Compute the delay for the current attempt, then advance the counter.
    pub fn next_backoff(&mut self) -> Duration {
        let factor = 2u64.saturating_pow(self.attempt);
        let delay_ms = self.base_ms.saturating_mul(factor).min(self.max_ms);

        self.attempt += 1;

        Duration::from_millis(delay_ms)
    }

    /// Reset on successful connection
    pub fn reset(&mut self) {
        self.attempt = 0;
    }

    /// Current attempt number
    pub fn attempt(&self) -> u32 {
        self.attempt
    }
}

// =============================================================================
// HEARTBEAT MONITOR
// =============================================================================

/// Result of heartbeat check
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HeartbeatAction {
    /// Everything OK, continue streaming
    Ok,
    /// Time to send a ping
    SendPing,
    /// Pong not received in time
    PongTimeout,
}

/// Ping/pong bookkeeping for connection health.
///
/// One monitor per connection; construct fresh (or `reset`) after each
/// successful connect.
#[derive(Debug)]
pub struct HeartbeatMonitor {
    ping_interval: Duration,
    pong_timeout: Duration,
    last_ping_sent: Option<Instant>,
    awaiting_pong: bool,
}

impl HeartbeatMonitor {
    pub fn new(config: &FeedConfig) -> Self {
        Self {
            ping_interval: Duration::from_millis(config.ping_interval_ms),
            pong_timeout: Duration::from_millis(config.pong_timeout_ms),
            last_ping_sent: None,
            awaiting_pong: false,
        }
    }

    /// Reset state for a new connection
    pub fn reset(&mut self) {
        self.last_ping_sent = None;
        self.awaiting_pong = false;
    }

    /// Record that we sent a ping
    pub fn record_ping_sent(&mut self) {
        self.last_ping_sent = Some(Instant::now());
        self.awaiting_pong = true;
    }

    /// Record that we received a pong
    pub fn record_pong_received(&mut self) {
        self.awaiting_pong = false;
    }

    /// Check heartbeat status and return required action
    pub fn check(&mut self) -> HeartbeatAction {
        let now = Instant::now();

        if self.awaiting_pong {
            if let Some(ping_time) = self.last_ping_sent {
                if now.duration_since(ping_time) > self.pong_timeout {
                    return HeartbeatAction::PongTimeout;
                }
            }
            return HeartbeatAction::Ok;
        }

        let should_ping = match self.last_ping_sent {
            None => true,
            Some(ping_time) => now.duration_since(ping_time) > self.ping_interval,
        };

        if should_ping {
            return HeartbeatAction::SendPing;
        }

        HeartbeatAction::Ok
    }

    /// Time until the next required heartbeat check
    pub fn time_until_next_check(&self) -> Duration {
        let now = Instant::now();

        // If awaiting pong, wake at the timeout deadline
        if self.awaiting_pong {
            if let Some(ping_time) = self.last_ping_sent {
                let elapsed = now.duration_since(ping_time);
                if elapsed < self.pong_timeout {
                    return self.pong_timeout - elapsed;
                }
            }
            return Duration::from_millis(100);
        }

        let until_ping = match self.last_ping_sent {
            None => Duration::ZERO,
            Some(ping_time) => {
                let elapsed = now.duration_since(ping_time);
                if elapsed < self.ping_interval {
                    self.ping_interval - elapsed
                } else {
                    Duration::ZERO
                }
            }
        };

        until_ping.max(Duration::from_millis(100))
    }
}

// =============================================================================
// FEED METRICS
// =============================================================================

/// Feed counters for monitoring
#[derive(Debug, Default)]
pub struct FeedMetrics {
    pub connections_attempted: AtomicU64,
    pub connections_succeeded: AtomicU64,
    pub reconnections: AtomicU64,
    pub pong_timeouts: AtomicU64,
    pub messages_received: AtomicU64,
    pub parse_errors: AtomicU64,
    pub events_published: AtomicU64,
    pub events_filtered: AtomicU64,
    pub total_downtime_ms: AtomicU64,
    /// Epoch millis of the last published event, 0 when none yet.
    pub last_event_unix_ms: AtomicI64,
}

impl FeedMetrics {
    pub fn new() -> Self {
        Self::default()
    }

    #[inline]
    pub fn record_connect_attempt(&self) {
        self.connections_attempted.fetch_add(1, Ordering::Relaxed);
    }

    #[inline]
    pub fn record_connect_success(&self) {
        self.connections_succeeded.fetch_add(1, Ordering::Relaxed);
    }

    #[inline]
    pub fn record_reconnection(&self) {
        self.reconnections.fetch_add(1, Ordering::Relaxed);
    }

    #[inline]
    pub fn record_pong_timeout(&self) {
        self.pong_timeouts.fetch_add(1, Ordering::Relaxed);
    }

    #[inline]
    pub fn record_message(&self) {
        self.messages_received.fetch_add(1, Ordering::Relaxed);
    }

    #[inline]
    pub fn record_parse_error(&self) {
        self.parse_errors.fetch_add(1, Ordering::Relaxed);
    }

    #[inline]
    pub fn record_event_published(&self, timestamp: DateTime<Utc>) {
        self.events_published.fetch_add(1, Ordering::Relaxed);
        self.last_event_unix_ms
            .store(timestamp.timestamp_millis(), Ordering::Relaxed);
    }

    #[inline]
    pub fn record_event_filtered(&self) {
        self.events_filtered.fetch_add(1, Ordering::Relaxed);
    }

    #[inline]
    pub fn add_downtime(&self, duration: Duration) {
        self.total_downtime_ms
            .fetch_add(duration.as_millis() as u64, Ordering::Relaxed);
    }

    /// Summary string for logging
    pub fn summary(&self) -> String {
        format!(
            "connects={}/{} reconnects={} pong_timeouts={} messages={} parse_errors={} published={} filtered={} downtime_ms={}",
            self.connections_succeeded.load(Ordering::Relaxed),
            self.connections_attempted.load(Ordering::Relaxed),
            self.reconnections.load(Ordering::Relaxed),
            self.pong_timeouts.load(Ordering::Relaxed),
            self.messages_received.load(Ordering::Relaxed),
            self.parse_errors.load(Ordering::Relaxed),
            self.events_published.load(Ordering::Relaxed),
            self.events_filtered.load(Ordering::Relaxed),
            self.total_downtime_ms.load(Ordering::Relaxed),
        )
    }
}

// =============================================================================
// CONNECTION STATUS
// =============================================================================

/// Point-in-time snapshot of the feed connection, safe to hand to callers.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ConnectionStatus {
    pub connected: bool,
    pub state: &'static str,
    pub url: String,
    pub reconnect_attempt: u32,
    pub reconnections: u64,
    pub messages_received: u64,
    pub parse_errors: u64,
    pub events_published: u64,
    pub events_filtered: u64,
    pub last_event_time: Option<DateTime<Utc>>,
}

// =============================================================================
// SESSION
// =============================================================================

/// Shared session coordinator: state, backoff, and counters for one feed.
#[derive(Debug)]
pub struct FeedSession {
    config: FeedConfig,
    state: RwLock<FeedState>,
    backoff: Mutex<BackoffCalculator>,
    metrics: FeedMetrics,
    disconnect_time: Mutex<Option<Instant>>,
}

impl FeedSession {
    pub fn new(config: FeedConfig) -> Self {
        let backoff = BackoffCalculator::new(&config);

        Self {
            config,
            state: RwLock::new(FeedState::Idle),
            backoff: Mutex::new(backoff),
            metrics: FeedMetrics::new(),
            disconnect_time: Mutex::new(None),
        }
    }

    /// Current state
    pub fn state(&self) -> FeedState {
        *self.state.read()
    }

    /// Transition to a new state with a reason
    pub fn transition(&self, new_state: FeedState, reason: TransitionReason) {
        let old_state = {
            let mut state = self.state.write();
            let old = *state;
            *state = new_state;
            old
        };

        match (old_state, new_state) {
            (_, FeedState::Connecting) => {
                self.metrics.record_connect_attempt();
                if old_state == FeedState::Reconnecting {
                    // Track downtime
                    if let Some(disc_time) = *self.disconnect_time.lock() {
                        self.metrics.add_downtime(disc_time.elapsed());
                    }
                }
            }
            (_, FeedState::Streaming) => {
                self.metrics.record_connect_success();
                self.backoff.lock().reset();
            }
            (_, FeedState::Reconnecting) => {
                self.metrics.record_reconnection();
                *self.disconnect_time.lock() = Some(Instant::now());

                if reason == TransitionReason::PongTimeout {
                    self.metrics.record_pong_timeout();
                }
            }
            _ => {}
        }

        // Log transition (cold path, OK to allocate)
        info!(
            from = %old_state,
            to = %new_state,
            reason = %reason,
            "feed_transition"
        );
    }

    /// Next backoff delay, advancing the attempt counter
    pub fn next_backoff(&self) -> Duration {
        self.backoff.lock().next_backoff()
    }

    /// Current backoff attempt number
    pub fn backoff_attempt(&self) -> u32 {
        self.backoff.lock().attempt()
    }

    /// Connection timeout duration
    pub fn connect_timeout(&self) -> Duration {
        Duration::from_millis(self.config.connect_timeout_ms)
    }

    /// Get metrics reference
    pub fn metrics(&self) -> &FeedMetrics {
        &self.metrics
    }

    /// Get config reference
    pub fn config(&self) -> &FeedConfig {
        &self.config
    }

    /// Status snapshot for callers outside the connection task
    pub fn status(&self) -> ConnectionStatus {
        let state = self.state();
        let last_ms = self.metrics.last_event_unix_ms.load(Ordering::Relaxed);
        let last_event_time = if last_ms > 0 {
            Utc.timestamp_millis_opt(last_ms).single()
        } else {
            None
        };

        ConnectionStatus {
            connected: state == FeedState::Streaming,
            state: state.as_str(),
            url: self.config.url.clone(),
            reconnect_attempt: self.backoff_attempt(),
            reconnections: self.metrics.reconnections.load(Ordering::Relaxed),
            messages_received: self.metrics.messages_received.load(Ordering::Relaxed),
            parse_errors: self.metrics.parse_errors.load(Ordering::Relaxed),
            events_published: self.metrics.events_published.load(Ordering::Relaxed),
            events_filtered: self.metrics.events_filtered.load(Ordering::Relaxed),
            last_event_time,
        }
    }
}

// =============================================================================
// TESTS
// =============================================================================
