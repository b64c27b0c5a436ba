//! Liquidation feed client
//!
//! One tokio task owns the upstream connection and drives the session state
//! machine: connect with timeout, stream with ping/pong keepalive, reconnect
//! with capped exponential backoff. Normalized events are published onto a
//! broadcast channel; consumers subscribe and drain at their own pace.
//!
//! The upstream subscription is venue-wide, so symbol selection is a
//! client-side filter that can be mutated without touching the connection.

use std::{
    collections::HashSet,
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc,
    },
    time::Duration,
};

use anyhow::Result;
use futures_util::{SinkExt, StreamExt};
use parking_lot::{Mutex, RwLock};
use tokio::{
    sync::{broadcast, Notify},
    task::JoinHandle,
};
use tokio_tungstenite::{
    connect_async,
    tungstenite::protocol::{frame::coding::CloseCode, CloseFrame, Message},
};
use tracing::{debug, error, info, warn};

use super::{
    binance,
    session::{
        ConnectionStatus, FeedConfig, FeedSession, FeedState, HeartbeatAction, HeartbeatMonitor,
        TransitionReason,
    },
};
use crate::models::LiquidationEvent;

/// Client for the exchange-wide liquidation stream.
///
/// Construct with [`LiquidationFeed::new`], wrap in an `Arc`, then
/// [`start`](Self::start). All control methods are safe to call from any
/// task, including while the connection task is mid-reconnect.
#[derive(Debug)]
pub struct LiquidationFeed {
    session: FeedSession,
    filter: RwLock<HashSet<String>>,
    event_tx: broadcast::Sender<LiquidationEvent>,
    running: AtomicBool,
    shutdown: Notify,
    task: Mutex<Option<JoinHandle<()>>>,
}

impl LiquidationFeed {
    pub fn new(config: FeedConfig) -> Self {
        let (event_tx, _rx) = broadcast::channel(config.channel_capacity);

        Self {
            session: FeedSession::new(config),
            filter: RwLock::new(HashSet::new()),
            event_tx,
            running: AtomicBool::new(false),
            shutdown: Notify::new(),
            task: Mutex::new(None),
        }
    }

    /// New receiver for the normalized event stream.
    pub fn subscribe(&self) -> broadcast::Receiver<LiquidationEvent> {
        self.event_tx.subscribe()
    }

    /// Start the connection task with an initial symbol filter.
    ///
    /// No-op (with a warning) if the task is already running.
    pub fn start(self: &Arc<Self>, symbols: &[String]) {
        let mut task = self.task.lock();
        if task.as_ref().map(|t| !t.is_finished()).unwrap_or(false) {
            warn!("feed task already running");
            return;
        }

        {
            let mut filter = self.filter.write();
            filter.clear();
            for s in symbols {
                filter.insert(s.to_uppercase());
            }
        }

        self.running.store(true, Ordering::SeqCst);
        self.session
            .transition(FeedState::Connecting, TransitionReason::Started);

        let feed = self.clone();
        *task = Some(tokio::spawn(async move { feed.feed_loop().await }));

        info!(symbols = symbols.len(), "liquidation_feed_started");
    }

    /// Request shutdown: stops reconnecting, interrupts any backoff sleep,
    /// and lets the task close the transport with a normal-closure code.
    /// Safe to call multiple times and from outside the connection task.
    pub fn stop(&self) {
        if !self.running.swap(false, Ordering::SeqCst) {
            return;
        }

        self.session
            .transition(FeedState::Shutdown, TransitionReason::ShutdownRequested);
        self.shutdown.notify_waiters();

        info!(
            metrics = %self.session.metrics().summary(),
            "liquidation_feed_stopped"
        );
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }

    pub fn is_connected(&self) -> bool {
        self.session.state() == FeedState::Streaming
    }

    pub fn state(&self) -> FeedState {
        self.session.state()
    }

    pub fn status(&self) -> ConnectionStatus {
        self.session.status()
    }

    /// Add symbols to the filter without restarting the connection.
    pub fn add_symbols(&self, symbols: &[String]) {
        let mut filter = self.filter.write();
        for s in symbols {
            filter.insert(s.to_uppercase());
        }
    }

    /// Remove symbols from the filter without restarting the connection.
    pub fn remove_symbols(&self, symbols: &[String]) {
        let mut filter = self.filter.write();
        for s in symbols {
            filter.remove(&s.to_uppercase());
        }
    }

    /// Current filter contents, sorted for stable display.
    pub fn filter_symbols(&self) -> Vec<String> {
        let mut symbols: Vec<String> = self.filter.read().iter().cloned().collect();
        symbols.sort();
        symbols
    }

    /// Main loop: drive the state machine until shutdown.
    async fn feed_loop(self: Arc<Self>) {
        while self.running.load(Ordering::Relaxed) {
            match self.session.state() {
                FeedState::Connecting | FeedState::Streaming => {
                    if let Err(e) = self.run_connection().await {
                        if self.running.load(Ordering::Relaxed) {
                            error!(error = %e, "connection_error");
                        }
                    }
                }
                FeedState::Reconnecting => {
                    let backoff = self.session.next_backoff();
                    info!(
                        backoff_ms = backoff.as_millis() as u64,
                        attempt = self.session.backoff_attempt(),
                        "reconnect_backoff"
                    );
                    tokio::select! {
                        _ = tokio::time::sleep(backoff) => {}
                        _ = self.shutdown.notified() => {}
                    }
                    if self.running.load(Ordering::Relaxed) {
                        self.session
                            .transition(FeedState::Connecting, TransitionReason::Started);
                    }
                }
                FeedState::Idle => {
                    self.session
                        .transition(FeedState::Connecting, TransitionReason::Started);
                }
                FeedState::Shutdown => break,
            }
        }

        if self.session.state() != FeedState::Shutdown {
            self.session
                .transition(FeedState::Shutdown, TransitionReason::ShutdownRequested);
        }
    }

    /// Run a single connection lifecycle. Every error path transitions the
    /// session to `Reconnecting` before returning.
    async fn run_connection(&self) -> Result<()> {
        let url = self.session.config().url.clone();
        debug!(url = %url, "connecting");

        let connect_result =
            tokio::time::timeout(self.session.connect_timeout(), connect_async(&url)).await;

        let (ws_stream, _response) = match connect_result {
            Ok(Ok((ws, resp))) => (ws, resp),
            Ok(Err(e)) => {
                self.session
                    .transition(FeedState::Reconnecting, TransitionReason::ConnectFailed);
                return Err(e.into());
            }
            Err(_) => {
                self.session
                    .transition(FeedState::Reconnecting, TransitionReason::ConnectTimeout);
                return Err(anyhow::anyhow!("connect timeout"));
            }
        };

        // The stream URL is the whole subscription for venue-wide streams;
        // no subscribe handshake to wait for.
        self.session
            .transition(FeedState::Streaming, TransitionReason::ConnectSuccess);

        let (mut write, mut read) = ws_stream.split();
        let mut heartbeat = HeartbeatMonitor::new(self.session.config());
        let mut heartbeat_check = tokio::time::interval(Duration::from_millis(500));

        loop {
            if !self.running.load(Ordering::Relaxed) {
                let _ = write.send(close_frame()).await;
                return Ok(());
            }

            tokio::select! {
                msg = read.next() => {
                    match msg {
                        Some(Ok(Message::Text(text))) => {
                            self.handle_frame(&text);
                        }
                        Some(Ok(Message::Ping(payload))) => {
                            let _ = write.send(Message::Pong(payload)).await;
                        }
                        Some(Ok(Message::Pong(_))) => {
                            heartbeat.record_pong_received();
                        }
                        Some(Ok(Message::Close(frame))) => {
                            info!(?frame, "server_close");
                            self.session.transition(FeedState::Reconnecting, TransitionReason::ServerClose);
                            return Err(anyhow::anyhow!("server closed connection"));
                        }
                        Some(Err(e)) => {
                            error!(error = %e, "ws_error");
                            self.session.transition(FeedState::Reconnecting, TransitionReason::NetworkError);
                            return Err(e.into());
                        }
                        None => {
                            warn!("stream_ended");
                            self.session.transition(FeedState::Reconnecting, TransitionReason::StreamEnded);
                            return Err(anyhow::anyhow!("stream ended"));
                        }
                        _ => {}
                    }
                }

                _ = heartbeat_check.tick() => {
                    match heartbeat.check() {
                        HeartbeatAction::Ok => {}
                        HeartbeatAction::SendPing => {
                            if let Err(e) = write.send(Message::Ping(Vec::new())).await {
                                warn!(error = %e, "ping_send_failed");
                            } else {
                                heartbeat.record_ping_sent();
                            }
                        }
                        HeartbeatAction::PongTimeout => {
                            warn!("pong_timeout");
                            self.session.transition(FeedState::Reconnecting, TransitionReason::PongTimeout);
                            return Err(anyhow::anyhow!("pong timeout"));
                        }
                    }
                }

                _ = self.shutdown.notified() => {
                    let _ = write.send(close_frame()).await;
                    return Ok(());
                }
            }
        }
    }

    /// Parse one text frame, apply the symbol filter, publish on success.
    /// Parse failures increment a counter and never touch the connection.
    fn handle_frame(&self, raw: &str) {
        let metrics = self.session.metrics();
        metrics.record_message();

        let event = match binance::parse_force_order(raw).and_then(|m| m.into_event()) {
            Ok(event) => event,
            Err(e) => {
                metrics.record_parse_error();
                debug!(error = %e, "frame_parse_error");
                return;
            }
        };

        // Filter entries and event symbols are both uppercased, which makes
        // the membership test case-insensitive.
        if !self.filter.read().contains(&event.symbol) {
            metrics.record_event_filtered();
            return;
        }

        metrics.record_event_published(event.timestamp);
        // Send fails only when no receiver is subscribed; the stream is
        // droppable in that case.
        let _ = self.event_tx.send(event);
    }

    #[cfg(test)]
    fn task_finished(&self) -> bool {
        self.task
            .lock()
            .as_ref()
            .map(|t| t.is_finished())
            .unwrap_or(true)
    }
}

fn close_frame() -> Message {
    Message::Close(Some(CloseFrame {
        code: CloseCode::Normal,
        reason: "shutdown".into(),
    }))
}
