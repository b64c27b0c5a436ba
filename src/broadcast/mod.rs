//! Priority fan-out to independently paced subscribers.
//!
//! Producers never block: every publish is an enqueue onto a bounded
//! per-subscriber queue, and one drain task per subscriber pushes messages
//! over its transport at whatever pace that transport sustains. A slow or
//! dead subscriber costs at most its own queue.

pub mod queue;

use std::{
    collections::HashMap,
    sync::{
        atomic::{AtomicBool, AtomicU64, Ordering},
        Arc, Weak,
    },
    time::{Duration, Instant},
};

use async_trait::async_trait;
use parking_lot::{Mutex, RwLock};
use serde::Serialize;
use tokio::sync::Notify;
use tracing::debug;
use uuid::Uuid;

pub use queue::{MessagePriority, PushOutcome, QueuedMessage, SubscriberQueue};

// ============================================================================
// TRANSPORT SEAM
// ============================================================================

/// Where drained messages go. The WebSocket handler adapts its sink to
/// this; tests plug in recording fakes.
#[async_trait]
pub trait SubscriberTransport: Send + Sync {
    /// Whether the transport can accept another message right now. Drain
    /// pauses, without discarding anything, while this is false.
    fn is_ready(&self) -> bool;

    /// Deliver one payload. An error marks the subscriber dead.
    async fn send(&self, payload: &str) -> anyhow::Result<()>;
}

pub type SubscriberId = Uuid;

// ============================================================================
// CONFIGURATION
// ============================================================================

#[derive(Debug, Clone)]
pub struct BroadcastConfig {
    /// Shared queue budget per subscriber, across all priority tiers.
    pub queue_capacity: usize,
    /// Poll interval while a transport reports itself not ready.
    pub drain_poll_ms: u64,
}

impl Default for BroadcastConfig {
    fn default() -> Self {
        Self {
            queue_capacity: 256,
            drain_poll_ms: 50,
        }
    }
}

impl BroadcastConfig {
    pub fn from_env() -> Self {
        let defaults = Self::default();
        Self {
            queue_capacity: std::env::var("LIQ_BROADCAST_QUEUE_CAPACITY")
                .ok()
                .and_then(|v| v.parse().ok())
                .unwrap_or(defaults.queue_capacity),
            drain_poll_ms: std::env::var("LIQ_BROADCAST_DRAIN_POLL_MS")
                .ok()
                .and_then(|v| v.parse().ok())
                .unwrap_or(defaults.drain_poll_ms),
        }
    }
}

// ============================================================================
// SUBSCRIBER
// ============================================================================

struct Subscriber {
    queue: Mutex<SubscriberQueue>,
    transport: Arc<dyn SubscriberTransport>,
    /// Wakes the drain task when work arrives or shutdown is requested.
    wake: Notify,
    shutdown: AtomicBool,
    sent: AtomicU64,
    last_sent: Mutex<Option<Instant>>,
}

impl Subscriber {
    fn new(transport: Arc<dyn SubscriberTransport>, capacity: usize) -> Self {
        Self {
            queue: Mutex::new(SubscriberQueue::new(capacity)),
            transport,
            wake: Notify::new(),
            shutdown: AtomicBool::new(false),
            sent: AtomicU64::new(0),
            last_sent: Mutex::new(None),
        }
    }
}

/// Per-subscriber queue health, as exposed on the status endpoint.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SubscriberStats {
    pub id: SubscriberId,
    pub queued: usize,
    pub sent: u64,
    pub enqueued: u64,
    pub evicted: u64,
    pub dropped: u64,
    pub oldest_queued_ms: Option<u64>,
    pub last_sent_ms: Option<u64>,
}

/// Aggregate view across every registered subscriber.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct BroadcastStats {
    pub subscribers: usize,
    pub queued: usize,
    pub sent: u64,
    pub evicted: u64,
    pub dropped: u64,
}

/// Per-call tally of what happened to a fan-out.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct BroadcastOutcome {
    pub queued: usize,
    pub evicted: usize,
    pub dropped: usize,
    /// Target ids that were not registered.
    pub missing: usize,
}

// ============================================================================
// BROADCAST MANAGER
// ============================================================================

pub struct BroadcastManager {
    config: BroadcastConfig,
    subscribers: RwLock<HashMap<SubscriberId, Arc<Subscriber>>>,
}

impl BroadcastManager {
    pub fn new(config: BroadcastConfig) -> Self {
        Self {
            config,
            subscribers: RwLock::new(HashMap::new()),
        }
    }

    /// Register a transport and start its drain task. Returns the handle
    /// used for targeted sends and for unregistering.
    pub fn register(self: &Arc<Self>, transport: Arc<dyn SubscriberTransport>) -> SubscriberId {
        let id = Uuid::new_v4();
        let subscriber = Arc::new(Subscriber::new(transport, self.config.queue_capacity));
        self.subscribers.write().insert(id, subscriber.clone());

        let manager = Arc::downgrade(self);
        let poll = Duration::from_millis(self.config.drain_poll_ms.max(1));
        tokio::spawn(drain_loop(id, subscriber, manager, poll));

        debug!(subscriber = %id, "subscriber_registered");
        id
    }

    /// Remove a subscriber, discard its queue and stop its drain task
    /// within one drain iteration. Safe to call more than once.
    pub fn unregister(&self, id: SubscriberId) {
        let Some(subscriber) = self.subscribers.write().remove(&id) else {
            return;
        };
        subscriber.shutdown.store(true, Ordering::SeqCst);
        subscriber.wake.notify_one();
        subscriber.queue.lock().clear();
        debug!(subscriber = %id, "subscriber_unregistered");
    }

    /// Non-blocking fan-out to a specific set of subscribers. The payload
    /// is shared, not copied, across their queues.
    pub fn smart_broadcast(
        &self,
        ids: &[SubscriberId],
        payload: impl Into<Arc<str>>,
        priority: MessagePriority,
    ) -> BroadcastOutcome {
        let payload: Arc<str> = payload.into();
        let mut outcome = BroadcastOutcome::default();

        let subscribers = self.subscribers.read();
        for id in ids {
            let Some(subscriber) = subscribers.get(id) else {
                outcome.missing += 1;
                continue;
            };
            let result = subscriber
                .queue
                .lock()
                .push(QueuedMessage::new(payload.clone(), priority));
            match result {
                PushOutcome::Queued => outcome.queued += 1,
                PushOutcome::QueuedEvictedLow => {
                    outcome.queued += 1;
                    outcome.evicted += 1;
                }
                PushOutcome::Dropped => {
                    outcome.dropped += 1;
                    continue;
                }
            }
            subscriber.wake.notify_one();
        }
        outcome
    }

    /// Fan a payload out to every registered subscriber.
    pub fn broadcast_all(
        &self,
        payload: impl Into<Arc<str>>,
        priority: MessagePriority,
    ) -> BroadcastOutcome {
        let ids: Vec<SubscriberId> = self.subscribers.read().keys().copied().collect();
        self.smart_broadcast(&ids, payload, priority)
    }

    /// Targeted send that never fails loudly: the payload is queued at
    /// normal priority and delivery is left to the drain task. Returns
    /// false if the subscriber is unknown or its queue refused the message.
    pub fn safe_send(&self, id: SubscriberId, payload: impl Into<Arc<str>>) -> bool {
        let outcome = self.smart_broadcast(&[id], payload, MessagePriority::Normal);
        outcome.queued == 1
    }

    pub fn subscriber_count(&self) -> usize {
        self.subscribers.read().len()
    }

    pub fn subscriber_stats(&self) -> Vec<SubscriberStats> {
        let now = Instant::now();
        let mut stats: Vec<SubscriberStats> = self
            .subscribers
            .read()
            .iter()
            .map(|(id, sub)| {
                let queue = sub.queue.lock();
                SubscriberStats {
                    id: *id,
                    queued: queue.len(),
                    sent: sub.sent.load(Ordering::Relaxed),
                    enqueued: queue.enqueued(),
                    evicted: queue.evicted(),
                    dropped: queue.dropped(),
                    oldest_queued_ms: queue
                        .oldest_queued_at()
                        .map(|t| now.saturating_duration_since(t).as_millis() as u64),
                    last_sent_ms: (*sub.last_sent.lock())
                        .map(|t| now.saturating_duration_since(t).as_millis() as u64),
                }
            })
            .collect();
        stats.sort_by_key(|s| s.id);
        stats
    }

    pub fn stats(&self) -> BroadcastStats {
        let per_subscriber = self.subscriber_stats();
        BroadcastStats {
            subscribers: per_subscriber.len(),
            queued: per_subscriber.iter().map(|s| s.queued).sum(),
            sent: per_subscriber.iter().map(|s| s.sent).sum(),
            evicted: per_subscriber.iter().map(|s| s.evicted).sum(),
            dropped: per_subscriber.iter().map(|s| s.dropped).sum(),
        }
    }
}

// ============================================================================
// DRAIN TASK
// ============================================================================

/// One loop iteration: wait for the transport to be ready, pop the next
/// message in priority order, push it down the transport. Sleeps on the
/// wake notify when the queue runs dry.
async fn drain_loop(
    id: SubscriberId,
    subscriber: Arc<Subscriber>,
    manager: Weak<BroadcastManager>,
    poll: Duration,
) {
    loop {
        if subscriber.shutdown.load(Ordering::SeqCst) {
            break;
        }

        while !subscriber.transport.is_ready() {
            if subscriber.shutdown.load(Ordering::SeqCst) {
                debug!(subscriber = %id, "drain_task_stopped");
                return;
            }
            tokio::time::sleep(poll).await;
        }

        let next = subscriber.queue.lock().pop();
        match next {
            Some(message) => {
                if let Err(err) = subscriber.transport.send(&message.payload).await {
                    debug!(subscriber = %id, error = %err, "subscriber_send_failed");
                    subscriber.shutdown.store(true, Ordering::SeqCst);
                    if let Some(manager) = manager.upgrade() {
                        manager.unregister(id);
                    }
                    break;
                }
                subscriber.sent.fetch_add(1, Ordering::Relaxed);
                *subscriber.last_sent.lock() = Some(Instant::now());
            }
            // notify_one permits are sticky, so a push racing this pop
            // still wakes us
            None => subscriber.wake.notified().await,
        }
    }
    debug!(subscriber = %id, "drain_task_stopped");
}

// ============================================================================
// TESTS
// ============================================================================
