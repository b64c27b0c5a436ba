//! Per-subscriber bounded priority queue.
//!
//! One ring per priority tier under a shared capacity budget, so the
//! capacity bound holds structurally no matter how traffic splits across
//! tiers. Pop order is priority tier first, FIFO within a tier.

use std::{collections::VecDeque, sync::Arc, time::Instant};

use serde::Serialize;

/// Delivery priority for outbound messages.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum MessagePriority {
    Low,
    Normal,
    High,
}

impl MessagePriority {
    pub fn as_str(&self) -> &'static str {
        match self {
            MessagePriority::Low => "low",
            MessagePriority::Normal => "normal",
            MessagePriority::High => "high",
        }
    }
}

impl std::fmt::Display for MessagePriority {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A queued outbound message. The payload is shared, not copied, across
/// the subscribers of one broadcast.
#[derive(Debug, Clone)]
pub struct QueuedMessage {
    pub payload: Arc<str>,
    pub priority: MessagePriority,
    pub queued_at: Instant,
}

impl QueuedMessage {
    pub fn new(payload: Arc<str>, priority: MessagePriority) -> Self {
        Self {
            payload,
            priority,
            queued_at: Instant::now(),
        }
    }
}

/// Outcome of a push. Capacity resolution is part of the contract, not an
/// error surfaced to the producer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PushOutcome {
    Queued,
    /// Queued after evicting the oldest low-priority message.
    QueuedEvictedLow,
    /// Queue full with nothing evictable; message not queued.
    Dropped,
}

/// Bounded three-tier queue for one subscriber.
#[derive(Debug)]
pub struct SubscriberQueue {
    /// Rings indexed low → normal → high.
    rings: [VecDeque<QueuedMessage>; 3],
    capacity: usize,
    enqueued: u64,
    evicted: u64,
    dropped: u64,
}

impl SubscriberQueue {
    pub fn new(capacity: usize) -> Self {
        Self {
            rings: [VecDeque::new(), VecDeque::new(), VecDeque::new()],
            capacity,
            enqueued: 0,
            evicted: 0,
            dropped: 0,
        }
    }

    fn tier(priority: MessagePriority) -> usize {
        match priority {
            MessagePriority::Low => 0,
            MessagePriority::Normal => 1,
            MessagePriority::High => 2,
        }
    }

    /// Push one message against the shared capacity budget.
    ///
    /// At capacity, a high-priority message evicts the oldest low-priority
    /// one if any exists; everything else is dropped.
    pub fn push(&mut self, message: QueuedMessage) -> PushOutcome {
        if self.len() >= self.capacity {
            if message.priority == MessagePriority::High && !self.rings[0].is_empty() {
                self.rings[0].pop_front();
                self.evicted += 1;
                self.rings[2].push_back(message);
                self.enqueued += 1;
                return PushOutcome::QueuedEvictedLow;
            }
            self.dropped += 1;
            return PushOutcome::Dropped;
        }

        self.rings[Self::tier(message.priority)].push_back(message);
        self.enqueued += 1;
        PushOutcome::Queued
    }

    /// Pop the next message in priority-then-FIFO order.
    pub fn pop(&mut self) -> Option<QueuedMessage> {
        for ring in self.rings.iter_mut().rev() {
            if let Some(message) = ring.pop_front() {
                return Some(message);
            }
        }
        None
    }

    pub fn len(&self) -> usize {
        self.rings.iter().map(|r| r.len()).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.rings.iter().all(|r| r.is_empty())
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Queue time of the oldest waiting message, across all tiers.
    pub fn oldest_queued_at(&self) -> Option<Instant> {
        self.rings
            .iter()
            .filter_map(|r| r.front().map(|m| m.queued_at))
            .min()
    }

    pub fn clear(&mut self) {
        for ring in self.rings.iter_mut() {
            ring.clear();
        }
    }

    /// Messages accepted since creation.
    pub fn enqueued(&self) -> u64 {
        self.enqueued
    }

    /// Low-priority messages evicted for high-priority arrivals.
    pub fn evicted(&self) -> u64 {
        self.evicted
    }

    /// Messages refused because the queue was full.
    pub fn dropped(&self) -> u64 {
        self.dropped
    }
}
