//! In-memory liquidation store: bounded per-symbol windows plus the derived
//! views (heatmap, leverage distribution) computed on demand.
//!
//! Writes are short appends under a write lock; every read hands out a
//! snapshot, so no caller ever holds a reference into a live window.

pub mod heatmap;
pub mod leverage;

use std::{
    collections::{HashMap, VecDeque},
    sync::atomic::{AtomicU64, Ordering},
};

use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use serde::Serialize;
use tracing::debug;

use crate::models::{LiquidationEvent, LookbackWindow};

pub use heatmap::{Heatmap, HeatmapBucket, HeatmapParams, HeatmapStatistics, RiskLevel};
pub use leverage::{LeverageTier, LeverageTierStat};

// =============================================================================
// CONFIGURATION
// =============================================================================

#[derive(Debug, Clone)]
pub struct StoreConfig {
    /// Hard per-symbol event cap; overflow pops the oldest entry. Sized as a
    /// burst backstop well above anything a 24h retention normally holds.
    pub max_events_per_symbol: usize,
    /// Interval for the periodic age sweep.
    pub sweep_interval_secs: u64,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            max_events_per_symbol: 10_000,
            sweep_interval_secs: 60,
        }
    }
}

impl StoreConfig {
    /// Load from environment with defaults
    pub fn from_env() -> Self {
        let mut config = Self::default();

        if let Ok(v) = std::env::var("LIQ_STORE_MAX_EVENTS_PER_SYMBOL") {
            config.max_events_per_symbol = v.parse().unwrap_or(config.max_events_per_symbol);
        }
        if let Ok(v) = std::env::var("LIQ_STORE_SWEEP_INTERVAL_SECS") {
            config.sweep_interval_secs = v.parse().unwrap_or(config.sweep_interval_secs);
        }

        config
    }
}

// =============================================================================
// PER-SYMBOL WINDOW
// =============================================================================

/// Time-ordered ring of events for one symbol. Oldest at the front.
#[derive(Debug, Default)]
struct SymbolWindow {
    events: VecDeque<LiquidationEvent>,
}

impl SymbolWindow {
    /// Append one event, enforcing the hard capacity. Returns how many
    /// events were popped to make room (0 or 1).
    fn push(&mut self, event: LiquidationEvent, capacity: usize) -> usize {
        let mut overflowed = 0;
        while self.events.len() >= capacity.max(1) {
            self.events.pop_front();
            overflowed += 1;
        }
        self.events.push_back(event);
        overflowed
    }

    /// Drop events older than `cutoff`. Storage is time-ordered, so this
    /// stops at the first in-retention event.
    fn evict_older_than(&mut self, cutoff: DateTime<Utc>) -> usize {
        let mut evicted = 0;
        while let Some(front) = self.events.front() {
            if front.timestamp >= cutoff {
                break;
            }
            self.events.pop_front();
            evicted += 1;
        }
        evicted
    }
}

// =============================================================================
// STORE
// =============================================================================

/// Store-wide counters for the status surface.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct StoreStats {
    pub symbols: usize,
    pub total_events: usize,
    /// Events dropped by the age sweep.
    pub evicted_events: u64,
    /// Events dropped by the per-symbol capacity backstop.
    pub overflowed_events: u64,
}

#[derive(Debug)]
pub struct LiquidationStore {
    inner: RwLock<HashMap<String, SymbolWindow>>,
    config: StoreConfig,
    evicted: AtomicU64,
    overflowed: AtomicU64,
}

impl LiquidationStore {
    pub fn new(config: StoreConfig) -> Self {
        Self {
            inner: RwLock::new(HashMap::new()),
            config,
            evicted: AtomicU64::new(0),
            overflowed: AtomicU64::new(0),
        }
    }

    pub fn config(&self) -> &StoreConfig {
        &self.config
    }

    /// Append one event to its symbol window. O(1) amortized; performs no
    /// aggregation (derived views are pull-based).
    pub fn add_event(&self, event: LiquidationEvent) {
        let cutoff = Utc::now() - LookbackWindow::retention().duration();

        let mut inner = self.inner.write();
        let window = inner.entry(event.symbol.clone()).or_default();

        // Lazy age eviction on the write path keeps hot symbols trimmed
        // without a read-side upgrade.
        let evicted = window.evict_older_than(cutoff);
        if evicted > 0 {
            self.evicted.fetch_add(evicted as u64, Ordering::Relaxed);
        }

        let overflowed = window.push(event, self.config.max_events_per_symbol);
        if overflowed > 0 {
            self.overflowed
                .fetch_add(overflowed as u64, Ordering::Relaxed);
        }
    }

    /// Snapshot of the symbol's events within the lookback, oldest first.
    /// Unknown symbols and empty windows return an empty vec.
    pub fn events(&self, symbol: &str, window: LookbackWindow) -> Vec<LiquidationEvent> {
        let cutoff = Utc::now() - window.duration();
        let inner = self.inner.read();

        let Some(w) = inner.get(&symbol.to_uppercase()) else {
            return Vec::new();
        };

        // Reverse scan with early termination: storage is time-ordered.
        let mut out: Vec<LiquidationEvent> = w
            .events
            .iter()
            .rev()
            .take_while(|e| e.timestamp >= cutoff)
            .cloned()
            .collect();
        out.reverse();
        out
    }

    /// Kernel-smoothed price-density heatmap over the window snapshot.
    pub fn heatmap(
        &self,
        symbol: &str,
        window: LookbackWindow,
        params: &HeatmapParams,
    ) -> Heatmap {
        let events = self.events(symbol, window);
        heatmap::generate(&events, params)
    }

    /// Leverage tier distribution over the window snapshot.
    pub fn leverage_distribution(
        &self,
        symbol: &str,
        window: LookbackWindow,
    ) -> Vec<LeverageTierStat> {
        let events = self.events(symbol, window);
        leverage::distribution(&events)
    }

    /// Symbols currently holding data, sorted for stable display.
    pub fn tracked_symbols(&self) -> Vec<String> {
        let inner = self.inner.read();
        let mut symbols: Vec<String> = inner.keys().cloned().collect();
        symbols.sort();
        symbols
    }

    /// Number of stored events for a symbol (0 when unknown).
    pub fn event_count(&self, symbol: &str) -> usize {
        let inner = self.inner.read();
        inner
            .get(&symbol.to_uppercase())
            .map(|w| w.events.len())
            .unwrap_or(0)
    }

    /// Price of the most recent stored event for a symbol.
    pub fn last_price(&self, symbol: &str) -> Option<f64> {
        let inner = self.inner.read();
        inner
            .get(&symbol.to_uppercase())
            .and_then(|w| w.events.back())
            .map(|e| e.price)
    }

    pub fn stats(&self) -> StoreStats {
        let inner = self.inner.read();
        StoreStats {
            symbols: inner.len(),
            total_events: inner.values().map(|w| w.events.len()).sum(),
            evicted_events: self.evicted.load(Ordering::Relaxed),
            overflowed_events: self.overflowed.load(Ordering::Relaxed),
        }
    }

    /// Drop out-of-retention events across all symbols and forget symbols
    /// whose windows emptied. Returns the number of events evicted.
    pub fn sweep(&self) -> usize {
        let cutoff = Utc::now() - LookbackWindow::retention().duration();
        let mut inner = self.inner.write();

        let mut evicted = 0;
        inner.retain(|symbol, window| {
            let dropped = window.evict_older_than(cutoff);
            if dropped > 0 {
                debug!(symbol = %symbol, dropped, "window_sweep");
                evicted += dropped;
            }
            !window.events.is_empty()
        });

        if evicted > 0 {
            self.evicted.fetch_add(evicted as u64, Ordering::Relaxed);
        }
        evicted
    }
}

impl Default for LiquidationStore {
    fn default() -> Self {
        Self::new(StoreConfig::default())
    }
}

// =============================================================================
// TESTS
// =============================================================================
