//! Canonical domain types shared by the feed, store, broadcast, and API layers.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Side of the forced order as reported by the venue.
///
/// `Buy` means shorts were bought in (short liquidation); `Sell` means longs
/// were sold out (long liquidation).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum Side {
    Buy,
    Sell,
}

impl Side {
    pub fn as_str(&self) -> &'static str {
        match self {
            Side::Buy => "BUY",
            Side::Sell => "SELL",
        }
    }
}

impl std::fmt::Display for Side {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Originating venue. Single venue today; the tag keeps payloads stable
/// when additional feeds land.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Exchange {
    Binance,
}

impl Exchange {
    pub fn as_str(&self) -> &'static str {
        match self {
            Exchange::Binance => "binance",
        }
    }
}

impl std::fmt::Display for Exchange {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A normalized liquidation event, immutable once constructed.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LiquidationEvent {
    /// Uppercase instrument symbol, e.g. `BTCUSDT`.
    pub symbol: String,
    pub side: Side,
    /// Fill (or order) price in quote currency.
    pub price: f64,
    /// Base-asset quantity of the forced order.
    pub quantity: f64,
    /// Event time as reported by the venue.
    pub timestamp: DateTime<Utc>,
    pub exchange: Exchange,
    /// Tier estimate derived from notional size. Venues do not publish the
    /// liquidated account's actual leverage.
    pub estimated_leverage: u32,
    /// `price * quantity`, precomputed so downstream consumers never
    /// recompute it inconsistently.
    pub notional_value: f64,
}

impl LiquidationEvent {
    pub fn new(
        symbol: impl Into<String>,
        side: Side,
        price: f64,
        quantity: f64,
        timestamp: DateTime<Utc>,
    ) -> Self {
        let notional_value = price * quantity;
        Self {
            symbol: symbol.into().to_uppercase(),
            side,
            price,
            quantity,
            timestamp,
            exchange: Exchange::Binance,
            estimated_leverage: estimate_leverage(notional_value),
            notional_value,
        }
    }
}

/// Leverage tier estimate from notional size.
///
/// Heuristic only: venues cap maximum leverage by position size, so large
/// forced orders generally come from lower-leverage brackets. The mapping
/// follows those bracket ladders and is monotonically non-increasing.
pub fn estimate_leverage(notional: f64) -> u32 {
    match notional {
        n if n < 50_000.0 => 125,
        n if n < 250_000.0 => 100,
        n if n < 1_000_000.0 => 50,
        n if n < 5_000_000.0 => 20,
        n if n < 20_000_000.0 => 10,
        _ => 5,
    }
}

/// Supported query lookbacks. Storage retains events for the longest one.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum LookbackWindow {
    #[serde(rename = "1h")]
    OneHour,
    #[serde(rename = "4h")]
    FourHours,
    #[serde(rename = "24h")]
    TwentyFourHours,
}

impl LookbackWindow {
    pub fn as_str(&self) -> &'static str {
        match self {
            LookbackWindow::OneHour => "1h",
            LookbackWindow::FourHours => "4h",
            LookbackWindow::TwentyFourHours => "24h",
        }
    }

    pub fn duration(&self) -> chrono::Duration {
        match self {
            LookbackWindow::OneHour => chrono::Duration::hours(1),
            LookbackWindow::FourHours => chrono::Duration::hours(4),
            LookbackWindow::TwentyFourHours => chrono::Duration::hours(24),
        }
    }

    /// Longest supported lookback; doubles as the storage retention horizon.
    pub fn retention() -> Self {
        LookbackWindow::TwentyFourHours
    }
}

impl std::fmt::Display for LookbackWindow {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for LookbackWindow {
    type Err = WindowParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "1h" => Ok(LookbackWindow::OneHour),
            "4h" => Ok(LookbackWindow::FourHours),
            "24h" => Ok(LookbackWindow::TwentyFourHours),
            other => Err(WindowParseError(other.to_string())),
        }
    }
}

#[derive(Debug, Clone, thiserror::Error)]
#[error("unsupported lookback window '{0}' (expected 1h, 4h, or 24h)")]
pub struct WindowParseError(pub String);

/// Outbound websocket payloads, tagged for client-side dispatch.
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum WsServerMessage {
    Liquidation(LiquidationEvent),
    Stats {
        connected: bool,
        tracked_symbols: usize,
        total_events: u64,
        timestamp: i64,
    },
    Pong {
        timestamp: i64,
    },
}
