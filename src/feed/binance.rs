//! Binance futures `forceOrder` wire format and normalization.
//!
//! The venue-wide stream pushes one message per forced order, either bare
//! (`/ws/!forceOrder@arr`) or wrapped in a combined-stream envelope
//! (`/stream?streams=...`). Both shapes are accepted. Numeric fields arrive
//! as strings and are parsed with the local `de_str_f64` helper.

use chrono::{DateTime, TimeZone, Utc};
use serde::{Deserialize, Deserializer};
use serde_json::Value;

use crate::models::{LiquidationEvent, Side};

/// Failure to turn a raw frame into a liquidation event.
///
/// These are counted and skipped by the read loop; they never tear the
/// connection.
#[derive(Debug, thiserror::Error)]
pub enum FeedParseError {
    #[error("malformed payload: {0}")]
    Json(#[from] serde_json::Error),
    #[error("unexpected event type '{0}'")]
    UnexpectedEvent(String),
    #[error("non-positive price or quantity")]
    DegenerateOrder,
}

/// Bare `forceOrder` event message.
#[derive(Debug, Clone, Deserialize)]
pub struct ForceOrderMessage {
    #[serde(rename = "e")]
    pub event_type: String,
    #[serde(rename = "E", deserialize_with = "de_epoch_ms")]
    pub event_time: DateTime<Utc>,
    #[serde(rename = "o")]
    pub order: ForceOrder,
}

/// The forced order carried inside a `forceOrder` message.
#[derive(Debug, Clone, Deserialize)]
pub struct ForceOrder {
    #[serde(rename = "s")]
    pub symbol: String,
    #[serde(rename = "S")]
    pub side: Side,
    #[serde(rename = "q", deserialize_with = "de_str_f64")]
    pub quantity: f64,
    #[serde(rename = "p", deserialize_with = "de_str_f64")]
    pub price: f64,
    /// Average fill price; absent or "0" on some partial payloads.
    #[serde(rename = "ap", default, deserialize_with = "de_opt_str_f64")]
    pub average_price: Option<f64>,
    #[serde(rename = "T", deserialize_with = "de_epoch_ms")]
    pub trade_time: DateTime<Utc>,
}

/// Parse a raw text frame, unwrapping the combined-stream envelope if present.
pub fn parse_force_order(raw: &str) -> Result<ForceOrderMessage, FeedParseError> {
    let value: Value = serde_json::from_str(raw)?;

    let message = match value.get("data") {
        Some(data) => ForceOrderMessage::deserialize(data)?,
        None => ForceOrderMessage::deserialize(&value)?,
    };

    if message.event_type != "forceOrder" {
        return Err(FeedParseError::UnexpectedEvent(message.event_type));
    }

    Ok(message)
}

impl ForceOrderMessage {
    /// Normalize into the canonical event.
    ///
    /// Prefers the average fill price when present and positive, falling
    /// back to the order price. Rejects orders with no usable price or size.
    pub fn into_event(self) -> Result<LiquidationEvent, FeedParseError> {
        let order = self.order;

        let price = match order.average_price {
            Some(ap) if ap > 0.0 => ap,
            _ => order.price,
        };
        if price <= 0.0 || order.quantity <= 0.0 {
            return Err(FeedParseError::DegenerateOrder);
        }

        Ok(LiquidationEvent::new(
            order.symbol,
            order.side,
            price,
            order.quantity,
            order.trade_time,
        ))
    }
}

fn de_str_f64<'de, D>(deserializer: D) -> Result<f64, D::Error>
where
    D: Deserializer<'de>,
{
    let s = std::borrow::Cow::<str>::deserialize(deserializer)?;
    s.parse::<f64>().map_err(serde::de::Error::custom)
}

fn de_opt_str_f64<'de, D>(deserializer: D) -> Result<Option<f64>, D::Error>
where
    D: Deserializer<'de>,
{
    let s = Option::<std::borrow::Cow<str>>::deserialize(deserializer)?;
    match s {
        Some(s) => s
            .parse::<f64>()
            .map(Some)
            .map_err(serde::de::Error::custom),
        None => Ok(None),
    }
}

fn de_epoch_ms<'de, D>(deserializer: D) -> Result<DateTime<Utc>, D::Error>
where
    D: Deserializer<'de>,
{
    let ms = i64::deserialize(deserializer)?;
    Utc.timestamp_millis_opt(ms)
        .single()
        .ok_or_else(|| serde::de::Error::custom(format!("epoch millis out of range: {ms}")))
}
