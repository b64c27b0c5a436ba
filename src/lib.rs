//! Liquidation heatmap backend library.
//!
//! Exposes the pipeline stages for the `liqmap` binary and for
//! integration tests: feed ingestion, windowed storage, priority
//! broadcast, and the HTTP/WebSocket API layer.

pub mod api;
pub mod broadcast;
pub mod feed;
pub mod models;
pub mod store;
