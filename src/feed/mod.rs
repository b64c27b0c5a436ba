pub mod binance; // forceOrder wire format and normalization
pub mod client;
pub mod session; // connection state machine, backoff, heartbeat

// Re-export the control surface for consumers
pub use client::LiquidationFeed;
pub use session::{ConnectionStatus, FeedConfig, FeedState};
