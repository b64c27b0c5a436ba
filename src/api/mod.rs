pub mod routes;

pub use routes::{create_router, stats_message, AppState};
