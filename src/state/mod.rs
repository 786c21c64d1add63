//! Process-wide state store and per-run context.

pub mod context;
pub mod event;
pub mod store;

pub use context::RunContext;
pub use event::{Event, EventKind};
pub use store::AppState;

use std::time::{SystemTime, UNIX_EPOCH};

/// Current Unix time in seconds as a float.
pub fn unix_now() -> f64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs_f64())
        .unwrap_or_default()
}
