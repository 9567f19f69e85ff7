//! HTTP surface of the Switchboard gateway.
//!
//! Thin by design: every decision lives in `switchboard-core`; this crate
//! maps requests to core calls and core outcomes to statuses, SSE frames,
//! and JSON bodies.

pub mod error;
pub mod routes;
pub mod state;

pub use routes::build_router;
pub use state::{build_state, AppState, SharedState};
