//! WebSocket transport for the dispatch protocol.
//!
//! Provides the HTTP upgrade handler and the heartbeat task that pings
//! connections and sweeps idle ones.

mod handler;
mod heartbeat;

pub use handler::ws_handler;
pub use heartbeat::{start_heartbeat, sweep_idle};
