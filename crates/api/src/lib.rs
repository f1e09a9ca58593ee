//! Realtime dispatch server library.
//!
//! Exposes the building blocks (config, state, dispatcher, routes, socket
//! handling, background jobs) so integration tests and the binary entrypoint
//! share them.

pub mod background;
pub mod config;
pub mod dispatch;
pub mod error;
pub mod handlers;
pub mod health;
pub mod metrics;
pub mod middleware;
pub mod response;
pub mod router;
pub mod routes;
pub mod state;
pub mod ws;
