//! Priority job queue over the shared state store.
//!
//! Job records live in the store (`job:<id>`) so any process can claim
//! them. Each process keeps a [`TierIndex`](index::TierIndex) of the jobs it
//! enqueued and is responsible for offering, reaping and cleaning those.

pub mod config;
mod index;
pub mod queue;

pub use config::QueueConfig;
pub use queue::{JobQueue, QueueDepth, ReapReport, StatusCounts};
