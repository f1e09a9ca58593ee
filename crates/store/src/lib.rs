//! Shared state store: key/value with TTL, non-blocking locks, windowed
//! counters and cross-process publish/subscribe.
//!
//! Two backends implement [`StateStore`]:
//!
//! | Backend          | Used when            |
//! |------------------|----------------------|
//! | [`RedisStore`]   | `REDIS_URL` is set   |
//! | [`MemoryStore`]  | single process, tests|

use std::fmt;
use std::time::Duration;

use async_trait::async_trait;
use dispatch_core::error::CoreError;
use tokio::sync::mpsc;

pub mod memory;
pub mod redis_store;

pub use memory::MemoryStore;
pub use redis_store::RedisStore;

/// Errors raised by a store backend.
#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("store unavailable: {0}")]
    Unavailable(String),

    #[error("store protocol error: {0}")]
    Protocol(String),
}

impl From<StoreError> for CoreError {
    fn from(err: StoreError) -> Self {
        match err {
            StoreError::Unavailable(msg) => CoreError::StoreUnavailable(msg),
            StoreError::Protocol(msg) => CoreError::StoreUnavailable(msg),
        }
    }
}

pub type StoreResult<T> = Result<T, StoreError>;

/// Messages published on a store channel after `subscribe` was called.
///
/// Dropping the receiver ends the subscription.
pub type Subscription = mpsc::UnboundedReceiver<String>;

/// Proof of lock ownership returned by [`StateStore::acquire_lock`].
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct LockToken(String);

impl LockToken {
    pub fn generate() -> Self {
        Self(uuid::Uuid::new_v4().to_string())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for LockToken {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

#[async_trait]
pub trait StateStore: Send + Sync + 'static {
    async fn get(&self, key: &str) -> StoreResult<Option<String>>;

    /// Write `value`, replacing any previous value and TTL.
    async fn set(&self, key: &str, value: &str, ttl: Option<Duration>) -> StoreResult<()>;

    /// Returns whether a key was removed.
    async fn delete(&self, key: &str) -> StoreResult<bool>;

    async fn exists(&self, key: &str) -> StoreResult<bool>;

    /// Try to take `key` for `ttl`. Never blocks; `None` means someone else
    /// holds it.
    async fn acquire_lock(&self, key: &str, ttl: Duration) -> StoreResult<Option<LockToken>>;

    /// Compare-and-delete. `false` when the lock expired or is now held by a
    /// different token; the other holder's lock is left in place.
    async fn release_lock(&self, key: &str, token: &LockToken) -> StoreResult<bool>;

    async fn publish(&self, channel: &str, message: &str) -> StoreResult<()>;

    async fn subscribe(&self, channel: &str) -> StoreResult<Subscription>;

    /// Atomically add one to the counter at `key`. The window starts at the
    /// first increment; the counter resets once it elapses.
    async fn increment(&self, key: &str, window: Duration) -> StoreResult<u64>;

    async fn ping(&self) -> StoreResult<()>;

    /// Short backend name for health and logs.
    fn backend(&self) -> &'static str;
}
