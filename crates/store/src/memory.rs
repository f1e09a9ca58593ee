//! In-process store with the same semantics as the redis backend.

use std::collections::HashMap;
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::{mpsc, Mutex};
use tokio::time::Instant;

use crate::{LockToken, StateStore, StoreResult, Subscription};

/// Inserts between full sweeps of expired keys.
pub const SWEEP_EVERY: u32 = 256;

#[derive(Debug)]
struct Entry {
    value: String,
    expires_at: Option<Instant>,
}

impl Entry {
    fn is_live(&self, now: Instant) -> bool {
        self.expires_at.is_none_or(|at| at > now)
    }
}

#[derive(Default)]
struct Inner {
    entries: HashMap<String, Entry>,
    channels: HashMap<String, Vec<mpsc::UnboundedSender<String>>>,
    inserts_since_sweep: u32,
}

impl Inner {
    /// Live value for `key`, dropping it if it has expired.
    fn live(&mut self, key: &str, now: Instant) -> Option<&mut Entry> {
        if self.entries.get(key).is_some_and(|e| !e.is_live(now)) {
            self.entries.remove(key);
        }
        self.entries.get_mut(key)
    }

    /// Insert a new entry. Every [`SWEEP_EVERY`] inserts, keys that expired
    /// without being read again are dropped.
    fn insert(&mut self, key: &str, entry: Entry, now: Instant) {
        self.entries.insert(key.to_string(), entry);
        self.inserts_since_sweep += 1;
        if self.inserts_since_sweep >= SWEEP_EVERY {
            self.sweep(now);
        }
    }

    fn sweep(&mut self, now: Instant) -> usize {
        let before = self.entries.len();
        self.entries.retain(|_, e| e.is_live(now));
        self.inserts_since_sweep = 0;
        before - self.entries.len()
    }
}

/// Store backed by a single mutex-guarded map.
///
/// Expired keys are dropped on access and by a sweep that runs every
/// [`SWEEP_EVERY`] inserts, so keys written once and never read again do not
/// accumulate.
#[derive(Default)]
pub struct MemoryStore {
    inner: Mutex<Inner>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Drop every expired key now. Returns how many were removed.
    pub async fn purge_expired(&self) -> usize {
        self.inner.lock().await.sweep(Instant::now())
    }

    /// Keys currently held, expired or not.
    pub async fn key_count(&self) -> usize {
        self.inner.lock().await.entries.len()
    }
}

#[async_trait]
impl StateStore for MemoryStore {
    async fn get(&self, key: &str) -> StoreResult<Option<String>> {
        let mut inner = self.inner.lock().await;
        Ok(inner.live(key, Instant::now()).map(|e| e.value.clone()))
    }

    async fn set(&self, key: &str, value: &str, ttl: Option<Duration>) -> StoreResult<()> {
        let now = Instant::now();
        let mut inner = self.inner.lock().await;
        inner.insert(
            key,
            Entry {
                value: value.to_string(),
                expires_at: ttl.map(|ttl| now + ttl),
            },
            now,
        );
        Ok(())
    }

    async fn delete(&self, key: &str) -> StoreResult<bool> {
        let mut inner = self.inner.lock().await;
        let was_live = inner.live(key, Instant::now()).is_some();
        inner.entries.remove(key);
        Ok(was_live)
    }

    async fn exists(&self, key: &str) -> StoreResult<bool> {
        let mut inner = self.inner.lock().await;
        Ok(inner.live(key, Instant::now()).is_some())
    }

    async fn acquire_lock(&self, key: &str, ttl: Duration) -> StoreResult<Option<LockToken>> {
        let now = Instant::now();
        let mut inner = self.inner.lock().await;
        if inner.live(key, now).is_some() {
            return Ok(None);
        }
        let token = LockToken::generate();
        inner.insert(
            key,
            Entry {
                value: token.as_str().to_string(),
                expires_at: Some(now + ttl),
            },
            now,
        );
        Ok(Some(token))
    }

    async fn release_lock(&self, key: &str, token: &LockToken) -> StoreResult<bool> {
        let mut inner = self.inner.lock().await;
        let held = inner
            .live(key, Instant::now())
            .is_some_and(|e| e.value == token.as_str());
        if held {
            inner.entries.remove(key);
        }
        Ok(held)
    }

    async fn publish(&self, channel: &str, message: &str) -> StoreResult<()> {
        let mut inner = self.inner.lock().await;
        if let Some(subscribers) = inner.channels.get_mut(channel) {
            subscribers.retain(|tx| tx.send(message.to_string()).is_ok());
            if subscribers.is_empty() {
                inner.channels.remove(channel);
            }
        }
        Ok(())
    }

    async fn subscribe(&self, channel: &str) -> StoreResult<Subscription> {
        let (tx, rx) = mpsc::unbounded_channel();
        let mut inner = self.inner.lock().await;
        inner.channels.entry(channel.to_string()).or_default().push(tx);
        Ok(rx)
    }

    async fn increment(&self, key: &str, window: Duration) -> StoreResult<u64> {
        let now = Instant::now();
        let mut inner = self.inner.lock().await;
        let count = match inner.live(key, now) {
            Some(entry) => {
                let next = entry.value.parse::<u64>().unwrap_or(0) + 1;
                entry.value = next.to_string();
                next
            }
            None => {
                inner.insert(
                    key,
                    Entry {
                        value: "1".to_string(),
                        expires_at: Some(now + window),
                    },
                    now,
                );
                1
            }
        };
        Ok(count)
    }

    async fn ping(&self) -> StoreResult<()> {
        Ok(())
    }

    fn backend(&self) -> &'static str {
        "memory"
    }
}
