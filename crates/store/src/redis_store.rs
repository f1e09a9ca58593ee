//! Redis backend.
//!
//! Commands go through a shared [`ConnectionManager`] (cloned per call, it
//! reconnects on its own). All subscriptions share one pub/sub connection:
//! a reader task routes each message to the receivers of its channel, and a
//! channel is unsubscribed once its last receiver is dropped.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use futures::StreamExt;
use redis::aio::{ConnectionManager, PubSubSink, PubSubStream};
use tokio::sync::{mpsc, Mutex};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::{LockToken, StateStore, StoreError, StoreResult, Subscription};

/// Delete the lock only if it still carries our token.
const RELEASE_LOCK_SCRIPT: &str = r#"
if redis.call("GET", KEYS[1]) == ARGV[1] then
    return redis.call("DEL", KEYS[1])
else
    return 0
end
"#;

/// INCR, starting the window on the first hit.
const INCREMENT_SCRIPT: &str = r#"
local count = redis.call("INCR", KEYS[1])
if count == 1 then
    redis.call("PEXPIRE", KEYS[1], ARGV[1])
end
return count
"#;

fn store_err(err: redis::RedisError) -> StoreError {
    if err.is_io_error()
        || err.is_connection_dropped()
        || err.is_connection_refusal()
        || err.is_timeout()
    {
        StoreError::Unavailable(err.to_string())
    } else {
        StoreError::Protocol(err.to_string())
    }
}

fn millis(ttl: Duration) -> u64 {
    ttl.as_millis().clamp(1, u64::MAX as u128) as u64
}

/// Receivers per subscribed channel.
type Routes = Arc<Mutex<HashMap<String, Vec<mpsc::UnboundedSender<String>>>>>;

/// The shared pub/sub connection and its reader task.
struct PubSubHub {
    sink: Arc<Mutex<PubSubSink>>,
    routes: Routes,
    reader: JoinHandle<()>,
    /// Cancelled when the reader stops.
    closed: CancellationToken,
}

pub struct RedisStore {
    client: redis::Client,
    conn: ConnectionManager,
    pubsub: Mutex<Option<PubSubHub>>,
}

impl RedisStore {
    /// Open a client and verify the server answers `PING`.
    pub async fn connect(url: &str) -> StoreResult<Self> {
        let client = redis::Client::open(url).map_err(store_err)?;
        let mut conn = client.get_connection_manager().await.map_err(store_err)?;

        let _: String = redis::cmd("PING")
            .query_async(&mut conn)
            .await
            .map_err(store_err)?;

        info!("Connected to redis state store");
        Ok(Self {
            client,
            conn,
            pubsub: Mutex::new(None),
        })
    }

    fn conn(&self) -> ConnectionManager {
        self.conn.clone()
    }

    /// Open the shared pub/sub connection, or reopen it after it dropped.
    async fn open_pubsub(&self) -> StoreResult<PubSubHub> {
        let (sink, stream) = self
            .client
            .get_async_pubsub()
            .await
            .map_err(store_err)?
            .split();
        let routes: Routes = Arc::default();
        let closed = CancellationToken::new();
        let reader = tokio::spawn(route_messages(stream, Arc::clone(&routes), closed.clone()));
        debug!("Redis pub/sub connection opened");
        Ok(PubSubHub {
            sink: Arc::new(Mutex::new(sink)),
            routes,
            reader,
            closed,
        })
    }
}

/// Forward every message to the receivers of its channel. When the
/// connection ends, dropping the senders ends every open subscription.
async fn route_messages(mut stream: PubSubStream, routes: Routes, closed: CancellationToken) {
    while let Some(msg) = stream.next().await {
        let channel = msg.get_channel_name().to_string();
        let payload = match msg.get_payload::<String>() {
            Ok(payload) => payload,
            Err(e) => {
                warn!(channel = %channel, error = %e, "Dropping non-text pub/sub payload");
                continue;
            }
        };
        if let Some(senders) = routes.lock().await.get_mut(&channel) {
            senders.retain(|tx| tx.send(payload.clone()).is_ok());
        }
    }
    warn!("Redis pub/sub connection closed");
    routes.lock().await.clear();
    closed.cancel();
}

/// Once `tx`'s receiver is dropped, remove it and unsubscribe the channel if
/// it was the last one. Returns early when the connection itself closes.
async fn release_when_dropped(
    tx: mpsc::UnboundedSender<String>,
    channel: String,
    routes: Routes,
    sink: Arc<Mutex<PubSubSink>>,
    closed: CancellationToken,
) {
    tokio::select! {
        _ = tx.closed() => {}
        _ = closed.cancelled() => return,
    }
    drop(tx);

    // Routes stay locked across the unsubscribe so a concurrent subscribe to
    // the same channel is ordered after it.
    let mut routes = routes.lock().await;
    let Some(senders) = routes.get_mut(&channel) else {
        return;
    };
    senders.retain(|s| !s.is_closed());
    if senders.is_empty() {
        routes.remove(&channel);
        if let Err(e) = sink.lock().await.unsubscribe(&channel).await {
            debug!(channel = %channel, error = %e, "Redis unsubscribe failed");
        }
        debug!(channel = %channel, "Redis subscription closed");
    }
}

#[async_trait]
impl StateStore for RedisStore {
    async fn get(&self, key: &str) -> StoreResult<Option<String>> {
        redis::cmd("GET")
            .arg(key)
            .query_async(&mut self.conn())
            .await
            .map_err(store_err)
    }

    async fn set(&self, key: &str, value: &str, ttl: Option<Duration>) -> StoreResult<()> {
        let mut cmd = redis::cmd("SET");
        cmd.arg(key).arg(value);
        if let Some(ttl) = ttl {
            cmd.arg("PX").arg(millis(ttl));
        }
        cmd.query_async::<()>(&mut self.conn())
            .await
            .map_err(store_err)
    }

    async fn delete(&self, key: &str) -> StoreResult<bool> {
        let removed: i64 = redis::cmd("DEL")
            .arg(key)
            .query_async(&mut self.conn())
            .await
            .map_err(store_err)?;
        Ok(removed > 0)
    }

    async fn exists(&self, key: &str) -> StoreResult<bool> {
        let count: i64 = redis::cmd("EXISTS")
            .arg(key)
            .query_async(&mut self.conn())
            .await
            .map_err(store_err)?;
        Ok(count > 0)
    }

    async fn acquire_lock(&self, key: &str, ttl: Duration) -> StoreResult<Option<LockToken>> {
        let token = LockToken::generate();
        let reply: Option<String> = redis::cmd("SET")
            .arg(key)
            .arg(token.as_str())
            .arg("NX")
            .arg("PX")
            .arg(millis(ttl))
            .query_async(&mut self.conn())
            .await
            .map_err(store_err)?;
        Ok(reply.map(|_| token))
    }

    async fn release_lock(&self, key: &str, token: &LockToken) -> StoreResult<bool> {
        let removed: i64 = redis::Script::new(RELEASE_LOCK_SCRIPT)
            .key(key)
            .arg(token.as_str())
            .invoke_async(&mut self.conn())
            .await
            .map_err(store_err)?;
        if removed == 0 {
            debug!(key, "Lock release denied (expired or re-acquired)");
        }
        Ok(removed > 0)
    }

    async fn publish(&self, channel: &str, message: &str) -> StoreResult<()> {
        let _: i64 = redis::cmd("PUBLISH")
            .arg(channel)
            .arg(message)
            .query_async(&mut self.conn())
            .await
            .map_err(store_err)?;
        Ok(())
    }

    async fn subscribe(&self, channel: &str) -> StoreResult<Subscription> {
        let mut shared = self.pubsub.lock().await;
        if shared.as_ref().is_none_or(|hub| hub.reader.is_finished()) {
            *shared = Some(self.open_pubsub().await?);
        }
        let Some(hub) = shared.as_ref() else {
            return Err(StoreError::Unavailable("pub/sub connection missing".into()));
        };

        let (tx, rx) = mpsc::unbounded_channel();
        let first = {
            let mut routes = hub.routes.lock().await;
            let senders = routes.entry(channel.to_string()).or_default();
            senders.push(tx.clone());
            senders.len() == 1
        };
        if first {
            if let Err(e) = hub.sink.lock().await.subscribe(channel).await {
                hub.routes.lock().await.remove(channel);
                return Err(store_err(e));
            }
        }

        tokio::spawn(release_when_dropped(
            tx,
            channel.to_string(),
            Arc::clone(&hub.routes),
            Arc::clone(&hub.sink),
            hub.closed.clone(),
        ));
        Ok(rx)
    }

    async fn increment(&self, key: &str, window: Duration) -> StoreResult<u64> {
        redis::Script::new(INCREMENT_SCRIPT)
            .key(key)
            .arg(millis(window))
            .invoke_async(&mut self.conn())
            .await
            .map_err(store_err)
    }

    async fn ping(&self) -> StoreResult<()> {
        let _: String = redis::cmd("PING")
            .query_async(&mut self.conn())
            .await
            .map_err(store_err)?;
        Ok(())
    }

    fn backend(&self) -> &'static str {
        "redis"
    }
}
