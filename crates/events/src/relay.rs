//! Cross-process fan-out through the shared store's pub/sub.
//!
//! Each local broadcast is published as a [`RelayFrame`] on
//! `relay:<channel>`. A process watches the relay channel of every channel
//! that has local members and hands foreign frames back to the hub.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use dispatch_core::protocol::ServerMessage;
use dispatch_core::types::ConnectionId;
use dispatch_store::StateStore;
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::hub::ChannelHub;

const RELAY_PREFIX: &str = "relay:";

/// Relay settings.
#[derive(Debug, Clone)]
pub struct RelayConfig {
    /// Identifies this process in relay frames.
    pub node_id: String,
    /// When false, broadcasts stay local and nothing is watched.
    pub enabled: bool,
}

impl Default for RelayConfig {
    fn default() -> Self {
        Self {
            node_id: uuid::Uuid::new_v4().to_string(),
            enabled: true,
        }
    }
}

/// Broadcast as it travels between processes.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RelayFrame {
    pub origin: String,
    pub channel: String,
    pub exclude: Option<ConnectionId>,
    pub message: ServerMessage,
}

pub fn relay_channel(channel: &str) -> String {
    format!("{RELAY_PREFIX}{channel}")
}

pub struct RelayBridge {
    store: Arc<dyn StateStore>,
    config: RelayConfig,
    /// Forwarding task per watched channel.
    watches: Mutex<HashMap<String, JoinHandle<()>>>,
    inbound_tx: mpsc::UnboundedSender<RelayFrame>,
    inbound_rx: Mutex<Option<mpsc::UnboundedReceiver<RelayFrame>>>,
}

impl RelayBridge {
    pub fn new(store: Arc<dyn StateStore>, config: RelayConfig) -> Self {
        let (inbound_tx, inbound_rx) = mpsc::unbounded_channel();
        Self {
            store,
            config,
            watches: Mutex::new(HashMap::new()),
            inbound_tx,
            inbound_rx: Mutex::new(Some(inbound_rx)),
        }
    }

    pub fn node_id(&self) -> &str {
        &self.config.node_id
    }

    pub fn is_enabled(&self) -> bool {
        self.config.enabled
    }

    /// Publish a local broadcast for other processes. Fire-and-forget.
    pub fn publish(&self, channel: &str, message: &ServerMessage, exclude: Option<&str>) {
        if !self.config.enabled {
            return;
        }
        let frame = RelayFrame {
            origin: self.config.node_id.clone(),
            channel: channel.to_string(),
            exclude: exclude.map(str::to_string),
            message: message.clone(),
        };
        let text = match serde_json::to_string(&frame) {
            Ok(text) => text,
            Err(e) => {
                tracing::error!(channel, error = %e, "Failed to encode relay frame");
                return;
            }
        };
        let store = Arc::clone(&self.store);
        let relay = relay_channel(channel);
        tokio::spawn(async move {
            if let Err(e) = store.publish(&relay, &text).await {
                tracing::warn!(channel = %relay, error = %e, "Relay publish failed");
            }
        });
    }

    /// Start forwarding frames from `relay:<channel>`. Idempotent.
    pub fn watch(&self, channel: &str) {
        if !self.config.enabled {
            return;
        }
        let mut watches = lock(&self.watches);
        if watches.contains_key(channel) {
            return;
        }
        let store = Arc::clone(&self.store);
        let tx = self.inbound_tx.clone();
        let node_id = self.config.node_id.clone();
        let relay = relay_channel(channel);
        let handle = tokio::spawn(async move {
            let mut sub = match store.subscribe(&relay).await {
                Ok(sub) => sub,
                Err(e) => {
                    tracing::warn!(channel = %relay, error = %e, "Relay subscribe failed");
                    return;
                }
            };
            while let Some(text) = sub.recv().await {
                let frame: RelayFrame = match serde_json::from_str(&text) {
                    Ok(frame) => frame,
                    Err(e) => {
                        tracing::warn!(channel = %relay, error = %e, "Dropping malformed relay frame");
                        continue;
                    }
                };
                if frame.origin == node_id {
                    continue;
                }
                if tx.send(frame).is_err() {
                    break;
                }
            }
        });
        watches.insert(channel.to_string(), handle);
    }

    /// Stop forwarding `relay:<channel>`.
    pub fn unwatch(&self, channel: &str) {
        if let Some(handle) = lock(&self.watches).remove(channel) {
            handle.abort();
        }
    }

    pub fn unwatch_all(&self) {
        for (_, handle) in lock(&self.watches).drain() {
            handle.abort();
        }
    }

    pub fn watched_count(&self) -> usize {
        lock(&self.watches).len()
    }

    /// Deliver foreign frames to local members until cancelled.
    ///
    /// Only the first call gets the inbound queue; later calls return
    /// immediately.
    pub async fn run_inbound(self: Arc<Self>, hub: Arc<ChannelHub>, cancel: CancellationToken) {
        let Some(mut rx) = lock(&self.inbound_rx).take() else {
            tracing::warn!("Relay inbound loop already running");
            return;
        };
        tracing::info!(node_id = %self.config.node_id, "Relay inbound loop started");
        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                frame = rx.recv() => {
                    let Some(frame) = frame else { break };
                    let delivered = hub
                        .deliver_local(&frame.channel, &frame.message, frame.exclude.as_deref())
                        .await;
                    tracing::trace!(
                        channel = %frame.channel,
                        origin = %frame.origin,
                        delivered,
                        "Relayed broadcast delivered"
                    );
                }
            }
        }
        self.unwatch_all();
        tracing::info!("Relay inbound loop stopped");
    }
}

fn lock<T>(mutex: &Mutex<T>) -> std::sync::MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}
