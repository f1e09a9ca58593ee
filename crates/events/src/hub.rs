//! Channel membership and broadcast.
//!
//! Lock order is connection entry, then channel table. Membership is
//! recorded on both sides (the connection's channel set and the table) so
//! [`ChannelHub::disconnect`] can clear a connection without scanning every
//! channel.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use dispatch_core::error::CoreError;
use dispatch_core::protocol::ServerMessage;
use dispatch_core::types::ConnectionId;
use tokio::sync::RwLock;

use crate::registry::{ConnectionRegistry, Outbound};
use crate::relay::RelayBridge;

pub struct ChannelHub {
    registry: Arc<ConnectionRegistry>,
    channels: RwLock<HashMap<String, HashSet<ConnectionId>>>,
    relay: Option<Arc<RelayBridge>>,
}

impl ChannelHub {
    /// Process-local hub with no cross-process relay.
    pub fn new(registry: Arc<ConnectionRegistry>) -> Self {
        Self {
            registry,
            channels: RwLock::new(HashMap::new()),
            relay: None,
        }
    }

    pub fn with_relay(registry: Arc<ConnectionRegistry>, relay: Arc<RelayBridge>) -> Self {
        Self {
            registry,
            channels: RwLock::new(HashMap::new()),
            relay: Some(relay),
        }
    }

    pub fn registry(&self) -> &Arc<ConnectionRegistry> {
        &self.registry
    }

    pub fn relay(&self) -> Option<&Arc<RelayBridge>> {
        self.relay.as_ref()
    }

    /// Add a connection to a channel, creating the channel on first use.
    ///
    /// Returns `true` if the membership is new; subscribing twice is a no-op.
    /// No access check happens here: callers authorize first.
    pub async fn subscribe(&self, conn_id: &str, channel: &str) -> Result<bool, CoreError> {
        let handle = self
            .registry
            .handle(conn_id)
            .await
            .ok_or_else(|| CoreError::connection_not_found(conn_id))?;
        let mut conn = handle.lock().await;
        if conn.is_closed() {
            return Err(CoreError::connection_not_found(conn_id));
        }
        if !conn.channels.insert(channel.to_string()) {
            return Ok(false);
        }

        let mut channels = self.channels.write().await;
        let members = channels.entry(channel.to_string()).or_insert_with(|| {
            if let Some(relay) = &self.relay {
                relay.watch(channel);
            }
            HashSet::new()
        });
        members.insert(conn_id.to_string());
        tracing::debug!(conn_id, channel, members = members.len(), "Subscribed");
        Ok(true)
    }

    /// Remove a connection from a channel. Unsubscribing a non-member is a
    /// no-op that returns `false`.
    pub async fn unsubscribe(&self, conn_id: &str, channel: &str) -> Result<bool, CoreError> {
        let handle = self
            .registry
            .handle(conn_id)
            .await
            .ok_or_else(|| CoreError::connection_not_found(conn_id))?;
        let mut conn = handle.lock().await;
        if !conn.channels.remove(channel) {
            return Ok(false);
        }
        let mut channels = self.channels.write().await;
        self.drop_member(&mut channels, channel, conn_id);
        tracing::debug!(conn_id, channel, "Unsubscribed");
        Ok(true)
    }

    /// Remove the registry entry and every channel membership it held.
    ///
    /// Returns `false` when the connection was already gone.
    pub async fn disconnect(&self, conn_id: &str) -> bool {
        let Some(joined) = self.registry.remove(conn_id).await else {
            return false;
        };
        let mut channels = self.channels.write().await;
        for channel in &joined {
            self.drop_member(&mut channels, channel, conn_id);
        }
        tracing::info!(conn_id, channels = joined.len(), "Connection removed");
        true
    }

    /// Deliver to current local members and relay to other processes.
    /// Returns the number of local recipients.
    pub async fn broadcast(&self, channel: &str, message: &ServerMessage) -> usize {
        if let Some(relay) = &self.relay {
            relay.publish(channel, message, None);
        }
        self.deliver_local(channel, message, None).await
    }

    /// [`broadcast`](Self::broadcast) skipping one connection (typically the
    /// sender).
    pub async fn broadcast_except(
        &self,
        channel: &str,
        message: &ServerMessage,
        excluded: &str,
    ) -> usize {
        if let Some(relay) = &self.relay {
            relay.publish(channel, message, Some(excluded));
        }
        self.deliver_local(channel, message, Some(excluded)).await
    }

    /// Deliver to local members only. Used for relayed frames.
    pub async fn deliver_local(
        &self,
        channel: &str,
        message: &ServerMessage,
        excluded: Option<&str>,
    ) -> usize {
        let members = self.members_of(channel).await;
        let mut delivered = 0;
        for member in members {
            if excluded == Some(member.as_str()) {
                continue;
            }
            if let Some(handle) = self.registry.handle(&member).await {
                if handle.lock().await.send(Outbound::Message(message.clone())) {
                    delivered += 1;
                }
            }
        }
        tracing::trace!(channel, kind = message.kind(), delivered, "Broadcast");
        delivered
    }

    pub async fn members_of(&self, channel: &str) -> Vec<ConnectionId> {
        self.channels
            .read()
            .await
            .get(channel)
            .map(|members| members.iter().cloned().collect())
            .unwrap_or_default()
    }

    pub async fn is_member(&self, conn_id: &str, channel: &str) -> bool {
        self.channels
            .read()
            .await
            .get(channel)
            .is_some_and(|members| members.contains(conn_id))
    }

    pub async fn channel_count(&self) -> usize {
        self.channels.read().await.len()
    }

    /// Close every connection and forget all channels.
    pub async fn shutdown(&self) -> usize {
        let count = self.registry.shutdown_all().await;
        self.channels.write().await.clear();
        if let Some(relay) = &self.relay {
            relay.unwatch_all();
        }
        count
    }

    fn drop_member(
        &self,
        channels: &mut HashMap<String, HashSet<ConnectionId>>,
        channel: &str,
        conn_id: &str,
    ) {
        let Some(members) = channels.get_mut(channel) else {
            return;
        };
        members.remove(conn_id);
        if members.is_empty() {
            channels.remove(channel);
            if let Some(relay) = &self.relay {
                relay.unwatch(channel);
            }
        }
    }
}
