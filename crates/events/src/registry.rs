use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use chrono::Utc;
use dispatch_core::error::CoreError;
use dispatch_core::protocol::{ConnectionMetadata, ServerMessage};
use dispatch_core::roles::Role;
use dispatch_core::types::{ConnectionId, Timestamp};
use serde::Serialize;
use tokio::sync::{mpsc, Mutex, RwLock};

/// Frames queued for a connection's socket writer.
#[derive(Debug, Clone, PartialEq)]
pub enum Outbound {
    Message(ServerMessage),
    /// Transport-level ping.
    Ping,
    /// Close the transport.
    Close,
}

/// Sender half feeding a connection's socket writer.
pub type OutboundSender = mpsc::UnboundedSender<Outbound>;
pub type OutboundReceiver = mpsc::UnboundedReceiver<Outbound>;

/// Create the outbound queue for a new transport.
pub fn outbound_channel() -> (OutboundSender, OutboundReceiver) {
    mpsc::unbounded_channel()
}

/// A registered connection.
///
/// Owned by the registry; other components see [`ConnectionSnapshot`]s.
pub struct Connection {
    pub id: ConnectionId,
    pub role: Role,
    pub metadata: ConnectionMetadata,
    pub channels: HashSet<String>,
    pub connected_at: Timestamp,
    pub last_activity: Timestamp,
    sender: OutboundSender,
    /// Set under the entry lock when the connection is removed. Nothing is
    /// sent or subscribed after this flips.
    closed: bool,
}

impl Connection {
    fn snapshot(&self) -> ConnectionSnapshot {
        let mut channels: Vec<String> = self.channels.iter().cloned().collect();
        channels.sort();
        ConnectionSnapshot {
            id: self.id.clone(),
            role: self.role,
            metadata: self.metadata.clone(),
            channels,
            connected_at: self.connected_at,
            last_activity: self.last_activity,
        }
    }

    pub(crate) fn is_closed(&self) -> bool {
        self.closed
    }

    pub(crate) fn send(&self, message: Outbound) -> bool {
        !self.closed && self.sender.send(message).is_ok()
    }
}

/// Read-only copy of a connection's state.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ConnectionSnapshot {
    pub id: ConnectionId,
    pub role: Role,
    pub metadata: ConnectionMetadata,
    pub channels: Vec<String>,
    pub connected_at: Timestamp,
    pub last_activity: Timestamp,
}

/// Live connection counts.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct RoleCounts {
    pub client: usize,
    pub contractor: usize,
    pub admin: usize,
    pub total: usize,
}

pub(crate) type ConnectionHandle = Arc<Mutex<Connection>>;

/// Registered connections keyed by id.
///
/// The map lock is only held long enough to find an entry; mutations of one
/// connection are serialized by that entry's own mutex, so work on different
/// connections proceeds concurrently.
pub struct ConnectionRegistry {
    connections: RwLock<HashMap<ConnectionId, ConnectionHandle>>,
}

impl ConnectionRegistry {
    pub fn new() -> Self {
        Self {
            connections: RwLock::new(HashMap::new()),
        }
    }

    /// Register a connection. Fails with `Conflict` if the id is taken.
    pub async fn add(
        &self,
        id: ConnectionId,
        role: Role,
        metadata: ConnectionMetadata,
        sender: OutboundSender,
    ) -> Result<(), CoreError> {
        let mut connections = self.connections.write().await;
        if connections.contains_key(&id) {
            return Err(CoreError::Conflict(format!(
                "Connection {id} is already registered"
            )));
        }
        let now = Utc::now();
        let conn = Connection {
            id: id.clone(),
            role,
            metadata,
            channels: HashSet::new(),
            connected_at: now,
            last_activity: now,
            sender,
            closed: false,
        };
        connections.insert(id.clone(), Arc::new(Mutex::new(conn)));
        tracing::debug!(conn_id = %id, role = %role, "Connection registered");
        Ok(())
    }

    /// Drop the entry and mark it closed. Returns the channels it was in so
    /// the caller can clear memberships; use `ChannelHub::disconnect` for
    /// the full cascade.
    pub(crate) async fn remove(&self, id: &str) -> Option<HashSet<String>> {
        let handle = self.connections.write().await.remove(id)?;
        let mut conn = handle.lock().await;
        conn.closed = true;
        Some(std::mem::take(&mut conn.channels))
    }

    pub(crate) async fn handle(&self, id: &str) -> Option<ConnectionHandle> {
        self.connections.read().await.get(id).cloned()
    }

    pub async fn get(&self, id: &str) -> Option<ConnectionSnapshot> {
        let handle = self.handle(id).await?;
        let conn = handle.lock().await;
        (!conn.closed).then(|| conn.snapshot())
    }

    pub async fn contains(&self, id: &str) -> bool {
        self.connections.read().await.contains_key(id)
    }

    pub async fn role_of(&self, id: &str) -> Option<Role> {
        let handle = self.handle(id).await?;
        let role = handle.lock().await.role;
        Some(role)
    }

    /// Record activity. Returns `false` for unknown connections.
    pub async fn touch(&self, id: &str) -> bool {
        let Some(handle) = self.handle(id).await else {
            return false;
        };
        let mut conn = handle.lock().await;
        if conn.closed {
            return false;
        }
        conn.last_activity = Utc::now();
        true
    }

    /// Queue a message. Sends to removed or closed connections are no-ops.
    pub async fn send(&self, id: &str, message: ServerMessage) -> bool {
        match self.handle(id).await {
            Some(handle) => handle.lock().await.send(Outbound::Message(message)),
            None => false,
        }
    }

    /// Apply `update` to a connection's metadata and return the result.
    pub async fn update_metadata<F>(&self, id: &str, update: F) -> Option<ConnectionMetadata>
    where
        F: FnOnce(&mut ConnectionMetadata),
    {
        let handle = self.handle(id).await?;
        let mut conn = handle.lock().await;
        if conn.closed {
            return None;
        }
        update(&mut conn.metadata);
        Some(conn.metadata.clone())
    }

    pub async fn list_by_role(&self, role: Role) -> Vec<ConnectionId> {
        let mut ids = Vec::new();
        for handle in self.all_handles().await {
            let conn = handle.lock().await;
            if conn.role == role && !conn.closed {
                ids.push(conn.id.clone());
            }
        }
        ids
    }

    /// Connections with no activity since `cutoff`.
    pub async fn idle_since(&self, cutoff: Timestamp) -> Vec<ConnectionId> {
        let mut ids = Vec::new();
        for handle in self.all_handles().await {
            let conn = handle.lock().await;
            if conn.last_activity < cutoff && !conn.closed {
                ids.push(conn.id.clone());
            }
        }
        ids
    }

    pub async fn counts_by_role(&self) -> RoleCounts {
        let mut counts = RoleCounts::default();
        for handle in self.all_handles().await {
            let conn = handle.lock().await;
            if conn.closed {
                continue;
            }
            match conn.role {
                Role::Client => counts.client += 1,
                Role::Contractor => counts.contractor += 1,
                Role::Admin => counts.admin += 1,
            }
            counts.total += 1;
        }
        counts
    }

    pub async fn connection_count(&self) -> usize {
        self.connections.read().await.len()
    }

    /// Ask the connection's writer to close the transport. The entry stays
    /// until `ChannelHub::disconnect` runs.
    pub async fn close(&self, id: &str) -> bool {
        match self.handle(id).await {
            Some(handle) => handle.lock().await.send(Outbound::Close),
            None => false,
        }
    }

    /// Send a transport ping to every connection.
    pub async fn ping_all(&self) {
        for handle in self.all_handles().await {
            handle.lock().await.send(Outbound::Ping);
        }
    }

    /// Send Close to every connection and clear the map.
    ///
    /// Called during graceful shutdown; channel memberships die with the
    /// process.
    pub async fn shutdown_all(&self) -> usize {
        let drained: Vec<ConnectionHandle> = {
            let mut connections = self.connections.write().await;
            connections.drain().map(|(_, handle)| handle).collect()
        };
        let count = drained.len();
        for handle in drained {
            let mut conn = handle.lock().await;
            conn.send(Outbound::Close);
            conn.closed = true;
            conn.channels.clear();
        }
        tracing::info!(count, "Closed all dispatch connections");
        count
    }

    /// Snapshot of the map so entry locks are never taken while the map lock
    /// is held.
    async fn all_handles(&self) -> Vec<ConnectionHandle> {
        self.connections.read().await.values().cloned().collect()
    }
}

impl Default for ConnectionRegistry {
    fn default() -> Self {
        Self::new()
    }
}
