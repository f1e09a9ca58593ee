//! Cross-process fan-out between two hubs sharing one store.

use std::sync::Arc;
use std::time::Duration;

use dispatch_core::protocol::ServerMessage;
use dispatch_core::roles::Role;
use dispatch_events::{
    outbound_channel, ChannelHub, ConnectionRegistry, Outbound, OutboundReceiver, RelayBridge,
    RelayConfig,
};
use dispatch_store::{MemoryStore, StateStore};
use tokio_util::sync::CancellationToken;

struct Node {
    hub: Arc<ChannelHub>,
    relay: Arc<RelayBridge>,
}

fn node(store: Arc<dyn StateStore>, node_id: &str, cancel: &CancellationToken) -> Node {
    let relay = Arc::new(RelayBridge::new(
        store,
        RelayConfig {
            node_id: node_id.to_string(),
            enabled: true,
        },
    ));
    let hub = Arc::new(ChannelHub::with_relay(
        Arc::new(ConnectionRegistry::new()),
        Arc::clone(&relay),
    ));
    tokio::spawn(Arc::clone(&relay).run_inbound(Arc::clone(&hub), cancel.clone()));
    Node { hub, relay }
}

async fn join(node: &Node, conn_id: &str, channel: &str) -> OutboundReceiver {
    let (tx, rx) = outbound_channel();
    node.hub
        .registry()
        .add(conn_id.into(), Role::Contractor, Default::default(), tx)
        .await
        .unwrap();
    node.hub.subscribe(conn_id, channel).await.unwrap();
    rx
}

async fn recv(rx: &mut OutboundReceiver) -> Option<Outbound> {
    tokio::time::timeout(Duration::from_millis(500), rx.recv())
        .await
        .ok()
        .flatten()
}

// ---------------------------------------------------------------------------
// Test: broadcasts cross processes exactly once
// ---------------------------------------------------------------------------

#[tokio::test]
async fn broadcast_reaches_members_on_other_node() {
    let store: Arc<dyn StateStore> = Arc::new(MemoryStore::new());
    let cancel = CancellationToken::new();
    let a = node(Arc::clone(&store), "node-a", &cancel);
    let b = node(Arc::clone(&store), "node-b", &cancel);

    let mut on_a = join(&a, "a1", "area:logan").await;
    let mut on_b = join(&b, "b1", "area:logan").await;
    tokio::time::sleep(Duration::from_millis(50)).await;

    let msg = ServerMessage::JobTaken {
        job_id: uuid::Uuid::new_v4(),
    };
    assert_eq!(a.hub.broadcast("area:logan", &msg).await, 1);

    assert_eq!(recv(&mut on_a).await, Some(Outbound::Message(msg.clone())));
    assert_eq!(recv(&mut on_b).await, Some(Outbound::Message(msg)));

    // Own frames are ignored, so the local member got it once.
    tokio::time::sleep(Duration::from_millis(50)).await;
    assert!(on_a.try_recv().is_err());
    cancel.cancel();
}

#[tokio::test]
async fn relayed_broadcast_honours_exclusion() {
    let store: Arc<dyn StateStore> = Arc::new(MemoryStore::new());
    let cancel = CancellationToken::new();
    let a = node(Arc::clone(&store), "node-a", &cancel);
    let b = node(Arc::clone(&store), "node-b", &cancel);

    let _on_a = join(&a, "a1", "contractors").await;
    let mut excluded = join(&b, "b1", "contractors").await;
    let mut included = join(&b, "b2", "contractors").await;
    tokio::time::sleep(Duration::from_millis(50)).await;

    a.hub
        .broadcast_except("contractors", &ServerMessage::Pong, "b1")
        .await;

    assert_eq!(
        recv(&mut included).await,
        Some(Outbound::Message(ServerMessage::Pong))
    );
    assert!(recv(&mut excluded).await.is_none());
    cancel.cancel();
}

#[tokio::test]
async fn empty_channel_stops_being_watched() {
    let store: Arc<dyn StateStore> = Arc::new(MemoryStore::new());
    let cancel = CancellationToken::new();
    let a = node(store, "node-a", &cancel);

    let _rx = join(&a, "a1", "area:logan").await;
    assert_eq!(a.relay.watched_count(), 1);

    a.hub.disconnect("a1").await;
    assert_eq!(a.relay.watched_count(), 0);
    cancel.cancel();
}
