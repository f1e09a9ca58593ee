//! Tests for `ChannelHub` membership and broadcast.

use std::sync::Arc;

use assert_matches::assert_matches;
use dispatch_core::error::CoreError;
use dispatch_core::protocol::ServerMessage;
use dispatch_core::roles::Role;
use dispatch_events::{outbound_channel, ChannelHub, ConnectionRegistry, Outbound, OutboundReceiver};

async fn hub_with(ids: &[&str]) -> (ChannelHub, Vec<OutboundReceiver>) {
    let registry = Arc::new(ConnectionRegistry::new());
    let mut receivers = Vec::new();
    for id in ids {
        let (tx, rx) = outbound_channel();
        registry
            .add(id.to_string(), Role::Contractor, Default::default(), tx)
            .await
            .unwrap();
        receivers.push(rx);
    }
    (ChannelHub::new(registry), receivers)
}

fn sorted(mut ids: Vec<String>) -> Vec<String> {
    ids.sort();
    ids
}

// ---------------------------------------------------------------------------
// Test: subscribe / unsubscribe net membership
// ---------------------------------------------------------------------------

#[tokio::test]
async fn subscribe_is_idempotent() {
    let (hub, _rx) = hub_with(&["a"]).await;
    assert!(hub.subscribe("a", "area:logan").await.unwrap());
    assert!(!hub.subscribe("a", "area:logan").await.unwrap());
    assert_eq!(hub.members_of("area:logan").await, vec!["a".to_string()]);
    assert_eq!(
        hub.registry().get("a").await.unwrap().channels,
        vec!["area:logan".to_string()]
    );
}

#[tokio::test]
async fn unsubscribe_non_member_is_noop() {
    let (hub, _rx) = hub_with(&["a", "b"]).await;
    hub.subscribe("a", "contractors").await.unwrap();
    assert!(!hub.unsubscribe("b", "contractors").await.unwrap());
    assert!(!hub.unsubscribe("a", "area:nowhere").await.unwrap());
    assert_eq!(hub.members_of("contractors").await, vec!["a".to_string()]);
}

#[tokio::test]
async fn sequences_yield_net_membership() {
    let (hub, _rx) = hub_with(&["a", "b", "c"]).await;
    hub.subscribe("a", "area:logan").await.unwrap();
    hub.subscribe("b", "area:logan").await.unwrap();
    hub.subscribe("c", "area:logan").await.unwrap();
    hub.unsubscribe("b", "area:logan").await.unwrap();
    hub.subscribe("b", "area:logan").await.unwrap();
    hub.unsubscribe("c", "area:logan").await.unwrap();
    hub.unsubscribe("c", "area:logan").await.unwrap();

    assert_eq!(
        sorted(hub.members_of("area:logan").await),
        vec!["a".to_string(), "b".to_string()]
    );
}

#[tokio::test]
async fn empty_channels_are_removed() {
    let (hub, _rx) = hub_with(&["a"]).await;
    hub.subscribe("a", "service:plumbing").await.unwrap();
    assert_eq!(hub.channel_count().await, 1);
    hub.unsubscribe("a", "service:plumbing").await.unwrap();
    assert_eq!(hub.channel_count().await, 0);
}

#[tokio::test]
async fn subscribe_unknown_connection_fails() {
    let (hub, _rx) = hub_with(&[]).await;
    assert_matches!(
        hub.subscribe("ghost", "clients").await,
        Err(CoreError::NotFound { .. })
    );
}

// ---------------------------------------------------------------------------
// Test: disconnect cascade
// ---------------------------------------------------------------------------

#[tokio::test]
async fn disconnect_removes_every_membership() {
    let (hub, _rx) = hub_with(&["a", "b"]).await;
    for channel in ["contractors", "area:logan", "service:roofing"] {
        hub.subscribe("a", channel).await.unwrap();
    }
    hub.subscribe("b", "contractors").await.unwrap();

    assert!(hub.disconnect("a").await);
    assert!(!hub.disconnect("a").await);

    assert_eq!(hub.members_of("contractors").await, vec!["b".to_string()]);
    assert!(hub.members_of("area:logan").await.is_empty());
    assert_eq!(hub.channel_count().await, 1);
    assert!(!hub.registry().contains("a").await);
}

// ---------------------------------------------------------------------------
// Test: broadcast
// ---------------------------------------------------------------------------

#[tokio::test]
async fn broadcast_reaches_members_only() {
    let (hub, mut rx) = hub_with(&["a", "b", "c"]).await;
    hub.subscribe("a", "area:logan").await.unwrap();
    hub.subscribe("b", "area:logan").await.unwrap();

    let msg = ServerMessage::Subscribed {
        channel: "area:logan".into(),
    };
    assert_eq!(hub.broadcast("area:logan", &msg).await, 2);

    assert_eq!(rx[0].recv().await, Some(Outbound::Message(msg.clone())));
    assert_eq!(rx[1].recv().await, Some(Outbound::Message(msg)));
    assert!(rx[2].try_recv().is_err());
}

#[tokio::test]
async fn broadcast_except_skips_sender() {
    let (hub, mut rx) = hub_with(&["a", "b"]).await;
    hub.subscribe("a", "contractors").await.unwrap();
    hub.subscribe("b", "contractors").await.unwrap();

    assert_eq!(
        hub.broadcast_except("contractors", &ServerMessage::Pong, "a").await,
        1
    );
    assert!(rx[0].try_recv().is_err());
    assert_eq!(rx[1].recv().await, Some(Outbound::Message(ServerMessage::Pong)));
}

#[tokio::test]
async fn broadcast_to_unknown_channel_reaches_nobody() {
    let (hub, _rx) = hub_with(&["a"]).await;
    assert_eq!(hub.broadcast("area:empty", &ServerMessage::Pong).await, 0);
}

#[tokio::test]
async fn concurrent_subscribe_and_disconnect_leave_no_dangling_members() {
    let (hub, _rx) = hub_with(&["a", "b", "c", "d"]).await;
    let hub = Arc::new(hub);
    let mut tasks = Vec::new();
    for id in ["a", "b", "c", "d"] {
        let hub = Arc::clone(&hub);
        tasks.push(tokio::spawn(async move {
            for n in 0..20 {
                let _ = hub.subscribe(id, &format!("area:zone-{n}")).await;
            }
        }));
    }
    for id in ["a", "c"] {
        let hub = Arc::clone(&hub);
        tasks.push(tokio::spawn(async move {
            hub.disconnect(id).await;
        }));
    }
    for task in tasks {
        task.await.unwrap();
    }

    for n in 0..20 {
        for member in hub.members_of(&format!("area:zone-{n}")).await {
            assert!(hub.registry().contains(&member).await, "dangling member {member}");
        }
    }
}
