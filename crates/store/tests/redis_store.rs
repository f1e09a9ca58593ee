//! Runs against a live server when `REDIS_URL` is set; otherwise each test
//! returns early.

use std::time::Duration;

use dispatch_store::{RedisStore, StateStore};

async fn connect() -> Option<(RedisStore, redis::aio::ConnectionManager)> {
    let url = std::env::var("REDIS_URL").ok()?;
    let store = RedisStore::connect(&url).await.unwrap();
    let admin = redis::Client::open(url.as_str())
        .unwrap()
        .get_connection_manager()
        .await
        .unwrap();
    Some((store, admin))
}

async fn subscriber_count(admin: &mut redis::aio::ConnectionManager, channel: &str) -> i64 {
    let reply: (String, i64) = redis::cmd("PUBSUB")
        .arg("NUMSUB")
        .arg(channel)
        .query_async(admin)
        .await
        .unwrap();
    reply.1
}

async fn pubsub_clients(admin: &mut redis::aio::ConnectionManager) -> usize {
    let list: String = redis::cmd("CLIENT")
        .arg("LIST")
        .arg("TYPE")
        .arg("pubsub")
        .query_async(admin)
        .await
        .unwrap();
    list.lines().count()
}

// ---- Test: shared pub/sub connection ----

#[tokio::test]
async fn subscriptions_share_one_connection() {
    let Some((store, mut admin)) = connect().await else {
        return;
    };
    let prefix = uuid::Uuid::new_v4();
    let before = pubsub_clients(&mut admin).await;

    let mut receivers = Vec::new();
    for i in 0..20 {
        receivers.push(store.subscribe(&format!("relay:{prefix}:{i}")).await.unwrap());
    }
    assert_eq!(pubsub_clients(&mut admin).await, before + 1);

    // Messages are routed by channel.
    store.publish(&format!("relay:{prefix}:7"), "seven").await.unwrap();
    let got = tokio::time::timeout(Duration::from_secs(2), receivers[7].recv())
        .await
        .unwrap();
    assert_eq!(got.as_deref(), Some("seven"));
    assert!(receivers[3].try_recv().is_err());

    // The channel is released with its last receiver.

    let channel = format!("relay:{prefix}:shared");
    let first = store.subscribe(&channel).await.unwrap();
    let second = store.subscribe(&channel).await.unwrap();
    assert_eq!(subscriber_count(&mut admin, &channel).await, 1);

    drop(first);
    tokio::time::sleep(Duration::from_millis(100)).await;
    assert_eq!(subscriber_count(&mut admin, &channel).await, 1);

    drop(second);
    tokio::time::sleep(Duration::from_millis(100)).await;
    assert_eq!(subscriber_count(&mut admin, &channel).await, 0);
    assert_eq!(pubsub_clients(&mut admin).await, before + 1);
}
