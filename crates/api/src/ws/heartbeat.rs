use std::sync::Arc;

use chrono::Utc;
use dispatch_events::ChannelHub;
use tokio_util::sync::CancellationToken;

use crate::config::DispatchConfig;

/// Ping every connection and drop idle ones on each heartbeat tick.
///
/// Runs until `cancel` is triggered.
pub async fn start_heartbeat(
    hub: Arc<ChannelHub>,
    config: DispatchConfig,
    cancel: CancellationToken,
) {
    tracing::info!(
        interval_secs = config.heartbeat_interval.as_secs(),
        idle_timeout_secs = config.idle_timeout.as_secs(),
        "WebSocket heartbeat started"
    );
    let mut interval = tokio::time::interval(config.heartbeat_interval);

    loop {
        tokio::select! {
            _ = cancel.cancelled() => {
                tracing::info!("WebSocket heartbeat stopping");
                break;
            }
            _ = interval.tick() => {
                let count = hub.registry().connection_count().await;
                tracing::debug!(count, "WebSocket heartbeat ping");
                hub.registry().ping_all().await;
                sweep_idle(&hub, config.idle_timeout).await;
            }
        }
    }
}

/// Close and remove connections with no client activity for `idle_timeout`.
/// Returns how many were removed.
pub async fn sweep_idle(hub: &ChannelHub, idle_timeout: std::time::Duration) -> usize {
    let Ok(idle) = chrono::Duration::from_std(idle_timeout) else {
        return 0;
    };
    let idle_ids = hub.registry().idle_since(Utc::now() - idle).await;

    let mut removed = 0;
    for conn_id in idle_ids {
        hub.registry().close(&conn_id).await;
        if hub.disconnect(&conn_id).await {
            tracing::info!(conn_id = %conn_id, "Idle connection removed");
            removed += 1;
        }
    }
    removed
}
