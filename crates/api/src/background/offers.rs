//! Periodic offer loop.
//!
//! Promotes delayed jobs whose time has come and re-offers waiting jobs
//! nobody accepted within the offer interval, highest tier first.

use std::sync::Arc;
use std::time::Duration;

use dispatch_core::jobs::Priority;
use dispatch_events::ChannelHub;
use dispatch_queue::JobQueue;
use tokio_util::sync::CancellationToken;

use crate::dispatch::offer_ready;

/// Run the offer loop until `cancel` is triggered.
pub async fn run(
    queue: Arc<JobQueue>,
    hub: Arc<ChannelHub>,
    period: Duration,
    cancel: CancellationToken,
) {
    tracing::info!(interval_secs = period.as_secs(), "Offer loop started");
    let mut interval = tokio::time::interval(period);

    loop {
        tokio::select! {
            _ = cancel.cancelled() => {
                tracing::info!("Offer loop stopping");
                break;
            }
            _ = interval.tick() => {
                let offered = run_once(&queue, &hub).await;
                if offered > 0 {
                    tracing::debug!(offered, "Offer loop: jobs offered");
                }
            }
        }
    }
}

/// One pass over every tier.
pub async fn run_once(queue: &JobQueue, hub: &ChannelHub) -> usize {
    let mut offered = 0;
    for priority in Priority::ALL {
        offered += offer_ready(queue, hub, priority).await;
    }
    offered
}
