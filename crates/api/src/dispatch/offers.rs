use dispatch_core::channels::area_channel;
use dispatch_core::jobs::Priority;
use dispatch_core::protocol::ServerMessage;
use dispatch_events::ChannelHub;
use dispatch_queue::JobQueue;

/// Offer every visible waiting job on `priority`'s tier to its area channel.
///
/// Each dequeued job is hidden for the queue's offer interval, so calling
/// this repeatedly re-offers unclaimed jobs at most once per interval.
/// Returns the number of jobs offered.
pub async fn offer_ready(queue: &JobQueue, hub: &ChannelHub, priority: Priority) -> usize {
    let mut offered = 0;
    loop {
        let job = match queue.dequeue(priority).await {
            Ok(Some(job)) => job,
            Ok(None) => break,
            Err(e) => {
                tracing::warn!(priority = %priority, error = %e, "Dequeue failed, offers paused");
                break;
            }
        };
        let channel = area_channel(&job.area);
        let recipients = hub
            .broadcast(&channel, &ServerMessage::job_available(&job))
            .await;
        tracing::debug!(job_id = %job.id, channel = %channel, recipients, "Job offered");
        offered += 1;
    }
    offered
}
