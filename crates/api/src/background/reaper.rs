//! Stale-job reaper.
//!
//! Active jobs whose heartbeat key expired are requeued (and re-offered by
//! the offer loop) or, at the retry limit, failed onto the dead-letter list.
//! Failures are announced to the job channel and to admins.

use std::sync::Arc;
use std::time::Duration;

use dispatch_core::channels::{job_channel, CHANNEL_ADMIN};
use dispatch_core::error::CoreError;
use dispatch_core::jobs::JobStatus;
use dispatch_core::protocol::ServerMessage;
use dispatch_events::ChannelHub;
use dispatch_queue::{JobQueue, ReapReport};
use tokio_util::sync::CancellationToken;

use crate::metrics::Metrics;

/// Run the reaper until `cancel` is triggered.
pub async fn run(
    queue: Arc<JobQueue>,
    hub: Arc<ChannelHub>,
    metrics: Arc<Metrics>,
    period: Duration,
    cancel: CancellationToken,
) {
    tracing::info!(interval_secs = period.as_secs(), "Job reaper started");
    let mut interval = tokio::time::interval(period);

    loop {
        tokio::select! {
            _ = cancel.cancelled() => {
                tracing::info!("Job reaper stopping");
                break;
            }
            _ = interval.tick() => {
                match run_once(&queue, &hub).await {
                    Ok(report) if !report.is_empty() => {
                        tracing::info!(
                            requeued = report.requeued.len(),
                            failed = report.failed.len(),
                            "Job reaper: stale jobs handled"
                        );
                    }
                    Ok(_) => tracing::debug!("Job reaper: nothing stale"),
                    Err(e) => {
                        metrics.record_dependency_failure();
                        tracing::error!(error = %e, "Job reaper: pass failed");
                    }
                }
            }
        }
    }
}

/// One reaper pass plus notifications.
pub async fn run_once(queue: &JobQueue, hub: &ChannelHub) -> Result<ReapReport, CoreError> {
    let report = queue.reap_stale().await?;

    for job_id in &report.requeued {
        let update = ServerMessage::JobStatusUpdate {
            job_id: *job_id,
            status: JobStatus::Waiting,
            contractor_id: None,
            notes: Some("Contractor heartbeat lost, job requeued".into()),
        };
        hub.broadcast(&job_channel(*job_id), &update).await;
        hub.broadcast(CHANNEL_ADMIN, &update).await;
    }
    for job_id in &report.failed {
        let update = ServerMessage::JobStatusUpdate {
            job_id: *job_id,
            status: JobStatus::Failed,
            contractor_id: None,
            notes: Some("Retry limit reached, moved to operator queue".into()),
        };
        hub.broadcast(&job_channel(*job_id), &update).await;
        hub.broadcast(CHANNEL_ADMIN, &update).await;
    }
    Ok(report)
}
