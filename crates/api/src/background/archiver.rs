//! Archive catch-up and queue cleanup.
//!
//! Writes terminal jobs the dispatcher could not archive inline, then drops
//! archived jobs older than the cleanup grace period from the shared store.

use std::sync::Arc;
use std::time::Duration;

use dispatch_core::archive::JobArchive;
use dispatch_queue::JobQueue;
use tokio_util::sync::CancellationToken;

use crate::metrics::Metrics;

/// Outcome of one archiver pass.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct ArchivePass {
    pub archived: usize,
    pub failed: usize,
    pub cleaned: usize,
}

/// Run the archiver until `cancel` is triggered.
pub async fn run(
    queue: Arc<JobQueue>,
    archive: Arc<dyn JobArchive>,
    metrics: Arc<Metrics>,
    period: Duration,
    cancel: CancellationToken,
) {
    tracing::info!(
        interval_secs = period.as_secs(),
        backend = archive.backend(),
        grace_secs = queue.config().cleanup_grace.as_secs(),
        "Job archiver started"
    );
    let mut interval = tokio::time::interval(period);

    loop {
        tokio::select! {
            _ = cancel.cancelled() => {
                tracing::info!("Job archiver stopping");
                break;
            }
            _ = interval.tick() => {
                let pass = run_once(&queue, archive.as_ref(), &metrics).await;
                if pass != ArchivePass::default() {
                    tracing::info!(
                        archived = pass.archived,
                        failed = pass.failed,
                        cleaned = pass.cleaned,
                        "Job archiver: pass complete"
                    );
                }
            }
        }
    }
}

/// Archive what is pending, then clean.
pub async fn run_once(queue: &JobQueue, archive: &dyn JobArchive, metrics: &Metrics) -> ArchivePass {
    let mut pass = ArchivePass::default();

    let pending = match queue.unarchived_terminal().await {
        Ok(jobs) => jobs,
        Err(e) => {
            metrics.record_dependency_failure();
            tracing::error!(error = %e, "Job archiver: listing terminal jobs failed");
            return pass;
        }
    };

    for job in pending {
        if let Err(e) = archive.persist(&job).await {
            metrics.record_dependency_failure();
            tracing::warn!(job_id = %job.id, error = %e, "Job archiver: persist failed");
            pass.failed += 1;
            continue;
        }
        match queue.mark_archived(job.id).await {
            Ok(_) => pass.archived += 1,
            Err(e) => {
                tracing::warn!(job_id = %job.id, error = %e, "Job archiver: archived flag not recorded");
                pass.failed += 1;
            }
        }
    }

    match queue.clean(queue.config().cleanup_grace).await {
        Ok(cleaned) => pass.cleaned = cleaned,
        Err(e) => {
            metrics.record_dependency_failure();
            tracing::error!(error = %e, "Job archiver: cleanup failed");
        }
    }
    pass
}
