//! Integration tests for `JobQueue` over the in-memory store.

use std::sync::Arc;
use std::time::Duration;

use assert_matches::assert_matches;
use chrono::Utc;
use dispatch_core::error::CoreError;
use dispatch_core::jobs::{JobKind, JobStatus, NewJob, Priority};
use dispatch_queue::{JobQueue, QueueConfig};
use dispatch_store::{MemoryStore, StateStore};

fn queue_with(config: QueueConfig) -> (Arc<JobQueue>, Arc<MemoryStore>) {
    let store = Arc::new(MemoryStore::new());
    let queue = Arc::new(JobQueue::new(store.clone() as Arc<dyn StateStore>, config));
    (queue, store)
}

fn queue() -> Arc<JobQueue> {
    queue_with(QueueConfig::default()).0
}

fn new_job(kind: JobKind, area: &str) -> NewJob {
    NewJob {
        kind,
        area: area.to_string(),
        payload: serde_json::json!({"description": "burst pipe"}),
        reporter: None,
        not_before: None,
    }
}

// ---------------------------------------------------------------------------
// Test: tier ordering
// ---------------------------------------------------------------------------

#[tokio::test]
async fn emergency_tier_is_dequeued_before_standard() {
    let queue = queue();
    let standard = queue
        .enqueue(new_job(JobKind::Standard, "logan"), Priority::Standard)
        .await
        .unwrap();
    let emergency = queue
        .enqueue(new_job(JobKind::Emergency, "logan"), Priority::Emergency)
        .await
        .unwrap();

    let mut offered = Vec::new();
    for priority in Priority::ALL {
        while let Some(job) = queue.dequeue(priority).await.unwrap() {
            offered.push(job.id);
        }
    }
    assert_eq!(offered, vec![emergency.id, standard.id]);
}

#[tokio::test]
async fn jobs_within_a_tier_are_fifo() {
    let queue = queue();
    let first = queue
        .enqueue(new_job(JobKind::Emergency, "a"), Priority::Emergency)
        .await
        .unwrap();
    let second = queue
        .enqueue(new_job(JobKind::Emergency, "b"), Priority::Emergency)
        .await
        .unwrap();

    assert_eq!(queue.dequeue(Priority::Emergency).await.unwrap().unwrap().id, first.id);
    assert_eq!(queue.dequeue(Priority::Emergency).await.unwrap().unwrap().id, second.id);
    assert!(queue.dequeue(Priority::Emergency).await.unwrap().is_none());
}

// ---------------------------------------------------------------------------
// Test: visibility timeout re-offers unclaimed jobs
// ---------------------------------------------------------------------------

#[tokio::test]
async fn unclaimed_job_is_offered_again_after_interval() {
    let (queue, _) = queue_with(QueueConfig {
        offer_interval: Duration::from_millis(40),
        ..QueueConfig::default()
    });
    let job = queue
        .enqueue(new_job(JobKind::Emergency, "logan"), Priority::Emergency)
        .await
        .unwrap();

    assert!(queue.dequeue(Priority::Emergency).await.unwrap().is_some());
    assert!(queue.dequeue(Priority::Emergency).await.unwrap().is_none());

    tokio::time::sleep(Duration::from_millis(70)).await;
    assert_eq!(
        queue.dequeue(Priority::Emergency).await.unwrap().map(|j| j.id),
        Some(job.id)
    );
}

#[tokio::test]
async fn claimed_job_is_not_offered_again() {
    let (queue, _) = queue_with(QueueConfig {
        offer_interval: Duration::from_millis(10),
        ..QueueConfig::default()
    });
    let job = queue
        .enqueue(new_job(JobKind::Emergency, "logan"), Priority::Emergency)
        .await
        .unwrap();
    queue.claim(job.id, "contractor-1").await.unwrap();

    tokio::time::sleep(Duration::from_millis(30)).await;
    assert!(queue.dequeue(Priority::Emergency).await.unwrap().is_none());
}

// ---------------------------------------------------------------------------
// Test: scheduled jobs honour not_before
// ---------------------------------------------------------------------------

#[tokio::test]
async fn scheduled_job_waits_for_not_before() {
    let queue = queue();
    let mut input = new_job(JobKind::Scheduled, "ipswich");
    input.not_before = Some(Utc::now() + chrono::Duration::milliseconds(60));
    let job = queue.enqueue(input, Priority::Scheduled).await.unwrap();
    assert_eq!(job.status, JobStatus::Delayed);

    assert!(queue.dequeue(Priority::Scheduled).await.unwrap().is_none());
    assert_eq!(queue.get_queue_depth(Priority::Scheduled).await.delayed, 1);

    tokio::time::sleep(Duration::from_millis(90)).await;
    let promoted = queue.dequeue(Priority::Scheduled).await.unwrap().unwrap();
    assert_eq!(promoted.id, job.id);
    assert_eq!(promoted.status, JobStatus::Waiting);
    assert_eq!(
        queue.get_status(job.id).await.unwrap().status,
        JobStatus::Waiting
    );
}

// ---------------------------------------------------------------------------
// Test: claims are exclusive
// ---------------------------------------------------------------------------

#[tokio::test]
async fn concurrent_claims_have_exactly_one_winner() {
    let queue = queue();
    let job = queue
        .enqueue(new_job(JobKind::Emergency, "brisbane-cbd"), Priority::Emergency)
        .await
        .unwrap();

    let mut handles = Vec::new();
    for n in 0..10 {
        let queue = Arc::clone(&queue);
        handles.push(tokio::spawn(async move {
            queue.claim(job.id, &format!("contractor-{n}")).await
        }));
    }

    let mut winners = Vec::new();
    for handle in handles {
        match handle.await.unwrap() {
            Ok(job) => winners.push(job.assigned_contractor.unwrap()),
            Err(e) => assert_matches!(e, CoreError::LockContention(_) | CoreError::Conflict(_)),
        }
    }
    assert_eq!(winners.len(), 1);

    let stored = queue.get_status(job.id).await.unwrap();
    assert_eq!(stored.status, JobStatus::Active);
    assert_eq!(stored.assigned_contractor.as_ref(), Some(&winners[0]));
}

#[tokio::test]
async fn claim_of_unknown_job_is_not_found() {
    let queue = queue();
    assert_matches!(
        queue.claim(uuid::Uuid::new_v4(), "c").await,
        Err(CoreError::NotFound { .. })
    );
}

#[tokio::test]
async fn held_lock_surfaces_as_contention() {
    let (queue, store) = queue_with(QueueConfig::default());
    let job = queue
        .enqueue(new_job(JobKind::Emergency, "logan"), Priority::Emergency)
        .await
        .unwrap();
    store
        .acquire_lock(&format!("lock:job:{}", job.id), Duration::from_secs(5))
        .await
        .unwrap()
        .unwrap();

    assert_matches!(
        queue.claim(job.id, "c").await,
        Err(CoreError::LockContention(_))
    );
    assert_eq!(
        queue.get_status(job.id).await.unwrap().status,
        JobStatus::Waiting
    );
}

// ---------------------------------------------------------------------------
// Test: completion
// ---------------------------------------------------------------------------

#[tokio::test]
async fn only_assignee_can_complete() {
    let queue = queue();
    let job = queue
        .enqueue(new_job(JobKind::Emergency, "logan"), Priority::Emergency)
        .await
        .unwrap();
    queue.claim(job.id, "owner").await.unwrap();

    assert_matches!(
        queue.mark_completed(job.id, Some("intruder")).await,
        Err(CoreError::Forbidden(_))
    );
    let done = queue.mark_completed(job.id, Some("owner")).await.unwrap();
    assert_eq!(done.status, JobStatus::Completed);
    assert_matches!(
        queue.mark_completed(job.id, Some("owner")).await,
        Err(CoreError::Conflict(_))
    );
}

// ---------------------------------------------------------------------------
// Test: reaper and retry bounds
// ---------------------------------------------------------------------------

#[tokio::test]
async fn reaper_requeues_until_limit_then_fails() {
    let (queue, _) = queue_with(QueueConfig {
        max_retries: 2,
        heartbeat_timeout: Duration::from_millis(20),
        ..QueueConfig::default()
    });
    let job = queue
        .enqueue(new_job(JobKind::Emergency, "logan"), Priority::Emergency)
        .await
        .unwrap();

    for expected_retry in 1..=2 {
        queue.claim(job.id, "flaky").await.unwrap();
        tokio::time::sleep(Duration::from_millis(40)).await;
        let report = queue.reap_stale().await.unwrap();
        assert_eq!(report.requeued, vec![job.id]);

        let stored = queue.get_status(job.id).await.unwrap();
        assert_eq!(stored.status, JobStatus::Waiting);
        assert_eq!(stored.retry_count, expected_retry);
        assert!(stored.assigned_contractor.is_none());
    }

    queue.claim(job.id, "flaky").await.unwrap();
    tokio::time::sleep(Duration::from_millis(40)).await;
    let report = queue.reap_stale().await.unwrap();
    assert_eq!(report.failed, vec![job.id]);

    let stored = queue.get_status(job.id).await.unwrap();
    assert_eq!(stored.status, JobStatus::Failed);
    assert_eq!(stored.retry_count, 2);

    let dead: Vec<_> = queue.dead_letters().await.unwrap().into_iter().map(|j| j.id).collect();
    assert_eq!(dead, vec![job.id]);

    // Failed jobs are never re-enqueued automatically.
    assert!(queue.dequeue(Priority::Emergency).await.unwrap().is_none());
    assert!(queue.reap_stale().await.unwrap().is_empty());

    // Operator retry is bounded too.
    assert_matches!(queue.retry(job.id).await, Err(CoreError::Conflict(_)));
}

#[tokio::test]
async fn heartbeat_keeps_active_job_alive() {
    let (queue, _) = queue_with(QueueConfig {
        heartbeat_timeout: Duration::from_millis(60),
        ..QueueConfig::default()
    });
    let job = queue
        .enqueue(new_job(JobKind::Emergency, "logan"), Priority::Emergency)
        .await
        .unwrap();
    queue.claim(job.id, "steady").await.unwrap();

    for _ in 0..3 {
        tokio::time::sleep(Duration::from_millis(30)).await;
        assert!(queue.heartbeat(job.id).await.unwrap());
    }
    assert!(queue.reap_stale().await.unwrap().is_empty());
    assert_eq!(
        queue.get_status(job.id).await.unwrap().status,
        JobStatus::Active
    );
}

#[tokio::test]
async fn operator_retry_requeues_failed_job() {
    let queue = queue();
    let job = queue
        .enqueue(new_job(JobKind::Standard, "logan"), Priority::Standard)
        .await
        .unwrap();
    queue.mark_failed(job.id, "no contractor").await.unwrap();
    assert_eq!(queue.dead_letters().await.unwrap().len(), 1);

    let retried = queue.retry(job.id).await.unwrap();
    assert_eq!(retried.status, JobStatus::Waiting);
    assert_eq!(retried.retry_count, 1);
    assert!(queue.dead_letters().await.unwrap().is_empty());
    assert_eq!(
        queue.dequeue(Priority::Standard).await.unwrap().map(|j| j.id),
        Some(job.id)
    );
}

#[tokio::test]
async fn retry_of_waiting_job_is_conflict() {
    let queue = queue();
    let job = queue
        .enqueue(new_job(JobKind::Standard, "logan"), Priority::Standard)
        .await
        .unwrap();
    assert_matches!(queue.retry(job.id).await, Err(CoreError::Conflict(_)));
}

// ---------------------------------------------------------------------------
// Test: clean only drops archived terminal jobs
// ---------------------------------------------------------------------------

#[tokio::test]
async fn clean_waits_for_archive() {
    let queue = queue();
    let job = queue
        .enqueue(new_job(JobKind::Emergency, "logan"), Priority::Emergency)
        .await
        .unwrap();
    queue.claim(job.id, "c").await.unwrap();
    queue.mark_completed(job.id, Some("c")).await.unwrap();
    tokio::time::sleep(Duration::from_millis(5)).await;

    assert_eq!(queue.clean(Duration::ZERO).await.unwrap(), 0);
    assert_eq!(queue.unarchived_terminal().await.unwrap().len(), 1);

    queue.mark_archived(job.id).await.unwrap();
    assert!(queue.unarchived_terminal().await.unwrap().is_empty());
    assert_eq!(queue.clean(Duration::ZERO).await.unwrap(), 1);
    assert_matches!(
        queue.get_status(job.id).await,
        Err(CoreError::NotFound { .. })
    );
}

#[tokio::test]
async fn clean_respects_grace_period() {
    let queue = queue();
    let job = queue
        .enqueue(new_job(JobKind::Standard, "logan"), Priority::Standard)
        .await
        .unwrap();
    queue.mark_failed(job.id, "cancelled").await.unwrap();
    queue.mark_archived(job.id).await.unwrap();

    assert_eq!(queue.clean(Duration::from_secs(3600)).await.unwrap(), 0);
    assert!(queue.get_status(job.id).await.is_ok());
}

// ---------------------------------------------------------------------------
// Test: saturation and health
// ---------------------------------------------------------------------------

#[tokio::test]
async fn saturated_queue_refuses_work_and_reports_unhealthy() {
    let (queue, _) = queue_with(QueueConfig {
        max_pending: 2,
        ..QueueConfig::default()
    });
    assert!(queue.is_healthy().await);
    for _ in 0..2 {
        queue
            .enqueue(new_job(JobKind::Standard, "logan"), Priority::Standard)
            .await
            .unwrap();
    }

    assert_matches!(
        queue
            .enqueue(new_job(JobKind::Standard, "logan"), Priority::Standard)
            .await,
        Err(CoreError::Conflict(_))
    );
    assert!(!queue.is_healthy().await);
}

#[tokio::test]
async fn depth_counts_by_status() {
    let queue = queue();
    let a = queue
        .enqueue(new_job(JobKind::Emergency, "x"), Priority::Emergency)
        .await
        .unwrap();
    queue
        .enqueue(new_job(JobKind::Emergency, "y"), Priority::Emergency)
        .await
        .unwrap();
    queue.claim(a.id, "c").await.unwrap();

    let counts = queue.get_queue_depth(Priority::Emergency).await;
    assert_eq!((counts.waiting, counts.active), (1, 1));
    assert_eq!(counts.total(), 2);
    assert_eq!(queue.get_queue_depth(Priority::Standard).await.total(), 0);
}
