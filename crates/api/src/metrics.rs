//! Dispatch counters and a rolling latency/error window.
//!
//! Recording is lock-free except for the window, which is a short
//! `std::sync::Mutex` section never held across an await.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Mutex;
use std::time::{Duration, Instant};

use chrono::Utc;
use dispatch_core::types::Timestamp;
use dispatch_events::{ChannelHub, RoleCounts};
use dispatch_queue::{JobQueue, QueueDepth};
use serde::Serialize;

struct Sample {
    at: Instant,
    latency: Duration,
    is_error: bool,
}

pub struct Metrics {
    started_at: Instant,
    window: Duration,
    messages_total: AtomicU64,
    errors_total: AtomicU64,
    dependency_failures: AtomicU64,
    emergencies_total: AtomicU64,
    jobs_accepted: AtomicU64,
    jobs_completed: AtomicU64,
    samples: Mutex<VecDeque<Sample>>,
}

/// Point-in-time view served by `GET /health/metrics`.
#[derive(Debug, Clone, Serialize)]
pub struct MetricsSnapshot {
    pub uptime_secs: u64,
    pub connections: RoleCounts,
    pub channels: usize,
    pub queue: QueueDepth,
    pub messages_total: u64,
    pub errors_total: u64,
    pub dependency_failures: u64,
    pub emergencies_total: u64,
    pub jobs_accepted: u64,
    pub jobs_completed: u64,
    /// Fraction of messages in the window that ended in an error.
    pub error_rate: f64,
    pub avg_latency_ms: f64,
    pub window_secs: u64,
    pub timestamp: Timestamp,
}

impl Metrics {
    pub fn new(window: Duration) -> Self {
        Self {
            started_at: Instant::now(),
            window,
            messages_total: AtomicU64::new(0),
            errors_total: AtomicU64::new(0),
            dependency_failures: AtomicU64::new(0),
            emergencies_total: AtomicU64::new(0),
            jobs_accepted: AtomicU64::new(0),
            jobs_completed: AtomicU64::new(0),
            samples: Mutex::new(VecDeque::new()),
        }
    }

    /// Record one handled inbound message.
    pub fn record_message(&self, latency: Duration, is_error: bool) {
        self.messages_total.fetch_add(1, Ordering::Relaxed);
        if is_error {
            self.errors_total.fetch_add(1, Ordering::Relaxed);
        }
        let now = Instant::now();
        let mut samples = self.lock_samples();
        samples.push_back(Sample {
            at: now,
            latency,
            is_error,
        });
        Self::evict(&mut samples, now, self.window);
    }

    pub fn record_dependency_failure(&self) {
        self.dependency_failures.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_emergency(&self) {
        self.emergencies_total.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_accepted(&self) {
        self.jobs_accepted.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_completed(&self) {
        self.jobs_completed.fetch_add(1, Ordering::Relaxed);
    }

    pub fn messages_total(&self) -> u64 {
        self.messages_total.load(Ordering::Relaxed)
    }

    pub fn errors_total(&self) -> u64 {
        self.errors_total.load(Ordering::Relaxed)
    }

    /// `(error_rate, avg_latency_ms)` over the rolling window.
    pub fn window_stats(&self) -> (f64, f64) {
        let mut samples = self.lock_samples();
        Self::evict(&mut samples, Instant::now(), self.window);
        if samples.is_empty() {
            return (0.0, 0.0);
        }
        let count = samples.len() as f64;
        let errors = samples.iter().filter(|s| s.is_error).count() as f64;
        let total_ms: f64 = samples
            .iter()
            .map(|s| s.latency.as_secs_f64() * 1000.0)
            .sum();
        (errors / count, total_ms / count)
    }

    pub async fn snapshot(&self, hub: &ChannelHub, queue: &JobQueue) -> MetricsSnapshot {
        let (error_rate, avg_latency_ms) = self.window_stats();
        MetricsSnapshot {
            uptime_secs: self.started_at.elapsed().as_secs(),
            connections: hub.registry().counts_by_role().await,
            channels: hub.channel_count().await,
            queue: queue.depth().await,
            messages_total: self.messages_total(),
            errors_total: self.errors_total(),
            dependency_failures: self.dependency_failures.load(Ordering::Relaxed),
            emergencies_total: self.emergencies_total.load(Ordering::Relaxed),
            jobs_accepted: self.jobs_accepted.load(Ordering::Relaxed),
            jobs_completed: self.jobs_completed.load(Ordering::Relaxed),
            error_rate,
            avg_latency_ms,
            window_secs: self.window.as_secs(),
            timestamp: Utc::now(),
        }
    }

    fn lock_samples(&self) -> std::sync::MutexGuard<'_, VecDeque<Sample>> {
        // A panic while holding the guard leaves the window usable.
        self.samples
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
    }

    fn evict(samples: &mut VecDeque<Sample>, now: Instant, window: Duration) {
        while samples
            .front()
            .is_some_and(|s| now.duration_since(s.at) > window)
        {
            samples.pop_front();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_window_reports_zeroes() {
        let metrics = Metrics::new(Duration::from_secs(60));
        assert_eq!(metrics.window_stats(), (0.0, 0.0));
    }

    #[test]
    fn error_rate_and_latency_cover_the_window() {
        let metrics = Metrics::new(Duration::from_secs(60));
        metrics.record_message(Duration::from_millis(10), false);
        metrics.record_message(Duration::from_millis(30), true);

        let (error_rate, avg_latency_ms) = metrics.window_stats();
        assert!((error_rate - 0.5).abs() < f64::EPSILON);
        assert!((avg_latency_ms - 20.0).abs() < 0.001);
        assert_eq!(metrics.messages_total(), 2);
        assert_eq!(metrics.errors_total(), 1);
    }

    #[test]
    fn old_samples_fall_out_of_the_window() {
        let metrics = Metrics::new(Duration::ZERO);
        metrics.record_message(Duration::from_millis(5), true);
        std::thread::sleep(Duration::from_millis(5));
        assert_eq!(metrics.window_stats(), (0.0, 0.0));
        assert_eq!(metrics.errors_total(), 1);
    }
}
