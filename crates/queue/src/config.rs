use std::time::Duration;

/// Queue tuning. Loaded from `QUEUE_*` environment variables by the server.
#[derive(Debug, Clone)]
pub struct QueueConfig {
    /// Automatic and operator retries allowed per job.
    pub max_retries: u32,
    /// An active job whose heartbeat is older than this is requeued.
    pub heartbeat_timeout: Duration,
    /// Visibility timeout: how long a dequeued job stays hidden before it is
    /// offered again.
    pub offer_interval: Duration,
    /// Terminal jobs are kept this long before `clean` may drop them.
    pub cleanup_grace: Duration,
    /// TTL on job records in the store.
    pub record_ttl: Duration,
    /// TTL on per-job locks.
    pub lock_ttl: Duration,
    /// Waiting plus delayed jobs allowed before `enqueue` refuses work.
    pub max_pending: usize,
}

impl Default for QueueConfig {
    fn default() -> Self {
        Self {
            max_retries: 3,
            heartbeat_timeout: Duration::from_secs(120),
            offer_interval: Duration::from_secs(30),
            cleanup_grace: Duration::from_secs(3600),
            record_ttl: Duration::from_secs(24 * 60 * 60),
            lock_ttl: Duration::from_secs(5),
            max_pending: 10_000,
        }
    }
}
