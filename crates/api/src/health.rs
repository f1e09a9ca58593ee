//! Dependency health checks.
//!
//! Each check runs under its own timeout and reports a bool; nothing here
//! returns an error, so the health endpoints always answer.

use std::future::Future;
use std::time::Duration;

use chrono::Utc;
use dispatch_core::types::Timestamp;
use serde::Serialize;

use crate::state::AppState;

/// Upper bound for a single dependency probe.
const CHECK_TIMEOUT: Duration = Duration::from_secs(2);

#[derive(Debug, Clone, Copy, Serialize, PartialEq, Eq)]
pub struct HealthChecks {
    /// External job archive reachable.
    pub database: bool,
    /// Shared state store reachable.
    pub store: bool,
    /// Queue reachable and below its backlog limit.
    pub queue: bool,
}

#[derive(Debug, Clone, Serialize)]
pub struct HealthReport {
    /// `healthy` or `degraded`.
    pub status: &'static str,
    pub checks: HealthChecks,
    /// Names of the failed checks.
    pub failed: Vec<&'static str>,
    pub version: &'static str,
    pub timestamp: Timestamp,
}

impl HealthReport {
    pub fn is_healthy(&self) -> bool {
        self.failed.is_empty()
    }
}

/// Probe every dependency concurrently.
pub async fn check(state: &AppState) -> HealthReport {
    let (database, store, queue) = tokio::join!(
        probe("database", async { state.archive.ping().await.map_err(|e| e.to_string()) }),
        probe("store", async { state.store.ping().await.map_err(|e| e.to_string()) }),
        probe("queue", async {
            if state.queue.is_healthy().await {
                Ok(())
            } else {
                Err("unreachable or saturated".to_string())
            }
        }),
    );

    let checks = HealthChecks {
        database,
        store,
        queue,
    };
    let failed: Vec<&'static str> = [("database", database), ("store", store), ("queue", queue)]
        .into_iter()
        .filter(|(_, ok)| !ok)
        .map(|(name, _)| name)
        .collect();

    HealthReport {
        status: if failed.is_empty() { "healthy" } else { "degraded" },
        checks,
        failed,
        version: env!("CARGO_PKG_VERSION"),
        timestamp: Utc::now(),
    }
}

async fn probe<F>(name: &'static str, check: F) -> bool
where
    F: Future<Output = Result<(), String>>,
{
    match tokio::time::timeout(CHECK_TIMEOUT, check).await {
        Ok(Ok(())) => true,
        Ok(Err(e)) => {
            tracing::warn!(check = name, error = %e, "Health check failed");
            false
        }
        Err(_) => {
            tracing::warn!(check = name, "Health check timed out");
            false
        }
    }
}
