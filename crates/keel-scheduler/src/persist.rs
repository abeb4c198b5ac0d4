//! Persistence of terminal builds with retries.

use keel_core::{BuildJob, BuildStore, Result};
use std::sync::{Mutex, PoisonError};
use std::time::Duration;
use tracing::{error, info, warn};

/// Retry behaviour for `BuildStore::save_build`.
#[derive(Debug, Clone)]
pub struct RetryPolicy {
    /// Attempts per save, including the first
    pub attempts: u32,
    /// Delay before the second attempt, doubled after each failure
    pub initial_backoff: Duration,
    /// How often held builds are retried
    pub window: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            attempts: 4,
            initial_backoff: Duration::from_millis(250),
            window: Duration::from_secs(30),
        }
    }
}

/// Save `job`, backing off exponentially between failed attempts.
pub(crate) async fn save_with_retry(
    store: &dyn BuildStore,
    job: &BuildJob,
    policy: &RetryPolicy,
) -> Result<()> {
    let mut backoff = policy.initial_backoff;
    let mut attempt = 1;
    loop {
        match store.save_build(job).await {
            Ok(()) => return Ok(()),
            Err(e) if attempt < policy.attempts => {
                warn!(
                    build_id = %job.id,
                    attempt,
                    error = %e,
                    "Failed to persist build, retrying"
                );
                tokio::time::sleep(backoff).await;
                backoff = backoff.saturating_mul(2);
                attempt += 1;
            }
            Err(e) => return Err(e),
        }
    }
}

/// Terminal builds the store rejected, waiting for the next retry window.
#[derive(Default)]
pub(crate) struct HeldBuilds {
    jobs: Mutex<Vec<BuildJob>>,
}

impl HeldBuilds {
    pub fn hold(&self, job: BuildJob) {
        error!(build_id = %job.id, project = %job.project, "Holding build until the store recovers");
        self.lock().push(job);
    }

    pub fn len(&self) -> usize {
        self.lock().len()
    }

    /// Try every held build once; failures stay held.
    pub async fn flush(&self, store: &dyn BuildStore) {
        let held = std::mem::take(&mut *self.lock());
        if held.is_empty() {
            return;
        }

        let mut still_held = Vec::new();
        for job in held {
            match store.save_build(&job).await {
                Ok(()) => info!(build_id = %job.id, "Persisted held build"),
                Err(e) => {
                    warn!(build_id = %job.id, error = %e, "Held build still not persisted");
                    still_held.push(job);
                }
            }
        }
        self.lock().extend(still_held);
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, Vec<BuildJob>> {
        self.jobs.lock().unwrap_or_else(PoisonError::into_inner)
    }
}
