//! Handles returned to callers of `enqueue`.

use keel_core::{BuildJob, Error, ResourceId, Result};
use tokio::sync::watch;

/// How an enqueued job ended.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum JobOutcome {
    /// The job reached a terminal status.
    Completed(BuildJob),
    /// A newer push for the same branch replaced the job before it started.
    Superseded { by: ResourceId },
}

pub(crate) type OutcomeSender = watch::Sender<Option<JobOutcome>>;

pub(crate) fn outcome_channel(id: ResourceId) -> (OutcomeSender, JobHandle) {
    let (tx, rx) = watch::channel(None);
    (tx, JobHandle { id, rx })
}

/// Tracks one enqueued job.
#[derive(Debug, Clone)]
pub struct JobHandle {
    id: ResourceId,
    rx: watch::Receiver<Option<JobOutcome>>,
}

impl JobHandle {
    pub fn id(&self) -> ResourceId {
        self.id
    }

    /// The outcome, if the job already ended.
    pub fn outcome(&self) -> Option<JobOutcome> {
        self.rx.borrow().clone()
    }

    /// Wait until the job completes or is superseded.
    pub async fn wait(&self) -> Result<JobOutcome> {
        let mut rx = self.rx.clone();
        let outcome: Option<JobOutcome> = rx
            .wait_for(Option::is_some)
            .await
            .map(|current| (*current).clone())
            .map_err(|_| Error::Internal(format!("build {} was dropped by the scheduler", self.id)))?;
        outcome.ok_or_else(|| Error::Internal(format!("build {} has no outcome", self.id)))
    }
}
