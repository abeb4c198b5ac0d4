//! Worker that processes jobs from the queue.

use futures::FutureExt;
use keel_core::{BuildResult, Error};
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use tracing::{error, info, warn};

use crate::queue::QueuedJob;
use crate::scheduler::Shared;

/// A worker that pulls and builds jobs one at a time.
pub(crate) struct Worker {
    id: usize,
    shared: Arc<Shared>,
}

impl Worker {
    pub fn new(id: usize, shared: Arc<Shared>) -> Self {
        Self { id, shared }
    }

    /// Run the worker loop until the queue closes.
    pub async fn run(self) {
        info!(worker_id = self.id, "Starting worker");
        while let Some(entry) = self.shared.next_job().await {
            self.process(entry).await;
        }
        info!(worker_id = self.id, "Worker stopped");
    }

    async fn process(&self, entry: QueuedJob) {
        let QueuedJob {
            project,
            mut job,
            done,
        } = entry;

        job.start();
        info!(
            worker_id = self.id,
            project = %project.name,
            build_id = %job.id,
            sha = %job.commit.sha,
            "Starting build"
        );
        if let Err(e) = self.shared.store.save_build(&job).await {
            warn!(build_id = %job.id, error = %e, "Failed to record running build");
        }

        let cancel = self.shared.cancel_builds.child_token();
        let result = AssertUnwindSafe(self.shared.builder.execute(&project, &job, cancel))
            .catch_unwind()
            .await
            .unwrap_or_else(|_| {
                error!(build_id = %job.id, builder = self.shared.builder.name(), "Builder panicked");
                BuildResult::errored(
                    &Error::BuilderCrashed("builder panicked".to_string()),
                    String::new(),
                    false,
                )
            });

        job.finish(result);
        self.shared.release(job.id);
        self.shared.complete(project, job, done).await;
    }
}
