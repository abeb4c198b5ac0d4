//! The scheduler: bounded worker pool over the job queue.

use keel_core::{BuildJob, BuildStatus, BuildStore, Builder, Error, Project, Result};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;
use tokio::sync::{Notify, mpsc};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::handle::{JobHandle, JobOutcome, OutcomeSender, outcome_channel};
use crate::persist::{HeldBuilds, RetryPolicy, save_with_retry};
use crate::queue::{JobQueue, QueueSnapshot, QueuedJob};
use crate::worker::Worker;

/// Scheduler tuning.
#[derive(Debug, Clone)]
pub struct SchedulerConfig {
    /// Number of workers, the hard cap on concurrent builds
    pub concurrency: usize,
    /// Maximum number of queued jobs
    pub backlog: usize,
    /// How long running builds may continue after a draining shutdown
    pub drain_grace: Duration,
    pub retry: RetryPolicy,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            concurrency: 5,
            backlog: 100,
            drain_grace: Duration::from_secs(30),
            retry: RetryPolicy::default(),
        }
    }
}

/// A build that reached a terminal status.
#[derive(Debug, Clone)]
pub struct CompletedBuild {
    pub project: Arc<Project>,
    pub job: BuildJob,
}

/// State shared between the scheduler handle and its workers.
pub(crate) struct Shared {
    config: SchedulerConfig,
    pub builder: Arc<dyn Builder>,
    pub store: Arc<dyn BuildStore>,
    queue: Mutex<JobQueue>,
    wakeup: Notify,
    /// Dropped at the end of shutdown so the dispatcher drains and stops
    events: Mutex<Option<mpsc::UnboundedSender<CompletedBuild>>>,
    held: HeldBuilds,
    /// Cancelled to kill running builds
    pub cancel_builds: CancellationToken,
}

impl Shared {
    fn queue(&self) -> MutexGuard<'_, JobQueue> {
        self.queue.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Wait for the next job, or `None` once the queue is closed.
    pub async fn next_job(&self) -> Option<QueuedJob> {
        loop {
            let notified = self.wakeup.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();
            {
                let mut queue = self.queue();
                if let Some(entry) = queue.pop() {
                    return Some(entry);
                }
                if queue.is_closed() {
                    return None;
                }
            }
            notified.await;
        }
    }

    pub fn release(&self, id: keel_core::ResourceId) {
        self.queue().finish(id);
    }

    /// Persist a terminal job, publish it and resolve its handle.
    pub async fn complete(&self, project: Arc<Project>, job: BuildJob, done: OutcomeSender) {
        debug_assert!(job.is_terminal());
        match job.status {
            BuildStatus::Success => info!(
                project = %project.name,
                build_id = %job.id,
                sha = %job.commit.sha,
                "Build succeeded"
            ),
            status => warn!(
                project = %project.name,
                build_id = %job.id,
                sha = %job.commit.sha,
                status = %status,
                error = job.error.as_deref().unwrap_or_default(),
                "Build did not succeed"
            ),
        }

        if let Err(e) = save_with_retry(self.store.as_ref(), &job, &self.config.retry).await {
            error!(build_id = %job.id, error = %e, "Failed to persist build");
            self.held.hold(job.clone());
        }

        let events = self
            .events
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone();
        let published = events.is_some_and(|events| {
            events
                .send(CompletedBuild {
                    project,
                    job: job.clone(),
                })
                .is_ok()
        });
        if !published {
            debug!(build_id = %job.id, "No listener for completed builds");
        }
        let _ = done.send(Some(JobOutcome::Completed(job)));
    }
}

#[derive(Default)]
struct Tasks {
    workers: Vec<JoinHandle<()>>,
    flusher: Option<JoinHandle<()>>,
    started: bool,
}

/// Accepts build jobs and runs them on a fixed pool of workers.
pub struct Scheduler {
    shared: Arc<Shared>,
    tasks: Mutex<Tasks>,
    stop_flusher: CancellationToken,
}

impl Scheduler {
    /// Create a scheduler and the receiving end of its completion events.
    pub fn new(
        config: SchedulerConfig,
        builder: Arc<dyn Builder>,
        store: Arc<dyn BuildStore>,
    ) -> (Self, mpsc::UnboundedReceiver<CompletedBuild>) {
        let (events, rx) = mpsc::unbounded_channel();
        let shared = Arc::new(Shared {
            config,
            builder,
            store,
            queue: Mutex::new(JobQueue::default()),
            wakeup: Notify::new(),
            events: Mutex::new(Some(events)),
            held: HeldBuilds::default(),
            cancel_builds: CancellationToken::new(),
        });
        let scheduler = Self {
            shared,
            tasks: Mutex::new(Tasks::default()),
            stop_flusher: CancellationToken::new(),
        };
        (scheduler, rx)
    }

    pub fn config(&self) -> &SchedulerConfig {
        &self.shared.config
    }

    /// Queue a pending job.
    ///
    /// Never waits: fails fast with `QueueFull`, `DuplicateInFlight` or
    /// `ShuttingDown`.
    pub fn enqueue(&self, project: Arc<Project>, job: BuildJob) -> Result<JobHandle> {
        check_queueable(&project, &job)?;
        let (entry, handle) = queued_job(project.clone(), job);
        let superseded = self.shared.queue().push(entry, self.shared.config.backlog)?;
        self.announce(&project, &handle, superseded);
        Ok(handle)
    }

    /// Queue several jobs of one project under a single queue lock.
    ///
    /// `QueueFull` and `ShuttingDown` reject the whole batch and nothing is
    /// queued. Otherwise each job has its own result, so a commit that is
    /// already in flight fails alone with `DuplicateInFlight`.
    pub fn enqueue_all(
        &self,
        project: Arc<Project>,
        jobs: Vec<BuildJob>,
    ) -> Result<Vec<Result<JobHandle>>> {
        for job in &jobs {
            check_queueable(&project, job)?;
        }
        let (entries, handles): (Vec<_>, Vec<_>) = jobs
            .into_iter()
            .map(|job| queued_job(project.clone(), job))
            .unzip();
        let pushed = self
            .shared
            .queue()
            .push_all(entries, self.shared.config.backlog)?;

        Ok(pushed
            .into_iter()
            .zip(handles)
            .map(|(pushed, handle)| {
                let superseded = pushed?;
                self.announce(&project, &handle, superseded);
                Ok(handle)
            })
            .collect())
    }

    fn announce(&self, project: &Project, handle: &JobHandle, superseded: Option<QueuedJob>) {
        let id = handle.id();
        if let Some(old) = superseded {
            info!(
                project = %project.name,
                build_id = %old.job.id,
                sha = %old.job.commit.sha,
                superseded_by = %id,
                "Superseded pending build"
            );
            let _ = old.done.send(Some(JobOutcome::Superseded { by: id }));
        }

        debug!(project = %project.name, build_id = %id, "Queued build");
        self.shared.wakeup.notify_one();
    }

    /// Spawn the workers and the persistence flusher.
    pub fn run(&self) {
        let mut tasks = self.lock_tasks();
        if tasks.started {
            warn!("Scheduler already running");
            return;
        }
        tasks.started = true;

        let concurrency = self.shared.config.concurrency.max(1);
        info!(concurrency, builder = self.shared.builder.name(), "Starting scheduler");
        for id in 0..concurrency {
            let worker = Worker::new(id, self.shared.clone());
            tasks.workers.push(tokio::spawn(worker.run()));
        }

        let shared = self.shared.clone();
        let stop = self.stop_flusher.clone();
        tasks.flusher = Some(tokio::spawn(async move {
            let window = shared.config.retry.window;
            loop {
                tokio::select! {
                    _ = stop.cancelled() => break,
                    _ = tokio::time::sleep(window) => shared.held.flush(shared.store.as_ref()).await,
                }
            }
        }));
    }

    pub fn snapshot(&self) -> QueueSnapshot {
        self.shared.queue().snapshot()
    }

    /// Terminal builds waiting for the store to recover.
    pub fn held_builds(&self) -> usize {
        self.shared.held.len()
    }

    /// Stop accepting jobs and wind down the workers.
    ///
    /// Queued jobs end as errored. With `drain`, running builds get the
    /// configured grace period before they are cancelled; without it they are
    /// cancelled at once.
    pub async fn shutdown(&self, drain: bool) {
        let pending = self.shared.queue().close();
        self.shared.wakeup.notify_waiters();
        info!(drain, aborted = pending.len(), "Shutting down scheduler");

        let reason = Error::Cancelled("server shutting down".to_string()).to_string();
        for QueuedJob {
            project,
            mut job,
            done,
        } in pending
        {
            job.abort(reason.clone());
            self.shared.complete(project, job, done).await;
        }

        let (workers, flusher) = {
            let mut tasks = self.lock_tasks();
            (std::mem::take(&mut tasks.workers), tasks.flusher.take())
        };

        if !drain {
            self.shared.cancel_builds.cancel();
        }
        let mut joined = Box::pin(futures::future::join_all(workers));
        if drain
            && tokio::time::timeout(self.shared.config.drain_grace, &mut joined)
                .await
                .is_ok()
        {
            debug!("Running builds drained");
        } else {
            if drain {
                warn!("Drain grace period expired, cancelling running builds");
            }
            self.shared.cancel_builds.cancel();
            joined.await;
        }

        self.stop_flusher.cancel();
        if let Some(flusher) = flusher {
            let _ = flusher.await;
        }
        self.shared.held.flush(self.shared.store.as_ref()).await;
        let held = self.shared.held.len();
        if held > 0 {
            error!(held, "Builds could not be persisted before shutdown");
        }
        self.shared
            .events
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        info!("Scheduler stopped");
    }

    fn lock_tasks(&self) -> MutexGuard<'_, Tasks> {
        self.tasks.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

/// Only pending jobs of `project` may enter the queue.
fn check_queueable(project: &Project, job: &BuildJob) -> Result<()> {
    if job.status != BuildStatus::Pending {
        return Err(Error::Internal(format!(
            "build {} is {}, only pending builds can be queued",
            job.id, job.status
        )));
    }
    if job.project != project.name {
        return Err(Error::Internal(format!(
            "build {} belongs to {}, not {}",
            job.id, job.project, project.name
        )));
    }
    Ok(())
}

fn queued_job(project: Arc<Project>, job: BuildJob) -> (QueuedJob, JobHandle) {
    let (done, handle) = outcome_channel(job.id);
    (QueuedJob { project, job, done }, handle)
}
