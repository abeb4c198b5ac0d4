//! In-memory job queue with per-branch coalescing.
//!
//! Pure bookkeeping: every operation runs under the scheduler's lock and
//! never awaits.

use keel_core::{BuildJob, Error, Project, ResourceId, Result};
use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::Arc;

use crate::handle::OutcomeSender;

/// `(project, branch)` for coalescing, `(project, sha)` for duplicates.
type Key = (String, String);

/// A job waiting for a worker.
pub(crate) struct QueuedJob {
    pub project: Arc<Project>,
    pub job: BuildJob,
    pub done: OutcomeSender,
}

impl QueuedJob {
    fn branch_key(&self) -> Key {
        (self.project.name.clone(), self.job.commit.branch.clone())
    }

    fn commit_key(&self) -> Key {
        (self.project.name.clone(), self.job.commit.sha.clone())
    }

    fn coalesces(&self) -> bool {
        !self.project.builds_all()
    }
}

/// Counts of queued and running jobs.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct QueueSnapshot {
    pub queued: usize,
    pub running: usize,
}

#[derive(Default)]
pub(crate) struct JobQueue {
    /// Pending jobs by id
    jobs: HashMap<ResourceId, QueuedJob>,
    /// FIFO of pending ids
    order: VecDeque<ResourceId>,
    /// Pending head-only job per branch
    heads: HashMap<Key, ResourceId>,
    /// Head-only commits pending or running
    in_flight: HashMap<Key, ResourceId>,
    /// Running jobs and the in-flight key they hold
    running: HashMap<ResourceId, Option<Key>>,
    closed: bool,
}

impl JobQueue {
    /// Append a job.
    ///
    /// Returns the pending job it superseded, if any.
    pub fn push(&mut self, entry: QueuedJob, backlog: usize) -> Result<Option<QueuedJob>> {
        if self.closed {
            return Err(Error::ShuttingDown);
        }

        let id = entry.job.id;
        let coalesces = entry.coalesces();
        if coalesces && self.in_flight.contains_key(&entry.commit_key()) {
            return Err(Error::DuplicateInFlight {
                project: entry.project.name.clone(),
                sha: entry.job.commit.sha.clone(),
            });
        }

        let replaced = if coalesces {
            self.heads.get(&entry.branch_key()).copied()
        } else {
            None
        };
        if replaced.is_none() && self.order.len() >= backlog {
            return Err(Error::QueueFull { capacity: backlog });
        }
        let superseded = replaced.and_then(|old| self.remove_pending(old));

        if coalesces {
            self.heads.insert(entry.branch_key(), id);
            self.in_flight.insert(entry.commit_key(), id);
        }
        self.order.push_back(id);
        self.jobs.insert(id, entry);
        Ok(superseded)
    }

    /// Append several jobs, checking capacity for the whole batch first.
    ///
    /// Either every job fits in the backlog or nothing is queued. Jobs that
    /// would only replace a pending head, or that are already in flight, do
    /// not count against the backlog. Each job still gets its own result.
    pub fn push_all(
        &mut self,
        entries: Vec<QueuedJob>,
        backlog: usize,
    ) -> Result<Vec<Result<Option<QueuedJob>>>> {
        if self.closed {
            return Err(Error::ShuttingDown);
        }

        let mut new_heads = HashSet::new();
        let growth = entries
            .iter()
            .filter(|entry| {
                if !entry.coalesces() {
                    return true;
                }
                if self.in_flight.contains_key(&entry.commit_key()) {
                    return false;
                }
                let branch = entry.branch_key();
                !self.heads.contains_key(&branch) && new_heads.insert(branch)
            })
            .count();
        if growth > 0 && self.order.len() + growth > backlog {
            return Err(Error::QueueFull { capacity: backlog });
        }

        Ok(entries
            .into_iter()
            .map(|entry| self.push(entry, usize::MAX))
            .collect())
    }

    /// Take the oldest pending job and mark it running.
    pub fn pop(&mut self) -> Option<QueuedJob> {
        while let Some(id) = self.order.pop_front() {
            let Some(entry) = self.jobs.remove(&id) else {
                continue;
            };
            let key = if entry.coalesces() {
                let branch = entry.branch_key();
                if self.heads.get(&branch) == Some(&id) {
                    self.heads.remove(&branch);
                }
                Some(entry.commit_key())
            } else {
                None
            };
            self.running.insert(id, key);
            return Some(entry);
        }
        None
    }

    /// Forget a job that left the running set.
    pub fn finish(&mut self, id: ResourceId) {
        if let Some(Some(key)) = self.running.remove(&id) {
            if self.in_flight.get(&key) == Some(&id) {
                self.in_flight.remove(&key);
            }
        }
    }

    /// Stop accepting jobs and hand back everything still pending.
    pub fn close(&mut self) -> Vec<QueuedJob> {
        self.closed = true;
        let ids: Vec<ResourceId> = self.order.iter().copied().collect();
        ids.into_iter()
            .filter_map(|id| self.remove_pending(id))
            .collect()
    }

    pub fn is_closed(&self) -> bool {
        self.closed
    }

    pub fn snapshot(&self) -> QueueSnapshot {
        QueueSnapshot {
            queued: self.order.len(),
            running: self.running.len(),
        }
    }

    fn remove_pending(&mut self, id: ResourceId) -> Option<QueuedJob> {
        let entry = self.jobs.remove(&id)?;
        self.order.retain(|queued| *queued != id);
        if entry.coalesces() {
            let branch = entry.branch_key();
            if self.heads.get(&branch) == Some(&id) {
                self.heads.remove(&branch);
            }
            let commit = entry.commit_key();
            if self.in_flight.get(&commit) == Some(&id) {
                self.in_flight.remove(&commit);
            }
        }
        Some(entry)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::handle::outcome_channel;
    use keel_core::{BuildPolicy, Commit, GitProvider};

    fn project(policy: BuildPolicy) -> Arc<Project> {
        Arc::new(Project {
            name: "sample".to_string(),
            provider: GitProvider::Github,
            repository: "acme/sample".to_string(),
            clone_url: "https://github.com/acme/sample.git".to_string(),
            command: "make".to_string(),
            branches: vec![],
            policy,
            secret: None,
            notifiers: vec![],
        })
    }

    fn entry(project: &Arc<Project>, sha: &str, branch: &str) -> QueuedJob {
        let job = BuildJob::new(
            project.name.clone(),
            Commit {
                sha: sha.to_string(),
                author: "Ada".to_string(),
                message: sha.to_string(),
                branch: branch.to_string(),
                timestamp: None,
            },
        );
        let (done, _) = outcome_channel(job.id);
        QueuedJob {
            project: project.clone(),
            job,
            done,
        }
    }

    #[test]
    fn test_head_only_supersedes_pending_job() {
        let project = project(BuildPolicy::HeadOnly);
        let mut queue = JobQueue::default();

        let first = entry(&project, "c1", "main");
        let first_id = first.job.id;
        assert!(queue.push(first, 10).unwrap().is_none());
        let superseded = queue.push(entry(&project, "c2", "main"), 10).unwrap();
        assert_eq!(superseded.unwrap().job.id, first_id);

        // Other branches are independent
        assert!(queue.push(entry(&project, "f1", "feature"), 10).unwrap().is_none());
        assert_eq!(queue.snapshot(), QueueSnapshot { queued: 2, running: 0 });

        assert_eq!(queue.pop().unwrap().job.commit.sha, "c2");
        assert_eq!(queue.pop().unwrap().job.commit.sha, "f1");
        assert!(queue.pop().is_none());
    }

    #[test]
    fn test_running_job_is_not_superseded() {
        let project = project(BuildPolicy::HeadOnly);
        let mut queue = JobQueue::default();

        queue.push(entry(&project, "c1", "main"), 10).unwrap();
        let running = queue.pop().unwrap();
        assert!(queue.push(entry(&project, "c2", "main"), 10).unwrap().is_none());
        assert_eq!(queue.snapshot(), QueueSnapshot { queued: 1, running: 1 });

        queue.finish(running.job.id);
        assert_eq!(queue.snapshot(), QueueSnapshot { queued: 1, running: 0 });
    }

    #[test]
    fn test_duplicate_in_flight() {
        let project = project(BuildPolicy::HeadOnly);
        let mut queue = JobQueue::default();

        queue.push(entry(&project, "c1", "main"), 10).unwrap();
        assert!(matches!(
            queue.push(entry(&project, "c1", "main"), 10),
            Err(Error::DuplicateInFlight { .. })
        ));

        // Still a duplicate while running, accepted again once finished
        let running = queue.pop().unwrap();
        assert!(queue.push(entry(&project, "c1", "main"), 10).is_err());
        queue.finish(running.job.id);
        assert!(queue.push(entry(&project, "c1", "main"), 10).is_ok());
    }

    #[test]
    fn test_build_all_keeps_every_commit() {
        let project = project(BuildPolicy::BuildAll);
        let mut queue = JobQueue::default();
        for sha in ["c1", "c2", "c2"] {
            assert!(queue.push(entry(&project, sha, "main"), 10).unwrap().is_none());
        }
        let shas: Vec<String> = std::iter::from_fn(|| queue.pop())
            .map(|e| e.job.commit.sha)
            .collect();
        assert_eq!(shas, vec!["c1", "c2", "c2"]);
    }

    #[test]
    fn test_backlog_limit() {
        let project = project(BuildPolicy::BuildAll);
        let mut queue = JobQueue::default();
        queue.push(entry(&project, "c1", "main"), 2).unwrap();
        queue.push(entry(&project, "c2", "main"), 2).unwrap();
        assert!(matches!(
            queue.push(entry(&project, "c3", "main"), 2),
            Err(Error::QueueFull { capacity: 2 })
        ));

        // Replacing a pending head does not grow the queue
        let head_only = self::project(BuildPolicy::HeadOnly);
        let mut queue = JobQueue::default();
        queue.push(entry(&head_only, "c1", "main"), 1).unwrap();
        assert!(queue.push(entry(&head_only, "c2", "main"), 1).unwrap().is_some());
    }

    #[test]
    fn test_batch_is_queued_whole_or_not_at_all() {
        let project = project(BuildPolicy::BuildAll);
        let mut queue = JobQueue::default();
        let batch = ["c1", "c2", "c3"].map(|sha| entry(&project, sha, "main"));
        assert!(matches!(
            queue.push_all(batch.into(), 2),
            Err(Error::QueueFull { capacity: 2 })
        ));
        assert_eq!(queue.snapshot(), QueueSnapshot::default());

        let batch = ["c1", "c2"].map(|sha| entry(&project, sha, "main"));
        let results = queue.push_all(batch.into(), 2).unwrap();
        assert!(results.iter().all(|r| matches!(r, Ok(None))));
        assert_eq!(queue.snapshot(), QueueSnapshot { queued: 2, running: 0 });
        assert!(queue.push_all(vec![entry(&project, "c3", "main")], 2).is_err());
    }

    #[test]
    fn test_batch_counts_only_new_heads() {
        let project = project(BuildPolicy::HeadOnly);
        let mut queue = JobQueue::default();
        queue.push(entry(&project, "c1", "main"), 2).unwrap();
        let running = queue.pop().unwrap();
        queue.push(entry(&project, "c2", "main"), 2).unwrap();

        // c1 is a duplicate, c3 replaces the pending head, f1 is the only growth
        let batch = vec![
            entry(&project, "c1", "main"),
            entry(&project, "c3", "main"),
            entry(&project, "f1", "feature"),
        ];
        let results = queue.push_all(batch, 2).unwrap();
        assert!(matches!(results[0], Err(Error::DuplicateInFlight { .. })));
        assert_eq!(results[1].as_ref().unwrap().as_ref().unwrap().job.commit.sha, "c2");
        assert!(matches!(results[2], Ok(None)));
        assert_eq!(queue.snapshot(), QueueSnapshot { queued: 2, running: 1 });

        queue.finish(running.job.id);
        assert!(matches!(
            queue.push_all(vec![entry(&project, "b1", "bugfix")], 2),
            Err(Error::QueueFull { capacity: 2 })
        ));
    }

    #[test]
    fn test_close_returns_pending_jobs() {
        let project = project(BuildPolicy::HeadOnly);
        let mut queue = JobQueue::default();
        queue.push(entry(&project, "c1", "main"), 10).unwrap();
        queue.pop().unwrap();
        queue.push(entry(&project, "c2", "main"), 10).unwrap();
        queue.push(entry(&project, "f1", "feature"), 10).unwrap();

        let pending = queue.close();
        assert_eq!(pending.len(), 2);
        assert!(queue.is_closed());
        assert_eq!(queue.snapshot(), QueueSnapshot { queued: 0, running: 1 });
        assert!(matches!(
            queue.push(entry(&project, "c3", "main"), 10),
            Err(Error::ShuttingDown)
        ));
    }
}
