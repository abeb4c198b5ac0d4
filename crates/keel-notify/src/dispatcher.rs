//! Fan-out of completed builds to notification channels.

use keel_core::{
    BuildJob, BuildStatus, BuildStore, Error, NotificationPayload, NotifierKind, Project,
};
use keel_scheduler::CompletedBuild;
use futures::FutureExt;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use crate::registry::NotifierRegistry;

/// Builds inspected when looking for the previous verdict.
const HISTORY_LIMIT: usize = 20;

/// What happened to each channel of one dispatch.
#[derive(Debug, Default)]
pub struct DispatchReport {
    pub delivered: Vec<NotifierKind>,
    /// Channels with `on_change_only` whose status did not change
    pub skipped: Vec<NotifierKind>,
    /// One [`Error::NotifyFailed`] per failed channel
    pub failures: Vec<Error>,
}

pub struct Dispatcher {
    registry: NotifierRegistry,
    store: Arc<dyn BuildStore>,
    base_url: String,
}

impl Dispatcher {
    pub fn new(
        registry: NotifierRegistry,
        store: Arc<dyn BuildStore>,
        base_url: impl Into<String>,
    ) -> Self {
        Self {
            registry,
            store,
            base_url: base_url.into(),
        }
    }

    /// Notify every channel `project` configured about a terminal `job`.
    ///
    /// A failing channel never prevents delivery to the others.
    pub async fn dispatch(&self, project: &Project, job: &BuildJob) -> DispatchReport {
        let payload = NotificationPayload::from_build(job, &self.base_url);
        let mut report = DispatchReport::default();
        let mut previous: Option<Option<BuildStatus>> = None;

        for config in &project.notifiers {
            if config.on_change_only {
                let last = match previous {
                    Some(last) => last,
                    None => {
                        let last = self.previous_status(job).await;
                        previous = Some(last);
                        last
                    }
                };
                if last == Some(job.status) {
                    debug!(build_id = %job.id, channel = %config.kind, "Status unchanged, skipping");
                    report.skipped.push(config.kind);
                    continue;
                }
            }

            let Some(notifier) = self.registry.get(config.kind) else {
                warn!(build_id = %job.id, channel = %config.kind, "Notifier not enabled");
                report.failures.push(Error::NotifyFailed {
                    channel: config.kind.to_string(),
                    message: "channel not enabled".to_string(),
                });
                continue;
            };

            match notifier.send(&config.settings, &payload).await {
                Ok(()) => {
                    debug!(build_id = %job.id, channel = %config.kind, "Notification delivered");
                    report.delivered.push(config.kind);
                }
                Err(e) => {
                    warn!(
                        project = %project.name,
                        build_id = %job.id,
                        channel = %config.kind,
                        error = %e,
                        "Notification failed"
                    );
                    report.failures.push(Error::NotifyFailed {
                        channel: config.kind.to_string(),
                        message: e.to_string(),
                    });
                }
            }
        }
        report
    }

    /// Status of the last build of the project that finished before `job`.
    async fn previous_status(&self, job: &BuildJob) -> Option<BuildStatus> {
        match self
            .store
            .load_recent_builds_for_project(&job.project, HISTORY_LIMIT)
            .await
        {
            Ok(builds) => builds
                .into_iter()
                .filter(|b| b.id != job.id && b.is_terminal() && b.finished_at <= job.finished_at)
                .max_by_key(|b| (b.finished_at, b.id))
                .map(|b| b.status),
            Err(e) => {
                warn!(build_id = %job.id, error = %e, "Failed to load build history, notifying anyway");
                None
            }
        }
    }

    /// Consume completion events until the scheduler drops its sender.
    pub fn spawn(self: Arc<Self>, mut events: mpsc::UnboundedReceiver<CompletedBuild>) -> JoinHandle<()> {
        tokio::spawn(async move {
            while let Some(CompletedBuild { project, job }) = events.recv().await {
                let dispatched = AssertUnwindSafe(self.dispatch(&project, &job))
                    .catch_unwind()
                    .await;
                let Ok(report) = dispatched else {
                    error!(project = %project.name, build_id = %job.id, "Notification dispatch panicked");
                    continue;
                };
                info!(
                    project = %project.name,
                    build_id = %job.id,
                    status = %job.status,
                    delivered = report.delivered.len(),
                    skipped = report.skipped.len(),
                    failed = report.failures.len(),
                    "Dispatched notifications"
                );
            }
            info!("Notification dispatcher stopped");
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use keel_core::{
        BuildPolicy, BuildResult, Commit, GitProvider, Notifier, NotifierConfig, NotifierSettings,
        NotifyError,
    };
    use keel_db::MemoryStore;
    use std::sync::Mutex;

    struct MockNotifier {
        kind: NotifierKind,
        fail: bool,
        sent: Mutex<Vec<NotificationPayload>>,
    }

    impl MockNotifier {
        fn new(kind: NotifierKind, fail: bool) -> Arc<Self> {
            Arc::new(Self {
                kind,
                fail,
                sent: Mutex::new(Vec::new()),
            })
        }

        fn sent(&self) -> usize {
            self.sent.lock().unwrap().len()
        }
    }

    #[async_trait]
    impl Notifier for MockNotifier {
        fn kind(&self) -> NotifierKind {
            self.kind
        }

        async fn send(
            &self,
            _settings: &NotifierSettings,
            payload: &NotificationPayload,
        ) -> Result<(), NotifyError> {
            if self.fail {
                return Err(NotifyError::Transport("connection refused".to_string()));
            }
            self.sent.lock().unwrap().push(payload.clone());
            Ok(())
        }
    }

    fn notifier(kind: NotifierKind, on_change_only: bool) -> NotifierConfig {
        NotifierConfig {
            kind,
            settings: NotifierSettings::new(),
            on_change_only,
        }
    }

    fn project(notifiers: Vec<NotifierConfig>) -> Project {
        Project {
            name: "sample".to_string(),
            provider: GitProvider::Github,
            repository: "acme/sample".to_string(),
            clone_url: "https://github.com/acme/sample.git".to_string(),
            command: "make".to_string(),
            branches: vec![],
            policy: BuildPolicy::HeadOnly,
            secret: None,
            notifiers,
        }
    }

    fn finished(sha: &str, code: i32) -> BuildJob {
        let mut job = BuildJob::new(
            "sample",
            Commit {
                sha: sha.to_string(),
                author: "Ada".to_string(),
                message: format!("commit {}", sha),
                branch: "main".to_string(),
                timestamp: None,
            },
        );
        job.start();
        job.finish(BuildResult::exited(code, String::new(), false));
        job
    }

    #[tokio::test]
    async fn test_failing_channel_does_not_stop_others() {
        let email = MockNotifier::new(NotifierKind::Email, false);
        let irc = MockNotifier::new(NotifierKind::Irc, true);
        let chat = MockNotifier::new(NotifierKind::Chat, false);
        let mut registry = NotifierRegistry::new();
        registry.register(email.clone());
        registry.register(irc.clone());
        registry.register(chat.clone());

        let dispatcher = Dispatcher::new(registry, Arc::new(MemoryStore::new()), "http://ci.example.org");
        let project = project(vec![
            notifier(NotifierKind::Email, false),
            notifier(NotifierKind::Irc, false),
            notifier(NotifierKind::Chat, false),
        ]);
        let job = finished("c2", 0);

        let report = dispatcher.dispatch(&project, &job).await;
        assert_eq!(report.delivered, vec![NotifierKind::Email, NotifierKind::Chat]);
        assert_eq!(report.failures.len(), 1);
        assert!(matches!(
            &report.failures[0],
            Error::NotifyFailed { channel, .. } if channel == "irc"
        ));
        assert_eq!(email.sent(), 1);
        assert_eq!(chat.sent(), 1);
        assert_eq!(
            chat.sent.lock().unwrap()[0].build_url,
            format!("http://ci.example.org/sample/builds/{}", job.id)
        );
    }

    #[tokio::test]
    async fn test_on_change_only() {
        let email = MockNotifier::new(NotifierKind::Email, false);
        let mut registry = NotifierRegistry::new();
        registry.register(email.clone());
        let store = Arc::new(MemoryStore::new());
        let dispatcher = Dispatcher::new(registry, store.clone(), "http://ci.example.org");
        let project = project(vec![notifier(NotifierKind::Email, true)]);

        // First build always notifies
        let first = finished("c1", 0);
        store.save_build(&first).await.unwrap();
        let report = dispatcher.dispatch(&project, &first).await;
        assert_eq!(report.delivered, vec![NotifierKind::Email]);

        // Same status again
        let second = finished("c2", 0);
        store.save_build(&second).await.unwrap();
        let report = dispatcher.dispatch(&project, &second).await;
        assert_eq!(report.skipped, vec![NotifierKind::Email]);
        assert!(report.delivered.is_empty());

        // Status changed
        let third = finished("c3", 1);
        store.save_build(&third).await.unwrap();
        let report = dispatcher.dispatch(&project, &third).await;
        assert_eq!(report.delivered, vec![NotifierKind::Email]);
        assert_eq!(email.sent(), 2);
    }

    #[tokio::test]
    async fn test_disabled_channel_is_a_failure() {
        let dispatcher = Dispatcher::new(
            NotifierRegistry::new(),
            Arc::new(MemoryStore::new()),
            "http://ci.example.org",
        );
        let report = dispatcher
            .dispatch(&project(vec![notifier(NotifierKind::Webhook, false)]), &finished("c1", 0))
            .await;
        assert!(report.delivered.is_empty());
        assert_eq!(report.failures.len(), 1);
    }

    #[tokio::test]
    async fn test_spawn_consumes_events() {
        let chat = MockNotifier::new(NotifierKind::Chat, false);
        let mut registry = NotifierRegistry::new();
        registry.register(chat.clone());
        let dispatcher = Arc::new(Dispatcher::new(
            registry,
            Arc::new(MemoryStore::new()),
            "http://ci.example.org/",
        ));

        let (tx, rx) = mpsc::unbounded_channel();
        let task = dispatcher.spawn(rx);
        let project = Arc::new(project(vec![notifier(NotifierKind::Chat, false)]));
        for sha in ["c1", "c2"] {
            tx.send(CompletedBuild {
                project: project.clone(),
                job: finished(sha, 0),
            })
            .unwrap();
        }
        drop(tx);
        task.await.unwrap();

        let sent = chat.sent.lock().unwrap();
        assert_eq!(sent.len(), 2);
        assert!(sent[0].build_url.starts_with("http://ci.example.org/sample/builds/"));
    }

    /// Panics for one particular commit.
    struct PanickingNotifier;

    #[async_trait]
    impl Notifier for PanickingNotifier {
        fn kind(&self) -> NotifierKind {
            NotifierKind::Irc
        }

        async fn send(
            &self,
            _settings: &NotifierSettings,
            payload: &NotificationPayload,
        ) -> Result<(), NotifyError> {
            if payload.sha == "dead" {
                panic!("channel bug");
            }
            Ok(())
        }
    }

    #[tokio::test]
    async fn test_panicking_channel_does_not_stop_dispatcher() {
        let chat = MockNotifier::new(NotifierKind::Chat, false);
        let mut registry = NotifierRegistry::new();
        registry.register(Arc::new(PanickingNotifier));
        registry.register(chat.clone());
        let dispatcher = Arc::new(Dispatcher::new(
            registry,
            Arc::new(MemoryStore::new()),
            "http://ci.example.org",
        ));

        let (tx, rx) = mpsc::unbounded_channel();
        let task = dispatcher.spawn(rx);
        let project = Arc::new(project(vec![
            notifier(NotifierKind::Irc, false),
            notifier(NotifierKind::Chat, false),
        ]));
        for sha in ["dead", "beef", "aaaaaa\u{e9}b"] {
            tx.send(CompletedBuild {
                project: project.clone(),
                job: finished(sha, 0),
            })
            .unwrap();
        }
        drop(tx);
        task.await.unwrap();

        let sent = chat.sent.lock().unwrap();
        let shas: Vec<&str> = sent.iter().map(|p| p.sha.as_str()).collect();
        assert_eq!(shas, vec!["beef", "aaaaaa\u{e9}b"]);
        assert_eq!(sent[1].short_sha, "aaaaaa\u{e9}");
    }
}
