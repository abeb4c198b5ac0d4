//! Shared fixtures for the API tests.

use async_trait::async_trait;
use hmac::{Hmac, Mac};
use keel_config::{ServerConfig, parse_server_config};
use keel_core::{
    BuildJob, BuildResult, BuildStore, Builder, NotificationPayload, Notifier, NotifierKind,
    NotifierSettings, NotifyError, Project,
};
use keel_db::MemoryStore;
use keel_scheduler::{Scheduler, SchedulerConfig};
use sha2::Sha256;
use std::sync::{Arc, Mutex};
use tokio_util::sync::CancellationToken;

use crate::ingest::WebhookIngestor;

pub const SECRET: &str = "s3cret";
pub const ADMIN_TOKEN: &str = "letmein";

pub const CONFIG: &str = r#"
    database "memory"
    directory "/tmp/keel-test"
    base-url "http://ci.example.org/"
    webhook "github" secret="s3cret"
    webhook "gitlab" secret="s3cret"
    admin-token "letmein"
    notifiers "email" "chat"

    project "sample" {
        repository "acme/sample"
        command "make test"
        branches "main"
        notifier "email" {
            to "dev@example.org"
        }
        notifier "chat" {
            url "http://chat.example.org/hook"
        }
    }

    project "everything" {
        repository "acme/everything"
        command "make"
        build-all #true
    }

    project "lab" {
        provider "gitlab"
        repository "acme/lab"
        command "make"
    }
"#;

pub fn config() -> ServerConfig {
    parse_server_config(CONFIG).unwrap()
}

/// The same projects with no webhook secrets at all.
pub fn unsigned_config() -> ServerConfig {
    let mut config = config();
    config.webhook_secrets.clear();
    config
}

pub struct Fixture {
    pub ingestor: WebhookIngestor,
    pub scheduler: Arc<Scheduler>,
    pub store: Arc<dyn BuildStore>,
}

/// Ingestor over a scheduler that is never started, so queued jobs stay put.
pub async fn ingestor() -> Fixture {
    ingestor_with(config()).await
}

pub async fn ingestor_with(config: ServerConfig) -> Fixture {
    let store = seeded_store(&config).await;
    let scheduler_config = SchedulerConfig {
        backlog: config.backlog,
        ..SchedulerConfig::default()
    };
    let (scheduler, _events) = Scheduler::new(
        scheduler_config,
        Arc::new(InstantBuilder::default()),
        store.clone(),
    );
    let scheduler = Arc::new(scheduler);
    Fixture {
        ingestor: WebhookIngestor::new(Arc::new(config), store.clone(), scheduler.clone()),
        scheduler,
        store,
    }
}

pub async fn seeded_store(config: &ServerConfig) -> Arc<dyn BuildStore> {
    let store: Arc<dyn BuildStore> = Arc::new(MemoryStore::new());
    for project in &config.projects {
        store.save_project(project).await.unwrap();
    }
    store
}

fn commits(shas: &[&str]) -> Vec<serde_json::Value> {
    shas.iter()
        .map(|sha| {
            serde_json::json!({
                "id": sha,
                "message": format!("commit {}", sha),
                "timestamp": "2024-05-01T12:00:00Z",
                "author": { "name": "Ada", "email": "ada@example.org" }
            })
        })
        .collect()
}

pub fn github_push(repository: &str, branch: &str, shas: &[&str]) -> Vec<u8> {
    let commits = commits(shas);
    let payload = serde_json::json!({
        "ref": format!("refs/heads/{}", branch),
        "before": "1111111111111111111111111111111111111111",
        "after": shas.last().copied().unwrap_or_default(),
        "repository": { "full_name": repository },
        "pusher": { "name": "ada" },
        "head_commit": commits.last().cloned(),
        "commits": commits,
    });
    serde_json::to_vec(&payload).unwrap()
}

pub fn gitlab_push(repository: &str, branch: &str, shas: &[&str]) -> Vec<u8> {
    let payload = serde_json::json!({
        "object_kind": "push",
        "ref": format!("refs/heads/{}", branch),
        "before": "1111111111111111111111111111111111111111",
        "after": shas.last().copied().unwrap_or_default(),
        "user_username": "ada",
        "project": { "path_with_namespace": repository },
        "commits": commits(shas),
    });
    serde_json::to_vec(&payload).unwrap()
}

/// `X-Hub-Signature-256` value for `body`.
pub fn sign(body: &[u8]) -> String {
    let mut mac = Hmac::<Sha256>::new_from_slice(SECRET.as_bytes()).unwrap();
    mac.update(body);
    format!("sha256={}", hex::encode(mac.finalize().into_bytes()))
}

/// Succeeds immediately and records what it built.
#[derive(Default)]
pub struct InstantBuilder {
    pub built: Mutex<Vec<String>>,
}

#[async_trait]
impl Builder for InstantBuilder {
    fn name(&self) -> &'static str {
        "instant"
    }

    async fn execute(
        &self,
        _project: &Project,
        job: &BuildJob,
        _cancel: CancellationToken,
    ) -> BuildResult {
        self.built.lock().unwrap().push(job.commit.sha.clone());
        BuildResult::exited(0, format!("built {}\n", job.commit.sha), false)
    }
}

/// Records every payload instead of delivering it.
pub struct RecordingNotifier {
    kind: NotifierKind,
    pub sent: Arc<Mutex<Vec<NotificationPayload>>>,
}

impl RecordingNotifier {
    pub fn new(kind: NotifierKind) -> Self {
        Self {
            kind,
            sent: Arc::default(),
        }
    }
}

#[async_trait]
impl Notifier for RecordingNotifier {
    fn kind(&self) -> NotifierKind {
        self.kind
    }

    async fn send(
        &self,
        _settings: &NotifierSettings,
        payload: &NotificationPayload,
    ) -> Result<(), NotifyError> {
        self.sent.lock().unwrap().push(payload.clone());
        Ok(())
    }
}
