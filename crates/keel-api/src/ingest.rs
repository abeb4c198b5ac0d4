//! Webhook ingestion: authenticates push notifications and turns them into
//! queued builds.

use hmac::{Hmac, Mac};
use keel_config::ServerConfig;
use keel_core::{BuildJob, BuildStore, Commit, Error, GitProvider, Project, Result};
use keel_scheduler::{JobHandle, Scheduler};
use sha2::Sha256;
use std::collections::HashSet;
use std::sync::Arc;
use tracing::{debug, info, warn};

/// Builds inspected when deciding whether a commit was already built.
const REPLAY_HISTORY: usize = 20;

/// What a webhook route extracted from the request besides the body.
#[derive(Debug, Clone, Default)]
pub struct PushRequest {
    /// `X-GitHub-Event` or `X-Gitlab-Event`
    pub event: Option<String>,
    /// `X-Hub-Signature-256`
    pub signature: Option<String>,
    /// `?token=` or `X-Gitlab-Token`
    pub token: Option<String>,
}

/// Result of a successfully authenticated notification.
#[derive(Debug, Clone)]
pub enum Ingested {
    Queued {
        project: String,
        builds: Vec<JobHandle>,
    },
    Ignored {
        reason: String,
    },
}

impl Ingested {
    fn ignored(reason: impl Into<String>) -> Self {
        Ingested::Ignored {
            reason: reason.into(),
        }
    }
}

/// Normalizes provider push notifications into build jobs.
pub struct WebhookIngestor {
    config: Arc<ServerConfig>,
    store: Arc<dyn BuildStore>,
    scheduler: Arc<Scheduler>,
}

impl WebhookIngestor {
    pub fn new(
        config: Arc<ServerConfig>,
        store: Arc<dyn BuildStore>,
        scheduler: Arc<Scheduler>,
    ) -> Self {
        Self {
            config,
            store,
            scheduler,
        }
    }

    /// Handle one push notification from `provider`.
    pub async fn receive(
        &self,
        provider: GitProvider,
        request: &PushRequest,
        body: &[u8],
    ) -> Result<Ingested> {
        let payload: serde_json::Value = serde_json::from_slice(body)
            .map_err(|e| Error::MalformedPayload(format!("invalid JSON: {}", e)))?;
        let identity = provider
            .repository_identity(&payload)
            .ok_or_else(|| Error::MalformedPayload("missing repository identity".to_string()))?;

        let project = self
            .store
            .load_project_by_repo_identity(provider, identity)
            .await?
            .ok_or_else(|| Error::UnknownProject(format!("{} repository {}", provider, identity)))?;

        self.authenticate(provider, &project, request, body)?;

        info!(
            provider = %provider,
            project = %project.name,
            event = request.event.as_deref().unwrap_or("push"),
            "Received push notification"
        );

        if let Some(reason) = ignored_event(provider, request.event.as_deref()) {
            return Ok(Ingested::ignored(reason));
        }

        let push = provider
            .parse_push(&payload)
            .ok_or_else(|| Error::MalformedPayload("not a push payload".to_string()))?;
        let Some(branch) = push.branch.as_deref() else {
            return Ok(Ingested::ignored(format!("{} is not a branch", push.r#ref)));
        };
        if push.is_deletion() {
            return Ok(Ingested::ignored(format!("branch {} was deleted", branch)));
        }
        if !project.tracks_branch(branch) {
            return Ok(Ingested::ignored(format!("branch {} is not built", branch)));
        }

        let commits = if project.builds_all() {
            push.all_commits()
        } else {
            push.tip().into_iter().collect()
        };
        if let Some(bad) = commits.iter().find(|c| !c.has_valid_sha()) {
            return Err(Error::MalformedPayload(format!(
                "invalid commit id {:?}",
                bad.sha
            )));
        }
        let commits = self.unbuilt(&project, commits).await;
        if commits.is_empty() {
            return Ok(Ingested::ignored("commits were already built"));
        }

        self.enqueue_all(Arc::new(project), commits)
    }

    /// Queue a build of `commit` for the project named `project`.
    ///
    /// Administrative path: requires the configured admin token and skips
    /// the replay check. Without an admin token every trigger is refused.
    pub async fn trigger(
        &self,
        project: &str,
        token: Option<&str>,
        commit: Commit,
    ) -> Result<JobHandle> {
        let authorized = match (self.config.admin_token.as_deref(), token) {
            (Some(expected), Some(token)) => constant_time_eq(token.as_bytes(), expected.as_bytes()),
            _ => false,
        };
        if !authorized {
            warn!(project, "Rejected manual build with invalid credentials");
            return Err(Error::Unauthorized("missing or invalid admin token".to_string()));
        }
        if !commit.has_valid_sha() {
            return Err(Error::MalformedPayload(format!(
                "invalid commit id {:?}",
                commit.sha
            )));
        }

        let project = self
            .store
            .load_project(project)
            .await?
            .ok_or_else(|| Error::UnknownProject(project.to_string()))?;
        let job = BuildJob::new(project.name.clone(), commit);
        info!(project = %project.name, sha = %job.commit.sha, "Manual build requested");
        self.scheduler.enqueue(Arc::new(project), job)
    }

    fn authenticate(
        &self,
        provider: GitProvider,
        project: &Project,
        request: &PushRequest,
        body: &[u8],
    ) -> Result<()> {
        let Some(secret) = self.config.secret_for(project) else {
            warn!(project = %project.name, "No webhook secret configured, accepting unauthenticated push");
            return Ok(());
        };

        let valid = match (provider, &request.signature, &request.token) {
            (GitProvider::Github, Some(signature), _) => {
                verify_github_signature(secret, body, signature)
            }
            (_, _, Some(token)) => constant_time_eq(token.as_bytes(), secret.as_bytes()),
            _ => false,
        };

        if valid {
            Ok(())
        } else {
            warn!(project = %project.name, provider = %provider, "Rejected push with invalid credentials");
            Err(Error::Unauthorized(
                "missing or invalid webhook signature".to_string(),
            ))
        }
    }

    /// Drop commits that already have a terminal build.
    async fn unbuilt(&self, project: &Project, commits: Vec<Commit>) -> Vec<Commit> {
        let recent = match self
            .store
            .load_recent_builds_for_project(&project.name, REPLAY_HISTORY)
            .await
        {
            Ok(recent) => recent,
            Err(e) => {
                warn!(project = %project.name, error = %e, "Failed to load build history");
                return commits;
            }
        };
        let built: HashSet<&str> = recent
            .iter()
            .filter(|b| b.is_terminal())
            .map(|b| b.commit.sha.as_str())
            .collect();

        commits
            .into_iter()
            .filter(|c| {
                let replay = built.contains(c.sha.as_str());
                if replay {
                    debug!(project = %project.name, sha = %c.sha, "Skipping replayed commit");
                }
                !replay
            })
            .collect()
    }

    /// Queue every commit, or none of them when the backlog cannot take the batch.
    fn enqueue_all(&self, project: Arc<Project>, commits: Vec<Commit>) -> Result<Ingested> {
        let jobs = commits
            .into_iter()
            .map(|commit| BuildJob::new(project.name.clone(), commit))
            .collect();
        let mut builds = Vec::new();
        for queued in self.scheduler.enqueue_all(project.clone(), jobs)? {
            match queued {
                Ok(handle) => builds.push(handle),
                Err(Error::DuplicateInFlight { sha, .. }) => {
                    debug!(project = %project.name, sha = %sha, "Commit already queued or running");
                }
                Err(e) => return Err(e),
            }
        }

        if builds.is_empty() {
            return Ok(Ingested::ignored("commits are already queued or running"));
        }
        info!(project = %project.name, builds = builds.len(), "Queued builds");
        Ok(Ingested::Queued {
            project: project.name.clone(),
            builds,
        })
    }
}

/// Why a non-push event is ignored, or `None` for pushes.
///
/// A missing event header is treated as a push.
fn ignored_event(provider: GitProvider, event: Option<&str>) -> Option<String> {
    let push = match provider {
        GitProvider::Github => "push",
        GitProvider::Gitlab => "Push Hook",
    };
    match event {
        None => None,
        Some(event) if event == push => None,
        Some(event) => Some(format!("{} events are not built", event)),
    }
}

/// Verify GitHub webhook signature.
fn verify_github_signature(secret: &str, body: &[u8], signature: &str) -> bool {
    // Signature format: "sha256=<hex>"
    let Some(sig_hex) = signature.strip_prefix("sha256=") else {
        return false;
    };

    let Ok(sig_bytes) = hex::decode(sig_hex) else {
        return false;
    };

    let Ok(mut mac) = Hmac::<Sha256>::new_from_slice(secret.as_bytes()) else {
        return false;
    };
    mac.update(body);

    mac.verify_slice(&sig_bytes).is_ok()
}

/// Compare without short-circuiting on the first differing byte.
fn constant_time_eq(a: &[u8], b: &[u8]) -> bool {
    if a.len() != b.len() {
        return false;
    }
    a.iter().zip(b).fold(0u8, |acc, (x, y)| acc | (x ^ y)) == 0
}
