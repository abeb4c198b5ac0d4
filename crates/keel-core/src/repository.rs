//! Git providers and the push events they deliver.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::project::Commit;

const ZERO_SHA: &str = "0000000000000000000000000000000000000000";

/// Git provider type
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum GitProvider {
    Github,
    Gitlab,
}

impl GitProvider {
    pub fn as_str(&self) -> &'static str {
        match self {
            GitProvider::Github => "github",
            GitProvider::Gitlab => "gitlab",
        }
    }

    /// Repository identity carried by a push payload of this provider.
    pub fn repository_identity<'a>(&self, payload: &'a serde_json::Value) -> Option<&'a str> {
        match self {
            GitProvider::Github => payload.get("repository")?.get("full_name")?.as_str(),
            GitProvider::Gitlab => payload
                .get("project")?
                .get("path_with_namespace")?
                .as_str(),
        }
    }

    /// Parse a push payload of this provider.
    pub fn parse_push(&self, payload: &serde_json::Value) -> Option<PushEvent> {
        match self {
            GitProvider::Github => PushEvent::from_github_payload(payload),
            GitProvider::Gitlab => PushEvent::from_gitlab_payload(payload),
        }
    }
}

impl std::fmt::Display for GitProvider {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for GitProvider {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "github" => Ok(GitProvider::Github),
            "gitlab" => Ok(GitProvider::Gitlab),
            _ => Err(format!("Unknown git provider: {}", s)),
        }
    }
}

/// Parsed push event data
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PushEvent {
    pub r#ref: String,
    pub before: String,
    pub after: String,
    pub repository_full_name: String,
    pub branch: Option<String>,
    pub tag: Option<String>,
    /// Oldest first, as the providers send them.
    pub commits: Vec<CommitInfo>,
    pub head_commit: Option<CommitInfo>,
    pub pusher: String,
}

/// Commit information from a push event
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CommitInfo {
    pub sha: String,
    pub message: String,
    pub author: String,
    pub author_email: String,
    pub timestamp: Option<DateTime<Utc>>,
}

impl PushEvent {
    /// Parse a GitHub push webhook payload
    pub fn from_github_payload(payload: &serde_json::Value) -> Option<Self> {
        let r#ref = payload.get("ref")?.as_str()?.to_string();
        let before = payload.get("before")?.as_str()?.to_string();
        let after = payload.get("after")?.as_str()?.to_string();
        let repository_full_name = GitProvider::Github
            .repository_identity(payload)?
            .to_string();

        let commits = commits_from(payload, CommitInfo::from_github_commit);

        let head_commit = payload
            .get("head_commit")
            .and_then(CommitInfo::from_github_commit);

        let pusher = payload
            .get("pusher")
            .and_then(|p| p.get("name"))
            .and_then(|n| n.as_str())
            .unwrap_or("unknown")
            .to_string();

        Some(PushEvent {
            branch: r#ref.strip_prefix("refs/heads/").map(String::from),
            tag: r#ref.strip_prefix("refs/tags/").map(String::from),
            r#ref,
            before,
            after,
            repository_full_name,
            commits,
            head_commit,
            pusher,
        })
    }

    /// Parse a GitLab push hook payload
    pub fn from_gitlab_payload(payload: &serde_json::Value) -> Option<Self> {
        let r#ref = payload.get("ref")?.as_str()?.to_string();
        let before = payload.get("before")?.as_str()?.to_string();
        let after = payload.get("after")?.as_str()?.to_string();
        let repository_full_name = GitProvider::Gitlab
            .repository_identity(payload)?
            .to_string();

        // GitLab has no head_commit; the tip is the commit matching `after`
        let commits = commits_from(payload, CommitInfo::from_github_commit);
        let head_commit = commits.iter().find(|c| c.sha == after).cloned();

        let pusher = payload
            .get("user_username")
            .or_else(|| payload.get("user_name"))
            .and_then(|n| n.as_str())
            .unwrap_or("unknown")
            .to_string();

        Some(PushEvent {
            branch: r#ref.strip_prefix("refs/heads/").map(String::from),
            tag: r#ref.strip_prefix("refs/tags/").map(String::from),
            r#ref,
            before,
            after,
            repository_full_name,
            commits,
            head_commit,
            pusher,
        })
    }

    /// Whether the push removed the ref instead of updating it.
    pub fn is_deletion(&self) -> bool {
        self.after == ZERO_SHA
    }

    /// The commit the branch points at after the push.
    pub fn tip(&self) -> Option<Commit> {
        let branch = self.branch.as_deref()?;
        if self.is_deletion() {
            return None;
        }
        let tip = self
            .head_commit
            .as_ref()
            .or_else(|| self.commits.last())
            .map(|c| c.to_commit(branch))
            .unwrap_or_else(|| Commit {
                sha: self.after.clone(),
                author: self.pusher.clone(),
                message: String::new(),
                branch: branch.to_string(),
                timestamp: None,
            });
        Some(tip)
    }

    /// Every pushed commit in payload order, or the tip when the payload lists none.
    pub fn all_commits(&self) -> Vec<Commit> {
        let Some(branch) = self.branch.as_deref() else {
            return Vec::new();
        };
        if self.is_deletion() {
            return Vec::new();
        }
        if self.commits.is_empty() {
            return self.tip().into_iter().collect();
        }
        self.commits.iter().map(|c| c.to_commit(branch)).collect()
    }
}

fn commits_from(
    payload: &serde_json::Value,
    parse: fn(&serde_json::Value) -> Option<CommitInfo>,
) -> Vec<CommitInfo> {
    payload
        .get("commits")
        .and_then(|c| c.as_array())
        .map(|arr| arr.iter().filter_map(parse).collect())
        .unwrap_or_default()
}

impl CommitInfo {
    /// GitHub and GitLab share the commit object layout we need.
    fn from_github_commit(value: &serde_json::Value) -> Option<Self> {
        Some(CommitInfo {
            sha: value.get("id")?.as_str()?.to_string(),
            message: value.get("message")?.as_str()?.to_string(),
            author: value
                .get("author")
                .and_then(|a| a.get("name"))
                .and_then(|n| n.as_str())
                .unwrap_or("unknown")
                .to_string(),
            author_email: value
                .get("author")
                .and_then(|a| a.get("email"))
                .and_then(|e| e.as_str())
                .unwrap_or("")
                .to_string(),
            timestamp: value
                .get("timestamp")
                .and_then(|t| t.as_str())
                .and_then(|t| DateTime::parse_from_rfc3339(t).ok())
                .map(|dt| dt.with_timezone(&Utc)),
        })
    }

    pub fn to_commit(&self, branch: &str) -> Commit {
        Commit {
            sha: self.sha.clone(),
            author: self.author.clone(),
            message: self.message.clone(),
            branch: branch.to_string(),
            timestamp: self.timestamp,
        }
    }
}
