//! Notifier trait and the payload every channel receives.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use thiserror::Error;
use url::Url;

use crate::build::{BuildJob, BuildStatus};

/// Number of trailing output characters carried in a notification.
pub const OUTPUT_EXCERPT_CHARS: usize = 2000;

/// Channel-specific settings, e.g. `to` for email or `url` for chat.
pub type NotifierSettings = BTreeMap<String, String>;

/// Supported notification channels.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum NotifierKind {
    Email,
    Irc,
    Chat,
    Webhook,
}

impl std::fmt::Display for NotifierKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            NotifierKind::Email => write!(f, "email"),
            NotifierKind::Irc => write!(f, "irc"),
            NotifierKind::Chat => write!(f, "chat"),
            NotifierKind::Webhook => write!(f, "webhook"),
        }
    }
}

impl std::str::FromStr for NotifierKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "email" => Ok(NotifierKind::Email),
            "irc" => Ok(NotifierKind::Irc),
            "chat" => Ok(NotifierKind::Chat),
            "webhook" => Ok(NotifierKind::Webhook),
            _ => Err(format!("Unknown notifier: {}", s)),
        }
    }
}

/// What a channel is told about a finished build.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NotificationPayload {
    pub project: String,
    pub build_id: String,
    pub sha: String,
    pub short_sha: String,
    pub branch: String,
    pub author: String,
    pub message: String,
    pub status: BuildStatus,
    pub duration_secs: Option<i64>,
    pub output_excerpt: String,
    pub build_url: String,
}

impl NotificationPayload {
    pub fn from_build(job: &BuildJob, base_url: &str) -> Self {
        Self {
            project: job.project.clone(),
            build_id: job.id.to_string(),
            sha: job.commit.sha.clone(),
            short_sha: job.commit.short_sha().to_string(),
            branch: job.commit.branch.clone(),
            author: job.commit.author.clone(),
            message: job.commit.message.clone(),
            status: job.status,
            duration_secs: job.duration().map(|d| d.num_seconds()),
            output_excerpt: tail_chars(&job.output, OUTPUT_EXCERPT_CHARS).to_string(),
            build_url: build_url(base_url, &job.project, &job.id.to_string()),
        }
    }

    /// One-line summary used by the text channels.
    pub fn summary(&self) -> String {
        let subject = self.message.lines().next().unwrap_or_default();
        let duration = self
            .duration_secs
            .map(|s| format!(" in {}s", s))
            .unwrap_or_default();
        format!(
            "[{}] {} {}{}: {} ({}) {}",
            self.project,
            self.short_sha,
            self.status,
            duration,
            subject,
            self.branch,
            self.build_url
        )
    }
}

/// Link to a build page under the configured base URL.
///
/// Path segments are percent-encoded, so any project name yields a valid link.
pub fn build_url(base_url: &str, project: &str, build_id: &str) -> String {
    let Ok(mut url) = Url::parse(base_url) else {
        return format!(
            "{}/{}/builds/{}",
            base_url.trim_end_matches('/'),
            project,
            build_id
        );
    };
    if let Ok(mut segments) = url.path_segments_mut() {
        segments.pop_if_empty().extend([project, "builds", build_id]);
    }
    url.to_string()
}

fn tail_chars(text: &str, max: usize) -> &str {
    let count = text.chars().count();
    if count <= max {
        return text;
    }
    let skip = count - max;
    match text.char_indices().nth(skip) {
        Some((idx, _)) => &text[idx..],
        None => "",
    }
}

/// Notifier errors.
#[derive(Debug, Error)]
pub enum NotifyError {
    #[error("missing setting: {0}")]
    MissingSetting(String),

    #[error("transport error: {0}")]
    Transport(String),

    #[error("rejected with status {status}: {body}")]
    Rejected { status: u16, body: String },

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// Trait for notification channels.
#[async_trait]
pub trait Notifier: Send + Sync {
    fn kind(&self) -> NotifierKind;

    /// Deliver one notification. Delivery is at-least-once.
    async fn send(
        &self,
        settings: &NotifierSettings,
        payload: &NotificationPayload,
    ) -> Result<(), NotifyError>;
}

/// Look up a required setting.
pub fn require_setting<'a>(
    settings: &'a NotifierSettings,
    key: &str,
) -> Result<&'a str, NotifyError> {
    settings
        .get(key)
        .map(String::as_str)
        .filter(|v| !v.is_empty())
        .ok_or_else(|| NotifyError::MissingSetting(key.to_string()))
}
