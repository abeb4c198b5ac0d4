//! Projects and the commits observed for them.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::notifier::{NotifierKind, NotifierSettings};
use crate::repository::GitProvider;

/// Which commits of a push get built.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BuildPolicy {
    /// Every commit of a push gets its own build.
    BuildAll,
    /// Only the branch tip is built; pending builds for the same branch are superseded.
    HeadOnly,
}

/// A notification channel enabled for a project.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NotifierConfig {
    pub kind: NotifierKind,
    pub settings: NotifierSettings,
    /// Only notify when the status differs from the previous build.
    pub on_change_only: bool,
}

/// A source repository that Keel builds.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Project {
    pub name: String,
    pub provider: GitProvider,
    /// Repository identity as the provider reports it, e.g. `acme/sample`.
    pub repository: String,
    pub clone_url: String,
    /// Shell command run from the root of the checkout.
    pub command: String,
    /// Branch patterns to build (`*` wildcard). Empty means every branch.
    pub branches: Vec<String>,
    pub policy: BuildPolicy,
    /// Overrides the provider-wide webhook secret.
    pub secret: Option<String>,
    pub notifiers: Vec<NotifierConfig>,
}

impl Project {
    pub fn builds_all(&self) -> bool {
        self.policy == BuildPolicy::BuildAll
    }

    /// Whether pushes to `branch` should trigger builds.
    pub fn tracks_branch(&self, branch: &str) -> bool {
        if self.branches.is_empty() {
            return true;
        }
        let patterns: Vec<&str> = self.branches.iter().map(String::as_str).collect();
        matches_branch_pattern(branch, &patterns)
    }
}

const SHORT_SHA_CHARS: usize = 7;

/// Full SHA-256 object names are 64 hex digits.
const MAX_SHA_LEN: usize = 64;

/// A hex object name, abbreviated or full.
pub fn is_commit_sha(sha: &str) -> bool {
    !sha.is_empty() && sha.len() <= MAX_SHA_LEN && sha.bytes().all(|b| b.is_ascii_hexdigit())
}

/// A commit to build.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Commit {
    pub sha: String,
    pub author: String,
    pub message: String,
    pub branch: String,
    pub timestamp: Option<DateTime<Utc>>,
}

impl Commit {
    pub fn short_sha(&self) -> &str {
        match self.sha.char_indices().nth(SHORT_SHA_CHARS) {
            Some((end, _)) => &self.sha[..end],
            None => &self.sha,
        }
    }

    /// Whether `sha` looks like an object name git can check out.
    pub fn has_valid_sha(&self) -> bool {
        is_commit_sha(&self.sha)
    }

    /// First line of the commit message.
    pub fn subject(&self) -> &str {
        self.message.lines().next().unwrap_or_default()
    }
}

/// Check if a branch name matches any of the given patterns.
/// Supports simple glob patterns with '*' wildcard.
pub fn matches_branch_pattern(branch: &str, patterns: &[&str]) -> bool {
    patterns.iter().any(|pattern| {
        if pattern.contains('*') {
            let parts: Vec<&str> = pattern.split('*').collect();
            if parts.len() == 2 {
                let (prefix, suffix) = (parts[0], parts[1]);
                branch.len() >= prefix.len() + suffix.len()
                    && branch.starts_with(prefix)
                    && branch.ends_with(suffix)
            } else {
                // More than one wildcard - fall back to exact match
                branch == *pattern
            }
        } else {
            branch == *pattern
        }
    })
}
