//! Build jobs and their lifecycle.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::builder::BuildResult;
use crate::project::Commit;
use crate::ResourceId;

/// Status of a build job.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BuildStatus {
    Pending,
    Running,
    Success,
    Failed,
    Errored,
}

impl BuildStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            BuildStatus::Success | BuildStatus::Failed | BuildStatus::Errored
        )
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            BuildStatus::Pending => "pending",
            BuildStatus::Running => "running",
            BuildStatus::Success => "success",
            BuildStatus::Failed => "failed",
            BuildStatus::Errored => "errored",
        }
    }
}

impl std::fmt::Display for BuildStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for BuildStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "pending" => Ok(BuildStatus::Pending),
            "running" => Ok(BuildStatus::Running),
            "success" => Ok(BuildStatus::Success),
            "failed" => Ok(BuildStatus::Failed),
            "errored" => Ok(BuildStatus::Errored),
            _ => Err(format!("Unknown build status: {}", s)),
        }
    }
}

/// One scheduled attempt to build a commit of a project.
///
/// A job is created `pending`, moved to `running` by the worker that pulls it
/// and finished exactly once. Once terminal it is never modified again.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BuildJob {
    pub id: ResourceId,
    pub project: String,
    pub commit: Commit,
    pub enqueued_at: DateTime<Utc>,
    pub status: BuildStatus,
    pub started_at: Option<DateTime<Utc>>,
    pub finished_at: Option<DateTime<Utc>>,
    /// Combined stdout and stderr of the build command.
    pub output: String,
    pub output_truncated: bool,
    pub exit_code: Option<i32>,
    /// Why an errored build did not produce a verdict.
    pub error: Option<String>,
}

impl BuildJob {
    pub fn new(project: impl Into<String>, commit: Commit) -> Self {
        Self {
            id: ResourceId::new(),
            project: project.into(),
            commit,
            enqueued_at: Utc::now(),
            status: BuildStatus::Pending,
            started_at: None,
            finished_at: None,
            output: String::new(),
            output_truncated: false,
            exit_code: None,
            error: None,
        }
    }

    pub fn is_terminal(&self) -> bool {
        self.status.is_terminal()
    }

    pub fn start(&mut self) {
        debug_assert_eq!(self.status, BuildStatus::Pending);
        self.status = BuildStatus::Running;
        self.started_at = Some(Utc::now());
    }

    /// Record the builder's verdict.
    pub fn finish(&mut self, result: BuildResult) {
        debug_assert!(!self.is_terminal());
        debug_assert!(result.status.is_terminal());
        self.status = result.status;
        self.exit_code = result.exit_code;
        self.output = result.output;
        self.output_truncated = result.truncated;
        self.error = result.error;
        self.finished_at = Some(Utc::now());
    }

    /// Terminate a job that never reached the builder.
    pub fn abort(&mut self, reason: impl Into<String>) {
        debug_assert!(!self.is_terminal());
        self.status = BuildStatus::Errored;
        self.error = Some(reason.into());
        self.finished_at = Some(Utc::now());
    }

    /// Wall-clock time the build ran, if it ran at all.
    pub fn duration(&self) -> Option<chrono::Duration> {
        match (self.started_at, self.finished_at) {
            (Some(start), Some(end)) => Some(end - start),
            _ => None,
        }
    }
}
