//! Builder trait and build results.
//!
//! A builder takes a pending job, obtains a checkout for it, runs the
//! project's build command and reports a terminal verdict.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio_util::sync::CancellationToken;

use crate::build::{BuildJob, BuildStatus};
use crate::error::Error;
use crate::project::Project;

/// Exit code the shell reports when the command does not exist.
const COMMAND_NOT_FOUND: i32 = 127;

/// Verdict of a single build execution.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BuildResult {
    /// Always terminal.
    pub status: BuildStatus,
    pub exit_code: Option<i32>,
    pub output: String,
    pub truncated: bool,
    pub error: Option<String>,
}

impl BuildResult {
    /// Classify a command that ran to completion.
    pub fn exited(code: i32, output: String, truncated: bool) -> Self {
        let (status, error) = match code {
            0 => (BuildStatus::Success, None),
            COMMAND_NOT_FOUND => (
                BuildStatus::Errored,
                Some(Error::BuilderCrashed("command not found".to_string()).to_string()),
            ),
            _ => (BuildStatus::Failed, None),
        };
        Self {
            status,
            exit_code: Some(code),
            output,
            truncated,
            error,
        }
    }

    /// An infrastructure failure: checkout, spawn, timeout or cancellation.
    pub fn errored(error: &Error, output: String, truncated: bool) -> Self {
        Self {
            status: BuildStatus::Errored,
            exit_code: None,
            output,
            truncated,
            error: Some(error.to_string()),
        }
    }
}

/// Trait for build strategies.
#[async_trait]
pub trait Builder: Send + Sync {
    /// Name of this builder.
    fn name(&self) -> &'static str;

    /// Run `job` for `project` to completion.
    ///
    /// Never fails: every problem is folded into an `errored` result.
    /// Cancelling `cancel` must terminate the build process promptly.
    async fn execute(
        &self,
        project: &Project,
        job: &BuildJob,
        cancel: CancellationToken,
    ) -> BuildResult;
}
