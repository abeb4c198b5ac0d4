//! Persistence collaborator for projects and builds.

use async_trait::async_trait;

use crate::build::BuildJob;
use crate::project::Project;
use crate::repository::GitProvider;
use crate::{ResourceId, Result};

/// Storage for projects and build history.
///
/// Errors surface as [`crate::Error::PersistenceFailed`].
#[async_trait]
pub trait BuildStore: Send + Sync {
    /// Insert or replace a project, keyed by name.
    async fn save_project(&self, project: &Project) -> Result<()>;

    async fn load_project(&self, name: &str) -> Result<Option<Project>>;

    /// Find the project a provider's push payload refers to.
    async fn load_project_by_repo_identity(
        &self,
        provider: GitProvider,
        identity: &str,
    ) -> Result<Option<Project>>;

    /// Insert or replace a build, keyed by id.
    async fn save_build(&self, job: &BuildJob) -> Result<()>;

    async fn load_build(&self, id: ResourceId) -> Result<Option<BuildJob>>;

    /// Most recently enqueued builds first.
    async fn load_recent_builds_for_project(
        &self,
        project: &str,
        limit: usize,
    ) -> Result<Vec<BuildJob>>;
}
