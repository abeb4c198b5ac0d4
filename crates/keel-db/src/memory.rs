//! In-memory build store.
//!
//! Used when the server is configured with `database "memory"` and by tests.
//! History is lost on restart.

use async_trait::async_trait;
use keel_core::{BuildJob, BuildStore, GitProvider, Project, ResourceId, Result};
use std::collections::{BTreeMap, HashMap};
use tokio::sync::RwLock;

#[derive(Default)]
struct Inner {
    projects: BTreeMap<String, Project>,
    builds: HashMap<ResourceId, BuildJob>,
}

/// A [`BuildStore`] kept in process memory.
#[derive(Default)]
pub struct MemoryStore {
    inner: RwLock<Inner>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl BuildStore for MemoryStore {
    async fn save_project(&self, project: &Project) -> Result<()> {
        let mut inner = self.inner.write().await;
        // A repository belongs to one project at a time
        inner.projects.retain(|name, p| {
            name == &project.name
                || !(p.provider == project.provider && p.repository == project.repository)
        });
        inner
            .projects
            .insert(project.name.clone(), project.clone());
        Ok(())
    }

    async fn load_project(&self, name: &str) -> Result<Option<Project>> {
        Ok(self.inner.read().await.projects.get(name).cloned())
    }

    async fn load_project_by_repo_identity(
        &self,
        provider: GitProvider,
        identity: &str,
    ) -> Result<Option<Project>> {
        let inner = self.inner.read().await;
        Ok(inner
            .projects
            .values()
            .find(|p| p.provider == provider && p.repository == identity)
            .cloned())
    }

    async fn save_build(&self, job: &BuildJob) -> Result<()> {
        self.inner.write().await.builds.insert(job.id, job.clone());
        Ok(())
    }

    async fn load_build(&self, id: ResourceId) -> Result<Option<BuildJob>> {
        Ok(self.inner.read().await.builds.get(&id).cloned())
    }

    async fn load_recent_builds_for_project(
        &self,
        project: &str,
        limit: usize,
    ) -> Result<Vec<BuildJob>> {
        let inner = self.inner.read().await;
        let mut builds: Vec<BuildJob> = inner
            .builds
            .values()
            .filter(|b| b.project == project)
            .cloned()
            .collect();
        builds.sort_by(|a, b| (b.enqueued_at, b.id).cmp(&(a.enqueued_at, a.id)));
        builds.truncate(limit);
        Ok(builds)
    }
}
