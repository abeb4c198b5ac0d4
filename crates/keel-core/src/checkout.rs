//! Checkout trait: isolated, commit-exact working copies.

use async_trait::async_trait;
use std::path::{Path, PathBuf};

use crate::build::BuildJob;
use crate::project::Project;
use crate::{ResourceId, Result};

/// A working copy owned by exactly one in-flight build.
#[derive(Debug)]
pub struct WorkingDirectory {
    path: PathBuf,
    build_id: ResourceId,
}

impl WorkingDirectory {
    pub fn new(path: PathBuf, build_id: ResourceId) -> Self {
        Self { path, build_id }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn build_id(&self) -> ResourceId {
        self.build_id
    }
}

/// Trait for obtaining source checkouts.
///
/// Implementations must be safe to call concurrently for different jobs.
#[async_trait]
pub trait Checkout: Send + Sync {
    /// Produce a clean working copy of `job.commit` for `project`.
    ///
    /// Fails with [`crate::Error::CheckoutFailed`].
    async fn obtain(&self, project: &Project, job: &BuildJob) -> Result<WorkingDirectory>;

    /// Dispose of a working copy once its build finished.
    async fn release(&self, dir: WorkingDirectory) -> Result<()>;

    /// Remove whatever an interrupted [`Checkout::obtain`] left behind for `job`.
    ///
    /// Called when a timeout or cancellation dropped `obtain` before it
    /// returned a working copy. Must succeed when nothing was created.
    async fn discard(&self, _project: &Project, _job: &BuildJob) -> Result<()> {
        Ok(())
    }
}
