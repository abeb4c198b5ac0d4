//! Git checkout: one fresh clone per build.

use async_trait::async_trait;
use keel_core::{BuildJob, Checkout, Error, Project, Result, WorkingDirectory};
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::time::Duration;
use tokio::process::Command;
use tracing::{debug, info, warn};

/// Attempts at removing a working copy a killed `git` may still be writing to.
const REMOVE_ATTEMPTS: u32 = 3;
const REMOVE_BACKOFF: Duration = Duration::from_millis(100);

/// Checks out commits with the `git` CLI.
///
/// Every build gets its own clone under
/// `<work_dir>/<md5 of clone url>/<build id>`, so concurrent builds never
/// share a working directory.
pub struct GitCheckout {
    /// Base directory for build working copies
    work_dir: PathBuf,
}

impl GitCheckout {
    pub fn new(work_dir: impl Into<PathBuf>) -> Self {
        Self {
            work_dir: work_dir.into(),
        }
    }

    /// Get the directory holding a repository's build working copies.
    pub fn get_repo_path(&self, clone_url: &str) -> PathBuf {
        let repo_hash = format!("{:x}", md5::compute(clone_url));
        self.work_dir.join(repo_hash)
    }

    /// Get the working copy path for one build.
    pub fn build_path(&self, project: &Project, job: &BuildJob) -> PathBuf {
        self.get_repo_path(&project.clone_url)
            .join(job.id.to_string())
    }

    async fn git(&self, args: &[&str], cwd: Option<&Path>, clone_url: &str) -> Result<()> {
        let mut command = Command::new("git");
        command
            .args(args)
            .env("GIT_TERMINAL_PROMPT", "0")
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        if let Some(cwd) = cwd {
            command.current_dir(cwd);
        }

        let output = command
            .output()
            .await
            .map_err(|e| Error::CheckoutFailed(format!("could not run git: {}", e)))?;

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            // Don't leak credentials embedded in the clone URL
            let stderr = stderr.replace(clone_url, &redact_credentials(clone_url));
            return Err(Error::CheckoutFailed(format!(
                "git {} failed: {}",
                args.first().copied().unwrap_or_default(),
                stderr.trim()
            )));
        }
        Ok(())
    }

    async fn clone_at(&self, project: &Project, job: &BuildJob, path: &Path) -> Result<()> {
        let path_str = path
            .to_str()
            .ok_or_else(|| Error::CheckoutFailed(format!("non UTF-8 path {}", path.display())))?;

        self.git(
            &["clone", "--quiet", "--no-checkout", "--", &project.clone_url, path_str],
            None,
            &project.clone_url,
        )
        .await?;

        self.git(
            &["checkout", "--quiet", "--force", "--detach", &job.commit.sha],
            Some(path),
            &project.clone_url,
        )
        .await
    }
}

#[async_trait]
impl Checkout for GitCheckout {
    async fn obtain(&self, project: &Project, job: &BuildJob) -> Result<WorkingDirectory> {
        // Anything else could reach git as an option or a revision expression
        if !job.commit.has_valid_sha() {
            return Err(Error::CheckoutFailed(format!(
                "invalid commit id {:?}",
                job.commit.sha
            )));
        }
        let path = self.build_path(project, job);
        let parent = self.get_repo_path(&project.clone_url);
        tokio::fs::create_dir_all(&parent)
            .await
            .map_err(|e| Error::CheckoutFailed(format!("{}: {}", parent.display(), e)))?;

        // Build ids are unique, but never build on top of leftovers
        if path.exists() {
            let _ = tokio::fs::remove_dir_all(&path).await;
        }

        info!(
            project = %project.name,
            build_id = %job.id,
            sha = %job.commit.sha,
            path = %path.display(),
            "Checking out commit"
        );

        if let Err(e) = self.clone_at(project, job, &path).await {
            warn!(project = %project.name, build_id = %job.id, error = %e, "Checkout failed");
            let _ = tokio::fs::remove_dir_all(&path).await;
            return Err(e);
        }

        Ok(WorkingDirectory::new(path, job.id))
    }

    async fn release(&self, dir: WorkingDirectory) -> Result<()> {
        debug!(path = %dir.path().display(), "Removing working directory");
        remove_workdir(dir.path()).await
    }

    async fn discard(&self, project: &Project, job: &BuildJob) -> Result<()> {
        let path = self.build_path(project, job);
        debug!(build_id = %job.id, path = %path.display(), "Discarding interrupted checkout");
        remove_workdir(&path).await
    }
}

/// Remove a working copy, tolerating one that never existed.
async fn remove_workdir(path: &Path) -> Result<()> {
    let mut attempt = 1;
    loop {
        match tokio::fs::remove_dir_all(path).await {
            Ok(()) => return Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(()),
            Err(e) if attempt < REMOVE_ATTEMPTS => {
                debug!(path = %path.display(), error = %e, attempt, "Retrying working directory removal");
                attempt += 1;
                tokio::time::sleep(REMOVE_BACKOFF).await;
            }
            Err(e) => {
                return Err(Error::Internal(format!(
                    "could not remove {}: {}",
                    path.display(),
                    e
                )));
            }
        }
    }
}

/// Replace `user:password@` in a URL with `[REDACTED]@`.
fn redact_credentials(url: &str) -> String {
    let Some(scheme_end) = url.find("://") else {
        return url.to_string();
    };
    let rest = &url[scheme_end + 3..];
    let host_end = rest.find('/').unwrap_or(rest.len());
    match rest[..host_end].rfind('@') {
        Some(at) => format!("{}[REDACTED]{}", &url[..scheme_end + 3], &rest[at..]),
        None => url.to_string(),
    }
}
