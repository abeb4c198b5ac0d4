//! Shell builder: runs a project's command in a fresh checkout.

use async_trait::async_trait;
use keel_core::{BuildJob, BuildResult, Builder, Checkout, Error, Project};
use std::path::Path;
use std::process::{ExitStatus, Stdio};
use std::sync::Arc;
use std::time::Duration;
use tokio::process::{Child, Command};
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tokio::time::{Instant, sleep_until};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::output::{OutputBuffer, capture};

/// How long to keep reading output once the command is gone.
const READER_GRACE: Duration = Duration::from_secs(2);

/// Limits applied to every build.
#[derive(Debug, Clone)]
pub struct BuildSettings {
    /// Deadline for checkout and command together
    pub timeout: Duration,
    /// Bytes of combined output kept per build
    pub output_limit: usize,
    /// Leave working directories on disk for debugging
    pub keep_workdirs: bool,
}

impl Default for BuildSettings {
    fn default() -> Self {
        Self {
            timeout: Duration::from_secs(3600),
            output_limit: 256 * 1024,
            keep_workdirs: false,
        }
    }
}

enum Outcome {
    Exited(std::io::Result<ExitStatus>),
    TimedOut,
    Cancelled,
}

/// Builder running `/bin/sh -c <command>` inside a checkout.
pub struct ShellBuilder {
    checkout: Arc<dyn Checkout>,
    settings: BuildSettings,
}

impl ShellBuilder {
    pub fn new(checkout: Arc<dyn Checkout>, settings: BuildSettings) -> Self {
        Self { checkout, settings }
    }

    pub fn settings(&self) -> &BuildSettings {
        &self.settings
    }

    async fn run_command(
        &self,
        project: &Project,
        job: &BuildJob,
        workdir: &Path,
        deadline: Instant,
        cancel: &CancellationToken,
    ) -> BuildResult {
        let mut command = Command::new("/bin/sh");
        command
            .arg("-c")
            .arg(&project.command)
            .current_dir(workdir)
            .env("KEEL_PROJECT", &project.name)
            .env("KEEL_COMMIT", &job.commit.sha)
            .env("KEEL_BRANCH", &job.commit.branch)
            .env("KEEL_BUILD_ID", job.id.to_string())
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            // Own process group so the whole tree can be killed
            .process_group(0);

        let mut child = match command.spawn() {
            Ok(child) => child,
            Err(e) => {
                return BuildResult::errored(
                    &Error::BuilderCrashed(format!("could not spawn shell: {}", e)),
                    String::new(),
                    false,
                );
            }
        };
        let pid = child.id();

        let buffer = Arc::new(Mutex::new(OutputBuffer::new(self.settings.output_limit)));
        let mut readers: Vec<JoinHandle<()>> = Vec::with_capacity(2);
        if let Some(stdout) = child.stdout.take() {
            readers.push(tokio::spawn(capture(stdout, buffer.clone())));
        }
        if let Some(stderr) = child.stderr.take() {
            readers.push(tokio::spawn(capture(stderr, buffer.clone())));
        }

        let outcome = tokio::select! {
            status = child.wait() => Outcome::Exited(status),
            _ = sleep_until(deadline) => Outcome::TimedOut,
            _ = cancel.cancelled() => Outcome::Cancelled,
        };

        // After a normal exit the group id may already belong to someone else
        let exited = matches!(outcome, Outcome::Exited(_));
        if !exited {
            if let Some(pid) = pid {
                kill_process_group(pid);
            }
            terminate(&mut child).await;
        }

        let mut group_killed = !exited;
        for mut reader in readers {
            if tokio::time::timeout(READER_GRACE, &mut reader).await.is_ok() {
                continue;
            }
            // Background processes still hold the pipe, so the group is alive
            if !group_killed {
                group_killed = true;
                if let Some(pid) = pid {
                    debug!(pid, "Killing processes left behind by the build command");
                    kill_process_group(pid);
                }
                if tokio::time::timeout(READER_GRACE, &mut reader).await.is_ok() {
                    continue;
                }
            }
            reader.abort();
        }
        let (output, truncated) = buffer.lock().await.finish();

        match outcome {
            Outcome::Exited(Ok(status)) => match status.code() {
                Some(code) => BuildResult::exited(code, output, truncated),
                None => BuildResult::errored(
                    &Error::BuilderCrashed("build command killed by a signal".to_string()),
                    output,
                    truncated,
                ),
            },
            Outcome::Exited(Err(e)) => BuildResult::errored(
                &Error::BuilderCrashed(format!("waiting for build command: {}", e)),
                output,
                truncated,
            ),
            Outcome::TimedOut => {
                BuildResult::errored(&Error::BuildTimeout(self.settings.timeout), output, truncated)
            }
            Outcome::Cancelled => BuildResult::errored(
                &Error::Cancelled("scheduler shutting down".to_string()),
                output,
                truncated,
            ),
        }
    }
}

#[async_trait]
impl Builder for ShellBuilder {
    fn name(&self) -> &'static str {
        "shell"
    }

    async fn execute(
        &self,
        project: &Project,
        job: &BuildJob,
        cancel: CancellationToken,
    ) -> BuildResult {
        let deadline = Instant::now() + self.settings.timeout;

        let (obtained, interrupted) = tokio::select! {
            _ = cancel.cancelled() => {
                (Err(Error::Cancelled("scheduler shutting down".to_string())), true)
            }
            _ = sleep_until(deadline) => (Err(Error::BuildTimeout(self.settings.timeout)), true),
            dir = self.checkout.obtain(project, job) => (dir, false),
        };
        let workdir = match obtained {
            Ok(dir) => dir,
            Err(e) => {
                warn!(project = %project.name, build_id = %job.id, error = %e, "Build errored before running");
                if interrupted {
                    if let Err(e) = self.checkout.discard(project, job).await {
                        warn!(build_id = %job.id, error = %e, "Failed to discard interrupted checkout");
                    }
                }
                return BuildResult::errored(&e, String::new(), false);
            }
        };

        info!(
            project = %project.name,
            build_id = %job.id,
            sha = %job.commit.sha,
            "Running build command"
        );
        let result = self
            .run_command(project, job, workdir.path(), deadline, &cancel)
            .await;
        info!(
            project = %project.name,
            build_id = %job.id,
            status = %result.status,
            exit_code = ?result.exit_code,
            "Build command finished"
        );

        if self.settings.keep_workdirs {
            debug!(path = %workdir.path().display(), "Keeping working directory");
        } else if let Err(e) = self.checkout.release(workdir).await {
            warn!(build_id = %job.id, error = %e, "Failed to release working directory");
        }

        result
    }
}

async fn terminate(child: &mut Child) {
    let _ = child.start_kill();
    if let Err(e) = child.wait().await {
        warn!(error = %e, "Failed to reap build command");
    }
}

fn kill_process_group(pid: u32) {
    let Ok(pgid) = libc::pid_t::try_from(pid) else {
        return;
    };
    // SAFETY: killpg only sends a signal; ESRCH for an empty group is ignored
    unsafe {
        libc::killpg(pgid, libc::SIGKILL);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use keel_core::{
        BuildPolicy, BuildStatus, Commit, GitProvider, ResourceId, Result, WorkingDirectory,
    };
    use std::path::PathBuf;
    use std::sync::Mutex as StdMutex;
    use tempfile::TempDir;

    /// Hands out empty directories instead of git clones.
    struct DirCheckout {
        root: TempDir,
        released: StdMutex<Vec<PathBuf>>,
        discarded: StdMutex<Vec<ResourceId>>,
        fail: bool,
        /// Create the directory, then never finish
        stall: bool,
    }

    impl DirCheckout {
        fn new() -> Self {
            Self {
                root: tempfile::tempdir().unwrap(),
                released: StdMutex::new(Vec::new()),
                discarded: StdMutex::new(Vec::new()),
                fail: false,
                stall: false,
            }
        }

        fn failing() -> Self {
            Self {
                fail: true,
                ..Self::new()
            }
        }

        fn stalling() -> Self {
            Self {
                stall: true,
                ..Self::new()
            }
        }

        fn path(&self, job: &BuildJob) -> PathBuf {
            self.root.path().join(job.id.to_string())
        }
    }

    #[async_trait]
    impl Checkout for DirCheckout {
        async fn obtain(&self, _project: &Project, job: &BuildJob) -> Result<WorkingDirectory> {
            if self.fail {
                return Err(Error::CheckoutFailed("no such commit".to_string()));
            }
            let path = self.path(job);
            std::fs::create_dir_all(&path).unwrap();
            if self.stall {
                std::future::pending::<()>().await;
            }
            Ok(WorkingDirectory::new(path, job.id))
        }

        async fn release(&self, dir: WorkingDirectory) -> Result<()> {
            std::fs::remove_dir_all(dir.path()).unwrap();
            self.released.lock().unwrap().push(dir.path().to_path_buf());
            Ok(())
        }

        async fn discard(&self, _project: &Project, job: &BuildJob) -> Result<()> {
            let path = self.path(job);
            if path.exists() {
                std::fs::remove_dir_all(path).unwrap();
            }
            self.discarded.lock().unwrap().push(job.id);
            Ok(())
        }
    }

    fn project(command: &str) -> Project {
        Project {
            name: "sample".to_string(),
            provider: GitProvider::Github,
            repository: "acme/sample".to_string(),
            clone_url: "https://github.com/acme/sample.git".to_string(),
            command: command.to_string(),
            branches: vec![],
            policy: BuildPolicy::BuildAll,
            secret: None,
            notifiers: vec![],
        }
    }

    fn job() -> BuildJob {
        BuildJob::new(
            "sample",
            Commit {
                sha: "c2".to_string(),
                author: "Ada".to_string(),
                message: "second".to_string(),
                branch: "main".to_string(),
                timestamp: None,
            },
        )
    }

    fn builder(checkout: Arc<DirCheckout>, settings: BuildSettings) -> ShellBuilder {
        ShellBuilder::new(checkout, settings)
    }

    #[tokio::test]
    async fn test_success_captures_output_and_env() {
        let checkout = Arc::new(DirCheckout::new());
        let builder = builder(checkout.clone(), BuildSettings::default());
        let result = builder
            .execute(
                &project("echo \"$KEEL_PROJECT@$KEEL_COMMIT on $KEEL_BRANCH\"; pwd"),
                &job(),
                CancellationToken::new(),
            )
            .await;

        assert_eq!(result.status, BuildStatus::Success);
        assert_eq!(result.exit_code, Some(0));
        assert!(result.output.contains("sample@c2 on main"));
        assert!(!result.truncated);
        assert_eq!(checkout.released.lock().unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_nonzero_exit_is_failed() {
        let checkout = Arc::new(DirCheckout::new());
        let builder = builder(checkout, BuildSettings::default());
        let result = builder
            .execute(&project("echo broken >&2; exit 3"), &job(), CancellationToken::new())
            .await;

        assert_eq!(result.status, BuildStatus::Failed);
        assert_eq!(result.exit_code, Some(3));
        assert!(result.output.contains("broken"));
        assert!(result.error.is_none());
    }

    #[tokio::test]
    async fn test_missing_command_is_errored() {
        let checkout = Arc::new(DirCheckout::new());
        let builder = builder(checkout, BuildSettings::default());
        let result = builder
            .execute(&project("keel-no-such-command-xyz"), &job(), CancellationToken::new())
            .await;
        assert_eq!(result.status, BuildStatus::Errored);
        assert_eq!(result.exit_code, Some(127));
    }

    #[tokio::test]
    async fn test_timeout_kills_command() {
        let checkout = Arc::new(DirCheckout::new());
        let settings = BuildSettings {
            timeout: Duration::from_millis(300),
            ..BuildSettings::default()
        };
        let builder = builder(checkout.clone(), settings);

        let started = std::time::Instant::now();
        let result = builder
            .execute(&project("echo started; sleep 30"), &job(), CancellationToken::new())
            .await;

        assert!(started.elapsed() < Duration::from_secs(10));
        assert_eq!(result.status, BuildStatus::Errored);
        assert!(result.error.unwrap().contains("timed out"));
        assert!(result.output.contains("started"));
        assert_eq!(checkout.released.lock().unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_cancel_stops_build() {
        let checkout = Arc::new(DirCheckout::new());
        let builder = builder(checkout, BuildSettings::default());
        let cancel = CancellationToken::new();
        let trigger = cancel.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(200)).await;
            trigger.cancel();
        });

        let started = std::time::Instant::now();
        let result = builder.execute(&project("sleep 30"), &job(), cancel).await;

        assert!(started.elapsed() < Duration::from_secs(10));
        assert_eq!(result.status, BuildStatus::Errored);
        assert!(result.error.unwrap().starts_with("cancelled"));
    }

    #[tokio::test]
    async fn test_interrupted_checkout_is_discarded() {
        let checkout = Arc::new(DirCheckout::stalling());
        let settings = BuildSettings {
            timeout: Duration::from_millis(300),
            ..BuildSettings::default()
        };
        let builder = builder(checkout.clone(), settings);

        let timed_out = job();
        let result = builder
            .execute(&project("true"), &timed_out, CancellationToken::new())
            .await;
        assert_eq!(result.status, BuildStatus::Errored);
        assert!(result.error.unwrap().contains("timed out"));
        assert!(!checkout.path(&timed_out).exists());

        let cancelled = job();
        let cancel = CancellationToken::new();
        let trigger = cancel.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(100)).await;
            trigger.cancel();
        });
        let result = builder.execute(&project("true"), &cancelled, cancel).await;
        assert!(result.error.unwrap().starts_with("cancelled"));
        assert!(!checkout.path(&cancelled).exists());

        assert_eq!(*checkout.discarded.lock().unwrap(), vec![timed_out.id, cancelled.id]);
        assert!(checkout.released.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_failed_checkout_is_not_discarded() {
        let checkout = Arc::new(DirCheckout::failing());
        let builder = builder(checkout.clone(), BuildSettings::default());
        builder
            .execute(&project("true"), &job(), CancellationToken::new())
            .await;
        assert!(checkout.discarded.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_background_process_does_not_hold_build_open() {
        let checkout = Arc::new(DirCheckout::new());
        let builder = builder(checkout, BuildSettings::default());

        let started = std::time::Instant::now();
        let result = builder
            .execute(&project("sleep 30 & echo done"), &job(), CancellationToken::new())
            .await;

        assert!(started.elapsed() < Duration::from_secs(10));
        assert_eq!(result.status, BuildStatus::Success);
        assert!(result.output.contains("done"));
    }

    #[tokio::test]
    async fn test_output_is_truncated() {
        let checkout = Arc::new(DirCheckout::new());
        let settings = BuildSettings {
            output_limit: 1000,
            ..BuildSettings::default()
        };
        let builder = builder(checkout, settings);
        let result = builder
            .execute(
                &project("i=0; while [ $i -lt 500 ]; do echo 0123456789; i=$((i+1)); done"),
                &job(),
                CancellationToken::new(),
            )
            .await;

        assert_eq!(result.status, BuildStatus::Success);
        assert!(result.truncated);
        assert!(result.output.ends_with(crate::output::TRUNCATION_MARKER));
        assert!(result.output.len() <= 1000 + crate::output::TRUNCATION_MARKER.len());
    }

    #[tokio::test]
    async fn test_checkout_failure_is_errored() {
        let checkout = Arc::new(DirCheckout::failing());
        let builder = builder(checkout, BuildSettings::default());
        let result = builder
            .execute(&project("true"), &job(), CancellationToken::new())
            .await;

        assert_eq!(result.status, BuildStatus::Errored);
        assert_eq!(result.exit_code, None);
        assert!(result.error.unwrap().contains("checkout failed"));
    }

    #[tokio::test]
    async fn test_keep_workdirs() {
        let checkout = Arc::new(DirCheckout::new());
        let settings = BuildSettings {
            keep_workdirs: true,
            ..BuildSettings::default()
        };
        let builder = builder(checkout.clone(), settings);
        let job = job();
        let result = builder
            .execute(&project("touch artifact"), &job, CancellationToken::new())
            .await;

        assert_eq!(result.status, BuildStatus::Success);
        assert!(checkout.released.lock().unwrap().is_empty());
        assert!(
            checkout
                .root
                .path()
                .join(job.id.to_string())
                .join("artifact")
                .exists()
        );
    }
}
