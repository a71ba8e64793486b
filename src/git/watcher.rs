use std::path::{Path, PathBuf};
use std::sync::RwLock;
use std::time::{Duration, Instant};

use chrono::Utc;
use tokio::process::Command;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use crate::telemetry;

use super::{AuthConfig, ChangeEvent, GitError};

pub struct Watcher {
    repo_name: String,
    repo_url: String,
    branch: String,
    work_dir: PathBuf,
    poll_interval: Duration,
    auth: AuthConfig,
    last_commit: RwLock<String>,
}

impl Watcher {
    pub fn new(
        repo_name: &str,
        repo_url: &str,
        branch: &str,
        work_dir: impl Into<PathBuf>,
        poll_interval: Duration,
        auth: AuthConfig,
    ) -> Watcher {
        Watcher {
            repo_name: repo_name.to_string(),
            repo_url: repo_url.to_string(),
            branch: branch.to_string(),
            work_dir: work_dir.into(),
            poll_interval,
            auth,
            last_commit: RwLock::new(String::new()),
        }
    }

    pub fn work_dir(&self) -> &Path {
        &self.work_dir
    }

    pub fn last_commit(&self) -> String {
        self.last_commit.read().expect("last_commit lock").clone()
    }

    /// Ensure the work tree exists and is current. A missing directory is
    /// shallow-cloned single-branch; an existing clone is opened and pulled;
    /// an existing directory that is not a git tree is refused untouched.
    pub async fn clone_repo(&self) -> Result<(), GitError> {
        if !self.work_dir.exists() {
            if let Some(parent) = self.work_dir.parent() {
                if !parent.as_os_str().is_empty() {
                    std::fs::create_dir_all(parent)?;
                }
            }

            info!(repo = %self.repo_name, url = %self.repo_url, "cloning repository");
            self.run_git(
                None,
                &[
                    "clone",
                    "--branch",
                    &self.branch,
                    "--single-branch",
                    "--depth",
                    "1",
                    &self.repo_url,
                    &self.work_dir.to_string_lossy(),
                ],
            )
            .await?;

            self.update_last_commit().await?;
            return Ok(());
        }

        if !self.work_dir.join(".git").exists() {
            return Err(GitError::NotARepository(
                self.work_dir.display().to_string(),
            ));
        }

        self.pull().await.map(|_| ())
    }

    /// Fetch and fast-forward the work tree. A dirty tree or a
    /// non-fast-forward branch triggers hard-reset recovery to
    /// `origin/<branch>`; any other failure propagates. Returns whether the
    /// tip moved, and the new tip.
    pub async fn pull(&self) -> Result<(bool, String), GitError> {
        let previous = self.last_commit();

        let status = self.run_git(Some(&self.work_dir), &["status", "--porcelain"]).await?;
        if !status.is_empty() {
            warn!(repo = %self.repo_name, "work tree is dirty; hard resetting");
            self.hard_reset().await?;
        } else {
            self.run_git(Some(&self.work_dir), &["fetch", "origin", &self.branch])
                .await?;

            let remote_ref = format!("origin/{}", self.branch);
            match self
                .run_git(Some(&self.work_dir), &["merge", "--ff-only", &remote_ref])
                .await
            {
                Ok(_) => {}
                Err(GitError::CommandFailed { stderr, .. }) if is_recoverable(&stderr) => {
                    warn!(repo = %self.repo_name, "fast-forward failed; hard resetting");
                    self.hard_reset().await?;
                }
                Err(err) => return Err(err),
            }
        }

        let current = self.update_last_commit().await?;
        Ok((current != previous, current))
    }

    async fn hard_reset(&self) -> Result<(), GitError> {
        self.run_git(
            Some(&self.work_dir),
            &["fetch", "--force", "origin", &self.branch],
        )
        .await?;

        let remote_ref = format!("origin/{}", self.branch);
        self.run_git(Some(&self.work_dir), &["reset", "--hard", &remote_ref])
            .await?;
        Ok(())
    }

    /// Poll the remote at the configured interval and push every advance
    /// into `events`. The queue is bounded; when it is full the poll loop
    /// blocks (logging periodically) rather than dropping events.
    pub async fn watch(&self, token: CancellationToken, events: mpsc::Sender<ChangeEvent>) {
        let mut ticker = tokio::time::interval(self.poll_interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        // The first interval tick completes immediately; consume it so the
        // first poll happens one interval after startup.
        ticker.tick().await;

        loop {
            tokio::select! {
                _ = token.cancelled() => return,
                _ = ticker.tick() => {}
            }

            let started = Instant::now();
            let pulled = self.pull().await;
            telemetry::record_git_poll(&self.repo_name, started.elapsed(), pulled.is_ok());

            let (changed, hash) = match pulled {
                Ok(result) => result,
                Err(err) => {
                    error!(repo = %self.repo_name, error = %err, "failed to pull");
                    continue;
                }
            };

            if !changed {
                continue;
            }

            let event = ChangeEvent {
                message: self.commit_message(&hash).await.unwrap_or_default(),
                commit: hash,
                timestamp: Utc::now(),
            };

            if !self.enqueue(&token, &events, event).await {
                return;
            }
        }
    }

    async fn enqueue(
        &self,
        token: &CancellationToken,
        events: &mpsc::Sender<ChangeEvent>,
        event: ChangeEvent,
    ) -> bool {
        loop {
            tokio::select! {
                _ = token.cancelled() => return false,
                permit = events.reserve() => {
                    match permit {
                        Ok(permit) => {
                            permit.send(event.clone());
                            return true;
                        }
                        // Receiver is gone; the controller is shutting down.
                        Err(_) => return false,
                    }
                }
                _ = tokio::time::sleep(self.poll_interval) => {
                    warn!(
                        repo = %self.repo_name,
                        commit = %event.commit,
                        "event queue full; waiting for handler"
                    );
                }
            }
        }
    }

    /// Current HEAD of the work tree, without touching the network.
    pub async fn head(&self) -> Result<String, GitError> {
        self.run_git(Some(&self.work_dir), &["rev-parse", "HEAD"]).await
    }

    async fn commit_message(&self, hash: &str) -> Result<String, GitError> {
        self.run_git(Some(&self.work_dir), &["log", "-1", "--format=%B", hash])
            .await
    }

    async fn update_last_commit(&self) -> Result<String, GitError> {
        let head = self.head().await?;
        *self.last_commit.write().expect("last_commit lock") = head.clone();
        Ok(head)
    }

    async fn run_git(&self, cwd: Option<&Path>, args: &[&str]) -> Result<String, GitError> {
        let mut command = Command::new("git");
        command.args(self.auth.config_args()?);
        command.args(args);
        command.envs(self.auth.environment()?);
        command.kill_on_drop(true);

        if let Some(cwd) = cwd {
            command.current_dir(cwd);
        }

        let output = command.output().await?;
        if !output.status.success() {
            return Err(GitError::CommandFailed {
                operation: args.first().unwrap_or(&"git").to_string(),
                stderr: String::from_utf8_lossy(&output.stderr).trim().to_string(),
            });
        }

        Ok(String::from_utf8_lossy(&output.stdout).trim().to_string())
    }
}

/// Failures that hard-reset recovery can fix: local edits in the way of a
/// merge, or a branch that no longer fast-forwards.
pub(crate) fn is_recoverable(stderr: &str) -> bool {
    const RECOVERABLE: &[&str] = &[
        "not possible to fast-forward",
        "would be overwritten by merge",
        "unstaged changes",
        "uncommitted changes",
        "commit your changes",
        "needs merge",
    ];

    let stderr = stderr.to_lowercase();
    RECOVERABLE.iter().any(|marker| stderr.contains(marker))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn test_watcher(work_dir: &Path) -> Watcher {
        Watcher::new(
            "test-repo",
            "https://example.com/repo.git",
            "main",
            work_dir,
            Duration::from_secs(60),
            AuthConfig::default(),
        )
    }

    #[test]
    fn recoverable_errors() {
        assert!(is_recoverable("fatal: Not possible to fast-forward, aborting."));
        assert!(is_recoverable(
            "error: Your local changes to the following files would be overwritten by merge:"
        ));
        assert!(is_recoverable("error: cannot pull with rebase: You have unstaged changes."));
        assert!(!is_recoverable("fatal: unable to access 'https://example.com/': timeout"));
        assert!(!is_recoverable("fatal: couldn't find remote ref main"));
    }

    #[tokio::test]
    async fn refuses_non_git_directory() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("random.txt"), "not a repo").unwrap();

        let watcher = test_watcher(dir.path());
        let err = watcher.clone_repo().await.unwrap_err();
        assert!(matches!(err, GitError::NotARepository(_)));
        // The refused directory is left untouched.
        assert!(dir.path().join("random.txt").exists());
    }

    mod integration {
        use super::*;
        use std::process::Command as StdCommand;

        fn git(dir: &Path, args: &[&str]) {
            let status = StdCommand::new("git")
                .args([
                    "-c",
                    "user.email=kedge@test.invalid",
                    "-c",
                    "user.name=kedge",
                ])
                .args(args)
                .current_dir(dir)
                .status()
                .expect("run git");
            assert!(status.success(), "git {args:?} failed");
        }

        fn seed_remote(dir: &Path) {
            git(dir, &["init", "--initial-branch=main", "."]);
            std::fs::write(dir.join("docker-compose.yaml"), "services: {}\n").unwrap();
            git(dir, &["add", "."]);
            git(dir, &["commit", "-m", "initial commit"]);
        }

        #[tokio::test]
        #[ignore = "requires the git binary"]
        async fn clone_pull_and_detect_change() {
            let remote = tempfile::tempdir().unwrap();
            seed_remote(remote.path());

            let clones = tempfile::tempdir().unwrap();
            let work_dir = clones.path().join("clone");
            let watcher = Watcher::new(
                "test-repo",
                &remote.path().to_string_lossy(),
                "main",
                &work_dir,
                Duration::from_secs(60),
                AuthConfig::default(),
            );

            watcher.clone_repo().await.unwrap();
            let first = watcher.last_commit();
            assert_eq!(first.len(), 40);

            let (changed, hash) = watcher.pull().await.unwrap();
            assert!(!changed);
            assert_eq!(hash, first);

            std::fs::write(remote.path().join("docker-compose.yaml"), "services:\n  web:\n    image: nginx\n").unwrap();
            git(remote.path(), &["commit", "-am", "update compose"]);

            let (changed, hash) = watcher.pull().await.unwrap();
            assert!(changed);
            assert_ne!(hash, first);
        }

        #[tokio::test]
        #[ignore = "requires the git binary"]
        async fn dirty_work_tree_is_reset_to_upstream() {
            let remote = tempfile::tempdir().unwrap();
            seed_remote(remote.path());

            let clones = tempfile::tempdir().unwrap();
            let work_dir = clones.path().join("clone");
            let watcher = Watcher::new(
                "test-repo",
                &remote.path().to_string_lossy(),
                "main",
                &work_dir,
                Duration::from_secs(60),
                AuthConfig::default(),
            );
            watcher.clone_repo().await.unwrap();

            // Local mutation between polls.
            std::fs::write(work_dir.join("docker-compose.yaml"), "tampered\n").unwrap();

            let (changed, _) = watcher.pull().await.unwrap();
            assert!(!changed);

            let restored = std::fs::read_to_string(work_dir.join("docker-compose.yaml")).unwrap();
            assert_eq!(restored, "services: {}\n");
        }
    }
}
