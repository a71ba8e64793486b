//! Per-repository control loop.
//!
//! Composes the git watcher, the reconciler, and the state store: clone,
//! reconcile the cloned HEAD, mark ready, then keep reconciling on change
//! events and on the drift timer. Every reconcile attempt is recorded as a
//! deployment row, pending first and finalized with the outcome.

use std::path::{Component, Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Instant;

use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use crate::compose::{self, ComposeError};
use crate::docker::{Client, DockerError};
use crate::git::{ChangeEvent, GitError, Watcher};
use crate::reconcile::{ReconcileConfig, Reconciler};
use crate::storage::{Db, DeploymentStatus};
use crate::telemetry;

#[derive(thiserror::Error, Debug)]
pub enum ControllerError {
    #[error("compose path must be relative and must not contain '..': {0}")]
    InvalidComposePath(String),

    #[error(transparent)]
    Git(#[from] GitError),

    #[error(transparent)]
    Docker(#[from] DockerError),

    #[error(transparent)]
    Compose(#[from] ComposeError),

    #[error("could not read compose file; {0}")]
    Io(#[from] std::io::Error),

    #[error("initial reconcile: {0}")]
    InitialReconcile(String),
}

#[derive(Debug, Clone)]
pub struct ControllerConfig {
    pub repo_name: String,
    pub project_name: String,
    pub compose_path: String,
    pub reconcile: ReconcileConfig,
}

pub struct Controller {
    watcher: Arc<Watcher>,
    reconciler: Arc<Reconciler>,
    store: Db,
    config: ControllerConfig,
    ready: AtomicBool,
}

impl Controller {
    pub async fn new(
        store: Db,
        watcher: Arc<Watcher>,
        config: ControllerConfig,
    ) -> Result<Arc<Controller>, ControllerError> {
        validate_compose_path(&config.compose_path)?;

        let client = Arc::new(Client::new(&config.project_name).await?);
        let reconciler = Arc::new(Reconciler::new(
            client,
            &config.repo_name,
            config.reconcile.clone(),
        ));

        Ok(Arc::new(Controller {
            watcher,
            reconciler,
            store,
            config,
            ready: AtomicBool::new(false),
        }))
    }

    /// Ready means the first reconcile of the cloned HEAD succeeded.
    pub fn is_ready(&self) -> bool {
        self.ready.load(Ordering::SeqCst)
    }

    /// The main loop: clone, initial reconcile, drift watcher, then change
    /// events until cancellation. Per-event reconcile failures are recorded
    /// and swallowed so the loop keeps running; an initial reconcile failure
    /// is returned and leaves the controller not ready.
    pub async fn run(self: Arc<Self>, token: CancellationToken) -> Result<(), ControllerError> {
        self.watcher.clone_repo().await?;

        let head = self.watcher.last_commit();
        self.load_and_reconcile(&head)
            .await
            .map_err(|err| ControllerError::InitialReconcile(err.to_string()))?;

        self.ready.store(true, Ordering::SeqCst);
        info!(repo = %self.config.repo_name, "controller ready");

        self.spawn_drift_watcher(&token);

        let (event_tx, mut event_rx) = mpsc::channel::<ChangeEvent>(16);
        let watcher = Arc::clone(&self.watcher);
        let watch_token = token.child_token();
        tokio::spawn(async move { watcher.watch(watch_token, event_tx).await });

        loop {
            tokio::select! {
                _ = token.cancelled() => return Ok(()),
                event = event_rx.recv() => {
                    let Some(event) = event else { return Ok(()) };

                    // Handler runs in its own task so a panic cannot take
                    // down the event loop; events stay strictly ordered
                    // because we await each one.
                    let controller = Arc::clone(&self);
                    let handle = tokio::spawn(async move {
                        controller.handle_change(event).await;
                    });
                    if let Err(join_err) = handle.await {
                        if join_err.is_panic() {
                            error!(
                                repo = %self.config.repo_name,
                                "panic in change handler; poll loop continues"
                            );
                        }
                    }
                }
            }
        }
    }

    fn spawn_drift_watcher(&self, token: &CancellationToken) {
        let (drift_tx, mut drift_rx) = mpsc::channel(1);
        let reconciler = Arc::clone(&self.reconciler);
        let drift_token = token.child_token();
        tokio::spawn(async move { reconciler.watch(drift_token, drift_tx).await });

        let repo = self.config.repo_name.clone();
        tokio::spawn(async move {
            while let Some(result) = drift_rx.recv().await {
                match &result.error {
                    Some(err) => error!(repo = %repo, error = %err, "drift reconcile failed"),
                    None if result.reconciled => {
                        info!(repo = %repo, changes = result.changes.len(), "drift repaired")
                    }
                    None => {}
                }
            }
        });
    }

    async fn handle_change(&self, event: ChangeEvent) {
        info!(
            repo = %self.config.repo_name,
            commit = &event.commit[..event.commit.len().min(8)],
            message = event.message.lines().next().unwrap_or_default(),
            "git change detected"
        );

        if let Err(err) = self.load_and_reconcile(&event.commit).await {
            error!(repo = %self.config.repo_name, error = %err, "reconcile failed");
        }
    }

    /// Load the compose project at `commit` from the work tree, record the
    /// attempt, reconcile, and finalize the deployment row.
    pub async fn load_and_reconcile(&self, commit: &str) -> Result<(), ControllerError> {
        let compose_text = self.read_compose().await?;
        let project = compose::load(&compose_text, &self.config.project_name)?;

        self.reconciler.set_project(Arc::new(project));
        self.reconciler.set_commit(commit);

        let pending = match self
            .store
            .save_deployment(
                &self.config.repo_name,
                commit,
                &compose_text,
                DeploymentStatus::Pending,
                "",
            )
            .await
        {
            Ok(deployment) => Some(deployment),
            Err(err) => {
                warn!(repo = %self.config.repo_name, error = %err, "failed to save deployment");
                None
            }
        };

        let started = Instant::now();
        let result = self.reconciler.reconcile().await;
        telemetry::record_reconciliation(
            &self.config.repo_name,
            started.elapsed(),
            result.error.is_none(),
        );

        let (status, message) = match (&result.error, result.reconciled) {
            (Some(err), _) => (DeploymentStatus::Failed, err.to_string()),
            (None, true) => (DeploymentStatus::Success, String::new()),
            (None, false) => (DeploymentStatus::Skipped, "no changes applied".to_string()),
        };

        if let Some(deployment) = pending {
            if let Err(err) = self
                .store
                .update_deployment_status(deployment.id, status, &message)
                .await
            {
                warn!(repo = %self.config.repo_name, error = %err, "failed to update deployment status");
            }
        }
        telemetry::record_deployment(&self.config.repo_name, &status.to_string());

        match result.error {
            Some(err) => Err(ControllerError::Docker(err)),
            None => Ok(()),
        }
    }

    /// The webhook and manual trigger path: pull, and reconcile only when
    /// the branch tip moved.
    pub async fn pull_and_reconcile(&self) -> Result<(), ControllerError> {
        let (changed, hash) = self.watcher.pull().await?;
        if !changed {
            info!(repo = %self.config.repo_name, "branch tip unchanged; nothing to do");
            return Ok(());
        }

        self.load_and_reconcile(&hash).await
    }

    /// Standalone reconcile for CLI use: reload the project from the work
    /// tree, then run a mode-driven reconcile.
    pub async fn reconcile(&self) -> Result<(), ControllerError> {
        self.reload_project().await?;
        let result = self.reconciler.reconcile().await;
        match result.error {
            Some(err) => Err(ControllerError::Docker(err)),
            None => Ok(()),
        }
    }

    /// Standalone force-sync for CLI use: apply desired state regardless of
    /// diff or mode.
    pub async fn sync(&self) -> Result<(), ControllerError> {
        self.reload_project().await?;
        let result = self.reconciler.sync().await;
        match result.error {
            Some(err) => Err(ControllerError::Docker(err)),
            None => Ok(()),
        }
    }

    async fn reload_project(&self) -> Result<(), ControllerError> {
        let head = self.watcher.head().await?;
        let compose_text = self.read_compose().await?;
        let project = compose::load(&compose_text, &self.config.project_name)?;

        self.reconciler.set_project(Arc::new(project));
        self.reconciler.set_commit(&head);
        Ok(())
    }

    async fn read_compose(&self) -> Result<String, ControllerError> {
        let path = self.compose_file_path();
        Ok(tokio::fs::read_to_string(&path).await?)
    }

    fn compose_file_path(&self) -> PathBuf {
        self.watcher.work_dir().join(&self.config.compose_path)
    }
}

/// The compose path is confined to the work tree: it must be relative and
/// free of parent-directory components.
fn validate_compose_path(compose_path: &str) -> Result<(), ControllerError> {
    let path = Path::new(compose_path);
    let escapes = path.is_absolute()
        || path
            .components()
            .any(|component| matches!(component, Component::ParentDir));

    if escapes {
        return Err(ControllerError::InvalidComposePath(compose_path.to_string()));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn compose_path_confinement() {
        assert!(validate_compose_path("docker-compose.yaml").is_ok());
        assert!(validate_compose_path("deploy/compose.yaml").is_ok());
        assert!(validate_compose_path("/etc/passwd").is_err());
        assert!(validate_compose_path("../outside.yaml").is_err());
        assert!(validate_compose_path("deploy/../../outside.yaml").is_err());
    }
}
