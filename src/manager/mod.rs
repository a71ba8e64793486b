//! Controller supervision.
//!
//! The manager starts one controller per registered repo, concurrently, and
//! tracks per-repo status. Individual repos are allowed to fail — overall
//! startup only fails when no controller at all comes up. A controller that
//! dies later is removed from the active map while the manager stays up.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::{Arc, RwLock};

use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use crate::conf::Config;
use crate::controller::{Controller, ControllerConfig};
use crate::git::{AuthConfig, Watcher};
use crate::reconcile::{ReconcileConfig, ReconcileMode};
use crate::storage::{Db, Repo, StorageError};

#[derive(thiserror::Error, Debug)]
pub enum ManagerError {
    #[error(transparent)]
    Storage(#[from] StorageError),

    #[error("all repos failed to start: {0}")]
    AllReposFailed(String),

    #[error("repository {0} has no running controller")]
    RepoNotRunning(String),

    #[error("sync failed; {0}")]
    Sync(String),
}

#[derive(Debug, Clone, Default)]
pub struct RepoStatus {
    pub running: bool,
    pub error: Option<String>,
}

pub struct Manager {
    store: Db,
    controllers: RwLock<HashMap<String, Arc<Controller>>>,
    repo_status: RwLock<HashMap<String, RepoStatus>>,
}

impl Manager {
    pub fn new(store: Db) -> Arc<Manager> {
        Arc::new(Manager {
            store,
            controllers: RwLock::new(HashMap::new()),
            repo_status: RwLock::new(HashMap::new()),
        })
    }

    pub fn store(&self) -> &Db {
        &self.store
    }

    /// Start a controller for every registered repo and block until
    /// cancellation. Fails only when every repo failed to start.
    pub async fn start(self: &Arc<Self>, token: CancellationToken) -> Result<(), ManagerError> {
        let repos = self.store.list_repos().await?;

        if repos.is_empty() {
            info!("no repositories registered, waiting for repos to be added");
            token.cancelled().await;
            return Ok(());
        }

        let mut starts = Vec::with_capacity(repos.len());
        for repo in repos {
            let manager = Arc::clone(self);
            let repo_token = token.child_token();
            starts.push(tokio::spawn(async move {
                let name = repo.name.clone();
                manager
                    .start_repo(repo, repo_token)
                    .await
                    .map_err(|err| format!("repo {name}: {err}"))
            }));
        }

        let mut failures = Vec::new();
        for start in starts {
            match start.await {
                Ok(Ok(())) => {}
                Ok(Err(message)) => {
                    error!(error = %message, "failed to start repo");
                    failures.push(message);
                }
                Err(join_err) => failures.push(format!("start task failed: {join_err}")),
            }
        }

        let running = self.controllers.read().expect("controllers lock").len();
        if running == 0 && !failures.is_empty() {
            return Err(ManagerError::AllReposFailed(failures.join("; ")));
        }
        if !failures.is_empty() {
            warn!(failed = failures.len(), running, "some repos failed to start");
        }

        token.cancelled().await;
        Ok(())
    }

    async fn start_repo(
        self: &Arc<Self>,
        repo: Repo,
        token: CancellationToken,
    ) -> Result<(), String> {
        let result = self.build_and_launch(&repo, token).await;

        if let Err(message) = &result {
            self.set_status(
                &repo.name,
                RepoStatus {
                    running: false,
                    error: Some(message.clone()),
                },
            );
        }
        result
    }

    async fn build_and_launch(
        self: &Arc<Self>,
        repo: &Repo,
        token: CancellationToken,
    ) -> Result<(), String> {
        let auth = AuthConfig::from_repo(repo).map_err(|err| err.to_string())?;
        let work_dir = repo_work_dir(&repo.name);

        // An initial clone so the per-repo config can be read; the controller
        // re-opens the tree when it runs.
        let bootstrap = Watcher::new(
            &repo.name,
            &repo.url,
            &repo.branch,
            &work_dir,
            std::time::Duration::from_secs(60),
            auth.clone(),
        );
        bootstrap
            .clone_repo()
            .await
            .map_err(|err| format!("clone: {err}"))?;

        let repo_config = Config::load_from_work_dir(&work_dir)
            .map_err(|_| "kedge.yaml not found".to_string())?;

        let mode = match repo_config.reconciliation.mode.parse::<ReconcileMode>() {
            Ok(mode) => mode,
            Err(_) => {
                warn!(
                    repo = %repo.name,
                    mode = %repo_config.reconciliation.mode,
                    "unknown reconcile mode; falling back to auto"
                );
                ReconcileMode::Auto
            }
        };

        let watcher = Arc::new(Watcher::new(
            &repo.name,
            &repo.url,
            &repo.branch,
            &work_dir,
            repo_config.git.poll_interval,
            auth,
        ));

        let controller_config = ControllerConfig {
            repo_name: repo.name.clone(),
            project_name: repo_config.docker.project_name.clone(),
            compose_path: repo_config.docker.compose_file.clone(),
            reconcile: ReconcileConfig {
                mode,
                interval: repo_config.reconciliation.interval,
            },
        };

        let controller = Controller::new(self.store.clone(), watcher, controller_config)
            .await
            .map_err(|err| format!("create controller: {err}"))?;

        self.controllers
            .write()
            .expect("controllers lock")
            .insert(repo.name.clone(), Arc::clone(&controller));
        self.set_status(&repo.name, RepoStatus { running: true, error: None });

        info!(repo = %repo.name, url = %repo.url, "starting repo");

        let manager = Arc::clone(self);
        let repo_name = repo.name.clone();
        tokio::spawn(async move {
            if let Err(err) = Arc::clone(&controller).run(token.clone()).await {
                if !token.is_cancelled() {
                    error!(repo = %repo_name, error = %err, "controller stopped");
                    manager.set_status(
                        &repo_name,
                        RepoStatus {
                            running: false,
                            error: Some(err.to_string()),
                        },
                    );
                    manager
                        .controllers
                        .write()
                        .expect("controllers lock")
                        .remove(&repo_name);
                }
            }
        });

        Ok(())
    }

    fn set_status(&self, repo_name: &str, status: RepoStatus) {
        self.repo_status
            .write()
            .expect("repo_status lock")
            .insert(repo_name.to_string(), status);
    }

    /// Ready iff any controller is ready.
    pub fn is_ready(&self) -> bool {
        self.controllers
            .read()
            .expect("controllers lock")
            .values()
            .any(|controller| controller.is_ready())
    }

    pub fn status(&self) -> HashMap<String, RepoStatus> {
        self.repo_status.read().expect("repo_status lock").clone()
    }

    /// Pull-and-reconcile on the named repo's controller; the webhook
    /// dispatcher's entry point.
    pub async fn trigger_sync(&self, repo_name: &str) -> Result<(), ManagerError> {
        let controller = self
            .controllers
            .read()
            .expect("controllers lock")
            .get(repo_name)
            .cloned();

        match controller {
            Some(controller) => controller
                .pull_and_reconcile()
                .await
                .map_err(|err| ManagerError::Sync(err.to_string())),
            None => Err(ManagerError::RepoNotRunning(repo_name.to_string())),
        }
    }

    pub async fn find_repo_by_url(&self, raw_url: &str) -> Result<Repo, StorageError> {
        self.store.find_repo_by_url(raw_url).await
    }

    /// Drop every controller and close the store. Runs after the root
    /// context is cancelled and the controller tasks have unwound.
    pub async fn close(&self) {
        self.controllers.write().expect("controllers lock").clear();
        self.store.close().await;
    }
}

/// Git clones live under `.kedge/repos/<repo-name>`.
pub fn repo_work_dir(repo_name: &str) -> PathBuf {
    Path::new(".kedge").join("repos").join(repo_name)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::tests::TestHarness;

    #[test]
    fn work_dir_layout() {
        assert_eq!(
            repo_work_dir("my-app"),
            Path::new(".kedge").join("repos").join("my-app")
        );
    }

    #[tokio::test]
    async fn start_with_no_repos_waits_for_cancellation() {
        let harness = TestHarness::new().await;
        let manager = Manager::new(harness.db.clone());

        let token = CancellationToken::new();
        token.cancel();

        manager.start(token).await.unwrap();
        assert!(!manager.is_ready());
        assert!(manager.status().is_empty());
    }

    #[tokio::test]
    async fn trigger_sync_without_controller() {
        let harness = TestHarness::new().await;
        let manager = Manager::new(harness.db.clone());

        let err = manager.trigger_sync("ghost").await.unwrap_err();
        assert!(matches!(err, ManagerError::RepoNotRunning(_)));
    }
}
