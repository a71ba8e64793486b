//! Reconciliation state machine.
//!
//! Holds the current target (project + commit) behind a snapshot lock so the
//! controller can swap targets while the drift watcher reads concurrently.
//! The mode decides what happens when drift is found: `auto` applies,
//! `notify` and `manual` report and leave the runtime alone.

use std::collections::HashMap;
use std::sync::{Arc, RwLock};
use std::time::Duration;

use strum::{Display, EnumString};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::compose::Project;
use crate::docker::{Client, DockerError, ServiceDiff};
use crate::telemetry;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Display, EnumString)]
#[strum(serialize_all = "lowercase")]
pub enum ReconcileMode {
    #[default]
    Auto,
    Notify,
    Manual,
}

#[derive(Debug, Clone)]
pub struct ReconcileConfig {
    pub mode: ReconcileMode,
    pub interval: Duration,
}

impl Default for ReconcileConfig {
    fn default() -> Self {
        Self {
            mode: ReconcileMode::Auto,
            interval: Duration::from_secs(30),
        }
    }
}

/// Outcome of one reconcile pass. `reconciled` is only true when changes
/// were actually applied; drift that a non-auto mode declined to fix comes
/// back as `reconciled: false` with the changes attached.
#[derive(Debug, Default)]
pub struct ReconcileResult {
    pub reconciled: bool,
    pub changes: Vec<ServiceDiff>,
    pub error: Option<DockerError>,
}

#[derive(Default)]
struct Target {
    project: Option<Arc<Project>>,
    commit: String,
}

pub struct Reconciler {
    client: Arc<Client>,
    repo_name: String,
    config: ReconcileConfig,
    target: RwLock<Target>,
}

impl Reconciler {
    pub fn new(client: Arc<Client>, repo_name: &str, config: ReconcileConfig) -> Reconciler {
        Reconciler {
            client,
            repo_name: repo_name.to_string(),
            config,
            target: RwLock::new(Target::default()),
        }
    }

    pub fn mode(&self) -> ReconcileMode {
        self.config.mode
    }

    pub fn set_project(&self, project: Arc<Project>) {
        self.target.write().expect("target lock").project = Some(project);
    }

    pub fn set_commit(&self, commit: &str) {
        self.target.write().expect("target lock").commit = commit.to_string();
    }

    fn snapshot(&self) -> (Option<Arc<Project>>, String) {
        let target = self.target.read().expect("target lock");
        (target.project.clone(), target.commit.clone())
    }

    /// Diff, then act per mode. In-sync is a no-op for every mode.
    pub async fn reconcile(&self) -> ReconcileResult {
        let (project, commit) = self.snapshot();
        let Some(project) = project else {
            debug!(repo = %self.repo_name, "no project loaded yet; skipping reconcile");
            return ReconcileResult::default();
        };

        let diff = match self.client.diff(&project).await {
            Ok(diff) => diff,
            Err(err) => {
                return ReconcileResult {
                    error: Some(err),
                    ..Default::default()
                }
            }
        };

        if diff.in_sync {
            debug!(repo = %self.repo_name, "no drift detected");
            return ReconcileResult::default();
        }

        info!(repo = %self.repo_name, summary = %diff.summary, "drift detected");
        for change in &diff.changes {
            telemetry::record_drift(&self.repo_name, &change.service);
        }

        match self.config.mode {
            ReconcileMode::Notify => {
                info!(repo = %self.repo_name, "notify mode: skipping remediation");
                ReconcileResult {
                    changes: diff.changes,
                    ..Default::default()
                }
            }
            ReconcileMode::Manual => {
                info!(repo = %self.repo_name, "manual mode: waiting for sync command");
                ReconcileResult {
                    changes: diff.changes,
                    ..Default::default()
                }
            }
            ReconcileMode::Auto => self.apply(&project, &commit, diff.changes).await,
        }
    }

    /// Force-apply the desired state regardless of mode or diff. Used by
    /// the sync and rollback paths.
    pub async fn sync(&self) -> ReconcileResult {
        info!(repo = %self.repo_name, "force sync requested");

        let (project, commit) = self.snapshot();
        let Some(project) = project else {
            return ReconcileResult {
                error: Some(DockerError::Failed("no project loaded".to_string())),
                ..Default::default()
            };
        };

        self.apply(&project, &commit, Vec::new()).await
    }

    async fn apply(
        &self,
        project: &Project,
        commit: &str,
        changes: Vec<ServiceDiff>,
    ) -> ReconcileResult {
        if !changes.is_empty() {
            info!(repo = %self.repo_name, count = changes.len(), "applying changes");
        }

        if let Err(err) = self.client.deploy(project, commit).await {
            return ReconcileResult {
                changes,
                error: Some(err),
                ..Default::default()
            };
        }

        if let Err(err) = self.client.prune(&project.service_names()).await {
            warn!(repo = %self.repo_name, error = %err, "prune failed");
        }

        self.record_service_states().await;

        info!(repo = %self.repo_name, "reconciliation complete");
        ReconcileResult {
            reconciled: true,
            changes,
            error: None,
        }
    }

    async fn record_service_states(&self) {
        let Ok(statuses) = self.client.status().await else {
            return;
        };

        let mut counts: HashMap<String, usize> = HashMap::new();
        for status in &statuses {
            *counts.entry(status.state.clone()).or_default() += 1;
        }
        for (state, count) in counts {
            telemetry::set_services(&self.repo_name, &state, count as f64);
        }
    }

    /// Periodic drift detection. Results are forwarded into `results`;
    /// sends race against cancellation so shutdown is never blocked on a
    /// slow consumer.
    pub async fn watch(&self, token: CancellationToken, results: mpsc::Sender<ReconcileResult>) {
        let mut ticker = tokio::time::interval(self.config.interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        ticker.tick().await;

        loop {
            tokio::select! {
                _ = token.cancelled() => return,
                _ = ticker.tick() => {}
            }

            let result = self.reconcile().await;

            tokio::select! {
                _ = token.cancelled() => return,
                sent = results.send(result) => {
                    if sent.is_err() {
                        return;
                    }
                }
            }
        }
    }
}
