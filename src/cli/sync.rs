use std::sync::Arc;

use anyhow::Context;

use crate::controller::{Controller, ControllerConfig};
use crate::git::{AuthConfig, Watcher};
use crate::manager::repo_work_dir;
use crate::reconcile::{ReconcileConfig, ReconcileMode};

use super::CliHarness;

/// Reconcile the selected repo once. `--force` applies desired state
/// unconditionally; without it the configured mode decides whether drift is
/// remediated.
pub async fn run(harness: &CliHarness, force: bool) -> anyhow::Result<()> {
    let repo = harness.require_repo()?;
    let config = &harness.config;

    let mode = config
        .reconciliation
        .mode
        .parse::<ReconcileMode>()
        .unwrap_or_default();

    let auth = AuthConfig::from_repo(repo)?;
    let watcher = Arc::new(Watcher::new(
        &repo.name,
        &repo.url,
        &repo.branch,
        repo_work_dir(&repo.name),
        config.git.poll_interval,
        auth,
    ));

    let store = harness.open_store().await?;
    let controller = Controller::new(
        store.clone(),
        watcher,
        ControllerConfig {
            repo_name: repo.name.clone(),
            project_name: config.docker.project_name.clone(),
            compose_path: config.docker.compose_file.clone(),
            reconcile: ReconcileConfig {
                mode,
                interval: config.reconciliation.interval,
            },
        },
    )
    .await
    .context("create controller")?;

    let result = if force {
        controller.sync().await
    } else {
        controller.reconcile().await
    };
    store.close().await;
    result?;

    println!("Sync completed successfully");
    Ok(())
}
