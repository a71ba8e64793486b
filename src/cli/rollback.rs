use anyhow::{anyhow, Context};
use tracing::warn;

use crate::compose;
use crate::docker::Client;
use crate::storage::{Db, Deployment, DeploymentStatus, StorageError};

use super::{short_commit, CliHarness};

/// Redeploy the compose content stored in an earlier deployment row, then
/// append a `rolled_back` row for the target commit. Earlier rows are never
/// rewritten.
pub async fn run(harness: &CliHarness, commit_prefix: &str) -> anyhow::Result<()> {
    let repo = harness.require_repo()?;
    let config = &harness.config;

    let store = harness.open_store().await?;
    let deployment = find_deployment(&store, &repo.name, commit_prefix).await?;

    let project = compose::load(&deployment.compose_content, &config.docker.project_name)
        .context("load stored compose")?;

    let client = Client::new(&config.docker.project_name).await?;

    println!(
        "Rolling back to commit {}...",
        short_commit(&deployment.commit_hash)
    );

    client
        .deploy(&project, &deployment.commit_hash)
        .await
        .context("deploy")?;
    if let Err(err) = client.prune(&project.service_names()).await {
        warn!(error = %err, "prune failed");
    }

    if let Err(err) = store
        .save_deployment(
            &repo.name,
            &deployment.commit_hash,
            &deployment.compose_content,
            DeploymentStatus::RolledBack,
            "rollback",
        )
        .await
    {
        warn!(error = %err, "failed to record rollback");
    }
    store.close().await;

    println!("Rollback completed successfully");
    Ok(())
}

/// Resolve an exact commit hash first, then fall back to a prefix scan over
/// recent history.
async fn find_deployment(
    store: &Db,
    repo_name: &str,
    prefix: &str,
) -> anyhow::Result<Deployment> {
    match store.get_deployment_by_commit(repo_name, prefix).await {
        Ok(deployment) => return Ok(deployment),
        Err(StorageError::NotFound) => {}
        Err(err) => return Err(err.into()),
    }

    let deployments = store.list_deployments(repo_name, 0).await?;
    deployments
        .into_iter()
        .find(|deployment| deployment.commit_hash.starts_with(prefix))
        .ok_or_else(|| anyhow!("no deployment found for commit {prefix}"))
}
