use anyhow::Context;
use colored::Colorize;

use crate::compose;
use crate::docker::Client;
use crate::manager::repo_work_dir;

use super::CliHarness;

pub async fn run(harness: &CliHarness) -> anyhow::Result<()> {
    let repo = harness.require_repo()?;
    let config = &harness.config;

    let client = Client::new(&config.docker.project_name).await?;

    let compose_path = repo_work_dir(&repo.name).join(&config.docker.compose_file);
    let compose_text = std::fs::read_to_string(&compose_path)
        .with_context(|| format!("read compose file {}", compose_path.display()))?;
    let project = compose::load(&compose_text, &config.docker.project_name)?;

    let diff = client.diff(&project).await.context("diff")?;

    if diff.in_sync {
        println!("All services in sync {}", "✓".green());
        return Ok(());
    }

    println!("{}", diff.summary.yellow());
    for change in &diff.changes {
        let action = match change.action {
            crate::docker::DiffAction::Create => "create".green(),
            crate::docker::DiffAction::Update => "update".yellow(),
            crate::docker::DiffAction::Remove => "remove".red(),
        };
        println!("  {} {}: {}", action, change.service, change.reason);
        if !change.desired_image.is_empty() && change.desired_image != change.current_image {
            let current = if change.current_image.is_empty() {
                "<none>"
            } else {
                &change.current_image
            };
            println!("      {} -> {}", current, change.desired_image);
        }
    }

    Ok(())
}
