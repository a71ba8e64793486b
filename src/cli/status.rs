use anyhow::Context;
use colored::Colorize;
use comfy_table::{presets::ASCII_MARKDOWN, Cell, Color, ContentArrangement};

use crate::compose;
use crate::docker::Client;
use crate::manager::repo_work_dir;
use crate::storage::StorageError;

use super::{short_commit, CliHarness};

pub async fn run(harness: &CliHarness) -> anyhow::Result<()> {
    let repo = harness.require_repo()?;
    let config = &harness.config;

    let client = Client::new(&config.docker.project_name).await?;

    let compose_path = repo_work_dir(&repo.name).join(&config.docker.compose_file);
    let compose_text = std::fs::read_to_string(&compose_path)
        .with_context(|| format!("read compose file {}", compose_path.display()))?;
    let project = compose::load(&compose_text, &config.docker.project_name)?;

    println!("{}", "=== Service Status ===".bold());
    let statuses = client.status().await.context("list services")?;
    if statuses.is_empty() {
        println!("No managed containers");
    } else {
        let mut table = comfy_table::Table::new();
        table
            .load_preset(ASCII_MARKDOWN)
            .set_content_arrangement(ContentArrangement::Dynamic)
            .set_header(vec![
                Cell::new("service").fg(Color::Blue),
                Cell::new("container").fg(Color::Blue),
                Cell::new("image").fg(Color::Blue),
                Cell::new("state").fg(Color::Blue),
            ]);

        for status in &statuses {
            let state_cell = match status.state.as_str() {
                "running" => Cell::new(&status.state).fg(Color::Green),
                _ => Cell::new(&status.state).fg(Color::Red),
            };
            table.add_row(vec![
                Cell::new(&status.service),
                Cell::new(&status.container),
                Cell::new(&status.image),
                state_cell,
            ]);
        }
        println!("{table}");
    }

    let diff = client.diff(&project).await.context("diff")?;
    if diff.in_sync {
        println!("All services in sync {}", "✓".green());
    } else {
        println!("Drift detected: {}", diff.summary.yellow());
        for change in &diff.changes {
            println!("  {}: {} ({})", change.service, change.action, change.reason);
        }
    }

    println!("\n{}", "=== Last Deployment ===".bold());
    let store = harness.open_store().await?;
    match store.get_last_deployment(&repo.name).await {
        Ok(deployment) => {
            println!("Commit:  {}", short_commit(&deployment.commit_hash));
            println!("Status:  {}", deployment.status);
            println!(
                "Time:    {}",
                deployment.deployed_at.format("%Y-%m-%d %H:%M:%S")
            );
            if !deployment.message.is_empty() {
                println!("Message: {}", deployment.message);
            }
        }
        Err(StorageError::NotFound) => println!("No deployments yet"),
        Err(err) => return Err(err.into()),
    }
    store.close().await;

    Ok(())
}
