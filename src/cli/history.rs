use anyhow::Context;
use comfy_table::{presets::ASCII_MARKDOWN, Cell, Color, ContentArrangement};

use super::{short_commit, CliHarness};

pub async fn run(harness: &CliHarness, limit: i64) -> anyhow::Result<()> {
    let repo = harness.require_repo()?;

    let store = harness.open_store().await?;
    let deployments = store
        .list_deployments(&repo.name, limit)
        .await
        .context("list deployments")?;
    store.close().await;

    if deployments.is_empty() {
        println!("No deployments yet");
        return Ok(());
    }

    let mut table = comfy_table::Table::new();
    table
        .load_preset(ASCII_MARKDOWN)
        .set_content_arrangement(ContentArrangement::Dynamic)
        .set_header(vec![
            Cell::new("commit").fg(Color::Blue),
            Cell::new("status").fg(Color::Blue),
            Cell::new("time").fg(Color::Blue),
            Cell::new("message").fg(Color::Blue),
        ]);

    for deployment in &deployments {
        let mut message: String = deployment.message.chars().take(40).collect();
        if message.len() < deployment.message.len() {
            message.push_str("...");
        }

        let status_cell = match deployment.status.as_str() {
            "success" => Cell::new(&deployment.status).fg(Color::Green),
            "failed" => Cell::new(&deployment.status).fg(Color::Red),
            "pending" => Cell::new(&deployment.status).fg(Color::Yellow),
            "rolled_back" => Cell::new(&deployment.status).fg(Color::Cyan),
            _ => Cell::new(&deployment.status),
        };

        table.add_row(vec![
            Cell::new(short_commit(&deployment.commit_hash)),
            status_cell,
            Cell::new(deployment.deployed_at.format("%Y-%m-%d %H:%M:%S").to_string()),
            Cell::new(message),
        ]);
    }

    println!("{table}");
    Ok(())
}
