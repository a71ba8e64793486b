use anyhow::{anyhow, bail, Context};
use clap::{Args, Subcommand};
use colored::Colorize;
use comfy_table::{presets::ASCII_MARKDOWN, Cell, Color, ContentArrangement};

use crate::git::AuthKind;
use crate::storage::RepoAuth;

use super::CliHarness;

const DEFAULT_TOKEN_USERNAME: &str = "x-access-token";

#[derive(Debug, Args)]
pub struct RepoSubcommands {
    #[command(subcommand)]
    pub command: RepoCommands,
}

#[derive(Debug, Subcommand)]
pub enum RepoCommands {
    /// Add a repository to be watched.
    Add {
        /// Clone URL of the repository.
        url: String,

        /// Repository name; defaults to the last path segment of the URL.
        #[arg(long)]
        name: Option<String>,

        /// Branch to watch.
        #[arg(long, default_value = "main")]
        branch: String,

        /// Path to an SSH private key for authentication.
        #[arg(long)]
        ssh_private_key_path: Option<String>,

        /// Username for HTTPS token authentication.
        #[arg(long)]
        username: Option<String>,

        /// Environment variable holding the HTTPS password or token.
        #[arg(long)]
        password_env: Option<String>,

        /// Environment variable holding this repo's webhook secret.
        #[arg(long)]
        webhook_secret_env: Option<String>,
    },

    /// List registered repositories.
    List,

    /// Remove a repository.
    Remove {
        /// Name of the repository to remove.
        name: String,
    },
}

pub async fn run(harness: &CliHarness, subcommands: RepoSubcommands) -> anyhow::Result<()> {
    match subcommands.command {
        RepoCommands::Add {
            url,
            name,
            branch,
            ssh_private_key_path,
            username,
            password_env,
            webhook_secret_env,
        } => {
            add(
                harness,
                &url,
                name,
                &branch,
                ssh_private_key_path,
                username,
                password_env,
                webhook_secret_env,
            )
            .await
        }
        RepoCommands::List => list(harness).await,
        RepoCommands::Remove { name } => remove(harness, &name).await,
    }
}

#[allow(clippy::too_many_arguments)]
async fn add(
    harness: &CliHarness,
    url: &str,
    name: Option<String>,
    branch: &str,
    ssh_private_key_path: Option<String>,
    username: Option<String>,
    password_env: Option<String>,
    webhook_secret_env: Option<String>,
) -> anyhow::Result<()> {
    let name = match name {
        Some(name) => name,
        None => repo_name_from_url(url)
            .ok_or_else(|| anyhow!("could not derive a name from {url:?}; pass --name"))?,
    };

    let auth = build_auth(url, ssh_private_key_path, username, password_env)?;

    let store = harness.open_store().await?;
    let repo = store
        .save_repo(&name, url, branch, auth.as_ref(), webhook_secret_env.as_deref())
        .await
        .context("save repo")?;
    store.close().await;

    println!("Added repository {:?} ({})", repo.name, repo.url);
    if let Some(kind) = &repo.auth_kind {
        println!("  Auth: {kind}");
    }
    Ok(())
}

fn build_auth(
    url: &str,
    ssh_private_key_path: Option<String>,
    username: Option<String>,
    password_env: Option<String>,
) -> anyhow::Result<Option<RepoAuth>> {
    if let Some(key_path) = ssh_private_key_path {
        if !std::path::Path::new(&key_path).exists() {
            bail!("SSH key not found: {key_path}");
        }
        return Ok(Some(RepoAuth {
            kind: AuthKind::SshKey.to_string(),
            ssh_key_path: Some(key_path),
            ..Default::default()
        }));
    }

    if let Some(password_env) = password_env {
        return Ok(Some(RepoAuth {
            kind: AuthKind::Token.to_string(),
            username: Some(username.unwrap_or_else(|| DEFAULT_TOKEN_USERNAME.to_string())),
            password_env: Some(password_env),
            ..Default::default()
        }));
    }

    if is_ssh_url(url) {
        bail!("{url} is an SSH URL; pass --ssh-private-key-path to authenticate");
    }

    Ok(None)
}

async fn list(harness: &CliHarness) -> anyhow::Result<()> {
    let store = harness.open_store().await?;
    let repos = store.list_repos().await.context("list repos")?;
    store.close().await;

    let mut table = comfy_table::Table::new();
    table
        .load_preset(ASCII_MARKDOWN)
        .set_content_arrangement(ContentArrangement::Dynamic)
        .set_header(vec![
            Cell::new("name").fg(Color::Blue),
            Cell::new("url").fg(Color::Blue),
            Cell::new("branch").fg(Color::Blue),
            Cell::new("auth").fg(Color::Blue),
            Cell::new("created").fg(Color::Blue),
        ]);

    for repo in repos {
        table.add_row(vec![
            Cell::new(&repo.name).fg(Color::Green),
            Cell::new(&repo.url),
            Cell::new(&repo.branch),
            Cell::new(repo.auth_kind.as_deref().unwrap_or("none")),
            Cell::new(repo.created_at.format("%Y-%m-%d %H:%M:%S").to_string()),
        ]);
    }

    println!("{table}");
    Ok(())
}

async fn remove(harness: &CliHarness, name: &str) -> anyhow::Result<()> {
    let store = harness.open_store().await?;
    store
        .delete_repo(name)
        .await
        .with_context(|| format!("remove repository {name:?}"))?;
    store.close().await;

    println!("Removed repository {}", name.green());
    Ok(())
}

fn is_ssh_url(url: &str) -> bool {
    url.starts_with("git@") || url.starts_with("ssh://")
}

fn repo_name_from_url(url: &str) -> Option<String> {
    let trimmed = url.trim_end_matches('/');
    let last = trimmed.rsplit(['/', ':']).next()?;
    let name = last.trim_end_matches(".git");
    (!name.is_empty()).then(|| name.to_string())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn names_from_urls() {
        assert_eq!(
            repo_name_from_url("https://github.com/example/app.git"),
            Some("app".to_string())
        );
        assert_eq!(
            repo_name_from_url("git@github.com:example/app.git"),
            Some("app".to_string())
        );
        assert_eq!(
            repo_name_from_url("https://github.com/example/app/"),
            Some("app".to_string())
        );
        assert_eq!(repo_name_from_url(""), None);
    }

    #[test]
    fn ssh_urls_need_a_key() {
        assert!(build_auth("git@github.com:a/b.git", None, None, None).is_err());
        assert!(build_auth("https://github.com/a/b", None, None, None)
            .unwrap()
            .is_none());
    }

    #[test]
    fn token_auth_defaults_username() {
        let auth = build_auth(
            "https://github.com/a/b",
            None,
            None,
            Some("MY_TOKEN".to_string()),
        )
        .unwrap()
        .unwrap();

        assert_eq!(auth.kind, "token");
        assert_eq!(auth.username.as_deref(), Some(DEFAULT_TOKEN_USERNAME));
        assert_eq!(auth.password_env.as_deref(), Some("MY_TOKEN"));
    }
}
