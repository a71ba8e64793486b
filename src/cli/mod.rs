mod diff;
mod healthcheck;
mod history;
mod repo;
mod rollback;
mod serve;
mod status;
mod sync;

use std::path::Path;

use anyhow::{anyhow, Context};
use clap::{Parser, Subcommand};
use colored::Colorize;
use tracing_subscriber::EnvFilter;

use crate::conf::{Config, LoggingConfig};
use crate::manager::repo_work_dir;
use crate::storage::{Db, Repo, StorageError};

#[derive(Debug, Parser)]
#[command(name = "kedge")]
#[command(about = "GitOps controller for Docker Compose")]
#[command(
    long_about = "Kedge watches Git repositories and reconciles the local Docker host against \
                  the compose file at each new commit. Register repositories with `kedge repo \
                  add`, then run `kedge serve` to start the control loops."
)]
#[command(version)]
struct Cli {
    /// Repository name to operate on
    #[arg(long, global = true, value_name = "NAME")]
    repo: Option<String>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Debug, Subcommand)]
enum Commands {
    /// Start the controllers for every registered repository.
    Serve,

    /// Manage watched repositories.
    Repo(repo::RepoSubcommands),

    /// Show the current deployment status of the selected repository.
    Status,

    /// Show the drift between the compose file and the running containers.
    Diff,

    /// Reconcile the selected repository now.
    Sync {
        /// Apply desired state unconditionally, regardless of mode or diff.
        #[arg(long)]
        force: bool,
    },

    /// Roll back to a previously deployed commit.
    Rollback {
        /// Commit hash or unique prefix of the deployment to restore.
        commit: String,
    },

    /// Show deployment history for the selected repository.
    History {
        /// Maximum number of entries to show.
        #[arg(long, default_value_t = 10)]
        limit: i64,
    },

    /// Probe the local kedge server; useful as a container HEALTHCHECK.
    Healthcheck {
        /// Server port to check.
        #[arg(long, default_value_t = 8080)]
        port: u16,
    },

    /// Print the kedge version.
    Version,
}

/// Resolved invocation context: the effective config, plus the selected repo
/// when `--repo` was given.
pub(crate) struct CliHarness {
    pub config: Config,
    pub repo: Option<Repo>,
}

impl CliHarness {
    pub fn require_repo(&self) -> anyhow::Result<&Repo> {
        self.repo
            .as_ref()
            .ok_or_else(|| anyhow!("--repo is required for this command"))
    }

    pub async fn open_store(&self) -> anyhow::Result<Db> {
        Db::new(Path::new(&self.config.state.path))
            .await
            .context("open state store")
    }
}

pub async fn init() {
    let cli = Cli::parse();

    if let Err(err) = run(cli).await {
        eprintln!("{} {err:#}", "error:".red());
        std::process::exit(1);
    }
}

async fn run(cli: Cli) -> anyhow::Result<()> {
    if matches!(cli.command, Commands::Version) {
        println!("kedge {}", crate::VERSION);
        return Ok(());
    }

    let mut config = Config::default();
    let mut repo = None;

    if let Some(name) = &cli.repo {
        let store = Db::new(Path::new(&config.state.path))
            .await
            .context("open state store")?;
        let found = store.get_repo(name).await.map_err(|err| match err {
            StorageError::NotFound => anyhow!("repository {name:?} not found"),
            other => anyhow!(other),
        });
        store.close().await;
        let found = found?;

        config = Config::load_from_work_dir(&repo_work_dir(name))
            .with_context(|| format!("load config for repository {name:?}"))?;
        repo = Some(found);
    }

    init_logging(&config.logging);
    let harness = CliHarness { config, repo };

    match cli.command {
        Commands::Serve => serve::run(&harness).await,
        Commands::Repo(subcommands) => repo::run(&harness, subcommands).await,
        Commands::Status => status::run(&harness).await,
        Commands::Diff => diff::run(&harness).await,
        Commands::Sync { force } => sync::run(&harness, force).await,
        Commands::Rollback { commit } => rollback::run(&harness, &commit).await,
        Commands::History { limit } => history::run(&harness, limit).await,
        Commands::Healthcheck { port } => healthcheck::run(port).await,
        Commands::Version => unreachable!("handled above"),
    }
}

fn init_logging(config: &LoggingConfig) {
    let filter = EnvFilter::try_new(&config.level).unwrap_or_else(|_| EnvFilter::new("info"));
    let builder = tracing_subscriber::fmt().with_env_filter(filter);

    // try_init so tests and repeated invocations don't panic on the global.
    if config.format == "json" {
        let _ = builder.json().try_init();
    } else {
        let _ = builder.try_init();
    }
}

/// Truncate a commit hash for display.
pub(crate) fn short_commit(hash: &str) -> &str {
    &hash[..hash.len().min(8)]
}
