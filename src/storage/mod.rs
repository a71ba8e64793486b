//! Embedded state store.
//!
//! A single SQLite database holds the repo registry and the deployment
//! history log. The database is opened with WAL journaling, a 5 second busy
//! timeout, and foreign key enforcement; schema migrations are embedded in
//! the binary and applied forward-only at open.

mod deployments;
mod repos;

#[cfg(test)]
pub(crate) mod tests;

pub use deployments::Deployment;
pub use repos::{Repo, RepoAuth};

use std::path::Path;
use std::time::Duration;

use sqlx::sqlite::{SqliteConnectOptions, SqliteJournalMode, SqlitePoolOptions};
use sqlx::{Pool, Sqlite};
use strum::{Display, EnumString};

/// Default row limit for history queries when the caller does not supply one.
pub const DEFAULT_LIST_LIMIT: i64 = 100;

#[derive(thiserror::Error, Debug, PartialEq, Eq)]
pub enum StorageError {
    #[error("requested entity not found")]
    NotFound,

    #[error("entity already exists")]
    Exists,

    #[error("invalid deployment status {0:?}")]
    InvalidStatus(String),

    #[error("could not prepare state directory; {0}")]
    Io(String),

    #[error("unexpected storage error occurred; {0}")]
    Unknown(String),
}

/// Lifecycle of a deployment row. `Pending` transitions to exactly one of
/// the terminal statuses; `RolledBack` rows are appended by the rollback
/// path and never rewritten.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Display, EnumString)]
#[strum(serialize_all = "snake_case")]
pub enum DeploymentStatus {
    Pending,
    Success,
    Failed,
    Skipped,
    RolledBack,
}

#[derive(Debug, Clone)]
pub struct Db {
    pool: Pool<Sqlite>,
}

impl Db {
    pub async fn new(path: &Path) -> Result<Db, StorageError> {
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() && !parent.exists() {
                std::fs::create_dir_all(parent).map_err(|e| StorageError::Io(e.to_string()))?;
                #[cfg(unix)]
                {
                    use std::os::unix::fs::PermissionsExt;
                    std::fs::set_permissions(parent, std::fs::Permissions::from_mode(0o750))
                        .map_err(|e| StorageError::Io(e.to_string()))?;
                }
            }
        }

        let options = SqliteConnectOptions::new()
            .filename(path)
            .create_if_missing(true)
            .journal_mode(SqliteJournalMode::Wal)
            .busy_timeout(Duration::from_secs(5))
            .foreign_keys(true);

        let pool = SqlitePoolOptions::new()
            .max_connections(5)
            .connect_with(options)
            .await
            .map_err(|e| StorageError::Unknown(e.to_string()))?;

        sqlx::migrate!("./migrations")
            .run(&pool)
            .await
            .map_err(|e| StorageError::Unknown(e.to_string()))?;

        Ok(Db { pool })
    }

    pub(crate) fn pool(&self) -> &Pool<Sqlite> {
        &self.pool
    }

    pub async fn close(&self) {
        self.pool.close().await;
    }
}

fn map_sqlx_error(err: sqlx::Error) -> StorageError {
    match err {
        sqlx::Error::RowNotFound => StorageError::NotFound,
        sqlx::Error::Database(db)
            if db.kind() == sqlx::error::ErrorKind::UniqueViolation =>
        {
            StorageError::Exists
        }
        other => StorageError::Unknown(other.to_string()),
    }
}
