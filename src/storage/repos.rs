use chrono::{DateTime, Utc};
use sqlx::FromRow;

use super::{map_sqlx_error, Db, StorageError};

/// A registered repository. Immutable after creation; callers that need to
/// change one delete it and add it again.
#[derive(Debug, Clone, PartialEq, Eq, FromRow)]
pub struct Repo {
    pub name: String,
    pub url: String,
    pub branch: String,
    pub auth_kind: Option<String>,
    pub auth_ssh_key_path: Option<String>,
    pub auth_username: Option<String>,
    pub auth_password_env: Option<String>,
    pub webhook_secret_env: Option<String>,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Default)]
pub struct RepoAuth {
    pub kind: String,
    pub ssh_key_path: Option<String>,
    pub username: Option<String>,
    pub password_env: Option<String>,
}

const REPO_COLUMNS: &str = "name, url, branch, auth_kind, auth_ssh_key_path, auth_username, \
                            auth_password_env, webhook_secret_env, created_at";

impl Db {
    pub async fn save_repo(
        &self,
        name: &str,
        url: &str,
        branch: &str,
        auth: Option<&RepoAuth>,
        webhook_secret_env: Option<&str>,
    ) -> Result<Repo, StorageError> {
        sqlx::query(
            "INSERT INTO repos (name, url, branch, auth_kind, auth_ssh_key_path, auth_username, \
             auth_password_env, webhook_secret_env, created_at) VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?);",
        )
        .bind(name)
        .bind(url)
        .bind(branch)
        .bind(auth.map(|a| a.kind.clone()))
        .bind(auth.and_then(|a| a.ssh_key_path.clone()))
        .bind(auth.and_then(|a| a.username.clone()))
        .bind(auth.and_then(|a| a.password_env.clone()))
        .bind(webhook_secret_env)
        .bind(Utc::now())
        .execute(self.pool())
        .await
        .map_err(map_sqlx_error)?;

        self.get_repo(name).await
    }

    pub async fn get_repo(&self, name: &str) -> Result<Repo, StorageError> {
        sqlx::query_as::<_, Repo>(&format!(
            "SELECT {REPO_COLUMNS} FROM repos WHERE name = ?;"
        ))
        .bind(name)
        .fetch_one(self.pool())
        .await
        .map_err(map_sqlx_error)
    }

    pub async fn list_repos(&self) -> Result<Vec<Repo>, StorageError> {
        sqlx::query_as::<_, Repo>(&format!(
            "SELECT {REPO_COLUMNS} FROM repos ORDER BY name;"
        ))
        .fetch_all(self.pool())
        .await
        .map_err(map_sqlx_error)
    }

    pub async fn delete_repo(&self, name: &str) -> Result<(), StorageError> {
        let result = sqlx::query("DELETE FROM repos WHERE name = ?;")
            .bind(name)
            .execute(self.pool())
            .await
            .map_err(map_sqlx_error)?;

        if result.rows_affected() == 0 {
            return Err(StorageError::NotFound);
        }
        Ok(())
    }

    /// Look up a repo by URL under normalization, so that push payload URLs
    /// match however the repo was originally registered.
    pub async fn find_repo_by_url(&self, raw_url: &str) -> Result<Repo, StorageError> {
        let wanted = normalize_url(raw_url);
        let repos = self.list_repos().await?;

        repos
            .into_iter()
            .find(|repo| normalize_url(&repo.url) == wanted)
            .ok_or(StorageError::NotFound)
    }
}

/// Canonicalize a git URL: rewrite `user@host:path` to `host/path`, strip
/// the scheme and userinfo, lowercase the host, and drop `.git` and
/// trailing-slash suffixes. Idempotent.
pub fn normalize_url(raw: &str) -> String {
    let mut url = raw.trim().to_string();

    if !url.contains("://") {
        if let Some((user_host, path)) = url.split_once(':') {
            if let Some((_, host)) = user_host.rsplit_once('@') {
                url = format!("{host}/{path}");
            }
        }
    }

    if let Some((_, rest)) = url.split_once("://") {
        url = rest.to_string();
    }

    match url.split_once('/') {
        Some((authority, path)) => {
            let host = authority.rsplit_once('@').map_or(authority, |(_, host)| host);
            url = format!("{}/{}", host.to_lowercase(), path);
        }
        None => {
            let host = url.rsplit_once('@').map_or(url.as_str(), |(_, host)| host);
            url = host.to_lowercase();
        }
    }

    let url = url.trim_end_matches('/');
    let url = url.strip_suffix(".git").unwrap_or(url);
    url.trim_end_matches('/').to_string()
}
