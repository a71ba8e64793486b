use chrono::{DateTime, Utc};
use sqlx::FromRow;

use super::{map_sqlx_error, Db, DeploymentStatus, StorageError, DEFAULT_LIST_LIMIT};

/// One reconcile attempt. Appended with status `pending` and finalized once
/// the reconcile body completes; `compose_content` is the exact file bytes
/// at `commit_hash` so rollback never has to consult the work tree.
#[derive(Debug, Clone, PartialEq, Eq, FromRow)]
pub struct Deployment {
    pub id: i64,
    pub repo_name: String,
    pub commit_hash: String,
    pub compose_content: String,
    pub deployed_at: DateTime<Utc>,
    pub status: String,
    pub message: String,
}

impl Deployment {
    pub fn status(&self) -> Result<DeploymentStatus, StorageError> {
        self.status
            .parse()
            .map_err(|_| StorageError::InvalidStatus(self.status.clone()))
    }
}

const DEPLOYMENT_COLUMNS: &str =
    "id, repo_name, commit_hash, compose_content, deployed_at, status, message";

impl Db {
    pub async fn save_deployment(
        &self,
        repo_name: &str,
        commit: &str,
        compose_content: &str,
        status: DeploymentStatus,
        message: &str,
    ) -> Result<Deployment, StorageError> {
        let result = sqlx::query(
            "INSERT INTO deployments (repo_name, commit_hash, compose_content, deployed_at, \
             status, message) VALUES (?, ?, ?, ?, ?, ?);",
        )
        .bind(repo_name)
        .bind(commit)
        .bind(compose_content)
        .bind(Utc::now())
        .bind(status.to_string())
        .bind(message)
        .execute(self.pool())
        .await
        .map_err(map_sqlx_error)?;

        self.get_deployment(result.last_insert_rowid()).await
    }

    pub async fn get_deployment(&self, id: i64) -> Result<Deployment, StorageError> {
        sqlx::query_as::<_, Deployment>(&format!(
            "SELECT {DEPLOYMENT_COLUMNS} FROM deployments WHERE id = ?;"
        ))
        .bind(id)
        .fetch_one(self.pool())
        .await
        .map_err(map_sqlx_error)
    }

    pub async fn get_last_deployment(&self, repo_name: &str) -> Result<Deployment, StorageError> {
        sqlx::query_as::<_, Deployment>(&format!(
            "SELECT {DEPLOYMENT_COLUMNS} FROM deployments WHERE repo_name = ? \
             ORDER BY id DESC LIMIT 1;"
        ))
        .bind(repo_name)
        .fetch_one(self.pool())
        .await
        .map_err(map_sqlx_error)
    }

    /// Returns the highest-id deployment matching the exact commit hash.
    pub async fn get_deployment_by_commit(
        &self,
        repo_name: &str,
        commit: &str,
    ) -> Result<Deployment, StorageError> {
        sqlx::query_as::<_, Deployment>(&format!(
            "SELECT {DEPLOYMENT_COLUMNS} FROM deployments WHERE repo_name = ? AND \
             commit_hash = ? ORDER BY id DESC LIMIT 1;"
        ))
        .bind(repo_name)
        .bind(commit)
        .fetch_one(self.pool())
        .await
        .map_err(map_sqlx_error)
    }

    pub async fn list_deployments(
        &self,
        repo_name: &str,
        limit: i64,
    ) -> Result<Vec<Deployment>, StorageError> {
        let limit = if limit <= 0 { DEFAULT_LIST_LIMIT } else { limit };

        sqlx::query_as::<_, Deployment>(&format!(
            "SELECT {DEPLOYMENT_COLUMNS} FROM deployments WHERE repo_name = ? \
             ORDER BY id DESC LIMIT ?;"
        ))
        .bind(repo_name)
        .bind(limit)
        .fetch_all(self.pool())
        .await
        .map_err(map_sqlx_error)
    }

    pub async fn update_deployment_status(
        &self,
        id: i64,
        status: DeploymentStatus,
        message: &str,
    ) -> Result<(), StorageError> {
        let result = sqlx::query("UPDATE deployments SET status = ?, message = ? WHERE id = ?;")
            .bind(status.to_string())
            .bind(message)
            .bind(id)
            .execute(self.pool())
            .await
            .map_err(map_sqlx_error)?;

        if result.rows_affected() == 0 {
            return Err(StorageError::NotFound);
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::super::tests::TestHarness;
    use super::*;

    const REPO: &str = "test-repo";
    const COMPOSE: &str = "services:\n  web:\n    image: nginx:alpine\n";

    async fn setup() -> TestHarness {
        let harness = TestHarness::new().await;
        harness
            .db
            .save_repo(REPO, "https://example.com/repo.git", "main", None, None)
            .await
            .unwrap();
        harness
    }

    #[tokio::test]
    async fn save_and_get() {
        let harness = setup().await;
        let db = &harness.db;

        let deployment = db
            .save_deployment(REPO, "abc123", COMPOSE, DeploymentStatus::Success, "deployed")
            .await
            .unwrap();

        assert!(deployment.id > 0);
        assert_eq!(deployment.commit_hash, "abc123");
        assert_eq!(deployment.compose_content, COMPOSE);
        assert_eq!(deployment.status().unwrap(), DeploymentStatus::Success);
        assert_eq!(deployment.message, "deployed");
    }

    #[tokio::test]
    async fn last_deployment_is_highest_id() {
        let harness = setup().await;
        let db = &harness.db;

        db.save_deployment(REPO, "commit1", "v1", DeploymentStatus::Success, "")
            .await
            .unwrap();
        db.save_deployment(REPO, "commit2", "v2", DeploymentStatus::Failed, "boom")
            .await
            .unwrap();

        let last = db.get_last_deployment(REPO).await.unwrap();
        assert_eq!(last.commit_hash, "commit2");
        assert_eq!(last.status().unwrap(), DeploymentStatus::Failed);
    }

    #[tokio::test]
    async fn by_commit_returns_newest_row() {
        let harness = setup().await;
        let db = &harness.db;

        let first = db
            .save_deployment(REPO, "abc123", "v1", DeploymentStatus::Failed, "boom")
            .await
            .unwrap();
        let second = db
            .save_deployment(REPO, "abc123", "v1", DeploymentStatus::Success, "")
            .await
            .unwrap();
        assert!(second.id > first.id);

        let found = db.get_deployment_by_commit(REPO, "abc123").await.unwrap();
        assert_eq!(found.id, second.id);

        assert_eq!(
            db.get_deployment_by_commit(REPO, "missing").await.unwrap_err(),
            StorageError::NotFound
        );
    }

    #[tokio::test]
    async fn list_orders_descending_and_limits() {
        let harness = setup().await;
        let db = &harness.db;

        for i in 0..5 {
            db.save_deployment(
                REPO,
                &format!("commit{i}"),
                COMPOSE,
                DeploymentStatus::Success,
                "",
            )
            .await
            .unwrap();
        }

        let all = db.list_deployments(REPO, 0).await.unwrap();
        assert_eq!(all.len(), 5);
        assert!(all.windows(2).all(|pair| pair[0].id > pair[1].id));

        let limited = db.list_deployments(REPO, 2).await.unwrap();
        assert_eq!(limited.len(), 2);
        assert_eq!(limited[0].commit_hash, "commit4");
    }

    #[tokio::test]
    async fn status_update() {
        let harness = setup().await;
        let db = &harness.db;

        let deployment = db
            .save_deployment(REPO, "abc123", COMPOSE, DeploymentStatus::Pending, "")
            .await
            .unwrap();

        db.update_deployment_status(deployment.id, DeploymentStatus::Failed, "pull failed")
            .await
            .unwrap();

        let updated = db.get_deployment(deployment.id).await.unwrap();
        assert_eq!(updated.status().unwrap(), DeploymentStatus::Failed);
        assert_eq!(updated.message, "pull failed");

        assert_eq!(
            db.update_deployment_status(9999, DeploymentStatus::Failed, "")
                .await
                .unwrap_err(),
            StorageError::NotFound
        );
    }

    #[tokio::test]
    async fn deleting_repo_cascades() {
        let harness = setup().await;
        let db = &harness.db;

        db.save_deployment(REPO, "abc123", COMPOSE, DeploymentStatus::Success, "")
            .await
            .unwrap();
        db.delete_repo(REPO).await.unwrap();

        assert_eq!(
            db.get_last_deployment(REPO).await.unwrap_err(),
            StorageError::NotFound
        );
    }

    #[tokio::test]
    async fn rollback_rows_append() {
        let harness = setup().await;
        let db = &harness.db;

        db.save_deployment(REPO, "c1", "v1", DeploymentStatus::Success, "")
            .await
            .unwrap();
        db.save_deployment(REPO, "c2", "v2", DeploymentStatus::Success, "")
            .await
            .unwrap();
        db.save_deployment(REPO, "c1", "v1", DeploymentStatus::RolledBack, "rollback")
            .await
            .unwrap();

        // The earlier success rows stay untouched above the rollback row.
        let history = db.list_deployments(REPO, 0).await.unwrap();
        assert_eq!(history.len(), 3);
        assert_eq!(history[0].status().unwrap(), DeploymentStatus::RolledBack);
        assert_eq!(history[0].commit_hash, "c1");
        assert_eq!(history[1].status().unwrap(), DeploymentStatus::Success);
        assert_eq!(history[2].status().unwrap(), DeploymentStatus::Success);
    }

    #[test]
    fn status_round_trip() {
        for status in [
            DeploymentStatus::Pending,
            DeploymentStatus::Success,
            DeploymentStatus::Failed,
            DeploymentStatus::Skipped,
            DeploymentStatus::RolledBack,
        ] {
            let text = status.to_string();
            assert_eq!(text.parse::<DeploymentStatus>().unwrap(), status);
        }

        assert_eq!(DeploymentStatus::RolledBack.to_string(), "rolled_back");
        assert!("bogus".parse::<DeploymentStatus>().is_err());
    }
}
