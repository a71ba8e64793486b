use chrono::{DateTime, Utc};
use serde::Serialize;

use super::{Client, DockerError, LABEL_SERVICE};

#[derive(Debug, Clone, Serialize)]
pub struct ServiceStatus {
    pub service: String,
    pub container: String,
    pub image: String,
    pub state: String,
    #[serde(skip_serializing_if = "String::is_empty")]
    pub health: String,
    pub created_at: DateTime<Utc>,
}

impl Client {
    /// Snapshot of every managed container for this project.
    pub async fn status(&self) -> Result<Vec<ServiceStatus>, DockerError> {
        let containers = self.list_managed_containers().await?;

        let mut statuses: Vec<ServiceStatus> = containers
            .into_iter()
            .map(|container| {
                let service = container
                    .labels
                    .as_ref()
                    .and_then(|labels| labels.get(LABEL_SERVICE))
                    .cloned()
                    .unwrap_or_default();

                let name = container
                    .names
                    .as_ref()
                    .and_then(|names| names.first())
                    .map(|name| name.trim_start_matches('/').to_string())
                    .or_else(|| container.id.as_ref().map(|id| id[..id.len().min(12)].to_string()))
                    .unwrap_or_default();

                let state = container.state.clone().unwrap_or_default();
                let health = match state.as_str() {
                    "running" => container.status.clone().unwrap_or_default(),
                    _ => state.clone(),
                };

                ServiceStatus {
                    service,
                    container: name,
                    image: container.image.unwrap_or_default(),
                    state,
                    health,
                    created_at: DateTime::from_timestamp(container.created.unwrap_or_default(), 0)
                        .unwrap_or_else(Utc::now),
                }
            })
            .collect();

        statuses.sort_by(|a, b| a.service.cmp(&b.service));
        Ok(statuses)
    }
}
