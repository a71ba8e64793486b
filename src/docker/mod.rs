//! Container runtime client.
//!
//! A thin layer over bollard scoped to one compose project. Everything kedge
//! creates carries the management label set; the differ and the applier only
//! ever see containers and networks selected by those labels, which keeps
//! concurrent controllers on the same host from touching each other.

mod deploy;
mod differ;
mod remove;
mod status;

pub use differ::{diff_services, DiffAction, DiffResult, ServiceDiff};
pub use status::ServiceStatus;

use std::collections::HashMap;
use std::future::Future;
use std::time::Duration;

use tracing::info;

pub const LABEL_MANAGED: &str = "io.kedge.managed";
pub const LABEL_PROJECT: &str = "io.kedge.project";
pub const LABEL_SERVICE: &str = "io.kedge.service";
pub const LABEL_COMMIT: &str = "io.kedge.commit";
pub const LABEL_CONFIG_HASH: &str = "io.kedge.config_hash";

pub(crate) const DEFAULT_TIMEOUT: Duration = Duration::from_secs(30);
pub(crate) const PULL_TIMEOUT: Duration = Duration::from_secs(300);

#[derive(thiserror::Error, Debug)]
pub enum DockerError {
    #[error("could not connect to docker daemon; {0}")]
    Connection(String),

    #[error("docker api error; {0}")]
    Api(#[from] bollard::errors::Error),

    #[error("{0} timed out")]
    Timeout(&'static str),

    #[error("pull image {image}; {message}")]
    Pull { image: String, message: String },

    #[error("{0}")]
    Failed(String),
}

/// What the runtime reports for one managed container, keyed off the label
/// set rather than container names.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ServiceActual {
    pub service: String,
    pub container_id: String,
    pub image: String,
    pub image_id: String,
    pub state: String,
    pub config_hash: String,
}

#[derive(Debug)]
pub struct Client {
    docker: bollard::Docker,
    project_name: String,
}

impl Client {
    /// Connect to the local daemon and verify it is reachable.
    pub async fn new(project_name: &str) -> Result<Client, DockerError> {
        let docker = bollard::Docker::connect_with_socket_defaults().map_err(|e| {
            DockerError::Connection(format!(
                "{e}; make sure the Docker daemon is installed and running"
            ))
        })?;

        let version = with_timeout("ping docker daemon", Duration::from_secs(5), docker.version())
            .await
            .map_err(|e| DockerError::Connection(e.to_string()))?
            .map_err(|e| {
                DockerError::Connection(format!(
                    "{e}; make sure the Docker daemon is installed and running"
                ))
            })?;

        info!(
            project = project_name,
            version = %version.version.unwrap_or_default(),
            "docker client initialized"
        );

        Ok(Client {
            docker,
            project_name: project_name.to_string(),
        })
    }

    pub fn project_name(&self) -> &str {
        &self.project_name
    }

    /// Label filters selecting every resource this project manages.
    pub(crate) fn managed_filters(&self) -> HashMap<String, Vec<String>> {
        let mut filters = HashMap::new();
        filters.insert(
            "label".to_string(),
            vec![
                format!("{LABEL_MANAGED}=true"),
                format!("{LABEL_PROJECT}={}", self.project_name),
            ],
        );
        filters
    }

    pub(crate) async fn list_managed_containers(
        &self,
    ) -> Result<Vec<bollard::models::ContainerSummary>, DockerError> {
        let options = bollard::container::ListContainersOptions::<String> {
            all: true,
            filters: self.managed_filters(),
            ..Default::default()
        };

        with_timeout(
            "list containers",
            DEFAULT_TIMEOUT,
            self.docker.list_containers(Some(options)),
        )
        .await?
        .map_err(DockerError::Api)
    }

    pub(crate) fn docker(&self) -> &bollard::Docker {
        &self.docker
    }
}

pub(crate) fn service_actual(summary: &bollard::models::ContainerSummary) -> ServiceActual {
    let labels = summary.labels.clone().unwrap_or_default();
    ServiceActual {
        service: labels.get(LABEL_SERVICE).cloned().unwrap_or_default(),
        container_id: summary.id.clone().unwrap_or_default(),
        image: summary.image.clone().unwrap_or_default(),
        image_id: summary.image_id.clone().unwrap_or_default(),
        state: summary.state.clone().unwrap_or_default(),
        config_hash: labels.get(LABEL_CONFIG_HASH).cloned().unwrap_or_default(),
    }
}

pub(crate) async fn with_timeout<F, T>(
    op: &'static str,
    duration: Duration,
    future: F,
) -> Result<T, DockerError>
where
    F: Future<Output = T>,
{
    tokio::time::timeout(duration, future)
        .await
        .map_err(|_| DockerError::Timeout(op))
}
