//! Tearing down managed resources.

use bollard::network::ListNetworksOptions;
use tracing::info;

use super::{with_timeout, Client, DockerError, LABEL_SERVICE, DEFAULT_TIMEOUT};

impl Client {
    /// Force-remove every managed container, then every managed network.
    /// Per-resource failures accumulate; everything is still attempted.
    pub async fn remove_project(&self) -> Result<(), DockerError> {
        info!("removing project resources");

        let mut errors = Vec::new();

        if let Err(err) = self.remove_containers().await {
            errors.push(err.to_string());
        }
        if let Err(err) = self.remove_networks().await {
            errors.push(err.to_string());
        }

        if errors.is_empty() {
            Ok(())
        } else {
            Err(DockerError::Failed(errors.join("; ")))
        }
    }

    async fn remove_containers(&self) -> Result<(), DockerError> {
        let containers = self.list_managed_containers().await?;

        let mut errors = Vec::new();
        for container in containers {
            let Some(id) = container.id else { continue };
            if let Err(err) = self.remove_container(&id).await {
                errors.push(err.to_string());
            }
        }

        if errors.is_empty() {
            Ok(())
        } else {
            Err(DockerError::Failed(errors.join("; ")))
        }
    }

    async fn remove_networks(&self) -> Result<(), DockerError> {
        let networks = with_timeout(
            "list networks",
            DEFAULT_TIMEOUT,
            self.docker().list_networks(Some(ListNetworksOptions {
                filters: self.managed_filters(),
            })),
        )
        .await??;

        let mut errors = Vec::new();
        for network in networks {
            let Some(id) = network.id else { continue };
            let name = network.name.unwrap_or_else(|| id.clone());
            info!(network = %name, "removing network");

            let result = with_timeout(
                "remove network",
                DEFAULT_TIMEOUT,
                self.docker().remove_network(&id),
            )
            .await;

            match result {
                Ok(Ok(())) => {}
                Ok(Err(err)) => errors.push(format!("remove network {name}; {err}")),
                Err(err) => errors.push(format!("remove network {name}; {err}")),
            }
        }

        if errors.is_empty() {
            Ok(())
        } else {
            Err(DockerError::Failed(errors.join("; ")))
        }
    }

    /// Remove every managed container whose service label is not in `keep`.
    /// Cleans up services orphaned by compose edits.
    pub async fn prune(&self, keep: &[String]) -> Result<(), DockerError> {
        let containers = self.list_managed_containers().await?;

        let mut errors = Vec::new();
        for container in containers {
            let service = container
                .labels
                .as_ref()
                .and_then(|labels| labels.get(LABEL_SERVICE))
                .cloned()
                .unwrap_or_default();
            if keep.contains(&service) {
                continue;
            }

            let Some(id) = container.id else { continue };
            info!(service = %service, "pruning orphan container");
            if let Err(err) = self.remove_container(&id).await {
                errors.push(err.to_string());
            }
        }

        if errors.is_empty() {
            Ok(())
        } else {
            Err(DockerError::Failed(errors.join("; ")))
        }
    }
}
