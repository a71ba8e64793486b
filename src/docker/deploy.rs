//! Applying desired state: networks, image pulls, container replacement.

use std::collections::HashMap;

use bollard::container::{Config, CreateContainerOptions, ListContainersOptions};
use bollard::image::CreateImageOptions;
use bollard::models::{
    EndpointSettings, HostConfig, PortBinding, RestartPolicy, RestartPolicyNameEnum,
};
use bollard::network::{ConnectNetworkOptions, CreateNetworkOptions, ListNetworksOptions};
use futures::stream::TryStreamExt;
use tracing::info;

use crate::compose::{config_hash, PortMapping, Project, ServiceSpec};

use super::{
    service_actual, with_timeout, Client, DockerError, ServiceActual, DEFAULT_TIMEOUT,
    LABEL_COMMIT, LABEL_CONFIG_HASH, LABEL_MANAGED, LABEL_PROJECT, LABEL_SERVICE, PULL_TIMEOUT,
};

impl Client {
    /// Drive every service in the project to the desired state at `commit`.
    pub async fn deploy(&self, project: &Project, commit: &str) -> Result<(), DockerError> {
        info!(services = project.services.len(), "deploying project");

        self.ensure_networks(project).await?;

        for (name, spec) in &project.services {
            self.deploy_service(project, name, spec, commit)
                .await
                .map_err(|e| DockerError::Failed(format!("deploy service {name}; {e}")))?;
        }

        Ok(())
    }

    async fn ensure_networks(&self, project: &Project) -> Result<(), DockerError> {
        for network in &project.networks {
            let network_name = project.network_name(network);
            self.ensure_network(&network_name)
                .await
                .map_err(|e| DockerError::Failed(format!("ensure network {network}; {e}")))?;
        }
        Ok(())
    }

    async fn ensure_network(&self, name: &str) -> Result<(), DockerError> {
        let mut filters = HashMap::new();
        filters.insert("name".to_string(), vec![name.to_string()]);

        let networks = with_timeout(
            "list networks",
            DEFAULT_TIMEOUT,
            self.docker()
                .list_networks(Some(ListNetworksOptions::<String> { filters })),
        )
        .await??;

        if networks
            .iter()
            .any(|network| network.name.as_deref() == Some(name))
        {
            return Ok(());
        }

        let labels = HashMap::from([
            (LABEL_MANAGED.to_string(), "true".to_string()),
            (LABEL_PROJECT.to_string(), self.project_name().to_string()),
        ]);

        with_timeout(
            "create network",
            DEFAULT_TIMEOUT,
            self.docker().create_network(CreateNetworkOptions {
                name: name.to_string(),
                labels,
                ..Default::default()
            }),
        )
        .await??;

        info!(network = name, "created network");
        Ok(())
    }

    async fn deploy_service(
        &self,
        project: &Project,
        service_name: &str,
        spec: &ServiceSpec,
        commit: &str,
    ) -> Result<(), DockerError> {
        info!(service = service_name, image = %spec.image, "deploying service");

        let image_id = self.pull_image(&spec.image).await?;

        if let Some(existing) = self.find_container(service_name).await? {
            if existing.image_id == image_id
                && existing.state == "running"
                && existing.config_hash == config_hash(spec)
            {
                info!(service = service_name, "service already running with correct config");
                return Ok(());
            }
            self.remove_container(&existing.container_id).await?;
        }

        self.create_and_start(project, service_name, spec, commit).await
    }

    /// Pull an image and return its local id.
    pub(crate) async fn pull_image(&self, image: &str) -> Result<String, DockerError> {
        info!(image, "pulling image");

        let options = CreateImageOptions {
            from_image: image.to_string(),
            ..Default::default()
        };

        with_timeout(
            "pull image",
            PULL_TIMEOUT,
            self.docker()
                .create_image(Some(options), None, None)
                .try_collect::<Vec<_>>(),
        )
        .await?
        .map_err(|e| DockerError::Pull {
            image: image.to_string(),
            message: e.to_string(),
        })?;

        let inspect = with_timeout(
            "inspect image",
            DEFAULT_TIMEOUT,
            self.docker().inspect_image(image),
        )
        .await??;

        inspect.id.ok_or_else(|| DockerError::Pull {
            image: image.to_string(),
            message: "image has no id after pull".to_string(),
        })
    }

    pub(crate) async fn find_container(
        &self,
        service_name: &str,
    ) -> Result<Option<ServiceActual>, DockerError> {
        let mut filters = self.managed_filters();
        filters
            .get_mut("label")
            .expect("managed filters carry a label key")
            .push(format!("{LABEL_SERVICE}={service_name}"));

        let options = ListContainersOptions::<String> {
            all: true,
            filters,
            ..Default::default()
        };

        let containers = with_timeout(
            "list containers",
            DEFAULT_TIMEOUT,
            self.docker().list_containers(Some(options)),
        )
        .await??;

        Ok(containers.first().map(service_actual))
    }

    /// Force-remove a container. A missing or already-removed container is
    /// treated as success (another remove won).
    pub(crate) async fn remove_container(&self, container_id: &str) -> Result<(), DockerError> {
        info!(container = short_id(container_id), "removing container");

        let options = bollard::container::RemoveContainerOptions {
            force: true,
            ..Default::default()
        };

        let result = with_timeout(
            "remove container",
            DEFAULT_TIMEOUT,
            self.docker().remove_container(container_id, Some(options)),
        )
        .await?;

        match result {
            Ok(()) => Ok(()),
            Err(bollard::errors::Error::DockerResponseServerError {
                status_code: 404 | 409,
                ..
            }) => Ok(()),
            Err(err) => Err(DockerError::Api(err)),
        }
    }

    async fn create_and_start(
        &self,
        project: &Project,
        service_name: &str,
        spec: &ServiceSpec,
        commit: &str,
    ) -> Result<(), DockerError> {
        let container_name = container_name(&project.name, service_name);

        let mut labels = spec.labels.clone().into_iter().collect::<HashMap<_, _>>();
        labels.extend(management_labels(&project.name, service_name, commit, spec));

        let env = spec
            .environment
            .iter()
            .map(|(key, value)| match value {
                Some(value) => format!("{key}={value}"),
                None => key.clone(),
            })
            .collect();

        let (exposed_ports, port_bindings) = build_port_mappings(&spec.ports);

        let mut config = Config::<String> {
            image: Some(spec.image.clone()),
            env: Some(env),
            labels: Some(labels),
            exposed_ports: Some(exposed_ports),
            host_config: Some(HostConfig {
                port_bindings: Some(port_bindings),
                restart_policy: Some(restart_policy(spec)),
                binds: (!spec.volumes.is_empty()).then(|| spec.volumes.clone()),
                ..Default::default()
            }),
            ..Default::default()
        };

        if !spec.command.is_empty() {
            config.cmd = Some(spec.command.clone());
        }
        if !spec.entrypoint.is_empty() {
            config.entrypoint = Some(spec.entrypoint.clone());
        }
        if let Some(working_dir) = &spec.working_dir {
            config.working_dir = Some(working_dir.clone());
        }

        let created = with_timeout(
            "create container",
            DEFAULT_TIMEOUT,
            self.docker().create_container(
                Some(CreateContainerOptions {
                    name: container_name.as_str(),
                    ..Default::default()
                }),
                config,
            ),
        )
        .await??;

        info!(container = short_id(&created.id), service = service_name, "created container");

        // Connect declared networks before start so the service never comes
        // up detached from its peers.
        for network in &spec.networks {
            let network_name = project.network_name(network);
            with_timeout(
                "connect network",
                DEFAULT_TIMEOUT,
                self.docker().connect_network(
                    &network_name,
                    ConnectNetworkOptions {
                        container: created.id.as_str(),
                        endpoint_config: EndpointSettings::default(),
                    },
                ),
            )
            .await?
            .map_err(|e| DockerError::Failed(format!("connect to network {network}; {e}")))?;
        }

        with_timeout(
            "start container",
            DEFAULT_TIMEOUT,
            self.docker()
                .start_container::<String>(&container_name, None),
        )
        .await??;

        info!(container = short_id(&created.id), service = service_name, "started container");
        Ok(())
    }
}

pub(crate) fn container_name(project_name: &str, service_name: &str) -> String {
    format!("{project_name}-{service_name}-1")
}

fn management_labels(
    project_name: &str,
    service_name: &str,
    commit: &str,
    spec: &ServiceSpec,
) -> HashMap<String, String> {
    HashMap::from([
        (LABEL_MANAGED.to_string(), "true".to_string()),
        (LABEL_PROJECT.to_string(), project_name.to_string()),
        (LABEL_SERVICE.to_string(), service_name.to_string()),
        (LABEL_COMMIT.to_string(), commit.to_string()),
        (LABEL_CONFIG_HASH.to_string(), config_hash(spec)),
    ])
}

type PortSet = HashMap<String, HashMap<(), ()>>;
type PortMap = HashMap<String, Option<Vec<PortBinding>>>;

fn build_port_mappings(ports: &[PortMapping]) -> (PortSet, PortMap) {
    let mut exposed = PortSet::new();
    let mut bindings = PortMap::new();

    for port in ports {
        let key = format!("{}/{}", port.target, port.protocol);
        exposed.insert(key.clone(), HashMap::new());

        if let Some(published) = &port.published {
            bindings.insert(
                key,
                Some(vec![PortBinding {
                    host_ip: port.host_ip.clone(),
                    host_port: Some(published.clone()),
                }]),
            );
        }
    }

    (exposed, bindings)
}

fn restart_policy(spec: &ServiceSpec) -> RestartPolicy {
    let name = match spec.restart_policy() {
        Some("always") => RestartPolicyNameEnum::ALWAYS,
        Some("on-failure") => RestartPolicyNameEnum::ON_FAILURE,
        Some("unless-stopped") => RestartPolicyNameEnum::UNLESS_STOPPED,
        _ => RestartPolicyNameEnum::NO,
    };

    RestartPolicy {
        name: Some(name),
        maximum_retry_count: None,
    }
}

fn short_id(id: &str) -> &str {
    &id[..id.len().min(12)]
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::compose;

    #[test]
    fn container_names() {
        assert_eq!(container_name("demo", "web"), "demo-web-1");
    }

    #[test]
    fn restart_policies() {
        let load = |restart: &str| {
            let raw = format!("services:\n  app:\n    image: app:1\n    restart: {restart}\n");
            compose::load(&raw, "demo").unwrap().services["app"].clone()
        };

        assert_eq!(
            restart_policy(&load("always")).name,
            Some(RestartPolicyNameEnum::ALWAYS)
        );
        assert_eq!(
            restart_policy(&load("on-failure")).name,
            Some(RestartPolicyNameEnum::ON_FAILURE)
        );
        assert_eq!(
            restart_policy(&load("unless-stopped")).name,
            Some(RestartPolicyNameEnum::UNLESS_STOPPED)
        );
        assert_eq!(
            restart_policy(&load("no")).name,
            Some(RestartPolicyNameEnum::NO)
        );

        let bare = compose::load("services:\n  app:\n    image: app:1\n", "demo").unwrap();
        assert_eq!(
            restart_policy(&bare.services["app"]).name,
            Some(RestartPolicyNameEnum::NO)
        );
    }

    #[test]
    fn deploy_condition_overrides_restart() {
        let raw = r#"
services:
  app:
    image: app:1
    restart: always
    deploy:
      restart_policy:
        condition: on-failure
"#;
        let project = compose::load(raw, "demo").unwrap();
        assert_eq!(
            restart_policy(&project.services["app"]).name,
            Some(RestartPolicyNameEnum::ON_FAILURE)
        );
    }

    #[test]
    fn port_mappings() {
        let raw = r#"
services:
  app:
    image: app:1
    ports:
      - "8080:80"
      - "9000"
"#;
        let project = compose::load(raw, "demo").unwrap();
        let (exposed, bindings) = build_port_mappings(&project.services["app"].ports);

        assert!(exposed.contains_key("80/tcp"));
        assert!(exposed.contains_key("9000/tcp"));

        let binding = bindings["80/tcp"].as_ref().unwrap();
        assert_eq!(binding[0].host_port.as_deref(), Some("8080"));
        // Unpublished ports are exposed but not bound.
        assert!(!bindings.contains_key("9000/tcp"));
    }

    #[test]
    fn labels_carry_identity() {
        let project = compose::load("services:\n  web:\n    image: n:1\n", "demo").unwrap();
        let spec = &project.services["web"];
        let labels = management_labels("demo", "web", "abc123", spec);

        assert_eq!(labels[LABEL_MANAGED], "true");
        assert_eq!(labels[LABEL_PROJECT], "demo");
        assert_eq!(labels[LABEL_SERVICE], "web");
        assert_eq!(labels[LABEL_COMMIT], "abc123");
        assert_eq!(labels[LABEL_CONFIG_HASH], config_hash(spec));
    }
}
