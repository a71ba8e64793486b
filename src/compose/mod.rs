//! Compose file model.
//!
//! Parses the subset of the compose format kedge deploys: services with an
//! image, command/entrypoint, environment, ports, volumes, networks, a
//! working directory, and a restart policy. Shorthand forms (string
//! commands, `KEY=VALUE` environment lists, `host:container` port strings)
//! are normalized into one canonical [`ServiceSpec`] representation so that
//! the config hash is insensitive to how the author spelled them.

use std::collections::{BTreeMap, BTreeSet};

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

#[derive(thiserror::Error, Debug)]
pub enum ComposeError {
    #[error("could not parse compose file; {0}")]
    Parse(#[from] serde_yaml::Error),

    #[error("service {0} has no image; kedge only deploys prebuilt images")]
    MissingImage(String),

    #[error("service {service} has an invalid port {port:?}")]
    InvalidPort { service: String, port: String },
}

/// A compose project resolved at a commit: the desired state the reconciler
/// drives the container host towards.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Project {
    pub name: String,
    pub services: BTreeMap<String, ServiceSpec>,
    pub networks: BTreeSet<String>,
}

impl Project {
    pub fn service_names(&self) -> Vec<String> {
        self.services.keys().cloned().collect()
    }

    /// The runtime name of a compose-declared network: `<project>_<network>`.
    pub fn network_name(&self, network: &str) -> String {
        format!("{}_{}", self.name, network)
    }
}

/// The desired configuration of one service.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct ServiceSpec {
    pub name: String,
    pub image: String,
    pub command: Vec<String>,
    pub entrypoint: Vec<String>,
    pub environment: BTreeMap<String, Option<String>>,
    pub ports: Vec<PortMapping>,
    pub volumes: Vec<String>,
    pub networks: BTreeSet<String>,
    pub working_dir: Option<String>,
    pub restart: Option<String>,
    pub labels: BTreeMap<String, String>,
    /// `deploy.restart_policy.condition`; takes precedence over `restart`.
    pub restart_condition: Option<String>,
}

impl ServiceSpec {
    /// The restart policy the container should run under.
    pub fn restart_policy(&self) -> Option<&str> {
        self.restart_condition.as_deref().or(self.restart.as_deref())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct PortMapping {
    pub target: u16,
    pub published: Option<String>,
    pub protocol: String,
    pub host_ip: Option<String>,
}

/// Digest over the canonical projection of a service spec. Two specs with
/// identical observable runtime configuration hash identically; any change
/// that requires a container replace changes the hash.
pub fn config_hash(spec: &ServiceSpec) -> String {
    #[derive(Serialize)]
    struct Projection<'a> {
        image: &'a str,
        command: &'a [String],
        entrypoint: &'a [String],
        environment: &'a BTreeMap<String, Option<String>>,
        ports: &'a [PortMapping],
        volumes: &'a [String],
        networks: &'a BTreeSet<String>,
        working_dir: &'a Option<String>,
        restart: Option<&'a str>,
    }

    let projection = Projection {
        image: &spec.image,
        command: &spec.command,
        entrypoint: &spec.entrypoint,
        environment: &spec.environment,
        ports: &spec.ports,
        volumes: &spec.volumes,
        networks: &spec.networks,
        working_dir: &spec.working_dir,
        restart: spec.restart_policy(),
    };

    let Ok(encoded) = serde_json::to_vec(&projection) else {
        return String::new();
    };
    let digest = Sha256::digest(&encoded);
    hex::encode(&digest[..8])
}

/// Parse compose file content into a [`Project`]. Environment interpolation
/// is expanded before parsing, matching the config loader.
pub fn load(content: &str, project_name: &str) -> Result<Project, ComposeError> {
    let expanded = crate::conf::expand_env(content);
    let file: ComposeFile = serde_yaml::from_str(&expanded)?;

    let mut services = BTreeMap::new();
    for (name, raw) in file.services {
        services.insert(name.clone(), raw.normalize(&name)?);
    }

    let networks = file.networks.into_keys().collect();

    Ok(Project {
        name: project_name.to_string(),
        services,
        networks,
    })
}

#[derive(Debug, Deserialize)]
struct ComposeFile {
    #[serde(default)]
    services: BTreeMap<String, RawService>,
    #[serde(default)]
    networks: BTreeMap<String, serde_yaml::Value>,
}

#[derive(Debug, Deserialize)]
struct RawService {
    image: Option<String>,
    #[serde(default)]
    command: Option<StringOrList>,
    #[serde(default)]
    entrypoint: Option<StringOrList>,
    #[serde(default)]
    environment: Option<RawEnvironment>,
    #[serde(default)]
    ports: Vec<RawPort>,
    #[serde(default)]
    volumes: Vec<String>,
    #[serde(default)]
    networks: Option<RawNetworks>,
    #[serde(default)]
    working_dir: Option<String>,
    #[serde(default)]
    restart: Option<String>,
    #[serde(default)]
    labels: Option<RawLabels>,
    #[serde(default)]
    deploy: Option<RawDeploy>,
}

#[derive(Debug, Deserialize)]
struct RawDeploy {
    restart_policy: Option<RawRestartPolicy>,
}

#[derive(Debug, Deserialize)]
struct RawRestartPolicy {
    condition: Option<String>,
}

#[derive(Debug, Deserialize)]
#[serde(untagged)]
enum StringOrList {
    One(String),
    Many(Vec<String>),
}

impl StringOrList {
    fn into_vec(self) -> Vec<String> {
        match self {
            StringOrList::One(value) => value.split_whitespace().map(str::to_string).collect(),
            StringOrList::Many(values) => values,
        }
    }
}

#[derive(Debug, Deserialize)]
#[serde(untagged)]
enum RawEnvironment {
    Map(BTreeMap<String, Option<serde_yaml::Value>>),
    List(Vec<String>),
}

#[derive(Debug, Deserialize)]
#[serde(untagged)]
enum RawNetworks {
    List(Vec<String>),
    Map(BTreeMap<String, serde_yaml::Value>),
}

#[derive(Debug, Deserialize)]
#[serde(untagged)]
enum RawLabels {
    Map(BTreeMap<String, serde_yaml::Value>),
    List(Vec<String>),
}

#[derive(Debug, Deserialize)]
#[serde(untagged)]
enum RawPort {
    Short(String),
    Number(u16),
    Long {
        target: u16,
        #[serde(default)]
        published: Option<RawPublished>,
        #[serde(default)]
        protocol: Option<String>,
        #[serde(default)]
        host_ip: Option<String>,
    },
}

#[derive(Debug, Deserialize)]
#[serde(untagged)]
enum RawPublished {
    Number(u16),
    Text(String),
}

impl RawPublished {
    fn into_string(self) -> String {
        match self {
            RawPublished::Number(port) => port.to_string(),
            RawPublished::Text(text) => text,
        }
    }
}

impl RawService {
    fn normalize(self, name: &str) -> Result<ServiceSpec, ComposeError> {
        let image = self
            .image
            .filter(|image| !image.is_empty())
            .ok_or_else(|| ComposeError::MissingImage(name.to_string()))?;

        let environment = match self.environment {
            None => BTreeMap::new(),
            Some(RawEnvironment::Map(map)) => map
                .into_iter()
                .map(|(key, value)| (key, value.and_then(yaml_scalar)))
                .collect(),
            Some(RawEnvironment::List(entries)) => entries
                .into_iter()
                .map(|entry| match entry.split_once('=') {
                    Some((key, value)) => (key.to_string(), Some(value.to_string())),
                    None => (entry, None),
                })
                .collect(),
        };

        let mut ports = Vec::with_capacity(self.ports.len());
        for port in self.ports {
            ports.push(normalize_port(name, port)?);
        }

        let networks = match self.networks {
            None => BTreeSet::new(),
            Some(RawNetworks::List(list)) => list.into_iter().collect(),
            Some(RawNetworks::Map(map)) => map.into_keys().collect(),
        };

        let labels = match self.labels {
            None => BTreeMap::new(),
            Some(RawLabels::Map(map)) => map
                .into_iter()
                .filter_map(|(key, value)| yaml_scalar(value).map(|value| (key, value)))
                .collect(),
            Some(RawLabels::List(entries)) => entries
                .into_iter()
                .filter_map(|entry| {
                    entry
                        .split_once('=')
                        .map(|(key, value)| (key.to_string(), value.to_string()))
                })
                .collect(),
        };

        Ok(ServiceSpec {
            name: name.to_string(),
            image,
            command: self.command.map(StringOrList::into_vec).unwrap_or_default(),
            entrypoint: self.entrypoint.map(StringOrList::into_vec).unwrap_or_default(),
            environment,
            ports,
            volumes: self.volumes,
            networks,
            working_dir: self.working_dir,
            restart: self.restart,
            labels,
            restart_condition: self
                .deploy
                .and_then(|deploy| deploy.restart_policy)
                .and_then(|policy| policy.condition),
        })
    }
}

fn yaml_scalar(value: serde_yaml::Value) -> Option<String> {
    match value {
        serde_yaml::Value::String(text) => Some(text),
        serde_yaml::Value::Number(number) => Some(number.to_string()),
        serde_yaml::Value::Bool(flag) => Some(flag.to_string()),
        _ => None,
    }
}

/// Normalize a port declaration. The short form accepts `target`,
/// `published:target`, and `host_ip:published:target`, each with an optional
/// `/protocol` suffix.
fn normalize_port(service: &str, port: RawPort) -> Result<PortMapping, ComposeError> {
    let invalid = |raw: &str| ComposeError::InvalidPort {
        service: service.to_string(),
        port: raw.to_string(),
    };

    match port {
        RawPort::Number(target) => Ok(PortMapping {
            target,
            published: None,
            protocol: "tcp".to_string(),
            host_ip: None,
        }),
        RawPort::Long {
            target,
            published,
            protocol,
            host_ip,
        } => Ok(PortMapping {
            target,
            published: published.map(RawPublished::into_string),
            protocol: protocol.unwrap_or_else(|| "tcp".to_string()),
            host_ip,
        }),
        RawPort::Short(raw) => {
            let (address, protocol) = match raw.split_once('/') {
                Some((address, protocol)) => (address, protocol.to_string()),
                None => (raw.as_str(), "tcp".to_string()),
            };

            let parts: Vec<&str> = address.split(':').collect();
            let mapping = match parts.as_slice() {
                [target] => PortMapping {
                    target: target.parse().map_err(|_| invalid(&raw))?,
                    published: None,
                    protocol,
                    host_ip: None,
                },
                [published, target] => PortMapping {
                    target: target.parse().map_err(|_| invalid(&raw))?,
                    published: Some((*published).to_string()),
                    protocol,
                    host_ip: None,
                },
                [host_ip, published, target] => PortMapping {
                    target: target.parse().map_err(|_| invalid(&raw))?,
                    published: Some((*published).to_string()),
                    protocol,
                    host_ip: Some((*host_ip).to_string()),
                },
                _ => return Err(invalid(&raw)),
            };
            Ok(mapping)
        }
    }
}
