//! Per-repository configuration.
//!
//! Every watched repository carries a `kedge.yaml` (or `kedge.yml`) at its
//! root describing how that repository should be deployed. Values support
//! `${NAME}` and `${NAME:-default}` environment interpolation, expanded at
//! load time before deserialization.

use std::path::Path;
use std::time::Duration;

use regex::Regex;
use serde::{Deserialize, Deserializer};

#[derive(thiserror::Error, Debug)]
pub enum ConfigError {
    #[error("no kedge.yaml or kedge.yml found in {0}")]
    NotFound(String),

    #[error("could not read config file; {0}")]
    Io(#[from] std::io::Error),

    #[error("could not parse config file; {0}")]
    Parse(#[from] serde_yaml::Error),
}

#[derive(Debug, Clone, Deserialize, Default)]
#[serde(default)]
pub struct Config {
    pub git: GitConfig,
    pub docker: DockerConfig,
    pub reconciliation: ReconciliationConfig,
    pub state: StateConfig,
    pub logging: LoggingConfig,
    pub server: ServerConfig,
    pub telemetry: TelemetryConfig,
    pub webhook: WebhookConfig,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct GitConfig {
    #[serde(deserialize_with = "de_duration")]
    pub poll_interval: Duration,
}

impl Default for GitConfig {
    fn default() -> Self {
        Self {
            poll_interval: Duration::from_secs(60),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct DockerConfig {
    pub project_name: String,
    pub compose_file: String,
}

impl Default for DockerConfig {
    fn default() -> Self {
        Self {
            project_name: "kedge".to_string(),
            compose_file: "docker-compose.yaml".to_string(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ReconciliationConfig {
    pub mode: String,
    #[serde(deserialize_with = "de_duration")]
    pub interval: Duration,
}

impl Default for ReconciliationConfig {
    fn default() -> Self {
        Self {
            mode: "auto".to_string(),
            interval: Duration::from_secs(30),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct StateConfig {
    pub path: String,
}

impl Default for StateConfig {
    fn default() -> Self {
        Self {
            path: ".kedge/state.db".to_string(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    pub level: String,
    pub format: String,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            format: "text".to_string(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    pub port: u16,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self { port: 8080 }
    }
}

#[derive(Debug, Clone, Deserialize, Default)]
#[serde(default)]
pub struct TelemetryConfig {
    pub metrics: MetricsConfig,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct MetricsConfig {
    pub enabled: bool,
}

impl Default for MetricsConfig {
    fn default() -> Self {
        Self { enabled: true }
    }
}

#[derive(Debug, Clone, Deserialize, Default)]
#[serde(default)]
pub struct WebhookConfig {
    pub secret_env: String,
}

impl Config {
    /// Parse a config file, expanding environment interpolation first.
    /// Missing keys fall back to their defaults.
    pub fn load(path: &Path) -> Result<Config, ConfigError> {
        let raw = std::fs::read_to_string(path)?;
        let expanded = expand_env(&raw);
        let config = serde_yaml::from_str(&expanded)?;
        Ok(config)
    }

    /// Load the repo-level config from a cloned work tree, preferring
    /// `kedge.yaml` over `kedge.yml`.
    pub fn load_from_work_dir(work_dir: &Path) -> Result<Config, ConfigError> {
        for name in ["kedge.yaml", "kedge.yml"] {
            let candidate = work_dir.join(name);
            if candidate.exists() {
                return Config::load(&candidate);
            }
        }
        Err(ConfigError::NotFound(work_dir.display().to_string()))
    }
}

/// Expand `${NAME}` and `${NAME:-default}` references against the process
/// environment. Unset variables without a default expand to the empty string.
pub fn expand_env(input: &str) -> String {
    let pattern = Regex::new(r"\$\{([A-Za-z_][A-Za-z0-9_]*)(?::-([^}]*))?\}")
        .expect("interpolation pattern is valid");

    pattern
        .replace_all(input, |caps: &regex::Captures| {
            let name = &caps[1];
            match std::env::var(name) {
                Ok(value) if !value.is_empty() => value,
                _ => caps.get(2).map(|m| m.as_str().to_string()).unwrap_or_default(),
            }
        })
        .into_owned()
}

/// Parse a duration from either a bare number of seconds or a suffixed
/// string such as `90s`, `5m`, or `1h`.
pub fn parse_duration(input: &str) -> Result<Duration, String> {
    let trimmed = input.trim();
    if trimmed.is_empty() {
        return Err("empty duration".to_string());
    }

    if let Ok(secs) = trimmed.parse::<u64>() {
        return Ok(Duration::from_secs(secs));
    }

    let (number, unit) = trimmed.split_at(trimmed.len() - 1);
    let value: u64 = number
        .trim()
        .parse()
        .map_err(|_| format!("invalid duration {trimmed:?}"))?;

    match unit {
        "s" => Ok(Duration::from_secs(value)),
        "m" => Ok(Duration::from_secs(value * 60)),
        "h" => Ok(Duration::from_secs(value * 3600)),
        _ => Err(format!("invalid duration unit in {trimmed:?}")),
    }
}

fn de_duration<'de, D>(deserializer: D) -> Result<Duration, D::Error>
where
    D: Deserializer<'de>,
{
    #[derive(Deserialize)]
    #[serde(untagged)]
    enum Raw {
        Seconds(u64),
        Text(String),
    }

    match Raw::deserialize(deserializer)? {
        Raw::Seconds(secs) => Ok(Duration::from_secs(secs)),
        Raw::Text(text) => parse_duration(&text).map_err(serde::de::Error::custom),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults() {
        let config = Config::default();
        assert_eq!(config.git.poll_interval, Duration::from_secs(60));
        assert_eq!(config.docker.project_name, "kedge");
        assert_eq!(config.docker.compose_file, "docker-compose.yaml");
        assert_eq!(config.reconciliation.mode, "auto");
        assert_eq!(config.reconciliation.interval, Duration::from_secs(30));
        assert_eq!(config.state.path, ".kedge/state.db");
        assert_eq!(config.server.port, 8080);
        assert!(config.telemetry.metrics.enabled);
        assert_eq!(config.webhook.secret_env, "");
    }

    #[test]
    fn parse_full_config() {
        let raw = r#"
git:
  poll_interval: 2m
docker:
  project_name: myapp
  compose_file: deploy/compose.yaml
reconciliation:
  mode: notify
  interval: 45
state:
  path: /var/lib/kedge/state.db
server:
  port: 9090
telemetry:
  metrics:
    enabled: false
webhook:
  secret_env: KEDGE_WEBHOOK_SECRET
"#;
        let config: Config = serde_yaml::from_str(raw).unwrap();
        assert_eq!(config.git.poll_interval, Duration::from_secs(120));
        assert_eq!(config.docker.project_name, "myapp");
        assert_eq!(config.reconciliation.mode, "notify");
        assert_eq!(config.reconciliation.interval, Duration::from_secs(45));
        assert_eq!(config.server.port, 9090);
        assert!(!config.telemetry.metrics.enabled);
        assert_eq!(config.webhook.secret_env, "KEDGE_WEBHOOK_SECRET");
    }

    #[test]
    fn interpolation() {
        std::env::set_var("KEDGE_TEST_PROJECT", "from-env");

        let expanded = expand_env("name: ${KEDGE_TEST_PROJECT}");
        assert_eq!(expanded, "name: from-env");

        let expanded = expand_env("name: ${KEDGE_TEST_UNSET_VAR:-fallback}");
        assert_eq!(expanded, "name: fallback");

        let expanded = expand_env("name: ${KEDGE_TEST_UNSET_VAR}");
        assert_eq!(expanded, "name: ");

        // A set variable wins over its default.
        let expanded = expand_env("name: ${KEDGE_TEST_PROJECT:-fallback}");
        assert_eq!(expanded, "name: from-env");
    }

    #[test]
    fn durations() {
        assert_eq!(parse_duration("30").unwrap(), Duration::from_secs(30));
        assert_eq!(parse_duration("30s").unwrap(), Duration::from_secs(30));
        assert_eq!(parse_duration("5m").unwrap(), Duration::from_secs(300));
        assert_eq!(parse_duration("1h").unwrap(), Duration::from_secs(3600));
        assert!(parse_duration("").is_err());
        assert!(parse_duration("5x").is_err());
        assert!(parse_duration("abc").is_err());
    }

    #[test]
    fn load_from_work_dir_prefers_yaml() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("kedge.yml"), "docker:\n  project_name: yml\n").unwrap();
        std::fs::write(dir.path().join("kedge.yaml"), "docker:\n  project_name: yaml\n").unwrap();

        let config = Config::load_from_work_dir(dir.path()).unwrap();
        assert_eq!(config.docker.project_name, "yaml");
    }

    #[test]
    fn load_from_work_dir_missing() {
        let dir = tempfile::tempdir().unwrap();
        assert!(matches!(
            Config::load_from_work_dir(dir.path()),
            Err(ConfigError::NotFound(_))
        ));
    }
}
