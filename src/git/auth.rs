//! Repository authentication.
//!
//! Credentials are materialized per git invocation and never persisted: an
//! ssh key becomes a `GIT_SSH_COMMAND`, a token becomes a basic-auth header
//! resolved from its environment variable at call time.

use std::str::FromStr;

use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine as _;
use strum::{Display, EnumString};

use crate::storage::Repo;

use super::GitError;

const DEFAULT_TOKEN_USERNAME: &str = "x-access-token";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Display, EnumString)]
pub enum AuthKind {
    #[default]
    #[strum(serialize = "none", serialize = "")]
    None,
    #[strum(serialize = "ssh-key")]
    SshKey,
    #[strum(serialize = "token")]
    Token,
}

#[derive(Debug, Clone, Default)]
pub struct AuthConfig {
    pub kind: AuthKind,
    pub ssh_key_path: Option<String>,
    pub username: Option<String>,
    pub password_env: Option<String>,
}

impl AuthConfig {
    pub fn from_repo(repo: &Repo) -> Result<AuthConfig, GitError> {
        let kind = match repo.auth_kind.as_deref() {
            None => AuthKind::None,
            Some(raw) => AuthKind::from_str(raw)
                .map_err(|_| GitError::Auth(format!("unknown auth kind {raw:?}")))?,
        };

        Ok(AuthConfig {
            kind,
            ssh_key_path: repo.auth_ssh_key_path.clone(),
            username: repo.auth_username.clone(),
            password_env: repo.auth_password_env.clone(),
        })
    }

    /// Environment for a git subprocess. Prompting is always disabled so a
    /// misconfigured credential fails instead of hanging the poll loop.
    pub fn environment(&self) -> Result<Vec<(String, String)>, GitError> {
        let mut env = vec![("GIT_TERMINAL_PROMPT".to_string(), "0".to_string())];

        if self.kind == AuthKind::SshKey {
            let key_path = self
                .ssh_key_path
                .as_deref()
                .filter(|path| !path.is_empty())
                .ok_or_else(|| GitError::Auth("ssh-key auth requires a key path".to_string()))?;

            env.push((
                "GIT_SSH_COMMAND".to_string(),
                format!("ssh -i {key_path} -o IdentitiesOnly=yes -o StrictHostKeyChecking=accept-new"),
            ));
        }

        Ok(env)
    }

    /// Extra `-c` configuration for a git subprocess; carries the token
    /// header for HTTPS token auth.
    pub fn config_args(&self) -> Result<Vec<String>, GitError> {
        if self.kind != AuthKind::Token {
            return Ok(Vec::new());
        }

        let password_env = self
            .password_env
            .as_deref()
            .filter(|name| !name.is_empty())
            .ok_or_else(|| GitError::Auth("token auth requires a password env var".to_string()))?;

        let password = std::env::var(password_env).map_err(|_| {
            GitError::Auth(format!("environment variable {password_env} is not set"))
        })?;

        let username = self
            .username
            .as_deref()
            .filter(|name| !name.is_empty())
            .unwrap_or(DEFAULT_TOKEN_USERNAME);

        let credentials = BASE64.encode(format!("{username}:{password}"));
        Ok(vec![
            "-c".to_string(),
            format!("http.extraheader=AUTHORIZATION: basic {credentials}"),
        ])
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn kind_round_trip() {
        assert_eq!("none".parse::<AuthKind>().unwrap(), AuthKind::None);
        assert_eq!("ssh-key".parse::<AuthKind>().unwrap(), AuthKind::SshKey);
        assert_eq!("token".parse::<AuthKind>().unwrap(), AuthKind::Token);
        assert!("password".parse::<AuthKind>().is_err());
    }

    #[test]
    fn none_auth_only_disables_prompts() {
        let auth = AuthConfig::default();
        let env = auth.environment().unwrap();
        assert_eq!(env, vec![("GIT_TERMINAL_PROMPT".to_string(), "0".to_string())]);
        assert!(auth.config_args().unwrap().is_empty());
    }

    #[test]
    fn ssh_auth_builds_ssh_command() {
        let auth = AuthConfig {
            kind: AuthKind::SshKey,
            ssh_key_path: Some("/home/deploy/.ssh/id_ed25519".to_string()),
            ..Default::default()
        };

        let env = auth.environment().unwrap();
        let ssh_command = &env
            .iter()
            .find(|(name, _)| name == "GIT_SSH_COMMAND")
            .unwrap()
            .1;
        assert!(ssh_command.contains("-i /home/deploy/.ssh/id_ed25519"));
    }

    #[test]
    fn ssh_auth_requires_key_path() {
        let auth = AuthConfig {
            kind: AuthKind::SshKey,
            ..Default::default()
        };
        assert!(matches!(auth.environment(), Err(GitError::Auth(_))));
    }

    #[test]
    fn token_auth_builds_basic_header() {
        std::env::set_var("KEDGE_TEST_GIT_TOKEN", "s3cret");

        let auth = AuthConfig {
            kind: AuthKind::Token,
            password_env: Some("KEDGE_TEST_GIT_TOKEN".to_string()),
            ..Default::default()
        };

        let args = auth.config_args().unwrap();
        assert_eq!(args[0], "-c");
        let expected = BASE64.encode("x-access-token:s3cret");
        assert_eq!(args[1], format!("http.extraheader=AUTHORIZATION: basic {expected}"));
    }

    #[test]
    fn token_auth_requires_env_var() {
        let auth = AuthConfig {
            kind: AuthKind::Token,
            password_env: Some("KEDGE_TEST_GIT_TOKEN_UNSET".to_string()),
            ..Default::default()
        };
        assert!(matches!(auth.config_args(), Err(GitError::Auth(_))));
    }
}
