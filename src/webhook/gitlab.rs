use serde::Deserialize;

use super::{branch_from_ref, secrets_match, Payload, Provider, WebhookError};

#[derive(Deserialize)]
struct Push {
    #[serde(rename = "ref")]
    git_ref: String,
    after: String,
    repository: Repository,
}

#[derive(Deserialize, Default)]
#[serde(default)]
struct Repository {
    url: String,
    git_http_url: String,
}

pub(super) fn parse(body: &[u8]) -> Result<Payload, WebhookError> {
    let push: Push = serde_json::from_slice(body)
        .map_err(|e| WebhookError::InvalidPayload(format!("gitlab push: {e}")))?;

    let repo_url = if push.repository.git_http_url.is_empty() {
        push.repository.url
    } else {
        push.repository.git_http_url
    };

    Ok(Payload {
        provider: Provider::Gitlab,
        repo_url,
        branch: branch_from_ref(&push.git_ref)?,
        commit: push.after,
    })
}

pub(super) fn validate(secret: &str, token: &str) -> Result<(), WebhookError> {
    if token.is_empty() {
        return Err(WebhookError::MissingSignature("X-Gitlab-Token"));
    }

    if secrets_match(secret, token) {
        Ok(())
    } else {
        Err(WebhookError::InvalidSignature)
    }
}
