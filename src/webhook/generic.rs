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
}

pub(super) fn parse(body: &[u8]) -> Result<Payload, WebhookError> {
    let push: Push = serde_json::from_slice(body)
        .map_err(|e| WebhookError::InvalidPayload(format!("generic push: {e}")))?;

    Ok(Payload {
        provider: Provider::Generic,
        repo_url: push.repository.url,
        branch: branch_from_ref(&push.git_ref)?,
        commit: push.after,
    })
}

pub(super) fn validate(secret: &str, header_secret: &str) -> Result<(), WebhookError> {
    if header_secret.is_empty() {
        return Err(WebhookError::MissingSignature("X-Webhook-Secret"));
    }

    if secrets_match(secret, header_secret) {
        Ok(())
    } else {
        Err(WebhookError::InvalidSignature)
    }
}
