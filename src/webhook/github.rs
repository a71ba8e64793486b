use serde::Deserialize;

use super::{branch_from_ref, hmac_matches, Payload, Provider, WebhookError};

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
    clone_url: String,
    html_url: String,
}

pub(super) fn parse(body: &[u8]) -> Result<Payload, WebhookError> {
    let push: Push = serde_json::from_slice(body)
        .map_err(|e| WebhookError::InvalidPayload(format!("github push: {e}")))?;

    let repo_url = if push.repository.clone_url.is_empty() {
        push.repository.html_url
    } else {
        push.repository.clone_url
    };

    Ok(Payload {
        provider: Provider::Github,
        repo_url,
        branch: branch_from_ref(&push.git_ref)?,
        commit: push.after,
    })
}

pub(super) fn validate(secret: &str, signature: &str, body: &[u8]) -> Result<(), WebhookError> {
    if signature.is_empty() {
        return Err(WebhookError::MissingSignature("X-Hub-Signature-256"));
    }

    let signature = signature.strip_prefix("sha256=").unwrap_or(signature);
    if hmac_matches(secret, signature, body) {
        Ok(())
    } else {
        Err(WebhookError::InvalidSignature)
    }
}
