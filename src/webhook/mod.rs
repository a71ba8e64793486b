//! Push webhook parsing and validation.
//!
//! Providers are a closed set inferred from request headers. Each provider
//! contributes a payload parser and a signature validator; all comparisons
//! against secrets are constant-time.

mod generic;
mod gitea;
mod github;
mod gitlab;

use axum::http::HeaderMap;
use strum::Display;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Display)]
#[strum(serialize_all = "lowercase")]
pub enum Provider {
    Github,
    Gitlab,
    Gitea,
    Generic,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Payload {
    pub provider: Provider,
    pub repo_url: String,
    pub branch: String,
    pub commit: String,
}

#[derive(thiserror::Error, Debug, PartialEq, Eq)]
pub enum WebhookError {
    #[error("invalid payload; {0}")]
    InvalidPayload(String),

    #[error("not a branch push: {0}")]
    NotBranchPush(String),

    #[error("missing {0} header")]
    MissingSignature(&'static str),

    #[error("invalid signature")]
    InvalidSignature,
}

/// Infer the provider from request headers. Anything without a recognized
/// provider header is treated as a generic webhook.
pub fn detect_provider(headers: &HeaderMap) -> Provider {
    if headers.contains_key("X-Hub-Signature-256") {
        Provider::Github
    } else if headers.contains_key("X-Gitlab-Token") {
        Provider::Gitlab
    } else if headers.contains_key("X-Gitea-Signature") {
        Provider::Gitea
    } else {
        Provider::Generic
    }
}

/// Parse a push payload. Only branch pushes (`refs/heads/...`) are
/// accepted; tag pushes fail at parse time.
pub fn parse(provider: Provider, body: &[u8]) -> Result<Payload, WebhookError> {
    let mut payload = match provider {
        Provider::Github => github::parse(body),
        Provider::Gitlab => gitlab::parse(body),
        Provider::Gitea => gitea::parse(body),
        Provider::Generic => generic::parse(body),
    }?;
    payload.provider = provider;
    Ok(payload)
}

/// Validate the provider-specific signature. An empty secret disables
/// validation for the repo.
pub fn validate_signature(
    provider: Provider,
    secret: &str,
    headers: &HeaderMap,
    body: &[u8],
) -> Result<(), WebhookError> {
    if secret.is_empty() {
        return Ok(());
    }

    match provider {
        Provider::Github => {
            github::validate(secret, header_value(headers, "X-Hub-Signature-256"), body)
        }
        Provider::Gitlab => gitlab::validate(secret, header_value(headers, "X-Gitlab-Token")),
        Provider::Gitea => {
            gitea::validate(secret, header_value(headers, "X-Gitea-Signature"), body)
        }
        Provider::Generic => {
            generic::validate(secret, header_value(headers, "X-Webhook-Secret"))
        }
    }
}

fn header_value<'a>(headers: &'a HeaderMap, name: &str) -> &'a str {
    headers
        .get(name)
        .and_then(|value| value.to_str().ok())
        .unwrap_or_default()
}

/// Reject refs that are not branch heads and strip the prefix.
pub(crate) fn branch_from_ref(git_ref: &str) -> Result<String, WebhookError> {
    git_ref
        .strip_prefix("refs/heads/")
        .map(str::to_string)
        .ok_or_else(|| WebhookError::NotBranchPush(git_ref.to_string()))
}

/// Constant-time equality of a plaintext secret against a header value.
pub(crate) fn secrets_match(expected: &str, received: &str) -> bool {
    use subtle::ConstantTimeEq;
    expected.as_bytes().ct_eq(received.as_bytes()).into()
}

/// Constant-time HMAC-SHA-256 check of `body` against a hex signature.
pub(crate) fn hmac_matches(secret: &str, hex_signature: &str, body: &[u8]) -> bool {
    use hmac::{Hmac, Mac};
    use sha2::Sha256;

    let Ok(signature) = hex::decode(hex_signature) else {
        return false;
    };

    let mut mac = Hmac::<Sha256>::new_from_slice(secret.as_bytes())
        .expect("hmac accepts any key length");
    mac.update(body);
    mac.verify_slice(&signature).is_ok()
}

#[cfg(test)]
mod tests {
    use super::*;
    use hmac::{Hmac, Mac};
    use sha2::Sha256;

    pub(crate) fn sign(secret: &str, body: &[u8]) -> String {
        let mut mac = Hmac::<Sha256>::new_from_slice(secret.as_bytes()).unwrap();
        mac.update(body);
        hex::encode(mac.finalize().into_bytes())
    }

    fn headers(pairs: &[(&str, &str)]) -> HeaderMap {
        let mut map = HeaderMap::new();
        for (name, value) in pairs {
            map.insert(
                axum::http::HeaderName::from_bytes(name.as_bytes()).unwrap(),
                value.parse().unwrap(),
            );
        }
        map
    }

    #[test]
    fn provider_detection() {
        assert_eq!(
            detect_provider(&headers(&[("X-Hub-Signature-256", "sha256=abc")])),
            Provider::Github
        );
        assert_eq!(
            detect_provider(&headers(&[("X-Gitlab-Token", "token")])),
            Provider::Gitlab
        );
        assert_eq!(
            detect_provider(&headers(&[("X-Gitea-Signature", "abc")])),
            Provider::Gitea
        );
        assert_eq!(detect_provider(&headers(&[])), Provider::Generic);
    }

    #[test]
    fn github_payload() {
        let body = serde_json::json!({
            "ref": "refs/heads/main",
            "after": "a1b2c3d4",
            "repository": {
                "clone_url": "https://github.com/example/app.git",
                "html_url": "https://github.com/example/app"
            }
        });

        let payload = parse(Provider::Github, body.to_string().as_bytes()).unwrap();
        assert_eq!(payload.provider, Provider::Github);
        assert_eq!(payload.repo_url, "https://github.com/example/app.git");
        assert_eq!(payload.branch, "main");
        assert_eq!(payload.commit, "a1b2c3d4");
    }

    #[test]
    fn github_falls_back_to_html_url() {
        let body = serde_json::json!({
            "ref": "refs/heads/main",
            "after": "a1b2c3d4",
            "repository": { "html_url": "https://github.com/example/app" }
        });

        let payload = parse(Provider::Github, body.to_string().as_bytes()).unwrap();
        assert_eq!(payload.repo_url, "https://github.com/example/app");
    }

    #[test]
    fn gitlab_payload_prefers_git_http_url() {
        let body = serde_json::json!({
            "ref": "refs/heads/develop",
            "after": "ffff0000",
            "repository": {
                "url": "git@gitlab.example:group/app.git",
                "git_http_url": "https://gitlab.example/group/app.git"
            }
        });

        let payload = parse(Provider::Gitlab, body.to_string().as_bytes()).unwrap();
        assert_eq!(payload.repo_url, "https://gitlab.example/group/app.git");
        assert_eq!(payload.branch, "develop");
    }

    #[test]
    fn gitea_payload() {
        let body = serde_json::json!({
            "ref": "refs/heads/main",
            "after": "1234abcd",
            "repository": { "clone_url": "https://gitea.example/org/app.git" }
        });

        let payload = parse(Provider::Gitea, body.to_string().as_bytes()).unwrap();
        assert_eq!(payload.repo_url, "https://gitea.example/org/app.git");
    }

    #[test]
    fn generic_payload() {
        let body = serde_json::json!({
            "ref": "refs/heads/main",
            "after": "1234abcd",
            "repository": { "url": "https://git.example/app.git" }
        });

        let payload = parse(Provider::Generic, body.to_string().as_bytes()).unwrap();
        assert_eq!(payload.repo_url, "https://git.example/app.git");
    }

    #[test]
    fn tag_push_rejected() {
        let body = serde_json::json!({
            "ref": "refs/tags/v1.0.0",
            "after": "1234abcd",
            "repository": { "url": "https://git.example/app.git" }
        });

        let err = parse(Provider::Generic, body.to_string().as_bytes()).unwrap_err();
        assert_eq!(err, WebhookError::NotBranchPush("refs/tags/v1.0.0".to_string()));
    }

    #[test]
    fn malformed_body_rejected() {
        assert!(matches!(
            parse(Provider::Github, b"{not json"),
            Err(WebhookError::InvalidPayload(_))
        ));
    }

    #[test]
    fn github_signature_validation() {
        let secret = "supersecret";
        let body = br#"{"ref":"refs/heads/main"}"#;
        let signature = format!("sha256={}", sign(secret, body));

        let valid = headers(&[("X-Hub-Signature-256", signature.as_str())]);
        assert!(validate_signature(Provider::Github, secret, &valid, body).is_ok());

        let wrong = headers(&[("X-Hub-Signature-256", "sha256=deadbeef")]);
        assert_eq!(
            validate_signature(Provider::Github, secret, &wrong, body).unwrap_err(),
            WebhookError::InvalidSignature
        );

        let missing = headers(&[]);
        assert_eq!(
            validate_signature(Provider::Github, secret, &missing, body).unwrap_err(),
            WebhookError::MissingSignature("X-Hub-Signature-256")
        );
    }

    #[test]
    fn gitea_signature_has_no_prefix() {
        let secret = "supersecret";
        let body = br#"{"ref":"refs/heads/main"}"#;
        let signature = sign(secret, body);

        let valid = headers(&[("X-Gitea-Signature", signature.as_str())]);
        assert!(validate_signature(Provider::Gitea, secret, &valid, body).is_ok());
    }

    #[test]
    fn gitlab_token_validation() {
        let valid = headers(&[("X-Gitlab-Token", "supersecret")]);
        assert!(validate_signature(Provider::Gitlab, "supersecret", &valid, b"").is_ok());

        let wrong = headers(&[("X-Gitlab-Token", "nope")]);
        assert_eq!(
            validate_signature(Provider::Gitlab, "supersecret", &wrong, b"").unwrap_err(),
            WebhookError::InvalidSignature
        );
    }

    #[test]
    fn generic_secret_validation() {
        let valid = headers(&[("X-Webhook-Secret", "supersecret")]);
        assert!(validate_signature(Provider::Generic, "supersecret", &valid, b"").is_ok());

        let missing = headers(&[]);
        assert_eq!(
            validate_signature(Provider::Generic, "supersecret", &missing, b"").unwrap_err(),
            WebhookError::MissingSignature("X-Webhook-Secret")
        );
    }

    #[test]
    fn empty_secret_disables_validation() {
        let none = headers(&[]);
        assert!(validate_signature(Provider::Github, "", &none, b"body").is_ok());
    }

    #[test]
    fn comparison_tolerates_length_mismatch() {
        assert!(!secrets_match("secret", "sec"));
        assert!(!secrets_match("", "x"));
        assert!(secrets_match("same", "same"));
        assert!(!hmac_matches("secret", "abcd", b"body"));
        assert!(!hmac_matches("secret", "zz-not-hex", b"body"));
    }
}
