//! HTTP surface: health, readiness, metrics, and the push webhook.
//!
//! The webhook handler deliberately reveals nothing to unauthenticated
//! callers: an unknown repo gets the same 200 `accepted` as a matched one,
//! and validation failures collapse into coarse 400/401 categories. A
//! verified push launches the sync detached from the request, bounded by
//! its own five minute timeout, so client disconnects never abort a deploy.

use std::sync::Arc;
use std::time::Duration;

use axum::body::Bytes;
use axum::extract::State;
use axum::http::{HeaderMap, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use metrics_exporter_prometheus::PrometheusHandle;
use serde::Serialize;
use serde_json::json;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::manager::Manager;
use crate::storage::DeploymentStatus;
use crate::webhook;

const SYNC_TIMEOUT: Duration = Duration::from_secs(300);

#[derive(Clone)]
pub struct AppState {
    pub manager: Arc<Manager>,
    pub global_secret_env: String,
    pub metrics: Option<PrometheusHandle>,
}

pub fn router(state: AppState) -> Router {
    let mut router = Router::new()
        .route("/health", get(health))
        .route("/ready", get(ready))
        .route("/webhook", post(handle_webhook));

    if state.metrics.is_some() {
        router = router.route("/metrics", get(render_metrics));
    }

    router
        .with_state(state)
        .layer(tower_http::trace::TraceLayer::new_for_http())
}

/// Bind and serve until cancellation, then drain within a 10 second budget.
pub async fn serve(
    port: u16,
    state: AppState,
    token: CancellationToken,
) -> Result<(), std::io::Error> {
    let listener = tokio::net::TcpListener::bind(("0.0.0.0", port)).await?;
    info!(port, "server started");

    axum::serve(listener, router(state))
        .with_graceful_shutdown(async move { token.cancelled().await })
        .await
}

async fn health() -> impl IntoResponse {
    Json(json!({ "status": "ok" }))
}

async fn ready(State(state): State<AppState>) -> impl IntoResponse {
    let ready = state.manager.is_ready();
    let status = if ready { "ok" } else { "not ready" };
    Json(json!({ "ready": ready, "status": status }))
}

async fn render_metrics(State(state): State<AppState>) -> Response {
    match &state.metrics {
        Some(handle) => handle.render().into_response(),
        None => StatusCode::NOT_FOUND.into_response(),
    }
}

#[derive(Debug, Serialize)]
struct WebhookResponse {
    status: &'static str,
    #[serde(skip_serializing_if = "Option::is_none")]
    repo: Option<String>,
}

fn accepted(status: &'static str, repo: Option<String>) -> Response {
    Json(WebhookResponse { status, repo }).into_response()
}

async fn handle_webhook(
    State(state): State<AppState>,
    headers: HeaderMap,
    body: Bytes,
) -> Response {
    let provider = webhook::detect_provider(&headers);

    let payload = match webhook::parse(provider, &body) {
        Ok(payload) => payload,
        Err(err) => {
            warn!(%provider, error = %err, "webhook parse failed");
            return (
                StatusCode::BAD_REQUEST,
                Json(json!({ "error": "invalid webhook payload" })),
            )
                .into_response();
        }
    };

    // Unknown repos get a generic acknowledgement; unauthenticated probes
    // must not learn which repositories exist.
    let repo = match state.manager.find_repo_by_url(&payload.repo_url).await {
        Ok(repo) => repo,
        Err(_) => {
            debug!(url = %payload.repo_url, "no matching repo for webhook");
            return accepted("accepted", None);
        }
    };

    let secret = resolve_secret(
        repo.webhook_secret_env.as_deref(),
        &state.global_secret_env,
    );
    if let Err(err) = webhook::validate_signature(provider, &secret, &headers, &body) {
        warn!(repo = %repo.name, error = %err, "webhook signature validation failed");
        return (
            StatusCode::UNAUTHORIZED,
            Json(json!({ "error": "invalid signature" })),
        )
            .into_response();
    }

    if repo.branch != payload.branch {
        debug!(
            repo = %repo.name,
            expected = %repo.branch,
            got = %payload.branch,
            "webhook branch mismatch"
        );
        return accepted("branch ignored", Some(repo.name));
    }

    if let Ok(existing) = state
        .manager
        .store()
        .get_deployment_by_commit(&repo.name, &payload.commit)
        .await
    {
        if existing.status().ok() == Some(DeploymentStatus::Success) {
            info!(
                repo = %repo.name,
                commit = %short_commit(&payload.commit),
                "webhook skipped, commit already deployed"
            );
            return accepted("already deployed", Some(repo.name));
        }
    }

    info!(
        repo = %repo.name,
        commit = %short_commit(&payload.commit),
        "webhook triggering sync"
    );

    // Detached from the request context on purpose: the deploy keeps going
    // if the sender hangs up, bounded only by its own timeout.
    let manager = Arc::clone(&state.manager);
    let repo_name = repo.name.clone();
    tokio::spawn(async move {
        match tokio::time::timeout(SYNC_TIMEOUT, manager.trigger_sync(&repo_name)).await {
            Ok(Ok(())) => {}
            Ok(Err(err)) => error!(repo = %repo_name, error = %err, "webhook sync failed"),
            Err(_) => error!(repo = %repo_name, "webhook sync timed out"),
        }
    });

    accepted("sync triggered", Some(repo.name))
}

fn short_commit(hash: &str) -> String {
    hash.chars().take(8).collect()
}

/// The per-repo secret env var wins; the globally configured one is the
/// fallback. An empty result disables validation for the repo.
fn resolve_secret(repo_secret_env: Option<&str>, global_secret_env: &str) -> String {
    if let Some(name) = repo_secret_env {
        if !name.is_empty() {
            if let Ok(value) = std::env::var(name) {
                if !value.is_empty() {
                    return value;
                }
            }
        }
    }

    if global_secret_env.is_empty() {
        return String::new();
    }
    std::env::var(global_secret_env).unwrap_or_default()
}
