//! Metrics.
//!
//! Counters, histograms, and gauges are recorded through the `metrics`
//! facade and exported in Prometheus text format by the HTTP server.

use std::time::Duration;

use metrics::{counter, describe_counter, describe_gauge, describe_histogram, gauge};
use metrics_exporter_prometheus::{BuildError, PrometheusBuilder, PrometheusHandle};

const DURATION_BUCKETS: &[f64] = &[0.05, 0.1, 0.25, 0.5, 1.0, 2.5, 5.0, 10.0, 30.0, 60.0, 300.0];

/// Install the global recorder and return the handle the `/metrics` endpoint
/// renders from. Call once, at startup.
pub fn install() -> Result<PrometheusHandle, BuildError> {
    let handle = PrometheusBuilder::new()
        .set_buckets(DURATION_BUCKETS)?
        .install_recorder()?;

    describe_counter!("kedge_deployments_total", "Total number of deployments");
    describe_counter!("kedge_drift_detected_total", "Total number of drift detections");
    describe_counter!("kedge_git_polls_total", "Total number of git poll operations");
    describe_histogram!(
        "kedge_reconciliation_duration_seconds",
        "Duration of reconciliation operations"
    );
    describe_histogram!(
        "kedge_git_poll_duration_seconds",
        "Duration of git poll operations"
    );
    describe_gauge!("kedge_services_total", "Current number of services by state");
    describe_gauge!(
        "kedge_last_deployment_timestamp",
        "Unix timestamp of the last deployment"
    );
    describe_gauge!("kedge_info", "Kedge build information");

    gauge!("kedge_info", "version" => crate::VERSION).set(1.0);

    Ok(handle)
}

pub fn record_deployment(repo: &str, status: &str) {
    counter!(
        "kedge_deployments_total",
        "repo" => repo.to_string(),
        "status" => status.to_string()
    )
    .increment(1);

    gauge!("kedge_last_deployment_timestamp", "repo" => repo.to_string())
        .set(chrono::Utc::now().timestamp() as f64);
}

pub fn record_drift(repo: &str, service: &str) {
    counter!(
        "kedge_drift_detected_total",
        "repo" => repo.to_string(),
        "service" => service.to_string()
    )
    .increment(1);
}

pub fn record_reconciliation(repo: &str, duration: Duration, success: bool) {
    metrics::histogram!(
        "kedge_reconciliation_duration_seconds",
        "repo" => repo.to_string(),
        "success" => success.to_string()
    )
    .record(duration.as_secs_f64());
}

pub fn record_git_poll(repo: &str, duration: Duration, success: bool) {
    counter!(
        "kedge_git_polls_total",
        "repo" => repo.to_string(),
        "success" => success.to_string()
    )
    .increment(1);

    metrics::histogram!(
        "kedge_git_poll_duration_seconds",
        "repo" => repo.to_string(),
        "success" => success.to_string()
    )
    .record(duration.as_secs_f64());
}

pub fn set_services(repo: &str, state: &str, count: f64) {
    gauge!(
        "kedge_services_total",
        "repo" => repo.to_string(),
        "state" => state.to_string()
    )
    .set(count);
}
