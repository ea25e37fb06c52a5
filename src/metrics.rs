//! Metrics helpers for Nexus.
//!
//! Thin wrappers around the `metrics` crate macros plus the Prometheus
//! recorder installation. Metric names and label sets are fixed here so the
//! rest of the codebase never spells label keys inline.
//!
//! Provided metrics (labels vary by family):
//! * `nexus_requests_total` (counter: method, route, status)
//! * `nexus_request_duration_seconds` (histogram: method, route)
//! * `nexus_upstream_healthy` (gauge: cluster, endpoint)
//! * `nexus_rate_limit_hits_total` (counter: key)
//! * `nexus_auth_failures_total` (counter: reason)
//! * `nexus_circuit_breaker_state` (gauge: cluster, state)
//! * `nexus_config_reloads_total` (counter: result)
//!
//! The `route` label always carries the matched route's *name*, never a raw
//! path, to bound cardinality.
use std::time::Duration;

use metrics::{
    Unit, counter, describe_counter, describe_gauge, describe_histogram, gauge, histogram,
};
use metrics_exporter_prometheus::{PrometheusBuilder, PrometheusHandle};
use once_cell::sync::OnceCell;

use crate::core::circuit_breaker::BreakerState;

pub const NEXUS_REQUESTS_TOTAL: &str = "nexus_requests_total";
pub const NEXUS_REQUEST_DURATION_SECONDS: &str = "nexus_request_duration_seconds";
pub const NEXUS_UPSTREAM_HEALTHY: &str = "nexus_upstream_healthy";
pub const NEXUS_RATE_LIMIT_HITS_TOTAL: &str = "nexus_rate_limit_hits_total";
pub const NEXUS_AUTH_FAILURES_TOTAL: &str = "nexus_auth_failures_total";
pub const NEXUS_CIRCUIT_BREAKER_STATE: &str = "nexus_circuit_breaker_state";
pub const NEXUS_CONFIG_RELOADS_TOTAL: &str = "nexus_config_reloads_total";

static PROMETHEUS_HANDLE: OnceCell<PrometheusHandle> = OnceCell::new();

/// Install the Prometheus recorder and register metric descriptions.
/// Idempotent; later calls return the existing handle.
pub fn init_metrics() -> eyre::Result<PrometheusHandle> {
    if let Some(handle) = PROMETHEUS_HANDLE.get() {
        return Ok(handle.clone());
    }

    let handle = PrometheusBuilder::new()
        .install_recorder()
        .map_err(|e| eyre::eyre!("Failed to install Prometheus recorder: {e}"))?;
    let _ = PROMETHEUS_HANDLE.set(handle.clone());

    describe_counter!(
        NEXUS_REQUESTS_TOTAL,
        Unit::Count,
        "Total number of HTTP requests processed by the gateway."
    );
    describe_histogram!(
        NEXUS_REQUEST_DURATION_SECONDS,
        Unit::Seconds,
        "Latency of HTTP requests processed by the gateway."
    );
    describe_gauge!(
        NEXUS_UPSTREAM_HEALTHY,
        "Whether an upstream endpoint is healthy (1) or not (0)."
    );
    describe_counter!(
        NEXUS_RATE_LIMIT_HITS_TOTAL,
        Unit::Count,
        "Requests rejected by the rate limiter."
    );
    describe_counter!(
        NEXUS_AUTH_FAILURES_TOTAL,
        Unit::Count,
        "Requests rejected by authentication."
    );
    describe_gauge!(
        NEXUS_CIRCUIT_BREAKER_STATE,
        "Circuit breaker state per cluster (1 on the active state label)."
    );
    describe_counter!(
        NEXUS_CONFIG_RELOADS_TOTAL,
        Unit::Count,
        "Configuration reload attempts by result."
    );

    tracing::info!("Prometheus metrics recorder installed");
    Ok(handle)
}

/// Render the current metrics in Prometheus exposition format. Empty string
/// until `init_metrics` has run.
pub fn render() -> String {
    PROMETHEUS_HANDLE
        .get()
        .map(|h| h.render())
        .unwrap_or_default()
}

/// Record a completed inbound request.
pub fn record_request(method: &str, route: &str, status: u16, duration: Duration) {
    counter!(
        NEXUS_REQUESTS_TOTAL,
        "method" => method.to_string(),
        "route" => route.to_string(),
        "status" => status.to_string()
    )
    .increment(1);
    histogram!(
        NEXUS_REQUEST_DURATION_SECONDS,
        "method" => method.to_string(),
        "route" => route.to_string()
    )
    .record(duration.as_secs_f64());
}

/// Set the health gauge for one endpoint of a cluster.
pub fn set_upstream_healthy(cluster: &str, endpoint: &str, healthy: bool) {
    gauge!(
        NEXUS_UPSTREAM_HEALTHY,
        "cluster" => cluster.to_string(),
        "endpoint" => endpoint.to_string()
    )
    .set(if healthy { 1.0 } else { 0.0 });
}

/// Count a rate-limit rejection for a key.
pub fn record_rate_limit_hit(key: &str) {
    counter!(NEXUS_RATE_LIMIT_HITS_TOTAL, "key" => key.to_string()).increment(1);
}

/// Count an authentication failure by reason.
pub fn record_auth_failure(reason: &str) {
    counter!(NEXUS_AUTH_FAILURES_TOTAL, "reason" => reason.to_string()).increment(1);
}

/// Mark `state` as the active breaker state for a cluster; the other state
/// labels drop to 0 so dashboards can sum over the family.
pub fn set_breaker_state(cluster: &str, state: BreakerState) {
    for candidate in [
        BreakerState::Closed,
        BreakerState::Open,
        BreakerState::HalfOpen,
    ] {
        gauge!(
            NEXUS_CIRCUIT_BREAKER_STATE,
            "cluster" => cluster.to_string(),
            "state" => candidate.to_string()
        )
        .set(if candidate == state { 1.0 } else { 0.0 });
    }
}

/// Count a configuration reload attempt.
pub fn record_config_reload(success: bool) {
    let result = if success { "success" } else { "failure" };
    counter!(NEXUS_CONFIG_RELOADS_TOTAL, "result" => result).increment(1);
}
