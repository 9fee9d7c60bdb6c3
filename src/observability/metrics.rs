//! Metrics collection and exposition.
//!
//! # Metrics
//! - `edge_requests_total` (counter): requests by vhost, status
//! - `edge_request_duration_seconds` (histogram): latency by vhost
//! - `edge_cache_total` (counter): cache lookups by result (hit, miss, store)
//! - `edge_challenges_total` (counter): challenges by outcome (issued, passed)
//! - `edge_ip_blocks_total` (counter): block requests sent to the firewall
//! - `edge_upstream_errors_total` (counter): upstream failures by kind
//! - `edge_upstream_health` (gauge): 1=up, 0=down per pool member
//! - `edge_background_dropped_total` (counter): jobs dropped by kind
//!
//! # Design Decisions
//! - Recording goes through the `metrics` facade; without an installed
//!   recorder every call is a no-op
//! - Labels are low-cardinality (vhost names, not paths or client IPs)

use std::net::SocketAddr;
use std::time::Duration;

use metrics::{counter, gauge, histogram};
use metrics_exporter_prometheus::PrometheusBuilder;

/// Install the Prometheus recorder and its scrape endpoint.
///
/// Must be called from within a Tokio runtime.
pub fn init_metrics(addr: SocketAddr) {
    match PrometheusBuilder::new().with_http_listener(addr).install() {
        Ok(()) => tracing::info!(address = %addr, "Metrics endpoint started"),
        Err(e) => tracing::error!(address = %addr, error = %e, "Failed to install metrics exporter"),
    }
}

pub fn record_request(vhost: &str, status: u16, elapsed: Duration) {
    counter!(
        "edge_requests_total",
        "vhost" => vhost.to_string(),
        "status" => status.to_string()
    )
    .increment(1);
    histogram!("edge_request_duration_seconds", "vhost" => vhost.to_string())
        .record(elapsed.as_secs_f64());
}

pub fn record_cache(result: &'static str) {
    counter!("edge_cache_total", "result" => result).increment(1);
}

pub fn record_challenge(vhost: &str, outcome: &'static str) {
    counter!(
        "edge_challenges_total",
        "vhost" => vhost.to_string(),
        "outcome" => outcome
    )
    .increment(1);
}

pub fn record_ip_block() {
    counter!("edge_ip_blocks_total").increment(1);
}

pub fn record_upstream_error(kind: &'static str) {
    counter!("edge_upstream_errors_total", "kind" => kind).increment(1);
}

pub fn record_upstream_health(origin: &str, up: bool) {
    gauge!("edge_upstream_health", "origin" => origin.to_string()).set(if up { 1.0 } else { 0.0 });
}

pub fn record_task_dropped(kind: &'static str) {
    counter!("edge_background_dropped_total", "kind" => kind).increment(1);
}
