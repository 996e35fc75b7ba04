//! Metrics collection and export for hubbub.
//!
//! Uses the `metrics` crate for instrumentation and exports
//! to Prometheus format.

use anyhow::{Context, Result};
use metrics::{counter, gauge};
use metrics_exporter_prometheus::PrometheusBuilder;
use std::net::SocketAddr;
use tracing::info;

/// Metric names.
pub mod names {
    pub const CONNECTIONS_TOTAL: &str = "hubbub_connections_total";
    pub const CONNECTIONS_ACTIVE: &str = "hubbub_connections_active";
    pub const ADMISSIONS_REJECTED: &str = "hubbub_admissions_rejected_total";
    pub const RATE_LIMITED: &str = "hubbub_rate_limited_total";
    pub const EVENTS_PUBLISHED: &str = "hubbub_events_published_total";
    pub const ERRORS_TOTAL: &str = "hubbub_errors_total";
}

/// Initialize the metrics system.
pub fn init_metrics() {
    metrics::describe_counter!(
        names::CONNECTIONS_TOTAL,
        "Total number of streaming connections since server start"
    );
    metrics::describe_gauge!(
        names::CONNECTIONS_ACTIVE,
        "Current number of streaming connections"
    );
    metrics::describe_counter!(
        names::ADMISSIONS_REJECTED,
        "Upgrades refused by the per-address ceiling"
    );
    metrics::describe_counter!(
        names::RATE_LIMITED,
        "Connections closed for exceeding the inbound rate"
    );
    metrics::describe_counter!(names::EVENTS_PUBLISHED, "Events handed to the hub");
    metrics::describe_counter!(names::ERRORS_TOTAL, "Total number of errors");

    info!("Metrics initialized");
}

/// Start the Prometheus metrics server.
///
/// # Errors
///
/// Returns an error if the exporter cannot be installed.
pub fn start_metrics_server(port: u16) -> Result<()> {
    let addr = SocketAddr::from(([0, 0, 0, 0], port));

    PrometheusBuilder::new()
        .with_http_listener(addr)
        .install()
        .context("Failed to install Prometheus exporter")?;

    info!("Metrics server listening on {}", addr);
    Ok(())
}

/// Record a rejected upgrade.
pub fn record_admission_rejected() {
    counter!(names::ADMISSIONS_REJECTED).increment(1);
}

/// Record a rate-limit disconnect.
pub fn record_rate_limited() {
    counter!(names::RATE_LIMITED).increment(1);
}

/// Record a published event.
pub fn record_event(kind: &'static str) {
    counter!(names::EVENTS_PUBLISHED, "kind" => kind).increment(1);
}

/// Record an error.
pub fn record_error(error_type: &'static str) {
    counter!(names::ERRORS_TOTAL, "type" => error_type).increment(1);
}

/// Metrics guard that records disconnection on drop.
pub struct ConnectionMetricsGuard;

impl ConnectionMetricsGuard {
    /// Create a new metrics guard, recording a connection.
    #[must_use]
    pub fn new() -> Self {
        counter!(names::CONNECTIONS_TOTAL).increment(1);
        gauge!(names::CONNECTIONS_ACTIVE).increment(1.0);
        Self
    }
}

impl Default for ConnectionMetricsGuard {
    fn default() -> Self {
        Self::new()
    }
}

impl Drop for ConnectionMetricsGuard {
    fn drop(&mut self) {
        gauge!(names::CONNECTIONS_ACTIVE).decrement(1.0);
    }
}
