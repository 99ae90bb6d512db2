//! Metrics export for relay-tail.
//!
//! The client records through the `metrics` facade; this module describes
//! those metrics and serves them in Prometheus format.

use anyhow::{Context, Result};
use metrics::counter;
use metrics_exporter_prometheus::PrometheusBuilder;
use std::net::SocketAddr;
use tracing::info;

/// Metric names recorded by relay-tail itself.
pub mod names {
    pub const EVENTS_TOTAL: &str = "relay_tail_events_total";
}

/// Initialize the metrics system.
pub fn init_metrics() {
    tenvis_relay_client::metrics::describe();
    metrics::describe_counter!(names::EVENTS_TOTAL, "Events logged, by kind");

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

    info!(%addr, "Metrics server listening");
    Ok(())
}

/// Record a logged event.
pub fn record_event(kind: &'static str) {
    counter!(names::EVENTS_TOTAL, "kind" => kind).increment(1);
}
