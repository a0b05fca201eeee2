//! Prometheus metrics helpers for tally.
//!
//! # Usage
//!
//! ```rust,ignore
//! use tally_core::metrics::{init_metrics, start_metrics_server};
//!
//! let handle = init_metrics();
//! start_metrics_server(9090, handle).await?;
//! ```
//!
//! # Metric Naming Conventions
//!
//! - Prefix: component (`ingest_`, `aggregator_`, `publish_`, `notify_`)
//! - Suffix: `_total` for counters
//! - Labels: only small closed sets (`sink`, `outcome`)

use axum::{Router, routing::get};
use metrics::{describe_counter, describe_gauge};
use metrics_exporter_prometheus::{PrometheusBuilder, PrometheusHandle};
use std::net::SocketAddr;

/// Initialize the Prometheus metrics recorder.
///
/// Must be called once at startup before any metrics are recorded.
///
/// # Panics
///
/// Panics if a recorder is already installed.
pub fn init_metrics() -> PrometheusHandle {
    let handle = PrometheusBuilder::new()
        .install_recorder()
        .expect("Failed to install Prometheus recorder");

    register_metrics();

    handle
}

/// Like [`init_metrics`] but returns `None` if a recorder is already installed.
pub fn try_init_metrics() -> Option<PrometheusHandle> {
    PrometheusBuilder::new().install_recorder().ok()
}

/// Serve `/metrics` on `port` from a background task.
pub async fn start_metrics_server(
    port: u16,
    handle: PrometheusHandle,
) -> Result<(), std::io::Error> {
    let app = Router::new().route(
        "/metrics",
        get(move || {
            let handle = handle.clone();
            async move { handle.render() }
        }),
    );

    let addr = SocketAddr::from(([0, 0, 0, 0], port));
    let listener = tokio::net::TcpListener::bind(addr).await?;
    tracing::info!("Metrics server listening on http://{}/metrics", addr);

    tokio::spawn(async move {
        if let Err(e) = axum::serve(listener, app).await {
            tracing::error!(error = %e, "metrics server stopped");
        }
    });

    Ok(())
}

fn register_metrics() {
    // Ingest
    describe_counter!(
        "ingest_accepted_total",
        "Ingest requests whose id was written to the window"
    );
    describe_counter!(
        "ingest_failed_total",
        "Ingest requests answered with \"failed\" because the store errored"
    );

    // Aggregator
    describe_counter!("aggregator_cycles_total", "Flush cycles started");
    describe_counter!(
        "aggregator_cycle_errors_total",
        "Flush cycles that could not read the window"
    );
    describe_gauge!(
        "aggregator_last_count",
        "Distinct id count of the most recently flushed window"
    );

    // Delivery
    describe_counter!(
        "publish_total",
        "Flushed counts by destination (label: sink = queue | log | failed)"
    );
    describe_counter!(
        "notify_requests_total",
        "Callback notifications by result (label: outcome = success | failure)"
    );
}
