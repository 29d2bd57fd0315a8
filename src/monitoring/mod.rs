//! Optional Prometheus exporter for the hot-path counters.

use anyhow::Result;
use metrics_exporter_prometheus::PrometheusBuilder;
use std::net::SocketAddr;
use tracing::info;

/// Install the Prometheus recorder with an HTTP listener on `addr`.
/// Counters registered here are incremented throughout the proxy whether
/// or not the exporter is running; without it they are no-ops.
pub fn init(addr: SocketAddr) -> Result<()> {
    PrometheusBuilder::new()
        .with_http_listener(addr)
        .install()?;
    describe_metrics();
    info!("Metrics exporter listening on {}", addr);
    Ok(())
}

fn describe_metrics() {
    metrics::describe_counter!(
        "mirrorgate_requests_total",
        "Requests forwarded to an upstream mirror"
    );
    metrics::describe_counter!(
        "mirrorgate_bytes_out_total",
        "Response bytes relayed to clients"
    );
    metrics::describe_counter!(
        "mirrorgate_traffic_queue_dropped_total",
        "Traffic records shed because the accounting queue was full"
    );
    metrics::describe_counter!(
        "mirrorgate_probe_failures_total",
        "Health probes that failed or timed out"
    );
    metrics::describe_counter!(
        "mirrorgate_token_fetches_total",
        "Bearer tokens fetched from upstream auth realms"
    );
}
