// src/observability/mod.rs
//! Tracing and metrics initialization
//!
//! Structured logging via `tracing-subscriber` (env-filtered, optional JSON
//! output) and a Prometheus scrape endpoint via `metrics-exporter-prometheus`.

use anyhow::Result;
use metrics::{describe_counter, describe_histogram};
use metrics_exporter_prometheus::PrometheusBuilder;
use std::net::SocketAddr;
use tracing_subscriber::EnvFilter;

/// Initialize the tracing subscriber
///
/// Filter comes from `RUST_LOG` (default `info`); set `WARDEN_LOG_JSON=1`
/// for JSON output.
pub fn init_tracing() -> Result<()> {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));

    let json = std::env::var("WARDEN_LOG_JSON")
        .map(|v| v == "1" || v.eq_ignore_ascii_case("true"))
        .unwrap_or(false);

    if json {
        tracing_subscriber::fmt()
            .with_env_filter(filter)
            .json()
            .try_init()
            .map_err(|e| anyhow::anyhow!("tracing init failed: {}", e))?;
    } else {
        tracing_subscriber::fmt()
            .with_env_filter(filter)
            .try_init()
            .map_err(|e| anyhow::anyhow!("tracing init failed: {}", e))?;
    }
    Ok(())
}

/// Install the Prometheus exporter and register metric descriptions
///
/// Must run inside a tokio runtime (the exporter spawns its listener there).
pub fn init_metrics(listen: &str) -> Result<()> {
    let addr: SocketAddr = listen
        .parse()
        .map_err(|e| anyhow::anyhow!("bad metrics listen address '{}': {}", listen, e))?;

    PrometheusBuilder::new()
        .with_http_listener(addr)
        .install()
        .map_err(|e| anyhow::anyhow!("metrics exporter install failed: {}", e))?;

    describe_metrics();
    Ok(())
}

/// Register help text for the engine's metrics
pub fn describe_metrics() {
    describe_counter!("warden_agents_spawned_total", "Agents spawned");
    describe_counter!("warden_operations_total", "Sandboxed operations executed, by outcome");
    describe_counter!("warden_admission_rejects_total", "Operations refused at admission");
    describe_counter!("warden_suspensions_total", "Agents suspended under resource pressure");
    describe_counter!("warden_snapshots_total", "Snapshots captured");
    describe_counter!("warden_agreement_calls_total", "Agreement-mediated calls, by outcome");
    describe_histogram!(
        "warden_operation_duration_ms",
        "Sandboxed operation wall-clock duration in milliseconds"
    );
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_describe_metrics_is_safe_without_recorder() {
        // Describe macros are no-ops without an installed recorder
        describe_metrics();
    }

    #[test]
    fn test_init_metrics_rejects_bad_address() {
        assert!(init_metrics("not-an-address").is_err());
    }
}
