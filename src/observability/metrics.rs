//! Metrics collection and exposition.
//!
//! # Metrics
//! - `stretch_admissions_total` (counter): resolved requests by `outcome`
//! - `stretch_dispatch_delay_seconds` (histogram): computed per-dispatch delay
//! - `stretch_upstream_duration_seconds` (histogram): upstream exchange time
//! - `stretch_tracked_clients` (gauge): clients with live admission state
//!
//! Recording is a no-op until a recorder is installed, so the admission core
//! can record unconditionally.

use metrics::{counter, gauge, histogram};
use metrics_exporter_prometheus::{BuildError, PrometheusBuilder};
use std::net::SocketAddr;
use std::time::Instant;

/// Install the Prometheus recorder and its scrape listener.
pub fn init_metrics(addr: SocketAddr) -> Result<(), BuildError> {
    PrometheusBuilder::new().with_http_listener(addr).install()?;
    tracing::info!(address = %addr, "Metrics endpoint listening");
    Ok(())
}

pub fn record_outcome(outcome: &'static str) {
    counter!("stretch_admissions_total", "outcome" => outcome).increment(1);
}

pub fn record_dispatch_delay(delay_secs: f64) {
    histogram!("stretch_dispatch_delay_seconds").record(delay_secs);
}

pub fn record_upstream_duration(start: Instant) {
    histogram!("stretch_upstream_duration_seconds").record(start.elapsed().as_secs_f64());
}

pub fn record_tracked_clients(count: usize) {
    gauge!("stretch_tracked_clients").set(count as f64);
}
