//! Metric names and the optional Prometheus exporter
//!
//! Recording goes through the `metrics` facade macros at the call sites;
//! without an installed recorder they are no-ops.

use crate::GenerateError;
use metrics::{describe_counter, describe_histogram, Unit};
use metrics_exporter_prometheus::PrometheusBuilder;
use std::net::SocketAddr;
use tracing::info;

pub const REQUESTS: &str = "render_requests_total";
pub const FAILURES: &str = "render_failures_total";
pub const RENDER_DURATION: &str = "render_duration_seconds";
pub const SETTLEMENT_TIMEOUTS: &str = "render_settlement_timeouts_total";
pub const CACHE_HITS: &str = "render_cache_hits_total";
pub const CACHE_MISSES: &str = "render_cache_misses_total";
pub const CACHE_SELF_HEALS: &str = "render_cache_self_heals_total";
pub const CACHE_WRITES: &str = "render_cache_writes_total";
pub const CACHE_WRITES_FAILED: &str = "render_cache_writes_failed_total";

pub fn describe() {
    describe_counter!(REQUESTS, "Generate requests served, labelled by source");
    describe_counter!(FAILURES, "Generate requests that failed, labelled by error kind");
    describe_histogram!(
        RENDER_DURATION,
        Unit::Seconds,
        "Time from cache miss to the caller stream being ready"
    );
    describe_counter!(
        SETTLEMENT_TIMEOUTS,
        "Captures that proceeded with image requests still pending"
    );
    describe_counter!(CACHE_HITS, "Cache lookups served from a blob");
    describe_counter!(CACHE_MISSES, "Cache lookups that fell through to a render");
    describe_counter!(CACHE_SELF_HEALS, "Stale index entries removed on read");
    describe_counter!(CACHE_WRITES, "Blobs written and indexed");
    describe_counter!(CACHE_WRITES_FAILED, "Background cache writes that failed");
}

/// Serve `/metrics` on `addr` for the lifetime of the process.
pub fn install_prometheus(addr: SocketAddr) -> Result<(), GenerateError> {
    PrometheusBuilder::new()
        .with_http_listener(addr)
        .install()
        .map_err(|e| GenerateError::Configuration(format!("metrics exporter: {e}")))?;

    describe();
    info!("Prometheus metrics available on http://{}/metrics", addr);
    Ok(())
}
