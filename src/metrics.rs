// src/metrics.rs

#[cfg(feature = "observability")]
pub use metrics::{
    counter, describe_counter, describe_gauge, describe_histogram, gauge, histogram,
    increment_counter, Unit,
};

// NOTE: When observability feature is disabled, provide stub implementations
#[cfg(not(feature = "observability"))]
pub enum Unit {}

// Macros for metrics when observability is disabled
#[cfg(not(feature = "observability"))]
#[macro_export]
macro_rules! counter {
    ($name:expr, $value:expr $(, $label:expr => $label_value:expr)* $(,)?) => {};
    ($name:expr $(, $label:expr => $label_value:expr)* $(,)?) => {};
}

#[cfg(not(feature = "observability"))]
#[macro_export]
macro_rules! gauge {
    ($name:expr, $value:expr $(, $label:expr => $label_value:expr)* $(,)?) => {};
}

#[cfg(not(feature = "observability"))]
#[macro_export]
macro_rules! histogram {
    ($name:expr, $value:expr $(, $label:expr => $label_value:expr)* $(,)?) => {};
}

#[cfg(not(feature = "observability"))]
#[macro_export]
macro_rules! increment_counter {
    ($name:expr $(, $label:expr => $label_value:expr)* $(,)?) => {};
}

#[cfg(not(feature = "observability"))]
#[macro_export]
macro_rules! describe_counter {
    ($name:expr, $unit:expr, $desc:expr) => {};
    ($name:expr, $desc:expr) => {};
}

#[cfg(not(feature = "observability"))]
#[macro_export]
macro_rules! describe_gauge {
    ($name:expr, $desc:expr) => {};
}

#[cfg(not(feature = "observability"))]
#[macro_export]
macro_rules! describe_histogram {
    ($name:expr, $unit:expr, $desc:expr) => {};
    ($name:expr, $desc:expr) => {};
}

#[cfg(not(feature = "observability"))]
use crate::{
    counter, describe_counter, describe_gauge, describe_histogram, gauge, histogram,
    increment_counter,
};

/// Registers descriptions for every metric emitted by the engine.
/// Call once at startup, before the first refresh.
pub fn describe_metrics() {
    describe_counter!(
        "balance_cache_hits_total",
        Unit::Count,
        "Token records served from the freshness cache, labeled by cache."
    );
    describe_counter!(
        "balance_cache_miss_total",
        Unit::Count,
        "Token lookups that required a contract read (stale, absent or owner mismatch)."
    );
    describe_gauge!("balance_cache_size_gauge", "Entries currently held by the freshness cache.");
    describe_counter!(
        "multicall_batches_total",
        Unit::Count,
        "Batched aggregate3 requests issued, labeled by chain."
    );
    describe_histogram!(
        "multicall_batch_size_bucket",
        Unit::Count,
        "Number of contract reads per batched request."
    );
    describe_counter!(
        "chain_fetch_failed_total",
        Unit::Count,
        "Chunk fetches that failed after retries, labeled by chain."
    );
    describe_counter!(
        "refresh_superseded_total",
        Unit::Count,
        "Refresh invocations whose results were discarded because a newer one started."
    );
    describe_histogram!(
        "refresh_duration_seconds",
        Unit::Seconds,
        "Wall time of a full refresh invocation."
    );
}

/// Installs the Prometheus exporter on `addr` (e.g. `0.0.0.0:9000`).
#[cfg(feature = "observability")]
pub fn install_prometheus_exporter(addr: std::net::SocketAddr) -> anyhow::Result<()> {
    metrics_exporter_prometheus::PrometheusBuilder::new()
        .with_http_listener(addr)
        .install()?;
    describe_metrics();
    Ok(())
}

// --- Helper functions to update metrics ---

pub fn increment_cache_hit(cache_name: &str) {
    counter!("balance_cache_hits_total", 1, "cache" => cache_name.to_string());
}

pub fn increment_cache_miss(cache_name: &str) {
    counter!("balance_cache_miss_total", 1, "cache" => cache_name.to_string());
}

pub fn set_cache_size(cache_name: &str, size: f64) {
    gauge!("balance_cache_size_gauge", size, "cache" => cache_name.to_string());
}

pub fn increment_multicall_batches(chain_id: u64) {
    increment_counter!("multicall_batches_total", "chain" => chain_id.to_string());
}

pub fn record_multicall_batch_size(size: f64) {
    histogram!("multicall_batch_size_bucket", size);
}

pub fn increment_chain_fetch_failed(chain_id: u64) {
    counter!("chain_fetch_failed_total", 1, "chain" => chain_id.to_string());
}

pub fn increment_refresh_superseded() {
    increment_counter!("refresh_superseded_total");
}

pub fn record_refresh_duration(duration: std::time::Duration) {
    histogram!("refresh_duration_seconds", duration.as_secs_f64());
}
