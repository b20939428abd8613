//! Prometheus Metrics for the procgate engine
//!
//! Exports metrics for:
//! - Pool slot utilization per location
//! - Request outcomes and latency
//! - Call adaptation and stale-session retries
//! - Upload/download volume

use crate::pool::SlotCounts;
use crate::pool::SlotState;
use once_cell::sync::Lazy;
use prometheus::{
    register_counter_vec, register_histogram_vec, register_int_gauge_vec, CounterVec, Encoder,
    HistogramVec, IntGaugeVec, TextEncoder,
};

// ═══════════════════════════════════════════════════════════════════════════
// POOL METRICS
// ═══════════════════════════════════════════════════════════════════════════

/// Pool slots by location and state
pub static POOL_SLOTS: Lazy<IntGaugeVec> = Lazy::new(|| {
    register_int_gauge_vec!(
        "procgate_pool_slots",
        "Pool slots by lock state",
        &["location", "state"]
    )
    .unwrap()
});

/// Acquisitions that found no free slot within the wait
pub static POOL_EXHAUSTED_TOTAL: Lazy<CounterVec> = Lazy::new(|| {
    register_counter_vec!(
        "procgate_pool_exhausted_total",
        "Acquisitions that timed out waiting for a slot",
        &["location"]
    )
    .unwrap()
});

/// Sessions closed by idle purge
pub static SESSIONS_PURGED_TOTAL: Lazy<CounterVec> = Lazy::new(|| {
    register_counter_vec!(
        "procgate_sessions_purged_total",
        "Idle sessions closed by the pool purge",
        &["location"]
    )
    .unwrap()
});

// ═══════════════════════════════════════════════════════════════════════════
// REQUEST METRICS
// ═══════════════════════════════════════════════════════════════════════════

/// Requests by location and outcome
pub static REQUESTS_TOTAL: Lazy<CounterVec> = Lazy::new(|| {
    register_counter_vec!(
        "procgate_requests_total",
        "Total requests by outcome",
        &["location", "outcome"]
    )
    .unwrap()
});

/// Request latency by location
pub static REQUEST_LATENCY_SECONDS: Lazy<HistogramVec> = Lazy::new(|| {
    register_histogram_vec!(
        "procgate_request_latency_seconds",
        "Request latency in seconds",
        &["location", "outcome"],
        vec![0.005, 0.01, 0.025, 0.05, 0.1, 0.25, 0.5, 1.0, 2.5, 5.0, 10.0, 30.0]
    )
    .unwrap()
});

/// Calls rebuilt after a shape mismatch
pub static ADAPTATION_RETRIES_TOTAL: Lazy<CounterVec> = Lazy::new(|| {
    register_counter_vec!(
        "procgate_adaptation_retries_total",
        "Calls retried after describe-based shape adaptation",
        &["location", "result"]
    )
    .unwrap()
});

/// Reconnects after a stale pooled session
pub static STALE_RETRIES_TOTAL: Lazy<CounterVec> = Lazy::new(|| {
    register_counter_vec!(
        "procgate_stale_retries_total",
        "Requests retried on a fresh session after a stale pooled one failed",
        &["location"]
    )
    .unwrap()
});

// ═══════════════════════════════════════════════════════════════════════════
// TRANSFER METRICS
// ═══════════════════════════════════════════════════════════════════════════

/// Uploaded bytes by destination
pub static UPLOAD_BYTES_TOTAL: Lazy<CounterVec> = Lazy::new(|| {
    register_counter_vec!(
        "procgate_upload_bytes_total",
        "File bytes received in multipart uploads",
        &["target"]
    )
    .unwrap()
});

/// Downloaded bytes by source
pub static DOWNLOAD_BYTES_TOTAL: Lazy<CounterVec> = Lazy::new(|| {
    register_counter_vec!(
        "procgate_download_bytes_total",
        "Response body bytes written",
        &["source"]
    )
    .unwrap()
});

/// Encode all metrics as Prometheus text format
pub fn encode_metrics() -> String {
    let encoder = TextEncoder::new();
    let metric_families = prometheus::gather();
    let mut buffer = Vec::new();
    if let Err(e) = encoder.encode(&metric_families, &mut buffer) {
        tracing::warn!("Failed to encode metrics: {}", e);
    }
    String::from_utf8_lossy(&buffer).into_owned()
}

/// Publish the slot counts of a location
pub fn record_pool_counts(location: &str, counts: &SlotCounts) {
    for state in SlotState::ALL {
        POOL_SLOTS
            .with_label_values(&[location, state.label()])
            .set(i64::from(counts.get(state)));
    }
}

pub fn record_pool_exhausted(location: &str) {
    POOL_EXHAUSTED_TOTAL.with_label_values(&[location]).inc();
}

pub fn record_sessions_purged(location: &str, count: usize) {
    SESSIONS_PURGED_TOTAL
        .with_label_values(&[location])
        .inc_by(count as f64);
}

/// Record request completion
pub fn record_request(location: &str, outcome: &str, duration_secs: f64) {
    REQUESTS_TOTAL.with_label_values(&[location, outcome]).inc();
    REQUEST_LATENCY_SECONDS
        .with_label_values(&[location, outcome])
        .observe(duration_secs);
}

/// Record an adaptation retry and whether the rebuilt call succeeded
pub fn record_adaptation(location: &str, succeeded: bool) {
    let result = if succeeded { "success" } else { "fatal" };
    ADAPTATION_RETRIES_TOTAL
        .with_label_values(&[location, result])
        .inc();
}

pub fn record_stale_retry(location: &str) {
    STALE_RETRIES_TOTAL.with_label_values(&[location]).inc();
}

pub fn record_upload_bytes(target: &str, bytes: u64) {
    UPLOAD_BYTES_TOTAL.with_label_values(&[target]).inc_by(bytes as f64);
}

pub fn record_download_bytes(source: &str, bytes: u64) {
    DOWNLOAD_BYTES_TOTAL.with_label_values(&[source]).inc_by(bytes as f64);
}
