//! Metrics module
//!
//! Provides Prometheus metrics for the upload engine and the HTTP layer.

use lazy_static::lazy_static;
use prometheus::{
    register_counter, register_counter_vec, register_histogram, register_histogram_vec, Counter,
    CounterVec, Encoder, Histogram, HistogramVec, TextEncoder,
};

lazy_static! {
    // Upload lifecycle metrics
    pub static ref UPLOADS_CREATED: Counter = register_counter!(
        "tus_uploads_created_total",
        "Total number of uploads created"
    ).unwrap();

    pub static ref UPLOADS_COMPLETED: Counter = register_counter!(
        "tus_uploads_completed_total",
        "Total number of uploads that reached their declared length"
    ).unwrap();

    pub static ref UPLOAD_SIZE: Histogram = register_histogram!(
        "tus_upload_size_bytes",
        "Size of completed uploads in bytes",
        vec![1024.0, 65536.0, 1048576.0, 16777216.0, 134217728.0, 1073741824.0, 8589934592.0]
    ).unwrap();

    pub static ref UPLOADS_EXPIRED: Counter = register_counter!(
        "tus_uploads_expired_total",
        "Total number of unfinished uploads removed by the expiry sweeper"
    ).unwrap();

    pub static ref UPLOAD_BYTES_TOTAL: Counter = register_counter!(
        "tus_upload_bytes_total",
        "Total bytes committed to upload storage"
    ).unwrap();

    pub static ref OFFSET_CONFLICTS: Counter = register_counter!(
        "tus_offset_conflicts_total",
        "Chunks rejected because the client offset was stale"
    ).unwrap();

    pub static ref HOOK_FAILURES: Counter = register_counter!(
        "tus_hook_failures_total",
        "Completion hook invocations that failed"
    ).unwrap();

    // HTTP metrics
    pub static ref REQUEST_DURATION: HistogramVec = register_histogram_vec!(
        "tus_request_duration_seconds",
        "Request duration in seconds",
        &["method", "status"],
        vec![0.001, 0.005, 0.01, 0.05, 0.1, 0.5, 1.0, 5.0, 10.0, 60.0]
    ).unwrap();

    // Error metrics
    pub static ref ERRORS_TOTAL: CounterVec = register_counter_vec!(
        "tus_errors_total",
        "Total errors",
        &["type"]
    ).unwrap();
}

pub fn record_upload_created() {
    UPLOADS_CREATED.inc();
}

/// Record a finished upload of `bytes` total size
pub fn record_upload_completed(bytes: u64) {
    UPLOADS_COMPLETED.inc();
    UPLOAD_SIZE.observe(bytes as f64);
}

pub fn record_upload_expired() {
    UPLOADS_EXPIRED.inc();
}

/// Record bytes committed by one append
pub fn record_chunk_written(bytes: u64) {
    UPLOAD_BYTES_TOTAL.inc_by(bytes as f64);
}

pub fn record_offset_conflict() {
    OFFSET_CONFLICTS.inc();
}

pub fn record_hook_failure() {
    HOOK_FAILURES.inc();
}

/// Record how long a request took and how it ended
pub fn record_request(method: &str, status: u16, duration_secs: f64) {
    let status = status.to_string();
    REQUEST_DURATION
        .with_label_values(&[method_label(method), status.as_str()])
        .observe(duration_secs);
}

/// Fixed label set for request methods; anything else is "OTHER"
fn method_label(method: &str) -> &'static str {
    match method {
        "GET" => "GET",
        "HEAD" => "HEAD",
        "POST" => "POST",
        "PATCH" => "PATCH",
        "DELETE" => "DELETE",
        "OPTIONS" => "OPTIONS",
        _ => "OTHER",
    }
}

/// Record an error
pub fn record_error(error_type: &str) {
    ERRORS_TOTAL.with_label_values(&[error_type]).inc();
}

/// Render every registered metric in the Prometheus text format
pub fn render() -> Result<(String, String), prometheus::Error> {
    let encoder = TextEncoder::new();
    let mut buffer = Vec::new();
    encoder.encode(&prometheus::gather(), &mut buffer)?;
    let body = String::from_utf8_lossy(&buffer).into_owned();
    Ok((encoder.format_type().to_string(), body))
}
