/// Prometheus metrics for the test user service
///
/// Covers account issuance, verification waits, assertion issuance,
/// the expiry sweep and HTTP traffic.

use lazy_static::lazy_static;
use prometheus::{
    register_histogram_vec, register_int_counter_vec, register_int_gauge, Encoder, HistogramVec,
    IntCounterVec, IntGauge, TextEncoder,
};

lazy_static! {
    // ========== HTTP Metrics ==========

    /// Total HTTP requests by method, path, and status
    pub static ref HTTP_REQUESTS_TOTAL: IntCounterVec = register_int_counter_vec!(
        "ptu_http_requests_total",
        "Total number of HTTP requests",
        &["method", "path", "status"]
    )
    .unwrap();

    /// HTTP request duration in seconds
    pub static ref HTTP_REQUEST_DURATION_SECONDS: HistogramVec = register_histogram_vec!(
        "ptu_http_request_duration_seconds",
        "HTTP request latencies in seconds",
        &["method", "path"],
        vec![0.001, 0.005, 0.01, 0.05, 0.1, 0.25, 0.5, 1.0, 2.5, 5.0, 10.0]
    )
    .unwrap();

    // ========== Account Metrics ==========

    /// Accounts allocated by environment and verification mode
    pub static ref ACCOUNTS_ALLOCATED_TOTAL: IntCounterVec = register_int_counter_vec!(
        "ptu_accounts_allocated_total",
        "Total number of test accounts allocated",
        &["env", "verify"]
    )
    .unwrap();

    /// Verification waits by outcome
    pub static ref VERIFICATIONS_TOTAL: IntCounterVec = register_int_counter_vec!(
        "ptu_verifications_total",
        "Total number of verification waits",
        &["env", "outcome"]
    )
    .unwrap();

    /// Time spent waiting for verification
    pub static ref VERIFICATION_WAIT_SECONDS: HistogramVec = register_histogram_vec!(
        "ptu_verification_wait_seconds",
        "Time spent waiting for account verification in seconds",
        &["env"],
        vec![0.05, 0.1, 0.25, 0.5, 1.0, 2.0, 3.0, 4.0, 5.0, 10.0]
    )
    .unwrap();

    /// Cancellations by outcome
    pub static ref CANCELLATIONS_TOTAL: IntCounterVec = register_int_counter_vec!(
        "ptu_cancellations_total",
        "Total number of account cancellations",
        &["outcome"]
    )
    .unwrap();

    /// Accounts retired by the expiry sweep
    pub static ref ACCOUNTS_SWEPT_TOTAL: IntCounterVec = register_int_counter_vec!(
        "ptu_accounts_swept_total",
        "Total number of accounts retired by the expiry sweep",
        &["status"]
    )
    .unwrap();

    /// Emails currently marked ready
    pub static ref AVAILABILITY_TABLE_SIZE: IntGauge = register_int_gauge!(
        "ptu_availability_table_size",
        "Number of emails currently marked ready for verification"
    )
    .unwrap();

    // ========== Assertion Metrics ==========

    /// Assertions issued by outcome
    pub static ref ASSERTIONS_TOTAL: IntCounterVec = register_int_counter_vec!(
        "ptu_assertions_total",
        "Total number of assertion requests",
        &["outcome"]
    )
    .unwrap();

    // ========== Background Job Metrics ==========

    /// Background job executions by job type and status
    pub static ref BACKGROUND_JOBS_TOTAL: IntCounterVec = register_int_counter_vec!(
        "ptu_background_jobs_total",
        "Total number of background job executions",
        &["job_type", "status"]
    )
    .unwrap();
}

/// Render metrics in Prometheus text format
pub fn render_metrics() -> String {
    let encoder = TextEncoder::new();
    let metric_families = prometheus::gather();
    let mut buffer = Vec::new();
    if let Err(e) = encoder.encode(&metric_families, &mut buffer) {
        tracing::error!("Failed to encode metrics: {}", e);
    }
    String::from_utf8(buffer).unwrap_or_default()
}

/// Record an HTTP request
pub fn record_http_request(method: &str, path: &str, status: u16, duration: f64) {
    HTTP_REQUESTS_TOTAL
        .with_label_values(&[method, path, &status.to_string()])
        .inc();
    HTTP_REQUEST_DURATION_SECONDS
        .with_label_values(&[method, path])
        .observe(duration);
}

/// Record an account allocation
pub fn record_account_allocated(env: &str, do_verify: bool) {
    ACCOUNTS_ALLOCATED_TOTAL
        .with_label_values(&[env, if do_verify { "yes" } else { "no" }])
        .inc();
}

/// Record the end of a verification wait
pub fn record_verification(env: &str, ready: bool, waited: f64) {
    VERIFICATIONS_TOTAL
        .with_label_values(&[env, if ready { "ready" } else { "timeout" }])
        .inc();
    VERIFICATION_WAIT_SECONDS
        .with_label_values(&[env])
        .observe(waited);
}

/// Record a cancellation attempt
pub fn record_cancellation(success: bool) {
    CANCELLATIONS_TOTAL
        .with_label_values(&[if success { "success" } else { "failure" }])
        .inc();
}

/// Record an assertion request
pub fn record_assertion(success: bool) {
    ASSERTIONS_TOTAL
        .with_label_values(&[if success { "success" } else { "failure" }])
        .inc();
}

/// Record accounts retired by a sweep
pub fn record_accounts_swept(count: usize) {
    ACCOUNTS_SWEPT_TOTAL
        .with_label_values(&["retired"])
        .inc_by(count as u64);
}

/// Record a background job execution
pub fn record_background_job(job_type: &str, status: &str) {
    BACKGROUND_JOBS_TOTAL
        .with_label_values(&[job_type, status])
        .inc();
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_record_http_request() {
        record_http_request("GET", "/email/dev", 200, 0.05);
        let metrics = render_metrics();
        assert!(metrics.contains("ptu_http_requests_total"));
        assert!(metrics.contains("ptu_http_request_duration_seconds"));
    }

    #[test]
    fn test_record_account_lifecycle() {
        record_account_allocated("dev", true);
        record_verification("dev", true, 0.35);
        record_verification("dev", false, 5.0);
        record_cancellation(true);

        let metrics = render_metrics();
        assert!(metrics.contains("ptu_accounts_allocated_total"));
        assert!(metrics.contains("ptu_verifications_total"));
        assert!(metrics.contains("ptu_verification_wait_seconds"));
        assert!(metrics.contains("ptu_cancellations_total"));
    }

    #[test]
    fn test_record_assertion_and_sweep() {
        record_assertion(false);
        record_accounts_swept(3);
        record_background_job("expiry_sweep", "success");

        let metrics = render_metrics();
        assert!(metrics.contains("ptu_assertions_total"));
        assert!(metrics.contains("ptu_accounts_swept_total"));
        assert!(metrics.contains("ptu_background_jobs_total"));
    }
}
