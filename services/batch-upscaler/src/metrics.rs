//! Prometheus metrics exposition
//!
//! The library crates record through the `metrics` facade; this module
//! installs the exporter that renders them on `/metrics`:
//!
//! - `enhance_jobs_finished_total` (counter): label `outcome`
//! - `enhance_job_duration_seconds` (histogram): label `outcome`
//! - `enhance_job_attempt_failures_total` (counter): label `class`
//! - `enhance_credentials_rate_limited_total` (counter)
//! - `enhance_active_jobs` (gauge)
//! - `enhance_credentials_available` (gauge)

use metrics_exporter_prometheus::{Matcher, PrometheusBuilder, PrometheusHandle};

/// Job wall-clock durations range from a few seconds (images) to the full
/// status-check budget of a long video.
const JOB_DURATION_BUCKETS: &[f64] = &[
    5.0, 15.0, 30.0, 60.0, 120.0, 300.0, 600.0, 1200.0, 1800.0, 3600.0,
];

fn builder() -> PrometheusBuilder {
    PrometheusBuilder::new()
        .set_buckets_for_metric(
            Matcher::Full("enhance_job_duration_seconds".to_string()),
            JOB_DURATION_BUCKETS,
        )
        .expect("failed to set histogram buckets")
}

/// Install the Prometheus recorder and return a handle for rendering metrics.
pub fn install_recorder() -> PrometheusHandle {
    builder()
        .install_recorder()
        .expect("failed to install Prometheus recorder")
}

/// Record the number of credentials currently eligible for selection.
pub fn set_credentials_available(count: usize) {
    metrics::gauge!("enhance_credentials_available").set(count as f64);
}
