// Metrics module for observability
// Describes the service metrics and installs the Prometheus recorder

use std::time::{Duration, Instant};

use metrics::{counter, describe_counter, describe_histogram, histogram};
use metrics_exporter_prometheus::{PrometheusBuilder, PrometheusHandle};

/// Install the Prometheus recorder and describe all metrics.
/// Should be called once at application startup.
pub fn init_metrics() -> anyhow::Result<PrometheusHandle> {
    let handle = PrometheusBuilder::new().install_recorder()?;
    describe_metrics();
    tracing::info!("Metrics initialized");
    Ok(handle)
}

/// Periodically drains histogram buckets held by the Prometheus recorder
pub fn spawn_upkeep(handle: PrometheusHandle, period: Duration) -> tokio::task::JoinHandle<()> {
    tokio::spawn(async move {
        let mut interval = tokio::time::interval(period);
        loop {
            interval.tick().await;
            handle.run_upkeep();
        }
    })
}

pub fn describe_metrics() {
    // HTTP request metrics
    describe_counter!(
        "http_requests_total",
        "Total number of HTTP requests received"
    );
    describe_histogram!(
        "http_request_duration_seconds",
        "HTTP request duration in seconds"
    );

    // Checker metrics
    describe_counter!(
        "msgfilter_checks_total",
        "Duplicate checks by outcome (novel, duplicate, error)"
    );
    describe_histogram!(
        "msgfilter_lock_acquire_seconds",
        "Time spent acquiring a payload lock"
    );
    describe_counter!(
        "msgfilter_lock_failures_total",
        "Lock acquisitions that gave up"
    );
    describe_counter!(
        "msgfilter_unlock_failures_total",
        "Lock releases that failed after all retries"
    );
}

/// Record an HTTP request
pub fn record_http_request(method: &str, path: &str, status: u16, duration_secs: f64) {
    counter!("http_requests_total", "method" => method.to_string(), "path" => path.to_string(), "status" => status.to_string()).increment(1);
    histogram!("http_request_duration_seconds", "method" => method.to_string(), "path" => path.to_string()).record(duration_secs);
}

/// Timer helper for measuring operation duration
pub struct Timer {
    start: Instant,
}

impl Timer {
    pub fn new() -> Self {
        Self {
            start: Instant::now(),
        }
    }

    pub fn elapsed_secs(&self) -> f64 {
        self.start.elapsed().as_secs_f64()
    }
}

impl Default for Timer {
    fn default() -> Self {
        Self::new()
    }
}
