use metrics::{counter, describe_counter, describe_histogram, histogram, Unit};
use metrics_exporter_prometheus::{PrometheusBuilder, PrometheusHandle};
use std::sync::OnceLock;
use std::time::Instant;

static METRICS_HANDLE: OnceLock<PrometheusHandle> = OnceLock::new();

/// Global metrics instance.
pub static METRICS: OnceLock<Metrics> = OnceLock::new();

/// Metrics collector for the idempotency coordinator.
#[derive(Debug, Clone)]
pub struct Metrics {
    initialized: bool,
}

impl Default for Metrics {
    fn default() -> Self {
        Self::new()
    }
}

impl Metrics {
    pub fn new() -> Self {
        Self { initialized: true }
    }

    /// `outcome` is one of `executed`, `replayed`, or an error kind.
    pub fn record_execution(&self, backend: &str, outcome: &str) {
        counter!("idempotency_executions_total", "backend" => backend.to_string(), "outcome" => outcome.to_string()).increment(1);
    }

    pub fn record_claim(&self, backend: &str) {
        counter!("idempotency_claims_total", "backend" => backend.to_string()).increment(1);
    }

    pub fn record_fingerprint_conflict(&self, backend: &str) {
        counter!("idempotency_fingerprint_conflicts_total", "backend" => backend.to_string()).increment(1);
    }

    pub fn record_wait_timeout(&self, backend: &str) {
        counter!("idempotency_wait_timeouts_total", "backend" => backend.to_string()).increment(1);
    }

    pub fn record_store_error(&self, backend: &str, operation: &str) {
        counter!("idempotency_store_errors_total", "backend" => backend.to_string(), "operation" => operation.to_string()).increment(1);
    }

    pub fn record_lost_claim(&self, backend: &str) {
        counter!("idempotency_lost_claims_total", "backend" => backend.to_string()).increment(1);
    }

    pub fn record_operation_latency(&self, duration_ms: f64, success: bool) {
        histogram!("idempotency_operation_duration_ms", "success" => success.to_string()).record(duration_ms);
    }

    pub fn record_wait_latency(&self, duration_ms: f64) {
        histogram!("idempotency_wait_duration_ms").record(duration_ms);
    }

    pub fn record_cleanup(&self, backend: &str, removed: u64) {
        counter!("idempotency_cleanup_removed_total", "backend" => backend.to_string()).increment(removed);
    }
}

/// Timer for measuring operation latency.
pub struct LatencyTimer {
    start: Instant,
}

impl LatencyTimer {
    pub fn new() -> Self {
        Self {
            start: Instant::now(),
        }
    }

    pub fn elapsed_ms(&self) -> f64 {
        self.start.elapsed().as_secs_f64() * 1000.0
    }
}

impl Default for LatencyTimer {
    fn default() -> Self {
        Self::new()
    }
}

/// Installs the Prometheus recorder once and returns its handle.
pub fn init_metrics() -> Result<PrometheusHandle, metrics_exporter_prometheus::BuildError> {
    if let Some(handle) = METRICS_HANDLE.get() {
        return Ok(handle.clone());
    }

    let handle = PrometheusBuilder::new().install_recorder()?;
    describe_metrics();
    METRICS.get_or_init(Metrics::new);

    Ok(METRICS_HANDLE.get_or_init(|| handle).clone())
}

fn describe_metrics() {
    describe_counter!("idempotency_executions_total", Unit::Count, "Calls to execute by outcome");
    describe_counter!("idempotency_claims_total", Unit::Count, "Claims won by this process");
    describe_counter!("idempotency_fingerprint_conflicts_total", Unit::Count, "Keys reused with a different request");
    describe_counter!("idempotency_wait_timeouts_total", Unit::Count, "Waits on in-flight executions that timed out");
    describe_counter!("idempotency_store_errors_total", Unit::Count, "Store calls that failed");
    describe_counter!("idempotency_lost_claims_total", Unit::Count, "Terminal writes rejected because the claim was gone");
    describe_counter!("idempotency_cleanup_removed_total", Unit::Count, "Expired records removed by cleanup");

    describe_histogram!("idempotency_operation_duration_ms", Unit::Milliseconds, "Wrapped operation latency in milliseconds");
    describe_histogram!("idempotency_wait_duration_ms", Unit::Milliseconds, "Time spent waiting on in-flight executions");
}

/// Returns the global metrics instance.
pub fn get_metrics() -> &'static Metrics {
    METRICS.get_or_init(Metrics::new)
}
