use lazy_static::lazy_static;
use prometheus::{
    register_histogram, register_int_counter, register_int_counter_vec, register_int_gauge,
    register_int_gauge_vec, Histogram, IntCounter, IntCounterVec, IntGauge, IntGaugeVec,
};

lazy_static! {
    // Admit metrics
    pub static ref ADMIT_REQUESTS_TOTAL: IntCounter = register_int_counter!(
        "helios_admit_requests_total",
        "Total number of admit requests"
    )
    .unwrap();

    pub static ref ADMITS_ALLOWED_TOTAL: IntCounter = register_int_counter!(
        "helios_admits_allowed_total",
        "Total number of admits allowed"
    )
    .unwrap();

    pub static ref ADMITS_DENIED_TOTAL: IntCounter = register_int_counter!(
        "helios_admits_denied_total",
        "Total number of admits denied"
    )
    .unwrap();

    pub static ref ADMIT_DURATION: Histogram = register_histogram!(
        "helios_admit_duration_seconds",
        "Admit processing duration in seconds",
        vec![0.0005, 0.001, 0.0025, 0.005, 0.01, 0.025, 0.05, 0.1, 0.25, 0.5, 1.0]
    )
    .unwrap();

    pub static ref TENANT_REQUESTS_TOTAL: IntCounterVec = register_int_counter_vec!(
        "helios_tenant_requests_total",
        "Admit requests per tenant",
        &["tenant", "allowed"]
    )
    .unwrap();

    // Engine metrics
    pub static ref ENGINE_TRACKED_KEYS: IntGaugeVec = register_int_gauge_vec!(
        "helios_engine_tracked_keys",
        "Current number of decision keys tracked per engine",
        &["tenant", "resource"]
    )
    .unwrap();

    // Collaborator metrics
    pub static ref STORE_ERRORS_TOTAL: IntCounter = register_int_counter!(
        "helios_store_errors_total",
        "Total number of shared store errors"
    )
    .unwrap();

    pub static ref REGISTRY_LAST_SYNC: IntGauge = register_int_gauge!(
        "helios_registry_last_sync_timestamp_seconds",
        "Unix timestamp of the last successful registry sync"
    )
    .unwrap();
}

/// Per-decision counter sink consumed by the gateway. Production wires in
/// [`PrometheusMetrics`]; tests substitute a counting fake so assertions
/// never touch the global registry.
pub trait DecisionMetrics: Send + Sync {
    fn inc_total(&self);
    fn inc_allowed(&self);
    fn inc_denied(&self);
    fn observe_latency(&self, seconds: f64);
}

/// Prometheus-backed decision metrics
#[derive(Debug, Default)]
pub struct PrometheusMetrics;

impl DecisionMetrics for PrometheusMetrics {
    fn inc_total(&self) {
        ADMIT_REQUESTS_TOTAL.inc();
    }

    fn inc_allowed(&self) {
        ADMITS_ALLOWED_TOTAL.inc();
    }

    fn inc_denied(&self) {
        ADMITS_DENIED_TOTAL.inc();
    }

    fn observe_latency(&self, seconds: f64) {
        ADMIT_DURATION.observe(seconds);
    }
}

/// Record a per-tenant admit outcome
pub fn record_tenant_request(tenant: &str, allowed: bool) {
    let allowed_str = if allowed { "true" } else { "false" };
    TENANT_REQUESTS_TOTAL
        .with_label_values(&[tenant, allowed_str])
        .inc();
}

/// Record the current bucket-map size for an engine
pub fn record_tracked_keys(tenant: &str, resource: &str, keys: usize) {
    ENGINE_TRACKED_KEYS
        .with_label_values(&[tenant, resource])
        .set(keys as i64);
}

/// Record a shared store failure
pub fn record_store_error() {
    STORE_ERRORS_TOTAL.inc();
}

/// Record a successful registry sync at the given unix timestamp
pub fn record_registry_sync(unix_secs: i64) {
    REGISTRY_LAST_SYNC.set(unix_secs);
}
