//! Prometheus metrics for the operator
//!
//! Exposed on `/metrics` when a metrics address is configured.

use crate::resources::Collection;
use lazy_static::lazy_static;
use prometheus::{
    register_counter_vec, register_gauge, register_histogram_vec, CounterVec, Encoder, Gauge,
    HistogramVec, TextEncoder,
};

lazy_static! {
    /// Histogram: reconcile duration per resource kind (seconds)
    pub static ref RECONCILE_DURATION: HistogramVec = register_histogram_vec!(
        "nextdns_operator_reconcile_duration_seconds",
        "Duration of reconcile passes",
        &["kind"],
        vec![0.05, 0.1, 0.5, 1.0, 2.5, 5.0, 10.0, 30.0, 60.0]
    )
    .expect("Failed to create reconcile_duration metric");

    /// Counter: reconciles by kind and result
    pub static ref RECONCILES: CounterVec = register_counter_vec!(
        "nextdns_operator_reconcile_total",
        "Total reconciles by kind and result",
        &["kind", "result"]
    )
    .expect("Failed to create reconcile_total metric");

    /// Counter: collection syncs by collection and result
    pub static ref COLLECTION_SYNCS: CounterVec = register_counter_vec!(
        "nextdns_operator_collection_sync_total",
        "Collection sync attempts by collection and result",
        &["collection", "result"]
    )
    .expect("Failed to create collection_sync metric");

    /// Counter: remote mutations issued per collection
    pub static ref REMOTE_MUTATIONS: CounterVec = register_counter_vec!(
        "nextdns_operator_remote_mutations_total",
        "Remote mutating calls by collection",
        &["collection"]
    )
    .expect("Failed to create remote_mutations metric");

    /// Counter: reconcile errors by class
    pub static ref RECONCILE_ERRORS: CounterVec = register_counter_vec!(
        "nextdns_operator_reconcile_errors_total",
        "Reconcile errors by class",
        &["class"]
    )
    .expect("Failed to create reconcile_errors metric");

    /// Gauge: work queue depth
    pub static ref QUEUE_DEPTH: Gauge = register_gauge!(
        "nextdns_operator_queue_depth",
        "Keys waiting in the work queue"
    )
    .expect("Failed to create queue_depth metric");

    /// Gauge: controller health (1 = healthy, 0 = unhealthy)
    pub static ref HEALTH_STATUS: Gauge = register_gauge!(
        "nextdns_operator_health_status",
        "Controller health status (1 = healthy, 0 = unhealthy)"
    )
    .expect("Failed to create health_status metric");
}

/// Record one finished reconcile
pub fn record_reconcile(kind: &str, result: &str, duration_secs: f64) {
    RECONCILE_DURATION
        .with_label_values(&[kind])
        .observe(duration_secs);
    RECONCILES.with_label_values(&[kind, result]).inc();
}

pub fn record_reconcile_error(class: &str) {
    RECONCILE_ERRORS.with_label_values(&[class]).inc();
}

pub fn record_collection_sync(collection: Collection, ok: bool) {
    let result = if ok { "success" } else { "failure" };
    let collection = collection.to_string();
    COLLECTION_SYNCS
        .with_label_values(&[collection.as_str(), result])
        .inc();
}

pub fn record_remote_mutations(collection: Collection, count: usize) {
    if count > 0 {
        REMOTE_MUTATIONS
            .with_label_values(&[collection.to_string().as_str()])
            .inc_by(count as f64);
    }
}

/// Set work queue depth
pub fn set_queue_depth(depth: usize) {
    QUEUE_DEPTH.set(depth as f64);
}

/// Set health status
pub fn set_health_status(healthy: bool) {
    HEALTH_STATUS.set(if healthy { 1.0 } else { 0.0 });
}

/// Encode all metrics as Prometheus text format
pub fn encode_metrics() -> String {
    let encoder = TextEncoder::new();
    let metric_families = prometheus::gather();
    let mut buffer = Vec::new();
    if let Err(e) = encoder.encode(&metric_families, &mut buffer) {
        tracing::warn!(error = %e, "Failed to encode metrics");
    }
    String::from_utf8_lossy(&buffer).into_owned()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_metrics_creation() {
        record_reconcile("Profile", "success", 0.2);
        record_reconcile_error("transient");
        record_collection_sync(Collection::Denylist, true);
        record_remote_mutations(Collection::Denylist, 3);
        set_queue_depth(4);
        set_health_status(true);

        let output = encode_metrics();
        assert!(output.contains("nextdns_operator_reconcile_duration_seconds"));
        assert!(output.contains("nextdns_operator_remote_mutations_total"));
        assert!(output.contains("collection=\"denylist\""));
    }
}
