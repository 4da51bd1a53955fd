//! Prometheus metrics for the config entry controllers
//!
//! # Exported metrics
//! The `/metrics` endpoint (when built with `--features metrics`) exports the following metrics:
//! - `consul_config_reconcile_duration_seconds` (histogram): reconcile duration labeled by controller.
//! - `consul_config_reconcile_errors_total` (counter): reconcile errors labeled by controller and kind.
//! - `consul_config_sync_total` (counter): sync outcomes labeled by controller and outcome.
//! - `consul_config_namespaces_created_total` (counter): Consul namespaces created on demand.

use std::sync::atomic::AtomicU64;

use once_cell::sync::Lazy;
use prometheus_client::encoding::EncodeLabelSet;
use prometheus_client::metrics::counter::Counter;
use prometheus_client::metrics::family::Family;
use prometheus_client::metrics::histogram::{exponential_buckets, Histogram};
use prometheus_client::registry::Registry;

/// Labels for operator reconcile metrics
#[derive(Clone, Debug, Hash, PartialEq, Eq, EncodeLabelSet)]
pub struct ReconcileLabels {
    /// Controller name, e.g. "servicedefaults"
    pub controller: String,
}

/// Labels for operator error metrics
#[derive(Clone, Debug, Hash, PartialEq, Eq, EncodeLabelSet)]
pub struct ErrorLabels {
    /// Controller name, e.g. "servicedefaults"
    pub controller: String,
    /// Error kind or status reason, e.g. "kube", "ConsulAgentError"
    pub kind: String,
}

/// Labels for sync outcome metrics
#[derive(Clone, Debug, Hash, PartialEq, Eq, EncodeLabelSet)]
pub struct SyncLabels {
    pub controller: String,
    /// "synced", "failed" or "unknown"
    pub outcome: String,
}

/// Histogram tracking reconcile duration (seconds)
pub static RECONCILE_DURATION_SECONDS: Lazy<Family<ReconcileLabels, Histogram>> = Lazy::new(|| {
    fn reconcile_histogram() -> Histogram {
        // 1ms .. ~32s across 16 buckets.
        Histogram::new(exponential_buckets(0.001, 2.0, 16))
    }

    Family::new_with_constructor(reconcile_histogram)
});

/// Counter tracking reconcile errors
pub static RECONCILE_ERRORS_TOTAL: Lazy<Family<ErrorLabels, Counter<u64, AtomicU64>>> =
    Lazy::new(Family::default);

/// Counter tracking status transitions written by the engine
pub static SYNC_TOTAL: Lazy<Family<SyncLabels, Counter<u64, AtomicU64>>> =
    Lazy::new(Family::default);

pub static NAMESPACES_CREATED_TOTAL: Lazy<Counter<u64, AtomicU64>> = Lazy::new(Counter::default);

/// Global metrics registry
pub static REGISTRY: Lazy<Registry> = Lazy::new(|| {
    let mut registry = Registry::default();

    registry.register(
        "consul_config_reconcile_duration_seconds",
        "Duration of reconcile loops in seconds",
        RECONCILE_DURATION_SECONDS.clone(),
    );
    registry.register(
        "consul_config_reconcile_errors_total",
        "Total number of reconcile errors",
        RECONCILE_ERRORS_TOTAL.clone(),
    );
    registry.register(
        "consul_config_sync_total",
        "Sync status transitions by outcome",
        SYNC_TOTAL.clone(),
    );
    registry.register(
        "consul_config_namespaces_created_total",
        "Consul namespaces created by the operator",
        NAMESPACES_CREATED_TOTAL.clone(),
    );

    registry
});

/// Observe a reconcile duration in seconds.
pub fn observe_reconcile_duration_seconds(controller: &str, seconds: f64) {
    let labels = ReconcileLabels {
        controller: controller.to_string(),
    };
    RECONCILE_DURATION_SECONDS
        .get_or_create(&labels)
        .observe(seconds);
}

/// Increment the reconcile error counter.
pub fn inc_reconcile_error(controller: &str, kind: &str) {
    let labels = ErrorLabels {
        controller: controller.to_string(),
        kind: kind.to_string(),
    };
    RECONCILE_ERRORS_TOTAL.get_or_create(&labels).inc();
}

pub fn inc_sync_outcome(controller: &str, outcome: &str) {
    let labels = SyncLabels {
        controller: controller.to_string(),
        outcome: outcome.to_string(),
    };
    SYNC_TOTAL.get_or_create(&labels).inc();
}

pub fn inc_namespace_created() {
    NAMESPACES_CREATED_TOTAL.inc();
}
