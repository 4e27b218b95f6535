//! # Metrics
//!
//! Prometheus metrics for monitoring the engine.
//!
//! ## Metrics Exposed
//!
//! - `gitops_reconciliations_total` - Total number of reconcile passes
//! - `gitops_reconciliation_errors_total` - Reconcile failures by error class
//! - `gitops_reconcile_duration_seconds` - Duration of successful passes
//! - `gitops_objects_applied_total` - Objects applied to the resource store
//! - `gitops_objects_pruned_total` - Objects deleted by prune
//! - `gitops_units_ready` - Units currently in the Ready phase

use prometheus::{Histogram, IntCounter, IntCounterVec, IntGauge, Registry};
use std::sync::LazyLock;

pub(crate) static REGISTRY: LazyLock<Registry> = LazyLock::new(Registry::new);

static RECONCILIATIONS_TOTAL: LazyLock<IntCounter> = LazyLock::new(|| {
    IntCounter::new(
        "gitops_reconciliations_total",
        "Total number of reconcile passes",
    )
    .expect("Failed to create RECONCILIATIONS_TOTAL metric - this should never happen")
});

static RECONCILIATION_ERRORS_TOTAL: LazyLock<IntCounterVec> = LazyLock::new(|| {
    IntCounterVec::new(
        prometheus::Opts::new(
            "gitops_reconciliation_errors_total",
            "Total number of reconcile failures by error class",
        ),
        &["class"],
    )
    .expect("Failed to create RECONCILIATION_ERRORS_TOTAL metric - this should never happen")
});

static RECONCILE_DURATION: LazyLock<Histogram> = LazyLock::new(|| {
    Histogram::with_opts(
        prometheus::HistogramOpts::new(
            "gitops_reconcile_duration_seconds",
            "Duration of successful reconcile passes in seconds",
        )
        .buckets(vec![0.1, 0.5, 1.0, 2.0, 5.0, 10.0, 30.0]),
    )
    .expect("Failed to create RECONCILE_DURATION metric - this should never happen")
});

static OBJECTS_APPLIED_TOTAL: LazyLock<IntCounter> = LazyLock::new(|| {
    IntCounter::new(
        "gitops_objects_applied_total",
        "Total number of objects applied to the resource store",
    )
    .expect("Failed to create OBJECTS_APPLIED_TOTAL metric - this should never happen")
});

static OBJECTS_PRUNED_TOTAL: LazyLock<IntCounter> = LazyLock::new(|| {
    IntCounter::new(
        "gitops_objects_pruned_total",
        "Total number of objects deleted because they left the render",
    )
    .expect("Failed to create OBJECTS_PRUNED_TOTAL metric - this should never happen")
});

static UNITS_READY: LazyLock<IntGauge> = LazyLock::new(|| {
    IntGauge::new("gitops_units_ready", "Units currently in the Ready phase")
        .expect("Failed to create UNITS_READY metric - this should never happen")
});

/// Register all metrics with the process registry. Call once at startup.
pub fn register() {
    let collectors: Vec<Box<dyn prometheus::core::Collector>> = vec![
        Box::new(RECONCILIATIONS_TOTAL.clone()),
        Box::new(RECONCILIATION_ERRORS_TOTAL.clone()),
        Box::new(RECONCILE_DURATION.clone()),
        Box::new(OBJECTS_APPLIED_TOTAL.clone()),
        Box::new(OBJECTS_PRUNED_TOTAL.clone()),
        Box::new(UNITS_READY.clone()),
    ];

    for collector in collectors {
        // Double registration is the only error path here and only happens
        // if register() is called twice; ignore it
        let _ = REGISTRY.register(collector);
    }
}

pub fn increment_reconciliations() {
    RECONCILIATIONS_TOTAL.inc();
}

pub fn increment_reconciliation_errors(class: &str) {
    RECONCILIATION_ERRORS_TOTAL.with_label_values(&[class]).inc();
}

pub fn observe_reconcile_duration(seconds: f64) {
    RECONCILE_DURATION.observe(seconds);
}

pub fn increment_objects_applied(count: u64) {
    OBJECTS_APPLIED_TOTAL.inc_by(count);
}

pub fn increment_objects_pruned(count: u64) {
    OBJECTS_PRUNED_TOTAL.inc_by(count);
}

pub fn set_units_ready(count: i64) {
    UNITS_READY.set(count);
}

/// Gather all metric families for the `/metrics` endpoint.
pub fn gather() -> Vec<prometheus::proto::MetricFamily> {
    REGISTRY.gather()
}
