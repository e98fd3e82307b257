//! Prometheus metrics for the ALB ingress controller
//!
//! # Exported metrics
//! - `alb_ingress_assembly_failures_total` (counter): failed Ingress assemblies labeled by
//!   stage.
//! - `alb_ingress_reconcile_duration_seconds` (histogram): reconcile duration labeled by ingress.
//! - `alb_ingress_reconcile_errors_total` (counter): reconcile errors labeled by ingress.
//! - `alb_ingress_imports_total` (counter): load balancer imports labeled by outcome.

use std::sync::atomic::AtomicU64;

use once_cell::sync::Lazy;
use prometheus_client::encoding::text::encode;
use prometheus_client::encoding::EncodeLabelSet;
use prometheus_client::metrics::counter::Counter;
use prometheus_client::metrics::family::Family;
use prometheus_client::metrics::histogram::{exponential_buckets, Histogram};
use prometheus_client::registry::Registry;

use crate::error::{Error, Result};

#[derive(Clone, Debug, Hash, PartialEq, Eq, EncodeLabelSet)]
pub struct StageLabels {
    /// "annotations", "target_groups" or "listeners"
    pub stage: String,
}

#[derive(Clone, Debug, Hash, PartialEq, Eq, EncodeLabelSet)]
pub struct IngressLabels {
    /// Aggregate id, `namespace/name`
    pub ingress: String,
}

#[derive(Clone, Debug, Hash, PartialEq, Eq, EncodeLabelSet)]
pub struct OutcomeLabels {
    /// "imported" or "skipped"
    pub outcome: String,
}

pub static ASSEMBLY_FAILURES_TOTAL: Lazy<Family<StageLabels, Counter<u64, AtomicU64>>> =
    Lazy::new(Family::default);

/// Histogram tracking reconcile duration (seconds)
pub static RECONCILE_DURATION_SECONDS: Lazy<Family<IngressLabels, Histogram>> = Lazy::new(|| {
    fn reconcile_histogram() -> Histogram {
        // 10ms .. ~5min across 16 buckets; every cloud call is a network round trip.
        Histogram::new(exponential_buckets(0.01, 2.0, 16))
    }

    Family::new_with_constructor(reconcile_histogram)
});

pub static RECONCILE_ERRORS_TOTAL: Lazy<Family<IngressLabels, Counter<u64, AtomicU64>>> =
    Lazy::new(Family::default);

pub static IMPORTS_TOTAL: Lazy<Family<OutcomeLabels, Counter<u64, AtomicU64>>> =
    Lazy::new(Family::default);

/// Global metrics registry
pub static REGISTRY: Lazy<Registry> = Lazy::new(|| {
    let mut registry = Registry::default();

    registry.register(
        "alb_ingress_assembly_failures",
        "Spec-driven assemblies that left the ingress invalid",
        ASSEMBLY_FAILURES_TOTAL.clone(),
    );
    registry.register(
        "alb_ingress_reconcile_duration_seconds",
        "Duration of ingress reconciles in seconds",
        RECONCILE_DURATION_SECONDS.clone(),
    );
    registry.register(
        "alb_ingress_reconcile_errors",
        "Errors collected while reconciling ingresses",
        RECONCILE_ERRORS_TOTAL.clone(),
    );
    registry.register(
        "alb_ingress_imports",
        "Load balancers considered for import from the cloud",
        IMPORTS_TOTAL.clone(),
    );

    registry
});

pub fn inc_assembly_failure(stage: &str) {
    let labels = StageLabels {
        stage: stage.to_string(),
    };
    ASSEMBLY_FAILURES_TOTAL.get_or_create(&labels).inc();
}

/// Record one reconcile pass and the number of errors it collected
pub fn observe_reconcile(ingress: &str, seconds: f64, errors: usize) {
    let labels = IngressLabels {
        ingress: ingress.to_string(),
    };
    RECONCILE_DURATION_SECONDS
        .get_or_create(&labels)
        .observe(seconds);
    if errors > 0 {
        RECONCILE_ERRORS_TOTAL
            .get_or_create(&labels)
            .inc_by(errors as u64);
    }
}

/// Drop the per-ingress series of an ingress that no longer exists
pub fn forget_ingress(ingress: &str) {
    let labels = IngressLabels {
        ingress: ingress.to_string(),
    };
    RECONCILE_DURATION_SECONDS.remove(&labels);
    RECONCILE_ERRORS_TOTAL.remove(&labels);
}

pub fn inc_import(outcome: &str) {
    let labels = OutcomeLabels {
        outcome: outcome.to_string(),
    };
    IMPORTS_TOTAL.get_or_create(&labels).inc();
}

/// Render the registry in the Prometheus text format
pub fn render() -> Result<String> {
    let mut buffer = String::new();
    encode(&mut buffer, &REGISTRY)
        .map_err(|e| Error::TelemetryError(format!("failed to encode metrics: {e}")))?;
    Ok(buffer)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_render_includes_recorded_series() {
        inc_assembly_failure("annotations");
        observe_reconcile("payments/checkout", 0.25, 2);
        inc_import("skipped");

        let text = render().unwrap();
        assert!(text.contains("alb_ingress_assembly_failures_total{stage=\"annotations\"}"));
        assert!(text.contains("alb_ingress_reconcile_errors_total{ingress=\"payments/checkout\"}"));
        assert!(text.contains("alb_ingress_imports_total{outcome=\"skipped\"}"));
    }

    #[test]
    fn test_forget_ingress_drops_its_series() {
        observe_reconcile("payments/retired", 0.5, 1);
        assert!(render().unwrap().contains("ingress=\"payments/retired\""));

        forget_ingress("payments/retired");
        assert!(!render().unwrap().contains("ingress=\"payments/retired\""));
    }
}
