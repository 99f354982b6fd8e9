//! Reconciler Metrics
//!
//! Prometheus counters and histograms kept in a private registry so several
//! reconcilers (and tests) never collide on global registration.

use crate::domain::ports::ResourceKind;
use crate::error::{Error, Result};
use prometheus::{Encoder, HistogramOpts, HistogramVec, IntCounterVec, Opts, Registry, TextEncoder};
use std::time::Duration;

/// Outcome label of one reconcile operation
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Outcome {
    /// The backend was mutated
    Changed,
    /// Desired state was already satisfied
    Unchanged,
    /// The resource is gone
    Gone,
    Failed,
}

impl Outcome {
    pub fn as_str(&self) -> &'static str {
        match self {
            Outcome::Changed => "changed",
            Outcome::Unchanged => "unchanged",
            Outcome::Gone => "gone",
            Outcome::Failed => "failed",
        }
    }
}

/// Metrics for reconcile operations
#[derive(Debug, Clone)]
pub struct ReconcileMetrics {
    registry: Registry,
    operations: IntCounterVec,
    lock_wait: HistogramVec,
}

impl ReconcileMetrics {
    pub fn new() -> Result<Self> {
        let registry = Registry::new();

        let operations = IntCounterVec::new(
            Opts::new(
                "reconcile_operations_total",
                "Reconcile operations by resource kind, operation and outcome",
            ),
            &["kind", "operation", "outcome"],
        )
        .map_err(metrics_err)?;

        let lock_wait = HistogramVec::new(
            HistogramOpts::new(
                "reconcile_lock_wait_seconds",
                "Time spent waiting for a resource lock",
            )
            .buckets(vec![0.0001, 0.001, 0.01, 0.1, 1.0, 10.0, 60.0]),
            &["kind"],
        )
        .map_err(metrics_err)?;

        registry
            .register(Box::new(operations.clone()))
            .map_err(metrics_err)?;
        registry
            .register(Box::new(lock_wait.clone()))
            .map_err(metrics_err)?;

        Ok(Self {
            registry,
            operations,
            lock_wait,
        })
    }

    pub fn record(&self, kind: ResourceKind, operation: &str, outcome: Outcome) {
        self.operations
            .with_label_values(&[kind.as_str(), operation, outcome.as_str()])
            .inc();
    }

    pub fn observe_lock_wait(&self, kind: ResourceKind, waited: Duration) {
        self.lock_wait
            .with_label_values(&[kind.as_str()])
            .observe(waited.as_secs_f64());
    }

    /// Count of operations recorded under the given labels
    pub fn operation_count(&self, kind: ResourceKind, operation: &str, outcome: Outcome) -> u64 {
        self.operations
            .with_label_values(&[kind.as_str(), operation, outcome.as_str()])
            .get()
    }

    /// Render all metrics in the Prometheus text exposition format
    pub fn encode_text(&self) -> Result<String> {
        let encoder = TextEncoder::new();
        let mut buffer = Vec::new();
        encoder
            .encode(&self.registry.gather(), &mut buffer)
            .map_err(metrics_err)?;
        String::from_utf8(buffer).map_err(|e| Error::Internal(e.to_string()))
    }
}

fn metrics_err(e: prometheus::Error) -> Error {
    Error::Internal(format!("metrics: {}", e))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_record_and_encode() {
        let metrics = ReconcileMetrics::new().unwrap();
        metrics.record(ResourceKind::Pool, "create", Outcome::Changed);
        metrics.record(ResourceKind::Pool, "create", Outcome::Unchanged);
        metrics.record(ResourceKind::Pool, "create", Outcome::Unchanged);
        metrics.observe_lock_wait(ResourceKind::Volume, Duration::from_millis(3));

        assert_eq!(metrics.operation_count(ResourceKind::Pool, "create", Outcome::Unchanged), 2);

        let text = metrics.encode_text().unwrap();
        assert!(text.contains("reconcile_operations_total"));
        assert!(text.contains("outcome=\"changed\""));
        assert!(text.contains("reconcile_lock_wait_seconds"));
    }

    #[test]
    fn test_registries_are_independent() {
        let a = ReconcileMetrics::new().unwrap();
        let b = ReconcileMetrics::new().unwrap();
        a.record(ResourceKind::Snapshot, "delete", Outcome::Changed);
        assert_eq!(b.operation_count(ResourceKind::Snapshot, "delete", Outcome::Changed), 0);
    }
}
