//! Metrics for cyclops observability
//!
//! Provides OpenTelemetry instruments for:
//! - Request phase transitions
//! - Node drains and terminations
//! - Reconciliation duration and errors
//!
//! Instruments record through the global meter. Without an installed meter
//! provider they are no-ops.

use once_cell::sync::Lazy;
use opentelemetry::global;
use opentelemetry::metrics::{Counter, Histogram, Meter};
use opentelemetry::KeyValue;

/// Global meter for cyclops metrics
static METER: Lazy<Meter> = Lazy::new(|| global::meter("cyclops"));

/// Counter of CycleNodeRequest phase transitions
///
/// Labels:
/// - `phase`: phase entered
pub static REQUEST_TRANSITIONS: Lazy<Counter<u64>> = Lazy::new(|| {
    METER
        .u64_counter("cyclops_request_phase_transitions_total")
        .with_description("Total number of CycleNodeRequest phase transitions")
        .with_unit("{transitions}")
        .build()
});

/// Counter of instances terminated after a successful drain
///
/// Labels:
/// - `node_group`: node group of the instance
pub static NODES_TERMINATED: Lazy<Counter<u64>> = Lazy::new(|| {
    METER
        .u64_counter("cyclops_nodes_terminated_total")
        .with_description("Total number of nodes terminated")
        .with_unit("{nodes}")
        .build()
});

/// Counter of finished node drains
///
/// Labels:
/// - `result`: successful, failed
pub static NODE_DRAINS: Lazy<Counter<u64>> = Lazy::new(|| {
    METER
        .u64_counter("cyclops_node_drains_total")
        .with_description("Total number of finished node drains")
        .with_unit("{drains}")
        .build()
});

/// Histogram of reconciliation duration
///
/// Labels:
/// - `controller`: request, status
/// - `result`: success, error
pub static RECONCILE_DURATION: Lazy<Histogram<f64>> = Lazy::new(|| {
    METER
        .f64_histogram("cyclops_reconcile_duration_seconds")
        .with_description("Duration of reconciliation in seconds")
        .with_unit("s")
        .build()
});

/// Counter of reconciliation errors
///
/// Labels:
/// - `controller`: request, status
/// - `error_type`: transient, permanent
pub static RECONCILE_ERRORS: Lazy<Counter<u64>> = Lazy::new(|| {
    METER
        .u64_counter("cyclops_reconcile_errors_total")
        .with_description("Total number of reconciliation errors")
        .with_unit("{errors}")
        .build()
});

/// Result label for a finished drain
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DrainResult {
    /// Node emptied and handed over for termination
    Successful,
    /// Drain gave up
    Failed,
}

impl DrainResult {
    /// Convert to label string
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Successful => "successful",
            Self::Failed => "failed",
        }
    }
}

/// Record a CycleNodeRequest entering a phase
pub fn record_request_transition(phase: &str) {
    REQUEST_TRANSITIONS.add(1, &[KeyValue::new("phase", phase.to_string())]);
}

/// Record an instance termination
pub fn record_node_terminated(node_group: &str) {
    NODES_TERMINATED.add(1, &[KeyValue::new("node_group", node_group.to_string())]);
}

/// Record a finished drain
pub fn record_drain(result: DrainResult) {
    NODE_DRAINS.add(1, &[KeyValue::new("result", result.as_str())]);
}

/// Timer for a single reconciliation
pub struct ReconcileTimer {
    controller: &'static str,
    start: std::time::Instant,
}

impl ReconcileTimer {
    /// Start timing a reconciliation of the given controller
    pub fn start(controller: &'static str) -> Self {
        Self {
            controller,
            start: std::time::Instant::now(),
        }
    }

    /// Record successful completion
    pub fn success(self) {
        RECONCILE_DURATION.record(
            self.start.elapsed().as_secs_f64(),
            &[
                KeyValue::new("controller", self.controller),
                KeyValue::new("result", "success"),
            ],
        );
    }

    /// Record error completion, classified as transient or permanent
    pub fn error(self, retryable: bool) {
        RECONCILE_DURATION.record(
            self.start.elapsed().as_secs_f64(),
            &[
                KeyValue::new("controller", self.controller),
                KeyValue::new("result", "error"),
            ],
        );
        let error_type = if retryable { "transient" } else { "permanent" };
        RECONCILE_ERRORS.add(
            1,
            &[
                KeyValue::new("controller", self.controller),
                KeyValue::new("error_type", error_type),
            ],
        );
    }
}
