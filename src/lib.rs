//! Cyclops - Kubernetes operator that cycles the nodes of cloud-managed node groups
//!
//! A `CycleNodeRequest` names a node group (or explicit nodes) and a cycling
//! method. The operator claims a bounded batch of nodes, raises the group's
//! capacity so replacements come up first, drains each claimed node through a
//! per-node `CycleNodeStatus`, and finally terminates the drained instances at
//! the cloud provider. Every step is a polling state machine persisted in
//! object status, so a restart loses no progress.
//!
//! # Modules
//!
//! - [`crd`] - Custom Resource Definitions (NodeGroup, CycleNodeRequest, CycleNodeStatus)
//! - [`controller`] - Reconciliation logic for both state machines and the harness running them
//! - [`provider`] - Cloud provider abstraction and the in-memory provider
//! - [`generation`] - Building, validating and submitting requests from node groups
//! - [`leader_election`] - Lease-based leader election
//! - [`retry`] - Retry with exponential backoff for transient failures
//! - [`telemetry`] - Tracing subscriber setup
//! - [`metrics`] - OpenTelemetry instruments
//! - [`error`] - Error types for the operator

#![deny(missing_docs)]

pub mod controller;
pub mod crd;
pub mod error;
pub mod generation;
pub mod leader_election;
pub mod metrics;
pub mod provider;
pub mod retry;
pub mod telemetry;

pub use error::Error;

/// Result type alias using our custom Error type
pub type Result<T> = std::result::Result<T, Error>;

// =============================================================================
// Well-known names
// =============================================================================

/// Node label marking which CycleNodeRequest owns a node; valued with the request name
pub const CLAIM_LABEL: &str = "cyclops.dev/cycle";

/// Label on CycleNodeStatus objects naming the CycleNodeRequest that created them
pub const REQUEST_LABEL: &str = "cyclops.dev/request";

/// Label on generated CycleNodeRequests carrying the requested base name
pub const REQUEST_NAME_LABEL: &str = "cyclops.dev/request-name";

/// Annotation recording why a generated request was rejected
pub const REASON_ANNOTATION: &str = "cyclops.dev/reason";

/// Namespace watched for requests when none is configured
pub const DEFAULT_NAMESPACE: &str = "kube-system";

/// Field manager used for every write the operator makes
pub const FIELD_MANAGER: &str = "cyclops-controller";
