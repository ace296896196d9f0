//! CycleNodeStatus CRD: the per-node drain work item

use kube::CustomResource;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

use super::types::{CycleNodeRequestNode, CycleSettings};

/// CycleNodeStatus tracks the evacuation of one node before termination.
///
/// Created by the owning CycleNodeRequest; never by users.
#[derive(CustomResource, Clone, Debug, Deserialize, Serialize, JsonSchema, PartialEq)]
#[kube(
    group = "cyclops.dev",
    version = "v1",
    kind = "CycleNodeStatus",
    namespaced,
    status = "CycleNodeStatusStatus",
    shortname = "cns",
    printcolumn = r#"{"name":"Node","type":"string","jsonPath":".spec.nodeName"}"#,
    printcolumn = r#"{"name":"Method","type":"string","jsonPath":".spec.cycleSettings.method"}"#,
    printcolumn = r#"{"name":"Phase","type":"string","jsonPath":".status.phase"}"#,
    printcolumn = r#"{"name":"Age","type":"date","jsonPath":".metadata.creationTimestamp"}"#
)]
#[serde(rename_all = "camelCase")]
pub struct CycleNodeStatusSpec {
    /// Name of the node to drain
    pub node_name: String,

    /// Provider ID of the node when it was selected
    #[serde(default, rename = "providerID")]
    pub provider_id: String,

    /// Name of the owning CycleNodeRequest
    pub request_name: String,

    /// Settings copied from the owning request
    #[serde(default)]
    pub cycle_settings: CycleSettings,
}

/// Lifecycle phase of a CycleNodeStatus
#[derive(Clone, Copy, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq, Eq)]
pub enum CycleNodeStatusPhase {
    /// Node not yet inspected or cordoned
    #[default]
    Pending,
    /// Removing pod and node labels, waiting for targeted daemonset pods
    RemovingLabels,
    /// Evicting pods (method Drain)
    DrainingPods,
    /// Waiting for pods to leave on their own (method Wait)
    WaitingPods,
    /// Final check before handing the node over for termination
    HealthChecking,
    /// Node is empty and may be terminated
    Successful,
    /// Drain gave up; see the status message
    Failed,
}

impl CycleNodeStatusPhase {
    /// True for phases that are never left again
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Successful | Self::Failed)
    }

    /// Phase name as shown in `status.phase`
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Pending => "Pending",
            Self::RemovingLabels => "RemovingLabels",
            Self::DrainingPods => "DrainingPods",
            Self::WaitingPods => "WaitingPods",
            Self::HealthChecking => "HealthChecking",
            Self::Successful => "Successful",
            Self::Failed => "Failed",
        }
    }
}

impl std::fmt::Display for CycleNodeStatusPhase {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// CycleNodeStatus status
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct CycleNodeStatusStatus {
    /// Current phase
    #[serde(default)]
    pub phase: CycleNodeStatusPhase,

    /// Human-readable message, set on failure
    #[serde(default)]
    pub message: Option<String>,

    /// When the current phase was entered (RFC 3339)
    #[serde(default)]
    pub phase_started_at: Option<String>,

    /// Identifying fields of the live node being drained
    #[serde(default)]
    pub current_node: Option<CycleNodeRequestNode>,
}

impl CycleNodeStatus {
    /// Current phase, `Pending` if no status has been written yet
    pub fn phase(&self) -> CycleNodeStatusPhase {
        self.status.as_ref().map(|s| s.phase).unwrap_or_default()
    }

    /// Name of the node being drained
    ///
    /// Prefers the recorded live node, falling back to the spec.
    pub fn node_name(&self) -> &str {
        self.status
            .as_ref()
            .and_then(|s| s.current_node.as_ref())
            .map(|n| n.name.as_str())
            .unwrap_or(self.spec.node_name.as_str())
    }
}
