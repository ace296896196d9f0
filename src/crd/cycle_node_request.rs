//! CycleNodeRequest CRD: the group-level work item

use kube::{CustomResource, ResourceExt};
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

use super::types::{CycleNodeRequestNode, CycleSettings, LabelSelector};
use crate::Error;

/// CycleNodeRequest asks for the nodes of a node group to be replaced.
///
/// Example:
/// ```yaml
/// apiVersion: cyclops.dev/v1
/// kind: CycleNodeRequest
/// metadata:
///   name: system-upgrade
///   namespace: kube-system
/// spec:
///   nodeGroupName: system-asg
///   selector:
///     matchLabels:
///       role: system
///   cycleSettings:
///     method: Drain
///     concurrency: 1
/// ```
#[derive(CustomResource, Clone, Debug, Deserialize, Serialize, JsonSchema, PartialEq)]
#[kube(
    group = "cyclops.dev",
    version = "v1",
    kind = "CycleNodeRequest",
    namespaced,
    status = "CycleNodeRequestStatus",
    shortname = "cnr",
    printcolumn = r#"{"name":"Node Group","type":"string","jsonPath":".spec.nodeGroupName"}"#,
    printcolumn = r#"{"name":"Method","type":"string","jsonPath":".spec.cycleSettings.method"}"#,
    printcolumn = r#"{"name":"Phase","type":"string","jsonPath":".status.phase"}"#,
    printcolumn = r#"{"name":"Age","type":"date","jsonPath":".metadata.creationTimestamp"}"#
)]
#[serde(rename_all = "camelCase")]
pub struct CycleNodeRequestSpec {
    /// Node group in the cloud provider whose nodes are cycled
    pub node_group_name: String,

    /// Selector matching the cluster nodes of the node group
    pub selector: LabelSelector,

    /// Explicit node names to cycle instead of every selected node
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub node_names: Vec<String>,

    /// How the nodes are cycled
    #[serde(default)]
    pub cycle_settings: CycleSettings,
}

/// Lifecycle phase of a CycleNodeRequest
#[derive(Clone, Copy, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq, Eq)]
pub enum CycleNodeRequestPhase {
    /// Request accepted, nodes not yet resolved
    #[default]
    Pending,
    /// Nodes resolved, next batch is selected here
    Initialised,
    /// Waiting for replacement capacity to become ready
    ScalingUp,
    /// Waiting for the batch to drain before terminating it
    WaitingTermination,
    /// Releasing claimed nodes before failing
    Healing,
    /// Every node has been cycled
    Successful,
    /// Cycling stopped; see the status message
    Failed,
}

impl CycleNodeRequestPhase {
    /// True for phases that are never left again
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Successful | Self::Failed)
    }

    /// Phase name as shown in `status.phase`
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Pending => "Pending",
            Self::Initialised => "Initialised",
            Self::ScalingUp => "ScalingUp",
            Self::WaitingTermination => "WaitingTermination",
            Self::Healing => "Healing",
            Self::Successful => "Successful",
            Self::Failed => "Failed",
        }
    }
}

impl std::fmt::Display for CycleNodeRequestPhase {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Scale-up bookkeeping for the batch currently in flight
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct ScaleUpStatus {
    /// Desired capacity the node group must reach for this batch
    pub target_capacity: i64,

    /// Ready node count (claimed nodes included) that ends the scale-up
    pub target_ready_nodes: u32,

    /// When the scale-up was requested (RFC 3339)
    pub started_at: String,
}

/// CycleNodeRequest status
///
/// Every field is serialized, including empty ones, so a merge patch of the
/// whole status clears what a phase no longer needs.
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct CycleNodeRequestStatus {
    /// Current phase
    #[serde(default)]
    pub phase: CycleNodeRequestPhase,

    /// Human-readable message, set on failure
    #[serde(default)]
    pub message: Option<String>,

    /// When the current phase was entered (RFC 3339)
    #[serde(default)]
    pub phase_started_at: Option<String>,

    /// Replacement or untouched nodes still eligible for selection
    #[serde(default)]
    pub nodes_available: Vec<CycleNodeRequestNode>,

    /// Nodes selected for retirement
    #[serde(default)]
    pub nodes_to_terminate: Vec<CycleNodeRequestNode>,

    /// Batch currently being scaled, drained and terminated
    #[serde(default)]
    pub current_nodes: Vec<CycleNodeRequestNode>,

    /// Nodes released after a drain failure
    #[serde(default)]
    pub skipped_nodes: Vec<CycleNodeRequestNode>,

    /// Nodes whose instance this request terminated
    #[serde(default)]
    pub terminated_nodes: Vec<CycleNodeRequestNode>,

    /// Nodes claimed by this request that are still being processed
    #[serde(default)]
    pub num_nodes_in_progress: u32,

    /// Nodes terminated so far
    #[serde(default)]
    pub num_nodes_cycled: u32,

    /// Scale-up bookkeeping for the current batch
    #[serde(default)]
    pub scale_up: Option<ScaleUpStatus>,
}

impl CycleNodeRequestStatus {
    /// Create a status in the given phase
    pub fn with_phase(phase: CycleNodeRequestPhase) -> Self {
        Self {
            phase,
            ..Default::default()
        }
    }

    /// True if the node was already terminated or released by this request
    ///
    /// Such nodes are finished; they are never selected or re-adopted, even
    /// while the provider still lists their instance.
    pub fn is_finished(&self, node: &CycleNodeRequestNode) -> bool {
        self.terminated_nodes
            .iter()
            .chain(self.skipped_nodes.iter())
            .any(|n| n.name == node.name && n.provider_id == node.provider_id)
    }
}

impl CycleNodeRequest {
    /// Current phase, `Pending` if no status has been written yet
    pub fn phase(&self) -> CycleNodeRequestPhase {
        self.status.as_ref().map(|s| s.phase).unwrap_or_default()
    }

    /// Label selector string for the request's nodes
    pub fn node_label_selector(&self) -> Result<String, Error> {
        if self.spec.selector.is_empty() {
            return Err(Error::validation_for(
                self.name_any(),
                "selector must contain at least one label",
            ));
        }
        Ok(self.spec.selector.to_selector_string())
    }

    /// Name of the CycleNodeStatus tracking the drain of `node_name`
    pub fn status_name_for(&self, node_name: &str) -> String {
        format!("{}-{}", self.name_any(), node_name)
    }

    /// Number of nodes processed in parallel
    ///
    /// A concurrency of zero means the whole set of nodes to terminate.
    pub fn effective_concurrency(&self) -> i64 {
        let configured = self.spec.cycle_settings.concurrency;
        if configured > 0 {
            return configured;
        }
        self.status
            .as_ref()
            .map(|s| s.nodes_to_terminate.len() as i64)
            .unwrap_or(0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn request(concurrency: i64) -> CycleNodeRequest {
        let mut cnr = CycleNodeRequest::new(
            "upgrade",
            CycleNodeRequestSpec {
                node_group_name: "workers".to_string(),
                selector: LabelSelector::from_labels([("role", "worker")]),
                node_names: vec![],
                cycle_settings: CycleSettings {
                    concurrency,
                    ..Default::default()
                },
            },
        );
        cnr.metadata.namespace = Some("kube-system".to_string());
        cnr
    }

    #[test]
    fn request_from_yaml() {
        let yaml = r#"
apiVersion: cyclops.dev/v1
kind: CycleNodeRequest
metadata:
  name: upgrade
  namespace: kube-system
spec:
  nodeGroupName: workers
  selector:
    matchLabels:
      role: worker
  nodeNames: [n1, n2]
status:
  phase: WaitingTermination
  nodesToTerminate:
    - name: n1
      providerID: aws:///i-1
      nodeGroupName: workers
      privateIP: 10.0.0.1
"#;
        let cnr: CycleNodeRequest = serde_yaml::from_str(yaml).expect("parse");
        assert_eq!(cnr.spec.node_names, vec!["n1", "n2"]);
        assert_eq!(cnr.phase(), CycleNodeRequestPhase::WaitingTermination);
        let status = cnr.status.expect("status");
        assert_eq!(status.nodes_to_terminate[0].provider_id, "aws:///i-1");
        assert_eq!(status.nodes_to_terminate[0].private_ip, "10.0.0.1");
    }

    #[test]
    fn phase_defaults_to_pending_without_status() {
        assert_eq!(request(1).phase(), CycleNodeRequestPhase::Pending);
        assert!(!CycleNodeRequestPhase::Healing.is_terminal());
        assert!(CycleNodeRequestPhase::Failed.is_terminal());
        assert!(CycleNodeRequestPhase::Successful.is_terminal());
    }

    #[test]
    fn empty_selector_is_rejected() {
        let mut cnr = request(1);
        assert_eq!(cnr.node_label_selector().expect("selector"), "role=worker");
        cnr.spec.selector = LabelSelector::default();
        assert!(cnr.node_label_selector().is_err());
    }

    #[test]
    fn zero_concurrency_means_all_nodes() {
        let mut cnr = request(0);
        let mut status = CycleNodeRequestStatus::with_phase(CycleNodeRequestPhase::Initialised);
        status.nodes_to_terminate = vec![CycleNodeRequestNode::default(); 3];
        cnr.status = Some(status);
        assert_eq!(cnr.effective_concurrency(), 3);
        assert_eq!(request(2).effective_concurrency(), 2);
    }

    #[test]
    fn status_names_are_per_node() {
        assert_eq!(request(1).status_name_for("n1"), "upgrade-n1");
    }
}
