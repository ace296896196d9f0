//! NodeGroup CRD describing a cloud-managed fleet of nodes

use kube::CustomResource;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

use super::types::{CycleSettings, LabelSelector};

/// NodeGroup identifies a cloud-managed node group and how to cycle it.
///
/// Example:
/// ```yaml
/// apiVersion: cyclops.dev/v1
/// kind: NodeGroup
/// metadata:
///   name: system
/// spec:
///   nodeGroupName: system-asg
///   nodeSelector:
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
    kind = "NodeGroup",
    shortname = "ng",
    printcolumn = r#"{"name":"Node Group","type":"string","jsonPath":".spec.nodeGroupName"}"#,
    printcolumn = r#"{"name":"Method","type":"string","jsonPath":".spec.cycleSettings.method"}"#,
    printcolumn = r#"{"name":"Age","type":"date","jsonPath":".metadata.creationTimestamp"}"#
)]
#[serde(rename_all = "camelCase")]
pub struct NodeGroupSpec {
    /// Name of the node group in the cloud provider
    pub node_group_name: String,

    /// Selector matching the cluster nodes that belong to this node group
    pub node_selector: LabelSelector,

    /// Default cycle settings for requests generated from this node group
    #[serde(default)]
    pub cycle_settings: CycleSettings,
}
