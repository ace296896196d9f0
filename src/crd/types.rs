//! Shared types used across the cyclops CRDs

use std::collections::BTreeMap;

use k8s_openapi::api::core::v1::Node;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

/// How pods are removed from a node before it is terminated
#[derive(Clone, Copy, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq, Eq)]
pub enum CycleNodeRequestMethod {
    /// Actively evict pods off the node before terminating it
    #[default]
    Drain,
    /// Wait for pods to leave the node, ignoring daemonsets and configured pods
    Wait,
}

impl std::fmt::Display for CycleNodeRequestMethod {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Drain => write!(f, "Drain"),
            Self::Wait => write!(f, "Wait"),
        }
    }
}

/// Daemonset pods that should leave the node once node labels are removed
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct DaemonsetPodsToRemove {
    /// Node labels removed from the node before draining. Daemonsets whose
    /// node selector matches one of these stop scheduling onto the node.
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub node_labels_to_remove: BTreeMap<String, String>,

    /// Daemonset pod labels to wait on. Only daemonset pods carrying one of
    /// these labels are waited for.
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub daemonset_pods_labels_to_wait: BTreeMap<String, String>,
}

/// Options controlling how the nodes of a request are cycled
#[derive(Clone, Debug, Deserialize, Serialize, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct CycleSettings {
    /// Cycling method
    #[serde(default)]
    pub method: CycleNodeRequestMethod,

    /// Number of nodes worked on in parallel. Zero means the whole node group.
    #[serde(default)]
    pub concurrency: i64,

    /// Pod label keys removed from every pod on the node before it is drained,
    /// taking the pods out of service endpoints
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub labels_to_remove: Vec<String>,

    /// Daemonset pods removed by clearing node labels
    #[serde(default)]
    pub daemonset_pods_to_remove: DaemonsetPodsToRemove,

    /// Pods matching any value listed for a label key are ignored when
    /// deciding whether a node has workloads left
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub ignore_pods_labels: BTreeMap<String, Vec<String>>,

    /// Namespaces whose pods are ignored when deciding whether a node has
    /// workloads left
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub ignore_namespaces: Vec<String>,

    /// Fail the whole request when one node's drain fails. When false the
    /// failed node is released and the remaining nodes carry on.
    #[serde(default = "default_true")]
    pub fail_on_drain_failure: bool,
}

fn default_true() -> bool {
    true
}

impl Default for CycleSettings {
    fn default() -> Self {
        Self {
            method: CycleNodeRequestMethod::default(),
            concurrency: 0,
            labels_to_remove: Vec::new(),
            daemonset_pods_to_remove: DaemonsetPodsToRemove::default(),
            ignore_pods_labels: BTreeMap::new(),
            ignore_namespaces: Vec::new(),
            fail_on_drain_failure: true,
        }
    }
}

impl CycleSettings {
    /// Validate the settings, returning a reason on failure
    pub fn validate(&self) -> Result<(), String> {
        if self.concurrency < 0 {
            return Err(format!(
                "concurrency must not be negative: got {}",
                self.concurrency
            ));
        }
        if self.labels_to_remove.iter().any(|l| l.trim().is_empty()) {
            return Err("labelsToRemove must not contain empty label keys".to_string());
        }
        if self.ignore_namespaces.iter().any(|ns| ns.trim().is_empty()) {
            return Err("ignoreNamespaces must not contain empty names".to_string());
        }
        if self.ignore_pods_labels.keys().any(|k| k.trim().is_empty()) {
            return Err("ignorePodsLabels must not contain empty label keys".to_string());
        }
        let dsp = &self.daemonset_pods_to_remove;
        if !dsp.daemonset_pods_labels_to_wait.is_empty() && dsp.node_labels_to_remove.is_empty() {
            return Err(
                "daemonsetPodsLabelsToWait requires nodeLabelsToRemove to be set".to_string(),
            );
        }
        Ok(())
    }
}

/// Equality-based label selector (`matchLabels`)
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct LabelSelector {
    /// Labels a node must carry to be selected
    #[serde(default)]
    pub match_labels: BTreeMap<String, String>,
}

impl LabelSelector {
    /// Create a selector from key/value pairs
    pub fn from_labels<K, V>(labels: impl IntoIterator<Item = (K, V)>) -> Self
    where
        K: Into<String>,
        V: Into<String>,
    {
        Self {
            match_labels: labels
                .into_iter()
                .map(|(k, v)| (k.into(), v.into()))
                .collect(),
        }
    }

    /// True if the selector selects nothing in particular
    pub fn is_empty(&self) -> bool {
        self.match_labels.is_empty()
    }

    /// Render as a Kubernetes label selector string (`k1=v1,k2=v2`)
    pub fn to_selector_string(&self) -> String {
        self.match_labels
            .iter()
            .map(|(k, v)| format!("{}={}", k, v))
            .collect::<Vec<_>>()
            .join(",")
    }

    /// Check whether a label set satisfies this selector
    pub fn matches(&self, labels: &BTreeMap<String, String>) -> bool {
        self.match_labels
            .iter()
            .all(|(k, v)| labels.get(k) == Some(v))
    }
}

/// Snapshot of a node taken when it was selected for cycling
///
/// Kept independently of the live Node so cycling can continue after the
/// node object is deleted.
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct CycleNodeRequestNode {
    /// Node name
    pub name: String,

    /// Cloud provider identifier (`spec.providerID`)
    #[serde(rename = "providerID")]
    pub provider_id: String,

    /// Node group the backing instance belongs to
    #[serde(default)]
    pub node_group_name: String,

    /// First internal IP address of the node; empty when the node reported none
    #[serde(default, rename = "privateIP")]
    pub private_ip: String,
}

impl CycleNodeRequestNode {
    /// Snapshot a live node
    ///
    /// A missing internal address is recorded as an empty string and surfaces
    /// later as a health-check failure.
    pub fn from_node(node: &Node, node_group_name: impl Into<String>) -> Self {
        let private_ip = node
            .status
            .as_ref()
            .and_then(|s| s.addresses.as_ref())
            .and_then(|addrs| addrs.iter().find(|a| a.type_ == "InternalIP"))
            .map(|a| a.address.clone())
            .unwrap_or_default();

        Self {
            name: node.metadata.name.clone().unwrap_or_default(),
            provider_id: node
                .spec
                .as_ref()
                .and_then(|s| s.provider_id.clone())
                .unwrap_or_default(),
            node_group_name: node_group_name.into(),
            private_ip,
        }
    }

    /// True if the live node is the node this snapshot was taken from
    ///
    /// Both the name and the provider ID must match; a node recreated under a
    /// reused name is a different node.
    pub fn is_same_node(&self, node: &Node) -> bool {
        node.metadata.name.as_deref() == Some(self.name.as_str())
            && node.spec.as_ref().and_then(|s| s.provider_id.as_deref())
                == Some(self.provider_id.as_str())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use k8s_openapi::api::core::v1::{NodeAddress, NodeSpec, NodeStatus};
    use k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta;

    fn node(name: &str, provider_id: &str, addresses: Vec<(&str, &str)>) -> Node {
        Node {
            metadata: ObjectMeta {
                name: Some(name.to_string()),
                ..Default::default()
            },
            spec: Some(NodeSpec {
                provider_id: Some(provider_id.to_string()),
                ..Default::default()
            }),
            status: Some(NodeStatus {
                addresses: Some(
                    addresses
                        .into_iter()
                        .map(|(t, a)| NodeAddress {
                            type_: t.to_string(),
                            address: a.to_string(),
                        })
                        .collect(),
                ),
                ..Default::default()
            }),
        }
    }

    #[test]
    fn snapshot_takes_first_internal_address() {
        let n = node(
            "n1",
            "aws:///us-east-1a/i-1",
            vec![
                ("Hostname", "n1.internal"),
                ("InternalIP", "10.0.0.1"),
                ("InternalIP", "fd00::1"),
            ],
        );
        let snap = CycleNodeRequestNode::from_node(&n, "workers");
        assert_eq!(snap.name, "n1");
        assert_eq!(snap.provider_id, "aws:///us-east-1a/i-1");
        assert_eq!(snap.node_group_name, "workers");
        assert_eq!(snap.private_ip, "10.0.0.1");
    }

    #[test]
    fn snapshot_without_address_is_not_an_error() {
        let n = node("n1", "aws:///i-1", vec![("ExternalIP", "1.2.3.4")]);
        let snap = CycleNodeRequestNode::from_node(&n, "workers");
        assert_eq!(snap.private_ip, "");
    }

    #[test]
    fn recreated_node_with_reused_name_is_a_different_node() {
        let snap = CycleNodeRequestNode::from_node(&node("n1", "aws:///i-1", vec![]), "g");
        assert!(snap.is_same_node(&node("n1", "aws:///i-1", vec![])));
        assert!(!snap.is_same_node(&node("n1", "aws:///i-2", vec![])));
        assert!(!snap.is_same_node(&node("n2", "aws:///i-1", vec![])));
    }

    #[test]
    fn selector_renders_and_matches() {
        let sel = LabelSelector::from_labels([("role", "worker"), ("team", "infra")]);
        assert_eq!(sel.to_selector_string(), "role=worker,team=infra");

        let mut labels = BTreeMap::new();
        labels.insert("role".to_string(), "worker".to_string());
        assert!(!sel.matches(&labels));
        labels.insert("team".to_string(), "infra".to_string());
        assert!(sel.matches(&labels));
    }

    #[test]
    fn settings_defaults_from_empty_yaml() {
        let settings: CycleSettings = serde_json::from_str("{}").expect("parse");
        assert_eq!(settings.method, CycleNodeRequestMethod::Drain);
        assert_eq!(settings.concurrency, 0);
        assert!(settings.fail_on_drain_failure);
        assert!(settings.validate().is_ok());
    }

    #[test]
    fn settings_validation_rejects_bad_values() {
        let settings = CycleSettings {
            concurrency: -1,
            ..Default::default()
        };
        assert!(settings.validate().unwrap_err().contains("concurrency"));

        let mut settings = CycleSettings::default();
        settings
            .daemonset_pods_to_remove
            .daemonset_pods_labels_to_wait
            .insert("app".to_string(), "agent".to_string());
        assert!(settings.validate().unwrap_err().contains("nodeLabelsToRemove"));
    }
}
