//! Node and pod predicates shared by both state machines

use std::collections::BTreeMap;

use k8s_openapi::api::core::v1::{Node, Pod};

use crate::crd::CycleSettings;
use crate::CLAIM_LABEL;

/// Annotation the kubelet puts on mirror pods of static manifests
const MIRROR_POD_ANNOTATION: &str = "kubernetes.io/config.mirror";

/// Check if a node reports a true `Ready` condition
pub fn is_node_ready(node: &Node) -> bool {
    node.status
        .as_ref()
        .and_then(|s| s.conditions.as_ref())
        .map(|conds| {
            conds
                .iter()
                .any(|c| c.type_ == "Ready" && c.status == "True")
        })
        .unwrap_or(false)
}

/// Name of the request that has claimed the node, if any
pub fn claimed_by(node: &Node) -> Option<&str> {
    node.metadata
        .labels
        .as_ref()
        .and_then(|l| l.get(CLAIM_LABEL))
        .map(String::as_str)
}

/// Provider ID of a node, empty when unset
pub fn provider_id(node: &Node) -> &str {
    node.spec
        .as_ref()
        .and_then(|s| s.provider_id.as_deref())
        .unwrap_or_default()
}

/// Check if a node is already marked unschedulable
pub fn is_cordoned(node: &Node) -> bool {
    node.spec
        .as_ref()
        .and_then(|s| s.unschedulable)
        .unwrap_or(false)
}

/// Check if a pod is controlled by a DaemonSet
pub fn pod_is_daemonset(pod: &Pod) -> bool {
    pod.metadata
        .owner_references
        .as_ref()
        .map(|refs| {
            refs.iter()
                .any(|r| r.controller == Some(true) && r.kind == "DaemonSet")
        })
        .unwrap_or(false)
}

/// Check if a pod is the API mirror of a static pod
pub fn is_mirror_pod(pod: &Pod) -> bool {
    pod.metadata
        .annotations
        .as_ref()
        .map(|a| a.contains_key(MIRROR_POD_ANNOTATION))
        .unwrap_or(false)
}

/// Check if a pod has run to completion
pub fn pod_is_finished(pod: &Pod) -> bool {
    matches!(
        pod.status.as_ref().and_then(|s| s.phase.as_deref()),
        Some("Succeeded") | Some("Failed")
    )
}

/// Check if any of the given key/value pairs is among the pod's labels
pub fn pod_contains_label(pod: &Pod, labels: &BTreeMap<String, String>) -> bool {
    let Some(pod_labels) = pod.metadata.labels.as_ref() else {
        return false;
    };
    labels.iter().any(|(k, v)| pod_labels.get(k) == Some(v))
}

/// Check if any of the given key/value pairs is in the pod's node selector
pub fn pod_has_node_selector(pod: &Pod, selectors: &BTreeMap<String, String>) -> bool {
    let Some(node_selector) = pod.spec.as_ref().and_then(|s| s.node_selector.as_ref()) else {
        return false;
    };
    selectors
        .iter()
        .any(|(k, v)| node_selector.get(k) == Some(v))
}

/// Check if a pod matches the ignore rules of the settings
///
/// A pod is ignored when its namespace is listed in `ignoreNamespaces`, or
/// when any of its labels carries one of the values listed for that key in
/// `ignorePodsLabels`.
pub fn pod_is_ignored(pod: &Pod, settings: &CycleSettings) -> bool {
    let namespace = pod.metadata.namespace.as_deref().unwrap_or_default();
    if settings.ignore_namespaces.iter().any(|ns| ns == namespace) {
        return true;
    }

    let Some(labels) = pod.metadata.labels.as_ref() else {
        return false;
    };
    settings
        .ignore_pods_labels
        .iter()
        .any(|(key, values)| labels.get(key).is_some_and(|v| values.contains(v)))
}

/// Check if a pod still counts as a workload that must leave the node
///
/// DaemonSet pods, mirror pods, completed pods and ignored pods do not.
pub fn is_relevant_pod(pod: &Pod, settings: &CycleSettings) -> bool {
    !pod_is_daemonset(pod)
        && !is_mirror_pod(pod)
        && !pod_is_finished(pod)
        && !pod_is_ignored(pod, settings)
}
