//! Drain steps
//!
//! Every step returns `Ok(true)` once its condition holds and `Ok(false)`
//! while work remains. A step that mutated the cluster in this call reports
//! `false`; the next call confirms the result. Calling a finished step again
//! mutates nothing.

use k8s_openapi::api::core::v1::Pod;
use kube::ResourceExt;
use tracing::{debug, info};

use crate::controller::{
    is_relevant_pod, pod_contains_label, pod_has_node_selector, pod_is_daemonset, Context,
    Eviction,
};
use crate::crd::CycleNodeStatus;
use crate::Error;

fn relevant_pods(cns: &CycleNodeStatus, pods: Vec<Pod>) -> Vec<Pod> {
    pods.into_iter()
        .filter(|p| is_relevant_pod(p, &cns.spec.cycle_settings))
        .collect()
}

/// Remove `labelsToRemove` from every pod on the node
pub async fn remove_pod_labels(cns: &CycleNodeStatus, ctx: &Context) -> Result<bool, Error> {
    let keys = &cns.spec.cycle_settings.labels_to_remove;
    if keys.is_empty() {
        return Ok(true);
    }

    let mut patched = 0;
    for pod in ctx.nodes.get_pods_on_node(cns.node_name()).await? {
        let present: Vec<String> = pod
            .metadata
            .labels
            .as_ref()
            .map(|labels| {
                keys.iter()
                    .filter(|k| labels.contains_key(k.as_str()))
                    .cloned()
                    .collect()
            })
            .unwrap_or_default();
        if present.is_empty() {
            continue;
        }
        let namespace = pod.namespace().unwrap_or_default();
        debug!(pod = %pod.name_any(), %namespace, labels = ?present, "removing pod labels");
        ctx.nodes
            .remove_pod_labels(&namespace, &pod.name_any(), &present)
            .await?;
        patched += 1;
    }

    if patched > 0 {
        info!(pods = patched, "removed labels from pods");
    }
    Ok(patched == 0)
}

/// Remove the configured `nodeLabelsToRemove` keys from the node
pub async fn remove_labels_from_node(
    cns: &CycleNodeStatus,
    ctx: &Context,
) -> Result<bool, Error> {
    let configured = &cns
        .spec
        .cycle_settings
        .daemonset_pods_to_remove
        .node_labels_to_remove;
    if configured.is_empty() {
        return Ok(true);
    }

    let node = ctx.nodes.get_node(cns.node_name()).await?;
    let labels = node.metadata.labels.unwrap_or_default();
    let present: Vec<String> = configured
        .keys()
        .filter(|k| labels.contains_key(k.as_str()))
        .cloned()
        .collect();

    if present.is_empty() {
        return Ok(true);
    }
    info!(labels = ?present, "removing node labels");
    ctx.nodes.remove_labels(cns.node_name(), &present).await?;
    Ok(false)
}

/// Wait until the daemonset pods targeted by the node label removal are gone
///
/// Only pods owned by a DaemonSet whose labels match `daemonsetPodsLabelsToWait`
/// and whose node selector matches `nodeLabelsToRemove` are waited for.
pub async fn wait_targeted_daemonset_pods_removed(
    cns: &CycleNodeStatus,
    ctx: &Context,
) -> Result<bool, Error> {
    let config = &cns.spec.cycle_settings.daemonset_pods_to_remove;
    let pods = ctx.nodes.get_pods_on_node(cns.node_name()).await?;

    let targeted = pods
        .iter()
        .filter(|p| pod_is_daemonset(p))
        .filter(|p| pod_contains_label(p, &config.daemonset_pods_labels_to_wait))
        .filter(|p| pod_has_node_selector(p, &config.node_labels_to_remove))
        .count();

    if targeted > 0 {
        debug!(pods = targeted, "waiting for targeted daemonset pods to leave");
    }
    Ok(targeted == 0)
}

/// Evict every pod that must leave the node
pub async fn evict_pods(cns: &CycleNodeStatus, ctx: &Context) -> Result<bool, Error> {
    let pods = relevant_pods(cns, ctx.nodes.get_pods_on_node(cns.node_name()).await?);
    if pods.is_empty() {
        return Ok(true);
    }

    let mut blocked = 0;
    for pod in &pods {
        let namespace = pod.namespace().unwrap_or_default();
        match ctx.nodes.evict_pod(&namespace, &pod.name_any()).await? {
            Eviction::Evicted => debug!(pod = %pod.name_any(), %namespace, "evicted pod"),
            Eviction::Gone => {}
            Eviction::Blocked => {
                debug!(pod = %pod.name_any(), %namespace, "eviction blocked by disruption budget");
                blocked += 1;
            }
        }
    }
    info!(pods = pods.len(), blocked, "evicting pods");
    Ok(false)
}

/// Wait for every pod that must leave the node to go on its own
pub async fn wait_pods_removed(cns: &CycleNodeStatus, ctx: &Context) -> Result<bool, Error> {
    let pods = relevant_pods(cns, ctx.nodes.get_pods_on_node(cns.node_name()).await?);
    if !pods.is_empty() {
        debug!(pods = pods.len(), "waiting for pods to leave the node");
    }
    Ok(pods.is_empty())
}

/// Final check before the node is handed over for termination
///
/// The node must have reported an internal address and no workload may have
/// come back.
pub async fn check_node_health(cns: &CycleNodeStatus, ctx: &Context) -> Result<bool, Error> {
    let has_address = cns
        .status
        .as_ref()
        .and_then(|s| s.current_node.as_ref())
        .is_some_and(|n| !n.private_ip.is_empty());
    if !has_address {
        return Err(Error::drain(
            cns.node_name(),
            "node has no internal IP address",
        ));
    }

    wait_pods_removed(cns, ctx).await
}
