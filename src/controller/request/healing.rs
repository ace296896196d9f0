//! Healing phase handler.
//!
//! Stops the drains of the current batch and hands every node this request
//! still claims back to the cluster, then fails the request. Raised capacity
//! is left in place; the node group's own scaling owns it from here.

use std::time::Duration;

use kube::runtime::controller::Action;
use kube::ResourceExt;
use tracing::{info, warn};

use super::nodes::release_node;
use super::{current_status, namespace_of, transition};
use crate::controller::Context;
use crate::crd::{
    CycleNodeRequest, CycleNodeRequestNode, CycleNodeRequestPhase, CycleNodeStatusPhase,
};
use crate::{Error, CLAIM_LABEL};

/// Handle a request in the Healing phase.
pub async fn handle_healing(cnr: &CycleNodeRequest, ctx: &Context) -> Result<Action, Error> {
    let name = cnr.name_any();
    let namespace = namespace_of(cnr, ctx);
    let mut status = current_status(cnr);

    for node in &status.current_nodes {
        stop_drain(cnr, ctx, &namespace, node).await?;
        release_node(cnr, ctx, node, true).await?;
    }

    // Claims this request made but never recorded in the batch.
    let stray = ctx
        .nodes
        .list_nodes(&format!("{}={}", CLAIM_LABEL, name))
        .await?;
    for live in &stray {
        warn!(node = %live.name_any(), "releasing claim missing from the batch");
        let snap = CycleNodeRequestNode::from_node(live, cnr.spec.node_group_name.clone());
        release_node(cnr, ctx, &snap, false).await?;
    }

    let message = status
        .message
        .clone()
        .unwrap_or_else(|| "request failed".to_string());
    status.current_nodes.clear();
    status.scale_up = None;
    transition(cnr, ctx, status, CycleNodeRequestPhase::Failed, Some(message)).await?;
    Ok(Action::requeue(Duration::from_secs(1)))
}

/// Delete a node's CycleNodeStatus unless it already failed
///
/// A failed status is kept so its message stays visible.
pub(super) async fn stop_drain(
    cnr: &CycleNodeRequest,
    ctx: &Context,
    namespace: &str,
    node: &CycleNodeRequestNode,
) -> Result<(), Error> {
    let cns_name = cnr.status_name_for(&node.name);
    let Some(cns) = ctx.store.get_node_status(namespace, &cns_name).await? else {
        return Ok(());
    };
    if cns.phase() == CycleNodeStatusPhase::Failed {
        return Ok(());
    }
    info!(node = %node.name, status = %cns_name, "stopping drain");
    ctx.store.delete_node_status(namespace, &cns_name).await
}
