//! Initialised phase handler.
//!
//! Selects and claims the next batch of nodes, then records the capacity the
//! node group needs before the batch can be drained.

use std::time::Duration;

use k8s_openapi::api::core::v1::Node;
use kube::runtime::controller::Action;
use kube::ResourceExt;
use tracing::{debug, info, warn};

use super::nodes::{
    get_nodes_to_terminate, instance_map, list_ready_nodes, release_node, snapshot,
};
use super::{current_status, transition, update_status};
use crate::controller::{claimed_by, now_rfc3339, provider_id, Context};
use crate::crd::{CycleNodeRequest, CycleNodeRequestPhase, ScaleUpStatus};
use crate::{Error, CLAIM_LABEL};

/// Handle a request in the Initialised phase.
pub async fn handle_initialised(cnr: &CycleNodeRequest, ctx: &Context) -> Result<Action, Error> {
    let name = cnr.name_any();
    let group = &cnr.spec.node_group_name;
    let mut status = current_status(cnr);

    let instances = instance_map(ctx.provider.instances(group).await?);
    // A terminated instance's Node object can linger; only live members count.
    let live: Vec<Node> = list_ready_nodes(cnr, ctx, true)
        .await?
        .into_iter()
        .filter(|n| instances.contains_key(provider_id(n)))
        .collect();

    let concurrency = cnr.effective_concurrency();
    let selection = get_nodes_to_terminate(cnr, &mut status, &live, concurrency)?;
    let mut contended = selection.contended;

    if selection.nodes.is_empty() && selection.in_progress.is_empty() {
        if contended > 0 {
            info!(contended, "waiting for nodes claimed by other requests");
            update_status(cnr, ctx, &status).await?;
            return Ok(Action::requeue(ctx.options.poll_interval));
        }
        info!(cycled = status.num_nodes_cycled, "all nodes cycled");
        transition(cnr, ctx, status, CycleNodeRequestPhase::Successful, None).await?;
        return Ok(Action::requeue(Duration::from_secs(1)));
    }

    let budget = (concurrency.max(0) as usize).saturating_sub(selection.num_in_progress());
    let mut batch = Vec::with_capacity(concurrency.max(0) as usize);

    for node in &selection.in_progress {
        warn!(node = %node.name_any(), "re-adopting node already claimed by this request");
        batch.push(snapshot(cnr, node, &instances));
    }

    let mut claimed = Vec::new();
    for node in selection.nodes.iter().take(budget) {
        match claim_node(ctx, node, &name).await {
            Ok(Claim::Taken(fresh)) => {
                let snap = snapshot(cnr, &fresh, &instances);
                claimed.push(snap.clone());
                batch.push(snap);
            }
            Ok(Claim::Contended) => contended += 1,
            Ok(Claim::Gone) => {}
            Err(e) => {
                // Claims made in this pass are not recorded yet; hand them back.
                for snap in &claimed {
                    if let Err(release_err) = release_node(cnr, ctx, snap, false).await {
                        warn!(node = %snap.name, error = %release_err, "failed to release claim");
                    }
                }
                return Err(e);
            }
        }
    }

    if batch.is_empty() {
        info!(contended, "lost every claim in this pass, retrying");
        update_status(cnr, ctx, &status).await?;
        return Ok(Action::requeue(ctx.options.poll_interval));
    }

    let scale_up = ScaleUpStatus {
        target_capacity: (instances.len() + batch.len()) as i64,
        target_ready_nodes: (live.len() + batch.len()) as u32,
        started_at: now_rfc3339(),
    };
    info!(
        batch = batch.len(),
        target_capacity = scale_up.target_capacity,
        target_ready_nodes = scale_up.target_ready_nodes,
        "starting batch"
    );
    status.current_nodes = batch;
    status.scale_up = Some(scale_up);
    transition(cnr, ctx, status, CycleNodeRequestPhase::ScalingUp, None).await?;
    Ok(Action::requeue(Duration::from_secs(1)))
}

/// Outcome of one claim attempt
enum Claim {
    /// The node now carries this request's claim
    Taken(Node),
    /// Another request claimed the node first
    Contended,
    /// The node vanished or was replaced
    Gone,
}

/// Claim a node for the request
///
/// Decides on a fresh read and writes the claim conditionally on that read,
/// so two requests racing for the same node cannot both win.
async fn claim_node(ctx: &Context, node: &Node, request: &str) -> Result<Claim, Error> {
    let node_name = node.name_any();
    let fresh = match ctx.nodes.get_node(&node_name).await {
        Ok(fresh) => fresh,
        Err(e) if e.is_not_found() => {
            debug!(node = %node_name, "node disappeared before it was claimed");
            return Ok(Claim::Gone);
        }
        Err(e) => return Err(e),
    };
    if provider_id(&fresh) != provider_id(node) {
        debug!(node = %node_name, "node was replaced before it was claimed");
        return Ok(Claim::Gone);
    }
    if let Some(owner) = claimed_by(&fresh).filter(|owner| *owner != request) {
        info!(node = %node_name, %owner, "node claimed by another request, skipping");
        return Ok(Claim::Contended);
    }

    let resource_version = fresh.metadata.resource_version.clone().unwrap_or_default();
    let taken = match ctx
        .nodes
        .patch_node_label(&node_name, CLAIM_LABEL, request, &resource_version)
        .await
    {
        Ok(taken) => taken,
        Err(e) if e.is_not_found() => return Ok(Claim::Gone),
        Err(e) => return Err(e),
    };
    if !taken {
        info!(node = %node_name, "node changed while claiming, leaving it for now");
        return Ok(Claim::Contended);
    }

    info!(node = %node_name, "claimed node");
    let mut fresh = fresh;
    fresh
        .metadata
        .labels
        .get_or_insert_with(Default::default)
        .insert(CLAIM_LABEL.to_string(), request.to_string());
    Ok(Claim::Taken(fresh))
}
