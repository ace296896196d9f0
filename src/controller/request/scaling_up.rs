//! ScalingUp phase handler.
//!
//! Raises the node group's capacity so replacements come up before the batch
//! is drained, and waits for them to become ready.

use std::time::Duration;

use kube::runtime::controller::Action;
use tracing::{debug, info, warn};

use super::nodes::{instance_map, list_ready_nodes, snapshot};
use super::waiting_termination::ensure_node_status;
use super::{current_status, transition};
use crate::controller::{claimed_by, elapsed_since, Context};
use crate::crd::{CycleNodeRequest, CycleNodeRequestPhase};
use crate::Error;

/// Handle a request in the ScalingUp phase.
pub async fn handle_scaling_up(cnr: &CycleNodeRequest, ctx: &Context) -> Result<Action, Error> {
    let group = &cnr.spec.node_group_name;
    let mut status = current_status(cnr);

    let Some(scale_up) = status.scale_up.clone() else {
        warn!("scale-up targets missing, selecting the batch again");
        transition(cnr, ctx, status, CycleNodeRequestPhase::Initialised, None).await?;
        return Ok(Action::requeue(Duration::from_secs(1)));
    };

    let timeout = ctx.options.scale_up_timeout;
    if elapsed_since(Some(&scale_up.started_at)).is_some_and(|elapsed| elapsed > timeout) {
        let message = format!(
            "timed out after {:?} waiting for {} ready nodes in node group {}",
            timeout, scale_up.target_ready_nodes, group
        );
        warn!(%message, "scale-up timed out");
        transition(cnr, ctx, status, CycleNodeRequestPhase::Healing, Some(message)).await?;
        return Ok(Action::requeue(Duration::from_secs(1)));
    }

    // Only ever raise: capacity already above target is spare we keep.
    let desired = ctx.provider.desired_capacity(group).await?;
    if desired < scale_up.target_capacity {
        info!(
            desired,
            target = scale_up.target_capacity,
            node_group = %group,
            "raising node group capacity"
        );
        ctx.provider
            .set_desired_capacity(group, scale_up.target_capacity)
            .await?;
    }

    let ready = list_ready_nodes(cnr, ctx, true).await?;
    if (ready.len() as u32) < scale_up.target_ready_nodes {
        debug!(
            ready = ready.len(),
            target = scale_up.target_ready_nodes,
            "waiting for replacement nodes"
        );
        return Ok(Action::requeue(ctx.options.poll_interval));
    }

    let instances = instance_map(ctx.provider.instances(group).await?);
    for node in &ready {
        let known = status
            .nodes_available
            .iter()
            .chain(status.nodes_to_terminate.iter())
            .any(|s| s.is_same_node(node));
        if !known && claimed_by(node).is_none() {
            status.nodes_available.push(snapshot(cnr, node, &instances));
        }
    }

    for node in &status.current_nodes {
        ensure_node_status(cnr, ctx, node).await?;
    }

    info!(ready = ready.len(), "replacement capacity ready, draining batch");
    status.scale_up = None;
    transition(
        cnr,
        ctx,
        status,
        CycleNodeRequestPhase::WaitingTermination,
        None,
    )
    .await?;
    Ok(Action::requeue(ctx.options.step_interval))
}
