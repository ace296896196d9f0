//! WaitingTermination phase handler.
//!
//! Watches the CycleNodeStatus of every node in the batch and terminates each
//! instance once its drain has succeeded.

use std::collections::BTreeMap;
use std::time::Duration;

use kube::runtime::controller::Action;
use kube::{Resource, ResourceExt};
use tracing::{info, warn};

use super::nodes::release_node;
use super::{current_status, namespace_of, transition, update_status};
use crate::controller::Context;
use crate::crd::{
    CycleNodeRequest, CycleNodeRequestNode, CycleNodeRequestPhase, CycleNodeStatus,
    CycleNodeStatusPhase, CycleNodeStatusSpec,
};
use crate::{metrics, Error, REQUEST_LABEL};

/// Build the CycleNodeStatus that drains `node` for the request
pub fn node_status_for(
    cnr: &CycleNodeRequest,
    ctx: &Context,
    node: &CycleNodeRequestNode,
) -> CycleNodeStatus {
    let mut cns = CycleNodeStatus::new(
        &cnr.status_name_for(&node.name),
        CycleNodeStatusSpec {
            node_name: node.name.clone(),
            provider_id: node.provider_id.clone(),
            request_name: cnr.name_any(),
            cycle_settings: cnr.spec.cycle_settings.clone(),
        },
    );
    cns.metadata.namespace = Some(namespace_of(cnr, ctx));
    cns.metadata.labels = Some(BTreeMap::from([(
        REQUEST_LABEL.to_string(),
        cnr.name_any(),
    )]));
    cns.metadata.owner_references = cnr.controller_owner_ref(&()).map(|r| vec![r]);
    cns
}

/// Create the CycleNodeStatus for a node unless it already exists
pub(super) async fn ensure_node_status(
    cnr: &CycleNodeRequest,
    ctx: &Context,
    node: &CycleNodeRequestNode,
) -> Result<(), Error> {
    let cns = node_status_for(cnr, ctx, node);
    info!(node = %node.name, status = %cns.name_any(), "creating CycleNodeStatus");
    ctx.store.create_node_status(&cns).await
}

/// Handle a request in the WaitingTermination phase.
pub async fn handle_waiting_termination(
    cnr: &CycleNodeRequest,
    ctx: &Context,
) -> Result<Action, Error> {
    let namespace = namespace_of(cnr, ctx);
    let settings = &cnr.spec.cycle_settings;
    let mut status = current_status(cnr);
    let batch = std::mem::take(&mut status.current_nodes);
    let mut remaining = Vec::with_capacity(batch.len());
    let mut drain_failure = None;

    for (i, node) in batch.iter().enumerate() {
        let cns_name = cnr.status_name_for(&node.name);
        let Some(cns) = ctx.store.get_node_status(&namespace, &cns_name).await? else {
            warn!(node = %node.name, "CycleNodeStatus missing, recreating");
            ensure_node_status(cnr, ctx, node).await?;
            remaining.push(node.clone());
            continue;
        };

        match cns.phase() {
            CycleNodeStatusPhase::Successful => {
                match ctx.provider.terminate_instance(&node.provider_id).await {
                    Ok(()) => {}
                    Err(e) if e.is_not_found() => {}
                    Err(e) => return Err(e),
                }
                info!(node = %node.name, provider_id = %node.provider_id, "terminated instance");
                metrics::record_node_terminated(&node.node_group_name);
                status.num_nodes_cycled += 1;
                status.terminated_nodes.push(node.clone());
                // The Node object can outlive its instance; drop the claim so
                // nothing mistakes it for work in progress.
                if let Err(e) = release_node(cnr, ctx, node, false).await {
                    warn!(node = %node.name, error = %e, "failed to release terminated node");
                }
            }
            CycleNodeStatusPhase::Failed => {
                let reason = cns
                    .status
                    .as_ref()
                    .and_then(|s| s.message.clone())
                    .unwrap_or_else(|| "drain failed".to_string());

                if settings.fail_on_drain_failure {
                    warn!(node = %node.name, %reason, "drain failed, failing request");
                    drain_failure = Some(format!("drain of node {} failed: {}", node.name, reason));
                    remaining.extend(batch[i..].iter().cloned());
                    break;
                }

                warn!(node = %node.name, %reason, "drain failed, skipping node");
                release_node(cnr, ctx, node, true).await?;
                status.skipped_nodes.push(node.clone());
            }
            _ => remaining.push(node.clone()),
        }
    }

    status.current_nodes = remaining;
    if let Some(message) = drain_failure {
        transition(cnr, ctx, status, CycleNodeRequestPhase::Healing, Some(message)).await?;
        return Ok(Action::requeue(Duration::from_secs(1)));
    }

    status.num_nodes_in_progress = status.current_nodes.len() as u32;

    if status.current_nodes.is_empty() {
        info!("batch finished");
        transition(cnr, ctx, status, CycleNodeRequestPhase::Initialised, None).await?;
        return Ok(Action::requeue(Duration::from_secs(1)));
    }

    update_status(cnr, ctx, &status).await?;
    Ok(Action::requeue(ctx.options.poll_interval))
}
