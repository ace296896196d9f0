//! Pending phase handler.
//!
//! Resolves the request's nodes once: which ready nodes belong to the node
//! group, and which of them are to be cycled.

use std::time::Duration;

use k8s_openapi::api::core::v1::Node;
use kube::runtime::controller::Action;
use kube::ResourceExt;
use tracing::{info, warn};

use super::nodes::{add_named_nodes_to_terminate, instance_map, list_ready_nodes, snapshot};
use super::{current_status, transition};
use crate::controller::{provider_id, Context};
use crate::crd::{CycleNodeRequest, CycleNodeRequestPhase};
use crate::Error;

/// Handle a request in the Pending phase.
pub async fn handle_pending(cnr: &CycleNodeRequest, ctx: &Context) -> Result<Action, Error> {
    let name = cnr.name_any();
    cnr.spec
        .cycle_settings
        .validate()
        .map_err(|reason| Error::validation_for(&name, reason))?;

    let group = &cnr.spec.node_group_name;
    let ready = list_ready_nodes(cnr, ctx, false).await?;
    let instances = match ctx.provider.instances(group).await {
        Ok(instances) => instance_map(instances),
        Err(e) if e.is_not_found() => {
            return Err(Error::validation_for(
                &name,
                format!("node group {} not found in {}", group, ctx.provider.name()),
            ))
        }
        Err(e) => return Err(e),
    };

    let mut members: Vec<Node> = Vec::with_capacity(ready.len());
    for node in ready {
        let id = provider_id(&node);
        if instances.contains_key(id) {
            members.push(node);
            continue;
        }
        match ctx.provider.node_group_of(id).await {
            Ok(owner) if owner == *group => members.push(node),
            Ok(owner) => {
                warn!(node = %node.name_any(), %owner, "node matches selector but belongs to another node group");
            }
            Err(e) if e.is_not_found() => {
                warn!(node = %node.name_any(), provider_id = %id, "node has no instance in the provider");
            }
            Err(e) => return Err(e),
        }
    }

    let mut status = current_status(cnr);
    status.nodes_available.clear();
    status.nodes_to_terminate.clear();

    if cnr.spec.node_names.is_empty() {
        let snapshots: Vec<_> = members
            .iter()
            .map(|n| snapshot(cnr, n, &instances))
            .collect();
        status.nodes_available = snapshots.clone();
        status.nodes_to_terminate = snapshots;
    } else {
        add_named_nodes_to_terminate(cnr, &mut status, &members, &instances)?;
    }

    if status.nodes_to_terminate.is_empty() {
        info!("no nodes to cycle");
        transition(
            cnr,
            ctx,
            status,
            CycleNodeRequestPhase::Successful,
            Some("no nodes matched the request".to_string()),
        )
        .await?;
        return Ok(Action::requeue(Duration::from_secs(1)));
    }

    info!(
        nodes = status.nodes_to_terminate.len(),
        node_group = %group,
        "resolved nodes to cycle"
    );
    transition(cnr, ctx, status, CycleNodeRequestPhase::Initialised, None).await?;
    Ok(Action::requeue(Duration::from_secs(1)))
}
