//! Node listing and selection for a CycleNodeRequest

use std::collections::HashMap;

use k8s_openapi::api::core::v1::Node;
use kube::ResourceExt;
use tracing::{debug, info};

use crate::controller::{claimed_by, is_cordoned, is_node_ready, provider_id, Context};
use crate::crd::{CycleNodeRequest, CycleNodeRequestNode, CycleNodeRequestStatus};
use crate::provider::Instance;
use crate::{Error, CLAIM_LABEL};

/// Result of one selection pass over `nodesToTerminate`
#[derive(Debug, Default)]
pub struct Selection {
    /// Live nodes selected for this batch, not yet claimed
    pub nodes: Vec<Node>,
    /// Live nodes already claimed by this request
    pub in_progress: Vec<Node>,
    /// Number of nodes skipped because another request claimed them
    pub contended: u32,
}

impl Selection {
    /// Number of nodes already claimed by this request
    pub fn num_in_progress(&self) -> usize {
        self.in_progress.len()
    }
}

/// List ready nodes matching the request's selector
///
/// With `include_in_progress` false, nodes already claimed by this request are
/// left out so they are never selected twice.
pub async fn list_ready_nodes(
    cnr: &CycleNodeRequest,
    ctx: &Context,
    include_in_progress: bool,
) -> Result<Vec<Node>, Error> {
    let selector = cnr.node_label_selector()?;
    let name = cnr.name_any();
    let nodes = ctx.nodes.list_nodes(&selector).await?;

    Ok(nodes
        .into_iter()
        .filter(|n| include_in_progress || claimed_by(n) != Some(name.as_str()))
        .filter(|n| is_node_ready(n))
        .collect())
}

/// Select up to `num_nodes` nodes of `nodesToTerminate` that have not been actioned
///
/// Each snapshot is matched against `live_nodes` by name and provider ID. A
/// match claimed by this request counts as in progress; one claimed by another
/// request is contended and skipped. Nodes this request already terminated or
/// released are never selected again. The scan stops once `num_nodes` nodes
/// are selected, so in-progress and contended counts only cover the nodes
/// scanned up to that point. Selected nodes are dropped from `nodesAvailable`
/// so the two lists stay disjoint for every node in work.
pub fn get_nodes_to_terminate(
    cnr: &CycleNodeRequest,
    status: &mut CycleNodeRequestStatus,
    live_nodes: &[Node],
    num_nodes: i64,
) -> Result<Selection, Error> {
    if num_nodes < 0 {
        return Err(Error::invalid_argument(format!(
            "numNodes must be positive: got {}",
            num_nodes
        )));
    }

    let name = cnr.name_any();
    let mut selection = Selection::default();

    for snapshot in &status.nodes_to_terminate {
        if num_nodes > 0 && selection.nodes.len() as i64 >= num_nodes {
            break;
        }
        if status.is_finished(snapshot) {
            continue;
        }
        let Some(live) = live_nodes.iter().find(|n| snapshot.is_same_node(n)) else {
            continue;
        };

        match claimed_by(live) {
            Some(owner) if owner == name => selection.in_progress.push(live.clone()),
            Some(_) => selection.contended += 1,
            None if (selection.nodes.len() as i64) < num_nodes => {
                selection.nodes.push(live.clone())
            }
            None => {}
        }
    }

    let selected: Vec<&str> = selection
        .nodes
        .iter()
        .chain(selection.in_progress.iter())
        .filter_map(|n| n.metadata.name.as_deref())
        .collect();
    status.nodes_available = status
        .nodes_available
        .iter()
        .filter(|n| !selected.contains(&n.name.as_str()))
        .cloned()
        .collect();

    Ok(selection)
}

/// Add the explicitly named nodes of the request to both node lists
///
/// All-or-nothing: if any name is missing from `live_nodes` the status is
/// left untouched and [`Error::NodeNotFound`] names the missing node.
pub fn add_named_nodes_to_terminate(
    cnr: &CycleNodeRequest,
    status: &mut CycleNodeRequestStatus,
    live_nodes: &[Node],
    instances: &HashMap<String, Instance>,
) -> Result<(), Error> {
    let mut snapshots = Vec::with_capacity(cnr.spec.node_names.len());
    for named in &cnr.spec.node_names {
        let live = live_nodes
            .iter()
            .find(|n| n.metadata.name.as_deref() == Some(named.as_str()))
            .ok_or_else(|| Error::node_not_found(named))?;
        snapshots.push(snapshot(cnr, live, instances));
    }

    status.nodes_available.extend(snapshots.iter().cloned());
    status.nodes_to_terminate.extend(snapshots);
    Ok(())
}

/// Snapshot a live node, taking its group from the provider's instance map
pub fn snapshot(
    cnr: &CycleNodeRequest,
    node: &Node,
    instances: &HashMap<String, Instance>,
) -> CycleNodeRequestNode {
    let group = instances
        .get(provider_id(node))
        .map(|i| i.node_group_name.as_str())
        .unwrap_or(cnr.spec.node_group_name.as_str());
    CycleNodeRequestNode::from_node(node, group)
}

/// Hand a node claimed by this request back to the cluster
///
/// Removes the claim label and, with `uncordon`, makes the node schedulable
/// again. Nodes that vanished, were replaced, or are not claimed by this
/// request are left alone.
pub async fn release_node(
    cnr: &CycleNodeRequest,
    ctx: &Context,
    node: &CycleNodeRequestNode,
    uncordon: bool,
) -> Result<(), Error> {
    let name = cnr.name_any();
    let live = match ctx.nodes.get_node(&node.name).await {
        Ok(live) => live,
        Err(e) if e.is_not_found() => {
            debug!(node = %node.name, "node already gone");
            return Ok(());
        }
        Err(e) => return Err(e),
    };
    if !node.is_same_node(&live) || claimed_by(&live) != Some(name.as_str()) {
        return Ok(());
    }

    if uncordon && is_cordoned(&live) {
        ignore_not_found(ctx.nodes.uncordon_node(&node.name).await)?;
    }
    ignore_not_found(
        ctx.nodes
            .remove_labels(&node.name, &[CLAIM_LABEL.to_string()])
            .await,
    )?;
    info!(node = %node.name, uncordon, "released node");
    Ok(())
}

fn ignore_not_found(result: Result<(), Error>) -> Result<(), Error> {
    match result {
        Err(e) if e.is_not_found() => Ok(()),
        other => other,
    }
}

/// Index instances by provider ID
pub fn instance_map(instances: Vec<Instance>) -> HashMap<String, Instance> {
    instances
        .into_iter()
        .map(|i| (i.provider_id.clone(), i))
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::controller::testing::{node, sample_request, FakeCluster};
    use crate::controller::{ControllerOptions, ResourceManager};
    use crate::provider::FakeCloudProvider;
    use crate::CLAIM_LABEL;
    use std::sync::Arc;

    fn claimed(mut n: Node, by: &str) -> Node {
        n.metadata
            .labels
            .get_or_insert_with(Default::default)
            .insert(CLAIM_LABEL.to_string(), by.to_string());
        n
    }

    fn with_role(mut n: Node) -> Node {
        n.metadata
            .labels
            .get_or_insert_with(Default::default)
            .insert("role".to_string(), "workers".to_string());
        n
    }

    fn status_for(nodes: &[Node]) -> CycleNodeRequestStatus {
        let snapshots: Vec<_> = nodes
            .iter()
            .map(|n| CycleNodeRequestNode::from_node(n, "workers"))
            .collect();
        CycleNodeRequestStatus {
            nodes_available: snapshots.clone(),
            nodes_to_terminate: snapshots,
            ..Default::default()
        }
    }

    fn assert_disjoint_for(selection: &Selection, status: &CycleNodeRequestStatus) {
        for n in selection.nodes.iter().chain(selection.in_progress.iter()) {
            let name = n.name_any();
            assert!(
                !status.nodes_available.iter().any(|a| a.name == name),
                "{} still available",
                name
            );
        }
    }

    #[tokio::test]
    async fn ready_listing_hides_own_claims_unless_counting() {
        let cluster = Arc::new(FakeCluster::new());
        cluster.add_node(with_role(node("n1", "fake:///1", true)));
        cluster.add_node(with_role(claimed(node("n2", "fake:///2", true), "upgrade")));
        cluster.add_node(with_role(node("n3", "fake:///3", false)));
        cluster.add_node(with_role(claimed(node("n4", "fake:///4", true), "other")));
        let ctx = Context::for_testing(
            cluster.clone(),
            cluster.clone(),
            Arc::new(FakeCloudProvider::new()),
            ControllerOptions::default(),
        );
        let cnr = sample_request("upgrade", "workers", 1);

        let names = |nodes: Vec<Node>| nodes.iter().map(|n| n.name_any()).collect::<Vec<_>>();
        let selecting = list_ready_nodes(&cnr, &ctx, false).await.expect("list");
        assert_eq!(names(selecting), vec!["n1", "n4"]);
        let counting = list_ready_nodes(&cnr, &ctx, true).await.expect("list");
        assert_eq!(names(counting), vec!["n1", "n2", "n4"]);
        assert_eq!(cluster.list_nodes("role=workers").await.expect("all").len(), 4);
    }

    #[test]
    fn negative_count_is_invalid() {
        let cnr = sample_request("upgrade", "workers", 1);
        let mut status = CycleNodeRequestStatus::default();
        let err = get_nodes_to_terminate(&cnr, &mut status, &[], -1).expect_err("negative");
        assert!(matches!(err, Error::InvalidArgument { .. }));
        assert!(err.to_string().contains("got -1"));
    }

    #[test]
    fn selection_is_bounded_and_keeps_lists_disjoint() {
        let cnr = sample_request("upgrade", "workers", 2);
        let live = vec![
            node("n1", "fake:///1", true),
            node("n2", "fake:///2", true),
            node("n3", "fake:///3", true),
        ];
        let mut status = status_for(&live);

        let selection = get_nodes_to_terminate(&cnr, &mut status, &live, 2).expect("select");
        assert_eq!(selection.nodes.len(), 2);
        assert_eq!(selection.num_in_progress(), 0);
        assert_disjoint_for(&selection, &status);
        assert_eq!(status.nodes_available.len(), 1);
        assert_eq!(status.nodes_available[0].name, "n3");
        assert_eq!(status.nodes_to_terminate.len(), 3);

        let none = get_nodes_to_terminate(&cnr, &mut status, &live, 0).expect("select");
        assert!(none.nodes.is_empty());
    }

    #[test]
    fn claimed_nodes_are_counted_or_contended_never_selected() {
        let cnr = sample_request("upgrade", "workers", 3);
        let live = vec![
            claimed(node("n1", "fake:///1", true), "upgrade"),
            claimed(node("n2", "fake:///2", true), "other"),
            node("n3", "fake:///3", true),
        ];
        let mut status = status_for(&live);

        let selection = get_nodes_to_terminate(&cnr, &mut status, &live, 3).expect("select");
        let selected: Vec<_> = selection.nodes.iter().map(|n| n.name_any()).collect();
        assert_eq!(selected, vec!["n3"]);
        assert_eq!(selection.num_in_progress(), 1);
        assert_eq!(selection.contended, 1);
        assert_disjoint_for(&selection, &status);
        // the contended node stays available to this request
        assert!(status.nodes_available.iter().any(|n| n.name == "n2"));
    }

    #[test]
    fn skipped_nodes_are_not_selected_again() {
        let cnr = sample_request("upgrade", "workers", 2);
        let live = vec![node("n1", "fake:///1", true), node("n2", "fake:///2", true)];
        let mut status = status_for(&live);
        status.skipped_nodes = vec![status.nodes_to_terminate[0].clone()];

        let selection = get_nodes_to_terminate(&cnr, &mut status, &live, 2).expect("select");
        let selected: Vec<_> = selection.nodes.iter().map(|n| n.name_any()).collect();
        assert_eq!(selected, vec!["n2"]);
    }

    #[test]
    fn terminated_nodes_are_never_re_adopted() {
        let cnr = sample_request("upgrade", "workers", 1);
        // The instance is gone but its node still carries the claim.
        let live = vec![
            claimed(node("n1", "fake:///1", true), "upgrade"),
            node("n2", "fake:///2", true),
        ];
        let mut status = status_for(&live);
        status.terminated_nodes = vec![status.nodes_to_terminate[0].clone()];

        let selection = get_nodes_to_terminate(&cnr, &mut status, &live, 1).expect("select");
        assert_eq!(selection.num_in_progress(), 0);
        let selected: Vec<_> = selection.nodes.iter().map(|n| n.name_any()).collect();
        assert_eq!(selected, vec!["n2"]);
    }

    #[test]
    fn selection_stops_at_the_requested_count() {
        let cnr = sample_request("upgrade", "workers", 1);
        let live = vec![
            node("n1", "fake:///1", true),
            claimed(node("n2", "fake:///2", true), "other"),
            claimed(node("n3", "fake:///3", true), "upgrade"),
        ];
        let mut status = status_for(&live);

        let selection = get_nodes_to_terminate(&cnr, &mut status, &live, 1).expect("select");
        let selected: Vec<_> = selection.nodes.iter().map(|n| n.name_any()).collect();
        assert_eq!(selected, vec!["n1"]);
        assert_eq!(selection.contended, 0);
        assert_eq!(selection.num_in_progress(), 0);
        assert_eq!(status.nodes_available.len(), 2);
    }

    #[test]
    fn recreated_node_with_reused_name_is_not_selected() {
        let cnr = sample_request("upgrade", "workers", 1);
        let original = vec![node("n1", "fake:///old", true)];
        let mut status = status_for(&original);

        let live = vec![node("n1", "fake:///new", true)];
        let selection = get_nodes_to_terminate(&cnr, &mut status, &live, 1).expect("select");
        assert!(selection.nodes.is_empty());
        assert_eq!(selection.num_in_progress(), 0);
    }

    #[test]
    fn named_nodes_are_all_or_nothing() {
        let mut cnr = sample_request("upgrade", "workers", 1);
        cnr.spec.node_names = vec!["a".to_string(), "b".to_string()];
        let live = vec![node("a", "fake:///a", true)];
        let instances = instance_map(vec![Instance::new("fake:///a", "workers")]);
        let mut status = CycleNodeRequestStatus::default();

        let err = add_named_nodes_to_terminate(&cnr, &mut status, &live, &instances)
            .expect_err("b is missing");
        assert_eq!(err.to_string(), "could not find node by name: b");
        assert!(status.nodes_available.is_empty());
        assert!(status.nodes_to_terminate.is_empty());

        let live = vec![node("a", "fake:///a", true), node("b", "fake:///b", true)];
        add_named_nodes_to_terminate(&cnr, &mut status, &live, &instances).expect("both found");
        let names: Vec<_> = status.nodes_to_terminate.iter().map(|n| n.name.as_str()).collect();
        assert_eq!(names, vec!["a", "b"]);
        assert_eq!(status.nodes_available, status.nodes_to_terminate);
        assert_eq!(status.nodes_to_terminate[0].node_group_name, "workers");
        assert_eq!(status.nodes_to_terminate[0].private_ip, "10.0.0.1");
    }
}
