//! Building, validating and submitting CycleNodeRequests
//!
//! Requests are usually generated from a [`NodeGroup`]: the group supplies the
//! provider node group, node selector and cycle settings. A generated request
//! is validated against the live cluster before it is created; a rejected one
//! carries the reason in the `cyclops.dev/reason` annotation.

use std::collections::BTreeMap;

use kube::api::{Api, ListParams, PostParams};
use kube::ResourceExt;
use tracing::{debug, info};

use crate::controller::ResourceManager;
use crate::crd::{CycleNodeRequest, CycleNodeRequestSpec, NodeGroup};
use crate::{Error, REASON_ANNOTATION, REQUEST_NAME_LABEL};

const MAX_NAME_LENGTH: usize = 253;

/// List requests, optionally filtered by a label selector
pub async fn list_requests(
    api: &Api<CycleNodeRequest>,
    label_selector: Option<&str>,
) -> Result<Vec<CycleNodeRequest>, Error> {
    let mut params = ListParams::default();
    if let Some(selector) = label_selector {
        params = params.labels(selector);
    }
    Ok(api.list(&params).await?.items)
}

/// Create a request; with `dry_run` the API server validates without persisting
pub async fn apply_request(
    api: &Api<CycleNodeRequest>,
    cnr: &CycleNodeRequest,
    dry_run: bool,
) -> Result<CycleNodeRequest, Error> {
    let params = PostParams {
        dry_run,
        ..Default::default()
    };
    let created = api.create(&params, cnr).await?;
    info!(request = %created.name_any(), dry_run, "created CycleNodeRequest");
    Ok(created)
}

/// Check whether a request should be submitted, returning the reason if not
///
/// Checks the metadata, the cycle settings, and that the selector and any
/// explicit node names resolve to live nodes.
pub async fn validate_request(
    nodes: &dyn ResourceManager,
    cnr: &CycleNodeRequest,
) -> Result<(), String> {
    validate_metadata(cnr)?;
    cnr.spec.cycle_settings.validate()?;

    let selector = cnr
        .node_label_selector()
        .map_err(|e| format!("failed to parse node label selector: {}", e))?;
    let matched = nodes
        .list_nodes(&selector)
        .await
        .map_err(|e| format!("failed to list nodes: {}", e))?;
    debug!(%selector, matched = matched.len(), "validated selector against live nodes");

    if matched.is_empty() {
        return Err(format!("no nodes matched selector {}", selector));
    }
    for name in &cnr.spec.node_names {
        if !matched.iter().any(|n| n.name_any() == *name) {
            return Err(format!("node {} does not match selector {}", name, selector));
        }
    }
    Ok(())
}

fn validate_metadata(cnr: &CycleNodeRequest) -> Result<(), String> {
    let name = cnr
        .metadata
        .name
        .as_deref()
        .or(cnr.metadata.generate_name.as_deref())
        .unwrap_or_default();
    if name.is_empty() {
        return Err("name or generateName must be set".to_string());
    }
    if !is_dns_subdomain(name.trim_end_matches('-')) || name.len() > MAX_NAME_LENGTH {
        return Err(format!("name {} is not a valid DNS subdomain", name));
    }
    if cnr.metadata.namespace.as_deref().unwrap_or_default().is_empty() {
        return Err("namespace must be set".to_string());
    }
    Ok(())
}

fn is_dns_subdomain(name: &str) -> bool {
    let bytes = name.as_bytes();
    let edge_ok = |b: Option<&u8>| b.is_some_and(|b| b.is_ascii_lowercase() || b.is_ascii_digit());
    edge_ok(bytes.first())
        && edge_ok(bytes.last())
        && bytes
            .iter()
            .all(|b| b.is_ascii_lowercase() || b.is_ascii_digit() || *b == b'-' || *b == b'.')
}

/// Record why a request was rejected
pub fn give_reason(cnr: &mut CycleNodeRequest, reason: &str) {
    cnr.annotations_mut()
        .insert(REASON_ANNOTATION.to_string(), reason.to_string());
}

/// Build a request cycling `nodes` (all nodes when empty) of a node group
///
/// The request is named `<name>-<node group>`, or after the node group when
/// no name is given.
pub fn generate_request(
    node_group: &NodeGroup,
    nodes: &[String],
    name: Option<&str>,
    namespace: &str,
) -> CycleNodeRequest {
    let group_name = node_group.name_any();
    let (final_name, labels) = match name.filter(|n| !n.is_empty()) {
        Some(base) => (
            format!("{}-{}", base, group_name),
            Some(BTreeMap::from([(
                REQUEST_NAME_LABEL.to_string(),
                base.to_string(),
            )])),
        ),
        None => (group_name, None),
    };

    let mut cnr = CycleNodeRequest::new(
        &final_name,
        CycleNodeRequestSpec {
            node_group_name: node_group.spec.node_group_name.clone(),
            selector: node_group.spec.node_selector.clone(),
            node_names: nodes.to_vec(),
            cycle_settings: node_group.spec.cycle_settings.clone(),
        },
    );
    cnr.metadata.namespace = Some(namespace.to_string());
    cnr.metadata.labels = labels;
    cnr
}

/// Let the API server pick a unique name derived from the current one
pub fn use_generate_name(cnr: &mut CycleNodeRequest) {
    cnr.metadata.generate_name = Some(format!("{}-", cnr.name_any()));
    cnr.metadata.name = None;
}
