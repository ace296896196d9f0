//! In-memory cluster and object fixtures for controller tests

use std::collections::{BTreeMap, BTreeSet};
use std::sync::{Mutex, MutexGuard};

use async_trait::async_trait;
use k8s_openapi::api::core::v1::{Node, NodeCondition, NodeSpec, NodeStatus, Pod, PodSpec, PodStatus};
use k8s_openapi::apimachinery::pkg::apis::meta::v1::{ObjectMeta, OwnerReference};
use kube::ResourceExt;

use super::{CycleStore, Eviction, ResourceManager};
use crate::crd::{
    CycleNodeRequest, CycleNodeRequestSpec, CycleNodeRequestStatus, CycleNodeStatus,
    CycleNodeStatusStatus, CycleSettings, LabelSelector,
};
use crate::provider::FakeCloudProvider;
use crate::Error;

pub const NAMESPACE: &str = "kube-system";

/// Build a node with a provider ID and a Ready condition
pub fn node(name: &str, provider_id: &str, ready: bool) -> Node {
    Node {
        metadata: ObjectMeta {
            name: Some(name.to_string()),
            labels: Some(BTreeMap::new()),
            ..Default::default()
        },
        spec: Some(NodeSpec {
            provider_id: Some(provider_id.to_string()),
            ..Default::default()
        }),
        status: Some(NodeStatus {
            conditions: Some(vec![NodeCondition {
                type_: "Ready".to_string(),
                status: if ready { "True" } else { "False" }.to_string(),
                ..Default::default()
            }]),
            addresses: Some(vec![k8s_openapi::api::core::v1::NodeAddress {
                type_: "InternalIP".to_string(),
                address: "10.0.0.1".to_string(),
            }]),
            ..Default::default()
        }),
    }
}

/// Build a node carrying the given labels
pub fn labelled_node(name: &str, provider_id: &str, labels: &[(&str, &str)]) -> Node {
    let mut n = node(name, provider_id, true);
    n.metadata.labels = Some(
        labels
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect(),
    );
    n
}

/// Build a running pod scheduled on a node
pub fn pod(namespace: &str, name: &str, node_name: &str) -> Pod {
    Pod {
        metadata: ObjectMeta {
            name: Some(name.to_string()),
            namespace: Some(namespace.to_string()),
            ..Default::default()
        },
        spec: Some(PodSpec {
            node_name: Some(node_name.to_string()),
            ..Default::default()
        }),
        status: Some(PodStatus {
            phase: Some("Running".to_string()),
            ..Default::default()
        }),
    }
}

/// Build a running pod controlled by a DaemonSet
pub fn daemonset_pod(namespace: &str, name: &str, node_name: &str) -> Pod {
    let mut p = pod(namespace, name, node_name);
    p.metadata.owner_references = Some(vec![OwnerReference {
        api_version: "apps/v1".to_string(),
        kind: "DaemonSet".to_string(),
        name: name.to_string(),
        uid: format!("{}-uid", name),
        controller: Some(true),
        ..Default::default()
    }]);
    p
}

/// Build a request for a node group selected by `role=<group>`
pub fn sample_request(name: &str, group: &str, concurrency: i64) -> CycleNodeRequest {
    let mut cnr = CycleNodeRequest::new(
        name,
        CycleNodeRequestSpec {
            node_group_name: group.to_string(),
            selector: LabelSelector::from_labels([("role", group)]),
            node_names: vec![],
            cycle_settings: CycleSettings {
                concurrency,
                ..Default::default()
            },
        },
    );
    cnr.metadata.namespace = Some(NAMESPACE.to_string());
    cnr.metadata.uid = Some(format!("{}-uid", name));
    cnr
}

fn parse_selector(selector: &str) -> BTreeMap<String, String> {
    selector
        .split(',')
        .filter(|s| !s.is_empty())
        .filter_map(|pair| pair.split_once('='))
        .map(|(k, v)| (k.to_string(), v.to_string()))
        .collect()
}

type Key = (String, String);

#[derive(Default)]
struct State {
    nodes: BTreeMap<String, Node>,
    pods: BTreeMap<Key, Pod>,
    requests: BTreeMap<Key, CycleNodeRequest>,
    statuses: BTreeMap<Key, CycleNodeStatus>,
    blocked: BTreeSet<Key>,
    mutations: usize,
    resource_version: u64,
}

impl State {
    /// Record a node write: bump its resource version and the mutation count
    fn touch_node(&mut self, name: &str) {
        self.resource_version += 1;
        let version = self.resource_version.to_string();
        if let Some(node) = self.nodes.get_mut(name) {
            node.metadata.resource_version = Some(version);
        }
        self.mutations += 1;
    }
}

/// In-memory cluster implementing both [`ResourceManager`] and [`CycleStore`]
#[derive(Default)]
pub struct FakeCluster {
    state: Mutex<State>,
}

impl FakeCluster {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, State> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    pub fn add_node(&self, mut node: Node) {
        let mut state = self.lock();
        state.resource_version += 1;
        node.metadata.resource_version = Some(state.resource_version.to_string());
        state.nodes.insert(node.name_any(), node);
    }

    /// Set a label on a node regardless of its resource version
    pub fn label_node(&self, name: &str, key: &str, value: &str) {
        let mut state = self.lock();
        if let Some(node) = state.nodes.get_mut(name) {
            node.metadata
                .labels
                .get_or_insert_with(Default::default)
                .insert(key.to_string(), value.to_string());
        }
        state.touch_node(name);
    }

    pub fn remove_node(&self, name: &str) {
        let mut state = self.lock();
        state.nodes.remove(name);
        state
            .pods
            .retain(|_, p| p.spec.as_ref().and_then(|s| s.node_name.as_deref()) != Some(name));
    }

    pub fn node(&self, name: &str) -> Option<Node> {
        self.lock().nodes.get(name).cloned()
    }

    pub fn node_names(&self) -> Vec<String> {
        self.lock().nodes.keys().cloned().collect()
    }

    pub fn add_pod(&self, pod: Pod) {
        let key = (pod.namespace().unwrap_or_default(), pod.name_any());
        self.lock().pods.insert(key, pod);
    }

    pub fn remove_pod(&self, namespace: &str, name: &str) {
        self.lock()
            .pods
            .remove(&(namespace.to_string(), name.to_string()));
    }

    pub fn pod(&self, namespace: &str, name: &str) -> Option<Pod> {
        self.lock()
            .pods
            .get(&(namespace.to_string(), name.to_string()))
            .cloned()
    }

    /// Make evictions of a pod report a disruption-budget refusal
    pub fn block_eviction(&self, namespace: &str, name: &str) {
        self.lock()
            .blocked
            .insert((namespace.to_string(), name.to_string()));
    }

    /// Number of node and pod mutations applied so far
    pub fn mutations(&self) -> usize {
        self.lock().mutations
    }

    pub fn put_request(&self, cnr: CycleNodeRequest) {
        let key = (cnr.namespace().unwrap_or_default(), cnr.name_any());
        self.lock().requests.insert(key, cnr);
    }

    pub fn request(&self, name: &str) -> Option<CycleNodeRequest> {
        self.lock()
            .requests
            .get(&(NAMESPACE.to_string(), name.to_string()))
            .cloned()
    }

    pub fn put_node_status(&self, cns: CycleNodeStatus) {
        let key = (cns.namespace().unwrap_or_default(), cns.name_any());
        self.lock().statuses.insert(key, cns);
    }

    pub fn node_status(&self, name: &str) -> Option<CycleNodeStatus> {
        self.lock()
            .statuses
            .get(&(NAMESPACE.to_string(), name.to_string()))
            .cloned()
    }

    pub fn node_statuses(&self) -> Vec<CycleNodeStatus> {
        self.lock().statuses.values().cloned().collect()
    }

    /// Mirror provider membership into nodes
    ///
    /// Instances without a node get a ready node labelled `labels`; nodes of
    /// the group whose instance is gone are removed with their pods.
    pub fn sync_with_provider(
        &self,
        provider: &FakeCloudProvider,
        group: &str,
        labels: &[(&str, &str)],
    ) {
        let members = provider.members(group);
        let selector: BTreeMap<String, String> = labels
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();

        let stale: Vec<String> = {
            let state = self.lock();
            state
                .nodes
                .values()
                .filter(|n| {
                    n.metadata
                        .labels
                        .as_ref()
                        .is_some_and(|l| selector.iter().all(|(k, v)| l.get(k) == Some(v)))
                })
                .filter(|n| {
                    let id = super::provider_id(n);
                    !members.iter().any(|i| i.provider_id == id)
                })
                .map(|n| n.name_any())
                .collect()
        };
        for name in stale {
            self.remove_node(&name);
        }

        for instance in members {
            let exists = self
                .lock()
                .nodes
                .values()
                .any(|n| super::provider_id(n) == instance.provider_id);
            if !exists {
                let name = instance
                    .provider_id
                    .rsplit('/')
                    .next()
                    .unwrap_or("node")
                    .to_string();
                self.add_node(labelled_node(&name, &instance.provider_id, labels));
            }
        }
    }

    fn set_unschedulable(&self, node_name: &str, unschedulable: bool) -> Result<(), Error> {
        let mut state = self.lock();
        let node = state
            .nodes
            .get_mut(node_name)
            .ok_or_else(|| Error::not_found("Node", node_name))?;
        node.spec.get_or_insert_with(Default::default).unschedulable = Some(unschedulable);
        state.touch_node(node_name);
        Ok(())
    }
}

#[async_trait]
impl ResourceManager for FakeCluster {
    async fn list_nodes(&self, selector: &str) -> Result<Vec<Node>, Error> {
        let wanted = parse_selector(selector);
        Ok(self
            .lock()
            .nodes
            .values()
            .filter(|n| {
                let labels = n.metadata.labels.clone().unwrap_or_default();
                wanted.iter().all(|(k, v)| labels.get(k) == Some(v))
            })
            .cloned()
            .collect())
    }

    async fn get_node(&self, name: &str) -> Result<Node, Error> {
        self.node(name).ok_or_else(|| Error::not_found("Node", name))
    }

    async fn get_pods_on_node(&self, node_name: &str) -> Result<Vec<Pod>, Error> {
        Ok(self
            .lock()
            .pods
            .values()
            .filter(|p| p.spec.as_ref().and_then(|s| s.node_name.as_deref()) == Some(node_name))
            .cloned()
            .collect())
    }

    async fn remove_labels(&self, node_name: &str, keys: &[String]) -> Result<(), Error> {
        let mut state = self.lock();
        let node = state
            .nodes
            .get_mut(node_name)
            .ok_or_else(|| Error::not_found("Node", node_name))?;
        let labels = node.metadata.labels.get_or_insert_with(Default::default);
        for key in keys {
            labels.remove(key);
        }
        state.touch_node(node_name);
        Ok(())
    }

    async fn patch_node_label(
        &self,
        node_name: &str,
        key: &str,
        value: &str,
        resource_version: &str,
    ) -> Result<bool, Error> {
        let mut state = self.lock();
        let node = state
            .nodes
            .get_mut(node_name)
            .ok_or_else(|| Error::not_found("Node", node_name))?;
        if node.metadata.resource_version.as_deref() != Some(resource_version) {
            return Ok(false);
        }
        node.metadata
            .labels
            .get_or_insert_with(Default::default)
            .insert(key.to_string(), value.to_string());
        state.touch_node(node_name);
        Ok(true)
    }

    async fn cordon_node(&self, node_name: &str) -> Result<(), Error> {
        self.set_unschedulable(node_name, true)
    }

    async fn uncordon_node(&self, node_name: &str) -> Result<(), Error> {
        self.set_unschedulable(node_name, false)
    }

    async fn remove_pod_labels(
        &self,
        namespace: &str,
        pod_name: &str,
        keys: &[String],
    ) -> Result<(), Error> {
        let mut state = self.lock();
        if let Some(pod) = state
            .pods
            .get_mut(&(namespace.to_string(), pod_name.to_string()))
        {
            let labels = pod.metadata.labels.get_or_insert_with(Default::default);
            for key in keys {
                labels.remove(key);
            }
        }
        state.mutations += 1;
        Ok(())
    }

    async fn evict_pod(&self, namespace: &str, pod_name: &str) -> Result<Eviction, Error> {
        let mut state = self.lock();
        let key = (namespace.to_string(), pod_name.to_string());
        if state.blocked.contains(&key) {
            return Ok(Eviction::Blocked);
        }
        if state.pods.remove(&key).is_none() {
            return Ok(Eviction::Gone);
        }
        state.mutations += 1;
        Ok(Eviction::Evicted)
    }
}

#[async_trait]
impl CycleStore for FakeCluster {
    async fn patch_request_status(
        &self,
        namespace: &str,
        name: &str,
        status: &CycleNodeRequestStatus,
    ) -> Result<(), Error> {
        let mut state = self.lock();
        let cnr = state
            .requests
            .get_mut(&(namespace.to_string(), name.to_string()))
            .ok_or_else(|| Error::not_found("CycleNodeRequest", name))?;
        cnr.status = Some(status.clone());
        Ok(())
    }

    async fn delete_request(&self, namespace: &str, name: &str) -> Result<(), Error> {
        self.lock()
            .requests
            .remove(&(namespace.to_string(), name.to_string()));
        Ok(())
    }

    async fn get_node_status(
        &self,
        namespace: &str,
        name: &str,
    ) -> Result<Option<CycleNodeStatus>, Error> {
        Ok(self
            .lock()
            .statuses
            .get(&(namespace.to_string(), name.to_string()))
            .cloned())
    }

    async fn create_node_status(&self, cns: &CycleNodeStatus) -> Result<(), Error> {
        let key = (cns.namespace().unwrap_or_default(), cns.name_any());
        self.lock()
            .statuses
            .entry(key)
            .or_insert_with(|| cns.clone());
        Ok(())
    }

    async fn patch_node_status(
        &self,
        namespace: &str,
        name: &str,
        status: &CycleNodeStatusStatus,
    ) -> Result<(), Error> {
        let mut state = self.lock();
        let cns = state
            .statuses
            .get_mut(&(namespace.to_string(), name.to_string()))
            .ok_or_else(|| Error::not_found("CycleNodeStatus", name))?;
        cns.status = Some(status.clone());
        Ok(())
    }

    async fn delete_node_status(&self, namespace: &str, name: &str) -> Result<(), Error> {
        self.lock()
            .statuses
            .remove(&(namespace.to_string(), name.to_string()));
        Ok(())
    }
}
