//! Cluster bridge and persistence traits used by the state machines
//!
//! [`ResourceManager`] reads nodes and pods and applies the label, cordon and
//! eviction mutations. [`CycleStore`] persists the cyclops objects themselves.
//! Both are traits so the state machines can run against mocks or the
//! in-memory cluster in tests and against the API server in production.

use async_trait::async_trait;
use k8s_openapi::api::core::v1::{Node, Pod};
use kube::api::{Api, DeleteParams, EvictParams, ListParams, Patch, PatchParams, PostParams};
use kube::Client;
use serde_json::{json, Map, Value};
use tracing::{debug, info};

#[cfg(test)]
use mockall::automock;

use crate::crd::{
    CycleNodeRequest, CycleNodeRequestStatus, CycleNodeStatus, CycleNodeStatusStatus,
};
use crate::{Error, FIELD_MANAGER};

/// Outcome of a single eviction attempt
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Eviction {
    /// The eviction was accepted
    Evicted,
    /// A PodDisruptionBudget refused the eviction for now
    Blocked,
    /// The pod no longer exists
    Gone,
}

/// Trait abstracting the cluster reads and mutations of the state machines
///
/// Reads reflect a recent snapshot, not necessarily the latest state; callers
/// re-verify before acting.
#[cfg_attr(test, automock)]
#[async_trait]
pub trait ResourceManager: Send + Sync {
    /// List nodes matching a label selector (`k=v,k2=v2`)
    async fn list_nodes(&self, selector: &str) -> Result<Vec<Node>, Error>;

    /// Get a node by name
    ///
    /// A missing node is reported as an error for which
    /// [`Error::is_not_found`] is true.
    async fn get_node(&self, name: &str) -> Result<Node, Error>;

    /// List every pod scheduled on a node, in all namespaces
    async fn get_pods_on_node(&self, node_name: &str) -> Result<Vec<Pod>, Error>;

    /// Remove label keys from a node in one patch
    async fn remove_labels(&self, node_name: &str, keys: &[String]) -> Result<(), Error>;

    /// Set a single label on a node, provided it is still at `resource_version`
    ///
    /// Returns false when the node changed since it was read; the caller lost
    /// a race and must re-read before deciding again.
    async fn patch_node_label(
        &self,
        node_name: &str,
        key: &str,
        value: &str,
        resource_version: &str,
    ) -> Result<bool, Error>;

    /// Mark a node unschedulable
    async fn cordon_node(&self, node_name: &str) -> Result<(), Error>;

    /// Mark a node schedulable again
    async fn uncordon_node(&self, node_name: &str) -> Result<(), Error>;

    /// Remove label keys from a pod in one patch
    async fn remove_pod_labels(
        &self,
        namespace: &str,
        pod_name: &str,
        keys: &[String],
    ) -> Result<(), Error>;

    /// Evict a pod through the eviction API, honouring disruption budgets
    async fn evict_pod(&self, namespace: &str, pod_name: &str) -> Result<Eviction, Error>;
}

/// Trait abstracting persistence of CycleNodeRequests and CycleNodeStatuses
#[cfg_attr(test, automock)]
#[async_trait]
pub trait CycleStore: Send + Sync {
    /// Replace the status of a CycleNodeRequest
    async fn patch_request_status(
        &self,
        namespace: &str,
        name: &str,
        status: &CycleNodeRequestStatus,
    ) -> Result<(), Error>;

    /// Delete a CycleNodeRequest; deleting a missing one succeeds
    async fn delete_request(&self, namespace: &str, name: &str) -> Result<(), Error>;

    /// Get a CycleNodeStatus by name
    async fn get_node_status(
        &self,
        namespace: &str,
        name: &str,
    ) -> Result<Option<CycleNodeStatus>, Error>;

    /// Create a CycleNodeStatus; creating one that already exists succeeds
    async fn create_node_status(&self, cns: &CycleNodeStatus) -> Result<(), Error>;

    /// Replace the status of a CycleNodeStatus
    async fn patch_node_status(
        &self,
        namespace: &str,
        name: &str,
        status: &CycleNodeStatusStatus,
    ) -> Result<(), Error>;

    /// Delete a CycleNodeStatus; deleting a missing one succeeds
    async fn delete_node_status(&self, namespace: &str, name: &str) -> Result<(), Error>;
}

/// Merge patch that sets every listed label key to null
fn remove_labels_patch(keys: &[String]) -> Value {
    let labels: Map<String, Value> = keys.iter().map(|k| (k.clone(), Value::Null)).collect();
    json!({ "metadata": { "labels": labels } })
}

/// Merge patch setting one label, rejected with 409 once the node moved past
/// `resource_version`
fn conditional_label_patch(key: &str, value: &str, resource_version: &str) -> Value {
    json!({
        "metadata": {
            "resourceVersion": resource_version,
            "labels": { key: value },
        }
    })
}

fn is_api_code(err: &kube::Error, code: u16) -> bool {
    matches!(err, kube::Error::Api(ae) if ae.code == code)
}

/// Real Kubernetes implementation of [`ResourceManager`]
pub struct KubeResourceManager {
    client: Client,
}

impl KubeResourceManager {
    /// Create a new KubeResourceManager wrapping the given kube Client
    pub fn new(client: Client) -> Self {
        Self { client }
    }

    fn nodes(&self) -> Api<Node> {
        Api::all(self.client.clone())
    }
}

#[async_trait]
impl ResourceManager for KubeResourceManager {
    async fn list_nodes(&self, selector: &str) -> Result<Vec<Node>, Error> {
        let nodes = self
            .nodes()
            .list(&ListParams::default().labels(selector))
            .await?;
        Ok(nodes.items)
    }

    async fn get_node(&self, name: &str) -> Result<Node, Error> {
        match self.nodes().get(name).await {
            Ok(node) => Ok(node),
            Err(e) if is_api_code(&e, 404) => Err(Error::not_found("Node", name)),
            Err(e) => Err(e.into()),
        }
    }

    async fn get_pods_on_node(&self, node_name: &str) -> Result<Vec<Pod>, Error> {
        let api: Api<Pod> = Api::all(self.client.clone());
        let pods = api
            .list(&ListParams::default().fields(&format!("spec.nodeName={}", node_name)))
            .await?;
        Ok(pods.items)
    }

    async fn remove_labels(&self, node_name: &str, keys: &[String]) -> Result<(), Error> {
        if keys.is_empty() {
            return Ok(());
        }
        debug!(node = %node_name, ?keys, "removing node labels");
        self.nodes()
            .patch(
                node_name,
                &PatchParams::default(),
                &Patch::Merge(&remove_labels_patch(keys)),
            )
            .await?;
        Ok(())
    }

    async fn patch_node_label(
        &self,
        node_name: &str,
        key: &str,
        value: &str,
        resource_version: &str,
    ) -> Result<bool, Error> {
        let patch = conditional_label_patch(key, value, resource_version);
        match self
            .nodes()
            .patch(node_name, &PatchParams::default(), &Patch::Merge(&patch))
            .await
        {
            Ok(_) => Ok(true),
            Err(e) if is_api_code(&e, 409) => {
                debug!(node = %node_name, %key, "node changed since it was read");
                Ok(false)
            }
            Err(e) if is_api_code(&e, 404) => Err(Error::not_found("Node", node_name)),
            Err(e) => Err(e.into()),
        }
    }

    async fn cordon_node(&self, node_name: &str) -> Result<(), Error> {
        info!(node = %node_name, "cordoning node");
        let patch = json!({ "spec": { "unschedulable": true } });
        self.nodes()
            .patch(node_name, &PatchParams::default(), &Patch::Merge(&patch))
            .await?;
        Ok(())
    }

    async fn uncordon_node(&self, node_name: &str) -> Result<(), Error> {
        info!(node = %node_name, "uncordoning node");
        let patch = json!({ "spec": { "unschedulable": false } });
        match self
            .nodes()
            .patch(node_name, &PatchParams::default(), &Patch::Merge(&patch))
            .await
        {
            Ok(_) => Ok(()),
            Err(e) if is_api_code(&e, 404) => Err(Error::not_found("Node", node_name)),
            Err(e) => Err(e.into()),
        }
    }

    async fn remove_pod_labels(
        &self,
        namespace: &str,
        pod_name: &str,
        keys: &[String],
    ) -> Result<(), Error> {
        if keys.is_empty() {
            return Ok(());
        }
        let api: Api<Pod> = Api::namespaced(self.client.clone(), namespace);
        match api
            .patch(
                pod_name,
                &PatchParams::default(),
                &Patch::Merge(&remove_labels_patch(keys)),
            )
            .await
        {
            Ok(_) => Ok(()),
            Err(e) if is_api_code(&e, 404) => Ok(()),
            Err(e) => Err(e.into()),
        }
    }

    async fn evict_pod(&self, namespace: &str, pod_name: &str) -> Result<Eviction, Error> {
        let api: Api<Pod> = Api::namespaced(self.client.clone(), namespace);
        match api.evict(pod_name, &EvictParams::default()).await {
            Ok(_) => Ok(Eviction::Evicted),
            Err(e) if is_api_code(&e, 404) => Ok(Eviction::Gone),
            Err(e) if is_api_code(&e, 429) => Ok(Eviction::Blocked),
            Err(e) => Err(e.into()),
        }
    }
}

/// Real Kubernetes implementation of [`CycleStore`]
pub struct KubeCycleStore {
    client: Client,
}

impl KubeCycleStore {
    /// Create a new KubeCycleStore wrapping the given kube Client
    pub fn new(client: Client) -> Self {
        Self { client }
    }
}

#[async_trait]
impl CycleStore for KubeCycleStore {
    async fn patch_request_status(
        &self,
        namespace: &str,
        name: &str,
        status: &CycleNodeRequestStatus,
    ) -> Result<(), Error> {
        let api: Api<CycleNodeRequest> = Api::namespaced(self.client.clone(), namespace);
        let patch = json!({ "status": status });
        api.patch_status(
            name,
            &PatchParams::apply(FIELD_MANAGER),
            &Patch::Merge(&patch),
        )
        .await?;
        Ok(())
    }

    async fn delete_request(&self, namespace: &str, name: &str) -> Result<(), Error> {
        let api: Api<CycleNodeRequest> = Api::namespaced(self.client.clone(), namespace);
        match api.delete(name, &DeleteParams::default()).await {
            Ok(_) => Ok(()),
            Err(e) if is_api_code(&e, 404) => Ok(()),
            Err(e) => Err(e.into()),
        }
    }

    async fn get_node_status(
        &self,
        namespace: &str,
        name: &str,
    ) -> Result<Option<CycleNodeStatus>, Error> {
        let api: Api<CycleNodeStatus> = Api::namespaced(self.client.clone(), namespace);
        Ok(api.get_opt(name).await?)
    }

    async fn create_node_status(&self, cns: &CycleNodeStatus) -> Result<(), Error> {
        let namespace = cns.metadata.namespace.as_deref().ok_or_else(|| {
            Error::internal_with_context("create_node_status", "CycleNodeStatus has no namespace")
        })?;
        let api: Api<CycleNodeStatus> = Api::namespaced(self.client.clone(), namespace);
        match api.create(&PostParams::default(), cns).await {
            Ok(_) => Ok(()),
            Err(e) if is_api_code(&e, 409) => {
                debug!(name = ?cns.metadata.name, "CycleNodeStatus already exists");
                Ok(())
            }
            Err(e) => Err(e.into()),
        }
    }

    async fn patch_node_status(
        &self,
        namespace: &str,
        name: &str,
        status: &CycleNodeStatusStatus,
    ) -> Result<(), Error> {
        let api: Api<CycleNodeStatus> = Api::namespaced(self.client.clone(), namespace);
        let patch = json!({ "status": status });
        api.patch_status(
            name,
            &PatchParams::apply(FIELD_MANAGER),
            &Patch::Merge(&patch),
        )
        .await?;
        Ok(())
    }

    async fn delete_node_status(&self, namespace: &str, name: &str) -> Result<(), Error> {
        let api: Api<CycleNodeStatus> = Api::namespaced(self.client.clone(), namespace);
        match api.delete(name, &DeleteParams::default()).await {
            Ok(_) => Ok(()),
            Err(e) if is_api_code(&e, 404) => Ok(()),
            Err(e) => Err(e.into()),
        }
    }
}
