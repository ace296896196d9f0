//! Controller implementations for cyclops CRDs
//!
//! Two state machines run side by side: [`request`] drives a
//! CycleNodeRequest across a node group and [`status`] drains the single node
//! behind a CycleNodeStatus. Each reconcile performs one phase's work and
//! either advances the phase or asks to be requeued; nothing blocks inside a
//! step. [`runner`] wires both into kube-runtime controllers.

mod predicates;
mod resource_manager;

pub mod request;
pub mod runner;
pub mod status;

#[cfg(test)]
pub(crate) mod testing;

use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use kube::Client;

use crate::provider::CloudProvider;
use crate::DEFAULT_NAMESPACE;

pub use predicates::{
    claimed_by, is_cordoned, is_node_ready, is_relevant_pod, pod_contains_label,
    pod_has_node_selector, pod_is_daemonset, pod_is_ignored, provider_id,
};
pub use resource_manager::{
    CycleStore, Eviction, KubeCycleStore, KubeResourceManager, ResourceManager,
};

/// Tunables shared by both controllers
#[derive(Clone, Debug)]
pub struct ControllerOptions {
    /// Namespace watched for CycleNodeRequests and CycleNodeStatuses
    pub namespace: String,
    /// Maximum number of objects reconciled concurrently per controller
    pub concurrency: u16,
    /// Requeue interval while waiting on the provider or on drains
    pub poll_interval: Duration,
    /// Requeue interval between drain steps
    pub step_interval: Duration,
    /// How long a scale-up may take before the request fails
    pub scale_up_timeout: Duration,
    /// How long a node drain may take before the drain fails
    pub drain_timeout: Duration,
    /// Delete successful requests once they are older than `delete_cnr_expiry`
    pub delete_cnr: bool,
    /// Age after which a successful request is deleted
    pub delete_cnr_expiry: Duration,
    /// How often a successful request is checked for expiry
    pub delete_cnr_requeue: Duration,
}

impl Default for ControllerOptions {
    fn default() -> Self {
        Self {
            namespace: DEFAULT_NAMESPACE.to_string(),
            concurrency: 16,
            poll_interval: Duration::from_secs(30),
            step_interval: Duration::from_secs(5),
            scale_up_timeout: Duration::from_secs(20 * 60),
            drain_timeout: Duration::from_secs(60 * 60),
            delete_cnr: false,
            delete_cnr_expiry: Duration::from_secs(168 * 60 * 60),
            delete_cnr_requeue: Duration::from_secs(24 * 60 * 60),
        }
    }
}

/// Shared context for both controllers
///
/// Holds the cluster bridge, the object store and the cloud provider as trait
/// objects so reconcile logic can be exercised with mocks.
///
/// Use [`ContextBuilder`] to construct instances:
///
/// ```text
/// let ctx = Context::builder(client, provider)
///     .options(options)
///     .build();
/// ```
pub struct Context {
    /// Cluster reads and node/pod mutations
    pub nodes: Arc<dyn ResourceManager>,
    /// Persistence of cyclops objects
    pub store: Arc<dyn CycleStore>,
    /// Cloud provider backing the node groups
    pub provider: Arc<dyn CloudProvider>,
    /// Controller tunables
    pub options: ControllerOptions,
}

impl Context {
    /// Create a builder for constructing a Context
    pub fn builder(client: Client, provider: Arc<dyn CloudProvider>) -> ContextBuilder {
        ContextBuilder::new(client, provider)
    }

    /// Create a context for testing with custom mock clients
    #[cfg(test)]
    pub fn for_testing(
        nodes: Arc<dyn ResourceManager>,
        store: Arc<dyn CycleStore>,
        provider: Arc<dyn CloudProvider>,
        options: ControllerOptions,
    ) -> Self {
        Self {
            nodes,
            store,
            provider,
            options,
        }
    }
}

/// Builder for constructing [`Context`] instances
pub struct ContextBuilder {
    client: Client,
    provider: Arc<dyn CloudProvider>,
    nodes: Option<Arc<dyn ResourceManager>>,
    store: Option<Arc<dyn CycleStore>>,
    options: ControllerOptions,
}

impl ContextBuilder {
    fn new(client: Client, provider: Arc<dyn CloudProvider>) -> Self {
        Self {
            client,
            provider,
            nodes: None,
            store: None,
            options: ControllerOptions::default(),
        }
    }

    /// Set the controller tunables
    pub fn options(mut self, options: ControllerOptions) -> Self {
        self.options = options;
        self
    }

    /// Override the cluster bridge
    pub fn resource_manager(mut self, nodes: Arc<dyn ResourceManager>) -> Self {
        self.nodes = Some(nodes);
        self
    }

    /// Override the object store
    pub fn cycle_store(mut self, store: Arc<dyn CycleStore>) -> Self {
        self.store = Some(store);
        self
    }

    /// Build the Context
    pub fn build(self) -> Context {
        Context {
            nodes: self
                .nodes
                .unwrap_or_else(|| Arc::new(KubeResourceManager::new(self.client.clone()))),
            store: self
                .store
                .unwrap_or_else(|| Arc::new(KubeCycleStore::new(self.client.clone()))),
            provider: self.provider,
            options: self.options,
        }
    }
}

/// Current time as an RFC 3339 timestamp for status fields
pub(crate) fn now_rfc3339() -> String {
    Utc::now().to_rfc3339()
}

/// Time elapsed since an RFC 3339 timestamp
///
/// Missing or unparsable timestamps yield `None`; timestamps in the future
/// yield zero.
pub(crate) fn elapsed_since(timestamp: Option<&str>) -> Option<Duration> {
    let started = DateTime::parse_from_rfc3339(timestamp?).ok()?;
    let elapsed = Utc::now().signed_duration_since(started.with_timezone(&Utc));
    Some(elapsed.to_std().unwrap_or(Duration::ZERO))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn elapsed_since_parses_status_timestamps() {
        let ten_minutes_ago = (Utc::now() - chrono::Duration::minutes(10)).to_rfc3339();
        let elapsed = elapsed_since(Some(&ten_minutes_ago)).expect("elapsed");
        assert!(elapsed >= Duration::from_secs(599));
        assert!(elapsed < Duration::from_secs(700));

        assert_eq!(elapsed_since(None), None);
        assert_eq!(elapsed_since(Some("yesterday")), None);

        let future = (Utc::now() + chrono::Duration::minutes(5)).to_rfc3339();
        assert_eq!(elapsed_since(Some(&future)), Some(Duration::ZERO));
    }

    #[test]
    fn default_options_match_cli_defaults() {
        let options = ControllerOptions::default();
        assert_eq!(options.namespace, "kube-system");
        assert_eq!(options.concurrency, 16);
        assert_eq!(options.delete_cnr_expiry, Duration::from_secs(7 * 24 * 3600));
        assert!(!options.delete_cnr);
    }
}
