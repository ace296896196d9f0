//! Cloud provider abstraction for node groups
//!
//! The state machines only see the [`CloudProvider`] trait. Backends are
//! selected by name at startup through a [`ProviderRegistry`]; an unknown name
//! is a configuration error reported before any controller starts.
//!
//! # Implementing a Provider
//!
//! ```text
//! struct MyProvider;
//!
//! #[async_trait]
//! impl CloudProvider for MyProvider {
//!     fn name(&self) -> &'static str { "mine" }
//!     async fn instances(&self, node_group: &str) -> Result<Vec<Instance>, Error> { ... }
//!     // ...
//! }
//!
//! let mut registry = ProviderRegistry::with_defaults();
//! registry.register("mine", || Ok(Arc::new(MyProvider)));
//! ```

mod fake;

use std::collections::BTreeMap;
use std::sync::Arc;

use async_trait::async_trait;

#[cfg(test)]
use mockall::automock;

use crate::Error;

pub use fake::FakeCloudProvider;

/// Name of the built-in in-memory provider
pub const FAKE_PROVIDER: &str = "fake";

/// A member of a node group as the cloud provider sees it
///
/// Read-only projection; never persisted.
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub struct Instance {
    /// Provider identifier, matching the node's `spec.providerID`
    pub provider_id: String,
    /// Node group the instance belongs to
    pub node_group_name: String,
}

impl Instance {
    /// Create an instance record
    pub fn new(provider_id: impl Into<String>, node_group_name: impl Into<String>) -> Self {
        Self {
            provider_id: provider_id.into(),
            node_group_name: node_group_name.into(),
        }
    }
}

/// Operations over cloud-managed node groups
///
/// Every call may fail with [`Error::ProviderUnavailable`] or
/// [`Error::NotFound`]. Nothing is atomic across calls; callers re-read state
/// on every invocation instead of caching results.
#[cfg_attr(test, automock)]
#[async_trait]
pub trait CloudProvider: Send + Sync {
    /// Provider name used in logs and errors
    fn name(&self) -> &'static str;

    /// List the instances currently in a node group
    async fn instances(&self, node_group: &str) -> Result<Vec<Instance>, Error>;

    /// Read the desired capacity of a node group
    async fn desired_capacity(&self, node_group: &str) -> Result<i64, Error>;

    /// Set the desired capacity of a node group
    async fn set_desired_capacity(&self, node_group: &str, capacity: i64) -> Result<(), Error>;

    /// Terminate an instance and shrink its group's desired capacity by one
    ///
    /// Terminating an instance that is already gone succeeds.
    async fn terminate_instance(&self, provider_id: &str) -> Result<(), Error>;

    /// Name of the node group owning an instance
    async fn node_group_of(&self, provider_id: &str) -> Result<String, Error>;
}

/// Constructor for a named provider backend
pub type ProviderFactory = Box<dyn Fn() -> Result<Arc<dyn CloudProvider>, Error> + Send + Sync>;

/// Maps provider names to backend constructors
pub struct ProviderRegistry {
    factories: BTreeMap<String, ProviderFactory>,
}

impl ProviderRegistry {
    /// Create an empty registry
    pub fn new() -> Self {
        Self {
            factories: BTreeMap::new(),
        }
    }

    /// Create a registry holding the built-in providers
    pub fn with_defaults() -> Self {
        let mut registry = Self::new();
        registry.register(FAKE_PROVIDER, || {
            Ok(Arc::new(FakeCloudProvider::new()) as Arc<dyn CloudProvider>)
        });
        registry
    }

    /// Register a backend constructor, replacing any previous one of that name
    pub fn register<F>(&mut self, name: impl Into<String>, factory: F)
    where
        F: Fn() -> Result<Arc<dyn CloudProvider>, Error> + Send + Sync + 'static,
    {
        self.factories.insert(name.into(), Box::new(factory));
    }

    /// Names of every registered backend, sorted
    pub fn names(&self) -> Vec<&str> {
        self.factories.keys().map(String::as_str).collect()
    }

    /// Build the backend registered under `name`
    pub fn create(&self, name: &str) -> Result<Arc<dyn CloudProvider>, Error> {
        let factory = self.factories.get(name).ok_or_else(|| {
            Error::invalid_argument(format!(
                "unknown cloud provider {:?}, expected one of: {}",
                name,
                self.names().join(", ")
            ))
        })?;
        factory()
    }
}

impl Default for ProviderRegistry {
    fn default() -> Self {
        Self::with_defaults()
    }
}
