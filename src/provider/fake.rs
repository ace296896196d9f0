//! In-memory cloud provider
//!
//! Behaves like an autoscaling group service: raising desired capacity
//! launches instances immediately, terminating an instance shrinks desired
//! capacity by one. Used for local runs and state-machine tests.

use std::collections::BTreeMap;
use std::sync::{Mutex, MutexGuard};

use async_trait::async_trait;
use tracing::debug;

use super::{CloudProvider, Instance, FAKE_PROVIDER};
use crate::Error;

#[derive(Default)]
struct Group {
    desired: i64,
    instances: Vec<Instance>,
}

#[derive(Default)]
struct State {
    groups: BTreeMap<String, Group>,
    next_id: u64,
    terminated: Vec<String>,
    unavailable: bool,
}

/// In-memory [`CloudProvider`]
#[derive(Default)]
pub struct FakeCloudProvider {
    state: Mutex<State>,
}

impl FakeCloudProvider {
    /// Create a provider with no node groups
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a node group holding the given instances
    pub fn with_group<I, S>(self, name: &str, provider_ids: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.add_group(name, provider_ids);
        self
    }

    /// Add (or replace) a node group holding the given instances
    pub fn add_group<I, S>(&self, name: &str, provider_ids: I)
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let instances: Vec<Instance> = provider_ids
            .into_iter()
            .map(|id| Instance::new(id, name))
            .collect();
        let mut state = self.lock();
        state.groups.insert(
            name.to_string(),
            Group {
                desired: instances.len() as i64,
                instances,
            },
        );
    }

    /// Make every call fail with a provider error until reset
    pub fn set_unavailable(&self, unavailable: bool) {
        self.lock().unavailable = unavailable;
    }

    /// Provider IDs terminated so far, in order
    pub fn terminated(&self) -> Vec<String> {
        self.lock().terminated.clone()
    }

    /// Current members of a node group, without the availability check
    pub fn members(&self, node_group: &str) -> Vec<Instance> {
        self.lock()
            .groups
            .get(node_group)
            .map(|g| g.instances.clone())
            .unwrap_or_default()
    }

    /// Current desired capacity of a node group, without the availability check
    pub fn capacity(&self, node_group: &str) -> Option<i64> {
        self.lock().groups.get(node_group).map(|g| g.desired)
    }

    fn lock(&self) -> MutexGuard<'_, State> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn available(&self) -> Result<MutexGuard<'_, State>, Error> {
        let state = self.lock();
        if state.unavailable {
            return Err(Error::provider(FAKE_PROVIDER, "provider unavailable"));
        }
        Ok(state)
    }
}

#[async_trait]
impl CloudProvider for FakeCloudProvider {
    fn name(&self) -> &'static str {
        FAKE_PROVIDER
    }

    async fn instances(&self, node_group: &str) -> Result<Vec<Instance>, Error> {
        let state = self.available()?;
        state
            .groups
            .get(node_group)
            .map(|g| g.instances.clone())
            .ok_or_else(|| Error::not_found("NodeGroup", node_group))
    }

    async fn desired_capacity(&self, node_group: &str) -> Result<i64, Error> {
        let state = self.available()?;
        state
            .groups
            .get(node_group)
            .map(|g| g.desired)
            .ok_or_else(|| Error::not_found("NodeGroup", node_group))
    }

    async fn set_desired_capacity(&self, node_group: &str, capacity: i64) -> Result<(), Error> {
        let mut state = self.available()?;
        let State {
            groups, next_id, ..
        } = &mut *state;
        let group = groups
            .get_mut(node_group)
            .ok_or_else(|| Error::not_found("NodeGroup", node_group))?;

        group.desired = capacity.max(0);
        while (group.instances.len() as i64) < group.desired {
            *next_id += 1;
            let id = format!("fake:///{}/i-{:04}", node_group, next_id);
            debug!(node_group = %node_group, provider_id = %id, "launching instance");
            group.instances.push(Instance::new(id, node_group));
        }
        Ok(())
    }

    async fn terminate_instance(&self, provider_id: &str) -> Result<(), Error> {
        let mut state = self.available()?;
        let State {
            groups, terminated, ..
        } = &mut *state;
        let owner = groups.values_mut().find(|g| {
            g.instances
                .iter()
                .any(|i| i.provider_id == provider_id)
        });

        let Some(group) = owner else {
            debug!(provider_id = %provider_id, "instance already terminated");
            return Ok(());
        };
        group.instances.retain(|i| i.provider_id != provider_id);
        group.desired = (group.desired - 1).max(0);
        terminated.push(provider_id.to_string());
        Ok(())
    }

    async fn node_group_of(&self, provider_id: &str) -> Result<String, Error> {
        let state = self.available()?;
        state
            .groups
            .values()
            .flat_map(|g| g.instances.iter())
            .find(|i| i.provider_id == provider_id)
            .map(|i| i.node_group_name.clone())
            .ok_or_else(|| Error::not_found("Instance", provider_id))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn raising_capacity_launches_instances() {
        let provider = FakeCloudProvider::new().with_group("workers", ["fake:///a", "fake:///b"]);
        provider
            .set_desired_capacity("workers", 3)
            .await
            .expect("scale");

        let instances = provider.instances("workers").await.expect("instances");
        assert_eq!(instances.len(), 3);
        assert_eq!(provider.desired_capacity("workers").await.expect("cap"), 3);
        assert_eq!(
            provider
                .node_group_of(&instances[2].provider_id)
                .await
                .expect("group"),
            "workers"
        );
    }

    #[tokio::test]
    async fn terminate_is_idempotent_and_shrinks_capacity() {
        let provider = FakeCloudProvider::new().with_group("workers", ["fake:///a", "fake:///b"]);
        provider.terminate_instance("fake:///a").await.expect("terminate");
        provider
            .terminate_instance("fake:///a")
            .await
            .expect("second terminate is a no-op");

        assert_eq!(provider.capacity("workers"), Some(1));
        assert_eq!(provider.terminated(), vec!["fake:///a"]);
        assert!(provider
            .node_group_of("fake:///a")
            .await
            .expect_err("gone")
            .is_not_found());
    }

    #[tokio::test]
    async fn unavailable_provider_returns_retryable_errors() {
        let provider = FakeCloudProvider::new().with_group("workers", ["fake:///a"]);
        provider.set_unavailable(true);
        let err = provider.instances("workers").await.expect_err("unavailable");
        assert!(err.is_retryable());
        assert!(!err.is_not_found());

        provider.set_unavailable(false);
        assert!(provider.instances("workers").await.is_ok());
        assert!(provider.instances("missing").await.expect_err("missing").is_not_found());
    }
}
