//! Leader election using Kubernetes Leases
//!
//! Only the replica holding the `coordination.k8s.io/v1` Lease runs the
//! controllers. Writes carry the lease's resourceVersion, so a lease changed
//! between read and write fails with 409 Conflict and nobody takes it twice.

use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use k8s_openapi::api::coordination::v1::{Lease, LeaseSpec};
use k8s_openapi::apimachinery::pkg::apis::meta::v1::{MicroTime, ObjectMeta};
use kube::api::{Api, Patch, PatchParams, PostParams};
use kube::Client;
use serde_json::json;
use tokio::sync::oneshot;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::{Error, FIELD_MANAGER};

/// Lease name for the cyclops controller
pub const LEADER_LEASE_NAME: &str = "cyclops-leader";

const LEASE_DURATION: Duration = Duration::from_secs(30);
const RENEW_INTERVAL: Duration = Duration::from_secs(10);
const RETRY_INTERVAL: Duration = Duration::from_secs(5);

/// What to do with the lease after reading it
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum LeaseDecision {
    /// No lease yet; create it
    Create,
    /// We hold it; renew
    Renew,
    /// Someone else held it and it expired; take it over
    TakeOver {
        /// Transition count to record
        transitions: i32,
    },
    /// Held by someone else
    Wait,
}

/// Decide how to treat the current lease
pub fn decide(
    spec: Option<&LeaseSpec>,
    exists: bool,
    identity: &str,
    now: DateTime<Utc>,
) -> LeaseDecision {
    if !exists {
        return LeaseDecision::Create;
    }
    if spec.and_then(|s| s.holder_identity.as_deref()) == Some(identity) {
        return LeaseDecision::Renew;
    }

    let renew_time = spec.and_then(|s| s.renew_time.as_ref());
    let duration = spec.and_then(|s| s.lease_duration_seconds);
    let expired = match (renew_time, duration) {
        (Some(rt), Some(secs)) => now > rt.0 + chrono::Duration::seconds(secs as i64),
        _ => true,
    };
    let vacant = spec.and_then(|s| s.holder_identity.as_deref()).is_none();

    if expired || vacant {
        LeaseDecision::TakeOver {
            transitions: spec.and_then(|s| s.lease_transitions).unwrap_or(0) + 1,
        }
    } else {
        LeaseDecision::Wait
    }
}

/// Leader elector using Kubernetes Leases
pub struct LeaderElector {
    client: Client,
    lease_name: String,
    namespace: String,
    identity: String,
}

impl LeaderElector {
    /// Create an elector for `identity` (usually the pod name)
    pub fn new(client: Client, lease_name: &str, namespace: &str, identity: &str) -> Self {
        Self {
            client,
            lease_name: lease_name.to_string(),
            namespace: namespace.to_string(),
            identity: identity.to_string(),
        }
    }

    fn api(&self) -> Api<Lease> {
        Api::namespaced(self.client.clone(), &self.namespace)
    }

    /// Block until leadership is acquired
    ///
    /// The returned guard keeps renewing the lease; `lost()` resolves when a
    /// renewal fails.
    pub async fn acquire(self: Arc<Self>) -> LeaderGuard {
        info!(identity = %self.identity, lease = %self.lease_name, "waiting for leadership");

        loop {
            match self.try_acquire_or_renew().await {
                Ok(true) => {
                    info!(identity = %self.identity, "leadership acquired");
                    return self.create_guard();
                }
                Ok(false) => debug!(identity = %self.identity, "lease held by another replica"),
                Err(e) => {
                    warn!(identity = %self.identity, error = %e, "failed to acquire lease, retrying")
                }
            }
            tokio::time::sleep(RETRY_INTERVAL).await;
        }
    }

    fn create_guard(self: &Arc<Self>) -> LeaderGuard {
        let (lost_tx, lost_rx) = oneshot::channel();
        let elector = Arc::clone(self);
        let renewal_task = tokio::spawn(async move {
            elector.renewal_loop(lost_tx).await;
        });

        LeaderGuard {
            elector: Arc::clone(self),
            renewal_task,
            lost_rx: Some(lost_rx),
        }
    }

    async fn try_acquire_or_renew(&self) -> Result<bool, Error> {
        let api = self.api();
        let now = Utc::now();
        let existing = api.get_opt(&self.lease_name).await?;
        let spec = existing.as_ref().and_then(|l| l.spec.as_ref());

        match decide(spec, existing.is_some(), &self.identity, now) {
            LeaseDecision::Wait => Ok(false),
            LeaseDecision::Create => {
                let lease = self.lease(None, now, 0);
                self.write(api.create(&PostParams::default(), &lease).await)
            }
            LeaseDecision::Renew => {
                let Some(mut lease) = existing else {
                    return Ok(false);
                };
                if let Some(spec) = lease.spec.as_mut() {
                    spec.renew_time = Some(MicroTime(now));
                }
                self.write(
                    api.replace(&self.lease_name, &PostParams::default(), &lease)
                        .await,
                )
            }
            LeaseDecision::TakeOver { transitions } => {
                let version = existing.and_then(|l| l.metadata.resource_version);
                let lease = self.lease(version, now, transitions);
                let taken = self.write(
                    api.replace(&self.lease_name, &PostParams::default(), &lease)
                        .await,
                )?;
                if taken {
                    info!(identity = %self.identity, transitions, "took over lease");
                }
                Ok(taken)
            }
        }
    }

    fn lease(
        &self,
        resource_version: Option<String>,
        now: DateTime<Utc>,
        transitions: i32,
    ) -> Lease {
        Lease {
            metadata: ObjectMeta {
                name: Some(self.lease_name.clone()),
                namespace: Some(self.namespace.clone()),
                resource_version,
                ..Default::default()
            },
            spec: Some(LeaseSpec {
                holder_identity: Some(self.identity.clone()),
                lease_duration_seconds: Some(LEASE_DURATION.as_secs() as i32),
                acquire_time: Some(MicroTime(now)),
                renew_time: Some(MicroTime(now)),
                lease_transitions: Some(transitions),
                ..Default::default()
            }),
        }
    }

    /// A conflict means another replica won the race
    fn write(&self, result: Result<Lease, kube::Error>) -> Result<bool, Error> {
        match result {
            Ok(_) => Ok(true),
            Err(kube::Error::Api(e)) if e.code == 409 => {
                debug!(identity = %self.identity, "lease write conflict");
                Ok(false)
            }
            Err(e) => Err(e.into()),
        }
    }

    async fn renewal_loop(&self, lost_tx: oneshot::Sender<()>) {
        loop {
            tokio::time::sleep(RENEW_INTERVAL).await;
            match self.try_acquire_or_renew().await {
                Ok(true) => debug!(identity = %self.identity, "lease renewed"),
                Ok(false) | Err(_) => {
                    warn!(identity = %self.identity, "leadership lost");
                    let _ = lost_tx.send(());
                    return;
                }
            }
        }
    }

    /// Clear the holder so a standby can take over without waiting for expiry
    async fn release_lease(&self) -> Result<(), Error> {
        let api = self.api();
        let Some(lease) = api.get_opt(&self.lease_name).await? else {
            return Ok(());
        };
        let holder = lease.spec.as_ref().and_then(|s| s.holder_identity.as_deref());
        if holder != Some(self.identity.as_str()) {
            return Ok(());
        }

        let past = Utc::now() - chrono::Duration::seconds(60);
        let patch = json!({
            "spec": {
                "holderIdentity": null,
                "renewTime": past.to_rfc3339()
            }
        });
        api.patch(
            &self.lease_name,
            &PatchParams::apply(FIELD_MANAGER),
            &Patch::Merge(&patch),
        )
        .await?;
        info!(identity = %self.identity, "lease released");
        Ok(())
    }
}

/// Guard that keeps the lease renewed while it lives
pub struct LeaderGuard {
    elector: Arc<LeaderElector>,
    renewal_task: JoinHandle<()>,
    lost_rx: Option<oneshot::Receiver<()>>,
}

impl LeaderGuard {
    /// Wait until leadership is lost
    pub async fn lost(&mut self) {
        if let Some(rx) = self.lost_rx.take() {
            let _ = rx.await;
        }
    }

    /// Give up leadership (call during graceful shutdown)
    pub async fn release(&self) -> Result<(), Error> {
        self.renewal_task.abort();
        self.elector.release_lease().await
    }
}

impl Drop for LeaderGuard {
    fn drop(&mut self) {
        self.renewal_task.abort();
    }
}
