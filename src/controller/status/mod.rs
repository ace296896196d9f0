//! CycleNodeStatus controller
//!
//! Drains one node. Each phase runs a fixed list of steps in order; the phase
//! advances once every step reports finished in a single pass.
//!
//! ```text
//! Pending -> RemovingLabels -> DrainingPods | WaitingPods -> HealthChecking -> Successful
//! ```
//!
//! Any phase that outlives the drain timeout ends in `Failed`. A node that
//! disappears mid-drain ends in `Successful`: there is nothing left to drain.

mod steps;

pub use steps::{
    check_node_health, evict_pods, remove_labels_from_node, remove_pod_labels,
    wait_pods_removed, wait_targeted_daemonset_pods_removed,
};

use std::sync::Arc;
use std::time::Duration;

use kube::runtime::controller::Action;
use kube::ResourceExt;
use tracing::{debug, error, info, instrument, warn};

use crate::controller::{elapsed_since, is_cordoned, now_rfc3339, provider_id, Context};
use crate::crd::{
    CycleNodeRequestMethod, CycleNodeRequestNode, CycleNodeStatus, CycleNodeStatusPhase,
    CycleNodeStatusStatus,
};
use crate::metrics::{self, DrainResult, ReconcileTimer};
use crate::Error;

/// A named unit of drain work
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Step {
    /// Strip configured labels from pods on the node
    RemovePodLabels,
    /// Strip configured labels from the node itself
    RemoveLabelsFromNode,
    /// Wait for daemonset pods released by the node label removal
    WaitTargetedDaemonsetPodsRemoved,
    /// Evict pods
    EvictPods,
    /// Wait for pods to leave
    WaitPodsRemoved,
    /// Final health check
    CheckNodeHealth,
}

impl Step {
    /// Step name used in logs
    pub fn name(self) -> &'static str {
        match self {
            Self::RemovePodLabels => "removePodLabels",
            Self::RemoveLabelsFromNode => "removeLabelsFromNode",
            Self::WaitTargetedDaemonsetPodsRemoved => "waitTargetedDaemonsetPodsRemoved",
            Self::EvictPods => "evictPods",
            Self::WaitPodsRemoved => "waitPodsRemoved",
            Self::CheckNodeHealth => "checkNodeHealth",
        }
    }

    async fn run(self, cns: &CycleNodeStatus, ctx: &Context) -> Result<bool, Error> {
        match self {
            Self::RemovePodLabels => remove_pod_labels(cns, ctx).await,
            Self::RemoveLabelsFromNode => remove_labels_from_node(cns, ctx).await,
            Self::WaitTargetedDaemonsetPodsRemoved => {
                wait_targeted_daemonset_pods_removed(cns, ctx).await
            }
            Self::EvictPods => evict_pods(cns, ctx).await,
            Self::WaitPodsRemoved => wait_pods_removed(cns, ctx).await,
            Self::CheckNodeHealth => check_node_health(cns, ctx).await,
        }
    }
}

/// Steps run in a phase, in order
pub fn steps_for(phase: CycleNodeStatusPhase) -> &'static [Step] {
    match phase {
        CycleNodeStatusPhase::RemovingLabels => &[
            Step::RemovePodLabels,
            Step::RemoveLabelsFromNode,
            Step::WaitTargetedDaemonsetPodsRemoved,
        ],
        CycleNodeStatusPhase::DrainingPods => &[Step::EvictPods],
        CycleNodeStatusPhase::WaitingPods => &[Step::WaitPodsRemoved],
        CycleNodeStatusPhase::HealthChecking => &[Step::CheckNodeHealth],
        _ => &[],
    }
}

/// Phase entered once every step of `phase` has finished
pub fn next_phase(
    phase: CycleNodeStatusPhase,
    method: CycleNodeRequestMethod,
) -> CycleNodeStatusPhase {
    match (phase, method) {
        (CycleNodeStatusPhase::Pending, _) => CycleNodeStatusPhase::RemovingLabels,
        (CycleNodeStatusPhase::RemovingLabels, CycleNodeRequestMethod::Drain) => {
            CycleNodeStatusPhase::DrainingPods
        }
        (CycleNodeStatusPhase::RemovingLabels, CycleNodeRequestMethod::Wait) => {
            CycleNodeStatusPhase::WaitingPods
        }
        (CycleNodeStatusPhase::DrainingPods | CycleNodeStatusPhase::WaitingPods, _) => {
            CycleNodeStatusPhase::HealthChecking
        }
        (CycleNodeStatusPhase::HealthChecking, _) => CycleNodeStatusPhase::Successful,
        (terminal, _) => terminal,
    }
}

/// Reconcile a CycleNodeStatus
#[instrument(skip(cns, ctx), fields(status = %cns.name_any(), node = %cns.node_name(), phase = %cns.phase()))]
pub async fn reconcile(cns: Arc<CycleNodeStatus>, ctx: Arc<Context>) -> Result<Action, Error> {
    let phase = cns.phase();
    if phase.is_terminal() {
        return Ok(Action::await_change());
    }

    let timer = ReconcileTimer::start("status");
    debug!("reconciling node status");

    let result = match phase {
        CycleNodeStatusPhase::Pending => handle_pending(&cns, &ctx).await,
        _ => handle_steps(&cns, &ctx, phase).await,
    };

    match result {
        Ok(action) => {
            timer.success();
            Ok(action)
        }
        Err(e) if e.is_not_found() => {
            timer.success();
            info!(error = %e, "node is gone, nothing left to drain");
            transition(
                &cns,
                &ctx,
                current_status(&cns),
                CycleNodeStatusPhase::Successful,
                Some("node no longer exists".to_string()),
            )
            .await?;
            Ok(Action::await_change())
        }
        Err(e) if !e.is_retryable() => {
            timer.error(false);
            warn!(error = %e, "drain cannot make progress");
            transition(
                &cns,
                &ctx,
                current_status(&cns),
                CycleNodeStatusPhase::Failed,
                Some(e.to_string()),
            )
            .await?;
            Ok(Action::await_change())
        }
        Err(e) => {
            timer.error(true);
            let mut status = current_status(&cns);
            status.message = Some(e.to_string());
            update_status(&cns, &ctx, &status).await?;
            Err(e)
        }
    }
}

/// Error policy for the CycleNodeStatus controller
pub fn error_policy(cns: Arc<CycleNodeStatus>, error: &Error, _ctx: Arc<Context>) -> Action {
    error!(
        ?error,
        status = %cns.name_any(),
        "reconciliation failed"
    );
    Action::requeue(Duration::from_secs(5))
}

fn current_status(cns: &CycleNodeStatus) -> CycleNodeStatusStatus {
    cns.status.clone().unwrap_or_default()
}

async fn update_status(
    cns: &CycleNodeStatus,
    ctx: &Context,
    status: &CycleNodeStatusStatus,
) -> Result<(), Error> {
    if cns.status.as_ref() == Some(status) {
        debug!("status unchanged, skipping update");
        return Ok(());
    }
    let namespace = cns
        .namespace()
        .unwrap_or_else(|| ctx.options.namespace.clone());
    ctx.store
        .patch_node_status(&namespace, &cns.name_any(), status)
        .await
}

async fn transition(
    cns: &CycleNodeStatus,
    ctx: &Context,
    mut status: CycleNodeStatusStatus,
    phase: CycleNodeStatusPhase,
    message: Option<String>,
) -> Result<(), Error> {
    info!(from = %status.phase, to = %phase, "node status phase transition");
    status.phase = phase;
    status.message = message;
    status.phase_started_at = Some(now_rfc3339());
    update_status(cns, ctx, &status).await?;

    match phase {
        CycleNodeStatusPhase::Successful => metrics::record_drain(DrainResult::Successful),
        CycleNodeStatusPhase::Failed => metrics::record_drain(DrainResult::Failed),
        _ => {}
    }
    Ok(())
}

/// Inspect the node, cordon it and record what is being drained
async fn handle_pending(cns: &CycleNodeStatus, ctx: &Context) -> Result<Action, Error> {
    let node = ctx.nodes.get_node(&cns.spec.node_name).await?;

    let live_id = provider_id(&node);
    if !cns.spec.provider_id.is_empty() && live_id != cns.spec.provider_id {
        info!(
            expected = %cns.spec.provider_id,
            found = %live_id,
            "node was replaced before draining started"
        );
        transition(
            cns,
            ctx,
            current_status(cns),
            CycleNodeStatusPhase::Successful,
            Some("node was replaced before draining started".to_string()),
        )
        .await?;
        return Ok(Action::await_change());
    }

    if !is_cordoned(&node) {
        info!("cordoning node");
        ctx.nodes.cordon_node(&cns.spec.node_name).await?;
    }

    let mut status = current_status(cns);
    status.current_node = Some(CycleNodeRequestNode::from_node(&node, String::new()));
    let next = next_phase(CycleNodeStatusPhase::Pending, cns.spec.cycle_settings.method);
    transition(cns, ctx, status, next, None).await?;
    Ok(Action::requeue(Duration::from_secs(1)))
}

/// Run the phase's steps; advance when all of them are finished
async fn handle_steps(
    cns: &CycleNodeStatus,
    ctx: &Context,
    phase: CycleNodeStatusPhase,
) -> Result<Action, Error> {
    let started = cns.status.as_ref().and_then(|s| s.phase_started_at.as_deref());
    if let Some(elapsed) = elapsed_since(started) {
        if elapsed > ctx.options.drain_timeout {
            let mut message = format!(
                "timed out after {:?} in phase {}",
                ctx.options.drain_timeout, phase
            );
            if let Some(last) = cns.status.as_ref().and_then(|s| s.message.as_deref()) {
                message.push_str(": ");
                message.push_str(last);
            }
            warn!(%message, "drain timed out");
            transition(
                cns,
                ctx,
                current_status(cns),
                CycleNodeStatusPhase::Failed,
                Some(message),
            )
            .await?;
            return Ok(Action::await_change());
        }
    }

    for step in steps_for(phase) {
        if !step.run(cns, ctx).await? {
            debug!(step = step.name(), "step not finished");
            return Ok(Action::requeue(ctx.options.step_interval));
        }
        debug!(step = step.name(), "step finished");
    }

    let next = next_phase(phase, cns.spec.cycle_settings.method);
    transition(cns, ctx, current_status(cns), next, None).await?;
    if next.is_terminal() {
        Ok(Action::await_change())
    } else {
        Ok(Action::requeue(Duration::from_secs(1)))
    }
}
