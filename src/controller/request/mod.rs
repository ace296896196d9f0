//! CycleNodeRequest controller
//!
//! Drives one request through its phases:
//!
//! ```text
//! Pending -> Initialised -> ScalingUp -> WaitingTermination -> Initialised ... -> Successful
//!                                 \                \
//!                                  +-> Healing <----+-> Failed
//! ```
//!
//! Each reconcile performs one phase's work. Progress lives in the request's
//! status, and every decision re-reads nodes and the provider, so a restart
//! resumes where the last persisted phase left off.

mod healing;
mod initialised;
mod nodes;
mod pending;
mod scaling_up;
mod successful;
mod waiting_termination;

pub use nodes::{
    add_named_nodes_to_terminate, get_nodes_to_terminate, list_ready_nodes, release_node,
    Selection,
};

use std::sync::Arc;
use std::time::Duration;

use kube::runtime::controller::Action;
use kube::ResourceExt;
use tracing::{debug, error, info, instrument, warn};

use crate::controller::{now_rfc3339, Context};
use crate::crd::{CycleNodeRequest, CycleNodeRequestPhase, CycleNodeRequestStatus};
use crate::metrics::{self, ReconcileTimer};
use crate::Error;

/// Reconcile a CycleNodeRequest
///
/// Non-retryable errors end the request: claimed nodes are released through
/// `Healing`, and the error is persisted in `status.message`.
#[instrument(skip(cnr, ctx), fields(request = %cnr.name_any(), phase = %cnr.phase()))]
pub async fn reconcile(cnr: Arc<CycleNodeRequest>, ctx: Arc<Context>) -> Result<Action, Error> {
    let timer = ReconcileTimer::start("request");
    let phase = cnr.phase();
    debug!("reconciling request");

    let result = match phase {
        CycleNodeRequestPhase::Pending => pending::handle_pending(&cnr, &ctx).await,
        CycleNodeRequestPhase::Initialised => initialised::handle_initialised(&cnr, &ctx).await,
        CycleNodeRequestPhase::ScalingUp => scaling_up::handle_scaling_up(&cnr, &ctx).await,
        CycleNodeRequestPhase::WaitingTermination => {
            waiting_termination::handle_waiting_termination(&cnr, &ctx).await
        }
        CycleNodeRequestPhase::Healing => healing::handle_healing(&cnr, &ctx).await,
        CycleNodeRequestPhase::Successful => successful::handle_successful(&cnr, &ctx).await,
        CycleNodeRequestPhase::Failed => Ok(Action::await_change()),
    };

    match result {
        Ok(action) => {
            timer.success();
            Ok(action)
        }
        Err(e) if !e.is_retryable() && !phase.is_terminal() => {
            timer.error(false);
            warn!(error = %e, "request cannot make progress");
            let status = current_status(&cnr);
            fail(&cnr, &ctx, status, e.to_string()).await?;
            Ok(Action::requeue(Duration::from_secs(1)))
        }
        Err(e) => {
            timer.error(e.is_retryable());
            Err(e)
        }
    }
}

/// Error policy for the CycleNodeRequest controller
pub fn error_policy(cnr: Arc<CycleNodeRequest>, error: &Error, _ctx: Arc<Context>) -> Action {
    error!(
        ?error,
        request = %cnr.name_any(),
        "reconciliation failed"
    );
    Action::requeue(Duration::from_secs(5))
}

/// Namespace of the request, defaulting to the watched namespace
pub(crate) fn namespace_of(cnr: &CycleNodeRequest, ctx: &Context) -> String {
    cnr.namespace()
        .unwrap_or_else(|| ctx.options.namespace.clone())
}

/// Working copy of the request's status
pub(crate) fn current_status(cnr: &CycleNodeRequest) -> CycleNodeRequestStatus {
    cnr.status.clone().unwrap_or_default()
}

/// Persist a status, skipping the write when nothing changed
pub(crate) async fn update_status(
    cnr: &CycleNodeRequest,
    ctx: &Context,
    status: &CycleNodeRequestStatus,
) -> Result<(), Error> {
    if cnr.status.as_ref() == Some(status) {
        debug!("status unchanged, skipping update");
        return Ok(());
    }
    ctx.store
        .patch_request_status(&namespace_of(cnr, ctx), &cnr.name_any(), status)
        .await
}

/// Move the request into `phase` and persist the status
pub(crate) async fn transition(
    cnr: &CycleNodeRequest,
    ctx: &Context,
    mut status: CycleNodeRequestStatus,
    phase: CycleNodeRequestPhase,
    message: Option<String>,
) -> Result<(), Error> {
    info!(from = %status.phase, to = %phase, "request phase transition");
    status.phase = phase;
    status.message = message;
    status.phase_started_at = Some(now_rfc3339());
    status.num_nodes_in_progress = status.current_nodes.len() as u32;
    update_status(cnr, ctx, &status).await?;
    metrics::record_request_transition(phase.as_str());
    Ok(())
}

/// End the request with a message
///
/// Goes through `Healing` from any phase that may have claimed nodes, so the
/// claims are released; `Pending` and `Healing` itself go straight to
/// `Failed`.
pub(crate) async fn fail(
    cnr: &CycleNodeRequest,
    ctx: &Context,
    status: CycleNodeRequestStatus,
    message: String,
) -> Result<(), Error> {
    let next = match status.phase {
        CycleNodeRequestPhase::Pending | CycleNodeRequestPhase::Healing => {
            CycleNodeRequestPhase::Failed
        }
        _ => CycleNodeRequestPhase::Healing,
    };
    transition(cnr, ctx, status, next, Some(message)).await
}
