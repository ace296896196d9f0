//! Controller runner - builds the controller futures for both state machines
//!
//! Construction is kept separate from running so the caller decides when to
//! start (after leader election) and how to compose the futures.

use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;

use futures::StreamExt;
use kube::runtime::controller::Config as ControllerConfig;
use kube::runtime::watcher::Config as WatcherConfig;
use kube::runtime::Controller;
use kube::{Api, Client};

use super::{request, status, Context};
use crate::crd::{CycleNodeRequest, CycleNodeStatus};

/// Watcher timeout (seconds); must stay below the client read timeout (30s)
/// so idle watches are closed by the API server first.
const WATCH_TIMEOUT_SECS: u32 = 25;

/// Boxed controller future
pub type ControllerFuture = Pin<Box<dyn Future<Output = ()> + Send>>;

/// Build the CycleNodeRequest and CycleNodeStatus controllers
///
/// Both watch the configured namespace. A request is also reconciled when one
/// of its CycleNodeStatus objects changes, so finished drains are picked up
/// without waiting for the poll interval.
pub fn build_controllers(client: Client, ctx: Arc<Context>) -> Vec<ControllerFuture> {
    let namespace = ctx.options.namespace.clone();
    let concurrency = ctx.options.concurrency;
    let requests: Api<CycleNodeRequest> = Api::namespaced(client.clone(), &namespace);
    let statuses: Api<CycleNodeStatus> = Api::namespaced(client, &namespace);

    tracing::info!(%namespace, concurrency, "- CycleNodeRequest controller");
    let request_ctrl = Controller::new(
        requests,
        WatcherConfig::default().timeout(WATCH_TIMEOUT_SECS),
    )
    .owns(
        statuses.clone(),
        WatcherConfig::default().timeout(WATCH_TIMEOUT_SECS),
    )
    .with_config(ControllerConfig::default().concurrency(concurrency))
    .shutdown_on_signal()
    .run(request::reconcile, request::error_policy, ctx.clone())
    .for_each(log_reconcile_result("CycleNodeRequest"));

    tracing::info!(%namespace, concurrency, "- CycleNodeStatus controller");
    let status_ctrl = Controller::new(
        statuses,
        WatcherConfig::default().timeout(WATCH_TIMEOUT_SECS),
    )
    .with_config(ControllerConfig::default().concurrency(concurrency))
    .shutdown_on_signal()
    .run(status::reconcile, status::error_policy, ctx)
    .for_each(log_reconcile_result("CycleNodeStatus"));

    vec![Box::pin(request_ctrl), Box::pin(status_ctrl)]
}

fn log_reconcile_result<T: std::fmt::Debug, E: std::fmt::Debug>(
    controller_name: &'static str,
) -> impl Fn(Result<T, E>) -> std::future::Ready<()> {
    move |result| {
        match result {
            Ok(action) => tracing::debug!(?action, "{} reconciliation completed", controller_name),
            Err(e) => tracing::error!(error = ?e, "{} reconciliation error", controller_name),
        }
        std::future::ready(())
    }
}
