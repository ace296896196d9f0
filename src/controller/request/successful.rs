//! Successful phase handler.
//!
//! Optionally deletes the request once it has expired.

use kube::runtime::controller::Action;
use kube::ResourceExt;
use tracing::{debug, info};

use super::namespace_of;
use crate::controller::Context;
use crate::crd::CycleNodeRequest;
use crate::Error;

/// Handle a request in the Successful phase.
pub async fn handle_successful(cnr: &CycleNodeRequest, ctx: &Context) -> Result<Action, Error> {
    let options = &ctx.options;
    if !options.delete_cnr {
        return Ok(Action::await_change());
    }

    let age = cnr
        .metadata
        .creation_timestamp
        .as_ref()
        .and_then(|t| (chrono::Utc::now() - t.0).to_std().ok());

    match age {
        Some(age) if age > options.delete_cnr_expiry => {
            info!(?age, "deleting expired request");
            ctx.store
                .delete_request(&namespace_of(cnr, ctx), &cnr.name_any())
                .await?;
            Ok(Action::await_change())
        }
        _ => {
            debug!(?age, "request not expired yet");
            Ok(Action::requeue(options.delete_cnr_requeue))
        }
    }
}
