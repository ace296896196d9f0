//! Custom Resource Definitions for cyclops
//!
//! This module contains all CRD definitions used by the operator.

mod cycle_node_request;
mod cycle_node_status;
mod node_group;
mod types;

pub use cycle_node_request::{
    CycleNodeRequest, CycleNodeRequestPhase, CycleNodeRequestSpec, CycleNodeRequestStatus,
    ScaleUpStatus,
};
pub use cycle_node_status::{
    CycleNodeStatus, CycleNodeStatusPhase, CycleNodeStatusSpec, CycleNodeStatusStatus,
};
pub use node_group::{NodeGroup, NodeGroupSpec};
pub use types::{
    CycleNodeRequestMethod, CycleNodeRequestNode, CycleSettings, DaemonsetPodsToRemove,
    LabelSelector,
};
