use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

use crate::domain::coordination::node_descriptor::NodeDescriptor;
use crate::domain::metrics::MetricsSample;
use crate::domain::node::status::{NodeContext, NodeStatus, TopologyListing};
use crate::domain::topology::config::TopologyConfigOverrides;
use crate::domain::utils::id::TopologyId;

/// Requests a client can make of any node.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum ServiceRequest {
    /// Instantiates the catalog entry `catalog_name` as `topology_id` on every
    /// node its placement names and starts it.
    RunTopology { topology_id: TopologyId, catalog_name: String, overrides: TopologyConfigOverrides },
    TerminateTopology { topology_id: TopologyId },
    HaltTopology { topology_id: TopologyId },
    ResumeTopology { topology_id: TopologyId },
    ListTopologies,
    GetStatus,
    GetNodeContext,
    /// Recent samples of this node, optionally for one topology only.
    GetMetrics { topology_id: Option<TopologyId> },
}

impl ServiceRequest {
    pub fn name(&self) -> &'static str {
        match self {
            ServiceRequest::RunTopology { .. } => "RunTopology",
            ServiceRequest::TerminateTopology { .. } => "TerminateTopology",
            ServiceRequest::HaltTopology { .. } => "HaltTopology",
            ServiceRequest::ResumeTopology { .. } => "ResumeTopology",
            ServiceRequest::ListTopologies => "ListTopologies",
            ServiceRequest::GetStatus => "GetStatus",
            ServiceRequest::GetNodeContext => "GetNodeContext",
            ServiceRequest::GetMetrics { .. } => "GetMetrics",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum ServiceResponse {
    TopologyPrepared { topology_id: TopologyId },
    TopologyRunning { topology_id: TopologyId },
    TopologyTerminated { topology_id: TopologyId },
    TopologyRemoved { topology_id: TopologyId },
    TopologyHalted { topology_id: TopologyId },
    TopologyResumed { topology_id: TopologyId },
    Topologies(BTreeMap<NodeDescriptor, Vec<TopologyListing>>),
    Status(Vec<NodeStatus>),
    NodeContext(NodeContext),
    Metrics(Vec<MetricsSample>),
    Error { reason: String },
}

impl ServiceResponse {
    pub fn is_error(&self) -> bool {
        matches!(self, ServiceResponse::Error { .. })
    }
}
