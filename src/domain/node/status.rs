use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

use crate::domain::cluster::{ClusterState, ComponentError, LocalCluster, TaskSnapshot};
use crate::domain::coordination::membership::NodeState;
use crate::domain::coordination::node_descriptor::NodeDescriptor;
use crate::domain::utils::id::TopologyId;

/// One node's answer to a status request.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NodeStatus {
    pub descriptor: NodeDescriptor,
    pub timestamp_ms: i64,
    pub state: NodeState,
    pub topologies: BTreeMap<TopologyId, ClusterState>,
}

/// One topology as seen by one node, component errors included.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TopologyListing {
    pub topology_id: TopologyId,
    pub name: String,
    pub state: ClusterState,
    pub tasks: Vec<TaskSnapshot>,
    pub errors: BTreeMap<String, Vec<ComponentError>>,
}

impl TopologyListing {
    pub fn of(cluster: &LocalCluster) -> Self {
        Self {
            topology_id: cluster.topology_id().clone(),
            name: cluster.topology().name().to_string(),
            state: cluster.state(),
            tasks: cluster.snapshot(),
            errors: cluster.component_errors(),
        }
    }

    pub fn error_count(&self) -> usize {
        self.errors.values().map(Vec::len).sum()
    }
}

/// Membership view of one node.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NodeContext {
    pub node: NodeDescriptor,
    pub state: NodeState,
    pub next_node: Option<NodeDescriptor>,
    pub members: Vec<NodeDescriptor>,
}
