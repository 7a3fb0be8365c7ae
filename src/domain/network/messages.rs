use serde::{Deserialize, Serialize};

use crate::domain::coordination::node_descriptor::NodeDescriptor;
use crate::domain::coordination::operations::{GroupReply, GroupRequest, OperationId};
use crate::domain::tuple::WireTuple;
use crate::domain::utils::id::{ComponentId, TopologyId};

/// Everything one node sends to another.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NodeMessage {
    pub sender: NodeDescriptor,
    pub body: NodeBody,
}

impl NodeMessage {
    pub fn new(sender: NodeDescriptor, body: NodeBody) -> Self {
        Self { sender, body }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum NodeBody {
    JoinRequest,
    AcceptingJoin { next_node: NodeDescriptor, context: Vec<NodeDescriptor> },
    JoinError { reason: String },
    JoinComplete,
    ContextUpdate { context: Vec<NodeDescriptor> },
    GroupRequest { op_id: OperationId, request: GroupRequest },
    GroupSuccess { op_id: OperationId, reply: GroupReply },
    GroupError { op_id: OperationId, reason: String },
    Tuples(TupleBatch),
}

impl NodeBody {
    pub fn name(&self) -> &'static str {
        match self {
            NodeBody::JoinRequest => "JoinRequest",
            NodeBody::AcceptingJoin { .. } => "AcceptingJoin",
            NodeBody::JoinError { .. } => "JoinError",
            NodeBody::JoinComplete => "JoinComplete",
            NodeBody::ContextUpdate { .. } => "ContextUpdate",
            NodeBody::GroupRequest { .. } => "GroupRequest",
            NodeBody::GroupSuccess { .. } => "GroupSuccess",
            NodeBody::GroupError { .. } => "GroupError",
            NodeBody::Tuples(_) => "Tuples",
        }
    }
}

/// One tuple bound for `task_ids` of `component_id` on the receiving node.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TupleBatch {
    pub topology_id: TopologyId,
    pub component_id: ComponentId,
    pub task_ids: Vec<usize>,
    pub tuple: WireTuple,
}
