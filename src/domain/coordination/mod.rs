//! Cluster-wide coordination: membership, the join protocol and group
//! operations.

pub mod group_operation;
pub mod join;
pub mod membership;
pub mod node_descriptor;
pub mod operations;

pub use group_operation::{Coordinator, OperationOutcome};
pub use membership::{Membership, NodeState};
pub use node_descriptor::NodeDescriptor;
pub use operations::{GroupOperationSpec, GroupReply, GroupRequest, OperationId, TopologySubmission};
