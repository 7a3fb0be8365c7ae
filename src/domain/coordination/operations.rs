use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use uuid::Uuid;

use crate::domain::coordination::node_descriptor::NodeDescriptor;
use crate::domain::node::service::ServiceResponse;
use crate::domain::node::status::{NodeStatus, TopologyListing};
use crate::domain::topology::config::TopologyConfigOverrides;
use crate::domain::utils::id::TopologyId;

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct OperationId(Uuid);

impl OperationId {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for OperationId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for OperationId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// What a peer needs to allocate its share of a topology: the catalog entry
/// to instantiate and the per-run configuration changes.
///
/// `token` identifies this one submission attempt. A peer remembers the token
/// of the submission that created its local cluster, so rolling back a failed
/// attempt never removes a cluster some other attempt created.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TopologySubmission {
    pub topology_id: TopologyId,
    pub catalog_name: String,
    pub overrides: TopologyConfigOverrides,
    pub token: Uuid,
}

impl TopologySubmission {
    pub fn new(topology_id: TopologyId, catalog_name: impl Into<String>, overrides: TopologyConfigOverrides) -> Self {
        Self { topology_id, catalog_name: catalog_name.into(), overrides, token: Uuid::new_v4() }
    }
}

/// Request half of a group operation, as carried to every participant.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum GroupRequest {
    PrepareTopology(TopologySubmission),
    StartTopology { topology_id: TopologyId },
    TerminateTopology { topology_id: TopologyId },
    /// With a token, only a cluster created by that submission is removed.
    RemoveTopology { topology_id: TopologyId, token: Option<Uuid> },
    HaltTopology { topology_id: TopologyId },
    ResumeTopology { topology_id: TopologyId },
    ListTopologies,
    GetStatus,
}

impl GroupRequest {
    pub fn name(&self) -> &'static str {
        match self {
            GroupRequest::PrepareTopology(_) => "prepare-topology",
            GroupRequest::StartTopology { .. } => "start-topology",
            GroupRequest::TerminateTopology { .. } => "terminate-topology",
            GroupRequest::RemoveTopology { .. } => "remove-topology",
            GroupRequest::HaltTopology { .. } => "halt-topology",
            GroupRequest::ResumeTopology { .. } => "resume-topology",
            GroupRequest::ListTopologies => "list-topologies",
            GroupRequest::GetStatus => "get-status",
        }
    }
}

/// Payload of a successful participant reply.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum GroupReply {
    Done,
    Topologies(Vec<TopologyListing>),
    Status(NodeStatus),
}

/// Behaviour that differs between kinds of group operation.
pub trait GroupOperationSpec: Send + fmt::Debug {
    fn request(&self) -> GroupRequest;

    /// Folds one participant's success payload into the result.
    fn aggregate(&mut self, _from: &NodeDescriptor, _reply: GroupReply) {}

    fn success_response(&mut self) -> ServiceResponse;

    fn failure_response(&self, reason: &str) -> ServiceResponse {
        ServiceResponse::Error { reason: format!("{} failed: {}", self.request().name(), reason) }
    }
}

#[derive(Debug)]
pub struct PrepareTopologyOperation {
    pub submission: TopologySubmission,
}

impl GroupOperationSpec for PrepareTopologyOperation {
    fn request(&self) -> GroupRequest {
        GroupRequest::PrepareTopology(self.submission.clone())
    }

    fn success_response(&mut self) -> ServiceResponse {
        ServiceResponse::TopologyPrepared { topology_id: self.submission.topology_id.clone() }
    }
}

#[derive(Debug)]
pub struct StartTopologyOperation {
    pub topology_id: TopologyId,
}

impl GroupOperationSpec for StartTopologyOperation {
    fn request(&self) -> GroupRequest {
        GroupRequest::StartTopology { topology_id: self.topology_id.clone() }
    }

    fn success_response(&mut self) -> ServiceResponse {
        ServiceResponse::TopologyRunning { topology_id: self.topology_id.clone() }
    }
}

/// Succeeds only once every participant's local cluster has fully drained.
#[derive(Debug)]
pub struct TerminateTopologyOperation {
    pub topology_id: TopologyId,
}

impl GroupOperationSpec for TerminateTopologyOperation {
    fn request(&self) -> GroupRequest {
        GroupRequest::TerminateTopology { topology_id: self.topology_id.clone() }
    }

    fn success_response(&mut self) -> ServiceResponse {
        ServiceResponse::TopologyTerminated { topology_id: self.topology_id.clone() }
    }
}

#[derive(Debug)]
pub struct RemoveTopologyOperation {
    pub topology_id: TopologyId,
    pub token: Option<Uuid>,
}

impl RemoveTopologyOperation {
    /// Removes the topology whoever created it.
    pub fn any(topology_id: TopologyId) -> Self {
        Self { topology_id, token: None }
    }

    /// Rolls back what one submission allocated and nothing else.
    pub fn created_by(submission: &TopologySubmission) -> Self {
        Self { topology_id: submission.topology_id.clone(), token: Some(submission.token) }
    }
}

impl GroupOperationSpec for RemoveTopologyOperation {
    fn request(&self) -> GroupRequest {
        GroupRequest::RemoveTopology { topology_id: self.topology_id.clone(), token: self.token }
    }

    fn success_response(&mut self) -> ServiceResponse {
        ServiceResponse::TopologyRemoved { topology_id: self.topology_id.clone() }
    }
}

#[derive(Debug)]
pub struct HaltTopologyOperation {
    pub topology_id: TopologyId,
}

impl GroupOperationSpec for HaltTopologyOperation {
    fn request(&self) -> GroupRequest {
        GroupRequest::HaltTopology { topology_id: self.topology_id.clone() }
    }

    fn success_response(&mut self) -> ServiceResponse {
        ServiceResponse::TopologyHalted { topology_id: self.topology_id.clone() }
    }
}

#[derive(Debug)]
pub struct ResumeTopologyOperation {
    pub topology_id: TopologyId,
}

impl GroupOperationSpec for ResumeTopologyOperation {
    fn request(&self) -> GroupRequest {
        GroupRequest::ResumeTopology { topology_id: self.topology_id.clone() }
    }

    fn success_response(&mut self) -> ServiceResponse {
        ServiceResponse::TopologyResumed { topology_id: self.topology_id.clone() }
    }
}

/// Collects every node's topology listing.
#[derive(Debug, Default)]
pub struct ListTopologiesOperation {
    listings: BTreeMap<NodeDescriptor, Vec<TopologyListing>>,
}

impl GroupOperationSpec for ListTopologiesOperation {
    fn request(&self) -> GroupRequest {
        GroupRequest::ListTopologies
    }

    fn aggregate(&mut self, from: &NodeDescriptor, reply: GroupReply) {
        match reply {
            GroupReply::Topologies(listings) => {
                self.listings.insert(from.clone(), listings);
            }
            other => log::warn!("Unexpected list-topologies reply from {}: {:?}", from, other),
        }
    }

    fn success_response(&mut self) -> ServiceResponse {
        ServiceResponse::Topologies(std::mem::take(&mut self.listings))
    }
}

#[derive(Debug, Default)]
pub struct GetStatusOperation {
    statuses: Vec<NodeStatus>,
}

impl GroupOperationSpec for GetStatusOperation {
    fn request(&self) -> GroupRequest {
        GroupRequest::GetStatus
    }

    fn aggregate(&mut self, from: &NodeDescriptor, reply: GroupReply) {
        match reply {
            GroupReply::Status(status) => self.statuses.push(status),
            other => log::warn!("Unexpected get-status reply from {}: {:?}", from, other),
        }
    }

    fn success_response(&mut self) -> ServiceResponse {
        let mut statuses = std::mem::take(&mut self.statuses);
        statuses.sort_by(|a, b| a.descriptor.cmp(&b.descriptor));
        ServiceResponse::Status(statuses)
    }
}
