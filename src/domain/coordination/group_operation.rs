use std::collections::{BTreeSet, HashMap};
use std::sync::{Arc, Mutex, mpsc};
use std::time::{Duration, Instant};

use crate::domain::coordination::node_descriptor::NodeDescriptor;
use crate::domain::coordination::operations::{GroupOperationSpec, GroupReply, GroupRequest, OperationId};
use crate::domain::network::messages::{NodeBody, NodeMessage};
use crate::domain::network::transport::Transport;
use crate::domain::node::service::ServiceResponse;
use crate::domain::utils::sync::lock;

/// Final result of a group operation, delivered once to whoever created it.
#[derive(Debug, Clone, PartialEq)]
pub enum OperationOutcome {
    Success(ServiceResponse),
    Failure { reason: String, response: ServiceResponse },
}

impl OperationOutcome {
    pub fn is_success(&self) -> bool {
        matches!(self, OperationOutcome::Success(_))
    }

    /// The response to hand back to the original requester.
    pub fn into_response(self) -> ServiceResponse {
        match self {
            OperationOutcome::Success(response) => response,
            OperationOutcome::Failure { response, .. } => response,
        }
    }
}

struct ActiveOperation {
    spec: Box<dyn GroupOperationSpec>,
    pending: BTreeSet<NodeDescriptor>,
    deadline: Instant,
    outcome: mpsc::Sender<OperationOutcome>,
}

/// Registry of the group operations this node initiated.
///
/// Fail-fast: the first error, send failure or timeout ends an operation.
/// Replies for operations that are no longer registered are logged and
/// dropped.
pub struct Coordinator {
    transport: Arc<dyn Transport>,
    timeout: Duration,
    operations: Mutex<HashMap<OperationId, ActiveOperation>>,
}

impl Coordinator {
    pub fn new(transport: Arc<dyn Transport>, timeout: Duration) -> Self {
        Self { transport, timeout, operations: Mutex::new(HashMap::new()) }
    }

    fn me(&self) -> &NodeDescriptor {
        self.transport.descriptor()
    }

    /// Registers an operation over `participants` without sending anything.
    pub fn create(&self, spec: impl GroupOperationSpec + 'static, participants: impl IntoIterator<Item = NodeDescriptor>) -> (OperationId, mpsc::Receiver<OperationOutcome>) {
        let op_id = OperationId::new();
        let (tx, rx) = mpsc::channel();
        let pending: BTreeSet<NodeDescriptor> = participants.into_iter().collect();

        log::debug!("Created {} operation {} over {} nodes", spec.request().name(), op_id, pending.len());
        lock(&self.operations).insert(op_id, ActiveOperation { spec: Box::new(spec), pending, deadline: Instant::now() + self.timeout, outcome: tx });
        (op_id, rx)
    }

    /// Sends the request to every participant except this node.
    ///
    /// Returns the request when this node participates too, so the caller
    /// can run the local action and report it through
    /// [`receive_success`](Self::receive_success) or
    /// [`receive_error`](Self::receive_error).
    pub fn initiate(&self, op_id: OperationId) -> Option<GroupRequest> {
        let (request, remote, local) = {
            let operations = lock(&self.operations);
            let operation = operations.get(&op_id)?;
            let remote: Vec<NodeDescriptor> = operation.pending.iter().filter(|n| *n != self.me()).cloned().collect();
            (operation.spec.request(), remote, operation.pending.contains(self.me()))
        };

        // An empty participant set has nothing to wait for.
        if remote.is_empty() && !local {
            self.complete(op_id);
            return None;
        }

        for node in remote {
            let message = NodeMessage::new(self.me().clone(), NodeBody::GroupRequest { op_id, request: request.clone() });
            if let Err(e) = self.transport.send(&node, message) {
                self.fail(op_id, format!("sending {} to {} failed: {}", request.name(), node, e));
                return None;
            }
        }

        if local && self.is_active(op_id) { Some(request) } else { None }
    }

    pub fn receive_success(&self, op_id: OperationId, from: &NodeDescriptor, reply: GroupReply) {
        let finished = {
            let mut operations = lock(&self.operations);
            let Some(operation) = operations.get_mut(&op_id) else {
                log::debug!("Ignoring late success from {} for operation {}", from, op_id);
                return;
            };
            if !operation.pending.remove(from) {
                log::warn!("Operation {} got a success from non-participant {}", op_id, from);
                return;
            }
            operation.spec.aggregate(from, reply);
            if operation.pending.is_empty() { operations.remove(&op_id) } else { None }
        };

        if let Some(mut operation) = finished {
            let response = operation.spec.success_response();
            log::info!("{} operation {} succeeded", operation.spec.request().name(), op_id);
            let _ = operation.outcome.send(OperationOutcome::Success(response));
        }
    }

    pub fn receive_error(&self, op_id: OperationId, from: &NodeDescriptor, reason: &str) {
        let known = lock(&self.operations).get(&op_id).is_some_and(|op| op.pending.contains(from));
        if !known {
            log::debug!("Ignoring error from {} for finished operation {}: {}", from, op_id, reason);
            return;
        }
        self.fail(op_id, format!("{} reported: {}", from, reason));
    }

    /// Fails every operation whose deadline has passed.
    pub fn expire(&self, now: Instant) -> usize {
        let expired: Vec<(OperationId, ActiveOperation)> = {
            let mut operations = lock(&self.operations);
            let ids: Vec<OperationId> = operations.iter().filter(|(_, op)| op.deadline <= now).map(|(id, _)| *id).collect();
            ids.into_iter().filter_map(|id| operations.remove(&id).map(|op| (id, op))).collect()
        };

        let count = expired.len();
        for (op_id, operation) in expired {
            let waiting: Vec<String> = operation.pending.iter().map(ToString::to_string).collect();
            let reason = format!("timed out waiting for [{}]", waiting.join(", "));
            Self::deliver_failure(op_id, operation, reason);
        }
        count
    }

    pub fn is_active(&self, op_id: OperationId) -> bool {
        lock(&self.operations).contains_key(&op_id)
    }

    pub fn active_count(&self) -> usize {
        lock(&self.operations).len()
    }

    fn complete(&self, op_id: OperationId) {
        let operation = lock(&self.operations).remove(&op_id);
        if let Some(mut operation) = operation {
            let response = operation.spec.success_response();
            let _ = operation.outcome.send(OperationOutcome::Success(response));
        }
    }

    fn fail(&self, op_id: OperationId, reason: String) {
        let operation = lock(&self.operations).remove(&op_id);
        if let Some(operation) = operation {
            Self::deliver_failure(op_id, operation, reason);
        }
    }

    fn deliver_failure(op_id: OperationId, operation: ActiveOperation, reason: String) {
        log::warn!("{} operation {} failed: {}", operation.spec.request().name(), op_id, reason);
        let response = operation.spec.failure_response(&reason);
        let _ = operation.outcome.send(OperationOutcome::Failure { reason, response });
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::coordination::operations::{GetStatusOperation, HaltTopologyOperation};
    use crate::domain::network::memory::LocalNetwork;
    use crate::domain::coordination::membership::NodeState;
    use crate::domain::node::status::NodeStatus;
    use crate::domain::utils::id::TopologyId;
    use std::collections::BTreeMap;

    fn nodes(n: u16) -> Vec<NodeDescriptor> {
        (0..n).map(|i| NodeDescriptor::new("localhost", 7000 + i, 8000 + i)).collect()
    }

    fn coordinator(network: &LocalNetwork, me: &NodeDescriptor, timeout: Duration) -> Coordinator {
        Coordinator::new(Arc::new(network.attach(me.clone())), timeout)
    }

    fn halt() -> HaltTopologyOperation {
        HaltTopologyOperation { topology_id: TopologyId::new("t") }
    }

    #[test]
    fn test_succeeds_once_after_all_participants_reply() {
        let network = LocalNetwork::new();
        let all = nodes(3);
        let _peers: Vec<_> = all[1..].iter().map(|n| network.attach(n.clone())).collect();
        let coordinator = coordinator(&network, &all[0], Duration::from_secs(5));

        let (op_id, outcome) = coordinator.create(halt(), all.clone());
        assert_eq!(coordinator.initiate(op_id), Some(GroupRequest::HaltTopology { topology_id: TopologyId::new("t") }));

        for node in &all {
            assert!(outcome.try_recv().is_err());
            coordinator.receive_success(op_id, node, GroupReply::Done);
        }
        assert_eq!(outcome.try_recv().unwrap(), OperationOutcome::Success(ServiceResponse::TopologyHalted { topology_id: TopologyId::new("t") }));

        // A duplicate reply after completion changes nothing.
        coordinator.receive_success(op_id, &all[1], GroupReply::Done);
        assert!(outcome.try_recv().is_err());
        assert_eq!(coordinator.active_count(), 0);
    }

    #[test]
    fn test_first_error_fails_and_later_replies_are_ignored() {
        let network = LocalNetwork::new();
        let all = nodes(3);
        let _peers: Vec<_> = all[1..].iter().map(|n| network.attach(n.clone())).collect();
        let coordinator = coordinator(&network, &all[0], Duration::from_secs(5));

        let (op_id, outcome) = coordinator.create(halt(), all.clone());
        coordinator.initiate(op_id);
        coordinator.receive_success(op_id, &all[0], GroupReply::Done);
        coordinator.receive_error(op_id, &all[1], "no such topology");
        coordinator.receive_success(op_id, &all[2], GroupReply::Done);
        coordinator.receive_error(op_id, &all[2], "again");

        let result = outcome.try_recv().unwrap();
        assert!(!result.is_success());
        assert!(matches!(result, OperationOutcome::Failure { ref reason, .. } if reason.contains("no such topology")));
        assert!(outcome.try_recv().is_err());
    }

    #[test]
    fn test_unreachable_participant_fails_immediately() {
        let network = LocalNetwork::new();
        let all = nodes(2);
        let coordinator = coordinator(&network, &all[0], Duration::from_secs(5));

        let (op_id, outcome) = coordinator.create(halt(), all.clone());
        assert_eq!(coordinator.initiate(op_id), None);
        assert!(!outcome.try_recv().unwrap().is_success());
    }

    #[test]
    fn test_expire_fails_overdue_operations() {
        let network = LocalNetwork::new();
        let all = nodes(2);
        let _peer = network.attach(all[1].clone());
        let coordinator = coordinator(&network, &all[0], Duration::from_millis(10));

        let (op_id, outcome) = coordinator.create(halt(), vec![all[1].clone()]);
        assert_eq!(coordinator.initiate(op_id), None);
        assert_eq!(coordinator.expire(Instant::now() + Duration::from_millis(20)), 1);

        match outcome.try_recv().unwrap() {
            OperationOutcome::Failure { reason, .. } => assert!(reason.contains("timed out")),
            other => panic!("unexpected outcome {:?}", other),
        }
    }

    #[test]
    fn test_status_replies_are_aggregated() {
        let network = LocalNetwork::new();
        let all = nodes(2);
        let _peer = network.attach(all[1].clone());
        let coordinator = coordinator(&network, &all[0], Duration::from_secs(5));

        let (op_id, outcome) = coordinator.create(GetStatusOperation::default(), all.clone());
        coordinator.initiate(op_id);
        for node in all.iter().rev() {
            let status = NodeStatus { descriptor: node.clone(), timestamp_ms: 0, state: NodeState::Operational, topologies: BTreeMap::new() };
            coordinator.receive_success(op_id, node, GroupReply::Status(status));
        }

        match outcome.try_recv().unwrap() {
            OperationOutcome::Success(ServiceResponse::Status(statuses)) => {
                let order: Vec<_> = statuses.into_iter().map(|s| s.descriptor).collect();
                assert_eq!(order, all);
            }
            other => panic!("unexpected outcome {:?}", other),
        }
    }
}
