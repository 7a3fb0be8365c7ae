use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::fmt;
use std::sync::Mutex;
use std::time::{Duration, Instant};

use crate::domain::coordination::node_descriptor::NodeDescriptor;
use crate::domain::utils::sync::lock;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum NodeState {
    Joining,
    JoinRequested,
    AcceptingJoin,
    Operational,
}

impl fmt::Display for NodeState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            NodeState::Joining => "JOINING",
            NodeState::JoinRequested => "JOIN_REQUESTED",
            NodeState::AcceptingJoin => "ACCEPTING_JOIN",
            NodeState::Operational => "OPERATIONAL",
        };
        f.write_str(name)
    }
}

#[derive(Debug)]
struct MembershipState {
    state: NodeState,
    members: BTreeSet<NodeDescriptor>,
    next_node: Option<NodeDescriptor>,
    accepting: Option<(NodeDescriptor, Instant)>,
}

/// What an accepting node hands to a joiner.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Acceptance {
    pub next_node: NodeDescriptor,
    pub context: Vec<NodeDescriptor>,
}

/// This node's view of the cluster: its own join state, the known members
/// (itself included) and its successor on the ring.
#[derive(Debug)]
pub struct Membership {
    me: NodeDescriptor,
    inner: Mutex<MembershipState>,
}

impl Membership {
    pub fn new(me: NodeDescriptor) -> Self {
        let members = BTreeSet::from([me.clone()]);
        Self { me, inner: Mutex::new(MembershipState { state: NodeState::Joining, members, next_node: None, accepting: None }) }
    }

    pub fn me(&self) -> &NodeDescriptor {
        &self.me
    }

    pub fn state(&self) -> NodeState {
        lock(&self.inner).state
    }

    pub fn set_state(&self, state: NodeState) {
        let mut inner = lock(&self.inner);
        if inner.state != state {
            log::debug!("Node {} state {} -> {}", self.me, inner.state, state);
            inner.state = state;
        }
    }

    /// Every known member, this node included, in descriptor order.
    pub fn members(&self) -> Vec<NodeDescriptor> {
        lock(&self.inner).members.iter().cloned().collect()
    }

    pub fn peers(&self) -> Vec<NodeDescriptor> {
        lock(&self.inner).members.iter().filter(|m| **m != self.me).cloned().collect()
    }

    /// Adds every descriptor in `context`. Returns how many were new.
    pub fn merge(&self, context: impl IntoIterator<Item = NodeDescriptor>) -> usize {
        let mut inner = lock(&self.inner);
        context.into_iter().filter(|node| inner.members.insert(node.clone())).count()
    }

    pub fn next_node(&self) -> Option<NodeDescriptor> {
        lock(&self.inner).next_node.clone()
    }

    pub fn set_next_node(&self, next: NodeDescriptor) {
        lock(&self.inner).next_node = Some(next);
    }

    /// Starts accepting `joiner`. Only an operational node accepts, and only
    /// one joiner at a time.
    pub fn begin_accept(&self, joiner: &NodeDescriptor) -> Result<Acceptance, String> {
        let mut inner = lock(&self.inner);
        if inner.state != NodeState::Operational {
            return Err(format!("node {} is {}", self.me, inner.state));
        }

        inner.state = NodeState::AcceptingJoin;
        inner.accepting = Some((joiner.clone(), Instant::now()));
        inner.members.insert(joiner.clone());
        let next_node = inner.next_node.replace(joiner.clone()).unwrap_or_else(|| self.me.clone());
        Ok(Acceptance { next_node, context: inner.members.iter().cloned().collect() })
    }

    /// Ends the accept phase for `joiner`. False if it was not being accepted.
    pub fn finish_accept(&self, joiner: &NodeDescriptor) -> bool {
        let mut inner = lock(&self.inner);
        match &inner.accepting {
            Some((accepting, _)) if accepting == joiner => {
                inner.accepting = None;
                inner.state = NodeState::Operational;
                true
            }
            _ => false,
        }
    }

    /// Returns to OPERATIONAL if a joiner never completed within `timeout`.
    pub fn expire_accept(&self, timeout: Duration) -> Option<NodeDescriptor> {
        let mut inner = lock(&self.inner);
        let overdue = matches!(&inner.accepting, Some((_, since)) if since.elapsed() >= timeout);
        if !overdue {
            return None;
        }
        inner.state = NodeState::Operational;
        inner.accepting.take().map(|(joiner, _)| joiner)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn node(i: u16) -> NodeDescriptor {
        NodeDescriptor::new("localhost", 7000 + i, 8000 + i)
    }

    #[test]
    fn test_merge_never_duplicates() {
        let membership = Membership::new(node(0));
        assert_eq!(membership.merge([node(1), node(2)]), 2);
        assert_eq!(membership.merge([node(1), node(0)]), 0);
        assert_eq!(membership.members(), vec![node(0), node(1), node(2)]);
        assert_eq!(membership.peers(), vec![node(1), node(2)]);
    }

    #[test]
    fn test_accepting_splices_joiner_into_ring() {
        let membership = Membership::new(node(0));
        assert!(membership.begin_accept(&node(1)).is_err(), "a joining node must not accept");

        membership.set_state(NodeState::Operational);
        let first = membership.begin_accept(&node(1)).unwrap();
        assert_eq!(first.next_node, node(0));
        assert_eq!(membership.state(), NodeState::AcceptingJoin);
        assert!(membership.begin_accept(&node(2)).is_err());

        assert!(!membership.finish_accept(&node(2)));
        assert!(membership.finish_accept(&node(1)));

        let second = membership.begin_accept(&node(2)).unwrap();
        assert_eq!(second.next_node, node(1));
        assert_eq!(second.context, vec![node(0), node(1), node(2)]);
        assert_eq!(membership.next_node(), Some(node(2)));
    }

    #[test]
    fn test_abandoned_accept_expires() {
        let membership = Membership::new(node(0));
        membership.set_state(NodeState::Operational);
        membership.begin_accept(&node(1)).unwrap();

        assert_eq!(membership.expire_accept(Duration::from_secs(60)), None);
        assert_eq!(membership.expire_accept(Duration::ZERO), Some(node(1)));
        assert_eq!(membership.state(), NodeState::Operational);
    }
}
