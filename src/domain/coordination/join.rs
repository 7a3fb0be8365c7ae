use std::sync::mpsc::{self, RecvTimeoutError};
use std::time::{Duration, Instant};

use crate::domain::coordination::membership::{Membership, NodeState};
use crate::domain::coordination::node_descriptor::NodeDescriptor;
use crate::domain::network::messages::{NodeBody, NodeMessage};
use crate::domain::network::transport::Transport;

/// An answer to a join request, forwarded by the node's message loop.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum JoinReply {
    Accepted { from: NodeDescriptor, next_node: NodeDescriptor, context: Vec<NodeDescriptor> },
    Rejected { from: NodeDescriptor, reason: String },
}

impl JoinReply {
    fn from(&self) -> &NodeDescriptor {
        match self {
            JoinReply::Accepted { from, .. } | JoinReply::Rejected { from, .. } => from,
        }
    }
}

/// Walks `seeds` until one accepts this node. Returns the acceptor, or
/// `None` when every seed failed and the node stands alone.
///
/// The node is OPERATIONAL when this returns, either way.
pub fn join_cluster(membership: &Membership, transport: &dyn Transport, seeds: &[NodeDescriptor], replies: &mpsc::Receiver<JoinReply>, timeout: Duration) -> Option<NodeDescriptor> {
    let me = membership.me().clone();

    for seed in seeds.iter().filter(|seed| **seed != me) {
        while let Ok(stale) = replies.try_recv() {
            log::debug!("Discarding stale join reply from {}", stale.from());
        }

        membership.set_state(NodeState::JoinRequested);
        log::info!("Node {} requesting to join via {}", me, seed);
        if let Err(e) = transport.send(seed, NodeMessage::new(me.clone(), NodeBody::JoinRequest)) {
            log::warn!("Seed {} unreachable: {}", seed, e);
            continue;
        }

        match await_reply(replies, seed, timeout) {
            Some(JoinReply::Accepted { next_node, context, .. }) => {
                membership.merge(context);
                membership.set_next_node(next_node);

                if let Err(e) = transport.send(seed, NodeMessage::new(me.clone(), NodeBody::JoinComplete)) {
                    log::warn!("Could not confirm join to {}: {}", seed, e);
                }
                let context = membership.members();
                for peer in membership.peers().iter().filter(|peer| *peer != seed) {
                    if let Err(e) = transport.send(peer, NodeMessage::new(me.clone(), NodeBody::ContextUpdate { context: context.clone() })) {
                        log::warn!("Could not announce join to {}: {}", peer, e);
                    }
                }

                membership.set_state(NodeState::Operational);
                log::info!("Node {} joined via {}; {} members known", me, seed, context.len());
                return Some(seed.clone());
            }
            Some(JoinReply::Rejected { reason, .. }) => log::warn!("Seed {} rejected join: {}", seed, reason),
            None => log::warn!("Seed {} did not answer within {:?}", seed, timeout),
        }
    }

    membership.set_state(NodeState::Operational);
    log::info!("Node {} found no seed to join; running as a single-node cluster", me);
    None
}

fn await_reply(replies: &mpsc::Receiver<JoinReply>, seed: &NodeDescriptor, timeout: Duration) -> Option<JoinReply> {
    let deadline = Instant::now() + timeout;
    loop {
        let remaining = deadline.checked_duration_since(Instant::now())?;
        match replies.recv_timeout(remaining) {
            Ok(reply) if reply.from() == seed => return Some(reply),
            Ok(reply) => log::debug!("Ignoring join reply from {} while waiting for {}", reply.from(), seed),
            Err(RecvTimeoutError::Timeout) | Err(RecvTimeoutError::Disconnected) => return None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::network::memory::LocalNetwork;

    fn node(i: u16) -> NodeDescriptor {
        NodeDescriptor::new("localhost", 7000 + i, 8000 + i)
    }

    #[test]
    fn test_no_reachable_seed_leaves_node_alone() {
        let network = LocalNetwork::new();
        let transport = network.attach(node(0));
        let membership = Membership::new(node(0));
        let (_tx, rx) = mpsc::channel();

        let joined = join_cluster(&membership, &transport, &[node(0), node(1)], &rx, Duration::from_millis(20));
        assert_eq!(joined, None);
        assert_eq!(membership.state(), NodeState::Operational);
        assert_eq!(membership.members(), vec![node(0)]);
    }

    #[test]
    fn test_accepting_seed_merges_context() {
        let network = LocalNetwork::new();
        let transport = network.attach(node(0));
        let seed = network.attach(node(1));
        let other = network.attach(node(2));
        let membership = Membership::new(node(0));
        let (tx, rx) = mpsc::channel();

        tx.send(JoinReply::Accepted { from: node(1), next_node: node(2), context: vec![node(1), node(2), node(0)] }).unwrap();
        // Pre-queued replies count as stale, so answer after the request lands.
        let responder = std::thread::spawn(move || {
            let request = seed.receive().unwrap();
            assert!(matches!(request.body, NodeBody::JoinRequest));
            tx.send(JoinReply::Accepted { from: node(1), next_node: node(2), context: vec![node(1), node(2), node(0)] }).unwrap();
            seed.receive().unwrap()
        });

        assert_eq!(join_cluster(&membership, &transport, &[node(1)], &rx, Duration::from_secs(5)), Some(node(1)));
        assert!(matches!(responder.join().unwrap().body, NodeBody::JoinComplete));
        assert!(matches!(other.receive().unwrap().body, NodeBody::ContextUpdate { .. }));
        assert_eq!(membership.members(), vec![node(0), node(1), node(2)]);
        assert_eq!(membership.next_node(), Some(node(2)));
    }
}
