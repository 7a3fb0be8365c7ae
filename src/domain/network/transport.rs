use std::fmt;
use thiserror::Error;

use crate::domain::coordination::node_descriptor::NodeDescriptor;
use crate::domain::network::messages::NodeMessage;

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum TransportError {
    #[error("Node {0} is unreachable")]
    Unreachable(NodeDescriptor),

    #[error("Sending to {node} failed: {reason}")]
    SendFailed { node: NodeDescriptor, reason: String },

    #[error("Transport is closed")]
    Closed,

    #[error("Transport setup failed: {0}")]
    Setup(String),
}

/// Point-to-point, per-peer FIFO delivery of [`NodeMessage`]s.
pub trait Transport: Send + Sync + fmt::Debug {
    fn descriptor(&self) -> &NodeDescriptor;

    fn send(&self, to: &NodeDescriptor, message: NodeMessage) -> Result<(), TransportError>;

    /// Blocks until a message arrives. Returns `Err(Closed)` once
    /// [`close`](Transport::close) was called.
    fn receive(&self) -> Result<NodeMessage, TransportError>;

    fn close(&self);
}
