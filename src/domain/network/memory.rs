use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, RwLock, mpsc};
use std::time::Duration;

use crate::domain::coordination::node_descriptor::NodeDescriptor;
use crate::domain::network::messages::NodeMessage;
use crate::domain::network::transport::{Transport, TransportError};
use crate::domain::utils::sync::{lock, read, write};

const CLOSE_POLL: Duration = Duration::from_millis(50);

/// In-process network: a directory of per-node mailboxes.
///
/// Cloning yields another handle onto the same directory.
#[derive(Clone, Debug, Default)]
pub struct LocalNetwork {
    directory: Arc<RwLock<HashMap<NodeDescriptor, mpsc::Sender<NodeMessage>>>>,
}

impl LocalNetwork {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers a mailbox for `descriptor` and returns the transport reading it.
    pub fn attach(&self, descriptor: NodeDescriptor) -> InMemoryTransport {
        let (tx, rx) = mpsc::channel::<NodeMessage>();
        write(&self.directory).insert(descriptor.clone(), tx);
        log::debug!("Node {} attached to local network", descriptor);

        InMemoryTransport { descriptor, network: self.clone(), inbox: Mutex::new(rx), closed: AtomicBool::new(false) }
    }

    /// Removes a node; further sends to it fail with `Unreachable`.
    pub fn detach(&self, descriptor: &NodeDescriptor) {
        write(&self.directory).remove(descriptor);
    }

    pub fn is_attached(&self, descriptor: &NodeDescriptor) -> bool {
        read(&self.directory).contains_key(descriptor)
    }
}

#[derive(Debug)]
pub struct InMemoryTransport {
    descriptor: NodeDescriptor,
    network: LocalNetwork,
    inbox: Mutex<mpsc::Receiver<NodeMessage>>,
    closed: AtomicBool,
}

impl Transport for InMemoryTransport {
    fn descriptor(&self) -> &NodeDescriptor {
        &self.descriptor
    }

    fn send(&self, to: &NodeDescriptor, message: NodeMessage) -> Result<(), TransportError> {
        if self.closed.load(Ordering::Acquire) {
            return Err(TransportError::Closed);
        }
        let sender = read(&self.network.directory).get(to).cloned().ok_or_else(|| TransportError::Unreachable(to.clone()))?;
        sender.send(message).map_err(|_| TransportError::Unreachable(to.clone()))
    }

    fn receive(&self) -> Result<NodeMessage, TransportError> {
        let inbox = lock(&self.inbox);
        loop {
            if self.closed.load(Ordering::Acquire) {
                return Err(TransportError::Closed);
            }
            match inbox.recv_timeout(CLOSE_POLL) {
                Ok(message) => return Ok(message),
                Err(mpsc::RecvTimeoutError::Timeout) => continue,
                Err(mpsc::RecvTimeoutError::Disconnected) => return Err(TransportError::Closed),
            }
        }
    }

    fn close(&self) {
        self.closed.store(true, Ordering::Release);
        self.network.detach(&self.descriptor);
    }
}
