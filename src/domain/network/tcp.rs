use futures::{SinkExt, StreamExt};
use std::collections::HashMap;
use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, mpsc};
use std::time::Duration;
use tokio::net::{TcpListener, TcpStream};
use tokio::runtime::Runtime;
use tokio_util::codec::{FramedRead, FramedWrite};

use crate::domain::coordination::node_descriptor::NodeDescriptor;
use crate::domain::network::codec::NodeCodec;
use crate::domain::network::messages::NodeMessage;
use crate::domain::network::transport::{Transport, TransportError};
use crate::domain::utils::sync::lock;

const CLOSE_POLL: Duration = Duration::from_millis(100);

type Connection = FramedWrite<tokio::net::tcp::OwnedWriteHalf, NodeCodec>;

/// TCP transport: one listener on the node's data port, one cached outbound
/// connection per peer.
pub struct TcpTransport {
    descriptor: NodeDescriptor,
    runtime: Runtime,
    connections: Mutex<HashMap<NodeDescriptor, Connection>>,
    inbox: Mutex<mpsc::Receiver<NodeMessage>>,
    closed: Arc<AtomicBool>,
}

impl fmt::Debug for TcpTransport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TcpTransport").field("descriptor", &self.descriptor).field("closed", &self.closed.load(Ordering::Relaxed)).finish()
    }
}

impl TcpTransport {
    /// Binds the data port of `descriptor` and starts accepting peers.
    pub fn bind(descriptor: NodeDescriptor) -> Result<Self, TransportError> {
        let runtime = tokio::runtime::Builder::new_multi_thread()
            .worker_threads(2)
            .thread_name("tcp-transport")
            .enable_all()
            .build()
            .map_err(|e| TransportError::Setup(e.to_string()))?;

        let listener = runtime
            .block_on(TcpListener::bind(("0.0.0.0", descriptor.data_port)))
            .map_err(|e| TransportError::Setup(format!("binding data port {}: {}", descriptor.data_port, e)))?;

        let (tx, rx) = mpsc::channel();
        let closed = Arc::new(AtomicBool::new(false));
        runtime.spawn(accept_loop(listener, tx, closed.clone()));
        log::info!("TCP transport listening on data port {}", descriptor.data_port);

        Ok(Self { descriptor, runtime, connections: Mutex::new(HashMap::new()), inbox: Mutex::new(rx), closed })
    }
}

async fn accept_loop(listener: TcpListener, inbox: mpsc::Sender<NodeMessage>, closed: Arc<AtomicBool>) {
    while !closed.load(Ordering::Acquire) {
        let (stream, peer) = match listener.accept().await {
            Ok(accepted) => accepted,
            Err(e) => {
                log::warn!("Accepting connection failed: {}", e);
                continue;
            }
        };
        log::debug!("Accepted data connection from {}", peer);
        tokio::spawn(read_loop(stream, inbox.clone()));
    }
}

async fn read_loop(stream: TcpStream, inbox: mpsc::Sender<NodeMessage>) {
    let peer = stream.peer_addr().map(|a| a.to_string()).unwrap_or_default();
    let mut frames = FramedRead::new(stream, NodeCodec::new());

    while let Some(frame) = frames.next().await {
        match frame {
            Ok(message) => {
                if inbox.send(message).is_err() {
                    break;
                }
            }
            Err(e) => {
                log::warn!("Dropping connection from {}: {}", peer, e);
                break;
            }
        }
    }
}

impl Transport for TcpTransport {
    fn descriptor(&self) -> &NodeDescriptor {
        &self.descriptor
    }

    fn send(&self, to: &NodeDescriptor, message: NodeMessage) -> Result<(), TransportError> {
        if self.closed.load(Ordering::Acquire) {
            return Err(TransportError::Closed);
        }

        let mut connections = lock(&self.connections);
        let result = self.runtime.block_on(async {
            if !connections.contains_key(to) {
                let address = to.data_address().map_err(|_| TransportError::Unreachable(to.clone()))?;
                let stream = TcpStream::connect(address).await.map_err(|_| TransportError::Unreachable(to.clone()))?;
                let (_, write_half) = stream.into_split();
                connections.insert(to.clone(), FramedWrite::new(write_half, NodeCodec::new()));
            }

            match connections.get_mut(to) {
                Some(connection) => connection.send(message).await.map_err(|e| TransportError::SendFailed { node: to.clone(), reason: e.to_string() }),
                None => Err(TransportError::Unreachable(to.clone())),
            }
        });

        if result.is_err() {
            // Reconnect on the next send.
            connections.remove(to);
        }
        result
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
        lock(&self.connections).clear();
    }
}
