pub mod codec;
pub mod dispatch;
pub mod memory;
pub mod messages;
pub mod tcp;
pub mod transport;

pub use memory::{InMemoryTransport, LocalNetwork};
pub use messages::{NodeBody, NodeMessage, TupleBatch};
pub use tcp::TcpTransport;
pub use transport::{Transport, TransportError};
