use serde::{Deserialize, Serialize};
use std::fmt;
use std::net::{SocketAddr, ToSocketAddrs};
use std::str::FromStr;

use crate::error::ConversionError;

/// Address of a node daemon. Two descriptors are the same node iff all three
/// parts match.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct NodeDescriptor {
    pub host: String,
    pub service_port: u16,
    pub data_port: u16,
}

impl NodeDescriptor {
    pub fn new(host: impl Into<String>, service_port: u16, data_port: u16) -> Self {
        Self { host: host.into(), service_port, data_port }
    }

    pub fn data_address(&self) -> std::io::Result<SocketAddr> {
        (self.host.as_str(), self.data_port)
            .to_socket_addrs()?
            .next()
            .ok_or_else(|| std::io::Error::new(std::io::ErrorKind::NotFound, format!("{} does not resolve", self.host)))
    }
}

impl fmt::Display for NodeDescriptor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}:{}", self.host, self.service_port, self.data_port)
    }
}

impl FromStr for NodeDescriptor {
    type Err = ConversionError;

    /// Parses `host:servicePort:dataPort`.
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let mut parts = s.rsplitn(3, ':');
        let data = parts.next().and_then(|p| p.parse::<u16>().ok());
        let service = parts.next().and_then(|p| p.parse::<u16>().ok());
        let host = parts.next().filter(|h| !h.is_empty());

        match (host, service, data) {
            (Some(host), Some(service), Some(data)) => Ok(NodeDescriptor::new(host, service, data)),
            _ => Err(ConversionError::InvalidHost(s.to_string())),
        }
    }
}
