use thiserror::Error;

use crate::domain::network::transport::TransportError;
use crate::domain::recycle::RecycleError;
use crate::domain::utils::id::{ComponentId, StreamId, TopologyId};

#[derive(Debug, Error)]
pub enum Error {
    #[error("File not found or could not be read: {0}")]
    IoError(#[from] std::io::Error),

    #[error("Failed to parse node configuration JSON: {0}")]
    DeserializationError(#[from] serde_json::Error),

    #[error("Invalid configuration: {0}")]
    ConfigError(String),

    #[error(transparent)]
    ConversionError(#[from] ConversionError),

    #[error("Component {component} cannot be duplicated for task instances: {reason}")]
    NotDuplicable { component: ComponentId, reason: String },

    #[error("Unknown component {0}")]
    UnknownComponent(ComponentId),

    #[error("Component {component} subscribes to undeclared stream {stream} of {from}")]
    UnknownStream { component: ComponentId, from: ComponentId, stream: StreamId },

    #[error("Topology {0} already exists on this node")]
    TopologyExists(TopologyId),

    #[error("Topology {0} is not known to this node")]
    TopologyNotFound(TopologyId),

    #[error("No topology named '{0}' in the catalog")]
    UnknownCatalogEntry(String),

    #[error("Topology {topology} cannot {action} while {state}")]
    InvalidState { topology: TopologyId, action: &'static str, state: String },

    #[error(transparent)]
    TransportError(#[from] TransportError),

    #[error(transparent)]
    RecycleError(#[from] RecycleError),

    #[error("Failed to spawn thread '{name}': {source}")]
    ThreadSpawnError { name: String, source: std::io::Error },
}

/// Raised while turning configuration DTOs into domain types.
#[derive(Debug, Error)]
pub enum ConversionError {
    #[error("Field '{field}' is invalid: {reason}")]
    InvalidField { field: &'static str, reason: String },

    #[error("Host entry '{0}' is not of the form host:servicePort:dataPort")]
    InvalidHost(String),
}

pub type Result<T> = std::result::Result<T, Error>;
