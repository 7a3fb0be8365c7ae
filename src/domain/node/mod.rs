//! The node daemon and its client-facing service surface.

pub mod config;
#[allow(clippy::module_inception)]
pub mod node;
pub mod service;
pub mod status;

pub use config::NodeConfig;
pub use node::Node;
pub use service::{ServiceRequest, ServiceResponse};
pub use status::{NodeContext, NodeStatus, TopologyListing};
