use std::sync::Arc;

use crate::api::config_dto::NodeConfigDto;
use crate::domain::network::TcpTransport;
use crate::domain::node::{Node, NodeConfig};
use crate::domain::topology::TopologyCatalog;
use crate::error::Result;
use crate::loader::parser::parse_json_file;

pub mod api;
pub mod demo;
pub mod domain;
pub mod error;
pub mod loader;
pub mod logger;

pub fn load_node_config(file_path: &str) -> Result<NodeConfig> {
    let dto: NodeConfigDto = parse_json_file::<NodeConfigDto>(file_path)?;
    log::info!("Node configuration '{}' parsed successfully.", file_path);

    let config = NodeConfig::try_from(dto)?;
    Ok(config)
}

/// Starts a node on TCP using the configuration file at `file_path`.
pub fn start_node(file_path: &str, catalog: Arc<TopologyCatalog>) -> Result<Node> {
    let config = load_node_config(file_path)?;
    let transport = TcpTransport::bind(config.descriptor.clone())?;
    log::info!("Starting node {}.", config.descriptor);

    Node::start(config, Arc::new(transport), catalog)
}
