use std::time::Duration;

use crate::domain::coordination::node_descriptor::NodeDescriptor;
use crate::domain::metrics::MetricsConfig;
use crate::domain::topology::config::TopologyConfig;

/// Settings of one node daemon.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NodeConfig {
    pub descriptor: NodeDescriptor,
    /// Nodes tried, in order, when joining a cluster.
    pub seeds: Vec<NodeDescriptor>,
    pub join_timeout: Duration,
    pub operation_timeout: Duration,
    /// How often timed-out operations and stalled joins are expired.
    pub housekeeping_period: Duration,
    pub topology_defaults: TopologyConfig,
    pub metrics: MetricsConfig,
}

impl NodeConfig {
    pub fn new(descriptor: NodeDescriptor) -> Self {
        Self {
            descriptor,
            seeds: Vec::new(),
            join_timeout: Duration::from_secs(5),
            operation_timeout: Duration::from_secs(30),
            housekeeping_period: Duration::from_millis(500),
            topology_defaults: TopologyConfig::default(),
            metrics: MetricsConfig::default(),
        }
    }

    pub fn with_seeds(mut self, seeds: impl IntoIterator<Item = NodeDescriptor>) -> Self {
        self.seeds = seeds.into_iter().collect();
        self
    }
}
