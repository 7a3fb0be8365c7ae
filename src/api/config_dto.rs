use serde::{Deserialize, Serialize};
use std::time::Duration;

use crate::domain::coordination::node_descriptor::NodeDescriptor;
use crate::domain::metrics::MetricsConfig;
use crate::domain::node::config::NodeConfig;
use crate::domain::topology::config::TopologyConfig;
use crate::error::ConversionError;

fn default_join_timeout_ms() -> u64 {
    5000
}

fn default_operation_timeout_ms() -> u64 {
    30_000
}

fn default_housekeeping_period_ms() -> u64 {
    500
}

/// On-disk form of a node's configuration.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct NodeConfigDto {
    pub host: String,
    pub service_port: u16,
    pub data_port: u16,
    /// Seed nodes as `host:servicePort:dataPort`.
    #[serde(default)]
    pub seeds: Vec<String>,
    #[serde(default = "default_join_timeout_ms")]
    pub join_timeout_ms: u64,
    #[serde(default = "default_operation_timeout_ms")]
    pub operation_timeout_ms: u64,
    #[serde(default = "default_housekeeping_period_ms")]
    pub housekeeping_period_ms: u64,
    #[serde(default)]
    pub topology: TopologyConfig,
    #[serde(default)]
    pub metrics: MetricsConfig,
}

impl TryFrom<NodeConfigDto> for NodeConfig {
    type Error = ConversionError;

    fn try_from(dto: NodeConfigDto) -> Result<Self, Self::Error> {
        if dto.host.trim().is_empty() {
            return Err(ConversionError::InvalidField { field: "host", reason: "must not be empty".to_string() });
        }
        if dto.service_port == 0 || dto.data_port == 0 {
            return Err(ConversionError::InvalidField { field: "servicePort/dataPort", reason: "ports must be non-zero".to_string() });
        }
        for (field, value) in [("joinTimeoutMs", dto.join_timeout_ms), ("operationTimeoutMs", dto.operation_timeout_ms), ("housekeepingPeriodMs", dto.housekeeping_period_ms)] {
            if value == 0 {
                return Err(ConversionError::InvalidField { field, reason: "must be positive".to_string() });
            }
        }

        let seeds = dto.seeds.iter().map(|s| s.parse::<NodeDescriptor>()).collect::<Result<Vec<_>, _>>()?;

        Ok(NodeConfig {
            descriptor: NodeDescriptor::new(dto.host, dto.service_port, dto.data_port),
            seeds,
            join_timeout: Duration::from_millis(dto.join_timeout_ms),
            operation_timeout: Duration::from_millis(dto.operation_timeout_ms),
            housekeeping_period: Duration::from_millis(dto.housekeeping_period_ms),
            topology_defaults: dto.topology,
            metrics: dto.metrics,
        })
    }
}
