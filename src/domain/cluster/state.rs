use serde::{Deserialize, Serialize};
use std::fmt;

use crate::domain::utils::id::TopologyId;

/// Lifecycle of a local cluster.
///
/// `Allocated` → `Running` ⇄ `Halted`; any non-final state → `Terminating` →
/// `Terminated`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ClusterState {
    Allocated,
    Running,
    Halted,
    Terminating,
    Terminated,
}

impl fmt::Display for ClusterState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            ClusterState::Allocated => "ALLOCATED",
            ClusterState::Running => "RUNNING",
            ClusterState::Halted => "HALTED",
            ClusterState::Terminating => "TERMINATING",
            ClusterState::Terminated => "TERMINATED",
        };
        f.write_str(name)
    }
}

/// Published by a local cluster to the node that owns it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ClusterEvent {
    ErrorThresholdReached { topology_id: TopologyId, errors: usize },
    Terminated { topology_id: TopologyId },
}

/// A failure raised by user component code.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ComponentError {
    pub hook: String,
    pub message: String,
    pub timestamp_ms: i64,
}

impl ComponentError {
    pub fn new(hook: &str, message: impl Into<String>) -> Self {
        Self { hook: hook.to_string(), message: message.into(), timestamp_ms: chrono::Utc::now().timestamp_millis() }
    }
}
