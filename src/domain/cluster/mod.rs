//! Per-topology scheduling on one node.
//!
//! A [`LocalCluster`] owns the task instances a node hosts for one topology,
//! a component worker pool that runs them, a dispatch pool that moves their
//! output into input queues or onto the network, and the tick threads.

pub mod collector;
pub mod gate;
pub mod local_cluster;
pub mod state;
pub mod task;
pub(crate) mod ticker;

pub use collector::{OutputCollector, SpoutOutputCollector};
pub use local_cluster::{ClusterEnvironment, LocalCluster};
pub use state::{ClusterEvent, ClusterState, ComponentError};
pub use task::{TaskAddress, TaskSnapshot};
