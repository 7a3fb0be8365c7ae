use thiserror::Error;

use crate::domain::cluster::collector::{OutputCollector, SpoutOutputCollector};
use crate::domain::topology::config::{ComponentConfig, TopologyConfig};
use crate::domain::topology::context::TopologyContext;
use crate::domain::topology::declarer::OutputFieldsDeclarer;
use crate::domain::tuple::Tuple;

/// Returned by `try_clone_box` when a prototype cannot produce a task instance.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
#[error("{0}")]
pub struct CloneError(pub String);

/// A source of tuples.
///
/// One instance is cloned from the declared prototype per task. The runtime
/// never calls two methods of the same instance concurrently.
pub trait Spout: Send + Sync {
    fn declare_output_fields(&self, declarer: &mut OutputFieldsDeclarer);

    fn open(&mut self, config: &TopologyConfig, context: &TopologyContext, collector: SpoutOutputCollector) -> anyhow::Result<()>;

    /// Emits zero or more tuples. Called repeatedly until the topology closes.
    fn next_tuple(&mut self) -> anyhow::Result<()>;

    fn close(&mut self) -> anyhow::Result<()> {
        Ok(())
    }

    fn component_config(&self) -> ComponentConfig {
        ComponentConfig::default()
    }

    fn try_clone_box(&self) -> Result<Box<dyn Spout>, CloneError>;
}

/// A processing step. Tick tuples also arrive through `execute`.
pub trait Bolt: Send + Sync {
    fn declare_output_fields(&self, declarer: &mut OutputFieldsDeclarer);

    fn prepare(&mut self, config: &TopologyConfig, context: &TopologyContext, collector: OutputCollector) -> anyhow::Result<()>;

    fn execute(&mut self, tuple: &Tuple) -> anyhow::Result<()>;

    fn close(&mut self) -> anyhow::Result<()> {
        Ok(())
    }

    fn component_config(&self) -> ComponentConfig {
        ComponentConfig::default()
    }

    fn try_clone_box(&self) -> Result<Box<dyn Bolt>, CloneError>;
}
