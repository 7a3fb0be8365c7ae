//! A small topology the daemon can run out of the box: a spout counting
//! upwards and a bolt that tallies what it sees and logs on every tick.

use crate::domain::cluster::{OutputCollector, SpoutOutputCollector};
use crate::domain::topology::{Bolt, CloneError, ComponentConfig, OutputFieldsDeclarer, Spout, Topology, TopologyBuilder, TopologyCatalog, TopologyConfig, TopologyContext};
use crate::domain::tuple::{Fields, Tuple};
use crate::error::Result;
use crate::values;

pub const DEMO_TOPOLOGY: &str = "counting-demo";

/// Emits `0, 1, 2, ...` together with the parity of each number.
#[derive(Default)]
pub struct CountingSpout {
    limit: Option<i64>,
    next: i64,
    collector: Option<SpoutOutputCollector>,
}

impl CountingSpout {
    pub fn new() -> Self {
        Self::default()
    }

    /// Stops emitting after `limit` numbers.
    pub fn with_limit(limit: i64) -> Self {
        Self { limit: Some(limit), ..Self::default() }
    }
}

impl Spout for CountingSpout {
    fn declare_output_fields(&self, declarer: &mut OutputFieldsDeclarer) {
        declarer.declare(Fields::new(["n", "even"]));
    }

    fn open(&mut self, _config: &TopologyConfig, _context: &TopologyContext, collector: SpoutOutputCollector) -> anyhow::Result<()> {
        self.collector = Some(collector);
        Ok(())
    }

    fn next_tuple(&mut self) -> anyhow::Result<()> {
        if self.limit.is_some_and(|limit| self.next >= limit) {
            return Ok(());
        }
        if let Some(collector) = &self.collector {
            collector.emit(values![self.next, self.next % 2 == 0]);
            self.next += 1;
        }
        Ok(())
    }

    fn try_clone_box(&self) -> std::result::Result<Box<dyn Spout>, CloneError> {
        Ok(Box::new(CountingSpout { limit: self.limit, next: 0, collector: None }))
    }
}

/// Sums the numbers it receives and reports the running totals on ticks.
pub struct LoggingBolt {
    tick_interval_secs: u64,
    count: u64,
    sum: i64,
    label: String,
}

impl LoggingBolt {
    pub fn new(tick_interval_secs: u64) -> Self {
        Self { tick_interval_secs, count: 0, sum: 0, label: String::new() }
    }
}

impl Bolt for LoggingBolt {
    fn declare_output_fields(&self, _declarer: &mut OutputFieldsDeclarer) {}

    fn prepare(&mut self, _config: &TopologyConfig, context: &TopologyContext, _collector: OutputCollector) -> anyhow::Result<()> {
        self.label = format!("{}[{}]", context.component_id(), context.this_task_index());
        Ok(())
    }

    fn execute(&mut self, tuple: &Tuple) -> anyhow::Result<()> {
        if tuple.is_tick() {
            log::info!("{} has seen {} numbers summing to {}", self.label, self.count, self.sum);
            return Ok(());
        }
        let n = tuple.get_by_field("n").and_then(|v| v.as_i64()).ok_or_else(|| anyhow::anyhow!("tuple without integer field 'n'"))?;
        self.count += 1;
        self.sum += n;
        Ok(())
    }

    fn close(&mut self) -> anyhow::Result<()> {
        log::info!("{} closing after {} numbers", self.label, self.count);
        Ok(())
    }

    fn component_config(&self) -> ComponentConfig {
        ComponentConfig::with_tick_interval(self.tick_interval_secs)
    }

    fn try_clone_box(&self) -> std::result::Result<Box<dyn Bolt>, CloneError> {
        Ok(Box::new(LoggingBolt::new(self.tick_interval_secs)))
    }
}

pub fn demo_topology() -> Result<Topology> {
    let mut builder = TopologyBuilder::new(DEMO_TOPOLOGY);
    builder.set_spout("numbers", CountingSpout::with_limit(1_000_000), 1);
    builder.set_bolt("tally", LoggingBolt::new(5), 2).fields_grouping("numbers", Fields::new(["even"]));
    builder.create_topology()
}

/// A catalog holding the demo topology.
pub fn demo_catalog() -> Result<TopologyCatalog> {
    let catalog = TopologyCatalog::new();
    catalog.register(demo_topology()?);
    Ok(catalog)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_demo_topology_is_valid() {
        let topology = demo_topology().unwrap();
        assert_eq!(topology.name(), DEMO_TOPOLOGY);
        assert_eq!(topology.expected_terminations(&"tally".into()), 1);
        assert!(demo_catalog().unwrap().get(DEMO_TOPOLOGY).is_ok());
    }
}
