pub mod catalog;
pub mod component;
pub mod config;
pub mod context;
pub mod declarer;
pub mod grouping;
pub mod placement;
pub mod topology;

pub use catalog::TopologyCatalog;
pub use component::{Bolt, CloneError, Spout};
pub use config::{ComponentConfig, TopologyConfig, TopologyConfigOverrides};
pub use context::TopologyContext;
pub use declarer::OutputFieldsDeclarer;
pub use grouping::{AllGrouping, FieldsGrouping, Grouping, ShuffleGrouping};
pub use placement::Placement;
pub use topology::{ComponentKind, Topology, TopologyBuilder};
