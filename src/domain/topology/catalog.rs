use std::collections::HashMap;
use std::sync::{Arc, RwLock};

use crate::domain::topology::topology::Topology;
use crate::domain::utils::sync::{read, write};
use crate::error::{Error, Result};

/// Topologies a daemon can run, by name.
///
/// Peers resolve a prepare request against their own catalog, so every
/// daemon in a cluster registers the same entries.
#[derive(Debug, Default)]
pub struct TopologyCatalog {
    entries: RwLock<HashMap<String, Arc<Topology>>>,
}

impl TopologyCatalog {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers `topology` under its own name, replacing any previous entry.
    pub fn register(&self, topology: Topology) -> Arc<Topology> {
        let topology = Arc::new(topology);
        write(&self.entries).insert(topology.name().to_string(), topology.clone());
        topology
    }

    pub fn get(&self, name: &str) -> Result<Arc<Topology>> {
        read(&self.entries).get(name).cloned().ok_or_else(|| Error::UnknownCatalogEntry(name.to_string()))
    }

    pub fn names(&self) -> Vec<String> {
        let mut names: Vec<_> = read(&self.entries).keys().cloned().collect();
        names.sort();
        names
    }
}
