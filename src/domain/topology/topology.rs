use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};
use std::fmt;

use crate::domain::topology::component::{Bolt, Spout};
use crate::domain::topology::config::ComponentConfig;
use crate::domain::topology::declarer::OutputFieldsDeclarer;
use crate::domain::topology::grouping::{AllGrouping, FieldsGrouping, Grouping, ShuffleGrouping};
use crate::domain::topology::placement::Placement;
use crate::domain::tuple::Fields;
use crate::domain::utils::constants::DEFAULT_STREAM_ID;
use crate::domain::utils::id::{ComponentId, StreamId};
use crate::error::{Error, Result};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ComponentKind {
    Spout,
    Bolt,
}

pub struct SpoutDeclaration {
    pub prototype: Box<dyn Spout>,
    pub num_tasks: usize,
    pub parallelism_hint: usize,
    pub outputs: BTreeMap<StreamId, Fields>,
    pub config: ComponentConfig,
}

pub struct BoltDeclaration {
    pub prototype: Box<dyn Bolt>,
    pub num_tasks: usize,
    pub parallelism_hint: usize,
    pub outputs: BTreeMap<StreamId, Fields>,
    pub config: ComponentConfig,
}

/// One subscription: tuples on `stream` of `from` flow to `to` via `grouping`.
#[derive(Debug)]
pub struct Edge {
    pub from: ComponentId,
    pub to: ComponentId,
    pub stream: StreamId,
    pub grouping: Box<dyn Grouping>,
}

/// Immutable data-flow graph. Shared as `Arc<Topology>` once built.
pub struct Topology {
    name: String,
    spouts: BTreeMap<ComponentId, SpoutDeclaration>,
    bolts: BTreeMap<ComponentId, BoltDeclaration>,
    edges: Vec<Edge>,
    placement: Option<Placement>,
}

impl fmt::Debug for Topology {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Topology")
            .field("name", &self.name)
            .field("spouts", &self.spouts.keys().collect::<Vec<_>>())
            .field("bolts", &self.bolts.keys().collect::<Vec<_>>())
            .field("edges", &self.edges.len())
            .finish()
    }
}

impl Topology {
    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn spouts(&self) -> &BTreeMap<ComponentId, SpoutDeclaration> {
        &self.spouts
    }

    pub fn bolts(&self) -> &BTreeMap<ComponentId, BoltDeclaration> {
        &self.bolts
    }

    pub fn placement(&self) -> Option<&Placement> {
        self.placement.as_ref()
    }

    pub fn kind_of(&self, component: &ComponentId) -> Option<ComponentKind> {
        if self.spouts.contains_key(component) {
            Some(ComponentKind::Spout)
        } else if self.bolts.contains_key(component) {
            Some(ComponentKind::Bolt)
        } else {
            None
        }
    }

    pub fn num_tasks(&self, component: &ComponentId) -> Option<usize> {
        self.spouts.get(component).map(|s| s.num_tasks).or_else(|| self.bolts.get(component).map(|b| b.num_tasks))
    }

    pub fn outputs(&self, component: &ComponentId) -> Option<&BTreeMap<StreamId, Fields>> {
        self.spouts.get(component).map(|s| &s.outputs).or_else(|| self.bolts.get(component).map(|b| &b.outputs))
    }

    /// Subscriptions fed by `from`.
    pub fn outgoing<'a>(&'a self, from: &'a ComponentId) -> impl Iterator<Item = &'a Edge> + 'a {
        self.edges.iter().filter(move |e| &e.from == from)
    }

    pub fn incoming<'a>(&'a self, to: &'a ComponentId) -> impl Iterator<Item = &'a Edge> + 'a {
        self.edges.iter().filter(move |e| &e.to == to)
    }

    /// Number of TERMINATE markers a task of `bolt` waits for before it
    /// closes: one per upstream task per subscription.
    pub fn expected_terminations(&self, bolt: &ComponentId) -> usize {
        self.incoming(bolt).map(|e| self.num_tasks(&e.from).unwrap_or(0)).sum()
    }
}

/// Assembles a [`Topology`].
pub struct TopologyBuilder {
    name: String,
    spouts: BTreeMap<ComponentId, SpoutDeclaration>,
    bolts: BTreeMap<ComponentId, BoltDeclaration>,
    edges: Vec<Edge>,
    placement: Option<Placement>,
}

impl TopologyBuilder {
    pub fn new(name: impl Into<String>) -> Self {
        Self { name: name.into(), spouts: BTreeMap::new(), bolts: BTreeMap::new(), edges: Vec::new(), placement: None }
    }

    /// Declares a spout. The task count defaults to the parallelism hint.
    pub fn set_spout(&mut self, id: impl Into<ComponentId>, spout: impl Spout + 'static, parallelism_hint: usize) -> SpoutDeclarer<'_> {
        let id = id.into();
        let mut declarer = OutputFieldsDeclarer::new();
        spout.declare_output_fields(&mut declarer);
        let config = spout.component_config();
        let hint = parallelism_hint.max(1);
        self.spouts.insert(id.clone(), SpoutDeclaration { prototype: Box::new(spout), num_tasks: hint, parallelism_hint: hint, outputs: declarer.into_streams(), config });
        SpoutDeclarer { builder: self, id }
    }

    pub fn set_bolt(&mut self, id: impl Into<ComponentId>, bolt: impl Bolt + 'static, parallelism_hint: usize) -> BoltDeclarer<'_> {
        let id = id.into();
        let mut declarer = OutputFieldsDeclarer::new();
        bolt.declare_output_fields(&mut declarer);
        let config = bolt.component_config();
        let hint = parallelism_hint.max(1);
        self.bolts.insert(id.clone(), BoltDeclaration { prototype: Box::new(bolt), num_tasks: hint, parallelism_hint: hint, outputs: declarer.into_streams(), config });
        BoltDeclarer { builder: self, id }
    }

    pub fn with_placement(&mut self, placement: Placement) -> &mut Self {
        self.placement = Some(placement);
        self
    }

    /// Validates subscriptions and placement and freezes the graph.
    pub fn create_topology(self) -> Result<Topology> {
        for edge in &self.edges {
            let outputs = self
                .spouts
                .get(&edge.from)
                .map(|s| &s.outputs)
                .or_else(|| self.bolts.get(&edge.from).map(|b| &b.outputs))
                .ok_or_else(|| Error::UnknownComponent(edge.from.clone()))?;

            if !outputs.contains_key(&edge.stream) {
                return Err(Error::UnknownStream { component: edge.to.clone(), from: edge.from.clone(), stream: edge.stream.clone() });
            }
        }

        let topology = Topology { name: self.name, spouts: self.spouts, bolts: self.bolts, edges: self.edges, placement: self.placement };

        if let Some(placement) = &topology.placement {
            validate_placement(&topology, placement)?;
        }

        Ok(topology)
    }
}

fn validate_placement(topology: &Topology, placement: &Placement) -> Result<()> {
    let mut placed: BTreeMap<&ComponentId, BTreeSet<usize>> = BTreeMap::new();

    for (node, component, tasks) in placement.assignments() {
        let num_tasks = topology.num_tasks(component).ok_or_else(|| Error::UnknownComponent(component.clone()))?;
        for &task in tasks {
            if task >= num_tasks {
                return Err(Error::ConfigError(format!("placement puts task {} of {} on {}, but it only has {} tasks", task, component, node, num_tasks)));
            }
            if !placed.entry(component).or_default().insert(task) {
                return Err(Error::ConfigError(format!("task {} of {} is placed on more than one node", task, component)));
            }
        }
    }

    for (component, num_tasks) in topology.spouts.iter().map(|(id, s)| (id, s.num_tasks)).chain(topology.bolts.iter().map(|(id, b)| (id, b.num_tasks))) {
        let count = placed.get(component).map_or(0, BTreeSet::len);
        if count != num_tasks {
            return Err(Error::ConfigError(format!("placement covers {} of {} tasks of {}", count, num_tasks, component)));
        }
    }
    Ok(())
}

pub struct SpoutDeclarer<'a> {
    builder: &'a mut TopologyBuilder,
    id: ComponentId,
}

impl SpoutDeclarer<'_> {
    pub fn set_num_tasks(self, num_tasks: usize) -> Self {
        if let Some(spout) = self.builder.spouts.get_mut(&self.id) {
            spout.num_tasks = num_tasks.max(1);
        }
        self
    }
}

pub struct BoltDeclarer<'a> {
    builder: &'a mut TopologyBuilder,
    id: ComponentId,
}

impl BoltDeclarer<'_> {
    pub fn set_num_tasks(self, num_tasks: usize) -> Self {
        if let Some(bolt) = self.builder.bolts.get_mut(&self.id) {
            bolt.num_tasks = num_tasks.max(1);
        }
        self
    }

    pub fn shuffle_grouping(self, from: impl Into<ComponentId>) -> Self {
        self.custom_grouping(from, DEFAULT_STREAM_ID.clone(), Box::new(ShuffleGrouping::new()))
    }

    pub fn shuffle_grouping_stream(self, from: impl Into<ComponentId>, stream: impl Into<StreamId>) -> Self {
        self.custom_grouping(from, stream, Box::new(ShuffleGrouping::new()))
    }

    pub fn fields_grouping(self, from: impl Into<ComponentId>, keys: Fields) -> Self {
        self.custom_grouping(from, DEFAULT_STREAM_ID.clone(), Box::new(FieldsGrouping::new(keys)))
    }

    pub fn all_grouping(self, from: impl Into<ComponentId>) -> Self {
        self.custom_grouping(from, DEFAULT_STREAM_ID.clone(), Box::new(AllGrouping::new()))
    }

    pub fn custom_grouping(self, from: impl Into<ComponentId>, stream: impl Into<StreamId>, grouping: Box<dyn Grouping>) -> Self {
        self.builder.edges.push(Edge { from: from.into(), to: self.id.clone(), stream: stream.into(), grouping });
        self
    }
}
