use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};

use crate::domain::coordination::node_descriptor::NodeDescriptor;
use crate::domain::utils::id::ComponentId;

/// Which node hosts which task of which component.
///
/// A topology without a placement runs entirely on the node it is
/// submitted to.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Placement {
    nodes: BTreeMap<NodeDescriptor, BTreeMap<ComponentId, BTreeSet<usize>>>,
}

impl Placement {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn assign(&mut self, node: NodeDescriptor, component: impl Into<ComponentId>, tasks: impl IntoIterator<Item = usize>) -> &mut Self {
        self.nodes.entry(node).or_default().entry(component.into()).or_default().extend(tasks);
        self
    }

    pub fn tasks_on(&self, node: &NodeDescriptor, component: &ComponentId) -> Option<&BTreeSet<usize>> {
        self.nodes.get(node).and_then(|components| components.get(component))
    }

    pub fn node_for(&self, component: &ComponentId, task: usize) -> Option<&NodeDescriptor> {
        self.nodes.iter().find(|(_, components)| components.get(component).is_some_and(|tasks| tasks.contains(&task))).map(|(node, _)| node)
    }

    pub fn nodes(&self) -> impl Iterator<Item = &NodeDescriptor> {
        self.nodes.keys()
    }

    pub fn hosts(&self, node: &NodeDescriptor) -> bool {
        self.nodes.contains_key(node)
    }

    pub(crate) fn assignments(&self) -> impl Iterator<Item = (&NodeDescriptor, &ComponentId, &BTreeSet<usize>)> {
        self.nodes.iter().flat_map(|(node, components)| components.iter().map(move |(component, tasks)| (node, component, tasks)))
    }
}
