use std::collections::BTreeMap;

use crate::domain::tuple::Fields;
use crate::domain::utils::id::{ComponentId, StreamId, TopologyId};

/// What a task instance knows about its place in the topology.
#[derive(Debug, Clone)]
pub struct TopologyContext {
    topology_id: TopologyId,
    component_id: ComponentId,
    task_index: usize,
    component_tasks: Vec<usize>,
    outputs: BTreeMap<StreamId, Fields>,
}

impl TopologyContext {
    pub fn new(topology_id: TopologyId, component_id: ComponentId, task_index: usize, component_tasks: Vec<usize>, outputs: BTreeMap<StreamId, Fields>) -> Self {
        Self { topology_id, component_id, task_index, component_tasks, outputs }
    }

    pub fn topology_id(&self) -> &TopologyId {
        &self.topology_id
    }

    pub fn component_id(&self) -> &ComponentId {
        &self.component_id
    }

    pub fn this_task_index(&self) -> usize {
        self.task_index
    }

    /// Every task index of this component, local or not.
    pub fn component_tasks(&self) -> &[usize] {
        &self.component_tasks
    }

    pub fn output_fields(&self, stream: &StreamId) -> Option<&Fields> {
        self.outputs.get(stream)
    }
}
