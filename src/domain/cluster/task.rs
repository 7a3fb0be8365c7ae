use serde::{Deserialize, Serialize};
use slotmap::{SlotMap, new_key_type};
use std::collections::{BTreeMap, HashMap, VecDeque};
use std::fmt;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::mpsc::{Receiver, SyncSender, TrySendError};
use std::sync::{Arc, Mutex};

use crate::domain::cluster::collector::{OutputCollector, SpoutOutputCollector};
use crate::domain::cluster::state::ComponentError;
use crate::domain::network::dispatch::OutputBuffer;
use crate::domain::recycle::Pooled;
use crate::domain::topology::component::{Bolt, Spout};
use crate::domain::topology::context::TopologyContext;
use crate::domain::topology::topology::ComponentKind;
use crate::domain::tuple::Tuple;
use crate::domain::utils::id::ComponentId;
use crate::domain::utils::sync::lock;

new_key_type! {
    pub struct TaskKey;
}

/// Identity of a task: `(component, task index)`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct TaskAddress {
    pub component: ComponentId,
    pub task: usize,
}

impl TaskAddress {
    pub fn new(component: ComponentId, task: usize) -> Self {
        Self { component, task }
    }
}

impl fmt::Display for TaskAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}[{}]", self.component, self.task)
    }
}

pub(crate) enum Instance {
    Spout(Box<dyn Spout>),
    Bolt(Box<dyn Bolt>),
}

/// Open/prepare arguments held back until the cluster is started.
pub(crate) enum PendingOpen {
    Spout(TopologyContext, SpoutOutputCollector),
    Bolt(TopologyContext, OutputCollector),
}

/// Everything only the worker currently running the task may touch.
pub(crate) struct TaskRuntime {
    pub(crate) instance: Instance,
    pub(crate) input: Option<Receiver<Pooled<Tuple>>>,
    pub(crate) pending_open: Option<PendingOpen>,
    pub(crate) opened: bool,
    pub(crate) terminations_seen: usize,
}

/// Bounded input queue of a bolt task, sender side.
pub(crate) struct InputQueue {
    sender: SyncSender<Pooled<Tuple>>,
    len: AtomicUsize,
}

impl InputQueue {
    pub(crate) fn new(sender: SyncSender<Pooled<Tuple>>) -> Self {
        Self { sender, len: AtomicUsize::new(0) }
    }

    /// Non-blocking offer. Hands the tuple back if the queue is full or gone.
    pub(crate) fn offer(&self, tuple: Pooled<Tuple>) -> Result<(), Pooled<Tuple>> {
        // Counted before sending so a fast consumer never takes it below zero.
        self.len.fetch_add(1, Ordering::AcqRel);
        match self.sender.try_send(tuple) {
            Ok(()) => Ok(()),
            Err(TrySendError::Full(tuple)) | Err(TrySendError::Disconnected(tuple)) => {
                self.len.fetch_sub(1, Ordering::AcqRel);
                Err(tuple)
            }
        }
    }

    pub(crate) fn taken(&self) {
        self.len.fetch_sub(1, Ordering::AcqRel);
    }

    pub(crate) fn len(&self) -> usize {
        self.len.load(Ordering::Acquire)
    }
}

#[derive(Debug, Default)]
pub struct TaskCounters {
    pub emitted: AtomicU64,
    pub executed: AtomicU64,
    pub ticks: AtomicU64,
}

/// One local task instance.
pub(crate) struct TaskCell {
    pub(crate) key: TaskKey,
    pub(crate) address: TaskAddress,
    pub(crate) kind: ComponentKind,
    pub(crate) runtime: Mutex<TaskRuntime>,
    pub(crate) input: Option<InputQueue>,
    pub(crate) ticks: Mutex<VecDeque<Pooled<Tuple>>>,
    pub(crate) output: Arc<OutputBuffer>,
    pub(crate) expected_terminations: usize,
    pub(crate) closing: AtomicBool,
    pub(crate) closed: AtomicBool,
    pub(crate) counters: Arc<TaskCounters>,
    pub(crate) errors: Mutex<Vec<ComponentError>>,
}

impl TaskCell {
    pub(crate) fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    pub(crate) fn is_closing(&self) -> bool {
        self.closing.load(Ordering::Acquire)
    }

    /// Queued input, ticks or a pending close.
    pub(crate) fn has_pending_work(&self) -> bool {
        self.is_closing() || self.input.as_ref().is_some_and(|q| q.len() > 0) || !lock(&self.ticks).is_empty()
    }

    pub(crate) fn snapshot(&self) -> TaskSnapshot {
        TaskSnapshot {
            component: self.address.component.clone(),
            task: self.address.task,
            kind: self.kind,
            emitted: self.counters.emitted.load(Ordering::Relaxed),
            executed: self.counters.executed.load(Ordering::Relaxed),
            ticks: self.counters.ticks.load(Ordering::Relaxed),
            input_queue: self.input.as_ref().map_or(0, InputQueue::len),
            output_buffer: self.output.len(),
            errors: lock(&self.errors).len(),
            closed: self.is_closed(),
        }
    }
}

/// Point-in-time view of one task, for status and metrics.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TaskSnapshot {
    pub component: ComponentId,
    pub task: usize,
    pub kind: ComponentKind,
    pub emitted: u64,
    pub executed: u64,
    pub ticks: u64,
    pub input_queue: usize,
    pub output_buffer: usize,
    pub errors: usize,
    pub closed: bool,
}

/// Arena of the local tasks of one cluster. Fixed once built.
#[derive(Default)]
pub(crate) struct TaskStore {
    slots: SlotMap<TaskKey, Arc<TaskCell>>,
    index: HashMap<TaskAddress, TaskKey>,
    by_component: BTreeMap<ComponentId, Vec<TaskKey>>,
}

impl TaskStore {
    pub(crate) fn insert_with_key(&mut self, build: impl FnOnce(TaskKey) -> TaskCell) -> TaskKey {
        let key = self.slots.insert_with_key(|key| Arc::new(build(key)));
        if let Some(cell) = self.slots.get(key) {
            self.index.insert(cell.address.clone(), key);
            self.by_component.entry(cell.address.component.clone()).or_default().push(key);
        }
        key
    }

    pub(crate) fn get(&self, key: TaskKey) -> Option<&Arc<TaskCell>> {
        self.slots.get(key)
    }

    pub(crate) fn find(&self, component: &ComponentId, task: usize) -> Option<&Arc<TaskCell>> {
        self.index.get(&TaskAddress::new(component.clone(), task)).and_then(|key| self.slots.get(*key))
    }

    pub(crate) fn of_component<'a>(&'a self, component: &ComponentId) -> impl Iterator<Item = &'a Arc<TaskCell>> + 'a {
        self.by_component.get(component).into_iter().flatten().filter_map(|key| self.slots.get(*key))
    }

    pub(crate) fn iter(&self) -> impl Iterator<Item = &Arc<TaskCell>> {
        self.slots.values()
    }

    pub(crate) fn len(&self) -> usize {
        self.slots.len()
    }
}
