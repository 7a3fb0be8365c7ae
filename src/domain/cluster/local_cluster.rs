use std::collections::{BTreeMap, HashMap, VecDeque};
use std::panic::{self, AssertUnwindSafe};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::mpsc;
use std::sync::{Arc, Condvar, Mutex, PoisonError, TryLockError, Weak};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use crate::domain::cluster::collector::{CollectorCore, OutputCollector, RouteEdge, SpoutOutputCollector, StreamRoute};
use crate::domain::cluster::gate::HaltGate;
use crate::domain::cluster::state::{ClusterEvent, ClusterState, ComponentError};
use crate::domain::cluster::task::{InputQueue, Instance, PendingOpen, TaskAddress, TaskCell, TaskCounters, TaskKey, TaskRuntime, TaskSnapshot, TaskStore};
use crate::domain::cluster::ticker::{TickClock, TickCountdown, spawn_tick_threads};
use crate::domain::coordination::node_descriptor::NodeDescriptor;
use crate::domain::network::dispatch::{OutputBuffer, dispatch_worker};
use crate::domain::network::transport::Transport;
use crate::domain::recycle::{Pooled, RecycleStation};
use crate::domain::topology::component::{Bolt, Spout};
use crate::domain::topology::config::TopologyConfig;
use crate::domain::topology::context::TopologyContext;
use crate::domain::topology::topology::{ComponentKind, Topology};
use crate::domain::tuple::{Tuple, TupleKind};
use crate::domain::utils::constants::{SYSTEM_COMPONENT_ID, SYSTEM_TICK_STREAM_ID, TERMINATE_FIELDS, TICK_FIELDS};
use crate::domain::utils::id::{ComponentId, TopologyId};
use crate::domain::utils::sync::lock;
use crate::error::{Error, Result};
use crate::values;

/// Upper bound of input tuples a bolt consumes in one scheduling step.
const BOLT_BATCH: usize = 32;

const IDLE_SPOUT_BACKOFF: Duration = Duration::from_millis(1);

pub(crate) enum WorkItem {
    Run(TaskKey),
    Shutdown,
}

pub(crate) enum DispatchItem {
    Drain(Arc<OutputBuffer>),
    Shutdown,
}

/// Collaborators a local cluster borrows from the node hosting it.
pub struct ClusterEnvironment {
    pub station: Arc<RecycleStation>,
    pub transport: Option<Arc<dyn Transport>>,
    pub events: Option<mpsc::Sender<ClusterEvent>>,
}

impl ClusterEnvironment {
    /// A cluster with its own pools, no peers and nobody listening for events.
    pub fn standalone() -> Self {
        Self { station: Arc::new(RecycleStation::new()), transport: None, events: None }
    }
}

pub(crate) struct ClusterCore {
    pub(crate) topology_id: TopologyId,
    pub(crate) topology: Arc<Topology>,
    pub(crate) config: TopologyConfig,
    pub(crate) tasks: TaskStore,
    pub(crate) station: Arc<RecycleStation>,
    pub(crate) transport: Option<Arc<dyn Transport>>,
    pub(crate) inbound: Mutex<HashMap<TaskAddress, Arc<OutputBuffer>>>,
    pub(crate) clock: Arc<TickClock>,
    events: Option<mpsc::Sender<ClusterEvent>>,
    ready: mpsc::Sender<WorkItem>,
    dispatch: mpsc::Sender<DispatchItem>,
    state: Mutex<ClusterState>,
    state_changed: Condvar,
    should_terminate: AtomicBool,
    halt: HaltGate,
    error_count: AtomicUsize,
    threshold_signalled: AtomicBool,
    worker_count: usize,
    dispatch_count: usize,
    threads: Mutex<Vec<JoinHandle<()>>>,
    tick_stop: Mutex<Option<mpsc::Sender<()>>>,
}

/// The tasks of one topology hosted on this node, plus the threads that run
/// them.
pub struct LocalCluster {
    core: Arc<ClusterCore>,
    monitor: Mutex<Option<JoinHandle<()>>>,
}

struct Prepared {
    address: TaskAddress,
    kind: ComponentKind,
    instance: Instance,
}

impl LocalCluster {
    /// Allocates every task of `topology` placed on this node.
    ///
    /// With `start_immediately` the open/prepare hooks run before returning;
    /// otherwise they wait for [`open_all`](Self::open_all), which the node
    /// calls once all peers have prepared too.
    pub fn submit(topology_id: TopologyId, config: TopologyConfig, topology: Arc<Topology>, start_immediately: bool, env: ClusterEnvironment) -> Result<Arc<LocalCluster>> {
        let me = env.transport.as_ref().map(|t| t.descriptor().clone());
        let prepared = clone_local_tasks(&topology, me.as_ref())?;
        if prepared.is_empty() {
            log::info!("Topology {} places no tasks on this node", topology_id);
        }

        let worker_count = worker_count(&topology, &prepared, &config);
        let dispatch_count = config.dispatch_threads.max(1);
        let (ready_tx, ready_rx) = mpsc::channel::<WorkItem>();
        let (dispatch_tx, dispatch_rx) = mpsc::channel::<DispatchItem>();

        let countdowns: Vec<TickCountdown> = topology
            .bolts()
            .iter()
            .filter(|(id, _)| prepared.iter().any(|p| &p.address.component == *id))
            .filter_map(|(id, decl)| decl.config.tick_interval_secs.map(|secs| TickCountdown::new(id.clone(), secs)))
            .collect();

        let core = Arc::new_cyclic(|weak: &Weak<ClusterCore>| {
            let tasks = build_task_store(weak, &topology_id, &topology, &config, &env.station, prepared);
            ClusterCore {
                topology_id: topology_id.clone(),
                topology: topology.clone(),
                config: config.clone(),
                tasks,
                station: env.station.clone(),
                transport: env.transport.clone(),
                inbound: Mutex::new(HashMap::new()),
                clock: Arc::new(TickClock::new()),
                events: env.events.clone(),
                ready: ready_tx,
                dispatch: dispatch_tx,
                state: Mutex::new(ClusterState::Allocated),
                state_changed: Condvar::new(),
                should_terminate: AtomicBool::new(false),
                halt: HaltGate::new(),
                error_count: AtomicUsize::new(0),
                threshold_signalled: AtomicBool::new(false),
                worker_count,
                dispatch_count,
                threads: Mutex::new(Vec::new()),
                tick_stop: Mutex::new(None),
            }
        });

        if let Err(e) = core.spawn_threads(ready_rx, dispatch_rx, countdowns) {
            core.stop_threads();
            return Err(e);
        }

        log::info!(
            "Topology {} allocated {} local tasks on {} component workers and {} dispatch workers",
            topology_id,
            core.tasks.len(),
            worker_count,
            dispatch_count
        );

        let cluster = Arc::new(LocalCluster { core, monitor: Mutex::new(None) });
        if start_immediately {
            cluster.open_all()?;
        }
        Ok(cluster)
    }

    /// Runs the deferred open/prepare hooks and starts scheduling.
    pub fn open_all(&self) -> Result<()> {
        self.core.transition(ClusterState::Allocated, ClusterState::Running, "start")?;

        for task in self.core.tasks.iter() {
            self.core.open_task(task);
        }

        self.core.schedule_spouts();
        for task in self.core.tasks.iter().filter(|t| t.kind == ComponentKind::Bolt) {
            self.core.component_pending(task.key);
        }
        log::info!("Topology {} is running", self.core.topology_id);
        Ok(())
    }

    pub fn schedule_spouts(&self) {
        self.core.schedule_spouts();
    }

    /// Starts cooperative shutdown: spouts close, TERMINATE markers drain the
    /// graph, and a monitor thread tears the workers down once every local
    /// task reports closed.
    pub fn set_should_terminate(&self) -> Result<()> {
        let core = &self.core;
        if core.should_terminate.swap(true, Ordering::AcqRel) {
            return Ok(());
        }

        let previous = core.set_state(ClusterState::Terminating);
        core.halt.release();
        log::info!("Terminating topology {} (was {})", core.topology_id, previous);

        if previous == ClusterState::Allocated {
            // Never opened, so there is nothing to drain.
            for task in core.tasks.iter() {
                lock(&task.runtime).pending_open = None;
                task.closed.store(true, Ordering::Release);
            }
        }

        for task in core.tasks.iter().filter(|t| t.kind == ComponentKind::Bolt && t.expected_terminations == 0) {
            task.closing.store(true, Ordering::Release);
            core.component_pending(task.key);
        }
        core.schedule_spouts();

        let monitor_core = core.clone();
        let name = format!("quiescence-{}", core.topology_id);
        let handle = thread::Builder::new()
            .name(name.clone())
            .spawn(move || monitor_core.await_quiescence())
            .map_err(|source| Error::ThreadSpawnError { name, source })?;
        *lock(&self.monitor) = Some(handle);
        Ok(())
    }

    pub fn halt_topology(&self) -> Result<()> {
        self.core.halt_topology()
    }

    pub fn resume_topology(&self) -> Result<()> {
        let core = &self.core;
        match core.transition(ClusterState::Halted, ClusterState::Running, "resume") {
            Ok(()) => {
                core.halt.release();
                log::info!("Topology {} resumed", core.topology_id);
                Ok(())
            }
            Err(_) if core.state() == ClusterState::Running => Ok(()),
            Err(e) => Err(e),
        }
    }

    pub fn topology_id(&self) -> &TopologyId {
        &self.core.topology_id
    }

    pub fn topology(&self) -> &Arc<Topology> {
        &self.core.topology
    }

    pub fn state(&self) -> ClusterState {
        self.core.state()
    }

    /// Waits until the cluster reaches `target`; false on timeout.
    pub fn await_state(&self, target: ClusterState, timeout: Duration) -> bool {
        let deadline = Instant::now() + timeout;
        let mut state = lock(&self.core.state);
        while *state != target {
            let now = Instant::now();
            if now >= deadline {
                return false;
            }
            state = self.core.state_changed.wait_timeout(state, deadline - now).unwrap_or_else(PoisonError::into_inner).0;
        }
        true
    }

    pub fn snapshot(&self) -> Vec<TaskSnapshot> {
        let mut snapshot: Vec<_> = self.core.tasks.iter().map(|t| t.snapshot()).collect();
        snapshot.sort_by(|a, b| (&a.component, a.task).cmp(&(&b.component, b.task)));
        snapshot
    }

    /// Component errors keyed by `component[task]`.
    pub fn component_errors(&self) -> BTreeMap<String, Vec<ComponentError>> {
        self.core
            .tasks
            .iter()
            .filter_map(|t| {
                let errors = lock(&t.errors);
                if errors.is_empty() { None } else { Some((t.address.to_string(), errors.clone())) }
            })
            .collect()
    }

    pub fn error_count(&self) -> usize {
        self.core.error_count.load(Ordering::Acquire)
    }

    /// Tick periods counted since the cluster was allocated.
    pub fn elapsed_tick_periods(&self) -> u64 {
        self.core.clock.now()
    }

    pub fn local_task_count(&self) -> usize {
        self.core.tasks.len()
    }

    pub(crate) fn core(&self) -> &Arc<ClusterCore> {
        &self.core
    }
}

impl Drop for LocalCluster {
    fn drop(&mut self) {
        if let Some(handle) = lock(&self.monitor).take() {
            if handle.join().is_err() {
                log::warn!("Quiescence monitor of {} panicked", self.core.topology_id);
            }
        }
    }
}

fn clone_local_tasks(topology: &Topology, me: Option<&NodeDescriptor>) -> Result<Vec<Prepared>> {
    let placement = match (topology.placement(), me) {
        (Some(placement), Some(me)) => Some((placement, me)),
        (Some(_), None) => return Err(Error::ConfigError(format!("topology '{}' has a placement but this cluster has no transport", topology.name()))),
        (None, _) => None,
    };

    let local_tasks = |component: &ComponentId, num_tasks: usize| -> Vec<usize> {
        match placement {
            Some((placement, me)) => placement.tasks_on(me, component).map(|tasks| tasks.iter().copied().collect()).unwrap_or_default(),
            None => (0..num_tasks).collect(),
        }
    };

    let mut prepared = Vec::new();
    for (id, decl) in topology.spouts() {
        for task in local_tasks(id, decl.num_tasks) {
            let instance = decl.prototype.try_clone_box().map_err(|e| Error::NotDuplicable { component: id.clone(), reason: e.to_string() })?;
            prepared.push(Prepared { address: TaskAddress::new(id.clone(), task), kind: ComponentKind::Spout, instance: Instance::Spout(instance) });
        }
    }
    for (id, decl) in topology.bolts() {
        for task in local_tasks(id, decl.num_tasks) {
            let instance = decl.prototype.try_clone_box().map_err(|e| Error::NotDuplicable { component: id.clone(), reason: e.to_string() })?;
            prepared.push(Prepared { address: TaskAddress::new(id.clone(), task), kind: ComponentKind::Bolt, instance: Instance::Bolt(instance) });
        }
    }
    Ok(prepared)
}

/// Sum over components of `ceil(local_tasks * hint / tasks)`, capped by the
/// configured maximum and never below one.
fn worker_count(topology: &Topology, prepared: &[Prepared], config: &TopologyConfig) -> usize {
    let mut local: BTreeMap<&ComponentId, usize> = BTreeMap::new();
    for p in prepared {
        *local.entry(&p.address.component).or_default() += 1;
    }

    let total: usize = local
        .into_iter()
        .map(|(id, allocated)| {
            let (hint, num_tasks) = match (topology.spouts().get(id), topology.bolts().get(id)) {
                (Some(s), _) => (s.parallelism_hint, s.num_tasks),
                (None, Some(b)) => (b.parallelism_hint, b.num_tasks),
                (None, None) => (1, 1),
            };
            (allocated * hint).div_ceil(num_tasks.max(1))
        })
        .sum();

    config.max_worker_threads.map_or(total, |cap| total.min(cap)).max(1)
}

fn build_task_store(cluster: &Weak<ClusterCore>, topology_id: &TopologyId, topology: &Topology, config: &TopologyConfig, station: &RecycleStation, prepared: Vec<Prepared>) -> TaskStore {
    let mut store = TaskStore::default();

    for Prepared { address, kind, instance } in prepared {
        let output = Arc::new(OutputBuffer::bounded(address.clone(), config.output_buffer_capacity));
        let counters = Arc::new(TaskCounters::default());
        let num_tasks = topology.num_tasks(&address.component).unwrap_or(1);
        let outputs = topology.outputs(&address.component).cloned().unwrap_or_default();

        let mut routes = BTreeMap::new();
        for (stream, fields) in &outputs {
            let edges = topology
                .outgoing(&address.component)
                .filter(|edge| &edge.stream == stream)
                .map(|edge| {
                    let targets: Vec<usize> = (0..topology.num_tasks(&edge.to).unwrap_or(0)).collect();
                    let mut grouping = edge.grouping.clone_box();
                    grouping.prepare(fields, &targets);
                    RouteEdge { to: edge.to.clone(), grouping }
                })
                .collect();
            routes.insert(stream.clone(), StreamRoute { fields: fields.clone(), pool: station.tuple_pool(fields), edges });
        }

        let collector = CollectorCore { address: address.clone(), cluster: cluster.clone(), routes, output: output.clone(), counters: counters.clone() };
        let context = TopologyContext::new(topology_id.clone(), address.component.clone(), address.task, (0..num_tasks).collect(), outputs);

        let (input, receiver, expected_terminations) = match kind {
            ComponentKind::Bolt => {
                let (tx, rx) = mpsc::sync_channel(config.input_queue_capacity.max(1));
                (Some(InputQueue::new(tx)), Some(rx), topology.expected_terminations(&address.component))
            }
            ComponentKind::Spout => (None, None, 0),
        };

        let pending_open = match kind {
            ComponentKind::Spout => PendingOpen::Spout(context, SpoutOutputCollector { core: collector }),
            ComponentKind::Bolt => PendingOpen::Bolt(context, OutputCollector { core: collector }),
        };

        store.insert_with_key(|key| TaskCell {
            key,
            address,
            kind,
            runtime: Mutex::new(TaskRuntime { instance, input: receiver, pending_open: Some(pending_open), opened: false, terminations_seen: 0 }),
            input,
            ticks: Mutex::new(VecDeque::new()),
            output,
            expected_terminations,
            closing: AtomicBool::new(false),
            closed: AtomicBool::new(false),
            counters,
            errors: Mutex::new(Vec::new()),
        });
    }

    store
}

fn component_worker(core: Arc<ClusterCore>, queue: Arc<Mutex<mpsc::Receiver<WorkItem>>>) {
    loop {
        let item = lock(&queue).recv();
        let key = match item {
            Ok(WorkItem::Run(key)) => key,
            Ok(WorkItem::Shutdown) | Err(_) => break,
        };

        core.halt.pass();

        let Some(task) = core.tasks.get(key).cloned() else {
            continue;
        };
        if core.should_terminate() && task.kind == ComponentKind::Spout {
            if task.is_closed() {
                continue;
            }
            task.closing.store(true, Ordering::Release);
        }
        core.run_task(&task);
    }
}

fn panic_message(payload: Box<dyn std::any::Any + Send>) -> String {
    match payload.downcast::<String>() {
        Ok(message) => format!("panicked: {}", message),
        Err(payload) => match payload.downcast::<&'static str>() {
            Ok(message) => format!("panicked: {}", message),
            Err(_) => "panicked".to_string(),
        },
    }
}

impl ClusterCore {
    fn spawn_threads(self: &Arc<Self>, ready_rx: mpsc::Receiver<WorkItem>, dispatch_rx: mpsc::Receiver<DispatchItem>, countdowns: Vec<TickCountdown>) -> Result<()> {
        let ready_rx = Arc::new(Mutex::new(ready_rx));
        for i in 0..self.worker_count {
            let (core, queue) = (self.clone(), ready_rx.clone());
            self.spawn(format!("worker-{}-{}", self.topology_id, i), move || component_worker(core, queue))?;
        }

        let dispatch_rx = Arc::new(Mutex::new(dispatch_rx));
        for i in 0..self.dispatch_count {
            let (core, queue) = (self.clone(), dispatch_rx.clone());
            self.spawn(format!("dispatch-{}-{}", self.topology_id, i), move || dispatch_worker(core, queue))?;
        }

        if !countdowns.is_empty() {
            let (stop, handles) = spawn_tick_threads(self, countdowns, self.config.tick_period())?;
            *lock(&self.tick_stop) = Some(stop);
            lock(&self.threads).extend(handles);
        }
        Ok(())
    }

    fn spawn(&self, name: String, body: impl FnOnce() + Send + 'static) -> Result<()> {
        let handle = thread::Builder::new().name(name.clone()).spawn(body).map_err(|source| Error::ThreadSpawnError { name, source })?;
        lock(&self.threads).push(handle);
        Ok(())
    }

    pub(crate) fn state(&self) -> ClusterState {
        *lock(&self.state)
    }

    fn set_state(&self, next: ClusterState) -> ClusterState {
        let previous = std::mem::replace(&mut *lock(&self.state), next);
        self.state_changed.notify_all();
        previous
    }

    fn transition(&self, from: ClusterState, to: ClusterState, action: &'static str) -> Result<()> {
        let mut state = lock(&self.state);
        if *state != from {
            return Err(Error::InvalidState { topology: self.topology_id.clone(), action, state: state.to_string() });
        }
        *state = to;
        drop(state);
        self.state_changed.notify_all();
        Ok(())
    }

    pub(crate) fn should_terminate(&self) -> bool {
        self.should_terminate.load(Ordering::Acquire)
    }

    pub(crate) fn halt_topology(&self) -> Result<()> {
        match self.transition(ClusterState::Running, ClusterState::Halted, "halt") {
            Ok(()) => {
                self.halt.engage();
                log::info!("Topology {} halted", self.topology_id);
                Ok(())
            }
            Err(_) if self.state() == ClusterState::Halted => Ok(()),
            Err(e) => Err(e),
        }
    }

    /// Marks a task runnable. Duplicate entries are harmless.
    pub(crate) fn component_pending(&self, key: TaskKey) {
        if self.ready.send(WorkItem::Run(key)).is_err() {
            log::trace!("Topology {} has no component workers left; dropping a wakeup", self.topology_id);
        }
    }

    pub(crate) fn dispatch_pending(&self, buffer: Arc<OutputBuffer>) {
        if let Err(mpsc::SendError(DispatchItem::Drain(buffer))) = self.dispatch.send(DispatchItem::Drain(buffer)) {
            log::trace!("Topology {} has no dispatch workers left; {} stays undrained", self.topology_id, buffer.owner());
        }
    }

    fn schedule_spouts(&self) {
        for task in self.tasks.iter().filter(|t| t.kind == ComponentKind::Spout) {
            self.component_pending(task.key);
        }
    }

    fn open_task(&self, task: &Arc<TaskCell>) {
        let mut guard = lock(&task.runtime);
        let runtime = &mut *guard;
        let pending = runtime.pending_open.take();

        let opened = match (&mut runtime.instance, pending) {
            (Instance::Spout(spout), Some(PendingOpen::Spout(context, collector))) => self.invoke(task, "open", || spout.open(&self.config, &context, collector)),
            (Instance::Bolt(bolt), Some(PendingOpen::Bolt(context, collector))) => self.invoke(task, "prepare", || bolt.prepare(&self.config, &context, collector)),
            _ => return,
        };

        runtime.opened = true;
        if !opened {
            log::error!("{} of topology {} failed to open and will not run", task.address, self.topology_id);
            task.closed.store(true, Ordering::Release);
        }
    }

    /// Runs one step of `task` unless another worker already is. Work that
    /// arrived while the lock was held is rescheduled after releasing it.
    pub(crate) fn run_task(&self, task: &Arc<TaskCell>) {
        let mut guard = match task.runtime.try_lock() {
            Ok(guard) => guard,
            Err(TryLockError::Poisoned(poisoned)) => poisoned.into_inner(),
            Err(TryLockError::WouldBlock) => return,
        };
        let runtime = &mut *guard;
        if !runtime.opened || task.is_closed() {
            return;
        }

        match &mut runtime.instance {
            Instance::Spout(spout) => self.step_spout(task, spout.as_mut()),
            Instance::Bolt(bolt) => self.step_bolt(task, bolt.as_mut(), runtime.input.as_ref(), &mut runtime.terminations_seen),
        }
        drop(guard);

        if task.kind == ComponentKind::Bolt && !task.is_closed() && task.has_pending_work() {
            self.component_pending(task.key);
        }
    }

    fn step_spout(&self, task: &Arc<TaskCell>, spout: &mut dyn Spout) {
        if task.is_closing() {
            self.invoke(task, "close", || spout.close());
            self.emit_terminate(task);
            task.closed.store(true, Ordering::Release);
            log::debug!("Spout {} of topology {} closed", task.address, self.topology_id);
            return;
        }

        let before = task.counters.emitted.load(Ordering::Relaxed);
        self.invoke(task, "next_tuple", || spout.next_tuple());
        if task.counters.emitted.load(Ordering::Relaxed) == before {
            thread::sleep(IDLE_SPOUT_BACKOFF);
        }
        self.component_pending(task.key);
    }

    fn step_bolt(&self, task: &Arc<TaskCell>, bolt: &mut dyn Bolt, input: Option<&mpsc::Receiver<Pooled<Tuple>>>, terminations_seen: &mut usize) {
        loop {
            let tick = lock(&task.ticks).pop_front();
            let Some(tick) = tick else { break };
            if !task.is_closed() {
                self.invoke(task, "execute", || bolt.execute(&tick.read()));
                task.counters.ticks.fetch_add(1, Ordering::Relaxed);
            }
            release(&tick);
        }

        if task.expected_terminations == 0 && task.is_closing() {
            self.close_bolt(task, bolt);
            return;
        }

        let Some(input) = input else { return };
        for _ in 0..BOLT_BATCH {
            let Ok(tuple) = input.try_recv() else { break };
            if let Some(queue) = &task.input {
                queue.taken();
            }
            self.handle_input(task, bolt, &tuple, terminations_seen);
            release(&tuple);
            if task.is_closed() {
                return;
            }
        }
    }

    fn handle_input(&self, task: &Arc<TaskCell>, bolt: &mut dyn Bolt, tuple: &Pooled<Tuple>, terminations_seen: &mut usize) {
        let kind = tuple.read().kind();
        match kind {
            TupleKind::Terminate => {
                *terminations_seen += 1;
                if *terminations_seen >= task.expected_terminations {
                    self.close_bolt(task, bolt);
                }
            }
            TupleKind::Application | TupleKind::Tick => {
                self.invoke(task, "execute", || bolt.execute(&tuple.read()));
                task.counters.executed.fetch_add(1, Ordering::Relaxed);
            }
            other => log::debug!("{} ignores {:?} tuple", task.address, other),
        }
    }

    fn close_bolt(&self, task: &Arc<TaskCell>, bolt: &mut dyn Bolt) {
        self.invoke(task, "close", || bolt.close());
        self.emit_terminate(task);
        task.closed.store(true, Ordering::Release);
        log::debug!("Bolt {} of topology {} closed", task.address, self.topology_id);
    }

    /// Runs a user hook, turning errors and panics into component errors.
    fn invoke(&self, task: &TaskCell, hook: &str, f: impl FnOnce() -> anyhow::Result<()>) -> bool {
        let message = match panic::catch_unwind(AssertUnwindSafe(f)) {
            Ok(Ok(())) => return true,
            Ok(Err(e)) => format!("{:#}", e),
            Err(payload) => panic_message(payload),
        };
        self.record_error(task, hook, message);
        false
    }

    pub(crate) fn record_error_at(&self, address: &TaskAddress, hook: &str, message: String) {
        match self.tasks.find(&address.component, address.task) {
            Some(task) => self.record_error(task, hook, message),
            None => log::warn!("Error reported by unknown task {}: {}", address, message),
        }
    }

    fn record_error(&self, task: &TaskCell, hook: &str, message: String) {
        log::warn!("{} of topology {} failed in {}: {}", task.address, self.topology_id, hook, message);
        lock(&task.errors).push(ComponentError::new(hook, message));

        let count = self.error_count.fetch_add(1, Ordering::AcqRel) + 1;
        let Some(threshold) = self.config.error_threshold else { return };
        if count < threshold || self.threshold_signalled.swap(true, Ordering::AcqRel) {
            return;
        }

        log::error!("Topology {} reached {} component errors", self.topology_id, count);
        match &self.events {
            Some(events) => {
                let _ = events.send(ClusterEvent::ErrorThresholdReached { topology_id: self.topology_id.clone(), errors: count });
            }
            None => {
                if let Err(e) = self.halt_topology() {
                    log::warn!("Could not halt topology {}: {}", self.topology_id, e);
                }
            }
        }
    }

    /// Wraps `tuple` in an envelope for `targets` of `to` and queues it on
    /// `buffer`. Blocks while the buffer is full.
    pub(crate) fn enqueue(&self, buffer: &Arc<OutputBuffer>, tuple: &Pooled<Tuple>, targets: Vec<usize>, to: &ComponentId) {
        let envelope = self.station.envelope_pool().acquire();
        let bound = envelope.write().bind(tuple, targets, to.clone(), self.topology_id.clone());
        if let Err(e) = bound {
            log::error!("Dropping tuple for {}: {}", to, e);
            release(&envelope);
            return;
        }
        buffer.put(envelope);
        self.dispatch_pending(buffer.clone());
    }

    /// Sends one TERMINATE marker per subscription to every task of the
    /// subscriber, behind all data already emitted by `task`.
    fn emit_terminate(&self, task: &TaskCell) {
        let pool = self.station.tuple_pool(&TERMINATE_FIELDS);
        for edge in self.topology.outgoing(&task.address.component) {
            let targets: Vec<usize> = (0..self.topology.num_tasks(&edge.to).unwrap_or(0)).collect();
            let marker = pool.acquire();
            {
                let mut t = marker.write();
                t.set_source(task.address.component.clone(), edge.stream.clone(), task.address.task);
                t.set_kind(TupleKind::Terminate);
            }
            self.enqueue(&task.output, &marker, targets, &edge.to);
            release(&marker);
        }
    }

    /// Delivers one tick tuple to every local task of `component`.
    pub(crate) fn issue_tick(&self, component: &ComponentId) {
        let tick = self.station.tuple_pool(&TICK_FIELDS).acquire();
        {
            let mut t = tick.write();
            t.set_values(values![0]);
            t.set_source(SYSTEM_COMPONENT_ID.clone(), SYSTEM_TICK_STREAM_ID.clone(), 0);
            t.set_kind(TupleKind::Tick);
        }

        for task in self.tasks.of_component(component).filter(|t| !t.is_closed()) {
            if tick.share(1).is_err() {
                break;
            }
            lock(&task.ticks).push_back(tick.clone());
            self.component_pending(task.key);
        }
        release(&tick);
    }

    fn await_quiescence(&self) {
        let poll = self.config.quiescence_poll();
        let deadline = Instant::now() + self.config.termination_timeout();
        while !self.tasks.iter().all(|t| t.is_closed()) {
            if Instant::now() >= deadline {
                self.force_close();
                break;
            }
            thread::sleep(poll);
        }

        log::info!("Topology {} is quiescent; stopping its threads", self.topology_id);
        self.stop_threads();
        self.drain_leftovers();
        self.set_state(ClusterState::Terminated);
        log::info!("Topology {} terminated", self.topology_id);

        if let Some(events) = &self.events {
            let _ = events.send(ClusterEvent::Terminated { topology_id: self.topology_id.clone() });
        }
    }

    /// Gives up on tasks that never closed, typically because a TERMINATE
    /// marker from a lost peer never arrived. Their close hooks do not run.
    fn force_close(&self) {
        let open: Vec<String> = self.tasks.iter().filter(|t| !t.is_closed()).map(|t| t.address.to_string()).collect();
        log::warn!("Topology {} did not drain within {:?}; abandoning tasks {}", self.topology_id, self.config.termination_timeout(), open.join(", "));
        for task in self.tasks.iter() {
            task.closing.store(true, Ordering::Release);
            task.closed.store(true, Ordering::Release);
            task.output.abandon();
        }
    }

    fn stop_threads(&self) {
        for _ in 0..self.worker_count {
            let _ = self.ready.send(WorkItem::Shutdown);
        }
        for _ in 0..self.dispatch_count {
            let _ = self.dispatch.send(DispatchItem::Shutdown);
        }
        lock(&self.tick_stop).take();
        self.clock.stop();

        let handles = std::mem::take(&mut *lock(&self.threads));
        for handle in handles {
            let name = handle.thread().name().unwrap_or("unnamed").to_string();
            if handle.join().is_err() {
                log::warn!("Thread {} of topology {} panicked", name, self.topology_id);
            }
        }
    }

    /// Returns every share still held by queues once nothing runs anymore.
    fn drain_leftovers(&self) {
        for task in self.tasks.iter() {
            for envelope in task.output.drain() {
                release(&envelope);
            }
            for tick in lock(&task.ticks).drain(..) {
                release(&tick);
            }
            if let Some(input) = &lock(&task.runtime).input {
                while let Ok(tuple) = input.try_recv() {
                    release(&tuple);
                }
            }
        }
        for buffer in lock(&self.inbound).values() {
            for envelope in buffer.drain() {
                release(&envelope);
            }
        }
    }
}

pub(crate) fn release<T: crate::domain::recycle::Recyclable>(item: &Pooled<T>) {
    if let Err(e) = item.release(1) {
        log::error!("{}", e);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::demo::{CountingSpout, LoggingBolt};
    use crate::domain::topology::TopologyBuilder;

    #[test]
    fn test_wakeups_after_shutdown_are_dropped() {
        let mut builder = TopologyBuilder::new("stopped");
        builder.set_spout("numbers", CountingSpout::new(), 1);
        builder.set_bolt("tally", LoggingBolt::new(60), 1).shuffle_grouping("numbers");
        let topology = Arc::new(builder.create_topology().unwrap());
        let config = TopologyConfig { quiescence_poll_ms: 5, ..TopologyConfig::default() };
        let cluster = LocalCluster::submit(TopologyId::new("stopped-1"), config, topology, false, ClusterEnvironment::standalone()).unwrap();

        cluster.set_should_terminate().unwrap();
        assert!(cluster.await_state(ClusterState::Terminated, Duration::from_secs(5)));

        let core = cluster.core();
        for task in core.tasks.iter() {
            core.component_pending(task.key);
            core.dispatch_pending(task.output.clone());
        }
        assert_eq!(cluster.state(), ClusterState::Terminated);
        assert!(cluster.snapshot().iter().all(|t| t.closed));
    }
}
