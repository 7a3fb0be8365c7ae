use std::collections::{BTreeMap, VecDeque};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Condvar, Mutex, PoisonError, mpsc};
use std::thread;
use std::time::Duration;

use crate::domain::cluster::local_cluster::{ClusterCore, DispatchItem, release};
use crate::domain::cluster::task::TaskAddress;
use crate::domain::coordination::node_descriptor::NodeDescriptor;
use crate::domain::network::messages::{NodeBody, NodeMessage, TupleBatch};
use crate::domain::network::transport::TransportError;
use crate::domain::recycle::Pooled;
use crate::domain::tuple::{Envelope, Tuple};
use crate::domain::utils::id::ComponentId;
use crate::domain::utils::sync::lock;

/// Envelopes handled per drain request before the buffer is handed back to
/// the queue.
const DRAIN_BATCH: usize = 64;

const RETRY_BACKOFF: Duration = Duration::from_micros(200);

/// FIFO of envelopes emitted by one task (or received from one remote task).
///
/// Only one dispatch worker works on a buffer at a time, so envelopes leave
/// in the order they were put.
#[derive(Debug)]
pub struct OutputBuffer {
    owner: TaskAddress,
    capacity: Option<usize>,
    queue: Mutex<VecDeque<Pooled<Envelope>>>,
    space: Condvar,
    busy: AtomicBool,
    abandoned: AtomicBool,
}

impl OutputBuffer {
    pub fn bounded(owner: TaskAddress, capacity: usize) -> Self {
        Self::with_capacity(owner, Some(capacity.max(1)))
    }

    pub fn unbounded(owner: TaskAddress) -> Self {
        Self::with_capacity(owner, None)
    }

    fn with_capacity(owner: TaskAddress, capacity: Option<usize>) -> Self {
        Self { owner, capacity, queue: Mutex::new(VecDeque::new()), space: Condvar::new(), busy: AtomicBool::new(false), abandoned: AtomicBool::new(false) }
    }

    pub fn owner(&self) -> &TaskAddress {
        &self.owner
    }

    /// Appends `envelope`, blocking while a bounded buffer is full.
    ///
    /// Once the buffer is abandoned the envelope is released instead.
    pub fn put(&self, envelope: Pooled<Envelope>) {
        let queue = lock(&self.queue);
        let mut queue = match self.capacity {
            Some(capacity) => self.space.wait_while(queue, |q| q.len() >= capacity && !self.is_abandoned()).unwrap_or_else(PoisonError::into_inner),
            None => queue,
        };
        if self.is_abandoned() {
            drop(queue);
            release(&envelope);
            return;
        }
        queue.push_back(envelope);
    }

    /// Wakes every blocked producer and refuses further envelopes.
    pub(crate) fn abandon(&self) {
        let _queue = lock(&self.queue);
        self.abandoned.store(true, Ordering::Release);
        self.space.notify_all();
    }

    pub fn is_abandoned(&self) -> bool {
        self.abandoned.load(Ordering::Acquire)
    }

    pub fn len(&self) -> usize {
        lock(&self.queue).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn head(&self) -> Option<Pooled<Envelope>> {
        lock(&self.queue).front().cloned()
    }

    fn pop(&self) -> Option<Pooled<Envelope>> {
        let popped = lock(&self.queue).pop_front();
        self.space.notify_all();
        popped
    }

    /// Removes everything still queued. Used once no worker runs anymore.
    pub(crate) fn drain(&self) -> Vec<Pooled<Envelope>> {
        let drained = lock(&self.queue).drain(..).collect();
        self.space.notify_all();
        drained
    }

    fn try_claim(&self) -> bool {
        self.busy.compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire).is_ok()
    }

    fn unclaim(&self) {
        self.busy.store(false, Ordering::Release);
    }
}

/// Body of one network dispatch thread.
pub(crate) fn dispatch_worker(core: Arc<ClusterCore>, queue: Arc<Mutex<mpsc::Receiver<DispatchItem>>>) {
    loop {
        let item = lock(&queue).recv();
        match item {
            Ok(DispatchItem::Drain(buffer)) => core.drain_buffer(&buffer),
            Ok(DispatchItem::Shutdown) | Err(_) => break,
        }
    }
    log::trace!("Dispatch worker of {} exiting", core.topology_id);
}

impl ClusterCore {
    fn drain_buffer(&self, buffer: &Arc<OutputBuffer>) {
        // Whoever holds the claim re-queues the buffer if work is left.
        if !buffer.try_claim() {
            return;
        }

        let mut stalled = false;
        for _ in 0..DRAIN_BATCH {
            let Some(envelope) = buffer.head() else { break };
            if !self.dispatch_head(&envelope) {
                stalled = true;
                break;
            }
            if let Some(done) = buffer.pop() {
                release(&done);
            }
        }

        buffer.unclaim();
        if !buffer.is_empty() {
            if stalled {
                thread::sleep(RETRY_BACKOFF);
            }
            self.dispatch_pending(buffer.clone());
        }
    }

    /// Tries every destination still pending on `envelope`. Returns true once
    /// none is left.
    fn dispatch_head(&self, envelope: &Pooled<Envelope>) -> bool {
        let (tuple, component, targets) = {
            let e = envelope.read();
            match (e.tuple().cloned(), e.component_id().cloned()) {
                (Some(tuple), Some(component)) => (tuple, component, e.task_ids().clone()),
                _ => return true,
            }
        };

        let me = self.transport.as_ref().map(|t| t.descriptor().clone());
        let mut delivered = Vec::new();
        let mut remote: BTreeMap<NodeDescriptor, Vec<usize>> = BTreeMap::new();

        for task in targets {
            let owner = match (self.topology.placement(), &me) {
                (Some(placement), Some(me)) => placement.node_for(&component, task).filter(|node| *node != me).cloned(),
                _ => None,
            };
            match owner {
                Some(node) => remote.entry(node).or_default().push(task),
                None => {
                    if self.deliver_local(&tuple, &TaskAddress::new(component.clone(), task)) {
                        delivered.push(task);
                    }
                }
            }
        }

        for (node, tasks) in remote {
            if self.deliver_remote(&tuple, &component, &node, &tasks) {
                delivered.extend(tasks);
            }
        }

        let mut e = envelope.write();
        e.remove_task_ids(&delivered);
        e.is_delivered()
    }

    fn deliver_local(&self, tuple: &Pooled<Tuple>, address: &TaskAddress) -> bool {
        let Some(task) = self.tasks.find(&address.component, address.task) else {
            log::warn!("Dropping tuple for {}: not hosted on this node", address);
            return true;
        };
        let Some(input) = task.input.as_ref() else {
            log::warn!("Dropping tuple for spout {}", address);
            return true;
        };
        if task.is_closed() {
            log::debug!("Dropping tuple for closed task {}", address);
            return true;
        }

        if let Err(e) = tuple.share(1) {
            log::error!("Cannot hand tuple to {}: {}", address, e);
            return true;
        }
        match input.offer(tuple.clone()) {
            Ok(()) => {
                self.component_pending(task.key);
                true
            }
            Err(rejected) => {
                release(&rejected);
                false
            }
        }
    }

    fn deliver_remote(&self, tuple: &Pooled<Tuple>, component: &ComponentId, node: &NodeDescriptor, tasks: &[usize]) -> bool {
        let Some(transport) = &self.transport else {
            log::error!("Dropping tuple for {} on {}: no transport", component, node);
            return true;
        };

        let batch = TupleBatch { topology_id: self.topology_id.clone(), component_id: component.clone(), task_ids: tasks.to_vec(), tuple: tuple.read().to_wire() };
        match transport.send(node, NodeMessage::new(transport.descriptor().clone(), NodeBody::Tuples(batch))) {
            Ok(()) => true,
            Err(TransportError::SendFailed { node, reason }) => {
                log::warn!("Sending tuples to {} failed, will retry: {}", node, reason);
                false
            }
            Err(e) => {
                log::error!("Dropping tuple for {} on {}: {}", component, node, e);
                true
            }
        }
    }

    /// Queues a batch received from a peer for local delivery. Never blocks.
    pub(crate) fn accept_remote(&self, origin: &NodeDescriptor, batch: TupleBatch) {
        let source = TaskAddress::new(
            batch.tuple.source_component.clone().unwrap_or_else(|| ComponentId::new(origin.to_string())),
            batch.tuple.source_task.unwrap_or_default(),
        );

        let tuple = self.station.tuple_pool(&batch.tuple.fields).acquire();
        tuple.write().fill_from_wire(batch.tuple);

        let buffer = lock(&self.inbound).entry(source.clone()).or_insert_with(|| Arc::new(OutputBuffer::unbounded(source))).clone();
        self.enqueue(&buffer, &tuple, batch.task_ids, &batch.component_id);
        release(&tuple);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::recycle::RecyclePool;

    fn envelope_pool() -> RecyclePool<Envelope> {
        RecyclePool::new("envelope", Envelope::default)
    }

    #[test]
    fn test_buffer_is_fifo() {
        let pool = envelope_pool();
        let buffer = OutputBuffer::unbounded(TaskAddress::new(ComponentId::new("s"), 0));
        let (a, b) = (pool.acquire(), pool.acquire());
        buffer.put(a.clone());
        buffer.put(b.clone());

        assert!(buffer.head().unwrap().ptr_eq(&a));
        assert!(buffer.pop().unwrap().ptr_eq(&a));
        assert!(buffer.pop().unwrap().ptr_eq(&b));
        assert!(buffer.is_empty());
    }

    #[test]
    fn test_full_buffer_blocks_until_popped() {
        let pool = envelope_pool();
        let buffer = Arc::new(OutputBuffer::bounded(TaskAddress::new(ComponentId::new("s"), 0), 1));
        buffer.put(pool.acquire());

        let producer = {
            let (buffer, envelope) = (buffer.clone(), pool.acquire());
            thread::spawn(move || buffer.put(envelope))
        };
        thread::sleep(Duration::from_millis(50));
        assert!(!producer.is_finished());
        assert_eq!(buffer.len(), 1);

        buffer.pop();
        producer.join().unwrap();
        assert_eq!(buffer.len(), 1);
    }

    #[test]
    fn test_abandoning_releases_a_blocked_producer() {
        let pool = envelope_pool();
        let buffer = Arc::new(OutputBuffer::bounded(TaskAddress::new(ComponentId::new("s"), 0), 1));
        buffer.put(pool.acquire());

        let blocked = pool.acquire();
        let producer = {
            let (buffer, envelope) = (buffer.clone(), blocked.clone());
            thread::spawn(move || buffer.put(envelope))
        };
        thread::sleep(Duration::from_millis(50));
        assert!(!producer.is_finished());

        buffer.abandon();
        producer.join().unwrap();
        assert_eq!(buffer.len(), 1);
        assert_eq!(blocked.ref_count(), 0);
    }

    #[test]
    fn test_full_queue_is_retried_without_duplicating_delivered_targets() {
        use crate::demo::{CountingSpout, LoggingBolt};
        use crate::domain::cluster::{ClusterEnvironment, ClusterState, LocalCluster};
        use crate::domain::topology::{TopologyBuilder, TopologyConfig};
        use crate::domain::tuple::Fields;
        use crate::domain::utils::id::TopologyId;

        let mut builder = TopologyBuilder::new("partial");
        builder.set_spout("numbers", CountingSpout::new(), 1);
        builder.set_bolt("tally", LoggingBolt::new(60), 2).shuffle_grouping("numbers");
        let topology = Arc::new(builder.create_topology().unwrap());
        let config = TopologyConfig { input_queue_capacity: 1, quiescence_poll_ms: 5, ..TopologyConfig::default() };
        let cluster = LocalCluster::submit(TopologyId::new("partial-1"), config, topology, false, ClusterEnvironment::standalone()).unwrap();
        let core = cluster.core();

        let pool = core.station.tuple_pool(&Fields::new(["n", "even"]));
        let tally = ComponentId::new("tally");
        let (first, second) = (core.tasks.find(&tally, 0).unwrap().clone(), core.tasks.find(&tally, 1).unwrap().clone());
        let filler = pool.acquire();
        assert!(first.input.as_ref().unwrap().offer(filler).is_ok());

        let tuple = pool.acquire();
        let envelope = core.station.envelope_pool().acquire();
        envelope.write().bind(&tuple, [0, 1], tally.clone(), core.topology_id.clone()).unwrap();

        assert!(!core.dispatch_head(&envelope));
        assert_eq!(envelope.read().task_ids().iter().copied().collect::<Vec<_>>(), vec![0]);
        assert_eq!(second.input.as_ref().unwrap().len(), 1);
        assert_eq!(tuple.ref_count(), 3);

        let taken = lock(&first.runtime).input.as_ref().unwrap().try_recv().unwrap();
        first.input.as_ref().unwrap().taken();
        release(&taken);

        assert!(core.dispatch_head(&envelope));
        assert_eq!(second.input.as_ref().unwrap().len(), 1);
        assert_eq!(first.input.as_ref().unwrap().len(), 1);
        assert_eq!(tuple.ref_count(), 4);

        release(&envelope);
        release(&tuple);
        cluster.set_should_terminate().unwrap();
        assert!(cluster.await_state(ClusterState::Terminated, Duration::from_secs(5)));
    }

    #[test]
    fn test_only_one_claim_at_a_time() {
        let buffer = OutputBuffer::unbounded(TaskAddress::new(ComponentId::new("s"), 0));
        assert!(buffer.try_claim());
        assert!(!buffer.try_claim());
        buffer.unclaim();
        assert!(buffer.try_claim());
    }
}
