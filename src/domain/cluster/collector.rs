use std::collections::BTreeMap;
use std::sync::atomic::Ordering;
use std::sync::{Arc, Weak};

use crate::domain::cluster::local_cluster::ClusterCore;
use crate::domain::cluster::task::{TaskAddress, TaskCounters};
use crate::domain::network::dispatch::OutputBuffer;
use crate::domain::recycle::RecyclePool;
use crate::domain::topology::grouping::Grouping;
use crate::domain::tuple::{Fields, Tuple, Value};
use crate::domain::utils::constants::DEFAULT_STREAM_ID;
use crate::domain::utils::id::{ComponentId, StreamId};

/// One subscription of a declared output stream, with this task's own
/// prepared grouping.
pub(crate) struct RouteEdge {
    pub(crate) to: ComponentId,
    pub(crate) grouping: Box<dyn Grouping>,
}

pub(crate) struct StreamRoute {
    pub(crate) fields: Fields,
    pub(crate) pool: RecyclePool<Tuple>,
    pub(crate) edges: Vec<RouteEdge>,
}

/// Shared by both collector flavours. Holds only a weak link to the cluster
/// so a task instance never keeps its own scheduler alive.
pub(crate) struct CollectorCore {
    pub(crate) address: TaskAddress,
    pub(crate) cluster: Weak<ClusterCore>,
    pub(crate) routes: BTreeMap<StreamId, StreamRoute>,
    pub(crate) output: Arc<OutputBuffer>,
    pub(crate) counters: Arc<TaskCounters>,
}

impl CollectorCore {
    fn emit(&self, stream: &StreamId, values: Vec<Value>) -> Vec<usize> {
        let Some(cluster) = self.cluster.upgrade() else {
            log::debug!("{} emitted after its cluster was dropped", self.address);
            return Vec::new();
        };
        let Some(route) = self.routes.get(stream) else {
            log::warn!("{} emitted on undeclared stream '{}'", self.address, stream);
            return Vec::new();
        };
        if values.len() != route.fields.len() {
            log::warn!("{} emitted {} values on stream '{}' declared as {:?}", self.address, values.len(), stream, route.fields);
        }

        let tuple = route.pool.acquire();
        {
            let mut t = tuple.write();
            t.set_values(values);
            t.set_source(self.address.component.clone(), stream.clone(), self.address.task);
        }

        let mut destinations = Vec::new();
        for edge in &route.edges {
            let targets = edge.grouping.choose_destinations(&tuple.read());
            if targets.is_empty() {
                continue;
            }
            destinations.extend(targets.iter().copied());
            cluster.enqueue(&self.output, &tuple, targets, &edge.to);
        }

        if let Err(e) = tuple.release(1) {
            log::error!("{} lost track of an emitted tuple: {}", self.address, e);
        }
        self.counters.emitted.fetch_add(1, Ordering::Relaxed);
        destinations
    }

    fn report_error(&self, message: String) {
        if let Some(cluster) = self.cluster.upgrade() {
            cluster.record_error_at(&self.address, "report_error", message);
        }
    }
}

/// Handed to a spout in `open`.
pub struct SpoutOutputCollector {
    pub(crate) core: CollectorCore,
}

impl SpoutOutputCollector {
    /// Emits on the default stream and returns the chosen destination tasks.
    pub fn emit(&self, values: Vec<Value>) -> Vec<usize> {
        self.core.emit(&DEFAULT_STREAM_ID, values)
    }

    pub fn emit_stream(&self, stream: &StreamId, values: Vec<Value>) -> Vec<usize> {
        self.core.emit(stream, values)
    }

    /// Records an error against this task without failing the current call.
    pub fn report_error(&self, message: impl Into<String>) {
        self.core.report_error(message.into());
    }

    pub fn task(&self) -> &TaskAddress {
        &self.core.address
    }
}

/// Handed to a bolt in `prepare`.
pub struct OutputCollector {
    pub(crate) core: CollectorCore,
}

impl OutputCollector {
    pub fn emit(&self, values: Vec<Value>) -> Vec<usize> {
        self.core.emit(&DEFAULT_STREAM_ID, values)
    }

    pub fn emit_stream(&self, stream: &StreamId, values: Vec<Value>) -> Vec<usize> {
        self.core.emit(stream, values)
    }

    pub fn report_error(&self, message: impl Into<String>) {
        self.core.report_error(message.into());
    }

    pub fn task(&self) -> &TaskAddress {
        &self.core.address
    }
}
