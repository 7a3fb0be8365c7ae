use std::collections::{BTreeSet, HashMap};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, mpsc};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use uuid::Uuid;

use crate::domain::cluster::{ClusterEnvironment, ClusterEvent, ClusterState, LocalCluster, TaskSnapshot};
use crate::domain::coordination::group_operation::{Coordinator, OperationOutcome};
use crate::domain::coordination::join::{JoinReply, join_cluster};
use crate::domain::coordination::membership::{Membership, NodeState};
use crate::domain::coordination::node_descriptor::NodeDescriptor;
use crate::domain::coordination::operations::{
    GetStatusOperation, GroupOperationSpec, GroupReply, GroupRequest, HaltTopologyOperation, ListTopologiesOperation, OperationId, PrepareTopologyOperation,
    RemoveTopologyOperation, ResumeTopologyOperation, StartTopologyOperation, TerminateTopologyOperation, TopologySubmission,
};
use crate::domain::metrics::{MetricsHistory, MetricsSampler, SnapshotSource};
use crate::domain::network::messages::{NodeBody, NodeMessage};
use crate::domain::network::transport::{Transport, TransportError};
use crate::domain::node::config::NodeConfig;
use crate::domain::node::service::{ServiceRequest, ServiceResponse};
use crate::domain::node::status::{NodeContext, NodeStatus, TopologyListing};
use crate::domain::recycle::RecycleStation;
use crate::domain::topology::catalog::TopologyCatalog;
use crate::domain::topology::config::TopologyConfigOverrides;
use crate::domain::utils::id::TopologyId;
use crate::domain::utils::sync::lock;
use crate::error::{Error, Result};

const OPERATIONAL_POLL: Duration = Duration::from_millis(10);

/// A node daemon: joins the cluster, hosts local clusters and answers
/// service requests.
pub struct Node {
    inner: Arc<NodeInner>,
    threads: Mutex<Vec<JoinHandle<()>>>,
    sampler: Mutex<Option<MetricsSampler>>,
}

struct NodeInner {
    config: NodeConfig,
    transport: Arc<dyn Transport>,
    catalog: Arc<TopologyCatalog>,
    station: Arc<RecycleStation>,
    membership: Membership,
    coordinator: Coordinator,
    clusters: Mutex<HashMap<TopologyId, Arc<LocalCluster>>>,
    /// Token of the submission that created each local cluster. Guarded
    /// together with `clusters`: always locked after it.
    submissions: Mutex<HashMap<TopologyId, Uuid>>,
    /// Terminate requests answered once the local cluster has drained.
    pending_terminations: Mutex<HashMap<TopologyId, Vec<(OperationId, NodeDescriptor)>>>,
    events: mpsc::Sender<ClusterEvent>,
    join_replies: mpsc::Sender<JoinReply>,
    metrics: Arc<MetricsHistory>,
    shutting_down: AtomicBool,
}

impl Node {
    /// Starts the receiver, housekeeping, join and metrics threads.
    pub fn start(config: NodeConfig, transport: Arc<dyn Transport>, catalog: Arc<TopologyCatalog>) -> Result<Node> {
        let me = transport.descriptor().clone();
        if me != config.descriptor {
            log::warn!("Transport is bound as {} but the node is configured as {}", me, config.descriptor);
        }

        let (events_tx, events_rx) = mpsc::channel();
        let (join_tx, join_rx) = mpsc::channel();
        let inner = Arc::new(NodeInner {
            membership: Membership::new(me.clone()),
            coordinator: Coordinator::new(transport.clone(), config.operation_timeout),
            metrics: Arc::new(MetricsHistory::new(config.metrics.history)),
            config,
            transport,
            catalog,
            station: Arc::new(RecycleStation::new()),
            clusters: Mutex::new(HashMap::new()),
            submissions: Mutex::new(HashMap::new()),
            pending_terminations: Mutex::new(HashMap::new()),
            events: events_tx,
            join_replies: join_tx,
            shutting_down: AtomicBool::new(false),
        });

        let node = Node { inner: inner.clone(), threads: Mutex::new(Vec::new()), sampler: Mutex::new(None) };

        let receiver = inner.clone();
        node.spawn(format!("node-receiver-{}", me.data_port), move || receiver.receive_loop())?;

        let housekeeper = inner.clone();
        node.spawn(format!("node-housekeeping-{}", me.data_port), move || housekeeper.housekeeping_loop(events_rx))?;

        let joiner = inner.clone();
        node.spawn(format!("node-join-{}", me.data_port), move || {
            join_cluster(&joiner.membership, joiner.transport.as_ref(), &joiner.config.seeds, &join_rx, joiner.config.join_timeout);
        })?;

        if inner.config.metrics.enabled {
            let source: Arc<dyn SnapshotSource> = inner.clone();
            *lock(&node.sampler) = Some(MetricsSampler::spawn(&inner.config.metrics, source, inner.metrics.clone())?);
        }

        log::info!("Node {} started with {} seeds", me, inner.config.seeds.len());
        Ok(node)
    }

    fn spawn(&self, name: String, body: impl FnOnce() + Send + 'static) -> Result<()> {
        let handle = thread::Builder::new().name(name.clone()).spawn(body).map_err(|source| Error::ThreadSpawnError { name, source })?;
        lock(&self.threads).push(handle);
        Ok(())
    }

    pub fn descriptor(&self) -> &NodeDescriptor {
        self.inner.membership.me()
    }

    pub fn state(&self) -> NodeState {
        self.inner.membership.state()
    }

    pub fn members(&self) -> Vec<NodeDescriptor> {
        self.inner.membership.members()
    }

    pub fn next_node(&self) -> Option<NodeDescriptor> {
        self.inner.membership.next_node()
    }

    /// Waits for the join protocol to finish; false on timeout.
    pub fn await_operational(&self, timeout: Duration) -> bool {
        let deadline = Instant::now() + timeout;
        while self.state() != NodeState::Operational {
            if Instant::now() >= deadline {
                return false;
            }
            thread::sleep(OPERATIONAL_POLL);
        }
        true
    }

    /// Handles `request` on a separate thread; the answer arrives on the
    /// returned channel.
    pub fn request(&self, request: ServiceRequest) -> mpsc::Receiver<ServiceResponse> {
        let (tx, rx) = mpsc::channel();
        let name = format!("service-{}", request.name());
        log::debug!("Node {} received {}", self.descriptor(), request.name());

        let inner = self.inner.clone();
        let reply = tx.clone();
        let spawned = thread::Builder::new().name(name).spawn(move || {
            let response = inner.serve(request);
            let _ = reply.send(response);
        });
        if let Err(e) = spawned {
            let _ = tx.send(ServiceResponse::Error { reason: format!("cannot start request thread: {}", e) });
        }
        rx
    }

    /// Like [`request`](Self::request) but waits for the answer.
    pub fn call(&self, request: ServiceRequest, timeout: Duration) -> ServiceResponse {
        let name = request.name();
        match self.request(request).recv_timeout(timeout) {
            Ok(response) => response,
            Err(_) => ServiceResponse::Error { reason: format!("{} did not complete within {:?}", name, timeout) },
        }
    }

    pub fn local_cluster(&self, topology_id: &TopologyId) -> Option<Arc<LocalCluster>> {
        lock(&self.inner.clusters).get(topology_id).cloned()
    }

    pub fn station(&self) -> &Arc<RecycleStation> {
        &self.inner.station
    }

    /// Terminates every local cluster, then stops all node threads.
    pub fn shutdown(&self) {
        if self.inner.shutting_down.swap(true, Ordering::AcqRel) {
            return;
        }
        log::info!("Node {} shutting down", self.descriptor());

        let clusters: Vec<Arc<LocalCluster>> = lock(&self.inner.clusters).drain().map(|(_, c)| c).collect();
        lock(&self.inner.submissions).clear();
        for cluster in &clusters {
            if cluster.state() == ClusterState::Terminated {
                continue;
            }
            if let Err(e) = cluster.set_should_terminate() {
                log::warn!("Could not terminate {}: {}", cluster.topology_id(), e);
                continue;
            }
            if !cluster.await_state(ClusterState::Terminated, self.inner.config.operation_timeout) {
                log::warn!("Topology {} did not drain before shutdown", cluster.topology_id());
            }
        }
        drop(clusters);

        if let Some(mut sampler) = lock(&self.sampler).take() {
            sampler.stop();
        }
        self.inner.transport.close();

        let handles = std::mem::take(&mut *lock(&self.threads));
        for handle in handles {
            let name = handle.thread().name().unwrap_or("unnamed").to_string();
            if handle.join().is_err() {
                log::warn!("Node thread {} panicked", name);
            }
        }
        log::info!("Node {} stopped", self.descriptor());
    }
}

impl Drop for Node {
    fn drop(&mut self) {
        self.shutdown();
    }
}

impl SnapshotSource for NodeInner {
    fn snapshots(&self) -> Vec<(TopologyId, Vec<TaskSnapshot>)> {
        let clusters: Vec<Arc<LocalCluster>> = lock(&self.clusters).values().cloned().collect();
        clusters.iter().filter(|c| c.state() != ClusterState::Terminated).map(|c| (c.topology_id().clone(), c.snapshot())).collect()
    }
}

impl NodeInner {
    fn me(&self) -> &NodeDescriptor {
        self.membership.me()
    }

    fn receive_loop(self: Arc<Self>) {
        loop {
            match self.transport.receive() {
                Ok(message) => self.on_message(message),
                Err(TransportError::Closed) => break,
                Err(e) => log::warn!("Node {} receive failed: {}", self.me(), e),
            }
        }
        log::debug!("Node {} receiver stopped", self.me());
    }

    fn housekeeping_loop(self: Arc<Self>, events: mpsc::Receiver<ClusterEvent>) {
        while !self.shutting_down.load(Ordering::Acquire) {
            match events.recv_timeout(self.config.housekeeping_period) {
                Ok(event) => self.on_cluster_event(event),
                Err(mpsc::RecvTimeoutError::Timeout) => {}
                Err(mpsc::RecvTimeoutError::Disconnected) => break,
            }

            let expired = self.coordinator.expire(Instant::now());
            if expired > 0 {
                log::warn!("Node {} expired {} group operations", self.me(), expired);
            }
            if let Some(joiner) = self.membership.expire_accept(self.config.join_timeout) {
                log::warn!("Joiner {} never completed its join with {}", joiner, self.me());
            }
        }
    }

    fn on_message(self: &Arc<Self>, message: NodeMessage) {
        let NodeMessage { sender, body } = message;
        log::trace!("Node {} got {} from {}", self.me(), body.name(), sender);

        match body {
            NodeBody::JoinRequest => {
                let reply = match self.membership.begin_accept(&sender) {
                    Ok(acceptance) => {
                        log::info!("Node {} accepting join of {}", self.me(), sender);
                        NodeBody::AcceptingJoin { next_node: acceptance.next_node, context: acceptance.context }
                    }
                    Err(reason) => NodeBody::JoinError { reason },
                };
                self.send(&sender, reply);
            }
            NodeBody::AcceptingJoin { next_node, context } => {
                let _ = self.join_replies.send(JoinReply::Accepted { from: sender, next_node, context });
            }
            NodeBody::JoinError { reason } => {
                let _ = self.join_replies.send(JoinReply::Rejected { from: sender, reason });
            }
            NodeBody::JoinComplete => {
                if !self.membership.finish_accept(&sender) {
                    log::debug!("Unexpected join completion from {}", sender);
                }
            }
            NodeBody::ContextUpdate { context } => {
                let added = self.membership.merge(context);
                log::debug!("Node {} learned {} new members from {}", self.me(), added, sender);
            }
            NodeBody::GroupRequest { op_id, request } => {
                // Some requests block until a cluster drains; keep the receiver free.
                let inner = self.clone();
                let spawned = thread::Builder::new().name(format!("group-{}", request.name())).spawn(move || inner.on_group_request(sender, op_id, request));
                if let Err(e) = spawned {
                    log::error!("Cannot handle group request: {}", e);
                }
            }
            NodeBody::GroupSuccess { op_id, reply } => self.coordinator.receive_success(op_id, &sender, reply),
            NodeBody::GroupError { op_id, reason } => self.coordinator.receive_error(op_id, &sender, &reason),
            NodeBody::Tuples(batch) => {
                let cluster = lock(&self.clusters).get(&batch.topology_id).cloned();
                match cluster {
                    Some(cluster) if cluster.state() != ClusterState::Terminated => cluster.core().accept_remote(&sender, batch),
                    _ => log::debug!("Dropping tuples from {} for inactive topology {}", sender, batch.topology_id),
                }
            }
        }
    }

    fn send(&self, to: &NodeDescriptor, body: NodeBody) {
        let name = body.name();
        if let Err(e) = self.transport.send(to, NodeMessage::new(self.me().clone(), body)) {
            log::warn!("Node {} could not send {} to {}: {}", self.me(), name, to, e);
        }
    }

    fn on_cluster_event(self: &Arc<Self>, event: ClusterEvent) {
        match event {
            ClusterEvent::Terminated { topology_id } => self.answer_terminations(&topology_id),
            ClusterEvent::ErrorThresholdReached { topology_id, errors } => {
                log::error!("Topology {} reached {} component errors; halting it everywhere", topology_id, errors);
                let inner = self.clone();
                let spawned = thread::Builder::new().name("auto-halt".to_string()).spawn(move || {
                    let outcome = match inner.hosts_of(&topology_id) {
                        Ok(hosts) => inner.run_group(HaltTopologyOperation { topology_id: topology_id.clone() }, hosts),
                        Err(e) => {
                            log::warn!("Cannot halt {}: {}", topology_id, e);
                            return;
                        }
                    };
                    match outcome {
                        OperationOutcome::Success(_) => log::info!("Topology {} halted after errors", topology_id),
                        OperationOutcome::Failure { reason, .. } => log::error!("Halting {} failed: {}", topology_id, reason),
                    }
                });
                if let Err(e) = spawned {
                    log::error!("Cannot start halt of {}: {}", self.me(), e);
                }
            }
        }
    }

    fn answer_terminations(&self, topology_id: &TopologyId) {
        let waiting = lock(&self.pending_terminations).remove(topology_id).unwrap_or_default();
        for (op_id, origin) in waiting {
            self.reply(&origin, op_id, Ok(GroupReply::Done));
        }
    }

    fn on_group_request(&self, origin: NodeDescriptor, op_id: OperationId, request: GroupRequest) {
        log::debug!("Node {} performing {} for {}", self.me(), request.name(), origin);
        if let Some(result) = self.perform(&origin, op_id, request) {
            self.reply(&origin, op_id, result);
        }
    }

    /// Runs the local part of a group operation. `None` means the reply is
    /// sent later.
    fn perform(&self, origin: &NodeDescriptor, op_id: OperationId, request: GroupRequest) -> Option<std::result::Result<GroupReply, String>> {
        let result = match request {
            GroupRequest::PrepareTopology(submission) => self.prepare_local(&submission),
            GroupRequest::StartTopology { topology_id } => self.cluster(&topology_id).and_then(|c| c.open_all()),
            GroupRequest::TerminateTopology { topology_id } => return self.terminate_local(origin, op_id, &topology_id),
            GroupRequest::RemoveTopology { topology_id, token } => {
                self.remove_local(&topology_id, token);
                Ok(())
            }
            GroupRequest::HaltTopology { topology_id } => self.cluster(&topology_id).and_then(|c| c.halt_topology()),
            GroupRequest::ResumeTopology { topology_id } => self.cluster(&topology_id).and_then(|c| c.resume_topology()),
            GroupRequest::ListTopologies => return Some(Ok(GroupReply::Topologies(self.listings()))),
            GroupRequest::GetStatus => return Some(Ok(GroupReply::Status(self.status()))),
        };
        Some(result.map(|_| GroupReply::Done).map_err(|e| e.to_string()))
    }

    fn reply(&self, origin: &NodeDescriptor, op_id: OperationId, result: std::result::Result<GroupReply, String>) {
        if origin == self.me() {
            match result {
                Ok(reply) => self.coordinator.receive_success(op_id, origin, reply),
                Err(reason) => self.coordinator.receive_error(op_id, origin, &reason),
            }
            return;
        }
        let body = match result {
            Ok(reply) => NodeBody::GroupSuccess { op_id, reply },
            Err(reason) => NodeBody::GroupError { op_id, reason },
        };
        self.send(origin, body);
    }

    fn cluster(&self, topology_id: &TopologyId) -> Result<Arc<LocalCluster>> {
        lock(&self.clusters).get(topology_id).cloned().ok_or_else(|| Error::TopologyNotFound(topology_id.clone()))
    }

    fn prepare_local(&self, submission: &TopologySubmission) -> Result<()> {
        let topology = self.catalog.get(&submission.catalog_name)?;
        let config = submission.overrides.apply_to(&self.config.topology_defaults);

        let mut clusters = lock(&self.clusters);
        if clusters.contains_key(&submission.topology_id) {
            return Err(Error::TopologyExists(submission.topology_id.clone()));
        }
        let env = ClusterEnvironment { station: self.station.clone(), transport: Some(self.transport.clone()), events: Some(self.events.clone()) };
        let cluster = LocalCluster::submit(submission.topology_id.clone(), config, topology, false, env)?;
        clusters.insert(submission.topology_id.clone(), cluster);
        lock(&self.submissions).insert(submission.topology_id.clone(), submission.token);
        Ok(())
    }

    fn terminate_local(&self, origin: &NodeDescriptor, op_id: OperationId, topology_id: &TopologyId) -> Option<std::result::Result<GroupReply, String>> {
        let cluster = match self.cluster(topology_id) {
            Ok(cluster) => cluster,
            Err(e) => return Some(Err(e.to_string())),
        };
        if cluster.state() == ClusterState::Terminated {
            return Some(Ok(GroupReply::Done));
        }

        lock(&self.pending_terminations).entry(topology_id.clone()).or_default().push((op_id, origin.clone()));
        if let Err(e) = cluster.set_should_terminate() {
            lock(&self.pending_terminations).remove(topology_id);
            return Some(Err(e.to_string()));
        }
        // The Terminated event may have fired before we registered.
        if cluster.state() == ClusterState::Terminated {
            self.answer_terminations(topology_id);
        }
        None
    }

    /// Drops the local cluster. With a `token`, a cluster created by a
    /// different submission is left alone.
    fn remove_local(&self, topology_id: &TopologyId, token: Option<Uuid>) {
        let removed = {
            let mut clusters = lock(&self.clusters);
            let mut submissions = lock(&self.submissions);
            if let Some(token) = token.filter(|t| submissions.get(topology_id) != Some(t)) {
                log::debug!("Node {} keeps {}: it was not created by submission {}", self.me(), topology_id, token);
                return;
            }
            submissions.remove(topology_id);
            clusters.remove(topology_id)
        };
        let Some(cluster) = removed else {
            return;
        };
        if cluster.state() != ClusterState::Terminated {
            log::warn!("Removing topology {} before it terminated", topology_id);
            if let Err(e) = cluster.set_should_terminate() {
                log::warn!("Could not terminate {}: {}", topology_id, e);
            }
        }
        log::info!("Topology {} removed from node {}", topology_id, self.me());
    }

    fn listings(&self) -> Vec<TopologyListing> {
        let clusters: Vec<Arc<LocalCluster>> = lock(&self.clusters).values().cloned().collect();
        let mut listings: Vec<TopologyListing> = clusters.iter().map(|c| TopologyListing::of(c)).collect();
        listings.sort_by(|a, b| a.topology_id.cmp(&b.topology_id));
        listings
    }

    fn status(&self) -> NodeStatus {
        NodeStatus {
            descriptor: self.me().clone(),
            timestamp_ms: chrono::Utc::now().timestamp_millis(),
            state: self.membership.state(),
            topologies: lock(&self.clusters).iter().map(|(id, c)| (id.clone(), c.state())).collect(),
        }
    }

    fn context(&self) -> NodeContext {
        NodeContext { node: self.me().clone(), state: self.membership.state(), next_node: self.membership.next_node(), members: self.membership.members() }
    }

    fn serve(&self, request: ServiceRequest) -> ServiceResponse {
        match request {
            ServiceRequest::RunTopology { topology_id, catalog_name, overrides } => self.run_topology(topology_id, catalog_name, overrides),
            ServiceRequest::TerminateTopology { topology_id } => self.terminate_topology(topology_id),
            ServiceRequest::HaltTopology { topology_id } => match self.hosts_of(&topology_id) {
                Ok(hosts) => self.run_group(HaltTopologyOperation { topology_id }, hosts).into_response(),
                Err(e) => ServiceResponse::Error { reason: e.to_string() },
            },
            ServiceRequest::ResumeTopology { topology_id } => match self.hosts_of(&topology_id) {
                Ok(hosts) => self.run_group(ResumeTopologyOperation { topology_id }, hosts).into_response(),
                Err(e) => ServiceResponse::Error { reason: e.to_string() },
            },
            ServiceRequest::ListTopologies => self.run_group(ListTopologiesOperation::default(), self.membership.members()).into_response(),
            ServiceRequest::GetStatus => self.run_group(GetStatusOperation::default(), self.membership.members()).into_response(),
            ServiceRequest::GetNodeContext => ServiceResponse::NodeContext(self.context()),
            ServiceRequest::GetMetrics { topology_id } => ServiceResponse::Metrics(self.metrics.samples(topology_id.as_ref())),
        }
    }

    /// Runs one group operation to completion, taking part locally when this
    /// node is a participant.
    fn run_group(&self, spec: impl GroupOperationSpec + 'static, participants: impl IntoIterator<Item = NodeDescriptor>) -> OperationOutcome {
        let (op_id, outcome) = self.coordinator.create(spec, participants);
        if let Some(request) = self.coordinator.initiate(op_id) {
            let me = self.me().clone();
            self.on_group_request(me, op_id, request);
        }

        // Housekeeping expires the operation; the extra margin covers a
        // stopped housekeeper during shutdown.
        let wait = self.config.operation_timeout + self.config.housekeeping_period * 2;
        match outcome.recv_timeout(wait) {
            Ok(result) => result,
            Err(_) => {
                let reason = format!("operation {} produced no outcome within {:?}", op_id, wait);
                OperationOutcome::Failure { response: ServiceResponse::Error { reason: reason.clone() }, reason }
            }
        }
    }

    /// Nodes hosting tasks of a topology this node knows, plus this node.
    fn hosts_of(&self, topology_id: &TopologyId) -> Result<BTreeSet<NodeDescriptor>> {
        let cluster = self.cluster(topology_id)?;
        let mut hosts: BTreeSet<NodeDescriptor> = cluster.topology().placement().map(|p| p.nodes().cloned().collect()).unwrap_or_default();
        hosts.insert(self.me().clone());
        Ok(hosts)
    }

    fn run_topology(&self, topology_id: TopologyId, catalog_name: String, overrides: TopologyConfigOverrides) -> ServiceResponse {
        let topology = match self.catalog.get(&catalog_name) {
            Ok(topology) => topology,
            Err(e) => return ServiceResponse::Error { reason: e.to_string() },
        };
        if lock(&self.clusters).contains_key(&topology_id) {
            return ServiceResponse::Error { reason: Error::TopologyExists(topology_id).to_string() };
        }

        let mut hosts: BTreeSet<NodeDescriptor> = topology.placement().map(|p| p.nodes().cloned().collect()).unwrap_or_default();
        hosts.insert(self.me().clone());
        log::info!("Running topology {} ({}) on {} nodes", topology_id, catalog_name, hosts.len());

        let submission = TopologySubmission::new(topology_id.clone(), catalog_name, overrides);
        let rollback = RemoveTopologyOperation::created_by(&submission);
        if let OperationOutcome::Failure { response, .. } = self.run_group(PrepareTopologyOperation { submission }, hosts.clone()) {
            // Only clusters this submission created are torn down; a node that
            // already ran the topology keeps it.
            if let OperationOutcome::Failure { reason, .. } = self.run_group(rollback, hosts) {
                log::warn!("Cleanup after failed prepare did not complete: {}", reason);
            }
            return response;
        }

        self.run_group(StartTopologyOperation { topology_id }, hosts).into_response()
    }

    fn terminate_topology(&self, topology_id: TopologyId) -> ServiceResponse {
        let hosts = match self.hosts_of(&topology_id) {
            Ok(hosts) => hosts,
            Err(e) => return ServiceResponse::Error { reason: e.to_string() },
        };

        let terminated = self.run_group(TerminateTopologyOperation { topology_id: topology_id.clone() }, hosts.clone());
        if !terminated.is_success() {
            return terminated.into_response();
        }

        match self.run_group(RemoveTopologyOperation::any(topology_id.clone()), hosts) {
            OperationOutcome::Success(_) => ServiceResponse::TopologyTerminated { topology_id },
            failure => failure.into_response(),
        }
    }
}
