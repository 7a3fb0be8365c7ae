mod common;

use std::sync::Arc;
use std::sync::atomic::Ordering;
use std::thread;
use std::time::{Duration, Instant};

use common::{NumberSpout, Probe, RecordingBolt, fast_config, wait_until};
use stream_node::domain::cluster::{ClusterEnvironment, ClusterState, LocalCluster, OutputCollector};
use stream_node::domain::coordination::NodeDescriptor;
use stream_node::domain::network::{LocalNetwork, Transport};
use stream_node::domain::recycle::RecycleStation;
use stream_node::domain::topology::{Bolt, CloneError, OutputFieldsDeclarer, Placement, TopologyBuilder, TopologyConfig, TopologyContext};
use stream_node::domain::tuple::Tuple;
use stream_node::domain::utils::id::{ComponentId, TopologyId};
use stream_node::error::Error;

const SETTLE: Duration = Duration::from_secs(10);

fn terminate(cluster: &LocalCluster) {
    cluster.set_should_terminate().unwrap();
    assert!(cluster.await_state(ClusterState::Terminated, SETTLE), "cluster did not terminate");
}

#[test]
fn test_shuffle_spreads_two_spouts_over_three_bolts() {
    let (spouts, bolts) = (Probe::new(), Probe::new());
    let mut builder = TopologyBuilder::new("spread");
    builder.set_spout("numbers", NumberSpout::new(Some(100), spouts.clone()), 2);
    builder.set_bolt("sink", RecordingBolt::sink(bolts.clone()), 3).shuffle_grouping("numbers");
    let topology = Arc::new(builder.create_topology().unwrap());

    let cluster = LocalCluster::submit(TopologyId::new("spread-1"), fast_config(), topology, true, ClusterEnvironment::standalone()).unwrap();
    assert_eq!(cluster.state(), ClusterState::Running);
    assert_eq!(cluster.local_task_count(), 5);

    assert!(wait_until(SETTLE, || bolts.executed() == 200));
    terminate(&cluster);

    let per_task = bolts.per_task();
    assert_eq!(per_task.len(), 3);
    assert_eq!(per_task.iter().sum::<usize>(), 200);
    for count in per_task {
        assert!((66..=68).contains(&count), "uneven split: {}", count);
    }
    assert_eq!(spouts.closed.load(Ordering::SeqCst), 2);
    assert_eq!(bolts.closed.load(Ordering::SeqCst), 3);
}

#[test]
fn test_deferred_open_runs_no_hooks_until_opened() {
    let (spouts, bolts) = (Probe::new(), Probe::new());
    let mut builder = TopologyBuilder::new("deferred");
    builder.set_spout("numbers", NumberSpout::new(Some(10), spouts.clone()), 1);
    builder.set_bolt("sink", RecordingBolt::sink(bolts.clone()), 1).shuffle_grouping("numbers");
    let topology = Arc::new(builder.create_topology().unwrap());

    let cluster = LocalCluster::submit(TopologyId::new("deferred-1"), fast_config(), topology, false, ClusterEnvironment::standalone()).unwrap();
    thread::sleep(Duration::from_millis(50));
    assert_eq!(cluster.state(), ClusterState::Allocated);
    assert_eq!(spouts.opened.load(Ordering::SeqCst), 0);
    assert!(cluster.resume_topology().is_err());

    cluster.open_all().unwrap();
    assert!(cluster.open_all().is_err());
    assert!(wait_until(SETTLE, || bolts.executed() == 10));
    terminate(&cluster);
}

#[test]
fn test_terminating_an_unopened_cluster_skips_every_hook() {
    let (spouts, bolts) = (Probe::new(), Probe::new());
    let mut builder = TopologyBuilder::new("never-opened");
    builder.set_spout("numbers", NumberSpout::new(None, spouts.clone()), 1);
    builder.set_bolt("sink", RecordingBolt::sink(bolts.clone()), 2).shuffle_grouping("numbers");
    let topology = Arc::new(builder.create_topology().unwrap());

    let cluster = LocalCluster::submit(TopologyId::new("never-opened-1"), fast_config(), topology, false, ClusterEnvironment::standalone()).unwrap();
    terminate(&cluster);

    assert_eq!(spouts.opened.load(Ordering::SeqCst), 0);
    assert_eq!(bolts.closed.load(Ordering::SeqCst), 0);
    assert!(cluster.snapshot().iter().all(|t| t.closed));
}

#[test]
fn test_ticks_follow_the_declared_interval() {
    let bolts = Probe::new();
    let mut builder = TopologyBuilder::new("ticks");
    builder.set_spout("numbers", NumberSpout::new(Some(0), Probe::new()), 1);
    builder.set_bolt("ticking", RecordingBolt::ticking(bolts.clone(), 2), 1).shuffle_grouping("numbers");
    let topology = Arc::new(builder.create_topology().unwrap());

    let config = TopologyConfig { tick_period_ms: 20, ..fast_config() };
    let cluster = LocalCluster::submit(TopologyId::new("ticks-1"), config, topology, true, ClusterEnvironment::standalone()).unwrap();
    thread::sleep(Duration::from_millis(600));
    terminate(&cluster);

    // One tick every two periods. The clock may count a period or two
    // after the bolt closed.
    let ticks = bolts.ticks.load(Ordering::SeqCst);
    let due = (cluster.elapsed_tick_periods() / 2) as usize;
    assert!(due >= 10, "clock only counted {} intervals", due);
    assert!(ticks <= due && ticks + 2 >= due, "{} ticks for {} elapsed intervals", ticks, due);
    assert_eq!(bolts.executed(), 0);

    let snapshot = cluster.snapshot();
    let ticking = snapshot.iter().find(|t| t.component.as_str() == "ticking").unwrap();
    assert_eq!(ticking.ticks as usize, ticks);
}

#[test]
fn test_slow_consumer_bounds_queues_without_loss() {
    let bolts = Probe::new();
    let mut builder = TopologyBuilder::new("backpressure");
    builder.set_spout("numbers", NumberSpout::new(Some(100), Probe::new()), 1);
    builder.set_bolt("slow", RecordingBolt::slow(bolts.clone(), Duration::from_millis(2)), 1).shuffle_grouping("numbers");
    let topology = Arc::new(builder.create_topology().unwrap());

    let config = TopologyConfig { input_queue_capacity: 2, output_buffer_capacity: 4, ..fast_config() };
    let cluster = LocalCluster::submit(TopologyId::new("backpressure-1"), config, topology, true, ClusterEnvironment::standalone()).unwrap();

    let deadline = Instant::now() + SETTLE;
    while bolts.executed() < 100 {
        assert!(Instant::now() < deadline, "slow consumer stalled at {}", bolts.executed());
        for task in cluster.snapshot() {
            // An offer is counted just before a full queue rejects it.
            assert!(task.input_queue <= 3, "input queue grew to {}", task.input_queue);
            assert!(task.output_buffer <= 4, "output buffer grew to {}", task.output_buffer);
        }
        thread::sleep(Duration::from_millis(3));
        assert!(cluster.state() == ClusterState::Running);
    }
    terminate(&cluster);
    assert_eq!(bolts.executed(), 100);
}

#[test]
fn test_a_task_never_runs_on_two_workers_at_once() {
    let bolts = Probe::new();
    let mut builder = TopologyBuilder::new("exclusive");
    builder.set_spout("numbers", NumberSpout::new(Some(2000), Probe::new()), 2);
    builder.set_bolt("sink", RecordingBolt::sink(bolts.clone()), 2).shuffle_grouping("numbers").set_num_tasks(2);
    let topology = Arc::new(builder.create_topology().unwrap());

    let config = TopologyConfig { max_worker_threads: Some(8), ..fast_config() };
    let cluster = LocalCluster::submit(TopologyId::new("exclusive-1"), config, topology, true, ClusterEnvironment::standalone()).unwrap();
    assert!(wait_until(SETTLE, || bolts.executed() == 4000));
    terminate(&cluster);

    assert_eq!(bolts.overlaps.load(Ordering::SeqCst), 0);
}

#[test]
fn test_halt_pauses_execution_until_resumed() {
    let bolts = Probe::new();
    let mut builder = TopologyBuilder::new("halting");
    builder.set_spout("numbers", NumberSpout::new(None, Probe::new()), 1);
    builder.set_bolt("sink", RecordingBolt::sink(bolts.clone()), 1).shuffle_grouping("numbers");
    let topology = Arc::new(builder.create_topology().unwrap());

    let cluster = LocalCluster::submit(TopologyId::new("halting-1"), fast_config(), topology, true, ClusterEnvironment::standalone()).unwrap();
    assert!(wait_until(SETTLE, || bolts.executed() > 10));

    cluster.halt_topology().unwrap();
    cluster.halt_topology().unwrap();
    assert_eq!(cluster.state(), ClusterState::Halted);
    thread::sleep(Duration::from_millis(100));
    let paused_at = bolts.executed();
    thread::sleep(Duration::from_millis(150));
    assert_eq!(bolts.executed(), paused_at);

    cluster.resume_topology().unwrap();
    assert_eq!(cluster.state(), ClusterState::Running);
    assert!(wait_until(SETTLE, || bolts.executed() > paused_at));

    cluster.halt_topology().unwrap();
    terminate(&cluster);
}

#[test]
fn test_terminate_drains_everything_already_emitted() {
    let (spouts, middle, sink) = (Probe::new(), Probe::new(), Probe::new());
    let mut builder = TopologyBuilder::new("draining");
    builder.set_spout("numbers", NumberSpout::new(None, spouts.clone()), 2);
    builder.set_bolt("relay", RecordingBolt::forwarding(middle.clone()), 2).shuffle_grouping("numbers");
    builder.set_bolt("sink", RecordingBolt::sink(sink.clone()), 3).all_grouping("relay");
    let topology = Arc::new(builder.create_topology().unwrap());

    let cluster = LocalCluster::submit(TopologyId::new("draining-1"), fast_config(), topology, true, ClusterEnvironment::standalone()).unwrap();
    assert!(wait_until(SETTLE, || sink.executed() > 50));
    terminate(&cluster);

    let snapshot = cluster.snapshot();
    let emitted_by = |component: &str| snapshot.iter().filter(|t| t.component.as_str() == component).map(|t| t.emitted).sum::<u64>();
    let executed_by = |component: &str| snapshot.iter().filter(|t| t.component.as_str() == component).map(|t| t.executed).sum::<u64>();

    assert_eq!(executed_by("relay"), emitted_by("numbers"));
    assert_eq!(executed_by("sink"), 3 * emitted_by("relay"));
    assert!(snapshot.iter().all(|t| t.closed && t.input_queue == 0 && t.output_buffer == 0));
    assert_eq!(middle.closed.load(Ordering::SeqCst), 2);
    assert_eq!(sink.closed.load(Ordering::SeqCst), 3);

    // A second request is a no-op.
    cluster.set_should_terminate().unwrap();
    assert_eq!(cluster.state(), ClusterState::Terminated);
}

#[test]
fn test_error_threshold_halts_a_standalone_cluster() {
    let bolts = Probe::new();
    let mut builder = TopologyBuilder::new("failing");
    builder.set_spout("numbers", NumberSpout::new(Some(20), Probe::new()), 1);
    builder.set_bolt("broken", RecordingBolt::failing(bolts.clone()), 1).shuffle_grouping("numbers");
    let topology = Arc::new(builder.create_topology().unwrap());

    let config = TopologyConfig { error_threshold: Some(3), ..fast_config() };
    let cluster = LocalCluster::submit(TopologyId::new("failing-1"), config, topology, true, ClusterEnvironment::standalone()).unwrap();
    assert!(cluster.await_state(ClusterState::Halted, SETTLE));
    assert!(cluster.error_count() >= 3);

    let errors = cluster.component_errors();
    let broken = errors.get("broken[0]").unwrap();
    assert!(broken.iter().all(|e| e.hook == "execute"));
    assert!(broken[0].message.contains("cannot handle"));

    terminate(&cluster);
}

#[test]
fn test_ticks_are_delayed_not_lost_on_a_saturated_worker() {
    let bolts = Probe::new();
    let mut builder = TopologyBuilder::new("saturated");
    builder.set_spout("numbers", NumberSpout::new(Some(6), Probe::new()), 1);
    builder.set_bolt("slow", RecordingBolt::slow(bolts.clone(), Duration::from_millis(80)).with_ticks(1), 1).shuffle_grouping("numbers");
    let topology = Arc::new(builder.create_topology().unwrap());

    let config = TopologyConfig { tick_period_ms: 20, max_worker_threads: Some(1), ..fast_config() };
    let cluster = LocalCluster::submit(TopologyId::new("saturated-1"), config, topology, true, ClusterEnvironment::standalone()).unwrap();

    // The single worker spends about 480ms inside the slow bolt.
    assert!(wait_until(SETTLE, || bolts.executed() == 6));
    let busy_for = cluster.elapsed_tick_periods();
    assert!(busy_for >= 15, "worker was only busy for {} periods", busy_for);

    // Once the backlog is worked off, every elapsed interval has its tick.
    assert!(wait_until(SETTLE, || {
        let ticks = bolts.ticks.load(Ordering::SeqCst) as u64;
        cluster.elapsed_tick_periods().abs_diff(ticks) <= 1
    }));
    assert!(bolts.ticks.load(Ordering::SeqCst) as u64 >= busy_for);
    terminate(&cluster);
}

/// A bolt holding something that cannot be copied per task.
struct SingletonBolt;

impl Bolt for SingletonBolt {
    fn declare_output_fields(&self, _declarer: &mut OutputFieldsDeclarer) {}

    fn prepare(&mut self, _config: &TopologyConfig, _context: &TopologyContext, _collector: OutputCollector) -> anyhow::Result<()> {
        Ok(())
    }

    fn execute(&mut self, _tuple: &Tuple) -> anyhow::Result<()> {
        Ok(())
    }

    fn try_clone_box(&self) -> Result<Box<dyn Bolt>, CloneError> {
        Err(CloneError("holds an exclusive device handle".to_string()))
    }
}

#[test]
fn test_non_duplicable_component_rejects_the_submission() {
    let spouts = Probe::new();
    let mut builder = TopologyBuilder::new("singleton");
    builder.set_spout("numbers", NumberSpout::new(None, spouts.clone()), 1);
    builder.set_bolt("device", SingletonBolt, 1).shuffle_grouping("numbers");
    let topology = Arc::new(builder.create_topology().unwrap());

    match LocalCluster::submit(TopologyId::new("singleton-1"), fast_config(), topology, true, ClusterEnvironment::standalone()) {
        Err(Error::NotDuplicable { component, reason }) => {
            assert_eq!(component, ComponentId::from("device"));
            assert!(reason.contains("exclusive device handle"));
        }
        Err(other) => panic!("unexpected error {}", other),
        Ok(_) => panic!("submission should have failed"),
    }

    thread::sleep(Duration::from_millis(50));
    assert_eq!(spouts.opened.load(Ordering::SeqCst), 0);
    assert_eq!(spouts.closed.load(Ordering::SeqCst), 0);
}

#[test]
fn test_termination_gives_up_on_a_marker_that_never_arrives() {
    let network = LocalNetwork::new();
    let (lost, me) = (NodeDescriptor::new("localhost", 7101, 8101), NodeDescriptor::new("localhost", 7102, 8102));
    let sinks = Probe::new();

    // The only upstream task lives on a node that is gone.
    let mut placement = Placement::new();
    placement.assign(lost, "numbers", [0]).assign(me.clone(), "sink", [0]);
    let mut builder = TopologyBuilder::new("orphaned");
    builder.set_spout("numbers", NumberSpout::new(None, Probe::new()), 1);
    builder.set_bolt("sink", RecordingBolt::sink(sinks.clone()), 1).shuffle_grouping("numbers");
    builder.with_placement(placement);
    let topology = Arc::new(builder.create_topology().unwrap());

    let transport: Arc<dyn Transport> = Arc::new(network.attach(me));
    let env = ClusterEnvironment { station: Arc::new(RecycleStation::new()), transport: Some(transport), events: None };
    let config = TopologyConfig { termination_timeout_ms: 200, ..fast_config() };
    let cluster = LocalCluster::submit(TopologyId::new("orphaned-1"), config, topology, true, env).unwrap();
    assert_eq!(cluster.local_task_count(), 1);

    let started = Instant::now();
    cluster.set_should_terminate().unwrap();
    assert!(cluster.await_state(ClusterState::Terminated, SETTLE), "termination hung on the missing marker");
    assert!(started.elapsed() >= Duration::from_millis(200));

    assert!(cluster.snapshot().iter().all(|t| t.closed));
    assert_eq!(sinks.closed.load(Ordering::SeqCst), 0);
}
