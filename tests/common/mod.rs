#![allow(dead_code)]

use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::thread;
use std::time::{Duration, Instant};

use stream_node::domain::cluster::{OutputCollector, SpoutOutputCollector};
use stream_node::domain::topology::{Bolt, CloneError, ComponentConfig, OutputFieldsDeclarer, Spout, TopologyConfig, TopologyContext};
use stream_node::domain::tuple::{Fields, Tuple};
use stream_node::values;

/// State shared by every task cloned from one prototype.
#[derive(Debug, Default)]
pub struct Probe {
    pub opened: AtomicUsize,
    pub closed: AtomicUsize,
    pub executed: AtomicUsize,
    pub ticks: AtomicUsize,
    pub overlaps: AtomicUsize,
    /// Executed tuples per task index.
    pub per_task: Mutex<Vec<usize>>,
    pub busy: Mutex<Vec<Arc<AtomicBool>>>,
}

impl Probe {
    pub fn new() -> Arc<Probe> {
        Arc::new(Probe::default())
    }

    pub fn executed(&self) -> usize {
        self.executed.load(Ordering::SeqCst)
    }

    pub fn per_task(&self) -> Vec<usize> {
        self.per_task.lock().unwrap().clone()
    }

    fn count_for(&self, task: usize) {
        let mut per_task = self.per_task.lock().unwrap();
        if per_task.len() <= task {
            per_task.resize(task + 1, 0);
        }
        per_task[task] += 1;
    }

    fn busy_flag(&self, task: usize) -> Arc<AtomicBool> {
        let mut busy = self.busy.lock().unwrap();
        while busy.len() <= task {
            busy.push(Arc::new(AtomicBool::new(false)));
        }
        busy[task].clone()
    }
}

/// Emits `("n")` tuples counting from zero, stopping after `limit` if set.
pub struct NumberSpout {
    pub limit: Option<usize>,
    sent: usize,
    probe: Arc<Probe>,
    collector: Option<SpoutOutputCollector>,
}

impl NumberSpout {
    pub fn new(limit: Option<usize>, probe: Arc<Probe>) -> Self {
        Self { limit, sent: 0, probe, collector: None }
    }
}

impl Spout for NumberSpout {
    fn declare_output_fields(&self, declarer: &mut OutputFieldsDeclarer) {
        declarer.declare(Fields::new(["n"]));
    }

    fn open(&mut self, _config: &TopologyConfig, _context: &TopologyContext, collector: SpoutOutputCollector) -> anyhow::Result<()> {
        self.probe.opened.fetch_add(1, Ordering::SeqCst);
        self.collector = Some(collector);
        Ok(())
    }

    fn next_tuple(&mut self) -> anyhow::Result<()> {
        if self.limit.is_some_and(|limit| self.sent >= limit) {
            return Ok(());
        }
        if let Some(collector) = &self.collector {
            collector.emit(values![self.sent]);
            self.sent += 1;
        }
        Ok(())
    }

    fn close(&mut self) -> anyhow::Result<()> {
        self.probe.closed.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    fn try_clone_box(&self) -> Result<Box<dyn Spout>, CloneError> {
        Ok(Box::new(NumberSpout::new(self.limit, self.probe.clone())))
    }
}

/// Records what it executes; optionally forwards, sleeps, fails, or ticks.
pub struct RecordingBolt {
    probe: Arc<Probe>,
    forward: bool,
    delay: Duration,
    fail: bool,
    tick_interval: Option<u64>,
    task: usize,
    busy: Option<Arc<AtomicBool>>,
    collector: Option<OutputCollector>,
}

impl RecordingBolt {
    pub fn sink(probe: Arc<Probe>) -> Self {
        Self { probe, forward: false, delay: Duration::ZERO, fail: false, tick_interval: None, task: 0, busy: None, collector: None }
    }

    pub fn forwarding(probe: Arc<Probe>) -> Self {
        Self { forward: true, ..Self::sink(probe) }
    }

    pub fn slow(probe: Arc<Probe>, delay: Duration) -> Self {
        Self { delay, ..Self::sink(probe) }
    }

    pub fn failing(probe: Arc<Probe>) -> Self {
        Self { fail: true, ..Self::sink(probe) }
    }

    pub fn ticking(probe: Arc<Probe>, interval: u64) -> Self {
        Self { tick_interval: Some(interval), ..Self::sink(probe) }
    }

    /// Also asks for a tick every `interval` periods.
    pub fn with_ticks(self, interval: u64) -> Self {
        Self { tick_interval: Some(interval), ..self }
    }

    fn duplicate(&self) -> Self {
        Self {
            probe: self.probe.clone(),
            forward: self.forward,
            delay: self.delay,
            fail: self.fail,
            tick_interval: self.tick_interval,
            task: 0,
            busy: None,
            collector: None,
        }
    }
}

impl Bolt for RecordingBolt {
    fn declare_output_fields(&self, declarer: &mut OutputFieldsDeclarer) {
        if self.forward {
            declarer.declare(Fields::new(["n"]));
        }
    }

    fn prepare(&mut self, _config: &TopologyConfig, context: &TopologyContext, collector: OutputCollector) -> anyhow::Result<()> {
        self.task = context.this_task_index();
        self.busy = Some(self.probe.busy_flag(self.task));
        self.collector = Some(collector);
        self.probe.opened.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    fn execute(&mut self, tuple: &Tuple) -> anyhow::Result<()> {
        if tuple.is_tick() {
            self.probe.ticks.fetch_add(1, Ordering::SeqCst);
            return Ok(());
        }
        if self.fail {
            anyhow::bail!("cannot handle {:?}", tuple.values());
        }

        if let Some(busy) = &self.busy {
            if busy.swap(true, Ordering::SeqCst) {
                self.probe.overlaps.fetch_add(1, Ordering::SeqCst);
            }
        }
        if !self.delay.is_zero() {
            thread::sleep(self.delay);
        }
        if self.forward {
            if let Some(collector) = &self.collector {
                collector.emit(tuple.values().to_vec());
            }
        }
        self.probe.count_for(self.task);
        self.probe.executed.fetch_add(1, Ordering::SeqCst);
        if let Some(busy) = &self.busy {
            busy.store(false, Ordering::SeqCst);
        }
        Ok(())
    }

    fn close(&mut self) -> anyhow::Result<()> {
        self.probe.closed.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    fn component_config(&self) -> ComponentConfig {
        match self.tick_interval {
            Some(interval) => ComponentConfig::with_tick_interval(interval),
            None => ComponentConfig::default(),
        }
    }

    fn try_clone_box(&self) -> Result<Box<dyn Bolt>, CloneError> {
        Ok(Box::new(self.duplicate()))
    }
}

/// Polls `condition` until it holds or `timeout` passes.
pub fn wait_until(timeout: Duration, mut condition: impl FnMut() -> bool) -> bool {
    let deadline = Instant::now() + timeout;
    while Instant::now() < deadline {
        if condition() {
            return true;
        }
        thread::sleep(Duration::from_millis(5));
    }
    condition()
}

/// Settings that keep tests fast.
pub fn fast_config() -> TopologyConfig {
    TopologyConfig { quiescence_poll_ms: 10, tick_period_ms: 10, ..TopologyConfig::default() }
}
