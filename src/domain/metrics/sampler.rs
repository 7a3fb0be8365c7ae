use serde::{Deserialize, Serialize};
use std::collections::VecDeque;
use std::sync::{Arc, Mutex, mpsc};
use std::thread::{self, JoinHandle};
use std::time::Duration;

use crate::domain::cluster::TaskSnapshot;
use crate::domain::metrics::csv_sink::CsvSink;
use crate::domain::utils::constants::ANALYTICS_TARGET;
use crate::domain::utils::id::TopologyId;
use crate::domain::utils::sync::lock;
use crate::error::{Error, Result};

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct MetricsConfig {
    pub enabled: bool,
    pub period_ms: u64,
    /// Samples kept in memory for `GetMetrics`.
    pub history: usize,
    pub csv_path: Option<String>,
}

impl Default for MetricsConfig {
    fn default() -> Self {
        Self { enabled: true, period_ms: 5000, history: 120, csv_path: None }
    }
}

impl MetricsConfig {
    pub fn period(&self) -> Duration {
        Duration::from_millis(self.period_ms.max(1))
    }
}

/// Task counters of one topology at one instant.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MetricsSample {
    pub timestamp_ms: i64,
    pub topology_id: TopologyId,
    pub tasks: Vec<TaskSnapshot>,
}

/// Where the sampler reads from. Implementations must only observe.
pub trait SnapshotSource: Send + Sync {
    fn snapshots(&self) -> Vec<(TopologyId, Vec<TaskSnapshot>)>;
}

/// Ring of the most recent samples.
#[derive(Debug)]
pub struct MetricsHistory {
    capacity: usize,
    samples: Mutex<VecDeque<MetricsSample>>,
}

impl MetricsHistory {
    pub fn new(capacity: usize) -> Self {
        Self { capacity: capacity.max(1), samples: Mutex::new(VecDeque::new()) }
    }

    pub fn push(&self, sample: MetricsSample) {
        let mut samples = lock(&self.samples);
        if samples.len() == self.capacity {
            samples.pop_front();
        }
        samples.push_back(sample);
    }

    /// Oldest first, optionally only those of one topology.
    pub fn samples(&self, topology: Option<&TopologyId>) -> Vec<MetricsSample> {
        lock(&self.samples).iter().filter(|s| topology.is_none_or(|t| &s.topology_id == t)).cloned().collect()
    }

    pub fn len(&self) -> usize {
        lock(&self.samples).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Periodically snapshots every local cluster into the history, the
/// analytics log and the optional CSV file.
pub struct MetricsSampler {
    stop: Option<mpsc::Sender<()>>,
    thread: Option<JoinHandle<()>>,
}

impl MetricsSampler {
    pub fn spawn(config: &MetricsConfig, source: Arc<dyn SnapshotSource>, history: Arc<MetricsHistory>) -> Result<Self> {
        let sink = match &config.csv_path {
            Some(path) => Some(CsvSink::open(Some(path))?),
            None => None,
        };

        let (stop_tx, stop_rx) = mpsc::channel::<()>();
        let period = config.period();
        let name = "metrics-sampler".to_string();
        let thread = thread::Builder::new()
            .name(name.clone())
            .spawn(move || {
                let mut sink = sink;
                while let Err(mpsc::RecvTimeoutError::Timeout) = stop_rx.recv_timeout(period) {
                    sample_once(source.as_ref(), &history, sink.as_ref());
                }
                if let Some(sink) = sink.as_mut() {
                    sink.close();
                }
                log::debug!("Metrics sampler stopped");
            })
            .map_err(|source| Error::ThreadSpawnError { name, source })?;

        Ok(Self { stop: Some(stop_tx), thread: Some(thread) })
    }

    pub fn stop(&mut self) {
        self.stop.take();
        if let Some(thread) = self.thread.take() {
            if thread.join().is_err() {
                log::warn!("Metrics sampler panicked");
            }
        }
    }
}

impl Drop for MetricsSampler {
    fn drop(&mut self) {
        self.stop();
    }
}

pub fn sample_once(source: &dyn SnapshotSource, history: &MetricsHistory, sink: Option<&CsvSink>) {
    let timestamp_ms = chrono::Utc::now().timestamp_millis();
    for (topology_id, tasks) in source.snapshots() {
        for task in &tasks {
            tracing::info!(
                target: ANALYTICS_TARGET,
                topology = %topology_id,
                component = %task.component,
                task = task.task,
                emitted = task.emitted,
                executed = task.executed,
                ticks = task.ticks,
                input_queue = task.input_queue,
                output_buffer = task.output_buffer,
                errors = task.errors,
                "task sample"
            );
        }

        let sample = MetricsSample { timestamp_ms, topology_id, tasks };
        if let Some(sink) = sink {
            sink.write(sample.clone());
        }
        history.push(sample);
    }
    if let Some(sink) = sink {
        sink.flush();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct Fixed(Vec<TopologyId>);

    impl SnapshotSource for Fixed {
        fn snapshots(&self) -> Vec<(TopologyId, Vec<TaskSnapshot>)> {
            self.0.iter().map(|id| (id.clone(), Vec::new())).collect()
        }
    }

    #[test]
    fn test_history_is_bounded() {
        let history = MetricsHistory::new(2);
        let source = Fixed(vec![TopologyId::new("a"), TopologyId::new("b"), TopologyId::new("c")]);
        sample_once(&source, &history, None);

        let kept: Vec<_> = history.samples(None).into_iter().map(|s| s.topology_id).collect();
        assert_eq!(kept, vec![TopologyId::new("b"), TopologyId::new("c")]);
        assert_eq!(history.samples(Some(&TopologyId::new("c"))).len(), 1);
    }

    #[test]
    fn test_sampler_runs_until_stopped() {
        let history = Arc::new(MetricsHistory::new(100));
        let config = MetricsConfig { enabled: true, period_ms: 5, history: 100, csv_path: None };
        let mut sampler = MetricsSampler::spawn(&config, Arc::new(Fixed(vec![TopologyId::new("t")])), history.clone()).unwrap();

        thread::sleep(Duration::from_millis(100));
        sampler.stop();
        let taken = history.len();
        assert!(taken > 0);

        thread::sleep(Duration::from_millis(30));
        assert_eq!(history.len(), taken);
    }
}
