use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::time::Duration;

/// Runtime settings of one topology on one node.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct TopologyConfig {
    /// Capacity of each bolt task's input queue.
    pub input_queue_capacity: usize,
    /// Capacity of each task's output buffer; a full buffer blocks the emitter.
    pub output_buffer_capacity: usize,
    pub dispatch_threads: usize,
    pub max_worker_threads: Option<usize>,
    /// Length of one tick period. Tick intervals are counted in these periods.
    pub tick_period_ms: u64,
    pub quiescence_poll_ms: u64,
    /// How long termination waits for every task to close before the
    /// remaining threads are stopped anyway.
    pub termination_timeout_ms: u64,
    /// Component errors tolerated before the topology is halted.
    pub error_threshold: Option<usize>,
    pub settings: BTreeMap<String, String>,
}

impl Default for TopologyConfig {
    fn default() -> Self {
        Self {
            input_queue_capacity: 1024,
            output_buffer_capacity: 1024,
            dispatch_threads: 2,
            max_worker_threads: None,
            tick_period_ms: 1000,
            quiescence_poll_ms: 1000,
            termination_timeout_ms: 60_000,
            error_threshold: None,
            settings: BTreeMap::new(),
        }
    }
}

impl TopologyConfig {
    pub fn tick_period(&self) -> Duration {
        Duration::from_millis(self.tick_period_ms.max(1))
    }

    pub fn quiescence_poll(&self) -> Duration {
        Duration::from_millis(self.quiescence_poll_ms.max(1))
    }

    pub fn termination_timeout(&self) -> Duration {
        Duration::from_millis(self.termination_timeout_ms)
    }

    pub fn setting(&self, key: &str) -> Option<&str> {
        self.settings.get(key).map(String::as_str)
    }
}

/// Per-submission changes layered over a node's default [`TopologyConfig`].
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct TopologyConfigOverrides {
    pub input_queue_capacity: Option<usize>,
    pub output_buffer_capacity: Option<usize>,
    pub dispatch_threads: Option<usize>,
    pub max_worker_threads: Option<usize>,
    pub tick_period_ms: Option<u64>,
    pub quiescence_poll_ms: Option<u64>,
    pub termination_timeout_ms: Option<u64>,
    pub error_threshold: Option<usize>,
    pub settings: BTreeMap<String, String>,
}

impl TopologyConfigOverrides {
    pub fn apply_to(&self, base: &TopologyConfig) -> TopologyConfig {
        let mut config = base.clone();
        if let Some(v) = self.input_queue_capacity {
            config.input_queue_capacity = v;
        }
        if let Some(v) = self.output_buffer_capacity {
            config.output_buffer_capacity = v;
        }
        if let Some(v) = self.dispatch_threads {
            config.dispatch_threads = v;
        }
        if self.max_worker_threads.is_some() {
            config.max_worker_threads = self.max_worker_threads;
        }
        if let Some(v) = self.tick_period_ms {
            config.tick_period_ms = v;
        }
        if let Some(v) = self.quiescence_poll_ms {
            config.quiescence_poll_ms = v;
        }
        if let Some(v) = self.termination_timeout_ms {
            config.termination_timeout_ms = v;
        }
        if self.error_threshold.is_some() {
            config.error_threshold = self.error_threshold;
        }
        config.settings.extend(self.settings.iter().map(|(k, v)| (k.clone(), v.clone())));
        config
    }
}

/// Settings a component declares about itself.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ComponentConfig {
    /// Deliver a tick tuple every this many tick periods.
    pub tick_interval_secs: Option<u64>,
    pub settings: BTreeMap<String, String>,
}

impl ComponentConfig {
    pub fn with_tick_interval(secs: u64) -> Self {
        Self { tick_interval_secs: Some(secs), settings: BTreeMap::new() }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_overrides_replace_only_given_fields() {
        let base = TopologyConfig { error_threshold: Some(5), ..TopologyConfig::default() };
        let overrides = TopologyConfigOverrides { input_queue_capacity: Some(8), settings: [("k".to_string(), "v".to_string())].into(), ..Default::default() };

        let merged = overrides.apply_to(&base);
        assert_eq!(merged.input_queue_capacity, 8);
        assert_eq!(merged.error_threshold, Some(5));
        assert_eq!(merged.output_buffer_capacity, base.output_buffer_capacity);
        assert_eq!(merged.setting("k"), Some("v"));
    }
}
