pub mod csv_sink;
pub mod sampler;

pub use csv_sink::CsvSink;
pub use sampler::{MetricsConfig, MetricsHistory, MetricsSample, MetricsSampler, SnapshotSource};
