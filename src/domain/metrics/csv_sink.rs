use std::fs::File;
use std::io::{self, Write};
use std::sync::mpsc;
use std::thread::{self, JoinHandle};

use crate::domain::metrics::sampler::MetricsSample;
use crate::error::{Error, Result};

/// Columns of the metrics CSV, in output order.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MetricColumn {
    /// Milliseconds since the Unix epoch.
    Time,
    Topology,
    Component,
    Task,
    Kind,
    Emitted,
    Executed,
    Ticks,
    InputQueue,
    OutputBuffer,
    Errors,
    Closed,
}

impl MetricColumn {
    pub const ALL: [MetricColumn; 12] = [
        MetricColumn::Time,
        MetricColumn::Topology,
        MetricColumn::Component,
        MetricColumn::Task,
        MetricColumn::Kind,
        MetricColumn::Emitted,
        MetricColumn::Executed,
        MetricColumn::Ticks,
        MetricColumn::InputQueue,
        MetricColumn::OutputBuffer,
        MetricColumn::Errors,
        MetricColumn::Closed,
    ];

    pub fn header(&self) -> &'static str {
        match self {
            MetricColumn::Time => "Time",
            MetricColumn::Topology => "Topology",
            MetricColumn::Component => "Component",
            MetricColumn::Task => "Task",
            MetricColumn::Kind => "Kind",
            MetricColumn::Emitted => "Emitted",
            MetricColumn::Executed => "Executed",
            MetricColumn::Ticks => "Ticks",
            MetricColumn::InputQueue => "InputQueue",
            MetricColumn::OutputBuffer => "OutputBuffer",
            MetricColumn::Errors => "Errors",
            MetricColumn::Closed => "Closed",
        }
    }
}

/// One CSV row per task and sample.
pub fn rows(sample: &MetricsSample) -> Vec<Vec<String>> {
    sample
        .tasks
        .iter()
        .map(|task| {
            MetricColumn::ALL
                .iter()
                .map(|column| match column {
                    MetricColumn::Time => sample.timestamp_ms.to_string(),
                    MetricColumn::Topology => sample.topology_id.to_string(),
                    MetricColumn::Component => task.component.to_string(),
                    MetricColumn::Task => task.task.to_string(),
                    MetricColumn::Kind => format!("{:?}", task.kind),
                    MetricColumn::Emitted => task.emitted.to_string(),
                    MetricColumn::Executed => task.executed.to_string(),
                    MetricColumn::Ticks => task.ticks.to_string(),
                    MetricColumn::InputQueue => task.input_queue.to_string(),
                    MetricColumn::OutputBuffer => task.output_buffer.to_string(),
                    MetricColumn::Errors => task.errors.to_string(),
                    MetricColumn::Closed => task.closed.to_string(),
                })
                .collect()
        })
        .collect()
}

enum CsvMessage {
    Sample(MetricsSample),
    Flush,
    Shutdown,
}

/// Writes samples from a background thread so the sampler never waits on
/// disk.
pub struct CsvSink {
    sender: mpsc::Sender<CsvMessage>,
    writer: Option<JoinHandle<()>>,
}

impl CsvSink {
    /// Writes to `path`, or to stdout when `None`.
    pub fn open(path: Option<&str>) -> Result<Self> {
        let output: Box<dyn Write + Send> = match path {
            Some(path) => Box::new(File::create(path)?),
            None => Box::new(io::stdout()),
        };

        let (tx, rx) = mpsc::channel();
        let name = "metrics-csv".to_string();
        let writer = thread::Builder::new().name(name.clone()).spawn(move || writer_loop(rx, output)).map_err(|source| Error::ThreadSpawnError { name, source })?;

        Ok(Self { sender: tx, writer: Some(writer) })
    }

    pub fn write(&self, sample: MetricsSample) {
        let _ = self.sender.send(CsvMessage::Sample(sample));
    }

    pub fn flush(&self) {
        let _ = self.sender.send(CsvMessage::Flush);
    }

    /// Flushes and stops the writer thread.
    pub fn close(&mut self) {
        let _ = self.sender.send(CsvMessage::Shutdown);
        if let Some(writer) = self.writer.take() {
            if writer.join().is_err() {
                log::warn!("Metrics CSV writer panicked");
            }
        }
    }
}

impl Drop for CsvSink {
    fn drop(&mut self) {
        self.close();
    }
}

fn writer_loop(rx: mpsc::Receiver<CsvMessage>, output: Box<dyn Write + Send>) {
    let mut csv_wtr = csv::WriterBuilder::new().delimiter(b';').from_writer(output);

    let headers: Vec<&str> = MetricColumn::ALL.iter().map(MetricColumn::header).collect();
    if let Err(e) = csv_wtr.write_record(&headers) {
        log::error!("Metrics CSV: failed to write headers: {}", e);
    }

    for message in rx {
        match message {
            CsvMessage::Sample(sample) => {
                for row in rows(&sample) {
                    if let Err(e) = csv_wtr.write_record(&row) {
                        log::error!("Metrics CSV: failed to write record: {}", e);
                    }
                }
            }
            CsvMessage::Flush => {
                let _ = csv_wtr.flush();
            }
            CsvMessage::Shutdown => break,
        }
    }
    let _ = csv_wtr.flush();
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::cluster::TaskSnapshot;
    use crate::domain::topology::ComponentKind;
    use crate::domain::utils::id::{ComponentId, TopologyId};

    fn sample() -> MetricsSample {
        let task = TaskSnapshot {
            component: ComponentId::new("counter"),
            task: 1,
            kind: ComponentKind::Bolt,
            emitted: 3,
            executed: 7,
            ticks: 2,
            input_queue: 0,
            output_buffer: 1,
            errors: 0,
            closed: false,
        };
        MetricsSample { timestamp_ms: 42, topology_id: TopologyId::new("wc"), tasks: vec![task] }
    }

    #[test]
    fn test_rows_follow_column_order() {
        let rows = rows(&sample());
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0].len(), MetricColumn::ALL.len());
        assert_eq!(rows[0][..6], ["42", "wc", "counter", "1", "Bolt", "3"]);
    }

    #[test]
    fn test_sink_writes_header_and_rows() {
        let path = std::env::temp_dir().join(format!("stream_node_metrics_{}.csv", std::process::id()));
        let path_str = path.to_string_lossy().to_string();

        let mut sink = CsvSink::open(Some(&path_str)).unwrap();
        sink.write(sample());
        sink.close();

        let written = std::fs::read_to_string(&path).unwrap();
        let lines: Vec<&str> = written.lines().collect();
        assert_eq!(lines.len(), 2);
        assert!(lines[0].starts_with("Time;Topology;Component"));
        assert!(lines[1].starts_with("42;wc;counter;1;Bolt"));
        let _ = std::fs::remove_file(path);
    }
}
