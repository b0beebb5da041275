use std::collections::HashMap;
use std::fs::File;
use std::io::Write;
use std::sync::{Arc, Mutex, mpsc};
use std::thread::{self, JoinHandle};
use std::time::{SystemTime, UNIX_EPOCH};

use serde::Serialize;

/// Each event consists of a set of key-value-pairs. This enum specifies all
/// allowed keys and thus the columns of the output file.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
pub enum StatParameter {
    /// Milliseconds since the collector was created.
    Time,
    LogDescription,

    /// "MASTER" or "WORKER"
    ComponentType,
    ComponentName,

    WorkflowCode,
    WorkflowInstance,
    WorkflowState,
    /// Number of task instances the workflow created.
    NumberOfTasks,
    FailedNode,

    TaskCode,
    TaskInstance,
    TaskState,
    Attempt,
    WorkerHost,

    /// Wall time between start and end in ms.
    Duration,
}

impl StatParameter {
    pub const ALL: [StatParameter; 15] = [
        StatParameter::Time,
        StatParameter::LogDescription,
        StatParameter::ComponentType,
        StatParameter::ComponentName,
        StatParameter::WorkflowCode,
        StatParameter::WorkflowInstance,
        StatParameter::WorkflowState,
        StatParameter::NumberOfTasks,
        StatParameter::FailedNode,
        StatParameter::TaskCode,
        StatParameter::TaskInstance,
        StatParameter::TaskState,
        StatParameter::Attempt,
        StatParameter::WorkerHost,
        StatParameter::Duration,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            StatParameter::Time => "Time",
            StatParameter::LogDescription => "LogDescription",
            StatParameter::ComponentType => "ComponentType",
            StatParameter::ComponentName => "ComponentName",
            StatParameter::WorkflowCode => "WorkflowCode",
            StatParameter::WorkflowInstance => "WorkflowInstance",
            StatParameter::WorkflowState => "WorkflowState",
            StatParameter::NumberOfTasks => "NumberOfTasks",
            StatParameter::FailedNode => "FailedNode",
            StatParameter::TaskCode => "TaskCode",
            StatParameter::TaskInstance => "TaskInstance",
            StatParameter::TaskState => "TaskState",
            StatParameter::Attempt => "Attempt",
            StatParameter::WorkerHost => "WorkerHost",
            StatParameter::Duration => "Duration",
        }
    }

    /// Column order of the CSV header.
    pub fn headers() -> Vec<&'static str> {
        Self::ALL.iter().map(|p| p.as_str()).collect()
    }
}

/// Values are kept in their native format and only formatted when written.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(untagged)]
pub enum StatValue {
    Integer(i64),
    Float(f64),
    Text(String),
    Bool(bool),
}

impl From<i64> for StatValue {
    fn from(v: i64) -> Self {
        StatValue::Integer(v)
    }
}

impl From<u32> for StatValue {
    fn from(v: u32) -> Self {
        StatValue::Integer(v as i64)
    }
}

impl From<usize> for StatValue {
    fn from(v: usize) -> Self {
        StatValue::Integer(v as i64)
    }
}

impl From<f64> for StatValue {
    fn from(v: f64) -> Self {
        StatValue::Float(v)
    }
}

impl From<String> for StatValue {
    fn from(v: String) -> Self {
        StatValue::Text(v)
    }
}

impl From<&str> for StatValue {
    fn from(v: &str) -> Self {
        StatValue::Text(v.to_string())
    }
}

impl From<bool> for StatValue {
    fn from(v: bool) -> Self {
        StatValue::Bool(v)
    }
}

impl StatValue {
    fn render(&self) -> String {
        match self {
            StatValue::Text(t) => t.clone(),
            StatValue::Integer(i) => i.to_string(),
            StatValue::Float(f) => f.to_string(),
            StatValue::Bool(b) => b.to_string(),
        }
    }
}

#[derive(Debug, Clone, Default)]
pub struct StatisticEvent {
    data: HashMap<StatParameter, StatValue>,
}

impl StatisticEvent {
    pub fn new(description: &str) -> Self {
        let mut event = Self::default();
        event.set(StatParameter::LogDescription, description);
        event
    }

    pub fn set<V: Into<StatValue>>(&mut self, param: StatParameter, value: V) -> &mut Self {
        self.data.insert(param, value.into());
        self
    }

    pub fn get(&self, param: StatParameter) -> Option<&StatValue> {
        self.data.get(&param)
    }

    fn to_row(&self) -> Vec<String> {
        StatParameter::ALL.iter().map(|p| self.data.get(p).map(StatValue::render).unwrap_or_else(|| "NA".to_string())).collect()
    }
}

enum StatsMessage {
    Log(StatisticEvent),
    Flush,
    Shutdown,
}

fn now_ms() -> i64 {
    SystemTime::now().duration_since(UNIX_EPOCH).map(|d| d.as_millis() as i64).unwrap_or(0)
}

/// Handle used by the engine to record audit events. Rows are written by a
/// background thread as `;` separated CSV. A disabled collector drops events.
#[derive(Debug, Clone)]
pub struct StatsCollector {
    sender: Option<mpsc::Sender<StatsMessage>>,
    writer_thread: Arc<Mutex<Option<JoinHandle<()>>>>,
    start_time: i64,
}

impl StatsCollector {
    pub fn disabled() -> Self {
        Self { sender: None, writer_thread: Arc::new(Mutex::new(None)), start_time: now_ms() }
    }

    pub fn to_file(path: &str) -> std::io::Result<Self> {
        let file = File::create(path)?;
        Ok(Self::to_writer(Box::new(file)))
    }

    /// Spawns the background thread that owns the writer.
    pub fn to_writer(writer: Box<dyn Write + Send>) -> Self {
        let (tx, rx) = mpsc::channel();
        let handle = thread::Builder::new().name("stats-writer".to_string()).spawn(move || Self::worker_loop(rx, writer));

        match handle {
            Ok(handle) => Self { sender: Some(tx), writer_thread: Arc::new(Mutex::new(Some(handle))), start_time: now_ms() },
            Err(e) => {
                log::error!("Failed to spawn statistics writer, statistics disabled: {}", e);
                Self::disabled()
            }
        }
    }

    pub fn is_enabled(&self) -> bool {
        self.sender.is_some()
    }

    fn worker_loop(rx: mpsc::Receiver<StatsMessage>, writer: Box<dyn Write + Send>) {
        let mut csv_wtr = csv::WriterBuilder::new().delimiter(b';').from_writer(writer);

        if let Err(e) = csv_wtr.write_record(StatParameter::headers()) {
            log::error!("Stats Error: Failed to write headers: {}", e);
        }

        for msg in rx {
            match msg {
                StatsMessage::Log(event) => {
                    if let Err(e) = csv_wtr.write_record(event.to_row()) {
                        log::error!("Stats Error: Failed to write record: {}", e);
                    }
                }
                StatsMessage::Flush => {
                    let _ = csv_wtr.flush();
                }
                StatsMessage::Shutdown => break,
            }
        }
        let _ = csv_wtr.flush();
    }

    /// Non-blocking. Injects the relative time if the event has none.
    pub fn add_event(&self, mut event: StatisticEvent) {
        let Some(sender) = &self.sender else {
            return;
        };
        if event.get(StatParameter::Time).is_none() {
            event.set(StatParameter::Time, now_ms().saturating_sub(self.start_time));
        }
        let _ = sender.send(StatsMessage::Log(event));
    }

    pub fn flush(&self) {
        if let Some(sender) = &self.sender {
            let _ = sender.send(StatsMessage::Flush);
        }
    }

    /// Stops the writer thread after all queued events are written.
    pub fn close(&self) {
        if let Some(sender) = &self.sender {
            let _ = sender.send(StatsMessage::Shutdown);
        }
        let handle = self.writer_thread.lock().expect("Mutex poisoned").take();
        if let Some(handle) = handle {
            let _ = handle.join();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[derive(Clone, Default)]
    struct SharedBuffer(Arc<Mutex<Vec<u8>>>);

    impl Write for SharedBuffer {
        fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
            self.0.lock().unwrap().extend_from_slice(buf);
            Ok(buf.len())
        }

        fn flush(&mut self) -> std::io::Result<()> {
            Ok(())
        }
    }

    #[test]
    fn writes_header_and_rows_in_column_order() {
        let buffer = SharedBuffer::default();
        let collector = StatsCollector::to_writer(Box::new(buffer.clone()));

        let mut event = StatisticEvent::new("TaskFinished");
        event.set(StatParameter::Time, 5i64).set(StatParameter::TaskCode, "extract").set(StatParameter::Attempt, 2u32);
        collector.add_event(event);
        collector.close();

        let output = String::from_utf8(buffer.0.lock().unwrap().clone()).unwrap();
        let lines: Vec<&str> = output.lines().collect();
        assert_eq!(lines[0], StatParameter::headers().join(";"));
        assert_eq!(lines[1], "5;TaskFinished;NA;NA;NA;NA;NA;NA;NA;extract;NA;NA;2;NA;NA");
    }

    #[test]
    fn disabled_collector_drops_events() {
        let collector = StatsCollector::disabled();
        collector.add_event(StatisticEvent::new("ignored"));
        collector.close();
        assert!(!collector.is_enabled());
    }
}
