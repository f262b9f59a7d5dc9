//! Event channel and the isolated event logger
//!
//! Producers hold a cloneable `EventSender` and push fixed-size byte records
//! through an unbounded channel. The logger thread owns the receiving end and
//! the log file; it never shares memory with producers. The log closes once
//! every sender has been dropped.

use std::fs::{File, OpenOptions};
use std::io::{BufWriter, Write};
use std::path::Path;
use std::thread::JoinHandle;

use bytemuck::{Pod, Zeroable};
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use crate::error::GatewayError;
use crate::metrics;

/// Size of one record on the event channel
pub const EVENT_RECORD_SIZE: usize = std::mem::size_of::<EventRecord>();

type RawRecord = [u8; EVENT_RECORD_SIZE];

/// Kinds of events routed to the event log
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum EventKind {
    NewConnection,
    ClosedConnection,
    TooCold,
    TooHot,
    InvalidId,
    NewDataFile,
    DataInserted,
    FileClosed,
    Timeout,
}

impl EventKind {
    fn code(self) -> u32 {
        match self {
            EventKind::NewConnection => 0,
            EventKind::ClosedConnection => 1,
            EventKind::TooCold => 2,
            EventKind::TooHot => 3,
            EventKind::InvalidId => 4,
            EventKind::NewDataFile => 5,
            EventKind::DataInserted => 6,
            EventKind::FileClosed => 7,
            EventKind::Timeout => 8,
        }
    }

    fn from_code(code: u32) -> Option<Self> {
        Some(match code {
            0 => EventKind::NewConnection,
            1 => EventKind::ClosedConnection,
            2 => EventKind::TooCold,
            3 => EventKind::TooHot,
            4 => EventKind::InvalidId,
            5 => EventKind::NewDataFile,
            6 => EventKind::DataInserted,
            7 => EventKind::FileClosed,
            8 => EventKind::Timeout,
            _ => return None,
        })
    }

    /// Label used for metrics
    pub fn as_str(self) -> &'static str {
        match self {
            EventKind::NewConnection => "new_connection",
            EventKind::ClosedConnection => "closed_connection",
            EventKind::TooCold => "too_cold",
            EventKind::TooHot => "too_hot",
            EventKind::InvalidId => "invalid_id",
            EventKind::NewDataFile => "new_data_file",
            EventKind::DataInserted => "data_inserted",
            EventKind::FileClosed => "file_closed",
            EventKind::Timeout => "timeout",
        }
    }
}

/// Structured notification for the event log
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Event {
    pub kind: EventKind,
    /// 0 when the event is not tied to a sensor
    pub sensor_id: u16,
    /// Running average for TooHot/TooCold, 0.0 otherwise
    pub value: f64,
}

impl Event {
    pub fn new(kind: EventKind, sensor_id: u16, value: f64) -> Self {
        Self {
            kind,
            sensor_id,
            value,
        }
    }

    pub fn sensor(kind: EventKind, sensor_id: u16) -> Self {
        Self::new(kind, sensor_id, 0.0)
    }

    pub fn bare(kind: EventKind) -> Self {
        Self::new(kind, 0, 0.0)
    }

    fn to_record(self) -> RawRecord {
        let record = EventRecord {
            code: self.kind.code(),
            sensor_id: u32::from(self.sensor_id),
            value: self.value,
        };
        let mut raw = [0u8; EVENT_RECORD_SIZE];
        raw.copy_from_slice(bytemuck::bytes_of(&record));
        raw
    }

    fn from_record(raw: &RawRecord) -> Option<Self> {
        let record: EventRecord = bytemuck::pod_read_unaligned(raw);
        let kind = EventKind::from_code(record.code)?;
        Some(Self::new(kind, record.sensor_id as u16, record.value))
    }
}

/// Fixed-size layout of an event on the channel
#[derive(Clone, Copy, Pod, Zeroable)]
#[repr(C)]
struct EventRecord {
    code: u32,
    sensor_id: u32,
    value: f64,
}

/// Writing side of the event channel. Cheap to clone, never blocks.
#[derive(Clone)]
pub struct EventSender {
    tx: mpsc::UnboundedSender<RawRecord>,
}

impl EventSender {
    /// Queue an event for the logger. A dead logger is reported but never
    /// propagated to the producer.
    pub fn send(&self, event: Event) {
        metrics::inc_event(event.kind);
        if self.tx.send(event.to_record()).is_err() {
            warn!(kind = event.kind.as_str(), sensor_id = event.sensor_id, "Event logger is gone, event dropped");
        }
    }
}

/// Reading side of the event channel
pub struct EventReceiver {
    rx: mpsc::UnboundedReceiver<RawRecord>,
}

impl EventReceiver {
    /// Block until the next event arrives, or return `None` once every sender is dropped.
    /// Must not be called from inside an async runtime.
    pub fn blocking_recv(&mut self) -> Option<Event> {
        loop {
            let raw = self.rx.blocking_recv()?;
            match Event::from_record(&raw) {
                Some(event) => return Some(event),
                None => warn!("Discarding event record with unknown code"),
            }
        }
    }

    /// Non-blocking receive; `None` when nothing is queued
    pub fn try_recv(&mut self) -> Option<Event> {
        while let Ok(raw) = self.rx.try_recv() {
            if let Some(event) = Event::from_record(&raw) {
                return Some(event);
            }
        }
        None
    }
}

/// Create a connected sender/receiver pair
pub fn channel() -> (EventSender, EventReceiver) {
    let (tx, rx) = mpsc::unbounded_channel();
    (EventSender { tx }, EventReceiver { rx })
}

/// Drains the event channel into a sequenced, timestamped log file
pub struct EventLogger {
    rx: EventReceiver,
    writer: BufWriter<File>,
    /// Name of the storage file, used in file lifecycle lines
    data_file_name: String,
    sequence: u64,
}

impl EventLogger {
    /// Create (truncate) the log file and attach it to a receiver
    pub fn open(
        path: &Path,
        data_file_name: impl Into<String>,
        rx: EventReceiver,
    ) -> Result<Self, GatewayError> {
        let file = OpenOptions::new()
            .create(true)
            .write(true)
            .truncate(true)
            .open(path)
            .map_err(GatewayError::EventLog)?;
        info!(path = %path.display(), "Event log created");
        Ok(Self {
            rx,
            writer: BufWriter::new(file),
            data_file_name: data_file_name.into(),
            sequence: 0,
        })
    }

    /// Open the log and run it on a dedicated thread.
    /// Returns the sender for producers and the logger's join handle.
    pub fn spawn(
        path: &Path,
        data_file_name: impl Into<String>,
    ) -> Result<(EventSender, JoinHandle<Result<u64, GatewayError>>), GatewayError> {
        let (tx, rx) = channel();
        let logger = Self::open(path, data_file_name, rx)?;
        let handle = std::thread::Builder::new()
            .name("event-logger".to_string())
            .spawn(move || logger.run())
            .map_err(|e| GatewayError::Spawn("event logger", e))?;
        Ok((tx, handle))
    }

    /// Drain events until every sender is gone. Returns the number of lines written.
    pub fn run(mut self) -> Result<u64, GatewayError> {
        while let Some(event) = self.rx.blocking_recv() {
            self.sequence += 1;
            let received_at = chrono::Utc::now().timestamp();
            let line = self.render(&event);
            writeln!(self.writer, "{} {} {}", self.sequence, received_at, line)
                .and_then(|_| self.writer.flush())
                .map_err(GatewayError::EventLog)?;
        }

        self.writer.flush().map_err(GatewayError::EventLog)?;
        debug!(events = self.sequence, "Event channel closed, log file closed");
        Ok(self.sequence)
    }

    fn render(&self, event: &Event) -> String {
        let id = event.sensor_id;
        match event.kind {
            EventKind::NewConnection => format!("Sensor node {} has opened a new connection.", id),
            EventKind::ClosedConnection => format!("Sensor node {} has closed the connection.", id),
            EventKind::Timeout => format!("Sensor node {} has timed-out.", id),
            EventKind::TooCold => format!(
                "Sensor node {} reports it's too cold (avg temp = {:.6}).",
                id, event.value
            ),
            EventKind::TooHot => format!(
                "Sensor node {} reports it's too hot (avg temp = {:.6}).",
                id, event.value
            ),
            EventKind::InvalidId => format!("Received sensor data with invalid sensor node ID {}.", id),
            EventKind::NewDataFile => format!("A new {} file has been created.", self.data_file_name),
            EventKind::DataInserted => format!("Data insertion from sensor {} succeeded.", id),
            EventKind::FileClosed => format!("The {} file has been closed.", self.data_file_name),
        }
    }
}
