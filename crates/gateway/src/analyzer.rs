//! Running-average analyzer
//!
//! Keeps a fixed-length, most-recent-first window per mapped sensor and reports
//! averages outside the configured temperature band.

use std::collections::VecDeque;
use std::thread;

use tracing::{debug, info};

use crate::buffer::{Cursor, SharedBuffer};
use crate::config::AnalyzerConfig;
use crate::error::GatewayError;
use crate::event::{Event, EventKind, EventSender};
use crate::reading::Reading;
use crate::sensor_map::SensorMapping;

/// Rolling window for one sensor
#[derive(Debug, Clone, PartialEq)]
pub struct SensorRecord {
    pub sensor_id: u16,
    pub room_id: u32,
    /// Most recent value first; always exactly `window_length` entries
    history: VecDeque<f64>,
    /// Timestamp of the last reading applied, 0 until the first one
    pub last_modified: i64,
}

impl SensorRecord {
    pub fn new(mapping: SensorMapping, window_length: usize, seed: f64) -> Self {
        Self {
            sensor_id: mapping.sensor_id,
            room_id: mapping.room_id,
            history: std::iter::repeat(seed).take(window_length).collect(),
            last_modified: 0,
        }
    }

    /// Push a value to the front, discarding the oldest
    pub fn push(&mut self, value: f64, timestamp: i64) {
        self.history.pop_back();
        self.history.push_front(value);
        self.last_modified = timestamp;
    }

    /// Arithmetic mean over the full window
    pub fn average(&self) -> f64 {
        self.history.iter().sum::<f64>() / self.history.len() as f64
    }

    pub fn history(&self) -> impl Iterator<Item = f64> + '_ {
        self.history.iter().copied()
    }
}

/// Consumes the shared buffer through its own cursor
pub struct DataAnalyzer {
    records: Vec<SensorRecord>,
    config: AnalyzerConfig,
    events: EventSender,
}

impl DataAnalyzer {
    /// One record per mapping entry, every window seeded halfway between the bounds
    pub fn new(mappings: &[SensorMapping], config: AnalyzerConfig, events: EventSender) -> Self {
        let seed = config.seed_value();
        let records = mappings
            .iter()
            .map(|m| SensorRecord::new(*m, config.window_length, seed))
            .collect();
        Self {
            records,
            config,
            events,
        }
    }

    pub fn records(&self) -> &[SensorRecord] {
        &self.records
    }

    /// Apply one non-marker reading. Returns the event emitted, if any.
    pub fn process(&mut self, reading: &Reading) -> Option<Event> {
        let Some(record) = self
            .records
            .iter_mut()
            .find(|r| r.sensor_id == reading.sensor_id)
        else {
            debug!(sensor_id = reading.sensor_id, "Sensor not in map");
            let event = Event::sensor(EventKind::InvalidId, reading.sensor_id);
            self.events.send(event);
            return Some(event);
        };

        record.push(reading.value, reading.timestamp);
        let avg = record.average();

        let kind = if avg > self.config.max_temperature {
            EventKind::TooHot
        } else if avg < self.config.min_temperature {
            EventKind::TooCold
        } else {
            return None;
        };

        debug!(sensor_id = reading.sensor_id, avg, kind = kind.as_str(), "Average out of range");
        let event = Event::new(kind, reading.sensor_id, avg);
        self.events.send(event);
        Some(event)
    }

    /// Poll the buffer until the end-of-stream marker. Returns the number of
    /// readings processed; the record table is dropped on return.
    pub fn run(mut self, buffer: &SharedBuffer) -> Result<u64, GatewayError> {
        info!(sensors = self.records.len(), "Data analyzer started");
        let poll = self.config.poll_interval();
        let mut cursor = Cursor::new();
        let mut processed = 0u64;

        loop {
            let Some(reading) = buffer.read(&mut cursor)? else {
                thread::sleep(poll);
                continue;
            };
            if reading.is_sentinel() {
                break;
            }
            self.process(&reading);
            processed += 1;
        }

        info!(processed, "Data analyzer reached end of stream");
        Ok(processed)
    }
}
