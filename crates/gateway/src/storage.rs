//! Persistence consumer that drains the shared buffer into a CSV data file
//!
//! Runs on a dedicated std::thread with its own cursor, independent of the
//! analyzer. Every line is flushed as soon as it is written.

use std::fs::{File, OpenOptions};
use std::io::{BufWriter, Write};
use std::path::{Path, PathBuf};
use std::thread;
use std::time::Duration;

use tracing::{debug, info};

use crate::buffer::{Cursor, SharedBuffer};
use crate::config::StorageConfig;
use crate::error::{GatewayError, StorageError};
use crate::event::{Event, EventKind, EventSender};
use crate::metrics;
use crate::reading::Reading;

/// Append-only `id,value,timestamp` file
pub struct DataFile {
    path: PathBuf,
    writer: BufWriter<File>,
}

impl DataFile {
    /// Create the file, truncating any previous run's data
    pub fn create(path: &Path) -> Result<Self, StorageError> {
        let file = OpenOptions::new()
            .create(true)
            .write(true)
            .truncate(true)
            .open(path)
            .map_err(|source| StorageError::Open {
                path: path.display().to_string(),
                source,
            })?;
        Ok(Self {
            path: path.to_path_buf(),
            writer: BufWriter::new(file),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Write one line and flush it out of the process
    pub fn append(&mut self, reading: &Reading) -> Result<(), StorageError> {
        writeln!(
            self.writer,
            "{},{:.6},{}",
            reading.sensor_id, reading.value, reading.timestamp
        )?;
        self.writer.flush()?;
        Ok(())
    }

    pub fn close(mut self) -> Result<(), StorageError> {
        self.writer.flush()?;
        self.writer.get_ref().sync_all()?;
        Ok(())
    }
}

/// Consumes the shared buffer and persists every reading
pub struct PersistenceConsumer {
    file: DataFile,
    events: EventSender,
    poll: Duration,
}

impl PersistenceConsumer {
    /// Open the data file and announce it on the event log
    pub fn open(config: &StorageConfig, events: EventSender) -> Result<Self, StorageError> {
        let file = DataFile::create(&config.data_file)?;
        info!(path = %file.path().display(), "Data file created");
        events.send(Event::bare(EventKind::NewDataFile));
        Ok(Self {
            file,
            events,
            poll: config.poll_interval(),
        })
    }

    /// Poll the buffer until the end-of-stream marker, then close the file.
    /// Returns the number of readings persisted.
    pub fn run(mut self, buffer: &SharedBuffer) -> Result<u64, GatewayError> {
        let mut cursor = Cursor::new();
        let mut written = 0u64;

        loop {
            let Some(reading) = buffer.read(&mut cursor)? else {
                // Buffer empty, sleep briefly to avoid busy-spin
                thread::sleep(self.poll);
                continue;
            };
            if reading.is_sentinel() {
                break;
            }

            self.file.append(&reading)?;
            written += 1;
            metrics::inc_readings_persisted();
            debug!(sensor_id = reading.sensor_id, "Reading persisted");
            self.events
                .send(Event::sensor(EventKind::DataInserted, reading.sensor_id));
        }

        self.file.close()?;
        self.events.send(Event::bare(EventKind::FileClosed));
        info!(written, "Data file closed");
        Ok(written)
    }
}
