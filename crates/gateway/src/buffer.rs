//! Append-only shared buffer with independent reader cursors
//!
//! Many producers insert readings, any number of consumers read them through
//! their own cursor. Reads never remove entries, so consumers with different
//! rates proceed independently. Entries are released only by `teardown`.

use std::sync::{PoisonError, RwLock};

use crate::error::BufferError;
use crate::reading::Reading;

/// Per-consumer read position.
/// A fresh cursor starts at the head of the buffer.
#[derive(Debug, Default, Clone)]
pub struct Cursor {
    next: usize,
}

impl Cursor {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of entries consumed through this cursor
    pub fn position(&self) -> usize {
        self.next
    }
}

struct Inner {
    entries: Vec<Reading>,
    terminated: bool,
    torn_down: bool,
}

/// Unbounded multi-cursor log of readings
pub struct SharedBuffer {
    inner: RwLock<Inner>,
}

impl SharedBuffer {
    pub fn new() -> Self {
        tracing::debug!("Shared buffer initialized");
        Self {
            inner: RwLock::new(Inner {
                entries: Vec::new(),
                terminated: false,
                torn_down: false,
            }),
        }
    }

    /// Producer: append a reading to the tail
    pub fn insert(&self, reading: Reading) -> Result<(), BufferError> {
        if reading.is_sentinel() {
            return Err(BufferError::ReservedSensorId);
        }
        self.push(reading)
    }

    /// Append the end-of-stream marker. Must happen exactly once per run.
    pub fn insert_sentinel(&self) -> Result<(), BufferError> {
        self.push(Reading::SENTINEL)
    }

    fn push(&self, reading: Reading) -> Result<(), BufferError> {
        // Entries are never mutated after insertion, so a poisoned lock still guards valid data
        let mut inner = self.inner.write().unwrap_or_else(PoisonError::into_inner);
        if inner.torn_down {
            return Err(BufferError::TornDown);
        }
        if inner.terminated {
            return Err(BufferError::AlreadyTerminated);
        }
        inner.entries.push(reading);
        if reading.is_sentinel() {
            inner.terminated = true;
        }
        Ok(())
    }

    /// Consumer: return the next unread reading and advance the cursor.
    /// Returns `Ok(None)` when the cursor has caught up with the tail.
    ///
    /// The read guard covers one index lookup and a copy, never I/O or a
    /// sleep, so a producer waits at most that long. std's `RwLock` queues
    /// new readers behind a waiting writer, so polling consumers cannot
    /// starve `insert`.
    #[inline]
    pub fn read(&self, cursor: &mut Cursor) -> Result<Option<Reading>, BufferError> {
        let inner = self.inner.read().unwrap_or_else(PoisonError::into_inner);
        if inner.torn_down {
            return Err(BufferError::TornDown);
        }
        match inner.entries.get(cursor.next) {
            Some(reading) => {
                cursor.next += 1;
                Ok(Some(*reading))
            }
            None => Ok(None),
        }
    }

    /// Number of entries currently held (including the marker once inserted)
    pub fn len(&self) -> usize {
        self.inner
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .entries
            .len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Whether the end-of-stream marker has been inserted
    pub fn is_terminated(&self) -> bool {
        self.inner
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .terminated
    }

    /// Release every entry. Only valid once the marker is in the buffer and all
    /// consumers have observed it. Returns the number of entries released.
    pub fn teardown(&self) -> Result<usize, BufferError> {
        let mut inner = self.inner.write().unwrap_or_else(PoisonError::into_inner);
        if inner.torn_down {
            return Err(BufferError::TornDown);
        }
        if !inner.terminated {
            return Err(BufferError::NotTerminated);
        }
        let released = std::mem::take(&mut inner.entries).len();
        inner.torn_down = true;
        tracing::debug!(released, "Shared buffer torn down");
        Ok(released)
    }
}

impl Default for SharedBuffer {
    fn default() -> Self {
        Self::new()
    }
}
