//! Bounded circular log of frames exchanged with one controller.
//!
//! Kept for the diagnostics readout.  When the log is full the oldest entry is
//! evicted; sequence numbers keep increasing so a reader can tell how many
//! entries were lost between two readouts.

use std::collections::VecDeque;

use serde::{Deserialize, Serialize};

/// Default number of entries retained per controller.
pub const DEFAULT_LOG_CAPACITY: usize = 50;

/// Which way a frame travelled.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Direction {
    Tx,
    Rx,
}

/// One logged frame.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LogEntry {
    pub seq: u64,
    pub timestamp_ms: u64,
    pub direction: Direction,
    /// Frame text without the terminator.
    pub payload: String,
}

#[derive(Debug, Clone)]
pub struct FrameLog {
    capacity: usize,
    next_seq: u64,
    entries: VecDeque<LogEntry>,
}

impl FrameLog {
    /// Creates an empty log.  A capacity of zero is raised to one.
    pub fn new(capacity: usize) -> Self {
        let capacity = capacity.max(1);
        Self {
            capacity,
            next_seq: 0,
            entries: VecDeque::with_capacity(capacity),
        }
    }

    pub fn push(&mut self, direction: Direction, payload: impl Into<String>, timestamp_ms: u64) {
        if self.entries.len() == self.capacity {
            self.entries.pop_front();
        }
        self.entries.push_back(LogEntry {
            seq: self.next_seq,
            timestamp_ms,
            direction,
            payload: payload.into(),
        });
        self.next_seq = self.next_seq.wrapping_add(1);
    }

    /// Oldest-first copy of the retained entries.
    pub fn entries(&self) -> Vec<LogEntry> {
        self.entries.iter().cloned().collect()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }
}

impl Default for FrameLog {
    fn default() -> Self {
        Self::new(DEFAULT_LOG_CAPACITY)
    }
}
