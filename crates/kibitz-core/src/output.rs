//! Bounded append-only output log with per-reader cursors.
//!
//! Every line the engine emits is appended here. The log keeps at most
//! `capacity` lines; the oldest are evicted first. Indices are absolute and
//! monotonically increasing across eviction, so each consumer (protocol
//! client, analysis session) tracks its own read cursor and processes only
//! the newly appended slice. A cursor that has fallen behind the retained
//! window resumes from the oldest retained line, accepting the gap.

use std::collections::VecDeque;

/// Append-only line log with a bounded retention window.
#[derive(Debug)]
pub struct OutputLog {
    capacity: usize,
    /// Absolute index of `lines[0]`.
    base: u64,
    lines: VecDeque<String>,
}

impl OutputLog {
    pub fn new(capacity: usize) -> Self {
        Self {
            capacity: capacity.max(1),
            base: 0,
            lines: VecDeque::new(),
        }
    }

    /// Append a line, evicting the oldest when the window is full.
    pub fn push(&mut self, line: String) {
        if self.lines.len() == self.capacity {
            self.lines.pop_front();
            self.base += 1;
        }
        self.lines.push_back(line);
    }

    /// Absolute index one past the newest line.
    pub fn end_index(&self) -> u64 {
        self.base + self.lines.len() as u64
    }

    /// Read every retained line at or after `cursor`, in delivery order.
    ///
    /// Returns the clamped lines and the cursor to use for the next read.
    /// A cursor below the retained window is clamped to the oldest retained
    /// line; a cursor at or past the end returns an empty slice.
    pub fn read_from(&self, cursor: u64) -> (Vec<String>, u64) {
        let start = cursor.max(self.base);
        let end = self.end_index();
        if start >= end {
            return (Vec::new(), end);
        }
        let offset = (start - self.base) as usize;
        let lines = self.lines.iter().skip(offset).cloned().collect();
        (lines, end)
    }

    /// Drop all retained lines. Absolute indices keep advancing, so existing
    /// cursors stay valid across a worker restart.
    pub fn clear(&mut self) {
        self.base = self.end_index();
        self.lines.clear();
    }
}
