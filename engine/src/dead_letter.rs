//! Bounded store of work that failed permanently.

use crate::clock::{Clock, SystemClock};
use crate::error::Result;
use crate::Timestamp;
use parking_lot::Mutex;
use serde::Serialize;
use std::collections::VecDeque;

/// One failed unit of work.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct DeadLetter<T> {
    pub data: T,
    pub error: String,
    pub timestamp: Timestamp,
}

/// FIFO queue that keeps at most `max_size` entries, dropping the oldest.
///
/// Entries added with [`add`](Self::add) are stamped from the queue's clock.
#[derive(Debug)]
pub struct DeadLetterQueue<T, C: Clock = SystemClock> {
    entries: Mutex<VecDeque<DeadLetter<T>>>,
    max_size: usize,
    clock: C,
}

impl<T> Default for DeadLetterQueue<T> {
    fn default() -> Self {
        Self::new(100)
    }
}

impl<T> DeadLetterQueue<T> {
    pub fn new(max_size: usize) -> Self {
        Self::with_clock(max_size, SystemClock)
    }
}

impl<T, C: Clock> DeadLetterQueue<T, C> {
    pub fn with_clock(max_size: usize, clock: C) -> Self {
        Self {
            entries: Mutex::new(VecDeque::new()),
            max_size: max_size.max(1),
            clock,
        }
    }

    pub fn add(&self, data: T, error: impl ToString) {
        self.push(DeadLetter {
            data,
            error: error.to_string(),
            timestamp: self.clock.now_millis(),
        });
    }

    pub fn push(&self, letter: DeadLetter<T>) {
        let mut entries = self.entries.lock();
        if entries.len() >= self.max_size {
            entries.pop_front();
        }
        tracing::warn!(error = %letter.error, "moved failed work to dead-letter queue");
        entries.push_back(letter);
    }

    pub fn len(&self) -> usize {
        self.entries.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.lock().is_empty()
    }

    pub fn clear(&self) {
        self.entries.lock().clear();
    }

    pub fn max_size(&self) -> usize {
        self.max_size
    }
}

impl<T: Clone, C: Clock> DeadLetterQueue<T, C> {
    /// Snapshot of the queue, oldest first.
    pub fn entries(&self) -> Vec<DeadLetter<T>> {
        self.entries.lock().iter().cloned().collect()
    }
}

impl<T: Serialize, C: Clock> DeadLetterQueue<T, C> {
    /// Pretty-printed JSON array of every entry.
    pub fn export(&self) -> Result<String> {
        let entries = self.entries.lock();
        let items: Vec<&DeadLetter<T>> = entries.iter().collect();
        Ok(serde_json::to_string_pretty(&items)?)
    }
}
