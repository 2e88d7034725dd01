//! Concurrency-limited FIFO for async work.
//!
//! [`AsyncQueue::add`] waits for a free slot, runs the task and returns its
//! output. Tasks start in the order they were added. [`AsyncQueue::clear`]
//! abandons every task that has not started yet; running tasks finish.

use parking_lot::Mutex;
use std::future::Future;
use thiserror::Error;
use tokio::sync::Semaphore;
use tracing::debug;

/// The task was dropped by [`AsyncQueue::clear`] before it started.
#[derive(Debug, Clone, Copy, Error, PartialEq, Eq)]
#[error("task was cleared from the queue before it started")]
pub struct QueueCleared;

#[derive(Debug, Default)]
struct Waiting {
    /// Bumped by `clear`; tasks queued under an older generation never run
    generation: u64,
    count: usize,
}

#[derive(Debug)]
pub struct AsyncQueue {
    permits: Semaphore,
    concurrency: usize,
    waiting: Mutex<Waiting>,
}

impl Default for AsyncQueue {
    fn default() -> Self {
        Self::new(1)
    }
}

impl AsyncQueue {
    /// A queue running at most `concurrency` tasks at once (at least one).
    pub fn new(concurrency: usize) -> Self {
        let concurrency = concurrency.max(1);
        Self {
            permits: Semaphore::new(concurrency),
            concurrency,
            waiting: Mutex::new(Waiting::default()),
        }
    }

    pub fn concurrency(&self) -> usize {
        self.concurrency
    }

    /// Tasks added but not yet started.
    pub fn len(&self) -> usize {
        self.waiting.lock().count
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Tasks currently running.
    pub fn active(&self) -> usize {
        self.concurrency - self.permits.available_permits()
    }

    /// Abandon every task that has not started.
    pub fn clear(&self) {
        let mut waiting = self.waiting.lock();
        debug!(abandoned = waiting.count, "clearing async queue");
        waiting.generation += 1;
        waiting.count = 0;
    }

    /// Queue `task` and wait for its output.
    pub async fn add<F, Fut, T>(&self, task: F) -> Result<T, QueueCleared>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = T>,
    {
        let ticket = Ticket::issue(&self.waiting);
        let permit = self.permits.acquire().await.map_err(|_| QueueCleared)?;
        if !ticket.redeem() {
            return Err(QueueCleared);
        }

        let output = task().await;
        drop(permit);
        Ok(output)
    }
}

/// A place in the waiting count, released when the task starts or is
/// dropped.
struct Ticket<'a> {
    waiting: &'a Mutex<Waiting>,
    generation: u64,
    counted: bool,
}

impl<'a> Ticket<'a> {
    fn issue(waiting: &'a Mutex<Waiting>) -> Self {
        let mut state = waiting.lock();
        state.count += 1;
        Self {
            waiting,
            generation: state.generation,
            counted: true,
        }
    }

    /// Leave the waiting count. False if the queue was cleared meanwhile.
    fn redeem(mut self) -> bool {
        self.counted = false;
        let mut state = self.waiting.lock();
        if state.generation != self.generation {
            return false;
        }
        state.count -= 1;
        true
    }
}

impl Drop for Ticket<'_> {
    fn drop(&mut self) {
        if !self.counted {
            return;
        }
        let mut state = self.waiting.lock();
        if state.generation == self.generation {
            state.count -= 1;
        }
    }
}
