//! Bulk operations with bounded concurrency and partial-failure accounting.
//!
//! [`BatchExecutor`] walks the input in chunks of `batch_size`. Inside a chunk
//! it starts `parallelism` operations at a time and waits for that whole group
//! before starting the next one. A failing item never aborts the run; it is
//! recorded with its absolute index in the input.

use crate::dead_letter::DeadLetterQueue;
use crate::error::{Error, Result};
use crate::record::Record;
use futures::future::BoxFuture;
use futures::stream::{FuturesUnordered, StreamExt};
use parking_lot::Mutex;
use serde::Serialize;
use serde_json::Value;
use std::fmt::Display;
use std::future::Future;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{debug, error, warn};

/// Chunking and concurrency limits.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BatchOptions {
    pub batch_size: usize,
    pub parallelism: usize,
}

impl Default for BatchOptions {
    fn default() -> Self {
        Self {
            batch_size: 10,
            parallelism: 3,
        }
    }
}

impl BatchOptions {
    pub fn new(batch_size: usize, parallelism: usize) -> Self {
        Self {
            batch_size: batch_size.max(1),
            parallelism: parallelism.max(1),
        }
    }

    /// Limits used by the bulk update, delete and tag helpers.
    pub fn bulk() -> Self {
        Self::new(20, 5)
    }
}

/// An item whose operation failed.
#[derive(Debug, Clone, PartialEq)]
pub struct FailedItem<E> {
    pub error: E,
    /// Position in the original input.
    pub index: usize,
}

/// Outcome of a batch run.
///
/// `successful` is in completion order within each parallel group.
#[derive(Debug)]
pub struct BatchResult<R, E> {
    pub successful: Vec<R>,
    pub failed: Vec<FailedItem<E>>,
    pub total: usize,
    pub duration: Duration,
}

impl<R, E> BatchResult<R, E> {
    pub fn processed(&self) -> usize {
        self.successful.len() + self.failed.len()
    }

    pub fn all_succeeded(&self) -> bool {
        self.failed.is_empty() && self.successful.len() == self.total
    }

    /// Indices of the failed items, in the order they failed.
    pub fn failed_indices(&self) -> Vec<usize> {
        self.failed.iter().map(|f| f.index).collect()
    }
}

type ProgressHook<'h> = Box<dyn FnMut(usize, usize) + Send + 'h>;
type ErrorHook<'h, T, E> = Box<dyn FnMut(&E, &T) + Send + 'h>;

/// Runs an operation over a slice with progress and error hooks.
pub struct BatchExecutor<'h, T, E> {
    options: BatchOptions,
    on_progress: Option<ProgressHook<'h>>,
    on_error: Option<ErrorHook<'h, T, E>>,
}

impl<'h, T, E> BatchExecutor<'h, T, E> {
    pub fn new(options: BatchOptions) -> Self {
        Self {
            options: BatchOptions::new(options.batch_size, options.parallelism),
            on_progress: None,
            on_error: None,
        }
    }

    /// Called with `(done, total)` after every item, success or failure.
    pub fn on_progress(mut self, hook: impl FnMut(usize, usize) + Send + 'h) -> Self {
        self.on_progress = Some(Box::new(hook));
        self
    }

    /// Called with the error and the item for every failure.
    pub fn on_error(mut self, hook: impl FnMut(&E, &T) + Send + 'h) -> Self {
        self.on_error = Some(Box::new(hook));
        self
    }

    pub async fn execute<'a, R, F, Fut>(mut self, items: &'a [T], operation: F) -> BatchResult<R, E>
    where
        F: Fn(&'a T) -> Fut,
        Fut: Future<Output = std::result::Result<R, E>>,
    {
        let started = Instant::now();
        let total = items.len();
        let BatchOptions {
            batch_size,
            parallelism,
        } = self.options;

        let mut successful = Vec::with_capacity(total);
        let mut failed = Vec::new();

        for (chunk_no, chunk) in items.chunks(batch_size).enumerate() {
            let chunk_start = chunk_no * batch_size;

            for (group_no, group) in chunk.chunks(parallelism).enumerate() {
                let group_start = chunk_start + group_no * parallelism;
                let mut pending: FuturesUnordered<_> = group
                    .iter()
                    .enumerate()
                    .map(|(offset, item)| {
                        let fut = operation(item);
                        async move { (group_start + offset, item, fut.await) }
                    })
                    .collect();

                while let Some((index, item, outcome)) = pending.next().await {
                    match outcome {
                        Ok(value) => successful.push(value),
                        Err(err) => {
                            if let Some(hook) = self.on_error.as_mut() {
                                hook(&err, item);
                            }
                            failed.push(FailedItem { error: err, index });
                        }
                    }
                    if let Some(hook) = self.on_progress.as_mut() {
                        hook(successful.len() + failed.len(), total);
                    }
                }
            }
        }

        debug!(
            total,
            succeeded = successful.len(),
            failed = failed.len(),
            "batch finished"
        );

        BatchResult {
            successful,
            failed,
            total,
            duration: started.elapsed(),
        }
    }
}

/// Run `operation` over `items` without hooks.
pub async fn execute_batch<'a, T, R, E, F, Fut>(
    items: &'a [T],
    operation: F,
    options: BatchOptions,
) -> BatchResult<R, E>
where
    F: Fn(&'a T) -> Fut,
    Fut: Future<Output = std::result::Result<R, E>>,
{
    BatchExecutor::new(options).execute(items, operation).await
}

/// Apply `patch` to a copy of every item, then hand each copy to `update_fn`.
pub async fn batch_update<T, R, E, P, F, Fut>(
    items: &[T],
    patch: P,
    update_fn: F,
) -> BatchResult<R, E>
where
    T: Clone,
    P: Fn(&mut T),
    F: Fn(T) -> Fut,
    Fut: Future<Output = std::result::Result<R, E>>,
{
    let patched: Vec<T> = items
        .iter()
        .cloned()
        .map(|mut item| {
            patch(&mut item);
            item
        })
        .collect();

    execute_batch(&patched, |item| update_fn(item.clone()), BatchOptions::bulk()).await
}

pub async fn batch_delete<'a, T, R, E, F, Fut>(items: &'a [T], delete_fn: F) -> BatchResult<R, E>
where
    F: Fn(&'a T) -> Fut,
    Fut: Future<Output = std::result::Result<R, E>>,
{
    execute_batch(items, delete_fn, BatchOptions::bulk()).await
}

/// Apply the same tag list to every item.
pub async fn batch_tag<'a, T, R, E, F, Fut>(
    items: &'a [T],
    tags: &'a [String],
    tag_fn: F,
) -> BatchResult<R, E>
where
    F: Fn(&'a T, &'a [String]) -> Fut,
    Fut: Future<Output = std::result::Result<R, E>>,
{
    execute_batch(items, |item| tag_fn(item, tags), BatchOptions::bulk()).await
}

/// Per-item counts from [`batch_import`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct ImportSummary {
    pub total: usize,
    pub successful: usize,
    pub failed: usize,
}

/// Import `items` in sequential chunks of `chunk_size` (50 when zero).
///
/// A failing chunk counts all of its items as failed and the import moves on.
pub async fn batch_import<'a, T, E, F, Fut>(
    items: &'a [T],
    import_fn: F,
    chunk_size: usize,
) -> ImportSummary
where
    E: Display,
    F: Fn(&'a [T]) -> Fut,
    Fut: Future<Output = std::result::Result<(), E>>,
{
    let chunk_size = if chunk_size == 0 { 50 } else { chunk_size };
    let mut summary = ImportSummary {
        total: items.len(),
        ..ImportSummary::default()
    };

    for (chunk_no, chunk) in items.chunks(chunk_size).enumerate() {
        match import_fn(chunk).await {
            Ok(()) => summary.successful += chunk.len(),
            Err(err) => {
                error!(chunk = chunk_no, items = chunk.len(), error = %err, "import chunk failed");
                summary.failed += chunk.len();
            }
        }
    }

    summary
}

/// An item rejected by [`batch_validate`].
#[derive(Debug, Clone, PartialEq)]
pub struct InvalidItem<T> {
    pub item: T,
    pub index: usize,
}

#[derive(Debug, Clone, PartialEq)]
pub struct ValidationReport<T> {
    pub valid: Vec<T>,
    pub invalid: Vec<InvalidItem<T>>,
}

/// Validate items one at a time, in input order.
///
/// A validator error marks the item invalid.
pub async fn batch_validate<'a, T, E, F, Fut>(
    items: &'a [T],
    validator: F,
    mut on_progress: impl FnMut(usize, usize),
) -> ValidationReport<T>
where
    T: Clone,
    F: Fn(&'a T) -> Fut,
    Fut: Future<Output = std::result::Result<bool, E>>,
{
    let mut report = ValidationReport {
        valid: Vec::new(),
        invalid: Vec::new(),
    };

    for (index, item) in items.iter().enumerate() {
        match validator(item).await {
            Ok(true) => report.valid.push(item.clone()),
            Ok(false) | Err(_) => report.invalid.push(InvalidItem {
                item: item.clone(),
                index,
            }),
        }
        on_progress(index + 1, items.len());
    }

    report
}

/// Transform items one at a time, in input order, stopping at the first error.
pub async fn batch_transform<'a, T, R, E, F, Fut>(
    items: &'a [T],
    transformer: F,
    mut on_progress: impl FnMut(usize, usize),
) -> std::result::Result<Vec<R>, E>
where
    F: Fn(&'a T) -> Fut,
    Fut: Future<Output = std::result::Result<R, E>>,
{
    let mut results = Vec::with_capacity(items.len());
    for (index, item) in items.iter().enumerate() {
        results.push(transformer(item).await?);
        on_progress(index + 1, items.len());
    }
    Ok(results)
}

/// Filter several record sets at once by a case-insensitive substring match
/// on one string field. Records whose field is missing or not a string never
/// match. One result set is returned per source, in order.
pub fn batch_search(sources: &[Vec<Record>], query: &str, field: &str) -> Vec<Vec<Record>> {
    let query = query.to_lowercase();
    sources
        .iter()
        .map(|source| {
            source
                .iter()
                .filter(|record| {
                    record
                        .field(field)
                        .and_then(Value::as_str)
                        .is_some_and(|value| value.to_lowercase().contains(&query))
                })
                .cloned()
                .collect()
        })
        .collect()
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum ExportFormat {
    #[default]
    Json,
    Csv,
}

/// Serialize items as pretty JSON or CSV.
///
/// CSV columns come from the first item's keys. An empty input exports as an
/// empty CSV string.
pub fn batch_export<T: Serialize>(items: &[T], format: ExportFormat) -> Result<String> {
    match format {
        ExportFormat::Json => Ok(serde_json::to_string_pretty(items)?),
        ExportFormat::Csv => export_csv(items),
    }
}

fn export_csv<T: Serialize>(items: &[T]) -> Result<String> {
    let rows = items
        .iter()
        .map(serde_json::to_value)
        .collect::<std::result::Result<Vec<Value>, _>>()?;

    let Some(first) = rows.first() else {
        return Ok(String::new());
    };
    let headers: Vec<String> = match first {
        Value::Object(map) => map.keys().cloned().collect(),
        _ => {
            return Err(Error::InvalidPayload(
                "csv export needs object items".to_string(),
            ))
        }
    };

    let mut lines = Vec::with_capacity(rows.len() + 1);
    lines.push(headers.join(","));
    for row in &rows {
        let fields: Vec<String> = headers
            .iter()
            .map(|header| csv_field(row.get(header)))
            .collect();
        lines.push(fields.join(","));
    }

    Ok(lines.join("\n"))
}

fn csv_field(value: Option<&Value>) -> String {
    match value {
        None | Some(Value::Null) => String::new(),
        Some(Value::String(s)) if s.contains(',') => format!("\"{}\"", s.replace('"', "\"\"")),
        Some(Value::String(s)) => s.clone(),
        Some(other) => other.to_string(),
    }
}

type BatchFn<T, R, E> =
    Box<dyn Fn(Vec<T>) -> BoxFuture<'static, std::result::Result<Vec<R>, E>> + Send + Sync>;

/// Accumulates items and processes them in batches.
///
/// `add` processes the queue inline once it reaches the batch size. Only one
/// caller drains the queue at a time; a caller that finds processing already
/// under way just enqueues. Results of automatic processing are kept until
/// [`take_completed`](Self::take_completed).
pub struct BatchController<T, R, E> {
    queue: Mutex<Vec<T>>,
    batch_size: AtomicUsize,
    running: AtomicBool,
    operation: Option<BatchFn<T, R, E>>,
    completed: Mutex<Vec<R>>,
    dead_letters: Option<Arc<DeadLetterQueue<Vec<T>>>>,
}

impl<T, R, E> Default for BatchController<T, R, E> {
    fn default() -> Self {
        Self::new(10)
    }
}

impl<T, R, E> BatchController<T, R, E> {
    pub fn new(batch_size: usize) -> Self {
        Self {
            queue: Mutex::new(Vec::new()),
            batch_size: AtomicUsize::new(batch_size.max(1)),
            running: AtomicBool::new(false),
            operation: None,
            completed: Mutex::new(Vec::new()),
            dead_letters: None,
        }
    }

    pub fn with_operation<F, Fut>(mut self, op: F) -> Self
    where
        F: Fn(Vec<T>) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = std::result::Result<Vec<R>, E>> + Send + 'static,
    {
        self.set_operation(op);
        self
    }

    /// Send batches whose operation failed to `queue`.
    pub fn with_dead_letters(mut self, queue: Arc<DeadLetterQueue<Vec<T>>>) -> Self {
        self.dead_letters = Some(queue);
        self
    }

    pub fn set_operation<F, Fut>(&mut self, op: F)
    where
        F: Fn(Vec<T>) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = std::result::Result<Vec<R>, E>> + Send + 'static,
    {
        self.operation = Some(Box::new(move |batch| {
            Box::pin(op(batch)) as BoxFuture<'static, _>
        }));
    }

    pub fn set_batch_size(&self, size: usize) {
        self.batch_size.store(size.max(1), Ordering::Relaxed);
    }

    pub fn batch_size(&self) -> usize {
        self.batch_size.load(Ordering::Relaxed)
    }

    pub fn queue_size(&self) -> usize {
        self.queue.lock().len()
    }

    pub fn clear(&self) {
        self.queue.lock().clear();
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::Acquire)
    }

    /// Results produced by automatic processing since the last call.
    pub fn take_completed(&self) -> Vec<R> {
        std::mem::take(&mut *self.completed.lock())
    }
}

impl<T: Clone, R, E: Display> BatchController<T, R, E> {
    pub async fn add(&self, item: T) {
        let ready = {
            let mut queue = self.queue.lock();
            queue.push(item);
            queue.len() >= self.batch_size()
        };
        if ready {
            self.process().await;
        }
    }

    pub async fn add_multiple(&self, items: impl IntoIterator<Item = T>) {
        let ready = {
            let mut queue = self.queue.lock();
            queue.extend(items);
            queue.len() >= self.batch_size()
        };
        if ready {
            self.process().await;
        }
    }

    /// Process everything still queued as a single batch.
    ///
    /// Returns `Ok(None)` when the queue is empty or no operation is set; in
    /// the latter case the queue is left as it is.
    pub async fn flush(&self) -> std::result::Result<Option<Vec<R>>, E> {
        let Some(operation) = self.operation.as_ref() else {
            return Ok(None);
        };
        let batch = std::mem::take(&mut *self.queue.lock());
        if batch.is_empty() {
            return Ok(None);
        }

        match operation(batch.clone()).await {
            Ok(results) => Ok(Some(results)),
            Err(err) => {
                self.dead_letter(batch, &err);
                Err(err)
            }
        }
    }

    async fn process(&self) {
        let Some(operation) = self.operation.as_ref() else {
            return;
        };

        loop {
            if self
                .running
                .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
                .is_err()
            {
                return;
            }
            {
                let _guard = RunningGuard(&self.running);
                self.drain(operation).await;
            }

            // An add that landed after the last drain but before the flag
            // cleared saw `running` and left its batch to us.
            if self.queue.lock().len() < self.batch_size() {
                return;
            }
        }
    }

    async fn drain(&self, operation: &BatchFn<T, R, E>) {
        loop {
            let batch: Vec<T> = {
                let mut queue = self.queue.lock();
                let take = queue.len().min(self.batch_size());
                queue.drain(..take).collect()
            };
            if batch.is_empty() {
                return;
            }

            match operation(batch.clone()).await {
                Ok(results) => self.completed.lock().extend(results),
                Err(err) => self.dead_letter(batch, &err),
            }
        }
    }

    fn dead_letter(&self, batch: Vec<T>, err: &E) {
        warn!(items = batch.len(), error = %err, "batch operation failed");
        if let Some(queue) = &self.dead_letters {
            queue.add(batch, err);
        }
    }
}

struct RunningGuard<'a>(&'a AtomicBool);

impl Drop for RunningGuard<'_> {
    fn drop(&mut self) {
        self.0.store(false, Ordering::Release);
    }
}
