//! Transport layer abstraction for sync operations.

use crate::circuit::CircuitError;
use crate::record::Record;
use crate::retry::AttemptError;
use async_trait::async_trait;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::collections::VecDeque;
use std::sync::atomic::{AtomicUsize, Ordering};
use thiserror::Error;

/// Errors a transport can report.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum TransportError {
    #[error("server responded with status {0}")]
    Status(u16),

    #[error("network error: {0}")]
    Network(String),

    #[error("could not decode response: {0}")]
    Decode(String),

    #[error("request timed out")]
    Timeout,

    #[error("circuit breaker is open")]
    CircuitOpen,
}

impl TransportError {
    /// Whether repeating the request could succeed.
    pub fn is_retryable(&self) -> bool {
        match self {
            TransportError::Network(_) | TransportError::Timeout => true,
            TransportError::Status(code) => *code == 429 || *code >= 500,
            TransportError::Decode(_) | TransportError::CircuitOpen => false,
        }
    }
}

impl From<CircuitError<TransportError>> for TransportError {
    fn from(err: CircuitError<TransportError>) -> Self {
        match err {
            CircuitError::Open { .. } => TransportError::CircuitOpen,
            CircuitError::Inner(inner) => inner,
        }
    }
}

impl From<CircuitError<AttemptError<TransportError>>> for TransportError {
    fn from(err: CircuitError<AttemptError<TransportError>>) -> Self {
        match err {
            CircuitError::Open { .. } => TransportError::CircuitOpen,
            CircuitError::Inner(AttemptError::Timeout(_)) => TransportError::Timeout,
            CircuitError::Inner(AttemptError::Failed(inner)) => inner,
        }
    }
}

/// Server acknowledgement of an upload.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct PushReceipt {
    /// Number of records the server accepted.
    pub synced: usize,
    /// The accepted records as stored, with server-assigned timestamps.
    #[serde(default)]
    pub results: Vec<Record>,
}

/// Moves record collections between this client and the server.
#[async_trait]
pub trait SyncTransport: Send + Sync {
    /// Download the principal's records.
    async fn fetch_items(&self) -> Result<Vec<Record>, TransportError>;

    /// Upload a full collection.
    async fn push_items(&self, items: &[Record]) -> Result<PushReceipt, TransportError>;
}

#[async_trait]
impl<T: SyncTransport + ?Sized> SyncTransport for std::sync::Arc<T> {
    async fn fetch_items(&self) -> Result<Vec<Record>, TransportError> {
        (**self).fetch_items().await
    }

    async fn push_items(&self, items: &[Record]) -> Result<PushReceipt, TransportError> {
        (**self).push_items(items).await
    }
}

/// In-memory transport for tests.
///
/// Fetches return the current server collection unless a failure is queued.
/// Pushes upsert into the server collection and echo the records back.
#[derive(Debug, Default)]
pub struct MockTransport {
    server_items: Mutex<Vec<Record>>,
    fetch_failures: Mutex<VecDeque<TransportError>>,
    push_failures: Mutex<VecDeque<TransportError>>,
    pushed: Mutex<Vec<Vec<Record>>>,
    fetch_calls: AtomicUsize,
    push_calls: AtomicUsize,
}

impl MockTransport {
    pub fn new() -> Self {
        Self::default()
    }

    /// Create a transport whose server already holds `items`.
    pub fn with_server_items(items: Vec<Record>) -> Self {
        let transport = Self::default();
        *transport.server_items.lock() = items;
        transport
    }

    pub fn fail_next_fetch(&self, err: TransportError) {
        self.fetch_failures.lock().push_back(err);
    }

    pub fn fail_next_push(&self, err: TransportError) {
        self.push_failures.lock().push_back(err);
    }

    pub fn server_items(&self) -> Vec<Record> {
        self.server_items.lock().clone()
    }

    /// Every payload passed to `push_items`, in call order.
    pub fn pushed(&self) -> Vec<Vec<Record>> {
        self.pushed.lock().clone()
    }

    pub fn fetch_calls(&self) -> usize {
        self.fetch_calls.load(Ordering::SeqCst)
    }

    pub fn push_calls(&self) -> usize {
        self.push_calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl SyncTransport for MockTransport {
    async fn fetch_items(&self) -> Result<Vec<Record>, TransportError> {
        self.fetch_calls.fetch_add(1, Ordering::SeqCst);
        if let Some(err) = self.fetch_failures.lock().pop_front() {
            return Err(err);
        }
        Ok(self.server_items.lock().clone())
    }

    async fn push_items(&self, items: &[Record]) -> Result<PushReceipt, TransportError> {
        self.push_calls.fetch_add(1, Ordering::SeqCst);
        self.pushed.lock().push(items.to_vec());
        if let Some(err) = self.push_failures.lock().pop_front() {
            return Err(err);
        }

        let mut server = self.server_items.lock();
        for item in items {
            match server.iter_mut().find(|existing| existing.id == item.id) {
                Some(existing) => *existing = item.clone(),
                None => server.push(item.clone()),
            }
        }

        Ok(PushReceipt {
            synced: items.len(),
            results: items.to_vec(),
        })
    }
}
