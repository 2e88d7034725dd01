//! # Closet Engine
//!
//! Local-first merge and resilience primitives for the Closet sync client.
//!
//! The crate reconciles a client-held collection of records with the copy a
//! server holds, then pushes the merged result back upstream. Around that
//! core it carries the small toolkit every flaky-network caller in the app
//! leans on: retry with backoff, a circuit breaker, bounded-concurrency batch
//! execution and a TTL cache.
//!
//! ## Core Concepts
//!
//! ### Records
//!
//! A [`Record`] is an id, an optional owner, an `updatedAt` timestamp and an
//! opaque JSON payload. Anything implementing [`Syncable`] can be merged.
//!
//! ### Merging
//!
//! [`merge_items`] is a last-writer-wins reducer over the union of two keyed
//! collections. Server records are seeded first, so equal timestamps keep the
//! server copy. Local-only records are always preserved.
//!
//! ### Session sync
//!
//! [`SessionSync`] runs the fetch → merge → push cycle once per authenticated
//! session over any [`SyncTransport`]. Failures never escape; the caller gets
//! a [`SyncOutcome`] saying whether the session synced, was skipped, or went
//! offline.
//!
//! ### Resilience
//!
//! - [`retry_with_backoff`] - exponential backoff with jitter and a timeout
//! - [`CircuitBreaker`] - fail fast after repeated downstream failures
//! - [`BatchExecutor`] / [`BatchController`] - bulk work with partial failures
//! - [`TtlCache`] - lazily evicted memoization
//! - [`ErrorRecovery`] / [`AsyncQueue`] - pattern-matched recovery and a
//!   concurrency-limited task queue
//!
//! ## Quick Start
//!
//! ```rust
//! use closet_engine::{merge_items, Record};
//! use serde_json::json;
//!
//! let server = vec![Record::new("shirt-1", 100, json!({"name": "Oxford"}))];
//! let local = vec![
//!     Record::new("shirt-1", 200, json!({"name": "Oxford (tailored)"})),
//!     Record::new("coat-7", 150, json!({"name": "Trench"})),
//! ];
//!
//! let merged = merge_items(server, local);
//! assert_eq!(merged.len(), 2);
//! assert_eq!(merged[0].id, "shirt-1");
//! assert_eq!(merged[0].updated_at, 200);
//! ```

pub mod batch;
pub mod cache;
pub mod circuit;
pub mod clock;
pub mod dead_letter;
pub mod error;
#[cfg(feature = "http")]
pub mod http;
pub mod merge;
pub mod queue;
pub mod record;
pub mod recovery;
pub mod retry;
pub mod session;
pub mod transport;

// Re-export main types at crate root
pub use batch::{
    batch_delete, batch_export, batch_search, batch_import, batch_tag, batch_transform, batch_update,
    batch_validate, execute_batch, BatchController, BatchExecutor, BatchOptions, BatchResult,
    ExportFormat, FailedItem, ImportSummary, InvalidItem, ValidationReport,
};
pub use cache::{search_key, CacheStats, TtlCache, SEARCH_TTL};
pub use circuit::{CircuitBreaker, CircuitConfig, CircuitError, CircuitState};
pub use clock::{Clock, ManualClock, SystemClock};
pub use dead_letter::{DeadLetter, DeadLetterQueue};
pub use error::Error;
#[cfg(feature = "http")]
pub use http::HttpTransport;
pub use merge::{merge_items, merge_with_report, MergeOutcome, MergeReport};
pub use queue::{AsyncQueue, QueueCleared};
pub use record::{Record, Syncable};
pub use recovery::ErrorRecovery;
pub use retry::{
    is_retryable, is_retryable_message, retry_with_backoff, retry_with_backoff_if, with_fallback,
    with_timeout, AttemptError, RetryOptions, RetryOutcome,
};
pub use session::{SessionStatus, SessionSync, SkipReason, SyncOutcome, SyncPhase, SyncReport};
pub use transport::{MockTransport, PushReceipt, SyncTransport, TransportError};

/// Type aliases for clarity
pub type RecordId = String;
pub type PrincipalId = String;
/// Milliseconds since the Unix epoch.
pub type Timestamp = u64;
