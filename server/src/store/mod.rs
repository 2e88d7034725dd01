//! Item persistence.
//!
//! Handlers only see [`ItemStore`]. [`MemoryStore`] backs development runs
//! and tests; [`PgStore`] is used whenever `DATABASE_URL` is set.

mod memory;
mod postgres;

pub use memory::MemoryStore;
pub use postgres::PgStore;

use async_trait::async_trait;
use closet_engine::{Record, Timestamp};
use serde_json::{Map, Value};

/// Named collections stored as one opaque blob per principal.
pub type Collections = Map<String, Value>;

/// Store errors.
#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error("migration failed: {0}")]
    Migrate(#[from] sqlx::migrate::MigrateError),

    #[error("corrupt row for item {id}: {reason}")]
    Corrupt { id: String, reason: String },
}

pub type StoreResult<T> = std::result::Result<T, StoreError>;

/// Persistence for synced items and per-principal collections.
#[async_trait]
pub trait ItemStore: Send + Sync {
    /// Short backend name reported by the health check.
    fn kind(&self) -> &'static str;

    /// Items owned by `owner`, newest `createdAt` first.
    async fn list_items(&self, owner: &str) -> StoreResult<Vec<Record>>;

    async fn get_item(&self, id: &str) -> StoreResult<Option<Record>>;

    /// Insert or update `record` on behalf of `owner`.
    ///
    /// The write is skipped, and `None` returned, when the stored item belongs
    /// to a different principal. A written item is owned by `owner` and has
    /// `updatedAt = now`. The ownership check and the write are atomic.
    async fn upsert_owned(
        &self,
        owner: &str,
        record: Record,
        now: Timestamp,
    ) -> StoreResult<Option<Record>>;

    /// The principal's named collections; empty when none were saved.
    async fn get_collections(&self, owner: &str) -> StoreResult<Collections>;

    /// Replace the principal's named collections wholesale.
    async fn put_collections(
        &self,
        owner: &str,
        collections: Collections,
        now: Timestamp,
    ) -> StoreResult<()>;
}
