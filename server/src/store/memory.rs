//! In-memory store backed by `dashmap`.

use super::{Collections, ItemStore, StoreResult};
use async_trait::async_trait;
use closet_engine::{Record, Timestamp};
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use std::sync::atomic::{AtomicU64, Ordering};

#[derive(Debug, Clone)]
struct StoredItem {
    record: Record,
    created_at: Timestamp,
    /// Insertion sequence, breaks `created_at` ties
    seq: u64,
}

/// Process-local [`ItemStore`]. Contents are lost on restart.
#[derive(Debug, Default)]
pub struct MemoryStore {
    items: DashMap<String, StoredItem>,
    collections: DashMap<String, Collections>,
    next_seq: AtomicU64,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.items.len()
    }

    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }
}

#[async_trait]
impl ItemStore for MemoryStore {
    fn kind(&self) -> &'static str {
        "memory"
    }

    async fn list_items(&self, owner: &str) -> StoreResult<Vec<Record>> {
        let mut owned: Vec<StoredItem> = self
            .items
            .iter()
            .filter(|entry| entry.record.owner_id.as_deref() == Some(owner))
            .map(|entry| entry.value().clone())
            .collect();
        owned.sort_by(|a, b| (b.created_at, b.seq).cmp(&(a.created_at, a.seq)));
        Ok(owned.into_iter().map(|stored| stored.record).collect())
    }

    async fn get_item(&self, id: &str) -> StoreResult<Option<Record>> {
        Ok(self.items.get(id).map(|entry| entry.record.clone()))
    }

    async fn upsert_owned(
        &self,
        owner: &str,
        mut record: Record,
        now: Timestamp,
    ) -> StoreResult<Option<Record>> {
        record.owner_id = Some(owner.to_string());
        record.updated_at = now;

        // The entry holds the shard lock, so check and write cannot interleave.
        match self.items.entry(record.id.clone()) {
            Entry::Occupied(mut entry) => {
                if !entry.get().record.is_writable_by(owner) {
                    return Ok(None);
                }
                entry.get_mut().record = record.clone();
                Ok(Some(record))
            }
            Entry::Vacant(entry) => {
                entry.insert(StoredItem {
                    record: record.clone(),
                    created_at: now,
                    seq: self.next_seq.fetch_add(1, Ordering::Relaxed),
                });
                Ok(Some(record))
            }
        }
    }

    async fn get_collections(&self, owner: &str) -> StoreResult<Collections> {
        Ok(self
            .collections
            .get(owner)
            .map(|entry| entry.value().clone())
            .unwrap_or_default())
    }

    async fn put_collections(
        &self,
        owner: &str,
        collections: Collections,
        _now: Timestamp,
    ) -> StoreResult<()> {
        self.collections.insert(owner.to_string(), collections);
        Ok(())
    }
}
