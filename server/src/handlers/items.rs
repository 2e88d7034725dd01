//! Item sync: listing and ownership-guarded upserts.

use crate::error::Result;
use crate::store::ItemStore;
use closet_engine::{Record, Timestamp};
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Request body for `POST /sync/items`.
#[derive(Debug, Default, Deserialize)]
pub struct SyncItemsRequest {
    #[serde(default)]
    pub items: Vec<Value>,
}

/// Response for `POST /sync/items`.
#[derive(Debug, Serialize)]
pub struct SyncItemsResponse {
    /// Records actually written
    pub synced: usize,
    pub results: Vec<Record>,
}

/// Response for `GET /sync/items`.
#[derive(Debug, Serialize)]
pub struct ItemsResponse {
    pub items: Vec<Record>,
}

/// Parse and validate every item before anything is written.
pub fn parse_items(items: Vec<Value>) -> Result<Vec<Record>> {
    let records = items
        .into_iter()
        .map(Record::from_value)
        .collect::<closet_engine::error::Result<Vec<_>>>()?;
    Ok(records)
}

/// Upsert `records` for `principal`, skipping items owned by anyone else.
///
/// Skips are silent: the caller only learns how many records were written.
pub async fn upsert_items(
    store: &dyn ItemStore,
    principal: &str,
    records: Vec<Record>,
    now: Timestamp,
) -> Result<SyncItemsResponse> {
    let received = records.len();
    let mut results = Vec::with_capacity(received);

    for record in records {
        let id = record.id.clone();
        match store.upsert_owned(principal, record, now).await? {
            Some(written) => results.push(written),
            None => tracing::debug!(principal, id = %id, "skipped item owned by another principal"),
        }
    }

    tracing::info!(principal, received, synced = results.len(), "items synced");
    Ok(SyncItemsResponse {
        synced: results.len(),
        results,
    })
}

/// Process a `POST /sync/items` request.
pub async fn handle_sync_items(
    store: &dyn ItemStore,
    principal: &str,
    request: SyncItemsRequest,
    now: Timestamp,
) -> Result<SyncItemsResponse> {
    let records = parse_items(request.items)?;
    upsert_items(store, principal, records, now).await
}

/// Process a `GET /sync/items` request.
pub async fn handle_list_items(store: &dyn ItemStore, principal: &str) -> Result<ItemsResponse> {
    let items = store.list_items(principal).await?;
    Ok(ItemsResponse { items })
}
