//! Whole-account sync: items plus named collections.
//!
//! `items` follows the same ownership rules as `/sync/items`. Every other
//! top-level key is a named collection (`looks`, `measurements`, ...) kept
//! as one opaque blob per principal and replaced wholesale on write.

use super::items::{parse_items, upsert_items};
use crate::error::{AppError, Result};
use crate::store::{Collections, ItemStore};
use chrono::{DateTime, SecondsFormat, Utc};
use closet_engine::{Record, Timestamp};
use serde::Serialize;
use serde_json::Value;

/// Keys the snapshot response reserves for itself.
const RESERVED_KEYS: [&str; 2] = ["count", "timestamp"];

/// Response for `POST /sync/all`.
#[derive(Debug, Serialize)]
pub struct SyncAllResponse {
    pub synced: usize,
    pub results: Vec<Record>,
    /// Names of the collections stored by this request
    pub collections: Vec<String>,
    pub timestamp: String,
}

/// Response for `GET /sync/all`.
#[derive(Debug, Serialize)]
pub struct SnapshotResponse {
    pub items: Vec<Record>,
    pub count: usize,
    pub timestamp: String,
    #[serde(flatten)]
    pub collections: Collections,
}

/// Process a `POST /sync/all` request.
///
/// An items-only body leaves the stored collections untouched.
pub async fn handle_sync_all(
    store: &dyn ItemStore,
    principal: &str,
    mut body: Collections,
    now: Timestamp,
) -> Result<SyncAllResponse> {
    let items = match body.remove("items") {
        None | Some(Value::Null) => Vec::new(),
        Some(Value::Array(items)) => items,
        Some(_) => return Err(AppError::BadRequest("items must be an array".to_string())),
    };
    if let Some(key) = RESERVED_KEYS.iter().find(|key| body.contains_key(**key)) {
        return Err(AppError::BadRequest(format!(
            "{key} is reserved and cannot name a collection"
        )));
    }

    let records = parse_items(items)?;
    let written = upsert_items(store, principal, records, now).await?;

    let names: Vec<String> = body.keys().cloned().collect();
    if !body.is_empty() {
        store.put_collections(principal, body, now).await?;
        tracing::info!(principal, collections = ?names, "collections replaced");
    }

    Ok(SyncAllResponse {
        synced: written.synced,
        results: written.results,
        collections: names,
        timestamp: iso_timestamp(now),
    })
}

/// Process a `GET /sync/all` request.
pub async fn handle_snapshot(
    store: &dyn ItemStore,
    principal: &str,
    now: Timestamp,
) -> Result<SnapshotResponse> {
    let items = store.list_items(principal).await?;
    let collections = store.get_collections(principal).await?;

    Ok(SnapshotResponse {
        count: items.len(),
        items,
        timestamp: iso_timestamp(now),
        collections,
    })
}

/// RFC 3339 with millisecond precision, e.g. `2024-06-01T12:00:00.000Z`.
fn iso_timestamp(millis: Timestamp) -> String {
    DateTime::<Utc>::from_timestamp_millis(millis as i64)
        .unwrap_or_else(Utc::now)
        .to_rfc3339_opts(SecondsFormat::Millis, true)
}
