//! Record types moved by the sync layer.

use crate::error::{Error, Result};
use crate::{PrincipalId, RecordId, Timestamp};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

/// Anything the merge algorithm can reconcile.
///
/// Merge decisions depend on these two accessors alone; the rest of the
/// type is carried through untouched.
pub trait Syncable {
    /// Stable identifier shared by the client and server copies.
    fn id(&self) -> &str;
    /// Recency marker in epoch milliseconds.
    fn updated_at(&self) -> Timestamp;
}

/// A synchronized record (a closet item, a look, ...).
///
/// Serialized as a flat camelCase object: `id`, `ownerId`, `updatedAt`, and
/// every other field lands in [`Record::payload`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Record {
    /// Unique identifier, generated client-side
    pub id: RecordId,
    /// Owning principal; `None` means unclaimed
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub owner_id: Option<PrincipalId>,
    /// Last modification time (milliseconds since epoch)
    #[serde(default)]
    pub updated_at: Timestamp,
    /// Domain fields (name, category, price, ...)
    #[serde(flatten)]
    pub payload: Map<String, Value>,
}

impl Record {
    /// Create an unowned record from a JSON payload.
    ///
    /// Non-object payloads are stored under a `value` key.
    pub fn new(id: impl Into<RecordId>, updated_at: Timestamp, payload: Value) -> Self {
        Self {
            id: id.into(),
            owner_id: None,
            updated_at,
            payload: into_object(payload),
        }
    }

    /// Create a record for a fresh local edit with a generated id.
    pub fn new_local(payload: Value, now: Timestamp) -> Self {
        Self::new(uuid::Uuid::new_v4().to_string(), now, payload)
    }

    /// Parse a record from an arbitrary JSON value.
    pub fn from_value(value: Value) -> Result<Self> {
        if !value.is_object() {
            return Err(Error::InvalidPayload("expected a JSON object".into()));
        }
        let record: Record = serde_json::from_value(value)?;
        record.validate()?;
        Ok(record)
    }

    /// Builder-style owner assignment.
    pub fn with_owner(mut self, owner: impl Into<PrincipalId>) -> Self {
        self.owner_id = Some(owner.into());
        self
    }

    /// Check the record is storable.
    pub fn validate(&self) -> Result<()> {
        if self.id.trim().is_empty() {
            return Err(Error::InvalidRecord("record id must not be empty".into()));
        }
        Ok(())
    }

    /// Whether `principal` may overwrite this record.
    ///
    /// Unclaimed records are writable by anyone.
    pub fn is_writable_by(&self, principal: &str) -> bool {
        match &self.owner_id {
            Some(owner) => owner == principal,
            None => true,
        }
    }

    /// Read a payload field.
    pub fn field(&self, name: &str) -> Option<&Value> {
        self.payload.get(name)
    }
}

impl Syncable for Record {
    fn id(&self) -> &str {
        &self.id
    }

    fn updated_at(&self) -> Timestamp {
        self.updated_at
    }
}

fn into_object(payload: Value) -> Map<String, Value> {
    match payload {
        Value::Object(map) => map,
        Value::Null => Map::new(),
        other => {
            let mut map = Map::new();
            map.insert("value".to_string(), other);
            map
        }
    }
}
