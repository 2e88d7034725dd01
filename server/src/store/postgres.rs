//! PostgreSQL store.

use super::{Collections, ItemStore, StoreError, StoreResult};
use async_trait::async_trait;
use closet_engine::{Record, Timestamp};
use serde_json::Value;
use sqlx::postgres::{PgPoolOptions, PgRow};
use sqlx::{PgPool, Row};

/// A stored item row.
#[derive(Debug)]
struct ItemRow {
    id: String,
    owner_id: Option<String>,
    payload: Value,
    updated_at: i64,
}

impl<'r> sqlx::FromRow<'r, PgRow> for ItemRow {
    fn from_row(row: &'r PgRow) -> Result<Self, sqlx::Error> {
        Ok(ItemRow {
            id: row.try_get("id")?,
            owner_id: row.try_get("owner_id")?,
            payload: row.try_get("payload")?,
            updated_at: row.try_get("updated_at")?,
        })
    }
}

impl ItemRow {
    fn into_record(self) -> StoreResult<Record> {
        let payload = match self.payload {
            Value::Object(map) => map,
            other => {
                return Err(StoreError::Corrupt {
                    id: self.id,
                    reason: format!("payload is not an object: {other}"),
                })
            }
        };
        Ok(Record {
            id: self.id,
            owner_id: self.owner_id,
            updated_at: self.updated_at.max(0) as Timestamp,
            payload,
        })
    }
}

/// [`ItemStore`] over a `sqlx` connection pool.
#[derive(Debug, Clone)]
pub struct PgStore {
    pool: PgPool,
}

impl PgStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    /// Connect and bring the schema up to date.
    pub async fn connect(database_url: &str) -> StoreResult<Self> {
        let pool = PgPoolOptions::new()
            .max_connections(10)
            .connect(database_url)
            .await?;

        tracing::info!("Running database migrations...");
        sqlx::migrate!("./migrations").run(&pool).await?;

        Ok(Self::new(pool))
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }
}

#[async_trait]
impl ItemStore for PgStore {
    fn kind(&self) -> &'static str {
        "postgres"
    }

    async fn list_items(&self, owner: &str) -> StoreResult<Vec<Record>> {
        let rows = sqlx::query_as::<_, ItemRow>(
            r#"
            SELECT id, owner_id, payload, updated_at
            FROM items
            WHERE owner_id = $1
            ORDER BY created_at DESC, id
            "#,
        )
        .bind(owner)
        .fetch_all(&self.pool)
        .await?;

        rows.into_iter().map(ItemRow::into_record).collect()
    }

    async fn get_item(&self, id: &str) -> StoreResult<Option<Record>> {
        let row = sqlx::query_as::<_, ItemRow>(
            r#"
            SELECT id, owner_id, payload, updated_at
            FROM items
            WHERE id = $1
            "#,
        )
        .bind(id)
        .fetch_optional(&self.pool)
        .await?;

        row.map(ItemRow::into_record).transpose()
    }

    async fn upsert_owned(
        &self,
        owner: &str,
        record: Record,
        now: Timestamp,
    ) -> StoreResult<Option<Record>> {
        // The WHERE on the conflict branch is the ownership guard: a row owned
        // by someone else is left alone and RETURNING yields nothing.
        let row = sqlx::query_as::<_, ItemRow>(
            r#"
            INSERT INTO items (id, owner_id, payload, created_at, updated_at)
            VALUES ($1, $2, $3, $4, $4)
            ON CONFLICT (id) DO UPDATE SET
                owner_id = EXCLUDED.owner_id,
                payload = EXCLUDED.payload,
                updated_at = EXCLUDED.updated_at
            WHERE items.owner_id IS NULL OR items.owner_id = EXCLUDED.owner_id
            RETURNING id, owner_id, payload, updated_at
            "#,
        )
        .bind(&record.id)
        .bind(owner)
        .bind(Value::Object(record.payload))
        .bind(now as i64)
        .fetch_optional(&self.pool)
        .await?;

        row.map(ItemRow::into_record).transpose()
    }

    async fn get_collections(&self, owner: &str) -> StoreResult<Collections> {
        let data: Option<Value> =
            sqlx::query_scalar("SELECT data FROM user_collections WHERE owner_id = $1")
                .bind(owner)
                .fetch_optional(&self.pool)
                .await?;

        Ok(match data {
            Some(Value::Object(map)) => map,
            _ => Collections::new(),
        })
    }

    async fn put_collections(
        &self,
        owner: &str,
        collections: Collections,
        now: Timestamp,
    ) -> StoreResult<()> {
        sqlx::query(
            r#"
            INSERT INTO user_collections (owner_id, data, updated_at)
            VALUES ($1, $2, $3)
            ON CONFLICT (owner_id) DO UPDATE SET
                data = EXCLUDED.data,
                updated_at = EXCLUDED.updated_at
            "#,
        )
        .bind(owner)
        .bind(Value::Object(collections))
        .bind(now as i64)
        .execute(&self.pool)
        .await?;

        Ok(())
    }
}
