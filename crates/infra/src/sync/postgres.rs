//! Postgres-backed Operation Queue and sync status store.
//!
//! Tables are created by [`crate::db::bootstrap`].

use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde_json::Value as JsonValue;
use sqlx::{PgPool, Row};
use tracing::{instrument, warn};
use uuid::Uuid;

use crate::db::sqlx_message;
use crate::local::RepositoryError;

use super::operation::{
    OperationId, OperationRequest, PendingOperation, QueueEntry, StoredOperation, UnreadableOperation,
};
use super::queue::{OperationQueue, QueueError};
use super::status::{SyncStatusEntry, SyncStatusStore};

#[derive(Debug, Clone)]
pub struct PostgresOperationQueue {
    pool: Arc<PgPool>,
}

impl PostgresOperationQueue {
    pub fn new(pool: PgPool) -> Self {
        Self { pool: Arc::new(pool) }
    }
}

fn queue_error(operation: &str, err: sqlx::Error) -> QueueError {
    QueueError::Storage(sqlx_message(operation, err))
}

/// Decode one queue row. Only an unreadable id fails the whole read; any
/// other bad column turns the row into an unreadable entry.
fn row_to_entry(row: &sqlx::postgres::PgRow) -> Result<QueueEntry, QueueError> {
    let id = OperationId::from_uuid(row.try_get::<Uuid, _>("id").map_err(|e| queue_error("decode id", e))?);
    let read = || -> Result<StoredOperation, sqlx::Error> {
        Ok(StoredOperation {
            id,
            kind: row.try_get("kind")?,
            entity_type: row.try_get("entity_type")?,
            entity_id: row.try_get("entity_id")?,
            payload: row.try_get::<JsonValue, _>("payload")?,
            enqueued_at: row.try_get::<DateTime<Utc>, _>("enqueued_at")?,
        })
    };

    let entry = match read() {
        Ok(stored) => stored.into_entry(),
        Err(err) => QueueEntry::Unreadable(UnreadableOperation {
            id,
            entity_id: row.try_get("entity_id").ok(),
            reason: err.to_string(),
        }),
    };
    if let QueueEntry::Unreadable(bad) = &entry {
        warn!(operation_id = %bad.id, reason = %bad.reason, "unreadable queue row left in place");
    }
    Ok(entry)
}

#[async_trait]
impl OperationQueue for PostgresOperationQueue {
    #[instrument(skip(self, request), fields(kind = request.kind.as_str()), err)]
    async fn enqueue(&self, request: OperationRequest) -> Result<PendingOperation, QueueError> {
        let op = PendingOperation::from_request(request);
        sqlx::query(
            r#"
            INSERT INTO pending_operations (id, kind, entity_type, entity_id, payload, enqueued_at)
            VALUES ($1, $2, $3, $4, $5, $6)
            "#,
        )
        .bind(op.id.0)
        .bind(op.kind.as_str())
        .bind(op.entity_type.as_str())
        .bind(op.entity_id)
        .bind(&op.payload)
        .bind(op.enqueued_at)
        .execute(&*self.pool)
        .await
        .map_err(|e| queue_error("enqueue", e))?;
        Ok(op)
    }

    #[instrument(skip(self), err)]
    async fn entries(&self) -> Result<Vec<QueueEntry>, QueueError> {
        let rows = sqlx::query(
            r#"
            SELECT id, kind, entity_type, entity_id, payload, enqueued_at
            FROM pending_operations
            ORDER BY enqueued_at ASC, seq ASC
            "#,
        )
        .fetch_all(&*self.pool)
        .await
        .map_err(|e| queue_error("read queue", e))?;

        rows.iter().map(row_to_entry).collect()
    }

    async fn remove(&self, id: OperationId) -> Result<(), QueueError> {
        self.discard(id).await.map(|_| ())
    }

    #[instrument(skip(self), err)]
    async fn discard(&self, id: OperationId) -> Result<bool, QueueError> {
        let result = sqlx::query("DELETE FROM pending_operations WHERE id = $1")
            .bind(id.0)
            .execute(&*self.pool)
            .await
            .map_err(|e| queue_error("discard", e))?;
        Ok(result.rows_affected() > 0)
    }

    async fn len(&self) -> Result<u64, QueueError> {
        let count: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM pending_operations")
            .fetch_one(&*self.pool)
            .await
            .map_err(|e| queue_error("len", e))?;
        Ok(count.max(0) as u64)
    }
}

#[derive(Debug, Clone)]
pub struct PostgresSyncStatusStore {
    pool: Arc<PgPool>,
}

impl PostgresSyncStatusStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool: Arc::new(pool) }
    }
}

fn status_error(operation: &str, err: sqlx::Error) -> RepositoryError {
    RepositoryError::Storage(sqlx_message(operation, err))
}

fn row_to_status_entry(row: &sqlx::postgres::PgRow) -> Result<SyncStatusEntry, RepositoryError> {
    Ok(SyncStatusEntry {
        key: row.try_get("key").map_err(|e| status_error("decode key", e))?,
        value: row.try_get("value").map_err(|e| status_error("decode value", e))?,
        updated_at: row
            .try_get("updated_at")
            .map_err(|e| status_error("decode updated_at", e))?,
    })
}

#[async_trait]
impl SyncStatusStore for PostgresSyncStatusStore {
    #[instrument(skip(self), err)]
    async fn upsert(&self, key: &str, value: &str) -> Result<SyncStatusEntry, RepositoryError> {
        let row = sqlx::query(
            r#"
            INSERT INTO sync_status (key, value, updated_at)
            VALUES ($1, $2, NOW())
            ON CONFLICT (key) DO UPDATE SET value = EXCLUDED.value, updated_at = EXCLUDED.updated_at
            RETURNING key, value, updated_at
            "#,
        )
        .bind(key)
        .bind(value)
        .fetch_one(&*self.pool)
        .await
        .map_err(|e| status_error("upsert sync_status", e))?;
        row_to_status_entry(&row)
    }

    async fn get(&self, key: &str) -> Result<Option<SyncStatusEntry>, RepositoryError> {
        let row = sqlx::query("SELECT key, value, updated_at FROM sync_status WHERE key = $1")
            .bind(key)
            .fetch_optional(&*self.pool)
            .await
            .map_err(|e| status_error("get sync_status", e))?;
        row.as_ref().map(row_to_status_entry).transpose()
    }

    async fn all(&self) -> Result<Vec<SyncStatusEntry>, RepositoryError> {
        let rows = sqlx::query("SELECT key, value, updated_at FROM sync_status ORDER BY key ASC")
            .fetch_all(&*self.pool)
            .await
            .map_err(|e| status_error("list sync_status", e))?;
        rows.iter().map(row_to_status_entry).collect()
    }
}
