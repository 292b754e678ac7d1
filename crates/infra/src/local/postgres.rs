//! Postgres-backed local repositories.

use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde_json::Value as JsonValue;
use sqlx::{PgPool, Row};
use tracing::instrument;

use rotv_core::{Coordinates, Destination, DestinationId, EnrichmentRecord};

use crate::db::sqlx_message;

use super::{DestinationRepository, EnrichmentRepository, RepositoryError};

fn storage(operation: &str, err: sqlx::Error) -> RepositoryError {
    RepositoryError::Storage(sqlx_message(operation, err))
}

fn decode(err: sqlx::Error) -> RepositoryError {
    RepositoryError::Serialization(err.to_string())
}

const DESTINATION_COLUMNS: &str =
    "id, name, latitude, longitude, category, description, website, image_file_id, synced, updated_at";

fn row_to_destination(row: &sqlx::postgres::PgRow) -> Result<Destination, RepositoryError> {
    let coordinates = Coordinates::from_optional(
        row.try_get("latitude").map_err(decode)?,
        row.try_get("longitude").map_err(decode)?,
    )
    .map_err(|e| RepositoryError::Serialization(e.to_string()))?;

    Ok(Destination {
        id: DestinationId::from_uuid(row.try_get("id").map_err(decode)?),
        name: row.try_get("name").map_err(decode)?,
        coordinates,
        category: row.try_get("category").map_err(decode)?,
        description: row.try_get("description").map_err(decode)?,
        website: row.try_get("website").map_err(decode)?,
        image_file_id: row.try_get("image_file_id").map_err(decode)?,
        synced: row.try_get("synced").map_err(decode)?,
        updated_at: row.try_get("updated_at").map_err(decode)?,
    })
}

async fn insert_destination<'e, E>(executor: E, d: &Destination) -> Result<(), sqlx::Error>
where
    E: sqlx::Executor<'e, Database = sqlx::Postgres>,
{
    sqlx::query(
        r#"
        INSERT INTO destinations
            (id, name, latitude, longitude, category, description, website, image_file_id, synced, updated_at)
        VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10)
        ON CONFLICT (id) DO UPDATE SET
            name = EXCLUDED.name,
            latitude = EXCLUDED.latitude,
            longitude = EXCLUDED.longitude,
            category = EXCLUDED.category,
            description = EXCLUDED.description,
            website = EXCLUDED.website,
            image_file_id = EXCLUDED.image_file_id,
            synced = EXCLUDED.synced,
            updated_at = EXCLUDED.updated_at
        "#,
    )
    .bind(d.id.as_uuid())
    .bind(&d.name)
    .bind(d.coordinates.map(|c| c.latitude()))
    .bind(d.coordinates.map(|c| c.longitude()))
    .bind(&d.category)
    .bind(&d.description)
    .bind(&d.website)
    .bind(&d.image_file_id)
    .bind(d.synced)
    .bind(d.updated_at)
    .execute(executor)
    .await
    .map(|_| ())
}

#[derive(Debug, Clone)]
pub struct PostgresDestinationRepository {
    pool: Arc<PgPool>,
}

impl PostgresDestinationRepository {
    pub fn new(pool: PgPool) -> Self {
        Self { pool: Arc::new(pool) }
    }
}

#[async_trait]
impl DestinationRepository for PostgresDestinationRepository {
    async fn list(&self) -> Result<Vec<Destination>, RepositoryError> {
        let rows = sqlx::query(&format!(
            "SELECT {DESTINATION_COLUMNS} FROM destinations ORDER BY name ASC"
        ))
        .fetch_all(&*self.pool)
        .await
        .map_err(|e| storage("list destinations", e))?;
        rows.iter().map(row_to_destination).collect()
    }

    async fn get(&self, id: DestinationId) -> Result<Option<Destination>, RepositoryError> {
        let row = sqlx::query(&format!("SELECT {DESTINATION_COLUMNS} FROM destinations WHERE id = $1"))
            .bind(id.as_uuid())
            .fetch_optional(&*self.pool)
            .await
            .map_err(|e| storage("get destination", e))?;
        row.as_ref().map(row_to_destination).transpose()
    }

    #[instrument(skip(self, destination), fields(destination_id = %destination.id), err)]
    async fn upsert(&self, destination: &Destination) -> Result<(), RepositoryError> {
        insert_destination(&*self.pool, destination)
            .await
            .map_err(|e| storage("upsert destination", e))
    }

    async fn delete(&self, id: DestinationId) -> Result<bool, RepositoryError> {
        let result = sqlx::query("DELETE FROM destinations WHERE id = $1")
            .bind(id.as_uuid())
            .execute(&*self.pool)
            .await
            .map_err(|e| storage("delete destination", e))?;
        Ok(result.rows_affected() > 0)
    }

    async fn mark_synced(&self, id: DestinationId, as_of: DateTime<Utc>) -> Result<bool, RepositoryError> {
        let result = sqlx::query("UPDATE destinations SET synced = TRUE WHERE id = $1 AND updated_at = $2")
            .bind(id.as_uuid())
            .bind(as_of)
            .execute(&*self.pool)
            .await
            .map_err(|e| storage("mark destination synced", e))?;
        Ok(result.rows_affected() > 0)
    }

    #[instrument(skip(self, destinations), fields(count = destinations.len()), err)]
    async fn replace_all(&self, destinations: Vec<Destination>) -> Result<(), RepositoryError> {
        let mut tx = self
            .pool
            .begin()
            .await
            .map_err(|e| storage("begin replace_all", e))?;

        sqlx::query("DELETE FROM destinations")
            .execute(&mut *tx)
            .await
            .map_err(|e| storage("clear destinations", e))?;
        for d in &destinations {
            insert_destination(&mut *tx, d)
                .await
                .map_err(|e| storage("insert destination", e))?;
        }

        tx.commit().await.map_err(|e| storage("commit replace_all", e))
    }
}

#[derive(Debug, Clone)]
pub struct PostgresEnrichmentRepository {
    pool: Arc<PgPool>,
}

impl PostgresEnrichmentRepository {
    pub fn new(pool: PgPool) -> Self {
        Self { pool: Arc::new(pool) }
    }
}

#[async_trait]
impl EnrichmentRepository for PostgresEnrichmentRepository {
    #[instrument(skip(self, record), fields(destination_id = %record.destination_id), err)]
    async fn upsert(&self, record: &EnrichmentRecord) -> Result<(), RepositoryError> {
        let sources = serde_json::to_value(&record.sources)
            .map_err(|e| RepositoryError::Serialization(e.to_string()))?;
        sqlx::query(
            r#"
            INSERT INTO enrichment_records
                (destination_id, provider, results_found, structured_fields, sources, collected_at)
            VALUES ($1, $2, $3, $4, $5, $6)
            ON CONFLICT (destination_id) DO UPDATE SET
                provider = EXCLUDED.provider,
                results_found = EXCLUDED.results_found,
                structured_fields = EXCLUDED.structured_fields,
                sources = EXCLUDED.sources,
                collected_at = EXCLUDED.collected_at
            "#,
        )
        .bind(record.destination_id.as_uuid())
        .bind(&record.provider)
        .bind(i32::try_from(record.results_found).unwrap_or(i32::MAX))
        .bind(&record.structured_fields)
        .bind(sources)
        .bind(record.collected_at)
        .execute(&*self.pool)
        .await
        .map_err(|e| storage("upsert enrichment", e))?;
        Ok(())
    }

    async fn get(&self, destination_id: DestinationId) -> Result<Option<EnrichmentRecord>, RepositoryError> {
        let row = sqlx::query(
            r#"
            SELECT destination_id, provider, results_found, structured_fields, sources, collected_at
            FROM enrichment_records
            WHERE destination_id = $1
            "#,
        )
        .bind(destination_id.as_uuid())
        .fetch_optional(&*self.pool)
        .await
        .map_err(|e| storage("get enrichment", e))?;

        let Some(row) = row else {
            return Ok(None);
        };
        let sources: JsonValue = row.try_get("sources").map_err(decode)?;
        let results_found: i32 = row.try_get("results_found").map_err(decode)?;
        Ok(Some(EnrichmentRecord {
            destination_id: DestinationId::from_uuid(row.try_get("destination_id").map_err(decode)?),
            provider: row.try_get("provider").map_err(decode)?,
            results_found: results_found.max(0) as u32,
            structured_fields: row.try_get("structured_fields").map_err(decode)?,
            sources: serde_json::from_value(sources)
                .map_err(|e| RepositoryError::Serialization(e.to_string()))?,
            collected_at: row.try_get("collected_at").map_err(decode)?,
        }))
    }

    async fn count(&self) -> Result<u64, RepositoryError> {
        let count: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM enrichment_records")
            .fetch_one(&*self.pool)
            .await
            .map_err(|e| storage("count enrichment", e))?;
        Ok(count.max(0) as u64)
    }
}
