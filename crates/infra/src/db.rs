//! Database adapters: connection pool and idempotent schema bootstrap.

use anyhow::Context;
use sqlx::PgPool;
use sqlx::postgres::PgPoolOptions;
use tracing::info;

const SCHEMA: &[(&str, &str)] = &[
    (
        "pending_operations",
        r#"
        CREATE TABLE IF NOT EXISTS pending_operations (
            seq          BIGSERIAL PRIMARY KEY,
            id           UUID NOT NULL UNIQUE,
            kind         TEXT NOT NULL,
            entity_type  TEXT NOT NULL,
            entity_id    UUID NOT NULL,
            payload      JSONB NOT NULL,
            enqueued_at  TIMESTAMPTZ NOT NULL
        )
        "#,
    ),
    (
        "pending_operations_order_idx",
        "CREATE INDEX IF NOT EXISTS pending_operations_order_idx ON pending_operations (enqueued_at, seq)",
    ),
    (
        "sync_status",
        r#"
        CREATE TABLE IF NOT EXISTS sync_status (
            key         TEXT PRIMARY KEY,
            value       TEXT NOT NULL,
            updated_at  TIMESTAMPTZ NOT NULL
        )
        "#,
    ),
    (
        "jobs",
        r#"
        CREATE TABLE IF NOT EXISTS jobs (
            id               UUID PRIMARY KEY,
            job_type         TEXT NOT NULL,
            status           TEXT NOT NULL,
            total_units      INTEGER NOT NULL CHECK (total_units >= 0),
            processed_units  INTEGER NOT NULL CHECK (processed_units >= 0),
            result_counters  JSONB NOT NULL,
            error_message    TEXT NULL,
            checkpoint       JSONB NOT NULL,
            unit_failures    JSONB NOT NULL,
            created_at       TIMESTAMPTZ NOT NULL,
            started_at       TIMESTAMPTZ NULL,
            completed_at     TIMESTAMPTZ NULL,
            CHECK (processed_units <= total_units)
        )
        "#,
    ),
    (
        "jobs_status_idx",
        "CREATE INDEX IF NOT EXISTS jobs_status_idx ON jobs (status)",
    ),
    (
        "destinations",
        r#"
        CREATE TABLE IF NOT EXISTS destinations (
            id             UUID PRIMARY KEY,
            name           TEXT NOT NULL UNIQUE,
            latitude       DOUBLE PRECISION NULL,
            longitude      DOUBLE PRECISION NULL,
            category       TEXT NULL,
            description    TEXT NULL,
            website        TEXT NULL,
            image_file_id  TEXT NULL,
            synced         BOOLEAN NOT NULL DEFAULT FALSE,
            updated_at     TIMESTAMPTZ NOT NULL
        )
        "#,
    ),
    (
        "enrichment_records",
        r#"
        CREATE TABLE IF NOT EXISTS enrichment_records (
            destination_id     UUID PRIMARY KEY,
            provider           TEXT NOT NULL,
            results_found      INTEGER NOT NULL,
            structured_fields  JSONB NOT NULL,
            sources            JSONB NOT NULL,
            collected_at       TIMESTAMPTZ NOT NULL
        )
        "#,
    ),
];

pub async fn connect(database_url: &str) -> anyhow::Result<PgPool> {
    PgPoolOptions::new()
        .max_connections(10)
        .connect(database_url)
        .await
        .context("failed to connect to Postgres")
}

/// Create every table the sync and job core needs. Safe to run on each start.
pub async fn bootstrap(pool: &PgPool) -> anyhow::Result<()> {
    for (name, statement) in SCHEMA {
        sqlx::query(statement)
            .execute(pool)
            .await
            .with_context(|| format!("failed to create {name}"))?;
    }
    info!(objects = SCHEMA.len(), "database schema ready");
    Ok(())
}

pub(crate) fn sqlx_message(operation: &str, err: sqlx::Error) -> String {
    match err {
        sqlx::Error::Database(db_err) => format!("database error in {operation}: {}", db_err.message()),
        sqlx::Error::PoolClosed => format!("connection pool closed in {operation}"),
        other => format!("{operation}: {other}"),
    }
}
