//! Postgres-backed job store.
//!
//! Progress writes lock the job row (`SELECT ... FOR UPDATE`) and apply the
//! same transition rules as the in-memory store, so concurrent workers never
//! lose increments.

use std::collections::BTreeMap;
use std::sync::Arc;

use async_trait::async_trait;
use serde_json::Value as JsonValue;
use sqlx::{PgPool, Postgres, Row, Transaction};
use tracing::instrument;

use rotv_core::DestinationId;

use crate::db::sqlx_message;

use super::store::{JobStore, JobStoreError, check_mark_running, check_mark_terminal};
use super::types::{Job, JobId, JobStatus, MAX_UNITS};

const JOB_COLUMNS: &str = "id, job_type, status, total_units, processed_units, result_counters, \
     error_message, checkpoint, unit_failures, created_at, started_at, completed_at";

fn storage(operation: &str, err: sqlx::Error) -> JobStoreError {
    JobStoreError::Storage(sqlx_message(operation, err))
}

fn json<T: serde::Serialize>(value: &T) -> Result<JsonValue, JobStoreError> {
    serde_json::to_value(value).map_err(|e| JobStoreError::Storage(format!("encode job: {e}")))
}

fn from_json<T: serde::de::DeserializeOwned>(value: JsonValue) -> Result<T, JobStoreError> {
    serde_json::from_value(value).map_err(|e| JobStoreError::Storage(format!("decode job: {e}")))
}

/// Unit counts never exceed `MAX_UNITS`, which fits an `INTEGER` column.
fn count_column(n: u32) -> Result<i32, JobStoreError> {
    i32::try_from(n).map_err(|_| JobStoreError::TooManyUnits {
        count: n as usize,
        max: MAX_UNITS,
    })
}

fn row_to_job(row: &sqlx::postgres::PgRow) -> Result<Job, JobStoreError> {
    let decode = |e: sqlx::Error| storage("decode job", e);
    let status: String = row.try_get("status").map_err(decode)?;
    let total_units: i32 = row.try_get("total_units").map_err(decode)?;
    let processed_units: i32 = row.try_get("processed_units").map_err(decode)?;

    Ok(Job {
        id: JobId::from_uuid(row.try_get("id").map_err(decode)?),
        job_type: row.try_get("job_type").map_err(decode)?,
        status: status.parse().map_err(JobStoreError::Storage)?,
        total_units: u32::try_from(total_units).unwrap_or(0),
        processed_units: u32::try_from(processed_units).unwrap_or(0),
        result_counters: from_json(row.try_get("result_counters").map_err(decode)?)?,
        error_message: row.try_get("error_message").map_err(decode)?,
        checkpoint: from_json(row.try_get("checkpoint").map_err(decode)?)?,
        unit_failures: from_json(row.try_get("unit_failures").map_err(decode)?)?,
        created_at: row.try_get("created_at").map_err(decode)?,
        started_at: row.try_get("started_at").map_err(decode)?,
        completed_at: row.try_get("completed_at").map_err(decode)?,
    })
}

#[derive(Debug, Clone)]
pub struct PostgresJobStore {
    pool: Arc<PgPool>,
}

impl PostgresJobStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool: Arc::new(pool) }
    }

    async fn lock_job(
        tx: &mut Transaction<'static, Postgres>,
        job_id: JobId,
    ) -> Result<Job, JobStoreError> {
        let row = sqlx::query(&format!("SELECT {JOB_COLUMNS} FROM jobs WHERE id = $1 FOR UPDATE"))
            .bind(job_id.0)
            .fetch_optional(&mut **tx)
            .await
            .map_err(|e| storage("lock job", e))?
            .ok_or(JobStoreError::NotFound(job_id))?;
        row_to_job(&row)
    }

    async fn write_job(tx: &mut Transaction<'static, Postgres>, job: &Job) -> Result<(), JobStoreError> {
        sqlx::query(
            r#"
            UPDATE jobs SET
                status = $2,
                processed_units = $3,
                result_counters = $4,
                error_message = $5,
                checkpoint = $6,
                unit_failures = $7,
                started_at = $8,
                completed_at = $9
            WHERE id = $1
            "#,
        )
        .bind(job.id.0)
        .bind(job.status.as_str())
        .bind(count_column(job.processed_units)?)
        .bind(json(&job.result_counters)?)
        .bind(&job.error_message)
        .bind(json(&job.checkpoint)?)
        .bind(json(&job.unit_failures)?)
        .bind(job.started_at)
        .bind(job.completed_at)
        .execute(&mut **tx)
        .await
        .map_err(|e| storage("update job", e))?;
        Ok(())
    }

    /// Lock the job row, run `f` on it, persist the result when `f` reports a
    /// change, and commit.
    async fn modify<T, F>(&self, job_id: JobId, f: F) -> Result<T, JobStoreError>
    where
        F: FnOnce(&mut Job) -> Result<(T, bool), JobStoreError> + Send,
        T: Send,
    {
        let mut tx = self.pool.begin().await.map_err(|e| storage("begin", e))?;
        let mut job = Self::lock_job(&mut tx, job_id).await?;
        let (out, changed) = f(&mut job)?;
        if changed {
            Self::write_job(&mut tx, &job).await?;
        }
        tx.commit().await.map_err(|e| storage("commit", e))?;
        Ok(out)
    }

    async fn select_where(&self, clause: &str, status: Option<&str>) -> Result<Vec<Job>, JobStoreError> {
        let sql = format!("SELECT {JOB_COLUMNS} FROM jobs {clause}");
        let mut query = sqlx::query(&sql);
        if let Some(status) = status {
            query = query.bind(status);
        }
        let rows = query
            .fetch_all(&*self.pool)
            .await
            .map_err(|e| storage("select jobs", e))?;
        rows.iter().map(row_to_job).collect()
    }
}

#[async_trait]
impl JobStore for PostgresJobStore {
    #[instrument(skip(self, unit_ids), fields(units = unit_ids.len()), err)]
    async fn create_job(&self, job_type: &str, unit_ids: Vec<DestinationId>) -> Result<Job, JobStoreError> {
        let job = Job::new(job_type, unit_ids)?;
        sqlx::query(
            r#"
            INSERT INTO jobs
                (id, job_type, status, total_units, processed_units, result_counters,
                 error_message, checkpoint, unit_failures, created_at, started_at, completed_at)
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12)
            "#,
        )
        .bind(job.id.0)
        .bind(&job.job_type)
        .bind(job.status.as_str())
        .bind(count_column(job.total_units)?)
        .bind(count_column(job.processed_units)?)
        .bind(json(&job.result_counters)?)
        .bind(&job.error_message)
        .bind(json(&job.checkpoint)?)
        .bind(json(&job.unit_failures)?)
        .bind(job.created_at)
        .bind(job.started_at)
        .bind(job.completed_at)
        .execute(&*self.pool)
        .await
        .map_err(|e| storage("insert job", e))?;
        Ok(job)
    }

    async fn get(&self, job_id: JobId) -> Result<Option<Job>, JobStoreError> {
        let row = sqlx::query(&format!("SELECT {JOB_COLUMNS} FROM jobs WHERE id = $1"))
            .bind(job_id.0)
            .fetch_optional(&*self.pool)
            .await
            .map_err(|e| storage("get job", e))?;
        row.as_ref().map(row_to_job).transpose()
    }

    async fn list_recent(&self, limit: usize) -> Result<Vec<Job>, JobStoreError> {
        let rows = sqlx::query(&format!(
            "SELECT {JOB_COLUMNS} FROM jobs ORDER BY created_at DESC, id DESC LIMIT $1"
        ))
        .bind(limit.min(i64::MAX as usize) as i64)
        .fetch_all(&*self.pool)
        .await
        .map_err(|e| storage("list jobs", e))?;
        rows.iter().map(row_to_job).collect()
    }

    #[instrument(skip(self), err)]
    async fn mark_running(&self, job_id: JobId) -> Result<Job, JobStoreError> {
        self.modify(job_id, |job| {
            check_mark_running(job)?;
            job.mark_running();
            Ok((job.clone(), true))
        })
        .await
    }

    async fn record_progress(
        &self,
        job_id: JobId,
        unit_id: DestinationId,
        counters: &BTreeMap<String, u64>,
    ) -> Result<bool, JobStoreError> {
        let counters = counters.clone();
        self.modify(job_id, move |job| {
            let applied = job.apply_progress(unit_id, &counters);
            Ok((applied, applied))
        })
        .await
    }

    async fn record_unit_failure(
        &self,
        job_id: JobId,
        unit_id: DestinationId,
        error: &str,
    ) -> Result<bool, JobStoreError> {
        let error = error.to_string();
        self.modify(job_id, move |job| {
            let applied = job.apply_unit_failure(unit_id, &error);
            Ok((applied, applied))
        })
        .await
    }

    #[instrument(skip(self, error_message), err)]
    async fn mark_terminal(
        &self,
        job_id: JobId,
        status: JobStatus,
        error_message: Option<String>,
    ) -> Result<Job, JobStoreError> {
        self.modify(job_id, move |job| {
            check_mark_terminal(job, status)?;
            job.mark_terminal(status, error_message);
            Ok((job.clone(), true))
        })
        .await
    }

    async fn find_incomplete_jobs(&self) -> Result<Vec<Job>, JobStoreError> {
        self.select_where(
            "WHERE status IN ('pending', 'running') ORDER BY created_at ASC, id ASC",
            None,
        )
        .await
    }

    async fn find_by_status(&self, status: JobStatus) -> Result<Vec<Job>, JobStoreError> {
        self.select_where("WHERE status = $1 ORDER BY created_at ASC, id ASC", Some(status.as_str()))
            .await
    }
}
