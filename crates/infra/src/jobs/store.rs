//! Job storage implementations.

use std::collections::{BTreeMap, HashMap};
use std::sync::{Arc, RwLock};

use async_trait::async_trait;

use rotv_core::DestinationId;

use super::types::{Job, JobId, JobStatus};

/// Job store abstraction.
///
/// Progress writes are atomic per job: concurrent workers recording different
/// units never lose an increment, and a unit is counted at most once.
#[async_trait]
pub trait JobStore: Send + Sync {
    /// Insert a pending job covering `unit_ids`.
    async fn create_job(&self, job_type: &str, unit_ids: Vec<DestinationId>) -> Result<Job, JobStoreError>;

    async fn get(&self, job_id: JobId) -> Result<Option<Job>, JobStoreError>;

    /// Most recently created first.
    async fn list_recent(&self, limit: usize) -> Result<Vec<Job>, JobStoreError>;

    /// Move a pending, running or cancelled job to running.
    async fn mark_running(&self, job_id: JobId) -> Result<Job, JobStoreError>;

    /// Count `unit_id` as processed and merge `counters` into the job's
    /// result counters. Returns `false` when ignored (job not running, or the
    /// unit was already processed).
    async fn record_progress(
        &self,
        job_id: JobId,
        unit_id: DestinationId,
        counters: &BTreeMap<String, u64>,
    ) -> Result<bool, JobStoreError>;

    /// Count `unit_id` as processed and failed.
    async fn record_unit_failure(
        &self,
        job_id: JobId,
        unit_id: DestinationId,
        error: &str,
    ) -> Result<bool, JobStoreError>;

    /// Set a terminal status. Fails if the job is already terminal.
    async fn mark_terminal(
        &self,
        job_id: JobId,
        status: JobStatus,
        error_message: Option<String>,
    ) -> Result<Job, JobStoreError>;

    /// Jobs left pending or running, oldest first.
    async fn find_incomplete_jobs(&self) -> Result<Vec<Job>, JobStoreError>;

    /// Oldest first.
    async fn find_by_status(&self, status: JobStatus) -> Result<Vec<Job>, JobStoreError>;
}

/// Job store error.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum JobStoreError {
    #[error("job not found: {0}")]
    NotFound(JobId),
    #[error("job {id} is already {status:?}")]
    AlreadyTerminal { id: JobId, status: JobStatus },
    #[error("invalid transition for job {id}: {from:?} -> {to:?}")]
    InvalidTransition {
        id: JobId,
        from: JobStatus,
        to: JobStatus,
    },
    #[error("job has {count} units; at most {max} are supported")]
    TooManyUnits { count: usize, max: u32 },
    #[error("storage error: {0}")]
    Storage(String),
}

/// Shared state-transition rules for every store implementation.
pub(crate) fn check_mark_running(job: &Job) -> Result<(), JobStoreError> {
    match job.status {
        JobStatus::Pending | JobStatus::Running | JobStatus::Cancelled => Ok(()),
        from => Err(JobStoreError::InvalidTransition {
            id: job.id,
            from,
            to: JobStatus::Running,
        }),
    }
}

pub(crate) fn check_mark_terminal(job: &Job, to: JobStatus) -> Result<(), JobStoreError> {
    if job.status.is_terminal() {
        return Err(JobStoreError::AlreadyTerminal {
            id: job.id,
            status: job.status,
        });
    }
    if !to.is_terminal() {
        return Err(JobStoreError::InvalidTransition {
            id: job.id,
            from: job.status,
            to,
        });
    }
    Ok(())
}

/// In-memory job store for tests/dev.
#[derive(Debug, Default)]
pub struct InMemoryJobStore {
    jobs: RwLock<HashMap<JobId, Job>>,
}

impl InMemoryJobStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn arc() -> Arc<Self> {
        Arc::new(Self::new())
    }

    /// Insert a job as-is (used to simulate state left by a previous process).
    pub fn insert(&self, job: Job) -> Result<(), JobStoreError> {
        self.write(|jobs| {
            jobs.insert(job.id, job);
            Ok(())
        })
    }

    fn read<T>(&self, f: impl FnOnce(&HashMap<JobId, Job>) -> T) -> Result<T, JobStoreError> {
        let jobs = self
            .jobs
            .read()
            .map_err(|_| JobStoreError::Storage("lock poisoned".into()))?;
        Ok(f(&jobs))
    }

    fn write<T>(
        &self,
        f: impl FnOnce(&mut HashMap<JobId, Job>) -> Result<T, JobStoreError>,
    ) -> Result<T, JobStoreError> {
        let mut jobs = self
            .jobs
            .write()
            .map_err(|_| JobStoreError::Storage("lock poisoned".into()))?;
        f(&mut jobs)
    }

    fn update<T>(&self, job_id: JobId, f: impl FnOnce(&mut Job) -> Result<T, JobStoreError>) -> Result<T, JobStoreError> {
        self.write(|jobs| {
            let job = jobs.get_mut(&job_id).ok_or(JobStoreError::NotFound(job_id))?;
            f(job)
        })
    }

    fn sorted(mut jobs: Vec<Job>) -> Vec<Job> {
        jobs.sort_by_key(|j| (j.created_at, j.id.0));
        jobs
    }
}

#[async_trait]
impl JobStore for InMemoryJobStore {
    async fn create_job(&self, job_type: &str, unit_ids: Vec<DestinationId>) -> Result<Job, JobStoreError> {
        let job = Job::new(job_type, unit_ids)?;
        self.insert(job.clone())?;
        Ok(job)
    }

    async fn get(&self, job_id: JobId) -> Result<Option<Job>, JobStoreError> {
        self.read(|jobs| jobs.get(&job_id).cloned())
    }

    async fn list_recent(&self, limit: usize) -> Result<Vec<Job>, JobStoreError> {
        let mut jobs = Self::sorted(self.read(|jobs| jobs.values().cloned().collect())?);
        jobs.reverse();
        jobs.truncate(limit);
        Ok(jobs)
    }

    async fn mark_running(&self, job_id: JobId) -> Result<Job, JobStoreError> {
        self.update(job_id, |job| {
            check_mark_running(job)?;
            job.mark_running();
            Ok(job.clone())
        })
    }

    async fn record_progress(
        &self,
        job_id: JobId,
        unit_id: DestinationId,
        counters: &BTreeMap<String, u64>,
    ) -> Result<bool, JobStoreError> {
        self.update(job_id, |job| Ok(job.apply_progress(unit_id, counters)))
    }

    async fn record_unit_failure(
        &self,
        job_id: JobId,
        unit_id: DestinationId,
        error: &str,
    ) -> Result<bool, JobStoreError> {
        self.update(job_id, |job| Ok(job.apply_unit_failure(unit_id, error)))
    }

    async fn mark_terminal(
        &self,
        job_id: JobId,
        status: JobStatus,
        error_message: Option<String>,
    ) -> Result<Job, JobStoreError> {
        self.update(job_id, |job| {
            check_mark_terminal(job, status)?;
            job.mark_terminal(status, error_message);
            Ok(job.clone())
        })
    }

    async fn find_incomplete_jobs(&self) -> Result<Vec<Job>, JobStoreError> {
        let jobs = self.read(|jobs| {
            jobs.values()
                .filter(|j| matches!(j.status, JobStatus::Pending | JobStatus::Running))
                .cloned()
                .collect()
        })?;
        Ok(Self::sorted(jobs))
    }

    async fn find_by_status(&self, status: JobStatus) -> Result<Vec<Job>, JobStoreError> {
        let jobs = self.read(|jobs| jobs.values().filter(|j| j.status == status).cloned().collect())?;
        Ok(Self::sorted(jobs))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::jobs::types::{ITEMS_FOUND, NEWS_COLLECTION};

    fn units(n: usize) -> Vec<DestinationId> {
        (0..n).map(|_| DestinationId::new()).collect()
    }

    #[tokio::test]
    async fn lifecycle_pending_running_completed() {
        let store = InMemoryJobStore::new();
        let ids = units(2);
        let job = store.create_job(NEWS_COLLECTION, ids.clone()).await.unwrap();
        assert_eq!(job.status, JobStatus::Pending);
        assert_eq!(job.total_units, 2);

        store.mark_running(job.id).await.unwrap();
        for id in &ids {
            assert!(store.record_progress(job.id, *id, &BTreeMap::new()).await.unwrap());
        }
        let done = store.mark_terminal(job.id, JobStatus::Completed, None).await.unwrap();
        assert_eq!(done.processed_units, 2);
        assert!(done.completed_at.is_some());

        let again = store.mark_terminal(job.id, JobStatus::Failed, None).await;
        assert!(matches!(again, Err(JobStoreError::AlreadyTerminal { .. })));
        assert!(matches!(
            store.mark_running(job.id).await,
            Err(JobStoreError::InvalidTransition { .. })
        ));
    }

    #[tokio::test]
    async fn concurrent_progress_never_loses_increments() {
        let store = InMemoryJobStore::arc();
        let ids = units(64);
        let job = store.create_job(NEWS_COLLECTION, ids.clone()).await.unwrap();
        store.mark_running(job.id).await.unwrap();

        let mut handles = Vec::new();
        for id in ids {
            let store = store.clone();
            handles.push(tokio::spawn(async move {
                let counters = BTreeMap::from([(ITEMS_FOUND.to_string(), 2)]);
                store.record_progress(job.id, id, &counters).await.unwrap();
                // Duplicate delivery of the same unit is ignored.
                store.record_progress(job.id, id, &counters).await.unwrap();
            }));
        }
        for h in handles {
            h.await.unwrap();
        }

        let job = store.get(job.id).await.unwrap().unwrap();
        assert_eq!(job.processed_units, 64);
        assert_eq!(job.result_counters[ITEMS_FOUND], 128);
    }

    #[tokio::test]
    async fn incomplete_jobs_exclude_terminal_ones() {
        let store = InMemoryJobStore::new();
        let a = store.create_job(NEWS_COLLECTION, units(1)).await.unwrap();
        let b = store.create_job(NEWS_COLLECTION, units(1)).await.unwrap();
        let c = store.create_job(NEWS_COLLECTION, units(1)).await.unwrap();
        store.mark_running(b.id).await.unwrap();
        store.mark_running(c.id).await.unwrap();
        store.mark_terminal(c.id, JobStatus::Cancelled, None).await.unwrap();

        let incomplete: Vec<_> = store
            .find_incomplete_jobs()
            .await
            .unwrap()
            .into_iter()
            .map(|j| j.id)
            .collect();
        assert_eq!(incomplete, vec![a.id, b.id]);
        assert_eq!(store.find_by_status(JobStatus::Cancelled).await.unwrap()[0].id, c.id);
        assert_eq!(store.list_recent(1).await.unwrap()[0].id, c.id);
    }
}
