//! Job Dispatcher: rate-limited, cancellable, resumable unit dispatch.
//!
//! One unit is admitted per `admission_interval`; admitted units run
//! concurrently in a `JoinSet`. Cancellation is polled at each dispatch
//! boundary only, so in-flight units always run to completion.

use std::collections::{BTreeMap, HashMap};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::task::{JoinHandle, JoinSet};
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use rotv_ai::{ProviderStats, UsageBudget};
use rotv_core::DestinationId;

use crate::local::RepositoryError;

use super::store::{JobStore, JobStoreError};
use super::types::{Job, JobId, JobStatus};
use super::worker::{UnitOutcome, UnitWorker};

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DispatcherConfig {
    pub admission_interval: Duration,
    /// Resume cancelled jobs at startup together with crashed ones.
    pub resume_cancelled: bool,
}

impl Default for DispatcherConfig {
    fn default() -> Self {
        Self {
            admission_interval: Duration::from_secs(1),
            resume_cancelled: false,
        }
    }
}

#[derive(Debug, Error)]
pub enum DispatchError {
    #[error("dispatcher is shutting down")]
    ShuttingDown,

    #[error("job not found: {0}")]
    NotFound(JobId),

    #[error(transparent)]
    Store(#[from] JobStoreError),

    #[error(transparent)]
    Repository(#[from] RepositoryError),

    #[error("active job registry unavailable")]
    RegistryPoisoned,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct SubmittedJob {
    pub job_id: JobId,
    pub total_units: u32,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct CancelAck {
    pub job_id: JobId,
    /// `false` when the job had already finished.
    pub accepted: bool,
    pub status: JobStatus,
}

/// Live status of a job for pollers.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct JobView {
    pub job_id: JobId,
    pub job_type: String,
    pub status: JobStatus,
    pub total_units: u32,
    pub processed_units: u32,
    pub result_counters: BTreeMap<String, u64>,
    pub error_message: Option<String>,
    pub failed_units: usize,
    /// A dispatch loop currently owns the job in this process.
    pub active: bool,
    pub created_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
}

impl JobView {
    fn new(job: Job, active: bool) -> Self {
        Self {
            job_id: job.id,
            job_type: job.job_type,
            status: job.status,
            total_units: job.total_units,
            processed_units: job.processed_units,
            result_counters: job.result_counters,
            error_message: job.error_message,
            failed_units: job.unit_failures.len(),
            active,
            created_at: job.created_at,
            started_at: job.started_at,
            completed_at: job.completed_at,
        }
    }
}

struct ActiveJob {
    job_type: String,
    cancel: CancellationToken,
}

struct Inner {
    jobs: Arc<dyn JobStore>,
    worker: Arc<UnitWorker>,
    config: DispatcherConfig,
    active: Mutex<HashMap<JobId, ActiveJob>>,
    loops: Mutex<Vec<JoinHandle<()>>>,
    shutdown: CancellationToken,
}

/// Why a dispatch loop stopped admitting units.
enum Stop {
    Exhausted,
    Cancelled,
    Shutdown,
    Fatal(String),
}

#[derive(Clone)]
pub struct JobDispatcher {
    inner: Arc<Inner>,
}

impl JobDispatcher {
    pub fn new(jobs: Arc<dyn JobStore>, worker: Arc<UnitWorker>, config: DispatcherConfig) -> Self {
        Self {
            inner: Arc::new(Inner {
                jobs,
                worker,
                config,
                active: Mutex::new(HashMap::new()),
                loops: Mutex::new(Vec::new()),
                shutdown: CancellationToken::new(),
            }),
        }
    }

    /// Create a job over `unit_ids` and start dispatching it.
    pub async fn submit_job(
        &self,
        job_type: &str,
        unit_ids: Vec<DestinationId>,
    ) -> Result<SubmittedJob, DispatchError> {
        if self.inner.shutdown.is_cancelled() {
            return Err(DispatchError::ShuttingDown);
        }
        let job = self.inner.jobs.create_job(job_type, unit_ids).await?;
        let submitted = SubmittedJob {
            job_id: job.id,
            total_units: job.total_units,
        };
        self.start(job).await?;
        Ok(submitted)
    }

    /// Request cooperative cancellation.
    ///
    /// An active job stops at its next dispatch boundary. A non-terminal job
    /// no loop owns (left over from a previous process) is cancelled directly.
    pub async fn cancel_job(&self, job_id: JobId) -> Result<CancelAck, DispatchError> {
        let token = self.active_token(job_id);
        let job = self
            .inner
            .jobs
            .get(job_id)
            .await?
            .ok_or(DispatchError::NotFound(job_id))?;

        if let Some(token) = token {
            token.cancel();
            info!(job_id = %job_id, "cancellation requested");
            return Ok(CancelAck {
                job_id,
                accepted: true,
                status: job.status,
            });
        }
        if job.status.is_terminal() {
            return Ok(CancelAck {
                job_id,
                accepted: false,
                status: job.status,
            });
        }

        match self.inner.jobs.mark_terminal(job_id, JobStatus::Cancelled, None).await {
            Ok(job) => Ok(CancelAck {
                job_id,
                accepted: true,
                status: job.status,
            }),
            Err(JobStoreError::AlreadyTerminal { status, .. }) => Ok(CancelAck {
                job_id,
                accepted: false,
                status,
            }),
            Err(err) => Err(err.into()),
        }
    }

    pub async fn job(&self, job_id: JobId) -> Result<JobView, DispatchError> {
        let job = self
            .inner
            .jobs
            .get(job_id)
            .await?
            .ok_or(DispatchError::NotFound(job_id))?;
        let active = self.active_token(job_id).is_some();
        Ok(JobView::new(job, active))
    }

    pub async fn list_jobs(&self, limit: usize) -> Result<Vec<JobView>, DispatchError> {
        let jobs = self.inner.jobs.list_recent(limit).await?;
        Ok(jobs
            .into_iter()
            .map(|job| {
                let active = self.active_token(job.id).is_some();
                JobView::new(job, active)
            })
            .collect())
    }

    pub fn provider_stats(&self) -> ProviderStats {
        self.inner.worker.router().stats()
    }

    pub fn has_active_job(&self, job_type: &str) -> bool {
        self.inner
            .active
            .lock()
            .map(|active| active.values().any(|a| a.job_type == job_type))
            .unwrap_or(false)
    }

    /// Restart dispatch for jobs a previous process left unfinished, reusing
    /// the same job record and only the units its checkpoint has not seen.
    pub async fn resume_incomplete(&self) -> Result<Vec<JobId>, DispatchError> {
        let mut jobs = self.inner.jobs.find_incomplete_jobs().await?;
        if self.inner.config.resume_cancelled {
            jobs.extend(self.inner.jobs.find_by_status(JobStatus::Cancelled).await?);
        }

        let mut resumed = Vec::new();
        for job in jobs {
            if self.active_token(job.id).is_some() {
                continue;
            }
            info!(
                job_id = %job.id,
                status = job.status.as_str(),
                processed = job.processed_units,
                total = job.total_units,
                "resuming job"
            );
            let job_id = job.id;
            match self.start(job).await {
                Ok(()) => resumed.push(job_id),
                Err(err) => error!(job_id = %job_id, error = %err, "failed to resume job"),
            }
        }
        Ok(resumed)
    }

    /// Stop admitting units and wait for in-flight units to finish. Jobs are
    /// left running so the next process resumes them.
    pub async fn stop(&self) {
        self.inner.shutdown.cancel();
        let loops = match self.inner.loops.lock() {
            Ok(mut loops) => std::mem::take(&mut *loops),
            Err(_) => Vec::new(),
        };
        for handle in loops {
            if let Err(err) = handle.await {
                error!(error = %err, "dispatch loop panicked");
            }
        }
    }

    fn active_token(&self, job_id: JobId) -> Option<CancellationToken> {
        self.inner
            .active
            .lock()
            .ok()
            .and_then(|active| active.get(&job_id).map(|a| a.cancel.clone()))
    }

    async fn start(&self, job: Job) -> Result<(), DispatchError> {
        if self.inner.shutdown.is_cancelled() {
            return Err(DispatchError::ShuttingDown);
        }

        // Register before the job is marked running so a running job is
        // always cancellable.
        let cancel = CancellationToken::new();
        let first_active = {
            let mut active = self.inner.active.lock().map_err(|_| {
                error!(job_id = %job.id, "active job registry poisoned; job not started");
                DispatchError::RegistryPoisoned
            })?;
            let first = active.is_empty();
            active.insert(
                job.id,
                ActiveJob {
                    job_type: job.job_type.clone(),
                    cancel: cancel.clone(),
                },
            );
            first
        };

        let job = match self.inner.jobs.mark_running(job.id).await {
            Ok(job) => job,
            Err(err) => {
                self.deregister(job.id);
                return Err(err.into());
            }
        };

        // Reporting counters and the cooldown span overlapping jobs.
        if first_active {
            self.inner.worker.router().reset_usage();
        }
        let budget = Arc::new(UsageBudget::new());

        let inner = self.inner.clone();
        let handle = tokio::spawn(async move {
            let job_id = job.id;
            run_job(&inner, job, cancel, budget).await;
            if let Ok(mut active) = inner.active.lock() {
                active.remove(&job_id);
            }
        });
        if let Ok(mut loops) = self.inner.loops.lock() {
            loops.retain(|h| !h.is_finished());
            loops.push(handle);
        }
        Ok(())
    }

    fn deregister(&self, job_id: JobId) {
        if let Ok(mut active) = self.inner.active.lock() {
            active.remove(&job_id);
        }
    }
}

async fn run_job(inner: &Inner, job: Job, cancel: CancellationToken, budget: Arc<UsageBudget>) {
    let job_id = job.id;
    let remaining = job.checkpoint.remaining();
    info!(
        job_id = %job_id,
        job_type = %job.job_type,
        remaining = remaining.len(),
        total = job.total_units,
        "job dispatch started"
    );

    let mut interval = tokio::time::interval(inner.config.admission_interval);
    interval.set_missed_tick_behavior(MissedTickBehavior::Delay);
    let mut in_flight: JoinSet<UnitOutcome> = JoinSet::new();
    let mut units = remaining.into_iter();
    let mut fatal: Option<String> = None;

    let stop = loop {
        while let Some(done) = in_flight.try_join_next() {
            note_outcome(job_id, done, &mut fatal);
        }
        if let Some(error) = fatal.take() {
            break Stop::Fatal(error);
        }
        let Some(unit_id) = units.next() else {
            break Stop::Exhausted;
        };

        tokio::select! {
            biased;
            _ = cancel.cancelled() => break Stop::Cancelled,
            _ = inner.shutdown.cancelled() => break Stop::Shutdown,
            _ = interval.tick() => {}
        }

        debug!(job_id = %job_id, unit_id = %unit_id, "dispatching unit");
        let worker = inner.worker.clone();
        let budget = budget.clone();
        in_flight.spawn(async move { worker.process_unit(job_id, unit_id, &budget).await });
    };

    if let Stop::Cancelled = stop {
        // Freeze progress now; in-flight units still finish their own writes.
        finish(inner, job_id, JobStatus::Cancelled, None).await;
    }

    while let Some(done) = in_flight.join_next().await {
        note_outcome(job_id, done, &mut fatal);
    }

    match stop {
        Stop::Cancelled => {}
        Stop::Shutdown => info!(job_id = %job_id, "dispatch stopped by shutdown; job left for resumption"),
        Stop::Fatal(error) => finish(inner, job_id, JobStatus::Failed, Some(error)).await,
        Stop::Exhausted => complete(inner, job_id, &cancel, fatal).await,
    }
}

fn note_outcome(
    job_id: JobId,
    done: Result<UnitOutcome, tokio::task::JoinError>,
    fatal: &mut Option<String>,
) {
    match done {
        Ok(UnitOutcome::Failed { error, fatal: true }) => {
            fatal.get_or_insert(error);
        }
        Ok(_) => {}
        Err(err) => error!(job_id = %job_id, error = %err, "unit task panicked"),
    }
}

async fn complete(inner: &Inner, job_id: JobId, cancel: &CancellationToken, fatal: Option<String>) {
    let job = match inner.jobs.get(job_id).await {
        Ok(Some(job)) => job,
        Ok(None) => {
            warn!(job_id = %job_id, "job disappeared before completion");
            return;
        }
        Err(err) => {
            error!(job_id = %job_id, error = %err, "failed to load job for completion");
            return;
        }
    };

    if job.processed_units >= job.total_units {
        finish(inner, job_id, JobStatus::Completed, None).await;
    } else if let Some(error) = fatal {
        finish(inner, job_id, JobStatus::Failed, Some(error)).await;
    } else if cancel.is_cancelled() {
        finish(inner, job_id, JobStatus::Cancelled, None).await;
    } else {
        let message = format!(
            "{} of {} units processed",
            job.processed_units, job.total_units
        );
        finish(inner, job_id, JobStatus::Failed, Some(message)).await;
    }
}

async fn finish(inner: &Inner, job_id: JobId, status: JobStatus, error_message: Option<String>) {
    match inner.jobs.mark_terminal(job_id, status, error_message).await {
        Ok(job) => info!(
            job_id = %job_id,
            status = job.status.as_str(),
            processed = job.processed_units,
            total = job.total_units,
            "job finished"
        ),
        Err(JobStoreError::AlreadyTerminal { status, .. }) => {
            debug!(job_id = %job_id, status = status.as_str(), "job already terminal");
        }
        Err(err) => error!(job_id = %job_id, error = %err, "failed to finish job"),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU64, Ordering};

    use async_trait::async_trait;
    use rotv_ai::{
        EnrichmentProvider, ProviderError, ProviderRouter, RouterConfig, SearchOutcome, SearchQuery,
    };
    use rotv_core::Destination;

    use crate::jobs::store::InMemoryJobStore;
    use crate::jobs::types::NEWS_COLLECTION;
    use crate::local::{InMemoryDestinationRepository, InMemoryEnrichmentRepository};
    use crate::retry::CallPolicy;

    #[derive(Default)]
    struct Counting(AtomicU64);

    #[async_trait]
    impl EnrichmentProvider for Counting {
        fn name(&self) -> &str {
            "counting"
        }

        async fn search(&self, _query: &SearchQuery) -> Result<SearchOutcome, ProviderError> {
            self.0.fetch_add(1, Ordering::SeqCst);
            Ok(SearchOutcome::default())
        }
    }

    fn dispatcher(units: usize) -> (JobDispatcher, Arc<InMemoryJobStore>, Vec<DestinationId>) {
        let destinations: Vec<_> = (0..units)
            .map(|i| Destination::new(format!("Trailhead {i}")).unwrap())
            .collect();
        let ids = destinations.iter().map(|d| d.id).collect();
        let jobs = InMemoryJobStore::arc();
        let router = Arc::new(ProviderRouter::new(RouterConfig::new(Arc::new(Counting::default()))));
        let worker = UnitWorker::new(
            Arc::new(InMemoryDestinationRepository::with_destinations(destinations)),
            Arc::new(InMemoryEnrichmentRepository::new()),
            jobs.clone(),
            router,
            CallPolicy::default(),
        );
        let config = DispatcherConfig {
            admission_interval: Duration::from_secs(1),
            resume_cancelled: false,
        };
        (JobDispatcher::new(jobs.clone(), Arc::new(worker), config), jobs, ids)
    }

    async fn wait_terminal(d: &JobDispatcher, job_id: JobId) -> JobView {
        loop {
            let view = d.job(job_id).await.unwrap();
            if view.status.is_terminal() && !view.active {
                return view;
            }
            tokio::time::sleep(Duration::from_millis(100)).await;
        }
    }

    #[tokio::test(start_paused = true)]
    async fn admits_one_unit_per_interval() {
        let (d, _, ids) = dispatcher(5);
        let submitted = d.submit_job(NEWS_COLLECTION, ids).await.unwrap();
        assert_eq!(submitted.total_units, 5);

        tokio::time::sleep(Duration::from_millis(2500)).await;
        let view = d.job(submitted.job_id).await.unwrap();
        assert_eq!(view.status, JobStatus::Running);
        assert_eq!(view.processed_units, 3);

        let view = wait_terminal(&d, submitted.job_id).await;
        assert_eq!(view.status, JobStatus::Completed);
        assert_eq!(view.processed_units, 5);
    }

    #[tokio::test(start_paused = true)]
    async fn empty_job_completes_immediately() {
        let (d, _, _) = dispatcher(0);
        let submitted = d.submit_job(NEWS_COLLECTION, Vec::new()).await.unwrap();
        let view = wait_terminal(&d, submitted.job_id).await;
        assert_eq!(view.status, JobStatus::Completed);
    }

    #[tokio::test(start_paused = true)]
    async fn stop_leaves_job_running_for_resumption() {
        let (d, jobs, ids) = dispatcher(10);
        let submitted = d.submit_job(NEWS_COLLECTION, ids).await.unwrap();
        tokio::time::sleep(Duration::from_millis(3500)).await;
        d.stop().await;

        let job = jobs.get(submitted.job_id).await.unwrap().unwrap();
        assert_eq!(job.status, JobStatus::Running);
        assert_eq!(job.processed_units, 4);
        assert!(matches!(
            d.submit_job(NEWS_COLLECTION, Vec::new()).await,
            Err(DispatchError::ShuttingDown)
        ));
    }

    #[tokio::test(start_paused = true)]
    async fn cancelling_a_finished_job_is_not_accepted() {
        let (d, _, ids) = dispatcher(1);
        let submitted = d.submit_job(NEWS_COLLECTION, ids).await.unwrap();
        wait_terminal(&d, submitted.job_id).await;

        let ack = d.cancel_job(submitted.job_id).await.unwrap();
        assert!(!ack.accepted);
        assert_eq!(ack.status, JobStatus::Completed);
        assert!(matches!(
            d.cancel_job(JobId::new()).await,
            Err(DispatchError::NotFound(_))
        ));
    }
    /// Store whose `mark_running` refuses one job.
    struct RefusingStore {
        inner: Arc<InMemoryJobStore>,
        refuse: JobId,
    }

    #[async_trait]
    impl JobStore for RefusingStore {
        async fn create_job(&self, job_type: &str, unit_ids: Vec<DestinationId>) -> Result<Job, JobStoreError> {
            self.inner.create_job(job_type, unit_ids).await
        }

        async fn get(&self, job_id: JobId) -> Result<Option<Job>, JobStoreError> {
            self.inner.get(job_id).await
        }

        async fn list_recent(&self, limit: usize) -> Result<Vec<Job>, JobStoreError> {
            self.inner.list_recent(limit).await
        }

        async fn mark_running(&self, job_id: JobId) -> Result<Job, JobStoreError> {
            if job_id == self.refuse {
                return Err(JobStoreError::Storage("connection reset".into()));
            }
            self.inner.mark_running(job_id).await
        }

        async fn record_progress(
            &self,
            job_id: JobId,
            unit_id: DestinationId,
            counters: &BTreeMap<String, u64>,
        ) -> Result<bool, JobStoreError> {
            self.inner.record_progress(job_id, unit_id, counters).await
        }

        async fn record_unit_failure(
            &self,
            job_id: JobId,
            unit_id: DestinationId,
            error: &str,
        ) -> Result<bool, JobStoreError> {
            self.inner.record_unit_failure(job_id, unit_id, error).await
        }

        async fn mark_terminal(
            &self,
            job_id: JobId,
            status: JobStatus,
            error_message: Option<String>,
        ) -> Result<Job, JobStoreError> {
            self.inner.mark_terminal(job_id, status, error_message).await
        }

        async fn find_incomplete_jobs(&self) -> Result<Vec<Job>, JobStoreError> {
            self.inner.find_incomplete_jobs().await
        }

        async fn find_by_status(&self, status: JobStatus) -> Result<Vec<Job>, JobStoreError> {
            self.inner.find_by_status(status).await
        }
    }

    #[tokio::test(start_paused = true)]
    async fn one_unstartable_job_does_not_block_resuming_the_rest() {
        let (template, jobs, ids) = dispatcher(4);
        let broken = jobs.create_job(NEWS_COLLECTION, ids[..2].to_vec()).await.unwrap();
        let healthy = jobs.create_job(NEWS_COLLECTION, ids[2..].to_vec()).await.unwrap();

        let store = Arc::new(RefusingStore {
            inner: jobs.clone(),
            refuse: broken.id,
        });
        let d = JobDispatcher::new(store, template.inner.worker.clone(), template.inner.config.clone());

        assert_eq!(d.resume_incomplete().await.unwrap(), vec![healthy.id]);
        assert!(!d.job(broken.id).await.unwrap().active);

        let view = wait_terminal(&d, healthy.id).await;
        assert_eq!(view.status, JobStatus::Completed);
        assert_eq!(jobs.get(broken.id).await.unwrap().unwrap().status, JobStatus::Pending);
    }

    #[tokio::test]
    async fn poisoned_registry_refuses_to_start_jobs() {
        let (d, _, ids) = dispatcher(1);
        let inner = d.inner.clone();
        let _ = std::thread::spawn(move || {
            let _held = inner.active.lock().unwrap();
            panic!("poison the registry");
        })
        .join();

        assert!(matches!(
            d.submit_job(NEWS_COLLECTION, ids).await,
            Err(DispatchError::RegistryPoisoned)
        ));
    }
}
