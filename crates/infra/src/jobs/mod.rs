//! Resumable, checkpointed batch jobs.
//!
//! ## Components
//!
//! - `Job`: status, counters and the checkpoint of processed units
//! - `JobStore`: persistence (in-memory or Postgres) with atomic progress writes
//! - `UnitWorker`: enriches one destination through the provider router
//! - `JobDispatcher`: admits units at a fixed rate, cancels cooperatively,
//!   resumes unfinished jobs at startup
//! - `DailyScheduler`: time-based trigger for the news collection job

pub mod dispatcher;
pub mod postgres;
pub mod scheduler;
pub mod store;
pub mod types;
pub mod worker;

pub use dispatcher::{CancelAck, DispatchError, DispatcherConfig, JobDispatcher, JobView, SubmittedJob};
pub use postgres::PostgresJobStore;
pub use scheduler::{DailyScheduler, SchedulerHandle, next_run_after};
pub use store::{InMemoryJobStore, JobStore, JobStoreError};
pub use types::{
    Checkpoint, ITEMS_FOUND, Job, JobId, JobStatus, MAX_UNITS, NEWS_COLLECTION, UNITS_ENRICHED, UNITS_FAILED,
    UnitFailure,
};
pub use worker::{UnitOutcome, UnitWorker};
