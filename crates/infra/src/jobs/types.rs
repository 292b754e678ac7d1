//! Core job types: identity, status and checkpoint.

use std::collections::{BTreeMap, HashSet};
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use rotv_core::DestinationId;

use super::store::JobStoreError;

/// Daily news/events enrichment of every destination.
pub const NEWS_COLLECTION: &str = "news_collection";

pub const ITEMS_FOUND: &str = "items_found";
pub const UNITS_ENRICHED: &str = "units_enriched";
pub const UNITS_FAILED: &str = "units_failed";

/// Largest job accepted. Unit counts are stored as Postgres `INTEGER`.
pub const MAX_UNITS: u32 = i32::MAX as u32;

fn unit_count(len: usize) -> Result<u32, JobStoreError> {
    u32::try_from(len)
        .ok()
        .filter(|n| *n <= MAX_UNITS)
        .ok_or(JobStoreError::TooManyUnits {
            count: len,
            max: MAX_UNITS,
        })
}

/// Unique job identifier.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct JobId(pub Uuid);

impl JobId {
    pub fn new() -> Self {
        Self(Uuid::now_v7())
    }

    pub fn from_uuid(uuid: Uuid) -> Self {
        Self(uuid)
    }
}

impl Default for JobId {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Display for JobId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl FromStr for JobId {
    type Err = uuid::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Uuid::parse_str(s.trim()).map(Self)
    }
}

/// Job execution status.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobStatus {
    /// Created, not yet dispatching
    Pending,
    /// Units are being dispatched
    Running,
    /// Every unit processed
    Completed,
    /// Stopped by a job-level error
    Failed,
    /// Cancelled by request
    Cancelled,
}

impl JobStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Completed | Self::Failed | Self::Cancelled)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Running => "running",
            Self::Completed => "completed",
            Self::Failed => "failed",
            Self::Cancelled => "cancelled",
        }
    }
}

impl FromStr for JobStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "pending" => Ok(Self::Pending),
            "running" => Ok(Self::Running),
            "completed" => Ok(Self::Completed),
            "failed" => Ok(Self::Failed),
            "cancelled" => Ok(Self::Cancelled),
            other => Err(format!("unknown job status {other:?}")),
        }
    }
}

/// Which units a job covers and which of them are done.
///
/// A unit id appears in `processed` at most once.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Checkpoint {
    pub unit_ids: Vec<DestinationId>,
    pub processed: Vec<DestinationId>,
}

impl Checkpoint {
    pub fn new(unit_ids: Vec<DestinationId>) -> Self {
        Self {
            unit_ids,
            processed: Vec::new(),
        }
    }

    pub fn is_processed(&self, unit_id: DestinationId) -> bool {
        self.processed.contains(&unit_id)
    }

    /// Units not yet processed, in original order.
    pub fn remaining(&self) -> Vec<DestinationId> {
        let done: HashSet<_> = self.processed.iter().collect();
        self.unit_ids
            .iter()
            .filter(|id| !done.contains(id))
            .copied()
            .collect()
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UnitFailure {
    pub unit_id: DestinationId,
    pub error: String,
    pub at: DateTime<Utc>,
}

/// A batch job over a list of units.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Job {
    pub id: JobId,
    pub job_type: String,
    pub status: JobStatus,
    pub total_units: u32,
    pub processed_units: u32,
    pub result_counters: BTreeMap<String, u64>,
    pub error_message: Option<String>,
    pub checkpoint: Checkpoint,
    pub unit_failures: Vec<UnitFailure>,
    pub created_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
}

impl Job {
    /// Create a pending job. Duplicate unit ids are dropped, keeping first occurrence.
    pub fn new(job_type: impl Into<String>, unit_ids: Vec<DestinationId>) -> Result<Self, JobStoreError> {
        let mut seen = HashSet::new();
        let unit_ids: Vec<_> = unit_ids.into_iter().filter(|id| seen.insert(*id)).collect();
        let total_units = unit_count(unit_ids.len())?;

        Ok(Self {
            id: JobId::new(),
            job_type: job_type.into(),
            status: JobStatus::Pending,
            total_units,
            processed_units: 0,
            result_counters: BTreeMap::new(),
            error_message: None,
            checkpoint: Checkpoint::new(unit_ids),
            unit_failures: Vec::new(),
            created_at: Utc::now(),
            started_at: None,
            completed_at: None,
        })
    }

    /// Count `unit_id` as processed and merge `counters`.
    ///
    /// Returns `false` (and changes nothing) when the job is not running, the
    /// unit is not part of the job, or it was already processed.
    pub fn apply_progress(&mut self, unit_id: DestinationId, counters: &BTreeMap<String, u64>) -> bool {
        if self.status != JobStatus::Running
            || !self.checkpoint.unit_ids.contains(&unit_id)
            || self.checkpoint.is_processed(unit_id)
        {
            return false;
        }
        self.checkpoint.processed.push(unit_id);
        self.processed_units = self.processed_units.saturating_add(1);
        for (name, delta) in counters {
            *self.result_counters.entry(name.clone()).or_insert(0) += delta;
        }
        true
    }

    /// Count a failed unit as processed and remember why it failed.
    pub fn apply_unit_failure(&mut self, unit_id: DestinationId, error: &str) -> bool {
        let counters = BTreeMap::from([(UNITS_FAILED.to_string(), 1)]);
        if !self.apply_progress(unit_id, &counters) {
            return false;
        }
        self.unit_failures.push(UnitFailure {
            unit_id,
            error: error.to_string(),
            at: Utc::now(),
        });
        true
    }

    pub fn mark_running(&mut self) {
        self.status = JobStatus::Running;
        self.completed_at = None;
        self.error_message = None;
        if self.started_at.is_none() {
            self.started_at = Some(Utc::now());
        }
    }

    pub fn mark_terminal(&mut self, status: JobStatus, error_message: Option<String>) {
        self.status = status;
        self.error_message = error_message;
        self.completed_at = Some(Utc::now());
    }
}
