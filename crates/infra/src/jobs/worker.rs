//! Unit Worker: enrich one destination within a job.

use std::collections::BTreeMap;
use std::sync::Arc;

use tracing::{debug, warn};

use rotv_ai::{ProviderError, ProviderRouter, SearchQuery, UsageBudget};
use rotv_core::{DestinationId, EnrichmentRecord};

use crate::local::{DestinationRepository, EnrichmentRepository};
use crate::retry::CallPolicy;
use crate::sync::{OperationQueue, OperationRequest};

use super::store::{JobStore, JobStoreError};
use super::types::{ITEMS_FOUND, JobId, UNITS_ENRICHED};

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum UnitOutcome {
    Enriched { results_found: u32 },
    /// The unit was recorded as failed. `fatal` failures (missing provider
    /// configuration) are not counted as processed and stop the job.
    Failed { error: String, fatal: bool },
    AlreadyProcessed,
}

pub struct UnitWorker {
    destinations: Arc<dyn DestinationRepository>,
    enrichments: Arc<dyn EnrichmentRepository>,
    jobs: Arc<dyn JobStore>,
    router: Arc<ProviderRouter>,
    policy: CallPolicy,
    mirror_queue: Option<Arc<dyn OperationQueue>>,
}

impl UnitWorker {
    pub fn new(
        destinations: Arc<dyn DestinationRepository>,
        enrichments: Arc<dyn EnrichmentRepository>,
        jobs: Arc<dyn JobStore>,
        router: Arc<ProviderRouter>,
        policy: CallPolicy,
    ) -> Self {
        Self {
            destinations,
            enrichments,
            jobs,
            router,
            policy,
            mirror_queue: None,
        }
    }

    /// Also enqueue every stored enrichment for the mirror.
    pub fn with_mirror_queue(mut self, queue: Arc<dyn OperationQueue>) -> Self {
        self.mirror_queue = Some(queue);
        self
    }

    pub fn router(&self) -> &Arc<ProviderRouter> {
        &self.router
    }

    /// Process one unit, charging provider usage to the job's `budget`.
    /// Never returns an error: failures are recorded on the job and reported
    /// in the outcome.
    pub async fn process_unit(
        &self,
        job_id: JobId,
        unit_id: DestinationId,
        budget: &UsageBudget,
    ) -> UnitOutcome {
        match self.jobs.get(job_id).await {
            Ok(Some(job)) if job.checkpoint.is_processed(unit_id) => return UnitOutcome::AlreadyProcessed,
            Ok(_) => {}
            Err(err) => warn!(job_id = %job_id, unit_id = %unit_id, error = %err, "checkpoint lookup failed"),
        }

        match self.enrich(job_id, unit_id, budget).await {
            Ok(results_found) => UnitOutcome::Enriched { results_found },
            Err(UnitError::Fatal(error)) => {
                warn!(job_id = %job_id, unit_id = %unit_id, error = %error, "unit failed fatally");
                UnitOutcome::Failed { error, fatal: true }
            }
            Err(UnitError::Unit(error)) => {
                warn!(job_id = %job_id, unit_id = %unit_id, error = %error, "unit failed");
                if let Err(store_err) = self.jobs.record_unit_failure(job_id, unit_id, &error).await {
                    warn!(job_id = %job_id, unit_id = %unit_id, error = %store_err, "failed to record unit failure");
                }
                UnitOutcome::Failed { error, fatal: false }
            }
        }
    }

    async fn enrich(
        &self,
        job_id: JobId,
        unit_id: DestinationId,
        budget: &UsageBudget,
    ) -> Result<u32, UnitError> {
        let destination = self
            .destinations
            .get(unit_id)
            .await
            .map_err(|e| UnitError::Unit(e.to_string()))?
            .ok_or_else(|| UnitError::Unit(format!("destination {unit_id} not found")))?;

        let query = SearchQuery::for_destination(&destination);
        let routed = self
            .policy
            .call("provider search", || self.router.search_within(budget, &query))
            .await
            .map_err(|err| match err {
                ProviderError::NotConfigured(_) => UnitError::Fatal(err.to_string()),
                other => UnitError::Unit(other.to_string()),
            })?;

        let outcome = routed.outcome;
        let record = EnrichmentRecord::new(
            destination.id,
            routed.provider,
            outcome.results_found,
            outcome.structured_fields,
            outcome.sources,
        );
        self.enrichments
            .upsert(&record)
            .await
            .map_err(|e| UnitError::Unit(e.to_string()))?;

        if let Some(queue) = &self.mirror_queue {
            // The enrichment is stored; a failed enqueue only delays the mirror.
            if let Err(err) = queue
                .enqueue(OperationRequest::enrichment(&record, &destination.name))
                .await
            {
                warn!(unit_id = %unit_id, error = %err, "failed to enqueue enrichment for mirror");
            }
        }

        let counters = BTreeMap::from([
            (ITEMS_FOUND.to_string(), u64::from(record.results_found)),
            (UNITS_ENRICHED.to_string(), 1),
        ]);
        let applied = self
            .jobs
            .record_progress(job_id, unit_id, &counters)
            .await
            .map_err(|e: JobStoreError| UnitError::Unit(e.to_string()))?;
        if !applied {
            debug!(job_id = %job_id, unit_id = %unit_id, "progress ignored; job no longer running");
        }
        Ok(record.results_found)
    }
}

enum UnitError {
    Unit(String),
    Fatal(String),
}
