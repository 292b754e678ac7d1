//! Process-level wiring of the sync and job core.
//!
//! `SyncJobService::start` builds every component, resumes unfinished jobs
//! and starts the background triggers; `stop` tears them down again.

use std::sync::{Arc, Mutex};
use std::time::Duration;

use anyhow::Context;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use rotv_ai::{
    DisabledProvider, EnrichmentProvider, HttpSearchProvider, ProviderRouter, RouterConfig,
};

use crate::config::{AppConfig, MirrorKind, ProviderEndpoint};
use crate::db;
use crate::jobs::{
    DispatchError, DispatcherConfig, DailyScheduler, InMemoryJobStore, JobDispatcher, JobStore,
    PostgresJobStore, SchedulerHandle, SubmittedJob, UnitWorker,
};
use crate::local::{
    Catalogue, DestinationRepository, EnrichmentRepository, InMemoryDestinationRepository,
    InMemoryEnrichmentRepository, PostgresDestinationRepository, PostgresEnrichmentRepository,
    RepositoryError,
};
use crate::retry::CallPolicy;
use crate::sync::{
    AssetFetcher, FullSyncEngine, InMemoryMirror, InMemoryOperationQueue, InMemorySyncStatusStore,
    Mirror, MirrorLocks, OperationId, OperationQueue, PostgresOperationQueue,
    PostgresSyncStatusStore, QueueError, Reconciler, SyncStatusEntry, SyncStatusStore,
    UnconfiguredMirror,
};

/// Storage and boundary adapters the service is built from.
#[derive(Clone)]
pub struct ServiceDeps {
    pub destinations: Arc<dyn DestinationRepository>,
    pub enrichments: Arc<dyn EnrichmentRepository>,
    pub queue: Arc<dyn OperationQueue>,
    pub status: Arc<dyn SyncStatusStore>,
    pub jobs: Arc<dyn JobStore>,
    pub mirror: Arc<dyn Mirror>,
    pub router: Arc<ProviderRouter>,
    pub assets: Option<Arc<dyn AssetFetcher>>,
}

impl ServiceDeps {
    /// Process-local stores around the given mirror and router.
    pub fn in_memory(mirror: Arc<dyn Mirror>, router: Arc<ProviderRouter>) -> Self {
        Self {
            destinations: Arc::new(InMemoryDestinationRepository::new()),
            enrichments: Arc::new(InMemoryEnrichmentRepository::new()),
            queue: InMemoryOperationQueue::arc(),
            status: Arc::new(InMemorySyncStatusStore::new()),
            jobs: InMemoryJobStore::arc(),
            mirror,
            router,
            assets: None,
        }
    }

    /// Build adapters from configuration: Postgres when `DATABASE_URL` is
    /// set, in-memory stores otherwise.
    pub async fn from_config(config: &AppConfig) -> anyhow::Result<Self> {
        let mirror: Arc<dyn Mirror> = match config.mirror.kind {
            MirrorKind::Memory => Arc::new(InMemoryMirror::new(config.mirror.target.clone())),
            MirrorKind::Unconfigured => {
                warn!("no mirror configured; sync actions will report a configuration error");
                Arc::new(UnconfiguredMirror::new(config.mirror.target.clone()))
            }
        };
        let router = Arc::new(build_router(config)?);

        let Some(url) = config.database_url.as_deref() else {
            info!("DATABASE_URL not set; using in-memory stores");
            return Ok(Self::in_memory(mirror, router));
        };

        let pool = db::connect(url).await?;
        db::bootstrap(&pool).await?;
        Ok(Self {
            destinations: Arc::new(PostgresDestinationRepository::new(pool.clone())),
            enrichments: Arc::new(PostgresEnrichmentRepository::new(pool.clone())),
            queue: Arc::new(PostgresOperationQueue::new(pool.clone())),
            status: Arc::new(PostgresSyncStatusStore::new(pool.clone())),
            jobs: Arc::new(PostgresJobStore::new(pool)),
            mirror,
            router,
            assets: None,
        })
    }
}

fn http_provider(endpoint: &ProviderEndpoint, timeout: Duration) -> anyhow::Result<Arc<dyn EnrichmentProvider>> {
    let provider = HttpSearchProvider::new(
        endpoint.name.clone(),
        endpoint.url.clone(),
        endpoint.api_key.clone(),
        timeout,
    )
    .with_context(|| format!("failed to build provider {}", endpoint.name))?;
    Ok(Arc::new(provider))
}

fn build_router(config: &AppConfig) -> anyhow::Result<ProviderRouter> {
    let providers = &config.providers;
    let primary = match &providers.primary {
        Some(endpoint) => http_provider(endpoint, config.calls.timeout)?,
        None => {
            warn!("no primary provider configured; enrichment units will fail");
            Arc::new(DisabledProvider::new("unconfigured"))
        }
    };

    let mut router_config = RouterConfig::new(primary)
        .with_primary_request_limit(providers.primary_request_limit)
        .with_rate_limit_cooldown(providers.rate_limit_cooldown);
    if let Some(endpoint) = &providers.fallback {
        router_config = router_config.with_fallback(http_provider(endpoint, config.calls.timeout)?);
    }
    Ok(ProviderRouter::new(router_config))
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ServiceConfig {
    pub dispatcher: DispatcherConfig,
    pub calls: CallPolicy,
    /// UTC hour of the daily news collection; `None` disables the trigger.
    pub daily_run_hour: Option<u32>,
    pub reconcile_interval: Option<Duration>,
    /// Queue each stored enrichment for the mirror.
    pub mirror_enrichments: bool,
}

impl Default for ServiceConfig {
    fn default() -> Self {
        Self {
            dispatcher: DispatcherConfig::default(),
            calls: CallPolicy::default(),
            daily_run_hour: None,
            reconcile_interval: None,
            mirror_enrichments: true,
        }
    }
}

impl From<&AppConfig> for ServiceConfig {
    fn from(config: &AppConfig) -> Self {
        Self {
            dispatcher: DispatcherConfig {
                admission_interval: config.jobs.admission_interval,
                resume_cancelled: config.jobs.resume_cancelled,
            },
            calls: config.calls,
            daily_run_hour: config.jobs.daily_run_hour,
            reconcile_interval: config.reconcile_interval,
            mirror_enrichments: true,
        }
    }
}

/// Status entries plus the current queue depth.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SyncStatusView {
    pub entries: Vec<SyncStatusEntry>,
    pub pending_operations: u64,
    pub checked_at: DateTime<Utc>,
}

struct Background {
    scheduler: Option<SchedulerHandle>,
    reconcile: Option<(CancellationToken, JoinHandle<()>)>,
}

pub struct SyncJobService {
    dispatcher: JobDispatcher,
    reconciler: Arc<Reconciler>,
    full_sync: Arc<FullSyncEngine>,
    catalogue: Catalogue,
    destinations: Arc<dyn DestinationRepository>,
    queue: Arc<dyn OperationQueue>,
    status: Arc<dyn SyncStatusStore>,
    background: Mutex<Background>,
}

impl SyncJobService {
    /// Build every component, resume unfinished jobs and start the daily and
    /// periodic triggers.
    pub async fn start(deps: ServiceDeps, config: ServiceConfig) -> Result<Self, DispatchError> {
        let locks = MirrorLocks::new();

        let mut worker = UnitWorker::new(
            deps.destinations.clone(),
            deps.enrichments.clone(),
            deps.jobs.clone(),
            deps.router.clone(),
            config.calls,
        );
        if config.mirror_enrichments {
            worker = worker.with_mirror_queue(deps.queue.clone());
        }
        let dispatcher = JobDispatcher::new(deps.jobs.clone(), Arc::new(worker), config.dispatcher.clone());

        let reconciler = Arc::new(Reconciler::new(
            deps.queue.clone(),
            deps.mirror.clone(),
            deps.destinations.clone(),
            deps.status.clone(),
            locks.clone(),
            config.calls,
        ));

        let mut full_sync = FullSyncEngine::new(
            deps.mirror.clone(),
            deps.destinations.clone(),
            deps.status.clone(),
            locks,
            config.calls,
        );
        if let Some(assets) = deps.assets.clone() {
            full_sync = full_sync.with_asset_fetcher(assets);
        }

        let resumed = dispatcher.resume_incomplete().await?;
        if !resumed.is_empty() {
            info!(count = resumed.len(), "resumed incomplete jobs");
        }

        let scheduler = config.daily_run_hour.map(|hour| {
            DailyScheduler::new(dispatcher.clone(), deps.destinations.clone(), hour).start()
        });
        let reconcile = config
            .reconcile_interval
            .map(|every| spawn_periodic_reconcile(reconciler.clone(), every));

        Ok(Self {
            dispatcher,
            reconciler,
            full_sync: Arc::new(full_sync),
            catalogue: Catalogue::new(deps.destinations.clone(), deps.queue.clone()),
            destinations: deps.destinations,
            queue: deps.queue,
            status: deps.status,
            background: Mutex::new(Background { scheduler, reconcile }),
        })
    }

    pub fn dispatcher(&self) -> &JobDispatcher {
        &self.dispatcher
    }

    pub fn reconciler(&self) -> &Reconciler {
        &self.reconciler
    }

    pub fn full_sync(&self) -> &FullSyncEngine {
        &self.full_sync
    }

    pub fn catalogue(&self) -> &Catalogue {
        &self.catalogue
    }

    /// Submit a job over every local destination.
    pub async fn submit_for_all(&self, job_type: &str) -> Result<SubmittedJob, DispatchError> {
        let unit_ids = self.destinations.ids().await?;
        self.dispatcher.submit_job(job_type, unit_ids).await
    }

    pub async fn sync_status(&self) -> Result<SyncStatusView, SyncStatusError> {
        Ok(SyncStatusView {
            entries: self.status.all().await?,
            pending_operations: self.queue.len().await?,
            checked_at: Utc::now(),
        })
    }

    /// Drop a stuck operation without applying it. Returns whether it existed.
    pub async fn discard_operation(&self, id: OperationId) -> Result<bool, QueueError> {
        let discarded = self.queue.discard(id).await?;
        if discarded {
            warn!(operation_id = %id.0, "pending operation discarded by operator");
        }
        Ok(discarded)
    }

    /// Stop triggers and dispatch; in-flight units finish first.
    pub async fn stop(&self) {
        let background = match self.background.lock() {
            Ok(mut bg) => Background {
                scheduler: bg.scheduler.take(),
                reconcile: bg.reconcile.take(),
            },
            Err(_) => Background {
                scheduler: None,
                reconcile: None,
            },
        };

        if let Some(scheduler) = background.scheduler {
            scheduler.stop().await;
        }
        if let Some((cancel, join)) = background.reconcile {
            cancel.cancel();
            let _ = join.await;
        }
        self.dispatcher.stop().await;
        info!("sync and job service stopped");
    }
}

#[derive(Debug, thiserror::Error)]
pub enum SyncStatusError {
    #[error(transparent)]
    Repository(#[from] RepositoryError),

    #[error(transparent)]
    Queue(#[from] QueueError),
}

fn spawn_periodic_reconcile(reconciler: Arc<Reconciler>, every: Duration) -> (CancellationToken, JoinHandle<()>) {
    let cancel = CancellationToken::new();
    let token = cancel.clone();
    let join = tokio::spawn(async move {
        let mut interval = tokio::time::interval(every);
        interval.set_missed_tick_behavior(MissedTickBehavior::Skip);
        // First tick is immediate; wait a full period before the first run.
        interval.tick().await;

        loop {
            tokio::select! {
                _ = token.cancelled() => break,
                _ = interval.tick() => {}
            }
            match reconciler.reconcile().await {
                Ok(report) if report.processed_count > 0 || !report.errors.is_empty() => info!(
                    processed = report.processed_count,
                    failed = report.errors.len(),
                    "periodic reconcile finished"
                ),
                Ok(_) => {}
                Err(err) => error!(error = %err, "periodic reconcile failed"),
            }
        }
    });
    (cancel, join)
}
