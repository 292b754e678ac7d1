//! Daily trigger for the news collection job.

use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Days, NaiveTime, Utc};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{error, info};

use crate::local::DestinationRepository;

use super::dispatcher::{DispatchError, JobDispatcher, SubmittedJob};
use super::types::NEWS_COLLECTION;

/// Next occurrence of `hour:00` UTC strictly after `now`.
pub fn next_run_after(now: DateTime<Utc>, hour: u32) -> DateTime<Utc> {
    let at = NaiveTime::from_hms_opt(hour.min(23), 0, 0).unwrap_or(NaiveTime::MIN);
    let today = now.date_naive().and_time(at).and_utc();
    if today > now {
        today
    } else {
        today.checked_add_days(Days::new(1)).unwrap_or(today)
    }
}

#[derive(Clone)]
pub struct DailyScheduler {
    dispatcher: JobDispatcher,
    destinations: Arc<dyn DestinationRepository>,
    hour: u32,
}

impl DailyScheduler {
    pub fn new(dispatcher: JobDispatcher, destinations: Arc<dyn DestinationRepository>, hour: u32) -> Self {
        Self {
            dispatcher,
            destinations,
            hour,
        }
    }

    /// Submit a news collection job over every destination, unless one is
    /// already running. Returns `None` when skipped.
    pub async fn trigger(&self) -> Result<Option<SubmittedJob>, DispatchError> {
        if self.dispatcher.has_active_job(NEWS_COLLECTION) {
            info!("news collection already running; skipping scheduled run");
            return Ok(None);
        }
        let unit_ids = self.destinations.ids().await?;
        let submitted = self.dispatcher.submit_job(NEWS_COLLECTION, unit_ids).await?;
        info!(job_id = %submitted.job_id, units = submitted.total_units, "scheduled news collection submitted");
        Ok(Some(submitted))
    }

    /// Run the trigger daily until the handle is stopped.
    pub fn start(self) -> SchedulerHandle {
        let cancel = CancellationToken::new();
        let token = cancel.clone();
        let join = tokio::spawn(async move {
            loop {
                let now = Utc::now();
                let next = next_run_after(now, self.hour);
                let wait = (next - now).to_std().unwrap_or(Duration::ZERO);
                info!(next_run = %next, "news collection scheduled");

                tokio::select! {
                    _ = token.cancelled() => break,
                    _ = tokio::time::sleep(wait) => {}
                }
                if let Err(err) = self.trigger().await {
                    error!(error = %err, "scheduled news collection failed");
                }
            }
        });
        SchedulerHandle {
            cancel,
            join: Some(join),
        }
    }
}

pub struct SchedulerHandle {
    cancel: CancellationToken,
    join: Option<JoinHandle<()>>,
}

impl SchedulerHandle {
    pub async fn stop(mut self) {
        self.cancel.cancel();
        if let Some(join) = self.join.take() {
            let _ = join.await;
        }
    }
}
