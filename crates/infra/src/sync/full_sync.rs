//! Whole-collection push (local to mirror) and pull (mirror to local).
//!
//! Both are replace-all operations that bypass the Operation Queue. They take
//! the same mirror lease as the Reconciler.

use std::collections::HashSet;
use std::sync::Arc;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tracing::{info, instrument, warn};

use rotv_core::{Destination, DestinationId};

use crate::local::DestinationRepository;
use crate::retry::CallPolicy;

use super::error::SyncError;
use super::lock::MirrorLocks;
use super::mirror::{Mirror, SheetStyle};
use super::schema::{
    DESTINATION_HEADERS, DESTINATIONS_COLLECTION, DestinationRow, RowError, destination_from_cells, headers,
};
use super::status::{LAST_PULL, LAST_PUSH, SyncStatusStore};

/// Re-downloads binary assets referenced by a mirror file id.
#[async_trait]
pub trait AssetFetcher: Send + Sync {
    async fn fetch(&self, destination_id: DestinationId, file_id: &str) -> Result<(), String>;
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PushReport {
    pub rows_written: usize,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AssetError {
    pub destination_id: DestinationId,
    pub file_id: String,
    pub error: String,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct PullReport {
    pub rows_read: usize,
    pub imported: usize,
    pub skipped: Vec<RowError>,
    pub assets_refreshed: usize,
    pub asset_errors: Vec<AssetError>,
}

pub struct FullSyncEngine {
    mirror: Arc<dyn Mirror>,
    destinations: Arc<dyn DestinationRepository>,
    status: Arc<dyn SyncStatusStore>,
    locks: MirrorLocks,
    policy: CallPolicy,
    assets: Option<Arc<dyn AssetFetcher>>,
    style: SheetStyle,
}

impl FullSyncEngine {
    pub fn new(
        mirror: Arc<dyn Mirror>,
        destinations: Arc<dyn DestinationRepository>,
        status: Arc<dyn SyncStatusStore>,
        locks: MirrorLocks,
        policy: CallPolicy,
    ) -> Self {
        Self {
            mirror,
            destinations,
            status,
            locks,
            policy,
            assets: None,
            style: SheetStyle {
                header_background: Some("#2e7d32".into()),
                ..SheetStyle::default()
            },
        }
    }

    pub fn with_asset_fetcher(mut self, assets: Arc<dyn AssetFetcher>) -> Self {
        self.assets = Some(assets);
        self
    }

    /// Create the collection with `headers` and `style` unless it exists.
    /// Returns whether it was created.
    pub async fn ensure_sheet_exists(
        &self,
        name: &str,
        headers: &[String],
        style: &SheetStyle,
    ) -> Result<bool, SyncError> {
        let mirror = &self.mirror;
        let created = self
            .policy
            .call("mirror.ensure_collection", || {
                mirror.ensure_collection_exists(name, headers, style)
            })
            .await?;
        if created {
            info!(collection = name, "mirror collection created");
        }
        Ok(created)
    }

    /// Replace the mirror's destination rows with the local collection.
    #[instrument(skip(self), fields(mirror = %self.mirror.target()), err)]
    pub async fn push(&self) -> Result<PushReport, SyncError> {
        let _lease = self.locks.try_acquire(self.mirror.target())?;

        self.ensure_sheet_exists(DESTINATIONS_COLLECTION, &headers(&DESTINATION_HEADERS), &self.style)
            .await?;

        let local = self.destinations.list().await?;
        let rows: Vec<Vec<String>> = local
            .iter()
            .map(|d| DestinationRow::from_destination(d).to_cells())
            .collect();
        let rows_written = rows.len();

        let mirror = &self.mirror;
        self.policy
            .call("mirror.clear_range", || mirror.clear_range(DESTINATIONS_COLLECTION))
            .await?;
        // One batch write; not retried, a partial append would duplicate rows.
        self.policy
            .call_once("mirror.append_rows", mirror.append_rows(DESTINATIONS_COLLECTION, rows))
            .await?;

        let mut marked = 0usize;
        for d in &local {
            if self.destinations.mark_synced(d.id, d.updated_at).await? {
                marked += 1;
            }
        }
        self.status.stamp(LAST_PUSH).await?;

        info!(rows_written, marked, "push finished");
        Ok(PushReport { rows_written })
    }

    /// Replace the local collection with the mirror's rows.
    #[instrument(skip(self), fields(mirror = %self.mirror.target()), err)]
    pub async fn pull(&self) -> Result<PullReport, SyncError> {
        let _lease = self.locks.try_acquire(self.mirror.target())?;

        self.ensure_sheet_exists(DESTINATIONS_COLLECTION, &headers(&DESTINATION_HEADERS), &self.style)
            .await?;

        let mirror = &self.mirror;
        let rows = self
            .policy
            .call("mirror.list_rows", || mirror.list_rows(DESTINATIONS_COLLECTION))
            .await?;

        let mut report = PullReport {
            rows_read: rows.len(),
            ..PullReport::default()
        };
        let mut imported: Vec<Destination> = Vec::with_capacity(rows.len());
        let mut seen_names = HashSet::new();
        let mut seen_ids = HashSet::new();

        for (index, cells) in rows.iter().enumerate() {
            let key = cells.first().map(|k| k.trim().to_string()).filter(|k| !k.is_empty());
            let skip = |error: String| RowError {
                row: index + 1,
                key: key.clone(),
                error,
            };

            let mut destination = match destination_from_cells(cells) {
                Ok(d) => d,
                Err(err) => {
                    report.skipped.push(skip(err.to_string()));
                    continue;
                }
            };
            if !seen_names.insert(destination.name.clone()) {
                report.skipped.push(skip(format!("duplicate name {:?}", destination.name)));
                continue;
            }
            if !seen_ids.insert(destination.id) {
                // Copied row: keep the name, give it its own identity.
                destination.id = DestinationId::new();
                seen_ids.insert(destination.id);
            }
            imported.push(destination);
        }

        if !report.skipped.is_empty() {
            warn!(skipped = report.skipped.len(), "mirror rows skipped during pull");
        }

        report.imported = imported.len();
        let with_images: Vec<(DestinationId, String)> = imported
            .iter()
            .filter_map(|d| d.image_file_id.clone().map(|file| (d.id, file)))
            .collect();

        self.destinations.replace_all(imported).await?;

        if let Some(assets) = &self.assets {
            for (destination_id, file_id) in with_images {
                match assets.fetch(destination_id, &file_id).await {
                    Ok(()) => report.assets_refreshed += 1,
                    Err(error) => {
                        warn!(%destination_id, file_id = %file_id, error = %error, "asset refresh failed");
                        report.asset_errors.push(AssetError {
                            destination_id,
                            file_id,
                            error,
                        });
                    }
                }
            }
        }

        self.status.stamp(LAST_PULL).await?;

        info!(
            rows_read = report.rows_read,
            imported = report.imported,
            skipped = report.skipped.len(),
            "pull finished"
        );
        Ok(report)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::local::InMemoryDestinationRepository;
    use crate::sync::mirror::interference::InterferingMirror;
    use crate::sync::mirror::{InMemoryMirror, MirrorError};
    use crate::sync::status::InMemorySyncStatusStore;
    use rotv_core::Coordinates;
    use std::sync::Mutex;
    use std::time::Duration;

    struct RecordingFetcher {
        fetched: Mutex<Vec<String>>,
    }

    #[async_trait]
    impl AssetFetcher for RecordingFetcher {
        async fn fetch(&self, _destination_id: DestinationId, file_id: &str) -> Result<(), String> {
            if file_id == "missing" {
                return Err("404".into());
            }
            self.fetched.lock().unwrap().push(file_id.to_string());
            Ok(())
        }
    }

    fn engine(
        mirror: Arc<dyn Mirror>,
        destinations: Arc<InMemoryDestinationRepository>,
        locks: MirrorLocks,
    ) -> FullSyncEngine {
        FullSyncEngine::new(
            mirror,
            destinations,
            Arc::new(InMemorySyncStatusStore::new()),
            locks,
            CallPolicy::new(Duration::from_secs(5), 1).with_retry_delay(Duration::ZERO),
        )
    }

    #[tokio::test]
    async fn push_replaces_mirror_rows_and_marks_synced() {
        let mirror = Arc::new(InMemoryMirror::new("sheet"));
        let d = Destination::new("Hunt House").unwrap();
        let destinations = Arc::new(InMemoryDestinationRepository::with_destinations([d.clone()]));
        let engine = engine(mirror.clone(), destinations.clone(), MirrorLocks::new());

        mirror
            .ensure_collection_exists(DESTINATIONS_COLLECTION, &headers(&DESTINATION_HEADERS), &SheetStyle::default())
            .await
            .unwrap();
        mirror
            .append_row(DESTINATIONS_COLLECTION, vec!["Stale Row".into()])
            .await
            .unwrap();

        let report = engine.push().await.unwrap();
        assert_eq!(report.rows_written, 1);
        assert_eq!(mirror.keys(DESTINATIONS_COLLECTION), vec!["Hunt House"]);
        assert!(destinations.get(d.id).await.unwrap().unwrap().synced);
        // seed append, clear, one batch append
        assert_eq!(mirror.write_calls(), 3);
    }

    #[tokio::test]
    async fn edit_during_push_keeps_that_destination_unsynced() {
        let edited = Destination::new("Hale Farm").unwrap();
        let untouched = Destination::new("Frazee House").unwrap();
        let destinations = Arc::new(InMemoryDestinationRepository::with_destinations([
            edited.clone(),
            untouched.clone(),
        ]));
        let mirror = InterferingMirror::new(Arc::new(InMemoryMirror::new("sheet")), destinations.clone())
            .editing(edited.id);
        let engine = engine(Arc::new(mirror), destinations.clone(), MirrorLocks::new());

        let report = engine.push().await.unwrap();
        assert_eq!(report.rows_written, 2);

        let after = destinations.get(edited.id).await.unwrap().unwrap();
        assert_eq!(after.description.as_deref(), Some("edited mid-sync"));
        assert!(!after.synced);
        assert!(destinations.get(untouched.id).await.unwrap().unwrap().synced);
    }

    #[tokio::test(start_paused = true)]
    async fn hung_append_times_out_and_releases_the_lease() {
        let d = Destination::new("Hunt House").unwrap();
        let destinations = Arc::new(InMemoryDestinationRepository::with_destinations([d.clone()]));
        let mirror = InterferingMirror::new(Arc::new(InMemoryMirror::new("sheet")), destinations.clone())
            .stalling(Duration::from_secs(3600));
        let locks = MirrorLocks::new();
        let engine = engine(Arc::new(mirror), destinations.clone(), locks.clone());

        let result = engine.push().await;
        assert!(matches!(result, Err(SyncError::Mirror(MirrorError::Network(_)))));
        assert!(!locks.is_held("sheet"));
        assert!(!destinations.get(d.id).await.unwrap().unwrap().synced);
    }

    #[tokio::test]
    async fn push_creates_the_sheet_with_headers_and_style() {
        let mirror = Arc::new(InMemoryMirror::new("sheet"));
        let engine = engine(mirror.clone(), Arc::new(InMemoryDestinationRepository::new()), MirrorLocks::new());

        engine.push().await.unwrap();
        assert_eq!(mirror.headers(DESTINATIONS_COLLECTION).unwrap()[0], "Name");
        assert_eq!(
            mirror.style(DESTINATIONS_COLLECTION).unwrap().header_background.as_deref(),
            Some("#2e7d32")
        );
    }

    #[tokio::test]
    async fn pull_skips_invalid_rows_and_refreshes_assets() {
        let mirror = Arc::new(InMemoryMirror::new("sheet"));
        mirror
            .ensure_collection_exists(DESTINATIONS_COLLECTION, &headers(&DESTINATION_HEADERS), &SheetStyle::default())
            .await
            .unwrap();
        let cells = |v: &[&str]| v.iter().map(|s| s.to_string()).collect::<Vec<_>>();
        mirror
            .append_rows(
                DESTINATIONS_COLLECTION,
                vec![
                    cells(&["Blue Hen Falls", "", "41.258", "-81.573", "", "", "", "img-1"]),
                    cells(&["", "", "", ""]),
                    cells(&["Kendall Lake", "", "95", "-81.5"]),
                    cells(&["Blue Hen Falls"]),
                    cells(&["Szalay's Farm", "", "", "", "", "", "", "missing"]),
                ],
            )
            .await
            .unwrap();

        let destinations = Arc::new(InMemoryDestinationRepository::with_destinations([
            Destination::new("Local Only").unwrap(),
        ]));
        let fetcher = Arc::new(RecordingFetcher {
            fetched: Mutex::new(Vec::new()),
        });
        let engine = engine(mirror, destinations.clone(), MirrorLocks::new()).with_asset_fetcher(fetcher.clone());

        let report = engine.pull().await.unwrap();
        assert_eq!(report.rows_read, 5);
        assert_eq!(report.imported, 2);
        assert_eq!(report.skipped.len(), 3);
        assert_eq!(report.skipped[0].row, 2);
        assert_eq!(report.assets_refreshed, 1);
        assert_eq!(report.asset_errors.len(), 1);
        assert_eq!(*fetcher.fetched.lock().unwrap(), vec!["img-1".to_string()]);

        let names: Vec<_> = destinations.list().await.unwrap().into_iter().map(|d| d.name).collect();
        assert_eq!(names, vec!["Blue Hen Falls", "Szalay's Farm"]);
        let falls = destinations
            .list()
            .await
            .unwrap()
            .into_iter()
            .find(|d| d.name == "Blue Hen Falls")
            .unwrap();
        assert_eq!(falls.coordinates, Some(Coordinates::new(41.258, -81.573).unwrap()));
    }

    #[tokio::test]
    async fn unconfigured_mirror_is_a_run_level_error() {
        let engine = FullSyncEngine::new(
            Arc::new(crate::sync::mirror::UnconfiguredMirror::new("sheet")),
            Arc::new(InMemoryDestinationRepository::new()),
            Arc::new(InMemorySyncStatusStore::new()),
            MirrorLocks::new(),
            CallPolicy::default(),
        );
        assert!(matches!(
            engine.pull().await,
            Err(SyncError::Mirror(MirrorError::NotConfigured(_)))
        ));
    }

    #[tokio::test]
    async fn push_and_pull_share_the_reconcile_lease() {
        let locks = MirrorLocks::new();
        let engine = engine(
            Arc::new(InMemoryMirror::new("sheet")),
            Arc::new(InMemoryDestinationRepository::new()),
            locks.clone(),
        );
        let _held = locks.try_acquire("sheet").unwrap();
        assert!(matches!(engine.push().await, Err(SyncError::Busy { .. })));
        assert!(matches!(engine.pull().await, Err(SyncError::Busy { .. })));
    }
}
