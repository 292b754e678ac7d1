//! Drains the Operation Queue against the mirror, one operation at a time.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::{debug, info, instrument, warn};
use uuid::Uuid;

use rotv_core::DestinationId;

use crate::local::DestinationRepository;
use crate::retry::CallPolicy;

use super::error::SyncError;
use super::lock::MirrorLocks;
use super::mirror::{Mirror, MirrorError, SheetStyle};
use super::operation::{
    EntityType, MirrorRecord, OperationId, OperationKind, PayloadError, PendingOperation, QueueEntry,
};
use super::queue::OperationQueue;
use super::schema::{
    DESTINATION_HEADERS, DESTINATIONS_COLLECTION, ENRICHMENT_COLLECTION, ENRICHMENT_HEADERS, headers,
};
use super::status::{LAST_SYNC, SyncStatusStore};

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OperationFailure {
    pub operation_id: OperationId,
    pub error: String,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReconcileReport {
    pub processed_count: usize,
    pub errors: Vec<OperationFailure>,
    /// Set when a fatal mirror error stopped the run early.
    pub aborted: Option<String>,
}

#[derive(Debug)]
enum ApplyError {
    Payload(PayloadError),
    Mirror(MirrorError),
}

impl std::fmt::Display for ApplyError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Payload(e) => e.fmt(f),
            Self::Mirror(e) => e.fmt(f),
        }
    }
}

fn collection_for(entity_type: EntityType) -> (&'static str, Vec<String>) {
    match entity_type {
        EntityType::Destination => (DESTINATIONS_COLLECTION, headers(&DESTINATION_HEADERS)),
        EntityType::Enrichment => (ENRICHMENT_COLLECTION, headers(&ENRICHMENT_HEADERS)),
    }
}

pub struct Reconciler {
    queue: Arc<dyn OperationQueue>,
    mirror: Arc<dyn Mirror>,
    destinations: Arc<dyn DestinationRepository>,
    status: Arc<dyn SyncStatusStore>,
    locks: MirrorLocks,
    policy: CallPolicy,
}

impl Reconciler {
    pub fn new(
        queue: Arc<dyn OperationQueue>,
        mirror: Arc<dyn Mirror>,
        destinations: Arc<dyn DestinationRepository>,
        status: Arc<dyn SyncStatusStore>,
        locks: MirrorLocks,
        policy: CallPolicy,
    ) -> Self {
        Self {
            queue,
            mirror,
            destinations,
            status,
            locks,
            policy,
        }
    }

    /// Apply every pending operation in FIFO order.
    ///
    /// A failed operation stays queued and is reported; the run continues
    /// with the next one unless the mirror error is fatal.
    #[instrument(skip(self), fields(mirror = %self.mirror.target()), err)]
    pub async fn reconcile(&self) -> Result<ReconcileReport, SyncError> {
        let _lease = self.locks.try_acquire(self.mirror.target())?;

        let entries = self.queue.entries().await?;
        if entries.is_empty() {
            return Ok(ReconcileReport::default());
        }
        info!(pending = entries.len(), "reconcile started");

        let mut report = ReconcileReport::default();
        let mut ensured = HashSet::new();
        // Latest snapshot written per destination, by its `updated_at`.
        let mut applied_destinations: HashMap<Uuid, DateTime<Utc>> = HashMap::new();
        let mut still_pending: HashSet<Uuid> = HashSet::new();

        for (index, entry) in entries.iter().enumerate() {
            let op = match entry {
                QueueEntry::Ready(op) => op,
                QueueEntry::Unreadable(bad) => {
                    warn!(operation_id = %bad.id, reason = %bad.reason, "unreadable operation; left queued");
                    still_pending.extend(bad.entity_id);
                    report.errors.push(OperationFailure {
                        operation_id: bad.id,
                        error: format!("unreadable operation: {}", bad.reason),
                    });
                    continue;
                }
            };
            match self.apply(op, &mut ensured).await {
                Ok(written) => {
                    if let Err(err) = self.queue.remove(op.id).await {
                        // Stays queued; re-applying later is an idempotent upsert/delete.
                        warn!(operation_id = %op.id, error = %err, "applied operation could not be dequeued");
                        still_pending.insert(op.entity_id);
                        report.errors.push(OperationFailure {
                            operation_id: op.id,
                            error: err.to_string(),
                        });
                        continue;
                    }
                    report.processed_count += 1;
                    if let Some(as_of) = written {
                        applied_destinations.insert(op.entity_id, as_of);
                    }
                }
                Err(err) => {
                    warn!(operation_id = %op.id, kind = op.kind.as_str(), error = %err, "operation failed; left queued");
                    still_pending.insert(op.entity_id);
                    report.errors.push(OperationFailure {
                        operation_id: op.id,
                        error: err.to_string(),
                    });

                    if let ApplyError::Mirror(mirror_err) = &err {
                        if mirror_err.is_fatal() {
                            still_pending.extend(entries[index + 1..].iter().filter_map(QueueEntry::entity_id));
                            report.aborted = Some(mirror_err.to_string());
                            break;
                        }
                    }
                }
            }
        }

        // An entity is synced only when none of its operations remain queued
        // and it was not edited after the snapshot that was written.
        for (entity_id, as_of) in applied_destinations {
            if still_pending.contains(&entity_id) {
                continue;
            }
            match self
                .destinations
                .mark_synced(DestinationId::from_uuid(entity_id), as_of)
                .await
            {
                Ok(true) => {}
                Ok(false) => debug!(destination_id = %entity_id, "destination changed during reconcile; left unsynced"),
                Err(err) => warn!(destination_id = %entity_id, error = %err, "failed to mark destination synced"),
            }
        }

        if report.processed_count > 0 {
            if let Err(err) = self.status.stamp(LAST_SYNC).await {
                warn!(error = %err, "failed to stamp last_sync");
            }
        }

        info!(
            processed = report.processed_count,
            failed = report.errors.len(),
            aborted = report.aborted.is_some(),
            "reconcile finished"
        );
        Ok(report)
    }

    /// Returns the `updated_at` of the destination snapshot written, if any.
    async fn apply(
        &self,
        op: &PendingOperation,
        ensured: &mut HashSet<EntityType>,
    ) -> Result<Option<DateTime<Utc>>, ApplyError> {
        let decoded = op.decode().map_err(ApplyError::Payload)?;
        let (collection, columns) = collection_for(op.entity_type);
        let mirror = &self.mirror;

        if !ensured.contains(&op.entity_type) {
            let style = SheetStyle::default();
            self.policy
                .call("mirror.ensure_collection", || {
                    mirror.ensure_collection_exists(collection, &columns, &style)
                })
                .await
                .map_err(ApplyError::Mirror)?;
            ensured.insert(op.entity_type);
        }

        let key = decoded.key.as_str();
        match (op.kind, decoded.row) {
            (OperationKind::Delete, _) => {
                self.policy
                    .call("mirror.delete_row", || mirror.delete_row_by_key(collection, key))
                    .await
                    .map_err(ApplyError::Mirror)?;
                Ok(None)
            }
            (_, Some(row)) => {
                let cells = row.to_cells();
                self.policy
                    .call("mirror.update_row", || {
                        mirror.update_row_by_key(collection, key, cells.clone())
                    })
                    .await
                    .map_err(ApplyError::Mirror)?;
                Ok(match row {
                    MirrorRecord::Destination(row) => Some(row.updated_at),
                    MirrorRecord::Enrichment(_) => None,
                })
            }
            (kind, None) => Err(ApplyError::Payload(PayloadError::MissingRow(kind.as_str()))),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::local::InMemoryDestinationRepository;
    use crate::sync::mirror::InMemoryMirror;
    use crate::sync::mirror::interference::InterferingMirror;
    use crate::sync::operation::{OperationRequest, UnreadableOperation};
    use crate::sync::queue::InMemoryOperationQueue;
    use crate::sync::status::InMemorySyncStatusStore;
    use rotv_core::Destination;
    use serde_json::json;
    use std::time::Duration;

    struct Fixture {
        queue: Arc<InMemoryOperationQueue>,
        mirror: Arc<InMemoryMirror>,
        destinations: Arc<InMemoryDestinationRepository>,
        status: Arc<InMemorySyncStatusStore>,
        locks: MirrorLocks,
        reconciler: Reconciler,
    }

    fn fixture() -> Fixture {
        let queue = InMemoryOperationQueue::arc();
        let mirror = Arc::new(InMemoryMirror::new("sheet"));
        let destinations = Arc::new(InMemoryDestinationRepository::new());
        let status = Arc::new(InMemorySyncStatusStore::new());
        let locks = MirrorLocks::new();
        let reconciler = Reconciler::new(
            queue.clone(),
            mirror.clone(),
            destinations.clone(),
            status.clone(),
            locks.clone(),
            CallPolicy::new(Duration::from_secs(5), 1).with_retry_delay(Duration::ZERO),
        );
        Fixture {
            queue,
            mirror,
            destinations,
            status,
            locks,
            reconciler,
        }
    }

    async fn insert(f: &Fixture, name: &str) -> Destination {
        let d = Destination::new(name).unwrap();
        f.destinations.upsert(&d).await.unwrap();
        f.queue
            .enqueue(OperationRequest::destination(OperationKind::Insert, &d, None))
            .await
            .unwrap();
        d
    }

    #[tokio::test]
    async fn empty_queue_does_not_stamp_last_sync() {
        let f = fixture();
        let report = f.reconciler.reconcile().await.unwrap();
        assert_eq!(report, ReconcileReport::default());
        assert!(f.status.get(LAST_SYNC).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn applied_operations_mark_entities_synced() {
        let f = fixture();
        let d = insert(&f, "Station Road Bridge").await;

        let report = f.reconciler.reconcile().await.unwrap();
        assert_eq!(report.processed_count, 1);
        assert!(f.destinations.get(d.id).await.unwrap().unwrap().synced);
        assert_eq!(f.mirror.keys(DESTINATIONS_COLLECTION), vec!["Station Road Bridge"]);
        assert!(f.status.get(LAST_SYNC).await.unwrap().is_some());
    }

    #[tokio::test]
    async fn rename_replaces_the_old_mirror_row() {
        let f = fixture();
        let mut d = insert(&f, "Boston Store").await;
        f.reconciler.reconcile().await.unwrap();

        let previous = d.rename("Boston Mill Visitor Center").unwrap();
        f.destinations.upsert(&d).await.unwrap();
        f.queue
            .enqueue(OperationRequest::destination(OperationKind::Update, &d, Some(&previous)))
            .await
            .unwrap();
        f.reconciler.reconcile().await.unwrap();

        assert_eq!(f.mirror.keys(DESTINATIONS_COLLECTION), vec!["Boston Mill Visitor Center"]);
    }

    #[tokio::test]
    async fn malformed_payload_is_reported_and_kept() {
        let f = fixture();
        insert(&f, "Ledges").await;
        let bad = f
            .queue
            .enqueue(OperationRequest {
                kind: OperationKind::Update,
                entity_type: EntityType::Destination,
                entity_id: Uuid::now_v7(),
                payload: json!({ "key": "Ledges", "row": { "unexpected": true } }),
            })
            .await
            .unwrap();

        let report = f.reconciler.reconcile().await.unwrap();
        assert_eq!(report.processed_count, 1);
        assert_eq!(report.errors.len(), 1);
        assert_eq!(report.errors[0].operation_id, bad.id);
        assert_eq!(f.queue.drain().await.unwrap(), vec![bad]);
    }

    #[tokio::test]
    async fn fatal_mirror_error_aborts_the_rest() {
        let f = fixture();
        insert(&f, "A").await;
        insert(&f, "B").await;
        f.mirror.fail_all(Some(MirrorError::Auth("token revoked".into())));

        let report = f.reconciler.reconcile().await.unwrap();
        assert_eq!(report.processed_count, 0);
        assert_eq!(report.errors.len(), 1);
        assert!(report.aborted.is_some());
        assert_eq!(f.queue.len().await.unwrap(), 2);
    }

    #[tokio::test]
    async fn later_failure_keeps_entity_unsynced() {
        let f = fixture();
        let mut d = insert(&f, "Jaite").await;
        f.mirror.fail_key("Jaite", MirrorError::Api { status: 400, message: "bad".into() });
        d.description = Some("Paper mill town".into());
        f.queue
            .enqueue(OperationRequest::destination(OperationKind::Update, &d, None))
            .await
            .unwrap();

        let report = f.reconciler.reconcile().await.unwrap();
        assert_eq!(report.errors.len(), 2);
        assert!(!f.destinations.get(d.id).await.unwrap().unwrap().synced);
    }

    #[tokio::test]
    async fn unreadable_entry_is_reported_and_the_rest_applied() {
        let f = fixture();
        let first = insert(&f, "Brandywine Falls").await;
        let orphan = Destination::new("Indigo Lake").unwrap();
        f.destinations.upsert(&orphan).await.unwrap();
        let unreadable = UnreadableOperation {
            id: OperationId::new(),
            entity_id: Some(*orphan.id.as_uuid()),
            reason: "unknown operation kind \"upsert\"".into(),
        };
        f.queue.push_unreadable(unreadable.clone()).unwrap();
        let last = insert(&f, "Beaver Marsh").await;

        let report = f.reconciler.reconcile().await.unwrap();
        assert_eq!(report.processed_count, 2);
        assert_eq!(report.errors.len(), 1);
        assert_eq!(report.errors[0].operation_id, unreadable.id);
        assert!(report.errors[0].error.contains("upsert"));
        assert!(report.aborted.is_none());

        assert_eq!(f.queue.len().await.unwrap(), 1);
        assert_eq!(f.mirror.keys(DESTINATIONS_COLLECTION), vec!["Brandywine Falls", "Beaver Marsh"]);
        assert!(f.destinations.get(first.id).await.unwrap().unwrap().synced);
        assert!(f.destinations.get(last.id).await.unwrap().unwrap().synced);
        assert!(!f.destinations.get(orphan.id).await.unwrap().unwrap().synced);
    }

    #[tokio::test]
    async fn edit_during_reconcile_keeps_the_destination_unsynced() {
        let f = fixture();
        let d = insert(&f, "Everett Covered Bridge").await;
        let mirror = InterferingMirror::new(f.mirror.clone(), f.destinations.clone()).editing(d.id);
        let reconciler = Reconciler::new(
            f.queue.clone(),
            Arc::new(mirror),
            f.destinations.clone(),
            f.status.clone(),
            MirrorLocks::new(),
            CallPolicy::new(Duration::from_secs(5), 0),
        );

        let report = reconciler.reconcile().await.unwrap();
        assert_eq!(report.processed_count, 1);
        assert_eq!(f.queue.len().await.unwrap(), 0);

        let after = f.destinations.get(d.id).await.unwrap().unwrap();
        assert_eq!(after.description.as_deref(), Some("edited mid-sync"));
        assert!(!after.synced);
    }

    #[tokio::test]
    async fn concurrent_run_is_rejected() {
        let f = fixture();
        let _lease = f.locks.try_acquire("sheet").unwrap();
        assert!(matches!(f.reconciler.reconcile().await, Err(SyncError::Busy { .. })));
    }
}
