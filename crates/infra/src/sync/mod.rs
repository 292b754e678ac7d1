//! Mirror synchronization: the Operation Queue, the Reconciler that drains it,
//! and the whole-collection Full Sync Engine.
//!
//! ## Components
//!
//! - `OperationQueue`: durable FIFO of pending mirror mutations
//! - `Reconciler`: applies queued operations one at a time, tolerating per-item failure
//! - `FullSyncEngine`: replace-all push / pull, bypassing the queue
//! - `MirrorLocks`: single-flight lease shared by all three runs per mirror target

pub mod error;
pub mod full_sync;
pub mod lock;
pub mod mirror;
pub mod operation;
pub mod postgres;
pub mod queue;
pub mod reconciler;
pub mod schema;
pub mod status;

pub use error::SyncError;
pub use full_sync::{AssetError, AssetFetcher, FullSyncEngine, PullReport, PushReport};
pub use lock::{MirrorLease, MirrorLocks};
pub use mirror::{InMemoryMirror, Mirror, MirrorError, MirrorRow, SheetStyle, UnconfiguredMirror};
pub use operation::{
    DecodedOperation, EntityType, MirrorRecord, OperationId, OperationKind, OperationRequest, PayloadError,
    PendingOperation, QueueEntry, StoredOperation, UnreadableOperation,
};
pub use postgres::{PostgresOperationQueue, PostgresSyncStatusStore};
pub use queue::{InMemoryOperationQueue, OperationQueue, QueueError};
pub use reconciler::{OperationFailure, ReconcileReport, Reconciler};
pub use schema::RowError;
pub use status::{InMemorySyncStatusStore, LAST_PULL, LAST_PUSH, LAST_SYNC, SyncStatusEntry, SyncStatusStore};
