//! Durable, ordered log of mutations awaiting propagation to the mirror.

use std::collections::BTreeMap;
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use thiserror::Error;

use super::operation::{OperationId, OperationRequest, PendingOperation, QueueEntry, UnreadableOperation};

#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum QueueError {
    #[error("queue storage error: {0}")]
    Storage(String),
}

/// Operation Queue.
///
/// Reading does not remove anything: operations leave the queue only through
/// `remove` (after a successful apply) or `discard` (operator decision).
#[async_trait]
pub trait OperationQueue: Send + Sync {
    async fn enqueue(&self, request: OperationRequest) -> Result<PendingOperation, QueueError>;

    /// Every queued row, oldest first (by enqueue time, then insertion
    /// order). Rows that no longer decode are returned as unreadable entries.
    async fn entries(&self) -> Result<Vec<QueueEntry>, QueueError>;

    /// The readable pending operations, oldest first.
    async fn drain(&self) -> Result<Vec<PendingOperation>, QueueError> {
        Ok(self
            .entries()
            .await?
            .into_iter()
            .filter_map(QueueEntry::into_ready)
            .collect())
    }

    async fn remove(&self, id: OperationId) -> Result<(), QueueError>;

    /// Returns whether the operation existed.
    async fn discard(&self, id: OperationId) -> Result<bool, QueueError>;

    async fn len(&self) -> Result<u64, QueueError>;
}

/// In-memory operation queue for tests/dev.
///
/// Keyed by an insertion sequence taken under the same lock that stamps
/// `enqueued_at`, so equal timestamps still drain in enqueue order.
#[derive(Debug, Default)]
pub struct InMemoryOperationQueue {
    ops: Mutex<BTreeMap<u64, QueueEntry>>,
    next_seq: Mutex<u64>,
}

impl InMemoryOperationQueue {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn arc() -> Arc<Self> {
        Arc::new(Self::new())
    }

    fn lock(&self) -> Result<std::sync::MutexGuard<'_, BTreeMap<u64, QueueEntry>>, QueueError> {
        self.ops
            .lock()
            .map_err(|_| QueueError::Storage("lock poisoned".into()))
    }

    fn push<T>(&self, make: impl FnOnce() -> T) -> Result<T, QueueError>
    where
        T: Clone + Into<QueueEntry>,
    {
        let mut ops = self.lock()?;
        let mut seq = self
            .next_seq
            .lock()
            .map_err(|_| QueueError::Storage("lock poisoned".into()))?;
        let item = make();
        *seq += 1;
        ops.insert(*seq, item.clone().into());
        Ok(item)
    }

    /// Append a row that fails to decode, as a damaged store would hold.
    pub fn push_unreadable(&self, entry: UnreadableOperation) -> Result<(), QueueError> {
        self.push(|| entry).map(|_| ())
    }
}

#[async_trait]
impl OperationQueue for InMemoryOperationQueue {
    async fn enqueue(&self, request: OperationRequest) -> Result<PendingOperation, QueueError> {
        self.push(|| PendingOperation::from_request(request))
    }

    async fn entries(&self) -> Result<Vec<QueueEntry>, QueueError> {
        Ok(self.lock()?.values().cloned().collect())
    }

    async fn remove(&self, id: OperationId) -> Result<(), QueueError> {
        self.discard(id).await.map(|_| ())
    }

    async fn discard(&self, id: OperationId) -> Result<bool, QueueError> {
        let mut ops = self.lock()?;
        let key = ops
            .iter()
            .find(|(_, entry)| entry.id() == id)
            .map(|(seq, _)| *seq);
        Ok(key.and_then(|k| ops.remove(&k)).is_some())
    }

    async fn len(&self) -> Result<u64, QueueError> {
        Ok(self.lock()?.len() as u64)
    }
}
