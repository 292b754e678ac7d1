use thiserror::Error;

use crate::local::RepositoryError;

use super::mirror::MirrorError;
use super::queue::QueueError;

/// Run-level sync failure. Per-item failures are reported inside the run's
/// report instead.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum SyncError {
    #[error("another sync run holds the lease for {target}")]
    Busy { target: String },

    #[error(transparent)]
    Mirror(#[from] MirrorError),

    #[error(transparent)]
    Queue(#[from] QueueError),

    #[error(transparent)]
    Repository(#[from] RepositoryError),
}
