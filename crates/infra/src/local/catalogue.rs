//! Local destination edits that feed the Operation Queue.
//!
//! Every successful local write enqueues exactly one mirror operation carrying
//! a snapshot of the entity, so the Reconciler can replay it later.

use std::sync::Arc;

use thiserror::Error;
use tracing::debug;

use rotv_core::{Destination, DestinationId, DomainError};

use crate::sync::{OperationKind, OperationQueue, OperationRequest, QueueError};

use super::{DestinationRepository, RepositoryError};

#[derive(Debug, Error)]
pub enum CatalogueError {
    #[error(transparent)]
    Domain(#[from] DomainError),

    #[error(transparent)]
    Repository(#[from] RepositoryError),

    #[error(transparent)]
    Queue(#[from] QueueError),

    #[error("destination not found: {0}")]
    NotFound(DestinationId),
}

#[derive(Clone)]
pub struct Catalogue {
    destinations: Arc<dyn DestinationRepository>,
    queue: Arc<dyn OperationQueue>,
}

impl Catalogue {
    pub fn new(destinations: Arc<dyn DestinationRepository>, queue: Arc<dyn OperationQueue>) -> Self {
        Self { destinations, queue }
    }

    pub async fn create(&self, mut destination: Destination) -> Result<Destination, CatalogueError> {
        destination.touch();
        self.destinations.upsert(&destination).await?;
        self.queue
            .enqueue(OperationRequest::destination(OperationKind::Insert, &destination, None))
            .await?;
        debug!(destination_id = %destination.id, "destination created");
        Ok(destination)
    }

    /// Apply `edit` and enqueue an update keyed by the name the mirror
    /// currently knows.
    pub async fn update<F>(&self, id: DestinationId, edit: F) -> Result<Destination, CatalogueError>
    where
        F: FnOnce(&mut Destination) -> Result<(), DomainError>,
    {
        let mut destination = self
            .destinations
            .get(id)
            .await?
            .ok_or(CatalogueError::NotFound(id))?;
        let previous_name = destination.name.clone();

        edit(&mut destination)?;
        destination.touch();
        self.destinations.upsert(&destination).await?;

        let renamed_from = (destination.name != previous_name).then_some(previous_name.as_str());
        self.queue
            .enqueue(OperationRequest::destination(
                OperationKind::Update,
                &destination,
                renamed_from,
            ))
            .await?;
        Ok(destination)
    }

    /// Returns whether the destination existed.
    pub async fn delete(&self, id: DestinationId) -> Result<bool, CatalogueError> {
        let Some(destination) = self.destinations.get(id).await? else {
            return Ok(false);
        };
        self.destinations.delete(id).await?;
        self.queue
            .enqueue(OperationRequest::destination(OperationKind::Delete, &destination, None))
            .await?;
        Ok(true)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::local::InMemoryDestinationRepository;
    use crate::sync::InMemoryOperationQueue;

    #[tokio::test]
    async fn each_edit_enqueues_one_operation() {
        let queue = InMemoryOperationQueue::arc();
        let catalogue = Catalogue::new(Arc::new(InMemoryDestinationRepository::new()), queue.clone());

        let d = catalogue.create(Destination::new("Everett Road").unwrap()).await.unwrap();
        catalogue
            .update(d.id, |d| d.rename("Everett Road Covered Bridge").map(|_| ()))
            .await
            .unwrap();
        assert!(catalogue.delete(d.id).await.unwrap());
        assert!(!catalogue.delete(d.id).await.unwrap());

        let ops = queue.drain().await.unwrap();
        let kinds: Vec<_> = ops.iter().map(|op| op.kind).collect();
        assert_eq!(
            kinds,
            vec![OperationKind::Insert, OperationKind::Update, OperationKind::Delete]
        );
        assert_eq!(ops[1].decode().unwrap().key, "Everett Road");
        assert_eq!(ops[2].decode().unwrap().key, "Everett Road Covered Bridge");
    }

    #[tokio::test]
    async fn failed_edit_changes_nothing() {
        let queue = InMemoryOperationQueue::arc();
        let repo = Arc::new(InMemoryDestinationRepository::new());
        let catalogue = Catalogue::new(repo.clone(), queue.clone());
        let d = catalogue.create(Destination::new("Tinkers Creek").unwrap()).await.unwrap();

        let err = catalogue.update(d.id, |d| d.rename("  ").map(|_| ())).await;
        assert!(matches!(err, Err(CatalogueError::Domain(_))));
        assert_eq!(queue.len().await.unwrap(), 1);
        assert_eq!(repo.get(d.id).await.unwrap().unwrap().name, "Tinkers Creek");
    }
}
