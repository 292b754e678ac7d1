//! Local storage for destinations and their enrichment records.
//!
//! The sync core only needs a handful of operations from the local side:
//! list/get for push and worker lookups, the `synced` flag, a whole-collection
//! replace for pull, and an upsert for enrichment results.
//!
//! `synced` is only ever set against the `updated_at` of the snapshot that
//! reached the mirror, so an edit landing mid-sync keeps the row unsynced.

pub mod catalogue;
pub mod postgres;

use std::collections::HashMap;
use std::sync::RwLock;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use thiserror::Error;

use rotv_core::{Destination, DestinationId, EnrichmentRecord};

pub use catalogue::Catalogue;
pub use postgres::{PostgresDestinationRepository, PostgresEnrichmentRepository};

#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum RepositoryError {
    #[error("storage error: {0}")]
    Storage(String),

    #[error("serialization error: {0}")]
    Serialization(String),
}

#[async_trait]
pub trait DestinationRepository: Send + Sync {
    async fn list(&self) -> Result<Vec<Destination>, RepositoryError>;

    async fn get(&self, id: DestinationId) -> Result<Option<Destination>, RepositoryError>;

    async fn upsert(&self, destination: &Destination) -> Result<(), RepositoryError>;

    /// Returns whether the destination existed.
    async fn delete(&self, id: DestinationId) -> Result<bool, RepositoryError>;

    /// Set `synced` if the stored row still carries `as_of` as its
    /// `updated_at`. Returns whether the flag was set.
    async fn mark_synced(&self, id: DestinationId, as_of: DateTime<Utc>) -> Result<bool, RepositoryError>;

    /// Delete every destination and insert `destinations` instead, atomically.
    async fn replace_all(&self, destinations: Vec<Destination>) -> Result<(), RepositoryError>;

    async fn ids(&self) -> Result<Vec<DestinationId>, RepositoryError> {
        Ok(self.list().await?.into_iter().map(|d| d.id).collect())
    }
}

#[async_trait]
pub trait EnrichmentRepository: Send + Sync {
    /// Insert or replace the record of `record.destination_id`.
    async fn upsert(&self, record: &EnrichmentRecord) -> Result<(), RepositoryError>;

    async fn get(&self, destination_id: DestinationId) -> Result<Option<EnrichmentRecord>, RepositoryError>;

    async fn count(&self) -> Result<u64, RepositoryError>;
}

fn poisoned<T>(_: T) -> RepositoryError {
    RepositoryError::Storage("lock poisoned".into())
}

/// In-memory destination repository for tests/dev.
#[derive(Debug, Default)]
pub struct InMemoryDestinationRepository {
    rows: RwLock<HashMap<DestinationId, Destination>>,
}

impl InMemoryDestinationRepository {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_destinations(destinations: impl IntoIterator<Item = Destination>) -> Self {
        Self {
            rows: RwLock::new(destinations.into_iter().map(|d| (d.id, d)).collect()),
        }
    }
}

#[async_trait]
impl DestinationRepository for InMemoryDestinationRepository {
    async fn list(&self) -> Result<Vec<Destination>, RepositoryError> {
        let rows = self.rows.read().map_err(poisoned)?;
        let mut all: Vec<_> = rows.values().cloned().collect();
        all.sort_by(|a, b| a.name.cmp(&b.name));
        Ok(all)
    }

    async fn get(&self, id: DestinationId) -> Result<Option<Destination>, RepositoryError> {
        Ok(self.rows.read().map_err(poisoned)?.get(&id).cloned())
    }

    async fn upsert(&self, destination: &Destination) -> Result<(), RepositoryError> {
        self.rows
            .write()
            .map_err(poisoned)?
            .insert(destination.id, destination.clone());
        Ok(())
    }

    async fn delete(&self, id: DestinationId) -> Result<bool, RepositoryError> {
        Ok(self.rows.write().map_err(poisoned)?.remove(&id).is_some())
    }

    async fn mark_synced(&self, id: DestinationId, as_of: DateTime<Utc>) -> Result<bool, RepositoryError> {
        let mut rows = self.rows.write().map_err(poisoned)?;
        match rows.get_mut(&id) {
            Some(d) if d.updated_at == as_of => {
                d.mark_synced();
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    async fn replace_all(&self, destinations: Vec<Destination>) -> Result<(), RepositoryError> {
        let mut rows = self.rows.write().map_err(poisoned)?;
        *rows = destinations.into_iter().map(|d| (d.id, d)).collect();
        Ok(())
    }
}

/// In-memory enrichment repository for tests/dev.
#[derive(Debug, Default)]
pub struct InMemoryEnrichmentRepository {
    records: RwLock<HashMap<DestinationId, EnrichmentRecord>>,
}

impl InMemoryEnrichmentRepository {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl EnrichmentRepository for InMemoryEnrichmentRepository {
    async fn upsert(&self, record: &EnrichmentRecord) -> Result<(), RepositoryError> {
        self.records
            .write()
            .map_err(poisoned)?
            .insert(record.destination_id, record.clone());
        Ok(())
    }

    async fn get(&self, destination_id: DestinationId) -> Result<Option<EnrichmentRecord>, RepositoryError> {
        Ok(self.records.read().map_err(poisoned)?.get(&destination_id).cloned())
    }

    async fn count(&self) -> Result<u64, RepositoryError> {
        Ok(self.records.read().map_err(poisoned)?.len() as u64)
    }
}
