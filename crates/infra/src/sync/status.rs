//! Generic key/value sync bookkeeping (`last_sync`, `last_push`, `last_pull`).

use std::collections::BTreeMap;
use std::sync::RwLock;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::local::RepositoryError;

pub const LAST_SYNC: &str = "last_sync";
pub const LAST_PUSH: &str = "last_push";
pub const LAST_PULL: &str = "last_pull";

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SyncStatusEntry {
    pub key: String,
    pub value: String,
    pub updated_at: DateTime<Utc>,
}

#[async_trait]
pub trait SyncStatusStore: Send + Sync {
    async fn upsert(&self, key: &str, value: &str) -> Result<SyncStatusEntry, RepositoryError>;

    async fn get(&self, key: &str) -> Result<Option<SyncStatusEntry>, RepositoryError>;

    /// All entries ordered by key.
    async fn all(&self) -> Result<Vec<SyncStatusEntry>, RepositoryError>;

    /// Stamp `key` with the current time.
    async fn stamp(&self, key: &str) -> Result<SyncStatusEntry, RepositoryError> {
        self.upsert(key, &Utc::now().to_rfc3339()).await
    }
}

#[derive(Debug, Default)]
pub struct InMemorySyncStatusStore {
    entries: RwLock<BTreeMap<String, SyncStatusEntry>>,
}

impl InMemorySyncStatusStore {
    pub fn new() -> Self {
        Self::default()
    }
}

fn poisoned<T>(_: T) -> RepositoryError {
    RepositoryError::Storage("lock poisoned".into())
}

#[async_trait]
impl SyncStatusStore for InMemorySyncStatusStore {
    async fn upsert(&self, key: &str, value: &str) -> Result<SyncStatusEntry, RepositoryError> {
        let entry = SyncStatusEntry {
            key: key.to_string(),
            value: value.to_string(),
            updated_at: Utc::now(),
        };
        self.entries
            .write()
            .map_err(poisoned)?
            .insert(entry.key.clone(), entry.clone());
        Ok(entry)
    }

    async fn get(&self, key: &str) -> Result<Option<SyncStatusEntry>, RepositoryError> {
        Ok(self.entries.read().map_err(poisoned)?.get(key).cloned())
    }

    async fn all(&self) -> Result<Vec<SyncStatusEntry>, RepositoryError> {
        Ok(self.entries.read().map_err(poisoned)?.values().cloned().collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn upsert_overwrites_value() {
        let store = InMemorySyncStatusStore::new();
        store.upsert(LAST_PUSH, "a").await.unwrap();
        store.upsert(LAST_PUSH, "b").await.unwrap();

        assert_eq!(store.get(LAST_PUSH).await.unwrap().unwrap().value, "b");
        assert_eq!(store.all().await.unwrap().len(), 1);
        assert!(store.get(LAST_PULL).await.unwrap().is_none());
    }
}
