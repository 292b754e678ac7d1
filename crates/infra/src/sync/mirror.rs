//! External mirror boundary (spreadsheet-style collections of rows).
//!
//! A collection is a named tab with a header row and data rows of string
//! cells. Column 0 of every row is its natural key.

use std::collections::HashMap;
use std::sync::Mutex;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use thiserror::Error;

pub type MirrorRow = Vec<String>;

#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum MirrorError {
    #[error("mirror not configured: {0}")]
    NotConfigured(String),

    #[error("mirror authentication failed: {0}")]
    Auth(String),

    #[error("mirror network error: {0}")]
    Network(String),

    #[error("mirror api error ({status}): {message}")]
    Api { status: u16, message: String },

    #[error("collection not found: {0}")]
    MissingCollection(String),
}

impl MirrorError {
    /// Errors that will fail every subsequent call too.
    pub fn is_fatal(&self) -> bool {
        matches!(self, Self::NotConfigured(_) | Self::Auth(_))
    }

    pub fn is_retryable(&self) -> bool {
        match self {
            Self::Network(_) => true,
            Self::Api { status, .. } => *status == 429 || *status >= 500,
            _ => false,
        }
    }
}

/// Header formatting applied when a collection is created.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SheetStyle {
    pub bold_header: bool,
    pub frozen_rows: u32,
    /// Hex colour, e.g. `#2e7d32`.
    pub header_background: Option<String>,
}

impl Default for SheetStyle {
    fn default() -> Self {
        Self {
            bold_header: true,
            frozen_rows: 1,
            header_background: None,
        }
    }
}

#[async_trait]
pub trait Mirror: Send + Sync {
    /// Identity of the mirror (e.g. spreadsheet id). Locks are keyed by it.
    fn target(&self) -> &str;

    /// Data rows, header excluded.
    async fn list_rows(&self, collection: &str) -> Result<Vec<MirrorRow>, MirrorError>;

    async fn append_rows(&self, collection: &str, rows: Vec<MirrorRow>) -> Result<(), MirrorError>;

    async fn append_row(&self, collection: &str, row: MirrorRow) -> Result<(), MirrorError> {
        self.append_rows(collection, vec![row]).await
    }

    /// Replace the row stored under `key`, or append when absent.
    async fn update_row_by_key(&self, collection: &str, key: &str, row: MirrorRow) -> Result<(), MirrorError>;

    /// Returns whether a row was removed. An absent key is not an error.
    async fn delete_row_by_key(&self, collection: &str, key: &str) -> Result<bool, MirrorError>;

    /// Remove every data row, keeping the header.
    async fn clear_range(&self, collection: &str) -> Result<(), MirrorError>;

    /// Create the collection when missing. Returns whether it was created.
    async fn ensure_collection_exists(
        &self,
        name: &str,
        headers: &[String],
        style: &SheetStyle,
    ) -> Result<bool, MirrorError>;
}

/// Stand-in used when no mirror is configured: every call fails fatally.
#[derive(Debug, Clone)]
pub struct UnconfiguredMirror {
    target: String,
}

impl UnconfiguredMirror {
    pub fn new(target: impl Into<String>) -> Self {
        Self { target: target.into() }
    }

    fn error(&self) -> MirrorError {
        MirrorError::NotConfigured(format!("no credentials for mirror {}", self.target))
    }
}

#[async_trait]
impl Mirror for UnconfiguredMirror {
    fn target(&self) -> &str {
        &self.target
    }

    async fn list_rows(&self, _collection: &str) -> Result<Vec<MirrorRow>, MirrorError> {
        Err(self.error())
    }

    async fn append_rows(&self, _collection: &str, _rows: Vec<MirrorRow>) -> Result<(), MirrorError> {
        Err(self.error())
    }

    async fn update_row_by_key(&self, _collection: &str, _key: &str, _row: MirrorRow) -> Result<(), MirrorError> {
        Err(self.error())
    }

    async fn delete_row_by_key(&self, _collection: &str, _key: &str) -> Result<bool, MirrorError> {
        Err(self.error())
    }

    async fn clear_range(&self, _collection: &str) -> Result<(), MirrorError> {
        Err(self.error())
    }

    async fn ensure_collection_exists(
        &self,
        _name: &str,
        _headers: &[String],
        _style: &SheetStyle,
    ) -> Result<bool, MirrorError> {
        Err(self.error())
    }
}

#[derive(Debug, Clone, Default)]
struct Collection {
    headers: Vec<String>,
    style: SheetStyle,
    rows: Vec<MirrorRow>,
}

#[derive(Debug, Default)]
struct MirrorState {
    collections: HashMap<String, Collection>,
    /// Keyed failures: any write targeting this key fails.
    key_failures: HashMap<String, MirrorError>,
    /// Fails every call while set.
    global_failure: Option<MirrorError>,
    write_calls: u64,
}

/// Process-local mirror for development and tests.
#[derive(Debug)]
pub struct InMemoryMirror {
    target: String,
    state: Mutex<MirrorState>,
}

impl InMemoryMirror {
    pub fn new(target: impl Into<String>) -> Self {
        Self {
            target: target.into(),
            state: Mutex::new(MirrorState::default()),
        }
    }

    fn state(&self) -> Result<std::sync::MutexGuard<'_, MirrorState>, MirrorError> {
        self.state
            .lock()
            .map_err(|_| MirrorError::Network("mirror state poisoned".into()))
    }

    /// Make every write for `key` fail with `error` until cleared.
    pub fn fail_key(&self, key: impl Into<String>, error: MirrorError) {
        if let Ok(mut state) = self.state.lock() {
            state.key_failures.insert(key.into(), error);
        }
    }

    pub fn clear_key_failure(&self, key: &str) {
        if let Ok(mut state) = self.state.lock() {
            state.key_failures.remove(key);
        }
    }

    /// Make every call fail with `error` (or succeed again with `None`).
    pub fn fail_all(&self, error: Option<MirrorError>) {
        if let Ok(mut state) = self.state.lock() {
            state.global_failure = error;
        }
    }

    /// Keys (column 0) of a collection in row order.
    pub fn keys(&self, collection: &str) -> Vec<String> {
        self.state
            .lock()
            .map(|state| {
                state
                    .collections
                    .get(collection)
                    .map(|c| c.rows.iter().filter_map(|r| r.first().cloned()).collect())
                    .unwrap_or_default()
            })
            .unwrap_or_default()
    }

    pub fn headers(&self, collection: &str) -> Option<Vec<String>> {
        let state = self.state.lock().ok()?;
        state.collections.get(collection).map(|c| c.headers.clone())
    }

    pub fn style(&self, collection: &str) -> Option<SheetStyle> {
        let state = self.state.lock().ok()?;
        state.collections.get(collection).map(|c| c.style.clone())
    }

    pub fn write_calls(&self) -> u64 {
        self.state.lock().map(|s| s.write_calls).unwrap_or_default()
    }

    fn check(state: &MirrorState, key: Option<&str>) -> Result<(), MirrorError> {
        if let Some(err) = &state.global_failure {
            return Err(err.clone());
        }
        if let Some(err) = key.and_then(|k| state.key_failures.get(k)) {
            return Err(err.clone());
        }
        Ok(())
    }
}

fn collection_mut<'a>(state: &'a mut MirrorState, name: &str) -> Result<&'a mut Collection, MirrorError> {
    state
        .collections
        .get_mut(name)
        .ok_or_else(|| MirrorError::MissingCollection(name.to_string()))
}

#[async_trait]
impl Mirror for InMemoryMirror {
    fn target(&self) -> &str {
        &self.target
    }

    async fn list_rows(&self, collection: &str) -> Result<Vec<MirrorRow>, MirrorError> {
        let state = self.state()?;
        Self::check(&state, None)?;
        state
            .collections
            .get(collection)
            .map(|c| c.rows.clone())
            .ok_or_else(|| MirrorError::MissingCollection(collection.to_string()))
    }

    async fn append_rows(&self, collection: &str, rows: Vec<MirrorRow>) -> Result<(), MirrorError> {
        let mut state = self.state()?;
        Self::check(&state, None)?;
        for row in &rows {
            Self::check(&state, row.first().map(String::as_str))?;
        }
        state.write_calls += 1;
        collection_mut(&mut state, collection)?.rows.extend(rows);
        Ok(())
    }

    async fn update_row_by_key(&self, collection: &str, key: &str, row: MirrorRow) -> Result<(), MirrorError> {
        let mut state = self.state()?;
        Self::check(&state, Some(key))?;
        state.write_calls += 1;
        let rows = &mut collection_mut(&mut state, collection)?.rows;
        match rows.iter_mut().find(|r| r.first().map(String::as_str) == Some(key)) {
            Some(existing) => *existing = row,
            None => rows.push(row),
        }
        Ok(())
    }

    async fn delete_row_by_key(&self, collection: &str, key: &str) -> Result<bool, MirrorError> {
        let mut state = self.state()?;
        Self::check(&state, Some(key))?;
        state.write_calls += 1;
        let rows = &mut collection_mut(&mut state, collection)?.rows;
        let before = rows.len();
        rows.retain(|r| r.first().map(String::as_str) != Some(key));
        Ok(rows.len() != before)
    }

    async fn clear_range(&self, collection: &str) -> Result<(), MirrorError> {
        let mut state = self.state()?;
        Self::check(&state, None)?;
        state.write_calls += 1;
        collection_mut(&mut state, collection)?.rows.clear();
        Ok(())
    }

    async fn ensure_collection_exists(
        &self,
        name: &str,
        headers: &[String],
        style: &SheetStyle,
    ) -> Result<bool, MirrorError> {
        let mut state = self.state()?;
        Self::check(&state, None)?;
        if state.collections.contains_key(name) {
            return Ok(false);
        }
        state.collections.insert(
            name.to_string(),
            Collection {
                headers: headers.to_vec(),
                style: style.clone(),
                rows: Vec::new(),
            },
        );
        Ok(true)
    }
}

#[cfg(test)]
pub(crate) mod interference {
    //! A mirror wrapper that lets tests act while a mirror write is in flight.

    use std::sync::Arc;
    use std::time::Duration;

    use rotv_core::DestinationId;

    use crate::local::DestinationRepository;

    use super::*;

    pub(crate) struct InterferingMirror {
        inner: Arc<InMemoryMirror>,
        destinations: Arc<dyn DestinationRepository>,
        edit: Option<DestinationId>,
        stall: Option<Duration>,
    }

    impl InterferingMirror {
        pub(crate) fn new(inner: Arc<InMemoryMirror>, destinations: Arc<dyn DestinationRepository>) -> Self {
            Self {
                inner,
                destinations,
                edit: None,
                stall: None,
            }
        }

        /// Edit `id` locally before each row write reaches the mirror.
        pub(crate) fn editing(mut self, id: DestinationId) -> Self {
            self.edit = Some(id);
            self
        }

        /// Sleep for `stall` before each row write.
        pub(crate) fn stalling(mut self, stall: Duration) -> Self {
            self.stall = Some(stall);
            self
        }

        async fn interfere(&self) {
            if let Some(stall) = self.stall {
                tokio::time::sleep(stall).await;
            }
            let Some(id) = self.edit else { return };
            if let Ok(Some(mut d)) = self.destinations.get(id).await {
                d.description = Some("edited mid-sync".into());
                d.touch();
                d.updated_at += chrono::Duration::milliseconds(1);
                let _ = self.destinations.upsert(&d).await;
            }
        }
    }

    #[async_trait]
    impl Mirror for InterferingMirror {
        fn target(&self) -> &str {
            self.inner.target()
        }

        async fn list_rows(&self, collection: &str) -> Result<Vec<MirrorRow>, MirrorError> {
            self.inner.list_rows(collection).await
        }

        async fn append_rows(&self, collection: &str, rows: Vec<MirrorRow>) -> Result<(), MirrorError> {
            self.interfere().await;
            self.inner.append_rows(collection, rows).await
        }

        async fn update_row_by_key(&self, collection: &str, key: &str, row: MirrorRow) -> Result<(), MirrorError> {
            self.interfere().await;
            self.inner.update_row_by_key(collection, key, row).await
        }

        async fn delete_row_by_key(&self, collection: &str, key: &str) -> Result<bool, MirrorError> {
            self.inner.delete_row_by_key(collection, key).await
        }

        async fn clear_range(&self, collection: &str) -> Result<(), MirrorError> {
            self.inner.clear_range(collection).await
        }

        async fn ensure_collection_exists(
            &self,
            name: &str,
            headers: &[String],
            style: &SheetStyle,
        ) -> Result<bool, MirrorError> {
            self.inner.ensure_collection_exists(name, headers, style).await
        }
    }
}
