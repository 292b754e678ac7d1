//! Enrichment records produced by the news collection job.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;

use crate::id::DestinationId;

/// Latest enrichment result for one destination.
///
/// Keyed by the owning destination, never by the job that produced it, so
/// processing the same destination twice replaces the record instead of
/// adding a second one.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EnrichmentRecord {
    pub destination_id: DestinationId,
    /// Name of the provider that answered the search.
    pub provider: String,
    pub results_found: u32,
    /// Provider-specific structured fields (news items, events, hours...).
    pub structured_fields: JsonValue,
    pub sources: Vec<String>,
    pub collected_at: DateTime<Utc>,
}

impl EnrichmentRecord {
    pub fn new(
        destination_id: DestinationId,
        provider: impl Into<String>,
        results_found: u32,
        structured_fields: JsonValue,
        sources: Vec<String>,
    ) -> Self {
        Self {
            destination_id,
            provider: provider.into(),
            results_found,
            structured_fields,
            sources,
            collected_at: Utc::now(),
        }
    }
}
