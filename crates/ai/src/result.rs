use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;
use thiserror::Error;

use rotv_core::{Destination, DestinationId};

/// Context sent alongside a search so providers can disambiguate the place.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SearchContext {
    pub destination_id: DestinationId,
    pub name: String,
    pub latitude: Option<f64>,
    pub longitude: Option<f64>,
    pub category: Option<String>,
}

/// One enrichment search request.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SearchQuery {
    pub query: String,
    pub context: SearchContext,
}

impl SearchQuery {
    /// News/events query for a destination.
    pub fn for_destination(destination: &Destination) -> Self {
        Self {
            query: format!(
                "Latest news, events and closures for {} in Cuyahoga Valley National Park",
                destination.name
            ),
            context: SearchContext {
                destination_id: destination.id,
                name: destination.name.clone(),
                latitude: destination.coordinates.map(|c| c.latitude()),
                longitude: destination.coordinates.map(|c| c.longitude()),
                category: destination.category.clone(),
            },
        }
    }
}

/// What a provider returned for a query.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct SearchOutcome {
    #[serde(default)]
    pub results_found: u32,

    /// Free-form structured fields (news items, events, hours...).
    #[serde(default)]
    pub structured_fields: JsonValue,

    #[serde(default)]
    pub sources: Vec<String>,
}

#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum ProviderError {
    /// The provider refused the call because of quota/rate limits.
    #[error("{provider} rate limited: {message}")]
    RateLimited { provider: String, message: String },

    #[error("{provider} timed out")]
    Timeout { provider: String },

    #[error("{provider} request failed: {message}")]
    Request { provider: String, message: String },

    #[error("{provider} returned an invalid response: {message}")]
    InvalidResponse { provider: String, message: String },

    #[error("provider not configured: {0}")]
    NotConfigured(String),
}

impl ProviderError {
    pub fn is_rate_limit(&self) -> bool {
        matches!(self, Self::RateLimited { .. })
    }

    /// Worth one more attempt on the same provider.
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::Timeout { .. } | Self::Request { .. })
    }

    pub fn timeout(provider: impl Into<String>) -> Self {
        Self::Timeout {
            provider: provider.into(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rotv_core::Coordinates;

    #[test]
    fn query_carries_destination_context() {
        let d = Destination::new("Brandywine Falls")
            .unwrap()
            .with_coordinates(Coordinates::new(41.2768, -81.5390).unwrap())
            .with_category("Waterfall");
        let q = SearchQuery::for_destination(&d);

        assert!(q.query.contains("Brandywine Falls"));
        assert_eq!(q.context.destination_id, d.id);
        assert_eq!(q.context.latitude, Some(41.2768));
        assert_eq!(q.context.category.as_deref(), Some("Waterfall"));
    }

    #[test]
    fn outcome_tolerates_missing_fields() {
        let o: SearchOutcome = serde_json::from_str(r#"{"results_found": 3}"#).unwrap();
        assert_eq!(o.results_found, 3);
        assert!(o.sources.is_empty());
        assert!(o.structured_fields.is_null());
    }

    #[test]
    fn only_rate_limits_are_failover_signals() {
        let rl = ProviderError::RateLimited {
            provider: "p".into(),
            message: "429".into(),
        };
        assert!(rl.is_rate_limit());
        assert!(!rl.is_retryable());
        assert!(ProviderError::timeout("p").is_retryable());
        assert!(!ProviderError::timeout("p").is_rate_limit());
    }
}
