use async_trait::async_trait;

use crate::result::{ProviderError, SearchOutcome, SearchQuery};

/// An external AI search provider.
///
/// Implementations must report quota refusals as [`ProviderError::RateLimited`]
/// so the router can fail over.
#[async_trait]
pub trait EnrichmentProvider: Send + Sync {
    /// Stable provider name used in usage counters and stored records.
    fn name(&self) -> &str;

    async fn search(&self, query: &SearchQuery) -> Result<SearchOutcome, ProviderError>;
}

/// Stand-in used when no provider endpoint is configured. Every search fails
/// with [`ProviderError::NotConfigured`], which is recorded per unit.
#[derive(Debug, Clone)]
pub struct DisabledProvider {
    name: String,
}

impl DisabledProvider {
    pub fn new(name: impl Into<String>) -> Self {
        Self { name: name.into() }
    }
}

#[async_trait]
impl EnrichmentProvider for DisabledProvider {
    fn name(&self) -> &str {
        &self.name
    }

    async fn search(&self, _query: &SearchQuery) -> Result<SearchOutcome, ProviderError> {
        Err(ProviderError::NotConfigured(self.name.clone()))
    }
}
