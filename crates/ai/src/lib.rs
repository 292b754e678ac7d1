//! `rotv-ai`
//!
//! **Responsibility:** boundary to the external AI search providers used to
//! enrich destinations.
//!
//! This crate is intentionally storage-agnostic:
//! - It does not persist anything; callers (infra workers) store the results.
//! - It owns provider selection and failover (`ProviderRouter`) and the
//!   per-provider usage counters that drive it.

pub mod http;
pub mod provider;
pub mod result;
pub mod router;

pub use http::HttpSearchProvider;
pub use provider::{DisabledProvider, EnrichmentProvider};
pub use result::{ProviderError, SearchContext, SearchOutcome, SearchQuery};
pub use router::{ProviderRouter, ProviderStats, RoutedOutcome, RouterConfig, UsageBudget};
