//! Primary/fallback provider selection.
//!
//! `primary_request_limit` is enforced against a [`UsageBudget`] owned by the
//! caller, one per job, so overlapping jobs never share or reset each other's
//! allowance. The router itself only keeps process-scoped counters for
//! reporting, plus the primary's rate-limit cooldown.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};

use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::provider::EnrichmentProvider;
use crate::result::{ProviderError, SearchOutcome, SearchQuery};

#[derive(Clone)]
pub struct RouterConfig {
    pub primary: Arc<dyn EnrichmentProvider>,
    pub fallback: Option<Arc<dyn EnrichmentProvider>>,
    /// Requests the primary may serve per job before traffic moves to the
    /// fallback. `0` means unlimited.
    pub primary_request_limit: u64,
    /// How long the primary is avoided after it returned a rate-limit error.
    pub rate_limit_cooldown: Duration,
}

impl RouterConfig {
    pub fn new(primary: Arc<dyn EnrichmentProvider>) -> Self {
        Self {
            primary,
            fallback: None,
            primary_request_limit: 0,
            rate_limit_cooldown: Duration::from_secs(60),
        }
    }

    pub fn with_fallback(mut self, fallback: Arc<dyn EnrichmentProvider>) -> Self {
        self.fallback = Some(fallback);
        self
    }

    pub fn with_primary_request_limit(mut self, limit: u64) -> Self {
        self.primary_request_limit = limit;
        self
    }

    pub fn with_rate_limit_cooldown(mut self, cooldown: Duration) -> Self {
        self.rate_limit_cooldown = cooldown;
        self
    }
}

#[derive(Debug, Default)]
struct UsageCounters {
    requests: AtomicU64,
    rate_limit_errors: AtomicU64,
}

impl UsageCounters {
    fn reset(&self) {
        self.requests.store(0, Ordering::SeqCst);
        self.rate_limit_errors.store(0, Ordering::SeqCst);
    }
}

/// Primary requests granted to one job.
#[derive(Debug, Default)]
pub struct UsageBudget {
    primary_requests: AtomicU64,
}

impl UsageBudget {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn primary_requests(&self) -> u64 {
        self.primary_requests.load(Ordering::SeqCst)
    }
}

/// Snapshot of router state for the admin surface.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProviderStats {
    pub active_provider: String,
    /// Request count per provider name.
    pub usage: BTreeMap<String, u64>,
    /// Rate-limit error count per provider name.
    pub rate_limit_errors: BTreeMap<String, u64>,
}

/// A search result together with the provider that produced it.
#[derive(Debug, Clone, PartialEq)]
pub struct RoutedOutcome {
    pub provider: String,
    pub outcome: SearchOutcome,
}

pub struct ProviderRouter {
    config: RouterConfig,
    primary_usage: UsageCounters,
    fallback_usage: UsageCounters,
    /// Budget for callers outside a job.
    shared_budget: UsageBudget,
    epoch: Instant,
    /// Milliseconds since `epoch` (+1) of the last primary rate-limit error; 0 = none.
    primary_limited_at: AtomicU64,
}

impl ProviderRouter {
    pub fn new(config: RouterConfig) -> Self {
        Self {
            config,
            primary_usage: UsageCounters::default(),
            fallback_usage: UsageCounters::default(),
            shared_budget: UsageBudget::default(),
            epoch: Instant::now(),
            primary_limited_at: AtomicU64::new(0),
        }
    }

    /// Run one search against the router's shared budget.
    pub async fn search(&self, query: &SearchQuery) -> Result<RoutedOutcome, ProviderError> {
        self.search_within(&self.shared_budget, query).await
    }

    /// Run one search, charging primary requests to `budget` and failing over
    /// on rate limits.
    pub async fn search_within(
        &self,
        budget: &UsageBudget,
        query: &SearchQuery,
    ) -> Result<RoutedOutcome, ProviderError> {
        if !self.reserve_primary(budget) {
            return self.search_fallback(query).await;
        }

        let primary = &self.config.primary;
        match primary.search(query).await {
            Ok(outcome) => Ok(RoutedOutcome {
                provider: primary.name().to_string(),
                outcome,
            }),
            Err(err) if err.is_rate_limit() => {
                self.primary_usage.rate_limit_errors.fetch_add(1, Ordering::SeqCst);
                self.primary_limited_at
                    .store(self.now_marker(), Ordering::SeqCst);

                if self.config.fallback.is_some() {
                    warn!(provider = primary.name(), error = %err, "primary rate limited; retrying on fallback");
                    self.search_fallback(query).await
                } else {
                    Err(err)
                }
            }
            Err(err) => Err(err),
        }
    }

    /// Name of the provider the next request would go to.
    pub fn active_provider(&self) -> &str {
        match &self.config.fallback {
            Some(fallback) if self.primary_exhausted() || self.primary_cooling_down() => {
                fallback.name()
            }
            _ => self.config.primary.name(),
        }
    }

    pub fn stats(&self) -> ProviderStats {
        let mut usage = BTreeMap::new();
        let mut rate_limit_errors = BTreeMap::new();

        let mut add = |name: &str, counters: &UsageCounters| {
            *usage.entry(name.to_string()).or_insert(0) +=
                counters.requests.load(Ordering::SeqCst);
            *rate_limit_errors.entry(name.to_string()).or_insert(0) +=
                counters.rate_limit_errors.load(Ordering::SeqCst);
        };
        add(self.config.primary.name(), &self.primary_usage);
        if let Some(fallback) = &self.config.fallback {
            add(fallback.name(), &self.fallback_usage);
        }

        ProviderStats {
            active_provider: self.active_provider().to_string(),
            usage,
            rate_limit_errors,
        }
    }

    /// Zero the reporting counters and the shared budget, and forget any
    /// recent rate limit. Job budgets are unaffected.
    pub fn reset_usage(&self) {
        self.shared_budget.primary_requests.store(0, Ordering::SeqCst);
        self.primary_usage.reset();
        self.fallback_usage.reset();
        self.primary_limited_at.store(0, Ordering::SeqCst);
        debug!("provider usage counters reset");
    }

    /// Claim one primary request slot, or report that the fallback should be used.
    ///
    /// Without a fallback the primary is always used, even past its limit.
    fn reserve_primary(&self, budget: &UsageBudget) -> bool {
        if self.config.fallback.is_none() {
            budget.primary_requests.fetch_add(1, Ordering::SeqCst);
            self.primary_usage.requests.fetch_add(1, Ordering::SeqCst);
            return true;
        }
        if self.primary_cooling_down() {
            return false;
        }

        let limit = self.config.primary_request_limit;
        let granted = budget
            .primary_requests
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |used| {
                (limit == 0 || used < limit).then_some(used + 1)
            })
            .is_ok();
        if granted {
            self.primary_usage.requests.fetch_add(1, Ordering::SeqCst);
        }
        granted
    }

    async fn search_fallback(&self, query: &SearchQuery) -> Result<RoutedOutcome, ProviderError> {
        let Some(fallback) = &self.config.fallback else {
            return Err(ProviderError::NotConfigured("fallback provider".into()));
        };

        self.fallback_usage.requests.fetch_add(1, Ordering::SeqCst);
        match fallback.search(query).await {
            Ok(outcome) => Ok(RoutedOutcome {
                provider: fallback.name().to_string(),
                outcome,
            }),
            Err(err) => {
                if err.is_rate_limit() {
                    self.fallback_usage
                        .rate_limit_errors
                        .fetch_add(1, Ordering::SeqCst);
                }
                Err(err)
            }
        }
    }

    fn primary_exhausted(&self) -> bool {
        let limit = self.config.primary_request_limit;
        limit > 0 && self.primary_usage.requests.load(Ordering::SeqCst) >= limit
    }

    fn primary_cooling_down(&self) -> bool {
        let marker = self.primary_limited_at.load(Ordering::SeqCst);
        if marker == 0 {
            return false;
        }
        let since = self.now_marker().saturating_sub(marker);
        u128::from(since) < self.config.rate_limit_cooldown.as_millis()
    }

    fn now_marker(&self) -> u64 {
        u64::try_from(self.epoch.elapsed().as_millis())
            .unwrap_or(u64::MAX - 1)
            .saturating_add(1)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use rotv_core::Destination;
    use std::sync::atomic::AtomicBool;

    struct FakeProvider {
        name: &'static str,
        rate_limited: AtomicBool,
        calls: AtomicU64,
    }

    impl FakeProvider {
        fn new(name: &'static str) -> Arc<Self> {
            Arc::new(Self {
                name,
                rate_limited: AtomicBool::new(false),
                calls: AtomicU64::new(0),
            })
        }

        fn limited(name: &'static str) -> Arc<Self> {
            let p = Self::new(name);
            p.rate_limited.store(true, Ordering::SeqCst);
            p
        }
    }

    #[async_trait]
    impl EnrichmentProvider for FakeProvider {
        fn name(&self) -> &str {
            self.name
        }

        async fn search(&self, _query: &SearchQuery) -> Result<SearchOutcome, ProviderError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            if self.rate_limited.load(Ordering::SeqCst) {
                return Err(ProviderError::RateLimited {
                    provider: self.name.to_string(),
                    message: "429 Too Many Requests".into(),
                });
            }
            Ok(SearchOutcome {
                results_found: 1,
                ..SearchOutcome::default()
            })
        }
    }

    fn query() -> SearchQuery {
        SearchQuery::for_destination(&Destination::new("Everett Covered Bridge").unwrap())
    }

    #[tokio::test]
    async fn request_after_limit_routes_to_fallback() {
        let primary = FakeProvider::new("perplexity");
        let fallback = FakeProvider::new("gemini");
        let router = ProviderRouter::new(
            RouterConfig::new(primary.clone())
                .with_fallback(fallback.clone())
                .with_primary_request_limit(50),
        );

        for _ in 0..50 {
            let routed = router.search(&query()).await.unwrap();
            assert_eq!(routed.provider, "perplexity");
        }
        assert_eq!(router.active_provider(), "gemini");

        let routed = router.search(&query()).await.unwrap();
        assert_eq!(routed.provider, "gemini");

        let stats = router.stats();
        assert_eq!(stats.usage["perplexity"], 50);
        assert!(stats.usage["gemini"] >= 1);
        assert_eq!(stats.active_provider, "gemini");
    }

    #[tokio::test]
    async fn concurrent_requests_never_exceed_primary_limit() {
        let primary = FakeProvider::new("primary");
        let fallback = FakeProvider::new("fallback");
        let router = Arc::new(ProviderRouter::new(
            RouterConfig::new(primary.clone())
                .with_fallback(fallback.clone())
                .with_primary_request_limit(10),
        ));

        let mut handles = Vec::new();
        for _ in 0..40 {
            let router = router.clone();
            handles.push(tokio::spawn(async move { router.search(&query()).await }));
        }
        for h in handles {
            h.await.unwrap().unwrap();
        }

        let stats = router.stats();
        assert_eq!(stats.usage["primary"], 10);
        assert_eq!(stats.usage["fallback"], 30);
        assert_eq!(primary.calls.load(Ordering::SeqCst), 10);
    }

    #[tokio::test]
    async fn rate_limit_retries_once_on_fallback_and_cools_down_primary() {
        let primary = FakeProvider::limited("primary");
        let fallback = FakeProvider::new("fallback");
        let router = ProviderRouter::new(
            RouterConfig::new(primary.clone())
                .with_fallback(fallback.clone())
                .with_rate_limit_cooldown(Duration::from_secs(3600)),
        );

        let routed = router.search(&query()).await.unwrap();
        assert_eq!(routed.provider, "fallback");

        // Cooling down: the primary is not contacted again.
        router.search(&query()).await.unwrap();
        assert_eq!(primary.calls.load(Ordering::SeqCst), 1);
        assert_eq!(fallback.calls.load(Ordering::SeqCst), 2);

        let stats = router.stats();
        assert_eq!(stats.rate_limit_errors["primary"], 1);
        assert_eq!(stats.active_provider, "fallback");
    }

    #[tokio::test]
    async fn without_fallback_rate_limit_surfaces() {
        let primary = FakeProvider::limited("primary");
        let router = ProviderRouter::new(
            RouterConfig::new(primary.clone()).with_primary_request_limit(1),
        );

        let err = router.search(&query()).await.unwrap_err();
        assert!(err.is_rate_limit());

        // No fallback: the primary keeps being used past its limit.
        primary.rate_limited.store(false, Ordering::SeqCst);
        let routed = router.search(&query()).await.unwrap();
        assert_eq!(routed.provider, "primary");
        assert_eq!(router.stats().usage["primary"], 2);
    }

    #[tokio::test]
    async fn each_budget_gets_its_own_primary_allowance() {
        let primary = FakeProvider::new("primary");
        let fallback = FakeProvider::new("fallback");
        let router = ProviderRouter::new(
            RouterConfig::new(primary.clone())
                .with_fallback(fallback.clone())
                .with_primary_request_limit(2),
        );
        let first = UsageBudget::new();
        let second = UsageBudget::new();

        for _ in 0..3 {
            router.search_within(&first, &query()).await.unwrap();
        }
        let routed = router.search_within(&second, &query()).await.unwrap();
        assert_eq!(routed.provider, "primary");

        // Resetting the reporting counters does not refill a running budget.
        router.reset_usage();
        let routed = router.search_within(&first, &query()).await.unwrap();
        assert_eq!(routed.provider, "fallback");

        assert_eq!(first.primary_requests(), 2);
        assert_eq!(second.primary_requests(), 1);
        assert_eq!(primary.calls.load(Ordering::SeqCst), 3);
        assert_eq!(fallback.calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn reset_usage_restores_primary() {
        let primary = FakeProvider::new("primary");
        let fallback = FakeProvider::new("fallback");
        let router = ProviderRouter::new(
            RouterConfig::new(primary)
                .with_fallback(fallback)
                .with_primary_request_limit(1),
        );

        router.search(&query()).await.unwrap();
        assert_eq!(router.active_provider(), "fallback");

        router.reset_usage();
        assert_eq!(router.active_provider(), "primary");
        assert_eq!(router.stats().usage["primary"], 0);
    }
}
