//! Bounded timeout + retry around a single external call.
//!
//! Used at the Unit Worker (provider search) and Reconciler (mirror apply)
//! boundaries so a hung request cannot stall a job or a sync run.

use std::future::Future;
use std::time::Duration;

use rotv_ai::ProviderError;
use tracing::warn;

use crate::sync::mirror::MirrorError;

/// Errors that know whether another attempt is worthwhile.
pub trait CallFailure: Sized {
    fn is_retryable(&self) -> bool;

    /// The error reported when an attempt exceeds the timeout.
    fn timed_out(operation: &str, after: Duration) -> Self;
}

impl CallFailure for ProviderError {
    fn is_retryable(&self) -> bool {
        ProviderError::is_retryable(self)
    }

    fn timed_out(operation: &str, _after: Duration) -> Self {
        ProviderError::timeout(operation)
    }
}

impl CallFailure for MirrorError {
    fn is_retryable(&self) -> bool {
        MirrorError::is_retryable(self)
    }

    fn timed_out(operation: &str, after: Duration) -> Self {
        MirrorError::Network(format!("{operation} timed out after {after:?}"))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CallPolicy {
    /// Upper bound for one attempt.
    pub timeout: Duration,
    /// Extra attempts after the first one.
    pub retries: u32,
    /// Pause between attempts.
    pub retry_delay: Duration,
}

impl Default for CallPolicy {
    fn default() -> Self {
        Self::new(Duration::from_secs(30), 1)
    }
}

impl CallPolicy {
    pub fn new(timeout: Duration, retries: u32) -> Self {
        Self {
            timeout,
            retries,
            retry_delay: Duration::from_millis(250),
        }
    }

    pub fn with_retry_delay(mut self, delay: Duration) -> Self {
        self.retry_delay = delay;
        self
    }

    /// Run `attempt` once under the timeout. For writes that must not be
    /// repeated.
    pub async fn call_once<T, E, Fut>(&self, operation: &str, attempt: Fut) -> Result<T, E>
    where
        E: CallFailure,
        Fut: Future<Output = Result<T, E>>,
    {
        tokio::time::timeout(self.timeout, attempt)
            .await
            .unwrap_or_else(|_| Err(E::timed_out(operation, self.timeout)))
    }

    /// Run `attempt` until it succeeds, fails with a non-retryable error, or
    /// the retry budget is spent. Timeouts are always retryable.
    pub async fn call<T, E, F, Fut>(&self, operation: &str, mut attempt: F) -> Result<T, E>
    where
        E: CallFailure + std::fmt::Display,
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, E>>,
    {
        let mut tries = 0u32;
        loop {
            tries += 1;
            let err = match tokio::time::timeout(self.timeout, attempt()).await {
                Ok(Ok(value)) => return Ok(value),
                Ok(Err(err)) if !err.is_retryable() => return Err(err),
                Ok(Err(err)) => err,
                Err(_) => E::timed_out(operation, self.timeout),
            };

            if tries > self.retries {
                return Err(err);
            }
            warn!(operation, attempt = tries, error = %err, "call failed; retrying");
            if !self.retry_delay.is_zero() {
                tokio::time::sleep(self.retry_delay).await;
            }
        }
    }
}
