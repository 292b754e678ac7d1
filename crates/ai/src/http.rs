//! JSON-over-HTTP provider adapter.
//!
//! The provider receives the `SearchQuery` as a JSON body and answers with a
//! `SearchOutcome`. HTTP 429 is reported as a rate limit.

use std::time::Duration;

use async_trait::async_trait;
use reqwest::StatusCode;
use tracing::debug;

use crate::provider::EnrichmentProvider;
use crate::result::{ProviderError, SearchOutcome, SearchQuery};

#[derive(Debug, Clone)]
pub struct HttpSearchProvider {
    name: String,
    endpoint: String,
    api_key: Option<String>,
    client: reqwest::Client,
}

impl HttpSearchProvider {
    pub fn new(
        name: impl Into<String>,
        endpoint: impl Into<String>,
        api_key: Option<String>,
        timeout: Duration,
    ) -> Result<Self, ProviderError> {
        let name = name.into();
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| ProviderError::NotConfigured(format!("{name}: {e}")))?;
        Ok(Self {
            name,
            endpoint: endpoint.into(),
            api_key,
            client,
        })
    }

    fn request_error(&self, err: reqwest::Error) -> ProviderError {
        if err.is_timeout() {
            ProviderError::timeout(&self.name)
        } else {
            ProviderError::Request {
                provider: self.name.clone(),
                message: err.to_string(),
            }
        }
    }
}

#[async_trait]
impl EnrichmentProvider for HttpSearchProvider {
    fn name(&self) -> &str {
        &self.name
    }

    async fn search(&self, query: &SearchQuery) -> Result<SearchOutcome, ProviderError> {
        let mut request = self.client.post(&self.endpoint).json(query);
        if let Some(key) = &self.api_key {
            request = request.bearer_auth(key);
        }

        let response = request.send().await.map_err(|e| self.request_error(e))?;
        let status = response.status();
        debug!(provider = %self.name, %status, "provider responded");

        if status == StatusCode::TOO_MANY_REQUESTS {
            let message = response.text().await.unwrap_or_default();
            return Err(ProviderError::RateLimited {
                provider: self.name.clone(),
                message,
            });
        }
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(ProviderError::Request {
                provider: self.name.clone(),
                message: format!("status {status}: {body}"),
            });
        }

        response
            .json::<SearchOutcome>()
            .await
            .map_err(|e| ProviderError::InvalidResponse {
                provider: self.name.clone(),
                message: e.to_string(),
            })
    }
}
