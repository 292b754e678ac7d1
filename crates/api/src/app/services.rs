//! Service wiring for the HTTP layer.

use rotv_infra::config::AppConfig;
use rotv_infra::service::{ServiceConfig, ServiceDeps, SyncJobService};

/// Everything the handlers reach through `Extension`.
pub struct AppServices {
    core: SyncJobService,
}

impl AppServices {
    /// Build adapters from configuration and start the core.
    pub async fn from_config(config: &AppConfig) -> anyhow::Result<Self> {
        let deps = ServiceDeps::from_config(config).await?;
        Self::start(deps, ServiceConfig::from(config)).await
    }

    /// Start the core around explicit adapters (used by tests).
    pub async fn start(deps: ServiceDeps, config: ServiceConfig) -> anyhow::Result<Self> {
        let core = SyncJobService::start(deps, config).await?;
        Ok(Self { core })
    }

    pub fn core(&self) -> &SyncJobService {
        &self.core
    }

    pub async fn stop(&self) {
        self.core.stop().await;
    }
}
