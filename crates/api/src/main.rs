use std::sync::Arc;

use anyhow::Context;

use rotv_infra::config::AppConfig;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    rotv_observability::init();

    let config = AppConfig::from_env().context("invalid configuration")?;
    let services = Arc::new(rotv_api::app::services::AppServices::from_config(&config).await?);
    let app = rotv_api::app::build_app(services.clone());

    let listener = tokio::net::TcpListener::bind(config.bind_addr)
        .await
        .with_context(|| format!("failed to bind {}", config.bind_addr))?;
    tracing::info!("listening on {}", listener.local_addr()?);

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await
        .context("server error")?;

    services.stop().await;
    Ok(())
}

async fn shutdown_signal() {
    if let Err(err) = tokio::signal::ctrl_c().await {
        tracing::error!(error = %err, "failed to listen for shutdown signal");
        std::future::pending::<()>().await;
    }
    tracing::info!("shutdown requested");
}
