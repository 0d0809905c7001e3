use std::sync::Arc;

use clap::Parser;
use hugr_router::Configuration;
use hugr_router::Gateway;
use hugr_router::engine::HttpEngine;
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| "info".into()))
        .init();

    let config = Configuration::parse();
    config.validate()?;
    let bind = config.bind;

    let engine = Arc::new(HttpEngine::new(config.engine_url.clone()));
    let gateway = Gateway::new(config, engine).await?;
    gateway.bootstrap().await?;

    let listener = tokio::net::TcpListener::bind(bind).await?;
    tracing::info!(%bind, "hugr-router listening");
    axum::serve(listener, gateway.router()).await?;
    Ok(())
}
