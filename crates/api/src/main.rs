use anyhow::Context;

use vendorgate_infra::AppConfig;
use vendorgate_observability::LogFormat;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // A missing .env is normal outside local development.
    let _ = dotenvy::dotenv();

    let format = LogFormat::from_env_value(std::env::var("LOG_FORMAT").ok().as_deref());
    vendorgate_observability::init_with(format);

    let config = AppConfig::from_env().context("invalid configuration")?;
    let (app, services) = vendorgate_api::app::build_from_config(&config)
        .await
        .context("failed to wire services")?;

    let listener = tokio::net::TcpListener::bind(config.bind_addr)
        .await
        .with_context(|| format!("failed to bind {}", config.bind_addr))?;

    tracing::info!(
        addr = %listener.local_addr()?,
        vendors = config.vendors.len(),
        persistent = config.use_persistent_stores,
        "listening"
    );

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await
        .context("server error")?;

    services.shutdown().await;
    tracing::info!("shut down");
    Ok(())
}

async fn shutdown_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        tracing::warn!(error = %e, "failed to listen for ctrl-c");
    }
}
