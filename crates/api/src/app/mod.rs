//! HTTP API application wiring (Axum router + service wiring).
//!
//! - `services.rs`: store, limiter, executor, orchestrator and correlator wiring
//! - `routes/`: HTTP routes + handlers
//! - `dto.rs`: request/response DTOs
//! - `errors.rs`: consistent error responses

use std::sync::Arc;

use axum::{Extension, Router};
use tower::ServiceBuilder;

use vendorgate_infra::AppConfig;

use crate::middleware;

pub mod dto;
pub mod errors;
pub mod routes;
pub mod services;

pub use services::{AppServices, ServicesError};

/// Build the full HTTP router around already-wired services.
pub fn build_app(services: Arc<AppServices>) -> Router {
    routes::router()
        .layer(Extension(services))
        .layer(ServiceBuilder::new().layer(axum::middleware::from_fn(middleware::request_timing)))
}

/// Wire services from configuration and build the router (entrypoint used by
/// `main.rs`). The returned services handle is used for shutdown.
pub async fn build_from_config(
    config: &AppConfig,
) -> Result<(Router, Arc<AppServices>), ServicesError> {
    let services = Arc::new(services::build_services(config).await?);
    Ok((build_app(services.clone()), services))
}
