
use axum::{
    routing::{get, post},
    Router,
};

pub mod jobs;
pub mod system;
pub mod webhooks;

/// Router for every endpoint; services arrive through an `Extension` layer.
pub fn router() -> Router {
    Router::new()
        .route("/", get(system::info))
        .route("/health", get(system::health))
        .route("/stats", get(system::stats))
        .nest("/jobs", jobs::router())
        .route("/vendor-webhook/:vendor", post(webhooks::vendor_webhook))
}
