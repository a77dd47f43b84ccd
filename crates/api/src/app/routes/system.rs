
use std::sync::Arc;

use axum::{extract::Extension, response::IntoResponse, Json};

use crate::app::errors;
use crate::app::services::AppServices;

pub async fn info() -> impl IntoResponse {
    Json(serde_json::json!({
        "name": env!("CARGO_PKG_NAME"),
        "version": env!("CARGO_PKG_VERSION"),
        "status": "running",
    }))
}

pub async fn health() -> impl IntoResponse {
    Json(serde_json::json!({ "status": "healthy" }))
}

pub async fn stats(Extension(services): Extension<Arc<AppServices>>) -> axum::response::Response {
    let jobs = match services.orchestrator.job_stats().await {
        Ok(s) => s,
        Err(e) => return errors::orchestrator_error_to_response(e),
    };

    Json(serde_json::json!({
        "jobs": jobs,
        "executor": services.executor_stats(),
    }))
    .into_response()
}
