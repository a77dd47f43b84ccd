
use axum::http::StatusCode;
use axum::response::IntoResponse;
use serde_json::json;

use vendorgate_infra::jobs::{JobStoreError, OrchestratorError};

pub fn orchestrator_error_to_response(err: OrchestratorError) -> axum::response::Response {
    match err {
        OrchestratorError::JobNotFound(id) => {
            json_error(StatusCode::NOT_FOUND, "not_found", format!("job {id} not found"))
        }
        OrchestratorError::Store(JobStoreError::NotFound(id)) => {
            json_error(StatusCode::NOT_FOUND, "not_found", format!("job {id} not found"))
        }
        OrchestratorError::Store(e) => {
            tracing::error!(error = %e, "job store failure");
            json_error(StatusCode::INTERNAL_SERVER_ERROR, "store_error", e.to_string())
        }
        OrchestratorError::Schedule(e) => {
            json_error(StatusCode::SERVICE_UNAVAILABLE, "unavailable", e.to_string())
        }
        OrchestratorError::Contention(id) => json_error(
            StatusCode::CONFLICT,
            "conflict",
            format!("job {id} is being updated concurrently, retry later"),
        ),
        OrchestratorError::RateLimit(e) => {
            json_error(StatusCode::INTERNAL_SERVER_ERROR, "rate_limit_error", e.to_string())
        }
    }
}

pub fn json_error(
    status: StatusCode,
    code: &'static str,
    message: impl Into<String>,
) -> axum::response::Response {
    (
        status,
        axum::Json(json!({
            "error": code,
            "message": message.into(),
        })),
    )
        .into_response()
}
