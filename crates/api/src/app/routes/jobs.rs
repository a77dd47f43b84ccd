
use std::sync::Arc;

use axum::{
    extract::{rejection::JsonRejection, Extension, Path},
    http::StatusCode,
    response::IntoResponse,
    routing::{get, post},
    Json, Router,
};

use vendorgate_core::{JobId, JobStatus};

use crate::app::{dto, errors};
use crate::app::services::AppServices;

pub fn router() -> Router {
    Router::new()
        .route("/", post(create_job))
        .route("/:id", get(get_job))
}

pub async fn create_job(
    Extension(services): Extension<Arc<AppServices>>,
    body: Result<Json<dto::CreateJobRequest>, JsonRejection>,
) -> axum::response::Response {
    let Json(body) = match body {
        Ok(b) => b,
        Err(e) => {
            return errors::json_error(StatusCode::BAD_REQUEST, "validation_error", e.body_text());
        }
    };
    if !body.payload.is_object() {
        return errors::json_error(
            StatusCode::BAD_REQUEST,
            "validation_error",
            "payload must be a JSON object",
        );
    }

    let request_id = match services.orchestrator.create_job(body.payload).await {
        Ok(id) => id,
        Err(e) => return errors::orchestrator_error_to_response(e),
    };

    (
        StatusCode::ACCEPTED,
        Json(dto::CreateJobResponse {
            request_id,
            status: JobStatus::Pending,
        }),
    )
        .into_response()
}

pub async fn get_job(
    Extension(services): Extension<Arc<AppServices>>,
    Path(id): Path<String>,
) -> axum::response::Response {
    let job_id: JobId = match id.parse() {
        Ok(v) => v,
        Err(_) => return errors::json_error(StatusCode::BAD_REQUEST, "invalid_id", "invalid id"),
    };

    match services.orchestrator.job_status(job_id).await {
        Ok(Some(view)) => Json(view).into_response(),
        Ok(None) => errors::json_error(StatusCode::NOT_FOUND, "not_found", "job not found"),
        Err(e) => errors::orchestrator_error_to_response(e),
    }
}
