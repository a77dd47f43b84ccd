//! Vendor callback intake.

use std::sync::Arc;

use axum::{
    extract::{rejection::JsonRejection, Extension, Path},
    http::StatusCode,
    response::IntoResponse,
    Json,
};

use vendorgate_core::VendorId;
use vendorgate_infra::jobs::CallbackOutcome;

use crate::app::{dto, errors};
use crate::app::services::AppServices;

/// Unplaceable or duplicate callbacks are answered 200 so the vendor stops
/// redelivering them.
pub async fn vendor_webhook(
    Extension(services): Extension<Arc<AppServices>>,
    Path(vendor): Path<String>,
    body: Result<Json<dto::VendorWebhookRequest>, JsonRejection>,
) -> axum::response::Response {
    let Json(body) = match body {
        Ok(b) => b,
        Err(e) => {
            return errors::json_error(StatusCode::BAD_REQUEST, "validation_error", e.body_text());
        }
    };
    let Some(response_id) = body.response_id() else {
        return errors::json_error(
            StatusCode::BAD_REQUEST,
            "validation_error",
            "missing response_id",
        );
    };

    let vendor = VendorId::new(vendor);
    match services
        .correlator
        .on_callback(&vendor, response_id, &body.data)
        .await
    {
        Ok(CallbackOutcome::Ack { .. }) => Json(dto::WebhookResponse::accepted()).into_response(),
        Ok(CallbackOutcome::Rejected(reason)) => {
            Json(dto::WebhookResponse::ignored(reason.as_str())).into_response()
        }
        Err(e) => errors::orchestrator_error_to_response(e),
    }
}
