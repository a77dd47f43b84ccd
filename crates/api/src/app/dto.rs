//! Request/response DTOs for the HTTP surface.

use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;

use vendorgate_core::{JobId, JobStatus};

#[derive(Debug, Clone, Deserialize)]
pub struct CreateJobRequest {
    pub payload: JsonValue,
}

#[derive(Debug, Clone, Serialize)]
pub struct CreateJobResponse {
    pub request_id: JobId,
    pub status: JobStatus,
}

/// Body posted by a vendor when an asynchronous job finishes.
///
/// Some vendors put `response_id` at the top level, others inside `data`.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct VendorWebhookRequest {
    #[serde(default)]
    pub response_id: Option<String>,
    #[serde(default)]
    pub data: JsonValue,
}

impl VendorWebhookRequest {
    pub fn response_id(&self) -> Option<&str> {
        self.response_id
            .as_deref()
            .or_else(|| self.data.get("response_id").and_then(JsonValue::as_str))
            .map(str::trim)
            .filter(|id| !id.is_empty())
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct WebhookResponse {
    pub status: &'static str,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub reason: Option<&'static str>,
}

impl WebhookResponse {
    pub fn accepted() -> Self {
        Self {
            status: "accepted",
            reason: None,
        }
    }

    pub fn ignored(reason: &'static str) -> Self {
        Self {
            status: "ignored",
            reason: Some(reason),
        }
    }
}
