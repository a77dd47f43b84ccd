//! Reconciles vendor webhook callbacks with the jobs that produced them.

use std::sync::Arc;
use std::time::Duration;

use serde_json::Value as JsonValue;
use tracing::{info, instrument, warn};

use vendorgate_core::{FailureReason, JobId, JobStatus, JobUpdate, VendorId};

use super::orchestrator::{JobOrchestrator, OrchestratorError};
use super::store::{Expected, TransitionOutcome};

/// Conditional writes attempted before a callback gives up on a contended job.
const MAX_FINALIZE_ATTEMPTS: u32 = 5;

/// Pause between reloads while the dispatcher is still committing
/// `awaiting_callback`.
const SETTLE_PAUSE: Duration = Duration::from_millis(20);

const FAILURE_STATUSES: &[&str] = &["failed", "failure", "error"];

/// Why a callback was not applied. Neither case is an error to the vendor.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RejectReason {
    /// No job is bound to this vendor's response id
    UnknownCorrelation,
    /// The job already reached a terminal status
    AlreadyFinalized(JobId),
}

impl RejectReason {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::UnknownCorrelation => "unknown_correlation",
            Self::AlreadyFinalized(_) => "already_finalized",
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum CallbackOutcome {
    Ack { job_id: JobId, status: JobStatus },
    Rejected(RejectReason),
}

/// Vendor callback, split into its outcome and result part.
#[derive(Debug, Clone, PartialEq)]
struct CallbackReport {
    succeeded: bool,
    message: Option<String>,
    result: JsonValue,
}

impl CallbackReport {
    fn from_payload(payload: &JsonValue) -> Self {
        let status = payload
            .get("status")
            .and_then(JsonValue::as_str)
            .map(|s| s.trim().to_ascii_lowercase());
        let succeeded = !status
            .as_deref()
            .is_some_and(|s| FAILURE_STATUSES.contains(&s));

        let message = ["error", "message"]
            .iter()
            .find_map(|k| payload.get(*k).and_then(JsonValue::as_str))
            .map(str::to_string);

        Self {
            succeeded,
            message,
            result: payload.get("result").cloned().unwrap_or_else(|| payload.clone()),
        }
    }
}

/// Drives the terminal transition for async-vendor jobs.
#[derive(Clone)]
pub struct WebhookCorrelator {
    orchestrator: Arc<JobOrchestrator>,
}

impl WebhookCorrelator {
    pub fn new(orchestrator: Arc<JobOrchestrator>) -> Self {
        Self { orchestrator }
    }

    #[instrument(skip(self, payload), fields(vendor = %vendor))]
    pub async fn on_callback(
        &self,
        vendor: &VendorId,
        response_id: &str,
        payload: &JsonValue,
    ) -> Result<CallbackOutcome, OrchestratorError> {
        let store = self.orchestrator.store();

        let Some(job_id) = store.find_by_correlation(vendor, response_id).await? else {
            warn!(response_id = %response_id, "callback for unknown correlation");
            return Ok(CallbackOutcome::Rejected(RejectReason::UnknownCorrelation));
        };

        let report = CallbackReport::from_payload(payload);
        let normalized = self.orchestrator.transformer().transform(&report.result);

        for attempt in 1..=MAX_FINALIZE_ATTEMPTS {
            let job = store
                .get(job_id)
                .await?
                .ok_or(OrchestratorError::JobNotFound(job_id))?;

            if job.is_terminal() {
                info!(job_id = %job_id, status = %job.status, "duplicate callback ignored");
                return Ok(CallbackOutcome::Rejected(RejectReason::AlreadyFinalized(job_id)));
            }

            if job.status != JobStatus::AwaitingCallback {
                // The dispatcher binds the token before committing awaiting_callback;
                // give it a moment before finalizing out of order.
                if attempt < MAX_FINALIZE_ATTEMPTS {
                    tokio::time::sleep(SETTLE_PAUSE * attempt).await;
                    continue;
                }
                warn!(
                    job_id = %job_id,
                    status = %job.status,
                    "callback arrived before the job was awaiting it; finalizing anyway"
                );
            }

            let update = if report.succeeded {
                JobUpdate::complete(normalized.clone())
            } else {
                let message = report
                    .message
                    .clone()
                    .unwrap_or_else(|| "vendor reported failure".to_string());
                JobUpdate::failed(FailureReason::VendorReportedFailure, message)
                    .with_result(normalized.clone())
            };

            match store.transition(job_id, Expected::of(&job), update).await? {
                TransitionOutcome::Committed(job) => {
                    info!(job_id = %job_id, status = %job.status, "callback applied");
                    return Ok(CallbackOutcome::Ack {
                        job_id,
                        status: job.status,
                    });
                }
                TransitionOutcome::Conflict(current) => {
                    info!(job_id = %job_id, status = %current.status, attempt, "callback lost a race, reloading");
                }
            }
        }

        Err(OrchestratorError::Contention(job_id))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::jobs::store::JobStore;
    use crate::jobs::testing::Harness;
    use crate::vendor::VendorOutcome;
    use serde_json::json;

    fn vendor_a() -> VendorId {
        VendorId::new("vendorA")
    }

    async fn awaiting(h: &Harness, token: &str) -> JobId {
        h.client.push(VendorOutcome::Accepted {
            response_id: token.to_string(),
        });
        let job_id = h.orchestrator.create_job(json!({"field1": "x"})).await.unwrap();
        h.orchestrator.dispatch(job_id).await.unwrap();
        job_id
    }

    #[tokio::test]
    async fn unknown_token_is_rejected() {
        let h = Harness::new("vendorA");
        let correlator = WebhookCorrelator::new(h.orchestrator.clone());

        let outcome = correlator
            .on_callback(&vendor_a(), "nope", &json!({"result": {}}))
            .await
            .unwrap();
        assert_eq!(
            outcome,
            CallbackOutcome::Rejected(RejectReason::UnknownCorrelation)
        );
    }

    #[tokio::test]
    async fn token_is_scoped_to_its_vendor() {
        let h = Harness::new("vendorA");
        awaiting(&h, "tok-1").await;
        let correlator = WebhookCorrelator::new(h.orchestrator.clone());

        let outcome = correlator
            .on_callback(&VendorId::new("sync"), "tok-1", &json!({}))
            .await
            .unwrap();
        assert_eq!(
            outcome,
            CallbackOutcome::Rejected(RejectReason::UnknownCorrelation)
        );
    }

    #[tokio::test]
    async fn duplicate_callback_is_idempotent() {
        let h = Harness::new("vendorA");
        let job_id = awaiting(&h, "tok-1").await;
        let correlator = WebhookCorrelator::new(h.orchestrator.clone());

        let first = correlator
            .on_callback(&vendor_a(), "tok-1", &json!({"result": {"field1": "X"}}))
            .await
            .unwrap();
        assert!(matches!(first, CallbackOutcome::Ack { .. }));
        let after_first = h.job(job_id).await;

        let second = correlator
            .on_callback(&vendor_a(), "tok-1", &json!({"result": {"field1": "Y"}}))
            .await
            .unwrap();
        assert_eq!(
            second,
            CallbackOutcome::Rejected(RejectReason::AlreadyFinalized(job_id))
        );

        let after_second = h.job(job_id).await;
        assert_eq!(after_second.result, Some(json!({"field1": "X"})));
        assert_eq!(after_second.version, after_first.version);
    }

    #[tokio::test]
    async fn vendor_reported_failure_fails_the_job() {
        let h = Harness::new("vendorA");
        let job_id = awaiting(&h, "tok-1").await;
        let correlator = WebhookCorrelator::new(h.orchestrator.clone());

        let outcome = correlator
            .on_callback(
                &vendor_a(),
                "tok-1",
                &json!({"status": "FAILED", "error": "upstream quota", "result": {"email": "a@b.com"}}),
            )
            .await
            .unwrap();
        assert_eq!(
            outcome,
            CallbackOutcome::Ack {
                job_id,
                status: JobStatus::Failed
            }
        );

        let job = h.job(job_id).await;
        assert_eq!(job.failure, Some(FailureReason::VendorReportedFailure));
        assert_eq!(job.error.as_deref(), Some("upstream quota"));
        assert_eq!(job.result, Some(json!({"email": "<REDACTED>"})));
    }

    #[tokio::test]
    async fn payload_without_result_section_is_used_whole() {
        let h = Harness::new("vendorA");
        let job_id = awaiting(&h, "tok-1").await;
        let correlator = WebhookCorrelator::new(h.orchestrator.clone());

        correlator
            .on_callback(
                &vendor_a(),
                "tok-1",
                &json!({"status": "success", "phone": "+1 555 010 9999", "note": " ok "}),
            )
            .await
            .unwrap();

        assert_eq!(
            h.job(job_id).await.result,
            Some(json!({"status": "success", "phone": "<REDACTED>", "note": "ok"}))
        );
    }

    #[tokio::test]
    async fn callback_racing_the_acknowledgement_waits_for_it() {
        let h = Harness::new("vendorA");
        let job_id = h.orchestrator.create_job(json!({})).await.unwrap();
        let job = h.job(job_id).await;
        let dispatched = h
            .store
            .transition(
                job_id,
                Expected::of(&job),
                JobUpdate::to(JobStatus::Dispatched).with_vendor(vendor_a()),
            )
            .await
            .unwrap()
            .into_job();
        h.store.bind_correlation(&vendor_a(), "tok-1", job_id).await.unwrap();

        let correlator = WebhookCorrelator::new(h.orchestrator.clone());
        let callback = tokio::spawn(async move {
            correlator
                .on_callback(&vendor_a(), "tok-1", &json!({"result": {"field1": "X"}}))
                .await
        });

        tokio::time::sleep(Duration::from_millis(5)).await;
        h.store
            .transition(
                job_id,
                Expected::of(&dispatched),
                JobUpdate::to(JobStatus::AwaitingCallback).with_correlation("tok-1"),
            )
            .await
            .unwrap();

        let outcome = callback.await.unwrap().unwrap();
        assert!(matches!(outcome, CallbackOutcome::Ack { .. }));
        assert_eq!(
            h.job(job_id).await.status_path(),
            vec![
                JobStatus::Pending,
                JobStatus::Dispatched,
                JobStatus::AwaitingCallback,
                JobStatus::Complete
            ]
        );
    }

    #[tokio::test]
    async fn callback_for_dispatched_job_is_finalized_eventually() {
        let h = Harness::new("vendorA");
        let job_id = h.orchestrator.create_job(json!({})).await.unwrap();
        let job = h.job(job_id).await;
        h.store
            .transition(
                job_id,
                Expected::of(&job),
                JobUpdate::to(JobStatus::Dispatched).with_vendor(vendor_a()),
            )
            .await
            .unwrap();
        h.store.bind_correlation(&vendor_a(), "tok-1", job_id).await.unwrap();

        let correlator = WebhookCorrelator::new(h.orchestrator.clone());
        let outcome = correlator
            .on_callback(&vendor_a(), "tok-1", &json!({"result": {"field1": "X"}}))
            .await
            .unwrap();

        assert_eq!(
            outcome,
            CallbackOutcome::Ack {
                job_id,
                status: JobStatus::Complete
            }
        );
    }
}
