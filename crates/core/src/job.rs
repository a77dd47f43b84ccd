//! Job record and lifecycle.
//!
//! A job moves forward through a small state machine:
//!
//! ```text
//! pending ──► dispatched ──► complete | failed              (sync vendors)
//! pending ──► dispatched ──► awaiting_callback ──► complete | failed   (async vendors)
//! ```
//!
//! `pending → failed` is also allowed (local rate-limit exhaustion before any
//! vendor call). Self-moves on `pending`/`dispatched` only persist retry
//! bookkeeping and never change the visible lifecycle position.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;

use crate::error::{DomainError, DomainResult};
use crate::id::{JobId, VendorId};

/// Job lifecycle status.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobStatus {
    /// Created, waiting for a dispatch attempt to reach a vendor
    Pending,
    /// Admitted by the rate limiter and handed to a vendor
    Dispatched,
    /// Accepted by an async vendor; result arrives via webhook
    AwaitingCallback,
    /// Finished with a normalized result
    Complete,
    /// Finished without a result
    Failed,
}

impl JobStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(self, JobStatus::Complete | JobStatus::Failed)
    }

    /// Whether the lifecycle permits moving from `self` to `next`.
    pub fn can_transition_to(&self, next: JobStatus) -> bool {
        use JobStatus::*;
        match self {
            Pending => matches!(next, Pending | Dispatched | Failed),
            Dispatched => matches!(next, Dispatched | AwaitingCallback | Complete | Failed),
            AwaitingCallback => matches!(next, Complete | Failed),
            Complete | Failed => false,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            JobStatus::Pending => "pending",
            JobStatus::Dispatched => "dispatched",
            JobStatus::AwaitingCallback => "awaiting_callback",
            JobStatus::Complete => "complete",
            JobStatus::Failed => "failed",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "pending" => Some(JobStatus::Pending),
            "dispatched" => Some(JobStatus::Dispatched),
            "awaiting_callback" => Some(JobStatus::AwaitingCallback),
            "complete" => Some(JobStatus::Complete),
            "failed" => Some(JobStatus::Failed),
            _ => None,
        }
    }
}

impl core::fmt::Display for JobStatus {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Why a job ended in `failed`.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FailureReason {
    /// Rate limit (local or vendor-side) kept denying until the attempt ceiling
    RateLimitExhausted,
    /// Vendor timed out or was unreachable until the attempt ceiling
    VendorUnavailable,
    /// Vendor broke its response contract
    VendorProtocolError,
    /// Vendor callback reported a failed outcome
    VendorReportedFailure,
    /// Task execution gave up on the job
    RetriesExhausted,
}

impl FailureReason {
    pub fn as_str(&self) -> &'static str {
        match self {
            FailureReason::RateLimitExhausted => "rate_limit_exhausted",
            FailureReason::VendorUnavailable => "vendor_unavailable",
            FailureReason::VendorProtocolError => "vendor_protocol_error",
            FailureReason::VendorReportedFailure => "vendor_reported_failure",
            FailureReason::RetriesExhausted => "retries_exhausted",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "rate_limit_exhausted" => Some(FailureReason::RateLimitExhausted),
            "vendor_unavailable" => Some(FailureReason::VendorUnavailable),
            "vendor_protocol_error" => Some(FailureReason::VendorProtocolError),
            "vendor_reported_failure" => Some(FailureReason::VendorReportedFailure),
            "retries_exhausted" => Some(FailureReason::RetriesExhausted),
            _ => None,
        }
    }
}

impl core::fmt::Display for FailureReason {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Record of one status change.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StatusChange {
    pub from: JobStatus,
    pub to: JobStatus,
    pub at: DateTime<Utc>,
}

/// Where a job stands with respect to another dispatch attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DispatchEligibility {
    /// A dispatch attempt may run now
    Ready,
    /// A retry or dispatch lease is pending; nothing may happen before this instant
    NotBefore(DateTime<Utc>),
    /// Awaiting a callback or already terminal
    Settled,
}

/// A unit of work tracked from creation to terminal completion/failure.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Job {
    pub id: JobId,
    /// Caller-supplied input, immutable after creation
    pub payload: JsonValue,
    pub status: JobStatus,
    /// Vendor chosen on the first dispatch attempt; never reassigned
    pub vendor: Option<VendorId>,
    /// Normalized output, present only once terminal
    pub result: Option<JsonValue>,
    pub failure: Option<FailureReason>,
    pub error: Option<String>,
    pub attempt_count: u32,
    /// Earliest time the next dispatch attempt may run. Doubles as the lease
    /// on a claimed attempt, so a worker that dies mid-call is retried.
    pub next_attempt_at: Option<DateTime<Utc>>,
    /// Vendor-issued tracking token (async vendors)
    pub correlation_token: Option<String>,
    /// Optimistic concurrency counter, bumped by every stored mutation
    pub version: u64,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub history: Vec<StatusChange>,
}

impl Job {
    /// Create a new `pending` job.
    pub fn new(payload: JsonValue, now: DateTime<Utc>) -> Self {
        Self {
            id: JobId::new(),
            payload,
            status: JobStatus::Pending,
            vendor: None,
            result: None,
            failure: None,
            error: None,
            attempt_count: 0,
            next_attempt_at: None,
            correlation_token: None,
            version: 1,
            created_at: now,
            updated_at: now,
            history: Vec::new(),
        }
    }

    pub fn with_id(mut self, id: JobId) -> Self {
        self.id = id;
        self
    }

    pub fn is_terminal(&self) -> bool {
        self.status.is_terminal()
    }

    pub fn dispatch_eligibility(&self, now: DateTime<Utc>) -> DispatchEligibility {
        match self.status {
            JobStatus::AwaitingCallback | JobStatus::Complete | JobStatus::Failed => {
                DispatchEligibility::Settled
            }
            JobStatus::Pending | JobStatus::Dispatched => match self.next_attempt_at {
                Some(at) if at > now => DispatchEligibility::NotBefore(at),
                _ => DispatchEligibility::Ready,
            },
        }
    }

    /// Check that `update` is a legal move from the current state.
    pub fn validate_update(&self, update: &JobUpdate) -> DomainResult<()> {
        if !self.status.can_transition_to(update.status) {
            return Err(DomainError::invalid_transition(format!(
                "{} -> {}",
                self.status, update.status
            )));
        }

        if let (Some(current), Some(requested)) = (&self.vendor, &update.vendor) {
            if current != requested {
                return Err(DomainError::invalid_transition(format!(
                    "vendor already set to '{current}', refusing '{requested}'"
                )));
            }
        }

        if update.result.is_some() && !update.status.is_terminal() {
            return Err(DomainError::invalid_transition(
                "result may only be recorded with a terminal status",
            ));
        }

        if update.status == JobStatus::Failed && update.failure.is_none() {
            return Err(DomainError::invalid_transition(
                "failed transition requires a failure reason",
            ));
        }

        Ok(())
    }

    /// Apply an already-validated update.
    pub fn apply_update(&mut self, update: JobUpdate, now: DateTime<Utc>) {
        if update.status != self.status {
            self.history.push(StatusChange {
                from: self.status,
                to: update.status,
                at: now,
            });
        }

        self.status = update.status;
        if let Some(vendor) = update.vendor {
            self.vendor = Some(vendor);
        }
        if let Some(attempts) = update.attempt_count {
            self.attempt_count = attempts;
        }
        if let Some(token) = update.correlation_token {
            self.correlation_token = Some(token);
        }
        if let Some(result) = update.result {
            self.result = Some(result);
        }
        if let Some((reason, message)) = update.failure {
            self.failure = Some(reason);
            self.error = Some(message);
        }
        self.next_attempt_at = update.next_attempt_at;
        self.version += 1;
        self.updated_at = now;
    }

    /// Sequence of statuses visited, starting at `pending`.
    pub fn status_path(&self) -> Vec<JobStatus> {
        let mut path = vec![JobStatus::Pending];
        path.extend(self.history.iter().map(|c| c.to));
        path
    }
}

/// A requested state change, applied atomically by the job store.
///
/// `next_attempt_at` is always overwritten: an update that does not schedule a
/// retry clears any previously scheduled one.
#[derive(Debug, Clone, PartialEq)]
pub struct JobUpdate {
    pub status: JobStatus,
    pub vendor: Option<VendorId>,
    pub attempt_count: Option<u32>,
    pub next_attempt_at: Option<DateTime<Utc>>,
    pub correlation_token: Option<String>,
    pub result: Option<JsonValue>,
    pub failure: Option<(FailureReason, String)>,
}

impl JobUpdate {
    pub fn to(status: JobStatus) -> Self {
        Self {
            status,
            vendor: None,
            attempt_count: None,
            next_attempt_at: None,
            correlation_token: None,
            result: None,
            failure: None,
        }
    }

    pub fn complete(result: JsonValue) -> Self {
        Self::to(JobStatus::Complete).with_result(result)
    }

    pub fn failed(reason: FailureReason, message: impl Into<String>) -> Self {
        let mut update = Self::to(JobStatus::Failed);
        update.failure = Some((reason, message.into()));
        update
    }

    pub fn with_vendor(mut self, vendor: VendorId) -> Self {
        self.vendor = Some(vendor);
        self
    }

    pub fn with_attempts(mut self, attempts: u32) -> Self {
        self.attempt_count = Some(attempts);
        self
    }

    pub fn retry_at(mut self, at: DateTime<Utc>) -> Self {
        self.next_attempt_at = Some(at);
        self
    }

    pub fn with_correlation(mut self, token: impl Into<String>) -> Self {
        self.correlation_token = Some(token.into());
        self
    }

    pub fn with_result(mut self, result: JsonValue) -> Self {
        self.result = Some(result);
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;

    fn job() -> Job {
        Job::new(serde_json::json!({"field1": "x"}), Utc::now())
    }

    #[test]
    fn terminal_states_accept_nothing() {
        for status in [JobStatus::Complete, JobStatus::Failed] {
            for next in [
                JobStatus::Pending,
                JobStatus::Dispatched,
                JobStatus::AwaitingCallback,
                JobStatus::Complete,
                JobStatus::Failed,
            ] {
                assert!(!status.can_transition_to(next), "{status} -> {next}");
            }
        }
    }

    #[test]
    fn status_never_regresses() {
        assert!(!JobStatus::Dispatched.can_transition_to(JobStatus::Pending));
        assert!(!JobStatus::AwaitingCallback.can_transition_to(JobStatus::Dispatched));
        assert!(!JobStatus::AwaitingCallback.can_transition_to(JobStatus::Pending));
        assert!(!JobStatus::Pending.can_transition_to(JobStatus::AwaitingCallback));
        assert!(!JobStatus::Pending.can_transition_to(JobStatus::Complete));
    }

    #[test]
    fn status_string_round_trip() {
        for status in [
            JobStatus::Pending,
            JobStatus::Dispatched,
            JobStatus::AwaitingCallback,
            JobStatus::Complete,
            JobStatus::Failed,
        ] {
            assert_eq!(JobStatus::parse(status.as_str()), Some(status));
            let json = serde_json::to_value(status).unwrap();
            assert_eq!(json, serde_json::json!(status.as_str()));
        }
    }

    #[test]
    fn apply_update_records_history_and_bumps_version() {
        let mut job = job();
        let now = Utc::now();

        let update = JobUpdate::to(JobStatus::Dispatched)
            .with_vendor(VendorId::new("sync"))
            .with_attempts(1);
        job.validate_update(&update).unwrap();
        job.apply_update(update, now);

        assert_eq!(job.status, JobStatus::Dispatched);
        assert_eq!(job.vendor, Some(VendorId::new("sync")));
        assert_eq!(job.attempt_count, 1);
        assert_eq!(job.version, 2);
        assert_eq!(job.updated_at, now);
        assert_eq!(job.status_path(), vec![JobStatus::Pending, JobStatus::Dispatched]);
    }

    #[test]
    fn self_move_keeps_history_clean() {
        let mut job = job();
        let retry = Utc::now() + Duration::seconds(5);
        job.apply_update(JobUpdate::to(JobStatus::Pending).with_attempts(1).retry_at(retry), Utc::now());

        assert!(job.history.is_empty());
        assert_eq!(job.next_attempt_at, Some(retry));
        assert_eq!(job.version, 2);
    }

    #[test]
    fn vendor_cannot_be_reassigned() {
        let mut job = job();
        job.apply_update(
            JobUpdate::to(JobStatus::Dispatched).with_vendor(VendorId::new("sync")),
            Utc::now(),
        );

        let update = JobUpdate::to(JobStatus::Dispatched).with_vendor(VendorId::new("async"));
        assert!(matches!(
            job.validate_update(&update),
            Err(DomainError::InvalidTransition(_))
        ));
    }

    #[test]
    fn result_requires_terminal_status() {
        let job = job();
        let update = JobUpdate::to(JobStatus::Dispatched).with_result(serde_json::json!({}));
        assert!(job.validate_update(&update).is_err());
    }

    #[test]
    fn failed_requires_reason() {
        let job = job();
        assert!(job.validate_update(&JobUpdate::to(JobStatus::Failed)).is_err());
        assert!(job
            .validate_update(&JobUpdate::failed(FailureReason::RateLimitExhausted, "denied"))
            .is_ok());
    }

    #[test]
    fn dispatch_eligibility_follows_status_and_schedule() {
        let now = Utc::now();
        let mut job = job();
        assert_eq!(job.dispatch_eligibility(now), DispatchEligibility::Ready);

        let later = now + Duration::seconds(30);
        job.next_attempt_at = Some(later);
        assert_eq!(job.dispatch_eligibility(now), DispatchEligibility::NotBefore(later));
        assert_eq!(job.dispatch_eligibility(later), DispatchEligibility::Ready);

        // A claimed attempt holds its lease until it expires.
        job.status = JobStatus::Dispatched;
        assert_eq!(job.dispatch_eligibility(now), DispatchEligibility::NotBefore(later));
        assert_eq!(job.dispatch_eligibility(later), DispatchEligibility::Ready);
        job.next_attempt_at = None;
        assert_eq!(job.dispatch_eligibility(now), DispatchEligibility::Ready);

        job.status = JobStatus::AwaitingCallback;
        assert_eq!(job.dispatch_eligibility(now), DispatchEligibility::Settled);
    }
}
