//! Job lifecycle: creation, vendor dispatch and retry bookkeeping.
//!
//! The orchestrator keeps no authoritative job state. Every operation loads a
//! working copy from the [`JobStore`] and writes back through a conditional
//! transition, so duplicate dispatches and racing callbacks resolve to exactly
//! one winner. Retries are persisted as `attempt_count` + `next_attempt_at`
//! and handed back to the [`DispatchScheduler`]; nothing sleeps in-process.
//!
//! A dispatch claims its attempt with a lease in `next_attempt_at` before
//! taking a rate-limit slot. Until the lease runs out redeliveries are
//! rescheduled; after it, a claim whose worker never recorded an outcome is
//! retried as the next attempt.

use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::Serialize;
use serde_json::Value as JsonValue;
use tracing::{debug, info, instrument, warn};

use vendorgate_core::{
    Clock, DispatchEligibility, FailureReason, Job, JobId, JobStatus, JobUpdate, SystemClock,
    VendorConfig, VendorId,
};

use crate::rate_limit::{Admission, RateLimitError, RateLimiter, SlidingWindowRateLimiter};
use crate::transform::ResultTransformer;
use crate::vendor::{
    HttpVendorClient, UniformRandomSelector, VendorClient, VendorErrorKind, VendorOutcome,
    VendorRegistry, VendorSelector,
};

use super::backoff::BackoffPolicy;
use super::executor::{DispatchScheduler, ScheduleError};
use super::store::{Expected, JobStats, JobStore, JobStoreError, TransitionOutcome};

/// Slack added to a vendor's timeout when leasing a claimed attempt.
pub const CLAIM_MARGIN: Duration = Duration::from_secs(5);

#[derive(Debug, thiserror::Error)]
pub enum OrchestratorError {
    #[error("job not found: {0}")]
    JobNotFound(JobId),

    #[error(transparent)]
    Store(#[from] JobStoreError),

    #[error(transparent)]
    RateLimit(#[from] RateLimitError),

    #[error(transparent)]
    Schedule(#[from] ScheduleError),

    #[error("job {0} kept changing underneath the callback")]
    Contention(JobId),
}

/// Why a dispatch did nothing.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SkipReason {
    /// Awaiting a callback or already terminal
    Settled,
    /// A concurrent writer changed the job first
    LostRace,
}

/// What one dispatch run did.
#[derive(Debug, Clone, PartialEq)]
pub enum DispatchReport {
    Completed,
    AwaitingCallback { response_id: String },
    Rescheduled { delay: Duration },
    Failed(FailureReason),
    Skipped(SkipReason),
}

/// Read model served by the status API.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct JobView {
    pub request_id: JobId,
    pub status: JobStatus,
    pub vendor: Option<VendorId>,
    pub attempt_count: u32,
    /// Present only once terminal
    pub result: Option<JsonValue>,
    pub failure: Option<FailureReason>,
    pub error: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl From<Job> for JobView {
    fn from(job: Job) -> Self {
        let terminal = job.is_terminal();
        Self {
            request_id: job.id,
            status: job.status,
            vendor: job.vendor,
            attempt_count: job.attempt_count,
            result: if terminal { job.result } else { None },
            failure: job.failure,
            error: job.error,
            created_at: job.created_at,
            updated_at: job.updated_at,
        }
    }
}

pub struct JobOrchestrator {
    store: Arc<dyn JobStore>,
    limiter: Arc<dyn RateLimiter>,
    client: Arc<dyn VendorClient>,
    selector: Arc<dyn VendorSelector>,
    registry: Arc<VendorRegistry>,
    transformer: ResultTransformer,
    backoff: BackoffPolicy,
    clock: Arc<dyn Clock>,
    scheduler: Arc<dyn DispatchScheduler>,
}

/// Wires a [`JobOrchestrator`]; everything but the store, registry and
/// scheduler has a default.
pub struct JobOrchestratorBuilder {
    store: Arc<dyn JobStore>,
    registry: Arc<VendorRegistry>,
    scheduler: Arc<dyn DispatchScheduler>,
    limiter: Option<Arc<dyn RateLimiter>>,
    client: Option<Arc<dyn VendorClient>>,
    selector: Option<Arc<dyn VendorSelector>>,
    transformer: ResultTransformer,
    backoff: BackoffPolicy,
    clock: Arc<dyn Clock>,
}

impl JobOrchestratorBuilder {
    pub fn limiter(mut self, limiter: Arc<dyn RateLimiter>) -> Self {
        self.limiter = Some(limiter);
        self
    }

    pub fn client(mut self, client: Arc<dyn VendorClient>) -> Self {
        self.client = Some(client);
        self
    }

    pub fn selector(mut self, selector: Arc<dyn VendorSelector>) -> Self {
        self.selector = Some(selector);
        self
    }

    pub fn transformer(mut self, transformer: ResultTransformer) -> Self {
        self.transformer = transformer;
        self
    }

    pub fn backoff(mut self, backoff: BackoffPolicy) -> Self {
        self.backoff = backoff;
        self
    }

    pub fn clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    pub fn build(self) -> JobOrchestrator {
        let limiter = self.limiter.unwrap_or_else(|| {
            Arc::new(SlidingWindowRateLimiter::from_vendors(
                self.registry.iter(),
                crate::rate_limit::DEFAULT_WINDOW,
                self.clock.clone(),
            ))
        });

        JobOrchestrator {
            store: self.store,
            limiter,
            client: self
                .client
                .unwrap_or_else(|| Arc::new(HttpVendorClient::new())),
            selector: self
                .selector
                .unwrap_or_else(|| Arc::new(UniformRandomSelector)),
            registry: self.registry,
            transformer: self.transformer,
            backoff: self.backoff,
            clock: self.clock,
            scheduler: self.scheduler,
        }
    }
}

impl JobOrchestrator {
    pub fn builder(
        store: Arc<dyn JobStore>,
        registry: Arc<VendorRegistry>,
        scheduler: Arc<dyn DispatchScheduler>,
    ) -> JobOrchestratorBuilder {
        JobOrchestratorBuilder {
            store,
            registry,
            scheduler,
            limiter: None,
            client: None,
            selector: None,
            transformer: ResultTransformer::default(),
            backoff: BackoffPolicy::default(),
            clock: Arc::new(SystemClock::new()),
        }
    }

    pub(crate) fn store(&self) -> &Arc<dyn JobStore> {
        &self.store
    }

    pub(crate) fn transformer(&self) -> &ResultTransformer {
        &self.transformer
    }

    pub fn registry(&self) -> &VendorRegistry {
        &self.registry
    }

    pub fn backoff(&self) -> &BackoffPolicy {
        &self.backoff
    }

    /// Persist a `pending` job and hand its first dispatch to the scheduler.
    #[instrument(skip(self, payload))]
    pub async fn create_job(&self, payload: JsonValue) -> Result<JobId, OrchestratorError> {
        let job = Job::new(payload, self.clock.now());
        let job_id = self.store.create(job).await?;
        self.scheduler.schedule(job_id, Duration::ZERO)?;
        info!(job_id = %job_id, "job created");
        Ok(job_id)
    }

    pub async fn job_status(&self, job_id: JobId) -> Result<Option<JobView>, OrchestratorError> {
        Ok(self.store.get(job_id).await?.map(JobView::from))
    }

    /// Job counts per status.
    pub async fn job_stats(&self) -> Result<JobStats, OrchestratorError> {
        Ok(self.store.stats().await?)
    }

    /// Run one dispatch attempt. Safe to invoke any number of times for the
    /// same job, from any worker.
    #[instrument(skip(self), fields(job_id = %job_id))]
    pub async fn dispatch(&self, job_id: JobId) -> Result<DispatchReport, OrchestratorError> {
        let job = self
            .store
            .get(job_id)
            .await?
            .ok_or(OrchestratorError::JobNotFound(job_id))?;

        let now = self.clock.now();
        match job.dispatch_eligibility(now) {
            DispatchEligibility::Settled => {
                debug!(status = %job.status, "nothing to dispatch");
                return Ok(DispatchReport::Skipped(SkipReason::Settled));
            }
            DispatchEligibility::NotBefore(at) => {
                let delay = (at - now).to_std().unwrap_or(Duration::ZERO);
                self.scheduler.schedule(job_id, delay)?;
                debug!(delay_ms = delay.as_millis() as u64, "retry or claim lease not yet due");
                return Ok(DispatchReport::Rescheduled { delay });
            }
            DispatchEligibility::Ready => {}
        }

        let vendor = match self.resolve_vendor(&job) {
            Some(vendor) => vendor,
            None => {
                let detail = match &job.vendor {
                    Some(id) => format!("vendor '{id}' is no longer registered"),
                    None => "no vendor registered".to_string(),
                };
                return self
                    .fail(&job, None, job.attempt_count, FailureReason::VendorUnavailable, detail)
                    .await;
            }
        };

        // Claim before spending a rate-limit slot. The lease makes the job
        // Ready again if this worker never records an outcome.
        let attempt = job.attempt_count + 1;
        let lease = now + to_chrono(vendor.timeout() + CLAIM_MARGIN);
        let reserve = JobUpdate::to(job.status)
            .with_vendor(vendor.id.clone())
            .with_attempts(attempt)
            .retry_at(lease);
        let job = match self.store.transition(job_id, Expected::of(&job), reserve).await? {
            TransitionOutcome::Committed(job) => job,
            TransitionOutcome::Conflict(current) => {
                debug!(status = %current.status, "lost dispatch race");
                return Ok(DispatchReport::Skipped(SkipReason::LostRace));
            }
        };

        match self.limiter.try_acquire(&vendor.id).await? {
            Admission::Denied { retry_after } => {
                debug!(vendor = %vendor.id, attempt, "local rate limit denied dispatch");
                return self
                    .retry_or_fail(
                        &job,
                        &vendor,
                        attempt,
                        retry_after,
                        FailureReason::RateLimitExhausted,
                        "local rate limit kept denying",
                    )
                    .await;
            }
            Admission::Allowed { .. } => {}
        }

        let claim = JobUpdate::to(JobStatus::Dispatched)
            .with_vendor(vendor.id.clone())
            .with_attempts(attempt)
            .retry_at(lease);
        let job = match self.store.transition(job_id, Expected::of(&job), claim).await? {
            TransitionOutcome::Committed(job) => job,
            TransitionOutcome::Conflict(current) => {
                debug!(status = %current.status, "job changed while claimed");
                return Ok(DispatchReport::Skipped(SkipReason::LostRace));
            }
        };

        info!(vendor = %vendor.id, attempt, "dispatching to vendor");
        let outcome = self.client.invoke(&vendor, &job.id, &job.payload).await;
        self.settle(job, &vendor, outcome).await
    }

    /// Give up on a job whose dispatch keeps failing for infrastructure reasons.
    pub async fn abandon(&self, job_id: JobId, detail: &str) -> Result<(), OrchestratorError> {
        let Some(job) = self.store.get(job_id).await? else {
            return Ok(());
        };
        if job.is_terminal() || job.status == JobStatus::AwaitingCallback {
            return Ok(());
        }

        self.fail(
            &job,
            None,
            job.attempt_count,
            FailureReason::RetriesExhausted,
            format!("dispatch abandoned: {detail}"),
        )
        .await?;
        Ok(())
    }

    fn resolve_vendor(&self, job: &Job) -> Option<VendorConfig> {
        let id = match &job.vendor {
            Some(id) => id.clone(),
            None => self.selector.select(job, &self.registry)?,
        };
        self.registry.get(&id).cloned()
    }

    /// Apply a vendor call's outcome to a job we hold in `dispatched`.
    async fn settle(
        &self,
        job: Job,
        vendor: &VendorConfig,
        outcome: VendorOutcome,
    ) -> Result<DispatchReport, OrchestratorError> {
        match outcome {
            VendorOutcome::SyncResult(data) => {
                let normalized = self.transformer.transform(&data);
                match self
                    .store
                    .transition(job.id, Expected::of(&job), JobUpdate::complete(normalized))
                    .await?
                {
                    TransitionOutcome::Committed(_) => {
                        info!(vendor = %vendor.id, "job complete");
                        Ok(DispatchReport::Completed)
                    }
                    TransitionOutcome::Conflict(current) => {
                        warn!(status = %current.status, "job changed while vendor call was running");
                        Ok(DispatchReport::Skipped(SkipReason::LostRace))
                    }
                }
            }

            VendorOutcome::Accepted { response_id } => {
                // Bound first so a callback racing this commit can still find the job.
                match self
                    .store
                    .bind_correlation(&vendor.id, &response_id, job.id)
                    .await
                {
                    Ok(()) => {}
                    Err(e @ JobStoreError::CorrelationConflict { .. }) => {
                        return self
                            .fail(
                                &job,
                                Some(vendor),
                                job.attempt_count,
                                FailureReason::VendorProtocolError,
                                e.to_string(),
                            )
                            .await;
                    }
                    Err(e) => return Err(e.into()),
                }

                let update =
                    JobUpdate::to(JobStatus::AwaitingCallback).with_correlation(response_id.clone());
                match self.store.transition(job.id, Expected::of(&job), update).await? {
                    TransitionOutcome::Committed(_) => {
                        info!(vendor = %vendor.id, response_id = %response_id, "awaiting vendor callback");
                        Ok(DispatchReport::AwaitingCallback { response_id })
                    }
                    TransitionOutcome::Conflict(current) => {
                        debug!(status = %current.status, "callback settled job before acknowledgement");
                        Ok(DispatchReport::Skipped(SkipReason::Settled))
                    }
                }
            }

            VendorOutcome::Error(err) => {
                warn!(vendor = %vendor.id, kind = %err.kind, detail = %err.detail, "vendor call failed");
                if !err.kind.is_transient() {
                    return self
                        .fail(
                            &job,
                            Some(vendor),
                            job.attempt_count,
                            FailureReason::VendorProtocolError,
                            err.to_string(),
                        )
                        .await;
                }
                let exhausted = match err.kind {
                    VendorErrorKind::RateLimited => FailureReason::RateLimitExhausted,
                    _ => FailureReason::VendorUnavailable,
                };
                self.retry_or_fail(
                    &job,
                    vendor,
                    job.attempt_count,
                    Duration::ZERO,
                    exhausted,
                    &err.to_string(),
                )
                .await
            }
        }
    }

    /// Record a recoverable failure: schedule the next attempt under backoff,
    /// or fail the job once the attempt ceiling is reached.
    async fn retry_or_fail(
        &self,
        job: &Job,
        vendor: &VendorConfig,
        attempt: u32,
        wait_hint: Duration,
        exhausted: FailureReason,
        detail: &str,
    ) -> Result<DispatchReport, OrchestratorError> {
        if !self.backoff.allows_another(attempt) {
            let message = format!("{detail} (after {attempt} attempts)");
            return self.fail(job, Some(vendor), attempt, exhausted, message).await;
        }

        let delay = wait_hint + self.backoff.delay_for_attempt(attempt);
        let due = self.clock.now() + to_chrono(delay);
        let update = JobUpdate::to(job.status)
            .with_vendor(vendor.id.clone())
            .with_attempts(attempt)
            .retry_at(due);

        match self.store.transition(job.id, Expected::of(job), update).await? {
            TransitionOutcome::Committed(_) => {
                self.scheduler.schedule(job.id, delay)?;
                debug!(
                    vendor = %vendor.id,
                    attempt,
                    delay_ms = delay.as_millis() as u64,
                    "dispatch rescheduled"
                );
                Ok(DispatchReport::Rescheduled { delay })
            }
            TransitionOutcome::Conflict(_) => Ok(DispatchReport::Skipped(SkipReason::LostRace)),
        }
    }

    async fn fail(
        &self,
        job: &Job,
        vendor: Option<&VendorConfig>,
        attempt: u32,
        reason: FailureReason,
        message: impl Into<String>,
    ) -> Result<DispatchReport, OrchestratorError> {
        let message = message.into();
        let mut update = JobUpdate::failed(reason, message.clone()).with_attempts(attempt);
        if let Some(vendor) = vendor {
            update = update.with_vendor(vendor.id.clone());
        }

        match self.store.transition(job.id, Expected::of(job), update).await? {
            TransitionOutcome::Committed(_) => {
                warn!(reason = %reason, error = %message, "job failed");
                Ok(DispatchReport::Failed(reason))
            }
            TransitionOutcome::Conflict(_) => Ok(DispatchReport::Skipped(SkipReason::LostRace)),
        }
    }
}

fn to_chrono(duration: Duration) -> chrono::Duration {
    chrono::Duration::from_std(duration).unwrap_or(chrono::Duration::zero())
}
