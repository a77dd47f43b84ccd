//! Job persistence with compare-and-set transitions.

use std::collections::HashMap;
use std::sync::{Arc, RwLock};

use async_trait::async_trait;
use serde::Serialize;

use vendorgate_core::{Clock, Job, JobId, JobStatus, JobUpdate, SystemClock, VendorId};

/// State a caller believes the job is in when requesting a transition.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Expected {
    pub status: JobStatus,
    pub version: u64,
}

impl Expected {
    pub fn new(status: JobStatus, version: u64) -> Self {
        Self { status, version }
    }

    /// Expect exactly the state of a freshly loaded working copy.
    pub fn of(job: &Job) -> Self {
        Self::new(job.status, job.version)
    }
}

/// Result of a conditional transition.
#[derive(Debug, Clone, PartialEq)]
pub enum TransitionOutcome {
    /// The update was applied; carries the stored job.
    Committed(Job),
    /// The stored job no longer matched the expectation (or is terminal);
    /// carries the current stored job, unchanged.
    Conflict(Job),
}

impl TransitionOutcome {
    pub fn is_committed(&self) -> bool {
        matches!(self, Self::Committed(_))
    }

    pub fn job(&self) -> &Job {
        match self {
            Self::Committed(job) | Self::Conflict(job) => job,
        }
    }

    pub fn into_job(self) -> Job {
        match self {
            Self::Committed(job) | Self::Conflict(job) => job,
        }
    }
}

/// Job store error.
#[derive(Debug, Clone, thiserror::Error)]
pub enum JobStoreError {
    #[error("job not found: {0}")]
    NotFound(JobId),
    #[error("job already exists: {0}")]
    AlreadyExists(JobId),
    #[error("invalid transition for job {job_id}: {reason}")]
    InvalidTransition { job_id: JobId, reason: String },
    #[error("job {job_id} is bound to vendor '{current}', refusing '{requested}'")]
    VendorReassigned {
        job_id: JobId,
        current: VendorId,
        requested: VendorId,
    },
    #[error("token '{token}' from vendor '{vendor}' is already bound to job {bound_to}")]
    CorrelationConflict {
        vendor: VendorId,
        token: String,
        bound_to: JobId,
    },
    #[error("storage error: {0}")]
    Storage(String),
}

/// Job counts per status.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct JobStats {
    pub pending: usize,
    pub dispatched: usize,
    pub awaiting_callback: usize,
    pub complete: usize,
    pub failed: usize,
}

impl JobStats {
    pub fn record(&mut self, status: JobStatus) {
        match status {
            JobStatus::Pending => self.pending += 1,
            JobStatus::Dispatched => self.dispatched += 1,
            JobStatus::AwaitingCallback => self.awaiting_callback += 1,
            JobStatus::Complete => self.complete += 1,
            JobStatus::Failed => self.failed += 1,
        }
    }

    pub fn total(&self) -> usize {
        self.pending + self.dispatched + self.awaiting_callback + self.complete + self.failed
    }
}

/// Exclusive owner of job records and the token correlation table.
///
/// `transition` is the only mutation path for an existing job; it is atomic
/// with respect to every other call on the same store.
#[async_trait]
pub trait JobStore: Send + Sync {
    async fn create(&self, job: Job) -> Result<JobId, JobStoreError>;

    async fn get(&self, job_id: JobId) -> Result<Option<Job>, JobStoreError>;

    /// Apply `update` only if the stored job still matches `expected`.
    ///
    /// Terminal jobs always yield [`TransitionOutcome::Conflict`], so at most
    /// one terminal transition is ever committed per job.
    async fn transition(
        &self,
        job_id: JobId,
        expected: Expected,
        update: JobUpdate,
    ) -> Result<TransitionOutcome, JobStoreError>;

    /// Record that `token` issued by `vendor` belongs to `job_id`.
    ///
    /// Rebinding the same pair to the same job is a no-op.
    async fn bind_correlation(
        &self,
        vendor: &VendorId,
        token: &str,
        job_id: JobId,
    ) -> Result<(), JobStoreError>;

    async fn find_by_correlation(
        &self,
        vendor: &VendorId,
        token: &str,
    ) -> Result<Option<JobId>, JobStoreError>;

    async fn stats(&self) -> Result<JobStats, JobStoreError>;
}

#[async_trait]
impl<S> JobStore for Arc<S>
where
    S: JobStore + ?Sized,
{
    async fn create(&self, job: Job) -> Result<JobId, JobStoreError> {
        (**self).create(job).await
    }

    async fn get(&self, job_id: JobId) -> Result<Option<Job>, JobStoreError> {
        (**self).get(job_id).await
    }

    async fn transition(
        &self,
        job_id: JobId,
        expected: Expected,
        update: JobUpdate,
    ) -> Result<TransitionOutcome, JobStoreError> {
        (**self).transition(job_id, expected, update).await
    }

    async fn bind_correlation(
        &self,
        vendor: &VendorId,
        token: &str,
        job_id: JobId,
    ) -> Result<(), JobStoreError> {
        (**self).bind_correlation(vendor, token, job_id).await
    }

    async fn find_by_correlation(
        &self,
        vendor: &VendorId,
        token: &str,
    ) -> Result<Option<JobId>, JobStoreError> {
        (**self).find_by_correlation(vendor, token).await
    }

    async fn stats(&self) -> Result<JobStats, JobStoreError> {
        (**self).stats().await
    }
}

/// Validate `update` against the stored `job`, mapping domain refusals onto
/// store errors. Shared by every store implementation.
pub(crate) fn check_update(job: &Job, update: &JobUpdate) -> Result<(), JobStoreError> {
    if let (Some(current), Some(requested)) = (&job.vendor, &update.vendor) {
        if current != requested {
            return Err(JobStoreError::VendorReassigned {
                job_id: job.id,
                current: current.clone(),
                requested: requested.clone(),
            });
        }
    }

    job.validate_update(update)
        .map_err(|e| JobStoreError::InvalidTransition {
            job_id: job.id,
            reason: e.to_string(),
        })
}

/// Whether a stored job may accept a transition expected from `expected`.
pub(crate) fn matches_expected(job: &Job, expected: &Expected) -> bool {
    !job.is_terminal() && job.status == expected.status && job.version == expected.version
}

fn poisoned<T>(_: T) -> JobStoreError {
    JobStoreError::Storage("job store lock poisoned".to_string())
}

/// In-memory job store for tests/dev.
pub struct InMemoryJobStore {
    jobs: RwLock<HashMap<JobId, Job>>,
    correlations: RwLock<HashMap<(VendorId, String), JobId>>,
    clock: Arc<dyn Clock>,
}

impl InMemoryJobStore {
    pub fn new() -> Self {
        Self::with_clock(Arc::new(SystemClock::new()))
    }

    pub fn with_clock(clock: Arc<dyn Clock>) -> Self {
        Self {
            jobs: RwLock::new(HashMap::new()),
            correlations: RwLock::new(HashMap::new()),
            clock,
        }
    }

    pub fn arc() -> Arc<Self> {
        Arc::new(Self::new())
    }
}

impl Default for InMemoryJobStore {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl JobStore for InMemoryJobStore {
    async fn create(&self, job: Job) -> Result<JobId, JobStoreError> {
        let mut jobs = self.jobs.write().map_err(poisoned)?;
        if jobs.contains_key(&job.id) {
            return Err(JobStoreError::AlreadyExists(job.id));
        }
        let id = job.id;
        jobs.insert(id, job);
        Ok(id)
    }

    async fn get(&self, job_id: JobId) -> Result<Option<Job>, JobStoreError> {
        let jobs = self.jobs.read().map_err(poisoned)?;
        Ok(jobs.get(&job_id).cloned())
    }

    async fn transition(
        &self,
        job_id: JobId,
        expected: Expected,
        update: JobUpdate,
    ) -> Result<TransitionOutcome, JobStoreError> {
        let mut jobs = self.jobs.write().map_err(poisoned)?;
        let job = jobs.get_mut(&job_id).ok_or(JobStoreError::NotFound(job_id))?;

        if !matches_expected(job, &expected) {
            return Ok(TransitionOutcome::Conflict(job.clone()));
        }

        check_update(job, &update)?;
        job.apply_update(update, self.clock.now());
        Ok(TransitionOutcome::Committed(job.clone()))
    }

    async fn bind_correlation(
        &self,
        vendor: &VendorId,
        token: &str,
        job_id: JobId,
    ) -> Result<(), JobStoreError> {
        if !self.jobs.read().map_err(poisoned)?.contains_key(&job_id) {
            return Err(JobStoreError::NotFound(job_id));
        }

        let mut correlations = self.correlations.write().map_err(poisoned)?;
        let key = (vendor.clone(), token.to_string());
        match correlations.get(&key) {
            Some(bound) if *bound == job_id => Ok(()),
            Some(bound) => Err(JobStoreError::CorrelationConflict {
                vendor: vendor.clone(),
                token: token.to_string(),
                bound_to: *bound,
            }),
            None => {
                correlations.insert(key, job_id);
                Ok(())
            }
        }
    }

    async fn find_by_correlation(
        &self,
        vendor: &VendorId,
        token: &str,
    ) -> Result<Option<JobId>, JobStoreError> {
        let correlations = self.correlations.read().map_err(poisoned)?;
        Ok(correlations
            .get(&(vendor.clone(), token.to_string()))
            .copied())
    }

    async fn stats(&self) -> Result<JobStats, JobStoreError> {
        let jobs = self.jobs.read().map_err(poisoned)?;
        let mut stats = JobStats::default();
        for job in jobs.values() {
            stats.record(job.status);
        }
        Ok(stats)
    }
}
