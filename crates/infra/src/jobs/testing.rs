//! Test doubles for orchestration tests.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use serde_json::{Value as JsonValue, json};

use vendorgate_core::{Job, JobId, JobStatus, JobUpdate, ManualClock, VendorConfig, VendorId};

use crate::rate_limit::{Admission, RateLimitError, RateLimiter};
use crate::vendor::{FixedSelector, VendorClient, VendorOutcome, VendorRegistry};

use super::backoff::BackoffPolicy;
use super::executor::{DispatchScheduler, ScheduleError};
use super::orchestrator::JobOrchestrator;
use super::store::{Expected, InMemoryJobStore, JobStats, JobStore, JobStoreError, TransitionOutcome};

/// Returns queued outcomes in order, then `{}` results.
#[derive(Default)]
pub struct ScriptedClient {
    script: Mutex<VecDeque<VendorOutcome>>,
    calls: Mutex<Vec<(VendorId, JobId)>>,
}

impl ScriptedClient {
    pub fn push(&self, outcome: VendorOutcome) {
        self.script.lock().unwrap().push_back(outcome);
    }

    pub fn calls(&self) -> Vec<(VendorId, JobId)> {
        self.calls.lock().unwrap().clone()
    }
}

#[async_trait]
impl VendorClient for ScriptedClient {
    async fn invoke(&self, vendor: &VendorConfig, job_id: &JobId, _payload: &JsonValue) -> VendorOutcome {
        self.calls.lock().unwrap().push((vendor.id.clone(), *job_id));
        self.script
            .lock()
            .unwrap()
            .pop_front()
            .unwrap_or_else(|| VendorOutcome::SyncResult(json!({})))
    }
}

/// Returns queued admissions in order, then admits everything.
#[derive(Default)]
pub struct ScriptedLimiter {
    script: Mutex<VecDeque<Admission>>,
    calls: AtomicU32,
}

impl ScriptedLimiter {
    pub fn deny(&self, times: usize, retry_after: Duration) {
        let mut script = self.script.lock().unwrap();
        for _ in 0..times {
            script.push_back(Admission::Denied { retry_after });
        }
    }

    pub fn calls(&self) -> u32 {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl RateLimiter for ScriptedLimiter {
    async fn try_acquire(&self, _vendor: &VendorId) -> Result<Admission, RateLimitError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        Ok(self
            .script
            .lock()
            .unwrap()
            .pop_front()
            .unwrap_or(Admission::Allowed { remaining: 1 }))
    }
}

/// Records scheduled work instead of running it.
#[derive(Default)]
pub struct RecordingScheduler {
    scheduled: Mutex<Vec<(JobId, Duration)>>,
}

impl RecordingScheduler {
    pub fn scheduled(&self) -> Vec<(JobId, Duration)> {
        self.scheduled.lock().unwrap().clone()
    }
}

impl DispatchScheduler for RecordingScheduler {
    fn schedule(&self, job_id: JobId, delay: Duration) -> Result<(), ScheduleError> {
        self.scheduled.lock().unwrap().push((job_id, delay));
        Ok(())
    }
}

/// Store whose `get` fails a fixed number of times before delegating.
pub struct FlakyStore {
    inner: InMemoryJobStore,
    failures_left: AtomicU32,
}

impl FlakyStore {
    pub fn new(failures: u32) -> Self {
        Self {
            inner: InMemoryJobStore::new(),
            failures_left: AtomicU32::new(failures),
        }
    }
}

#[async_trait]
impl JobStore for FlakyStore {
    async fn create(&self, job: Job) -> Result<JobId, JobStoreError> {
        self.inner.create(job).await
    }

    async fn get(&self, job_id: JobId) -> Result<Option<Job>, JobStoreError> {
        let left = self.failures_left.load(Ordering::SeqCst);
        if left > 0 {
            self.failures_left.store(left - 1, Ordering::SeqCst);
            return Err(JobStoreError::Storage("connection reset".to_string()));
        }
        self.inner.get(job_id).await
    }

    async fn transition(
        &self,
        job_id: JobId,
        expected: Expected,
        update: JobUpdate,
    ) -> Result<TransitionOutcome, JobStoreError> {
        self.inner.transition(job_id, expected, update).await
    }

    async fn bind_correlation(
        &self,
        vendor: &VendorId,
        token: &str,
        job_id: JobId,
    ) -> Result<(), JobStoreError> {
        self.inner.bind_correlation(vendor, token, job_id).await
    }

    async fn find_by_correlation(
        &self,
        vendor: &VendorId,
        token: &str,
    ) -> Result<Option<JobId>, JobStoreError> {
        self.inner.find_by_correlation(vendor, token).await
    }

    async fn stats(&self) -> Result<JobStats, JobStoreError> {
        self.inner.stats().await
    }
}

/// Delegates to a shared in-memory store, but the first `failures`
/// transitions into `status` fail before reaching it.
pub struct FailingTransitionStore {
    inner: Arc<InMemoryJobStore>,
    status: JobStatus,
    failures_left: AtomicU32,
}

impl FailingTransitionStore {
    pub fn new(inner: Arc<InMemoryJobStore>, status: JobStatus, failures: u32) -> Self {
        Self {
            inner,
            status,
            failures_left: AtomicU32::new(failures),
        }
    }
}

#[async_trait]
impl JobStore for FailingTransitionStore {
    async fn create(&self, job: Job) -> Result<JobId, JobStoreError> {
        self.inner.create(job).await
    }

    async fn get(&self, job_id: JobId) -> Result<Option<Job>, JobStoreError> {
        self.inner.get(job_id).await
    }

    async fn transition(
        &self,
        job_id: JobId,
        expected: Expected,
        update: JobUpdate,
    ) -> Result<TransitionOutcome, JobStoreError> {
        if update.status == self.status {
            let left = self.failures_left.load(Ordering::SeqCst);
            if left > 0 {
                self.failures_left.store(left - 1, Ordering::SeqCst);
                return Err(JobStoreError::Storage("connection reset".to_string()));
            }
        }
        self.inner.transition(job_id, expected, update).await
    }

    async fn bind_correlation(
        &self,
        vendor: &VendorId,
        token: &str,
        job_id: JobId,
    ) -> Result<(), JobStoreError> {
        self.inner.bind_correlation(vendor, token, job_id).await
    }

    async fn find_by_correlation(
        &self,
        vendor: &VendorId,
        token: &str,
    ) -> Result<Option<JobId>, JobStoreError> {
        self.inner.find_by_correlation(vendor, token).await
    }

    async fn stats(&self) -> Result<JobStats, JobStoreError> {
        self.inner.stats().await
    }
}

/// Holds every `get` until `parties` readers have loaded their snapshot, so
/// racing dispatches all start from the same version.
pub struct SnapshotGateStore {
    inner: Arc<InMemoryJobStore>,
    gate: tokio::sync::Barrier,
}

impl SnapshotGateStore {
    pub fn new(inner: Arc<InMemoryJobStore>, parties: usize) -> Self {
        Self {
            inner,
            gate: tokio::sync::Barrier::new(parties),
        }
    }
}

#[async_trait]
impl JobStore for SnapshotGateStore {
    async fn create(&self, job: Job) -> Result<JobId, JobStoreError> {
        self.inner.create(job).await
    }

    async fn get(&self, job_id: JobId) -> Result<Option<Job>, JobStoreError> {
        let snapshot = self.inner.get(job_id).await;
        self.gate.wait().await;
        snapshot
    }

    async fn transition(
        &self,
        job_id: JobId,
        expected: Expected,
        update: JobUpdate,
    ) -> Result<TransitionOutcome, JobStoreError> {
        self.inner.transition(job_id, expected, update).await
    }

    async fn bind_correlation(
        &self,
        vendor: &VendorId,
        token: &str,
        job_id: JobId,
    ) -> Result<(), JobStoreError> {
        self.inner.bind_correlation(vendor, token, job_id).await
    }

    async fn find_by_correlation(
        &self,
        vendor: &VendorId,
        token: &str,
    ) -> Result<Option<JobId>, JobStoreError> {
        self.inner.find_by_correlation(vendor, token).await
    }

    async fn stats(&self) -> Result<JobStats, JobStoreError> {
        self.inner.stats().await
    }
}

pub fn registry() -> VendorRegistry {
    VendorRegistry::from_configs([
        VendorConfig::sync("sync", "http://localhost:8001", 30),
        VendorConfig::asynchronous("vendorA", "http://localhost:8002", 20),
    ])
    .unwrap()
}

/// Orchestrator wired to in-memory/scripted collaborators and a manual clock.
pub struct Harness {
    pub store: Arc<InMemoryJobStore>,
    pub clock: ManualClock,
    pub client: Arc<ScriptedClient>,
    pub limiter: Arc<ScriptedLimiter>,
    pub scheduler: Arc<RecordingScheduler>,
    pub orchestrator: Arc<JobOrchestrator>,
}

impl Harness {
    /// All jobs are routed to `vendor`.
    pub fn new(vendor: &str) -> Self {
        Self::with_backoff(vendor, BackoffPolicy::default())
    }

    pub fn with_backoff(vendor: &str, backoff: BackoffPolicy) -> Self {
        let clock = ManualClock::starting_now();
        let store = Arc::new(InMemoryJobStore::with_clock(Arc::new(clock.clone())));
        let client = Arc::new(ScriptedClient::default());
        let limiter = Arc::new(ScriptedLimiter::default());
        let scheduler = Arc::new(RecordingScheduler::default());

        let orchestrator = wire(
            store.clone(),
            vendor,
            backoff,
            &clock,
            &client,
            &limiter,
            &scheduler,
        );

        Self {
            store,
            clock,
            client,
            limiter,
            scheduler,
            orchestrator: Arc::new(orchestrator),
        }
    }

    /// A second orchestrator sharing this harness' doubles and clock, writing
    /// through `store`.
    pub fn orchestrator_over(&self, store: Arc<dyn JobStore>, vendor: &str) -> JobOrchestrator {
        wire(
            store,
            vendor,
            self.orchestrator.backoff().clone(),
            &self.clock,
            &self.client,
            &self.limiter,
            &self.scheduler,
        )
    }

    pub async fn job(&self, job_id: JobId) -> Job {
        self.store.get(job_id).await.unwrap().unwrap()
    }
}

fn wire(
    store: Arc<dyn JobStore>,
    vendor: &str,
    backoff: BackoffPolicy,
    clock: &ManualClock,
    client: &Arc<ScriptedClient>,
    limiter: &Arc<ScriptedLimiter>,
    scheduler: &Arc<RecordingScheduler>,
) -> JobOrchestrator {
    JobOrchestrator::builder(store, Arc::new(registry()), scheduler.clone())
        .limiter(limiter.clone())
        .client(client.clone())
        .selector(Arc::new(FixedSelector::new(vendor)))
        .backoff(backoff)
        .clock(Arc::new(clock.clone()))
        .build()
}
