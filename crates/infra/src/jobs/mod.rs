//! Job lifecycle: storage, dispatch orchestration, callback correlation and
//! the in-process dispatch executor.
//!
//! ## Components
//!
//! - `JobStore`: exclusive owner of job records and token correlations
//! - `JobOrchestrator`: creation, dispatch and retry bookkeeping
//! - `WebhookCorrelator`: maps vendor callbacks back onto jobs
//! - `DispatchExecutor`: runs queued dispatch work with at-least-once retries

pub mod backoff;
pub mod correlator;
pub mod executor;
pub mod orchestrator;
#[cfg(feature = "postgres")]
pub mod postgres;
pub mod store;

#[cfg(test)]
pub(crate) mod testing;

pub use backoff::{BackoffPolicy, BackoffStrategy};
pub use correlator::{CallbackOutcome, RejectReason, WebhookCorrelator};
pub use executor::{
    DispatchExecutor, DispatchExecutorConfig, DispatchExecutorHandle, DispatchQueue,
    DispatchReceiver, DispatchScheduler, ExecutorStats, ScheduleError,
};
pub use orchestrator::{
    CLAIM_MARGIN, DispatchReport, JobOrchestrator, JobOrchestratorBuilder, JobView, OrchestratorError,
    SkipReason,
};
#[cfg(feature = "postgres")]
pub use postgres::PostgresJobStore;
pub use store::{Expected, InMemoryJobStore, JobStats, JobStore, JobStoreError, TransitionOutcome};
