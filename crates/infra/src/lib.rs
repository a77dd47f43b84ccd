//! Infrastructure layer: rate limiting, vendor transport, job persistence,
//! result transformation and the dispatch/correlation pipeline.

pub mod config;
pub mod jobs;
pub mod rate_limit;
pub mod transform;
pub mod vendor;

pub use config::{AppConfig, ConfigError, DispatchSettings};
pub use jobs::{
    BackoffPolicy, CallbackOutcome, DispatchExecutor, DispatchExecutorConfig,
    DispatchExecutorHandle, DispatchQueue, DispatchReport, InMemoryJobStore, JobOrchestrator,
    JobStore, JobView, OrchestratorError, RejectReason, WebhookCorrelator,
};
pub use rate_limit::{Admission, RateLimiter, SlidingWindowRateLimiter};
pub use transform::ResultTransformer;
pub use vendor::{HttpVendorClient, VendorClient, VendorRegistry};
