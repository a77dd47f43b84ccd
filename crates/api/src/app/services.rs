//! Service wiring: job store, rate limiter, dispatch queue and executor,
//! orchestrator and webhook correlator.

use std::sync::{Arc, Mutex};

use thiserror::Error;

use vendorgate_core::{Clock, SystemClock};
use vendorgate_infra::jobs::{
    DispatchExecutor, DispatchExecutorConfig, DispatchExecutorHandle, DispatchQueue,
    ExecutorStats, InMemoryJobStore, JobOrchestrator, JobStore, JobStoreError, WebhookCorrelator,
};
use vendorgate_infra::rate_limit::{RateLimitError, RateLimiter, SlidingWindowRateLimiter};
use vendorgate_infra::vendor::{HttpVendorClient, VendorClient, VendorRegistry};
use vendorgate_infra::{AppConfig, ConfigError};

#[derive(Debug, Error)]
pub enum ServicesError {
    #[error(transparent)]
    Config(#[from] ConfigError),

    #[error("job store: {0}")]
    Store(#[from] JobStoreError),

    #[error("rate limiter: {0}")]
    RateLimit(#[from] RateLimitError),
}

/// Shared services handed to every handler through an `Extension`.
pub struct AppServices {
    pub orchestrator: Arc<JobOrchestrator>,
    pub correlator: WebhookCorrelator,
    executor: Mutex<Option<DispatchExecutorHandle>>,
}

impl AppServices {
    pub fn executor_stats(&self) -> Option<ExecutorStats> {
        self.executor
            .lock()
            .ok()
            .and_then(|guard| guard.as_ref().map(|h| h.stats()))
    }

    /// Stop the dispatch executor, waiting for running dispatches.
    /// Later calls are no-ops.
    pub async fn shutdown(&self) {
        let handle = match self.executor.lock() {
            Ok(mut guard) => guard.take(),
            Err(poisoned) => poisoned.into_inner().take(),
        };
        if let Some(handle) = handle {
            handle.shutdown().await;
        }
    }
}

pub async fn build_services(config: &AppConfig) -> Result<AppServices, ServicesError> {
    let clock: Arc<dyn Clock> = Arc::new(SystemClock::new());
    let registry = Arc::new(config.registry()?);

    let store = build_store(config, clock.clone()).await?;
    let limiter = build_limiter(config, &registry, clock.clone())?;
    let client: Arc<dyn VendorClient> = Arc::new(HttpVendorClient::new());

    let (queue, receiver) = DispatchQueue::new();
    let orchestrator = Arc::new(
        JobOrchestrator::builder(store, registry, Arc::new(queue.clone()))
            .limiter(limiter)
            .client(client)
            .backoff(config.backoff())
            .clock(clock)
            .build(),
    );

    let executor = DispatchExecutor::spawn(
        orchestrator.clone(),
        queue,
        receiver,
        DispatchExecutorConfig::default().with_max_concurrent(config.dispatch.workers),
    );

    tracing::info!(
        vendors = orchestrator.registry().len(),
        workers = config.dispatch.workers,
        max_attempts = config.dispatch.max_attempts,
        "services wired"
    );

    Ok(AppServices {
        correlator: WebhookCorrelator::new(orchestrator.clone()),
        orchestrator,
        executor: Mutex::new(Some(executor)),
    })
}

async fn build_store(
    config: &AppConfig,
    clock: Arc<dyn Clock>,
) -> Result<Arc<dyn JobStore>, ServicesError> {
    if config.use_persistent_stores {
        #[cfg(feature = "postgres")]
        {
            let url = config
                .database_url
                .as_deref()
                .ok_or(ConfigError::Missing("DATABASE_URL"))?;
            let store = vendorgate_infra::jobs::PostgresJobStore::connect(url)
                .await?
                .with_clock(clock);
            store.migrate().await?;
            tracing::info!("using postgres job store");
            return Ok(Arc::new(store));
        }
        #[cfg(not(feature = "postgres"))]
        {
            tracing::warn!(
                "USE_PERSISTENT_STORES=true but postgres feature not enabled, falling back to in-memory"
            );
        }
    }

    Ok(Arc::new(InMemoryJobStore::with_clock(clock)))
}

fn build_limiter(
    config: &AppConfig,
    registry: &VendorRegistry,
    clock: Arc<dyn Clock>,
) -> Result<Arc<dyn RateLimiter>, ServicesError> {
    if let Some(redis_url) = config.redis_url.as_deref() {
        #[cfg(feature = "redis")]
        {
            let limiter = vendorgate_infra::rate_limit::RedisRateLimiter::new(
                redis_url,
                registry.iter(),
                config.rate_limit_window,
            )?
            .with_key_prefix(config.rate_limit_key_prefix.as_str());
            tracing::info!(prefix = %config.rate_limit_key_prefix, "using redis rate limiter");
            return Ok(Arc::new(limiter));
        }
        #[cfg(not(feature = "redis"))]
        {
            tracing::warn!(
                redis_url,
                "REDIS_URL set but redis feature not enabled, using in-process limiter"
            );
        }
    }

    Ok(Arc::new(SlidingWindowRateLimiter::from_vendors(
        registry.iter(),
        config.rate_limit_window,
        clock,
    )))
}
