//! In-process task execution for dispatch work.
//!
//! The orchestrator only hands out `(job_id, delay)` work items through
//! [`DispatchScheduler`]. [`DispatchExecutor`] runs them on tokio with bounded
//! concurrency and at-least-once semantics: a dispatch that fails with an
//! infrastructure error is re-queued with the executor's own fixed backoff
//! until its budget is spent, then the job is given up.

use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use serde::Serialize;
use tokio::sync::{Semaphore, mpsc, watch};
use tokio::task::{JoinHandle, JoinSet};
use tracing::{debug, error, info, warn};

use vendorgate_core::JobId;

use super::backoff::BackoffPolicy;
use super::orchestrator::JobOrchestrator;

#[derive(Debug, Clone, thiserror::Error)]
pub enum ScheduleError {
    #[error("dispatch queue is closed")]
    Closed,
}

/// Accepts dispatch work for later execution.
pub trait DispatchScheduler: Send + Sync {
    fn schedule(&self, job_id: JobId, delay: Duration) -> Result<(), ScheduleError>;
}

impl<S> DispatchScheduler for Arc<S>
where
    S: DispatchScheduler + ?Sized,
{
    fn schedule(&self, job_id: JobId, delay: Duration) -> Result<(), ScheduleError> {
        (**self).schedule(job_id, delay)
    }
}

/// One queued dispatch.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DispatchItem {
    pub job_id: JobId,
    pub delay: Duration,
    /// Executor-level re-queues already spent on this item
    pub requeues: u32,
}

/// Sending half of the dispatch queue.
#[derive(Debug, Clone)]
pub struct DispatchQueue {
    tx: mpsc::UnboundedSender<DispatchItem>,
}

/// Receiving half, consumed by [`DispatchExecutor::spawn`].
#[derive(Debug)]
pub struct DispatchReceiver {
    rx: mpsc::UnboundedReceiver<DispatchItem>,
}

impl DispatchQueue {
    pub fn new() -> (Self, DispatchReceiver) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Self { tx }, DispatchReceiver { rx })
    }

    fn push(&self, item: DispatchItem) -> Result<(), ScheduleError> {
        self.tx.send(item).map_err(|_| ScheduleError::Closed)
    }
}

impl DispatchScheduler for DispatchQueue {
    fn schedule(&self, job_id: JobId, delay: Duration) -> Result<(), ScheduleError> {
        self.push(DispatchItem {
            job_id,
            delay,
            requeues: 0,
        })
    }
}

/// Executor configuration.
#[derive(Debug, Clone)]
pub struct DispatchExecutorConfig {
    /// Maximum dispatches running at once
    pub max_concurrent: usize,
    /// Fixed backoff and budget for infrastructure failures
    pub requeue_policy: BackoffPolicy,
    /// Name for logging
    pub name: String,
}

impl Default for DispatchExecutorConfig {
    fn default() -> Self {
        Self {
            max_concurrent: 4,
            requeue_policy: BackoffPolicy::fixed(Duration::from_secs(1), 5),
            name: "dispatch-executor".to_string(),
        }
    }
}

impl DispatchExecutorConfig {
    pub fn with_name(mut self, name: impl Into<String>) -> Self {
        self.name = name.into();
        self
    }

    pub fn with_max_concurrent(mut self, max: usize) -> Self {
        self.max_concurrent = max.max(1);
        self
    }

    pub fn with_requeue_policy(mut self, policy: BackoffPolicy) -> Self {
        self.requeue_policy = policy;
        self
    }
}

/// Executor runtime statistics.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct ExecutorStats {
    pub processed: u64,
    pub succeeded: u64,
    pub failed: u64,
    pub requeued: u64,
    pub abandoned: u64,
    pub current_running: usize,
    pub uptime_secs: u64,
}

/// Handle to control a running executor. Dropping it also stops the executor.
#[derive(Debug)]
pub struct DispatchExecutorHandle {
    shutdown: watch::Sender<bool>,
    join: Option<JoinHandle<()>>,
    stats: Arc<Mutex<ExecutorStats>>,
    started: Instant,
}

impl DispatchExecutorHandle {
    /// Stop taking work, drop items still waiting on their delay and wait for
    /// running dispatches to finish.
    pub async fn shutdown(mut self) {
        let _ = self.shutdown.send(true);
        if let Some(join) = self.join.take() {
            let _ = join.await;
        }
    }

    pub fn stats(&self) -> ExecutorStats {
        let mut stats = self
            .stats
            .lock()
            .map(|s| s.clone())
            .unwrap_or_else(|e| e.into_inner().clone());
        stats.uptime_secs = self.started.elapsed().as_secs();
        stats
    }
}

/// Runs queued dispatches against a [`JobOrchestrator`].
pub struct DispatchExecutor;

impl DispatchExecutor {
    /// Spawn the executor loop on the current tokio runtime.
    ///
    /// `queue` must be the sending half paired with `receiver`; it is used for
    /// re-queues.
    pub fn spawn(
        orchestrator: Arc<JobOrchestrator>,
        queue: DispatchQueue,
        receiver: DispatchReceiver,
        config: DispatchExecutorConfig,
    ) -> DispatchExecutorHandle {
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let stats = Arc::new(Mutex::new(ExecutorStats::default()));

        let worker = Worker {
            orchestrator,
            queue,
            permits: Arc::new(Semaphore::new(config.max_concurrent.max(1))),
            stats: stats.clone(),
            config,
        };
        let join = tokio::spawn(worker.run(receiver, shutdown_rx));

        DispatchExecutorHandle {
            shutdown: shutdown_tx,
            join: Some(join),
            stats,
            started: Instant::now(),
        }
    }
}

#[derive(Clone)]
struct Worker {
    orchestrator: Arc<JobOrchestrator>,
    queue: DispatchQueue,
    permits: Arc<Semaphore>,
    stats: Arc<Mutex<ExecutorStats>>,
    config: DispatchExecutorConfig,
}

impl Worker {
    async fn run(self, mut receiver: DispatchReceiver, mut shutdown: watch::Receiver<bool>) {
        info!(
            executor = %self.config.name,
            max_concurrent = self.config.max_concurrent,
            "dispatch executor started"
        );
        let mut tasks = JoinSet::new();

        loop {
            tokio::select! {
                _ = shutdown.changed() => break,
                item = receiver.rx.recv() => match item {
                    Some(item) => {
                        let worker = self.clone();
                        let cancel = shutdown.clone();
                        tasks.spawn(async move { worker.execute(item, cancel).await });
                    }
                    None => break,
                },
                Some(joined) = tasks.join_next(), if !tasks.is_empty() => {
                    if let Err(e) = joined {
                        error!(executor = %self.config.name, error = %e, "dispatch task panicked");
                    }
                }
            }
        }

        while tasks.join_next().await.is_some() {}
        info!(executor = %self.config.name, "dispatch executor stopped");
    }

    async fn execute(&self, item: DispatchItem, mut cancel: watch::Receiver<bool>) {
        if !item.delay.is_zero() {
            tokio::select! {
                _ = tokio::time::sleep(item.delay) => {}
                _ = cancel.changed() => {
                    debug!(job_id = %item.job_id, "dropping delayed dispatch on shutdown");
                    return;
                }
            }
        }

        let Ok(_permit) = self.permits.acquire().await else {
            return;
        };
        self.update_stats(|s| s.current_running += 1);

        let result = self.orchestrator.dispatch(item.job_id).await;
        let ok = result.is_ok();

        self.update_stats(|s| {
            s.current_running = s.current_running.saturating_sub(1);
            s.processed += 1;
            if ok {
                s.succeeded += 1;
            } else {
                s.failed += 1;
            }
        });

        match result {
            Ok(report) => {
                debug!(job_id = %item.job_id, report = ?report, "dispatch finished");
            }
            Err(e) => self.recover(item, e.to_string()).await,
        }
    }

    async fn recover(&self, item: DispatchItem, error: String) {
        let requeues = item.requeues + 1;
        let policy = &self.config.requeue_policy;

        if policy.allows_another(item.requeues) {
            let delay = policy.delay_for_attempt(requeues);
            warn!(
                job_id = %item.job_id,
                requeues,
                delay_ms = delay.as_millis() as u64,
                error = %error,
                "dispatch failed, re-queueing"
            );
            let requeued = self.queue.push(DispatchItem {
                job_id: item.job_id,
                delay,
                requeues,
            });
            if requeued.is_ok() {
                self.update_stats(|s| s.requeued += 1);
                return;
            }
        }

        error!(job_id = %item.job_id, error = %error, "giving up on dispatch");
        self.update_stats(|s| s.abandoned += 1);
        if let Err(e) = self.orchestrator.abandon(item.job_id, &error).await {
            error!(job_id = %item.job_id, error = %e, "failed to record abandoned dispatch");
        }
    }

    fn update_stats(&self, f: impl FnOnce(&mut ExecutorStats)) {
        let mut stats = self.stats.lock().unwrap_or_else(|e| e.into_inner());
        f(&mut stats);
    }
}
