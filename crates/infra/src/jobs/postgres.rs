//! Postgres-backed job store.
//!
//! The conditional transition is a single
//! `UPDATE jobs ... WHERE id = $1 AND status = $2 AND version = $3`; zero
//! affected rows means another writer got there first, and the current row is
//! returned as a conflict. Correlations live in `job_correlations`, keyed by
//! `(vendor, token)`, so they survive restarts.
//!
//! ## Error Mapping
//!
//! | SQLx Error | PostgreSQL Error Code | JobStoreError |
//! |------------|----------------------|---------------|
//! | Database (unique violation) | `23505` | `AlreadyExists` (create) / re-checked (bind) |
//! | Database (foreign key violation) | `23503` | `NotFound` |
//! | Anything else | N/A | `Storage` |

use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::{PgPool, Row};
use tracing::instrument;
use uuid::Uuid;

use vendorgate_core::{
    Clock, FailureReason, Job, JobId, JobStatus, JobUpdate, StatusChange, SystemClock, VendorId,
};

use super::store::{
    Expected, JobStats, JobStore, JobStoreError, TransitionOutcome, check_update, matches_expected,
};

const SCHEMA: &str = include_str!("../../migrations/0001_jobs.sql");

const SELECT_JOB: &str = r#"
    SELECT id, payload, status, vendor, result, failure, error, attempt_count,
           next_attempt_at, correlation_token, version, history, created_at, updated_at
    FROM jobs
    WHERE id = $1
"#;

#[derive(Clone)]
pub struct PostgresJobStore {
    pool: Arc<PgPool>,
    clock: Arc<dyn Clock>,
}

impl PostgresJobStore {
    pub fn new(pool: PgPool) -> Self {
        Self {
            pool: Arc::new(pool),
            clock: Arc::new(SystemClock::new()),
        }
    }

    pub async fn connect(database_url: &str) -> Result<Self, JobStoreError> {
        let pool = PgPool::connect(database_url)
            .await
            .map_err(|e| map_sqlx_error("connect", e))?;
        Ok(Self::new(pool))
    }

    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    /// Create the tables if they do not exist yet.
    pub async fn migrate(&self) -> Result<(), JobStoreError> {
        sqlx::raw_sql(SCHEMA)
            .execute(&*self.pool)
            .await
            .map_err(|e| map_sqlx_error("migrate", e))?;
        Ok(())
    }

    async fn load(&self, job_id: JobId) -> Result<Option<Job>, JobStoreError> {
        let row = sqlx::query(SELECT_JOB)
            .bind(job_id.as_uuid())
            .fetch_optional(&*self.pool)
            .await
            .map_err(|e| map_sqlx_error("load_job", e))?;

        row.map(|r| job_from_row(&r)).transpose()
    }
}

#[async_trait]
impl JobStore for PostgresJobStore {
    #[instrument(skip(self, job), fields(job_id = %job.id), err)]
    async fn create(&self, job: Job) -> Result<JobId, JobStoreError> {
        let history = history_json(&job)?;

        sqlx::query(
            r#"
            INSERT INTO jobs (
                id, payload, status, vendor, result, failure, error, attempt_count,
                next_attempt_at, correlation_token, version, history, created_at, updated_at
            )
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13, $14)
            "#,
        )
        .bind(job.id.as_uuid())
        .bind(&job.payload)
        .bind(job.status.as_str())
        .bind(job.vendor.as_ref().map(|v| v.as_str()))
        .bind(&job.result)
        .bind(job.failure.map(|f| f.as_str()))
        .bind(&job.error)
        .bind(job.attempt_count as i32)
        .bind(job.next_attempt_at)
        .bind(&job.correlation_token)
        .bind(job.version as i64)
        .bind(history)
        .bind(job.created_at)
        .bind(job.updated_at)
        .execute(&*self.pool)
        .await
        .map_err(|e| {
            if is_unique_violation(&e) {
                JobStoreError::AlreadyExists(job.id)
            } else {
                map_sqlx_error("insert_job", e)
            }
        })?;

        Ok(job.id)
    }

    #[instrument(skip(self), fields(job_id = %job_id), err)]
    async fn get(&self, job_id: JobId) -> Result<Option<Job>, JobStoreError> {
        self.load(job_id).await
    }

    #[instrument(skip(self, update), fields(job_id = %job_id, to = %update.status), err)]
    async fn transition(
        &self,
        job_id: JobId,
        expected: Expected,
        update: JobUpdate,
    ) -> Result<TransitionOutcome, JobStoreError> {
        let current = self
            .load(job_id)
            .await?
            .ok_or(JobStoreError::NotFound(job_id))?;

        if !matches_expected(&current, &expected) {
            return Ok(TransitionOutcome::Conflict(current));
        }
        check_update(&current, &update)?;

        let mut next = current.clone();
        next.apply_update(update, self.clock.now());
        let history = history_json(&next)?;

        let result = sqlx::query(
            r#"
            UPDATE jobs SET
                status = $4,
                vendor = $5,
                result = $6,
                failure = $7,
                error = $8,
                attempt_count = $9,
                next_attempt_at = $10,
                correlation_token = $11,
                version = $12,
                history = $13,
                updated_at = $14
            WHERE id = $1 AND status = $2 AND version = $3
            "#,
        )
        .bind(job_id.as_uuid())
        .bind(expected.status.as_str())
        .bind(expected.version as i64)
        .bind(next.status.as_str())
        .bind(next.vendor.as_ref().map(|v| v.as_str()))
        .bind(&next.result)
        .bind(next.failure.map(|f| f.as_str()))
        .bind(&next.error)
        .bind(next.attempt_count as i32)
        .bind(next.next_attempt_at)
        .bind(&next.correlation_token)
        .bind(next.version as i64)
        .bind(history)
        .bind(next.updated_at)
        .execute(&*self.pool)
        .await
        .map_err(|e| map_sqlx_error("transition_job", e))?;

        if result.rows_affected() == 1 {
            return Ok(TransitionOutcome::Committed(next));
        }

        let latest = self
            .load(job_id)
            .await?
            .ok_or(JobStoreError::NotFound(job_id))?;
        Ok(TransitionOutcome::Conflict(latest))
    }

    #[instrument(skip(self), fields(vendor = %vendor, job_id = %job_id), err)]
    async fn bind_correlation(
        &self,
        vendor: &VendorId,
        token: &str,
        job_id: JobId,
    ) -> Result<(), JobStoreError> {
        let inserted = sqlx::query(
            r#"
            INSERT INTO job_correlations (vendor, token, job_id)
            VALUES ($1, $2, $3)
            ON CONFLICT (vendor, token) DO NOTHING
            "#,
        )
        .bind(vendor.as_str())
        .bind(token)
        .bind(job_id.as_uuid())
        .execute(&*self.pool)
        .await
        .map_err(|e| {
            if is_foreign_key_violation(&e) {
                JobStoreError::NotFound(job_id)
            } else {
                map_sqlx_error("bind_correlation", e)
            }
        })?;

        if inserted.rows_affected() == 1 {
            return Ok(());
        }

        match self.find_by_correlation(vendor, token).await? {
            Some(bound) if bound == job_id => Ok(()),
            Some(bound) => Err(JobStoreError::CorrelationConflict {
                vendor: vendor.clone(),
                token: token.to_string(),
                bound_to: bound,
            }),
            None => Err(JobStoreError::Storage(format!(
                "correlation for '{vendor}' vanished during bind"
            ))),
        }
    }

    async fn find_by_correlation(
        &self,
        vendor: &VendorId,
        token: &str,
    ) -> Result<Option<JobId>, JobStoreError> {
        let row = sqlx::query("SELECT job_id FROM job_correlations WHERE vendor = $1 AND token = $2")
            .bind(vendor.as_str())
            .bind(token)
            .fetch_optional(&*self.pool)
            .await
            .map_err(|e| map_sqlx_error("find_by_correlation", e))?;

        row.map(|r| {
            r.try_get::<Uuid, _>("job_id")
                .map(JobId::from_uuid)
                .map_err(|e| map_sqlx_error("read_job_id", e))
        })
        .transpose()
    }

    async fn stats(&self) -> Result<JobStats, JobStoreError> {
        let rows = sqlx::query("SELECT status, COUNT(*) AS n FROM jobs GROUP BY status")
            .fetch_all(&*self.pool)
            .await
            .map_err(|e| map_sqlx_error("stats", e))?;

        let mut stats = JobStats::default();
        for row in rows {
            let status: String = row.try_get("status").map_err(|e| map_sqlx_error("stats", e))?;
            let n: i64 = row.try_get("n").map_err(|e| map_sqlx_error("stats", e))?;
            let n = n.max(0) as usize;
            match JobStatus::parse(&status) {
                Some(JobStatus::Pending) => stats.pending += n,
                Some(JobStatus::Dispatched) => stats.dispatched += n,
                Some(JobStatus::AwaitingCallback) => stats.awaiting_callback += n,
                Some(JobStatus::Complete) => stats.complete += n,
                Some(JobStatus::Failed) => stats.failed += n,
                None => tracing::warn!(status = %status, "unknown job status in store"),
            }
        }
        Ok(stats)
    }
}

fn history_json(job: &Job) -> Result<serde_json::Value, JobStoreError> {
    serde_json::to_value(&job.history)
        .map_err(|e| JobStoreError::Storage(format!("failed to encode history: {e}")))
}

fn job_from_row(row: &sqlx::postgres::PgRow) -> Result<Job, JobStoreError> {
    let get_err = |e: sqlx::Error| JobStoreError::Storage(format!("failed to read job row: {e}"));

    let status: String = row.try_get("status").map_err(get_err)?;
    let status = JobStatus::parse(&status)
        .ok_or_else(|| JobStoreError::Storage(format!("unknown job status '{status}'")))?;

    let failure: Option<String> = row.try_get("failure").map_err(get_err)?;
    let failure = failure
        .map(|f| {
            FailureReason::parse(&f)
                .ok_or_else(|| JobStoreError::Storage(format!("unknown failure reason '{f}'")))
        })
        .transpose()?;

    let history: serde_json::Value = row.try_get("history").map_err(get_err)?;
    let history: Vec<StatusChange> = serde_json::from_value(history)
        .map_err(|e| JobStoreError::Storage(format!("failed to decode history: {e}")))?;

    let id: Uuid = row.try_get("id").map_err(get_err)?;
    let vendor: Option<String> = row.try_get("vendor").map_err(get_err)?;
    let attempt_count: i32 = row.try_get("attempt_count").map_err(get_err)?;
    let version: i64 = row.try_get("version").map_err(get_err)?;
    let next_attempt_at: Option<DateTime<Utc>> = row.try_get("next_attempt_at").map_err(get_err)?;

    Ok(Job {
        id: JobId::from_uuid(id),
        payload: row.try_get("payload").map_err(get_err)?,
        status,
        vendor: vendor.map(VendorId::from),
        result: row.try_get("result").map_err(get_err)?,
        failure,
        error: row.try_get("error").map_err(get_err)?,
        attempt_count: attempt_count.max(0) as u32,
        next_attempt_at,
        correlation_token: row.try_get("correlation_token").map_err(get_err)?,
        version: version.max(0) as u64,
        created_at: row.try_get("created_at").map_err(get_err)?,
        updated_at: row.try_get("updated_at").map_err(get_err)?,
        history,
    })
}

fn map_sqlx_error(operation: &str, err: sqlx::Error) -> JobStoreError {
    match err {
        sqlx::Error::Database(db_err) => {
            JobStoreError::Storage(format!("database error in {}: {}", operation, db_err.message()))
        }
        sqlx::Error::PoolClosed => {
            JobStoreError::Storage(format!("connection pool closed in {}", operation))
        }
        _ => JobStoreError::Storage(format!("sqlx error in {}: {}", operation, err)),
    }
}

fn sqlstate_is(err: &sqlx::Error, code: &str) -> bool {
    if let sqlx::Error::Database(db_err) = err {
        if let Some(c) = db_err.code() {
            return c.as_ref() == code;
        }
    }
    false
}

fn is_unique_violation(err: &sqlx::Error) -> bool {
    sqlstate_is(err, "23505")
}

fn is_foreign_key_violation(err: &sqlx::Error) -> bool {
    sqlstate_is(err, "23503")
}
