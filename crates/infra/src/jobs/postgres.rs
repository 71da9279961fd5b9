//! Postgres-backed job store.
//!
//! Every operation runs in its own transaction and opens with
//! `FOR UPDATE SKIP LOCKED`, so concurrent pollers partition the table
//! instead of queueing on each other's row locks.
//!
//! ## Error Mapping
//!
//! | SQLx Error | PostgreSQL Error Code | JobStoreError |
//! |------------|----------------------|---------------|
//! | Database (unique violation) | `23505` | `AlreadyExists` (insert only) |
//! | Database (check constraint violation) | `23514` | `Corrupt` |
//! | Database (other) | Any other | `Storage` |
//! | PoolClosed / PoolTimedOut / Io | N/A | `Storage` |
//! | ColumnDecode / Decode | N/A | `Corrupt` |
//!
//! A skip-locked select that returns no row is disambiguated with a plain
//! existence check: `Locked` if the row exists, `NotFound` otherwise.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::postgres::PgRow;
use sqlx::{PgConnection, PgPool, Postgres, Row, Transaction};
use tracing::{Span, instrument};

use reportflow_core::{
    Job, JobId, JobStatus, NewJob, RetryBudget, StatusUpdate, UpdateOutcome, UserId,
};

use super::store::{JobStats, JobStore, JobStoreError, NotificationBatch};

macro_rules! job_columns {
    () => {
        "id, user_id, type, params, status, created_at, updated_at, error, \
         retry_count, result_path, notification_sent"
    };
}

/// Postgres job store over the `report_jobs` table.
#[derive(Debug, Clone)]
pub struct PostgresJobStore {
    pool: Arc<PgPool>,
    budget: RetryBudget,
}

impl PostgresJobStore {
    pub fn new(pool: PgPool, budget: RetryBudget) -> Self {
        Self {
            pool: Arc::new(pool),
            budget,
        }
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }

    /// Create the job table and its indexes if they do not exist.
    #[instrument(skip(self), err)]
    pub async fn ensure_schema(&self) -> Result<(), JobStoreError> {
        sqlx::raw_sql(include_str!("schema.sql"))
            .execute(&*self.pool)
            .await
            .map_err(|e| map_sqlx_error("ensure_schema", e))?;
        Ok(())
    }

    async fn begin(&self) -> Result<Transaction<'static, Postgres>, JobStoreError> {
        self.pool
            .begin()
            .await
            .map_err(|e| map_sqlx_error("begin_transaction", e))
    }
}

#[async_trait]
impl JobStore for PostgresJobStore {
    fn retry_budget(&self) -> RetryBudget {
        self.budget
    }

    #[instrument(skip(self, job), fields(job_id = %job.id, job_type = %job.job_type), err)]
    async fn insert(&self, job: NewJob) -> Result<Job, JobStoreError> {
        let id = job.id;
        let row = sqlx::query(concat!(
            "INSERT INTO report_jobs (id, user_id, type, params) VALUES ($1, $2, $3, $4) \
             RETURNING ",
            job_columns!()
        ))
        .bind(job.id.as_uuid())
        .bind(job.user_id.get())
        .bind(&job.job_type)
        .bind(&job.params)
        .fetch_one(&*self.pool)
        .await
        .map_err(|e| {
            if is_unique_violation(&e) {
                JobStoreError::AlreadyExists(id)
            } else {
                map_sqlx_error("insert_job", e)
            }
        })?;

        decode_job(&row)
    }

    #[instrument(skip(self), fields(job_id = %id), err)]
    async fn get(&self, id: JobId) -> Result<Option<Job>, JobStoreError> {
        let row = sqlx::query(concat!(
            "SELECT ",
            job_columns!(),
            " FROM report_jobs WHERE id = $1"
        ))
        .bind(id.as_uuid())
        .fetch_optional(&*self.pool)
        .await
        .map_err(|e| map_sqlx_error("get_job", e))?;

        row.as_ref().map(decode_job).transpose()
    }

    #[instrument(skip(self), fields(claimed = tracing::field::Empty), err)]
    async fn claim_batch(&self, limit: usize) -> Result<Vec<Job>, JobStoreError> {
        let mut tx = self.begin().await?;

        let rows = sqlx::query(concat!(
            r#"
            WITH candidates AS (
                SELECT id AS candidate_id
                FROM report_jobs
                WHERE status = 'PENDING'
                ORDER BY created_at, id
                LIMIT $1
                FOR UPDATE SKIP LOCKED
            )
            UPDATE report_jobs
            SET status = 'IN_PROGRESS', updated_at = now()
            FROM candidates
            WHERE id = candidate_id
            RETURNING "#,
            job_columns!()
        ))
        .bind(to_limit(limit))
        .fetch_all(&mut *tx)
        .await
        .map_err(|e| map_sqlx_error("claim_batch", e))?;

        // Decode before committing: an undecodable row rolls the whole claim back.
        // RETURNING carries no ordering guarantee.
        let mut jobs = rows.iter().map(decode_job).collect::<Result<Vec<_>, _>>()?;
        jobs.sort_by(|a, b| a.created_at.cmp(&b.created_at).then(a.id.cmp(&b.id)));

        tx.commit()
            .await
            .map_err(|e| map_sqlx_error("commit_transaction", e))?;

        Span::current().record("claimed", jobs.len());
        Ok(jobs)
    }

    #[instrument(
        skip(self, update),
        fields(job_id = %id, status = %update.status()),
        err
    )]
    async fn update_status(
        &self,
        id: JobId,
        update: &StatusUpdate,
    ) -> Result<UpdateOutcome, JobStoreError> {
        let mut tx = self.begin().await?;

        let Some((status, retry_count)) = lock_row(&mut tx, id).await? else {
            return Err(missing_or_locked(&mut tx, id).await);
        };

        let outcome = self
            .budget
            .check_update(status, retry_count, update.status())
            .map_err(|source| JobStoreError::InvalidTransition { id, source })?;

        if outcome == UpdateOutcome::Applied {
            sqlx::query(
                r#"
                UPDATE report_jobs
                SET status = $2, error = $3, result_path = $4, updated_at = now()
                WHERE id = $1
                "#,
            )
            .bind(id.as_uuid())
            .bind(update.status().as_str())
            .bind(update.error())
            .bind(update.result_path())
            .execute(&mut *tx)
            .await
            .map_err(|e| map_sqlx_error("update_status", e))?;
        }

        tx.commit()
            .await
            .map_err(|e| map_sqlx_error("commit_transaction", e))?;
        Ok(outcome)
    }

    #[instrument(skip(self), fields(job_id = %id), err)]
    async fn increment_retry_count(&self, id: JobId) -> Result<u32, JobStoreError> {
        let mut tx = self.begin().await?;

        let Some((_, retry_count)) = lock_row(&mut tx, id).await? else {
            return Err(missing_or_locked(&mut tx, id).await);
        };
        let next = self.budget.next_count(retry_count);

        sqlx::query("UPDATE report_jobs SET retry_count = $2, updated_at = now() WHERE id = $1")
            .bind(id.as_uuid())
            .bind(to_count(next)?)
            .execute(&mut *tx)
            .await
            .map_err(|e| map_sqlx_error("increment_retry_count", e))?;

        tx.commit()
            .await
            .map_err(|e| map_sqlx_error("commit_transaction", e))?;
        Ok(next)
    }

    #[instrument(skip(self), fields(claimed = tracing::field::Empty), err)]
    async fn reclaim_for_retry(&self, limit: usize) -> Result<Vec<Job>, JobStoreError> {
        let mut tx = self.begin().await?;

        let rows = sqlx::query(concat!(
            r#"
            WITH candidates AS (
                SELECT id AS candidate_id
                FROM report_jobs
                WHERE status = 'FAILED' AND retry_count < $2
                ORDER BY updated_at, id
                LIMIT $1
                FOR UPDATE SKIP LOCKED
            )
            UPDATE report_jobs
            SET status = 'IN_PROGRESS', updated_at = now()
            FROM candidates
            WHERE id = candidate_id
            RETURNING "#,
            job_columns!()
        ))
        .bind(to_limit(limit))
        .bind(to_count(self.budget.max_retries)?)
        .fetch_all(&mut *tx)
        .await
        .map_err(|e| map_sqlx_error("reclaim_for_retry", e))?;

        let jobs = rows.iter().map(decode_job).collect::<Result<Vec<_>, _>>()?;

        tx.commit()
            .await
            .map_err(|e| map_sqlx_error("commit_transaction", e))?;
        Span::current().record("claimed", jobs.len());
        Ok(jobs)
    }

    #[instrument(skip(self), fields(locked = tracing::field::Empty), err)]
    async fn reclaim_for_notification(
        &self,
        limit: usize,
    ) -> Result<Box<dyn NotificationBatch>, JobStoreError> {
        let mut tx = self.begin().await?;

        let rows = sqlx::query(concat!(
            "SELECT ",
            job_columns!(),
            r#"
            FROM report_jobs
            WHERE status IN ('COMPLETED', 'FAILED') AND notification_sent = FALSE
            ORDER BY updated_at, id
            LIMIT $1
            FOR UPDATE SKIP LOCKED
            "#
        ))
        .bind(to_limit(limit))
        .fetch_all(&mut *tx)
        .await
        .map_err(|e| map_sqlx_error("reclaim_for_notification", e))?;

        let jobs = rows.iter().map(decode_job).collect::<Result<Vec<_>, _>>()?;
        Span::current().record("locked", jobs.len());

        Ok(Box::new(PgNotificationBatch {
            tx,
            jobs,
            marked: 0,
        }))
    }

    #[instrument(skip(self), err)]
    async fn stats(&self) -> Result<JobStats, JobStoreError> {
        let row = sqlx::query(
            r#"
            SELECT
                COUNT(*) FILTER (WHERE status = 'PENDING') AS pending,
                COUNT(*) FILTER (WHERE status = 'IN_PROGRESS') AS in_progress,
                COUNT(*) FILTER (WHERE status = 'COMPLETED') AS completed,
                COUNT(*) FILTER (WHERE status = 'FAILED') AS failed,
                COUNT(*) FILTER (WHERE status = 'FAILED' AND retry_count >= $1) AS retry_exhausted,
                COUNT(*) FILTER (
                    WHERE status IN ('COMPLETED', 'FAILED') AND notification_sent = FALSE
                ) AS awaiting_notification
            FROM report_jobs
            "#,
        )
        .bind(to_count(self.budget.max_retries)?)
        .fetch_one(&*self.pool)
        .await
        .map_err(|e| map_sqlx_error("stats", e))?;

        let count = |column: &str| -> Result<u64, JobStoreError> {
            let value: i64 = row
                .try_get(column)
                .map_err(|e| map_sqlx_error("stats", e))?;
            Ok(value.max(0) as u64)
        };

        Ok(JobStats {
            pending: count("pending")?,
            in_progress: count("in_progress")?,
            completed: count("completed")?,
            failed: count("failed")?,
            retry_exhausted: count("retry_exhausted")?,
            awaiting_notification: count("awaiting_notification")?,
        })
    }

    #[instrument(skip(self), err)]
    async fn list_stuck(
        &self,
        older_than: Duration,
        limit: usize,
    ) -> Result<Vec<Job>, JobStoreError> {
        let rows = sqlx::query(concat!(
            "SELECT ",
            job_columns!(),
            r#"
            FROM report_jobs
            WHERE status = 'IN_PROGRESS'
              AND updated_at < now() - make_interval(secs => $1)
            ORDER BY updated_at, id
            LIMIT $2
            "#
        ))
        .bind(older_than.as_secs_f64())
        .bind(to_limit(limit))
        .fetch_all(&*self.pool)
        .await
        .map_err(|e| map_sqlx_error("list_stuck", e))?;

        rows.iter().map(decode_job).collect()
    }
}

/// Open notification transaction; dropping it rolls back.
struct PgNotificationBatch {
    tx: Transaction<'static, Postgres>,
    jobs: Vec<Job>,
    marked: usize,
}

#[async_trait]
impl NotificationBatch for PgNotificationBatch {
    fn jobs(&self) -> &[Job] {
        &self.jobs
    }

    async fn mark_sent(&mut self, id: JobId) -> Result<(), JobStoreError> {
        let result = sqlx::query(
            "UPDATE report_jobs SET notification_sent = TRUE \
             WHERE id = $1 AND notification_sent = FALSE",
        )
        .bind(id.as_uuid())
        .execute(&mut *self.tx)
        .await
        .map_err(|e| map_sqlx_error("mark_sent", e))?;

        self.marked += result.rows_affected() as usize;
        Ok(())
    }

    async fn commit(self: Box<Self>) -> Result<usize, JobStoreError> {
        let marked = self.marked;
        self.tx
            .commit()
            .await
            .map_err(|e| map_sqlx_error("commit_transaction", e))?;
        Ok(marked)
    }
}

/// Skip-locked read of the guard columns.
async fn lock_row(
    tx: &mut Transaction<'static, Postgres>,
    id: JobId,
) -> Result<Option<(JobStatus, u32)>, JobStoreError> {
    let row: Option<(String, i32)> = sqlx::query_as(
        "SELECT status, retry_count FROM report_jobs WHERE id = $1 FOR UPDATE SKIP LOCKED",
    )
    .bind(id.as_uuid())
    .fetch_optional(&mut **tx)
    .await
    .map_err(|e| map_sqlx_error("lock_row", e))?;

    match row {
        Some((status, retry_count)) => {
            Ok(Some((decode_status(&status)?, decode_count(retry_count)?)))
        }
        None => Ok(None),
    }
}

async fn missing_or_locked(conn: &mut PgConnection, id: JobId) -> JobStoreError {
    let exists = sqlx::query_scalar::<_, bool>(
        "SELECT EXISTS (SELECT 1 FROM report_jobs WHERE id = $1)",
    )
    .bind(id.as_uuid())
    .fetch_one(conn)
    .await;

    match exists {
        Ok(true) => JobStoreError::Locked(id),
        Ok(false) => JobStoreError::NotFound(id),
        Err(e) => map_sqlx_error("job_exists", e),
    }
}

fn to_limit(limit: usize) -> i64 {
    i64::try_from(limit).unwrap_or(i64::MAX)
}

fn to_count(count: u32) -> Result<i32, JobStoreError> {
    i32::try_from(count)
        .map_err(|_| JobStoreError::Storage(format!("retry count out of range: {count}")))
}

fn decode_count(value: i32) -> Result<u32, JobStoreError> {
    u32::try_from(value)
        .map_err(|_| JobStoreError::Corrupt(format!("negative retry_count: {value}")))
}

fn decode_status(value: &str) -> Result<JobStatus, JobStoreError> {
    value
        .parse()
        .map_err(|e| JobStoreError::Corrupt(format!("{e}")))
}

fn decode_job(row: &PgRow) -> Result<Job, JobStoreError> {
    let row = JobRow::decode(row).map_err(|e| map_sqlx_error("decode_job", e))?;
    row.try_into()
}

fn map_sqlx_error(operation: &str, err: sqlx::Error) -> JobStoreError {
    match err {
        sqlx::Error::Database(db_err) => {
            let msg = format!("database error in {}: {}", operation, db_err.message());
            match db_err.code().as_deref() {
                // Check constraint violation
                Some("23514") => JobStoreError::Corrupt(msg),
                _ => JobStoreError::Storage(msg),
            }
        }
        sqlx::Error::ColumnDecode { .. } | sqlx::Error::Decode(_) | sqlx::Error::ColumnNotFound(_) => {
            JobStoreError::Corrupt(format!("failed to decode row in {}: {}", operation, err))
        }
        sqlx::Error::PoolClosed => {
            JobStoreError::Storage(format!("connection pool closed in {}", operation))
        }
        other => JobStoreError::Storage(format!("sqlx error in {}: {}", operation, other)),
    }
}

fn is_unique_violation(err: &sqlx::Error) -> bool {
    if let sqlx::Error::Database(db_err) = err {
        if let Some(code) = db_err.code() {
            return code.as_ref() == "23505";
        }
    }
    false
}

// SQLx row types

#[derive(Debug)]
struct JobRow {
    id: uuid::Uuid,
    user_id: i64,
    job_type: String,
    params: Vec<u8>,
    status: String,
    created_at: DateTime<Utc>,
    updated_at: DateTime<Utc>,
    error: Option<String>,
    retry_count: i32,
    result_path: Option<String>,
    notification_sent: bool,
}

impl JobRow {
    fn decode(row: &PgRow) -> Result<Self, sqlx::Error> {
        Ok(JobRow {
            id: row.try_get("id")?,
            user_id: row.try_get("user_id")?,
            job_type: row.try_get("type")?,
            params: row.try_get("params")?,
            status: row.try_get("status")?,
            created_at: row.try_get("created_at")?,
            updated_at: row.try_get("updated_at")?,
            error: row.try_get("error")?,
            retry_count: row.try_get("retry_count")?,
            result_path: row.try_get("result_path")?,
            notification_sent: row.try_get("notification_sent")?,
        })
    }
}

impl TryFrom<JobRow> for Job {
    type Error = JobStoreError;

    fn try_from(row: JobRow) -> Result<Self, Self::Error> {
        Ok(Job {
            id: JobId::from_uuid(row.id),
            user_id: UserId::new(row.user_id),
            job_type: row.job_type,
            params: row.params,
            status: decode_status(&row.status)?,
            created_at: row.created_at,
            updated_at: row.updated_at,
            error: row.error,
            retry_count: decode_count(row.retry_count)?,
            result_path: row.result_path,
            notification_sent: row.notification_sent,
        })
    }
}
