//! Postgres-backed job store.
//!
//! `get_next_job` reserves a job with a single `UPDATE ... WHERE id = (SELECT ...
//! FOR UPDATE SKIP LOCKED)` statement: concurrent workers skip rows another
//! transaction has already locked instead of waiting on them, and the selected
//! row is leased in the same statement.
//!
//! ## Error Mapping
//!
//! | SQLx Error | PostgreSQL Error Code | JobStoreError |
//! |------------|----------------------|---------------|
//! | Database (unique violation) | `23505` | `AlreadyExists` (on insert) / `Storage` |
//! | Database (other) | Any other | `Storage` |
//! | PoolClosed | N/A | `Storage` |
//! | Other | N/A | `Storage` |

use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde_json::Value as JsonValue;
use sqlx::postgres::PgRow;
use sqlx::{PgPool, Row};
use tracing::instrument;
use uuid::Uuid;

use flyerq_core::JobId;

use super::filter::{JobFilter, JobOrder};
use super::payload::JobPayload;
use super::store::{JobStore, JobStoreError};
use super::types::{ExtractionJob, JobStats, JobStatus, JobType};

/// Schema statements applied by `PostgresJobStore::ensure_schema`.
const SCHEMA: &[&str] = &[
    r#"
    CREATE TABLE IF NOT EXISTS extraction_jobs (
        id             UUID PRIMARY KEY,
        job_type       TEXT NOT NULL,
        payload        JSONB NOT NULL,
        priority       INTEGER NOT NULL CHECK (priority BETWEEN 1 AND 10),
        status         TEXT NOT NULL,
        attempts       INTEGER NOT NULL DEFAULT 0,
        max_attempts   INTEGER NOT NULL DEFAULT 3,
        worker_id      TEXT,
        scheduled_for  TIMESTAMPTZ NOT NULL,
        started_at     TIMESTAMPTZ,
        completed_at   TIMESTAMPTZ,
        error_message  TEXT,
        error_count    INTEGER NOT NULL DEFAULT 0,
        created_at     TIMESTAMPTZ NOT NULL,
        updated_at     TIMESTAMPTZ NOT NULL,
        CONSTRAINT extraction_jobs_lease CHECK ((status = 'processing') = (worker_id IS NOT NULL))
    )
    "#,
    r#"
    CREATE INDEX IF NOT EXISTS extraction_jobs_dispatch_idx
        ON extraction_jobs (priority DESC, scheduled_for ASC, id ASC)
        WHERE status = 'pending'
    "#,
    r#"
    CREATE INDEX IF NOT EXISTS extraction_jobs_status_completed_idx
        ON extraction_jobs (status, completed_at)
    "#,
];

const COLUMNS: &str = "id, job_type, payload, priority, status, attempts, max_attempts, worker_id, \
     scheduled_for, started_at, completed_at, error_message, error_count, created_at, updated_at";

/// Postgres-backed job store.
///
/// Uses SQLx connection pool which is thread-safe (Arc + Send + Sync).
#[derive(Debug, Clone)]
pub struct PostgresJobStore {
    pool: Arc<PgPool>,
}

impl PostgresJobStore {
    /// Create a new PostgresJobStore with the given connection pool.
    pub fn new(pool: PgPool) -> Self {
        Self {
            pool: Arc::new(pool),
        }
    }

    /// Create the jobs table and indexes if they are missing.
    pub async fn ensure_schema(&self) -> Result<(), JobStoreError> {
        for statement in SCHEMA {
            sqlx::query(statement)
                .execute(&*self.pool)
                .await
                .map_err(|e| map_sqlx_error("ensure_schema", e))?;
        }
        Ok(())
    }

    async fn delete_finished(
        &self,
        operation: &str,
        status: JobStatus,
        before: DateTime<Utc>,
    ) -> Result<u64, JobStoreError> {
        let result = sqlx::query(
            "DELETE FROM extraction_jobs WHERE status = $1 AND completed_at < $2",
        )
        .bind(status.as_str())
        .bind(before)
        .execute(&*self.pool)
        .await
        .map_err(|e| map_sqlx_error(operation, e))?;
        Ok(result.rows_affected())
    }
}

fn type_names(job_types: &[JobType]) -> Vec<String> {
    job_types.iter().map(|t| t.as_str().to_string()).collect()
}

/// Decode one `extraction_jobs` row.
fn job_from_row(row: &PgRow) -> Result<ExtractionJob, JobStoreError> {
    let decode = |e: sqlx::Error| JobStoreError::Decode(e.to_string());

    let job_type: String = row.try_get("job_type").map_err(decode)?;
    let job_type: JobType = job_type
        .parse()
        .map_err(|e: flyerq_core::CoordinationError| JobStoreError::Decode(e.to_string()))?;
    let status: String = row.try_get("status").map_err(decode)?;
    let status: JobStatus = status
        .parse()
        .map_err(|e: flyerq_core::CoordinationError| JobStoreError::Decode(e.to_string()))?;
    let body: JsonValue = row.try_get("payload").map_err(decode)?;
    let payload = JobPayload::decode(job_type, body).map_err(|e| JobStoreError::Decode(e.to_string()))?;

    let id: Uuid = row.try_get("id").map_err(decode)?;
    let attempts: i32 = row.try_get("attempts").map_err(decode)?;
    let max_attempts: i32 = row.try_get("max_attempts").map_err(decode)?;
    let error_count: i32 = row.try_get("error_count").map_err(decode)?;

    Ok(ExtractionJob {
        id: JobId::from_uuid(id),
        job_type,
        payload,
        priority: row.try_get("priority").map_err(decode)?,
        status,
        attempts: attempts.max(0) as u32,
        max_attempts: max_attempts.max(0) as u32,
        worker_id: row.try_get("worker_id").map_err(decode)?,
        scheduled_for: row.try_get("scheduled_for").map_err(decode)?,
        started_at: row.try_get("started_at").map_err(decode)?,
        completed_at: row.try_get("completed_at").map_err(decode)?,
        error_message: row.try_get("error_message").map_err(decode)?,
        error_count: error_count.max(0) as u32,
        created_at: row.try_get("created_at").map_err(decode)?,
        updated_at: row.try_get("updated_at").map_err(decode)?,
    })
}

fn jobs_from_rows(rows: Vec<PgRow>) -> Result<Vec<ExtractionJob>, JobStoreError> {
    rows.iter().map(job_from_row).collect()
}

#[async_trait]
impl JobStore for PostgresJobStore {
    async fn get_by_id(&self, id: JobId) -> Result<Option<ExtractionJob>, JobStoreError> {
        let row = sqlx::query(&format!("SELECT {COLUMNS} FROM extraction_jobs WHERE id = $1"))
            .bind(id.as_uuid())
            .fetch_optional(&*self.pool)
            .await
            .map_err(|e| map_sqlx_error("get_by_id", e))?;

        row.as_ref().map(job_from_row).transpose()
    }

    async fn get_all(&self, filter: &JobFilter) -> Result<Vec<ExtractionJob>, JobStoreError> {
        // Optional filters collapse to TRUE when their parameter is NULL, so one
        // parameterized statement covers every combination.
        let job_types = (!filter.job_types.is_empty()).then(|| type_names(&filter.job_types));
        let statuses = (!filter.statuses.is_empty())
            .then(|| filter.statuses.iter().map(|s| s.as_str().to_string()).collect::<Vec<_>>());
        let worker_ids = (!filter.worker_ids.is_empty()).then(|| filter.worker_ids.clone());

        let sql = format!(
            r#"
            SELECT {COLUMNS}
            FROM extraction_jobs
            WHERE ($1::text[] IS NULL OR job_type = ANY($1))
                AND ($2::text[] IS NULL OR status = ANY($2))
                AND ($3::text[] IS NULL OR worker_id = ANY($3))
                AND ($4::integer IS NULL OR priority = $4)
                AND ($5::timestamptz IS NULL OR scheduled_for < $5)
                AND ($6::timestamptz IS NULL OR scheduled_for > $6)
                AND ($7::timestamptz IS NULL OR created_at < $7)
                AND ($8::timestamptz IS NULL OR created_at > $8)
            ORDER BY {order}
            LIMIT $9 OFFSET $10
            "#,
            order = filter.order.sql(),
        );

        let rows = sqlx::query(&sql)
            .bind(job_types)
            .bind(statuses)
            .bind(worker_ids)
            .bind(filter.priority)
            .bind(filter.scheduled_before)
            .bind(filter.scheduled_after)
            .bind(filter.created_before)
            .bind(filter.created_after)
            .bind(filter.pagination.limit as i64)
            .bind(filter.pagination.offset as i64)
            .fetch_all(&*self.pool)
            .await
            .map_err(|e| map_sqlx_error("get_all", e))?;

        jobs_from_rows(rows)
    }

    #[instrument(skip(self, job), fields(job_id = %job.id, job_type = %job.job_type), err)]
    async fn create(&self, job: &ExtractionJob) -> Result<(), JobStoreError> {
        let payload = job
            .payload
            .encode()
            .map_err(|e| JobStoreError::Storage(format!("failed to encode payload: {e}")))?;

        sqlx::query(&format!(
            "INSERT INTO extraction_jobs ({COLUMNS}) \
             VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13, $14, $15)"
        ))
        .bind(job.id.as_uuid())
        .bind(job.job_type.as_str())
        .bind(payload)
        .bind(job.priority)
        .bind(job.status.as_str())
        .bind(job.attempts as i32)
        .bind(job.max_attempts as i32)
        .bind(job.worker_id.as_deref())
        .bind(job.scheduled_for)
        .bind(job.started_at)
        .bind(job.completed_at)
        .bind(job.error_message.as_deref())
        .bind(job.error_count as i32)
        .bind(job.created_at)
        .bind(job.updated_at)
        .execute(&*self.pool)
        .await
        .map_err(|e| match map_sqlx_error("create", e) {
            JobStoreError::Storage(msg) if msg.contains("23505") => JobStoreError::AlreadyExists(job.id),
            other => other,
        })?;

        Ok(())
    }

    #[instrument(skip(self, job), fields(job_id = %job.id, status = %job.status), err)]
    async fn update(&self, job: &ExtractionJob) -> Result<(), JobStoreError> {
        let payload = job
            .payload
            .encode()
            .map_err(|e| JobStoreError::Storage(format!("failed to encode payload: {e}")))?;

        let result = sqlx::query(
            r#"
            UPDATE extraction_jobs SET
                job_type = $2,
                payload = $3,
                priority = $4,
                status = $5,
                attempts = $6,
                max_attempts = $7,
                worker_id = $8,
                scheduled_for = $9,
                started_at = $10,
                completed_at = $11,
                error_message = $12,
                error_count = $13,
                updated_at = $14
            WHERE id = $1
            "#,
        )
        .bind(job.id.as_uuid())
        .bind(job.job_type.as_str())
        .bind(payload)
        .bind(job.priority)
        .bind(job.status.as_str())
        .bind(job.attempts as i32)
        .bind(job.max_attempts as i32)
        .bind(job.worker_id.as_deref())
        .bind(job.scheduled_for)
        .bind(job.started_at)
        .bind(job.completed_at)
        .bind(job.error_message.as_deref())
        .bind(job.error_count as i32)
        .bind(job.updated_at)
        .execute(&*self.pool)
        .await
        .map_err(|e| map_sqlx_error("update", e))?;

        if result.rows_affected() == 0 {
            return Err(JobStoreError::NotFound(job.id));
        }
        Ok(())
    }

    async fn delete(&self, id: JobId) -> Result<bool, JobStoreError> {
        let result = sqlx::query("DELETE FROM extraction_jobs WHERE id = $1")
            .bind(id.as_uuid())
            .execute(&*self.pool)
            .await
            .map_err(|e| map_sqlx_error("delete", e))?;
        Ok(result.rows_affected() > 0)
    }

    #[instrument(skip(self), err)]
    async fn get_next_job(
        &self,
        job_types: &[JobType],
        worker_id: &str,
        now: DateTime<Utc>,
    ) -> Result<Option<ExtractionJob>, JobStoreError> {
        let row = sqlx::query(&format!(
            r#"
            UPDATE extraction_jobs SET
                status = 'processing',
                worker_id = $2,
                started_at = $3,
                attempts = attempts + 1,
                updated_at = $3
            WHERE id = (
                SELECT id
                FROM extraction_jobs
                WHERE status = 'pending'
                    AND job_type = ANY($1)
                    AND scheduled_for <= $3
                ORDER BY {order}
                LIMIT 1
                FOR UPDATE SKIP LOCKED
            )
            RETURNING {COLUMNS}
            "#,
            order = JobOrder::Dispatch.sql(),
        ))
        .bind(type_names(job_types))
        .bind(worker_id)
        .bind(now)
        .fetch_optional(&*self.pool)
        .await
        .map_err(|e| map_sqlx_error("get_next_job", e))?;

        row.as_ref().map(job_from_row).transpose()
    }

    async fn get_pending_jobs(
        &self,
        job_types: &[JobType],
        limit: usize,
    ) -> Result<Vec<ExtractionJob>, JobStoreError> {
        let rows = sqlx::query(&format!(
            "SELECT {COLUMNS} FROM extraction_jobs \
             WHERE status = 'pending' AND job_type = ANY($1) \
             ORDER BY {order} LIMIT $2",
            order = JobOrder::Dispatch.sql(),
        ))
        .bind(type_names(job_types))
        .bind(limit as i64)
        .fetch_all(&*self.pool)
        .await
        .map_err(|e| map_sqlx_error("get_pending_jobs", e))?;

        jobs_from_rows(rows)
    }

    async fn get_processing_jobs(
        &self,
        worker_id: Option<&str>,
    ) -> Result<Vec<ExtractionJob>, JobStoreError> {
        let rows = sqlx::query(&format!(
            "SELECT {COLUMNS} FROM extraction_jobs \
             WHERE status = 'processing' AND ($1::text IS NULL OR worker_id = $1) \
             ORDER BY started_at ASC, id ASC"
        ))
        .bind(worker_id)
        .fetch_all(&*self.pool)
        .await
        .map_err(|e| map_sqlx_error("get_processing_jobs", e))?;

        jobs_from_rows(rows)
    }

    async fn delete_completed_jobs(&self, before: DateTime<Utc>) -> Result<u64, JobStoreError> {
        self.delete_finished("delete_completed_jobs", JobStatus::Completed, before)
            .await
    }

    async fn delete_failed_jobs(&self, before: DateTime<Utc>) -> Result<u64, JobStoreError> {
        self.delete_finished("delete_failed_jobs", JobStatus::Failed, before)
            .await
    }

    async fn delete_expired_jobs(&self, before: DateTime<Utc>) -> Result<u64, JobStoreError> {
        let result = sqlx::query("DELETE FROM extraction_jobs WHERE created_at < $1")
            .bind(before)
            .execute(&*self.pool)
            .await
            .map_err(|e| map_sqlx_error("delete_expired_jobs", e))?;
        Ok(result.rows_affected())
    }

    async fn stats(&self) -> Result<JobStats, JobStoreError> {
        let rows = sqlx::query("SELECT status, COUNT(*) AS total FROM extraction_jobs GROUP BY status")
            .fetch_all(&*self.pool)
            .await
            .map_err(|e| map_sqlx_error("stats", e))?;

        let mut stats = JobStats::default();
        for row in rows {
            let status: String = row
                .try_get("status")
                .map_err(|e| JobStoreError::Decode(e.to_string()))?;
            let total: i64 = row
                .try_get("total")
                .map_err(|e| JobStoreError::Decode(e.to_string()))?;
            let status: JobStatus = status
                .parse()
                .map_err(|e: flyerq_core::CoordinationError| JobStoreError::Decode(e.to_string()))?;
            stats.add(status, total.max(0) as u64);
        }
        Ok(stats)
    }
}

/// Map a SQLx error to a `JobStoreError`, tagging it with the operation name.
///
/// Database errors keep their SQLSTATE code in the message so callers can
/// recognise unique violations (`23505`).
fn map_sqlx_error(operation: &str, err: sqlx::Error) -> JobStoreError {
    match err {
        sqlx::Error::Database(db_err) => {
            let code = db_err.code().map(|c| c.to_string()).unwrap_or_default();
            JobStoreError::Storage(format!(
                "database error in {} ({}): {}",
                operation,
                code,
                db_err.message()
            ))
        }
        sqlx::Error::PoolClosed => {
            JobStoreError::Storage(format!("connection pool closed in {}", operation))
        }
        sqlx::Error::RowNotFound => {
            JobStoreError::Storage(format!("unexpected row not found in {}", operation))
        }
        other => JobStoreError::Storage(format!("{} failed: {}", operation, other)),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn pool_closed_names_operation() {
        let err = map_sqlx_error("create", sqlx::Error::PoolClosed);
        assert!(matches!(err, JobStoreError::Storage(msg) if msg.contains("create")));
    }

    #[test]
    fn type_names_use_wire_names() {
        assert_eq!(
            type_names(&[JobType::ScrapeFlyer, JobType::MatchProducts]),
            vec!["scrape-flyer".to_string(), "match-products".to_string()]
        );
    }

    #[test]
    fn schema_enforces_lease_invariant() {
        assert!(SCHEMA[0].contains("(status = 'processing') = (worker_id IS NOT NULL)"));
    }
}
