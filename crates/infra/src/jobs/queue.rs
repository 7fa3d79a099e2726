//! Extraction job queue: creation, dispatch and lifecycle transitions.

use std::sync::Arc;

use chrono::{DateTime, Duration as ChronoDuration, Utc};
use tracing::{debug, info, instrument};

use flyerq_core::{Clock, CoordinationError, CoordinationResult, FlyerId, JobId, PageId, StoreId};

use crate::config::QueueConfig;

use super::filter::JobFilter;
use super::payload::{ExtractPagePayload, JobPayload, MatchProductsPayload, ScrapeFlyerPayload};
use super::store::{JobStore, JobStoreError};
use super::types::{ExtractionJob, JobStats, JobType, NewExtractionJob};

/// Message recorded on jobs whose lease outlived `recover_stalled_jobs`' window.
pub const LEASE_EXPIRED_MESSAGE: &str = "lease expired: worker stopped reporting";

/// Job queue over a `JobStore`.
///
/// The queue holds no state of its own; all coordination between workers goes
/// through the store. It never retries on its own: backoff and retry decisions
/// belong to the caller.
pub struct ExtractionJobQueue<S: JobStore> {
    store: S,
    clock: Arc<dyn Clock>,
    config: QueueConfig,
}

impl<S: JobStore> ExtractionJobQueue<S> {
    pub fn new(store: S, clock: Arc<dyn Clock>, config: QueueConfig) -> Self {
        Self {
            store,
            clock,
            config,
        }
    }

    pub fn store(&self) -> &S {
        &self.store
    }

    pub fn config(&self) -> &QueueConfig {
        &self.config
    }

    /// Validate, normalize and persist a new job.
    #[instrument(skip(self, job), fields(job_type = %job.job_type), err)]
    pub async fn create(&self, job: NewExtractionJob) -> CoordinationResult<ExtractionJob> {
        if job.payload.job_type() != job.job_type {
            return Err(CoordinationError::validation(format!(
                "payload for {} submitted as {}",
                job.payload.job_type(),
                job.job_type
            )));
        }

        let job = ExtractionJob::pending(job, self.config.default_max_attempts, self.clock.now());
        self.store
            .create(&job)
            .await
            .map_err(|e| e.into_coordination("create", format!("job {}", job.id)))?;

        info!(job_id = %job.id, priority = job.priority, scheduled_for = %job.scheduled_for, "job created");
        Ok(job)
    }

    pub async fn create_scrape_flyer_job(
        &self,
        store_id: StoreId,
        priority: i32,
    ) -> CoordinationResult<ExtractionJob> {
        let payload = JobPayload::from(ScrapeFlyerPayload { store_id });
        self.create(NewExtractionJob::new(payload).with_priority(priority))
            .await
    }

    pub async fn create_extract_page_job(
        &self,
        page_id: PageId,
        priority: i32,
    ) -> CoordinationResult<ExtractionJob> {
        let payload = JobPayload::from(ExtractPagePayload { page_id });
        self.create(NewExtractionJob::new(payload).with_priority(priority))
            .await
    }

    pub async fn create_match_products_job(
        &self,
        flyer_id: FlyerId,
        priority: i32,
    ) -> CoordinationResult<ExtractionJob> {
        let payload = JobPayload::from(MatchProductsPayload { flyer_id });
        self.create(NewExtractionJob::new(payload).with_priority(priority))
            .await
    }

    /// Lease the best eligible job to `worker_id`, or `None` if nothing qualifies.
    ///
    /// Never blocks waiting for work; pollers choose their own interval.
    #[instrument(skip(self), err)]
    pub async fn get_next_job(
        &self,
        job_types: &[JobType],
        worker_id: &str,
    ) -> CoordinationResult<Option<ExtractionJob>> {
        if job_types.is_empty() {
            return Err(CoordinationError::validation("at least one job type is required"));
        }
        if worker_id.trim().is_empty() {
            return Err(CoordinationError::validation("worker id is required"));
        }

        let job = self
            .store
            .get_next_job(job_types, worker_id, self.clock.now())
            .await
            .map_err(|e| e.into_coordination("get_next_job", format!("worker {worker_id}")))?;

        if let Some(job) = &job {
            debug!(job_id = %job.id, attempts = job.attempts, "job leased");
        }
        Ok(job)
    }

    #[instrument(skip(self), err)]
    pub async fn start_processing(
        &self,
        job_id: JobId,
        worker_id: &str,
    ) -> CoordinationResult<ExtractionJob> {
        if worker_id.trim().is_empty() {
            return Err(CoordinationError::validation("worker id is required"));
        }
        let now = self.clock.now();
        self.transition("start_processing", job_id, |job| job.start_processing(worker_id, now))
            .await
    }

    #[instrument(skip(self), err)]
    pub async fn complete_job(&self, job_id: JobId) -> CoordinationResult<ExtractionJob> {
        let now = self.clock.now();
        let job = self.transition("complete_job", job_id, |job| job.complete(now)).await?;
        info!(job_id = %job_id, attempts = job.attempts, "job completed");
        Ok(job)
    }

    #[instrument(skip(self), err)]
    pub async fn fail_job(&self, job_id: JobId, message: &str) -> CoordinationResult<ExtractionJob> {
        let now = self.clock.now();
        let job = self
            .transition("fail_job", job_id, |job| job.fail(message, now))
            .await?;
        info!(job_id = %job_id, error_count = job.error_count, error = message, "job failed");
        Ok(job)
    }

    #[instrument(skip(self), err)]
    pub async fn cancel_job(&self, job_id: JobId) -> CoordinationResult<ExtractionJob> {
        let now = self.clock.now();
        self.transition("cancel_job", job_id, |job| job.cancel(now)).await
    }

    /// Return a job to pending, eligible again after `delay_minutes`.
    #[instrument(skip(self), err)]
    pub async fn retry_job(
        &self,
        job_id: JobId,
        delay_minutes: i64,
    ) -> CoordinationResult<ExtractionJob> {
        if delay_minutes < 0 {
            return Err(CoordinationError::validation("retry delay must not be negative"));
        }
        let now = self.clock.now();
        let scheduled_for = ChronoDuration::try_minutes(delay_minutes)
            .and_then(|delay| now.checked_add_signed(delay))
            .ok_or_else(|| {
                CoordinationError::validation(format!("retry delay out of range: {delay_minutes} minutes"))
            })?;
        self.transition("retry_job", job_id, |job| job.retry(scheduled_for, now))
            .await
    }

    /// Delete completed and failed jobs that finished more than `older_than` ago.
    #[instrument(skip(self), err)]
    pub async fn cleanup_completed_jobs(
        &self,
        older_than: std::time::Duration,
    ) -> CoordinationResult<u64> {
        let cutoff = cutoff_before(self.clock.now(), older_than)?;

        let completed = self
            .store
            .delete_completed_jobs(cutoff)
            .await
            .map_err(|e| e.into_coordination("cleanup_completed_jobs", "completed jobs"))?;
        let failed = self
            .store
            .delete_failed_jobs(cutoff)
            .await
            .map_err(|e| e.into_coordination("cleanup_completed_jobs", "failed jobs"))?;

        info!(completed, failed, "finished jobs cleaned up");
        Ok(completed + failed)
    }

    /// Delete every job created longer ago than the configured expiry TTL.
    #[instrument(skip(self), err)]
    pub async fn cleanup_expired_jobs(&self) -> CoordinationResult<u64> {
        let cutoff = cutoff_before(self.clock.now(), self.config.expired_job_ttl)?;
        let deleted = self
            .store
            .delete_expired_jobs(cutoff)
            .await
            .map_err(|e| e.into_coordination("cleanup_expired_jobs", "expired jobs"))?;

        info!(deleted, "expired jobs cleaned up");
        Ok(deleted)
    }

    /// Reclaim leases whose worker went quiet.
    ///
    /// Processing jobs started more than `stalled_after` ago are failed with
    /// `LEASE_EXPIRED_MESSAGE`; those with attempts left go straight back to
    /// pending. Returns how many jobs were reclaimed.
    #[instrument(skip(self), err)]
    pub async fn recover_stalled_jobs(
        &self,
        stalled_after: std::time::Duration,
    ) -> CoordinationResult<u64> {
        let now = self.clock.now();
        let cutoff = cutoff_before(now, stalled_after)?;

        let processing = self
            .store
            .get_processing_jobs(None)
            .await
            .map_err(|e| e.into_coordination("recover_stalled_jobs", "processing jobs"))?;

        let mut recovered = 0;
        for mut job in processing {
            if job.started_at.is_none_or(|t| t >= cutoff) {
                continue;
            }

            job.fail(LEASE_EXPIRED_MESSAGE, now);
            if job.has_attempts_left() {
                job.retry(now, now);
            }
            self.store
                .update(&job)
                .await
                .map_err(|e| e.into_coordination("recover_stalled_jobs", format!("job {}", job.id)))?;

            info!(job_id = %job.id, status = %job.status, "stalled lease reclaimed");
            recovered += 1;
        }
        Ok(recovered)
    }

    pub async fn get_job(&self, job_id: JobId) -> CoordinationResult<ExtractionJob> {
        self.store
            .get_by_id(job_id)
            .await
            .map_err(|e| e.into_coordination("get_job", format!("job {job_id}")))?
            .ok_or_else(|| CoordinationError::not_found(format!("job {job_id}")))
    }

    pub async fn list_jobs(&self, filter: &JobFilter) -> CoordinationResult<Vec<ExtractionJob>> {
        self.store
            .get_all(filter)
            .await
            .map_err(|e| e.into_coordination("list_jobs", "jobs"))
    }

    pub async fn get_pending_jobs(
        &self,
        job_types: &[JobType],
        limit: usize,
    ) -> CoordinationResult<Vec<ExtractionJob>> {
        self.store
            .get_pending_jobs(job_types, limit)
            .await
            .map_err(|e| e.into_coordination("get_pending_jobs", "pending jobs"))
    }

    pub async fn get_processing_jobs(
        &self,
        worker_id: Option<&str>,
    ) -> CoordinationResult<Vec<ExtractionJob>> {
        self.store
            .get_processing_jobs(worker_id)
            .await
            .map_err(|e| e.into_coordination("get_processing_jobs", worker_id.unwrap_or("all workers")))
    }

    pub async fn stats(&self) -> CoordinationResult<JobStats> {
        self.store
            .stats()
            .await
            .map_err(|e| e.into_coordination("stats", "jobs"))
    }

    /// Load, mutate, store. Transitions are not guarded against the current status.
    async fn transition<F>(
        &self,
        operation: &str,
        job_id: JobId,
        apply: F,
    ) -> CoordinationResult<ExtractionJob>
    where
        F: FnOnce(&mut ExtractionJob),
    {
        let resource = format!("job {job_id}");
        let mut job = self
            .store
            .get_by_id(job_id)
            .await
            .map_err(|e| e.into_coordination(operation, resource.clone()))?
            .ok_or_else(|| JobStoreError::NotFound(job_id).into_coordination(operation, resource.clone()))?;

        let from = job.status;
        apply(&mut job);
        self.store
            .update(&job)
            .await
            .map_err(|e| e.into_coordination(operation, resource))?;

        debug!(job_id = %job_id, from = %from, to = %job.status, "job transitioned");
        Ok(job)
    }
}

/// `now - window`, rejecting windows that reach past the representable range.
fn cutoff_before(now: DateTime<Utc>, window: std::time::Duration) -> CoordinationResult<DateTime<Utc>> {
    ChronoDuration::from_std(window)
        .ok()
        .and_then(|window| now.checked_sub_signed(window))
        .ok_or_else(|| CoordinationError::validation(format!("duration out of range: {window:?}")))
}
