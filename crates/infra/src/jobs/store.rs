//! Job persistence contract and the in-memory implementation.

use std::collections::HashMap;
use std::sync::{Arc, RwLock, RwLockReadGuard, RwLockWriteGuard};

use async_trait::async_trait;
use chrono::{DateTime, Utc};

use flyerq_core::{CoordinationError, JobId};

use super::filter::{JobFilter, JobOrder};
use super::types::{ExtractionJob, JobStats, JobStatus, JobType};

/// Job store abstraction.
///
/// Every method is a single round-trip to the backing store. `get_next_job` is
/// the one operation that must be atomic: selecting the job and reserving it
/// happen in the same step, so concurrent callers never receive the same job.
#[async_trait]
pub trait JobStore: Send + Sync {
    async fn get_by_id(&self, id: JobId) -> Result<Option<ExtractionJob>, JobStoreError>;

    /// List jobs matching `filter`, ordered and paginated as it asks.
    async fn get_all(&self, filter: &JobFilter) -> Result<Vec<ExtractionJob>, JobStoreError>;

    async fn create(&self, job: &ExtractionJob) -> Result<(), JobStoreError>;

    /// Overwrite an existing job.
    async fn update(&self, job: &ExtractionJob) -> Result<(), JobStoreError>;

    /// Returns whether a job was deleted.
    async fn delete(&self, id: JobId) -> Result<bool, JobStoreError>;

    /// Atomically pick the best eligible pending job and lease it to `worker_id`.
    ///
    /// Eligible: pending, type in `job_types`, `scheduled_for <= now`. Best:
    /// highest priority, then earliest schedule, then lowest id. The returned job
    /// already carries the lease (see `ExtractionJob::start_processing`).
    async fn get_next_job(
        &self,
        job_types: &[JobType],
        worker_id: &str,
        now: DateTime<Utc>,
    ) -> Result<Option<ExtractionJob>, JobStoreError>;

    /// Pending jobs of the given types in dispatch order, eligible or not.
    async fn get_pending_jobs(
        &self,
        job_types: &[JobType],
        limit: usize,
    ) -> Result<Vec<ExtractionJob>, JobStoreError>;

    /// Processing jobs, optionally only those leased by `worker_id`.
    async fn get_processing_jobs(
        &self,
        worker_id: Option<&str>,
    ) -> Result<Vec<ExtractionJob>, JobStoreError>;

    /// Delete completed jobs whose `completed_at` is before `before`.
    async fn delete_completed_jobs(&self, before: DateTime<Utc>) -> Result<u64, JobStoreError>;

    /// Delete failed jobs whose `completed_at` is before `before`.
    async fn delete_failed_jobs(&self, before: DateTime<Utc>) -> Result<u64, JobStoreError>;

    /// Delete every job created before `before`, whatever its status.
    async fn delete_expired_jobs(&self, before: DateTime<Utc>) -> Result<u64, JobStoreError>;

    async fn stats(&self) -> Result<JobStats, JobStoreError>;
}

/// Job store error.
#[derive(Debug, Clone, thiserror::Error)]
pub enum JobStoreError {
    #[error("job not found: {0}")]
    NotFound(JobId),
    #[error("job already exists: {0}")]
    AlreadyExists(JobId),
    #[error("storage error: {0}")]
    Storage(String),
    #[error("failed to decode job row: {0}")]
    Decode(String),
}

impl JobStoreError {
    /// Lift into the coordination taxonomy, recording what was being attempted.
    pub fn into_coordination(self, operation: &str, resource: impl Into<String>) -> CoordinationError {
        match self {
            JobStoreError::NotFound(id) => CoordinationError::not_found(format!("job {id}")),
            other => CoordinationError::internal(operation, resource, other.to_string()),
        }
    }
}

/// In-memory job store for tests/dev.
///
/// A single write lock around the map makes `get_next_job` atomic.
#[derive(Debug, Default)]
pub struct InMemoryJobStore {
    jobs: RwLock<HashMap<JobId, ExtractionJob>>,
}

impl InMemoryJobStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn arc() -> Arc<Self> {
        Arc::new(Self::new())
    }

    fn read(&self) -> Result<RwLockReadGuard<'_, HashMap<JobId, ExtractionJob>>, JobStoreError> {
        self.jobs
            .read()
            .map_err(|_| JobStoreError::Storage("job map lock poisoned".to_string()))
    }

    fn write(&self) -> Result<RwLockWriteGuard<'_, HashMap<JobId, ExtractionJob>>, JobStoreError> {
        self.jobs
            .write()
            .map_err(|_| JobStoreError::Storage("job map lock poisoned".to_string()))
    }

    fn delete_where(&self, pred: impl Fn(&ExtractionJob) -> bool) -> Result<u64, JobStoreError> {
        let mut jobs = self.write()?;
        let before = jobs.len();
        jobs.retain(|_, j| !pred(j));
        Ok((before - jobs.len()) as u64)
    }
}

#[async_trait]
impl JobStore for InMemoryJobStore {
    async fn get_by_id(&self, id: JobId) -> Result<Option<ExtractionJob>, JobStoreError> {
        Ok(self.read()?.get(&id).cloned())
    }

    async fn get_all(&self, filter: &JobFilter) -> Result<Vec<ExtractionJob>, JobStoreError> {
        let jobs = self.read()?;
        let mut result: Vec<_> = jobs.values().filter(|j| filter.matches(j)).cloned().collect();
        drop(jobs);

        filter.order.sort(&mut result);
        Ok(result
            .into_iter()
            .skip(filter.pagination.offset as usize)
            .take(filter.pagination.limit as usize)
            .collect())
    }

    async fn create(&self, job: &ExtractionJob) -> Result<(), JobStoreError> {
        let mut jobs = self.write()?;
        if jobs.contains_key(&job.id) {
            return Err(JobStoreError::AlreadyExists(job.id));
        }
        jobs.insert(job.id, job.clone());
        Ok(())
    }

    async fn update(&self, job: &ExtractionJob) -> Result<(), JobStoreError> {
        let mut jobs = self.write()?;
        match jobs.get_mut(&job.id) {
            Some(existing) => {
                *existing = job.clone();
                Ok(())
            }
            None => Err(JobStoreError::NotFound(job.id)),
        }
    }

    async fn delete(&self, id: JobId) -> Result<bool, JobStoreError> {
        Ok(self.write()?.remove(&id).is_some())
    }

    async fn get_next_job(
        &self,
        job_types: &[JobType],
        worker_id: &str,
        now: DateTime<Utc>,
    ) -> Result<Option<ExtractionJob>, JobStoreError> {
        let mut jobs = self.write()?;

        let next = jobs
            .values()
            .filter(|j| j.is_eligible(job_types, now))
            .min_by_key(|j| j.dispatch_key())
            .map(|j| j.id);

        Ok(next.and_then(|id| {
            jobs.get_mut(&id).map(|job| {
                job.start_processing(worker_id, now);
                job.clone()
            })
        }))
    }

    async fn get_pending_jobs(
        &self,
        job_types: &[JobType],
        limit: usize,
    ) -> Result<Vec<ExtractionJob>, JobStoreError> {
        let filter = JobFilter::default()
            .with_job_types(job_types.iter().copied())
            .with_status(JobStatus::Pending);
        let jobs = self.read()?;
        let mut result: Vec<_> = jobs.values().filter(|j| filter.matches(j)).cloned().collect();
        drop(jobs);

        JobOrder::Dispatch.sort(&mut result);
        result.truncate(limit);
        Ok(result)
    }

    async fn get_processing_jobs(
        &self,
        worker_id: Option<&str>,
    ) -> Result<Vec<ExtractionJob>, JobStoreError> {
        let jobs = self.read()?;
        let mut result: Vec<_> = jobs
            .values()
            .filter(|j| {
                j.status == JobStatus::Processing
                    && worker_id.is_none_or(|w| j.worker_id.as_deref() == Some(w))
            })
            .cloned()
            .collect();
        drop(jobs);

        result.sort_by_key(|j| (j.started_at, j.id));
        Ok(result)
    }

    async fn delete_completed_jobs(&self, before: DateTime<Utc>) -> Result<u64, JobStoreError> {
        self.delete_where(|j| {
            j.status == JobStatus::Completed && j.completed_at.is_some_and(|t| t < before)
        })
    }

    async fn delete_failed_jobs(&self, before: DateTime<Utc>) -> Result<u64, JobStoreError> {
        self.delete_where(|j| {
            j.status == JobStatus::Failed && j.completed_at.is_some_and(|t| t < before)
        })
    }

    async fn delete_expired_jobs(&self, before: DateTime<Utc>) -> Result<u64, JobStoreError> {
        self.delete_where(|j| j.created_at < before)
    }

    async fn stats(&self) -> Result<JobStats, JobStoreError> {
        let jobs = self.read()?;
        let mut stats = JobStats::default();
        for job in jobs.values() {
            stats.record(job.status);
        }
        Ok(stats)
    }
}

#[async_trait]
impl<S: JobStore + ?Sized> JobStore for Arc<S> {
    async fn get_by_id(&self, id: JobId) -> Result<Option<ExtractionJob>, JobStoreError> {
        (**self).get_by_id(id).await
    }

    async fn get_all(&self, filter: &JobFilter) -> Result<Vec<ExtractionJob>, JobStoreError> {
        (**self).get_all(filter).await
    }

    async fn create(&self, job: &ExtractionJob) -> Result<(), JobStoreError> {
        (**self).create(job).await
    }

    async fn update(&self, job: &ExtractionJob) -> Result<(), JobStoreError> {
        (**self).update(job).await
    }

    async fn delete(&self, id: JobId) -> Result<bool, JobStoreError> {
        (**self).delete(id).await
    }

    async fn get_next_job(
        &self,
        job_types: &[JobType],
        worker_id: &str,
        now: DateTime<Utc>,
    ) -> Result<Option<ExtractionJob>, JobStoreError> {
        (**self).get_next_job(job_types, worker_id, now).await
    }

    async fn get_pending_jobs(
        &self,
        job_types: &[JobType],
        limit: usize,
    ) -> Result<Vec<ExtractionJob>, JobStoreError> {
        (**self).get_pending_jobs(job_types, limit).await
    }

    async fn get_processing_jobs(
        &self,
        worker_id: Option<&str>,
    ) -> Result<Vec<ExtractionJob>, JobStoreError> {
        (**self).get_processing_jobs(worker_id).await
    }

    async fn delete_completed_jobs(&self, before: DateTime<Utc>) -> Result<u64, JobStoreError> {
        (**self).delete_completed_jobs(before).await
    }

    async fn delete_failed_jobs(&self, before: DateTime<Utc>) -> Result<u64, JobStoreError> {
        (**self).delete_failed_jobs(before).await
    }

    async fn delete_expired_jobs(&self, before: DateTime<Utc>) -> Result<u64, JobStoreError> {
        (**self).delete_expired_jobs(before).await
    }

    async fn stats(&self) -> Result<JobStats, JobStoreError> {
        (**self).stats().await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;
    use flyerq_core::{PageId, StoreId};

    use crate::jobs::payload::{ExtractPagePayload, JobPayload, ScrapeFlyerPayload};
    use crate::jobs::types::NewExtractionJob;

    fn scrape_job(priority: i32, scheduled_for: DateTime<Utc>, now: DateTime<Utc>) -> ExtractionJob {
        let payload = JobPayload::from(ScrapeFlyerPayload { store_id: StoreId::new() });
        ExtractionJob::pending(
            NewExtractionJob::new(payload)
                .with_priority(priority)
                .scheduled_for(scheduled_for),
            3,
            now,
        )
    }

    #[tokio::test]
    async fn create_and_claim() {
        let store = InMemoryJobStore::new();
        let now = Utc::now();

        let job = scrape_job(5, now, now);
        store.create(&job).await.unwrap();

        let claimed = store
            .get_next_job(&[JobType::ScrapeFlyer], "w-1", now)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(claimed.id, job.id);
        assert_eq!(claimed.status, JobStatus::Processing);
        assert_eq!(claimed.attempts, 1);
        assert_eq!(claimed.worker_id.as_deref(), Some("w-1"));

        // Nothing left to claim
        assert!(store
            .get_next_job(&[JobType::ScrapeFlyer], "w-2", now)
            .await
            .unwrap()
            .is_none());
    }

    #[tokio::test]
    async fn duplicate_create_is_rejected() {
        let store = InMemoryJobStore::new();
        let now = Utc::now();
        let job = scrape_job(5, now, now);

        store.create(&job).await.unwrap();
        assert!(matches!(
            store.create(&job).await,
            Err(JobStoreError::AlreadyExists(id)) if id == job.id
        ));
    }

    #[tokio::test]
    async fn update_missing_job_fails() {
        let store = InMemoryJobStore::new();
        let now = Utc::now();
        let job = scrape_job(5, now, now);

        assert!(matches!(
            store.update(&job).await,
            Err(JobStoreError::NotFound(_))
        ));
    }

    #[tokio::test]
    async fn claim_prefers_priority_then_schedule() {
        let store = InMemoryJobStore::new();
        let now = Utc::now();

        let low = scrape_job(2, now - Duration::hours(1), now);
        let high_late = scrape_job(8, now - Duration::minutes(1), now);
        let high_early = scrape_job(8, now - Duration::minutes(30), now);
        for job in [&low, &high_late, &high_early] {
            store.create(job).await.unwrap();
        }

        let mut order = Vec::new();
        while let Some(job) = store
            .get_next_job(&[JobType::ScrapeFlyer], "w-1", now)
            .await
            .unwrap()
        {
            order.push(job.id);
        }
        assert_eq!(order, vec![high_early.id, high_late.id, low.id]);
    }

    #[tokio::test]
    async fn claim_skips_future_and_foreign_types() {
        let store = InMemoryJobStore::new();
        let now = Utc::now();

        let future = scrape_job(10, now + Duration::minutes(5), now);
        store.create(&future).await.unwrap();

        let page = ExtractionJob::pending(
            NewExtractionJob::new(JobPayload::from(ExtractPagePayload { page_id: PageId::new() })),
            3,
            now,
        );
        store.create(&page).await.unwrap();

        assert!(store
            .get_next_job(&[JobType::ScrapeFlyer], "w-1", now)
            .await
            .unwrap()
            .is_none());

        let claimed = store
            .get_next_job(&[JobType::ScrapeFlyer, JobType::ExtractPage], "w-1", now)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(claimed.id, page.id);
    }

    #[tokio::test]
    async fn get_all_paginates_in_requested_order() {
        let store = InMemoryJobStore::new();
        let now = Utc::now();

        let mut created = Vec::new();
        for i in 0..5 {
            let job = scrape_job(5, now, now + Duration::seconds(i));
            store.create(&job).await.unwrap();
            created.push(job.id);
        }

        let filter = JobFilter::default()
            .ordered_by(JobOrder::CreatedDesc)
            .with_pagination(crate::jobs::filter::Pagination::new(Some(2), Some(1)));
        let page: Vec<_> = store.get_all(&filter).await.unwrap().into_iter().map(|j| j.id).collect();
        assert_eq!(page, vec![created[3], created[2]]);
    }

    #[tokio::test]
    async fn processing_jobs_by_worker() {
        let store = InMemoryJobStore::new();
        let now = Utc::now();
        for _ in 0..3 {
            store.create(&scrape_job(5, now, now)).await.unwrap();
        }

        store.get_next_job(&[JobType::ScrapeFlyer], "w-1", now).await.unwrap();
        store.get_next_job(&[JobType::ScrapeFlyer], "w-2", now).await.unwrap();

        assert_eq!(store.get_processing_jobs(None).await.unwrap().len(), 2);
        let mine = store.get_processing_jobs(Some("w-1")).await.unwrap();
        assert_eq!(mine.len(), 1);
        assert_eq!(mine[0].worker_id.as_deref(), Some("w-1"));

        let pending = store.get_pending_jobs(&[JobType::ScrapeFlyer], 10).await.unwrap();
        assert_eq!(pending.len(), 1);
    }

    #[tokio::test]
    async fn stats_tracking() {
        let store = InMemoryJobStore::new();
        let now = Utc::now();

        for _ in 0..5 {
            store.create(&scrape_job(5, now, now)).await.unwrap();
        }

        let stats = store.stats().await.unwrap();
        assert_eq!(stats.pending, 5);

        store.get_next_job(&[JobType::ScrapeFlyer], "w-1", now).await.unwrap();
        store.get_next_job(&[JobType::ScrapeFlyer], "w-1", now).await.unwrap();

        let stats = store.stats().await.unwrap();
        assert_eq!(stats.pending, 3);
        assert_eq!(stats.processing, 2);
    }

    #[test]
    fn not_found_maps_to_not_found() {
        let id = JobId::new();
        let err = JobStoreError::NotFound(id).into_coordination("complete_job", id.to_string());
        assert!(matches!(err, CoordinationError::NotFound(_)));

        let err = JobStoreError::Storage("disk full".into()).into_coordination("complete_job", "job");
        assert!(matches!(err, CoordinationError::Internal { .. }));
    }
}
