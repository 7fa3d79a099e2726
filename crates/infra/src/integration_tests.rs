//! Integration tests for the worker coordination pipeline.
//!
//! Tests: Worker → ExtractionJobQueue → LockManager → JobHandler → ExtractionJobQueue
//!
//! Verifies:
//! - Jobs touching the same resource never run concurrently across workers
//! - A crashed worker's lease is reclaimed and finished by another worker
//! - A crashed lock holder's lock is reclaimed after its TTL
//! - Settings flow into the queue and lock manager

#[cfg(test)]
mod tests {
    use std::collections::HashMap;
    use std::sync::Arc;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    use async_trait::async_trait;
    use chrono::{Duration as ChronoDuration, Utc};
    use tokio_util::sync::CancellationToken;

    use flyerq_core::{CoordinationError, ManualClock, StoreId, SystemClock};
    use flyerq_observability::{LogFormat, TracingConfig};

    use crate::config::{LockConfig, QueueConfig, Settings, WorkerConfig};
    use crate::jobs::{
        ExtractionJob, ExtractionJobQueue, InMemoryJobStore, JobHandler, JobOutcome, JobResult,
        JobStatus, JobType, Worker,
    };
    use crate::locks::{InMemoryLockStore, LockManager};

    /// Tracks how many invocations overlap.
    #[derive(Default)]
    struct OverlapTracker {
        in_flight: AtomicUsize,
        max_in_flight: AtomicUsize,
        calls: AtomicUsize,
    }

    struct SlowScrape(Arc<OverlapTracker>);

    #[async_trait]
    impl JobHandler for SlowScrape {
        async fn handle(&self, _job: &ExtractionJob) -> anyhow::Result<JobResult> {
            let now = self.0.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
            self.0.max_in_flight.fetch_max(now, Ordering::SeqCst);
            self.0.calls.fetch_add(1, Ordering::SeqCst);

            tokio::time::sleep(Duration::from_millis(20)).await;

            self.0.in_flight.fetch_sub(1, Ordering::SeqCst);
            Ok(JobResult::Success)
        }
    }

    struct AlwaysOk;

    #[async_trait]
    impl JobHandler for AlwaysOk {
        async fn handle(&self, _job: &ExtractionJob) -> anyhow::Result<JobResult> {
            Ok(JobResult::Success)
        }
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn same_resource_jobs_are_serialized_across_workers() {
        flyerq_observability::init_with(&TracingConfig {
            default_filter: "flyerq_infra=debug".to_string(),
            format: LogFormat::Pretty,
            ..TracingConfig::default()
        });

        let queue = Arc::new(ExtractionJobQueue::new(
            InMemoryJobStore::arc(),
            Arc::new(SystemClock),
            QueueConfig::default(),
        ));
        let locks = LockManager::new(InMemoryLockStore::arc(), LockConfig::default());
        let tracker = Arc::new(OverlapTracker::default());

        let store_id = StoreId::new();
        for _ in 0..4 {
            queue.create_scrape_flyer_job(store_id, 5).await.unwrap();
        }

        let handles: Vec<_> = ["w-a", "w-b"]
            .into_iter()
            .map(|id| {
                let config = WorkerConfig {
                    contention_delay_minutes: 0,
                    ..WorkerConfig::default()
                }
                .with_worker_id(id)
                .with_job_types([JobType::ScrapeFlyer])
                .with_poll_interval(Duration::from_millis(5));

                let mut worker = Worker::new(queue.clone(), config).with_locks(locks.clone());
                worker.register_handler(JobType::ScrapeFlyer, SlowScrape(tracker.clone()));
                worker.spawn()
            })
            .collect();

        for _ in 0..500 {
            if queue.stats().await.unwrap().completed == 4 {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }

        for handle in handles {
            handle.shutdown().await;
        }

        assert_eq!(queue.stats().await.unwrap().completed, 4);
        assert_eq!(tracker.calls.load(Ordering::SeqCst), 4);
        assert_eq!(tracker.max_in_flight.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn crashed_worker_lease_is_finished_elsewhere() {
        let clock = Arc::new(ManualClock::new(Utc::now()));
        let queue = Arc::new(ExtractionJobQueue::new(
            InMemoryJobStore::arc(),
            clock.clone(),
            QueueConfig::default(),
        ));

        let job = queue.create_scrape_flyer_job(StoreId::new(), 5).await.unwrap();

        // Leased, then the worker disappears without reporting
        let leased = queue
            .get_next_job(&[JobType::ScrapeFlyer], "w-crashed")
            .await
            .unwrap()
            .unwrap();
        assert_eq!(leased.id, job.id);

        let mut survivor = Worker::new(queue.clone(), WorkerConfig::default().with_worker_id("w-survivor"));
        survivor.register_handler(JobType::ScrapeFlyer, AlwaysOk);
        assert_eq!(survivor.run_once(&CancellationToken::new()).await.unwrap(), None);

        clock.advance(ChronoDuration::minutes(20));
        let recovered = queue.recover_stalled_jobs(Duration::from_secs(600)).await.unwrap();
        assert_eq!(recovered, 1);

        assert_eq!(
            survivor.run_once(&CancellationToken::new()).await.unwrap(),
            Some(JobOutcome::Completed)
        );

        let job = queue.get_job(job.id).await.unwrap();
        assert_eq!(job.status, JobStatus::Completed);
        assert_eq!(job.attempts, 2);
        assert_eq!(job.error_count, 1);
        assert!(job.worker_id.is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn crashed_lock_holder_is_reclaimed_after_ttl() {
        let store = InMemoryLockStore::arc();
        let crashed = LockManager::new(store.clone(), LockConfig::default());
        let survivor = LockManager::new(store.clone(), LockConfig::default());

        let lock = crashed.acquire_lock("page:42", Duration::from_secs(2)).await.unwrap();
        // Handle dropped without release, as when the process dies
        drop(lock);

        let err = survivor.acquire_lock("page:42", Duration::from_secs(2)).await.unwrap_err();
        assert!(matches!(err, CoordinationError::Conflict(_)));

        let mut lock = survivor
            .try_acquire_lock(
                "page:42",
                Duration::from_secs(2),
                Duration::from_secs(5),
                &CancellationToken::new(),
            )
            .await
            .unwrap();
        assert!(lock.is_held().await.unwrap());
        lock.release().await.unwrap();
    }

    #[tokio::test]
    async fn settings_configure_components() {
        let env: HashMap<&str, &str> = HashMap::from([
            ("FLYERQ_LOCK_PREFIX", "grocery:"),
            ("FLYERQ_DEFAULT_MAX_ATTEMPTS", "5"),
            ("FLYERQ_JOB_TYPES", "extract-page"),
        ]);
        let settings = Settings::from_lookup(|key| env.get(key).map(|v| v.to_string())).unwrap();

        let queue = ExtractionJobQueue::new(InMemoryJobStore::arc(), Arc::new(SystemClock), settings.queue);
        let job = queue.create_extract_page_job(flyerq_core::PageId::new(), 5).await.unwrap();
        assert_eq!(job.max_attempts, 5);

        let locks = LockManager::new(InMemoryLockStore::arc(), settings.lock);
        let lock = locks.acquire_lock(&job.payload.resource_key(), Duration::from_secs(1)).await.unwrap();
        assert_eq!(lock.key(), format!("grocery:{}", job.payload.resource_key()));
        assert!(lock.key().starts_with("grocery:page:"));

        assert_eq!(settings.worker.job_types, vec![JobType::ExtractPage]);
    }
}
