//! Worker runtime: poll the queue, serialize per resource, run the handler,
//! report the outcome.

use std::collections::HashMap;
use std::panic::AssertUnwindSafe;
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use futures::FutureExt;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use flyerq_core::{CoordinationError, CoordinationResult, JobId};

use crate::config::WorkerConfig;
use crate::locks::LockManager;

use super::queue::ExtractionJobQueue;
use super::store::JobStore;
use super::types::{ExtractionJob, JobResult, JobType};

/// Does the actual work for one job type.
///
/// An `Err` counts as a retryable failure, same as `JobResult::Failure`.
#[async_trait]
pub trait JobHandler: Send + Sync {
    async fn handle(&self, job: &ExtractionJob) -> anyhow::Result<JobResult>;
}

/// What the worker did with a leased job.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum JobOutcome {
    Completed,
    /// Failed with attempts left; back in line after the backoff.
    Retrying { delay_minutes: i64 },
    /// Failed for good.
    Failed,
    /// Handed back without running (busy resource, shutdown) or at the
    /// handler's request, without recording a failure.
    Deferred { delay_minutes: i64 },
}

/// Worker runtime statistics.
#[derive(Debug, Clone, Default, serde::Serialize)]
pub struct WorkerStats {
    pub jobs_processed: u64,
    pub jobs_succeeded: u64,
    pub jobs_failed: u64,
    pub jobs_retried: u64,
    pub jobs_deferred: u64,
    pub poll_errors: u64,
    pub uptime_secs: u64,
}

impl WorkerStats {
    fn record(&mut self, outcome: &JobOutcome) {
        self.jobs_processed += 1;
        match outcome {
            JobOutcome::Completed => self.jobs_succeeded += 1,
            JobOutcome::Retrying { .. } => self.jobs_retried += 1,
            JobOutcome::Failed => self.jobs_failed += 1,
            JobOutcome::Deferred { .. } => self.jobs_deferred += 1,
        }
    }
}

type SharedStats = Arc<Mutex<WorkerStats>>;

fn with_stats(stats: &SharedStats, f: impl FnOnce(&mut WorkerStats)) {
    let mut guard = stats.lock().unwrap_or_else(|poisoned| poisoned.into_inner());
    f(&mut guard);
}

/// Handle to control a running worker.
#[derive(Debug)]
pub struct WorkerHandle {
    cancel: CancellationToken,
    join: JoinHandle<()>,
    stats: SharedStats,
    started: Instant,
}

impl WorkerHandle {
    /// Stop polling and wait for the in-flight job to be reported.
    pub async fn shutdown(self) {
        self.cancel.cancel();
        if let Err(err) = self.join.await {
            warn!(error = %err, "worker task ended abnormally");
        }
    }

    /// Token that stops the worker when cancelled.
    pub fn cancellation_token(&self) -> CancellationToken {
        self.cancel.clone()
    }

    pub fn is_running(&self) -> bool {
        !self.join.is_finished()
    }

    pub fn stats(&self) -> WorkerStats {
        let mut stats = self
            .stats
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .clone();
        stats.uptime_secs = self.started.elapsed().as_secs();
        stats
    }
}

/// Polling worker.
///
/// Leases jobs for its configured types, optionally holds a renewed lock on
/// the job's resource key while the handler runs, and reports completion,
/// failure or retry back to the queue.
pub struct Worker<S: JobStore> {
    queue: Arc<ExtractionJobQueue<S>>,
    locks: Option<LockManager>,
    handlers: HashMap<JobType, Arc<dyn JobHandler>>,
    config: WorkerConfig,
}

impl<S: JobStore + 'static> Worker<S> {
    pub fn new(queue: Arc<ExtractionJobQueue<S>>, config: WorkerConfig) -> Self {
        Self {
            queue,
            locks: None,
            handlers: HashMap::new(),
            config,
        }
    }

    /// Serialize jobs on the same resource through `locks`.
    pub fn with_locks(mut self, locks: LockManager) -> Self {
        self.locks = Some(locks);
        self
    }

    pub fn register_handler(&mut self, job_type: JobType, handler: impl JobHandler + 'static) {
        self.handlers.insert(job_type, Arc::new(handler));
    }

    pub fn worker_id(&self) -> &str {
        &self.config.worker_id
    }

    /// Spawn the poll loop on the current tokio runtime.
    pub fn spawn(self) -> WorkerHandle {
        let cancel = CancellationToken::new();
        let stats = SharedStats::default();

        let worker = Arc::new(self);
        let join = tokio::spawn({
            let cancel = cancel.clone();
            let stats = stats.clone();
            async move { worker.run(cancel, stats).await }
        });

        WorkerHandle {
            cancel,
            join,
            stats,
            started: Instant::now(),
        }
    }

    async fn run(&self, cancel: CancellationToken, stats: SharedStats) {
        info!(worker_id = %self.config.worker_id, job_types = ?self.config.job_types, "worker started");

        while !cancel.is_cancelled() {
            match self.run_once(&cancel).await {
                // More work may be waiting; poll again straight away.
                Ok(Some(outcome)) => {
                    with_stats(&stats, |s| s.record(&outcome));
                    continue;
                }
                Ok(None) => {}
                Err(err) => {
                    warn!(worker_id = %self.config.worker_id, error = %err, "worker poll failed");
                    with_stats(&stats, |s| s.poll_errors += 1);
                }
            }

            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = tokio::time::sleep(self.config.poll_interval) => {}
            }
        }

        info!(worker_id = %self.config.worker_id, "worker stopped");
    }

    /// Lease and process at most one job. `None` if nothing was eligible.
    pub async fn run_once(&self, cancel: &CancellationToken) -> CoordinationResult<Option<JobOutcome>> {
        let Some(job) = self
            .queue
            .get_next_job(&self.config.job_types, &self.config.worker_id)
            .await?
        else {
            return Ok(None);
        };

        let outcome = self.process(&job, cancel).await?;
        debug!(job_id = %job.id, outcome = ?outcome, "job processed");
        Ok(Some(outcome))
    }

    async fn process(&self, job: &ExtractionJob, cancel: &CancellationToken) -> CoordinationResult<JobOutcome> {
        let Some(handler) = self.handlers.get(&job.job_type).cloned() else {
            let message = format!("no handler registered for {}", job.job_type);
            self.queue.fail_job(job.id, &message).await?;
            return Ok(JobOutcome::Failed);
        };

        let result = match &self.locks {
            Some(locks) if self.config.lock_resources => {
                locks
                    .with_renewable_lock_timeout(
                        &job.payload.resource_key(),
                        self.config.lock_ttl,
                        self.config.lock_wait,
                        cancel,
                        || run_handler(handler.as_ref(), job),
                    )
                    .await
            }
            _ => Ok(run_handler(handler.as_ref(), job).await),
        };

        match result {
            Ok(Ok(JobResult::Success)) => {
                self.queue.complete_job(job.id).await?;
                Ok(JobOutcome::Completed)
            }
            Ok(Ok(JobResult::Failure(message))) => self.report_failure(job, &message).await,
            Ok(Err(err)) => self.report_failure(job, &format!("{err:#}")).await,
            Ok(Ok(JobResult::Fatal(message))) => {
                self.queue.fail_job(job.id, &message).await?;
                Ok(JobOutcome::Failed)
            }
            Ok(Ok(JobResult::RetryAfter(delay))) => {
                let delay_minutes = i64::try_from(delay.as_secs().div_ceil(60)).unwrap_or(i64::MAX);
                match self.defer(job.id, delay_minutes).await {
                    Err(err @ CoordinationError::Validation(_)) => {
                        warn!(job_id = %job.id, ?delay, error = %err, "handler asked for an unusable retry delay");
                        self.report_failure(job, &format!("invalid retry delay {delay:?}: {err}"))
                            .await
                    }
                    other => other,
                }
            }
            Err(err) if err.is_contention() => {
                debug!(job_id = %job.id, error = %err, "resource busy, handing job back");
                self.defer(job.id, self.config.contention_delay_minutes).await
            }
            Err(CoordinationError::Cancelled(_)) => self.defer(job.id, 0).await,
            Err(err) => self.report_failure(job, &err.to_string()).await,
        }
    }

    async fn report_failure(&self, job: &ExtractionJob, message: &str) -> CoordinationResult<JobOutcome> {
        self.queue.fail_job(job.id, message).await?;

        if !job.has_attempts_left() {
            info!(job_id = %job.id, attempts = job.attempts, "job out of attempts");
            return Ok(JobOutcome::Failed);
        }

        let delay_minutes = self.config.retry_policy.delay_minutes_for_attempt(job.attempts);
        match self.queue.retry_job(job.id, delay_minutes).await {
            Ok(_) => Ok(JobOutcome::Retrying { delay_minutes }),
            // The job is already recorded as failed; leave it that way.
            Err(err @ CoordinationError::Validation(_)) => {
                warn!(job_id = %job.id, delay_minutes, error = %err, "backoff out of range, job stays failed");
                Ok(JobOutcome::Failed)
            }
            Err(err) => Err(err),
        }
    }

    async fn defer(&self, job_id: JobId, delay_minutes: i64) -> CoordinationResult<JobOutcome> {
        self.queue.retry_job(job_id, delay_minutes).await?;
        Ok(JobOutcome::Deferred { delay_minutes })
    }
}

/// A panicking handler is reported as a failure instead of killing the worker.
async fn run_handler(handler: &dyn JobHandler, job: &ExtractionJob) -> anyhow::Result<JobResult> {
    match AssertUnwindSafe(handler.handle(job)).catch_unwind().await {
        Ok(result) => result,
        Err(panic) => {
            let detail = panic
                .downcast_ref::<&str>()
                .map(|s| s.to_string())
                .or_else(|| panic.downcast_ref::<String>().cloned())
                .unwrap_or_else(|| "unknown panic".to_string());
            Err(anyhow::anyhow!("handler panicked: {detail}"))
        }
    }
}
