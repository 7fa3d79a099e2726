//! Extraction job model, lifecycle transitions and caller-side retry policy.

use core::str::FromStr;
use std::cmp::Reverse;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use flyerq_core::{CoordinationError, JobId};

use super::payload::JobPayload;

/// Lowest accepted priority.
pub const MIN_PRIORITY: i32 = 1;
/// Highest accepted priority; larger values are clamped down to it.
pub const MAX_PRIORITY: i32 = 10;
/// Priority assigned when the caller passes a non-positive value.
pub const DEFAULT_PRIORITY: i32 = 5;
/// Attempts allowed when the caller does not say otherwise.
pub const DEFAULT_MAX_ATTEMPTS: u32 = 3;

/// Normalize a caller-supplied priority into `[1, 10]`.
///
/// Non-positive values mean "unset" and become the default, values above the
/// ceiling are clamped.
pub fn normalize_priority(priority: i32) -> i32 {
    if priority <= 0 {
        DEFAULT_PRIORITY
    } else if priority > MAX_PRIORITY {
        MAX_PRIORITY
    } else {
        priority
    }
}

/// Kind of extraction work, used for routing jobs to workers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum JobType {
    /// Download the current flyer of a store.
    ScrapeFlyer,
    /// Pull product/price data out of one flyer page.
    ExtractPage,
    /// Match the extracted items of a flyer against the product catalogue.
    MatchProducts,
}

impl JobType {
    pub const ALL: [JobType; 3] = [JobType::ScrapeFlyer, JobType::ExtractPage, JobType::MatchProducts];

    pub fn as_str(&self) -> &'static str {
        match self {
            JobType::ScrapeFlyer => "scrape-flyer",
            JobType::ExtractPage => "extract-page",
            JobType::MatchProducts => "match-products",
        }
    }
}

impl std::fmt::Display for JobType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for JobType {
    type Err = CoordinationError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim() {
            "" => Err(CoordinationError::validation("job type is required")),
            "scrape-flyer" => Ok(JobType::ScrapeFlyer),
            "extract-page" => Ok(JobType::ExtractPage),
            "match-products" => Ok(JobType::MatchProducts),
            other => Err(CoordinationError::validation(format!("unknown job type: {other}"))),
        }
    }
}

/// Job lifecycle status.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobStatus {
    /// Waiting for a worker (possibly not yet eligible, see `scheduled_for`)
    Pending,
    /// Leased by a worker
    Processing,
    Completed,
    /// Failed; may be moved back to pending by an explicit retry
    Failed,
    Cancelled,
}

impl JobStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            JobStatus::Pending => "pending",
            JobStatus::Processing => "processing",
            JobStatus::Completed => "completed",
            JobStatus::Failed => "failed",
            JobStatus::Cancelled => "cancelled",
        }
    }

    /// Completed and cancelled jobs only leave the table through cleanup.
    pub fn is_terminal(&self) -> bool {
        matches!(self, JobStatus::Completed | JobStatus::Cancelled)
    }

    /// Completed or failed: the statuses swept by retention cleanup.
    pub fn is_finished(&self) -> bool {
        matches!(self, JobStatus::Completed | JobStatus::Failed)
    }
}

impl std::fmt::Display for JobStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for JobStatus {
    type Err = CoordinationError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "pending" => Ok(JobStatus::Pending),
            "processing" => Ok(JobStatus::Processing),
            "completed" => Ok(JobStatus::Completed),
            "failed" => Ok(JobStatus::Failed),
            "cancelled" => Ok(JobStatus::Cancelled),
            other => Err(CoordinationError::validation(format!("unknown job status: {other}"))),
        }
    }
}

/// Input for `ExtractionJobQueue::create`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NewExtractionJob {
    pub job_type: JobType,
    pub payload: JobPayload,
    /// Raw priority; normalized on create.
    pub priority: i32,
    /// `None` or `Some(0)` falls back to the queue default.
    pub max_attempts: Option<u32>,
    /// `None` means "eligible immediately".
    pub scheduled_for: Option<DateTime<Utc>>,
}

impl NewExtractionJob {
    /// Build a job whose type follows the payload tag.
    pub fn new(payload: JobPayload) -> Self {
        Self {
            job_type: payload.job_type(),
            payload,
            priority: 0,
            max_attempts: None,
            scheduled_for: None,
        }
    }

    pub fn with_priority(mut self, priority: i32) -> Self {
        self.priority = priority;
        self
    }

    pub fn with_max_attempts(mut self, max_attempts: u32) -> Self {
        self.max_attempts = Some(max_attempts);
        self
    }

    pub fn scheduled_for(mut self, at: DateTime<Utc>) -> Self {
        self.scheduled_for = Some(at);
        self
    }
}

/// A persisted extraction job.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExtractionJob {
    pub id: JobId,
    pub job_type: JobType,
    pub payload: JobPayload,
    /// Normalized into `[1, 10]`; higher runs first
    pub priority: i32,
    pub status: JobStatus,
    /// Number of times the job was leased
    pub attempts: u32,
    pub max_attempts: u32,
    /// Lease owner, present only while processing
    pub worker_id: Option<String>,
    /// Earliest time the job may be dispatched
    pub scheduled_for: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
    pub error_message: Option<String>,
    pub error_count: u32,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl ExtractionJob {
    /// Materialize a validated `NewExtractionJob` as a pending job.
    pub fn pending(new: NewExtractionJob, max_attempts_default: u32, now: DateTime<Utc>) -> Self {
        let max_attempts = match new.max_attempts {
            Some(n) if n > 0 => n,
            _ => max_attempts_default,
        };
        Self {
            id: JobId::new(),
            job_type: new.job_type,
            payload: new.payload,
            priority: normalize_priority(new.priority),
            status: JobStatus::Pending,
            attempts: 0,
            max_attempts,
            worker_id: None,
            scheduled_for: new.scheduled_for.unwrap_or(now),
            started_at: None,
            completed_at: None,
            error_message: None,
            error_count: 0,
            created_at: now,
            updated_at: now,
        }
    }

    /// Whether `GetNextJob` may hand this job out right now.
    pub fn is_eligible(&self, job_types: &[JobType], now: DateTime<Utc>) -> bool {
        self.status == JobStatus::Pending
            && job_types.contains(&self.job_type)
            && self.scheduled_for <= now
    }

    /// Dispatch order: priority descending, then schedule ascending, then lowest id.
    pub fn dispatch_key(&self) -> (Reverse<i32>, DateTime<Utc>, JobId) {
        (Reverse(self.priority), self.scheduled_for, self.id)
    }

    /// Whether another lease is allowed after the current one fails.
    pub fn has_attempts_left(&self) -> bool {
        self.attempts < self.max_attempts
    }

    /// Lease the job to `worker_id`. The only place `attempts` grows.
    pub fn start_processing(&mut self, worker_id: impl Into<String>, now: DateTime<Utc>) {
        self.status = JobStatus::Processing;
        self.worker_id = Some(worker_id.into());
        self.started_at = Some(now);
        self.attempts += 1;
        self.updated_at = now;
    }

    pub fn complete(&mut self, now: DateTime<Utc>) {
        self.status = JobStatus::Completed;
        self.worker_id = None;
        self.completed_at = Some(now);
        self.updated_at = now;
    }

    /// Record a failure. The only place `error_count` grows.
    pub fn fail(&mut self, message: impl Into<String>, now: DateTime<Utc>) {
        self.status = JobStatus::Failed;
        self.worker_id = None;
        self.error_message = Some(message.into());
        self.error_count += 1;
        self.completed_at = Some(now);
        self.updated_at = now;
    }

    pub fn cancel(&mut self, now: DateTime<Utc>) {
        self.status = JobStatus::Cancelled;
        self.worker_id = None;
        self.completed_at = Some(now);
        self.updated_at = now;
    }

    /// Put the job back in line, eligible again at `scheduled_for`.
    pub fn retry(&mut self, scheduled_for: DateTime<Utc>, now: DateTime<Utc>) {
        self.status = JobStatus::Pending;
        self.worker_id = None;
        self.started_at = None;
        self.completed_at = None;
        self.error_message = None;
        self.scheduled_for = scheduled_for;
        self.updated_at = now;
    }
}

/// Per-status job counts.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct JobStats {
    pub pending: u64,
    pub processing: u64,
    pub completed: u64,
    pub failed: u64,
    pub cancelled: u64,
}

impl JobStats {
    pub fn record(&mut self, status: JobStatus) {
        self.add(status, 1);
    }

    pub fn add(&mut self, status: JobStatus, count: u64) {
        match status {
            JobStatus::Pending => self.pending += count,
            JobStatus::Processing => self.processing += count,
            JobStatus::Completed => self.completed += count,
            JobStatus::Failed => self.failed += count,
            JobStatus::Cancelled => self.cancelled += count,
        }
    }

    pub fn total(&self) -> u64 {
        self.pending + self.processing + self.completed + self.failed + self.cancelled
    }
}

/// Backoff strategy for retries.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BackoffStrategy {
    /// Fixed delay between retries
    Fixed,
    /// Exponential backoff: base * 2^(attempt-1)
    #[default]
    Exponential,
    /// Linear backoff: base * attempt
    Linear,
}

/// Caller-side retry policy.
///
/// The queue never computes backoff itself; workers use this to pick the delay
/// they pass to `RetryJob`. The attempt ceiling lives on the job (`max_attempts`).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RetryPolicy {
    /// Base delay between retries
    pub base_delay: Duration,
    /// Maximum delay cap
    pub max_delay: Duration,
    pub strategy: BackoffStrategy,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            base_delay: Duration::from_secs(60),
            max_delay: Duration::from_secs(60 * 60),
            strategy: BackoffStrategy::Exponential,
        }
    }
}

impl RetryPolicy {
    /// Create a policy with fixed delays.
    pub fn fixed(delay: Duration) -> Self {
        Self {
            base_delay: delay,
            max_delay: delay,
            strategy: BackoffStrategy::Fixed,
        }
    }

    /// Create a policy with exponential backoff.
    pub fn exponential(base_delay: Duration, max_delay: Duration) -> Self {
        Self {
            base_delay,
            max_delay,
            strategy: BackoffStrategy::Exponential,
        }
    }

    /// Calculate delay for a given attempt number (1-indexed).
    pub fn delay_for_attempt(&self, attempt: u32) -> Duration {
        if attempt == 0 {
            return Duration::ZERO;
        }

        let delay = match self.strategy {
            BackoffStrategy::Fixed => self.base_delay,
            BackoffStrategy::Exponential => {
                let factor = 2_u32.saturating_pow(attempt - 1);
                self.base_delay.saturating_mul(factor)
            }
            BackoffStrategy::Linear => self.base_delay.saturating_mul(attempt),
        };

        delay.min(self.max_delay)
    }

    /// Delay in whole minutes, rounded up, as `RetryJob` expects.
    pub fn delay_minutes_for_attempt(&self, attempt: u32) -> i64 {
        let secs = self.delay_for_attempt(attempt).as_secs();
        i64::try_from(secs.div_ceil(60)).unwrap_or(i64::MAX)
    }
}

/// Outcome reported by a job handler.
#[derive(Debug)]
pub enum JobResult {
    /// Job completed successfully
    Success,
    /// Job failed; retried with backoff while attempts remain
    Failure(String),
    /// Job failed and must not be retried
    Fatal(String),
    /// Put the job back after a caller-chosen delay without counting a failure
    RetryAfter(Duration),
}
