//! Job listing filters.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::types::{ExtractionJob, JobStatus, JobType};

/// Pagination parameters for job listings.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Pagination {
    /// Maximum number of jobs to return.
    pub limit: u32,
    /// Offset for pagination (0-based).
    pub offset: u32,
}

impl Default for Pagination {
    fn default() -> Self {
        Self {
            limit: 50,
            offset: 0,
        }
    }
}

impl Pagination {
    pub const MAX_LIMIT: u32 = 1000;

    pub fn new(limit: Option<u32>, offset: Option<u32>) -> Self {
        Self {
            limit: limit.unwrap_or(50).min(Self::MAX_LIMIT),
            offset: offset.unwrap_or(0),
        }
    }
}

/// Sort order for listings.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobOrder {
    /// Same order `GetNextJob` dispatches in.
    #[default]
    Dispatch,
    CreatedAsc,
    CreatedDesc,
    ScheduledAsc,
}

impl JobOrder {
    /// `ORDER BY` clause for SQL-backed stores.
    pub fn sql(&self) -> &'static str {
        match self {
            JobOrder::Dispatch => "priority DESC, scheduled_for ASC, id ASC",
            JobOrder::CreatedAsc => "created_at ASC, id ASC",
            JobOrder::CreatedDesc => "created_at DESC, id DESC",
            JobOrder::ScheduledAsc => "scheduled_for ASC, id ASC",
        }
    }

    /// In-memory equivalent of `sql()`.
    pub fn sort(&self, jobs: &mut [ExtractionJob]) {
        match self {
            JobOrder::Dispatch => jobs.sort_by_key(|j| j.dispatch_key()),
            JobOrder::CreatedAsc => jobs.sort_by_key(|j| (j.created_at, j.id)),
            JobOrder::CreatedDesc => {
                jobs.sort_by(|a, b| (b.created_at, b.id).cmp(&(a.created_at, a.id)))
            }
            JobOrder::ScheduledAsc => jobs.sort_by_key(|j| (j.scheduled_for, j.id)),
        }
    }
}

/// Filter criteria for job listings. Empty lists and `None` match everything.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct JobFilter {
    pub job_types: Vec<JobType>,
    pub statuses: Vec<JobStatus>,
    pub worker_ids: Vec<String>,
    pub priority: Option<i32>,
    pub scheduled_before: Option<DateTime<Utc>>,
    pub scheduled_after: Option<DateTime<Utc>>,
    pub created_before: Option<DateTime<Utc>>,
    pub created_after: Option<DateTime<Utc>>,
    pub pagination: Pagination,
    pub order: JobOrder,
}

impl JobFilter {
    pub fn with_job_types(mut self, job_types: impl IntoIterator<Item = JobType>) -> Self {
        self.job_types = job_types.into_iter().collect();
        self
    }

    pub fn with_status(mut self, status: JobStatus) -> Self {
        self.statuses.push(status);
        self
    }

    pub fn with_worker(mut self, worker_id: impl Into<String>) -> Self {
        self.worker_ids.push(worker_id.into());
        self
    }

    pub fn with_pagination(mut self, pagination: Pagination) -> Self {
        self.pagination = pagination;
        self
    }

    pub fn ordered_by(mut self, order: JobOrder) -> Self {
        self.order = order;
        self
    }

    /// Whether `job` satisfies every criterion (pagination aside).
    pub fn matches(&self, job: &ExtractionJob) -> bool {
        (self.job_types.is_empty() || self.job_types.contains(&job.job_type))
            && (self.statuses.is_empty() || self.statuses.contains(&job.status))
            && (self.worker_ids.is_empty()
                || job
                    .worker_id
                    .as_ref()
                    .is_some_and(|w| self.worker_ids.contains(w)))
            && self.priority.is_none_or(|p| job.priority == p)
            && self.scheduled_before.is_none_or(|t| job.scheduled_for < t)
            && self.scheduled_after.is_none_or(|t| job.scheduled_for > t)
            && self.created_before.is_none_or(|t| job.created_at < t)
            && self.created_after.is_none_or(|t| job.created_at > t)
    }
}
