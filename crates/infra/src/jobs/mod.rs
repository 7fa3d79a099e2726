//! Extraction job queue with priority dispatch and leased execution.
//!
//! ## Design
//!
//! - Jobs are typed (`JobType`) and carry a payload shaped by their type
//! - Dispatch order: priority descending, then schedule, then id
//! - Leasing is a single atomic store operation, safe across worker processes
//! - Delivery is at-least-once: a crashed worker's lease is reclaimed by
//!   `ExtractionJobQueue::recover_stalled_jobs`
//!
//! ## Components
//!
//! - `ExtractionJob`: job record and its lifecycle transitions
//! - `JobStore`: persistence contract (in-memory or Postgres)
//! - `ExtractionJobQueue`: creation, dispatch and lifecycle operations
//! - `Worker`: polling runtime that runs `JobHandler`s

pub mod filter;
pub mod payload;
pub mod postgres;
pub mod queue;
pub mod store;
pub mod types;
pub mod worker;

pub use filter::{JobFilter, JobOrder, Pagination};
pub use payload::{ExtractPagePayload, JobPayload, MatchProductsPayload, ScrapeFlyerPayload};
pub use postgres::PostgresJobStore;
pub use queue::{ExtractionJobQueue, LEASE_EXPIRED_MESSAGE};
pub use store::{InMemoryJobStore, JobStore, JobStoreError};
pub use types::{
    BackoffStrategy, DEFAULT_MAX_ATTEMPTS, DEFAULT_PRIORITY, ExtractionJob, JobResult, JobStats,
    JobStatus, JobType, MAX_PRIORITY, MIN_PRIORITY, NewExtractionJob, RetryPolicy,
    normalize_priority,
};
pub use worker::{JobHandler, JobOutcome, Worker, WorkerHandle, WorkerStats};
