//! Infrastructure layer: job queue, distributed locks, worker runtime, config.

pub mod config;
pub mod jobs;
pub mod locks;

pub use config::{LockConfig, QueueConfig, Settings, WorkerConfig};

mod integration_tests;
