//! Shared coordination primitives: errors, identifiers, time source.
//!
//! This crate holds the pieces every other crate agrees on: the error taxonomy,
//! strongly-typed identifiers and the injected time source. No I/O lives here.

pub mod clock;
pub mod error;
pub mod id;

pub use clock::{Clock, ManualClock, SystemClock};
pub use error::{CoordinationError, CoordinationResult};
pub use id::{FlyerId, JobId, PageId, StoreId};
