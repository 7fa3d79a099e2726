//! Distributed mutual exclusion for workers sharing external resources.
//!
//! A lock is a key in a shared `LockStore` holding a random token. Only the
//! handle that wrote the token may release or extend it; a crashed holder's
//! lock is reclaimed when its TTL runs out.

pub mod manager;
#[cfg(feature = "redis")]
pub mod redis;
pub mod scoped;
pub mod store;

pub use manager::{DistributedLock, LockManager};
#[cfg(feature = "redis")]
pub use self::redis::RedisLockStore;
pub use store::{InMemoryLockStore, KeyTtl, LockStore, LockStoreError};
