//! Lock store contract and the in-memory implementation.
//!
//! A lock is a key holding an owner token with an expiry. Every operation that
//! acts on behalf of an owner compares the token and mutates in one atomic step.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use async_trait::async_trait;
use tokio::time::Instant;

use flyerq_core::CoordinationError;

/// Remaining lifetime of a key as reported by the store.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum KeyTtl {
    /// No such key (never set, released or expired).
    Missing,
    /// Key exists without an expiry.
    NoExpiry,
    Expires(Duration),
}

/// Lock store error.
#[derive(Debug, Clone, thiserror::Error)]
pub enum LockStoreError {
    #[error("lock store connection error: {0}")]
    Connection(String),
    #[error("lock store command failed: {0}")]
    Command(String),
}

impl LockStoreError {
    pub fn into_coordination(self, operation: &str, resource: impl Into<String>) -> CoordinationError {
        CoordinationError::internal(operation, resource, self.to_string())
    }
}

/// Key/value store with atomic compare-and-act primitives.
#[async_trait]
pub trait LockStore: Send + Sync {
    /// Set `key` to `token` with `ttl` only if the key is absent. Returns whether it was set.
    async fn set_if_absent(&self, key: &str, token: &str, ttl: Duration) -> Result<bool, LockStoreError>;

    /// Delete `key` only if it holds `token`. Returns whether it was deleted.
    async fn compare_and_delete(&self, key: &str, token: &str) -> Result<bool, LockStoreError>;

    /// Reset the expiry of `key` to `ttl` only if it holds `token`.
    async fn compare_and_extend(&self, key: &str, token: &str, ttl: Duration) -> Result<bool, LockStoreError>;

    /// Current token stored under `key`.
    async fn get(&self, key: &str) -> Result<Option<String>, LockStoreError>;

    async fn ttl(&self, key: &str) -> Result<KeyTtl, LockStoreError>;
}

#[derive(Debug, Clone)]
struct Entry {
    token: String,
    expires_at: Instant,
}

/// In-memory lock store for tests/dev.
///
/// Expiry is evaluated lazily against the tokio clock, so paused-time tests
/// can drive it with `tokio::time::advance`.
#[derive(Debug, Default)]
pub struct InMemoryLockStore {
    entries: Mutex<HashMap<String, Entry>>,
}

impl InMemoryLockStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn arc() -> Arc<Self> {
        Arc::new(Self::new())
    }

    /// Number of live keys.
    pub fn len(&self) -> usize {
        let now = Instant::now();
        self.lock()
            .map(|entries| entries.values().filter(|e| e.expires_at > now).count())
            .unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn lock(&self) -> Result<MutexGuard<'_, HashMap<String, Entry>>, LockStoreError> {
        self.entries
            .lock()
            .map_err(|_| LockStoreError::Command("lock table poisoned".to_string()))
    }

    /// Live entry under `key`, evicting it first if it has expired.
    fn live<'a>(entries: &'a mut HashMap<String, Entry>, key: &str) -> Option<&'a mut Entry> {
        let now = Instant::now();
        if entries.get(key).is_some_and(|e| e.expires_at <= now) {
            entries.remove(key);
        }
        entries.get_mut(key)
    }
}

/// Longest expiry a store records; larger TTLs are clamped to it.
pub(crate) const MAX_TTL: Duration = Duration::from_secs(100 * 365 * 24 * 60 * 60);

fn expiry(ttl: Duration) -> Instant {
    Instant::now() + ttl.min(MAX_TTL)
}

#[async_trait]
impl LockStore for InMemoryLockStore {
    async fn set_if_absent(&self, key: &str, token: &str, ttl: Duration) -> Result<bool, LockStoreError> {
        let mut entries = self.lock()?;
        if Self::live(&mut entries, key).is_some() {
            return Ok(false);
        }
        entries.insert(
            key.to_string(),
            Entry {
                token: token.to_string(),
                expires_at: expiry(ttl),
            },
        );
        Ok(true)
    }

    async fn compare_and_delete(&self, key: &str, token: &str) -> Result<bool, LockStoreError> {
        let mut entries = self.lock()?;
        let owned = Self::live(&mut entries, key).is_some_and(|e| e.token == token);
        if owned {
            entries.remove(key);
        }
        Ok(owned)
    }

    async fn compare_and_extend(&self, key: &str, token: &str, ttl: Duration) -> Result<bool, LockStoreError> {
        let mut entries = self.lock()?;
        match Self::live(&mut entries, key) {
            Some(entry) if entry.token == token => {
                entry.expires_at = expiry(ttl);
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    async fn get(&self, key: &str) -> Result<Option<String>, LockStoreError> {
        let mut entries = self.lock()?;
        Ok(Self::live(&mut entries, key).map(|e| e.token.clone()))
    }

    async fn ttl(&self, key: &str) -> Result<KeyTtl, LockStoreError> {
        let mut entries = self.lock()?;
        let now = Instant::now();
        Ok(match Self::live(&mut entries, key) {
            Some(entry) => KeyTtl::Expires(entry.expires_at.saturating_duration_since(now)),
            None => KeyTtl::Missing,
        })
    }
}

#[async_trait]
impl<S: LockStore + ?Sized> LockStore for Arc<S> {
    async fn set_if_absent(&self, key: &str, token: &str, ttl: Duration) -> Result<bool, LockStoreError> {
        (**self).set_if_absent(key, token, ttl).await
    }

    async fn compare_and_delete(&self, key: &str, token: &str) -> Result<bool, LockStoreError> {
        (**self).compare_and_delete(key, token).await
    }

    async fn compare_and_extend(&self, key: &str, token: &str, ttl: Duration) -> Result<bool, LockStoreError> {
        (**self).compare_and_extend(key, token, ttl).await
    }

    async fn get(&self, key: &str) -> Result<Option<String>, LockStoreError> {
        (**self).get(key).await
    }

    async fn ttl(&self, key: &str) -> Result<KeyTtl, LockStoreError> {
        (**self).ttl(key).await
    }
}
