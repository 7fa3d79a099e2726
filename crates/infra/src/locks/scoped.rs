//! Scoped lock helpers: acquire, run, always release.

use std::future::Future;
use std::panic::AssertUnwindSafe;
use std::time::Duration;

use futures::FutureExt;
use tokio_util::sync::CancellationToken;
use tracing::warn;

use flyerq_core::CoordinationResult;

use super::manager::{DistributedLock, LockManager};

impl LockManager {
    /// Run `f` under a lock acquired with a single attempt.
    pub async fn with_lock<F, Fut, T>(&self, resource: &str, ttl: Duration, f: F) -> CoordinationResult<T>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = T>,
    {
        let lock = self.acquire_lock(resource, ttl).await?;
        Ok(run_then_release(lock, f).await)
    }

    /// Run `f` under a lock, waiting up to `max_wait` for it.
    pub async fn with_lock_timeout<F, Fut, T>(
        &self,
        resource: &str,
        ttl: Duration,
        max_wait: Duration,
        cancel: &CancellationToken,
        f: F,
    ) -> CoordinationResult<T>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = T>,
    {
        let lock = self.try_acquire_lock(resource, ttl, max_wait, cancel).await?;
        Ok(run_then_release(lock, f).await)
    }

    /// Run `f` under a renewed lock acquired with a single attempt.
    ///
    /// Renewal lasts exactly as long as `f`.
    pub async fn with_renewable_lock<F, Fut, T>(
        &self,
        resource: &str,
        ttl: Duration,
        f: F,
    ) -> CoordinationResult<T>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = T>,
    {
        let mut lock = self.acquire_lock(resource, ttl).await?;
        lock.start_renewal(CancellationToken::new());
        Ok(run_then_release(lock, f).await)
    }

    /// Run `f` under a renewed lock, waiting up to `max_wait` for it.
    ///
    /// `cancel` only interrupts the wait; renewal lasts exactly as long as `f`.
    pub async fn with_renewable_lock_timeout<F, Fut, T>(
        &self,
        resource: &str,
        ttl: Duration,
        max_wait: Duration,
        cancel: &CancellationToken,
        f: F,
    ) -> CoordinationResult<T>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = T>,
    {
        let lock = self
            .try_acquire_renewable_lock(resource, ttl, max_wait, cancel)
            .await?;
        Ok(run_then_release(lock, f).await)
    }
}

/// Release happens whether `f` returns or panics; a panic resumes afterwards.
/// A failed release is logged, not returned: the work already happened.
async fn run_then_release<F, Fut, T>(mut lock: DistributedLock, f: F) -> T
where
    F: FnOnce() -> Fut,
    Fut: Future<Output = T>,
{
    let outcome = AssertUnwindSafe(async move { f().await })
        .catch_unwind()
        .await;

    if let Err(err) = lock.release().await {
        warn!(resource = lock.resource(), error = %err, "scoped lock release failed");
    }

    match outcome {
        Ok(value) => value,
        Err(panic) => std::panic::resume_unwind(panic),
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;
    use std::sync::atomic::{AtomicUsize, Ordering};

    use flyerq_core::CoordinationError;

    use crate::config::LockConfig;
    use crate::locks::store::{InMemoryLockStore, LockStore};

    use super::*;

    const TTL: Duration = Duration::from_secs(3);

    fn manager() -> (LockManager, Arc<InMemoryLockStore>) {
        let store = InMemoryLockStore::arc();
        (LockManager::new(store.clone(), LockConfig::default()), store)
    }

    #[tokio::test(start_paused = true)]
    async fn with_lock_releases_after_success_and_error() {
        let (locks, store) = manager();

        let value = locks.with_lock("store:1", TTL, || async { 42 }).await.unwrap();
        assert_eq!(value, 42);
        assert!(store.is_empty());

        let result: CoordinationResult<anyhow::Result<()>> = locks
            .with_lock("store:1", TTL, || async { Err(anyhow::anyhow!("scrape failed")) })
            .await;
        assert!(result.unwrap().is_err());
        assert!(store.is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn with_lock_does_not_run_on_conflict() {
        let (locks, _) = manager();
        let _held = locks.acquire_lock("store:1", TTL).await.unwrap();
        let calls = AtomicUsize::new(0);

        let err = locks
            .with_lock("store:1", TTL, || async {
                calls.fetch_add(1, Ordering::SeqCst);
            })
            .await
            .unwrap_err();

        assert!(matches!(err, CoordinationError::Conflict(_)));
        assert_eq!(calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn with_lock_releases_on_panic() {
        let (locks, store) = manager();

        let task = {
            let locks = locks.clone();
            tokio::spawn(async move {
                locks
                    .with_lock::<_, _, ()>("page:1", TTL, || async { panic!("extractor crashed") })
                    .await
            })
        };

        let err = task.await.unwrap_err();
        assert!(err.is_panic());
        assert!(store.is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn with_lock_timeout_waits_for_holder() {
        let (locks, store) = manager();
        let mut holder = locks.acquire_lock("flyer:1", TTL).await.unwrap();

        let waiter = {
            let locks = locks.clone();
            tokio::spawn(async move {
                locks
                    .with_lock_timeout("flyer:1", TTL, Duration::from_secs(2), &CancellationToken::new(), || async {
                        "matched"
                    })
                    .await
            })
        };

        tokio::time::sleep(Duration::from_millis(300)).await;
        holder.release().await.unwrap();

        assert_eq!(waiter.await.unwrap().unwrap(), "matched");
        assert!(store.is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn with_renewable_lock_outlives_ttl() {
        let (locks, store) = manager();
        let held_throughout = locks
            .with_renewable_lock("flyer:2", TTL, || async {
                tokio::time::sleep(TTL * 4).await;
                store.get("flyerq:lock:flyer:2").await.unwrap().is_some()
            })
            .await
            .unwrap();

        assert!(held_throughout);
        assert!(store.is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn with_renewable_lock_timeout_gives_up() {
        let (locks, store) = manager();
        let _holder = locks.acquire_lock("flyer:2", Duration::from_secs(60)).await.unwrap();

        let err = locks
            .with_renewable_lock_timeout("flyer:2", TTL, Duration::from_millis(500), &CancellationToken::new(), || async {})
            .await
            .unwrap_err();

        assert!(matches!(err, CoordinationError::Timeout(_)));
        assert_eq!(store.len(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn cancelling_after_acquisition_keeps_renewing() {
        let (locks, store) = manager();
        let cancel = CancellationToken::new();

        let held_throughout = locks
            .with_renewable_lock_timeout("flyer:5", TTL, Duration::from_secs(1), &cancel, || async {
                cancel.cancel();
                tokio::time::sleep(TTL * 4).await;
                store.get("flyerq:lock:flyer:5").await.unwrap().is_some()
            })
            .await
            .unwrap();

        assert!(held_throughout);
        assert!(store.is_empty());
    }
}
