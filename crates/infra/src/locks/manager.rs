//! Named distributed locks over a `LockStore`.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, instrument, warn};

use flyerq_core::{CoordinationError, CoordinationResult};

use crate::config::LockConfig;

use super::store::{KeyTtl, LockStore};

/// Hands out `DistributedLock`s.
///
/// Cheap to clone; every clone shares the same store handle.
#[derive(Clone)]
pub struct LockManager {
    store: Arc<dyn LockStore>,
    config: LockConfig,
}

impl std::fmt::Debug for LockManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LockManager")
            .field("config", &self.config)
            .finish_non_exhaustive()
    }
}

impl LockManager {
    pub fn new(store: Arc<dyn LockStore>, config: LockConfig) -> Self {
        Self { store, config }
    }

    pub fn config(&self) -> &LockConfig {
        &self.config
    }

    /// Store key for `resource`.
    pub fn key_for(&self, resource: &str) -> String {
        format!("{}{}", self.config.key_prefix, resource)
    }

    /// Single non-blocking attempt. `Conflict` if someone else holds the lock.
    #[instrument(skip(self), err(level = "debug"))]
    pub async fn acquire_lock(&self, resource: &str, ttl: Duration) -> CoordinationResult<DistributedLock> {
        validate(resource, ttl)?;

        let key = self.key_for(resource);
        let token = uuid::Uuid::new_v4().simple().to_string();

        let acquired = self
            .store
            .set_if_absent(&key, &token, ttl)
            .await
            .map_err(|e| e.into_coordination("acquire_lock", key.clone()))?;
        if !acquired {
            return Err(CoordinationError::conflict(format!("lock {resource} is held")));
        }

        debug!(%key, ttl_ms = ttl.as_millis() as u64, "lock acquired");
        Ok(DistributedLock {
            store: Arc::clone(&self.store),
            resource: resource.to_string(),
            key,
            token,
            ttl: watch::channel(ttl).0,
            renewal: None,
        })
    }

    /// Poll `acquire_lock` every `poll_interval` until it succeeds, `max_wait`
    /// elapses (`Timeout`) or `cancel` fires (`Cancelled`).
    ///
    /// A `max_wait` too large to form a deadline (`Duration::MAX`) waits until
    /// success or cancellation.
    #[instrument(skip(self, cancel), err(level = "debug"))]
    pub async fn try_acquire_lock(
        &self,
        resource: &str,
        ttl: Duration,
        max_wait: Duration,
        cancel: &CancellationToken,
    ) -> CoordinationResult<DistributedLock> {
        let deadline = Instant::now().checked_add(max_wait);

        loop {
            if cancel.is_cancelled() {
                return Err(CoordinationError::cancelled(format!("waiting for lock {resource}")));
            }

            match self.acquire_lock(resource, ttl).await {
                Err(CoordinationError::Conflict(_)) => {}
                other => return other,
            }

            let pause = match deadline {
                Some(deadline) => {
                    let now = Instant::now();
                    if now >= deadline {
                        return Err(CoordinationError::timeout(format!(
                            "lock {resource} still held after {max_wait:?}"
                        )));
                    }
                    self.config.poll_interval.min(deadline - now)
                }
                None => self.config.poll_interval,
            };
            tokio::select! {
                biased;
                _ = cancel.cancelled() => {
                    return Err(CoordinationError::cancelled(format!("waiting for lock {resource}")));
                }
                _ = tokio::time::sleep(pause) => {}
            }
        }
    }

    /// `acquire_lock` plus a renewal task that keeps the lock alive until
    /// release, drop or `cancel`.
    pub async fn acquire_renewable_lock(
        &self,
        resource: &str,
        ttl: Duration,
        cancel: &CancellationToken,
    ) -> CoordinationResult<DistributedLock> {
        let mut lock = self.acquire_lock(resource, ttl).await?;
        lock.start_renewal(cancel.child_token());
        Ok(lock)
    }

    /// `try_acquire_lock` plus renewal.
    ///
    /// `cancel` only bounds the wait. Once acquired, renewal runs until the
    /// handle is released or dropped, so cancelling a caller's wider scope
    /// never lets the lock lapse under work that is still running.
    pub async fn try_acquire_renewable_lock(
        &self,
        resource: &str,
        ttl: Duration,
        max_wait: Duration,
        cancel: &CancellationToken,
    ) -> CoordinationResult<DistributedLock> {
        let mut lock = self.try_acquire_lock(resource, ttl, max_wait, cancel).await?;
        lock.start_renewal(CancellationToken::new());
        Ok(lock)
    }
}

fn validate(resource: &str, ttl: Duration) -> CoordinationResult<()> {
    if resource.trim().is_empty() {
        return Err(CoordinationError::validation("lock resource is required"));
    }
    if ttl.is_zero() {
        return Err(CoordinationError::validation("lock ttl must be positive"));
    }
    Ok(())
}

struct Renewal {
    cancel: CancellationToken,
    task: JoinHandle<()>,
}

/// Handle to a held lock.
///
/// Dropping the handle stops renewal but leaves the key to expire on its own;
/// call `release` to free the resource right away.
pub struct DistributedLock {
    store: Arc<dyn LockStore>,
    resource: String,
    key: String,
    token: String,
    /// Current TTL; the renewal task re-reads it on every tick.
    ttl: watch::Sender<Duration>,
    renewal: Option<Renewal>,
}

impl std::fmt::Debug for DistributedLock {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DistributedLock")
            .field("key", &self.key)
            .field("ttl", &self.ttl())
            .field("renewing", &self.is_renewing())
            .finish_non_exhaustive()
    }
}

impl DistributedLock {
    pub fn resource(&self) -> &str {
        &self.resource
    }

    pub fn key(&self) -> &str {
        &self.key
    }

    /// Ownership token stored under the key while this handle holds the lock.
    pub fn token(&self) -> &str {
        &self.token
    }

    pub fn ttl(&self) -> Duration {
        *self.ttl.borrow()
    }

    /// Whether the renewal task is still running. Goes false after release,
    /// cancellation, or the first failed extension.
    pub fn is_renewing(&self) -> bool {
        self.renewal
            .as_ref()
            .is_some_and(|r| !r.cancel.is_cancelled() && !r.task.is_finished())
    }

    /// Delete the key if it still holds this handle's token.
    ///
    /// Renewal is stopped first. Fails with `Ownership` if the lock expired or
    /// was taken over; another holder's key is never touched.
    #[instrument(skip(self), fields(key = %self.key), err(level = "debug"))]
    pub async fn release(&mut self) -> CoordinationResult<()> {
        self.stop_renewal().await;

        let deleted = self
            .store
            .compare_and_delete(&self.key, &self.token)
            .await
            .map_err(|e| e.into_coordination("release", self.key.clone()))?;
        if !deleted {
            return Err(CoordinationError::ownership(format!(
                "lock {} is no longer held by this handle",
                self.resource
            )));
        }

        debug!("lock released");
        Ok(())
    }

    /// Reset the expiry to `new_ttl` if the key still holds this handle's token.
    pub async fn extend(&mut self, new_ttl: Duration) -> CoordinationResult<()> {
        if new_ttl.is_zero() {
            return Err(CoordinationError::validation("lock ttl must be positive"));
        }

        let extended = self
            .store
            .compare_and_extend(&self.key, &self.token, new_ttl)
            .await
            .map_err(|e| e.into_coordination("extend", self.key.clone()))?;
        if !extended {
            return Err(CoordinationError::ownership(format!(
                "lock {} is no longer held by this handle",
                self.resource
            )));
        }

        self.ttl.send_replace(new_ttl);
        Ok(())
    }

    pub async fn is_held(&self) -> CoordinationResult<bool> {
        let current = self
            .store
            .get(&self.key)
            .await
            .map_err(|e| e.into_coordination("is_held", self.key.clone()))?;
        Ok(current.as_deref() == Some(self.token.as_str()))
    }

    /// Remaining lifetime of the key, whoever holds it.
    pub async fn get_ttl(&self) -> CoordinationResult<KeyTtl> {
        self.store
            .ttl(&self.key)
            .await
            .map_err(|e| e.into_coordination("get_ttl", self.key.clone()))
    }

    /// Spawn the renewal task, stopped by `cancel`, `release` or drop.
    pub(super) fn start_renewal(&mut self, cancel: CancellationToken) {
        if self.renewal.is_some() {
            return;
        }

        let task = tokio::spawn(renew(
            Arc::clone(&self.store),
            self.key.clone(),
            self.token.clone(),
            self.ttl.subscribe(),
            cancel.clone(),
        ));
        self.renewal = Some(Renewal { cancel, task });
    }

    async fn stop_renewal(&mut self) {
        if let Some(renewal) = self.renewal.take() {
            renewal.cancel.cancel();
            if let Err(err) = renewal.task.await {
                warn!(key = %self.key, error = %err, "lock renewal task ended abnormally");
            }
        }
    }
}

impl Drop for DistributedLock {
    fn drop(&mut self) {
        if let Some(renewal) = self.renewal.take() {
            renewal.cancel.cancel();
        }
    }
}

/// Extend the key every `ttl / 3` while the token matches.
///
/// The TTL is read from the handle each round, so `extend` sticks and a
/// shorter TTL shortens the next wait. Stops quietly on cancellation. A failed
/// extension ends the task and cancels its own token so `is_renewing` reports
/// the loss.
async fn renew(
    store: Arc<dyn LockStore>,
    key: String,
    token: String,
    mut ttl: watch::Receiver<Duration>,
    cancel: CancellationToken,
) {
    loop {
        let period = (*ttl.borrow_and_update() / 3).max(Duration::from_millis(1));

        tokio::select! {
            biased;
            _ = cancel.cancelled() => {
                debug!(%key, "lock renewal stopped");
                return;
            }
            changed = ttl.changed() => {
                if changed.is_err() {
                    return;
                }
            }
            _ = tokio::time::sleep(period) => {
                let current = *ttl.borrow();
                match store.compare_and_extend(&key, &token, current).await {
                    Ok(true) => {}
                    Ok(false) => {
                        warn!(%key, "lock lost before renewal, stopping");
                        cancel.cancel();
                        return;
                    }
                    Err(err) => {
                        warn!(%key, error = %err, "lock renewal failed, stopping");
                        cancel.cancel();
                        return;
                    }
                }
            }
        }
    }
}
