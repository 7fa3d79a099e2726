//! Configuration loading and representation.
//!
//! Every setting has a default; `Settings::from_env` overrides them from
//! `FLYERQ_*` environment variables. Malformed values are rejected rather than
//! silently replaced by defaults.

use std::time::Duration;

use serde::Deserialize;

use flyerq_core::{CoordinationError, CoordinationResult};

use crate::jobs::{JobType, RetryPolicy, DEFAULT_MAX_ATTEMPTS};

/// Job queue settings.
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(default)]
pub struct QueueConfig {
    /// Jobs older than this are removed by `cleanup_expired_jobs`, whatever their status.
    pub expired_job_ttl: Duration,
    /// Used when a new job asks for zero attempts.
    pub default_max_attempts: u32,
}

impl Default for QueueConfig {
    fn default() -> Self {
        Self {
            expired_job_ttl: Duration::from_secs(7 * 24 * 60 * 60),
            default_max_attempts: DEFAULT_MAX_ATTEMPTS,
        }
    }
}

/// Lock manager settings.
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(default)]
pub struct LockConfig {
    /// Prepended to every resource name to form the store key.
    pub key_prefix: String,
    /// Interval between attempts in `try_acquire_lock`.
    pub poll_interval: Duration,
}

impl Default for LockConfig {
    fn default() -> Self {
        Self {
            key_prefix: "flyerq:lock:".to_string(),
            poll_interval: Duration::from_millis(100),
        }
    }
}

/// Worker loop settings.
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(default)]
pub struct WorkerConfig {
    pub worker_id: String,
    pub job_types: Vec<JobType>,
    /// Sleep between polls when no job is eligible.
    pub poll_interval: Duration,
    /// Serialize jobs touching the same resource through the lock manager.
    pub lock_resources: bool,
    pub lock_ttl: Duration,
    /// How long to wait for a busy resource before handing the job back.
    pub lock_wait: Duration,
    /// Delay before a job whose resource was busy becomes eligible again.
    pub contention_delay_minutes: i64,
    pub retry_policy: RetryPolicy,
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self {
            worker_id: format!("worker-{}", uuid::Uuid::new_v4().simple()),
            job_types: JobType::ALL.to_vec(),
            poll_interval: Duration::from_secs(1),
            lock_resources: true,
            lock_ttl: Duration::from_secs(60),
            lock_wait: Duration::from_secs(5),
            contention_delay_minutes: 1,
            retry_policy: RetryPolicy::default(),
        }
    }
}

impl WorkerConfig {
    pub fn with_worker_id(mut self, worker_id: impl Into<String>) -> Self {
        self.worker_id = worker_id.into();
        self
    }

    pub fn with_job_types(mut self, job_types: impl IntoIterator<Item = JobType>) -> Self {
        self.job_types = job_types.into_iter().collect();
        self
    }

    pub fn with_poll_interval(mut self, interval: Duration) -> Self {
        self.poll_interval = interval;
        self
    }
}

/// Process-level settings for a worker binary.
#[derive(Debug, Clone, PartialEq, Default, Deserialize)]
#[serde(default)]
pub struct Settings {
    pub database_url: Option<String>,
    pub redis_url: Option<String>,
    pub queue: QueueConfig,
    pub lock: LockConfig,
    pub worker: WorkerConfig,
}

impl Settings {
    /// Load settings from the process environment.
    pub fn from_env() -> CoordinationResult<Self> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Load settings from an arbitrary key lookup.
    pub fn from_lookup<F>(lookup: F) -> CoordinationResult<Self>
    where
        F: Fn(&str) -> Option<String>,
    {
        let env = Lookup(&lookup);
        let mut settings = Settings {
            database_url: env.string("DATABASE_URL"),
            redis_url: env.string("REDIS_URL"),
            ..Settings::default()
        };

        if let Some(hours) = env.parse::<u64>("FLYERQ_EXPIRED_JOB_TTL_HOURS")? {
            let secs = hours.checked_mul(60 * 60).ok_or_else(|| {
                CoordinationError::validation(format!(
                    "FLYERQ_EXPIRED_JOB_TTL_HOURS out of range: {hours}"
                ))
            })?;
            settings.queue.expired_job_ttl = Duration::from_secs(secs);
        }
        if let Some(n) = env.parse::<u32>("FLYERQ_DEFAULT_MAX_ATTEMPTS")? {
            if n == 0 {
                return Err(CoordinationError::validation(
                    "FLYERQ_DEFAULT_MAX_ATTEMPTS must be at least 1",
                ));
            }
            settings.queue.default_max_attempts = n;
        }

        if let Some(prefix) = env.string("FLYERQ_LOCK_PREFIX") {
            settings.lock.key_prefix = prefix;
        }
        if let Some(ms) = env.parse::<u64>("FLYERQ_LOCK_POLL_MS")? {
            settings.lock.poll_interval = Duration::from_millis(ms.max(1));
        }

        if let Some(worker_id) = env.string("FLYERQ_WORKER_ID") {
            settings.worker.worker_id = worker_id;
        }
        if let Some(types) = env.string("FLYERQ_JOB_TYPES") {
            settings.worker.job_types = types
                .split(',')
                .map(str::parse::<JobType>)
                .collect::<Result<_, _>>()?;
        }
        if let Some(ms) = env.parse::<u64>("FLYERQ_POLL_INTERVAL_MS")? {
            settings.worker.poll_interval = Duration::from_millis(ms);
        }
        if let Some(flag) = env.parse::<bool>("FLYERQ_LOCK_RESOURCES")? {
            settings.worker.lock_resources = flag;
        }
        if let Some(secs) = env.parse::<u64>("FLYERQ_RESOURCE_LOCK_TTL_SECS")? {
            settings.worker.lock_ttl = Duration::from_secs(secs.max(1));
        }
        if let Some(ms) = env.parse::<u64>("FLYERQ_RESOURCE_LOCK_WAIT_MS")? {
            settings.worker.lock_wait = Duration::from_millis(ms);
        }
        if let Some(minutes) = env.parse::<i64>("FLYERQ_CONTENTION_DELAY_MINUTES")? {
            settings.worker.contention_delay_minutes = minutes.max(0);
        }
        if let Some(secs) = env.parse::<u64>("FLYERQ_RETRY_BASE_SECS")? {
            settings.worker.retry_policy.base_delay = Duration::from_secs(secs);
        }
        if let Some(secs) = env.parse::<u64>("FLYERQ_RETRY_MAX_SECS")? {
            settings.worker.retry_policy.max_delay = Duration::from_secs(secs);
        }

        Ok(settings)
    }
}

struct Lookup<'a, F>(&'a F);

impl<F> Lookup<'_, F>
where
    F: Fn(&str) -> Option<String>,
{
    fn string(&self, key: &str) -> Option<String> {
        (self.0)(key).map(|v| v.trim().to_string()).filter(|v| !v.is_empty())
    }

    fn parse<T>(&self, key: &str) -> CoordinationResult<Option<T>>
    where
        T: std::str::FromStr,
        T::Err: std::fmt::Display,
    {
        self.string(key)
            .map(|raw| {
                raw.parse::<T>()
                    .map_err(|e| CoordinationError::validation(format!("{key}={raw}: {e}")))
            })
            .transpose()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn settings_from(pairs: &[(&str, &str)]) -> CoordinationResult<Settings> {
        let vars: HashMap<String, String> = pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        Settings::from_lookup(|key| vars.get(key).cloned())
    }

    #[test]
    fn defaults_without_environment() {
        let settings = settings_from(&[]).unwrap();

        assert!(settings.database_url.is_none());
        assert_eq!(settings.queue.default_max_attempts, 3);
        assert_eq!(settings.lock.poll_interval, Duration::from_millis(100));
        assert_eq!(settings.worker.job_types, JobType::ALL.to_vec());
        assert!(settings.worker.worker_id.starts_with("worker-"));
    }

    #[test]
    fn overrides_are_applied() {
        let settings = settings_from(&[
            ("DATABASE_URL", "postgres://localhost/flyers"),
            ("FLYERQ_WORKER_ID", "scraper-7"),
            ("FLYERQ_JOB_TYPES", "scrape-flyer, extract-page"),
            ("FLYERQ_LOCK_POLL_MS", "250"),
            ("FLYERQ_LOCK_RESOURCES", "false"),
            ("FLYERQ_EXPIRED_JOB_TTL_HOURS", "48"),
        ])
        .unwrap();

        assert_eq!(settings.database_url.as_deref(), Some("postgres://localhost/flyers"));
        assert_eq!(settings.worker.worker_id, "scraper-7");
        assert_eq!(
            settings.worker.job_types,
            vec![JobType::ScrapeFlyer, JobType::ExtractPage]
        );
        assert_eq!(settings.lock.poll_interval, Duration::from_millis(250));
        assert!(!settings.worker.lock_resources);
        assert_eq!(settings.queue.expired_job_ttl, Duration::from_secs(48 * 3600));
    }

    #[test]
    fn malformed_values_are_rejected() {
        let err = settings_from(&[("FLYERQ_LOCK_POLL_MS", "fast")]).unwrap_err();
        assert!(matches!(err, CoordinationError::Validation(msg) if msg.contains("FLYERQ_LOCK_POLL_MS")));

        let err = settings_from(&[("FLYERQ_JOB_TYPES", "scrape-flyer,,")]).unwrap_err();
        assert!(matches!(err, CoordinationError::Validation(_)));

        let err = settings_from(&[("FLYERQ_DEFAULT_MAX_ATTEMPTS", "0")]).unwrap_err();
        assert!(matches!(err, CoordinationError::Validation(_)));

        let hours = u64::MAX.to_string();
        let err = settings_from(&[("FLYERQ_EXPIRED_JOB_TTL_HOURS", hours.as_str())]).unwrap_err();
        assert!(matches!(err, CoordinationError::Validation(msg) if msg.contains("FLYERQ_EXPIRED_JOB_TTL_HOURS")));
    }

    #[test]
    fn resource_lock_ttl_comes_from_worker_settings() {
        assert_eq!(
            LockConfig::default(),
            LockConfig {
                key_prefix: "flyerq:lock:".to_string(),
                poll_interval: Duration::from_millis(100),
            }
        );

        let settings = settings_from(&[("FLYERQ_RESOURCE_LOCK_TTL_SECS", "90")]).unwrap();
        assert_eq!(settings.worker.lock_ttl, Duration::from_secs(90));
    }

    #[test]
    fn blank_values_fall_back_to_defaults() {
        let settings = settings_from(&[("FLYERQ_LOCK_PREFIX", "   ")]).unwrap();
        assert_eq!(settings.lock.key_prefix, "flyerq:lock:");
    }
}
