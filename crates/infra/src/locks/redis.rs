//! Redis-backed lock store (optional).
//!
//! Acquisition is `SET key token NX PX ttl`; release and extension are Lua
//! scripts so the token comparison and the mutation happen in one step.

use std::time::Duration;

use async_trait::async_trait;
use redis::aio::MultiplexedConnection;
use redis::Script;

use super::store::{KeyTtl, LockStore, LockStoreError, MAX_TTL};

const COMPARE_AND_DELETE: &str = r#"
if redis.call("GET", KEYS[1]) == ARGV[1] then
    return redis.call("DEL", KEYS[1])
end
return 0
"#;

const COMPARE_AND_EXTEND: &str = r#"
if redis.call("GET", KEYS[1]) == ARGV[1] then
    return redis.call("PEXPIRE", KEYS[1], ARGV[2])
end
return 0
"#;

impl From<redis::RedisError> for LockStoreError {
    fn from(err: redis::RedisError) -> Self {
        if err.is_io_error() || err.is_connection_dropped() || err.is_connection_refusal() {
            LockStoreError::Connection(err.to_string())
        } else {
            LockStoreError::Command(err.to_string())
        }
    }
}

/// Lock store over a multiplexed Redis connection.
#[derive(Clone)]
pub struct RedisLockStore {
    conn: MultiplexedConnection,
    compare_and_delete: Script,
    compare_and_extend: Script,
}

impl RedisLockStore {
    pub async fn connect(redis_url: impl AsRef<str>) -> Result<Self, LockStoreError> {
        let client = redis::Client::open(redis_url.as_ref())?;
        let conn = client.get_multiplexed_async_connection().await?;
        Ok(Self::from_connection(conn))
    }

    pub fn from_connection(conn: MultiplexedConnection) -> Self {
        Self {
            conn,
            compare_and_delete: Script::new(COMPARE_AND_DELETE),
            compare_and_extend: Script::new(COMPARE_AND_EXTEND),
        }
    }
}

fn millis(ttl: Duration) -> u64 {
    (ttl.min(MAX_TTL).as_millis() as u64).max(1)
}

#[async_trait]
impl LockStore for RedisLockStore {
    async fn set_if_absent(&self, key: &str, token: &str, ttl: Duration) -> Result<bool, LockStoreError> {
        let mut conn = self.conn.clone();
        let reply: Option<String> = redis::cmd("SET")
            .arg(key)
            .arg(token)
            .arg("NX")
            .arg("PX")
            .arg(millis(ttl))
            .query_async(&mut conn)
            .await?;
        Ok(reply.is_some())
    }

    async fn compare_and_delete(&self, key: &str, token: &str) -> Result<bool, LockStoreError> {
        let mut conn = self.conn.clone();
        let deleted: i64 = self
            .compare_and_delete
            .key(key)
            .arg(token)
            .invoke_async(&mut conn)
            .await?;
        Ok(deleted == 1)
    }

    async fn compare_and_extend(&self, key: &str, token: &str, ttl: Duration) -> Result<bool, LockStoreError> {
        let mut conn = self.conn.clone();
        let extended: i64 = self
            .compare_and_extend
            .key(key)
            .arg(token)
            .arg(millis(ttl))
            .invoke_async(&mut conn)
            .await?;
        Ok(extended == 1)
    }

    async fn get(&self, key: &str) -> Result<Option<String>, LockStoreError> {
        let mut conn = self.conn.clone();
        let value: Option<String> = redis::cmd("GET").arg(key).query_async(&mut conn).await?;
        Ok(value)
    }

    async fn ttl(&self, key: &str) -> Result<KeyTtl, LockStoreError> {
        let mut conn = self.conn.clone();
        let pttl: i64 = redis::cmd("PTTL").arg(key).query_async(&mut conn).await?;
        Ok(key_ttl_from_pttl(pttl))
    }
}

/// `PTTL` answers -2 for a missing key and -1 for a key without expiry.
fn key_ttl_from_pttl(pttl: i64) -> KeyTtl {
    match pttl {
        -2 => KeyTtl::Missing,
        n if n < 0 => KeyTtl::NoExpiry,
        n => KeyTtl::Expires(Duration::from_millis(n as u64)),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn pttl_replies() {
        assert_eq!(key_ttl_from_pttl(-2), KeyTtl::Missing);
        assert_eq!(key_ttl_from_pttl(-1), KeyTtl::NoExpiry);
        assert_eq!(key_ttl_from_pttl(1500), KeyTtl::Expires(Duration::from_millis(1500)));
    }

    #[test]
    fn sub_millisecond_ttl_rounds_up() {
        assert_eq!(millis(Duration::from_micros(10)), 1);
        assert_eq!(millis(Duration::from_secs(30)), 30_000);
        assert_eq!(millis(Duration::MAX), MAX_TTL.as_millis() as u64);
    }

    #[test]
    fn scripts_guard_on_token() {
        for script in [COMPARE_AND_DELETE, COMPARE_AND_EXTEND] {
            assert!(script.contains(r#"redis.call("GET", KEYS[1]) == ARGV[1]"#));
        }
    }

    #[test]
    fn command_errors_are_not_connection_errors() {
        let err = redis::RedisError::from((redis::ErrorKind::TypeError, "unexpected reply"));
        assert!(matches!(LockStoreError::from(err), LockStoreError::Command(_)));
    }
}
