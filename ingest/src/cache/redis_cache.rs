use super::{AdmissionCache, CacheError};
use async_trait::async_trait;
use redis::aio::ConnectionManager;
use redis::{Cmd, FromRedisValue, Script};
use std::future::Future;
use std::time::Duration;
use tokio::time::timeout;

// INCR creates a missing key without an expiry. That happens when the key
// expired after SET NX, so give it the window again; keys that still carry a
// TTL keep the one set at creation.
const INCREMENT_SCRIPT: &str = r#"
local count = redis.call('INCR', KEYS[1])
if redis.call('PTTL', KEYS[1]) < 0 then
    redis.call('PEXPIRE', KEYS[1], ARGV[1])
end
return count
"#;

/// Counters shared by every instance pointing at the same Redis.
///
/// Each call is bounded by `timeout` so that a slow store turns into a
/// `CacheError::Timeout` instead of a slow response.
pub struct RedisCache {
    connection: ConnectionManager,
    key_prefix: String,
    timeout: Duration,
    window: Duration,
    increment: Script,
}

impl RedisCache {
    pub async fn connect(
        url: &str,
        key_prefix: String,
        timeout: Duration,
        window: Duration,
    ) -> Result<Self, CacheError> {
        let client = redis::Client::open(url)?;
        let connection = tokio::time::timeout(timeout, ConnectionManager::new(client))
            .await
            .map_err(|_| CacheError::Timeout(timeout))??;

        Ok(RedisCache {
            connection,
            key_prefix,
            timeout,
            window,
            increment: Script::new(INCREMENT_SCRIPT),
        })
    }

    fn key(&self, key: &str) -> String {
        format!("{}{}", self.key_prefix, key)
    }

    async fn with_timeout<T, F>(&self, fut: F) -> Result<T, CacheError>
    where
        F: Future<Output = redis::RedisResult<T>>,
    {
        timeout(self.timeout, fut)
            .await
            .map_err(|_| CacheError::Timeout(self.timeout))?
            .map_err(CacheError::from)
    }

    async fn query<T: FromRedisValue>(&self, cmd: &Cmd) -> Result<T, CacheError> {
        let mut connection = self.connection.clone();
        self.with_timeout(cmd.query_async(&mut connection)).await
    }
}

fn millis(duration: Duration) -> u64 {
    u64::try_from(duration.as_millis()).unwrap_or(u64::MAX).max(1)
}

#[async_trait]
impl AdmissionCache for RedisCache {
    async fn get(&self, key: &str) -> Result<i64, CacheError> {
        let count: Option<i64> = self.query(redis::cmd("GET").arg(self.key(key))).await?;
        Ok(count.unwrap_or(0))
    }

    async fn set_if_absent(&self, key: &str, ttl: Duration) -> Result<bool, CacheError> {
        let reply: Option<String> = self
            .query(
                redis::cmd("SET")
                    .arg(self.key(key))
                    .arg(0)
                    .arg("NX")
                    .arg("PX")
                    .arg(millis(ttl)),
            )
            .await?;
        Ok(reply.is_some())
    }

    async fn increment_and_get(&self, key: &str) -> Result<i64, CacheError> {
        let mut connection = self.connection.clone();
        let mut invocation = self.increment.key(self.key(key));
        invocation.arg(millis(self.window));
        self.with_timeout(invocation.invoke_async(&mut connection))
            .await
    }
}
