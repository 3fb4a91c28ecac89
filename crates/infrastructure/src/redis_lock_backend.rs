//! Redis-backed primitive for distributed locks.

use std::time::Duration;

use async_trait::async_trait;
use fanout_application::LockBackend;
use fanout_core::{AppError, AppResult};
use redis::Script;

const ACQUIRE_LOCK_SCRIPT: &str = r#"
for _, key in ipairs(KEYS) do
  if redis.call('EXISTS', key) == 1 then
    return 0
  end
end
for _, key in ipairs(KEYS) do
  redis.call('SET', key, ARGV[1], 'PX', ARGV[2])
end
return 1
"#;

const RELEASE_LOCK_SCRIPT: &str = r#"
local released = 0
for _, key in ipairs(KEYS) do
  if redis.call('GET', key) == ARGV[1] then
    released = released + redis.call('DEL', key)
  end
end
return released
"#;

/// Redis implementation of the lock primitive.
///
/// Every resource key is stored as `{key_prefix}:{resource_key}`.
#[derive(Clone)]
pub struct RedisLockBackend {
    client: redis::Client,
    key_prefix: String,
}

impl RedisLockBackend {
    /// Creates one lock backend adapter.
    #[must_use]
    pub fn new(client: redis::Client, key_prefix: impl Into<String>) -> Self {
        Self {
            client,
            key_prefix: key_prefix.into(),
        }
    }

    fn key_for(&self, resource_key: &str) -> String {
        format!("{}:{resource_key}", self.key_prefix)
    }
}

#[async_trait]
impl LockBackend for RedisLockBackend {
    async fn try_acquire(&self, keys: &[String], token: &str, ttl: Duration) -> AppResult<bool> {
        let ttl_ms = u64::try_from(ttl.as_millis())
            .ok()
            .filter(|ttl_ms| *ttl_ms > 0)
            .ok_or_else(|| {
                AppError::Validation(format!("invalid lock ttl {}ms", ttl.as_millis()))
            })?;

        let script = Script::new(ACQUIRE_LOCK_SCRIPT);
        let mut invocation = script.prepare_invoke();
        for key in keys {
            invocation.key(self.key_for(key));
        }
        invocation.arg(token).arg(ttl_ms);

        let mut connection = self
            .client
            .get_multiplexed_async_connection()
            .await
            .map_err(|error| AppError::Internal(format!("failed to connect to redis: {error}")))?;

        let acquired = invocation
            .invoke_async::<i32>(&mut connection)
            .await
            .map_err(|error| AppError::Internal(format!("failed to acquire locks: {error}")))?;

        Ok(acquired == 1)
    }

    async fn release(&self, keys: &[String], token: &str) -> AppResult<usize> {
        let script = Script::new(RELEASE_LOCK_SCRIPT);
        let mut invocation = script.prepare_invoke();
        for key in keys {
            invocation.key(self.key_for(key));
        }
        invocation.arg(token);

        let mut connection = self
            .client
            .get_multiplexed_async_connection()
            .await
            .map_err(|error| AppError::Internal(format!("failed to connect to redis: {error}")))?;

        invocation
            .invoke_async::<usize>(&mut connection)
            .await
            .map_err(|error| AppError::Internal(format!("failed to release locks: {error}")))
    }
}
