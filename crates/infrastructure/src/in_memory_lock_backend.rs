use std::collections::HashMap;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use fanout_application::LockBackend;
use fanout_core::AppResult;
use tokio::sync::Mutex;

#[derive(Debug, Clone)]
struct HeldLock {
    token: String,
    expires_at: Instant,
}

/// In-process lock backend for tests and single-process runs.
#[derive(Default)]
pub struct InMemoryLockBackend {
    held: Mutex<HashMap<String, HeldLock>>,
}

impl InMemoryLockBackend {
    /// Creates a backend with no held keys.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl LockBackend for InMemoryLockBackend {
    async fn try_acquire(&self, keys: &[String], token: &str, ttl: Duration) -> AppResult<bool> {
        let now = Instant::now();
        let mut held = self.held.lock().await;

        if keys
            .iter()
            .any(|key| held.get(key).is_some_and(|lock| lock.expires_at > now))
        {
            return Ok(false);
        }

        let expires_at = now.checked_add(ttl).unwrap_or(now);
        for key in keys {
            held.insert(
                key.clone(),
                HeldLock {
                    token: token.to_owned(),
                    expires_at,
                },
            );
        }

        Ok(true)
    }

    async fn release(&self, keys: &[String], token: &str) -> AppResult<usize> {
        let now = Instant::now();
        let mut held = self.held.lock().await;

        let mut released = 0;
        for key in keys {
            if held
                .get(key)
                .is_some_and(|lock| lock.token == token && lock.expires_at > now)
            {
                held.remove(key);
                released += 1;
            }
        }

        Ok(released)
    }
}
