use std::time::Duration;

use async_trait::async_trait;
use fanout_core::AppResult;

/// Shared-store primitive behind distributed locks.
#[async_trait]
pub trait LockBackend: Send + Sync {
    /// Sets every key to `token` with a time-to-live when none of them is
    /// currently held, and returns false otherwise. Keys are claimed all or
    /// nothing.
    async fn try_acquire(&self, keys: &[String], token: &str, ttl: Duration) -> AppResult<bool>;

    /// Deletes the keys still holding `token` and returns how many were
    /// deleted. Keys reclaimed by another holder after expiry are left alone.
    async fn release(&self, keys: &[String], token: &str) -> AppResult<usize>;
}
