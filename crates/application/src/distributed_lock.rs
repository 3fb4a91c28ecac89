//! Cross-process mutual exclusion over a shared key-value store.
//!
//! A lock claims a set of resource keys all or nothing, stores a holder-unique
//! token under each key with a time-to-live, and releases only keys that still
//! hold its token. The TTL lets a crashed holder's lock expire, so it must
//! exceed the longest critical section guarded by the lock; nothing checks
//! that coupling at runtime.

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use fanout_core::{AppError, AppResult};
use rand::Rng;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::work_ports::LockBackend;

/// Timing knobs shared by every lock a factory creates.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LockOptions {
    /// Time-to-live of every acquired key.
    pub ttl: Duration,
    /// Longest time one acquisition keeps retrying.
    pub max_wait: Duration,
    /// Lower bound of the random wait between attempts.
    pub retry_wait_min: Duration,
    /// Upper bound of the random wait between attempts.
    pub retry_wait_max: Duration,
}

impl Default for LockOptions {
    fn default() -> Self {
        Self {
            ttl: Duration::from_secs(10),
            max_wait: Duration::from_secs(3),
            retry_wait_min: Duration::from_millis(2),
            retry_wait_max: Duration::from_millis(20),
        }
    }
}

impl LockOptions {
    /// Checks that the options describe a usable lock.
    pub fn validate(&self) -> AppResult<()> {
        if self.ttl.is_zero() {
            return Err(AppError::Validation(
                "lock ttl must be greater than zero".to_owned(),
            ));
        }

        if self.max_wait.is_zero() {
            return Err(AppError::Validation(
                "lock max_wait must be greater than zero".to_owned(),
            ));
        }

        if self.retry_wait_min > self.retry_wait_max {
            return Err(AppError::Validation(
                "lock retry_wait_min must not exceed retry_wait_max".to_owned(),
            ));
        }

        Ok(())
    }

    fn next_retry_wait(&self) -> Duration {
        if self.retry_wait_min == self.retry_wait_max {
            return self.retry_wait_min;
        }
        rand::thread_rng().gen_range(self.retry_wait_min..=self.retry_wait_max)
    }
}

/// Creates locks bound to one backend and one set of options.
#[derive(Clone)]
pub struct LockFactory {
    backend: Arc<dyn LockBackend>,
    options: LockOptions,
}

impl LockFactory {
    /// Creates a factory after validating the options.
    pub fn new(backend: Arc<dyn LockBackend>, options: LockOptions) -> AppResult<Self> {
        options.validate()?;
        Ok(Self { backend, options })
    }

    /// Returns the options applied to created locks.
    #[must_use]
    pub fn options(&self) -> LockOptions {
        self.options
    }

    /// Creates an unacquired lock over `resource_keys`.
    ///
    /// # Panics
    ///
    /// Panics when `resource_keys` is empty.
    #[must_use]
    pub fn new_lock(&self, resource_keys: Vec<String>) -> DistributedLock {
        DistributedLock::new(self.backend.clone(), self.options, resource_keys)
    }

    /// Runs `section` while holding a lock over `resource_keys`.
    ///
    /// The lock is released whatever the section returns; a failed release is
    /// logged and the section's result is returned.
    pub async fn with_lock<T, F, Fut>(
        &self,
        cancel: &CancellationToken,
        resource_keys: Vec<String>,
        section: F,
    ) -> AppResult<T>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = AppResult<T>>,
    {
        let mut lock = self.new_lock(resource_keys);
        lock.acquire(cancel).await?;

        let result = section().await;

        if let Err(error) = lock.release().await {
            warn!(
                resource_keys = ?lock.resource_keys(),
                error = %error,
                "failed to release distributed lock"
            );
        }

        result
    }
}

/// Handle over one set of resource keys.
///
/// A handle is not reentrant: acquiring it while held fails.
pub struct DistributedLock {
    backend: Arc<dyn LockBackend>,
    options: LockOptions,
    resource_keys: Vec<String>,
    token: Option<String>,
    acquired_at: Option<Instant>,
    released_at: Option<Instant>,
}

impl DistributedLock {
    /// Creates an unacquired lock.
    ///
    /// # Panics
    ///
    /// Panics when `resource_keys` is empty, since such a lock would guard
    /// nothing.
    #[must_use]
    pub fn new(
        backend: Arc<dyn LockBackend>,
        options: LockOptions,
        resource_keys: Vec<String>,
    ) -> Self {
        assert!(
            !resource_keys.is_empty(),
            "attempt to create a distributed lock without resource keys"
        );

        Self {
            backend,
            options,
            resource_keys,
            token: None,
            acquired_at: None,
            released_at: None,
        }
    }

    /// Returns the guarded resource keys.
    #[must_use]
    pub fn resource_keys(&self) -> &[String] {
        self.resource_keys.as_slice()
    }

    /// Returns whether this handle currently holds its keys.
    #[must_use]
    pub fn is_locked(&self) -> bool {
        self.token.is_some()
    }

    /// Returns how long the last acquisition was held before release.
    #[must_use]
    pub fn held_duration(&self) -> Option<Duration> {
        match (self.acquired_at, self.released_at) {
            (Some(acquired_at), Some(released_at)) if released_at >= acquired_at => {
                Some(released_at - acquired_at)
            }
            _ => None,
        }
    }

    /// Makes a single acquisition attempt and returns whether it succeeded.
    pub async fn try_acquire(&mut self) -> AppResult<bool> {
        self.ensure_not_locked()?;

        let token = uuid::Uuid::new_v4().to_string();
        self.attempt(token).await
    }

    /// Retries acquisition until it succeeds, `max_wait` elapses, or `cancel`
    /// fires.
    pub async fn acquire(&mut self, cancel: &CancellationToken) -> AppResult<()> {
        self.ensure_not_locked()?;

        let token = uuid::Uuid::new_v4().to_string();
        let deadline = Instant::now() + self.options.max_wait;

        loop {
            if cancel.is_cancelled() {
                return Err(self.cancelled());
            }

            if self.attempt(token.clone()).await? {
                return Ok(());
            }

            let now = Instant::now();
            if now >= deadline {
                return Err(AppError::LockUnavailable(format!(
                    "locks were not acquired before timeout: {}",
                    self.resource_keys.join(", ")
                )));
            }

            let wait = self.options.next_retry_wait().min(deadline - now);
            tokio::select! {
                () = cancel.cancelled() => return Err(self.cancelled()),
                () = tokio::time::sleep(wait) => {}
            }
        }
    }

    /// Releases every key still holding this handle's token.
    pub async fn release(&mut self) -> AppResult<()> {
        let Some(token) = self.token.as_deref() else {
            return Err(AppError::LockUnavailable(format!(
                "lock released before acquired: {}",
                self.resource_keys.join(", ")
            )));
        };

        let released = self
            .backend
            .release(self.resource_keys.as_slice(), token)
            .await?;

        if released < self.resource_keys.len() {
            warn!(
                resource_keys = ?self.resource_keys,
                released,
                "distributed lock expired before release"
            );
        }

        self.token = None;
        self.released_at = Some(Instant::now());
        if let Some(held) = self.held_duration() {
            debug!(
                resource_keys = ?self.resource_keys,
                held_ms = held.as_millis(),
                "distributed lock released"
            );
        }

        Ok(())
    }

    async fn attempt(&mut self, token: String) -> AppResult<bool> {
        let acquired = self
            .backend
            .try_acquire(self.resource_keys.as_slice(), token.as_str(), self.options.ttl)
            .await?;

        if acquired {
            self.token = Some(token);
            self.acquired_at = Some(Instant::now());
            self.released_at = None;
        }

        Ok(acquired)
    }

    fn ensure_not_locked(&self) -> AppResult<()> {
        if self.is_locked() {
            return Err(AppError::LockUnavailable(format!(
                "locks have already been acquired: {}",
                self.resource_keys.join(", ")
            )));
        }
        Ok(())
    }

    fn cancelled(&self) -> AppError {
        AppError::Cancelled(format!(
            "stopped acquiring locks: {}",
            self.resource_keys.join(", ")
        ))
    }
}
