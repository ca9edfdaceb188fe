//! Distributed locking for timeline mutations.
//!
//! Locks are leases: a holder owns a key until it releases it or the lease
//! expires. `DistributedLock` layers bounded waiting on top of a
//! `LockService`; the returned `LockGuard` is what registry mutations demand
//! as proof of ownership.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use backon::BackoffBuilder;
use serde::Deserialize;
use tokio::time::Instant;
use tracing::{debug, warn};

use crate::utils::retry::lock_backoff;

pub mod memory;
#[cfg(feature = "sqlite")]
pub mod sqlite;

pub use memory::MemoryLockService;
#[cfg(feature = "sqlite")]
pub use sqlite::SqliteLockService;

/// Result type for lock operations.
pub type Result<T> = std::result::Result<T, LockError>;

/// Errors that can occur while acquiring or using a lock.
#[derive(Debug, thiserror::Error)]
pub enum LockError {
    #[error("Timed out after {waited:?} waiting for lock {key}")]
    Timeout { key: String, waited: Duration },

    #[error("Lock {key} is not held")]
    NotHeld { key: String },

    #[error("Lock backend error: {0}")]
    Backend(String),
}

#[cfg(feature = "sqlite")]
impl From<sqlx::Error> for LockError {
    fn from(err: sqlx::Error) -> Self {
        Self::Backend(err.to_string())
    }
}

/// Lease-based lock backend.
#[async_trait]
pub trait LockService: Send + Sync {
    /// Take `key` for `holder` unless another holder has an unexpired lease.
    ///
    /// Re-acquiring a key already held by `holder` renews the lease.
    async fn try_acquire(&self, key: &str, holder: &str, lease: Duration) -> Result<bool>;

    /// Release `key` if `holder` owns it. Releasing a lock held by someone
    /// else is a no-op.
    async fn release(&self, key: &str, holder: &str) -> Result<()>;

    /// Whether `holder` currently owns an unexpired lease on `key`.
    async fn is_held(&self, key: &str, holder: &str) -> Result<bool>;
}

/// Lock key guarding the timelines of one event type.
pub fn timeline_lock_key(event_type: &str) -> String {
    format!("timelines/{}", event_type)
}

/// Lock timing configuration.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct LockConfig {
    /// How long `acquire` waits before giving up.
    pub wait_ms: u64,
    /// Lease length; an abandoned lock frees itself after this long.
    pub lease_ms: u64,
}

impl Default for LockConfig {
    fn default() -> Self {
        Self {
            wait_ms: 5_000,
            lease_ms: 30_000,
        }
    }
}

/// Acquires locks with a bounded wait.
#[derive(Clone)]
pub struct DistributedLock {
    service: Arc<dyn LockService>,
    wait: Duration,
    lease: Duration,
}

impl DistributedLock {
    pub fn new(service: Arc<dyn LockService>, wait: Duration, lease: Duration) -> Self {
        Self {
            service,
            wait,
            lease,
        }
    }

    pub fn from_config(service: Arc<dyn LockService>, config: &LockConfig) -> Self {
        Self::new(
            service,
            Duration::from_millis(config.wait_ms),
            Duration::from_millis(config.lease_ms),
        )
    }

    pub fn service(&self) -> &Arc<dyn LockService> {
        &self.service
    }

    /// Acquire `key`, retrying with backoff until the configured wait elapses.
    pub async fn acquire(&self, key: &str) -> Result<LockGuard> {
        let holder = uuid::Uuid::new_v4().to_string();
        let started = Instant::now();
        let deadline = started + self.wait;
        let mut delays = lock_backoff().build();

        loop {
            if self.service.try_acquire(key, &holder, self.lease).await? {
                debug!(key, holder = %holder, "Lock acquired");
                return Ok(LockGuard {
                    service: self.service.clone(),
                    key: key.to_string(),
                    holder,
                    released: false,
                });
            }

            let now = Instant::now();
            let delay = delays.next().unwrap_or(Duration::from_millis(250));
            if now >= deadline {
                return Err(LockError::Timeout {
                    key: key.to_string(),
                    waited: now - started,
                });
            }
            tokio::time::sleep(delay.min(deadline - now)).await;
        }
    }
}

/// Proof of lock ownership. Released explicitly, or on drop as a fallback.
pub struct LockGuard {
    service: Arc<dyn LockService>,
    key: String,
    holder: String,
    released: bool,
}

impl std::fmt::Debug for LockGuard {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LockGuard")
            .field("key", &self.key)
            .field("holder", &self.holder)
            .field("released", &self.released)
            .finish()
    }
}

impl LockGuard {
    pub fn key(&self) -> &str {
        &self.key
    }

    pub fn holder(&self) -> &str {
        &self.holder
    }

    /// Fail with `NotHeld` if the lease has been lost.
    pub async fn verify(&self) -> Result<()> {
        if self.service.is_held(&self.key, &self.holder).await? {
            Ok(())
        } else {
            Err(LockError::NotHeld {
                key: self.key.clone(),
            })
        }
    }

    pub async fn release(mut self) -> Result<()> {
        self.released = true;
        self.service.release(&self.key, &self.holder).await?;
        debug!(key = %self.key, holder = %self.holder, "Lock released");
        Ok(())
    }
}

impl Drop for LockGuard {
    fn drop(&mut self) {
        if self.released {
            return;
        }
        let Ok(handle) = tokio::runtime::Handle::try_current() else {
            warn!(key = %self.key, "Lock guard dropped outside a runtime; lease will expire");
            return;
        };
        let service = self.service.clone();
        let key = std::mem::take(&mut self.key);
        let holder = std::mem::take(&mut self.holder);
        handle.spawn(async move {
            if let Err(e) = service.release(&key, &holder).await {
                warn!(key = %key, error = %e, "Failed to release dropped lock");
            }
        });
    }
}
