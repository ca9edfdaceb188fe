//! In-process lease locks.

use std::collections::HashMap;
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::Mutex;
use tokio::time::Instant;

use super::{LockService, Result};

struct Lease {
    holder: String,
    expires_at: Instant,
}

/// Lock service for a single process (and for tests).
#[derive(Default)]
pub struct MemoryLockService {
    leases: Mutex<HashMap<String, Lease>>,
}

impl MemoryLockService {
    pub fn new() -> Self {
        Self::default()
    }

    /// Drop a lease regardless of holder, as if it had expired.
    pub async fn expire(&self, key: &str) {
        self.leases.lock().await.remove(key);
    }
}

#[async_trait]
impl LockService for MemoryLockService {
    async fn try_acquire(&self, key: &str, holder: &str, lease: Duration) -> Result<bool> {
        let mut leases = self.leases.lock().await;
        let now = Instant::now();
        if let Some(existing) = leases.get(key) {
            if existing.holder != holder && existing.expires_at > now {
                return Ok(false);
            }
        }
        leases.insert(
            key.to_string(),
            Lease {
                holder: holder.to_string(),
                expires_at: now + lease,
            },
        );
        Ok(true)
    }

    async fn release(&self, key: &str, holder: &str) -> Result<()> {
        let mut leases = self.leases.lock().await;
        if leases.get(key).is_some_and(|l| l.holder == holder) {
            leases.remove(key);
        }
        Ok(())
    }

    async fn is_held(&self, key: &str, holder: &str) -> Result<bool> {
        let leases = self.leases.lock().await;
        Ok(leases
            .get(key)
            .is_some_and(|l| l.holder == holder && l.expires_at > Instant::now()))
    }
}
