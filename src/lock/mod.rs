//! Named, TTL-bound mutual exclusion shared by every replica.
//!
//! The vmid allocation sequence (ask for the next free id, submit the clone
//! that consumes it) runs under `lock:vmid`. The lock is released as soon as
//! the clone is submitted; completion polling happens outside it.
//! `lock:sdn` guards vnet creation and `lock:podid` covers picking a pod id
//! and creating its pool.

pub mod memory;
pub mod redis;

use async_trait::async_trait;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::{sleep, timeout};
use tracing::{debug, warn};
use uuid::Uuid;

use crate::errors::{KaminoError, KaminoResult};

pub use self::memory::MemoryLockStore;
pub use self::redis::RedisLockStore;

pub const VMID_LOCK: &str = "lock:vmid";
pub const SDN_LOCK: &str = "lock:sdn";
pub const POD_ID_LOCK: &str = "lock:podid";

/// Storage for lock ownership. `try_acquire` answers whether this caller got it.
#[async_trait]
pub trait LockStore: Send + Sync {
    async fn try_acquire(&self, key: &str, token: &str, ttl: Duration) -> KaminoResult<bool>;

    /// Releases only if `token` still owns `key`.
    async fn release(&self, key: &str, token: &str) -> KaminoResult<()>;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LockPolicy {
    pub ttl: Duration,
    pub max_attempts: u32,
    pub initial_backoff: Duration,
    pub acquire_timeout: Duration,
}

/// Proof of ownership handed back by [`DistributedLock::acquire`].
#[derive(Debug)]
pub struct LockHandle {
    key: String,
    token: String,
}

impl LockHandle {
    pub fn key(&self) -> &str {
        &self.key
    }
}

pub struct DistributedLock {
    store: Arc<dyn LockStore>,
    policy: LockPolicy,
}

impl DistributedLock {
    pub fn new(store: Arc<dyn LockStore>, policy: LockPolicy) -> Self {
        Self { store, policy }
    }

    pub fn policy(&self) -> LockPolicy {
        self.policy
    }

    /// Retries with doubling backoff while the lock is held elsewhere. Store
    /// errors abort immediately.
    pub async fn acquire(&self, key: &str) -> KaminoResult<LockHandle> {
        let token = Uuid::new_v4().to_string();
        match timeout(self.policy.acquire_timeout, self.acquire_with_backoff(key, &token)).await {
            Ok(result) => result,
            Err(_) => {
                // An in-flight SET may still land; make sure it does not linger.
                let _ = self.store.release(key, &token).await;
                Err(KaminoError::timeout(
                    format!("lock {}", key),
                    self.policy.acquire_timeout,
                ))
            }
        }
    }

    async fn acquire_with_backoff(&self, key: &str, token: &str) -> KaminoResult<LockHandle> {
        let mut backoff = self.policy.initial_backoff;
        for attempt in 1..=self.policy.max_attempts {
            if self.store.try_acquire(key, token, self.policy.ttl).await? {
                debug!(key, attempt, "lock acquired");
                return Ok(LockHandle {
                    key: key.to_string(),
                    token: token.to_string(),
                });
            }
            if attempt == self.policy.max_attempts {
                break;
            }
            debug!(key, attempt, backoff_ms = backoff.as_millis() as u64, "lock busy, backing off");
            sleep(backoff).await;
            backoff = backoff.saturating_mul(2);
        }

        Err(KaminoError::LockContention {
            key: key.to_string(),
            attempts: self.policy.max_attempts,
        })
    }

    /// Release failures are logged; the TTL reclaims the key either way.
    pub async fn release(&self, handle: LockHandle) {
        if let Err(e) = self.store.release(&handle.key, &handle.token).await {
            warn!(key = %handle.key, error = %e, "failed to release lock, waiting for ttl");
        } else {
            debug!(key = %handle.key, "lock released");
        }
    }

    /// Runs `critical` while holding `key` and releases whatever it returns.
    pub async fn with_lock<T, F, Fut>(&self, key: &str, critical: F) -> KaminoResult<T>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = KaminoResult<T>>,
    {
        let handle = self.acquire(key).await?;
        let result = critical().await;
        self.release(handle).await;
        result
    }
}
