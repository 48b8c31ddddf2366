use async_trait::async_trait;
use std::collections::HashMap;
use std::time::Duration;
use tokio::sync::Mutex;
use tokio::time::Instant;

use super::LockStore;
use crate::errors::KaminoResult;

/// Process-local lock table. Only safe when a single replica talks to the cluster.
#[derive(Default)]
pub struct MemoryLockStore {
    entries: Mutex<HashMap<String, (String, Instant)>>,
}

impl MemoryLockStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl LockStore for MemoryLockStore {
    async fn try_acquire(&self, key: &str, token: &str, ttl: Duration) -> KaminoResult<bool> {
        let mut entries = self.entries.lock().await;
        let now = Instant::now();
        match entries.get(key) {
            Some((_, expires)) if *expires > now => Ok(false),
            _ => {
                entries.insert(key.to_string(), (token.to_string(), now + ttl));
                Ok(true)
            }
        }
    }

    async fn release(&self, key: &str, token: &str) -> KaminoResult<()> {
        let mut entries = self.entries.lock().await;
        if entries.get(key).map(|(owner, _)| owner == token).unwrap_or(false) {
            entries.remove(key);
        }
        Ok(())
    }
}
