use async_trait::async_trait;
use redis::aio::MultiplexedConnection;
use redis::Script;
use std::time::Duration;
use tracing::info;

use super::LockStore;
use crate::errors::{KaminoError, KaminoResult};

// Delete only if the caller's token still owns the key.
const RELEASE_SCRIPT: &str = r#"
if redis.call("GET", KEYS[1]) == ARGV[1] then
    return redis.call("DEL", KEYS[1])
else
    return 0
end
"#;

/// Lock table in the shared cache, visible to every replica.
pub struct RedisLockStore {
    conn: MultiplexedConnection,
    release: Script,
}

impl RedisLockStore {
    pub async fn connect(url: &str) -> KaminoResult<Self> {
        let client = redis::Client::open(url)
            .map_err(|e| KaminoError::Config(format!("invalid redis url: {}", e)))?;
        let conn = client
            .get_multiplexed_async_connection()
            .await
            .map_err(cache_error)?;
        info!("Connected to lock cache");
        Ok(Self {
            conn,
            release: Script::new(RELEASE_SCRIPT),
        })
    }
}

fn cache_error(err: redis::RedisError) -> KaminoError {
    KaminoError::Transient(format!("lock cache: {}", err))
}

#[async_trait]
impl LockStore for RedisLockStore {
    async fn try_acquire(&self, key: &str, token: &str, ttl: Duration) -> KaminoResult<bool> {
        let mut conn = self.conn.clone();
        let reply: Option<String> = redis::cmd("SET")
            .arg(key)
            .arg(token)
            .arg("NX")
            .arg("PX")
            .arg(ttl.as_millis() as u64)
            .query_async(&mut conn)
            .await
            .map_err(cache_error)?;
        Ok(reply.is_some())
    }

    async fn release(&self, key: &str, token: &str) -> KaminoResult<()> {
        let mut conn = self.conn.clone();
        let _removed: i64 = self
            .release
            .key(key)
            .arg(token)
            .invoke_async(&mut conn)
            .await
            .map_err(cache_error)?;
        Ok(())
    }
}
