//! Redis key-value cache.

use async_trait::async_trait;
use redis::aio::ConnectionManager;
use redis::AsyncCommands;
use smf_core::config::mask_credentials;

use super::KeyValueCache;
use crate::error::BackendError;

/// Cache over a reconnecting multiplexed connection. Cloning the manager is
/// cheap; each call works on its own clone.
#[derive(Clone)]
pub struct RedisCache {
    conn: ConnectionManager,
}

impl RedisCache {
    pub async fn connect(url: &str) -> Result<Self, BackendError> {
        let client =
            redis::Client::open(url).map_err(|e| BackendError::new("connect", e.to_string()))?;
        let conn = ConnectionManager::new(client)
            .await
            .map_err(|e| BackendError::new("connect", e.to_string()))?;
        tracing::info!(url = %mask_credentials(url), "connected to cache");
        Ok(Self { conn })
    }
}

#[async_trait]
impl KeyValueCache for RedisCache {
    async fn get(&self, key: &str) -> Result<Option<String>, BackendError> {
        let mut conn = self.conn.clone();
        conn.get(key)
            .await
            .map_err(|e| BackendError::new("get", e.to_string()))
    }

    async fn set(&self, key: &str, value: String) -> Result<(), BackendError> {
        let mut conn = self.conn.clone();
        let _: () = conn
            .set(key, value)
            .await
            .map_err(|e| BackendError::new("set", e.to_string()))?;
        Ok(())
    }

    async fn delete(&self, key: &str) -> Result<bool, BackendError> {
        let mut conn = self.conn.clone();
        let removed: usize = conn
            .del(key)
            .await
            .map_err(|e| BackendError::new("delete", e.to_string()))?;
        Ok(removed > 0)
    }
}
