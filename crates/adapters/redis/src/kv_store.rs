//! Redis KV 存储

use std::time::Duration;

use async_trait::async_trait;
use redis::AsyncCommands;
use redis::aio::ConnectionManager;
use tiercache_errors::{CacheError, CacheResult};
use tiercache_ports::KvStorePort;

use crate::config::RedisStoreConfig;
use crate::connection::{check_connection, create_connection_manager};

/// Redis KV 存储
///
/// 带 TTL 的写入使用 `PSETEX`，毫秒精度
pub struct RedisKvStore {
    conn: ConnectionManager,
    config: RedisStoreConfig,
}

impl RedisKvStore {
    pub fn new(conn: ConnectionManager, config: RedisStoreConfig) -> Self {
        Self { conn, config }
    }

    /// 按配置建立连接并做一次 PING
    pub async fn connect(config: RedisStoreConfig) -> CacheResult<Self> {
        let mut conn = create_connection_manager(&config.url, config.connect_timeout).await?;
        check_connection(&mut conn).await?;
        tracing::info!(prefix = ?config.key_prefix, "Redis kv store connected");
        Ok(Self::new(conn, config))
    }
}

/// PSETEX 不接受 0，不足 1ms 的 TTL 按 1ms 处理
fn ttl_millis(ttl: Duration) -> u64 {
    u64::try_from(ttl.as_millis()).unwrap_or(u64::MAX).max(1)
}

#[async_trait]
impl KvStorePort for RedisKvStore {
    async fn get(&self, key: &str) -> CacheResult<Option<String>> {
        let mut conn = self.conn.clone();
        conn.get(self.config.prefixed_key(key))
            .await
            .map_err(|e| CacheError::operation("get", key, format!("Redis get failed: {}", e)))
    }

    async fn set(&self, key: &str, value: &str, ttl: Option<Duration>) -> CacheResult<()> {
        let mut conn = self.conn.clone();
        let full_key = self.config.prefixed_key(key);
        match ttl {
            Some(duration) => conn
                .pset_ex(full_key, value, ttl_millis(duration))
                .await
                .map_err(|e| CacheError::operation("set", key, format!("Redis set failed: {}", e))),
            None => conn
                .set(full_key, value)
                .await
                .map_err(|e| CacheError::operation("set", key, format!("Redis set failed: {}", e))),
        }
    }

    async fn delete(&self, keys: &[String]) -> CacheResult<u64> {
        if keys.is_empty() {
            return Ok(0);
        }
        let mut conn = self.conn.clone();
        let full_keys: Vec<String> = keys.iter().map(|k| self.config.prefixed_key(k)).collect();
        conn.del(full_keys).await.map_err(|e| {
            CacheError::operation("delete", keys.join(","), format!("Redis delete failed: {}", e))
        })
    }

    async fn ping(&self) -> CacheResult<()> {
        let mut conn = self.conn.clone();
        check_connection(&mut conn).await
    }
}
