//! Redis 连接管理

use std::time::Duration;

use redis::Client;
use redis::aio::ConnectionManager;
use tiercache_errors::{CacheError, CacheResult};

/// 创建 Redis 连接管理器，超时未连上返回 `CacheError::Timeout`
pub async fn create_connection_manager(
    url: &str,
    timeout: Duration,
) -> CacheResult<ConnectionManager> {
    let client = Client::open(url)
        .map_err(|e| CacheError::config(format!("Failed to create Redis client: {}", e)))?;

    tokio::time::timeout(timeout, ConnectionManager::new(client))
        .await
        .map_err(|_| CacheError::timeout("redis connect"))?
        .map_err(|e| {
            CacheError::operation(
                "connect",
                "",
                format!("Failed to create Redis connection manager: {}", e),
            )
        })
}

/// 检查 Redis 连接
pub async fn check_connection(conn: &mut ConnectionManager) -> CacheResult<()> {
    redis::cmd("PING")
        .query_async::<String>(conn)
        .await
        .map_err(|e| CacheError::operation("ping", "", format!("Redis health check failed: {}", e)))?;
    Ok(())
}
