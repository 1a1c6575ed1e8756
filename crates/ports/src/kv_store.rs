//! 远程键值存储 trait 定义

use async_trait::async_trait;
use std::time::Duration;
use tiercache_errors::CacheResult;

/// 远程键值存储
///
/// 远程缓存只依赖这个端口，不关心具体协议
#[cfg_attr(feature = "mock", mockall::automock)]
#[async_trait]
pub trait KvStorePort: Send + Sync {
    /// 获取值，`Ok(None)` 表示 key 不存在
    async fn get(&self, key: &str) -> CacheResult<Option<String>>;

    /// 设置值，`ttl` 为 `None` 时不过期
    async fn set(&self, key: &str, value: &str, ttl: Option<Duration>) -> CacheResult<()>;

    /// 删除多个 key，返回实际删除的数量
    async fn delete(&self, keys: &[String]) -> CacheResult<u64>;

    /// 连通性检查
    async fn ping(&self) -> CacheResult<()>;

    /// 释放底层连接
    async fn close(&self) -> CacheResult<()> {
        Ok(())
    }
}
