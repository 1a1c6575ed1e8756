//! 序列化 trait 定义

use serde_json::Value;
use tiercache_errors::CacheResult;

/// 可插拔的值序列化器，由宿主应用提供
pub trait Serializer: Send + Sync {
    /// 序列化器名称（用于日志）
    fn name(&self) -> &str;

    fn marshal(&self, value: &Value) -> CacheResult<Vec<u8>>;

    fn unmarshal(&self, bytes: &[u8]) -> CacheResult<Value>;
}
