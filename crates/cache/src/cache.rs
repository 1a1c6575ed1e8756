//! 缓存统一契约
//!
//! 本地缓存、远程缓存、二级缓存都实现 [`CachePort`]

use std::fmt;

use async_trait::async_trait;
use serde_json::Value;
use tiercache_errors::{CacheError, CacheResult};

use crate::context::CallContext;
use crate::option::CacheOption;

/// 缓存级别
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum Level {
    Local = 1,
    Remote = 2,
    /// 本地 + 远程二级缓存
    Tiered = 3,
}

impl Level {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Local => "local",
            Self::Remote => "remote",
            Self::Tiered => "tiered",
        }
    }
}

impl fmt::Display for Level {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl TryFrom<u8> for Level {
    type Error = CacheError;

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        match value {
            1 => Ok(Self::Local),
            2 => Ok(Self::Remote),
            3 => Ok(Self::Tiered),
            other => Err(CacheError::validation(format!(
                "invalid cache level: {}, must be one of [1, 2, 3]",
                other
            ))),
        }
    }
}

/// 二级缓存写入同步策略
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum SyncStrategy {
    /// 同步双写
    WriteBoth = 1,
    /// 只同步写远程，本地在下一次读未命中时回填
    #[default]
    WriteRemoteOnly = 2,
    /// 异步双写
    AsyncWriteBoth = 3,
    /// 只异步写远程
    AsyncWriteRemoteOnly = 4,
}

impl SyncStrategy {
    pub fn is_async(&self) -> bool {
        matches!(self, Self::AsyncWriteBoth | Self::AsyncWriteRemoteOnly)
    }
}

impl TryFrom<u8> for SyncStrategy {
    type Error = CacheError;

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        match value {
            1 => Ok(Self::WriteBoth),
            2 => Ok(Self::WriteRemoteOnly),
            3 => Ok(Self::AsyncWriteBoth),
            4 => Ok(Self::AsyncWriteRemoteOnly),
            other => Err(CacheError::validation(format!(
                "invalid sync strategy: {}, must be one of [1, 2, 3, 4]",
                other
            ))),
        }
    }
}

/// 写入缓存的值
///
/// 文本直接存储，其余类型经选项中的序列化器编码
#[derive(Debug, Clone, PartialEq)]
pub enum CacheValue {
    Text(String),
    Bytes(Vec<u8>),
    Json(Value),
}

impl From<String> for CacheValue {
    fn from(value: String) -> Self {
        Self::Text(value)
    }
}

impl From<&str> for CacheValue {
    fn from(value: &str) -> Self {
        Self::Text(value.to_string())
    }
}

impl From<Vec<u8>> for CacheValue {
    fn from(value: Vec<u8>) -> Self {
        Self::Bytes(value)
    }
}

impl From<Value> for CacheValue {
    fn from(value: Value) -> Self {
        Self::Json(value)
    }
}

/// 缓存契约
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait CachePort: Send + Sync {
    /// 获取原始存储值；反序列化由调用方完成
    async fn get(&self, ctx: &CallContext, key: &str, opt: &CacheOption) -> CacheResult<String>;

    async fn set(
        &self,
        ctx: &CallContext,
        key: &str,
        value: CacheValue,
        opt: &CacheOption,
    ) -> CacheResult<()>;

    async fn delete(&self, ctx: &CallContext, keys: &[String]) -> CacheResult<()>;

    /// 关闭缓存，之后所有操作返回 `CacheError::Closed`
    async fn close(&self) -> CacheResult<()>;

    /// 等待内部缓冲的写入对后续读取可见
    async fn wait(&self) -> CacheResult<()>;

    fn level(&self) -> Level;
}
