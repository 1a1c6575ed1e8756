//! tiercache-errors - 统一错误处理
//!
//! 缓存子系统的错误分类：未命中、已关闭、序列化、保护拦截、后端失败、聚合错误

use thiserror::Error;

/// 缓存错误类型
///
/// 需要 `Clone`：单飞合并的等待者共享同一个结果
#[derive(Debug, Clone, Error, PartialEq)]
pub enum CacheError {
    #[error("cache: key not found")]
    KeyNotFound,

    #[error("cache: cache is closed")]
    Closed,

    #[error("cache: serialization failed: {0}")]
    Serialization(String),

    #[error("cache: deserialization failed: {0}")]
    Deserialization(String),

    /// 布隆过滤器判定 key 一定不存在（穿透保护）
    #[error("cache key '{key}' definitely does not exist")]
    RejectedByBloomFilter { key: String },

    /// 熔断器打开（雪崩保护）
    #[error("circuit breaker is open: {0}")]
    CircuitBreakerOpen(String),

    /// 远程存储明确返回 key 不存在
    #[error("cache key '{key}' is nil in remote store")]
    RemoteNil { key: String },

    /// 后端操作失败
    #[error("{}", describe_operation(.op, .key, .message))]
    Operation {
        op: String,
        key: String,
        message: String,
    },

    #[error("cache {op} operation timed out")]
    Timeout { op: String },

    #[error("invalid cache option: {0}")]
    Validation(String),

    #[error("worker pool '{pool}' is exhausted")]
    PoolExhausted { pool: String },

    #[error("cache configuration error: {0}")]
    Config(String),

    /// 标注失败所在的缓存层
    #[error("{tier} {source}")]
    Tier {
        tier: String,
        source: Box<CacheError>,
    },

    #[error("{context}: [{}]", join_errors(.errors))]
    Aggregate {
        context: String,
        errors: Vec<CacheError>,
    },
}

fn describe_operation(op: &str, key: &str, message: &str) -> String {
    if key.is_empty() {
        format!("cache {} operation failed: {}", op, message)
    } else {
        format!("cache {} operation failed for key '{}': {}", op, key, message)
    }
}

fn join_errors(errors: &[CacheError]) -> String {
    errors
        .iter()
        .map(ToString::to_string)
        .collect::<Vec<_>>()
        .join("; ")
}

impl CacheError {
    pub fn operation(
        op: impl Into<String>,
        key: impl Into<String>,
        message: impl Into<String>,
    ) -> Self {
        Self::Operation {
            op: op.into(),
            key: key.into(),
            message: message.into(),
        }
    }

    pub fn serialization(msg: impl Into<String>) -> Self {
        Self::Serialization(msg.into())
    }

    pub fn deserialization(msg: impl Into<String>) -> Self {
        Self::Deserialization(msg.into())
    }

    pub fn rejected_by_bloom_filter(key: impl Into<String>) -> Self {
        Self::RejectedByBloomFilter { key: key.into() }
    }

    pub fn circuit_breaker_open(msg: impl Into<String>) -> Self {
        Self::CircuitBreakerOpen(msg.into())
    }

    pub fn remote_nil(key: impl Into<String>) -> Self {
        Self::RemoteNil { key: key.into() }
    }

    pub fn timeout(op: impl Into<String>) -> Self {
        Self::Timeout { op: op.into() }
    }

    pub fn validation(msg: impl Into<String>) -> Self {
        Self::Validation(msg.into())
    }

    pub fn pool_exhausted(pool: impl Into<String>) -> Self {
        Self::PoolExhausted { pool: pool.into() }
    }

    pub fn config(msg: impl Into<String>) -> Self {
        Self::Config(msg.into())
    }

    pub fn in_tier(tier: impl Into<String>, source: CacheError) -> Self {
        Self::Tier {
            tier: tier.into(),
            source: Box::new(source),
        }
    }

    /// 将多个错误聚合为一个；没有错误时返回 `Ok(())`
    pub fn aggregate(context: impl Into<String>, errors: Vec<CacheError>) -> CacheResult<()> {
        if errors.is_empty() {
            Ok(())
        } else {
            Err(Self::Aggregate {
                context: context.into(),
                errors,
            })
        }
    }

    /// 普通未命中（本地未找到或远程 nil）
    pub fn is_miss(&self) -> bool {
        match self {
            Self::KeyNotFound | Self::RemoteNil { .. } => true,
            Self::Tier { source, .. } => source.is_miss(),
            _ => false,
        }
    }

    /// 保护机制拦截（布隆过滤器或熔断器）
    pub fn is_protection(&self) -> bool {
        match self {
            Self::RejectedByBloomFilter { .. } | Self::CircuitBreakerOpen(_) => true,
            Self::Tier { source, .. } => source.is_protection(),
            _ => false,
        }
    }

    /// 剥离层标注，返回原始错误
    pub fn root(&self) -> &CacheError {
        match self {
            Self::Tier { source, .. } => source.root(),
            other => other,
        }
    }
}

/// Result 类型别名
pub type CacheResult<T> = Result<T, CacheError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_operation_message_with_and_without_key() {
        let err = CacheError::operation("get", "user:1", "connection refused");
        assert_eq!(
            err.to_string(),
            "cache get operation failed for key 'user:1': connection refused"
        );

        let err = CacheError::operation("create", "", "bad capacity");
        assert_eq!(err.to_string(), "cache create operation failed: bad capacity");
    }

    #[test]
    fn test_aggregate_empty_is_ok() {
        assert!(CacheError::aggregate("close errors", vec![]).is_ok());
    }

    #[test]
    fn test_aggregate_lists_every_error() {
        let err = CacheError::aggregate(
            "cache set errors",
            vec![
                CacheError::in_tier("local", CacheError::Closed),
                CacheError::in_tier("remote", CacheError::timeout("set")),
            ],
        )
        .unwrap_err();

        let msg = err.to_string();
        assert!(msg.starts_with("cache set errors"));
        assert!(msg.contains("local cache: cache is closed"));
        assert!(msg.contains("remote cache set operation timed out"));
    }

    #[test]
    fn test_predicates_look_through_tier() {
        let miss = CacheError::in_tier("remote", CacheError::remote_nil("k"));
        assert!(miss.is_miss());
        assert!(!miss.is_protection());

        let open = CacheError::in_tier("remote", CacheError::circuit_breaker_open("open state"));
        assert!(open.is_protection());
        assert_eq!(open.root(), &CacheError::circuit_breaker_open("open state"));
    }
}
