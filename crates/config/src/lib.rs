//! tiercache-config - 配置加载库
//!
//! 本地缓存、远程缓存、保护组件、异步写回池的数值配置

use std::time::Duration;

use figment::{
    Figment,
    providers::{Env, Format, Toml},
};
use secrecy::Secret;
use serde::Deserialize;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Failed to load config: {0}")]
    Load(#[from] figment::Error),

    #[error("Invalid config: {0}")]
    Invalid(String),
}

/// 本地缓存配置
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct LocalCacheSettings {
    /// 总成本上限（字节）
    pub max_cost: u64,
    /// 初始容量（条目数）
    pub initial_capacity: usize,
}

impl Default for LocalCacheSettings {
    fn default() -> Self {
        Self {
            max_cost: 64 * 1024 * 1024,
            initial_capacity: 1024,
        }
    }
}

/// 远程存储后端
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BackendKind {
    #[default]
    Redis,
    /// 进程内存储（开发、测试）
    Memory,
}

/// Redis 配置
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct RedisSettings {
    pub url: Secret<String>,
    pub key_prefix: Option<String>,
    #[serde(default = "default_connect_timeout_secs")]
    pub connect_timeout_secs: u64,
}

fn default_redis_url() -> String {
    "redis://127.0.0.1:6379".to_string()
}

fn default_connect_timeout_secs() -> u64 {
    5
}

impl Default for RedisSettings {
    fn default() -> Self {
        Self {
            url: Secret::new(default_redis_url()),
            key_prefix: None,
            connect_timeout_secs: default_connect_timeout_secs(),
        }
    }
}

impl RedisSettings {
    pub fn connect_timeout(&self) -> Duration {
        Duration::from_secs(self.connect_timeout_secs)
    }
}

/// 布隆过滤器类型
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BloomFilterKind {
    /// 分片锁布隆过滤器
    #[default]
    Sharded,
    /// 支持陈旧驱逐的稳定布隆过滤器
    Stable,
}

/// 分片布隆过滤器配置
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ShardedBloomSettings {
    pub shards: usize,
    pub est_per_shard: u64,
    pub fp_rate: f64,
}

impl Default for ShardedBloomSettings {
    fn default() -> Self {
        Self {
            shards: 16,
            est_per_shard: 100_000,
            fp_rate: 0.01,
        }
    }
}

/// 稳定布隆过滤器配置
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct StableBloomSettings {
    pub capacity: u64,
    pub error_rate: f64,
    pub evict_rate: f64,
}

impl Default for StableBloomSettings {
    fn default() -> Self {
        Self {
            capacity: 1_000_000,
            error_rate: 0.01,
            evict_rate: 0.01,
        }
    }
}

/// 熔断器配置
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct CircuitBreakerSettings {
    pub name: String,
    /// 半开状态允许的试探请求数
    pub max_requests: u32,
    /// 关闭状态下统计窗口（秒），0 表示不清零
    pub interval_secs: u64,
    /// 打开状态持续时间（秒）
    pub timeout_secs: u64,
    /// 按失败率判定前的最小样本数
    pub min_samples: u32,
    pub max_failure_rate: f64,
    /// 样本不足时的连续失败阈值
    pub max_consecutive_failures: u32,
    /// 强触发的连续失败阈值
    pub hard_consecutive_failures: u32,
}

impl Default for CircuitBreakerSettings {
    fn default() -> Self {
        Self {
            name: "cacheCircuitBreaker".to_string(),
            max_requests: 5,
            interval_secs: 60,
            timeout_secs: 30,
            min_samples: 10,
            max_failure_rate: 0.5,
            max_consecutive_failures: 10,
            hard_consecutive_failures: 5,
        }
    }
}

impl CircuitBreakerSettings {
    pub fn interval(&self) -> Duration {
        Duration::from_secs(self.interval_secs)
    }

    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_secs)
    }
}

/// 缓存保护配置
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct ProtectionSettings {
    pub enable: bool,
    pub bloom_filter: BloomFilterKind,
    pub sharded_bloom: ShardedBloomSettings,
    pub stable_bloom: StableBloomSettings,
    pub circuit_breaker: CircuitBreakerSettings,
}

/// 远程缓存配置
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct RemoteCacheSettings {
    pub backend: BackendKind,
    pub redis: RedisSettings,
    pub protection: ProtectionSettings,
}

/// 异步写回协程池配置
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct WorkerPoolSettings {
    pub size: usize,
    /// 池满时立即失败而不是等待
    pub nonblocking: bool,
    /// 阻塞提交时允许的最大等待数，0 表示不限制
    pub max_blocking_tasks: usize,
}

impl Default for WorkerPoolSettings {
    fn default() -> Self {
        Self {
            size: 256,
            nonblocking: true,
            max_blocking_tasks: 0,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct AsyncPoolSettings {
    pub local: WorkerPoolSettings,
    pub remote: WorkerPoolSettings,
    /// 关闭时等待池内任务完成的超时（毫秒）
    pub drain_timeout_ms: u64,
}

impl Default for AsyncPoolSettings {
    fn default() -> Self {
        Self {
            local: WorkerPoolSettings::default(),
            remote: WorkerPoolSettings {
                size: 512,
                ..WorkerPoolSettings::default()
            },
            drain_timeout_ms: 5_000,
        }
    }
}

impl AsyncPoolSettings {
    pub fn drain_timeout(&self) -> Duration {
        Duration::from_millis(self.drain_timeout_ms)
    }
}

/// 选项池配置
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct OptionPoolSettings {
    /// 池中保留的空闲选项上限
    pub max_idle: usize,
}

impl Default for OptionPoolSettings {
    fn default() -> Self {
        Self { max_idle: 1024 }
    }
}

/// 遥测配置
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct TelemetrySettings {
    pub log_level: String,
    pub json: bool,
    pub metrics: bool,
}

impl Default for TelemetrySettings {
    fn default() -> Self {
        Self {
            log_level: "info".to_string(),
            json: false,
            metrics: false,
        }
    }
}

/// 缓存子系统配置
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct CacheSettings {
    pub app_name: String,
    pub local: LocalCacheSettings,
    pub remote: RemoteCacheSettings,
    pub async_pool: AsyncPoolSettings,
    pub option_pool: OptionPoolSettings,
    pub telemetry: TelemetrySettings,
}

impl Default for CacheSettings {
    fn default() -> Self {
        Self {
            app_name: "tiercache".to_string(),
            local: LocalCacheSettings::default(),
            remote: RemoteCacheSettings::default(),
            async_pool: AsyncPoolSettings::default(),
            option_pool: OptionPoolSettings::default(),
            telemetry: TelemetrySettings::default(),
        }
    }
}

impl CacheSettings {
    /// 从配置文件和环境变量加载配置
    ///
    /// 依次合并 `default.toml`、`{APP_ENV}.toml` 和 `TIERCACHE_` 前缀的环境变量
    pub fn load(config_dir: &str) -> Result<Self, ConfigError> {
        let env = std::env::var("APP_ENV").unwrap_or_else(|_| "development".to_string());

        let settings: Self = Figment::new()
            .merge(Toml::file(format!("{}/default.toml", config_dir)))
            .merge(Toml::file(format!("{}/{}.toml", config_dir, env)))
            .merge(Env::prefixed("TIERCACHE_").split("__"))
            .extract()?;

        settings.validate()?;
        Ok(settings)
    }

    /// 从 TOML 字符串加载（嵌入式配置、测试）
    pub fn from_toml_str(toml: &str) -> Result<Self, ConfigError> {
        let settings: Self = Figment::new().merge(Toml::string(toml)).extract()?;
        settings.validate()?;
        Ok(settings)
    }

    /// 校验数值范围
    pub fn validate(&self) -> Result<(), ConfigError> {
        let mut problems = Vec::new();

        if self.local.max_cost == 0 {
            problems.push("local.max_cost must be > 0".to_string());
        }
        if self.async_pool.local.size == 0 {
            problems.push("async_pool.local.size must be > 0".to_string());
        }
        if self.async_pool.remote.size == 0 {
            problems.push("async_pool.remote.size must be > 0".to_string());
        }

        let protection = &self.remote.protection;
        let sharded = &protection.sharded_bloom;
        if sharded.est_per_shard == 0 {
            problems.push("sharded_bloom.est_per_shard must be > 0".to_string());
        }
        if !(sharded.fp_rate > 0.0 && sharded.fp_rate < 1.0) {
            problems.push(format!(
                "sharded_bloom.fp_rate must be in (0, 1), got {}",
                sharded.fp_rate
            ));
        }

        let stable = &protection.stable_bloom;
        if stable.capacity == 0 {
            problems.push("stable_bloom.capacity must be > 0".to_string());
        }
        if !(stable.error_rate > 0.0 && stable.error_rate < 1.0) {
            problems.push(format!(
                "stable_bloom.error_rate must be in (0, 1), got {}",
                stable.error_rate
            ));
        }
        if !(0.0..=1.0).contains(&stable.evict_rate) {
            problems.push(format!(
                "stable_bloom.evict_rate must be in [0, 1], got {}",
                stable.evict_rate
            ));
        }

        let breaker = &protection.circuit_breaker;
        if breaker.max_requests == 0 {
            problems.push("circuit_breaker.max_requests must be > 0".to_string());
        }
        if !(breaker.max_failure_rate > 0.0 && breaker.max_failure_rate <= 1.0) {
            problems.push(format!(
                "circuit_breaker.max_failure_rate must be in (0, 1], got {}",
                breaker.max_failure_rate
            ));
        }

        if problems.is_empty() {
            Ok(())
        } else {
            Err(ConfigError::Invalid(problems.join("; ")))
        }
    }
}

#[cfg(test)]
mod tests;
