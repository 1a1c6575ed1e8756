//! 缓存选项
//!
//! 每次逻辑缓存操作一个选项：级别、同步策略、保护开关、缓存 key、TTL、序列化器。
//! 选项通过 [`OptionPool`](crate::option_pool::OptionPool) 复用。

use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use serde::Serialize;
use tiercache_errors::{CacheError, CacheResult};
use tiercache_ports::Serializer;

use crate::cache::{Level, SyncStrategy};
use crate::codec::JsonSerializer;
use crate::context::CallContext;
use crate::ttl::{TtlInfo, TtlPolicy};

#[derive(Clone)]
pub struct CacheOption {
    enabled: bool,
    context: CallContext,
    level: Option<Level>,
    sync_strategy: SyncStrategy,

    /// 击穿保护
    single_flight: bool,
    /// 穿透保护
    bloom_filter: bool,
    /// 雪崩保护
    circuit_breaker: bool,

    cache_key: String,
    serializer: Option<Arc<dyn Serializer>>,

    local_ttl: TtlPolicy,
    remote_ttl: TtlPolicy,

    /// 指定缓存实例名，优先于级别解析
    default_instance_key: Option<String>,
}

impl Default for CacheOption {
    fn default() -> Self {
        Self {
            enabled: true,
            context: CallContext::background(),
            level: None,
            sync_strategy: SyncStrategy::default(),
            single_flight: false,
            bloom_filter: false,
            circuit_breaker: false,
            cache_key: String::new(),
            serializer: None,
            local_ttl: TtlPolicy::default(),
            remote_ttl: TtlPolicy::default(),
            default_instance_key: None,
        }
    }
}

impl fmt::Debug for CacheOption {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CacheOption")
            .field("enabled", &self.enabled)
            .field("level", &self.level)
            .field("sync_strategy", &self.sync_strategy)
            .field("single_flight", &self.single_flight)
            .field("bloom_filter", &self.bloom_filter)
            .field("circuit_breaker", &self.circuit_breaker)
            .field("cache_key", &self.cache_key)
            .field("serializer", &self.serializer().name())
            .field("local_ttl", &self.local_ttl)
            .field("remote_ttl", &self.remote_ttl)
            .field("default_instance_key", &self.default_instance_key)
            .finish()
    }
}

impl CacheOption {
    pub fn new() -> Self {
        Self::default()
    }

    // ===== 级别 =====

    pub fn set_level(&mut self, level: Level) -> &mut Self {
        self.level = Some(level);
        self
    }

    pub fn local(&mut self) -> &mut Self {
        self.set_level(Level::Local)
    }

    pub fn remote(&mut self) -> &mut Self {
        self.set_level(Level::Remote)
    }

    pub fn tiered(&mut self) -> &mut Self {
        self.set_level(Level::Tiered)
    }

    pub fn level(&self) -> Option<Level> {
        self.level
    }

    // ===== 同步策略 =====

    pub fn set_sync_strategy(&mut self, strategy: SyncStrategy) -> &mut Self {
        self.sync_strategy = strategy;
        self
    }

    pub fn write_both(&mut self) -> &mut Self {
        self.set_sync_strategy(SyncStrategy::WriteBoth)
    }

    pub fn write_remote_only(&mut self) -> &mut Self {
        self.set_sync_strategy(SyncStrategy::WriteRemoteOnly)
    }

    pub fn async_write_both(&mut self) -> &mut Self {
        self.set_sync_strategy(SyncStrategy::AsyncWriteBoth)
    }

    pub fn async_write_remote_only(&mut self) -> &mut Self {
        self.set_sync_strategy(SyncStrategy::AsyncWriteRemoteOnly)
    }

    pub fn sync_strategy(&self) -> SyncStrategy {
        self.sync_strategy
    }

    // ===== 保护开关 =====

    pub fn enable_single_flight(&mut self) -> &mut Self {
        self.single_flight = true;
        self
    }

    pub fn enable_bloom_filter(&mut self) -> &mut Self {
        self.bloom_filter = true;
        self
    }

    pub fn enable_circuit_breaker(&mut self) -> &mut Self {
        self.circuit_breaker = true;
        self
    }

    pub fn enable_protection_all(&mut self) -> &mut Self {
        self.enable_single_flight()
            .enable_bloom_filter()
            .enable_circuit_breaker()
    }

    pub fn single_flight_enabled(&self) -> bool {
        self.single_flight
    }

    pub fn bloom_filter_enabled(&self) -> bool {
        self.bloom_filter
    }

    pub fn circuit_breaker_enabled(&self) -> bool {
        self.circuit_breaker
    }

    // ===== 序列化器 =====

    pub fn set_serializer(&mut self, serializer: Arc<dyn Serializer>) -> &mut Self {
        self.serializer = Some(serializer);
        self
    }

    /// 未设置时使用 JSON
    pub fn serializer(&self) -> &dyn Serializer {
        match &self.serializer {
            Some(serializer) => serializer.as_ref(),
            None => &JsonSerializer,
        }
    }

    pub(crate) fn has_serializer(&self) -> bool {
        self.serializer.is_some()
    }

    // ===== TTL =====

    pub fn set_local_ttl(&mut self, ttl: Duration) -> &mut Self {
        self.local_ttl = TtlPolicy::fixed(ttl);
        self
    }

    pub fn set_local_ttl_with_random(&mut self, base: Duration, random_range: Duration) -> &mut Self {
        self.local_ttl = TtlPolicy::with_random(base, random_range);
        self
    }

    pub fn set_local_ttl_random_percent(&mut self, base: Duration, percent: f64) -> &mut Self {
        self.local_ttl = TtlPolicy::random_percent(base, percent);
        self
    }

    /// 每次调用重新计算随机 TTL
    pub fn local_ttl(&self) -> Duration {
        self.local_ttl.resolve()
    }

    pub fn local_base_ttl(&self) -> Duration {
        self.local_ttl.base()
    }

    pub fn is_local_ttl_random(&self) -> bool {
        self.local_ttl.is_random()
    }

    pub fn set_remote_ttl(&mut self, ttl: Duration) -> &mut Self {
        self.remote_ttl = TtlPolicy::fixed(ttl);
        self
    }

    pub fn set_remote_ttl_with_random(&mut self, base: Duration, random_range: Duration) -> &mut Self {
        self.remote_ttl = TtlPolicy::with_random(base, random_range);
        self
    }

    pub fn set_remote_ttl_random_percent(&mut self, base: Duration, percent: f64) -> &mut Self {
        self.remote_ttl = TtlPolicy::random_percent(base, percent);
        self
    }

    pub fn remote_ttl(&self) -> Duration {
        self.remote_ttl.resolve()
    }

    pub fn remote_base_ttl(&self) -> Duration {
        self.remote_ttl.base()
    }

    pub fn is_remote_ttl_random(&self) -> bool {
        self.remote_ttl.is_random()
    }

    /// TTL 配置调试信息
    pub fn ttl_info(&self) -> OptionTtlInfo {
        OptionTtlInfo {
            local: self.local_ttl.info(),
            remote: self.remote_ttl.info(),
        }
    }

    // ===== key / 上下文 / 实例 =====

    pub fn set_cache_key(&mut self, key: impl Into<String>) -> &mut Self {
        self.cache_key = key.into();
        self
    }

    pub fn cache_key(&self) -> &str {
        &self.cache_key
    }

    pub fn set_context(&mut self, ctx: CallContext) -> &mut Self {
        self.context = ctx;
        self
    }

    pub fn context(&self) -> CallContext {
        self.context
    }

    pub fn set_default_instance_key(&mut self, key: impl Into<String>) -> &mut Self {
        self.default_instance_key = Some(key.into());
        self
    }

    pub fn default_instance_key(&self) -> Option<&str> {
        self.default_instance_key.as_deref()
    }

    // ===== 开关 =====

    pub fn enable_cache(&mut self) -> &mut Self {
        self.enabled = true;
        self
    }

    pub fn disable_cache(&mut self) -> &mut Self {
        self.enabled = false;
        self
    }

    pub fn is_enabled(&self) -> bool {
        self.enabled
    }

    /// 校验选项：必须设置级别和非空 key
    pub fn validate(&self) -> CacheResult<()> {
        if self.level.is_none() {
            return Err(CacheError::validation(
                "cache level is required, must be one of [local, remote, tiered]",
            ));
        }
        if self.cache_key.is_empty() {
            return Err(CacheError::validation("cache key is required"));
        }
        Ok(())
    }

    /// 恢复默认值，保留 key 的内存分配
    pub fn reset(&mut self) {
        self.enabled = true;
        self.context = CallContext::background();
        self.level = None;
        self.sync_strategy = SyncStrategy::default();
        self.single_flight = false;
        self.bloom_filter = false;
        self.circuit_breaker = false;
        self.cache_key.clear();
        self.serializer = None;
        self.local_ttl = TtlPolicy::default();
        self.remote_ttl = TtlPolicy::default();
        self.default_instance_key = None;
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct OptionTtlInfo {
    pub local: TtlInfo,
    pub remote: TtlInfo,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let opt = CacheOption::new();
        assert!(opt.is_enabled());
        assert_eq!(opt.level(), None);
        assert_eq!(opt.sync_strategy(), SyncStrategy::WriteRemoteOnly);
        assert!(!opt.single_flight_enabled());
        assert_eq!(opt.serializer().name(), "json");
    }

    #[test]
    fn test_validate_requires_level_and_key() {
        let mut opt = CacheOption::new();
        assert!(matches!(opt.validate(), Err(CacheError::Validation(_))));

        opt.tiered();
        let err = opt.validate().unwrap_err();
        assert_eq!(err, CacheError::validation("cache key is required"));

        opt.set_cache_key("user:1");
        assert!(opt.validate().is_ok());
    }

    #[test]
    fn test_chained_configuration() {
        let mut opt = CacheOption::new();
        opt.tiered()
            .set_cache_key("session:abc")
            .set_local_ttl_with_random(Duration::from_secs(900), Duration::from_secs(180))
            .set_remote_ttl(Duration::from_secs(3600))
            .async_write_both()
            .enable_protection_all();

        assert_eq!(opt.level(), Some(Level::Tiered));
        assert_eq!(opt.cache_key(), "session:abc");
        assert!(opt.is_local_ttl_random());
        assert!(!opt.is_remote_ttl_random());
        assert_eq!(opt.local_base_ttl(), Duration::from_secs(900));
        assert_eq!(opt.remote_ttl(), Duration::from_secs(3600));
        assert_eq!(opt.sync_strategy(), SyncStrategy::AsyncWriteBoth);
        assert!(opt.single_flight_enabled());
        assert!(opt.bloom_filter_enabled());
        assert!(opt.circuit_breaker_enabled());
    }

    #[test]
    fn test_reset_restores_defaults() {
        let mut opt = CacheOption::new();
        opt.remote()
            .set_cache_key("k")
            .write_both()
            .enable_bloom_filter()
            .disable_cache()
            .set_default_instance_key("orders")
            .set_serializer(Arc::new(JsonSerializer));

        opt.reset();

        assert!(opt.is_enabled());
        assert_eq!(opt.level(), None);
        assert_eq!(opt.cache_key(), "");
        assert_eq!(opt.sync_strategy(), SyncStrategy::WriteRemoteOnly);
        assert!(!opt.bloom_filter_enabled());
        assert_eq!(opt.default_instance_key(), None);
        assert!(!opt.has_serializer());
        assert_eq!(opt.remote_base_ttl(), Duration::ZERO);
    }

    #[test]
    fn test_ttl_info_reports_both_tiers() {
        let mut opt = CacheOption::new();
        opt.set_local_ttl_random_percent(Duration::from_secs(10), 0.1)
            .set_remote_ttl(Duration::from_secs(60));

        let info = opt.ttl_info();
        assert!(info.local.use_random);
        assert_eq!(info.local.random_range, Duration::from_secs(1));
        assert_eq!(info.remote.current_ttl, Duration::from_secs(60));
    }
}
