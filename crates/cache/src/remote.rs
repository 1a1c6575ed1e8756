//! 远程缓存
//!
//! 通过 `KvStorePort` 访问远程存储，按选项启用三种保护：
//! - 单飞：合并同一 key 的并发读
//! - 布隆过滤器：过滤器判定不存在的 key 只做一次受保护的查询，确认不存在时返回 `RejectedByBloomFilter`
//! - 熔断器：只包裹读操作，写操作不经过熔断器

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use async_trait::async_trait;
use tiercache_errors::{CacheError, CacheResult};
use tiercache_ports::KvStorePort;

use crate::bloom_filter::BloomFilter;
use crate::cache::{CachePort, CacheValue, Level};
use crate::circuit_breaker::CircuitBreaker;
use crate::codec::encode_value;
use crate::context::CallContext;
use crate::metrics;
use crate::option::CacheOption;
use crate::singleflight::SingleFlight;
use crate::ttl::expiry;

/// 布隆检查查询使用独立的单飞 key，与普通读互不合并
const BLOOM_CHECK_SUFFIX: &str = "_bloom_check";

pub struct RemoteCache {
    store: Arc<dyn KvStorePort>,
    single_flight: SingleFlight<String>,
    bloom_filter: Option<Arc<dyn BloomFilter>>,
    circuit_breaker: Option<Arc<CircuitBreaker>>,
    closed: AtomicBool,
}

impl RemoteCache {
    pub fn new(store: Arc<dyn KvStorePort>) -> Self {
        Self {
            store,
            single_flight: SingleFlight::new(),
            bloom_filter: None,
            circuit_breaker: None,
            closed: AtomicBool::new(false),
        }
    }

    pub fn with_bloom_filter(mut self, filter: Arc<dyn BloomFilter>) -> Self {
        self.bloom_filter = Some(filter);
        self
    }

    pub fn with_circuit_breaker(mut self, breaker: Arc<CircuitBreaker>) -> Self {
        self.circuit_breaker = Some(breaker);
        self
    }

    pub fn bloom_filter(&self) -> Option<&Arc<dyn BloomFilter>> {
        self.bloom_filter.as_ref()
    }

    pub fn circuit_breaker(&self) -> Option<&Arc<CircuitBreaker>> {
        self.circuit_breaker.as_ref()
    }

    /// 后端连通性检查
    pub async fn ping(&self, ctx: &CallContext) -> CacheResult<()> {
        self.ensure_open()?;
        ctx.run("ping", self.store.ping()).await
    }

    fn ensure_open(&self) -> CacheResult<()> {
        if self.closed.load(Ordering::Acquire) {
            Err(CacheError::Closed)
        } else {
            Ok(())
        }
    }

    /// 本次调用生效的布隆过滤器
    fn active_bloom(&self, opt: &CacheOption) -> Option<&Arc<dyn BloomFilter>> {
        if opt.bloom_filter_enabled() {
            self.bloom_filter.as_ref()
        } else {
            None
        }
    }

    /// 读取后端，启用熔断时经过熔断器
    async fn fetch(&self, ctx: &CallContext, key: &str, opt: &CacheOption) -> CacheResult<String> {
        let load = || async move {
            match ctx.run("get", self.store.get(key)).await? {
                Some(value) => Ok(value),
                None => Err(CacheError::remote_nil(key)),
            }
        };

        match &self.circuit_breaker {
            Some(breaker) if opt.circuit_breaker_enabled() => {
                let result = breaker.call(load).await;
                if matches!(result, Err(CacheError::CircuitBreakerOpen(_))) {
                    metrics::record_protection_rejection("circuit_breaker");
                    tracing::debug!(key = %key, breaker = %breaker.name(), "Remote read rejected by circuit breaker");
                }
                result
            }
            _ => load().await,
        }
    }

    /// 过滤器判定不存在后的确认查询：存在则补记到过滤器，不存在则拒绝
    async fn fetch_unknown(
        &self,
        ctx: &CallContext,
        key: &str,
        opt: &CacheOption,
        bloom: &dyn BloomFilter,
    ) -> CacheResult<String> {
        match self.fetch(ctx, key, opt).await {
            Ok(value) => {
                bloom.add(key.as_bytes());
                Ok(value)
            }
            Err(CacheError::RemoteNil { .. }) => {
                metrics::record_protection_rejection("bloom_filter");
                Err(CacheError::rejected_by_bloom_filter(key))
            }
            Err(e) => Err(e),
        }
    }

    fn observe(&self, key: &str, result: CacheResult<String>) -> CacheResult<String> {
        let outcome = match &result {
            Ok(_) => "hit",
            Err(e) if e.is_miss() => "miss",
            Err(e) if e.is_protection() => "rejected",
            Err(e) => {
                tracing::warn!(key = %key, error = %e, "Remote cache read failed");
                "error"
            }
        };
        metrics::record_lookup(Level::Remote, outcome);
        result
    }
}

#[async_trait]
impl CachePort for RemoteCache {
    async fn get(&self, ctx: &CallContext, key: &str, opt: &CacheOption) -> CacheResult<String> {
        self.ensure_open()?;

        let bloom = self.active_bloom(opt);

        if let Some(bloom) = bloom {
            if !bloom.test(key.as_bytes()) {
                let result = if opt.single_flight_enabled() {
                    let flight_key = format!("{key}{BLOOM_CHECK_SUFFIX}");
                    self.single_flight
                        .run(&flight_key, || self.fetch_unknown(ctx, key, opt, bloom.as_ref()))
                        .await
                } else {
                    self.fetch_unknown(ctx, key, opt, bloom.as_ref()).await
                };
                return self.observe(key, result);
            }
        }

        let result = if opt.single_flight_enabled() {
            self.single_flight
                .run(key, || self.fetch(ctx, key, opt))
                .await
        } else {
            self.fetch(ctx, key, opt).await
        };

        if result.is_ok() {
            if let Some(bloom) = bloom {
                bloom.add(key.as_bytes());
            }
        }
        self.observe(key, result)
    }

    async fn set(
        &self,
        ctx: &CallContext,
        key: &str,
        value: CacheValue,
        opt: &CacheOption,
    ) -> CacheResult<()> {
        self.ensure_open()?;

        let encoded = encode_value(value, opt.serializer())?;
        let ttl = expiry(opt.remote_ttl());
        ctx.run("set", self.store.set(key, &encoded, ttl)).await?;

        if let Some(bloom) = self.active_bloom(opt) {
            bloom.add(key.as_bytes());
        }
        Ok(())
    }

    async fn delete(&self, ctx: &CallContext, keys: &[String]) -> CacheResult<()> {
        self.ensure_open()?;
        if keys.is_empty() {
            return Ok(());
        }

        let removed = ctx.run("delete", self.store.delete(keys)).await?;
        tracing::debug!(requested = keys.len(), removed, "Remote cache keys deleted");
        Ok(())
    }

    /// 重复关闭返回 `CacheError::Closed`
    async fn close(&self) -> CacheResult<()> {
        if self.closed.swap(true, Ordering::AcqRel) {
            return Err(CacheError::Closed);
        }
        self.store.close().await?;
        tracing::info!("Remote cache closed");
        Ok(())
    }

    async fn wait(&self) -> CacheResult<()> {
        self.ensure_open()
    }

    fn level(&self) -> Level {
        Level::Remote
    }
}
