//! 二级缓存
//!
//! 组合本地缓存与远程缓存：
//! - 读：本地命中直接返回，否则查远程并回写本地
//! - 写：按同步策略同步双写、只写远程或提交到后台任务池
//! - 关闭：任务池停止接收新任务，限时等待排空，再关闭两层缓存

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use serde::Serialize;
use tiercache_errors::{CacheError, CacheResult};

use crate::cache::{CachePort, CacheValue, Level, SyncStrategy};
use crate::context::CallContext;
use crate::metrics;
use crate::option::CacheOption;
use crate::option_pool::OptionPool;
use crate::worker_pool::{PoolStats, WorkerPool, WorkerPoolConfig};

/// 异步写本地的截止时间
const ASYNC_LOCAL_TIMEOUT: Duration = Duration::from_secs(1);
/// 异步写远程的截止时间
const ASYNC_REMOTE_TIMEOUT: Duration = Duration::from_secs(3);

#[derive(Debug, Clone)]
pub struct TieredCacheConfig {
    pub local_pool: WorkerPoolConfig,
    pub remote_pool: WorkerPoolConfig,
    /// 关闭时等待异步任务结束的上限
    pub drain_timeout: Duration,
}

impl Default for TieredCacheConfig {
    fn default() -> Self {
        Self {
            local_pool: WorkerPoolConfig::default(),
            remote_pool: WorkerPoolConfig {
                size: 512,
                ..WorkerPoolConfig::default()
            },
            drain_timeout: Duration::from_secs(5),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct TieredPoolStats {
    pub local_pool: PoolStats,
    pub remote_pool: PoolStats,
    pub total_capacity: usize,
    pub total_running: usize,
}

pub struct TieredCache {
    local: Arc<dyn CachePort>,
    remote: Arc<dyn CachePort>,
    options: Arc<OptionPool>,
    local_pool: WorkerPool,
    remote_pool: WorkerPool,
    drain_timeout: Duration,
    closed: AtomicBool,
}

impl TieredCache {
    pub fn new(
        local: Arc<dyn CachePort>,
        remote: Arc<dyn CachePort>,
        options: Arc<OptionPool>,
        config: TieredCacheConfig,
    ) -> CacheResult<Self> {
        let local_pool = WorkerPool::new("local", config.local_pool)?;
        let remote_pool = WorkerPool::new("remote", config.remote_pool)?;

        Ok(Self {
            local,
            remote,
            options,
            local_pool,
            remote_pool,
            drain_timeout: config.drain_timeout,
            closed: AtomicBool::new(false),
        })
    }

    pub fn local(&self) -> &Arc<dyn CachePort> {
        &self.local
    }

    pub fn remote(&self) -> &Arc<dyn CachePort> {
        &self.remote
    }

    pub fn pool_stats(&self) -> TieredPoolStats {
        let local_pool = self.local_pool.stats();
        let remote_pool = self.remote_pool.stats();
        TieredPoolStats {
            total_capacity: local_pool.capacity + remote_pool.capacity,
            total_running: local_pool.running + remote_pool.running,
            local_pool,
            remote_pool,
        }
    }

    fn ensure_open(&self) -> CacheResult<()> {
        if self.closed.load(Ordering::Acquire) {
            Err(CacheError::Closed)
        } else {
            Ok(())
        }
    }

    /// 远程命中后回写本地
    async fn write_back(&self, ctx: &CallContext, key: &str, value: &str, opt: &CacheOption) {
        if opt.sync_strategy().is_async() {
            self.submit_local(ctx, key, CacheValue::Text(value.to_string()), opt)
                .await;
            return;
        }

        if let Err(e) = self.local.set(ctx, key, value.into(), opt).await {
            metrics::record_writeback_failure("local");
            tracing::info!(key = %key, error = %e, "Local write-back failed");
        }
    }

    async fn submit_local(&self, ctx: &CallContext, key: &str, value: CacheValue, opt: &CacheOption) {
        let task_opt = self.options.fork(opt);
        let task_ctx = ctx.child_with_timeout(ASYNC_LOCAL_TIMEOUT);
        let local = Arc::clone(&self.local);
        let task_key = key.to_string();

        let task = async move {
            if let Err(e) = local.set(&task_ctx, &task_key, value, &task_opt).await {
                metrics::record_writeback_failure("local");
                tracing::error!(key = %task_key, error = %e, "Async local set failed");
            }
        };

        if let Err(e) = self.local_pool.submit(task).await {
            metrics::record_submit_failure(self.local_pool.name());
            tracing::error!(key = %key, error = %e, "Async local set submit failed");
        }
    }

    async fn submit_remote(&self, ctx: &CallContext, key: &str, value: CacheValue, opt: &CacheOption) {
        let task_opt = self.options.fork(opt);
        let task_ctx = ctx.child_with_timeout(ASYNC_REMOTE_TIMEOUT);
        let remote = Arc::clone(&self.remote);
        let task_key = key.to_string();

        let task = async move {
            if let Err(e) = remote.set(&task_ctx, &task_key, value, &task_opt).await {
                metrics::record_writeback_failure("remote");
                tracing::error!(key = %task_key, error = %e, "Async remote set failed");
            }
        };

        if let Err(e) = self.remote_pool.submit(task).await {
            metrics::record_submit_failure(self.remote_pool.name());
            tracing::error!(key = %key, error = %e, "Async remote set submit failed");
        }
    }
}

#[async_trait]
impl CachePort for TieredCache {
    async fn get(&self, ctx: &CallContext, key: &str, opt: &CacheOption) -> CacheResult<String> {
        self.ensure_open()?;

        match self.local.get(ctx, key, opt).await {
            Ok(value) => return Ok(value),
            Err(CacheError::KeyNotFound) => {}
            Err(e) => tracing::debug!(key = %key, error = %e, "Local tier read failed, trying remote"),
        }

        let value = self.remote.get(ctx, key, opt).await?;
        self.write_back(ctx, key, &value, opt).await;
        Ok(value)
    }

    async fn set(
        &self,
        ctx: &CallContext,
        key: &str,
        value: CacheValue,
        opt: &CacheOption,
    ) -> CacheResult<()> {
        self.ensure_open()?;

        match opt.sync_strategy() {
            SyncStrategy::WriteBoth => {
                let (local, remote) = tokio::join!(
                    self.local.set(ctx, key, value.clone(), opt),
                    self.remote.set(ctx, key, value, opt)
                );
                let errors = [("local", local), ("remote", remote)]
                    .into_iter()
                    .filter_map(|(tier, result)| result.err().map(|e| CacheError::in_tier(tier, e)))
                    .collect();
                CacheError::aggregate("cache set errors", errors)
            }
            SyncStrategy::WriteRemoteOnly => self.remote.set(ctx, key, value, opt).await,
            SyncStrategy::AsyncWriteBoth => {
                self.submit_local(ctx, key, value.clone(), opt).await;
                self.submit_remote(ctx, key, value, opt).await;
                Ok(())
            }
            SyncStrategy::AsyncWriteRemoteOnly => {
                self.submit_remote(ctx, key, value, opt).await;
                Ok(())
            }
        }
    }

    async fn delete(&self, ctx: &CallContext, keys: &[String]) -> CacheResult<()> {
        self.ensure_open()?;

        let (local, remote) = tokio::join!(
            self.local.delete(ctx, keys),
            self.remote.delete(ctx, keys)
        );
        let errors = [("local", local), ("remote", remote)]
            .into_iter()
            .filter_map(|(tier, result)| result.err().map(|e| CacheError::in_tier(tier, e)))
            .collect();
        CacheError::aggregate("cache delete errors", errors)
    }

    /// 重复关闭返回 `Ok`
    async fn close(&self) -> CacheResult<()> {
        if self.closed.swap(true, Ordering::AcqRel) {
            return Ok(());
        }

        let mut errors = Vec::new();

        // 先拒绝新提交，再等待已登记的任务
        self.local_pool.close();
        self.remote_pool.close();
        let (local_drain, remote_drain) = tokio::join!(
            self.local_pool.drain(self.drain_timeout),
            self.remote_pool.drain(self.drain_timeout)
        );
        for result in [local_drain, remote_drain] {
            if let Err(e) = result {
                tracing::warn!(error = %e, "Async tasks still running at close");
                errors.push(e);
            }
        }

        if let Err(e) = self.local.close().await {
            errors.push(CacheError::in_tier("local", e));
        }
        if let Err(e) = self.remote.close().await {
            errors.push(CacheError::in_tier("remote", e));
        }

        tracing::info!(errors = errors.len(), "Tiered cache closed");
        CacheError::aggregate("close errors", errors)
    }

    /// 等待异步写入结束，再等待两层缓存
    async fn wait(&self) -> CacheResult<()> {
        self.ensure_open()?;

        tokio::join!(self.local_pool.wait_idle(), self.remote_pool.wait_idle());

        let (local, remote) = tokio::join!(self.local.wait(), self.remote.wait());
        let errors = [("local", local), ("remote", remote)]
            .into_iter()
            .filter_map(|(tier, result)| result.err().map(|e| CacheError::in_tier(tier, e)))
            .collect();
        CacheError::aggregate("cache wait errors", errors)
    }

    fn level(&self) -> Level {
        Level::Tiered
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cache::MockCachePort;
    use crate::local::{LocalCache, LocalCacheConfig};
    use crate::remote::RemoteCache;
    use tiercache_adapter_memory::MemoryKvStore;
    use tiercache_ports::KvStorePort;

    struct Fixture {
        store: Arc<MemoryKvStore>,
        local: Arc<LocalCache>,
        options: Arc<OptionPool>,
        cache: TieredCache,
    }

    fn fixture() -> Fixture {
        let store = Arc::new(MemoryKvStore::new());
        let local = Arc::new(LocalCache::new(LocalCacheConfig::default()));
        let remote = Arc::new(RemoteCache::new(store.clone()));
        let options = OptionPool::new(16);
        let cache = TieredCache::new(
            local.clone(),
            remote,
            options.clone(),
            TieredCacheConfig::default(),
        )
        .unwrap();
        Fixture {
            store,
            local,
            options,
            cache,
        }
    }

    fn option(key: &str) -> CacheOption {
        let mut opt = CacheOption::new();
        opt.tiered().set_cache_key(key);
        opt
    }

    #[tokio::test]
    async fn test_remote_hit_is_written_back_to_local() {
        let f = fixture();
        let ctx = CallContext::background();
        f.store.set("k", "v", None).await.unwrap();

        assert_eq!(f.cache.get(&ctx, "k", &option("k")).await.unwrap(), "v");
        f.local.wait().await.unwrap();
        assert_eq!(f.local.get(&ctx, "k", &option("k")).await.unwrap(), "v");

        // 第二次读本地命中，不再访问远程
        assert_eq!(f.cache.get(&ctx, "k", &option("k")).await.unwrap(), "v");
        assert_eq!(f.store.get_calls(), 1);
    }

    #[tokio::test]
    async fn test_write_remote_only_leaves_local_empty() {
        let f = fixture();
        let ctx = CallContext::background();
        let opt = option("k");

        f.cache.set(&ctx, "k", "v".into(), &opt).await.unwrap();
        assert_eq!(f.store.peek("k").as_deref(), Some("v"));
        assert_eq!(
            f.local.get(&ctx, "k", &opt).await.unwrap_err(),
            CacheError::KeyNotFound
        );
    }

    #[tokio::test]
    async fn test_write_both_reaches_both_tiers() {
        let f = fixture();
        let ctx = CallContext::background();
        let mut opt = option("k");
        opt.write_both();

        f.cache.set(&ctx, "k", "v".into(), &opt).await.unwrap();
        f.local.wait().await.unwrap();
        assert_eq!(f.local.get(&ctx, "k", &opt).await.unwrap(), "v");
        assert_eq!(f.store.peek("k").as_deref(), Some("v"));
    }

    #[tokio::test]
    async fn test_write_both_aggregates_tier_errors() {
        let mut local = MockCachePort::new();
        local
            .expect_set()
            .returning(|_, _, _, _| Err(CacheError::Closed));
        let mut remote = MockCachePort::new();
        remote
            .expect_set()
            .returning(|_, key, _, _| Err(CacheError::operation("set", key, "connection reset")));

        let cache = TieredCache::new(
            Arc::new(local),
            Arc::new(remote),
            OptionPool::new(4),
            TieredCacheConfig::default(),
        )
        .unwrap();
        let mut opt = option("k");
        opt.write_both();

        let err = cache
            .set(&CallContext::background(), "k", "v".into(), &opt)
            .await
            .unwrap_err();
        match &err {
            CacheError::Aggregate { errors, .. } => assert_eq!(errors.len(), 2),
            other => panic!("unexpected error: {other:?}"),
        }
        let msg = err.to_string();
        assert!(msg.contains("local cache: cache is closed"));
        assert!(msg.contains("remote cache set operation failed for key 'k'"));
    }

    #[tokio::test]
    async fn test_write_both_keeps_surviving_tier_on_partial_failure() {
        let f = fixture();
        let ctx = CallContext::background();
        let mut opt = option("k");
        opt.write_both();
        f.store.set_fail_writes(true);

        let err = f.cache.set(&ctx, "k", "v".into(), &opt).await.unwrap_err();
        match &err {
            CacheError::Aggregate { context, errors } => {
                assert_eq!(context, "cache set errors");
                assert_eq!(errors.len(), 1);
                assert!(errors[0].to_string().starts_with("remote "));
            }
            other => panic!("unexpected error: {other:?}"),
        }

        f.local.wait().await.unwrap();
        assert_eq!(f.local.get(&ctx, "k", &opt).await.unwrap(), "v");
        assert!(f.store.peek("k").is_none());
    }

    #[tokio::test]
    async fn test_async_write_remote_only_read_fills_local() {
        let f = fixture();
        let ctx = CallContext::background();
        let mut opt = option("k");
        opt.async_write_remote_only();

        f.cache.set(&ctx, "k", "v".into(), &opt).await.unwrap();
        f.cache.wait().await.unwrap();
        assert_eq!(f.store.peek("k").as_deref(), Some("v"));
        assert_eq!(
            f.local.get(&ctx, "k", &opt).await.unwrap_err(),
            CacheError::KeyNotFound
        );

        assert_eq!(f.cache.get(&ctx, "k", &opt).await.unwrap(), "v");
        f.cache.wait().await.unwrap();
        assert_eq!(f.local.get(&ctx, "k", &opt).await.unwrap(), "v");
        assert_eq!(f.store.get_calls(), 1);
    }

    #[tokio::test]
    async fn test_async_write_both_visible_after_wait() {
        let f = fixture();
        let ctx = CallContext::background();
        let mut opt = option("k");
        opt.async_write_both();

        f.cache.set(&ctx, "k", "v".into(), &opt).await.unwrap();
        f.cache.wait().await.unwrap();

        assert_eq!(f.local.get(&ctx, "k", &opt).await.unwrap(), "v");
        assert_eq!(f.store.peek("k").as_deref(), Some("v"));
        // 异步任务结束后副本归还到池中
        assert_eq!(f.options.idle_count(), 2);
    }

    #[tokio::test]
    async fn test_async_write_back_on_remote_hit() {
        let f = fixture();
        let ctx = CallContext::background();
        let mut opt = option("k");
        opt.async_write_remote_only();
        f.store.set("k", "v", None).await.unwrap();

        assert_eq!(f.cache.get(&ctx, "k", &opt).await.unwrap(), "v");
        f.cache.wait().await.unwrap();
        assert_eq!(f.local.get(&ctx, "k", &opt).await.unwrap(), "v");
    }

    #[tokio::test]
    async fn test_rejected_submission_releases_option() {
        let store = Arc::new(MemoryKvStore::new());
        store.set_latency(Duration::from_millis(200));
        let options = OptionPool::new(16);
        let cache = TieredCache::new(
            Arc::new(LocalCache::new(LocalCacheConfig::default())),
            Arc::new(RemoteCache::new(store)),
            options.clone(),
            TieredCacheConfig {
                remote_pool: WorkerPoolConfig {
                    size: 1,
                    nonblocking: true,
                    max_blocking_tasks: 0,
                },
                ..TieredCacheConfig::default()
            },
        )
        .unwrap();
        let ctx = CallContext::background();
        let mut opt = option("k");
        opt.async_write_remote_only();

        cache.set(&ctx, "a", "1".into(), &opt).await.unwrap();
        // 池已满，提交失败但调用本身成功
        cache.set(&ctx, "b", "2".into(), &opt).await.unwrap();
        assert_eq!(options.idle_count(), 1);

        cache.wait().await.unwrap();
        assert_eq!(options.idle_count(), 2);
    }

    #[tokio::test]
    async fn test_delete_clears_both_tiers() {
        let f = fixture();
        let ctx = CallContext::background();
        let mut opt = option("k");
        opt.write_both();

        f.cache.set(&ctx, "k", "v".into(), &opt).await.unwrap();
        f.cache.delete(&ctx, &["k".to_string()]).await.unwrap();

        assert!(f.local.get(&ctx, "k", &opt).await.is_err());
        assert!(f.store.peek("k").is_none());
    }

    #[tokio::test]
    async fn test_close_is_idempotent() {
        let f = fixture();
        let ctx = CallContext::background();

        f.cache.close().await.unwrap();
        assert!(f.cache.close().await.is_ok());
        assert!(f.store.is_closed());
        assert!(f.cache.pool_stats().local_pool.closed);

        assert_eq!(
            f.cache.get(&ctx, "k", &option("k")).await,
            Err(CacheError::Closed)
        );
        assert_eq!(f.cache.wait().await, Err(CacheError::Closed));
    }

    #[tokio::test]
    async fn test_close_drains_in_flight_writes_and_rejects_new_ones() {
        let f = fixture();
        let ctx = CallContext::background();
        let mut opt = option("k");
        opt.async_write_remote_only();
        f.store.set_latency(Duration::from_millis(50));

        f.cache.set(&ctx, "k", "v".into(), &opt).await.unwrap();
        f.cache.close().await.unwrap();

        let stats = f.cache.pool_stats();
        assert!(stats.local_pool.closed && stats.remote_pool.closed);
        assert_eq!(stats.total_running, 0);
        assert_eq!(f.store.set_calls(), 1);
        // 异步任务的选项副本已归还
        assert_eq!(f.options.idle_count(), 1);

        assert_eq!(
            f.cache.set(&ctx, "k", "v".into(), &opt).await,
            Err(CacheError::Closed)
        );
    }

    #[tokio::test]
    async fn test_pool_stats_totals() {
        let f = fixture();
        let stats = f.cache.pool_stats();
        assert_eq!(stats.total_capacity, 256 + 512);
        assert_eq!(stats.total_running, 0);
    }
}
