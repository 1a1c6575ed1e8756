//! 缓存基础设施装配
//!
//! 根据配置连接远程存储，构建保护组件、任务池和各级缓存，注册到 [`CacheRegistry`]

use std::sync::Arc;

use secrecy::ExposeSecret;
use tiercache::{
    BloomFilter, BreakerSettings, CacheRegistry, CircuitBreaker, JsonSerializer, LocalCache,
    LocalCacheConfig, OptionPool, RemoteCache, ShardedBloomFilter, StableBloomFilter,
    TieredCache, TieredCacheConfig, TripPolicy, WorkerPoolConfig,
};
use tiercache_adapter_memory::MemoryKvStore;
use tiercache_adapter_redis::{RedisKvStore, RedisStoreConfig};
use tiercache_config::{
    BackendKind, BloomFilterKind, CacheSettings, CircuitBreakerSettings, ProtectionSettings,
    WorkerPoolSettings,
};
use tiercache_errors::CacheResult;
use tiercache_ports::KvStorePort;
use tracing::info;

use crate::retry::{RetryConfig, with_retry};

/// 按配置连接远程存储（Redis 连接带重试）
pub async fn connect_store(settings: &CacheSettings) -> CacheResult<Arc<dyn KvStorePort>> {
    match settings.remote.backend {
        BackendKind::Memory => {
            info!("Using in-memory kv store");
            Ok(Arc::new(MemoryKvStore::new()))
        }
        BackendKind::Redis => {
            let redis = &settings.remote.redis;
            let mut config = RedisStoreConfig::new(redis.url.expose_secret().as_str())
                .with_connect_timeout(redis.connect_timeout());
            if let Some(prefix) = &redis.key_prefix {
                config = config.with_key_prefix(prefix.as_str());
            }

            let store = with_retry(&RetryConfig::default(), "Redis connection", || {
                RedisKvStore::connect(config.clone())
            })
            .await?;
            Ok(Arc::new(store))
        }
    }
}

/// 构建全部缓存实例并注册
pub fn build_registry(
    settings: &CacheSettings,
    store: Arc<dyn KvStorePort>,
) -> CacheResult<CacheRegistry> {
    let options = OptionPool::new(settings.option_pool.max_idle);

    let local = Arc::new(LocalCache::new(LocalCacheConfig {
        max_cost: settings.local.max_cost,
        initial_capacity: settings.local.initial_capacity,
    }));

    let protection = &settings.remote.protection;
    let mut remote = RemoteCache::new(store);
    if protection.enable {
        remote = remote
            .with_bloom_filter(build_bloom_filter(protection)?)
            .with_circuit_breaker(Arc::new(build_circuit_breaker(&protection.circuit_breaker)));
        info!(
            bloom_filter = ?protection.bloom_filter,
            breaker = %protection.circuit_breaker.name,
            "Remote cache protection enabled"
        );
    }
    let remote = Arc::new(remote);

    let tiered = Arc::new(TieredCache::new(
        local.clone(),
        remote.clone(),
        options.clone(),
        TieredCacheConfig {
            local_pool: pool_config(&settings.async_pool.local),
            remote_pool: pool_config(&settings.async_pool.remote),
            drain_timeout: settings.async_pool.drain_timeout(),
        },
    )?);

    info!(
        max_cost = settings.local.max_cost,
        local_pool = settings.async_pool.local.size,
        remote_pool = settings.async_pool.remote.size,
        "Cache registry built"
    );

    Ok(CacheRegistry::builder()
        .local(local)
        .remote(remote)
        .tiered(tiered)
        .option_pool(options)
        .serializer(Arc::new(JsonSerializer))
        .build())
}

fn build_bloom_filter(protection: &ProtectionSettings) -> CacheResult<Arc<dyn BloomFilter>> {
    let filter: Arc<dyn BloomFilter> = match protection.bloom_filter {
        BloomFilterKind::Sharded => {
            let s = &protection.sharded_bloom;
            Arc::new(ShardedBloomFilter::new(s.shards, s.est_per_shard, s.fp_rate)?)
        }
        BloomFilterKind::Stable => {
            let s = &protection.stable_bloom;
            Arc::new(StableBloomFilter::new(s.capacity, s.error_rate, s.evict_rate)?)
        }
    };
    Ok(filter)
}

fn build_circuit_breaker(settings: &CircuitBreakerSettings) -> CircuitBreaker {
    CircuitBreaker::new(BreakerSettings {
        name: settings.name.clone(),
        max_requests: settings.max_requests,
        interval: settings.interval(),
        timeout: settings.timeout(),
        trip_policy: TripPolicy {
            min_samples: settings.min_samples,
            max_failure_rate: settings.max_failure_rate,
            max_consecutive_failures: settings.max_consecutive_failures,
            hard_consecutive_failures: settings.hard_consecutive_failures,
        },
        ..Default::default()
    })
}

fn pool_config(settings: &WorkerPoolSettings) -> WorkerPoolConfig {
    WorkerPoolConfig {
        size: settings.size,
        nonblocking: settings.nonblocking,
        max_blocking_tasks: settings.max_blocking_tasks,
    }
}
