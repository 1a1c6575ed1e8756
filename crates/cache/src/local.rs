//! 本地缓存
//!
//! 基于 moka 的进程内缓存：
//! - 按值的字节长度计算成本，总成本有上限
//! - 每个条目独立 TTL
//! - 关闭后所有操作返回 `CacheError::Closed`

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::time::{Duration, Instant};

use async_trait::async_trait;
use moka::Expiry;
use moka::future::Cache as MokaCache;
use serde::Serialize;
use tiercache_errors::{CacheError, CacheResult};

use crate::cache::{CachePort, CacheValue, Level};
use crate::codec::encode_value;
use crate::context::CallContext;
use crate::metrics;
use crate::option::CacheOption;
use crate::ttl::expiry;

/// 本地缓存配置
#[derive(Debug, Clone)]
pub struct LocalCacheConfig {
    /// 总成本上限（字节）
    pub max_cost: u64,
    pub initial_capacity: usize,
}

impl Default for LocalCacheConfig {
    fn default() -> Self {
        Self {
            max_cost: 64 * 1024 * 1024,
            initial_capacity: 1024,
        }
    }
}

#[derive(Clone)]
struct LocalEntry {
    value: Arc<str>,
    ttl: Option<Duration>,
}

/// 按条目 TTL 过期，更新时重新计时
struct EntryExpiry;

impl Expiry<String, LocalEntry> for EntryExpiry {
    fn expire_after_create(
        &self,
        _key: &String,
        value: &LocalEntry,
        _created_at: Instant,
    ) -> Option<Duration> {
        value.ttl
    }

    fn expire_after_update(
        &self,
        _key: &String,
        value: &LocalEntry,
        _updated_at: Instant,
        _duration_until_expiry: Option<Duration>,
    ) -> Option<Duration> {
        value.ttl
    }
}

/// 本地缓存统计信息
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct LocalCacheStats {
    pub hits: u64,
    pub misses: u64,
    pub hit_ratio: f64,
    pub sets: u64,
    pub entry_count: u64,
    pub weighted_size: u64,
}

pub struct LocalCache {
    store: MokaCache<String, LocalEntry>,
    closed: AtomicBool,
    hits: AtomicU64,
    misses: AtomicU64,
    sets: AtomicU64,
}

impl LocalCache {
    pub fn new(config: LocalCacheConfig) -> Self {
        let store = MokaCache::builder()
            .max_capacity(config.max_cost)
            .initial_capacity(config.initial_capacity)
            .weigher(|_key: &String, entry: &LocalEntry| -> u32 {
                u32::try_from(entry.value.len()).unwrap_or(u32::MAX)
            })
            .expire_after(EntryExpiry)
            .build();

        Self {
            store,
            closed: AtomicBool::new(false),
            hits: AtomicU64::new(0),
            misses: AtomicU64::new(0),
            sets: AtomicU64::new(0),
        }
    }

    fn ensure_open(&self) -> CacheResult<()> {
        if self.closed.load(Ordering::Acquire) {
            Err(CacheError::Closed)
        } else {
            Ok(())
        }
    }

    pub fn stats(&self) -> LocalCacheStats {
        let hits = self.hits.load(Ordering::Relaxed);
        let misses = self.misses.load(Ordering::Relaxed);
        let total = hits + misses;
        LocalCacheStats {
            hits,
            misses,
            hit_ratio: if total == 0 {
                0.0
            } else {
                hits as f64 / total as f64
            },
            sets: self.sets.load(Ordering::Relaxed),
            entry_count: self.store.entry_count(),
            weighted_size: self.store.weighted_size(),
        }
    }
}

#[async_trait]
impl CachePort for LocalCache {
    async fn get(&self, _ctx: &CallContext, key: &str, _opt: &CacheOption) -> CacheResult<String> {
        self.ensure_open()?;

        match self.store.get(key).await {
            Some(entry) => {
                self.hits.fetch_add(1, Ordering::Relaxed);
                metrics::record_lookup(Level::Local, "hit");
                tracing::debug!(key = %key, "Local cache hit");
                Ok(entry.value.to_string())
            }
            None => {
                self.misses.fetch_add(1, Ordering::Relaxed);
                metrics::record_lookup(Level::Local, "miss");
                Err(CacheError::KeyNotFound)
            }
        }
    }

    async fn set(
        &self,
        _ctx: &CallContext,
        key: &str,
        value: CacheValue,
        opt: &CacheOption,
    ) -> CacheResult<()> {
        self.ensure_open()?;

        let encoded = encode_value(value, opt.serializer())?;
        let entry = LocalEntry {
            value: Arc::from(encoded),
            ttl: expiry(opt.local_ttl()),
        };
        self.store.insert(key.to_string(), entry).await;
        self.sets.fetch_add(1, Ordering::Relaxed);
        Ok(())
    }

    async fn delete(&self, _ctx: &CallContext, keys: &[String]) -> CacheResult<()> {
        self.ensure_open()?;

        for key in keys {
            self.store.invalidate(key).await;
        }
        Ok(())
    }

    async fn close(&self) -> CacheResult<()> {
        if self.closed.swap(true, Ordering::AcqRel) {
            return Ok(());
        }
        self.store.invalidate_all();
        self.store.run_pending_tasks().await;
        tracing::info!("Local cache closed");
        Ok(())
    }

    async fn wait(&self) -> CacheResult<()> {
        self.ensure_open()?;
        self.store.run_pending_tasks().await;
        Ok(())
    }

    fn level(&self) -> Level {
        Level::Local
    }
}
