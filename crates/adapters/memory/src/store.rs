//! 内存 KV 存储

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::RwLock;
use tiercache_errors::{CacheError, CacheResult};
use tiercache_ports::KvStorePort;
use tokio::time::Instant;

struct StoredValue {
    value: String,
    expires_at: Option<Instant>,
}

impl StoredValue {
    fn is_expired(&self, now: Instant) -> bool {
        self.expires_at.is_some_and(|at| at <= now)
    }
}

/// 内存 KV 存储
#[derive(Default)]
pub struct MemoryKvStore {
    entries: RwLock<HashMap<String, StoredValue>>,
    fail_reads: AtomicBool,
    fail_writes: AtomicBool,
    /// 每次调用前的人为延迟（毫秒）
    latency_ms: AtomicU64,
    get_calls: AtomicUsize,
    set_calls: AtomicUsize,
    delete_calls: AtomicUsize,
    closed: AtomicBool,
}

impl MemoryKvStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// 之后的 get / ping 返回错误
    pub fn set_fail_reads(&self, fail: bool) {
        self.fail_reads.store(fail, Ordering::SeqCst);
    }

    /// 之后的 set / delete 返回错误
    pub fn set_fail_writes(&self, fail: bool) {
        self.fail_writes.store(fail, Ordering::SeqCst);
    }

    pub fn set_latency(&self, latency: Duration) {
        let millis = u64::try_from(latency.as_millis()).unwrap_or(u64::MAX);
        self.latency_ms.store(millis, Ordering::SeqCst);
    }

    pub fn get_calls(&self) -> usize {
        self.get_calls.load(Ordering::SeqCst)
    }

    pub fn set_calls(&self) -> usize {
        self.set_calls.load(Ordering::SeqCst)
    }

    pub fn delete_calls(&self) -> usize {
        self.delete_calls.load(Ordering::SeqCst)
    }

    /// 未过期的条目数
    pub fn len(&self) -> usize {
        let now = Instant::now();
        self.entries
            .read()
            .values()
            .filter(|v| !v.is_expired(now))
            .count()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// 直接读取存储内容，不计入调用次数
    pub fn peek(&self, key: &str) -> Option<String> {
        let now = Instant::now();
        self.entries
            .read()
            .get(key)
            .filter(|v| !v.is_expired(now))
            .map(|v| v.value.clone())
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    async fn simulate_latency(&self) {
        let millis = self.latency_ms.load(Ordering::SeqCst);
        if millis > 0 {
            tokio::time::sleep(Duration::from_millis(millis)).await;
        }
    }

    fn check_reads(&self, op: &str, key: &str) -> CacheResult<()> {
        if self.fail_reads.load(Ordering::SeqCst) {
            return Err(CacheError::operation(op, key, "injected read failure"));
        }
        Ok(())
    }

    fn check_writes(&self, op: &str, key: &str) -> CacheResult<()> {
        if self.fail_writes.load(Ordering::SeqCst) {
            return Err(CacheError::operation(op, key, "injected write failure"));
        }
        Ok(())
    }
}

#[async_trait]
impl KvStorePort for MemoryKvStore {
    async fn get(&self, key: &str) -> CacheResult<Option<String>> {
        self.get_calls.fetch_add(1, Ordering::SeqCst);
        self.simulate_latency().await;
        self.check_reads("get", key)?;

        let now = Instant::now();
        let expired = match self.entries.read().get(key) {
            Some(stored) if !stored.is_expired(now) => return Ok(Some(stored.value.clone())),
            Some(_) => true,
            None => false,
        };
        if expired {
            self.entries.write().remove(key);
        }
        Ok(None)
    }

    async fn set(&self, key: &str, value: &str, ttl: Option<Duration>) -> CacheResult<()> {
        self.set_calls.fetch_add(1, Ordering::SeqCst);
        self.simulate_latency().await;
        self.check_writes("set", key)?;

        let stored = StoredValue {
            value: value.to_string(),
            expires_at: ttl.map(|ttl| Instant::now() + ttl),
        };
        self.entries.write().insert(key.to_string(), stored);
        Ok(())
    }

    async fn delete(&self, keys: &[String]) -> CacheResult<u64> {
        self.delete_calls.fetch_add(1, Ordering::SeqCst);
        self.simulate_latency().await;
        self.check_writes("delete", &keys.join(","))?;

        let mut entries = self.entries.write();
        let removed = keys.iter().filter(|k| entries.remove(k.as_str()).is_some()).count();
        Ok(removed as u64)
    }

    async fn ping(&self) -> CacheResult<()> {
        self.check_reads("ping", "")
    }

    async fn close(&self) -> CacheResult<()> {
        self.closed.store(true, Ordering::SeqCst);
        self.entries.write().clear();
        tracing::debug!("Memory kv store closed");
        Ok(())
    }
}
