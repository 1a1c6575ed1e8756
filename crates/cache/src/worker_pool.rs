//! 有界异步任务池
//!
//! 二级缓存的异步写回通过任务池执行：
//! - 信号量限制并发任务数
//! - 非阻塞模式下池满立即返回 `PoolExhausted`
//! - 阻塞模式下等待空位，等待者超过 `max_blocking_tasks` 时拒绝
//! - 任务 panic 被捕获并记录，不会占住名额

use std::any::Any;
use std::future::Future;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::time::Duration;

use futures::FutureExt;
use serde::Serialize;
use tiercache_errors::{CacheError, CacheResult};
use tokio::sync::{Notify, Semaphore};

/// 任务池配置
#[derive(Debug, Clone)]
pub struct WorkerPoolConfig {
    pub size: usize,
    pub nonblocking: bool,
    /// 阻塞提交时的最大等待数，0 表示不限制
    pub max_blocking_tasks: usize,
}

impl Default for WorkerPoolConfig {
    fn default() -> Self {
        Self {
            size: 256,
            nonblocking: true,
            max_blocking_tasks: 0,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct PoolStats {
    pub name: String,
    pub capacity: usize,
    pub running: usize,
    pub free: usize,
    pub waiting: usize,
    pub closed: bool,
}

struct PoolInner {
    name: String,
    config: WorkerPoolConfig,
    semaphore: Arc<Semaphore>,
    waiting: AtomicUsize,
    /// 已登记但尚未结束的任务，包括等待名额的提交
    pending: AtomicUsize,
    idle: Notify,
    closed: AtomicBool,
}

impl PoolInner {
    fn finish(&self) {
        if self.pending.fetch_sub(1, Ordering::AcqRel) == 1 {
            self.idle.notify_waiters();
        }
    }
}

/// 已登记的任务，drop 时计入完成
struct PendingTask {
    inner: Arc<PoolInner>,
}

impl PendingTask {
    fn register(inner: &Arc<PoolInner>) -> Self {
        inner.pending.fetch_add(1, Ordering::AcqRel);
        Self {
            inner: Arc::clone(inner),
        }
    }
}

impl Drop for PendingTask {
    fn drop(&mut self) {
        self.inner.finish();
    }
}

/// 阻塞等待者计数，提交被取消时同样归还
struct Waiter<'a> {
    waiting: &'a AtomicUsize,
    position: usize,
}

impl<'a> Waiter<'a> {
    fn enter(waiting: &'a AtomicUsize) -> Self {
        let position = waiting.fetch_add(1, Ordering::AcqRel);
        Self { waiting, position }
    }
}

impl Drop for Waiter<'_> {
    fn drop(&mut self) {
        self.waiting.fetch_sub(1, Ordering::AcqRel);
    }
}

#[derive(Clone)]
pub struct WorkerPool {
    inner: Arc<PoolInner>,
}

impl WorkerPool {
    pub fn new(name: impl Into<String>, config: WorkerPoolConfig) -> CacheResult<Self> {
        let name = name.into();
        if config.size == 0 {
            return Err(CacheError::config(format!(
                "worker pool '{name}': size must be > 0"
            )));
        }

        Ok(Self {
            inner: Arc::new(PoolInner {
                semaphore: Arc::new(Semaphore::new(config.size)),
                name,
                config,
                waiting: AtomicUsize::new(0),
                pending: AtomicUsize::new(0),
                idle: Notify::new(),
                closed: AtomicBool::new(false),
            }),
        })
    }

    pub fn name(&self) -> &str {
        &self.inner.name
    }

    /// 提交任务
    ///
    /// 返回错误时任务被直接丢弃，其捕获的资源随之释放
    pub async fn submit<F>(&self, task: F) -> CacheResult<()>
    where
        F: Future<Output = ()> + Send + 'static,
    {
        let inner = &self.inner;
        if inner.closed.load(Ordering::Acquire) {
            return Err(CacheError::Closed);
        }

        // 先登记再取名额，drain 不会漏掉已拿到名额的任务
        let pending = PendingTask::register(inner);
        let permit = if inner.config.nonblocking {
            Arc::clone(&inner.semaphore)
                .try_acquire_owned()
                .map_err(|e| match e {
                    tokio::sync::TryAcquireError::Closed => CacheError::Closed,
                    tokio::sync::TryAcquireError::NoPermits => {
                        CacheError::pool_exhausted(&inner.name)
                    }
                })?
        } else {
            let limit = inner.config.max_blocking_tasks;
            let waiter = Waiter::enter(&inner.waiting);
            if limit > 0 && waiter.position >= limit {
                return Err(CacheError::pool_exhausted(&inner.name));
            }
            let acquired = Arc::clone(&inner.semaphore).acquire_owned().await;
            drop(waiter);
            acquired.map_err(|_| CacheError::Closed)?
        };

        tokio::spawn(async move {
            if let Err(panic) = AssertUnwindSafe(task).catch_unwind().await {
                tracing::error!(
                    pool = %pending.inner.name,
                    panic = %panic_message(panic.as_ref()),
                    "Worker pool task panicked"
                );
            }
            drop(permit);
            drop(pending);
        });

        Ok(())
    }

    /// 等待所有已提交任务结束
    pub async fn wait_idle(&self) {
        loop {
            let notified = self.inner.idle.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            if self.inner.pending.load(Ordering::Acquire) == 0 {
                return;
            }
            notified.await;
        }
    }

    /// 在超时内等待任务结束
    pub async fn drain(&self, timeout: Duration) -> CacheResult<()> {
        tokio::time::timeout(timeout, self.wait_idle())
            .await
            .map_err(|_| CacheError::timeout(format!("drain {} pool", self.inner.name)))
    }

    /// 停止接收新任务，运行中的任务继续执行
    pub fn close(&self) {
        self.inner.closed.store(true, Ordering::Release);
        self.inner.semaphore.close();
    }

    pub fn is_closed(&self) -> bool {
        self.inner.closed.load(Ordering::Acquire)
    }

    pub fn stats(&self) -> PoolStats {
        let inner = &self.inner;
        let capacity = inner.config.size;
        let running = capacity.saturating_sub(inner.semaphore.available_permits());
        PoolStats {
            name: inner.name.clone(),
            capacity,
            running,
            free: capacity - running,
            waiting: inner.waiting.load(Ordering::Acquire),
            closed: self.is_closed(),
        }
    }
}

fn panic_message(panic: &(dyn Any + Send)) -> String {
    if let Some(msg) = panic.downcast_ref::<&str>() {
        (*msg).to_string()
    } else if let Some(msg) = panic.downcast_ref::<String>() {
        msg.clone()
    } else {
        "unknown panic".to_string()
    }
}
