//! 缓存选项池
//!
//! 显式构造的空闲列表。取出的选项包装为 [`PooledOption`]，drop 时重置并归还，
//! 保证每个选项只被释放一次。异步任务通过 [`OptionPool::fork`] 拿到自己的副本，
//! 由任务结束时释放，同步调用方可以立即释放原选项。

use std::fmt;
use std::ops::{Deref, DerefMut};
use std::sync::Arc;

use parking_lot::Mutex;

use crate::option::CacheOption;

pub struct OptionPool {
    idle: Mutex<Vec<CacheOption>>,
    max_idle: usize,
}

impl OptionPool {
    pub fn new(max_idle: usize) -> Arc<Self> {
        Arc::new(Self {
            idle: Mutex::new(Vec::with_capacity(max_idle.min(64))),
            max_idle,
        })
    }

    /// 取出一个默认状态的选项
    pub fn acquire(self: &Arc<Self>) -> PooledOption {
        let option = self.idle.lock().pop().unwrap_or_default();
        PooledOption {
            option,
            pool: Arc::clone(self),
        }
    }

    /// 复制一个选项，供异步任务独占使用
    pub fn fork(self: &Arc<Self>, source: &CacheOption) -> PooledOption {
        let mut guard = self.acquire();
        guard.option.clone_from(source);
        guard
    }

    pub fn idle_count(&self) -> usize {
        self.idle.lock().len()
    }

    fn release(&self, mut option: CacheOption) {
        option.reset();
        let mut idle = self.idle.lock();
        if idle.len() < self.max_idle {
            idle.push(option);
        }
    }
}

impl fmt::Debug for OptionPool {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("OptionPool")
            .field("idle", &self.idle_count())
            .field("max_idle", &self.max_idle)
            .finish()
    }
}

/// 池化选项守卫
pub struct PooledOption {
    option: CacheOption,
    pool: Arc<OptionPool>,
}

impl Deref for PooledOption {
    type Target = CacheOption;

    fn deref(&self) -> &Self::Target {
        &self.option
    }
}

impl DerefMut for PooledOption {
    fn deref_mut(&mut self) -> &mut Self::Target {
        &mut self.option
    }
}

impl fmt::Debug for PooledOption {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.option.fmt(f)
    }
}

impl Drop for PooledOption {
    fn drop(&mut self) {
        let option = std::mem::take(&mut self.option);
        self.pool.release(option);
    }
}
