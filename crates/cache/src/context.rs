//! 调用上下文
//!
//! 携带调用方的截止时间，所有后端调用都在该截止时间内完成

use std::future::Future;
use std::time::Duration;

use tiercache_errors::{CacheError, CacheResult};
use tokio::time::Instant;

/// 调用上下文
#[derive(Debug, Clone, Copy, Default)]
pub struct CallContext {
    deadline: Option<Instant>,
}

impl CallContext {
    /// 无截止时间
    pub fn background() -> Self {
        Self { deadline: None }
    }

    pub fn with_timeout(timeout: Duration) -> Self {
        Self {
            deadline: Some(Instant::now() + timeout),
        }
    }

    pub fn with_deadline(deadline: Instant) -> Self {
        Self {
            deadline: Some(deadline),
        }
    }

    /// 派生子上下文：截止时间取父上下文与新超时中较早的一个
    pub fn child_with_timeout(&self, timeout: Duration) -> Self {
        let candidate = Instant::now() + timeout;
        let deadline = match self.deadline {
            Some(parent) if parent < candidate => parent,
            _ => candidate,
        };
        Self {
            deadline: Some(deadline),
        }
    }

    pub fn deadline(&self) -> Option<Instant> {
        self.deadline
    }

    /// 剩余时间，已过期时返回零
    pub fn remaining(&self) -> Option<Duration> {
        self.deadline
            .map(|d| d.saturating_duration_since(Instant::now()))
    }

    pub fn is_expired(&self) -> bool {
        matches!(self.deadline, Some(d) if d <= Instant::now())
    }

    /// 在截止时间内执行 future，超时返回 `CacheError::Timeout`
    pub async fn run<T, F>(&self, op: &str, fut: F) -> CacheResult<T>
    where
        F: Future<Output = CacheResult<T>>,
    {
        match self.deadline {
            None => fut.await,
            Some(deadline) => tokio::time::timeout_at(deadline, fut)
                .await
                .map_err(|_| CacheError::timeout(op))?,
        }
    }
}
