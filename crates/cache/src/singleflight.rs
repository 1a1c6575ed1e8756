//! Singleflight 请求合并
//!
//! 同一个 key 的并发请求只执行一次实际操作，其他请求等待并共享结果（防缓存击穿）

use std::collections::HashMap;
use std::future::Future;

use parking_lot::Mutex;
use tiercache_errors::CacheResult;
use tokio::sync::broadcast;

pub struct SingleFlight<T> {
    calls: Mutex<HashMap<String, broadcast::Sender<CacheResult<T>>>>,
}

impl<T: Clone + Send + 'static> SingleFlight<T> {
    pub fn new() -> Self {
        Self {
            calls: Mutex::new(HashMap::new()),
        }
    }

    /// 执行操作，如果已有相同 key 的操作在进行中，则等待其结果
    pub async fn run<F, Fut>(&self, key: &str, f: F) -> CacheResult<T>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = CacheResult<T>>,
    {
        let tx = loop {
            let mut rx = {
                let mut calls = self.calls.lock();
                match calls.get(key) {
                    Some(tx) => tx.subscribe(),
                    None => {
                        let (tx, _rx) = broadcast::channel(1);
                        calls.insert(key.to_string(), tx.clone());
                        break tx;
                    }
                }
            };

            match rx.recv().await {
                Ok(result) => return result,
                // 执行者被取消，重新竞争
                Err(_) => continue,
            }
        };

        let inflight = Inflight { group: self, key };
        let result = f().await;

        // 先移除再广播：广播之后到达的请求会发起新的调用
        drop(inflight);
        let _ = tx.send(result.clone());

        result
    }

    /// 进行中的 key 数量
    pub fn in_flight(&self) -> usize {
        self.calls.lock().len()
    }
}

impl<T: Clone + Send + 'static> Default for SingleFlight<T> {
    fn default() -> Self {
        Self::new()
    }
}

/// 执行者退出（完成或被取消）时移除 key
struct Inflight<'a, T> {
    group: &'a SingleFlight<T>,
    key: &'a str,
}

impl<T> Drop for Inflight<'_, T> {
    fn drop(&mut self) {
        self.group.calls.lock().remove(self.key);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;
    use tiercache_errors::CacheError;

    #[tokio::test]
    async fn test_singleflight_deduplicates_concurrent_requests() {
        let group = Arc::new(SingleFlight::<String>::new());
        let call_count = Arc::new(AtomicUsize::new(0));

        // 并发发起 10 个相同 key 的请求
        let mut handles = vec![];
        for _ in 0..10 {
            let group = group.clone();
            let call_count = call_count.clone();
            handles.push(tokio::spawn(async move {
                group
                    .run("test_key", || async {
                        call_count.fetch_add(1, Ordering::SeqCst);
                        tokio::time::sleep(Duration::from_millis(100)).await;
                        Ok("value".to_string())
                    })
                    .await
            }));
        }

        for handle in handles {
            assert_eq!(handle.await.unwrap().unwrap(), "value");
        }

        // 验证实际只执行了一次
        assert_eq!(call_count.load(Ordering::SeqCst), 1);
        assert_eq!(group.in_flight(), 0);
    }

    #[tokio::test]
    async fn test_errors_are_shared() {
        let group = Arc::new(SingleFlight::<String>::new());
        let (a, b) = tokio::join!(
            group.run("k", || async {
                tokio::time::sleep(Duration::from_millis(50)).await;
                Err(CacheError::remote_nil("k"))
            }),
            async {
                tokio::time::sleep(Duration::from_millis(10)).await;
                group.run("k", || async { Ok("unused".to_string()) }).await
            }
        );
        assert_eq!(a.unwrap_err(), CacheError::remote_nil("k"));
        assert_eq!(b.unwrap_err(), CacheError::remote_nil("k"));
    }

    #[tokio::test]
    async fn test_cancelled_leader_hands_over() {
        let group = Arc::new(SingleFlight::<String>::new());

        let leader = {
            let group = group.clone();
            tokio::spawn(async move {
                group
                    .run("k", || async {
                        tokio::time::sleep(Duration::from_secs(10)).await;
                        Ok("never".to_string())
                    })
                    .await
            })
        };
        tokio::time::sleep(Duration::from_millis(20)).await;

        let follower = {
            let group = group.clone();
            tokio::spawn(async move {
                group
                    .run("k", || async { Ok("fresh".to_string()) })
                    .await
            })
        };
        tokio::time::sleep(Duration::from_millis(20)).await;
        leader.abort();

        assert_eq!(follower.await.unwrap().unwrap(), "fresh");
        assert_eq!(group.in_flight(), 0);
    }

    #[tokio::test]
    async fn test_different_keys_run_independently() {
        let group = SingleFlight::<u32>::new();
        let (a, b) = tokio::join!(
            group.run("a", || async { Ok(1) }),
            group.run("b", || async { Ok(2) })
        );
        assert_eq!((a.unwrap(), b.unwrap()), (1, 2));
    }
}
