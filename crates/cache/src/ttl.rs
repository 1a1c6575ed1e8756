//! TTL 策略
//!
//! 固定 TTL 或 `base ± random_range` 的随机 TTL，随机值在每次取值时重新计算，
//! 避免相同基础 TTL 的 key 同时过期（缓存雪崩）

use std::time::Duration;

use rand::Rng;
use serde::Serialize;

/// TTL 策略，零值表示不过期
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct TtlPolicy {
    base: Duration,
    random_range: Duration,
    use_random: bool,
}

impl TtlPolicy {
    pub fn fixed(ttl: Duration) -> Self {
        Self {
            base: ttl,
            random_range: Duration::ZERO,
            use_random: false,
        }
    }

    /// 在 `[base - random_range, base + random_range]` 内随机
    pub fn with_random(base: Duration, random_range: Duration) -> Self {
        Self {
            base,
            random_range,
            use_random: true,
        }
    }

    /// 按基础 TTL 的百分比随机，`percent` 限制在 `[0, 1]`
    pub fn random_percent(base: Duration, percent: f64) -> Self {
        let percent = if percent.is_nan() {
            0.0
        } else {
            percent.clamp(0.0, 1.0)
        };
        Self::with_random(base, base.mul_f64(percent))
    }

    /// 计算本次使用的 TTL
    ///
    /// 随机结果非正时回退为基础 TTL
    pub fn resolve(&self) -> Duration {
        if !self.use_random || self.random_range.is_zero() {
            return self.base;
        }

        let range = self.random_range.as_nanos() as i128;
        let offset = rand::thread_rng().gen_range(-range..=range);
        let ttl = self.base.as_nanos() as i128 + offset;

        if ttl <= 0 {
            return self.base;
        }
        u64::try_from(ttl)
            .map(Duration::from_nanos)
            .unwrap_or(self.base)
    }

    pub fn base(&self) -> Duration {
        self.base
    }

    pub fn random_range(&self) -> Duration {
        self.random_range
    }

    pub fn is_random(&self) -> bool {
        self.use_random
    }

    /// 调试信息快照（含一次随机取值）
    pub fn info(&self) -> TtlInfo {
        TtlInfo {
            base_ttl: self.base,
            current_ttl: self.resolve(),
            use_random: self.use_random,
            random_range: self.random_range,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct TtlInfo {
    pub base_ttl: Duration,
    pub current_ttl: Duration,
    pub use_random: bool,
    pub random_range: Duration,
}

/// 将 TTL 转换为存储层的过期参数
pub(crate) fn expiry(ttl: Duration) -> Option<Duration> {
    (!ttl.is_zero()).then_some(ttl)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_fixed_ttl_is_stable() {
        let policy = TtlPolicy::fixed(Duration::from_secs(30));
        for _ in 0..10 {
            assert_eq!(policy.resolve(), Duration::from_secs(30));
        }
        assert!(!policy.is_random());
    }

    #[test]
    fn test_random_ttl_within_bounds_and_centered() {
        let base = Duration::from_secs(10 * 60);
        let delta = Duration::from_secs(2 * 60);
        let policy = TtlPolicy::with_random(base, delta);

        let samples = 60;
        let mut total = Duration::ZERO;
        for _ in 0..samples {
            let ttl = policy.resolve();
            assert!(ttl >= base - delta && ttl <= base + delta, "{ttl:?} out of range");
            total += ttl;
        }

        let avg = total.as_secs_f64() / samples as f64;
        let deviation = (avg - base.as_secs_f64()).abs() / base.as_secs_f64();
        assert!(deviation <= 0.25, "average {avg}s deviates {deviation}");
    }

    #[test]
    fn test_non_positive_draw_falls_back_to_base() {
        // range 远大于 base，负数结果必须回退
        let base = Duration::from_millis(1);
        let policy = TtlPolicy::with_random(base, Duration::from_secs(60));
        for _ in 0..200 {
            assert!(policy.resolve() > Duration::ZERO);
        }
    }

    #[test]
    fn test_random_percent_is_clamped() {
        let base = Duration::from_secs(100);
        assert_eq!(
            TtlPolicy::random_percent(base, 0.2).random_range(),
            Duration::from_secs(20)
        );
        assert_eq!(TtlPolicy::random_percent(base, 3.0).random_range(), base);
        assert_eq!(
            TtlPolicy::random_percent(base, -1.0).random_range(),
            Duration::ZERO
        );
    }

    #[test]
    fn test_zero_ttl_means_no_expiry() {
        assert_eq!(expiry(TtlPolicy::default().resolve()), None);
        assert_eq!(
            expiry(Duration::from_secs(1)),
            Some(Duration::from_secs(1))
        );
    }
}
