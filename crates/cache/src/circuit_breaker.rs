//! 熔断器实现
//!
//! Closed -> Open -> HalfOpen 状态转换，按代（generation）统计请求结果：
//! - Closed: 统计窗口 `interval` 到期后清零计数
//! - Open: `timeout` 内直接拒绝，之后进入 HalfOpen
//! - HalfOpen: 最多放行 `max_requests` 个试探请求，全部成功则关闭，任一失败重新打开

use std::fmt;
use std::future::Future;
use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::Mutex;
use tiercache_errors::{CacheError, CacheResult};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum State {
    Closed,
    Open,
    HalfOpen,
}

impl fmt::Display for State {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Closed => "closed",
            Self::Open => "open",
            Self::HalfOpen => "half-open",
        };
        f.write_str(name)
    }
}

/// 当前代的请求计数
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Counts {
    pub requests: u32,
    pub total_successes: u32,
    pub total_failures: u32,
    pub consecutive_successes: u32,
    pub consecutive_failures: u32,
}

impl Counts {
    fn on_request(&mut self) {
        self.requests = self.requests.saturating_add(1);
    }

    fn on_success(&mut self) {
        self.total_successes = self.total_successes.saturating_add(1);
        self.consecutive_successes = self.consecutive_successes.saturating_add(1);
        self.consecutive_failures = 0;
    }

    fn on_failure(&mut self) {
        self.total_failures = self.total_failures.saturating_add(1);
        self.consecutive_failures = self.consecutive_failures.saturating_add(1);
        self.consecutive_successes = 0;
    }

    pub fn failure_rate(&self) -> f64 {
        if self.requests == 0 {
            0.0
        } else {
            self.total_failures as f64 / self.requests as f64
        }
    }
}

/// 默认的跳闸判定
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct TripPolicy {
    /// 按失败率判定前的最小样本数，避免冷启动误判
    pub min_samples: u32,
    pub max_failure_rate: f64,
    /// 样本不足时的连续失败阈值
    pub max_consecutive_failures: u32,
    /// 强触发的连续失败阈值
    pub hard_consecutive_failures: u32,
}

impl Default for TripPolicy {
    fn default() -> Self {
        Self {
            min_samples: 10,
            max_failure_rate: 0.5,
            max_consecutive_failures: 10,
            hard_consecutive_failures: 5,
        }
    }
}

impl TripPolicy {
    pub fn should_trip(&self, counts: &Counts) -> bool {
        if counts.consecutive_failures >= self.hard_consecutive_failures {
            return true;
        }
        if counts.requests < self.min_samples {
            return counts.consecutive_failures >= self.max_consecutive_failures;
        }
        counts.failure_rate() >= self.max_failure_rate
    }
}

pub type ReadyToTrip = Arc<dyn Fn(&Counts) -> bool + Send + Sync>;
pub type OnStateChange = Arc<dyn Fn(&str, State, State) + Send + Sync>;
pub type IsSuccessful = Arc<dyn Fn(&CacheError) -> bool + Send + Sync>;

/// 熔断器配置
#[derive(Clone)]
pub struct BreakerSettings {
    pub name: String,
    /// 半开状态允许的试探请求数，0 视为 1
    pub max_requests: u32,
    /// Closed 状态统计窗口，零表示不清零
    pub interval: Duration,
    /// Open 状态持续时间
    pub timeout: Duration,
    pub trip_policy: TripPolicy,
    /// 覆盖 `trip_policy` 的自定义判定
    pub ready_to_trip: Option<ReadyToTrip>,
    pub on_state_change: Option<OnStateChange>,
    /// 将错误归类为成功（不计入失败），默认远程 nil 视为成功
    pub is_successful: Option<IsSuccessful>,
}

impl Default for BreakerSettings {
    fn default() -> Self {
        Self {
            name: "cacheCircuitBreaker".to_string(),
            max_requests: 3,
            interval: Duration::from_secs(60),
            timeout: Duration::from_secs(30),
            trip_policy: TripPolicy::default(),
            ready_to_trip: None,
            on_state_change: None,
            is_successful: None,
        }
    }
}

impl fmt::Debug for BreakerSettings {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("BreakerSettings")
            .field("name", &self.name)
            .field("max_requests", &self.max_requests)
            .field("interval", &self.interval)
            .field("timeout", &self.timeout)
            .field("trip_policy", &self.trip_policy)
            .field("ready_to_trip", &self.ready_to_trip.is_some())
            .finish()
    }
}

#[derive(Debug)]
struct BreakerState {
    state: State,
    generation: u64,
    counts: Counts,
    expiry: Option<Instant>,
}

pub struct CircuitBreaker {
    settings: BreakerSettings,
    inner: Mutex<BreakerState>,
}

type Transition = Option<(State, State)>;

impl CircuitBreaker {
    pub fn new(mut settings: BreakerSettings) -> Self {
        if settings.max_requests == 0 {
            settings.max_requests = 1;
        }
        if settings.timeout.is_zero() {
            settings.timeout = Duration::from_secs(60);
        }

        let mut state = BreakerState {
            state: State::Closed,
            generation: 0,
            counts: Counts::default(),
            expiry: None,
        };
        Self::new_generation(&settings, &mut state, Instant::now());

        Self {
            settings,
            inner: Mutex::new(state),
        }
    }

    pub fn name(&self) -> &str {
        &self.settings.name
    }

    pub fn state(&self) -> State {
        let (state, transition) = {
            let mut inner = self.inner.lock();
            let transition = self.refresh(&mut inner, Instant::now());
            (inner.state, transition)
        };
        self.notify(transition);
        state
    }

    pub fn counts(&self) -> Counts {
        self.inner.lock().counts
    }

    /// 强制回到 Closed 并清零计数
    pub fn reset(&self) {
        let transition = {
            let mut inner = self.inner.lock();
            self.set_state(&mut inner, State::Closed, Instant::now())
        };
        self.notify(transition);
    }

    /// 执行受保护的操作
    pub async fn call<T, F, Fut>(&self, f: F) -> CacheResult<T>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = CacheResult<T>>,
    {
        // 1. 检查状态
        let mut pending = PendingCall {
            breaker: self,
            generation: self.before_request()?,
            settled: false,
        };

        // 2. 执行操作
        let result = f().await;

        // 3. 记录结果
        let success = match &result {
            Ok(_) => true,
            Err(e) => self.is_successful(e),
        };
        pending.settle(success);

        result
    }

    fn is_successful(&self, err: &CacheError) -> bool {
        match &self.settings.is_successful {
            Some(classify) => classify(err),
            None => err.is_miss(),
        }
    }

    fn before_request(&self) -> CacheResult<u64> {
        let (result, transition) = {
            let mut inner = self.inner.lock();
            let transition = self.refresh(&mut inner, Instant::now());

            let result = match inner.state {
                State::Open => Err(CacheError::circuit_breaker_open("open state")),
                State::HalfOpen if inner.counts.requests >= self.settings.max_requests => {
                    Err(CacheError::circuit_breaker_open("too many requests"))
                }
                _ => {
                    inner.counts.on_request();
                    Ok(inner.generation)
                }
            };
            (result, transition)
        };
        self.notify(transition);
        result
    }

    fn after_request(&self, before: u64, success: bool) {
        let transition = {
            let mut inner = self.inner.lock();
            let now = Instant::now();
            let transition = self.refresh(&mut inner, now);
            // 跨代的请求结果不再计入
            if inner.generation != before {
                transition
            } else if success {
                transition.or(self.on_success(&mut inner, now))
            } else {
                transition.or(self.on_failure(&mut inner, now))
            }
        };
        self.notify(transition);
    }

    fn on_success(&self, inner: &mut BreakerState, now: Instant) -> Transition {
        match inner.state {
            State::Closed => {
                inner.counts.on_success();
                None
            }
            State::HalfOpen => {
                inner.counts.on_success();
                if inner.counts.consecutive_successes >= self.settings.max_requests {
                    self.set_state(inner, State::Closed, now)
                } else {
                    None
                }
            }
            State::Open => None,
        }
    }

    fn on_failure(&self, inner: &mut BreakerState, now: Instant) -> Transition {
        match inner.state {
            State::Closed => {
                inner.counts.on_failure();
                if self.ready_to_trip(&inner.counts) {
                    self.set_state(inner, State::Open, now)
                } else {
                    None
                }
            }
            State::HalfOpen => self.set_state(inner, State::Open, now),
            State::Open => None,
        }
    }

    fn ready_to_trip(&self, counts: &Counts) -> bool {
        match &self.settings.ready_to_trip {
            Some(custom) => custom(counts),
            None => self.settings.trip_policy.should_trip(counts),
        }
    }

    /// 按时间推进状态：Closed 窗口到期换代，Open 超时进入 HalfOpen
    fn refresh(&self, inner: &mut BreakerState, now: Instant) -> Transition {
        match (inner.state, inner.expiry) {
            (State::Closed, Some(expiry)) if expiry <= now => {
                Self::new_generation(&self.settings, inner, now);
                None
            }
            (State::Open, Some(expiry)) if expiry <= now => {
                self.set_state(inner, State::HalfOpen, now)
            }
            _ => None,
        }
    }

    fn set_state(&self, inner: &mut BreakerState, to: State, now: Instant) -> Transition {
        let from = inner.state;
        inner.state = to;
        Self::new_generation(&self.settings, inner, now);
        (from != to).then_some((from, to))
    }

    fn new_generation(settings: &BreakerSettings, inner: &mut BreakerState, now: Instant) {
        inner.generation = inner.generation.wrapping_add(1);
        inner.counts = Counts::default();
        inner.expiry = match inner.state {
            State::Closed if settings.interval.is_zero() => None,
            State::Closed => Some(now + settings.interval),
            State::Open => Some(now + settings.timeout),
            State::HalfOpen => None,
        };
    }

    /// 在锁外通知状态变化
    fn notify(&self, transition: Transition) {
        let Some((from, to)) = transition else {
            return;
        };
        match &self.settings.on_state_change {
            Some(hook) => hook(&self.settings.name, from, to),
            None => match to {
                State::Open => tracing::warn!(
                    breaker = %self.settings.name,
                    from = %from,
                    "Circuit breaker transitioned to OPEN"
                ),
                _ => tracing::info!(
                    breaker = %self.settings.name,
                    from = %from,
                    to = %to,
                    "Circuit breaker state changed"
                ),
            },
        }
    }
}

/// 调用在记录结果前被取消时按失败计入，避免半开状态的试探名额泄漏
struct PendingCall<'a> {
    breaker: &'a CircuitBreaker,
    generation: u64,
    settled: bool,
}

impl PendingCall<'_> {
    fn settle(&mut self, success: bool) {
        self.settled = true;
        self.breaker.after_request(self.generation, success);
    }
}

impl Drop for PendingCall<'_> {
    fn drop(&mut self) {
        if !self.settled {
            self.breaker.after_request(self.generation, false);
        }
    }
}

impl fmt::Debug for CircuitBreaker {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let inner = self.inner.lock();
        f.debug_struct("CircuitBreaker")
            .field("name", &self.settings.name)
            .field("state", &inner.state)
            .field("counts", &inner.counts)
            .finish()
    }
}
