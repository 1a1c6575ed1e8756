//! telemetry - 可观测性库

use metrics::{describe_counter, describe_histogram};
use metrics_exporter_prometheus::{BuildError, PrometheusBuilder, PrometheusHandle};
use thiserror::Error;
use tracing_subscriber::{EnvFilter, layer::SubscriberExt, util::SubscriberInitExt};

#[derive(Debug, Error)]
pub enum TelemetryError {
    #[error("Failed to install tracing subscriber: {0}")]
    Tracing(String),

    #[error("Failed to install Prometheus recorder: {0}")]
    Metrics(#[from] BuildError),
}

/// 初始化 tracing
///
/// `RUST_LOG` 优先于传入的级别；重复初始化返回错误而不是 panic
pub fn init_tracing(log_level: &str, json: bool) -> Result<(), TelemetryError> {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(log_level));

    let registry = tracing_subscriber::registry().with(filter);
    let result = if json {
        registry
            .with(tracing_subscriber::fmt::layer().json())
            .try_init()
    } else {
        registry.with(tracing_subscriber::fmt::layer()).try_init()
    };

    result.map_err(|e| TelemetryError::Tracing(e.to_string()))
}

/// 初始化 Prometheus metrics
pub fn init_metrics() -> Result<PrometheusHandle, TelemetryError> {
    let handle = PrometheusBuilder::new().install_recorder()?;
    describe_cache_metrics();
    Ok(handle)
}

/// 注册缓存指标的描述信息
pub fn describe_cache_metrics() {
    describe_counter!(
        "tiercache_lookups_total",
        "Cache lookups by level and result"
    );
    describe_counter!(
        "tiercache_protection_rejections_total",
        "Requests rejected by bloom filter or circuit breaker"
    );
    describe_counter!(
        "tiercache_async_submit_failures_total",
        "Async write-back tasks that could not be submitted"
    );
    describe_counter!(
        "tiercache_writeback_failures_total",
        "Failed write-backs by tier"
    );
    describe_histogram!(
        "tiercache_loader_duration_seconds",
        "Duration of cache-aside loader calls"
    );
}

/// 健康检查状态
#[derive(Debug, Clone)]
pub struct HealthStatus {
    pub healthy: bool,
    pub checks: Vec<HealthCheck>,
}

#[derive(Debug, Clone)]
pub struct HealthCheck {
    pub name: String,
    pub healthy: bool,
    pub message: Option<String>,
}

impl HealthStatus {
    pub fn new() -> Self {
        Self {
            healthy: true,
            checks: Vec::new(),
        }
    }

    pub fn add_check(&mut self, name: impl Into<String>, healthy: bool, message: Option<String>) {
        if !healthy {
            self.healthy = false;
        }
        self.checks.push(HealthCheck {
            name: name.into(),
            healthy,
            message,
        });
    }
}

impl Default for HealthStatus {
    fn default() -> Self {
        Self::new()
    }
}
