//! 缓存运行时
//!
//! 加载配置、初始化遥测、连接远程存储、构建注册表；关闭时按顺序释放

use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use metrics_exporter_prometheus::PrometheusHandle;
use tiercache::{CachePort, CacheRegistry, CallContext};
use tiercache_config::CacheSettings;
use tiercache_telemetry::{HealthStatus, init_metrics, init_tracing};
use tracing::{info, warn};

use crate::infrastructure::{build_registry, connect_store};

const HEALTH_CHECK_TIMEOUT: Duration = Duration::from_secs(1);

pub struct CacheRuntime {
    settings: CacheSettings,
    registry: Arc<CacheRegistry>,
    metrics: Option<PrometheusHandle>,
}

impl CacheRuntime {
    /// 从配置目录启动
    pub async fn start(config_dir: &str) -> anyhow::Result<Self> {
        let settings = CacheSettings::load(config_dir)
            .with_context(|| format!("loading cache settings from '{config_dir}'"))?;

        let telemetry = &settings.telemetry;
        if let Err(e) = init_tracing(&telemetry.log_level, telemetry.json) {
            // 宿主应用可能已安装 subscriber
            warn!(error = %e, "Tracing already initialized, keeping existing subscriber");
        }

        let metrics = if telemetry.metrics {
            Some(init_metrics().context("installing Prometheus recorder")?)
        } else {
            None
        };

        let runtime = Self::with_settings(settings).await?;
        Ok(Self { metrics, ..runtime })
    }

    /// 使用已加载的配置启动，不初始化遥测
    pub async fn with_settings(settings: CacheSettings) -> anyhow::Result<Self> {
        let store = connect_store(&settings)
            .await
            .context("connecting remote kv store")?;
        let registry = build_registry(&settings, store).context("building cache registry")?;

        info!(
            app_name = %settings.app_name,
            backend = ?settings.remote.backend,
            "Cache runtime started"
        );

        Ok(Self {
            settings,
            registry: Arc::new(registry),
            metrics: None,
        })
    }

    pub fn settings(&self) -> &CacheSettings {
        &self.settings
    }

    pub fn registry(&self) -> &Arc<CacheRegistry> {
        &self.registry
    }

    /// Prometheus 文本格式的指标，未启用时返回 `None`
    pub fn render_metrics(&self) -> Option<String> {
        self.metrics.as_ref().map(PrometheusHandle::render)
    }

    /// 检查本地缓存和远程存储
    pub async fn health(&self) -> HealthStatus {
        let mut status = HealthStatus::new();

        if let Some(local) = self.registry.local() {
            match local.wait().await {
                Ok(()) => status.add_check("local", true, None),
                Err(e) => status.add_check("local", false, Some(e.to_string())),
            }
        }

        if let Some(remote) = self.registry.remote() {
            let ctx = CallContext::with_timeout(HEALTH_CHECK_TIMEOUT);
            match remote.ping(&ctx).await {
                Ok(()) => status.add_check("remote", true, None),
                Err(e) => status.add_check("remote", false, Some(e.to_string())),
            }
        }

        status
    }

    /// 关闭全部缓存实例
    pub async fn shutdown(&self) -> anyhow::Result<()> {
        info!("Shutting down cache runtime");
        self.registry
            .close()
            .await
            .context("closing cache registry")?;
        info!("Cache runtime stopped");
        Ok(())
    }
}

/// 等待关闭信号
pub async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            warn!(error = %e, "Failed to install Ctrl+C handler");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
            }
            Err(e) => {
                warn!(error = %e, "Failed to install SIGTERM handler");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }

    info!("Shutdown signal received");
}

#[cfg(test)]
mod tests {
    use super::*;
    use tiercache::get_cached;
    use tiercache_errors::CacheError;

    fn memory_settings() -> CacheSettings {
        CacheSettings::from_toml_str("[remote]\nbackend = \"memory\"\n").unwrap()
    }

    #[tokio::test]
    async fn test_runtime_serves_cache_aside_reads() {
        let runtime = CacheRuntime::with_settings(memory_settings()).await.unwrap();
        let registry = runtime.registry();

        let mut opt = registry.option();
        opt.tiered().write_both().set_cache_key("greeting");

        let value: String = get_cached(registry, &opt, |_ctx| async {
            Ok::<_, CacheError>("hello".to_string())
        })
        .await
        .unwrap();
        assert_eq!(value, "hello");
        assert!(runtime.render_metrics().is_none());
    }

    #[tokio::test]
    async fn test_health_reflects_shutdown() {
        let runtime = CacheRuntime::with_settings(memory_settings()).await.unwrap();
        assert!(runtime.health().await.healthy);

        runtime.shutdown().await.unwrap();
        let status = runtime.health().await;
        assert!(!status.healthy);
        assert_eq!(status.checks.len(), 2);
    }

    #[tokio::test]
    async fn test_start_reports_missing_redis() {
        let settings = CacheSettings::from_toml_str(
            "[remote.redis]\nurl = \"redis://127.0.0.1:1\"\nconnect_timeout_secs = 1\n",
        )
        .unwrap();
        let err = CacheRuntime::with_settings(settings).await.err().unwrap();
        assert!(err.to_string().contains("connecting remote kv store"));
    }
}
