//! 缓存注册表
//!
//! 启动时显式构造，持有各级缓存实例、命名实例、共享的选项池和默认序列化器。
//! 按级别或实例名解析缓存，找不到时返回错误。

use std::collections::HashMap;
use std::sync::Arc;

use tiercache_errors::{CacheError, CacheResult};
use tiercache_ports::Serializer;

use crate::cache::{CachePort, Level};
use crate::local::LocalCache;
use crate::option::CacheOption;
use crate::option_pool::{OptionPool, PooledOption};
use crate::remote::RemoteCache;
use crate::tiered::TieredCache;

const DEFAULT_MAX_IDLE_OPTIONS: usize = 1024;

pub struct CacheRegistry {
    local: Option<Arc<LocalCache>>,
    remote: Option<Arc<RemoteCache>>,
    tiered: Option<Arc<TieredCache>>,
    named: HashMap<String, Arc<dyn CachePort>>,
    options: Arc<OptionPool>,
    serializer: Option<Arc<dyn Serializer>>,
}

impl CacheRegistry {
    pub fn builder() -> CacheRegistryBuilder {
        CacheRegistryBuilder::default()
    }

    pub fn local(&self) -> Option<&Arc<LocalCache>> {
        self.local.as_ref()
    }

    pub fn remote(&self) -> Option<&Arc<RemoteCache>> {
        self.remote.as_ref()
    }

    pub fn tiered(&self) -> Option<&Arc<TieredCache>> {
        self.tiered.as_ref()
    }

    pub fn option_pool(&self) -> &Arc<OptionPool> {
        &self.options
    }

    /// 按级别解析缓存实例
    pub fn resolve(&self, level: Level) -> CacheResult<Arc<dyn CachePort>> {
        let instance: Option<Arc<dyn CachePort>> = match level {
            Level::Local => self.local.clone().map(|c| c as Arc<dyn CachePort>),
            Level::Remote => self.remote.clone().map(|c| c as Arc<dyn CachePort>),
            Level::Tiered => self.tiered.clone().map(|c| c as Arc<dyn CachePort>),
        };
        instance.ok_or_else(|| CacheError::config(format!("no {level} cache registered")))
    }

    /// 按实例名解析缓存实例
    pub fn named(&self, name: &str) -> CacheResult<Arc<dyn CachePort>> {
        self.named
            .get(name)
            .cloned()
            .ok_or_else(|| CacheError::config(format!("no cache instance named '{name}'")))
    }

    /// 选项指定了实例名时优先使用，否则按级别解析
    pub fn resolve_for(&self, opt: &CacheOption) -> CacheResult<Arc<dyn CachePort>> {
        if let Some(name) = opt.default_instance_key() {
            return self.named(name);
        }
        let level = opt.level().ok_or_else(|| {
            CacheError::validation("cache level is required, must be one of [local, remote, tiered]")
        })?;
        self.resolve(level)
    }

    /// 从池中取出一个选项，已配置默认序列化器时预先设置
    pub fn option(&self) -> PooledOption {
        let mut opt = self.options.acquire();
        if let Some(serializer) = &self.serializer {
            opt.set_serializer(Arc::clone(serializer));
        }
        opt
    }

    /// 关闭全部实例，二级缓存先关闭；已关闭的实例不视为错误
    pub async fn close(&self) -> CacheResult<()> {
        let mut instances: Vec<(String, Arc<dyn CachePort>)> = Vec::new();
        if let Some(tiered) = &self.tiered {
            instances.push((Level::Tiered.to_string(), tiered.clone()));
        }
        if let Some(local) = &self.local {
            instances.push((Level::Local.to_string(), local.clone()));
        }
        if let Some(remote) = &self.remote {
            instances.push((Level::Remote.to_string(), remote.clone()));
        }
        for (name, cache) in &self.named {
            instances.push((name.clone(), Arc::clone(cache)));
        }

        let mut errors = Vec::new();
        for (name, cache) in instances {
            match cache.close().await {
                Ok(()) | Err(CacheError::Closed) => {}
                Err(e) => {
                    tracing::error!(instance = %name, error = %e, "Failed to close cache instance");
                    errors.push(CacheError::in_tier(name, e));
                }
            }
        }
        CacheError::aggregate("close errors", errors)
    }
}

#[derive(Default)]
pub struct CacheRegistryBuilder {
    local: Option<Arc<LocalCache>>,
    remote: Option<Arc<RemoteCache>>,
    tiered: Option<Arc<TieredCache>>,
    named: HashMap<String, Arc<dyn CachePort>>,
    options: Option<Arc<OptionPool>>,
    serializer: Option<Arc<dyn Serializer>>,
}

impl CacheRegistryBuilder {
    pub fn local(mut self, cache: Arc<LocalCache>) -> Self {
        self.local = Some(cache);
        self
    }

    pub fn remote(mut self, cache: Arc<RemoteCache>) -> Self {
        self.remote = Some(cache);
        self
    }

    pub fn tiered(mut self, cache: Arc<TieredCache>) -> Self {
        self.tiered = Some(cache);
        self
    }

    pub fn instance(mut self, name: impl Into<String>, cache: Arc<dyn CachePort>) -> Self {
        self.named.insert(name.into(), cache);
        self
    }

    pub fn option_pool(mut self, pool: Arc<OptionPool>) -> Self {
        self.options = Some(pool);
        self
    }

    pub fn serializer(mut self, serializer: Arc<dyn Serializer>) -> Self {
        self.serializer = Some(serializer);
        self
    }

    pub fn build(self) -> CacheRegistry {
        CacheRegistry {
            local: self.local,
            remote: self.remote,
            tiered: self.tiered,
            named: self.named,
            options: self
                .options
                .unwrap_or_else(|| OptionPool::new(DEFAULT_MAX_IDLE_OPTIONS)),
            serializer: self.serializer,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cache::MockCachePort;
    use crate::codec::JsonSerializer;
    use crate::local::LocalCacheConfig;

    #[test]
    fn test_resolve_missing_level_is_an_error() {
        let registry = CacheRegistry::builder()
            .local(Arc::new(LocalCache::new(LocalCacheConfig::default())))
            .build();

        assert_eq!(registry.resolve(Level::Local).unwrap().level(), Level::Local);
        assert_eq!(
            registry.resolve(Level::Remote).err(),
            Some(CacheError::config("no remote cache registered"))
        );
    }

    #[test]
    fn test_named_instance_takes_precedence() {
        let mut mock = MockCachePort::new();
        mock.expect_level().return_const(Level::Remote);

        let registry = CacheRegistry::builder()
            .local(Arc::new(LocalCache::new(LocalCacheConfig::default())))
            .instance("sessions", Arc::new(mock))
            .build();

        let mut opt = CacheOption::new();
        opt.local().set_cache_key("k");
        assert_eq!(registry.resolve_for(&opt).unwrap().level(), Level::Local);

        opt.set_default_instance_key("sessions");
        assert_eq!(registry.resolve_for(&opt).unwrap().level(), Level::Remote);

        opt.set_default_instance_key("missing");
        assert!(matches!(
            registry.resolve_for(&opt),
            Err(CacheError::Config(_))
        ));
    }

    #[test]
    fn test_option_carries_default_serializer() {
        let registry = CacheRegistry::builder()
            .serializer(Arc::new(JsonSerializer))
            .build();

        let opt = registry.option();
        assert_eq!(opt.serializer().name(), "json");
        drop(opt);
        assert_eq!(registry.option_pool().idle_count(), 1);
    }

    #[tokio::test]
    async fn test_close_tolerates_already_closed_instances() {
        let mut closed = MockCachePort::new();
        closed.expect_close().returning(|| Err(CacheError::Closed));
        let mut failing = MockCachePort::new();
        failing
            .expect_close()
            .returning(|| Err(CacheError::operation("close", "", "broken pipe")));

        let registry = CacheRegistry::builder()
            .local(Arc::new(LocalCache::new(LocalCacheConfig::default())))
            .instance("a", Arc::new(closed))
            .instance("b", Arc::new(failing))
            .build();

        let err = registry.close().await.unwrap_err();
        match err {
            CacheError::Aggregate { errors, .. } => {
                assert_eq!(errors.len(), 1);
                assert!(errors[0].to_string().starts_with("b cache close operation failed"));
            }
            other => panic!("unexpected error: {other:?}"),
        }
    }
}
