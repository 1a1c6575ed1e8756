//! 旁路缓存读取
//!
//! 先查缓存，未命中时调用 loader 加载并回填：
//! - 布隆过滤器拒绝直接返回给调用方
//! - 熔断器打开时走降级函数，没有降级函数则返回错误
//! - 其他读取错误视为未命中
//! - 回填失败只记录日志，不影响返回加载结果

use std::future::{Future, Ready};
use std::time::Instant;

use serde::Serialize;
use serde::de::DeserializeOwned;
use tiercache_errors::CacheError;

use crate::codec::{decode_value, to_cache_value};
use crate::context::CallContext;
use crate::metrics;
use crate::option::CacheOption;
use crate::registry::CacheRegistry;

/// 读取缓存，未命中时调用 `loader` 并回填
pub async fn get_cached<R, E, F, Fut>(
    registry: &CacheRegistry,
    option: &CacheOption,
    loader: F,
) -> Result<R, E>
where
    R: Serialize + DeserializeOwned,
    E: From<CacheError>,
    F: FnOnce(CallContext) -> Fut,
    Fut: Future<Output = Result<R, E>>,
{
    get_cached_inner(registry, option, loader, None::<fn() -> Ready<Result<R, E>>>).await
}

/// 同 [`get_cached`]，熔断器打开时调用 `fallback`
pub async fn get_cached_with_fallback<R, E, F, Fut, G, GFut>(
    registry: &CacheRegistry,
    option: &CacheOption,
    loader: F,
    fallback: G,
) -> Result<R, E>
where
    R: Serialize + DeserializeOwned,
    E: From<CacheError>,
    F: FnOnce(CallContext) -> Fut,
    Fut: Future<Output = Result<R, E>>,
    G: FnOnce() -> GFut,
    GFut: Future<Output = Result<R, E>>,
{
    get_cached_inner(registry, option, loader, Some(fallback)).await
}

async fn get_cached_inner<R, E, F, Fut, G, GFut>(
    registry: &CacheRegistry,
    option: &CacheOption,
    loader: F,
    fallback: Option<G>,
) -> Result<R, E>
where
    R: Serialize + DeserializeOwned,
    E: From<CacheError>,
    F: FnOnce(CallContext) -> Fut,
    Fut: Future<Output = Result<R, E>>,
    G: FnOnce() -> GFut,
    GFut: Future<Output = Result<R, E>>,
{
    option.validate()?;

    let ctx = option.context();
    if !option.is_enabled() {
        return loader(ctx).await;
    }

    let cache = registry.resolve_for(option)?;
    let key = option.cache_key();

    match cache.get(&ctx, key, option).await {
        Ok(raw) => return Ok(decode_value(&raw, option.serializer())?),
        Err(e) => match e.root() {
            CacheError::RejectedByBloomFilter { .. } => return Err(e.into()),
            CacheError::CircuitBreakerOpen(_) => {
                tracing::warn!(key = %key, "Circuit breaker open, skipping loader");
                return match fallback {
                    Some(fallback) => fallback().await,
                    None => Err(e.into()),
                };
            }
            _ if e.is_miss() => {}
            _ => tracing::debug!(key = %key, error = %e, "Cache read failed, treating as miss"),
        },
    }

    let started = Instant::now();
    let loaded = loader(ctx).await;
    metrics::record_loader_duration(started.elapsed());
    let data = loaded?;

    let stored = match to_cache_value(&data) {
        Ok(value) => cache.set(&ctx, key, value, option).await,
        Err(e) => Err(e),
    };
    if let Err(e) = stored {
        tracing::error!(key = %key, error = %e, "Failed to populate cache");
    }

    Ok(data)
}
