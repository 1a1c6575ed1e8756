//! tiercache - 多级缓存
//!
//! 本地缓存、远程缓存和二级缓存，以及围绕它们的保护机制：
//! 布隆过滤器（穿透）、单飞合并（击穿）、熔断器（雪崩）和随机 TTL。
//! [`get_cached`] 提供旁路缓存读取。

mod bloom_filter;
mod cache;
mod circuit_breaker;
mod codec;
mod context;
mod helper;
mod local;
mod metrics;
mod option;
mod option_pool;
mod registry;
mod remote;
mod singleflight;
mod stable_bloom;
mod tiered;
mod ttl;
mod worker_pool;

pub use bloom_filter::*;
pub use cache::*;
pub use circuit_breaker::*;
pub use codec::*;
pub use context::*;
pub use helper::*;
pub use local::*;
pub use option::*;
pub use option_pool::*;
pub use registry::*;
pub use remote::*;
pub use singleflight::*;
pub use stable_bloom::*;
pub use tiered::*;
pub use ttl::*;
pub use worker_pool::*;

pub use tiercache_errors::{CacheError, CacheResult};
