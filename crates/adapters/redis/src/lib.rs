//! tiercache-adapter-redis - Redis 适配器
//!
//! 基于 `ConnectionManager` 的 `KvStorePort` 实现

mod config;
mod connection;
mod kv_store;

pub use config::*;
pub use connection::*;
pub use kv_store::*;
