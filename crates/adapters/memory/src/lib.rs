//! tiercache-adapter-memory - 内存键值存储适配器
//!
//! 进程内实现的 `KvStorePort`，用于本地开发和测试。
//! 支持故障注入（读写失败、延迟）和调用计数。

mod store;

pub use store::*;
