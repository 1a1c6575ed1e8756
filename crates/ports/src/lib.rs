//! ports - 抽象 trait 层
//!
//! 定义缓存子系统依赖的外部协作者接口

mod kv_store;
mod serializer;

pub use kv_store::*;
pub use serializer::*;
