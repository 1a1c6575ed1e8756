//! tiercache-bootstrap - 缓存子系统启动骨架
//!
//! 从配置装配多级缓存，提供健康检查与有序关闭

mod infrastructure;
mod retry;
mod runtime;

pub use infrastructure::*;
pub use retry::*;
pub use runtime::*;
