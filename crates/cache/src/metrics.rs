//! 缓存指标
//!
//! 未安装 recorder 时这些调用为空操作

use std::time::Duration;

use metrics::{counter, histogram};

use crate::cache::Level;

pub(crate) fn record_lookup(level: Level, result: &'static str) {
    counter!(
        "tiercache_lookups_total",
        "level" => level.as_str(),
        "result" => result
    )
    .increment(1);
}

pub(crate) fn record_protection_rejection(kind: &'static str) {
    counter!("tiercache_protection_rejections_total", "kind" => kind).increment(1);
}

pub(crate) fn record_submit_failure(pool: &str) {
    counter!("tiercache_async_submit_failures_total", "pool" => pool.to_string()).increment(1);
}

pub(crate) fn record_writeback_failure(tier: &'static str) {
    counter!("tiercache_writeback_failures_total", "tier" => tier).increment(1);
}

pub(crate) fn record_loader_duration(elapsed: Duration) {
    histogram!("tiercache_loader_duration_seconds").record(elapsed.as_secs_f64());
}
