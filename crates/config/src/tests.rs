use crate::{BackendKind, BloomFilterKind, CacheSettings, ConfigError, RedisSettings};
use secrecy::{ExposeSecret, Secret};
use std::time::Duration;

#[test]
fn test_secret_redaction() {
    let settings = RedisSettings {
        url: Secret::new("redis://:hunter2@cache.internal:6379".to_string()),
        key_prefix: None,
        connect_timeout_secs: 5,
    };
    let debug_output = format!("{:?}", settings);
    assert!(!debug_output.contains("hunter2"));
    assert!(debug_output.contains("Secret([REDACTED"));
}

#[test]
fn test_empty_config_uses_defaults() {
    let settings = CacheSettings::from_toml_str("").unwrap();

    assert_eq!(settings.remote.backend, BackendKind::Redis);
    assert_eq!(
        settings.remote.redis.url.expose_secret(),
        "redis://127.0.0.1:6379"
    );
    assert!(!settings.remote.protection.enable);
    assert_eq!(settings.remote.protection.sharded_bloom.shards, 16);
    assert_eq!(settings.remote.protection.circuit_breaker.max_requests, 5);
    assert_eq!(settings.async_pool.drain_timeout(), Duration::from_secs(5));
    assert_eq!(settings.async_pool.remote.size, 512);
}

#[test]
fn test_partial_sections_merge_with_defaults() {
    let settings = CacheSettings::from_toml_str(
        r#"
        app_name = "orders"

        [remote]
        backend = "memory"

        [remote.protection]
        enable = true
        bloom_filter = "stable"

        [remote.protection.circuit_breaker]
        timeout_secs = 10

        [async_pool.local]
        size = 8
        nonblocking = false
        max_blocking_tasks = 32
        "#,
    )
    .unwrap();

    assert_eq!(settings.app_name, "orders");
    assert_eq!(settings.remote.backend, BackendKind::Memory);
    assert!(settings.remote.protection.enable);
    assert_eq!(settings.remote.protection.bloom_filter, BloomFilterKind::Stable);
    assert_eq!(
        settings.remote.protection.circuit_breaker.timeout(),
        Duration::from_secs(10)
    );
    // 未配置的字段保持默认
    assert_eq!(settings.remote.protection.circuit_breaker.max_requests, 5);
    assert_eq!(settings.async_pool.local.size, 8);
    assert!(!settings.async_pool.local.nonblocking);
    assert_eq!(settings.async_pool.local.max_blocking_tasks, 32);
    assert_eq!(settings.async_pool.remote.size, 512);
}

#[test]
fn test_invalid_values_are_rejected() {
    let err = CacheSettings::from_toml_str(
        r#"
        [remote.protection.sharded_bloom]
        fp_rate = 1.5

        [async_pool.remote]
        size = 0
        "#,
    )
    .unwrap_err();

    match err {
        ConfigError::Invalid(msg) => {
            assert!(msg.contains("fp_rate"));
            assert!(msg.contains("async_pool.remote.size"));
        }
        other => panic!("expected Invalid, got {other:?}"),
    }
}

#[test]
fn test_unknown_enum_value_fails_to_load() {
    let err = CacheSettings::from_toml_str(
        r#"
        [remote]
        backend = "memcached"
        "#,
    )
    .unwrap_err();
    assert!(matches!(err, ConfigError::Load(_)));
}
