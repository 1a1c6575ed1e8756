//! Redis 存储配置

use std::time::Duration;

/// Redis 存储配置
#[derive(Debug, Clone)]
pub struct RedisStoreConfig {
    /// Redis URL，可包含密码和数据库索引
    pub url: String,
    /// 键前缀，设置后所有键为 `{prefix}:{key}`
    pub key_prefix: Option<String>,
    pub connect_timeout: Duration,
}

impl Default for RedisStoreConfig {
    fn default() -> Self {
        Self {
            url: "redis://127.0.0.1:6379".to_string(),
            key_prefix: None,
            connect_timeout: Duration::from_secs(5),
        }
    }
}

impl RedisStoreConfig {
    pub fn new(url: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            ..Default::default()
        }
    }

    /// 设置键前缀，空字符串视为不设置
    pub fn with_key_prefix(mut self, prefix: impl Into<String>) -> Self {
        let prefix = prefix.into();
        self.key_prefix = if prefix.is_empty() { None } else { Some(prefix) };
        self
    }

    pub fn with_connect_timeout(mut self, timeout: Duration) -> Self {
        self.connect_timeout = timeout;
        self
    }

    /// 获取带前缀的键
    pub fn prefixed_key(&self, key: &str) -> String {
        match &self.key_prefix {
            Some(prefix) => format!("{}:{}", prefix, key),
            None => key.to_string(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config() {
        let config = RedisStoreConfig::default();
        assert_eq!(config.url, "redis://127.0.0.1:6379");
        assert_eq!(config.key_prefix, None);
        assert_eq!(config.connect_timeout, Duration::from_secs(5));
    }

    #[test]
    fn test_prefixed_key() {
        let config = RedisStoreConfig::new("redis://localhost:6379").with_key_prefix("app");
        assert_eq!(config.prefixed_key("user:123"), "app:user:123");

        let config_no_prefix = RedisStoreConfig::new("redis://localhost:6379").with_key_prefix("");
        assert_eq!(config_no_prefix.prefixed_key("user:123"), "user:123");
    }
}
