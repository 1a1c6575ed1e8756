//! 值编解码
//!
//! 存储层只保存字符串。序列化器输出的非 UTF-8 字节以 [`BINARY_MARKER`] 加 base64
//! 的形式保存，读取时还原为原始字节。

use std::borrow::Cow;

use base64::{Engine as _, engine::general_purpose::STANDARD};
use serde::Serialize;
use serde::de::DeserializeOwned;
use serde_json::Value;
use tiercache_errors::{CacheError, CacheResult};
use tiercache_ports::Serializer;

use crate::cache::CacheValue;

/// 二进制值的存储前缀
pub const BINARY_MARKER: &str = "\u{1}b64:";

/// 默认 JSON 序列化器
#[derive(Debug, Clone, Copy, Default)]
pub struct JsonSerializer;

impl Serializer for JsonSerializer {
    fn name(&self) -> &str {
        "json"
    }

    fn marshal(&self, value: &Value) -> CacheResult<Vec<u8>> {
        serde_json::to_vec(value).map_err(|e| CacheError::serialization(e.to_string()))
    }

    fn unmarshal(&self, bytes: &[u8]) -> CacheResult<Value> {
        serde_json::from_slice(bytes).map_err(|e| CacheError::deserialization(e.to_string()))
    }
}

/// 将写入值编码为存储字符串
pub fn encode_value(value: CacheValue, serializer: &dyn Serializer) -> CacheResult<String> {
    match value {
        CacheValue::Text(text) => Ok(escape_text(text)),
        CacheValue::Bytes(bytes) => Ok(encode_bytes(bytes)),
        CacheValue::Json(value) => Ok(encode_bytes(serializer.marshal(&value)?)),
    }
}

/// 还原存储字符串对应的原始字节
pub fn decode_bytes(raw: &str) -> CacheResult<Cow<'_, [u8]>> {
    match raw.strip_prefix(BINARY_MARKER) {
        Some(encoded) => STANDARD
            .decode(encoded)
            .map(Cow::Owned)
            .map_err(|e| CacheError::deserialization(format!("invalid binary value: {e}"))),
        None => Ok(Cow::Borrowed(raw.as_bytes())),
    }
}

/// 将任意可序列化类型转为 [`CacheValue`]
pub fn to_cache_value<T: Serialize>(value: &T) -> CacheResult<CacheValue> {
    serde_json::to_value(value)
        .map(CacheValue::Json)
        .map_err(|e| CacheError::serialization(e.to_string()))
}

/// 将存储字符串解码为目标类型
pub fn decode_value<T: DeserializeOwned>(raw: &str, serializer: &dyn Serializer) -> CacheResult<T> {
    let bytes = decode_bytes(raw)?;
    let value = serializer.unmarshal(&bytes)?;
    serde_json::from_value(value).map_err(|e| CacheError::deserialization(e.to_string()))
}

fn encode_bytes(bytes: Vec<u8>) -> String {
    match String::from_utf8(bytes) {
        Ok(text) => escape_text(text),
        Err(e) => wrap_binary(&e.into_bytes()),
    }
}

/// 以前缀开头的文本同样包装，保证解码无歧义
fn escape_text(text: String) -> String {
    if text.starts_with(BINARY_MARKER) {
        wrap_binary(text.as_bytes())
    } else {
        text
    }
}

fn wrap_binary(bytes: &[u8]) -> String {
    format!("{BINARY_MARKER}{}", STANDARD.encode(bytes))
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde::Deserialize;
    use serde_json::json;

    #[derive(Debug, PartialEq, Serialize, Deserialize)]
    struct Profile {
        id: u64,
        name: String,
    }

    #[test]
    fn test_text_is_stored_verbatim() {
        let encoded = encode_value("plain".into(), &JsonSerializer).unwrap();
        assert_eq!(encoded, "plain");
    }

    #[test]
    fn test_json_value_goes_through_serializer() {
        let encoded = encode_value(json!({"id": 1}).into(), &JsonSerializer).unwrap();
        assert_eq!(encoded, r#"{"id":1}"#);
    }

    /// 在 JSON 前加一个非 UTF-8 字节的二进制格式
    struct TaggedSerializer;

    impl Serializer for TaggedSerializer {
        fn name(&self) -> &str {
            "tagged"
        }

        fn marshal(&self, value: &Value) -> CacheResult<Vec<u8>> {
            let mut bytes = vec![0xC3];
            bytes.extend(JsonSerializer.marshal(value)?);
            Ok(bytes)
        }

        fn unmarshal(&self, bytes: &[u8]) -> CacheResult<Value> {
            match bytes.split_first() {
                Some((&0xC3, rest)) => JsonSerializer.unmarshal(rest),
                _ => Err(CacheError::deserialization("missing tag byte")),
            }
        }
    }

    #[test]
    fn test_non_utf8_bytes_are_stored_reversibly() {
        let encoded = encode_value(CacheValue::Bytes(vec![0xff, 0xfe]), &JsonSerializer).unwrap();
        assert!(encoded.starts_with(BINARY_MARKER));
        assert_eq!(decode_bytes(&encoded).unwrap().as_ref(), &[0xff, 0xfe]);
    }

    #[test]
    fn test_text_starting_with_marker_round_trips() {
        let text = format!("{BINARY_MARKER}not base64");
        let encoded = encode_value(text.clone().into(), &JsonSerializer).unwrap();
        assert_ne!(encoded, text);
        assert_eq!(decode_bytes(&encoded).unwrap().as_ref(), text.as_bytes());
    }

    #[test]
    fn test_binary_serializer_round_trip() {
        let profile = Profile {
            id: 7,
            name: "bin".to_string(),
        };
        let encoded = encode_value(to_cache_value(&profile).unwrap(), &TaggedSerializer).unwrap();
        assert!(encoded.starts_with(BINARY_MARKER));

        let decoded: Profile = decode_value(&encoded, &TaggedSerializer).unwrap();
        assert_eq!(decoded, profile);
    }

    #[test]
    fn test_corrupt_binary_value_is_reported() {
        let err = decode_bytes(&format!("{BINARY_MARKER}%%%")).unwrap_err();
        assert!(matches!(err, CacheError::Deserialization(_)));
    }

    #[test]
    fn test_decode_typed_value() {
        let profile = Profile {
            id: 9,
            name: "ada".to_string(),
        };
        let encoded = encode_value(to_cache_value(&profile).unwrap(), &JsonSerializer).unwrap();
        let decoded: Profile = decode_value(&encoded, &JsonSerializer).unwrap();
        assert_eq!(decoded, profile);

        let err = decode_value::<Profile>("not json", &JsonSerializer).unwrap_err();
        assert!(matches!(err, CacheError::Deserialization(_)));
    }
}
