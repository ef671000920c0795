//! Payload schema and codec
//!
//! Every stream may carry a JSON Schema. Values are
//! validated against it on ingest and stored in a compact tagged binary form:
//!
//! ```text
//! payload := format: u8 | body
//! format  := 0 (plain bincode) | 1 (LZ4 block, size prepended)
//! body    := bincode(StoredDatapoint { timestamp: f64, data: EncodedValue, sender })
//! ```
//!
//! The format byte makes each payload self-describing, so segments written
//! with different compression settings stay readable.

use crate::storage::error::{StorageError, StorageResult};
use crate::storage::types::Datapoint;
use serde::{Deserialize, Serialize};
use jsonschema::JSONSchema;
use serde_json::{Map, Number, Value};
use std::sync::Arc;

/// Payload compression
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
#[repr(u8)]
pub enum CompressionType {
    None = 0,
    #[default]
    Lz4 = 1,
}

impl TryFrom<u8> for CompressionType {
    type Error = StorageError;

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        match value {
            0 => Ok(CompressionType::None),
            1 => Ok(CompressionType::Lz4),
            _ => Err(StorageError::CorruptSegment(format!(
                "Unknown payload format: {}",
                value
            ))),
        }
    }
}

impl std::str::FromStr for CompressionType {
    type Err = StorageError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "none" => Ok(CompressionType::None),
            "lz4" => Ok(CompressionType::Lz4),
            other => Err(StorageError::Config(format!(
                "Unknown compression: {}",
                other
            ))),
        }
    }
}

/// JSON value with numbers split by representation
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum EncodedValue {
    Null,
    Bool(bool),
    UInt(u64),
    Int(i64),
    Float(f64),
    String(String),
    Array(Vec<EncodedValue>),
    Object(Vec<(String, EncodedValue)>),
}

impl From<&Value> for EncodedValue {
    fn from(value: &Value) -> Self {
        match value {
            Value::Null => EncodedValue::Null,
            Value::Bool(b) => EncodedValue::Bool(*b),
            Value::Number(n) => {
                if let Some(u) = n.as_u64() {
                    EncodedValue::UInt(u)
                } else if let Some(i) = n.as_i64() {
                    EncodedValue::Int(i)
                } else {
                    EncodedValue::Float(n.as_f64().unwrap_or(f64::NAN))
                }
            }
            Value::String(s) => EncodedValue::String(s.clone()),
            Value::Array(items) => EncodedValue::Array(items.iter().map(Into::into).collect()),
            Value::Object(map) => EncodedValue::Object(
                map.iter()
                    .map(|(k, v)| (k.clone(), EncodedValue::from(v)))
                    .collect(),
            ),
        }
    }
}

impl TryFrom<EncodedValue> for Value {
    type Error = StorageError;

    fn try_from(value: EncodedValue) -> Result<Self, Self::Error> {
        Ok(match value {
            EncodedValue::Null => Value::Null,
            EncodedValue::Bool(b) => Value::Bool(b),
            EncodedValue::UInt(u) => Value::Number(u.into()),
            EncodedValue::Int(i) => Value::Number(i.into()),
            EncodedValue::Float(f) => Value::Number(Number::from_f64(f).ok_or_else(|| {
                StorageError::Serialization(format!("Non-finite number: {}", f))
            })?),
            EncodedValue::String(s) => Value::String(s),
            EncodedValue::Array(items) => Value::Array(
                items
                    .into_iter()
                    .map(Value::try_from)
                    .collect::<StorageResult<_>>()?,
            ),
            EncodedValue::Object(fields) => {
                let mut map = Map::with_capacity(fields.len());
                for (k, v) in fields {
                    map.insert(k, Value::try_from(v)?);
                }
                Value::Object(map)
            }
        })
    }
}

/// Serialize a value to the compact binary form
pub fn marshal(value: &Value) -> StorageResult<Vec<u8>> {
    Ok(bincode::serialize(&EncodedValue::from(value))?)
}

/// Deserialize a value and check it against the stream schema
pub fn unmarshal(bytes: &[u8], schema: &Schema) -> StorageResult<Value> {
    let encoded: EncodedValue = bincode::deserialize(bytes)?;
    let value = Value::try_from(encoded)?;
    schema.validate(&value)?;
    Ok(value)
}

#[derive(Serialize, Deserialize)]
struct StoredDatapoint {
    timestamp: f64,
    data: EncodedValue,
    sender: Option<String>,
}

impl From<&Datapoint> for StoredDatapoint {
    fn from(dp: &Datapoint) -> Self {
        Self {
            timestamp: dp.timestamp,
            data: EncodedValue::from(&dp.data),
            sender: dp.sender.clone(),
        }
    }
}

/// Encode a datapoint as a segment record payload
///
/// LZ4 is only kept when it actually shrinks the body.
pub fn encode_datapoint(dp: &Datapoint, compression: CompressionType) -> StorageResult<Vec<u8>> {
    let body = bincode::serialize(&StoredDatapoint::from(dp))?;

    if compression == CompressionType::Lz4 {
        let compressed = lz4_flex::compress_prepend_size(&body);
        if compressed.len() < body.len() {
            let mut payload = Vec::with_capacity(compressed.len() + 1);
            payload.push(CompressionType::Lz4 as u8);
            payload.extend_from_slice(&compressed);
            return Ok(payload);
        }
    }

    let mut payload = Vec::with_capacity(body.len() + 1);
    payload.push(CompressionType::None as u8);
    payload.extend_from_slice(&body);
    Ok(payload)
}

/// Decode a segment record payload
pub fn decode_datapoint(payload: &[u8]) -> StorageResult<Datapoint> {
    let (format, body) = payload
        .split_first()
        .ok_or_else(|| StorageError::CorruptSegment("Empty payload".to_string()))?;

    let stored: StoredDatapoint = match CompressionType::try_from(*format)? {
        CompressionType::None => bincode::deserialize(body)?,
        CompressionType::Lz4 => {
            let raw = lz4_flex::decompress_size_prepended(body).map_err(|e| {
                StorageError::Compression(format!("LZ4 decompression failed: {}", e))
            })?;
            bincode::deserialize(&raw)?
        }
    };

    Ok(Datapoint {
        timestamp: stored.timestamp,
        data: Value::try_from(stored.data)?,
        sender: stored.sender,
    })
}

/// Bytes a datapoint counts against device and stream quotas
///
/// Uses the uncompressed payload so accounting does not depend on the
/// compression setting.
pub fn encoded_size(dp: &Datapoint) -> StorageResult<u64> {
    Ok(1 + bincode::serialized_size(&StoredDatapoint::from(dp))?)
}

/// Compiled stream schema
///
/// Any JSON Schema document the `jsonschema` crate compiles is accepted.
/// `{}` and `true` accept every value without running the validator.
#[derive(Clone)]
pub struct Schema {
    doc: Value,
    compiled: Option<Arc<JSONSchema>>,
}

impl Schema {
    /// Schema accepting every value
    pub fn any() -> Self {
        Self {
            doc: Value::Object(Map::new()),
            compiled: None,
        }
    }

    /// Compile a JSON Schema document
    pub fn from_json(doc: &Value) -> StorageResult<Self> {
        match doc {
            Value::Object(obj) if obj.is_empty() => return Ok(Self::any()),
            Value::Bool(true) => return Ok(Self::any()),
            Value::Object(_) => {}
            _ => {
                return Err(StorageError::Validation(
                    "Schema must be a JSON object".to_string(),
                ))
            }
        }

        let compiled = JSONSchema::compile(doc)
            .map_err(|e| StorageError::Validation(format!("Invalid schema: {}", e)))?;
        Ok(Self {
            doc: doc.clone(),
            compiled: Some(Arc::new(compiled)),
        })
    }

    /// Parse and compile a schema from its JSON text
    pub fn parse(text: &str) -> StorageResult<Self> {
        let doc: Value = serde_json::from_str(text)?;
        Self::from_json(&doc)
    }

    /// The schema document this was compiled from
    pub fn document(&self) -> &Value {
        &self.doc
    }

    /// Check a value, naming the first failing path in the error
    pub fn validate(&self, value: &Value) -> StorageResult<()> {
        let Some(compiled) = &self.compiled else {
            return Ok(());
        };
        if let Err(mut errors) = compiled.validate(value) {
            let message = match errors.next() {
                Some(err) => format!("data{}: {}", err.instance_path, err),
                None => "data: invalid".to_string(),
            };
            return Err(StorageError::Validation(message));
        }
        Ok(())
    }
}

impl Default for Schema {
    fn default() -> Self {
        Self::any()
    }
}

impl PartialEq for Schema {
    fn eq(&self, other: &Self) -> bool {
        self.doc == other.doc
    }
}

impl std::fmt::Debug for Schema {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_tuple("Schema").field(&self.doc).finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_marshal_preserves_number_kinds() {
        let schema = Schema::any();
        for value in [
            json!(7),
            json!(-7),
            json!(7.25),
            json!(u64::MAX),
            json!({"a": [1, -2, 3.5], "b": null, "c": "x"}),
        ] {
            let bytes = marshal(&value).unwrap();
            assert_eq!(unmarshal(&bytes, &schema).unwrap(), value);
        }
    }

    #[test]
    fn test_unmarshal_checks_schema() {
        let bytes = marshal(&json!("hello")).unwrap();
        let schema = Schema::from_json(&json!({"type": "number"})).unwrap();
        let err = unmarshal(&bytes, &schema).unwrap_err();
        assert!(matches!(err, StorageError::Validation(_)));
    }

    #[test]
    fn test_datapoint_payload_plain_and_lz4() {
        let dp = Datapoint::new(1_700_000_000.123456, json!({"text": "a".repeat(200)}))
            .sender("dev/phone");

        let plain = encode_datapoint(&dp, CompressionType::None).unwrap();
        assert_eq!(plain[0], 0);
        assert_eq!(decode_datapoint(&plain).unwrap(), dp);

        let packed = encode_datapoint(&dp, CompressionType::Lz4).unwrap();
        assert_eq!(packed[0], 1);
        assert!(packed.len() < plain.len());
        assert_eq!(decode_datapoint(&packed).unwrap(), dp);
    }

    #[test]
    fn test_small_payload_skips_lz4() {
        let dp = Datapoint::new(1.0, json!(1));
        let payload = encode_datapoint(&dp, CompressionType::Lz4).unwrap();
        assert_eq!(payload[0], CompressionType::None as u8);
    }

    #[test]
    fn test_decode_rejects_garbage() {
        assert!(decode_datapoint(&[]).is_err());
        assert!(matches!(
            decode_datapoint(&[9, 1, 2, 3]),
            Err(StorageError::CorruptSegment(_))
        ));
    }

    #[test]
    fn test_encoded_size_matches_plain_payload() {
        let dp = Datapoint::new(3.0, json!({"x": 1}));
        let plain = encode_datapoint(&dp, CompressionType::None).unwrap();
        assert_eq!(encoded_size(&dp).unwrap(), plain.len() as u64);
    }

    #[test]
    fn test_empty_schema_accepts_anything() {
        let schema = Schema::from_json(&json!({})).unwrap();
        assert!(schema.validate(&json!(null)).is_ok());
        assert!(schema.validate(&json!({"deep": [1, 2]})).is_ok());
    }

    #[test]
    fn test_schema_types_and_bounds() {
        let schema = Schema::parse(r#"{"type": "number", "minimum": 0, "maximum": 100}"#).unwrap();
        assert!(schema.validate(&json!(50)).is_ok());
        assert!(schema.validate(&json!(12.5)).is_ok());
        assert!(schema.validate(&json!(-1)).is_err());
        assert!(schema.validate(&json!(101)).is_err());
        assert!(schema.validate(&json!("50")).is_err());

        let integer = Schema::from_json(&json!({"type": "integer"})).unwrap();
        assert!(integer.validate(&json!(3)).is_ok());
        assert!(integer.validate(&json!(3.5)).is_err());

        let nullable = Schema::from_json(&json!({"type": ["string", "null"]})).unwrap();
        assert!(nullable.validate(&json!(null)).is_ok());
        assert!(nullable.validate(&json!(true)).is_err());
    }

    #[test]
    fn test_schema_object_paths() {
        let schema = Schema::from_json(&json!({
            "type": "object",
            "required": ["lat", "lon"],
            "properties": {
                "lat": {"type": "number"},
                "lon": {"type": "number"},
                "tags": {"type": "array", "items": {"type": "string", "maxLength": 3}}
            }
        }))
        .unwrap();

        assert!(schema
            .validate(&json!({"lat": 1.0, "lon": 2.0, "tags": ["a"]}))
            .is_ok());

        let err = schema.validate(&json!({"lat": 1.0})).unwrap_err();
        assert!(err.to_string().contains("lon"));

        let err = schema
            .validate(&json!({"lat": 1.0, "lon": 2.0, "tags": ["ok", "toolong"]}))
            .unwrap_err();
        assert!(err.to_string().contains("data/tags/1"));
    }

    #[test]
    fn test_schema_string_keywords() {
        let schema = Schema::from_json(&json!({
            "type": "string",
            "minLength": 2,
            "pattern": "^[a-z]+$"
        }))
        .unwrap();
        assert!(schema.validate(&json!("abc")).is_ok());
        assert!(schema.validate(&json!("a")).is_err());
        assert!(schema.validate(&json!("ABC")).is_err());
    }

    #[test]
    fn test_schema_exclusive_bounds_and_closed_objects() {
        let schema = Schema::from_json(&json!({
            "type": "object",
            "properties": {"level": {"type": "number", "exclusiveMinimum": 0}},
            "additionalProperties": false
        }))
        .unwrap();
        assert!(schema.validate(&json!({"level": 0.5})).is_ok());
        assert!(schema.validate(&json!({"level": 0})).is_err());
        assert!(schema.validate(&json!({"level": 1, "extra": true})).is_err());
    }

    #[test]
    fn test_schema_combinators() {
        let schema = Schema::from_json(&json!({
            "oneOf": [{"type": "integer"}, {"type": "string", "maxLength": 2}]
        }))
        .unwrap();
        assert!(schema.validate(&json!(4)).is_ok());
        assert!(schema.validate(&json!("ok")).is_ok());
        assert!(schema.validate(&json!("long")).is_err());
        assert!(schema.validate(&json!(1.5)).is_err());
    }

    #[test]
    fn test_schema_equality_follows_document() {
        let a = Schema::parse(r#"{"type": "number"}"#).unwrap();
        let b = Schema::from_json(&json!({"type": "number"})).unwrap();
        assert_eq!(a, b);
        assert_eq!(a.document(), &json!({"type": "number"}));
        assert_ne!(a, Schema::any());
        assert_eq!(Schema::from_json(&json!(true)).unwrap(), Schema::default());
    }

    #[test]
    fn test_schema_enum() {
        let schema = Schema::from_json(&json!({"enum": ["on", "off"]})).unwrap();
        assert!(schema.validate(&json!("on")).is_ok());
        assert!(schema.validate(&json!("dim")).is_err());
    }

    #[test]
    fn test_invalid_schema_documents() {
        assert!(Schema::from_json(&json!(5)).is_err());
        assert!(Schema::from_json(&json!({"type": "decimal"})).is_err());
        assert!(Schema::parse("not json").is_err());
    }

    #[test]
    fn test_compression_from_str() {
        assert_eq!("LZ4".parse::<CompressionType>().unwrap(), CompressionType::Lz4);
        assert_eq!("none".parse::<CompressionType>().unwrap(), CompressionType::None);
        assert!("zstd".parse::<CompressionType>().is_err());
    }
}
