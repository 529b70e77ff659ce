//! Value serialization for checkpoint payloads.
//!
//! Two implementations of [`ValueSerializer`]:
//!
//! - [`JsonSerializer`] - plain `serde_json`, readable in the database.
//! - [`TaggedBinarySerializer`] - compact binary with an explicit tag byte
//!   per value variant, bincode-encoded payloads. Scalars round-trip
//!   bit-exact; arrays and objects round-trip structurally.
//!
//! The tagged encoding exists because `serde_json::Value` is untagged and
//! cannot be handed to bincode directly; walking the value and writing the
//! variant tag ourselves keeps the format self-describing.

use crate::error::{CheckpointError, Result};
use serde_json::{Map, Number, Value};
use std::io::{Read, Write};

/// Pluggable encoding for checkpoint values.
pub trait ValueSerializer: Send + Sync {
    fn dumps(&self, value: &Value) -> Result<Vec<u8>>;
    fn loads(&self, data: &[u8]) -> Result<Value>;
    /// Short name recorded next to stored blobs so readers can pick the
    /// matching decoder.
    fn name(&self) -> &'static str;
}

/// JSON pass-through serializer.
#[derive(Debug, Default, Clone)]
pub struct JsonSerializer;

impl JsonSerializer {
    pub fn new() -> Self {
        Self
    }
}

impl ValueSerializer for JsonSerializer {
    fn dumps(&self, value: &Value) -> Result<Vec<u8>> {
        Ok(serde_json::to_vec(value)?)
    }

    fn loads(&self, data: &[u8]) -> Result<Value> {
        Ok(serde_json::from_slice(data)?)
    }

    fn name(&self) -> &'static str {
        "json"
    }
}

const TAG_NULL: u8 = 0;
const TAG_BOOL: u8 = 1;
const TAG_INT: u8 = 2;
const TAG_UINT: u8 = 3;
const TAG_FLOAT: u8 = 4;
const TAG_STRING: u8 = 5;
const TAG_ARRAY: u8 = 6;
const TAG_OBJECT: u8 = 7;

/// Tagged binary serializer over bincode payloads.
#[derive(Debug, Default, Clone)]
pub struct TaggedBinarySerializer;

impl TaggedBinarySerializer {
    pub fn new() -> Self {
        Self
    }

    fn encode_into<W: Write>(writer: &mut W, value: &Value) -> Result<()> {
        match value {
            Value::Null => {
                writer.write_all(&[TAG_NULL]).map_err(io_err)?;
            }
            Value::Bool(b) => {
                writer.write_all(&[TAG_BOOL]).map_err(io_err)?;
                bincode::serialize_into(writer, b)?;
            }
            Value::Number(n) => Self::encode_number(writer, n)?,
            Value::String(s) => {
                writer.write_all(&[TAG_STRING]).map_err(io_err)?;
                bincode::serialize_into(writer, s)?;
            }
            Value::Array(items) => {
                writer.write_all(&[TAG_ARRAY]).map_err(io_err)?;
                bincode::serialize_into(&mut *writer, &(items.len() as u64))?;
                for item in items {
                    Self::encode_into(writer, item)?;
                }
            }
            Value::Object(map) => {
                writer.write_all(&[TAG_OBJECT]).map_err(io_err)?;
                bincode::serialize_into(&mut *writer, &(map.len() as u64))?;
                for (key, item) in map {
                    bincode::serialize_into(&mut *writer, key)?;
                    Self::encode_into(writer, item)?;
                }
            }
        }
        Ok(())
    }

    fn encode_number<W: Write>(writer: &mut W, n: &Number) -> Result<()> {
        if let Some(i) = n.as_i64() {
            writer.write_all(&[TAG_INT]).map_err(io_err)?;
            bincode::serialize_into(writer, &i)?;
        } else if let Some(u) = n.as_u64() {
            writer.write_all(&[TAG_UINT]).map_err(io_err)?;
            bincode::serialize_into(writer, &u)?;
        } else if let Some(f) = n.as_f64() {
            writer.write_all(&[TAG_FLOAT]).map_err(io_err)?;
            bincode::serialize_into(writer, &f)?;
        } else {
            return Err(CheckpointError::Serialization(format!(
                "unrepresentable number: {n}"
            )));
        }
        Ok(())
    }

    fn decode_from<R: Read>(reader: &mut R) -> Result<Value> {
        let mut tag = [0u8; 1];
        reader.read_exact(&mut tag).map_err(io_err)?;
        let value = match tag[0] {
            TAG_NULL => Value::Null,
            TAG_BOOL => Value::Bool(bincode::deserialize_from(reader)?),
            TAG_INT => {
                let i: i64 = bincode::deserialize_from(reader)?;
                Value::Number(i.into())
            }
            TAG_UINT => {
                let u: u64 = bincode::deserialize_from(reader)?;
                Value::Number(u.into())
            }
            TAG_FLOAT => {
                let f: f64 = bincode::deserialize_from(reader)?;
                Number::from_f64(f)
                    .map(Value::Number)
                    .ok_or_else(|| CheckpointError::Serialization(format!("non-finite float: {f}")))?
            }
            TAG_STRING => Value::String(bincode::deserialize_from(reader)?),
            TAG_ARRAY => {
                let len: u64 = bincode::deserialize_from(&mut *reader)?;
                let mut items = Vec::with_capacity(len as usize);
                for _ in 0..len {
                    items.push(Self::decode_from(reader)?);
                }
                Value::Array(items)
            }
            TAG_OBJECT => {
                let len: u64 = bincode::deserialize_from(&mut *reader)?;
                let mut map = Map::with_capacity(len as usize);
                for _ in 0..len {
                    let key: String = bincode::deserialize_from(&mut *reader)?;
                    map.insert(key, Self::decode_from(reader)?);
                }
                Value::Object(map)
            }
            other => {
                return Err(CheckpointError::Serialization(format!(
                    "unknown value tag: {other}"
                )))
            }
        };
        Ok(value)
    }
}

fn io_err(err: std::io::Error) -> CheckpointError {
    CheckpointError::Serialization(err.to_string())
}

impl ValueSerializer for TaggedBinarySerializer {
    fn dumps(&self, value: &Value) -> Result<Vec<u8>> {
        let mut buf = Vec::new();
        Self::encode_into(&mut buf, value)?;
        Ok(buf)
    }

    fn loads(&self, data: &[u8]) -> Result<Value> {
        let mut cursor = std::io::Cursor::new(data);
        Self::decode_from(&mut cursor)
    }

    fn name(&self) -> &'static str {
        "tagged-bincode"
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;
    use serde_json::json;

    #[test]
    fn json_round_trip() {
        let serializer = JsonSerializer::new();
        let value = json!({"messages": [{"role": "human", "content": "hi"}], "step": 3});
        let decoded = serializer.loads(&serializer.dumps(&value).unwrap()).unwrap();
        assert_eq!(value, decoded);
    }

    #[test]
    fn tagged_round_trip_scalars() {
        let serializer = TaggedBinarySerializer::new();
        for value in [
            Value::Null,
            json!(true),
            json!(-42),
            json!(u64::MAX),
            json!(3.5),
            json!("hallo"),
        ] {
            let decoded = serializer.loads(&serializer.dumps(&value).unwrap()).unwrap();
            assert_eq!(value, decoded);
        }
    }

    #[test]
    fn tagged_round_trip_nested() {
        let serializer = TaggedBinarySerializer::new();
        let value = json!({
            "clusters_all": [{"file_id": "f1", "procedures": ["a", "b"]}],
            "cluster_status": {"f1": {"status": "completed", "retries": 0}},
            "final_report": null,
        });
        let decoded = serializer.loads(&serializer.dumps(&value).unwrap()).unwrap();
        assert_eq!(value, decoded);
    }

    #[test]
    fn tagged_rejects_garbage() {
        let serializer = TaggedBinarySerializer::new();
        assert!(serializer.loads(&[0xff, 0x00]).is_err());
    }

    fn arb_json(depth: u32) -> impl Strategy<Value = Value> {
        let leaf = prop_oneof![
            Just(Value::Null),
            any::<bool>().prop_map(Value::Bool),
            any::<i64>().prop_map(|i| json!(i)),
            any::<String>().prop_map(Value::String),
        ];
        leaf.prop_recursive(depth, 64, 8, |inner| {
            prop_oneof![
                prop::collection::vec(inner.clone(), 0..8).prop_map(Value::Array),
                prop::collection::hash_map(any::<String>(), inner, 0..8).prop_map(|m| {
                    Value::Object(m.into_iter().collect())
                }),
            ]
        })
    }

    proptest! {
        #[test]
        fn tagged_round_trip_any(value in arb_json(3)) {
            let serializer = TaggedBinarySerializer::new();
            let decoded = serializer.loads(&serializer.dumps(&value).unwrap()).unwrap();
            prop_assert_eq!(value, decoded);
        }
    }
}
