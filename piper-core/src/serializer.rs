//! File serializer with a codec priority list
//!
//! Every payload starts with a four digit ASCII header naming the codec that
//! produced it, so readers never have to guess. Writers try codecs in
//! priority order and keep the first that succeeds.

use bytes::{Buf, BufMut, BytesMut};
use std::fs;
use std::path::{Path, PathBuf};
use tracing::{debug, warn};

use crate::error::{SerializerError, SerializerResult};
use crate::value::{DType, NdArray, Value};

const HEADER_LEN: usize = 4;

/// Codecs known to the serializer, numbered as in the file header
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Codec {
    MsgPack,
    Array,
    Json,
}

impl Codec {
    pub fn header(self) -> &'static [u8; HEADER_LEN] {
        match self {
            Codec::MsgPack => b"0000",
            Codec::Array => b"0001",
            Codec::Json => b"0002",
        }
    }

    fn from_header(header: &[u8]) -> SerializerResult<Self> {
        match header {
            b"0000" => Ok(Codec::MsgPack),
            b"0001" => Ok(Codec::Array),
            b"0002" => Ok(Codec::Json),
            other => Err(SerializerError::UnknownCodec(
                String::from_utf8_lossy(other).into_owned(),
            )),
        }
    }

    /// Codecs to try for a value, best first
    fn priority(value: &Value) -> &'static [Codec] {
        match value {
            Value::Array(_) => &[Codec::Array, Codec::MsgPack, Codec::Json],
            _ => &[Codec::MsgPack, Codec::Json],
        }
    }

    fn encode(self, value: &Value, out: &mut Vec<u8>) -> Result<(), String> {
        match self {
            Codec::MsgPack => {
                rmp_serde::encode::write_named(out, value).map_err(|e| e.to_string())
            }
            Codec::Json => serde_json::to_writer(out, value).map_err(|e| e.to_string()),
            Codec::Array => match value {
                Value::Array(array) => {
                    encode_array(array, out);
                    Ok(())
                }
                other => Err(format!("{} is not an array", other.type_name())),
            },
        }
    }

    fn decode(self, payload: &[u8]) -> SerializerResult<Value> {
        match self {
            Codec::MsgPack => rmp_serde::from_slice(payload)
                .map_err(|e| SerializerError::NoCodec(format!("msgpack: {}", e))),
            Codec::Json => serde_json::from_slice(payload)
                .map_err(|e| SerializerError::NoCodec(format!("json: {}", e))),
            Codec::Array => decode_array(payload).map(Value::Array),
        }
    }
}

/// `dtype:u8 ndim:u32 dims:u64* data`, little endian
fn encode_array(array: &NdArray, out: &mut Vec<u8>) {
    let mut buf = BytesMut::with_capacity(1 + 4 + 8 * array.shape().len() + array.data().len());
    buf.put_u8(array.dtype().tag());
    buf.put_u32_le(array.shape().len() as u32);
    for dim in array.shape() {
        buf.put_u64_le(*dim as u64);
    }
    buf.put_slice(array.data());
    out.extend_from_slice(&buf);
}

fn decode_array(mut payload: &[u8]) -> SerializerResult<NdArray> {
    let truncated = || SerializerError::Truncated("array header".to_string());
    if payload.remaining() < 5 {
        return Err(truncated());
    }
    let tag = payload.get_u8();
    let dtype = DType::from_tag(tag)
        .ok_or_else(|| SerializerError::InvalidArray(format!("unknown dtype tag {}", tag)))?;
    let ndim = payload.get_u32_le() as usize;
    if payload.remaining() < ndim.saturating_mul(8) {
        return Err(truncated());
    }
    let shape = (0..ndim).map(|_| payload.get_u64_le() as usize).collect();
    NdArray::new(shape, dtype, payload.to_vec())
}

/// Encode a value with the first codec that accepts it
pub fn serialize_to_bytes(value: &Value) -> SerializerResult<Vec<u8>> {
    let mut failures = Vec::new();
    for codec in Codec::priority(value) {
        let mut out = codec.header().to_vec();
        match codec.encode(value, &mut out) {
            Ok(()) => return Ok(out),
            Err(reason) => {
                debug!("Codec {:?} refused {}: {}", codec, value.type_name(), reason);
                failures.push(format!("{:?}: {}", codec, reason));
            }
        }
    }
    Err(SerializerError::NoCodec(failures.join("; ")))
}

pub fn deserialize_from_bytes(bytes: &[u8]) -> SerializerResult<Value> {
    if bytes.len() < HEADER_LEN {
        return Err(SerializerError::Truncated(format!(
            "{} bytes, header needs {}",
            bytes.len(),
            HEADER_LEN
        )));
    }
    let (header, payload) = bytes.split_at(HEADER_LEN);
    Codec::from_header(header)?.decode(payload)
}

pub fn serialize_to_file(value: &Value, path: &Path) -> SerializerResult<()> {
    let bytes = serialize_to_bytes(value)?;
    fs::write(path, bytes)?;
    debug!("Serialized {} to {}", value.type_name(), path.display());
    Ok(())
}

pub fn deserialize_from_file(path: &Path) -> SerializerResult<Value> {
    let bytes = fs::read(path)?;
    deserialize_from_bytes(&bytes).inspect_err(|e| {
        warn!("Could not deserialize {}: {}", path.display(), e);
    })
}

/// Serialize a batch, stopping at the first failure
pub fn serialize_objects(objects: &[(Value, PathBuf)]) -> SerializerResult<()> {
    for (value, path) in objects {
        serialize_to_file(value, path)?;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;
    use tempfile::TempDir;

    fn leaf() -> impl Strategy<Value = Value> {
        prop_oneof![
            Just(Value::Null),
            any::<bool>().prop_map(Value::Bool),
            any::<i64>().prop_map(Value::Int),
            (-1e12f64..1e12).prop_map(Value::Float),
            "[a-z ]{0,12}".prop_map(Value::Str),
            proptest::collection::vec(any::<u8>(), 0..16).prop_map(Value::Bytes),
        ]
    }

    fn nested() -> impl Strategy<Value = Value> {
        leaf().prop_recursive(3, 32, 6, |inner| {
            prop_oneof![
                proptest::collection::vec(inner.clone(), 0..6).prop_map(Value::List),
                proptest::collection::vec(inner.clone(), 0..6).prop_map(Value::Tuple),
                proptest::collection::vec((inner.clone(), inner), 0..4).prop_map(Value::Dict),
            ]
        })
    }

    proptest! {
        #[test]
        fn prop_values_survive_serialization(value in nested()) {
            let bytes = serialize_to_bytes(&value).unwrap();
            prop_assert_eq!(deserialize_from_bytes(&bytes).unwrap(), value);
        }

        #[test]
        fn prop_arrays_use_array_codec(values in proptest::collection::vec(-1e6f64..1e6, 0..64)) {
            let array = NdArray::from_f64(vec![values.len()], &values).unwrap();
            let bytes = serialize_to_bytes(&Value::Array(array.clone())).unwrap();
            prop_assert_eq!(&bytes[..4], b"0001");
            prop_assert_eq!(deserialize_from_bytes(&bytes).unwrap(), Value::Array(array));
        }
    }

    #[test]
    fn test_scalar_uses_msgpack_header() {
        let bytes = serialize_to_bytes(&Value::Int(2)).unwrap();
        assert_eq!(&bytes[..4], b"0000");
    }

    #[test]
    fn test_json_payload_is_readable() {
        let mut bytes = Codec::Json.header().to_vec();
        bytes.extend_from_slice(br#"{"List":[{"Int":1},{"Str":"a"}]}"#);
        assert_eq!(
            deserialize_from_bytes(&bytes).unwrap(),
            Value::List(vec![Value::Int(1), Value::from("a")])
        );
    }

    #[test]
    fn test_unknown_header_and_truncation() {
        assert!(matches!(
            deserialize_from_bytes(b"0042abc"),
            Err(SerializerError::UnknownCodec(h)) if h == "0042"
        ));
        assert!(matches!(
            deserialize_from_bytes(b"00"),
            Err(SerializerError::Truncated(_))
        ));
        assert!(matches!(
            deserialize_from_bytes(b"0001\x05\x01\x00"),
            Err(SerializerError::Truncated(_))
        ));
    }

    #[test]
    fn test_file_round_trip_and_batch() {
        let dir = TempDir::new().unwrap();
        let a = dir.path().join("a");
        let b = dir.path().join("b");
        let matrix = NdArray::from_i64(vec![2, 3], &[1, 2, 3, 4, 5, 6]).unwrap();

        serialize_objects(&[
            (Value::Int(2), a.clone()),
            (Value::Array(matrix.clone()), b.clone()),
        ])
        .unwrap();

        assert_eq!(deserialize_from_file(&a).unwrap(), Value::Int(2));
        assert_eq!(deserialize_from_file(&b).unwrap(), Value::Array(matrix));
        assert!(matches!(
            deserialize_from_file(&dir.path().join("missing")),
            Err(SerializerError::IoError(_))
        ));
    }
}
