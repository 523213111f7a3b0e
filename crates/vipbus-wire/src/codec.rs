//! Frame codec: converts native values to wire frames and back.
//!
//! Encoding rules, checked in order:
//! lists, maps and booleans become a JSON frame; frames pass through; byte
//! blobs pass through as raw frames; integers and floats use 8-byte
//! big-endian encodings; `Nil` becomes the empty frame; text becomes a UTF-8
//! frame.
//!
//! Decoding is driven by the frame tag. Untagged (raw) frames follow the
//! heuristic foreign peers rely on: valid UTF-8 is tried as JSON first and
//! kept as text if that fails, anything else is returned as opaque bytes.
//! Decoding never fails.

use crate::frame::{Frame, FrameKind};
use bytes::Bytes;
use std::collections::BTreeMap;
use thiserror::Error;

/// A language-native value carried in frames.
#[derive(Debug, Clone, PartialEq)]
pub enum Value {
    Nil,
    Bool(bool),
    Int(i64),
    Float(f64),
    Text(String),
    Bytes(Bytes),
    /// An already-built frame; encoded unchanged.
    Frame(Frame),
    List(Vec<Value>),
    Map(BTreeMap<String, Value>),
}

#[derive(Debug, Error, PartialEq)]
pub enum CodecError {
    /// Non-UTF-8 bytes cannot be embedded in a JSON list or map.
    #[error("cannot embed non-UTF-8 bytes in a JSON frame")]
    BinaryInJson,
}

/// Encode a sequence of values into frames.
pub fn encode(values: &[Value]) -> Result<Vec<Frame>, CodecError> {
    values.iter().map(encode_value).collect()
}

/// Encode a single value into a frame.
pub fn encode_value(value: &Value) -> Result<Frame, CodecError> {
    let frame = match value {
        Value::List(_) | Value::Map(_) | Value::Bool(_) => {
            let json = to_json(value)?;
            Frame::new(FrameKind::Json, Bytes::from(json.to_string()))
        }
        Value::Frame(frame) => frame.clone(),
        Value::Bytes(b) => Frame::raw(b.clone()),
        Value::Int(i) => Frame::new(FrameKind::Int, Bytes::copy_from_slice(&i.to_be_bytes())),
        Value::Float(f) => Frame::new(
            FrameKind::Float,
            Bytes::copy_from_slice(&f.to_bits().to_be_bytes()),
        ),
        Value::Nil => Frame::empty(),
        Value::Text(s) => Frame::text(s.clone()),
    };
    Ok(frame)
}

/// Decode frames into values.
pub fn decode(frames: &[Frame]) -> Vec<Value> {
    frames.iter().map(decode_frame).collect()
}

/// Decode a single frame.
pub fn decode_frame(frame: &Frame) -> Value {
    match frame.kind() {
        FrameKind::Int => match <[u8; 8]>::try_from(frame.as_bytes()) {
            Ok(buf) => Value::Int(i64::from_be_bytes(buf)),
            Err(_) => Value::Bytes(frame.bytes()),
        },
        FrameKind::Float => match <[u8; 8]>::try_from(frame.as_bytes()) {
            Ok(buf) => Value::Float(f64::from_bits(u64::from_be_bytes(buf))),
            Err(_) => Value::Bytes(frame.bytes()),
        },
        FrameKind::Text => match frame.to_str() {
            Some(s) => Value::Text(s.to_string()),
            None => Value::Bytes(frame.bytes()),
        },
        FrameKind::Json => match frame.to_str() {
            Some(s) => match serde_json::from_str::<serde_json::Value>(s) {
                Ok(json) => from_json(json),
                Err(_) => Value::Text(s.to_string()),
            },
            None => Value::Bytes(frame.bytes()),
        },
        FrameKind::Raw => {
            if frame.is_empty() {
                return Value::Nil;
            }
            match frame.to_str() {
                Some(s) => match serde_json::from_str::<serde_json::Value>(s) {
                    Ok(json) => from_json(json),
                    Err(_) => Value::Text(s.to_string()),
                },
                None => Value::Bytes(frame.bytes()),
            }
        }
    }
}

/// Convert a value into a JSON document.
pub fn to_json(value: &Value) -> Result<serde_json::Value, CodecError> {
    use serde_json::Value as J;
    Ok(match value {
        Value::Nil => J::Null,
        Value::Bool(b) => J::Bool(*b),
        Value::Int(i) => J::from(*i),
        Value::Float(f) => serde_json::Number::from_f64(*f)
            .map(J::Number)
            .unwrap_or(J::Null),
        Value::Text(s) => J::String(s.clone()),
        Value::Bytes(b) => J::String(
            std::str::from_utf8(b)
                .map_err(|_| CodecError::BinaryInJson)?
                .to_string(),
        ),
        Value::Frame(f) => match f.kind() {
            FrameKind::Raw | FrameKind::Text | FrameKind::Json => {
                J::String(f.to_str().ok_or(CodecError::BinaryInJson)?.to_string())
            }
            _ => to_json(&decode_frame(f))?,
        },
        Value::List(items) => J::Array(items.iter().map(to_json).collect::<Result<_, _>>()?),
        Value::Map(map) => {
            let mut obj = serde_json::Map::new();
            for (k, v) in map {
                obj.insert(k.clone(), to_json(v)?);
            }
            J::Object(obj)
        }
    })
}

/// Convert a JSON document into a value, recursing into lists and maps.
pub fn from_json(json: serde_json::Value) -> Value {
    use serde_json::Value as J;
    match json {
        J::Null => Value::Nil,
        J::Bool(b) => Value::Bool(b),
        J::Number(n) => match n.as_i64() {
            Some(i) => Value::Int(i),
            None => Value::Float(n.as_f64().unwrap_or(f64::NAN)),
        },
        J::String(s) => Value::Text(s),
        J::Array(items) => Value::List(items.into_iter().map(from_json).collect()),
        J::Object(obj) => Value::Map(obj.into_iter().map(|(k, v)| (k, from_json(v))).collect()),
    }
}

impl From<&str> for Value {
    fn from(s: &str) -> Self {
        Value::Text(s.to_string())
    }
}

impl From<String> for Value {
    fn from(s: String) -> Self {
        Value::Text(s)
    }
}

impl From<i64> for Value {
    fn from(i: i64) -> Self {
        Value::Int(i)
    }
}

impl From<f64> for Value {
    fn from(f: f64) -> Self {
        Value::Float(f)
    }
}

impl From<bool> for Value {
    fn from(b: bool) -> Self {
        Value::Bool(b)
    }
}

impl From<Frame> for Value {
    fn from(f: Frame) -> Self {
        Value::Frame(f)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn roundtrip(v: Value) -> Value {
        let frames = encode(std::slice::from_ref(&v)).unwrap();
        assert_eq!(frames.len(), 1);
        decode(&frames).pop().unwrap()
    }

    #[test]
    fn test_roundtrip_primitives() {
        let mut map = BTreeMap::new();
        map.insert("to_peer".to_string(), Value::from("hvac"));
        map.insert("retries".to_string(), Value::Int(3));
        let cases = vec![
            Value::Nil,
            Value::Bool(true),
            Value::Int(0),
            Value::Int(-42),
            Value::Int(i64::MAX),
            Value::Float(3.25),
            Value::Float(-0.5),
            Value::from("hello"),
            Value::from(""),
            Value::from("42"),
            Value::Bytes(Bytes::from_static(&[0xff, 0x00, 0x9c])),
            Value::List(vec![Value::Int(1), Value::from("two"), Value::Nil]),
            Value::Map(map),
            Value::Map(BTreeMap::new()),
        ];
        for v in cases {
            assert_eq!(roundtrip(v.clone()), v);
        }
    }

    #[test]
    fn test_integer_is_fixed_width() {
        let frame = encode_value(&Value::Int(1)).unwrap();
        assert_eq!(frame.kind(), FrameKind::Int);
        assert_eq!(frame.as_bytes(), &[0, 0, 0, 0, 0, 0, 0, 1]);
    }

    #[test]
    fn test_frame_passes_through() {
        let frame = Frame::text("VIP1");
        assert_eq!(encode_value(&Value::Frame(frame.clone())).unwrap(), frame);
    }

    #[test]
    fn test_raw_utf8_tries_json_first() {
        let decoded = decode(&[Frame::raw(&b"[1, \"a\"]"[..]), Frame::raw(&b"plain"[..])]);
        assert_eq!(
            decoded,
            vec![
                Value::List(vec![Value::Int(1), Value::from("a")]),
                Value::from("plain"),
            ]
        );
    }

    #[test]
    fn test_malformed_utf8_is_passed_through() {
        let frame = Frame::raw(vec![0xc3, 0x28]);
        assert_eq!(
            decode_frame(&frame),
            Value::Bytes(Bytes::from_static(&[0xc3, 0x28]))
        );
    }

    #[test]
    fn test_truncated_int_never_fails() {
        let frame = Frame::new(FrameKind::Int, vec![1u8, 2]);
        assert_eq!(
            decode_frame(&frame),
            Value::Bytes(Bytes::from_static(&[1, 2]))
        );
    }

    #[test]
    fn test_nested_lists_decode_recursively() {
        let nested = Value::List(vec![Value::List(vec![Value::Float(1.5)]), Value::Bool(false)]);
        assert_eq!(roundtrip(nested.clone()), nested);
    }

    #[test]
    fn test_binary_inside_json_rejected() {
        let v = Value::List(vec![Value::Bytes(Bytes::from_static(&[0xff]))]);
        assert_eq!(encode_value(&v), Err(CodecError::BinaryInJson));
    }
}
