//! Canonical byte encodings
//!
//! Two encodings exist over the [`Value`](crate::value::Value) tree:
//!
//! - **CanonicalMsgPack** is the normative encoding. Its BLAKE3 hash is the
//!   artifact id, so implementations in any language must produce identical
//!   bytes for the same logical record.
//! - **CanonicalJson** is a debug/test surface (compact, sorted keys) and is
//!   never on the hashing path.

use crate::error::{Error, Result};
use crate::value::{to_value, Value};
use serde::ser::{Serialize, SerializeMap, SerializeSeq, Serializer};

impl Serialize for Value {
    fn serialize<S: Serializer>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error> {
        match self {
            Value::Null => serializer.serialize_unit(),
            Value::Bool(b) => serializer.serialize_bool(*b),
            Value::Int(i) => serializer.serialize_i64(*i),
            Value::Float(f) => serializer.serialize_f64(*f),
            Value::Str(s) => serializer.serialize_str(s),
            Value::Array(items) => {
                let mut seq = serializer.serialize_seq(Some(items.len()))?;
                for item in items {
                    seq.serialize_element(item)?;
                }
                seq.end()
            }
            Value::Map(entries) => {
                let mut map = serializer.serialize_map(Some(entries.len()))?;
                for (key, value) in entries {
                    map.serialize_entry(key, value)?;
                }
                map.end()
            }
        }
    }
}

/// Serialize a record to canonical msgpack bytes.
///
/// This is the normative encoding for all hashing and signing operations.
/// Integers use the shortest msgpack form, non-integral floats are float64,
/// and map keys arrive already sorted from the value tree.
pub fn canonical_msgpack<T: Serialize + ?Sized>(record: &T) -> Result<Vec<u8>> {
    let value = to_value(record)?;
    rmp_serde::to_vec(&value).map_err(|e| Error::Io(std::io::Error::other(e)))
}

/// Serialize a record to canonical JSON bytes (compact, sorted keys).
pub fn canonical_json<T: Serialize + ?Sized>(record: &T) -> Result<Vec<u8>> {
    let value = to_value(record)?;
    let mut out = String::new();
    write_json(&value, &mut out);
    Ok(out.into_bytes())
}

fn write_json(value: &Value, out: &mut String) {
    match value {
        Value::Null => out.push_str("null"),
        Value::Bool(true) => out.push_str("true"),
        Value::Bool(false) => out.push_str("false"),
        Value::Int(i) => {
            out.push_str(&i.to_string());
        }
        Value::Float(f) => {
            // Shortest round-trip form; integral floats were already
            // collapsed to Int by normalization.
            out.push_str(&f.to_string());
        }
        Value::Str(s) => write_json_string(s, out),
        Value::Array(items) => {
            out.push('[');
            for (i, item) in items.iter().enumerate() {
                if i > 0 {
                    out.push(',');
                }
                write_json(item, out);
            }
            out.push(']');
        }
        Value::Map(entries) => {
            out.push('{');
            for (i, (key, item)) in entries.iter().enumerate() {
                if i > 0 {
                    out.push(',');
                }
                write_json_string(key, out);
                out.push(':');
                write_json(item, out);
            }
            out.push('}');
        }
    }
}

fn write_json_string(s: &str, out: &mut String) {
    out.push('"');
    for c in s.chars() {
        match c {
            '"' => out.push_str("\\\""),
            '\\' => out.push_str("\\\\"),
            '\n' => out.push_str("\\n"),
            '\r' => out.push_str("\\r"),
            '\t' => out.push_str("\\t"),
            '\u{08}' => out.push_str("\\b"),
            '\u{0c}' => out.push_str("\\f"),
            c if (c as u32) < 0x20 => {
                out.push_str(&format!("\\u{:04x}", c as u32));
            }
            c => out.push(c),
        }
    }
    out.push('"');
}
