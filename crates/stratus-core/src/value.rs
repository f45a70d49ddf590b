//! Canonical value tree for deterministic encoding
//!
//! Every hashed or signed record is first lowered into a [`Value`] tree and
//! only then written out as bytes. The tree enforces the canonical rules:
//! - map keys are strings, ordered lexicographically
//! - arrays preserve their order
//! - floats must be finite; `-0.0` normalizes to `0`
//! - a float with no fractional part inside the 53-bit safe range collapses
//!   to an integer, so the same number produces identical bytes regardless
//!   of which numeric type carried it
//! - values with no cross-language representation are rejected

use crate::error::{Error, Result};
use serde::ser::{self, Serialize};
use std::collections::BTreeMap;

/// Largest integer magnitude exactly representable as an IEEE-754 double.
pub const MAX_SAFE_INTEGER: i64 = 9_007_199_254_740_991; // 2^53 - 1

/// A record of the canonical value language.
#[derive(Clone, Debug, PartialEq)]
pub enum Value {
    Null,
    Bool(bool),
    Int(i64),
    Float(f64),
    Str(String),
    Array(Vec<Value>),
    /// BTreeMap keeps keys in the canonical lexicographic order.
    Map(BTreeMap<String, Value>),
}

/// Lower any serializable record into a canonical [`Value`] tree.
///
/// Fails with [`Error::InvalidValue`] on non-finite floats, integers outside
/// the safe range, non-string map keys, and inputs with no canonical form.
pub fn to_value<T: Serialize + ?Sized>(value: &T) -> Result<Value> {
    value.serialize(ValueSerializer)
}

/// Normalize a number for canonical encoding.
///
/// - NaN and Inf are rejected
/// - `-0.0` becomes integer `0`
/// - integral values within the safe range become integers
pub fn normalize_number(v: f64) -> Result<Value> {
    if !v.is_finite() {
        return Err(Error::InvalidValue("non-finite float".into()));
    }
    if v == 0.0 {
        // Covers -0.0 as well.
        return Ok(Value::Int(0));
    }
    if v.fract() == 0.0 && v.abs() <= MAX_SAFE_INTEGER as f64 {
        return Ok(Value::Int(v as i64));
    }
    Ok(Value::Float(v))
}

fn int_value(v: i64) -> Result<Value> {
    if v.abs() > MAX_SAFE_INTEGER {
        return Err(Error::InvalidValue(format!(
            "integer {v} outside the safe range"
        )));
    }
    Ok(Value::Int(v))
}

impl ser::Error for Error {
    fn custom<T: std::fmt::Display>(msg: T) -> Self {
        Error::InvalidValue(msg.to_string())
    }
}

struct ValueSerializer;

impl ser::Serializer for ValueSerializer {
    type Ok = Value;
    type Error = Error;

    type SerializeSeq = SeqBuilder;
    type SerializeTuple = SeqBuilder;
    type SerializeTupleStruct = SeqBuilder;
    type SerializeTupleVariant = VariantSeqBuilder;
    type SerializeMap = MapBuilder;
    type SerializeStruct = MapBuilder;
    type SerializeStructVariant = VariantMapBuilder;

    fn serialize_bool(self, v: bool) -> Result<Value> {
        Ok(Value::Bool(v))
    }

    fn serialize_i8(self, v: i8) -> Result<Value> {
        int_value(v as i64)
    }

    fn serialize_i16(self, v: i16) -> Result<Value> {
        int_value(v as i64)
    }

    fn serialize_i32(self, v: i32) -> Result<Value> {
        int_value(v as i64)
    }

    fn serialize_i64(self, v: i64) -> Result<Value> {
        int_value(v)
    }

    fn serialize_u8(self, v: u8) -> Result<Value> {
        int_value(v as i64)
    }

    fn serialize_u16(self, v: u16) -> Result<Value> {
        int_value(v as i64)
    }

    fn serialize_u32(self, v: u32) -> Result<Value> {
        int_value(v as i64)
    }

    fn serialize_u64(self, v: u64) -> Result<Value> {
        if v > MAX_SAFE_INTEGER as u64 {
            return Err(Error::InvalidValue(format!(
                "integer {v} outside the safe range"
            )));
        }
        Ok(Value::Int(v as i64))
    }

    fn serialize_f32(self, v: f32) -> Result<Value> {
        normalize_number(v as f64)
    }

    fn serialize_f64(self, v: f64) -> Result<Value> {
        normalize_number(v)
    }

    fn serialize_char(self, v: char) -> Result<Value> {
        Ok(Value::Str(v.to_string()))
    }

    fn serialize_str(self, v: &str) -> Result<Value> {
        Ok(Value::Str(v.to_owned()))
    }

    fn serialize_bytes(self, _v: &[u8]) -> Result<Value> {
        Err(Error::InvalidValue("raw bytes have no canonical form".into()))
    }

    fn serialize_none(self) -> Result<Value> {
        Ok(Value::Null)
    }

    fn serialize_some<T: Serialize + ?Sized>(self, value: &T) -> Result<Value> {
        value.serialize(self)
    }

    fn serialize_unit(self) -> Result<Value> {
        Err(Error::InvalidValue("unit has no canonical form".into()))
    }

    fn serialize_unit_struct(self, name: &'static str) -> Result<Value> {
        Err(Error::InvalidValue(format!(
            "unit struct {name} has no canonical form"
        )))
    }

    fn serialize_unit_variant(
        self,
        _name: &'static str,
        _index: u32,
        variant: &'static str,
    ) -> Result<Value> {
        Ok(Value::Str(variant.to_owned()))
    }

    fn serialize_newtype_struct<T: Serialize + ?Sized>(
        self,
        _name: &'static str,
        value: &T,
    ) -> Result<Value> {
        value.serialize(self)
    }

    fn serialize_newtype_variant<T: Serialize + ?Sized>(
        self,
        _name: &'static str,
        _index: u32,
        variant: &'static str,
        value: &T,
    ) -> Result<Value> {
        let mut map = BTreeMap::new();
        map.insert(variant.to_owned(), value.serialize(ValueSerializer)?);
        Ok(Value::Map(map))
    }

    fn serialize_seq(self, len: Option<usize>) -> Result<SeqBuilder> {
        Ok(SeqBuilder {
            items: Vec::with_capacity(len.unwrap_or(0)),
        })
    }

    fn serialize_tuple(self, len: usize) -> Result<SeqBuilder> {
        self.serialize_seq(Some(len))
    }

    fn serialize_tuple_struct(self, _name: &'static str, len: usize) -> Result<SeqBuilder> {
        self.serialize_seq(Some(len))
    }

    fn serialize_tuple_variant(
        self,
        _name: &'static str,
        _index: u32,
        variant: &'static str,
        len: usize,
    ) -> Result<VariantSeqBuilder> {
        Ok(VariantSeqBuilder {
            variant,
            items: Vec::with_capacity(len),
        })
    }

    fn serialize_map(self, _len: Option<usize>) -> Result<MapBuilder> {
        Ok(MapBuilder {
            entries: BTreeMap::new(),
            pending_key: None,
        })
    }

    fn serialize_struct(self, _name: &'static str, _len: usize) -> Result<MapBuilder> {
        self.serialize_map(None)
    }

    fn serialize_struct_variant(
        self,
        _name: &'static str,
        _index: u32,
        variant: &'static str,
        _len: usize,
    ) -> Result<VariantMapBuilder> {
        Ok(VariantMapBuilder {
            variant,
            entries: BTreeMap::new(),
        })
    }
}

struct SeqBuilder {
    items: Vec<Value>,
}

impl ser::SerializeSeq for SeqBuilder {
    type Ok = Value;
    type Error = Error;

    fn serialize_element<T: Serialize + ?Sized>(&mut self, value: &T) -> Result<()> {
        self.items.push(to_value(value)?);
        Ok(())
    }

    fn end(self) -> Result<Value> {
        Ok(Value::Array(self.items))
    }
}

impl ser::SerializeTuple for SeqBuilder {
    type Ok = Value;
    type Error = Error;

    fn serialize_element<T: Serialize + ?Sized>(&mut self, value: &T) -> Result<()> {
        ser::SerializeSeq::serialize_element(self, value)
    }

    fn end(self) -> Result<Value> {
        ser::SerializeSeq::end(self)
    }
}

impl ser::SerializeTupleStruct for SeqBuilder {
    type Ok = Value;
    type Error = Error;

    fn serialize_field<T: Serialize + ?Sized>(&mut self, value: &T) -> Result<()> {
        ser::SerializeSeq::serialize_element(self, value)
    }

    fn end(self) -> Result<Value> {
        ser::SerializeSeq::end(self)
    }
}

struct VariantSeqBuilder {
    variant: &'static str,
    items: Vec<Value>,
}

impl ser::SerializeTupleVariant for VariantSeqBuilder {
    type Ok = Value;
    type Error = Error;

    fn serialize_field<T: Serialize + ?Sized>(&mut self, value: &T) -> Result<()> {
        self.items.push(to_value(value)?);
        Ok(())
    }

    fn end(self) -> Result<Value> {
        let mut map = BTreeMap::new();
        map.insert(self.variant.to_owned(), Value::Array(self.items));
        Ok(Value::Map(map))
    }
}

struct MapBuilder {
    entries: BTreeMap<String, Value>,
    pending_key: Option<String>,
}

impl ser::SerializeMap for MapBuilder {
    type Ok = Value;
    type Error = Error;

    fn serialize_key<T: Serialize + ?Sized>(&mut self, key: &T) -> Result<()> {
        self.pending_key = Some(key.serialize(MapKeySerializer)?);
        Ok(())
    }

    fn serialize_value<T: Serialize + ?Sized>(&mut self, value: &T) -> Result<()> {
        let key = self
            .pending_key
            .take()
            .ok_or_else(|| Error::InvalidValue("map value without key".into()))?;
        self.entries.insert(key, to_value(value)?);
        Ok(())
    }

    fn end(self) -> Result<Value> {
        Ok(Value::Map(self.entries))
    }
}

impl ser::SerializeStruct for MapBuilder {
    type Ok = Value;
    type Error = Error;

    fn serialize_field<T: Serialize + ?Sized>(
        &mut self,
        key: &'static str,
        value: &T,
    ) -> Result<()> {
        self.entries.insert(key.to_owned(), to_value(value)?);
        Ok(())
    }

    fn end(self) -> Result<Value> {
        Ok(Value::Map(self.entries))
    }
}

struct VariantMapBuilder {
    variant: &'static str,
    entries: BTreeMap<String, Value>,
}

impl ser::SerializeStructVariant for VariantMapBuilder {
    type Ok = Value;
    type Error = Error;

    fn serialize_field<T: Serialize + ?Sized>(
        &mut self,
        key: &'static str,
        value: &T,
    ) -> Result<()> {
        self.entries.insert(key.to_owned(), to_value(value)?);
        Ok(())
    }

    fn end(self) -> Result<Value> {
        Ok(Value::Map(self.entries))
    }
}

/// Map keys must already be strings; anything else is rejected rather than
/// stringified, so two records can never collide through key coercion.
struct MapKeySerializer;

macro_rules! reject_key {
    ($method:ident, $ty:ty) => {
        fn $method(self, _v: $ty) -> Result<String> {
            Err(Error::InvalidValue("map keys must be strings".into()))
        }
    };
}

impl ser::Serializer for MapKeySerializer {
    type Ok = String;
    type Error = Error;

    type SerializeSeq = ser::Impossible<String, Error>;
    type SerializeTuple = ser::Impossible<String, Error>;
    type SerializeTupleStruct = ser::Impossible<String, Error>;
    type SerializeTupleVariant = ser::Impossible<String, Error>;
    type SerializeMap = ser::Impossible<String, Error>;
    type SerializeStruct = ser::Impossible<String, Error>;
    type SerializeStructVariant = ser::Impossible<String, Error>;

    fn serialize_str(self, v: &str) -> Result<String> {
        Ok(v.to_owned())
    }

    fn serialize_char(self, v: char) -> Result<String> {
        Ok(v.to_string())
    }

    reject_key!(serialize_bool, bool);
    reject_key!(serialize_i8, i8);
    reject_key!(serialize_i16, i16);
    reject_key!(serialize_i32, i32);
    reject_key!(serialize_i64, i64);
    reject_key!(serialize_u8, u8);
    reject_key!(serialize_u16, u16);
    reject_key!(serialize_u32, u32);
    reject_key!(serialize_u64, u64);
    reject_key!(serialize_f32, f32);
    reject_key!(serialize_f64, f64);
    reject_key!(serialize_bytes, &[u8]);

    fn serialize_none(self) -> Result<String> {
        Err(Error::InvalidValue("map keys must be strings".into()))
    }

    fn serialize_some<T: Serialize + ?Sized>(self, _value: &T) -> Result<String> {
        Err(Error::InvalidValue("map keys must be strings".into()))
    }

    fn serialize_unit(self) -> Result<String> {
        Err(Error::InvalidValue("map keys must be strings".into()))
    }

    fn serialize_unit_struct(self, _name: &'static str) -> Result<String> {
        Err(Error::InvalidValue("map keys must be strings".into()))
    }

    fn serialize_unit_variant(
        self,
        _name: &'static str,
        _index: u32,
        variant: &'static str,
    ) -> Result<String> {
        Ok(variant.to_owned())
    }

    fn serialize_newtype_struct<T: Serialize + ?Sized>(
        self,
        _name: &'static str,
        value: &T,
    ) -> Result<String> {
        value.serialize(self)
    }

    fn serialize_newtype_variant<T: Serialize + ?Sized>(
        self,
        _name: &'static str,
        _index: u32,
        _variant: &'static str,
        _value: &T,
    ) -> Result<String> {
        Err(Error::InvalidValue("map keys must be strings".into()))
    }

    fn serialize_seq(self, _len: Option<usize>) -> Result<Self::SerializeSeq> {
        Err(Error::InvalidValue("map keys must be strings".into()))
    }

    fn serialize_tuple(self, _len: usize) -> Result<Self::SerializeTuple> {
        Err(Error::InvalidValue("map keys must be strings".into()))
    }

    fn serialize_tuple_struct(
        self,
        _name: &'static str,
        _len: usize,
    ) -> Result<Self::SerializeTupleStruct> {
        Err(Error::InvalidValue("map keys must be strings".into()))
    }

    fn serialize_tuple_variant(
        self,
        _name: &'static str,
        _index: u32,
        _variant: &'static str,
        _len: usize,
    ) -> Result<Self::SerializeTupleVariant> {
        Err(Error::InvalidValue("map keys must be strings".into()))
    }

    fn serialize_map(self, _len: Option<usize>) -> Result<Self::SerializeMap> {
        Err(Error::InvalidValue("map keys must be strings".into()))
    }

    fn serialize_struct(self, _name: &'static str, _len: usize) -> Result<Self::SerializeStruct> {
        Err(Error::InvalidValue("map keys must be strings".into()))
    }

    fn serialize_struct_variant(
        self,
        _name: &'static str,
        _index: u32,
        _variant: &'static str,
        _len: usize,
    ) -> Result<Self::SerializeStructVariant> {
        Err(Error::InvalidValue("map keys must be strings".into()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    #[test]
    fn test_number_normalization() {
        assert_eq!(normalize_number(1.5).unwrap(), Value::Float(1.5));
        assert_eq!(normalize_number(0.0).unwrap(), Value::Int(0));
        assert_eq!(normalize_number(-0.0).unwrap(), Value::Int(0));
        assert_eq!(normalize_number(45.0).unwrap(), Value::Int(45));
        assert_eq!(normalize_number(-75.0).unwrap(), Value::Int(-75));
        assert!(normalize_number(f64::NAN).is_err());
        assert!(normalize_number(f64::INFINITY).is_err());
        assert!(normalize_number(f64::NEG_INFINITY).is_err());
    }

    #[test]
    fn test_map_keys_sorted() {
        let mut input = HashMap::new();
        input.insert("zulu".to_string(), 1u32);
        input.insert("alpha".to_string(), 2u32);
        input.insert("mike".to_string(), 3u32);

        let value = to_value(&input).unwrap();
        let Value::Map(map) = value else {
            panic!("expected map")
        };
        let keys: Vec<&str> = map.keys().map(String::as_str).collect();
        assert_eq!(keys, ["alpha", "mike", "zulu"]);
    }

    #[test]
    fn test_none_in_map_value_is_null() {
        let mut input: HashMap<String, Option<f64>> = HashMap::new();
        input.insert("sta1".into(), Some(12.5));
        input.insert("sta2".into(), None);

        let Value::Map(map) = to_value(&input).unwrap() else {
            panic!("expected map")
        };
        assert_eq!(map["sta1"], Value::Float(12.5));
        assert_eq!(map["sta2"], Value::Null);
    }

    #[test]
    fn test_non_string_keys_rejected() {
        let mut input = HashMap::new();
        input.insert(7u32, "x");
        assert!(to_value(&input).is_err());
    }

    #[test]
    fn test_nan_rejected_inside_nested_structure() {
        let input = vec![vec![1.0, f64::NAN]];
        assert!(matches!(to_value(&input), Err(Error::InvalidValue(_))));
    }
}
