//! Mutable overlays over encoded values.
//!
//! A mutable copy of a dict or array keeps its untouched children as
//! `MutableValue::Shared` handles into the source buffer. A child container is
//! promoted to its own mutable storage on the first `get_mut_dict` or
//! `get_mut_array` call, and encoding writes untouched children byte for byte.

use crate::{
    encoder::Encoder,
    error::{Error, FlError},
    slice::{FlSliceResult, SharedValue},
    value::{Value, ValueType},
};
use serde::ser::{Serialize, SerializeMap, SerializeSeq, Serializer};
use std::collections::{btree_map, BTreeMap};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CopyFlags {
    /// Children stay shared with the source until they are written
    Shallow,
    /// Whole tree is copied eagerly
    Deep,
}

#[derive(Debug, Clone)]
pub enum MutableValue {
    Null,
    Bool(bool),
    Int(i64),
    UInt(u64),
    Float(f32),
    Double(f64),
    String(String),
    Data(Vec<u8>),
    Array(MutableArray),
    Dict(MutableDict),
    Shared(SharedValue),
}

impl MutableValue {
    /// Recursive copy of a borrowed value
    pub fn from_value(value: Value<'_>) -> Self {
        match value.value_type() {
            ValueType::Undefined | ValueType::Null => MutableValue::Null,
            ValueType::Boolean => MutableValue::Bool(value.as_bool()),
            ValueType::Number => {
                if value.is_unsigned() {
                    MutableValue::UInt(value.as_u64())
                } else if value.is_integer() {
                    MutableValue::Int(value.as_i64())
                } else if value.is_double() {
                    MutableValue::Double(value.as_f64())
                } else {
                    MutableValue::Float(value.as_f32())
                }
            }
            ValueType::String => MutableValue::String(value.as_str().unwrap_or_default().into()),
            ValueType::Data => MutableValue::Data(value.as_data().unwrap_or_default().to_vec()),
            ValueType::Array => MutableValue::Array(MutableArray {
                items: value
                    .as_array()
                    .map(|arr| arr.iter().map(MutableValue::from_value).collect())
                    .unwrap_or_default(),
                changed: false,
            }),
            ValueType::Dict => MutableValue::Dict(MutableDict {
                entries: value
                    .as_dict()
                    .map(|dict| {
                        dict.iter()
                            .map(|(k, v)| (k.to_string(), MutableValue::from_value(v)))
                            .collect()
                    })
                    .unwrap_or_default(),
                changed: false,
            }),
        }
    }

    fn child_of(parent: &SharedValue, child: Value<'_>, flags: CopyFlags) -> Self {
        match (flags, child.value_type()) {
            (CopyFlags::Deep, _)
            | (_, ValueType::Undefined | ValueType::Null | ValueType::Boolean | ValueType::Number) => {
                MutableValue::from_value(child)
            }
            _ => parent
                .share(child)
                .map(MutableValue::Shared)
                .unwrap_or_else(|| MutableValue::from_value(child)),
        }
    }

    /// Borrowed view of a value that was not materialized
    pub fn as_value(&self) -> Option<Value<'_>> {
        match self {
            MutableValue::Shared(shared) => Some(shared.value()),
            _ => None,
        }
    }

    pub fn value_type(&self) -> ValueType {
        match self {
            MutableValue::Null => ValueType::Null,
            MutableValue::Bool(_) => ValueType::Boolean,
            MutableValue::Int(_)
            | MutableValue::UInt(_)
            | MutableValue::Float(_)
            | MutableValue::Double(_) => ValueType::Number,
            MutableValue::String(_) => ValueType::String,
            MutableValue::Data(_) => ValueType::Data,
            MutableValue::Array(_) => ValueType::Array,
            MutableValue::Dict(_) => ValueType::Dict,
            MutableValue::Shared(shared) => shared.value().value_type(),
        }
    }

    pub fn as_bool(&self) -> bool {
        match self {
            MutableValue::Null => false,
            MutableValue::Bool(b) => *b,
            MutableValue::Int(x) => *x != 0,
            MutableValue::UInt(x) => *x != 0,
            MutableValue::Float(x) => *x != 0.0,
            MutableValue::Double(x) => *x != 0.0,
            MutableValue::Shared(shared) => shared.value().as_bool(),
            _ => true,
        }
    }

    pub fn as_i64(&self) -> i64 {
        match self {
            MutableValue::Bool(b) => i64::from(*b),
            MutableValue::Int(x) => *x,
            MutableValue::UInt(x) => *x as i64,
            MutableValue::Float(x) => *x as i64,
            MutableValue::Double(x) => *x as i64,
            MutableValue::Shared(shared) => shared.value().as_i64(),
            _ => 0,
        }
    }

    pub fn as_f64(&self) -> f64 {
        match self {
            MutableValue::Int(x) => *x as f64,
            MutableValue::UInt(x) => *x as f64,
            MutableValue::Float(x) => f64::from(*x),
            MutableValue::Double(x) => *x,
            MutableValue::Shared(shared) => shared.value().as_f64(),
            _ => 0.0,
        }
    }

    pub fn as_str(&self) -> Option<&str> {
        match self {
            MutableValue::String(s) => Some(s),
            MutableValue::Shared(shared) => shared.value().as_str(),
            _ => None,
        }
    }

    pub fn as_data(&self) -> Option<&[u8]> {
        match self {
            MutableValue::Data(d) => Some(d),
            MutableValue::Shared(shared) => shared.value().as_data(),
            _ => None,
        }
    }

    pub fn as_dict(&self) -> Option<&MutableDict> {
        match self {
            MutableValue::Dict(d) => Some(d),
            _ => None,
        }
    }

    pub fn as_array(&self) -> Option<&MutableArray> {
        match self {
            MutableValue::Array(a) => Some(a),
            _ => None,
        }
    }

    pub fn is_changed(&self) -> bool {
        match self {
            MutableValue::Array(arr) => arr.is_changed(),
            MutableValue::Dict(dict) => dict.is_changed(),
            _ => false,
        }
    }

    pub fn encode(&self) -> Result<FlSliceResult, Error> {
        let mut enc = Encoder::new();
        enc.write_mutable(self)?;
        enc.finish()
    }

    pub fn to_json(&self) -> Result<String, Error> {
        Ok(self.encode()?.value().to_json())
    }
}

impl PartialEq for MutableValue {
    fn eq(&self, other: &Self) -> bool {
        match (self.encode(), other.encode()) {
            (Ok(a), Ok(b)) => a.value() == b.value(),
            _ => false,
        }
    }
}

macro_rules! impl_from_for_mutable {
    ($($ty:ty => $variant:ident),*) => {
        $(
            impl From<$ty> for MutableValue {
                #[inline]
                fn from(v: $ty) -> Self {
                    MutableValue::$variant(v.into())
                }
            }
        )*
    };
}

impl_from_for_mutable!(
    bool => Bool, i32 => Int, i64 => Int, u32 => Int, u64 => UInt, f32 => Float, f64 => Double,
    String => String, &str => String, Vec<u8> => Data, MutableArray => Array,
    MutableDict => Dict, SharedValue => Shared
);

#[derive(Debug, Clone, Default)]
pub struct MutableDict {
    entries: BTreeMap<String, MutableValue>,
    changed: bool,
}

impl MutableDict {
    pub fn new() -> Self {
        Self::default()
    }

    /// Mutable copy of the dict `source` points to
    pub fn from_shared(source: &SharedValue, flags: CopyFlags) -> Option<Self> {
        let dict = source.value().as_dict()?;
        let entries = dict
            .iter()
            .map(|(k, v)| (k.to_string(), MutableValue::child_of(source, v, flags)))
            .collect();
        Some(Self {
            entries,
            changed: false,
        })
    }

    /// Decode untrusted data with a dict as root
    pub fn from_data(data: Vec<u8>) -> Result<Self, Error> {
        let buf = FlSliceResult::from_untrusted(data)
            .ok_or_else(|| Error::InvalidFormat("untrusted data validation failed".into()))?;
        Self::from_shared(&buf.shared_root(), CopyFlags::Shallow)
            .ok_or(Error::Fleece(FlError::InvalidData))
    }

    #[inline]
    pub fn len(&self) -> usize {
        self.entries.len()
    }
    #[inline]
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
    #[inline]
    pub fn get(&self, key: &str) -> Option<&MutableValue> {
        self.entries.get(key)
    }
    #[inline]
    pub fn contains_key(&self, key: &str) -> bool {
        self.entries.contains_key(key)
    }
    pub fn keys(&self) -> impl Iterator<Item = &str> {
        self.entries.keys().map(String::as_str)
    }
    pub fn iter(&self) -> btree_map::Iter<'_, String, MutableValue> {
        self.entries.iter()
    }

    pub fn set(&mut self, key: impl Into<String>, value: impl Into<MutableValue>) {
        self.entries.insert(key.into(), value.into());
        self.changed = true;
    }
    #[inline]
    pub fn set_null(&mut self, key: &str) {
        self.set(key, MutableValue::Null);
    }
    #[inline]
    pub fn set_bool(&mut self, key: &str, value: bool) {
        self.set(key, value);
    }
    #[inline]
    pub fn set_i64(&mut self, key: &str, value: i64) {
        self.set(key, value);
    }
    #[inline]
    pub fn set_u64(&mut self, key: &str, value: u64) {
        self.set(key, value);
    }
    #[inline]
    pub fn set_f64(&mut self, key: &str, value: f64) {
        self.set(key, value);
    }
    #[inline]
    pub fn set_string(&mut self, key: &str, value: &str) {
        self.set(key, value);
    }
    #[inline]
    pub fn set_data(&mut self, key: &str, value: &[u8]) {
        self.set(key, value.to_vec());
    }

    pub fn remove(&mut self, key: &str) -> Option<MutableValue> {
        let ret = self.entries.remove(key);
        if ret.is_some() {
            self.changed = true;
        }
        ret
    }

    pub fn clear(&mut self) {
        if !self.entries.is_empty() {
            self.entries.clear();
            self.changed = true;
        }
    }

    /// Child dict for modification, promoted from shared storage if needed
    pub fn get_mut_dict(&mut self, key: &str) -> Option<&mut MutableDict> {
        let slot = self.entries.get_mut(key)?;
        promote(slot);
        match slot {
            MutableValue::Dict(d) => Some(d),
            _ => None,
        }
    }

    /// Child array for modification, promoted from shared storage if needed
    pub fn get_mut_array(&mut self, key: &str) -> Option<&mut MutableArray> {
        let slot = self.entries.get_mut(key)?;
        promote(slot);
        match slot {
            MutableValue::Array(a) => Some(a),
            _ => None,
        }
    }

    /// True if this dict or any nested container was modified
    pub fn is_changed(&self) -> bool {
        self.changed || self.entries.values().any(MutableValue::is_changed)
    }

    pub fn encode_to(&self, enc: &mut Encoder) -> Result<(), Error> {
        enc.begin_dict(self.len())?;
        for (key, item) in &self.entries {
            enc.write_key(key)?;
            enc.write_mutable(item)?;
        }
        enc.end_dict()
    }

    pub fn encode(&self) -> Result<FlSliceResult, Error> {
        let mut enc = Encoder::new();
        self.encode_to(&mut enc)?;
        enc.finish()
    }

    pub fn to_json(&self) -> Result<String, Error> {
        Ok(self.encode()?.value().to_json())
    }
}

impl PartialEq for MutableDict {
    fn eq(&self, other: &Self) -> bool {
        self.len() == other.len()
            && self
                .iter()
                .zip(other.iter())
                .all(|((ka, va), (kb, vb))| ka == kb && va == vb)
    }
}

fn promote(slot: &mut MutableValue) {
    let promoted = match slot {
        MutableValue::Shared(shared) => match shared.value().value_type() {
            ValueType::Dict => MutableDict::from_shared(shared, CopyFlags::Shallow)
                .map(MutableValue::Dict),
            ValueType::Array => MutableArray::from_shared(shared, CopyFlags::Shallow)
                .map(MutableValue::Array),
            _ => None,
        },
        _ => None,
    };
    if let Some(promoted) = promoted {
        *slot = promoted;
    }
}

#[derive(Debug, Clone, Default)]
pub struct MutableArray {
    items: Vec<MutableValue>,
    changed: bool,
}

impl MutableArray {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn from_shared(source: &SharedValue, flags: CopyFlags) -> Option<Self> {
        let arr = source.value().as_array()?;
        let items = arr
            .iter()
            .map(|v| MutableValue::child_of(source, v, flags))
            .collect();
        Some(Self {
            items,
            changed: false,
        })
    }

    #[inline]
    pub fn len(&self) -> usize {
        self.items.len()
    }
    #[inline]
    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }
    #[inline]
    pub fn get(&self, index: usize) -> Option<&MutableValue> {
        self.items.get(index)
    }
    pub fn iter(&self) -> std::slice::Iter<'_, MutableValue> {
        self.items.iter()
    }

    pub fn set(&mut self, index: usize, value: impl Into<MutableValue>) -> Result<(), Error> {
        let slot = self
            .items
            .get_mut(index)
            .ok_or(Error::Fleece(FlError::OutOfRange))?;
        *slot = value.into();
        self.changed = true;
        Ok(())
    }

    pub fn append(&mut self, value: impl Into<MutableValue>) {
        self.items.push(value.into());
        self.changed = true;
    }

    pub fn insert(&mut self, index: usize, value: impl Into<MutableValue>) -> Result<(), Error> {
        if index > self.items.len() {
            return Err(Error::Fleece(FlError::OutOfRange));
        }
        self.items.insert(index, value.into());
        self.changed = true;
        Ok(())
    }

    pub fn remove_at(&mut self, index: usize) -> Result<MutableValue, Error> {
        if index >= self.items.len() {
            return Err(Error::Fleece(FlError::OutOfRange));
        }
        self.changed = true;
        Ok(self.items.remove(index))
    }

    /// Truncate, or pad with nulls
    pub fn resize(&mut self, len: usize) {
        if len != self.items.len() {
            self.items.resize(len, MutableValue::Null);
            self.changed = true;
        }
    }

    pub fn clear(&mut self) {
        self.resize(0);
    }

    pub fn get_mut_dict(&mut self, index: usize) -> Option<&mut MutableDict> {
        let slot = self.items.get_mut(index)?;
        promote(slot);
        match slot {
            MutableValue::Dict(d) => Some(d),
            _ => None,
        }
    }

    pub fn get_mut_array(&mut self, index: usize) -> Option<&mut MutableArray> {
        let slot = self.items.get_mut(index)?;
        promote(slot);
        match slot {
            MutableValue::Array(a) => Some(a),
            _ => None,
        }
    }

    pub fn is_changed(&self) -> bool {
        self.changed || self.items.iter().any(MutableValue::is_changed)
    }

    pub fn encode(&self) -> Result<FlSliceResult, Error> {
        let mut enc = Encoder::new();
        enc.begin_array(self.len())?;
        for item in &self.items {
            enc.write_mutable(item)?;
        }
        enc.end_array()?;
        enc.finish()
    }
}

impl PartialEq for MutableArray {
    fn eq(&self, other: &Self) -> bool {
        self.items == other.items
    }
}

impl Serialize for MutableValue {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        match self {
            MutableValue::Null => serializer.serialize_unit(),
            MutableValue::Bool(b) => serializer.serialize_bool(*b),
            MutableValue::Int(x) => serializer.serialize_i64(*x),
            MutableValue::UInt(x) => serializer.serialize_u64(*x),
            MutableValue::Float(x) => serializer.serialize_f32(*x),
            MutableValue::Double(x) => serializer.serialize_f64(*x),
            MutableValue::String(s) => serializer.serialize_str(s),
            MutableValue::Data(d) => serializer.serialize_bytes(d),
            MutableValue::Array(arr) => arr.serialize(serializer),
            MutableValue::Dict(dict) => dict.serialize(serializer),
            MutableValue::Shared(shared) => shared.value().serialize(serializer),
        }
    }
}

impl Serialize for MutableDict {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        let mut map = serializer.serialize_map(Some(self.len()))?;
        for (key, item) in &self.entries {
            map.serialize_entry(key, item)?;
        }
        map.end()
    }
}

impl Serialize for MutableArray {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        let mut seq = serializer.serialize_seq(Some(self.len()))?;
        for item in &self.items {
            seq.serialize_element(item)?;
        }
        seq.end()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample() -> FlSliceResult {
        let mut enc = Encoder::new();
        enc.begin_dict(3).unwrap();
        enc.write_key("name").unwrap();
        enc.write_string("tester").unwrap();
        enc.write_key("address").unwrap();
        enc.begin_dict(1).unwrap();
        enc.write_key("city").unwrap();
        enc.write_string("Paris").unwrap();
        enc.end_dict().unwrap();
        enc.write_key("tags").unwrap();
        enc.begin_array(2).unwrap();
        enc.write_string("a").unwrap();
        enc.write_i64(-5).unwrap();
        enc.end_array().unwrap();
        enc.end_dict().unwrap();
        enc.finish().unwrap()
    }

    #[test]
    fn test_unchanged_copy_reencodes_identically() {
        let src = sample();
        let dict = MutableDict::from_shared(&src.shared_root(), CopyFlags::Shallow).unwrap();
        assert!(!dict.is_changed());
        assert!(matches!(dict.get("address"), Some(MutableValue::Shared(_))));
        assert_eq!(src.as_bytes(), dict.encode().unwrap().as_bytes());

        let deep = MutableDict::from_shared(&src.shared_root(), CopyFlags::Deep).unwrap();
        assert!(matches!(deep.get("address"), Some(MutableValue::Dict(_))));
        assert!(!deep.is_changed());
        assert_eq!(src.as_bytes(), deep.encode().unwrap().as_bytes());
    }

    #[test]
    fn test_lazy_promotion_and_changed_flag() {
        let src = sample();
        let mut dict = MutableDict::from_shared(&src.shared_root(), CopyFlags::Shallow).unwrap();
        {
            let address = dict.get_mut_dict("address").unwrap();
            assert!(!address.is_changed());
            assert_eq!(Some("Paris"), address.get("city").and_then(MutableValue::as_str));
        }
        assert!(!dict.is_changed());
        assert!(dict.get_mut_dict("name").is_none());

        dict.get_mut_dict("address").unwrap().set_string("city", "Rome");
        assert!(dict.is_changed());
        dict.get_mut_array("tags").unwrap().append(true);
        assert_eq!(
            r#"{"address":{"city":"Rome"},"name":"tester","tags":["a",-5,true]}"#,
            dict.to_json().unwrap()
        );
        // source buffer is not affected
        assert_eq!(
            "Paris",
            src.root_dict()
                .unwrap()
                .get("address")
                .unwrap()
                .as_dict()
                .unwrap()
                .get("city")
                .unwrap()
                .as_str()
                .unwrap()
        );
    }

    #[test]
    fn test_array_ops() {
        let mut arr = MutableArray::new();
        arr.append(1);
        arr.append("two");
        arr.insert(0, 0.5).unwrap();
        assert!(arr.insert(10, 1).is_err());
        assert!(arr.set(3, 1).is_err());
        assert_eq!(MutableValue::Int(1), arr.remove_at(1).unwrap());
        arr.resize(3);
        assert_eq!(MutableValue::Null, *arr.get(2).unwrap());
        let data = arr.encode().unwrap();
        assert_eq!(r#"[0.5,"two",null]"#, data.value().to_json());
    }
}
