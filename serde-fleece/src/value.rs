//! Zero-copy view over encoded fleece data.
//!
//! Every value starts with a tag byte. Scalars and strings are read in place,
//! arrays and dicts carry an offsets table, so element access is O(1) and
//! dict lookup is a binary search over keys sorted by their bytes.

use base64::{engine::general_purpose::STANDARD as BASE64, Engine};
use serde::ser::{Serialize, SerializeMap, SerializeSeq, Serializer};
use std::{cmp::Ordering, fmt, str};

pub(crate) mod tag {
    pub const NULL: u8 = 0x00;
    pub const FALSE: u8 = 0x01;
    pub const TRUE: u8 = 0x02;
    /// `INT + n - 1` for little-endian integer of `n` bytes
    pub const INT: u8 = 0x10;
    pub const INT_MAX: u8 = 0x17;
    pub const UINT: u8 = 0x18;
    pub const FLOAT: u8 = 0x20;
    pub const DOUBLE: u8 = 0x21;
    pub const STRING: u8 = 0x30;
    pub const DATA: u8 = 0x31;
    pub const ARRAY: u8 = 0x40;
    pub const DICT: u8 = 0x50;
}

/// tag + count + body length
pub(crate) const COLLECTION_HEADER: usize = 9;
const MAX_DEPTH: usize = 512;

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum ValueType {
    Undefined,
    Null,
    Boolean,
    Number,
    String,
    Data,
    Array,
    Dict,
}

/// How much to trust the input of `Value::from_data`
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Trust {
    /// Whole structure is validated before any node is exposed
    Untrusted,
    /// Only the root header is checked, used for data produced by this crate
    Trusted,
}

#[derive(Clone, Copy)]
enum Number {
    Int(i64),
    UInt(u64),
    Float(f64),
}

impl Number {
    fn to_f64(self) -> f64 {
        match self {
            Number::Int(x) => x as f64,
            Number::UInt(x) => x as f64,
            Number::Float(x) => x,
        }
    }
}

pub(crate) fn read_u32(data: &[u8], pos: usize) -> Option<usize> {
    let bytes = data.get(pos..pos.checked_add(4)?)?;
    let mut buf = [0u8; 4];
    buf.copy_from_slice(bytes);
    usize::try_from(u32::from_le_bytes(buf)).ok()
}

fn read_array<const N: usize>(data: &[u8], pos: usize) -> Option<[u8; N]> {
    let bytes = data.get(pos..pos.checked_add(N)?)?;
    let mut buf = [0u8; N];
    buf.copy_from_slice(bytes);
    Some(buf)
}

/// Size of the value that starts at `pos`, only the header is inspected.
pub(crate) fn encoded_len(data: &[u8], pos: usize) -> Option<usize> {
    let t = *data.get(pos)?;
    let len = match t {
        tag::NULL | tag::FALSE | tag::TRUE => 1,
        tag::INT..=tag::INT_MAX => usize::from(t - tag::INT) + 2,
        tag::UINT => 9,
        tag::FLOAT => 5,
        tag::DOUBLE => 9,
        tag::STRING | tag::DATA => 5usize.checked_add(read_u32(data, pos + 1)?)?,
        tag::ARRAY | tag::DICT => {
            let count = read_u32(data, pos + 1)?;
            let body = read_u32(data, pos + 5)?;
            COLLECTION_HEADER
                .checked_add(count.checked_mul(4)?)?
                .checked_add(body)?
        }
        _ => return None,
    };
    if pos.checked_add(len)? <= data.len() {
        Some(len)
    } else {
        None
    }
}

pub(crate) fn decode_int(payload: &[u8]) -> i64 {
    let n = payload.len().min(8);
    let negative = n > 0 && payload[n - 1] & 0x80 != 0;
    let mut buf = if negative { [0xFF; 8] } else { [0; 8] };
    buf[..n].copy_from_slice(&payload[..n]);
    i64::from_le_bytes(buf)
}

/// Number of bytes required to store `v` as two's complement
pub(crate) fn int_width(v: i64) -> usize {
    let bytes = v.to_le_bytes();
    let mut n = 8;
    while n > 1 {
        let top = bytes[n - 1];
        let next_negative = bytes[n - 2] & 0x80 != 0;
        if (top == 0 && !next_negative) || (top == 0xFF && next_negative) {
            n -= 1;
        } else {
            break;
        }
    }
    n
}

fn validate(data: &[u8], pos: usize, depth: usize) -> Option<usize> {
    if depth > MAX_DEPTH {
        return None;
    }
    let len = encoded_len(data, pos)?;
    let v = data.get(pos..pos + len)?;
    match v[0] {
        tag::INT..=tag::INT_MAX => {
            let n = len - 1;
            if n > 1 {
                let top = v[n];
                let next_negative = v[n - 1] & 0x80 != 0;
                if (top == 0 && !next_negative) || (top == 0xFF && next_negative) {
                    return None;
                }
            }
        }
        tag::UINT => {
            if u64::from_le_bytes(read_array(v, 1)?) <= i64::MAX as u64 {
                return None;
            }
        }
        tag::FLOAT => {
            if !f32::from_le_bytes(read_array(v, 1)?).is_finite() {
                return None;
            }
        }
        tag::DOUBLE => {
            if !f64::from_le_bytes(read_array(v, 1)?).is_finite() {
                return None;
            }
        }
        tag::STRING => {
            str::from_utf8(&v[5..]).ok()?;
        }
        tag::ARRAY => validate_collection(v, depth, false)?,
        tag::DICT => validate_collection(v, depth, true)?,
        _ => {}
    }
    Some(len)
}

fn validate_collection(v: &[u8], depth: usize, is_dict: bool) -> Option<()> {
    let count = read_u32(v, 1)?;
    let body = v.get(COLLECTION_HEADER + count * 4..)?;
    let mut expected = 0;
    let mut prev_key: Option<&[u8]> = None;
    for i in 0..count {
        let off = read_u32(v, COLLECTION_HEADER + i * 4)?;
        if off != expected {
            return None;
        }
        let mut p = off;
        if is_dict {
            if body.get(p) != Some(&tag::STRING) {
                return None;
            }
            let key_len = validate(body, p, depth + 1)?;
            let key = body.get(p + 5..p + key_len)?;
            if prev_key.is_some_and(|prev| prev >= key) {
                return None;
            }
            prev_key = Some(key);
            p += key_len;
        }
        expected = p + validate(body, p, depth + 1)?;
    }
    if expected == body.len() {
        Some(())
    } else {
        None
    }
}

/// Reference to one encoded value, borrowed from the buffer it lives in
#[derive(Clone, Copy)]
pub struct Value<'a> {
    data: &'a [u8],
}

impl<'a> Value<'a> {
    pub const UNDEFINED: Value<'static> = Value { data: &[] };

    /// Interpret `data` as one encoded root value
    pub fn from_data(data: &'a [u8], trust: Trust) -> Option<Self> {
        let len = match trust {
            Trust::Untrusted => validate(data, 0, 0)?,
            Trust::Trusted => encoded_len(data, 0)?,
        };
        if len == data.len() {
            Some(Value { data })
        } else {
            None
        }
    }

    pub(crate) fn at(data: &'a [u8], pos: usize) -> Option<Self> {
        let len = encoded_len(data, pos)?;
        data.get(pos..pos + len).map(|data| Value { data })
    }

    #[inline]
    fn tag(&self) -> Option<u8> {
        self.data.first().copied()
    }

    /// Encoded bytes of this value, usable for raw pass-through
    #[inline]
    pub fn as_bytes(&self) -> &'a [u8] {
        self.data
    }

    pub fn value_type(&self) -> ValueType {
        match self.tag() {
            None => ValueType::Undefined,
            Some(tag::NULL) => ValueType::Null,
            Some(tag::FALSE | tag::TRUE) => ValueType::Boolean,
            Some(tag::INT..=tag::UINT | tag::FLOAT | tag::DOUBLE) => ValueType::Number,
            Some(tag::STRING) => ValueType::String,
            Some(tag::DATA) => ValueType::Data,
            Some(tag::ARRAY) => ValueType::Array,
            Some(tag::DICT) => ValueType::Dict,
            Some(_) => ValueType::Undefined,
        }
    }

    #[inline]
    pub fn is_undefined(&self) -> bool {
        self.value_type() == ValueType::Undefined
    }
    #[inline]
    pub fn is_null(&self) -> bool {
        self.tag() == Some(tag::NULL)
    }
    #[inline]
    pub fn is_integer(&self) -> bool {
        matches!(self.tag(), Some(tag::INT..=tag::UINT))
    }
    #[inline]
    pub fn is_unsigned(&self) -> bool {
        self.tag() == Some(tag::UINT)
    }
    #[inline]
    pub fn is_double(&self) -> bool {
        self.tag() == Some(tag::DOUBLE)
    }

    fn number(&self) -> Option<Number> {
        match self.tag()? {
            t @ tag::INT..=tag::INT_MAX => {
                let n = usize::from(t - tag::INT) + 1;
                Some(Number::Int(decode_int(self.data.get(1..1 + n)?)))
            }
            tag::UINT => Some(Number::UInt(u64::from_le_bytes(read_array(self.data, 1)?))),
            tag::FLOAT => Some(Number::Float(f64::from(f32::from_le_bytes(read_array(
                self.data, 1,
            )?)))),
            tag::DOUBLE => Some(Number::Float(f64::from_le_bytes(read_array(self.data, 1)?))),
            _ => None,
        }
    }

    /// `false` only for null, undefined, `false` and zero
    pub fn as_bool(&self) -> bool {
        match self.tag() {
            None | Some(tag::NULL) | Some(tag::FALSE) => false,
            Some(tag::TRUE) => true,
            _ => match self.number() {
                Some(n) => n.to_f64() != 0.0,
                None => true,
            },
        }
    }

    pub fn as_i64(&self) -> i64 {
        match self.number() {
            Some(Number::Int(x)) => x,
            Some(Number::UInt(x)) => x as i64,
            Some(Number::Float(x)) => x as i64,
            None => i64::from(self.tag() == Some(tag::TRUE)),
        }
    }

    pub fn as_u64(&self) -> u64 {
        match self.number() {
            Some(Number::Int(x)) => x as u64,
            Some(Number::UInt(x)) => x,
            Some(Number::Float(x)) => x as u64,
            None => u64::from(self.tag() == Some(tag::TRUE)),
        }
    }

    pub fn as_f32(&self) -> f32 {
        match self.tag() {
            Some(tag::FLOAT) => read_array(self.data, 1)
                .map(f32::from_le_bytes)
                .unwrap_or_default(),
            _ => self.as_f64() as f32,
        }
    }

    pub fn as_f64(&self) -> f64 {
        self.number().map(Number::to_f64).unwrap_or_default()
    }

    pub fn as_str(&self) -> Option<&'a str> {
        if self.tag() != Some(tag::STRING) {
            return None;
        }
        str::from_utf8(self.data.get(5..)?).ok()
    }

    pub fn as_data(&self) -> Option<&'a [u8]> {
        if self.tag() != Some(tag::DATA) {
            return None;
        }
        self.data.get(5..)
    }

    pub fn as_array(&self) -> Option<Array<'a>> {
        if self.tag() == Some(tag::ARRAY) {
            Some(Array { data: self.data })
        } else {
            None
        }
    }

    pub fn as_dict(&self) -> Option<Dict<'a>> {
        if self.tag() == Some(tag::DICT) {
            Some(Dict { data: self.data })
        } else {
            None
        }
    }

    pub fn to_json(&self) -> String {
        let mut out = String::new();
        self.write_json(&mut out);
        out
    }

    pub(crate) fn write_json(&self, out: &mut String) {
        match self.value_type() {
            ValueType::Undefined | ValueType::Null => out.push_str("null"),
            ValueType::Boolean => out.push_str(if self.as_bool() { "true" } else { "false" }),
            ValueType::Number => match self.number() {
                Some(Number::Int(x)) => out.push_str(itoa::Buffer::new().format(x)),
                Some(Number::UInt(x)) => out.push_str(itoa::Buffer::new().format(x)),
                Some(Number::Float(_)) if self.tag() == Some(tag::FLOAT) => {
                    out.push_str(ryu::Buffer::new().format(self.as_f32()))
                }
                Some(Number::Float(x)) => out.push_str(ryu::Buffer::new().format(x)),
                None => out.push_str("null"),
            },
            ValueType::String => write_json_string(out, self.as_str().unwrap_or_default()),
            ValueType::Data => {
                write_json_string(out, &BASE64.encode(self.as_data().unwrap_or_default()))
            }
            ValueType::Array => {
                out.push('[');
                if let Some(arr) = self.as_array() {
                    for (i, item) in arr.iter().enumerate() {
                        if i > 0 {
                            out.push(',');
                        }
                        item.write_json(out);
                    }
                }
                out.push(']');
            }
            ValueType::Dict => {
                out.push('{');
                if let Some(dict) = self.as_dict() {
                    for (i, (key, item)) in dict.iter().enumerate() {
                        if i > 0 {
                            out.push(',');
                        }
                        write_json_string(out, key);
                        out.push(':');
                        item.write_json(out);
                    }
                }
                out.push('}');
            }
        }
    }

    /// Structural ordering: null < bool < number < string < data < array < dict
    pub fn compare(&self, other: &Value<'_>) -> Ordering {
        let (ta, tb) = (self.value_type(), other.value_type());
        if ta != tb {
            return ta.cmp(&tb);
        }
        match ta {
            ValueType::Undefined | ValueType::Null => Ordering::Equal,
            ValueType::Boolean => self.as_bool().cmp(&other.as_bool()),
            ValueType::Number => match (self.number(), other.number()) {
                (Some(Number::Int(a)), Some(Number::Int(b))) => a.cmp(&b),
                (Some(Number::UInt(a)), Some(Number::UInt(b))) => a.cmp(&b),
                (Some(Number::Int(_)), Some(Number::UInt(_))) => Ordering::Less,
                (Some(Number::UInt(_)), Some(Number::Int(_))) => Ordering::Greater,
                (Some(a), Some(b)) => a
                    .to_f64()
                    .partial_cmp(&b.to_f64())
                    .unwrap_or(Ordering::Equal),
                (a, b) => a.is_some().cmp(&b.is_some()),
            },
            ValueType::String => self.as_str().cmp(&other.as_str()),
            ValueType::Data => self.as_data().cmp(&other.as_data()),
            ValueType::Array => match (self.as_array(), other.as_array()) {
                (Some(a), Some(b)) => {
                    for (x, y) in a.iter().zip(b.iter()) {
                        let ord = x.compare(&y);
                        if ord != Ordering::Equal {
                            return ord;
                        }
                    }
                    a.len().cmp(&b.len())
                }
                _ => Ordering::Equal,
            },
            ValueType::Dict => match (self.as_dict(), other.as_dict()) {
                (Some(a), Some(b)) => {
                    let ord = a.len().cmp(&b.len());
                    if ord != Ordering::Equal {
                        return ord;
                    }
                    for ((ka, va), (kb, vb)) in a.iter().zip(b.iter()) {
                        let ord = ka.cmp(kb).then_with(|| va.compare(&vb));
                        if ord != Ordering::Equal {
                            return ord;
                        }
                    }
                    Ordering::Equal
                }
                _ => Ordering::Equal,
            },
        }
    }
}

impl PartialEq for Value<'_> {
    fn eq(&self, other: &Value<'_>) -> bool {
        self.compare(other) == Ordering::Equal
    }
}

impl fmt::Debug for Value<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.is_undefined() {
            f.write_str("undefined")
        } else {
            f.write_str(&self.to_json())
        }
    }
}

pub(crate) fn write_json_string(out: &mut String, s: &str) {
    out.push('"');
    for ch in s.chars() {
        match ch {
            '"' => out.push_str("\\\""),
            '\\' => out.push_str("\\\\"),
            '\n' => out.push_str("\\n"),
            '\r' => out.push_str("\\r"),
            '\t' => out.push_str("\\t"),
            c if (c as u32) < 0x20 => {
                out.push_str(&format!("\\u{:04x}", c as u32));
            }
            c => out.push(c),
        }
    }
    out.push('"');
}

#[derive(Clone, Copy)]
pub struct Array<'a> {
    data: &'a [u8],
}

impl<'a> Array<'a> {
    #[inline]
    pub fn len(&self) -> usize {
        read_u32(self.data, 1).unwrap_or(0)
    }
    #[inline]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
    fn body(&self) -> &'a [u8] {
        self.data
            .get(COLLECTION_HEADER.saturating_add(self.len().saturating_mul(4))..)
            .unwrap_or_default()
    }
    pub fn get(&self, index: usize) -> Option<Value<'a>> {
        if index >= self.len() {
            return None;
        }
        let off = read_u32(self.data, COLLECTION_HEADER + index * 4)?;
        Value::at(self.body(), off)
    }
    pub fn iter(&self) -> ArrayIter<'a> {
        ArrayIter {
            array: *self,
            index: 0,
            len: self.len(),
        }
    }
    #[inline]
    pub fn as_value(&self) -> Value<'a> {
        Value { data: self.data }
    }
}

impl fmt::Debug for Array<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.as_value().fmt(f)
    }
}

impl PartialEq for Array<'_> {
    fn eq(&self, other: &Array<'_>) -> bool {
        self.as_value() == other.as_value()
    }
}

pub struct ArrayIter<'a> {
    array: Array<'a>,
    index: usize,
    len: usize,
}

impl<'a> Iterator for ArrayIter<'a> {
    type Item = Value<'a>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.index >= self.len {
            return None;
        }
        let item = self.array.get(self.index).unwrap_or(Value::UNDEFINED);
        self.index += 1;
        Some(item)
    }

    fn size_hint(&self) -> (usize, Option<usize>) {
        let n = self.len - self.index;
        (n, Some(n))
    }
}

impl<'a> IntoIterator for Array<'a> {
    type Item = Value<'a>;
    type IntoIter = ArrayIter<'a>;

    fn into_iter(self) -> Self::IntoIter {
        self.iter()
    }
}

#[derive(Clone, Copy)]
pub struct Dict<'a> {
    data: &'a [u8],
}

impl<'a> Dict<'a> {
    #[inline]
    pub fn len(&self) -> usize {
        read_u32(self.data, 1).unwrap_or(0)
    }
    #[inline]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
    fn body(&self) -> &'a [u8] {
        self.data
            .get(COLLECTION_HEADER.saturating_add(self.len().saturating_mul(4))..)
            .unwrap_or_default()
    }
    fn entry(&self, index: usize) -> Option<(&'a [u8], Value<'a>)> {
        let body = self.body();
        let off = read_u32(self.data, COLLECTION_HEADER + index * 4)?;
        let key = Value::at(body, off)?;
        if key.tag() != Some(tag::STRING) {
            return None;
        }
        let value = Value::at(body, off + key.data.len())?;
        Some((key.data.get(5..)?, value))
    }
    pub fn get(&self, key: &str) -> Option<Value<'a>> {
        let key = key.as_bytes();
        let (mut lo, mut hi) = (0, self.len());
        while lo < hi {
            let mid = lo + (hi - lo) / 2;
            let (k, v) = self.entry(mid)?;
            match k.cmp(key) {
                Ordering::Less => lo = mid + 1,
                Ordering::Greater => hi = mid,
                Ordering::Equal => return Some(v),
            }
        }
        None
    }
    #[inline]
    pub fn contains_key(&self, key: &str) -> bool {
        self.get(key).is_some()
    }
    /// Entries in key order
    pub fn iter(&self) -> DictIter<'a> {
        DictIter {
            dict: *self,
            index: 0,
            len: self.len(),
        }
    }
    pub fn keys(&self) -> impl Iterator<Item = &'a str> {
        self.iter().map(|(k, _)| k)
    }
    #[inline]
    pub fn as_value(&self) -> Value<'a> {
        Value { data: self.data }
    }
    pub fn to_json(&self) -> String {
        self.as_value().to_json()
    }
}

impl fmt::Debug for Dict<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.as_value().fmt(f)
    }
}

impl PartialEq for Dict<'_> {
    fn eq(&self, other: &Dict<'_>) -> bool {
        self.as_value() == other.as_value()
    }
}

pub struct DictIter<'a> {
    dict: Dict<'a>,
    index: usize,
    len: usize,
}

impl<'a> Iterator for DictIter<'a> {
    type Item = (&'a str, Value<'a>);

    fn next(&mut self) -> Option<Self::Item> {
        while self.index < self.len {
            let entry = self.dict.entry(self.index);
            self.index += 1;
            if let Some((key, value)) = entry {
                if let Ok(key) = str::from_utf8(key) {
                    return Some((key, value));
                }
            }
        }
        None
    }
}

impl<'a> IntoIterator for Dict<'a> {
    type Item = (&'a str, Value<'a>);
    type IntoIter = DictIter<'a>;

    fn into_iter(self) -> Self::IntoIter {
        self.iter()
    }
}

impl Serialize for Value<'_> {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        match self.value_type() {
            ValueType::Undefined | ValueType::Null => serializer.serialize_unit(),
            ValueType::Boolean => serializer.serialize_bool(self.as_bool()),
            ValueType::Number => match self.number() {
                Some(Number::Int(x)) => serializer.serialize_i64(x),
                Some(Number::UInt(x)) => serializer.serialize_u64(x),
                Some(Number::Float(_)) if self.tag() == Some(tag::FLOAT) => {
                    serializer.serialize_f32(self.as_f32())
                }
                Some(Number::Float(x)) => serializer.serialize_f64(x),
                None => serializer.serialize_unit(),
            },
            ValueType::String => serializer.serialize_str(self.as_str().unwrap_or_default()),
            ValueType::Data => serializer.serialize_bytes(self.as_data().unwrap_or_default()),
            ValueType::Array => match self.as_array() {
                Some(arr) => arr.serialize(serializer),
                None => serializer.serialize_unit(),
            },
            ValueType::Dict => match self.as_dict() {
                Some(dict) => dict.serialize(serializer),
                None => serializer.serialize_unit(),
            },
        }
    }
}

impl Serialize for Array<'_> {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        let mut seq = serializer.serialize_seq(Some(self.len()))?;
        for item in self.iter() {
            seq.serialize_element(&item)?;
        }
        seq.end()
    }
}

impl Serialize for Dict<'_> {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        let mut map = serializer.serialize_map(Some(self.len()))?;
        for (key, item) in self.iter() {
            map.serialize_entry(key, &item)?;
        }
        map.end()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_int_width() {
        assert_eq!(1, int_width(0));
        assert_eq!(1, int_width(127));
        assert_eq!(2, int_width(128));
        assert_eq!(1, int_width(-128));
        assert_eq!(2, int_width(-129));
        assert_eq!(8, int_width(i64::MIN));
        assert_eq!(8, int_width(i64::MAX));
        for v in [0, 1, -1, 255, -256, 65_536, i64::MIN, i64::MAX] {
            let n = int_width(v);
            assert_eq!(v, decode_int(&v.to_le_bytes()[..n]));
        }
    }

    #[test]
    fn test_reject_garbage() {
        assert!(Value::from_data(&[], Trust::Untrusted).is_none());
        assert!(Value::from_data(&[0xFF], Trust::Untrusted).is_none());
        // trailing byte after the root
        assert!(Value::from_data(&[tag::TRUE, 0], Trust::Untrusted).is_none());
        // string length past the end
        assert!(Value::from_data(&[tag::STRING, 10, 0, 0, 0, b'a'], Trust::Untrusted).is_none());
        // invalid utf-8
        assert!(Value::from_data(&[tag::STRING, 1, 0, 0, 0, 0xFF], Trust::Untrusted).is_none());
        // non minimal integer
        assert!(Value::from_data(&[tag::INT + 1, 1, 0], Trust::Untrusted).is_none());
        assert!(Value::from_data(&[tag::INT + 1, 1, 0], Trust::Trusted).is_some());
    }

    #[test]
    fn test_trusted_garbage_does_not_panic() {
        // array claims one element at offset 100
        let data = [tag::ARRAY, 1, 0, 0, 0, 1, 0, 0, 0, 100, 0, 0, 0, tag::NULL];
        let v = Value::from_data(&data, Trust::Trusted).unwrap();
        assert!(Value::from_data(&data, Trust::Untrusted).is_none());
        let arr = v.as_array().unwrap();
        assert_eq!(1, arr.len());
        assert!(arr.get(0).is_none());
        assert_eq!(ValueType::Undefined, arr.iter().next().unwrap().value_type());
        assert_eq!("[null]", v.to_json());
    }
}
