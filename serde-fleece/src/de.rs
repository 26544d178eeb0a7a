mod dict;
mod seq;

use self::dict::DictAccess;
use crate::{
    de::{dict::EnumAccess, seq::ArrayAccess},
    value::{Dict, Trust, Value, ValueType},
    Error,
};
use itoa::Integer;
use serde::de::{self, IntoDeserializer};

pub(crate) struct Deserializer<'de> {
    pub value: Value<'de>,
}

impl<'de> Deserializer<'de> {
    fn new(value: Value<'de>) -> Self {
        Self { value }
    }
    fn from_slice(input: &'de [u8]) -> Result<Self, Error> {
        let fl_val = Value::from_data(input, Trust::Untrusted)
            .ok_or_else(|| Error::InvalidFormat("untrusted data validation failed".into()))?;
        Ok(Self::new(fl_val))
    }

    fn parse_signed<T: Integer + TryFrom<i64>>(&self) -> Result<T, Error> {
        let ty = self.value.value_type();
        if ty == ValueType::Number && self.value.is_integer() && !self.value.is_unsigned() {
            let ret: T = self.value.as_i64().try_into().map_err(|_err| {
                Error::InvalidFormat("Can not shrink i64 to smaller integer".into())
            })?;
            Ok(ret)
        } else {
            Err(Error::InvalidFormat(
                format!("Wrong data type: expect signed integer, got {ty:?}").into(),
            ))
        }
    }

    fn parse_unsigned<T: Integer + TryFrom<u64>>(&self) -> Result<T, Error> {
        let ty = self.value.value_type();
        if ty == ValueType::Number
            && self.value.is_integer()
            && (self.value.is_unsigned() || self.value.as_i64() >= 0)
        {
            let ret: T = self.value.as_u64().try_into().map_err(|_err| {
                Error::InvalidFormat("Can not shrink u64 to smaller unsigned integer".into())
            })?;
            Ok(ret)
        } else {
            Err(Error::InvalidFormat(
                format!("Wrong data type: expect unsigned integer, got {ty:?}").into(),
            ))
        }
    }

    fn parse_str(&self) -> Result<&'de str, Error> {
        let ty = self.value.value_type();
        if ty == ValueType::String {
            self.value
                .as_str()
                .ok_or_else(|| Error::InvalidFormat("not valid utf-8".into()))
        } else {
            Err(Error::InvalidFormat(
                format!("Wrong data type: expect String, got {ty:?}").into(),
            ))
        }
    }
}

/// Decode untrusted bytes
pub fn from_slice<'a, T>(s: &'a [u8]) -> Result<T, Error>
where
    T: de::Deserialize<'a>,
{
    let mut deserializer = Deserializer::from_slice(s)?;
    T::deserialize(&mut deserializer)
}

pub fn from_fl_dict<'a, T>(dict: Dict<'a>) -> Result<T, Error>
where
    T: de::Deserialize<'a>,
{
    let mut deserializer = Deserializer::new(dict.as_value());
    T::deserialize(&mut deserializer)
}

pub fn from_fl_value<'a, T: de::Deserialize<'a>>(value: Value<'a>) -> Result<T, Error> {
    let mut deserializer = Deserializer::new(value);
    T::deserialize(&mut deserializer)
}

impl<'de> de::Deserializer<'de> for &mut Deserializer<'de> {
    type Error = Error;

    fn deserialize_any<V>(self, visitor: V) -> Result<V::Value, Self::Error>
    where
        V: de::Visitor<'de>,
    {
        match self.value.value_type() {
            ValueType::Undefined => Err(Error::Unsupported(
                "deserialize self described: `undefined` not supported",
            )),
            ValueType::Null => self.deserialize_unit(visitor),
            ValueType::Boolean => self.deserialize_bool(visitor),
            ValueType::Number => {
                if self.value.is_unsigned() {
                    self.deserialize_u64(visitor)
                } else if self.value.is_integer() {
                    self.deserialize_i64(visitor)
                } else if self.value.is_double() {
                    self.deserialize_f64(visitor)
                } else {
                    self.deserialize_f32(visitor)
                }
            }
            ValueType::String => self.deserialize_str(visitor),
            ValueType::Data => self.deserialize_bytes(visitor),
            ValueType::Array => self.deserialize_seq(visitor),
            ValueType::Dict => self.deserialize_map(visitor),
        }
    }

    fn deserialize_bool<V>(self, visitor: V) -> Result<V::Value, Self::Error>
    where
        V: de::Visitor<'de>,
    {
        let ty = self.value.value_type();
        if ty == ValueType::Boolean {
            visitor.visit_bool(self.value.as_bool())
        } else {
            Err(Error::InvalidFormat(
                format!("Wrong data type: expect Boolean, got {ty:?}").into(),
            ))
        }
    }

    fn deserialize_i8<V>(self, visitor: V) -> Result<V::Value, Self::Error>
    where
        V: de::Visitor<'de>,
    {
        visitor.visit_i8(self.parse_signed()?)
    }

    fn deserialize_i16<V>(self, visitor: V) -> Result<V::Value, Self::Error>
    where
        V: de::Visitor<'de>,
    {
        visitor.visit_i16(self.parse_signed()?)
    }

    fn deserialize_i32<V>(self, visitor: V) -> Result<V::Value, Self::Error>
    where
        V: de::Visitor<'de>,
    {
        visitor.visit_i32(self.parse_signed()?)
    }

    fn deserialize_i64<V>(self, visitor: V) -> Result<V::Value, Self::Error>
    where
        V: de::Visitor<'de>,
    {
        visitor.visit_i64(self.parse_signed()?)
    }

    fn deserialize_u8<V>(self, visitor: V) -> Result<V::Value, Self::Error>
    where
        V: de::Visitor<'de>,
    {
        visitor.visit_u8(self.parse_unsigned()?)
    }

    fn deserialize_u16<V>(self, visitor: V) -> Result<V::Value, Self::Error>
    where
        V: de::Visitor<'de>,
    {
        visitor.visit_u16(self.parse_unsigned()?)
    }

    fn deserialize_u32<V>(self, visitor: V) -> Result<V::Value, Self::Error>
    where
        V: de::Visitor<'de>,
    {
        visitor.visit_u32(self.parse_unsigned()?)
    }

    fn deserialize_u64<V>(self, visitor: V) -> Result<V::Value, Self::Error>
    where
        V: de::Visitor<'de>,
    {
        visitor.visit_u64(self.parse_unsigned()?)
    }

    fn deserialize_f32<V>(self, visitor: V) -> Result<V::Value, Self::Error>
    where
        V: de::Visitor<'de>,
    {
        let ty = self.value.value_type();
        if ty == ValueType::Number {
            visitor.visit_f32(self.value.as_f32())
        } else {
            Err(Error::InvalidFormat(
                format!("Wrong data type: expect Number, got {ty:?}").into(),
            ))
        }
    }

    fn deserialize_f64<V>(self, visitor: V) -> Result<V::Value, Self::Error>
    where
        V: de::Visitor<'de>,
    {
        let ty = self.value.value_type();
        if ty == ValueType::Number {
            visitor.visit_f64(self.value.as_f64())
        } else {
            Err(Error::InvalidFormat(
                format!("Wrong data type: expect Number, got {ty:?}").into(),
            ))
        }
    }

    fn deserialize_char<V>(self, visitor: V) -> Result<V::Value, Self::Error>
    where
        V: de::Visitor<'de>,
    {
        let s = self.parse_str()?;
        let mut it = s.chars();
        let ch = it.next();
        let end = it.next();
        if let (Some(ch), None) = (ch, end) {
            visitor.visit_char(ch)
        } else {
            Err(Error::InvalidFormat(
                format!("string({s}) should contain exactly one char").into(),
            ))
        }
    }

    fn deserialize_str<V>(self, visitor: V) -> Result<V::Value, Self::Error>
    where
        V: de::Visitor<'de>,
    {
        visitor.visit_borrowed_str(self.parse_str()?)
    }

    fn deserialize_string<V>(self, visitor: V) -> Result<V::Value, Self::Error>
    where
        V: de::Visitor<'de>,
    {
        self.deserialize_str(visitor)
    }

    fn deserialize_bytes<V>(self, visitor: V) -> Result<V::Value, Self::Error>
    where
        V: de::Visitor<'de>,
    {
        match self.value.as_data() {
            Some(data) => visitor.visit_borrowed_bytes(data),
            None => Err(Error::InvalidFormat(
                format!("Wrong data type: expect Data, got {:?}", self.value.value_type())
                    .into(),
            )),
        }
    }

    fn deserialize_byte_buf<V>(self, visitor: V) -> Result<V::Value, Self::Error>
    where
        V: de::Visitor<'de>,
    {
        self.deserialize_bytes(visitor)
    }

    fn deserialize_option<V>(self, visitor: V) -> Result<V::Value, Self::Error>
    where
        V: de::Visitor<'de>,
    {
        if !self.value.is_null() {
            visitor.visit_some(self)
        } else {
            visitor.visit_none()
        }
    }

    fn deserialize_unit<V>(self, visitor: V) -> Result<V::Value, Self::Error>
    where
        V: de::Visitor<'de>,
    {
        if self.value.is_null() {
            visitor.visit_unit()
        } else {
            Err(Error::InvalidFormat(
                "Expect null in the place of unit".into(),
            ))
        }
    }

    fn deserialize_unit_struct<V>(
        self,
        _name: &'static str,
        visitor: V,
    ) -> Result<V::Value, Self::Error>
    where
        V: de::Visitor<'de>,
    {
        self.deserialize_unit(visitor)
    }

    fn deserialize_newtype_struct<V>(
        self,
        _name: &'static str,
        visitor: V,
    ) -> Result<V::Value, Self::Error>
    where
        V: de::Visitor<'de>,
    {
        visitor.visit_newtype_struct(self)
    }

    fn deserialize_seq<V>(self, visitor: V) -> Result<V::Value, Self::Error>
    where
        V: de::Visitor<'de>,
    {
        match self.value.as_array() {
            Some(arr) => visitor.visit_seq(ArrayAccess::new(arr)),
            None => Err(Error::InvalidFormat(
                format!(
                    "Wrong data type: expect Array, got {:?}",
                    self.value.value_type()
                )
                .into(),
            )),
        }
    }

    fn deserialize_tuple<V>(self, _len: usize, visitor: V) -> Result<V::Value, Self::Error>
    where
        V: de::Visitor<'de>,
    {
        self.deserialize_seq(visitor)
    }

    fn deserialize_tuple_struct<V>(
        self,
        _name: &'static str,
        _len: usize,
        visitor: V,
    ) -> Result<V::Value, Self::Error>
    where
        V: de::Visitor<'de>,
    {
        self.deserialize_seq(visitor)
    }

    fn deserialize_map<V>(self, visitor: V) -> Result<V::Value, Self::Error>
    where
        V: de::Visitor<'de>,
    {
        match self.value.as_dict() {
            Some(dict) => visitor.visit_map(DictAccess::new(dict)),
            None => Err(Error::InvalidFormat(
                format!(
                    "map has {:?} type, should be Dict",
                    self.value.value_type()
                )
                .into(),
            )),
        }
    }

    fn deserialize_struct<V>(
        self,
        name: &'static str,
        _fields: &'static [&'static str],
        visitor: V,
    ) -> Result<V::Value, Self::Error>
    where
        V: de::Visitor<'de>,
    {
        match self.value.as_dict() {
            Some(dict) => visitor.visit_map(DictAccess::new(dict)),
            None => Err(Error::InvalidFormat(
                format!(
                    "For struct {name} fleece data should be dict type, but got: {:?}",
                    self.value.value_type()
                )
                .into(),
            )),
        }
    }

    fn deserialize_enum<V>(
        self,
        name: &'static str,
        _variants: &'static [&'static str],
        visitor: V,
    ) -> Result<V::Value, Self::Error>
    where
        V: de::Visitor<'de>,
    {
        match self.value.value_type() {
            ValueType::String => {
                let s = self.parse_str()?;
                visitor.visit_enum(s.into_deserializer())
            }
            ValueType::Dict => match self.value.as_dict() {
                Some(dict) => visitor.visit_enum(EnumAccess::new(dict)),
                None => Err(Error::InvalidFormat(
                    format!("enum {name} has not dict type").into(),
                )),
            },
            ftype => Err(Error::InvalidFormat(
                format!("Invalid type {ftype:?} for enum {name}").into(),
            )),
        }
    }

    fn deserialize_identifier<V>(self, visitor: V) -> Result<V::Value, Self::Error>
    where
        V: de::Visitor<'de>,
    {
        self.deserialize_str(visitor)
    }

    fn deserialize_ignored_any<V>(self, visitor: V) -> Result<V::Value, Self::Error>
    where
        V: de::Visitor<'de>,
    {
        // unexpected key in dict, nothing to skip in random access layout
        visitor.visit_unit()
    }
}
