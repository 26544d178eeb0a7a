use crate::{error::Error, Result};
use serde_fleece::{Array, Dict, Value, ValueType};

#[derive(Debug, Clone, Copy)]
pub enum ValueRef<'a> {
    Null,
    Bool(bool),
    SignedInt(i64),
    UnsignedInt(u64),
    Double(f64),
    String(&'a str),
    Data(&'a [u8]),
    Array(Array<'a>),
    Dict(Dict<'a>),
}

impl<'a> ValueRef<'a> {
    pub fn as_str(&self) -> Result<&'a str> {
        FromValueRef::column_result(*self)
    }
    pub fn as_u64(&self) -> Result<u64> {
        FromValueRef::column_result(*self)
    }
    pub fn as_i64(&self) -> Result<i64> {
        FromValueRef::column_result(*self)
    }
    pub fn as_f64(&self) -> Result<f64> {
        FromValueRef::column_result(*self)
    }
    #[inline]
    pub fn is_null(&self) -> bool {
        matches!(self, ValueRef::Null)
    }
}

impl<'a> From<Value<'a>> for ValueRef<'a> {
    fn from(value: Value<'a>) -> ValueRef<'a> {
        match value.value_type() {
            ValueType::Undefined | ValueType::Null => ValueRef::Null,
            ValueType::Boolean => ValueRef::Bool(value.as_bool()),
            ValueType::Number => {
                if value.is_unsigned() {
                    ValueRef::UnsignedInt(value.as_u64())
                } else if value.is_integer() {
                    ValueRef::SignedInt(value.as_i64())
                } else {
                    ValueRef::Double(value.as_f64())
                }
            }
            ValueType::String => ValueRef::String(value.as_str().unwrap_or_default()),
            ValueType::Data => ValueRef::Data(value.as_data().unwrap_or_default()),
            ValueType::Array => value.as_array().map_or(ValueRef::Null, ValueRef::Array),
            ValueType::Dict => value.as_dict().map_or(ValueRef::Null, ValueRef::Dict),
        }
    }
}

pub trait FromValueRef<'a>: Sized {
    fn column_result(value: ValueRef<'a>) -> Result<Self>;
}

impl<'a> FromValueRef<'a> for &'a str {
    fn column_result(value: ValueRef<'a>) -> Result<Self> {
        if let ValueRef::String(x) = value {
            Ok(x)
        } else {
            Err(Error::LogicError(format!(
                "Wrong ValueRef type, expect String, got {:?}",
                value
            )))
        }
    }
}

impl<'a> FromValueRef<'a> for String {
    fn column_result(value: ValueRef<'a>) -> Result<Self> {
        <&str>::column_result(value).map(str::to_string)
    }
}

impl<'a> FromValueRef<'a> for bool {
    fn column_result(value: ValueRef<'a>) -> Result<Self> {
        match value {
            ValueRef::Bool(x) => Ok(x),
            ValueRef::SignedInt(x) => Ok(x != 0),
            ValueRef::UnsignedInt(x) => Ok(x != 0),
            _ => Err(Error::LogicError(format!(
                "Wrong ValueRef type, expect Bool got {:?}",
                value
            ))),
        }
    }
}

macro_rules! impl_from_value_ref_for_unsigned {
    ($($t:ty),+) => {$(
        impl<'a> FromValueRef<'a> for $t {
            fn column_result(value: ValueRef<'a>) -> Result<Self> {
                match value {
                    ValueRef::SignedInt(x) => <$t>::try_from(x).map_err(|_| {
                        Error::LogicError(format!(
                            "ValueRef -> {}, SignedInt too big or negative: {}",
                            stringify!($t),
                            x
                        ))
                    }),
                    ValueRef::UnsignedInt(x) => <$t>::try_from(x).map_err(|_| {
                        Error::LogicError(format!(
                            "ValueRef -> {}, UnsignedInt too big: {}",
                            stringify!($t),
                            x
                        ))
                    }),
                    _ => Err(Error::LogicError(format!(
                        "Wrong ValueRef type, expect SignedInt|UnsignedInt ({}) got {:?}",
                        stringify!($t),
                        value
                    ))),
                }
            }
        }
    )+};
}

impl_from_value_ref_for_unsigned!(u16, u32, u64);

impl<'a> FromValueRef<'a> for i64 {
    fn column_result(value: ValueRef<'a>) -> Result<Self> {
        match value {
            ValueRef::SignedInt(x) => Ok(x),
            ValueRef::UnsignedInt(x) => i64::try_from(x).map_err(|_| {
                Error::LogicError(format!("ValueRef -> i64, UnsignedInt too big: {}", x))
            }),
            _ => Err(Error::LogicError(format!(
                "Wrong ValueRef type, expect SignedInt|UnsignedInt (i64) got {:?}",
                value
            ))),
        }
    }
}

impl<'a> FromValueRef<'a> for f64 {
    fn column_result(value: ValueRef<'a>) -> Result<Self> {
        match value {
            ValueRef::SignedInt(x) => Ok(x as f64),
            ValueRef::UnsignedInt(x) => Ok(x as f64),
            ValueRef::Double(x) => Ok(x),
            _ => Err(Error::LogicError(format!(
                "Wrong ValueRef type, expect number (f64) got {:?}",
                value
            ))),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_fleece::Encoder;

    #[test]
    fn test_value_ref_conversion() {
        let mut enc = Encoder::new();
        enc.begin_array(4).unwrap();
        enc.write_i64(-1).unwrap();
        enc.write_i64(70_000).unwrap();
        enc.write_string("abc").unwrap();
        enc.write_f64(0.5).unwrap();
        enc.end_array().unwrap();
        let data = enc.finish().unwrap();
        let arr = data.value().as_array().unwrap();
        let v: Vec<ValueRef> = arr.iter().map(ValueRef::from).collect();

        assert!(v[0].as_u64().is_err());
        assert_eq!(v[0].as_i64().unwrap(), -1);
        assert!(u16::column_result(v[1]).is_err());
        assert_eq!(u32::column_result(v[1]).unwrap(), 70_000);
        assert_eq!(v[2].as_str().unwrap(), "abc");
        assert!(v[2].as_u64().is_err());
        assert_eq!(v[3].as_f64().unwrap(), 0.5);
    }
}
