use crate::{
    de::Deserializer,
    value::{Dict, DictIter, Value},
    Error,
};
use serde::de;
use std::str::FromStr;

pub(crate) struct EnumAccess<'a> {
    dict: Dict<'a>,
}

impl<'a> EnumAccess<'a> {
    pub fn new(dict: Dict<'a>) -> Self {
        Self { dict }
    }
}

impl<'de> de::EnumAccess<'de> for EnumAccess<'de> {
    type Error = Error;
    type Variant = Deserializer<'de>;

    fn variant_seed<V>(self, seed: V) -> Result<(V::Value, Self::Variant), Self::Error>
    where
        V: de::DeserializeSeed<'de>,
    {
        let n = self.dict.len();
        if n != 1 {
            return Err(Error::InvalidFormat(
                format!("enum should be dict with len 1, got {}", n).into(),
            ));
        }
        let (key, value) = self
            .dict
            .iter()
            .next()
            .ok_or_else(|| Error::InvalidFormat("not expecting empty enum dict".into()))?;
        let key = <&str as de::IntoDeserializer<'_, Error>>::into_deserializer(key);
        let key = seed.deserialize(key)?;
        Ok((key, Deserializer::new(value)))
    }
}

impl<'de> de::VariantAccess<'de> for Deserializer<'de> {
    type Error = Error;

    fn unit_variant(self) -> Result<(), Self::Error> {
        if self.value.is_null() {
            Ok(())
        } else {
            Err(Error::InvalidFormat(
                "unit variant in dict form should have null value".into(),
            ))
        }
    }

    fn newtype_variant_seed<T>(mut self, seed: T) -> Result<T::Value, Self::Error>
    where
        T: de::DeserializeSeed<'de>,
    {
        seed.deserialize(&mut self)
    }

    fn tuple_variant<V>(mut self, _len: usize, visitor: V) -> Result<V::Value, Self::Error>
    where
        V: de::Visitor<'de>,
    {
        de::Deserializer::deserialize_seq(&mut self, visitor)
    }

    fn struct_variant<V>(
        mut self,
        fields: &'static [&'static str],
        visitor: V,
    ) -> Result<V::Value, Self::Error>
    where
        V: de::Visitor<'de>,
    {
        de::Deserializer::deserialize_struct(&mut self, "enum struct variant", fields, visitor)
    }
}

pub(crate) struct DictAccess<'a> {
    it: DictIter<'a>,
    n: usize,
    value: Option<Value<'a>>,
}

impl<'a> DictAccess<'a> {
    pub fn new(dict: Dict<'a>) -> Self {
        Self {
            it: dict.iter(),
            n: dict.len(),
            value: None,
        }
    }
}

impl<'de> de::MapAccess<'de> for DictAccess<'de> {
    type Error = Error;

    fn next_key_seed<K>(&mut self, seed: K) -> Result<Option<K::Value>, Self::Error>
    where
        K: de::DeserializeSeed<'de>,
    {
        match self.it.next() {
            Some((key, value)) => {
                self.value = Some(value);
                self.n = self.n.saturating_sub(1);
                let key = de::DeserializeSeed::deserialize(seed, DictKey(key))?;
                Ok(Some(key))
            }
            None => Ok(None),
        }
    }

    fn next_value_seed<V>(&mut self, seed: V) -> Result<V::Value, Self::Error>
    where
        V: de::DeserializeSeed<'de>,
    {
        let value = self
            .value
            .take()
            .ok_or_else(|| Error::InvalidFormat("dict value requested before key".into()))?;
        de::DeserializeSeed::deserialize(seed, &mut Deserializer::new(value))
    }

    fn size_hint(&self) -> Option<usize> {
        Some(self.n)
    }
}

/// Key of fleece dict, numbers and bools are parsed from their text
struct DictKey<'de>(&'de str);

macro_rules! parse_key {
    ($($method:ident => $visit:ident: $t:ty),*) => {
        $(
            fn $method<V>(self, visitor: V) -> Result<V::Value, Self::Error>
            where
                V: de::Visitor<'de>,
            {
                visitor.$visit(<$t>::from_str(self.0)?)
            }
        )*
    };
}

impl<'de> de::Deserializer<'de> for DictKey<'de> {
    type Error = Error;

    fn deserialize_any<V>(self, visitor: V) -> Result<V::Value, Self::Error>
    where
        V: de::Visitor<'de>,
    {
        visitor.visit_borrowed_str(self.0)
    }

    parse_key!(
        deserialize_bool => visit_bool: bool,
        deserialize_i8 => visit_i8: i8,
        deserialize_i16 => visit_i16: i16,
        deserialize_i32 => visit_i32: i32,
        deserialize_i64 => visit_i64: i64,
        deserialize_u8 => visit_u8: u8,
        deserialize_u16 => visit_u16: u16,
        deserialize_u32 => visit_u32: u32,
        deserialize_u64 => visit_u64: u64,
        deserialize_f32 => visit_f32: f32,
        deserialize_f64 => visit_f64: f64,
        deserialize_char => visit_char: char
    );

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

    fn deserialize_option<V>(self, visitor: V) -> Result<V::Value, Self::Error>
    where
        V: de::Visitor<'de>,
    {
        visitor.visit_some(self)
    }

    /// Only unit variants can be keys
    fn deserialize_enum<V>(
        self,
        _name: &'static str,
        _variants: &'static [&'static str],
        visitor: V,
    ) -> Result<V::Value, Self::Error>
    where
        V: de::Visitor<'de>,
    {
        visitor.visit_enum(<&str as de::IntoDeserializer<'de, Error>>::into_deserializer(self.0))
    }

    fn deserialize_ignored_any<V>(self, visitor: V) -> Result<V::Value, Self::Error>
    where
        V: de::Visitor<'de>,
    {
        visitor.visit_unit()
    }

    serde::forward_to_deserialize_any! {
        i128 u128 str string bytes byte_buf unit unit_struct seq tuple
        tuple_struct map struct identifier
    }
}

#[cfg(test)]
mod tests {
    use crate::{from_slice, to_fl_slice_result};
    use serde::{Deserialize, Serialize};
    use std::collections::BTreeMap;

    #[derive(Serialize, Deserialize, Debug, PartialEq, Eq, PartialOrd, Ord)]
    enum Color {
        Red,
        Green,
    }

    #[test]
    fn test_typed_keys() {
        let mut m = BTreeMap::new();
        m.insert(Color::Green, 1);
        m.insert(Color::Red, 2);
        let data = to_fl_slice_result(&m).unwrap();
        let back: BTreeMap<Color, i32> = from_slice(data.as_bytes()).unwrap();
        assert_eq!(m, back);

        let mut m = BTreeMap::new();
        m.insert(-3i64, "minus");
        m.insert(40i64, "plus");
        let data = to_fl_slice_result(&m).unwrap();
        let back: BTreeMap<i64, &str> = from_slice(data.as_bytes()).unwrap();
        assert_eq!(m, back);
    }

    #[test]
    fn test_bad_numeric_key() {
        let mut m = BTreeMap::new();
        m.insert("x1", 1);
        let data = to_fl_slice_result(&m).unwrap();
        assert!(from_slice::<BTreeMap<u32, i32>>(data.as_bytes()).is_err());
    }
}
