use crate::{ser::Serializer, Error};
use serde::{
    ser::{self, Impossible},
    Serialize,
};

/// Dict under construction: keys go through [`KeyWriter`], values
/// through the ordinary serializer
pub(crate) struct MapKeySerializer<'a, 'e> {
    pub(crate) ser: &'a mut Serializer<'e>,
}

impl<'a, 'e> ser::SerializeMap for MapKeySerializer<'a, 'e> {
    type Ok = ();
    type Error = Error;

    fn serialize_key<T>(&mut self, key: &T) -> Result<(), Self::Error>
    where
        T: ?Sized + Serialize,
    {
        key.serialize(KeyWriter { ser: self.ser })
    }

    fn serialize_value<T>(&mut self, value: &T) -> Result<(), Self::Error>
    where
        T: ?Sized + Serialize,
    {
        value.serialize(&mut *self.ser)
    }

    fn end(self) -> Result<(), Self::Error> {
        encoder_write!(self.ser, end_dict)
    }
}

/// Fleece dict keys are strings, numbers and bools are written
/// in their textual form, anything else is rejected
struct KeyWriter<'a, 'e> {
    ser: &'a mut Serializer<'e>,
}

impl KeyWriter<'_, '_> {
    fn key(self, key: &str) -> Result<(), Error> {
        encoder_write!(self.ser, write_key, key)
    }
}

macro_rules! integer_key {
    ($($method:ident: $t:ty),*) => {
        $(
            fn $method(self, v: $t) -> Result<(), Error> {
                self.key(itoa::Buffer::new().format(v))
            }
        )*
    };
}

macro_rules! float_key {
    ($($method:ident: $t:ty),*) => {
        $(
            fn $method(self, v: $t) -> Result<(), Error> {
                self.key(ryu::Buffer::new().format(v))
            }
        )*
    };
}

fn not_string(what: &'static str) -> Error {
    Error::Unsupported(what)
}

impl<'a, 'e> ser::Serializer for KeyWriter<'a, 'e> {
    type Ok = ();
    type Error = Error;
    type SerializeSeq = Impossible<(), Error>;
    type SerializeTuple = Impossible<(), Error>;
    type SerializeTupleStruct = Impossible<(), Error>;
    type SerializeTupleVariant = Impossible<(), Error>;
    type SerializeMap = Impossible<(), Error>;
    type SerializeStruct = Impossible<(), Error>;
    type SerializeStructVariant = Impossible<(), Error>;

    integer_key!(
        serialize_i8: i8,
        serialize_i16: i16,
        serialize_i32: i32,
        serialize_i64: i64,
        serialize_u8: u8,
        serialize_u16: u16,
        serialize_u32: u32,
        serialize_u64: u64
    );
    float_key!(serialize_f32: f32, serialize_f64: f64);

    fn serialize_bool(self, v: bool) -> Result<(), Error> {
        self.key(if v { "true" } else { "false" })
    }

    fn serialize_char(self, v: char) -> Result<(), Error> {
        self.key(v.encode_utf8(&mut [0u8; 4]))
    }

    fn serialize_str(self, v: &str) -> Result<(), Error> {
        self.key(v)
    }

    fn serialize_unit_variant(
        self,
        _name: &'static str,
        _variant_index: u32,
        variant: &'static str,
    ) -> Result<(), Error> {
        self.key(variant)
    }

    fn serialize_newtype_struct<T>(self, _name: &'static str, value: &T) -> Result<(), Error>
    where
        T: ?Sized + Serialize,
    {
        value.serialize(self)
    }

    fn serialize_bytes(self, _v: &[u8]) -> Result<(), Error> {
        Err(not_string("dict key can not be bytes"))
    }

    fn serialize_none(self) -> Result<(), Error> {
        Err(not_string("dict key can not be null"))
    }

    fn serialize_some<T>(self, value: &T) -> Result<(), Error>
    where
        T: ?Sized + Serialize,
    {
        value.serialize(self)
    }

    fn serialize_unit(self) -> Result<(), Error> {
        Err(not_string("dict key can not be null"))
    }

    fn serialize_unit_struct(self, _name: &'static str) -> Result<(), Error> {
        Err(not_string("dict key can not be null"))
    }

    fn serialize_newtype_variant<T>(
        self,
        _name: &'static str,
        _variant_index: u32,
        _variant: &'static str,
        _value: &T,
    ) -> Result<(), Error>
    where
        T: ?Sized + Serialize,
    {
        Err(not_string("dict key can not be enum with data"))
    }

    fn serialize_seq(self, _len: Option<usize>) -> Result<Self::SerializeSeq, Error> {
        Err(not_string("dict key can not be array"))
    }

    fn serialize_tuple(self, _len: usize) -> Result<Self::SerializeTuple, Error> {
        Err(not_string("dict key can not be array"))
    }

    fn serialize_tuple_struct(
        self,
        _name: &'static str,
        _len: usize,
    ) -> Result<Self::SerializeTupleStruct, Error> {
        Err(not_string("dict key can not be array"))
    }

    fn serialize_tuple_variant(
        self,
        _name: &'static str,
        _variant_index: u32,
        _variant: &'static str,
        _len: usize,
    ) -> Result<Self::SerializeTupleVariant, Error> {
        Err(not_string("dict key can not be enum with data"))
    }

    fn serialize_map(self, _len: Option<usize>) -> Result<Self::SerializeMap, Error> {
        Err(not_string("dict key can not be dict"))
    }

    fn serialize_struct(
        self,
        _name: &'static str,
        _len: usize,
    ) -> Result<Self::SerializeStruct, Error> {
        Err(not_string("dict key can not be dict"))
    }

    fn serialize_struct_variant(
        self,
        _name: &'static str,
        _variant_index: u32,
        _variant: &'static str,
        _len: usize,
    ) -> Result<Self::SerializeStructVariant, Error> {
        Err(not_string("dict key can not be enum with data"))
    }
}

#[cfg(test)]
mod tests {
    use crate::{from_slice, to_fl_slice_result};
    use std::collections::{BTreeMap, HashMap};

    #[test]
    fn test_non_string_keys() {
        let mut m = BTreeMap::new();
        m.insert(17u32, "a");
        m.insert(5u32, "b");
        let data = to_fl_slice_result(&m).unwrap();
        let back: HashMap<String, String> = from_slice(data.as_bytes()).unwrap();
        assert_eq!(Some("a"), back.get("17").map(String::as_str));
        assert_eq!(Some("b"), back.get("5").map(String::as_str));

        let mut m = HashMap::new();
        m.insert(true, 1);
        let data = to_fl_slice_result(&m).unwrap();
        let back: HashMap<String, i32> = from_slice(data.as_bytes()).unwrap();
        assert_eq!(Some(&1), back.get("true"));
    }

    #[test]
    fn test_reject_compound_key() {
        let mut m = BTreeMap::new();
        m.insert(vec![1, 2], 3);
        assert!(to_fl_slice_result(&m).is_err());
    }
}
