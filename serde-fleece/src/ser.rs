macro_rules! encoder_write {
    ($this:expr, $func:ident $(, $arg:expr)*) => {
        $this.inner.$func($($arg),*)
    };
}

mod macros;
mod map;

use self::map::MapKeySerializer;
use crate::{encoder::Encoder, error::Error, slice::FlSliceResult};
use serde::{ser, Serialize};
use std::{borrow::BorrowMut, fmt::Display};

pub(crate) struct Serializer<'e> {
    inner: &'e mut Encoder,
}

pub fn to_fl_slice_result<T>(value: &T) -> Result<FlSliceResult, Error>
where
    T: Serialize + ?Sized,
{
    let mut enc = Encoder::new();
    to_fl_slice_result_with_encoder(value, &mut enc)
}

pub fn to_fl_slice_result_with_encoder<T, FleeceEncoder>(
    value: &T,
    mut encoder: FleeceEncoder,
) -> Result<FlSliceResult, Error>
where
    T: Serialize + ?Sized,
    FleeceEncoder: BorrowMut<Encoder>,
{
    let enc: &mut Encoder = encoder.borrow_mut();
    enc.reset();
    let mut serializer = Serializer { inner: enc };
    value.serialize(&mut serializer)?;
    serializer.inner.finish()
}

impl<'a, 'e> ser::Serializer for &'a mut Serializer<'e> {
    type Ok = ();
    type Error = Error;

    type SerializeSeq = Self;
    type SerializeTuple = Self;
    type SerializeTupleStruct = Self;
    type SerializeTupleVariant = Self;
    type SerializeMap = MapKeySerializer<'a, 'e>;
    type SerializeStruct = Self;
    type SerializeStructVariant = Self;

    #[inline]
    fn serialize_bool(self, v: bool) -> Result<Self::Ok, Self::Error> {
        encoder_write!(self, write_bool, v)
    }
    #[inline]
    fn serialize_i8(self, v: i8) -> Result<Self::Ok, Self::Error> {
        encoder_write!(self, write_i64, i64::from(v))
    }
    #[inline]
    fn serialize_i16(self, v: i16) -> Result<Self::Ok, Self::Error> {
        encoder_write!(self, write_i64, i64::from(v))
    }
    #[inline]
    fn serialize_i32(self, v: i32) -> Result<Self::Ok, Self::Error> {
        encoder_write!(self, write_i64, i64::from(v))
    }
    #[inline]
    fn serialize_i64(self, v: i64) -> Result<Self::Ok, Self::Error> {
        encoder_write!(self, write_i64, v)
    }
    #[inline]
    fn serialize_u8(self, v: u8) -> Result<Self::Ok, Self::Error> {
        encoder_write!(self, write_u64, u64::from(v))
    }
    #[inline]
    fn serialize_u16(self, v: u16) -> Result<Self::Ok, Self::Error> {
        encoder_write!(self, write_u64, u64::from(v))
    }
    #[inline]
    fn serialize_u32(self, v: u32) -> Result<Self::Ok, Self::Error> {
        encoder_write!(self, write_u64, u64::from(v))
    }
    #[inline]
    fn serialize_u64(self, v: u64) -> Result<Self::Ok, Self::Error> {
        encoder_write!(self, write_u64, v)
    }
    #[inline]
    fn serialize_f32(self, v: f32) -> Result<Self::Ok, Self::Error> {
        encoder_write!(self, write_f32, v)
    }
    #[inline]
    fn serialize_f64(self, v: f64) -> Result<Self::Ok, Self::Error> {
        encoder_write!(self, write_f64, v)
    }
    #[inline]
    fn serialize_char(self, v: char) -> Result<Self::Ok, Self::Error> {
        let mut tmp = [0u8; 4];
        let s: &str = v.encode_utf8(&mut tmp);
        encoder_write!(self, write_string, s)
    }
    #[inline]
    fn serialize_str(self, v: &str) -> Result<Self::Ok, Self::Error> {
        encoder_write!(self, write_string, v)
    }
    #[inline]
    fn serialize_bytes(self, v: &[u8]) -> Result<Self::Ok, Self::Error> {
        encoder_write!(self, write_data, v)
    }
    #[inline]
    fn serialize_none(self) -> Result<Self::Ok, Self::Error> {
        encoder_write!(self, write_null)
    }
    #[inline]
    fn serialize_some<T: ?Sized>(self, value: &T) -> Result<Self::Ok, Self::Error>
    where
        T: Serialize,
    {
        value.serialize(&mut *self)
    }
    #[inline]
    fn serialize_unit(self) -> Result<Self::Ok, Self::Error> {
        encoder_write!(self, write_null)
    }
    #[inline]
    fn serialize_unit_struct(self, _name: &'static str) -> Result<Self::Ok, Self::Error> {
        encoder_write!(self, write_null)
    }
    #[inline]
    fn serialize_unit_variant(
        self,
        _name: &'static str,
        _variant_index: u32,
        variant: &'static str,
    ) -> Result<Self::Ok, Self::Error> {
        encoder_write!(self, write_string, variant)
    }
    #[inline]
    fn serialize_newtype_struct<T: ?Sized>(
        self,
        _name: &'static str,
        value: &T,
    ) -> Result<Self::Ok, Self::Error>
    where
        T: Serialize,
    {
        value.serialize(&mut *self)
    }
    #[inline]
    fn serialize_newtype_variant<T: ?Sized>(
        self,
        _name: &'static str,
        _variant_index: u32,
        variant: &'static str,
        value: &T,
    ) -> Result<Self::Ok, Self::Error>
    where
        T: Serialize,
    {
        encoder_write!(self, begin_dict, 1)?;
        encoder_write!(self, write_key, variant)?;
        value.serialize(&mut *self)?;
        encoder_write!(self, end_dict)
    }
    #[inline]
    fn serialize_seq(self, len: Option<usize>) -> Result<Self::SerializeSeq, Self::Error> {
        encoder_write!(self, begin_array, len.unwrap_or(0))?;
        Ok(self)
    }
    #[inline]
    fn serialize_tuple(self, len: usize) -> Result<Self::SerializeTuple, Self::Error> {
        encoder_write!(self, begin_array, len)?;
        Ok(self)
    }
    #[inline]
    fn serialize_tuple_struct(
        self,
        _name: &'static str,
        len: usize,
    ) -> Result<Self::SerializeTupleStruct, Self::Error> {
        encoder_write!(self, begin_array, len)?;
        Ok(self)
    }
    #[inline]
    fn serialize_tuple_variant(
        self,
        _name: &'static str,
        _variant_index: u32,
        variant: &'static str,
        len: usize,
    ) -> Result<Self::SerializeTupleVariant, Self::Error> {
        encoder_write!(self, begin_dict, 1)?;
        encoder_write!(self, write_key, variant)?;
        encoder_write!(self, begin_array, len)?;
        Ok(self)
    }
    #[inline]
    fn serialize_map(self, len: Option<usize>) -> Result<Self::SerializeMap, Self::Error> {
        encoder_write!(self, begin_dict, len.unwrap_or(0))?;
        Ok(MapKeySerializer { ser: self })
    }
    #[inline]
    fn serialize_struct(
        self,
        _name: &'static str,
        len: usize,
    ) -> Result<Self::SerializeStruct, Self::Error> {
        encoder_write!(self, begin_dict, len)?;
        Ok(self)
    }
    #[inline]
    fn serialize_struct_variant(
        self,
        _name: &'static str,
        _variant_index: u32,
        variant: &'static str,
        len: usize,
    ) -> Result<Self::SerializeStructVariant, Self::Error> {
        encoder_write!(self, begin_dict, 1)?;
        encoder_write!(self, write_key, variant)?;
        encoder_write!(self, begin_dict, len)?;
        Ok(self)
    }
    #[inline]
    fn collect_str<T: ?Sized>(self, value: &T) -> Result<Self::Ok, Self::Error>
    where
        T: Display,
    {
        self.serialize_str(&value.to_string())
    }
}

impl<'a, 'e> ser::SerializeSeq for &'a mut Serializer<'e> {
    type Ok = ();
    type Error = Error;

    fn serialize_element<T>(&mut self, value: &T) -> Result<(), Self::Error>
    where
        T: ?Sized + Serialize,
    {
        value.serialize(&mut **self)
    }

    fn end(self) -> Result<(), Self::Error> {
        encoder_write!(self, end_array)
    }
}

impl<'a, 'e> ser::SerializeTuple for &'a mut Serializer<'e> {
    type Ok = ();
    type Error = Error;

    fn serialize_element<T>(&mut self, value: &T) -> Result<(), Self::Error>
    where
        T: ?Sized + Serialize,
    {
        value.serialize(&mut **self)
    }

    fn end(self) -> Result<(), Self::Error> {
        encoder_write!(self, end_array)
    }
}

impl<'a, 'e> ser::SerializeTupleStruct for &'a mut Serializer<'e> {
    type Ok = ();
    type Error = Error;

    fn serialize_field<T>(&mut self, value: &T) -> Result<(), Self::Error>
    where
        T: ?Sized + Serialize,
    {
        value.serialize(&mut **self)
    }

    fn end(self) -> Result<(), Self::Error> {
        encoder_write!(self, end_array)
    }
}

/// `end` closes both the array and the single-key dict of the variant
impl<'a, 'e> ser::SerializeTupleVariant for &'a mut Serializer<'e> {
    type Ok = ();
    type Error = Error;

    fn serialize_field<T>(&mut self, value: &T) -> Result<(), Self::Error>
    where
        T: ?Sized + Serialize,
    {
        value.serialize(&mut **self)
    }

    fn end(self) -> Result<(), Self::Error> {
        encoder_write!(self, end_array)?;
        encoder_write!(self, end_dict)
    }
}

impl<'a, 'e> ser::SerializeStruct for &'a mut Serializer<'e> {
    type Ok = ();
    type Error = Error;

    fn serialize_field<T>(&mut self, key: &'static str, value: &T) -> Result<(), Self::Error>
    where
        T: ?Sized + Serialize,
    {
        encoder_write!(self, write_key, key)?;
        value.serialize(&mut **self)
    }

    fn end(self) -> Result<(), Self::Error> {
        encoder_write!(self, end_dict)
    }
}

impl<'a, 'e> ser::SerializeStructVariant for &'a mut Serializer<'e> {
    type Ok = ();
    type Error = Error;

    fn serialize_field<T>(&mut self, key: &'static str, value: &T) -> Result<(), Self::Error>
    where
        T: ?Sized + Serialize,
    {
        encoder_write!(self, write_key, key)?;
        value.serialize(&mut **self)
    }

    fn end(self) -> Result<(), Self::Error> {
        encoder_write!(self, end_dict)?;
        encoder_write!(self, end_dict)
    }
}
