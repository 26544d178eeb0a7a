use crate::{
    de::Deserializer,
    value::{Array, ArrayIter},
    Error,
};
use serde::de;

pub(crate) struct ArrayAccess<'a> {
    it: ArrayIter<'a>,
    n: usize,
}

impl<'a> ArrayAccess<'a> {
    pub fn new(arr: Array<'a>) -> Self {
        Self {
            it: arr.iter(),
            n: arr.len(),
        }
    }
}

impl<'de> de::SeqAccess<'de> for ArrayAccess<'de> {
    type Error = Error;

    fn next_element_seed<T>(&mut self, seed: T) -> Result<Option<T::Value>, Error>
    where
        T: de::DeserializeSeed<'de>,
    {
        match self.it.next() {
            Some(value) => {
                if value.is_undefined() {
                    return Err(Error::InvalidFormat(
                        "not expecting undefined value in array".into(),
                    ));
                }
                self.n -= 1;
                seed.deserialize(&mut Deserializer { value }).map(Some)
            }
            None => Ok(None),
        }
    }

    fn size_hint(&self) -> Option<usize> {
        Some(self.n)
    }
}
