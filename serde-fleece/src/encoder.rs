use crate::{
    error::{Error, FlError},
    mutable::MutableValue,
    slice::FlSliceResult,
    value::{int_width, tag, Value, COLLECTION_HEADER},
};
use std::{
    borrow::{Borrow, BorrowMut},
    ops::{Deref, DerefMut},
};

struct DictEntry {
    key: String,
    start: usize,
}

enum Frame {
    Array {
        buf: Vec<u8>,
        offsets: Vec<usize>,
    },
    Dict {
        buf: Vec<u8>,
        entries: Vec<DictEntry>,
        pending_key: Option<String>,
    },
}

/// Builds one encoded value. Dict keys may be written in any order,
/// `end_dict` sorts them and the last write of a duplicated key wins.
#[derive(Default)]
pub struct Encoder {
    stack: Vec<Frame>,
    root: Vec<u8>,
    has_root: bool,
    error: Option<FlError>,
}

impl Encoder {
    pub fn new() -> Self {
        Self::default()
    }

    /// Helper for multiple uses of the same encoder
    pub fn session(&mut self) -> FlEncoderSession<'_> {
        FlEncoderSession::new(self)
    }

    pub fn reset(&mut self) {
        self.stack.clear();
        self.root.clear();
        self.has_root = false;
        self.error = None;
    }

    #[inline]
    pub fn error(&self) -> Option<FlError> {
        self.error
    }

    fn fail(&mut self, err: FlError) -> Error {
        if self.error.is_none() {
            self.error = Some(err);
        }
        Error::Fleece(err)
    }

    fn register_item(&mut self) -> Result<(), Error> {
        if let Some(err) = self.error {
            return Err(Error::Fleece(err));
        }
        match self.stack.last_mut() {
            None => {
                if self.has_root {
                    return Err(self.fail(FlError::EncodeError));
                }
                self.has_root = true;
            }
            Some(Frame::Array { buf, offsets }) => offsets.push(buf.len()),
            Some(Frame::Dict {
                buf,
                entries,
                pending_key,
            }) => match pending_key.take() {
                Some(key) => entries.push(DictEntry {
                    key,
                    start: buf.len(),
                }),
                None => return Err(self.fail(FlError::EncodeError)),
            },
        }
        Ok(())
    }

    fn out(&mut self) -> &mut Vec<u8> {
        match self.stack.last_mut() {
            None => &mut self.root,
            Some(Frame::Array { buf, .. }) | Some(Frame::Dict { buf, .. }) => buf,
        }
    }

    fn write_scalar(&mut self, bytes: &[u8]) -> Result<(), Error> {
        self.register_item()?;
        self.out().extend_from_slice(bytes);
        Ok(())
    }

    pub fn write_null(&mut self) -> Result<(), Error> {
        self.write_scalar(&[tag::NULL])
    }

    pub fn write_bool(&mut self, v: bool) -> Result<(), Error> {
        self.write_scalar(&[if v { tag::TRUE } else { tag::FALSE }])
    }

    pub fn write_i64(&mut self, v: i64) -> Result<(), Error> {
        let n = int_width(v);
        let mut tmp = [0u8; 9];
        tmp[0] = tag::INT + (n as u8 - 1);
        tmp[1..=n].copy_from_slice(&v.to_le_bytes()[..n]);
        self.write_scalar(&tmp[..=n])
    }

    pub fn write_u64(&mut self, v: u64) -> Result<(), Error> {
        match i64::try_from(v) {
            Ok(v) => self.write_i64(v),
            Err(_) => {
                let mut tmp = [0u8; 9];
                tmp[0] = tag::UINT;
                tmp[1..].copy_from_slice(&v.to_le_bytes());
                self.write_scalar(&tmp)
            }
        }
    }

    pub fn write_f32(&mut self, v: f32) -> Result<(), Error> {
        if !v.is_finite() {
            return Err(self.fail(FlError::InvalidData));
        }
        let mut tmp = [0u8; 5];
        tmp[0] = tag::FLOAT;
        tmp[1..].copy_from_slice(&v.to_le_bytes());
        self.write_scalar(&tmp)
    }

    pub fn write_f64(&mut self, v: f64) -> Result<(), Error> {
        if !v.is_finite() {
            return Err(self.fail(FlError::InvalidData));
        }
        let mut tmp = [0u8; 9];
        tmp[0] = tag::DOUBLE;
        tmp[1..].copy_from_slice(&v.to_le_bytes());
        self.write_scalar(&tmp)
    }

    fn write_blob(&mut self, t: u8, bytes: &[u8]) -> Result<(), Error> {
        let len = u32::try_from(bytes.len()).map_err(|_| self.fail(FlError::MemoryError))?;
        self.register_item()?;
        let out = self.out();
        out.push(t);
        out.extend_from_slice(&len.to_le_bytes());
        out.extend_from_slice(bytes);
        Ok(())
    }

    pub fn write_string(&mut self, v: &str) -> Result<(), Error> {
        self.write_blob(tag::STRING, v.as_bytes())
    }

    pub fn write_data(&mut self, v: &[u8]) -> Result<(), Error> {
        self.write_blob(tag::DATA, v)
    }

    /// Copy an already encoded value as is
    pub fn write_value(&mut self, v: Value<'_>) -> Result<(), Error> {
        if v.is_undefined() {
            return Err(self.fail(FlError::InvalidData));
        }
        self.write_scalar(v.as_bytes())
    }

    pub fn write_mutable(&mut self, v: &MutableValue) -> Result<(), Error> {
        match v {
            MutableValue::Null => self.write_null(),
            MutableValue::Bool(b) => self.write_bool(*b),
            MutableValue::Int(x) => self.write_i64(*x),
            MutableValue::UInt(x) => self.write_u64(*x),
            MutableValue::Float(x) => self.write_f32(*x),
            MutableValue::Double(x) => self.write_f64(*x),
            MutableValue::String(s) => self.write_string(s),
            MutableValue::Data(d) => self.write_data(d),
            MutableValue::Array(arr) => {
                self.begin_array(arr.len())?;
                for item in arr.iter() {
                    self.write_mutable(item)?;
                }
                self.end_array()
            }
            MutableValue::Dict(dict) => {
                self.begin_dict(dict.len())?;
                for (key, item) in dict.iter() {
                    self.write_key(key)?;
                    self.write_mutable(item)?;
                }
                self.end_dict()
            }
            MutableValue::Shared(shared) => self.write_value(shared.value()),
        }
    }

    pub fn begin_array(&mut self, reserve: usize) -> Result<(), Error> {
        self.register_item()?;
        self.stack.push(Frame::Array {
            buf: Vec::new(),
            offsets: Vec::with_capacity(reserve),
        });
        Ok(())
    }

    pub fn end_array(&mut self) -> Result<(), Error> {
        let (buf, offsets) = match self.stack.pop() {
            Some(Frame::Array { buf, offsets }) => (buf, offsets),
            Some(frame) => {
                self.stack.push(frame);
                return Err(self.fail(FlError::EncodeError));
            }
            None => return Err(self.fail(FlError::EncodeError)),
        };
        self.write_collection(tag::ARRAY, &offsets, &buf)
    }

    pub fn begin_dict(&mut self, reserve: usize) -> Result<(), Error> {
        self.register_item()?;
        self.stack.push(Frame::Dict {
            buf: Vec::new(),
            entries: Vec::with_capacity(reserve),
            pending_key: None,
        });
        Ok(())
    }

    pub fn write_key(&mut self, key: &str) -> Result<(), Error> {
        if let Some(Frame::Dict { pending_key, .. }) = self.stack.last_mut() {
            if pending_key.is_none() {
                *pending_key = Some(key.to_string());
                return Ok(());
            }
        }
        Err(self.fail(FlError::EncodeError))
    }

    pub fn end_dict(&mut self) -> Result<(), Error> {
        let (buf, entries) = match self.stack.pop() {
            Some(Frame::Dict {
                buf,
                entries,
                pending_key: None,
            }) => (buf, entries),
            Some(frame) => {
                self.stack.push(frame);
                return Err(self.fail(FlError::EncodeError));
            }
            None => return Err(self.fail(FlError::EncodeError)),
        };
        let mut ranged: Vec<(String, usize, usize)> = Vec::with_capacity(entries.len());
        let mut it = entries.into_iter().peekable();
        while let Some(entry) = it.next() {
            let end = it.peek().map(|next| next.start).unwrap_or(buf.len());
            ranged.push((entry.key, entry.start, end));
        }
        ranged.sort_by(|a, b| a.0.as_bytes().cmp(b.0.as_bytes()));
        let mut body = Vec::with_capacity(buf.len());
        let mut offsets = Vec::with_capacity(ranged.len());
        for (i, (key, start, end)) in ranged.iter().enumerate() {
            // stable sort keeps the last duplicate at the end of its run
            if ranged.get(i + 1).is_some_and(|next| next.0 == *key) {
                continue;
            }
            offsets.push(body.len());
            body.push(tag::STRING);
            body.extend_from_slice(&(key.len() as u32).to_le_bytes());
            body.extend_from_slice(key.as_bytes());
            body.extend_from_slice(&buf[*start..*end]);
        }
        self.write_collection(tag::DICT, &offsets, &body)
    }

    fn write_collection(&mut self, t: u8, offsets: &[usize], body: &[u8]) -> Result<(), Error> {
        let count = u32::try_from(offsets.len()).map_err(|_| self.fail(FlError::MemoryError))?;
        let body_len = u32::try_from(body.len()).map_err(|_| self.fail(FlError::MemoryError))?;
        let out = self.out();
        out.reserve(COLLECTION_HEADER + offsets.len() * 4 + body.len());
        out.push(t);
        out.extend_from_slice(&count.to_le_bytes());
        out.extend_from_slice(&body_len.to_le_bytes());
        for off in offsets {
            out.extend_from_slice(&(*off as u32).to_le_bytes());
        }
        out.extend_from_slice(body);
        Ok(())
    }

    /// Take the encoded value, the encoder is ready for the next one
    pub fn finish(&mut self) -> Result<FlSliceResult, Error> {
        let ret = if let Some(err) = self.error {
            Err(Error::Fleece(err))
        } else if !self.stack.is_empty() || !self.has_root {
            Err(Error::Fleece(FlError::EncodeError))
        } else {
            Ok(FlSliceResult::from(std::mem::take(&mut self.root)))
        };
        self.reset();
        ret
    }
}

/// Borrowed encoder that is reset when the session ends
pub struct FlEncoderSession<'a> {
    inner: &'a mut Encoder,
}

impl<'a> FlEncoderSession<'a> {
    pub fn new(inner: &'a mut Encoder) -> Self {
        inner.reset();
        Self { inner }
    }
}

impl Drop for FlEncoderSession<'_> {
    fn drop(&mut self) {
        self.inner.reset()
    }
}

impl Deref for FlEncoderSession<'_> {
    type Target = Encoder;
    fn deref(&self) -> &Encoder {
        &*self.inner
    }
}

impl DerefMut for FlEncoderSession<'_> {
    fn deref_mut(&mut self) -> &mut Encoder {
        &mut *self.inner
    }
}

impl Borrow<Encoder> for FlEncoderSession<'_> {
    fn borrow(&self) -> &Encoder {
        &*self.inner
    }
}

impl BorrowMut<Encoder> for FlEncoderSession<'_> {
    fn borrow_mut(&mut self) -> &mut Encoder {
        &mut *self.inner
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::value::Trust;

    #[test]
    fn test_structural_errors() {
        let mut enc = Encoder::new();
        assert!(enc.write_key("a").is_err());
        enc.reset();
        assert!(enc.finish().is_err());

        enc.begin_dict(0).unwrap();
        assert!(enc.write_i64(1).is_err());
        assert!(enc.finish().is_err());

        enc.begin_array(0).unwrap();
        assert!(enc.end_dict().is_err());
        enc.reset();

        enc.write_null().unwrap();
        assert!(enc.write_null().is_err());
        enc.reset();

        assert!(enc.write_f64(f64::NAN).is_err());
        assert_eq!(Some(FlError::InvalidData), enc.error());
    }

    #[test]
    fn test_dict_sorted_last_key_wins() {
        let mut enc = Encoder::new();
        enc.begin_dict(3).unwrap();
        enc.write_key("b").unwrap();
        enc.write_i64(1).unwrap();
        enc.write_key("a").unwrap();
        enc.write_string("x").unwrap();
        enc.write_key("b").unwrap();
        enc.write_i64(2).unwrap();
        enc.end_dict().unwrap();
        let data = enc.finish().unwrap();
        let v = Value::from_data(data.as_bytes(), Trust::Untrusted).unwrap();
        assert_eq!(r#"{"a":"x","b":2}"#, v.to_json());
        assert_eq!(2, v.as_dict().unwrap().get("b").unwrap().as_i64());
    }

    #[test]
    fn test_write_value_pass_through() {
        let mut enc = Encoder::new();
        enc.begin_array(2).unwrap();
        enc.write_u64(u64::MAX).unwrap();
        enc.begin_dict(1).unwrap();
        enc.write_key("k").unwrap();
        enc.write_data(b"\x00\x01").unwrap();
        enc.end_dict().unwrap();
        enc.end_array().unwrap();
        let src = enc.finish().unwrap();
        let inner = src.value().as_array().unwrap().get(1).unwrap();

        enc.write_value(inner).unwrap();
        let copy = enc.finish().unwrap();
        assert_eq!(inner.as_bytes(), copy.as_bytes());
        assert_eq!(r#"{"k":"AAE="}"#, copy.value().to_json());
        assert_eq!(
            u64::MAX,
            src.value().as_array().unwrap().get(0).unwrap().as_u64()
        );
    }
}
