use crate::value::{Dict, Trust, Value};
use std::{fmt, ops::Range, sync::Arc};

/// Owned, reference counted buffer with encoded fleece data.
/// Cloning is cheap, the buffer is freed with the last clone.
#[derive(Clone, Default)]
pub struct FlSliceResult(Option<Arc<[u8]>>);

impl FlSliceResult {
    #[inline]
    pub fn as_bytes(&self) -> &[u8] {
        self.0.as_deref().unwrap_or_default()
    }
    #[inline]
    pub fn is_empty(&self) -> bool {
        self.as_bytes().is_empty()
    }
    #[inline]
    pub fn len(&self) -> usize {
        self.as_bytes().len()
    }
    /// Validate untrusted bytes and take ownership of them
    pub fn from_untrusted(data: Vec<u8>) -> Option<Self> {
        Value::from_data(&data, Trust::Untrusted)?;
        Some(Self::from(data))
    }
    /// Root value, the buffer content was validated or produced by `Encoder`
    #[inline]
    pub fn value(&self) -> Value<'_> {
        Value::from_data(self.as_bytes(), Trust::Trusted).unwrap_or(Value::UNDEFINED)
    }
    #[inline]
    pub fn root_dict(&self) -> Option<Dict<'_>> {
        self.value().as_dict()
    }
    /// Owned handle to `value`, it must point inside this buffer
    pub fn share(&self, value: Value<'_>) -> Option<SharedValue> {
        let base = self.as_bytes().as_ptr() as usize;
        let bytes = value.as_bytes();
        let start = (bytes.as_ptr() as usize).checked_sub(base)?;
        let end = start.checked_add(bytes.len())?;
        if bytes.is_empty() || end > self.len() {
            return None;
        }
        Some(SharedValue {
            buf: self.clone(),
            range: start..end,
        })
    }
    /// Owned handle to the root value
    pub fn shared_root(&self) -> SharedValue {
        SharedValue {
            buf: self.clone(),
            range: 0..self.len(),
        }
    }
}

impl From<Vec<u8>> for FlSliceResult {
    fn from(v: Vec<u8>) -> Self {
        if v.is_empty() {
            Self(None)
        } else {
            Self(Some(v.into()))
        }
    }
}

impl PartialEq for FlSliceResult {
    fn eq(&self, other: &Self) -> bool {
        self.as_bytes() == other.as_bytes()
    }
}

impl fmt::Debug for FlSliceResult {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "FlSliceResult({:?})", self.value())
    }
}

/// Value that keeps its buffer alive
#[derive(Clone)]
pub struct SharedValue {
    buf: FlSliceResult,
    range: Range<usize>,
}

impl SharedValue {
    #[inline]
    pub fn value(&self) -> Value<'_> {
        self.buf
            .as_bytes()
            .get(self.range.clone())
            .and_then(|data| Value::from_data(data, Trust::Trusted))
            .unwrap_or(Value::UNDEFINED)
    }
    /// Handle to a child of this value
    pub fn share(&self, child: Value<'_>) -> Option<SharedValue> {
        self.buf.share(child)
    }
    #[inline]
    pub fn buffer(&self) -> &FlSliceResult {
        &self.buf
    }
}

impl fmt::Debug for SharedValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.value().fmt(f)
    }
}

impl PartialEq for SharedValue {
    fn eq(&self, other: &Self) -> bool {
        self.value() == other.value()
    }
}
