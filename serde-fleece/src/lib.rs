//! Fleece: compact binary encoding of JSON-like values.
//!
//! Data is read in place through [`Value`], [`Array`] and [`Dict`], built with
//! [`Encoder`], edited through [`MutableDict`]/[`MutableArray`] overlays and
//! converted from/to Rust types with serde.

mod de;
mod encoder;
mod error;
mod mutable;
mod ser;
mod slice;
mod value;

pub use de::{from_fl_dict, from_fl_value, from_slice};
pub use encoder::{Encoder, FlEncoderSession};
pub use error::{Error, FlError};
pub use mutable::{CopyFlags, MutableArray, MutableDict, MutableValue};
pub use ser::{to_fl_slice_result, to_fl_slice_result_with_encoder};
pub use slice::{FlSliceResult, SharedValue};
pub use value::{Array, ArrayIter, Dict, DictIter, Trust, Value, ValueType};
