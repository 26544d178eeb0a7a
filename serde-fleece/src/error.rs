use std::{
    borrow::Cow,
    char::ParseCharError,
    fmt::{self, Display},
    num::{ParseFloatError, ParseIntError},
    str::{ParseBoolError, Utf8Error},
};

/// Error codes of the fleece codec itself
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FlError {
    MemoryError,
    OutOfRange,
    InvalidData,
    EncodeError,
    JsonError,
    UnknownValue,
    InternalError,
    NotFound,
    Unsupported,
}

impl FlError {
    pub fn message(self) -> &'static str {
        match self {
            FlError::MemoryError => "Out of memory, or allocation failed",
            FlError::OutOfRange => "Array index or iterator out of range",
            FlError::InvalidData => "Bad input data (NaN, non-string key, etc.)",
            FlError::EncodeError => "Structural error encoding (missing value, too many ends, etc.)",
            FlError::JsonError => "Error parsing JSON",
            FlError::UnknownValue => {
                "Unparseable data in a Value (corrupt? Or from some distant future?)"
            }
            FlError::InternalError => "Something that shouldn't happen",
            FlError::NotFound => "Key not found",
            FlError::Unsupported => "Operation is unsupported",
        }
    }
}

#[derive(Debug, Clone)]
pub enum Error {
    Fleece(FlError),
    Custom(String),
    Unsupported(&'static str),
    InvalidFormat(Cow<'static, str>),
}

impl From<FlError> for Error {
    fn from(v: FlError) -> Self {
        Error::Fleece(v)
    }
}

impl From<Utf8Error> for Error {
    fn from(_: Utf8Error) -> Self {
        Error::InvalidFormat("not valid utf-8".into())
    }
}

impl From<ParseBoolError> for Error {
    fn from(err: ParseBoolError) -> Self {
        Error::InvalidFormat(format!("parsing of bool failed: {}", err).into())
    }
}

impl From<ParseCharError> for Error {
    fn from(err: ParseCharError) -> Self {
        Error::InvalidFormat(format!("parsing of char failed: {}", err).into())
    }
}

impl From<ParseIntError> for Error {
    fn from(err: ParseIntError) -> Self {
        Error::InvalidFormat(format!("parsing of integer failed: {}", err).into())
    }
}

impl From<ParseFloatError> for Error {
    fn from(err: ParseFloatError) -> Self {
        Error::InvalidFormat(format!("parsing of float failed: {}", err).into())
    }
}

impl Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Error::Fleece(err) => write!(f, "Fleece error: {}", err.message()),
            Error::Custom(msg) => write!(f, "Custom error: {}", msg),
            Error::Unsupported(msg) => write!(f, "Unsupported operation: {}", msg),
            Error::InvalidFormat(msg) => write!(f, "invalid fleece data: {}", msg),
        }
    }
}

impl std::error::Error for Error {}

impl serde::ser::Error for Error {
    fn custom<T>(msg: T) -> Self
    where
        T: std::fmt::Display,
    {
        Self::Custom(msg.to_string())
    }
}

impl serde::de::Error for Error {
    fn custom<T>(msg: T) -> Self
    where
        T: Display,
    {
        Self::Custom(msg.to_string())
    }
}
