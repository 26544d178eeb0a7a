use std::{fmt, io};

/// Area an error code belongs to
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorDomain {
    /// Errors of the database engine itself, codes are `CblErrorCode`
    CouchbaseLite = 1,
    /// Operating system errors, code is `errno`
    Posix = 2,
    /// Errors of the value encoding, codes are `serde_fleece::FlError`
    Fleece = 4,
    /// Network level errors, codes are `NetworkErrorCode`
    Network = 5,
    /// Errors reported by the peer, codes are HTTP status or WebSocket close codes
    WebSocket = 6,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(i32)]
pub enum CblErrorCode {
    AssertionFailed = 1,
    Unimplemented = 2,
    UnsupportedEncryption = 3,
    BadRevisionId = 4,
    CorruptRevisionData = 5,
    NotOpen = 6,
    NotFound = 7,
    Conflict = 8,
    InvalidParameter = 9,
    UnexpectedError = 10,
    CantOpenFile = 11,
    IoError = 12,
    MemoryError = 13,
    NotWriteable = 14,
    Corrupt = 15,
    Busy = 16,
    NotInTransaction = 17,
    TransactionNotClosed = 18,
    Unsupported = 19,
    NotADatabaseFile = 20,
    WrongFormat = 21,
    Crypto = 22,
    InvalidQuery = 23,
    MissingIndex = 24,
    InvalidQueryParam = 25,
    RemoteError = 26,
    DatabaseTooOld = 27,
    DatabaseTooNew = 28,
    BadDocId = 29,
    CantUpgradeDatabase = 30,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(i32)]
pub enum NetworkErrorCode {
    DnsFailure = 1,
    UnknownHost = 2,
    Timeout = 3,
    InvalidUrl = 4,
    TooManyRedirects = 5,
    TlsHandshakeFailed = 6,
    TlsCertExpired = 7,
    TlsCertUntrusted = 8,
    TlsClientCertRequired = 9,
    TlsClientCertRejected = 10,
    TlsCertUnknownRoot = 11,
    InvalidRedirect = 12,
    Unknown = 13,
    TlsCertRevoked = 14,
    TlsCertNameMismatch = 15,
    NetworkReset = 16,
    ConnectionAborted = 17,
    ConnectionReset = 18,
    ConnectionRefused = 19,
    NetworkDown = 20,
    NetworkUnreachable = 21,
    NotConnected = 22,
    HostDown = 23,
    HostUnreachable = 24,
    AddressNotAvailable = 25,
    BrokenPipe = 26,
    UnknownInterface = 27,
}

/// Error record: domain, code and auxiliary information (for example OS errno)
#[derive(Clone, Copy, PartialEq, Eq, Hash)]
pub struct CblError {
    pub domain: ErrorDomain,
    pub code: i32,
    pub internal_info: i32,
}

impl CblError {
    #[inline]
    pub const fn new(domain: ErrorDomain, code: i32) -> Self {
        Self {
            domain,
            code,
            internal_info: 0,
        }
    }
    #[inline]
    pub const fn cbl(code: CblErrorCode) -> Self {
        Self::new(ErrorDomain::CouchbaseLite, code as i32)
    }
    #[inline]
    pub const fn network(code: NetworkErrorCode) -> Self {
        Self::new(ErrorDomain::Network, code as i32)
    }
    /// HTTP status or WebSocket close code reported by the peer
    #[inline]
    pub const fn websocket(status: i32) -> Self {
        Self::new(ErrorDomain::WebSocket, status)
    }
    #[inline]
    pub const fn posix(errno: i32) -> Self {
        Self {
            domain: ErrorDomain::Posix,
            code: errno,
            internal_info: errno,
        }
    }
    #[inline]
    pub fn is(&self, code: CblErrorCode) -> bool {
        self.domain == ErrorDomain::CouchbaseLite && self.code == code as i32
    }

    /// Human readable message for the error record
    pub fn message(&self) -> String {
        match self.domain {
            ErrorDomain::CouchbaseLite => cbl_message(self.code).into(),
            ErrorDomain::Posix => io::Error::from_raw_os_error(self.code).to_string(),
            ErrorDomain::Fleece => fleece_message(self.code).into(),
            ErrorDomain::Network => network_message(self.code).into(),
            ErrorDomain::WebSocket => websocket_message(self.code),
        }
    }

    /// Can an operation that failed with this error succeed if retried later,
    /// used by the replicator to choose between `Offline` and `Stopped`
    pub fn is_transient(&self) -> bool {
        use NetworkErrorCode::*;
        match self.domain {
            ErrorDomain::Network => [
                DnsFailure,
                Timeout,
                NetworkReset,
                ConnectionAborted,
                ConnectionReset,
                ConnectionRefused,
                NetworkDown,
                NetworkUnreachable,
                NotConnected,
                HostDown,
                HostUnreachable,
                BrokenPipe,
                Unknown,
            ]
            .iter()
            .any(|code| *code as i32 == self.code),
            ErrorDomain::WebSocket => matches!(self.code, 408 | 429 | 500..=599 | 1001 | 1006),
            ErrorDomain::Posix => matches!(
                io::Error::from_raw_os_error(self.code).kind(),
                io::ErrorKind::ConnectionRefused
                    | io::ErrorKind::ConnectionReset
                    | io::ErrorKind::ConnectionAborted
                    | io::ErrorKind::NotConnected
                    | io::ErrorKind::BrokenPipe
                    | io::ErrorKind::TimedOut
                    | io::ErrorKind::Interrupted
            ),
            ErrorDomain::CouchbaseLite => self.code == CblErrorCode::Busy as i32,
            ErrorDomain::Fleece => false,
        }
    }
}

impl fmt::Debug for CblError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "CblError {{ domain: {:?}, code: {}, internal_info: {} }}",
            self.domain, self.code, self.internal_info
        )
    }
}

impl fmt::Display for CblError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:?}/{}: {}", self.domain, self.code, self.message())
    }
}

fn cbl_message(code: i32) -> &'static str {
    const MESSAGES: [&str; 30] = [
        "assertion failed",
        "unimplemented function call",
        "unsupported encryption algorithm",
        "invalid revision ID syntax",
        "revision contains corrupted/unreadable data",
        "database not open",
        "not found",
        "conflict",
        "invalid parameter",
        "unexpected exception",
        "can't open file",
        "file I/O error",
        "memory allocation failed",
        "database is not writeable",
        "data is corrupted",
        "database busy",
        "must be called during a transaction",
        "transaction not closed",
        "unsupported operation",
        "file is not a database, or encryption key is wrong",
        "database exists but not in the format/storage requested",
        "encryption/decryption error",
        "invalid query",
        "no such index",
        "invalid query parameter name/number",
        "error on remote server",
        "database file format is too old",
        "database file format is too new",
        "invalid document ID",
        "database could not be upgraded to the current version",
    ];
    usize::try_from(code - 1)
        .ok()
        .and_then(|i| MESSAGES.get(i))
        .copied()
        .unwrap_or("unknown error")
}

fn fleece_message(code: i32) -> &'static str {
    use serde_fleece::FlError::*;
    let err = match code {
        1 => MemoryError,
        2 => OutOfRange,
        3 => InvalidData,
        4 => EncodeError,
        5 => JsonError,
        6 => UnknownValue,
        8 => NotFound,
        9 => Unsupported,
        _ => InternalError,
    };
    err.message()
}

fn network_message(code: i32) -> &'static str {
    const MESSAGES: [&str; 27] = [
        "DNS lookup failed",
        "unknown hostname",
        "connection timed out",
        "invalid URL",
        "too many HTTP redirects",
        "TLS handshake failed",
        "server TLS certificate expired",
        "server TLS certificate is untrusted",
        "TLS client certificate required",
        "TLS client certificate rejected",
        "server TLS certificate has unknown root",
        "invalid HTTP redirect",
        "unknown network error",
        "server TLS certificate was revoked",
        "server TLS certificate has wrong hostname",
        "network was reset",
        "connection was aborted",
        "connection was reset by peer",
        "connection was refused",
        "network is down",
        "network is unreachable",
        "socket is not connected",
        "host is down",
        "host is unreachable",
        "address not available",
        "broken pipe",
        "unknown network interface",
    ];
    usize::try_from(code - 1)
        .ok()
        .and_then(|i| MESSAGES.get(i))
        .copied()
        .unwrap_or("unknown network error")
}

fn websocket_message(code: i32) -> String {
    let msg = match code {
        400 => "bad request",
        401 => "unauthorized",
        403 => "forbidden",
        404 => "not found",
        409 => "conflict",
        500 => "internal server error",
        1000 => "normal close",
        1001 => "peer going away",
        1002 => "protocol error",
        1003 => "unsupported data",
        1006 => "connection closed abnormally",
        1008 => "policy violation",
        1011 => "unexpected condition on peer",
        _ => return format!("HTTP/WebSocket status {}", code),
    };
    msg.into()
}

/// Enum listing possible errors.
#[derive(Clone)]
pub enum Error {
    /// database engine, network or peer error
    Cbl(CblError),
    /// UTF-8 decoding problem
    InvalidUtf8,
    /// some invariant was broken
    LogicError(String),
    SerdeFleece(serde_fleece::Error),
    /// JSON parsing or generation failed
    Json(String),
    InvalidQuery {
        pos: i32,
        query_expr: String,
        err: String,
    },
}

impl std::error::Error for Error {}

pub(crate) type Result<T> = std::result::Result<T, Error>;

impl Error {
    /// Error record describing this error
    pub fn cbl_error(&self) -> CblError {
        match self {
            Error::Cbl(err) => *err,
            Error::InvalidUtf8 => CblError::new(ErrorDomain::Fleece, 3),
            Error::LogicError(_) => CblError::cbl(CblErrorCode::UnexpectedError),
            Error::SerdeFleece(serde_fleece::Error::Fleece(fl_err)) => {
                CblError::new(ErrorDomain::Fleece, fleece_code(*fl_err))
            }
            Error::SerdeFleece(_) => CblError::new(ErrorDomain::Fleece, 3),
            Error::Json(_) => CblError::new(ErrorDomain::Fleece, 5),
            Error::InvalidQuery { .. } => CblError::cbl(CblErrorCode::InvalidQuery),
        }
    }
    #[inline]
    pub fn is(&self, code: CblErrorCode) -> bool {
        self.cbl_error().is(code)
    }
    #[inline]
    pub(crate) fn not_found() -> Self {
        Error::Cbl(CblError::cbl(CblErrorCode::NotFound))
    }
}

fn fleece_code(err: serde_fleece::FlError) -> i32 {
    use serde_fleece::FlError::*;
    match err {
        MemoryError => 1,
        OutOfRange => 2,
        InvalidData => 3,
        EncodeError => 4,
        JsonError => 5,
        UnknownValue => 6,
        InternalError => 7,
        NotFound => 8,
        Unsupported => 9,
    }
}

impl fmt::Display for Error {
    fn fmt(&self, fmt: &mut fmt::Formatter) -> fmt::Result {
        match self {
            Error::Cbl(err) => write!(fmt, "cbl error {:?}/{}: {}", err.domain, err.code, err.message()),
            Error::InvalidUtf8 => fmt.write_str("Utf8 encoding error"),
            Error::LogicError(msg) => write!(fmt, "logic error: {}", msg),
            Error::SerdeFleece(err) => write!(fmt, "serde+fleece error: {}", err),
            Error::Json(msg) => write!(fmt, "json error: {}", msg),
            Error::InvalidQuery {
                pos,
                query_expr,
                err,
            } => write!(
                fmt,
                "Can not parse query {}, error at {}: {}",
                query_expr, pos, err
            ),
        }
    }
}

impl fmt::Debug for Error {
    fn fmt(&self, fmt: &mut fmt::Formatter) -> fmt::Result {
        match self {
            Error::Cbl(err) => write!(fmt, "{:?} / {}", err, err.message()),
            Error::InvalidUtf8 => write!(fmt, "Invalid UTF-8 error"),
            Error::LogicError(msg) => write!(fmt, "LogicError: {}", msg),
            Error::SerdeFleece(err) => write!(fmt, "SerdeFleece error: {}", err),
            Error::Json(msg) => write!(fmt, "Json error: {}", msg),
            Error::InvalidQuery {
                pos,
                query_expr,
                err,
            } => write!(
                fmt,
                "InvalidQuery {{ query_expr {}, pos {}, err {} }}",
                query_expr, pos, err
            ),
        }
    }
}

impl From<CblError> for Error {
    fn from(err: CblError) -> Self {
        Error::Cbl(err)
    }
}

impl From<CblErrorCode> for Error {
    fn from(code: CblErrorCode) -> Self {
        Error::Cbl(CblError::cbl(code))
    }
}

impl From<serde_fleece::Error> for Error {
    fn from(err: serde_fleece::Error) -> Self {
        Error::SerdeFleece(err)
    }
}

impl From<serde_json::Error> for Error {
    fn from(err: serde_json::Error) -> Self {
        Error::Json(err.to_string())
    }
}

impl From<std::str::Utf8Error> for Error {
    fn from(_: std::str::Utf8Error) -> Self {
        Error::InvalidUtf8
    }
}

impl From<io::Error> for Error {
    fn from(err: io::Error) -> Self {
        match err.raw_os_error() {
            Some(errno) => Error::Cbl(CblError::posix(errno)),
            None => {
                let code = match err.kind() {
                    io::ErrorKind::NotFound => CblErrorCode::NotFound,
                    io::ErrorKind::UnexpectedEof | io::ErrorKind::InvalidData => {
                        CblErrorCode::Corrupt
                    }
                    _ => CblErrorCode::IoError,
                };
                Error::Cbl(CblError::cbl(code))
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_messages() {
        assert_eq!(CblError::cbl(CblErrorCode::NotFound).message(), "not found");
        assert_eq!(
            CblError::network(NetworkErrorCode::ConnectionRefused).message(),
            "connection was refused"
        );
        assert_eq!(CblError::websocket(401).message(), "unauthorized");
        assert_eq!(CblError::new(ErrorDomain::CouchbaseLite, 1000).message(), "unknown error");
    }

    #[test]
    fn test_transient_classification() {
        assert!(CblError::network(NetworkErrorCode::ConnectionRefused).is_transient());
        assert!(CblError::websocket(503).is_transient());
        assert!(!CblError::websocket(401).is_transient());
        assert!(!CblError::network(NetworkErrorCode::InvalidUrl).is_transient());
        assert!(!CblError::cbl(CblErrorCode::Conflict).is_transient());
    }

    #[test]
    fn test_io_error_conversion() {
        let err: Error = io::Error::from_raw_os_error(2).into();
        let rec = err.cbl_error();
        assert_eq!(rec.domain, ErrorDomain::Posix);
        assert_eq!(rec.internal_info, 2);
        let err: Error = io::Error::new(io::ErrorKind::UnexpectedEof, "eof").into();
        assert!(err.is(CblErrorCode::Corrupt));
    }
}
