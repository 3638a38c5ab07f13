//! Error types for tidewire operations.
//!
//! Every failure surfaces as one [`Error`]. Callers that need to decide
//! whether a physical connection survived the failure ask
//! [`Error::is_fatal`]; callers that only need a coarse category use
//! [`Error::kind`].

use std::fmt;

/// The primary error type for all driver operations.
#[derive(Debug)]
pub enum Error {
    /// Connection-related errors (connect, authentication, disconnect)
    Connection(ConnectionError),
    /// Server-reported statement failure
    Query(QueryError),
    /// Type conversion errors
    Type(TypeError),
    /// Protocol errors (malformed bytes, unexpected packets)
    Protocol(ProtocolError),
    /// Pool errors
    Pool(PoolError),
    /// Configuration errors
    Config(ConfigError),
    /// Unknown character encoding or collation name
    UnsupportedEncoding(String),
    /// A streaming result set still owns the connection
    StreamingConflict,
    /// Outbound payload exceeds the server's packet limit
    PacketTooBig { size: usize, max: usize },
    /// The logical handle was closed or superseded
    LogicalHandleInvalid(String),
    /// A sub-range lies outside the bounds of its source
    IndexBounds(BoundsError),
    /// Invalid argument supplied by the caller
    InvalidArgument(String),
    /// LOB locator used after its result set was closed
    StaleLocator,
    /// I/O errors
    Io(std::io::Error),
    /// Operation timed out
    Timeout,
    /// Serialization/deserialization errors
    Serde(String),
    /// Custom error with message
    Custom(String),
}

/// Coarse, stable classification of an [`Error`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorKind {
    Connection,
    Query,
    Type,
    Protocol,
    Pool,
    Config,
    UnsupportedEncoding,
    StreamingConflict,
    PacketTooBig,
    LogicalHandleInvalid,
    IndexBounds,
    InvalidArgument,
    StaleLocator,
    Io,
    Timeout,
    Other,
}

#[derive(Debug)]
pub struct ConnectionError {
    pub kind: ConnectionErrorKind,
    pub message: String,
    pub source: Option<Box<dyn std::error::Error + Send + Sync>>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionErrorKind {
    /// Failed to establish connection
    Connect,
    /// Authentication failed
    Authentication,
    /// Connection lost during operation
    Disconnected,
    /// DNS resolution failed
    DnsResolution,
    /// Connection refused
    Refused,
    /// Connection pool exhausted
    PoolExhausted,
}

#[derive(Debug)]
pub struct QueryError {
    pub kind: QueryErrorKind,
    pub sql: Option<String>,
    pub sqlstate: Option<String>,
    /// Vendor error code from the ERR packet
    pub code: Option<u16>,
    pub message: String,
    pub source: Option<Box<dyn std::error::Error + Send + Sync>>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum QueryErrorKind {
    /// Syntax error in SQL
    Syntax,
    /// Constraint violation (unique, foreign key, etc.)
    Constraint,
    /// Table or column not found
    NotFound,
    /// Permission denied
    Permission,
    /// Data too large for column
    DataTruncation,
    /// Deadlock detected
    Deadlock,
    /// Statement timeout
    Timeout,
    /// Other database error
    Database,
}

#[derive(Debug)]
pub struct TypeError {
    pub expected: &'static str,
    pub actual: String,
    pub column: Option<String>,
}

#[derive(Debug)]
pub struct ProtocolError {
    pub message: String,
    pub raw_data: Option<Vec<u8>>,
    pub source: Option<Box<dyn std::error::Error + Send + Sync>>,
}

#[derive(Debug)]
pub struct PoolError {
    pub kind: PoolErrorKind,
    pub message: String,
    pub source: Option<Box<dyn std::error::Error + Send + Sync>>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PoolErrorKind {
    /// Pool exhausted (no available connections)
    Exhausted,
    /// Connection checkout timeout
    Timeout,
    /// Pool is closed
    Closed,
    /// Configuration error
    Config,
}

#[derive(Debug)]
pub struct ConfigError {
    pub message: String,
    pub source: Option<Box<dyn std::error::Error + Send + Sync>>,
}

/// A requested range `[offset, offset + len)` that does not fit in a
/// source of `available` elements.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BoundsError {
    pub offset: usize,
    pub len: usize,
    pub available: usize,
}

impl BoundsError {
    /// Check that `[offset, offset + len)` fits in `available`.
    pub fn check(offset: usize, len: usize, available: usize) -> Result<()> {
        match offset.checked_add(len) {
            Some(end) if end <= available => Ok(()),
            _ => Err(Error::IndexBounds(BoundsError {
                offset,
                len,
                available,
            })),
        }
    }
}

impl Error {
    /// Stable category of this error.
    pub fn kind(&self) -> ErrorKind {
        match self {
            Error::Connection(_) => ErrorKind::Connection,
            Error::Query(_) => ErrorKind::Query,
            Error::Type(_) => ErrorKind::Type,
            Error::Protocol(_) => ErrorKind::Protocol,
            Error::Pool(_) => ErrorKind::Pool,
            Error::Config(_) => ErrorKind::Config,
            Error::UnsupportedEncoding(_) => ErrorKind::UnsupportedEncoding,
            Error::StreamingConflict => ErrorKind::StreamingConflict,
            Error::PacketTooBig { .. } => ErrorKind::PacketTooBig,
            Error::LogicalHandleInvalid(_) => ErrorKind::LogicalHandleInvalid,
            Error::IndexBounds(_) => ErrorKind::IndexBounds,
            Error::InvalidArgument(_) => ErrorKind::InvalidArgument,
            Error::StaleLocator => ErrorKind::StaleLocator,
            Error::Io(_) => ErrorKind::Io,
            Error::Timeout => ErrorKind::Timeout,
            Error::Serde(_) | Error::Custom(_) => ErrorKind::Other,
        }
    }

    /// Does this error leave the physical connection unusable?
    ///
    /// Fatal errors are transport or framing failures. Statement-level
    /// failures (server ERR packets, oversized payloads, bad arguments)
    /// leave the connection in a usable state.
    pub fn is_fatal(&self) -> bool {
        match self {
            Error::Protocol(_) | Error::Io(_) => true,
            Error::Connection(c) => !matches!(c.kind, ConnectionErrorKind::PoolExhausted),
            _ => false,
        }
    }

    /// Is this a retryable error (deadlock, pool exhausted, timeouts)?
    pub fn is_retryable(&self) -> bool {
        match self {
            Error::Query(q) => matches!(q.kind, QueryErrorKind::Deadlock | QueryErrorKind::Timeout),
            Error::Pool(p) => matches!(p.kind, PoolErrorKind::Exhausted | PoolErrorKind::Timeout),
            Error::Connection(c) => matches!(c.kind, ConnectionErrorKind::PoolExhausted),
            Error::Timeout | Error::StreamingConflict => true,
            _ => false,
        }
    }

    /// Is this a connection error that likely requires reconnection?
    pub fn is_connection_error(&self) -> bool {
        match self {
            Error::Connection(c) => !matches!(c.kind, ConnectionErrorKind::PoolExhausted),
            Error::Protocol(_) | Error::Io(_) => true,
            _ => false,
        }
    }

    /// Get SQLSTATE if available (e.g., "23000" for a duplicate key)
    pub fn sqlstate(&self) -> Option<&str> {
        match self {
            Error::Query(q) => q.sqlstate.as_deref(),
            _ => None,
        }
    }

    /// Get the SQL that caused this error, if available
    pub fn sql(&self) -> Option<&str> {
        match self {
            Error::Query(q) => q.sql.as_deref(),
            _ => None,
        }
    }

    /// Shorthand for an [`Error::Protocol`] without raw data.
    pub fn protocol(message: impl Into<String>) -> Self {
        Error::Protocol(ProtocolError {
            message: message.into(),
            raw_data: None,
            source: None,
        })
    }

    /// Shorthand for an [`Error::Config`].
    pub fn config(message: impl Into<String>) -> Self {
        Error::Config(ConfigError {
            message: message.into(),
            source: None,
        })
    }

    /// Shorthand for a connection error of the given kind.
    pub fn connection(kind: ConnectionErrorKind, message: impl Into<String>) -> Self {
        Error::Connection(ConnectionError {
            kind,
            message: message.into(),
            source: None,
        })
    }
}

impl QueryError {
    /// Is this a duplicate key violation?
    pub fn is_duplicate_key(&self) -> bool {
        self.code == Some(1062)
    }

    /// Is this a foreign key violation?
    pub fn is_foreign_key_violation(&self) -> bool {
        matches!(self.code, Some(1451 | 1452))
    }
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Error::Connection(e) => write!(f, "Connection error: {}", e.message),
            Error::Query(e) => {
                if let Some(sqlstate) = &e.sqlstate {
                    write!(f, "Query error (SQLSTATE {}): {}", sqlstate, e.message)
                } else {
                    write!(f, "Query error: {}", e.message)
                }
            }
            Error::Type(e) => {
                if let Some(col) = &e.column {
                    write!(
                        f,
                        "Type error in column '{}': expected {}, found {}",
                        col, e.expected, e.actual
                    )
                } else {
                    write!(f, "Type error: expected {}, found {}", e.expected, e.actual)
                }
            }
            Error::Protocol(e) => write!(f, "Protocol error: {}", e.message),
            Error::Pool(e) => write!(f, "Pool error: {}", e.message),
            Error::Config(e) => write!(f, "Configuration error: {}", e.message),
            Error::UnsupportedEncoding(name) => {
                write!(f, "Unsupported character encoding or collation: {}", name)
            }
            Error::StreamingConflict => write!(
                f,
                "Streaming result set is still active; consume or close it before issuing another command"
            ),
            Error::PacketTooBig { size, max } => write!(
                f,
                "Packet of {} bytes exceeds max_allowed_packet ({} bytes)",
                size, max
            ),
            Error::LogicalHandleInvalid(msg) => write!(f, "Logical connection invalid: {}", msg),
            Error::IndexBounds(e) => write!(f, "Index out of bounds: {}", e),
            Error::InvalidArgument(msg) => write!(f, "Invalid argument: {}", msg),
            Error::StaleLocator => write!(f, "LOB locator is no longer valid"),
            Error::Io(e) => write!(f, "I/O error: {}", e),
            Error::Timeout => write!(f, "Operation timed out"),
            Error::Serde(msg) => write!(f, "Serialization error: {}", msg),
            Error::Custom(msg) => write!(f, "{}", msg),
        }
    }
}

impl std::error::Error for Error {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Error::Connection(e) => e
                .source
                .as_deref()
                .map(|err| err as &(dyn std::error::Error + 'static)),
            Error::Query(e) => e
                .source
                .as_deref()
                .map(|err| err as &(dyn std::error::Error + 'static)),
            Error::Protocol(e) => e
                .source
                .as_deref()
                .map(|err| err as &(dyn std::error::Error + 'static)),
            Error::Pool(e) => e
                .source
                .as_deref()
                .map(|err| err as &(dyn std::error::Error + 'static)),
            Error::Config(e) => e
                .source
                .as_deref()
                .map(|err| err as &(dyn std::error::Error + 'static)),
            Error::IndexBounds(e) => Some(e),
            Error::Io(e) => Some(e),
            _ => None,
        }
    }
}

impl fmt::Display for ConnectionError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.message)
    }
}

impl fmt::Display for QueryError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if let Some(sqlstate) = &self.sqlstate {
            write!(f, "{} (SQLSTATE {})", self.message, sqlstate)
        } else {
            write!(f, "{}", self.message)
        }
    }
}

impl fmt::Display for TypeError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if let Some(col) = &self.column {
            write!(
                f,
                "expected {} for column '{}', found {}",
                self.expected, col, self.actual
            )
        } else {
            write!(f, "expected {}, found {}", self.expected, self.actual)
        }
    }
}

impl fmt::Display for ProtocolError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.message)
    }
}

impl fmt::Display for PoolError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.message)
    }
}

impl fmt::Display for ConfigError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.message)
    }
}

impl fmt::Display for BoundsError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "range [{}, {}) exceeds length {}",
            self.offset,
            self.offset.saturating_add(self.len),
            self.available
        )
    }
}

impl std::error::Error for BoundsError {}

impl From<std::io::Error> for Error {
    fn from(err: std::io::Error) -> Self {
        Error::Io(err)
    }
}

impl From<ConnectionError> for Error {
    fn from(err: ConnectionError) -> Self {
        Error::Connection(err)
    }
}

impl From<QueryError> for Error {
    fn from(err: QueryError) -> Self {
        Error::Query(err)
    }
}

impl From<TypeError> for Error {
    fn from(err: TypeError) -> Self {
        Error::Type(err)
    }
}

impl From<ProtocolError> for Error {
    fn from(err: ProtocolError) -> Self {
        Error::Protocol(err)
    }
}

impl From<PoolError> for Error {
    fn from(err: PoolError) -> Self {
        Error::Pool(err)
    }
}

impl From<ConfigError> for Error {
    fn from(err: ConfigError) -> Self {
        Error::Config(err)
    }
}

impl From<serde_json::Error> for Error {
    fn from(err: serde_json::Error) -> Self {
        Error::Serde(err.to_string())
    }
}

/// Result type alias for driver operations.
pub type Result<T> = std::result::Result<T, Error>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sqlstate_helpers() {
        let query = QueryError {
            kind: QueryErrorKind::Constraint,
            sql: Some("INSERT INTO t VALUES (1)".to_string()),
            sqlstate: Some("23000".to_string()),
            code: Some(1062),
            message: "Duplicate entry '1' for key 'PRIMARY'".to_string(),
            source: None,
        };

        assert!(query.is_duplicate_key());
        assert!(!query.is_foreign_key_violation());

        let err = Error::Query(query);
        assert_eq!(err.sqlstate(), Some("23000"));
        assert_eq!(err.sql(), Some("INSERT INTO t VALUES (1)"));
        assert_eq!(err.kind(), ErrorKind::Query);
        assert!(!err.is_fatal());
    }

    #[test]
    fn fatal_classification() {
        assert!(Error::protocol("bad header").is_fatal());
        assert!(Error::Io(std::io::Error::other("reset")).is_fatal());
        assert!(
            Error::connection(ConnectionErrorKind::Disconnected, "lost connection").is_fatal()
        );

        assert!(!Error::PacketTooBig { size: 10, max: 5 }.is_fatal());
        assert!(!Error::StreamingConflict.is_fatal());
        assert!(!Error::InvalidArgument("start".into()).is_fatal());
        assert!(!Error::StaleLocator.is_fatal());
        assert!(!Error::LogicalHandleInvalid("closed".into()).is_fatal());
    }

    #[test]
    fn retryable_and_connection_flags() {
        let pool_exhausted = Error::Pool(PoolError {
            kind: PoolErrorKind::Exhausted,
            message: "pool exhausted".to_string(),
            source: None,
        });
        assert!(pool_exhausted.is_retryable());
        assert!(Error::StreamingConflict.is_retryable());

        let conn_error = Error::connection(ConnectionErrorKind::Disconnected, "lost");
        assert!(conn_error.is_connection_error());
        assert!(!Error::UnsupportedEncoding("klingon".into()).is_connection_error());
    }

    #[test]
    fn bounds_check() {
        assert!(BoundsError::check(0, 5, 5).is_ok());
        assert!(BoundsError::check(5, 0, 5).is_ok());

        let err = BoundsError::check(3, 4, 5).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::IndexBounds);
        assert!(std::error::Error::source(&err).is_some());
        assert_eq!(err.to_string(), "Index out of bounds: range [3, 7) exceeds length 5");

        assert!(BoundsError::check(usize::MAX, 2, 5).is_err());
    }
}
