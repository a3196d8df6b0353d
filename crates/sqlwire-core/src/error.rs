//! Error types for SQLWire operations.
//!
//! Errors are split by the layer that produced them. The split matters for
//! connection reuse: [`Error::is_fatal`] tells the pool whether the physical
//! connection behind a failed call can still be trusted.

use std::fmt;
use std::time::Duration;

/// The primary error type for all SQLWire operations.
#[derive(Debug)]
pub enum Error {
    /// Connection-related errors (connect, auth, TLS, lost connection)
    Connection(ConnectionError),
    /// Server-reported SQL errors (ERR packets)
    Query(QueryError),
    /// Type conversion errors
    Type(TypeError),
    /// Protocol errors (wire-level desync or malformed data)
    Protocol(ProtocolError),
    /// Pool errors
    Pool(PoolError),
    /// Configuration errors
    Config(ConfigError),
    /// I/O errors from the transport
    Io(std::io::Error),
    /// A read, write or connect exceeded its configured bound
    Timeout(TimeoutError),
    /// Operation was cancelled (KILL QUERY or explicit cancel)
    Cancelled(String),
    /// Custom error with message
    Custom(String),
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
    /// Connection refused
    Refused,
    /// Authentication failed
    Authentication,
    /// Connection lost during operation, or driver already broken
    Disconnected,
    /// SSL/TLS negotiation failed
    Ssl,
    /// Server requires a password change before anything else runs
    PasswordExpired,
    /// Server or request needs a feature this driver does not provide
    Unsupported,
}

#[derive(Debug)]
pub struct QueryError {
    pub kind: QueryErrorKind,
    /// MySQL error number (e.g. 1062)
    pub code: u16,
    pub sql: Option<String>,
    pub sqlstate: Option<String>,
    pub message: String,
    pub source: Option<Box<dyn std::error::Error + Send + Sync>>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum QueryErrorKind {
    /// Syntax error in SQL
    Syntax,
    /// Constraint violation (unique, foreign key, etc.)
    Constraint,
    /// Table, column or database not found
    NotFound,
    /// Permission denied
    Permission,
    /// Deadlock detected
    Deadlock,
    /// Lock wait or statement timeout
    Timeout,
    /// Query was interrupted
    Cancelled,
    /// Other database error
    Database,
}

impl QueryErrorKind {
    /// Classify a MySQL server error number.
    pub fn from_code(code: u16) -> Self {
        match code {
            1062 | 1451 | 1452 | 1216 | 1217 => Self::Constraint,
            1064 => Self::Syntax,
            1044 | 1045 | 1142 | 1143 => Self::Permission,
            1213 => Self::Deadlock,
            1205 | 3024 => Self::Timeout,
            1317 => Self::Cancelled,
            1146 | 1049 | 1054 => Self::NotFound,
            _ => Self::Database,
        }
    }
}

#[derive(Debug)]
pub struct TypeError {
    pub expected: &'static str,
    pub actual: String,
    pub column: Option<String>,
    pub rust_type: Option<&'static str>,
}

#[derive(Debug)]
pub struct ProtocolError {
    pub kind: ProtocolErrorKind,
    pub message: String,
    pub raw_data: Option<Vec<u8>>,
    pub source: Option<Box<dyn std::error::Error + Send + Sync>>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProtocolErrorKind {
    /// Sequence byte did not match the expected value
    SequenceMismatch,
    /// Stream ended before a full packet arrived
    UnexpectedEof,
    /// Packet could not be parsed
    Malformed,
    /// Packet type was not valid at this point in the exchange
    UnexpectedPacket,
    /// Outgoing payload exceeds the negotiated max packet size.
    /// Nothing was written, so the connection is still in sync.
    PacketTooLarge,
}

#[derive(Debug)]
pub struct TimeoutError {
    /// What was being waited on ("read", "write", "connect", ...)
    pub operation: &'static str,
    pub after: Option<Duration>,
    /// Set once best-effort recovery failed and the connection was dropped.
    pub escalated: bool,
}

#[derive(Debug)]
pub struct PoolError {
    pub kind: PoolErrorKind,
    pub message: String,
    pub source: Option<Box<dyn std::error::Error + Send + Sync>>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PoolErrorKind {
    /// No connection became available before the checkout timeout
    Exhausted,
    /// Pool is closed or being cleared
    Closed,
    /// Configuration error
    Config,
}

#[derive(Debug)]
pub struct ConfigError {
    pub message: String,
    pub source: Option<Box<dyn std::error::Error + Send + Sync>>,
}

impl Error {
    /// Does this error leave the physical connection unusable?
    ///
    /// Fatal errors mean the driver must be discarded instead of pooled.
    /// Server-reported SQL errors, type errors, oversized outgoing packets
    /// and refused feature requests keep the stream in sync.
    pub fn is_fatal(&self) -> bool {
        match self {
            Error::Connection(c) => !matches!(
                c.kind,
                ConnectionErrorKind::PasswordExpired | ConnectionErrorKind::Unsupported
            ),
            Error::Protocol(p) => p.kind != ProtocolErrorKind::PacketTooLarge,
            Error::Io(_) => true,
            Error::Timeout(t) => t.escalated,
            _ => false,
        }
    }

    /// Is this a timeout (recovered or escalated)?
    pub fn is_timeout(&self) -> bool {
        matches!(self, Error::Timeout(_))
    }

    /// Is this a retryable error (deadlock, lock timeout, pool exhausted, timeouts)?
    pub fn is_retryable(&self) -> bool {
        match self {
            Error::Query(q) => matches!(q.kind, QueryErrorKind::Deadlock | QueryErrorKind::Timeout),
            Error::Pool(p) => p.kind == PoolErrorKind::Exhausted,
            Error::Timeout(t) => !t.escalated,
            _ => false,
        }
    }

    /// Is this a connection error that likely requires reconnection?
    pub fn is_connection_error(&self) -> bool {
        match self {
            Error::Connection(c) => matches!(
                c.kind,
                ConnectionErrorKind::Connect
                    | ConnectionErrorKind::Refused
                    | ConnectionErrorKind::Authentication
                    | ConnectionErrorKind::Disconnected
                    | ConnectionErrorKind::Ssl
            ),
            Error::Protocol(_) | Error::Io(_) => true,
            _ => false,
        }
    }

    /// MySQL server error number, if the server reported this error.
    pub fn server_code(&self) -> Option<u16> {
        match self {
            Error::Query(q) => Some(q.code),
            _ => None,
        }
    }

    /// Get SQLSTATE if available (e.g., "23000" for duplicate key)
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

    /// Mark a timeout as unrecoverable. Other errors pass through.
    pub fn escalate(self) -> Self {
        match self {
            Error::Timeout(mut t) => {
                t.escalated = true;
                Error::Timeout(t)
            }
            other => other,
        }
    }

    pub fn connection(kind: ConnectionErrorKind, message: impl Into<String>) -> Self {
        Error::Connection(ConnectionError {
            kind,
            message: message.into(),
            source: None,
        })
    }

    pub fn protocol(kind: ProtocolErrorKind, message: impl Into<String>) -> Self {
        Error::Protocol(ProtocolError {
            kind,
            message: message.into(),
            raw_data: None,
            source: None,
        })
    }

    pub fn config(message: impl Into<String>) -> Self {
        Error::Config(ConfigError {
            message: message.into(),
            source: None,
        })
    }

    pub fn timeout(operation: &'static str, after: Option<Duration>) -> Self {
        Error::Timeout(TimeoutError {
            operation,
            after,
            escalated: false,
        })
    }
}

impl QueryError {
    /// Build from the fields of a server ERR packet.
    pub fn from_server(code: u16, sqlstate: Option<String>, message: impl Into<String>) -> Self {
        Self {
            kind: QueryErrorKind::from_code(code),
            code,
            sql: None,
            sqlstate,
            message: message.into(),
            source: None,
        }
    }

    /// Attach the statement text that produced the error.
    pub fn with_sql(mut self, sql: impl Into<String>) -> Self {
        self.sql = Some(sql.into());
        self
    }

    /// Is this a unique constraint violation?
    pub fn is_unique_violation(&self) -> bool {
        self.code == 1062
    }

    /// Is this a foreign key violation?
    pub fn is_foreign_key_violation(&self) -> bool {
        matches!(self.code, 1451 | 1452 | 1216 | 1217)
    }
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Error::Connection(e) => write!(f, "Connection error: {}", e.message),
            Error::Query(e) => {
                if let Some(sqlstate) = &e.sqlstate {
                    write!(
                        f,
                        "Query error {} (SQLSTATE {}): {}",
                        e.code, sqlstate, e.message
                    )
                } else {
                    write!(f, "Query error {}: {}", e.code, e.message)
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
            Error::Io(e) => write!(f, "I/O error: {}", e),
            Error::Timeout(t) => write!(f, "{}", t),
            Error::Cancelled(msg) => write!(f, "Operation cancelled: {}", msg),
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
            write!(f, "{} ({}, SQLSTATE {})", self.message, self.code, sqlstate)
        } else {
            write!(f, "{} ({})", self.message, self.code)
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

impl fmt::Display for TimeoutError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.after {
            Some(after) => write!(f, "{} timed out after {:?}", self.operation, after)?,
            None => write!(f, "{} timed out", self.operation)?,
        }
        if self.escalated {
            write!(f, " (connection closed)")?;
        }
        Ok(())
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

impl From<TimeoutError> for Error {
    fn from(err: TimeoutError) -> Self {
        Error::Timeout(err)
    }
}

/// Result type alias for SQLWire operations.
pub type Result<T, E = Error> = std::result::Result<T, E>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_query_error_from_server() {
        let query = QueryError::from_server(
            1062,
            Some("23000".to_string()),
            "Duplicate entry '1' for key 'PRIMARY'",
        )
        .with_sql("INSERT INTO t VALUES (1)");

        assert_eq!(query.kind, QueryErrorKind::Constraint);
        assert!(query.is_unique_violation());
        assert!(!query.is_foreign_key_violation());

        let err = Error::Query(query);
        assert_eq!(err.server_code(), Some(1062));
        assert_eq!(err.sqlstate(), Some("23000"));
        assert_eq!(err.sql(), Some("INSERT INTO t VALUES (1)"));
        assert!(!err.is_fatal());
    }

    #[test]
    fn test_kind_from_code() {
        assert_eq!(QueryErrorKind::from_code(1064), QueryErrorKind::Syntax);
        assert_eq!(QueryErrorKind::from_code(1213), QueryErrorKind::Deadlock);
        assert_eq!(QueryErrorKind::from_code(1317), QueryErrorKind::Cancelled);
        assert_eq!(QueryErrorKind::from_code(1146), QueryErrorKind::NotFound);
        assert_eq!(QueryErrorKind::from_code(9999), QueryErrorKind::Database);
    }

    #[test]
    fn test_fatal_classification() {
        let desync = Error::protocol(ProtocolErrorKind::SequenceMismatch, "expected 1, got 3");
        assert!(desync.is_fatal());

        let too_large = Error::protocol(ProtocolErrorKind::PacketTooLarge, "too large");
        assert!(!too_large.is_fatal());

        let io = Error::Io(std::io::Error::new(
            std::io::ErrorKind::ConnectionReset,
            "reset",
        ));
        assert!(io.is_fatal());

        let expired = Error::connection(ConnectionErrorKind::PasswordExpired, "expired");
        assert!(!expired.is_fatal());

        let refused = Error::connection(ConnectionErrorKind::Unsupported, "local infile disabled");
        assert!(!refused.is_fatal());

        let lost = Error::connection(ConnectionErrorKind::Disconnected, "lost");
        assert!(lost.is_fatal());
        assert!(lost.is_connection_error());
    }

    #[test]
    fn test_timeout_escalation() {
        let timeout = Error::timeout("read", Some(Duration::from_millis(50)));
        assert!(timeout.is_timeout());
        assert!(timeout.is_retryable());
        assert!(!timeout.is_fatal());

        let escalated = timeout.escalate();
        assert!(escalated.is_timeout());
        assert!(escalated.is_fatal());
        assert!(!escalated.is_retryable());
        assert!(escalated.to_string().contains("connection closed"));
    }

    #[test]
    fn test_retryable_flags() {
        let deadlock = Error::Query(QueryError::from_server(1213, None, "deadlock"));
        assert!(deadlock.is_retryable());

        let pool_exhausted = Error::Pool(PoolError {
            kind: PoolErrorKind::Exhausted,
            message: "timeout getting connection".to_string(),
            source: None,
        });
        assert!(pool_exhausted.is_retryable());
        assert!(!pool_exhausted.is_fatal());
        assert!(!pool_exhausted.is_connection_error());
    }
}
