//! Error types for s2wire operations.
//!
//! Every error carries an [`ErrorCategory`] so callers can branch on the
//! DB-API style class (interface, programming, data, integrity, ...)
//! without matching on concrete variants.

use std::fmt;

/// The primary error type for all protocol operations.
#[derive(Debug)]
pub enum Error {
    /// Transport, authentication and lifecycle errors. The connection is closed.
    Connection(ConnectionError),
    /// Errors reported by the server (or synthesized with a server error code).
    /// The connection stays usable.
    Query(QueryError),
    /// A column value could not be converted by its converter.
    Decode(DecodeError),
    /// Typed access to a decoded value failed.
    Type(TypeError),
    /// Malformed or out-of-order packets. The connection is closed.
    Protocol(ProtocolError),
    /// Invalid or unsatisfiable configuration.
    Config(ConfigError),
    /// Local I/O errors (outside the socket)
    Io(std::io::Error),
}

/// DB-API style error class.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorCategory {
    /// Error in the client interface rather than the database
    Interface,
    /// Bad SQL, missing objects, wrong argument usage
    Programming,
    /// Out of range values, truncation, division by zero
    Data,
    /// Constraint and referential violations
    Integrity,
    /// Feature not supported by the server
    NotSupported,
    /// Errors related to the database's operation, not under caller control
    Operational,
    /// Internal errors of the database or protocol desync
    Internal,
}

impl ErrorCategory {
    /// Name of the category as used in error messages.
    pub const fn name(self) -> &'static str {
        match self {
            ErrorCategory::Interface => "InterfaceError",
            ErrorCategory::Programming => "ProgrammingError",
            ErrorCategory::Data => "DataError",
            ErrorCategory::Integrity => "IntegrityError",
            ErrorCategory::NotSupported => "NotSupportedError",
            ErrorCategory::Operational => "OperationalError",
            ErrorCategory::Internal => "InternalError",
        }
    }

    /// Every category except `Interface` is a database error.
    pub const fn is_database_error(self) -> bool {
        !matches!(self, ErrorCategory::Interface)
    }
}

impl fmt::Display for ErrorCategory {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

#[derive(Debug)]
pub struct ConnectionError {
    pub kind: ConnectionErrorKind,
    pub message: String,
    /// Client error code (2003, 2006, 2013, ...) when one applies
    pub code: Option<u16>,
    pub source: Option<Box<dyn std::error::Error + Send + Sync>>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionErrorKind {
    /// Failed to establish connection
    Connect,
    /// Connection refused
    Refused,
    /// Authentication could not be completed
    Authentication,
    /// Connection lost during operation
    Disconnected,
    /// Socket read or write timed out
    Timeout,
    /// SSL/TLS negotiation failed
    Ssl,
    /// Operation on a connection that was already closed
    Closed,
}

#[derive(Debug)]
pub struct QueryError {
    pub category: ErrorCategory,
    /// Server (or client) error code
    pub code: u16,
    pub sqlstate: Option<String>,
    pub message: String,
    pub sql: Option<String>,
}

#[derive(Debug)]
pub struct DecodeError {
    /// Name of the offending column
    pub column: String,
    pub column_index: usize,
    /// Server type name of the column (e.g. "DATETIME")
    pub type_name: &'static str,
    pub message: String,
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
pub struct ConfigError {
    pub message: String,
    pub source: Option<Box<dyn std::error::Error + Send + Sync>>,
}

impl Error {
    /// DB-API category of this error.
    pub fn category(&self) -> ErrorCategory {
        match self {
            Error::Connection(c) => match c.kind {
                ConnectionErrorKind::Closed => ErrorCategory::Interface,
                _ => ErrorCategory::Operational,
            },
            Error::Query(q) => q.category,
            Error::Decode(_) => ErrorCategory::Data,
            Error::Type(_) => ErrorCategory::Interface,
            Error::Protocol(_) => ErrorCategory::Internal,
            Error::Config(_) => ErrorCategory::Programming,
            Error::Io(_) => ErrorCategory::Operational,
        }
    }

    /// Numeric error code, if any.
    pub fn code(&self) -> Option<u16> {
        match self {
            Error::Connection(c) => c.code,
            Error::Query(q) => Some(q.code),
            _ => None,
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

    /// Does this error leave the connection closed?
    pub fn is_connection_error(&self) -> bool {
        matches!(self, Error::Connection(_) | Error::Protocol(_))
    }

    /// Is this a retryable error (deadlock, lock wait timeout, socket timeout)?
    pub fn is_retryable(&self) -> bool {
        match self {
            // ER_LOCK_DEADLOCK, ER_LOCK_WAIT_TIMEOUT
            Error::Query(q) => matches!(q.code, 1205 | 1213),
            Error::Connection(c) => c.kind == ConnectionErrorKind::Timeout,
            _ => false,
        }
    }
}

impl QueryError {
    /// Is this a unique constraint violation?
    pub fn is_duplicate_key(&self) -> bool {
        self.code == 1062
    }

    /// Is this a foreign key violation?
    pub fn is_foreign_key_violation(&self) -> bool {
        matches!(self.code, 1216 | 1217 | 1451 | 1452)
    }
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Error::Connection(e) => match e.code {
                Some(code) => write!(f, "Connection error ({}): {}", code, e.message),
                None => write!(f, "Connection error: {}", e.message),
            },
            Error::Query(e) => write!(f, "{}", e),
            Error::Decode(e) => write!(f, "Decode error: {}", e),
            Error::Type(e) => write!(f, "Type error: {}", e),
            Error::Protocol(e) => write!(f, "Protocol error: {}", e.message),
            Error::Config(e) => write!(f, "Configuration error: {}", e.message),
            Error::Io(e) => write!(f, "I/O error: {}", e),
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
            Error::Protocol(e) => e
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
        match &self.sqlstate {
            Some(sqlstate) => write!(
                f,
                "{} ({}, SQLSTATE {}): {}",
                self.category, self.code, sqlstate, self.message
            ),
            None => write!(f, "{} ({}): {}", self.category, self.code, self.message),
        }
    }
}

impl fmt::Display for DecodeError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "failed to decode {} value in column '{}' (index {}): {}",
            self.type_name, self.column, self.column_index, self.message
        )
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

impl From<DecodeError> for Error {
    fn from(err: DecodeError) -> Self {
        Error::Decode(err)
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

impl From<ConfigError> for Error {
    fn from(err: ConfigError) -> Self {
        Error::Config(err)
    }
}

/// Result type alias for s2wire operations.
pub type Result<T> = std::result::Result<T, Error>;
