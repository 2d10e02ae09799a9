//! Synchronous MySQL / SingleStore client protocol core.
//!
//! This crate speaks the MySQL client/server wire protocol over blocking
//! sockets. It provides:
//!
//! - Packet framing with sequence numbers and 16 MiB splitting
//! - The connection phase: greeting, optional TLS upgrade, authentication
//!   (native, caching_sha2, sha256, clear, dialog, ed25519, pluggable
//!   handlers)
//! - Text-protocol commands with buffered or streaming results
//! - Per-connection value converters
//! - `LOAD DATA LOCAL INFILE` uploads
//!
//! # Example
//!
//! ```rust,ignore
//! use s2wire_mysql::{MySqlConfig, MySqlConnection};
//!
//! let config = MySqlConfig::new()
//!     .host("localhost")
//!     .port(3306)
//!     .user("root")
//!     .database("mydb");
//!
//! let mut conn = MySqlConnection::connect(config)?;
//! for row in conn.query_unbuffered("SELECT id, name FROM users")? {
//!     let row = row?;
//!     println!("{:?}", row.get(0));
//! }
//! ```

pub mod auth;
pub mod config;
pub mod connection;
pub mod convert;
pub mod cursor;
pub mod errors;
pub mod handshake;
pub mod infile;
pub mod protocol;
pub mod result;
pub mod tls;
pub mod transport;
pub mod types;

pub use auth::{AuthHandler, AuthPlugin};
pub use config::{
    ConnectionTarget, MySqlConfig, SslMode, TargetWatcher, TlsConfig, VectorFormat,
};
pub use connection::{ConnectionState, MySqlConnection};
pub use convert::{ConverterKey, ConverterTable, EncodingErrors, TextOptions};
pub use cursor::Cursor;
pub use result::{QueryResult, ResultStream, Terminator};
pub use types::{ColumnDef, ColumnDescription, FieldType};

pub use s2wire_core::{Error, ErrorCategory, Result, Row, Value};
