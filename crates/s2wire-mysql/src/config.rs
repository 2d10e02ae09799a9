//! Connection configuration.
//!
//! Provides connection parameters for establishing connections, including
//! authentication, TLS, session setup and the reconnect target.

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use s2wire_core::{Error, Result};

use crate::auth::AuthHandler;
use crate::convert::{ConverterTable, EncodingErrors};
use crate::errors::config_error;
use crate::protocol::charset;

/// Longest accepted timeout (one year, in seconds).
const MAX_TIMEOUT_SECS: u64 = 31_536_000;

/// SSL mode for connections.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum SslMode {
    /// Do not use SSL
    #[default]
    Disable,
    /// Prefer SSL if available, fall back to non-SSL
    Preferred,
    /// Require SSL connection
    Required,
    /// Require SSL and verify server certificate
    VerifyCa,
    /// Require SSL and verify server certificate matches hostname
    VerifyIdentity,
}

impl SslMode {
    pub const fn should_try_ssl(self) -> bool {
        !matches!(self, SslMode::Disable)
    }

    pub const fn is_required(self) -> bool {
        matches!(
            self,
            SslMode::Required | SslMode::VerifyCa | SslMode::VerifyIdentity
        )
    }
}

/// Projection format the server uses for VECTOR columns.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum VectorFormat {
    Json,
    #[default]
    Binary,
}

impl VectorFormat {
    pub const fn as_str(self) -> &'static str {
        match self {
            VectorFormat::Json => "json",
            VectorFormat::Binary => "binary",
        }
    }
}

impl std::str::FromStr for VectorFormat {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_ascii_lowercase().as_str() {
            "json" => Ok(Self::Json),
            "binary" => Ok(Self::Binary),
            _ => Err(config_error(format!(
                "unknown value for vector_data_format, expecting \"json\" or \"binary\": {s}"
            ))),
        }
    }
}

/// Certificate material and verification options for TLS.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TlsConfig {
    /// CA bundle used to verify the server certificate
    pub ca_cert_path: Option<PathBuf>,
    /// Client certificate for mutual TLS
    pub client_cert_path: Option<PathBuf>,
    /// Client private key for mutual TLS
    pub client_key_path: Option<PathBuf>,
    /// Accept any server certificate
    pub danger_skip_verify: bool,
    /// SNI / verification name overriding the connect host
    pub server_name: Option<String>,
}

impl TlsConfig {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn ca_cert(mut self, path: impl Into<PathBuf>) -> Self {
        self.ca_cert_path = Some(path.into());
        self
    }

    pub fn client_cert(mut self, path: impl Into<PathBuf>) -> Self {
        self.client_cert_path = Some(path.into());
        self
    }

    pub fn client_key(mut self, path: impl Into<PathBuf>) -> Self {
        self.client_key_path = Some(path.into());
        self
    }

    /// Skip server certificate verification entirely.
    pub fn skip_verify(mut self, skip: bool) -> Self {
        self.danger_skip_verify = skip;
        self
    }

    pub fn server_name(mut self, name: impl Into<String>) -> Self {
        self.server_name = Some(name.into());
        self
    }
}

/// Where a connection should point.
///
/// Compared before every command when a [`TargetWatcher`] is configured.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConnectionTarget {
    pub host: String,
    pub port: u16,
    pub user: String,
    pub database: Option<String>,
    pub password: Option<String>,
}

impl ConnectionTarget {
    /// Does `other` point somewhere else (anything but the password differs)?
    pub fn requires_reconnect(&self, other: &ConnectionTarget) -> bool {
        self.host != other.host
            || self.port != other.port
            || self.user != other.user
            || self.database != other.database
    }
}

/// Source of the desired connection target, polled before each command.
pub trait TargetWatcher: Send + Sync {
    /// The target the connection should use now, or `None` to keep the
    /// current one.
    fn current_target(&self) -> Option<ConnectionTarget>;
}

/// Connection configuration.
#[derive(Clone)]
pub struct MySqlConfig {
    /// Hostname or IP address
    pub host: String,
    /// Port number (default: 3306)
    pub port: u16,
    /// Unix socket path; used instead of TCP when set
    pub unix_socket: Option<PathBuf>,
    /// Username for authentication
    pub user: String,
    /// Password for authentication
    pub password: Option<String>,
    /// Database name to connect to (optional at connect time)
    pub database: Option<String>,
    /// Character set name (default: utf8mb4)
    pub charset: String,
    /// Collation overriding the charset default
    pub collation: Option<String>,
    /// `sql_mode` applied after authentication
    pub sql_mode: Option<String>,
    /// Statement run once after authentication
    pub init_command: Option<String>,
    /// Autocommit mode to enforce; `None` keeps the server default
    pub autocommit: Option<bool>,
    /// Connection timeout
    pub connect_timeout: Duration,
    /// Socket read timeout once connected
    pub read_timeout: Option<Duration>,
    /// Socket write timeout once connected
    pub write_timeout: Option<Duration>,
    pub ssl_mode: SslMode,
    pub tls: TlsConfig,
    /// Additional connection attributes
    pub attributes: HashMap<String, String>,
    /// Reported as the `program_name` connection attribute
    pub program_name: Option<String>,
    /// Local infile handling (disabled by default)
    pub local_infile: bool,
    /// Max allowed packet size (default: 16MB)
    pub max_allowed_packet: u32,
    /// Handlers for caller-implemented auth plugins, by plugin name
    pub auth_plugins: HashMap<String, Arc<dyn AuthHandler>>,
    /// PEM public key for sha256/caching_sha2 full auth without TLS
    pub server_public_key: Option<Vec<u8>>,
    /// Allow multiple statements per query
    pub multi_statements: bool,
    /// Report found rows instead of changed rows
    pub found_rows: bool,
    /// Ask SingleStore for extended type metadata (BSON, VECTOR)
    pub enable_extended_data_types: bool,
    /// VECTOR projection format requested at connect; `None` sends nothing
    pub vector_data_format: Option<VectorFormat>,
    /// Parse JSON columns into `Value::Json`
    pub parse_json: bool,
    /// Handling of undecodable text column bytes
    pub encoding_errors: EncodingErrors,
    /// Column value converters
    pub converters: ConverterTable,
    /// Reconnect target source
    pub target_watcher: Option<Arc<dyn TargetWatcher>>,
}

impl std::fmt::Debug for MySqlConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MySqlConfig")
            .field("host", &self.host)
            .field("port", &self.port)
            .field("unix_socket", &self.unix_socket)
            .field("user", &self.user)
            .field("database", &self.database)
            .field("charset", &self.charset)
            .field("ssl_mode", &self.ssl_mode)
            .field("local_infile", &self.local_infile)
            .field(
                "auth_plugins",
                &self.auth_plugins.keys().collect::<Vec<_>>(),
            )
            .finish_non_exhaustive()
    }
}

impl Default for MySqlConfig {
    fn default() -> Self {
        Self {
            host: "localhost".to_string(),
            port: 3306,
            unix_socket: None,
            user: String::new(),
            password: None,
            database: None,
            charset: charset::DEFAULT_CHARSET.to_string(),
            collation: None,
            sql_mode: None,
            init_command: None,
            autocommit: None,
            connect_timeout: Duration::from_secs(10),
            read_timeout: None,
            write_timeout: None,
            ssl_mode: SslMode::default(),
            tls: TlsConfig::default(),
            attributes: HashMap::new(),
            program_name: None,
            local_infile: false,
            max_allowed_packet: 16 * 1024 * 1024,
            auth_plugins: HashMap::new(),
            server_public_key: None,
            multi_statements: false,
            found_rows: false,
            enable_extended_data_types: true,
            vector_data_format: Some(VectorFormat::Binary),
            parse_json: true,
            encoding_errors: EncodingErrors::Strict,
            converters: ConverterTable::default(),
            target_watcher: None,
        }
    }
}

impl MySqlConfig {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn host(mut self, host: impl Into<String>) -> Self {
        self.host = host.into();
        self
    }

    pub fn port(mut self, port: u16) -> Self {
        self.port = port;
        self
    }

    /// Connect through a Unix socket instead of TCP.
    pub fn unix_socket(mut self, path: impl Into<PathBuf>) -> Self {
        self.unix_socket = Some(path.into());
        self
    }

    pub fn user(mut self, user: impl Into<String>) -> Self {
        self.user = user.into();
        self
    }

    pub fn password(mut self, password: impl Into<String>) -> Self {
        self.password = Some(password.into());
        self
    }

    pub fn database(mut self, database: impl Into<String>) -> Self {
        self.database = Some(database.into());
        self
    }

    pub fn charset(mut self, charset: impl Into<String>) -> Self {
        self.charset = charset.into();
        self
    }

    pub fn collation(mut self, collation: impl Into<String>) -> Self {
        self.collation = Some(collation.into());
        self
    }

    pub fn sql_mode(mut self, mode: impl Into<String>) -> Self {
        self.sql_mode = Some(mode.into());
        self
    }

    pub fn init_command(mut self, sql: impl Into<String>) -> Self {
        self.init_command = Some(sql.into());
        self
    }

    pub fn autocommit(mut self, enabled: bool) -> Self {
        self.autocommit = Some(enabled);
        self
    }

    pub fn connect_timeout(mut self, timeout: Duration) -> Self {
        self.connect_timeout = timeout;
        self
    }

    pub fn read_timeout(mut self, timeout: Duration) -> Self {
        self.read_timeout = Some(timeout);
        self
    }

    pub fn write_timeout(mut self, timeout: Duration) -> Self {
        self.write_timeout = Some(timeout);
        self
    }

    pub fn ssl_mode(mut self, mode: SslMode) -> Self {
        self.ssl_mode = mode;
        self
    }

    pub fn tls_config(mut self, tls: TlsConfig) -> Self {
        self.tls = tls;
        self
    }

    /// Set a connection attribute.
    ///
    /// Built-in attributes (`_client_name`, `_os`, ...) take precedence.
    pub fn attribute(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.attributes.insert(key.into(), value.into());
        self
    }

    pub fn program_name(mut self, name: impl Into<String>) -> Self {
        self.program_name = Some(name.into());
        self
    }

    /// Enable or disable `LOAD DATA LOCAL INFILE` handling.
    ///
    /// When enabled the server may ask for any file readable by this process.
    pub fn local_infile(mut self, enabled: bool) -> Self {
        self.local_infile = enabled;
        self
    }

    pub fn max_allowed_packet(mut self, size: u32) -> Self {
        self.max_allowed_packet = size;
        self
    }

    /// Register a handler for a named auth plugin.
    pub fn auth_plugin(mut self, name: impl Into<String>, handler: Arc<dyn AuthHandler>) -> Self {
        self.auth_plugins.insert(name.into(), handler);
        self
    }

    /// PEM-encoded RSA public key of the server.
    pub fn server_public_key(mut self, pem: impl Into<Vec<u8>>) -> Self {
        self.server_public_key = Some(pem.into());
        self
    }

    pub fn multi_statements(mut self, enabled: bool) -> Self {
        self.multi_statements = enabled;
        self
    }

    pub fn found_rows(mut self, enabled: bool) -> Self {
        self.found_rows = enabled;
        self
    }

    pub fn extended_data_types(mut self, enabled: bool) -> Self {
        self.enable_extended_data_types = enabled;
        self
    }

    /// VECTOR projection format; `None` leaves the server default.
    pub fn vector_data_format(mut self, format: Option<VectorFormat>) -> Self {
        self.vector_data_format = format;
        self
    }

    pub fn parse_json(mut self, enabled: bool) -> Self {
        self.parse_json = enabled;
        self
    }

    pub fn encoding_errors(mut self, errors: EncodingErrors) -> Self {
        self.encoding_errors = errors;
        self
    }

    pub fn converters(mut self, table: ConverterTable) -> Self {
        self.converters = table;
        self
    }

    pub fn target_watcher(mut self, watcher: Arc<dyn TargetWatcher>) -> Self {
        self.target_watcher = Some(watcher);
        self
    }

    /// Human-readable address for error messages.
    pub fn display_addr(&self) -> String {
        match &self.unix_socket {
            Some(path) => path.display().to_string(),
            None => self.host.clone(),
        }
    }

    /// The target this configuration currently points at.
    pub fn target(&self) -> ConnectionTarget {
        ConnectionTarget {
            host: self.host.clone(),
            port: self.port,
            user: self.user.clone(),
            database: self.database.clone(),
            password: self.password.clone(),
        }
    }

    /// Point this configuration at a new target.
    pub fn apply_target(&mut self, target: ConnectionTarget) {
        self.host = target.host;
        self.port = target.port;
        self.user = target.user;
        self.database = target.database;
        self.password = target.password;
    }

    /// Collation id sent in the handshake.
    pub fn charset_id(&self) -> Result<u16> {
        charset::collation_id(&self.charset, self.collation.as_deref()).ok_or_else(|| {
            match &self.collation {
                Some(c) => config_error(format!(
                    "Unknown collation '{}' for charset '{}'",
                    c, self.charset
                )),
                None => config_error(format!("Unknown charset '{}'", self.charset)),
            }
        })
    }

    /// Check option ranges before any socket is opened.
    pub fn validate(&self) -> Result<()> {
        check_timeout("connect_timeout", Some(self.connect_timeout))?;
        check_timeout("read_timeout", self.read_timeout)?;
        check_timeout("write_timeout", self.write_timeout)?;
        self.charset_id()?;
        if self.max_allowed_packet == 0 {
            return Err(config_error("max_allowed_packet must be positive"));
        }
        if self.unix_socket.is_none() && self.host.is_empty() {
            return Err(config_error("host must not be empty"));
        }
        Ok(())
    }

    /// Build capability flags based on configuration.
    ///
    /// `CLIENT_SSL` is added at handshake time, only when TLS is negotiated.
    pub fn capability_flags(&self) -> u32 {
        use crate::protocol::capabilities::{
            CLIENT_CONNECT_WITH_DB, CLIENT_FOUND_ROWS, CLIENT_LOCAL_FILES,
            CLIENT_MULTI_STATEMENTS, DEFAULT_CLIENT_FLAGS,
        };

        let mut flags = DEFAULT_CLIENT_FLAGS;
        if self.database.is_some() {
            flags |= CLIENT_CONNECT_WITH_DB;
        }
        if self.local_infile {
            flags |= CLIENT_LOCAL_FILES;
        }
        if self.multi_statements {
            flags |= CLIENT_MULTI_STATEMENTS;
        }
        if self.found_rows {
            flags |= CLIENT_FOUND_ROWS;
        }
        flags
    }
}

fn check_timeout(name: &str, timeout: Option<Duration>) -> Result<()> {
    match timeout {
        Some(t) if t.is_zero() || t.as_secs() > MAX_TIMEOUT_SECS => Err(config_error(format!(
            "{name} should be > 0 and <= {MAX_TIMEOUT_SECS} seconds"
        ))),
        _ => Ok(()),
    }
}
