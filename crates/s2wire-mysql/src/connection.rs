//! Connection lifecycle and command execution.
//!
//! A [`MySqlConnection`] owns one socket session and at most one reply in
//! flight. Every command first brings the connection back to a command
//! boundary: it drains an unfinished unbuffered result and any pending
//! result sets of a multi-statement command, then resets the packet
//! sequence. Transport and protocol errors close the session before they
//! are returned; server errors leave it usable.

#![allow(clippy::cast_possible_truncation)]

use std::io::Read;

use s2wire_core::error::{ConnectionError, ConnectionErrorKind};
use s2wire_core::{Error, ErrorCategory, Result, Row};

use crate::config::{ConnectionTarget, MySqlConfig};
use crate::convert::{ConverterTable, RowDecoder, TextOptions};
use crate::cursor::Cursor;
use crate::errors::{
    client_codes, closed_error, config_error, decode_error_packet, out_of_sync,
    protocol_error_with_data,
};
use crate::handshake::{self, HandshakeInfo};
use crate::infile;
use crate::protocol::charset::{self, Encoding};
use crate::protocol::{
    Command, OkPacket, PacketReader, capabilities, is_ok_payload, server_status,
};
use crate::result::{
    QueryResult, Reply, ResultStream, RowPacket, Terminator, expect_eof, is_timeout_error,
};
use crate::transport::{PacketStream, Socket};
use crate::types::ColumnDef;

/// Coarse connection state, derived from the session.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    /// Ready for a command
    Ready,
    /// Ready, inside an explicit transaction
    InTransaction,
    /// An unbuffered result is being read
    Streaming,
    /// Closed explicitly or after a fatal error
    Closed,
}

/// Everything tied to one socket. Replaced as a whole on reconnect.
#[derive(Debug)]
struct Session {
    stream: PacketStream<Socket>,
    info: HandshakeInfo,
    /// Negotiated client flags
    capabilities: u32,
    status_flags: u16,
    secure: bool,
    /// Rows of an unbuffered result are still on the wire
    streaming: bool,
}

/// Reply read up to (not including) the first row.
#[derive(Debug)]
pub(crate) enum Pending {
    Done(OkPacket),
    Rows(RowDecoder),
}

/// A client connection.
pub struct MySqlConnection {
    config: MySqlConfig,
    session: Option<Session>,
    converters: ConverterTable,
    encoding: Encoding,
    affected_rows: u64,
    insert_id: u64,
    warnings: u16,
    info: String,
    /// Another result set of the last command is pending
    has_next: bool,
}

impl std::fmt::Debug for MySqlConnection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MySqlConnection")
            .field("state", &self.state())
            .field("thread_id", &self.thread_id())
            .field("host", &self.config.display_addr())
            .field("port", &self.config.port)
            .field("database", &self.config.database)
            .finish_non_exhaustive()
    }
}

impl MySqlConnection {
    /// Connect, authenticate and run the session setup statements.
    ///
    /// Setup runs in order: `SET NAMES` for the configured charset,
    /// `sql_mode`, the init command, then the autocommit mode.
    #[tracing::instrument(level = "debug", skip_all, fields(host = %config.display_addr(), port = config.port))]
    pub fn connect(config: MySqlConfig) -> Result<Self> {
        config.validate()?;
        let mut conn = Self {
            converters: config.converters.clone(),
            encoding: charset::encoding_of(&config.charset),
            config,
            session: None,
            affected_rows: 0,
            insert_id: 0,
            warnings: 0,
            info: String::new(),
            has_next: false,
        };
        conn.open()?;
        Ok(conn)
    }

    fn open(&mut self) -> Result<()> {
        let session = establish(&self.config)?;
        tracing::debug!(
            thread_id = session.info.connection_id,
            server_version = %session.info.server_version,
            secure = session.secure,
            "connected"
        );
        self.session = Some(session);
        self.reset_result_state();
        self.encoding = charset::encoding_of(&self.config.charset);

        if let Err(e) = self.setup_session() {
            self.force_close();
            return Err(e);
        }
        Ok(())
    }

    fn setup_session(&mut self) -> Result<()> {
        let charset = self.config.charset.clone();
        let collation = self.config.collation.clone();
        self.set_character_set(&charset, collation.as_deref())?;

        if let Some(mode) = self.config.sql_mode.clone() {
            self.execute_ok(&format!("SET sql_mode={}", quote_literal(&mode)))?;
        }
        if self.config.enable_extended_data_types {
            self.optional_setting("SET @@SESSION.enable_extended_types_metadata=on")?;
        }
        if let Some(format) = self.config.vector_data_format {
            self.optional_setting(&format!(
                "SET @@SESSION.vector_type_project_format={}",
                format.as_str()
            ))?;
        }
        if let Some(sql) = self.config.init_command.clone() {
            self.query(&sql)?;
            while self.next_result()?.is_some() {}
        }
        if let Some(enabled) = self.config.autocommit {
            self.set_autocommit(enabled)?;
        }
        Ok(())
    }

    /// Run a session setting that servers without it reject with an
    /// operational error; that rejection is ignored.
    fn optional_setting(&mut self, sql: &str) -> Result<()> {
        match self.execute_ok(sql) {
            Err(e @ Error::Query(_)) if e.category() == ErrorCategory::Operational => {
                tracing::debug!(error = %e, sql, "session setting not supported");
                Ok(())
            }
            other => other.map(|_| ()),
        }
    }

    /// Drop the current session and connect again with the current config.
    pub fn reconnect(&mut self) -> Result<()> {
        if let Some(session) = self.session.take() {
            quit(session);
        }
        self.open()
    }

    /// Point the connection at `target`.
    ///
    /// A different host, port, user or database replaces the session with
    /// a fresh handshake. A password-only change is stored for the next
    /// handshake and leaves the live session alone. Nothing happens while
    /// an unbuffered result is open. Returns whether a reconnect happened.
    pub fn sync_target(&mut self, target: ConnectionTarget) -> Result<bool> {
        if self.is_streaming() {
            return Ok(false);
        }
        let current = self.config.target();
        if !current.requires_reconnect(&target) {
            if current.password != target.password {
                tracing::debug!("password changed, applies to the next handshake");
                self.config.password = target.password;
            }
            return Ok(false);
        }

        tracing::info!(
            from = %current.host,
            to = %target.host,
            port = target.port,
            "connection target changed, reconnecting"
        );
        self.config.apply_target(target);
        self.reconnect()?;
        Ok(true)
    }

    // ==================== Queries ====================

    /// Run a statement and read its whole reply.
    #[tracing::instrument(level = "debug", skip(self), fields(sql_len = sql.len()))]
    pub fn query(&mut self, sql: &str) -> Result<QueryResult> {
        let pending = self.start_query(sql, None)?;
        self.complete(pending)
    }

    /// Run a statement and return its rows as a stream.
    ///
    /// The stream keeps the connection borrowed until it is exhausted,
    /// finished or dropped.
    #[tracing::instrument(level = "debug", skip(self), fields(sql_len = sql.len()))]
    pub fn query_unbuffered(&mut self, sql: &str) -> Result<ResultStream<'_>> {
        let pending = self.start_query(sql, None)?;
        Ok(self.stream_for(pending))
    }

    /// Run a `LOAD DATA LOCAL INFILE ':stream:' ...` statement, feeding the
    /// upload from `source`.
    pub fn query_with_infile(&mut self, sql: &str, source: &mut dyn Read) -> Result<QueryResult> {
        let pending = self.start_query(sql, Some(source))?;
        self.complete(pending)
    }

    /// Read the next result set of a multi-statement command.
    ///
    /// Returns `None` when no further result is pending.
    pub fn next_result(&mut self) -> Result<Option<QueryResult>> {
        match self.start_next_result()? {
            Some(pending) => self.complete(pending).map(Some),
            None => Ok(None),
        }
    }

    /// Like [`next_result`](Self::next_result) but streams the rows.
    pub fn next_result_unbuffered(&mut self) -> Result<Option<ResultStream<'_>>> {
        match self.start_next_result()? {
            Some(pending) => Ok(Some(self.stream_for(pending))),
            None => Ok(None),
        }
    }

    pub(crate) fn start_query(
        &mut self,
        sql: &str,
        source: Option<&mut (dyn Read + '_)>,
    ) -> Result<Pending> {
        let payload = charset::encode(sql, self.encoding);
        self.execute_command(Command::Query, &payload)?;
        self.read_reply(source).map_err(|e| with_sql(e, sql))
    }

    pub(crate) fn start_next_result(&mut self) -> Result<Option<Pending>> {
        if self.session.is_none() {
            return Err(closed_error());
        }
        if self.is_streaming() {
            self.drain_stream()?;
        }
        if !self.has_next {
            return Ok(None);
        }
        self.has_next = false;
        self.read_reply(None).map(Some)
    }

    pub(crate) fn complete(&mut self, pending: Pending) -> Result<QueryResult> {
        match pending {
            Pending::Done(ok) => Ok(QueryResult::from_ok(ok)),
            Pending::Rows(decoder) => self.read_buffered(&decoder),
        }
    }

    fn stream_for(&mut self, pending: Pending) -> ResultStream<'_> {
        match pending {
            Pending::Done(ok) => {
                let decoder = RowDecoder::new(Vec::new(), &self.converters, self.text_options());
                ResultStream::ack(self, decoder, ok)
            }
            Pending::Rows(decoder) => ResultStream::rows(self, decoder),
        }
    }

    // ==================== Commands ====================

    /// Switch the default database (COM_INIT_DB).
    pub fn select_db(&mut self, database: &str) -> Result<()> {
        let payload = charset::encode(database, self.encoding);
        self.execute_command(Command::InitDb, &payload)?;
        self.read_ok()?;
        self.config.database = Some(database.to_string());
        Ok(())
    }

    /// Check the server is alive (COM_PING).
    ///
    /// With `reconnect`, a closed connection is reopened first, and a
    /// failed ping is retried once on a fresh connection.
    pub fn ping(&mut self, reconnect: bool) -> Result<()> {
        let mut reconnect = reconnect;
        if self.session.is_none() {
            if !reconnect {
                return Err(closed_error());
            }
            self.reconnect()?;
            reconnect = false;
        }
        match self.ping_once() {
            Ok(()) => Ok(()),
            Err(e) if reconnect => {
                tracing::debug!(error = %e, "ping failed, reconnecting");
                self.reconnect()?;
                self.ping_once()
            }
            Err(e) => Err(e),
        }
    }

    fn ping_once(&mut self) -> Result<()> {
        self.execute_command(Command::Ping, &[])?;
        self.read_ok().map(|_| ())
    }

    /// Ask the server to kill another connection (COM_PROCESS_KILL).
    pub fn kill(&mut self, thread_id: u32) -> Result<()> {
        self.execute_command(Command::ProcessKill, &thread_id.to_le_bytes())?;
        self.read_ok().map(|_| ())
    }

    /// Change the session character set (`SET NAMES`).
    pub fn set_character_set(&mut self, charset: &str, collation: Option<&str>) -> Result<()> {
        if charset::collation_id(charset, collation).is_none() {
            return Err(config_error(match collation {
                Some(c) => format!("Unknown collation '{c}' for charset '{charset}'"),
                None => format!("Unknown charset '{charset}'"),
            }));
        }
        let sql = match collation {
            Some(c) => format!("SET NAMES {charset} COLLATE {c}"),
            None => format!("SET NAMES {charset}"),
        };
        self.execute_ok(&sql)?;
        self.config.charset = charset.to_string();
        self.config.collation = collation.map(str::to_string);
        self.encoding = charset::encoding_of(charset);
        Ok(())
    }

    /// Autocommit as last reported by the server.
    pub fn autocommit(&self) -> bool {
        self.status_flags() & server_status::SERVER_STATUS_AUTOCOMMIT != 0
    }

    /// Set autocommit; the statement is only sent when the mode changes.
    pub fn set_autocommit(&mut self, enabled: bool) -> Result<()> {
        self.config.autocommit = Some(enabled);
        if self.session.is_some() && self.autocommit() == enabled {
            return Ok(());
        }
        self.execute_ok(if enabled {
            "SET AUTOCOMMIT = 1"
        } else {
            "SET AUTOCOMMIT = 0"
        })
        .map(|_| ())
    }

    pub fn begin(&mut self) -> Result<()> {
        self.execute_ok("BEGIN").map(|_| ())
    }

    pub fn commit(&mut self) -> Result<()> {
        self.execute_ok("COMMIT").map(|_| ())
    }

    pub fn rollback(&mut self) -> Result<()> {
        self.execute_ok("ROLLBACK").map(|_| ())
    }

    /// Rows of `SHOW WARNINGS` for the last statement.
    pub fn show_warnings(&mut self) -> Result<Vec<Row>> {
        self.query("SHOW WARNINGS").map(|r| r.rows)
    }

    /// Send COM_QUIT (best effort) and close the socket.
    ///
    /// Closing an already closed connection is an error.
    pub fn close(&mut self) -> Result<()> {
        let session = self.session.take().ok_or_else(closed_error)?;
        self.has_next = false;
        quit(session);
        tracing::debug!("connection closed");
        Ok(())
    }

    // ==================== Cursors & converters ====================

    /// Cursor reading each result in full.
    pub fn cursor(&mut self) -> Cursor<'_> {
        Cursor::new(self, false)
    }

    /// Cursor streaming rows on demand.
    pub fn cursor_unbuffered(&mut self) -> Cursor<'_> {
        Cursor::new(self, true)
    }

    pub fn converters(&self) -> &ConverterTable {
        &self.converters
    }

    /// Replace the converter table for subsequent results.
    pub fn set_converters(&mut self, table: ConverterTable) -> Result<()> {
        if self.is_streaming() {
            return Err(out_of_sync(
                "Cannot change converters while a result is being streamed",
            ));
        }
        self.config.converters = table.clone();
        self.converters = table;
        Ok(())
    }

    // ==================== Accessors ====================

    pub fn config(&self) -> &MySqlConfig {
        &self.config
    }

    pub fn state(&self) -> ConnectionState {
        match &self.session {
            None => ConnectionState::Closed,
            Some(s) if s.streaming => ConnectionState::Streaming,
            Some(s) if s.status_flags & server_status::SERVER_STATUS_IN_TRANS != 0 => {
                ConnectionState::InTransaction
            }
            Some(_) => ConnectionState::Ready,
        }
    }

    pub fn is_open(&self) -> bool {
        self.session.is_some()
    }

    pub fn is_streaming(&self) -> bool {
        self.session.as_ref().is_some_and(|s| s.streaming)
    }

    /// Server connection id (for `kill`).
    pub fn thread_id(&self) -> Option<u32> {
        self.session.as_ref().map(|s| s.info.connection_id)
    }

    pub fn server_version(&self) -> Option<&str> {
        self.session.as_ref().map(|s| s.info.server_version.as_str())
    }

    /// Server greeting of the current session.
    pub fn server_info(&self) -> Option<&HandshakeInfo> {
        self.session.as_ref().map(|s| &s.info)
    }

    /// Negotiated capability flags.
    pub fn capabilities(&self) -> u32 {
        self.session.as_ref().map_or(0, |s| s.capabilities)
    }

    pub fn status_flags(&self) -> u16 {
        self.session.as_ref().map_or(0, |s| s.status_flags)
    }

    pub fn in_transaction(&self) -> bool {
        self.status_flags() & server_status::SERVER_STATUS_IN_TRANS != 0
    }

    /// Is the session protected by TLS or a Unix socket?
    pub fn is_secure(&self) -> bool {
        self.session.as_ref().is_some_and(|s| s.secure)
    }

    pub fn affected_rows(&self) -> u64 {
        self.affected_rows
    }

    pub fn insert_id(&self) -> u64 {
        self.insert_id
    }

    pub fn warning_count(&self) -> u16 {
        self.warnings
    }

    /// Info string of the last OK packet.
    pub fn info(&self) -> &str {
        &self.info
    }

    pub fn has_next_result(&self) -> bool {
        self.has_next
    }

    pub fn charset(&self) -> &str {
        &self.config.charset
    }

    pub fn encoding(&self) -> Encoding {
        self.encoding
    }

    fn text_options(&self) -> TextOptions {
        TextOptions {
            encoding: self.encoding,
            errors: self.config.encoding_errors,
            parse_json: self.config.parse_json,
        }
    }

    pub fn database(&self) -> Option<&str> {
        self.config.database.as_deref()
    }

    pub fn host_info(&self) -> String {
        match &self.config.unix_socket {
            Some(_) => "Localhost via UNIX socket".to_string(),
            None => format!("socket {}:{}", self.config.host, self.config.port),
        }
    }

    // ==================== Packet plumbing ====================

    pub(crate) fn deprecate_eof(&self) -> bool {
        self.capabilities() & capabilities::CLIENT_DEPRECATE_EOF != 0
    }

    /// Bring the connection to a command boundary and send a command.
    fn execute_command(&mut self, command: Command, payload: &[u8]) -> Result<()> {
        if self.session.is_none() {
            return Err(closed_error());
        }
        self.before_command()?;

        let mut message = Vec::with_capacity(payload.len() + 1);
        message.push(command as u8);
        message.extend_from_slice(payload);
        tracing::trace!(command = command.name(), len = payload.len(), "send command");

        let result = match self.session.as_mut() {
            Some(session) => {
                session.stream.reset_sequence();
                session.stream.write_message(&message)
            }
            None => Err(closed_error()),
        };
        self.check(result)
    }

    fn before_command(&mut self) -> Result<()> {
        if !self.is_streaming() {
            if let Some(watcher) = self.config.target_watcher.clone() {
                if let Some(target) = watcher.current_target() {
                    self.sync_target(target)?;
                }
            }
        }
        if self.is_streaming() {
            tracing::warn!("previous unbuffered result was not fully read, draining it");
            self.drain_stream()?;
        }
        while self.has_next {
            self.has_next = false;
            if let Pending::Rows(_) = self.read_reply(None)? {
                self.drain_stream()?;
            }
        }
        Ok(())
    }

    /// Read the first packet(s) of a reply.
    fn read_reply(&mut self, source: Option<&mut (dyn Read + '_)>) -> Result<Pending> {
        let first = self.read_raw_packet()?;
        let reply = Reply::parse(&first, self.deprecate_eof());
        match self.check(reply)? {
            Reply::Ack(ok) => {
                self.apply_ok(&ok);
                Ok(Pending::Done(ok))
            }
            Reply::LocalInfile(filename) => {
                tracing::debug!(%filename, "local infile requested");
                let ok = infile::respond(self, &filename, source)?;
                self.apply_ok(&ok);
                Ok(Pending::Done(ok))
            }
            Reply::ResultSet { column_count } => {
                let columns = self.read_columns(column_count)?;
                let decoder = RowDecoder::new(columns, &self.converters, self.text_options());
                if let Some(session) = self.session.as_mut() {
                    session.streaming = true;
                }
                Ok(Pending::Rows(decoder))
            }
        }
    }

    fn read_columns(&mut self, count: u64) -> Result<Vec<ColumnDef>> {
        let mut columns = Vec::with_capacity(count.min(4096) as usize);
        for _ in 0..count {
            let payload = self.read_raw_packet()?;
            let column = ColumnDef::parse(&payload);
            columns.push(self.check(column)?);
        }
        if !self.deprecate_eof() {
            let payload = self.read_raw_packet()?;
            let eof = expect_eof(&payload);
            self.check(eof)?;
        }
        Ok(columns)
    }

    /// Read every row; a decode failure is returned once the terminator
    /// has been consumed.
    fn read_buffered(&mut self, decoder: &RowDecoder) -> Result<QueryResult> {
        let mut rows = Vec::new();
        let mut failure = None;
        let end = loop {
            match self.stream_next_packet()? {
                RowPacket::Row(payload) => match decoder.decode_row(&payload) {
                    Ok(row) => rows.push(row),
                    Err(e) => {
                        failure.get_or_insert(e);
                    }
                },
                RowPacket::End(end) => break end,
            }
        };
        if let Some(e) = failure {
            return Err(e);
        }
        let result = QueryResult::from_rows(decoder.columns().to_vec(), rows, end);
        self.affected_rows = result.affected_rows;
        Ok(result)
    }

    /// Next packet of the row section of the current result.
    pub(crate) fn stream_next_packet(&mut self) -> Result<RowPacket> {
        match &self.session {
            None => return Err(closed_error()),
            Some(s) if !s.streaming => return Err(out_of_sync("No result set is being read")),
            Some(_) => {}
        }
        let payload = self.read_raw_packet()?;
        let packet = RowPacket::parse(payload, self.deprecate_eof());
        match self.check(packet) {
            Ok(RowPacket::End(end)) => {
                self.finish_rows(end);
                Ok(RowPacket::End(end))
            }
            Ok(row) => Ok(row),
            Err(e) => {
                if let Some(session) = self.session.as_mut() {
                    session.streaming = false;
                }
                self.has_next = false;
                Err(e)
            }
        }
    }

    /// Discard the rest of the current unbuffered result.
    ///
    /// A query or statement timeout reported mid-stream ends the result
    /// quietly.
    pub(crate) fn drain_stream(&mut self) -> Result<Terminator> {
        if !self.is_streaming() {
            return Ok(Terminator::default());
        }
        let mut skipped = 0u64;
        loop {
            match self.stream_next_packet() {
                Ok(RowPacket::Row(_)) => skipped += 1,
                Ok(RowPacket::End(end)) => {
                    tracing::trace!(skipped, "result drained");
                    return Ok(end);
                }
                Err(e) if is_timeout_error(&e) => {
                    tracing::debug!(error = %e, "query timed out while draining");
                    return Ok(Terminator::default());
                }
                Err(e) => return Err(e),
            }
        }
    }

    fn finish_rows(&mut self, end: Terminator) {
        if let Some(session) = self.session.as_mut() {
            session.streaming = false;
            session.status_flags = end.status_flags;
        }
        self.warnings = end.warnings;
        self.has_next = end.has_more_results();
    }

    /// Send a query and expect a plain OK.
    fn execute_ok(&mut self, sql: &str) -> Result<OkPacket> {
        let payload = charset::encode(sql, self.encoding);
        self.execute_command(Command::Query, &payload)?;
        self.read_ok().map_err(|e| with_sql(e, sql))
    }

    fn read_ok(&mut self) -> Result<OkPacket> {
        let payload = self.read_raw_packet()?;
        if payload.first() == Some(&0xFF) {
            self.has_next = false;
            return Err(decode_error_packet(&payload));
        }
        if !is_ok_payload(&payload, self.deprecate_eof()) {
            let err = protocol_error_with_data("Command Out of Sync", &payload);
            return self.check(Err(err));
        }
        let ok = PacketReader::new(&payload)
            .parse_ok_packet()
            .ok_or_else(|| protocol_error_with_data("Malformed OK packet", &payload));
        let ok = self.check(ok)?;
        self.apply_ok(&ok);
        Ok(ok)
    }

    fn apply_ok(&mut self, ok: &OkPacket) {
        if let Some(session) = self.session.as_mut() {
            session.status_flags = ok.status_flags;
        }
        self.affected_rows = ok.affected_rows;
        self.insert_id = ok.last_insert_id;
        self.warnings = ok.warnings;
        self.info.clone_from(&ok.info);
        self.has_next = ok.has_more_results();
    }

    fn reset_result_state(&mut self) {
        self.affected_rows = 0;
        self.insert_id = 0;
        self.warnings = 0;
        self.info.clear();
        self.has_next = false;
    }

    pub(crate) fn read_raw_packet(&mut self) -> Result<Vec<u8>> {
        let result = match self.session.as_mut() {
            Some(session) => session.stream.read_message(),
            None => Err(closed_error()),
        };
        self.check(result)
    }

    pub(crate) fn write_packet(&mut self, payload: &[u8]) -> Result<()> {
        let result = match self.session.as_mut() {
            Some(session) => session.stream.write_message(payload),
            None => Err(closed_error()),
        };
        self.check(result)
    }

    /// Close the session if `result` is a transport or protocol error.
    pub(crate) fn check<T>(&mut self, result: Result<T>) -> Result<T> {
        if let Err(e) = &result {
            if e.is_connection_error() && self.session.is_some() {
                tracing::debug!(error = %e, "closing connection after fatal error");
                self.force_close();
            }
        }
        result
    }

    /// Drop the socket without sending anything.
    fn force_close(&mut self) {
        if let Some(session) = self.session.take() {
            session.stream.get_ref().shutdown();
        }
        self.has_next = false;
    }
}

impl Drop for MySqlConnection {
    fn drop(&mut self) {
        if let Some(session) = self.session.take() {
            quit(session);
        }
    }
}

/// Best-effort COM_QUIT, then shut the socket down.
fn quit(mut session: Session) {
    session.stream.reset_sequence();
    if let Err(e) = session.stream.write_message(&[Command::Quit as u8]) {
        tracing::debug!(error = %e, "COM_QUIT failed");
    }
    session.stream.get_ref().shutdown();
}

/// Open a socket and run the connection phase.
fn establish(config: &MySqlConfig) -> Result<Session> {
    let socket = match &config.unix_socket {
        #[cfg(unix)]
        Some(path) => Socket::connect_unix(path)?,
        #[cfg(not(unix))]
        Some(_) => return Err(config_error("Unix sockets are not supported on this platform")),
        None => Socket::connect_tcp(&config.host, config.port, config.connect_timeout)?,
    };
    socket.set_timeouts(Some(config.connect_timeout), Some(config.connect_timeout))?;

    let (stream, negotiated) = handshake::perform(PacketStream::new(socket), config)
        .map_err(|e| connect_failed(config, e))?;
    stream
        .get_ref()
        .set_timeouts(config.read_timeout, config.write_timeout)?;

    Ok(Session {
        stream,
        info: negotiated.info,
        capabilities: negotiated.capabilities,
        status_flags: negotiated.status_flags,
        secure: negotiated.secure,
        streaming: false,
    })
}

/// Socket failures during the connection phase are reported as "can't
/// connect" (2003).
fn connect_failed(config: &MySqlConfig, err: Error) -> Error {
    match err {
        Error::Connection(e)
            if matches!(
                e.code,
                Some(client_codes::CR_SERVER_LOST | client_codes::CR_SERVER_GONE_ERROR)
            ) =>
        {
            let kind = match e.kind {
                ConnectionErrorKind::Timeout => ConnectionErrorKind::Timeout,
                _ => ConnectionErrorKind::Connect,
            };
            Error::Connection(ConnectionError {
                kind,
                message: format!(
                    "Can't connect to MySQL server on '{}' ({})",
                    config.display_addr(),
                    e.message
                ),
                code: Some(client_codes::CR_CONN_HOST_ERROR),
                source: Some(Box::new(Error::Connection(e))),
            })
        }
        other => other,
    }
}

fn with_sql(err: Error, sql: &str) -> Error {
    match err {
        Error::Query(mut q) => {
            q.sql = Some(sql.to_string());
            Error::Query(q)
        }
        other => other,
    }
}

/// Quote a string literal for the text protocol.
fn quote_literal(s: &str) -> String {
    let mut result = String::with_capacity(s.len() + 2);
    result.push('\'');
    for ch in s.chars() {
        match ch {
            '\'' => result.push_str("\\'"),
            '\\' => result.push_str("\\\\"),
            '\0' => result.push_str("\\0"),
            '\n' => result.push_str("\\n"),
            '\r' => result.push_str("\\r"),
            '\x1a' => result.push_str("\\Z"),
            _ => result.push(ch),
        }
    }
    result.push('\'');
    result
}
