//! Command replies and result sets.
//!
//! A reply is either an acknowledgement (OK packet), a local infile
//! request, or a result set: column count, column definitions, an EOF
//! (unless `CLIENT_DEPRECATE_EOF`), rows, then a terminator carrying the
//! more-results flag.
//!
//! Buffered results are read in full by [`MySqlConnection::query`].
//! [`ResultStream`] reads one row per call and always leaves the
//! connection at a command boundary: on exhaustion, through
//! [`ResultStream::finish`], or when dropped.

use std::sync::Arc;

use s2wire_core::{ColumnInfo, Error, Result, Row};

use crate::connection::MySqlConnection;
use crate::convert::RowDecoder;
use crate::errors::{decode_error_packet, protocol_error_with_data};
use crate::protocol::{MAX_PACKET_SIZE, OkPacket, PacketReader, is_ok_payload, server_status};
use crate::types::{ColumnDef, ColumnDescription};

/// Server error codes that end an abandoned stream without error.
pub(crate) const QUERY_TIMEOUT: u16 = 3024;
pub(crate) const STATEMENT_TIMEOUT: u16 = 1969;

/// First packet of a command reply.
#[derive(Debug)]
pub enum Reply {
    Ack(OkPacket),
    /// Server asks for the contents of a local file
    LocalInfile(String),
    ResultSet { column_count: u64 },
}

impl Reply {
    /// Classify the first reply packet. An ERR packet is returned as the
    /// decoded server error.
    pub fn parse(payload: &[u8], deprecate_eof: bool) -> Result<Self> {
        match payload.first() {
            Some(0xFF) => Err(decode_error_packet(payload)),
            Some(0xFB) => Ok(Reply::LocalInfile(
                String::from_utf8_lossy(&payload[1..]).into_owned(),
            )),
            Some(0x00 | 0xFE) if is_ok_payload(payload, deprecate_eof) => PacketReader::new(payload)
                .parse_ok_packet()
                .map(Reply::Ack)
                .ok_or_else(|| protocol_error_with_data("Malformed OK packet", payload)),
            _ => PacketReader::new(payload)
                .read_lenenc_int()
                .filter(|&n| n > 0)
                .map(|column_count| Reply::ResultSet { column_count })
                .ok_or_else(|| protocol_error_with_data("Invalid column count", payload)),
        }
    }
}

/// End-of-rows marker.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Terminator {
    pub warnings: u16,
    pub status_flags: u16,
}

impl Terminator {
    pub fn has_more_results(&self) -> bool {
        self.status_flags & server_status::SERVER_MORE_RESULTS_EXISTS != 0
    }
}

/// A packet inside the row section of a result set.
#[derive(Debug)]
pub enum RowPacket {
    Row(Vec<u8>),
    End(Terminator),
}

impl RowPacket {
    /// Classify a packet in row position.
    ///
    /// Only a 0xFE-headed packet can end the rows: a legacy EOF (< 9 bytes)
    /// or, with `CLIENT_DEPRECATE_EOF`, an OK packet. An ERR packet aborts
    /// the result set and is returned as the decoded error.
    pub fn parse(payload: Vec<u8>, deprecate_eof: bool) -> Result<Self> {
        match payload.first() {
            Some(0xFF) => Err(decode_error_packet(&payload)),
            Some(0xFE) if deprecate_eof && payload.len() < MAX_PACKET_SIZE => {
                let ok = PacketReader::new(&payload)
                    .parse_ok_packet()
                    .ok_or_else(|| protocol_error_with_data("Malformed OK terminator", &payload))?;
                Ok(RowPacket::End(Terminator {
                    warnings: ok.warnings,
                    status_flags: ok.status_flags,
                }))
            }
            Some(0xFE) if payload.len() < 9 => {
                let eof = PacketReader::new(&payload)
                    .parse_eof_packet()
                    .ok_or_else(|| protocol_error_with_data("Malformed EOF packet", &payload))?;
                Ok(RowPacket::End(Terminator {
                    warnings: eof.warnings,
                    status_flags: eof.status_flags,
                }))
            }
            _ => Ok(RowPacket::Row(payload)),
        }
    }
}

/// Check the EOF that follows column definitions on servers without
/// `CLIENT_DEPRECATE_EOF`.
pub(crate) fn expect_eof(payload: &[u8]) -> Result<()> {
    match payload.first() {
        Some(0xFE) if payload.len() < 9 => Ok(()),
        Some(0xFF) => Err(decode_error_packet(payload)),
        _ => Err(protocol_error_with_data(
            "Protocol error, expecting EOF",
            payload,
        )),
    }
}

/// Outcome of one statement read in full.
#[derive(Debug, Clone, Default)]
pub struct QueryResult {
    /// Rows changed, or rows returned for a result set
    pub affected_rows: u64,
    pub insert_id: u64,
    pub warnings: u16,
    /// Human-readable info from the OK packet
    pub info: String,
    pub status_flags: u16,
    /// Empty for statements without a result set
    pub columns: Vec<ColumnDef>,
    pub rows: Vec<Row>,
}

impl QueryResult {
    pub(crate) fn from_ok(ok: OkPacket) -> Self {
        Self {
            affected_rows: ok.affected_rows,
            insert_id: ok.last_insert_id,
            warnings: ok.warnings,
            info: ok.info,
            status_flags: ok.status_flags,
            columns: Vec::new(),
            rows: Vec::new(),
        }
    }

    pub(crate) fn from_rows(columns: Vec<ColumnDef>, rows: Vec<Row>, end: Terminator) -> Self {
        Self {
            affected_rows: rows.len() as u64,
            insert_id: 0,
            warnings: end.warnings,
            info: String::new(),
            status_flags: end.status_flags,
            columns,
            rows,
        }
    }

    /// Whether the statement produced a result set (possibly empty).
    pub fn is_result_set(&self) -> bool {
        !self.columns.is_empty()
    }

    /// Another result set follows this one.
    pub fn has_next(&self) -> bool {
        self.status_flags & server_status::SERVER_MORE_RESULTS_EXISTS != 0
    }

    pub fn description(&self) -> Vec<ColumnDescription> {
        self.columns.iter().map(ColumnDef::description).collect()
    }
}

/// Row-by-row reader over an unbuffered result.
///
/// Holds the connection exclusively, so no other command can be issued
/// until the stream is exhausted, finished or dropped.
pub struct ResultStream<'c> {
    conn: &'c mut MySqlConnection,
    decoder: RowDecoder,
    ack: Option<OkPacket>,
    end: Option<Terminator>,
    rows_read: u64,
}

impl std::fmt::Debug for ResultStream<'_> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ResultStream")
            .field("columns", &self.decoder.columns().len())
            .field("rows_read", &self.rows_read)
            .field("finished", &self.is_finished())
            .finish()
    }
}

impl<'c> ResultStream<'c> {
    /// Stream over a result set whose column definitions were just read.
    pub(crate) fn rows(conn: &'c mut MySqlConnection, decoder: RowDecoder) -> Self {
        Self {
            conn,
            decoder,
            ack: None,
            end: None,
            rows_read: 0,
        }
    }

    /// Already-finished stream for a statement without a result set.
    pub(crate) fn ack(conn: &'c mut MySqlConnection, decoder: RowDecoder, ok: OkPacket) -> Self {
        let end = Terminator {
            warnings: ok.warnings,
            status_flags: ok.status_flags,
        };
        Self {
            conn,
            decoder,
            ack: Some(ok),
            end: Some(end),
            rows_read: 0,
        }
    }

    pub fn columns(&self) -> &[ColumnDef] {
        self.decoder.columns()
    }

    pub fn column_info(&self) -> Arc<ColumnInfo> {
        self.decoder.column_info()
    }

    pub fn is_result_set(&self) -> bool {
        !self.decoder.columns().is_empty()
    }

    pub fn is_finished(&self) -> bool {
        self.end.is_some() || !self.conn.is_streaming()
    }

    /// Rows handed out so far.
    pub fn rows_read(&self) -> u64 {
        self.rows_read
    }

    /// Affected rows for a statement without a result set.
    pub fn affected_rows(&self) -> Option<u64> {
        self.ack.as_ref().map(|ok| ok.affected_rows)
    }

    pub fn insert_id(&self) -> Option<u64> {
        self.ack.as_ref().map(|ok| ok.last_insert_id)
    }

    /// Terminator of the result, once every row has been read.
    pub fn terminator(&self) -> Option<Terminator> {
        self.end
    }

    /// Read the next row. `Ok(None)` once the terminator was consumed.
    ///
    /// A decode failure consumes the row and leaves the stream usable.
    pub fn next_row(&mut self) -> Result<Option<Row>> {
        if self.end.is_some() {
            return Ok(None);
        }
        match self.conn.stream_next_packet()? {
            RowPacket::Row(payload) => {
                self.rows_read += 1;
                self.decoder.decode_row(&payload).map(Some)
            }
            RowPacket::End(end) => {
                self.end = Some(end);
                Ok(None)
            }
        }
    }

    /// Read and discard the remaining rows.
    pub fn finish(mut self) -> Result<Terminator> {
        self.drain()
    }

    fn drain(&mut self) -> Result<Terminator> {
        if let Some(end) = self.end {
            return Ok(end);
        }
        let end = self.conn.drain_stream()?;
        self.end = Some(end);
        Ok(end)
    }
}

impl Iterator for ResultStream<'_> {
    type Item = Result<Row>;

    fn next(&mut self) -> Option<Self::Item> {
        self.next_row().transpose()
    }
}

impl Drop for ResultStream<'_> {
    fn drop(&mut self) {
        if self.end.is_none() && self.conn.is_streaming() {
            tracing::debug!(rows_read = self.rows_read, "draining dropped result stream");
            if let Err(e) = self.drain() {
                tracing::warn!(error = %e, "failed to drain result stream");
            }
        }
    }
}

/// Error codes that end a drain quietly.
pub(crate) fn is_timeout_error(err: &Error) -> bool {
    matches!(err, Error::Query(q) if q.code == QUERY_TIMEOUT || q.code == STATEMENT_TIMEOUT)
}
