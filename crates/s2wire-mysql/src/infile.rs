//! `LOAD DATA LOCAL INFILE` responder.
//!
//! After a 0xFB reply the client sends the file contents as plain packets,
//! ends with an empty packet and reads the server's final OK. The empty
//! packet is sent on every path, including local failures, so the sequence
//! stays aligned and the connection remains usable.

use std::fs::File;
use std::io::{ErrorKind, Read};

use s2wire_core::{ErrorCategory, Result};

use crate::connection::MySqlConnection;
use crate::errors::{client_codes, decode_error_packet, protocol_error_with_data, query_error_in};
use crate::protocol::{OkPacket, PacketReader, is_ok_payload};

/// Filename that selects the caller-supplied stream.
pub const STREAM_SENTINEL: &str = ":stream:";

/// Largest chunk sent per packet.
const CHUNK_SIZE: usize = 16 * 1024;

/// Answer a local infile request for `filename`.
pub(crate) fn respond(
    conn: &mut MySqlConnection,
    filename: &str,
    source: Option<&mut (dyn Read + '_)>,
) -> Result<OkPacket> {
    if !conn.config().local_infile {
        tracing::warn!(filename, "server requested a local file but local_infile is disabled");
        conn.write_packet(&[])?;
        conn.read_raw_packet()?;
        return Err(query_error_in(
            ErrorCategory::Programming,
            0,
            "Received LOAD_LOCAL packet but local_infile option is false",
        ));
    }

    let chunk_size = CHUNK_SIZE.min(conn.config().max_allowed_packet as usize).max(1);
    let sent = match send_contents(conn, filename, source, chunk_size) {
        Err(e) if !conn.is_open() => return Err(e),
        other => other,
    };

    // Terminator, then the server's reply to the upload.
    conn.write_packet(&[])?;
    let reply = conn.read_raw_packet()?;
    match sent {
        Ok(bytes) => {
            tracing::debug!(filename, bytes, "local infile sent");
            let ok = finish(&reply, conn.deprecate_eof());
            conn.check(ok)
        }
        Err(e) => {
            tracing::debug!(filename, error = %e, "local infile aborted");
            Err(e)
        }
    }
}

fn finish(reply: &[u8], deprecate_eof: bool) -> Result<OkPacket> {
    if reply.first() == Some(&0xFF) {
        return Err(decode_error_packet(reply));
    }
    if !is_ok_payload(reply, deprecate_eof) {
        return Err(protocol_error_with_data("Commands Out of Sync", reply));
    }
    PacketReader::new(reply)
        .parse_ok_packet()
        .ok_or_else(|| protocol_error_with_data("Malformed OK packet", reply))
}

/// Stream the requested resource, returning the number of bytes sent.
fn send_contents(
    conn: &mut MySqlConnection,
    filename: &str,
    source: Option<&mut (dyn Read + '_)>,
    chunk_size: usize,
) -> Result<u64> {
    if filename == STREAM_SENTINEL {
        let Some(reader) = source else {
            return Err(file_not_found(
                ":stream: specified for LOCAL INFILE, but no stream was supplied",
            ));
        };
        return send_reader(conn, reader, chunk_size);
    }

    let mut file = File::open(filename).map_err(|e| match e.kind() {
        ErrorKind::NotFound | ErrorKind::PermissionDenied => {
            file_not_found(format!("Can't find file '{filename}'"))
        }
        _ => e.into(),
    })?;
    send_reader(conn, &mut file, chunk_size)
}

fn send_reader(conn: &mut MySqlConnection, reader: &mut dyn Read, chunk_size: usize) -> Result<u64> {
    let mut buf = vec![0u8; chunk_size];
    let mut total = 0u64;
    loop {
        let n = match reader.read(&mut buf) {
            Ok(0) => return Ok(total),
            Ok(n) => n,
            Err(e) if e.kind() == ErrorKind::Interrupted => continue,
            Err(e) => return Err(e.into()),
        };
        conn.write_packet(&buf[..n])?;
        total += n as u64;
    }
}

fn file_not_found(message: impl Into<String>) -> s2wire_core::Error {
    query_error_in(
        ErrorCategory::Operational,
        client_codes::ER_FILE_NOT_FOUND,
        message,
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_finish_accepts_ok() {
        let ok = [0x00, 0x05, 0x00, 0x02, 0x00, 0x00, 0x00];
        assert_eq!(finish(&ok, false).unwrap().affected_rows, 5);
    }

    #[test]
    fn test_finish_rejects_other_packets() {
        let err = finish(&[0x01, 0x02], false).unwrap_err();
        assert!(matches!(err, s2wire_core::Error::Protocol(_)));
        assert!(err.is_connection_error());
    }

    #[test]
    fn test_finish_decodes_server_error() {
        let err = finish(b"\xff\x10\x04#HY000bad", false).unwrap_err();
        assert_eq!(err.code(), Some(1040));
    }

    #[test]
    fn test_file_not_found_category() {
        let err = file_not_found("Can't find file 'x'");
        assert_eq!(err.code(), Some(1017));
        assert_eq!(err.category(), ErrorCategory::Operational);
    }
}
