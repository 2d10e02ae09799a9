//! Server error packet decoding and client-side error constructors.

use s2wire_core::error::{
    ConfigError, ConnectionError, ConnectionErrorKind, ProtocolError, QueryError,
};
use s2wire_core::{Error, ErrorCategory};

use crate::protocol::PacketReader;

/// Client error codes (CR_xxx).
pub mod client_codes {
    pub const CR_CONN_HOST_ERROR: u16 = 2003;
    pub const CR_SERVER_GONE_ERROR: u16 = 2006;
    pub const CR_SERVER_LOST: u16 = 2013;
    pub const CR_COMMANDS_OUT_OF_SYNC: u16 = 2014;
    /// Server-side ER_FILE_NOT_FOUND, reused for local infile failures.
    pub const ER_FILE_NOT_FOUND: u16 = 1017;
}

const PROGRAMMING_CODES: &[u16] = &[
    1007, 1064, 1102, 1103, 1110, 1111, 1112, 1113, 1146, 1149, 1166, 1179,
];
const DATA_CODES: &[u16] = &[1171, 1230, 1263, 1264, 1265, 1365, 1366, 1367, 1406, 1441];
const INTEGRITY_CODES: &[u16] = &[
    1048, 1062, 1169, 1215, 1216, 1217, 1451, 1452, 1557, 1586, 1761, 1762,
];
const NOT_SUPPORTED_CODES: &[u16] = &[1196, 1235, 1286, 1289];
const OPERATIONAL_CODES: &[u16] = &[1040, 1044, 1045, 1142, 1143, 1213, 4025];

/// Map a server or client error code to its category.
pub fn category_for_code(code: u16) -> ErrorCategory {
    if PROGRAMMING_CODES.contains(&code) {
        ErrorCategory::Programming
    } else if DATA_CODES.contains(&code) {
        ErrorCategory::Data
    } else if INTEGRITY_CODES.contains(&code) {
        ErrorCategory::Integrity
    } else if NOT_SUPPORTED_CODES.contains(&code) {
        ErrorCategory::NotSupported
    } else if OPERATIONAL_CODES.contains(&code) {
        ErrorCategory::Operational
    } else if (2000..=2999).contains(&code) {
        ErrorCategory::Interface
    } else if code < 1000 {
        ErrorCategory::Internal
    } else {
        ErrorCategory::Operational
    }
}

/// Decode an ERR payload (first byte 0xFF) into a query error.
///
/// A payload too short to carry an error code is a protocol error.
pub fn decode_error_packet(payload: &[u8]) -> Error {
    match PacketReader::new(payload).parse_err_packet() {
        Some(err) => Error::Query(QueryError {
            category: category_for_code(err.error_code),
            code: err.error_code,
            sqlstate: err.sql_state,
            message: err.error_message,
            sql: None,
        }),
        None => protocol_error_with_data("Truncated error packet", payload),
    }
}

/// Build a query error with an explicit code, categorized by the code table.
pub fn query_error(code: u16, message: impl Into<String>) -> Error {
    Error::Query(QueryError {
        category: category_for_code(code),
        code,
        sqlstate: None,
        message: message.into(),
        sql: None,
    })
}

/// Build a query error with an explicit category.
pub fn query_error_in(category: ErrorCategory, code: u16, message: impl Into<String>) -> Error {
    Error::Query(QueryError {
        category,
        code,
        sqlstate: None,
        message: message.into(),
        sql: None,
    })
}

pub(crate) fn protocol_error(msg: impl Into<String>) -> Error {
    Error::Protocol(ProtocolError {
        message: msg.into(),
        raw_data: None,
        source: None,
    })
}

pub(crate) fn protocol_error_with_data(msg: impl Into<String>, data: &[u8]) -> Error {
    Error::Protocol(ProtocolError {
        message: msg.into(),
        raw_data: Some(data.to_vec()),
        source: None,
    })
}

pub(crate) fn connection_error(
    kind: ConnectionErrorKind,
    code: Option<u16>,
    msg: impl Into<String>,
) -> Error {
    Error::Connection(ConnectionError {
        kind,
        message: msg.into(),
        code,
        source: None,
    })
}

pub(crate) fn auth_error(msg: impl Into<String>) -> Error {
    connection_error(ConnectionErrorKind::Authentication, None, msg)
}

pub(crate) fn config_error(msg: impl Into<String>) -> Error {
    Error::Config(ConfigError {
        message: msg.into(),
        source: None,
    })
}

/// "Lost connection" (2013) raised on short reads and sequence resets.
pub(crate) fn lost_connection(source: Option<std::io::Error>) -> Error {
    let kind = match source.as_ref().map(std::io::Error::kind) {
        Some(std::io::ErrorKind::TimedOut | std::io::ErrorKind::WouldBlock) => {
            ConnectionErrorKind::Timeout
        }
        _ => ConnectionErrorKind::Disconnected,
    };
    let message = match &source {
        Some(e) => format!("Lost connection to MySQL server during query ({e})"),
        None => "Lost connection to MySQL server during query".to_string(),
    };
    Error::Connection(ConnectionError {
        kind,
        message,
        code: Some(client_codes::CR_SERVER_LOST),
        source: source.map(|e| Box::new(e) as Box<dyn std::error::Error + Send + Sync>),
    })
}

/// "Server has gone away" (2006) raised when a write fails.
pub(crate) fn gone_away(source: std::io::Error) -> Error {
    let kind = match source.kind() {
        std::io::ErrorKind::TimedOut | std::io::ErrorKind::WouldBlock => {
            ConnectionErrorKind::Timeout
        }
        _ => ConnectionErrorKind::Disconnected,
    };
    Error::Connection(ConnectionError {
        kind,
        message: format!("MySQL server has gone away ({source})"),
        code: Some(client_codes::CR_SERVER_GONE_ERROR),
        source: Some(Box::new(source)),
    })
}

/// Error for operations on a closed connection.
pub(crate) fn closed_error() -> Error {
    connection_error(
        ConnectionErrorKind::Closed,
        None,
        "The connection has been closed",
    )
}

pub(crate) fn out_of_sync(msg: &str) -> Error {
    query_error_in(
        ErrorCategory::Operational,
        client_codes::CR_COMMANDS_OUT_OF_SYNC,
        msg,
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_category_table() {
        assert_eq!(category_for_code(1064), ErrorCategory::Programming);
        assert_eq!(category_for_code(1146), ErrorCategory::Programming);
        assert_eq!(category_for_code(1406), ErrorCategory::Data);
        assert_eq!(category_for_code(1062), ErrorCategory::Integrity);
        assert_eq!(category_for_code(1761), ErrorCategory::Integrity);
        assert_eq!(category_for_code(1235), ErrorCategory::NotSupported);
        assert_eq!(category_for_code(1045), ErrorCategory::Operational);
        assert_eq!(category_for_code(4025), ErrorCategory::Operational);
    }

    #[test]
    fn test_category_fallbacks() {
        assert_eq!(category_for_code(999), ErrorCategory::Internal);
        assert_eq!(category_for_code(2013), ErrorCategory::Interface);
        assert_eq!(category_for_code(2999), ErrorCategory::Interface);
        assert_eq!(category_for_code(9999), ErrorCategory::Operational);
        assert_eq!(category_for_code(1205), ErrorCategory::Operational);
    }

    #[test]
    fn test_decode_error_packet() {
        let mut payload = vec![0xFF, 0x26, 0x04, b'#'];
        payload.extend_from_slice(b"23000Duplicate entry '1' for key 'PRIMARY'");
        let err = decode_error_packet(&payload);
        assert_eq!(err.category(), ErrorCategory::Integrity);
        assert_eq!(err.code(), Some(1062));
        assert_eq!(err.sqlstate(), Some("23000"));
        assert!(err.to_string().contains("Duplicate entry"));
        assert!(!err.is_connection_error());
    }

    #[test]
    fn test_decode_error_without_sqlstate() {
        let mut payload = vec![0xFF, 0x10, 0x04];
        payload.extend_from_slice(b"Too many connections");
        let err = decode_error_packet(&payload);
        assert_eq!(err.code(), Some(1040));
        assert_eq!(err.sqlstate(), None);
    }

    #[test]
    fn test_decode_invalid_utf8_message_is_lossy() {
        let payload = [0xFF, 0x28, 0x04, b'#', b'4', b'2', b'0', b'0', b'0', 0xC3, 0x28];
        let Error::Query(q) = decode_error_packet(&payload) else {
            panic!("expected query error");
        };
        assert_eq!(q.code, 1064);
        assert!(q.message.contains('\u{fffd}'));
    }

    #[test]
    fn test_truncated_error_packet() {
        let err = decode_error_packet(&[0xFF, 0x01]);
        assert!(matches!(err, Error::Protocol(_)));
    }

    #[test]
    fn test_io_error_mapping() {
        let timeout = lost_connection(Some(std::io::Error::from(std::io::ErrorKind::TimedOut)));
        assert!(timeout.is_retryable());
        assert_eq!(timeout.code(), Some(2013));

        let gone = gone_away(std::io::Error::from(std::io::ErrorKind::BrokenPipe));
        assert_eq!(gone.code(), Some(2006));
        assert!(gone.to_string().contains("gone away"));
    }
}
