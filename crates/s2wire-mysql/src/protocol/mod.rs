//! MySQL wire protocol definitions.
//!
//! MySQL packets have a 4-byte header:
//! - 3 bytes: payload length (little-endian)
//! - 1 byte: sequence number
//!
//! Maximum packet payload is 2^24 - 1 (16MB - 1). Larger payloads
//! are split into multiple packets; a payload of exactly that size is a
//! continuation and the logical message ends at the first shorter packet.

pub mod reader;
pub mod writer;

pub use reader::PacketReader;
pub use writer::PacketWriter;

/// Maximum payload size for a single MySQL packet (2^24 - 1 bytes).
pub const MAX_PACKET_SIZE: usize = 0xFF_FF_FF;

/// MySQL capability flags (client and server).
#[allow(dead_code)]
pub mod capabilities {
    pub const CLIENT_LONG_PASSWORD: u32 = 1;
    pub const CLIENT_FOUND_ROWS: u32 = 1 << 1;
    pub const CLIENT_LONG_FLAG: u32 = 1 << 2;
    pub const CLIENT_CONNECT_WITH_DB: u32 = 1 << 3;
    pub const CLIENT_NO_SCHEMA: u32 = 1 << 4;
    pub const CLIENT_COMPRESS: u32 = 1 << 5;
    pub const CLIENT_ODBC: u32 = 1 << 6;
    pub const CLIENT_LOCAL_FILES: u32 = 1 << 7;
    pub const CLIENT_IGNORE_SPACE: u32 = 1 << 8;
    pub const CLIENT_PROTOCOL_41: u32 = 1 << 9;
    pub const CLIENT_INTERACTIVE: u32 = 1 << 10;
    pub const CLIENT_SSL: u32 = 1 << 11;
    pub const CLIENT_IGNORE_SIGPIPE: u32 = 1 << 12;
    pub const CLIENT_TRANSACTIONS: u32 = 1 << 13;
    pub const CLIENT_RESERVED: u32 = 1 << 14;
    pub const CLIENT_SECURE_CONNECTION: u32 = 1 << 15;
    pub const CLIENT_MULTI_STATEMENTS: u32 = 1 << 16;
    pub const CLIENT_MULTI_RESULTS: u32 = 1 << 17;
    pub const CLIENT_PS_MULTI_RESULTS: u32 = 1 << 18;
    pub const CLIENT_PLUGIN_AUTH: u32 = 1 << 19;
    pub const CLIENT_CONNECT_ATTRS: u32 = 1 << 20;
    pub const CLIENT_PLUGIN_AUTH_LENENC_CLIENT_DATA: u32 = 1 << 21;
    pub const CLIENT_CAN_HANDLE_EXPIRED_PASSWORDS: u32 = 1 << 22;
    pub const CLIENT_SESSION_TRACK: u32 = 1 << 23;
    pub const CLIENT_DEPRECATE_EOF: u32 = 1 << 24;

    /// Default client capabilities.
    pub const DEFAULT_CLIENT_FLAGS: u32 = CLIENT_PROTOCOL_41
        | CLIENT_SECURE_CONNECTION
        | CLIENT_LONG_PASSWORD
        | CLIENT_LONG_FLAG
        | CLIENT_TRANSACTIONS
        | CLIENT_MULTI_RESULTS
        | CLIENT_PLUGIN_AUTH
        | CLIENT_PLUGIN_AUTH_LENENC_CLIENT_DATA
        | CLIENT_CONNECT_ATTRS
        | CLIENT_DEPRECATE_EOF;
}

/// MySQL command codes (COM_xxx) issued by this client.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum Command {
    /// Quit connection
    Quit = 0x01,
    /// Switch database
    InitDb = 0x02,
    /// Text protocol query
    Query = 0x03,
    /// Kill a connection/thread
    ProcessKill = 0x0c,
    /// Ping server
    Ping = 0x0e,
}

impl Command {
    pub const fn name(self) -> &'static str {
        match self {
            Command::Quit => "COM_QUIT",
            Command::InitDb => "COM_INIT_DB",
            Command::Query => "COM_QUERY",
            Command::ProcessKill => "COM_PROCESS_KILL",
            Command::Ping => "COM_PING",
        }
    }
}

/// MySQL server status flags.
#[allow(dead_code)]
pub mod server_status {
    pub const SERVER_STATUS_IN_TRANS: u16 = 0x0001;
    pub const SERVER_STATUS_AUTOCOMMIT: u16 = 0x0002;
    pub const SERVER_MORE_RESULTS_EXISTS: u16 = 0x0008;
    pub const SERVER_STATUS_NO_GOOD_INDEX_USED: u16 = 0x0010;
    pub const SERVER_STATUS_NO_INDEX_USED: u16 = 0x0020;
    pub const SERVER_STATUS_CURSOR_EXISTS: u16 = 0x0040;
    pub const SERVER_STATUS_LAST_ROW_SENT: u16 = 0x0080;
    pub const SERVER_STATUS_DB_DROPPED: u16 = 0x0100;
    pub const SERVER_STATUS_NO_BACKSLASH_ESCAPES: u16 = 0x0200;
    pub const SERVER_STATUS_METADATA_CHANGED: u16 = 0x0400;
    pub const SERVER_QUERY_WAS_SLOW: u16 = 0x0800;
    pub const SERVER_PS_OUT_PARAMS: u16 = 0x1000;
    pub const SERVER_STATUS_IN_TRANS_READONLY: u16 = 0x2000;
    pub const SERVER_SESSION_STATE_CHANGED: u16 = 0x4000;
}

/// Character sets and collations known to the client.
pub mod charset {
    pub const LATIN1_SWEDISH_CI: u16 = 8;
    pub const ASCII_GENERAL_CI: u16 = 11;
    pub const UTF8_GENERAL_CI: u16 = 33;
    pub const UTF8MB4_GENERAL_CI: u16 = 45;
    pub const UTF8MB4_BIN: u16 = 46;
    pub const LATIN1_BIN: u16 = 47;
    pub const BINARY: u16 = 63;
    pub const UTF8_BIN: u16 = 83;
    pub const UTF8_UNICODE_CI: u16 = 192;
    pub const UTF8MB4_UNICODE_CI: u16 = 224;
    pub const UTF8MB4_0900_AI_CI: u16 = 255;

    /// Default character set name for new connections.
    pub const DEFAULT_CHARSET: &str = "utf8mb4";

    /// Text encoding used to decode column and message bytes.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub enum Encoding {
        Utf8,
        Latin1,
        Ascii,
    }

    /// (id, charset, collation, is default collation for the charset)
    const COLLATIONS: &[(u16, &str, &str, bool)] = &[
        (LATIN1_SWEDISH_CI, "latin1", "latin1_swedish_ci", true),
        (ASCII_GENERAL_CI, "ascii", "ascii_general_ci", true),
        (UTF8_GENERAL_CI, "utf8", "utf8_general_ci", true),
        (UTF8MB4_GENERAL_CI, "utf8mb4", "utf8mb4_general_ci", true),
        (UTF8MB4_BIN, "utf8mb4", "utf8mb4_bin", false),
        (LATIN1_BIN, "latin1", "latin1_bin", false),
        (BINARY, "binary", "binary", true),
        (UTF8_BIN, "utf8", "utf8_bin", false),
        (UTF8_UNICODE_CI, "utf8", "utf8_unicode_ci", false),
        (UTF8MB4_UNICODE_CI, "utf8mb4", "utf8mb4_unicode_ci", false),
        (UTF8MB4_0900_AI_CI, "utf8mb4", "utf8mb4_0900_ai_ci", false),
    ];

    /// Collation id for a charset name, honoring an explicit collation.
    pub fn collation_id(charset: &str, collation: Option<&str>) -> Option<u16> {
        let charset = normalize(charset);
        match collation {
            Some(collation) => COLLATIONS
                .iter()
                .find(|(_, cs, coll, _)| *cs == charset && coll.eq_ignore_ascii_case(collation))
                .map(|(id, ..)| *id),
            None => COLLATIONS
                .iter()
                .find(|(_, cs, _, default)| *cs == charset && *default)
                .map(|(id, ..)| *id),
        }
    }

    /// Charset name for a collation id.
    pub fn name_of(id: u16) -> Option<&'static str> {
        COLLATIONS
            .iter()
            .find(|(cid, ..)| *cid == id)
            .map(|(_, cs, ..)| *cs)
    }

    /// Encoding used for text with the given charset name.
    pub fn encoding_of(charset: &str) -> Encoding {
        match normalize(charset) {
            "latin1" => Encoding::Latin1,
            "ascii" => Encoding::Ascii,
            _ => Encoding::Utf8,
        }
    }

    fn normalize(charset: &str) -> &str {
        match charset {
            "utf8mb3" => "utf8",
            other => other,
        }
    }

    /// MySQL's `latin1` is windows-1252 as WHATWG defines it: the five
    /// bytes cp1252 leaves unassigned decode to the C1 control of the same
    /// value, as the server does.
    fn decode_latin1(bytes: &[u8]) -> String {
        encoding_rs::WINDOWS_1252
            .decode_without_bom_handling(bytes)
            .0
            .into_owned()
    }

    fn encode_latin1(text: &str) -> Vec<u8> {
        use encoding_rs::EncoderResult;

        let mut encoder = encoding_rs::WINDOWS_1252.new_encoder();
        let mut out = Vec::with_capacity(text.len());
        let mut buf = [0u8; 1024];
        let mut rest = text;
        loop {
            let (result, read, written) =
                encoder.encode_from_utf8_without_replacement(rest, &mut buf, true);
            out.extend_from_slice(&buf[..written]);
            rest = &rest[read..];
            match result {
                EncoderResult::InputEmpty => return out,
                EncoderResult::OutputFull => {}
                EncoderResult::Unmappable(_) => out.push(b'?'),
            }
        }
    }

    /// Decode bytes in the given encoding. Invalid UTF-8 is an error.
    pub fn decode(bytes: &[u8], encoding: Encoding) -> Result<String, String> {
        match encoding {
            Encoding::Utf8 => String::from_utf8(bytes.to_vec())
                .map_err(|e| format!("invalid utf-8 sequence: {}", e.utf8_error())),
            Encoding::Latin1 => Ok(decode_latin1(bytes)),
            Encoding::Ascii => {
                if bytes.is_ascii() {
                    Ok(bytes.iter().map(|&b| char::from(b)).collect())
                } else {
                    Err("non-ascii byte in ascii column".to_string())
                }
            }
        }
    }

    /// Decode bytes, substituting U+FFFD for anything invalid.
    pub fn decode_lossy(bytes: &[u8], encoding: Encoding) -> String {
        match encoding {
            Encoding::Utf8 => String::from_utf8_lossy(bytes).into_owned(),
            Encoding::Latin1 => decode_latin1(bytes),
            Encoding::Ascii => bytes
                .iter()
                .map(|&b| {
                    if b.is_ascii() {
                        char::from(b)
                    } else {
                        char::REPLACEMENT_CHARACTER
                    }
                })
                .collect(),
        }
    }

    /// Encode text for the wire in the given encoding.
    ///
    /// Characters outside latin1/ascii are replaced with `?`.
    pub fn encode(text: &str, encoding: Encoding) -> Vec<u8> {
        match encoding {
            Encoding::Utf8 => text.as_bytes().to_vec(),
            Encoding::Latin1 => encode_latin1(text),
            Encoding::Ascii => text
                .chars()
                .map(|c| if c.is_ascii() { c as u8 } else { b'?' })
                .collect(),
        }
    }
}

/// A MySQL packet header.
#[derive(Debug, Clone, Copy)]
pub struct PacketHeader {
    /// Payload length (3 bytes, max 16MB - 1)
    pub payload_length: u32,
    /// Sequence number (wraps at 255)
    pub sequence_id: u8,
}

impl PacketHeader {
    /// Total header size in bytes.
    pub const SIZE: usize = 4;

    /// Parse a packet header from 4 bytes.
    pub fn from_bytes(bytes: &[u8; 4]) -> Self {
        let payload_length =
            u32::from(bytes[0]) | (u32::from(bytes[1]) << 8) | (u32::from(bytes[2]) << 16);
        let sequence_id = bytes[3];
        Self {
            payload_length,
            sequence_id,
        }
    }

    /// Encode the header to 4 bytes.
    pub fn to_bytes(&self) -> [u8; 4] {
        [
            (self.payload_length & 0xFF) as u8,
            ((self.payload_length >> 8) & 0xFF) as u8,
            ((self.payload_length >> 16) & 0xFF) as u8,
            self.sequence_id,
        ]
    }
}

/// Server response packet types.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PacketType {
    /// OK packet (0x00)
    Ok,
    /// Error packet (0xFF)
    Error,
    /// EOF packet (0xFE with a short payload)
    Eof,
    /// Local infile request (0xFB)
    LocalInfile,
    /// Data packet (column count, row, column definition)
    Data,
}

impl PacketType {
    /// Detect packet type from the first byte of payload.
    pub fn from_first_byte(byte: u8, payload_len: usize) -> Self {
        match byte {
            0x00 => PacketType::Ok,
            0xFF => PacketType::Error,
            // EOF is 0xFE with payload < 9 bytes
            0xFE if payload_len < 9 => PacketType::Eof,
            0xFB => PacketType::LocalInfile,
            _ => PacketType::Data,
        }
    }

    /// Classify a whole payload.
    pub fn of(payload: &[u8]) -> Self {
        payload
            .first()
            .map_or(PacketType::Data, |&b| Self::from_first_byte(b, payload.len()))
    }
}

/// Is this payload an OK packet, including the 0xFE-headed OK that ends
/// a result set when CLIENT_DEPRECATE_EOF is negotiated?
pub fn is_ok_payload(payload: &[u8], deprecate_eof: bool) -> bool {
    match payload.first() {
        Some(0x00) => payload.len() >= 7,
        Some(0xFE) => deprecate_eof && payload.len() < MAX_PACKET_SIZE,
        _ => false,
    }
}

/// Parsed OK packet.
#[derive(Debug, Clone, Default)]
pub struct OkPacket {
    /// Number of affected rows
    pub affected_rows: u64,
    /// Last insert ID
    pub last_insert_id: u64,
    /// Server status flags
    pub status_flags: u16,
    /// Number of warnings
    pub warnings: u16,
    /// Info string (if any)
    pub info: String,
}

impl OkPacket {
    /// Does another result set follow?
    pub fn has_more_results(&self) -> bool {
        self.status_flags & server_status::SERVER_MORE_RESULTS_EXISTS != 0
    }
}

/// Parsed Error packet.
#[derive(Debug, Clone)]
pub struct ErrPacket {
    /// Error code
    pub error_code: u16,
    /// SQL state (5 characters), absent on pre-4.1 style errors
    pub sql_state: Option<String>,
    /// Error message
    pub error_message: String,
}

/// Parsed EOF packet.
#[derive(Debug, Clone, Copy)]
pub struct EofPacket {
    /// Number of warnings
    pub warnings: u16,
    /// Server status flags
    pub status_flags: u16,
}

impl EofPacket {
    /// Does another result set follow?
    pub fn has_more_results(&self) -> bool {
        self.status_flags & server_status::SERVER_MORE_RESULTS_EXISTS != 0
    }
}
