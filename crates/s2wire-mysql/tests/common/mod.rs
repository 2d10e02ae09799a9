//! In-process stub server speaking just enough of the wire protocol to
//! script one client session per test.

#![allow(dead_code)]

use std::io::{Read, Write};
use std::net::{TcpListener, TcpStream};
use std::thread::JoinHandle;
use std::time::Duration;

use s2wire_mysql::MySqlConfig;
use s2wire_mysql::protocol::{PacketReader, PacketWriter, capabilities};

pub const SALT: &[u8; 20] = b"01234567abcdefghijkl";

pub const COM_QUIT: u8 = 0x01;
pub const COM_INIT_DB: u8 = 0x02;
pub const COM_QUERY: u8 = 0x03;
pub const COM_PROCESS_KILL: u8 = 0x0c;
pub const COM_PING: u8 = 0x0e;

pub const TYPE_LONGLONG: u8 = 8;
pub const TYPE_DATE: u8 = 10;
pub const TYPE_JSON: u8 = 245;
pub const TYPE_VAR_STRING: u8 = 253;

pub const CHARSET_UTF8MB4: u16 = 45;
pub const CHARSET_BINARY: u16 = 63;

pub const STATUS_AUTOCOMMIT: u16 = 0x0002;
pub const STATUS_MORE_RESULTS: u16 = 0x0008;

/// Greeting parameters.
#[derive(Debug, Clone)]
pub struct Greeting {
    pub plugin: String,
    pub salt: Vec<u8>,
    pub capabilities: u32,
}

impl Default for Greeting {
    fn default() -> Self {
        Self {
            plugin: "mysql_native_password".to_string(),
            salt: SALT.to_vec(),
            capabilities: capabilities::DEFAULT_CLIENT_FLAGS
                | capabilities::CLIENT_CONNECT_WITH_DB
                | capabilities::CLIENT_LOCAL_FILES
                | capabilities::CLIENT_MULTI_STATEMENTS,
        }
    }
}

impl Greeting {
    pub fn without(mut self, flag: u32) -> Self {
        self.capabilities &= !flag;
        self
    }

    pub fn plugin(mut self, plugin: &str) -> Self {
        self.plugin = plugin.to_string();
        self
    }

    /// Pre-plugin-auth greeting carrying only the 8-byte scramble.
    pub fn short_salt(salt: &[u8; 8]) -> Self {
        Self {
            plugin: String::new(),
            salt: salt.to_vec(),
            ..Self::default()
        }
        .without(capabilities::CLIENT_PLUGIN_AUTH)
        .without(capabilities::CLIENT_DEPRECATE_EOF)
    }
}

/// Decoded handshake response.
#[derive(Debug, Clone)]
pub struct ClientHello {
    pub capabilities: u32,
    pub charset: u8,
    pub user: String,
    pub auth_response: Vec<u8>,
    pub database: Option<String>,
    pub plugin: String,
    pub attributes: Vec<(String, String)>,
}

/// Server side of one client connection.
pub struct ServerConn {
    stream: TcpStream,
    seq: u8,
    pub deprecate_eof: bool,
}

impl ServerConn {
    /// Read one packet, remembering its sequence id.
    pub fn read_packet(&mut self) -> Vec<u8> {
        let mut header = [0u8; 4];
        self.stream.read_exact(&mut header).expect("read header");
        let len = u32::from_le_bytes([header[0], header[1], header[2], 0]) as usize;
        self.seq = header[3].wrapping_add(1);
        let mut payload = vec![0u8; len];
        self.stream.read_exact(&mut payload).expect("read payload");
        payload
    }

    /// Next command; the client must have reset its sequence.
    pub fn read_command(&mut self) -> (u8, Vec<u8>) {
        let mut header = [0u8; 4];
        self.stream.read_exact(&mut header).expect("read command header");
        assert_eq!(header[3], 0, "command must start a new sequence");
        let len = u32::from_le_bytes([header[0], header[1], header[2], 0]) as usize;
        self.seq = 1;
        let mut payload = vec![0u8; len];
        self.stream.read_exact(&mut payload).expect("read command");
        (payload[0], payload[1..].to_vec())
    }

    /// Next COM_QUERY as text.
    pub fn read_query(&mut self) -> String {
        let (cmd, body) = self.read_command();
        assert_eq!(cmd, COM_QUERY, "expected COM_QUERY");
        String::from_utf8(body).expect("utf8 query")
    }

    /// Is the client gone (EOF on read)?
    pub fn client_closed(&mut self) -> bool {
        let mut buf = [0u8; 64];
        loop {
            match self.stream.read(&mut buf) {
                Ok(0) => return true,
                // COM_QUIT or leftovers
                Ok(_) => {}
                Err(_) => return true,
            }
        }
    }

    pub fn write(&mut self, payload: &[u8]) {
        let seq = self.seq;
        self.write_with_seq(seq, payload);
    }

    pub fn write_with_seq(&mut self, seq: u8, payload: &[u8]) {
        let len = payload.len() as u32;
        let mut bytes = len.to_le_bytes()[..3].to_vec();
        bytes.push(seq);
        bytes.extend_from_slice(payload);
        self.stream.write_all(&bytes).expect("write packet");
        self.seq = seq.wrapping_add(1);
    }

    /// Several packets in a single write, continuing the sequence.
    pub fn write_batch(&mut self, payloads: &[Vec<u8>]) {
        let mut bytes = Vec::new();
        for payload in payloads {
            bytes.extend_from_slice(&(payload.len() as u32).to_le_bytes()[..3]);
            bytes.push(self.seq);
            bytes.extend_from_slice(payload);
            self.seq = self.seq.wrapping_add(1);
        }
        self.stream.write_all(&bytes).expect("write packets");
    }

    pub fn greet(&mut self, greeting: &Greeting) {
        let caps = greeting.capabilities;
        let mut w = PacketWriter::new();
        w.write_u8(10);
        w.write_null_string("8.0.36-stub");
        w.write_u32_le(77);
        w.write_bytes(&greeting.salt[..8]);
        w.write_u8(0);
        w.write_u16_le((caps & 0xFFFF) as u16);
        w.write_u8(45);
        w.write_u16_le(STATUS_AUTOCOMMIT);
        w.write_u16_le((caps >> 16) as u16);
        if greeting.salt.len() > 8 {
            w.write_u8(21);
            w.write_zeros(10);
            w.write_bytes(&greeting.salt[8..]);
            w.write_u8(0);
        } else {
            w.write_u8(0);
            w.write_zeros(10);
        }
        if caps & capabilities::CLIENT_PLUGIN_AUTH != 0 {
            w.write_null_string(&greeting.plugin);
        }
        self.deprecate_eof = caps & capabilities::CLIENT_DEPRECATE_EOF != 0;
        self.write_with_seq(0, w.as_bytes());
    }

    pub fn read_hello(&mut self) -> ClientHello {
        let payload = self.read_packet();
        let mut r = PacketReader::new(&payload);
        let caps = r.read_u32_le().expect("caps");
        r.read_u32_le().expect("max packet");
        let charset = r.read_u8().expect("charset");
        r.skip(23);
        let user = r.read_null_string();
        let auth_response = if caps & capabilities::CLIENT_PLUGIN_AUTH_LENENC_CLIENT_DATA != 0 {
            r.read_lenenc_bytes().expect("auth").to_vec()
        } else {
            let len = usize::from(r.read_u8().expect("auth len"));
            r.read_bytes(len).expect("auth").to_vec()
        };
        let database = (caps & capabilities::CLIENT_CONNECT_WITH_DB != 0)
            .then(|| r.read_null_string())
            .filter(|db| !db.is_empty());
        let plugin = if caps & capabilities::CLIENT_PLUGIN_AUTH != 0 {
            r.read_null_string()
        } else {
            String::new()
        };
        let mut attributes = Vec::new();
        if caps & capabilities::CLIENT_CONNECT_ATTRS != 0 {
            let block = r.read_lenenc_bytes().expect("attrs");
            let mut a = PacketReader::new(block);
            while !a.is_empty() {
                let key = a.read_lenenc_string().expect("key");
                let value = a.read_lenenc_string().expect("value");
                attributes.push((key, value));
            }
        }
        self.deprecate_eof &= caps & capabilities::CLIENT_DEPRECATE_EOF != 0;
        ClientHello {
            capabilities: caps,
            charset,
            user,
            auth_response,
            database,
            plugin,
            attributes,
        }
    }

    /// Greeting, response, OK, then the setup statements issued at connect.
    pub fn accept(&mut self, greeting: &Greeting) -> ClientHello {
        self.greet(greeting);
        let hello = self.read_hello();
        self.ok(0, 0, STATUS_AUTOCOMMIT);
        self.session_setup();
        hello
    }

    /// `SET NAMES` plus the session settings a default config sends.
    pub fn session_setup(&mut self) {
        self.expect_query_ok("SET NAMES");
        assert_eq!(
            self.expect_query_ok("SET @@SESSION.enable_extended_types_metadata"),
            "SET @@SESSION.enable_extended_types_metadata=on"
        );
        assert_eq!(
            self.expect_query_ok("SET @@SESSION.vector_type_project_format"),
            "SET @@SESSION.vector_type_project_format=binary"
        );
    }

    pub fn expect_query_ok(&mut self, prefix: &str) -> String {
        let sql = self.read_query();
        assert!(sql.starts_with(prefix), "expected {prefix:?}, got {sql:?}");
        self.ok(0, 0, STATUS_AUTOCOMMIT);
        sql
    }

    pub fn ok(&mut self, affected: u64, insert_id: u64, status: u16) {
        self.write(&ok_packet(0x00, affected, insert_id, status, 0));
    }

    pub fn err(&mut self, code: u16, state: &str, message: &str) {
        let mut w = PacketWriter::new();
        w.write_u8(0xFF);
        w.write_u16_le(code);
        w.write_u8(b'#');
        w.write_bytes(state.as_bytes());
        w.write_bytes(message.as_bytes());
        self.write(w.as_bytes());
    }

    fn end_of_rows(&mut self, status: u16, warnings: u16) {
        if self.deprecate_eof {
            self.write(&ok_packet(0xFE, 0, 0, status, warnings));
        } else {
            self.write(&eof_packet(status, warnings));
        }
    }

    /// Column count and definitions (plus EOF on legacy sessions).
    pub fn columns(&mut self, columns: &[(&str, u8, u16)]) {
        let mut w = PacketWriter::new();
        w.write_lenenc_int(columns.len() as u64);
        self.write(w.as_bytes());
        for &(name, type_code, charset) in columns {
            self.write(&column_def(name, type_code, charset));
        }
        if !self.deprecate_eof {
            self.write(&eof_packet(STATUS_AUTOCOMMIT, 0));
        }
    }

    pub fn row(&mut self, values: &[Option<&str>]) {
        self.write(&text_row(values));
    }

    /// Whole result set, ending with `status`.
    pub fn result_set(&mut self, columns: &[(&str, u8, u16)], rows: &[Vec<Option<&str>>], status: u16) {
        self.columns(columns);
        for row in rows {
            self.row(row);
        }
        self.end_of_rows(status, 0);
    }

    pub fn end(&mut self, status: u16, warnings: u16) {
        self.end_of_rows(status, warnings);
    }
}

pub fn ok_packet(header: u8, affected: u64, insert_id: u64, status: u16, warnings: u16) -> Vec<u8> {
    let mut w = PacketWriter::new();
    w.write_u8(header);
    w.write_lenenc_int(affected);
    w.write_lenenc_int(insert_id);
    w.write_u16_le(status);
    w.write_u16_le(warnings);
    w.into_bytes()
}

pub fn eof_packet(status: u16, warnings: u16) -> Vec<u8> {
    let mut w = PacketWriter::new();
    w.write_u8(0xFE);
    w.write_u16_le(warnings);
    w.write_u16_le(status);
    w.into_bytes()
}

pub fn column_def(name: &str, type_code: u8, charset: u16) -> Vec<u8> {
    let mut w = PacketWriter::new();
    w.write_lenenc_string("def");
    w.write_lenenc_string("test");
    w.write_lenenc_string("t");
    w.write_lenenc_string("t");
    w.write_lenenc_string(name);
    w.write_lenenc_string(name);
    w.write_lenenc_int(0x0c);
    w.write_u16_le(charset);
    w.write_u32_le(80);
    w.write_u8(type_code);
    w.write_u16_le(0);
    w.write_u8(0);
    w.write_zeros(2);
    w.into_bytes()
}

pub fn text_row(values: &[Option<&str>]) -> Vec<u8> {
    let mut w = PacketWriter::new();
    for value in values {
        match value {
            Some(v) => w.write_lenenc_string(v),
            None => w.write_u8(0xFB),
        }
    }
    w.into_bytes()
}

/// Row of raw (possibly non-UTF-8) column values.
pub fn text_row_bytes(values: &[&[u8]]) -> Vec<u8> {
    let mut w = PacketWriter::new();
    for value in values {
        w.write_lenenc_bytes(value);
    }
    w.into_bytes()
}

/// Run `script` against the first client that connects.
pub fn spawn<F>(script: F) -> (u16, JoinHandle<()>)
where
    F: FnOnce(ServerConn) + Send + 'static,
{
    let listener = TcpListener::bind("127.0.0.1:0").expect("bind stub server");
    let port = listener.local_addr().expect("local addr").port();
    let handle = std::thread::spawn(move || {
        let (stream, _) = listener.accept().expect("accept");
        stream
            .set_read_timeout(Some(Duration::from_secs(10)))
            .expect("read timeout");
        script(ServerConn {
            stream,
            seq: 0,
            deprecate_eof: false,
        });
    });
    (port, handle)
}

/// Like [`spawn`] but serves several connections in turn.
pub fn spawn_many<F>(connections: usize, mut script: F) -> (u16, JoinHandle<()>)
where
    F: FnMut(usize, ServerConn) + Send + 'static,
{
    let listener = TcpListener::bind("127.0.0.1:0").expect("bind stub server");
    let port = listener.local_addr().expect("local addr").port();
    let handle = std::thread::spawn(move || {
        for index in 0..connections {
            let (stream, _) = listener.accept().expect("accept");
            stream
                .set_read_timeout(Some(Duration::from_secs(10)))
                .expect("read timeout");
            script(
                index,
                ServerConn {
                    stream,
                    seq: 0,
                    deprecate_eof: false,
                },
            );
        }
    });
    (port, handle)
}

pub fn config(port: u16) -> MySqlConfig {
    MySqlConfig::new()
        .host("127.0.0.1")
        .port(port)
        .user("app")
        .password("secret")
        .connect_timeout(Duration::from_secs(5))
        .read_timeout(Duration::from_secs(5))
}
