//! Socket plumbing and logical-message framing.
//!
//! [`PacketStream`] owns the sequence counter. Every physical packet read is
//! checked against it; a mismatch is reported and the caller is expected to
//! drop the socket.

use std::io::{Read, Write};
use std::net::{Shutdown, TcpStream, ToSocketAddrs};
#[cfg(unix)]
use std::os::unix::net::UnixStream;
use std::time::Duration;

use s2wire_core::Result;
use s2wire_core::error::ConnectionErrorKind;

use crate::errors::{client_codes, connection_error, gone_away, lost_connection, protocol_error};
use crate::protocol::{MAX_PACKET_SIZE, PacketHeader, writer::frame_message};
#[cfg(feature = "tls")]
use crate::tls::TlsStream;

/// A connected byte stream to the server.
#[derive(Debug)]
pub enum Socket {
    Tcp(TcpStream),
    #[cfg(unix)]
    Unix(UnixStream),
    #[cfg(feature = "tls")]
    Tls(Box<TlsStream<TcpStream>>),
}

impl Socket {
    /// Open a TCP connection, trying every resolved address in turn.
    pub fn connect_tcp(host: &str, port: u16, timeout: Duration) -> Result<Self> {
        let addrs = (host, port)
            .to_socket_addrs()
            .map_err(|e| cant_connect(host, &e))?;

        let mut last_err = None;
        for addr in addrs {
            match TcpStream::connect_timeout(&addr, timeout) {
                Ok(stream) => {
                    stream.set_nodelay(true).ok();
                    tracing::trace!(%addr, "tcp connected");
                    return Ok(Socket::Tcp(stream));
                }
                Err(e) => last_err = Some(e),
            }
        }

        let err = last_err.unwrap_or_else(|| {
            std::io::Error::new(std::io::ErrorKind::NotFound, "no addresses resolved")
        });
        Err(cant_connect(host, &err))
    }

    /// Open a Unix domain socket connection.
    #[cfg(unix)]
    pub fn connect_unix(path: &std::path::Path) -> Result<Self> {
        let stream = UnixStream::connect(path)
            .map_err(|e| cant_connect(&path.display().to_string(), &e))?;
        Ok(Socket::Unix(stream))
    }

    /// Apply read/write timeouts. `None` blocks indefinitely.
    pub fn set_timeouts(&self, read: Option<Duration>, write: Option<Duration>) -> Result<()> {
        let res = match self {
            Socket::Tcp(s) => s.set_read_timeout(read).and_then(|()| s.set_write_timeout(write)),
            #[cfg(unix)]
            Socket::Unix(s) => s.set_read_timeout(read).and_then(|()| s.set_write_timeout(write)),
            #[cfg(feature = "tls")]
            Socket::Tls(s) => {
                let tcp = s.get_ref();
                tcp.set_read_timeout(read)
                    .and_then(|()| tcp.set_write_timeout(write))
            }
        };
        res.map_err(|e| {
            connection_error(
                ConnectionErrorKind::Connect,
                None,
                format!("Failed to set socket timeouts: {e}"),
            )
        })
    }

    /// Is the channel protected (TLS, or a local Unix socket)?
    pub fn is_secure(&self) -> bool {
        match self {
            Socket::Tcp(_) => false,
            #[cfg(unix)]
            Socket::Unix(_) => true,
            #[cfg(feature = "tls")]
            Socket::Tls(_) => true,
        }
    }

    /// Close both directions without sending anything.
    pub fn shutdown(&self) {
        let _ = match self {
            Socket::Tcp(s) => s.shutdown(Shutdown::Both),
            #[cfg(unix)]
            Socket::Unix(s) => s.shutdown(Shutdown::Both),
            #[cfg(feature = "tls")]
            Socket::Tls(s) => s.get_ref().shutdown(Shutdown::Both),
        };
    }
}

impl Read for Socket {
    fn read(&mut self, buf: &mut [u8]) -> std::io::Result<usize> {
        match self {
            Socket::Tcp(s) => s.read(buf),
            #[cfg(unix)]
            Socket::Unix(s) => s.read(buf),
            #[cfg(feature = "tls")]
            Socket::Tls(s) => s.read(buf),
        }
    }
}

impl Write for Socket {
    fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
        match self {
            Socket::Tcp(s) => s.write(buf),
            #[cfg(unix)]
            Socket::Unix(s) => s.write(buf),
            #[cfg(feature = "tls")]
            Socket::Tls(s) => s.write(buf),
        }
    }

    fn flush(&mut self) -> std::io::Result<()> {
        match self {
            Socket::Tcp(s) => s.flush(),
            #[cfg(unix)]
            Socket::Unix(s) => s.flush(),
            #[cfg(feature = "tls")]
            Socket::Tls(s) => s.flush(),
        }
    }
}

fn cant_connect(host: &str, err: &std::io::Error) -> s2wire_core::Error {
    let kind = if err.kind() == std::io::ErrorKind::ConnectionRefused {
        ConnectionErrorKind::Refused
    } else {
        ConnectionErrorKind::Connect
    };
    connection_error(
        kind,
        Some(client_codes::CR_CONN_HOST_ERROR),
        format!("Can't connect to MySQL server on '{host}' ({err})"),
    )
}

/// Framed, sequence-checked message stream over any byte stream.
#[derive(Debug)]
pub struct PacketStream<S> {
    stream: S,
    sequence_id: u8,
}

impl<S: Read + Write> PacketStream<S> {
    pub fn new(stream: S) -> Self {
        Self::with_sequence(stream, 0)
    }

    /// Wrap a stream continuing an existing sequence (after a TLS upgrade).
    pub fn with_sequence(stream: S, sequence_id: u8) -> Self {
        Self {
            stream,
            sequence_id,
        }
    }

    /// Start a new command exchange.
    pub fn reset_sequence(&mut self) {
        self.sequence_id = 0;
    }

    /// Sequence id expected on the next packet (either direction).
    pub fn sequence_id(&self) -> u8 {
        self.sequence_id
    }

    pub fn get_ref(&self) -> &S {
        &self.stream
    }

    pub fn get_mut(&mut self) -> &mut S {
        &mut self.stream
    }

    pub fn into_inner(self) -> S {
        self.stream
    }

    /// Write one logical message, splitting it into physical packets.
    pub fn write_message(&mut self, payload: &[u8]) -> Result<()> {
        let (bytes, next) = frame_message(payload, self.sequence_id);
        tracing::trace!(
            len = payload.len(),
            seq = self.sequence_id,
            "write message"
        );
        self.sequence_id = next;
        self.stream.write_all(&bytes).map_err(gone_away)?;
        self.stream.flush().map_err(gone_away)
    }

    /// Read one logical message, joining continuation packets.
    pub fn read_message(&mut self) -> Result<Vec<u8>> {
        let mut payload = Vec::new();
        loop {
            let mut header = [0u8; PacketHeader::SIZE];
            self.stream
                .read_exact(&mut header)
                .map_err(|e| lost_connection(Some(e)))?;
            let header = PacketHeader::from_bytes(&header);
            self.check_sequence(header.sequence_id)?;

            let len = header.payload_length as usize;
            let start = payload.len();
            payload.resize(start + len, 0);
            self.stream
                .read_exact(&mut payload[start..])
                .map_err(|e| lost_connection(Some(e)))?;

            tracing::trace!(len, seq = header.sequence_id, "read packet");
            if len < MAX_PACKET_SIZE {
                return Ok(payload);
            }
        }
    }

    fn check_sequence(&mut self, got: u8) -> Result<()> {
        let expected = self.sequence_id;
        if got != expected {
            return Err(if got == 0 {
                lost_connection(None)
            } else {
                protocol_error(format!(
                    "Packet sequence number wrong - got {got} expected {expected}"
                ))
            });
        }
        self.sequence_id = got.wrapping_add(1);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use s2wire_core::{Error, ErrorCategory};
    use std::io::Cursor;

    /// In-memory duplex: reads from `input`, collects writes in `output`.
    struct Pipe {
        input: Cursor<Vec<u8>>,
        output: Vec<u8>,
    }

    impl Pipe {
        fn new(input: Vec<u8>) -> Self {
            Self {
                input: Cursor::new(input),
                output: Vec::new(),
            }
        }
    }

    impl Read for Pipe {
        fn read(&mut self, buf: &mut [u8]) -> std::io::Result<usize> {
            self.input.read(buf)
        }
    }

    impl Write for Pipe {
        fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
            self.output.extend_from_slice(buf);
            Ok(buf.len())
        }

        fn flush(&mut self) -> std::io::Result<()> {
            Ok(())
        }
    }

    fn count_packets(mut bytes: &[u8]) -> usize {
        let mut count = 0;
        while bytes.len() >= 4 {
            let len = usize::from(bytes[0]) | usize::from(bytes[1]) << 8 | usize::from(bytes[2]) << 16;
            bytes = &bytes[4 + len..];
            count += 1;
        }
        count
    }

    fn roundtrip(size: usize) -> usize {
        let payload: Vec<u8> = (0..size).map(|i| (i % 251) as u8).collect();
        let mut writer = PacketStream::new(Pipe::new(Vec::new()));
        writer.write_message(&payload).unwrap();
        let wire = writer.into_inner().output;
        let packets = count_packets(&wire);

        let mut reader = PacketStream::new(Pipe::new(wire));
        let read = reader.read_message().unwrap();
        assert_eq!(read, payload, "size {size}");
        assert_eq!(usize::from(reader.sequence_id()), packets % 256);
        packets
    }

    #[test]
    fn test_roundtrip_small_sizes() {
        assert_eq!(roundtrip(0), 1);
        assert_eq!(roundtrip(1), 1);
    }

    #[test]
    fn test_roundtrip_around_packet_limit() {
        assert_eq!(roundtrip(MAX_PACKET_SIZE - 1), 1);
        assert_eq!(roundtrip(MAX_PACKET_SIZE), 2);
        assert_eq!(roundtrip(MAX_PACKET_SIZE + 6), 2);
    }

    #[test]
    fn test_sequence_mismatch_is_protocol_error() {
        // Reply arrives with seq 2 while 1 is expected
        let wire = vec![1, 0, 0, 2, 0x00];
        let mut stream = PacketStream::with_sequence(Pipe::new(wire), 1);
        let err = stream.read_message().unwrap_err();
        assert!(matches!(err, Error::Protocol(_)));
        assert_eq!(err.category(), ErrorCategory::Internal);
        assert!(err.to_string().contains("got 2 expected 1"));
    }

    #[test]
    fn test_sequence_reset_by_server_is_lost_connection() {
        let wire = vec![1, 0, 0, 0, 0x00];
        let mut stream = PacketStream::with_sequence(Pipe::new(wire), 3);
        let err = stream.read_message().unwrap_err();
        assert_eq!(err.code(), Some(2013));
        assert_eq!(err.category(), ErrorCategory::Operational);
    }

    #[test]
    fn test_short_read_is_lost_connection() {
        let wire = vec![5, 0, 0, 0, b'a', b'b'];
        let mut stream = PacketStream::new(Pipe::new(wire));
        let err = stream.read_message().unwrap_err();
        assert!(err.is_connection_error());
        assert_eq!(err.code(), Some(2013));
    }

    #[test]
    fn test_write_continues_sequence() {
        let mut stream = PacketStream::new(Pipe::new(Vec::new()));
        stream.write_message(b"a").unwrap();
        stream.write_message(b"b").unwrap();
        assert_eq!(stream.sequence_id(), 2);
        stream.reset_sequence();
        stream.write_message(b"c").unwrap();
        let out = &stream.get_ref().output;
        assert_eq!(out[3], 0);
        assert_eq!(out[8], 1);
        assert_eq!(out[13], 0);
    }

    #[test]
    fn test_sequence_counts_packets_in_both_directions() {
        // (command payload size, reply packets)
        let exchanges = [(1, 1), (MAX_PACKET_SIZE, 3), (10, 300), (0, 2)];

        let mut wire = Vec::new();
        for &(size, replies) in &exchanges {
            let sent = size / MAX_PACKET_SIZE + 1;
            for i in 0..replies {
                wire.extend_from_slice(&[1, 0, 0, (sent + i) as u8, b'r']);
            }
        }

        let mut stream = PacketStream::new(Pipe::new(wire));
        for &(size, replies) in &exchanges {
            stream.reset_sequence();
            let before = stream.get_ref().output.len();
            stream.write_message(&vec![0x03; size]).unwrap();
            let sent = count_packets(&stream.get_ref().output[before..]);
            assert_eq!(usize::from(stream.sequence_id()), sent % 256);

            for received in 1..=replies {
                assert_eq!(stream.read_message().unwrap(), b"r");
                assert_eq!(usize::from(stream.sequence_id()), (sent + received) % 256);
            }
        }
    }

    #[test]
    fn test_sequence_wraps() {
        let mut wire = Vec::new();
        wire.extend_from_slice(&[1, 0, 0, 255, b'x']);
        wire.extend_from_slice(&[1, 0, 0, 0, b'y']);
        let mut stream = PacketStream::with_sequence(Pipe::new(wire), 255);
        assert_eq!(stream.read_message().unwrap(), b"x");
        assert_eq!(stream.read_message().unwrap(), b"y");
        assert_eq!(stream.sequence_id(), 1);
    }
}
