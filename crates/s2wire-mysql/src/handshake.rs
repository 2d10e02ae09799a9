//! Connection phase: server greeting, optional TLS upgrade, handshake
//! response and the authentication exchange.

use s2wire_core::Result;

use crate::auth::{AuthChannel, AuthContext, AuthPlugin, MORE_DATA, plugins};
use crate::config::MySqlConfig;
use crate::errors::{decode_error_packet, protocol_error, protocol_error_with_data};
use crate::protocol::{OkPacket, PacketReader, PacketWriter, capabilities};
use crate::tls::{build_ssl_request, validate_ssl_mode, validate_tls_config};
use crate::transport::{PacketStream, Socket};

/// Name reported in the `_client_name` connection attribute.
pub const CLIENT_NAME: &str = "s2wire";

/// Server greeting (protocol version 10).
#[derive(Debug, Clone)]
pub struct HandshakeInfo {
    pub protocol_version: u8,
    pub server_version: String,
    pub connection_id: u32,
    /// Scramble: 8 bytes from part 1 plus the rest from part 2
    pub salt: Vec<u8>,
    pub capabilities: u32,
    /// Server default collation id
    pub charset: Option<u8>,
    pub status_flags: u16,
    /// Advertised auth plugin, empty when the server sent none
    pub auth_plugin: String,
}

impl HandshakeInfo {
    /// Parse the initial handshake packet.
    pub fn parse(payload: &[u8]) -> Result<Self> {
        let truncated = || protocol_error_with_data("Truncated server handshake", payload);
        let mut reader = PacketReader::new(payload);

        let protocol_version = reader.read_u8().ok_or_else(truncated)?;
        if protocol_version != 10 {
            return Err(protocol_error(format!(
                "Unsupported protocol version {protocol_version}"
            )));
        }

        let server_version = reader.read_null_string();
        let connection_id = reader.read_u32_le().ok_or_else(truncated)?;
        let mut salt = reader.read_bytes(8).ok_or_else(truncated)?.to_vec();
        reader.skip(1);
        let mut caps = u32::from(reader.read_u16_le().ok_or_else(truncated)?);

        let mut charset = None;
        let mut status_flags = 0;
        let mut salt_len = 12;
        if reader.remaining() >= 6 {
            charset = reader.read_u8();
            status_flags = reader.read_u16_le().unwrap_or_default();
            caps |= u32::from(reader.read_u16_le().unwrap_or_default()) << 16;
            let advertised = usize::from(reader.read_u8().unwrap_or_default());
            salt_len = advertised.saturating_sub(9).max(12);
        }

        reader.skip(10);
        if let Some(part2) = reader.read_bytes(salt_len) {
            salt.extend_from_slice(part2.strip_suffix(&[0]).unwrap_or(part2));
            // NUL after part 2
            reader.skip(1);
        }

        let auth_plugin = if caps & capabilities::CLIENT_PLUGIN_AUTH != 0 {
            reader.read_null_string()
        } else {
            String::new()
        };

        Ok(Self {
            protocol_version,
            server_version,
            connection_id,
            salt,
            capabilities: caps,
            charset,
            status_flags,
            auth_plugin,
        })
    }

    /// Leading number of the server version string.
    pub fn major_version(&self) -> u32 {
        self.server_version
            .split('.')
            .next()
            .and_then(|v| v.trim().parse().ok())
            .unwrap_or(0)
    }

    /// Client flags to send: configured flags limited to what the server offers.
    pub fn negotiate(&self, client_flags: u32) -> u32 {
        let mut flags = client_flags;
        if self.major_version() >= 5 {
            flags |= capabilities::CLIENT_MULTI_RESULTS;
        }
        flags & self.capabilities
    }
}

/// Fields of the handshake response packet.
#[derive(Debug)]
pub struct HandshakeResponse<'a> {
    pub capabilities: u32,
    pub max_packet_size: u32,
    pub charset: u8,
    pub user: &'a str,
    pub auth_response: &'a [u8],
    pub database: Option<&'a str>,
    pub plugin_name: &'a str,
    pub attributes: &'a [(String, String)],
}

impl HandshakeResponse<'_> {
    pub fn encode(&self) -> Vec<u8> {
        let caps = self.capabilities;
        let mut w = PacketWriter::with_capacity(128);
        w.write_u32_le(caps);
        w.write_u32_le(self.max_packet_size);
        w.write_u8(self.charset);
        w.write_zeros(23);
        w.write_null_string(self.user);

        if caps & capabilities::CLIENT_PLUGIN_AUTH_LENENC_CLIENT_DATA != 0 {
            w.write_lenenc_bytes(self.auth_response);
        } else if caps & capabilities::CLIENT_SECURE_CONNECTION != 0 {
            let len = u8::try_from(self.auth_response.len()).unwrap_or(u8::MAX);
            w.write_u8(len);
            w.write_bytes(&self.auth_response[..usize::from(len)]);
        } else {
            w.write_null_bytes(self.auth_response);
        }

        if caps & capabilities::CLIENT_CONNECT_WITH_DB != 0 {
            w.write_null_string(self.database.unwrap_or_default());
        }
        if caps & capabilities::CLIENT_PLUGIN_AUTH != 0 {
            w.write_null_string(self.plugin_name);
        }
        if caps & capabilities::CLIENT_CONNECT_ATTRS != 0 {
            let mut attrs = PacketWriter::new();
            for (key, value) in self.attributes {
                attrs.write_lenenc_string(key);
                attrs.write_lenenc_string(value);
            }
            w.write_lenenc_bytes(attrs.as_bytes());
        }
        w.into_bytes()
    }
}

/// Connection attributes: built-ins first, then caller attributes that do
/// not collide with them (sorted by key).
pub fn connect_attributes(config: &MySqlConfig) -> Vec<(String, String)> {
    let mut attrs = vec![
        ("_os".to_string(), std::env::consts::OS.to_string()),
        ("_pid".to_string(), std::process::id().to_string()),
        ("_client_name".to_string(), CLIENT_NAME.to_string()),
        (
            "_client_version".to_string(),
            env!("CARGO_PKG_VERSION").to_string(),
        ),
    ];
    if let Some(program) = &config.program_name {
        attrs.push(("program_name".to_string(), program.clone()));
    }

    let mut extra: Vec<_> = config
        .attributes
        .iter()
        .filter(|(k, _)| !attrs.iter().any(|(existing, _)| existing == *k))
        .map(|(k, v)| (k.clone(), v.clone()))
        .collect();
    extra.sort();
    attrs.extend(extra);
    attrs
}

/// Drive the reply side of authentication until the server accepts.
///
/// `plugin` is the plugin used for the initial response, if any.
pub fn run_auth<C: AuthChannel>(
    ch: &mut C,
    mut plugin: Option<AuthPlugin>,
    ctx: &mut AuthContext,
    config: &MySqlConfig,
) -> Result<OkPacket> {
    let mut packet = ch.recv()?;
    loop {
        match packet.first().copied() {
            Some(0x00) => {
                return PacketReader::new(&packet)
                    .parse_ok_packet()
                    .ok_or_else(|| protocol_error_with_data("Malformed OK packet", &packet));
            }
            Some(0xFE) => {
                let (next, data) = if packet.len() == 1 {
                    // Pre-4.1 servers ask for the old scramble with a bare 0xFE
                    (AuthPlugin::OldPassword, ctx.salt.clone())
                } else {
                    let mut reader = PacketReader::new(&packet[1..]);
                    let name = reader.read_null_string();
                    let next = AuthPlugin::resolve(&name, &config.auth_plugins)?;
                    (next, reader.read_rest().to_vec())
                };
                tracing::debug!(plugin = next.name(), "auth switch");
                packet = next.switch(ch, ctx, &data)?;
                plugin = Some(next);
            }
            Some(MORE_DATA) => {
                let current = plugin.as_ref().ok_or_else(|| {
                    protocol_error("Received extra auth data before a plugin was selected")
                })?;
                tracing::debug!(plugin = current.name(), "auth more data");
                packet = current.more_data(ch, ctx, &packet)?;
            }
            _ => {
                return Err(protocol_error_with_data(
                    "Unexpected packet during authentication",
                    &packet,
                ));
            }
        }
    }
}

/// Result of a successful connection phase.
#[derive(Debug)]
pub struct Negotiated {
    pub info: HandshakeInfo,
    /// Flags both sides agreed on
    pub capabilities: u32,
    pub status_flags: u16,
    pub secure: bool,
}

/// Run the whole connection phase over a freshly connected socket.
#[tracing::instrument(level = "debug", skip_all, fields(host = %config.display_addr()))]
pub fn perform(
    mut stream: PacketStream<Socket>,
    config: &MySqlConfig,
) -> Result<(PacketStream<Socket>, Negotiated)> {
    let greeting = stream.read_message()?;
    if greeting.first() == Some(&0xFF) {
        return Err(decode_error_packet(&greeting));
    }
    let info = HandshakeInfo::parse(&greeting)?;
    tracing::debug!(
        server_version = %info.server_version,
        connection_id = info.connection_id,
        plugin = %info.auth_plugin,
        "server handshake"
    );

    let charset = u8::try_from(config.charset_id()?).unwrap_or(u8::MAX);
    let mut caps = info.negotiate(config.capability_flags());

    // A Unix socket is already a secure channel
    let wants_tls =
        config.unix_socket.is_none() && validate_ssl_mode(config.ssl_mode, info.capabilities)?;
    let use_tls = wants_tls && (cfg!(feature = "tls") || config.ssl_mode.is_required());
    if use_tls {
        validate_tls_config(config.ssl_mode, &config.tls)?;
        caps |= capabilities::CLIENT_SSL;
        stream.write_message(&build_ssl_request(caps, config.max_allowed_packet, charset))?;
        stream = upgrade_tls(stream, config)?;
    }

    let secure = stream.get_ref().is_secure();
    let mut ctx = AuthContext {
        password: config.password.clone().unwrap_or_default().into_bytes(),
        salt: info.salt.clone(),
        secure,
        server_public_key: config.server_public_key.clone(),
    };

    let plugin = initial_plugin(&info.auth_plugin, config);
    let (auth_response, plugin_name) = match &plugin {
        Some(p) => {
            let name = if info.auth_plugin.is_empty() { "" } else { p.name() };
            (p.initial_response(&ctx)?, name.to_string())
        }
        None => (Vec::new(), String::new()),
    };

    let attributes = connect_attributes(config);
    let response = HandshakeResponse {
        capabilities: caps,
        max_packet_size: config.max_allowed_packet,
        charset,
        user: &config.user,
        auth_response: &auth_response,
        database: config.database.as_deref(),
        plugin_name: &plugin_name,
        attributes: &attributes,
    };
    stream.write_message(&response.encode())?;

    let ok = run_auth(&mut stream, plugin, &mut ctx, config)?;
    tracing::debug!(secure, "authenticated");

    Ok((
        stream,
        Negotiated {
            info,
            capabilities: caps,
            status_flags: ok.status_flags,
            secure,
        },
    ))
}

/// Plugin answering the greeting directly.
///
/// Only password plugins whose response fits the greeting scramble (and
/// plugins with a registered handler) answer up front; anything else gets
/// an empty response and waits for the server's auth switch.
fn initial_plugin(advertised: &str, config: &MySqlConfig) -> Option<AuthPlugin> {
    if advertised.is_empty() {
        return Some(AuthPlugin::NativePassword);
    }
    match AuthPlugin::resolve(advertised, &config.auth_plugins) {
        Ok(
            p @ (AuthPlugin::NativePassword
            | AuthPlugin::CachingSha2Password
            | AuthPlugin::Sha256Password
            | AuthPlugin::Gssapi(_)
            | AuthPlugin::Custom { .. }),
        ) => Some(p),
        Ok(_) => None,
        Err(_) => {
            tracing::debug!(plugin = advertised, "unsupported advertised plugin, awaiting switch");
            None
        }
    }
}

#[cfg(feature = "tls")]
fn upgrade_tls(stream: PacketStream<Socket>, config: &MySqlConfig) -> Result<PacketStream<Socket>> {
    use crate::tls::TlsStream;

    let sequence_id = stream.sequence_id();
    match stream.into_inner() {
        Socket::Tcp(tcp) => {
            let tls = TlsStream::new(tcp, &config.tls, &config.host, config.ssl_mode)?;
            Ok(PacketStream::with_sequence(
                Socket::Tls(Box::new(tls)),
                sequence_id,
            ))
        }
        other => {
            other.shutdown();
            Err(protocol_error("TLS upgrade requires a TCP socket"))
        }
    }
}

#[cfg(not(feature = "tls"))]
fn upgrade_tls(stream: PacketStream<Socket>, config: &MySqlConfig) -> Result<PacketStream<Socket>> {
    let socket = stream.into_inner();
    socket.shutdown();
    crate::tls::TlsStream::new(socket, &config.tls, &config.host, config.ssl_mode)
        .and_then(|_| Err(protocol_error("TLS stream unavailable")))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::charset;

    /// A MySQL 8 style greeting with the given salt and plugin.
    pub(crate) fn greeting(salt: &[u8; 20], plugin: &str) -> Vec<u8> {
        let caps = capabilities::DEFAULT_CLIENT_FLAGS
            | capabilities::CLIENT_CONNECT_WITH_DB
            | capabilities::CLIENT_SSL;
        let mut w = PacketWriter::new();
        w.write_u8(10);
        w.write_null_string("8.0.36");
        w.write_u32_le(42);
        w.write_bytes(&salt[..8]);
        w.write_u8(0);
        w.write_u16_le((caps & 0xFFFF) as u16);
        w.write_u8(255);
        w.write_u16_le(0x0002);
        w.write_u16_le((caps >> 16) as u16);
        w.write_u8(21);
        w.write_zeros(10);
        w.write_bytes(&salt[8..]);
        w.write_u8(0);
        w.write_null_string(plugin);
        w.into_bytes()
    }

    #[test]
    fn test_parse_greeting() {
        let salt = b"abcdefghijklmnopqrst";
        let info = HandshakeInfo::parse(&greeting(salt, "caching_sha2_password")).unwrap();
        assert_eq!(info.protocol_version, 10);
        assert_eq!(info.server_version, "8.0.36");
        assert_eq!(info.connection_id, 42);
        assert_eq!(info.salt, salt);
        assert_eq!(info.charset, Some(255));
        assert_eq!(info.status_flags, 2);
        assert_eq!(info.auth_plugin, "caching_sha2_password");
        assert_eq!(info.major_version(), 8);
        assert!(info.capabilities & capabilities::CLIENT_PLUGIN_AUTH != 0);
    }

    #[test]
    fn test_parse_plugin_name_without_nul() {
        let mut payload = greeting(b"abcdefghijklmnopqrst", "mysql_native_password");
        payload.pop();
        let info = HandshakeInfo::parse(&payload).unwrap();
        assert_eq!(info.auth_plugin, "mysql_native_password");
    }

    #[test]
    fn test_reject_old_protocol() {
        let mut payload = greeting(b"abcdefghijklmnopqrst", "");
        payload[0] = 9;
        assert!(matches!(
            HandshakeInfo::parse(&payload),
            Err(s2wire_core::Error::Protocol(_))
        ));
        assert!(HandshakeInfo::parse(&[10, b'5', 0, 1]).is_err());
    }

    #[test]
    fn test_negotiate_masks_and_adds_multi_results() {
        let info = HandshakeInfo::parse(&greeting(b"abcdefghijklmnopqrst", "")).unwrap();
        let flags = info.negotiate(capabilities::CLIENT_PROTOCOL_41 | capabilities::CLIENT_COMPRESS);
        assert!(flags & capabilities::CLIENT_MULTI_RESULTS != 0);
        assert!(flags & capabilities::CLIENT_COMPRESS == 0);
        assert!(flags & capabilities::CLIENT_PROTOCOL_41 != 0);
    }

    #[test]
    fn test_encode_response_layout() {
        let caps = capabilities::CLIENT_PROTOCOL_41
            | capabilities::CLIENT_SECURE_CONNECTION
            | capabilities::CLIENT_PLUGIN_AUTH
            | capabilities::CLIENT_CONNECT_WITH_DB;
        let attrs = Vec::new();
        let response = HandshakeResponse {
            capabilities: caps,
            max_packet_size: 1 << 24,
            charset: charset::UTF8MB4_GENERAL_CI as u8,
            user: "root",
            auth_response: &[1, 2, 3],
            database: Some("app"),
            plugin_name: "mysql_native_password",
            attributes: &attrs,
        };
        let bytes = response.encode();
        assert_eq!(&bytes[..4], &caps.to_le_bytes());
        assert_eq!(&bytes[4..8], &(1u32 << 24).to_le_bytes());
        assert_eq!(bytes[8], 45);
        assert!(bytes[9..32].iter().all(|&b| b == 0));
        assert_eq!(&bytes[32..37], b"root\0");
        assert_eq!(&bytes[37..41], &[3, 1, 2, 3]);
        assert_eq!(&bytes[41..45], b"app\0");
        assert_eq!(&bytes[45..], b"mysql_native_password\0");
    }

    #[test]
    fn test_encode_lenenc_auth_and_attributes() {
        let caps = capabilities::CLIENT_PROTOCOL_41
            | capabilities::CLIENT_PLUGIN_AUTH_LENENC_CLIENT_DATA
            | capabilities::CLIENT_CONNECT_ATTRS;
        let attrs = vec![("k".to_string(), "v".to_string())];
        let response = HandshakeResponse {
            capabilities: caps,
            max_packet_size: 0,
            charset: 45,
            user: "",
            auth_response: &[9; 20],
            database: None,
            plugin_name: "",
            attributes: &attrs,
        };
        let bytes = response.encode();
        assert_eq!(bytes[33], 20);
        assert_eq!(&bytes[54..], &[4, 1, b'k', 1, b'v']);
    }

    #[test]
    fn test_connect_attributes_keep_builtins() {
        let config = MySqlConfig::new()
            .program_name("etl")
            .attribute("_client_name", "spoofed")
            .attribute("team", "data");
        let attrs = connect_attributes(&config);
        let get = |k: &str| attrs.iter().find(|(key, _)| key == k).map(|(_, v)| v.as_str());
        assert_eq!(get("_client_name"), Some(CLIENT_NAME));
        assert_eq!(get("program_name"), Some("etl"));
        assert_eq!(get("team"), Some("data"));
        assert!(get("_pid").is_some());
        assert_eq!(attrs.iter().filter(|(k, _)| k == "_client_name").count(), 1);
    }

    #[test]
    fn test_initial_plugin_choice() {
        let config = MySqlConfig::new();
        assert!(matches!(
            initial_plugin("", &config),
            Some(AuthPlugin::NativePassword)
        ));
        assert!(matches!(
            initial_plugin(plugins::CACHING_SHA2_PASSWORD, &config),
            Some(AuthPlugin::CachingSha2Password)
        ));
        assert!(initial_plugin(plugins::DIALOG, &config).is_none());
        assert!(initial_plugin("unheard_of", &config).is_none());
    }
}
