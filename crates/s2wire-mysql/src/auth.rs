//! Authentication plugins.
//!
//! Built-in plugins:
//! - `mysql_native_password`: `SHA1(pw) XOR SHA1(seed + SHA1(SHA1(pw)))`
//! - `caching_sha2_password`: `SHA256(pw) XOR SHA256(SHA256(SHA256(pw)) + seed)`,
//!   with full auth over TLS or RSA-OAEP
//! - `sha256_password`: cleartext over TLS, RSA-OAEP otherwise
//! - `mysql_clear_password`: cleartext, secure channels only
//! - `mysql_old_password`: pre-4.1 scramble
//! - `client_ed25519`: Ed25519 signature keyed by the password (`ed25519` feature)
//! - `dialog`: prompt/response rounds
//!
//! `auth_gssapi_client` and any other plugin need an [`AuthHandler`]
//! registered in the config.

use std::collections::HashMap;
use std::io::{Read, Write};
use std::sync::Arc;

use rand::rngs::OsRng;
use rsa::RsaPublicKey;
use rsa::pkcs1::DecodeRsaPublicKey;
use rsa::pkcs8::DecodePublicKey;
use sha1::Sha1;
use sha2::{Digest, Sha256};

use s2wire_core::Result;
use s2wire_core::error::ConnectionErrorKind;

use crate::errors::{auth_error, config_error, connection_error, decode_error_packet, protocol_error};
use crate::transport::PacketStream;

/// Authentication plugin names.
pub mod plugins {
    pub const MYSQL_NATIVE_PASSWORD: &str = "mysql_native_password";
    pub const CACHING_SHA2_PASSWORD: &str = "caching_sha2_password";
    pub const SHA256_PASSWORD: &str = "sha256_password";
    pub const MYSQL_CLEAR_PASSWORD: &str = "mysql_clear_password";
    pub const MYSQL_OLD_PASSWORD: &str = "mysql_old_password";
    pub const CLIENT_ED25519: &str = "client_ed25519";
    pub const AUTH_GSSAPI_CLIENT: &str = "auth_gssapi_client";
    pub const DIALOG: &str = "dialog";
}

/// Status bytes of the caching_sha2_password exchange.
pub mod caching_sha2 {
    pub const REQUEST_PUBLIC_KEY: u8 = 0x02;
    pub const FAST_AUTH_SUCCESS: u8 = 0x03;
    pub const PERFORM_FULL_AUTH: u8 = 0x04;
}

/// First byte of an "extra auth data" packet.
pub const MORE_DATA: u8 = 0x01;

/// Client error code for a plugin that cannot be used.
const CR_AUTH_PLUGIN_CANNOT_LOAD: u16 = 2059;

/// Scramble length used by the 4.1+ password plugins.
const SCRAMBLE_LENGTH: usize = 20;
const SCRAMBLE_LENGTH_323: usize = 8;

/// Caller-supplied implementation of an authentication plugin.
pub trait AuthHandler: Send + Sync {
    /// Answer a server challenge (switch data or extra auth data).
    fn authenticate(&self, data: &[u8]) -> Result<Vec<u8>>;

    /// Answer a `dialog` prompt. The NUL terminator is appended by the caller.
    fn prompt(&self, echo: bool, prompt: &[u8]) -> Result<Vec<u8>> {
        let _ = echo;
        Err(auth_error(format!(
            "Authentication handler cannot answer prompt {:?}",
            String::from_utf8_lossy(prompt)
        )))
    }
}

/// Packet exchange used while authenticating.
pub trait AuthChannel {
    fn send(&mut self, data: &[u8]) -> Result<()>;

    /// Next payload; ERR packets come back as the decoded server error.
    fn recv(&mut self) -> Result<Vec<u8>>;

    fn roundtrip(&mut self, data: &[u8]) -> Result<Vec<u8>> {
        self.send(data)?;
        self.recv()
    }
}

impl<S: Read + Write> AuthChannel for PacketStream<S> {
    fn send(&mut self, data: &[u8]) -> Result<()> {
        self.write_message(data)
    }

    fn recv(&mut self) -> Result<Vec<u8>> {
        let payload = self.read_message()?;
        if payload.first() == Some(&0xFF) {
            return Err(decode_error_packet(&payload));
        }
        Ok(payload)
    }
}

/// Inputs shared by every plugin during one authentication.
#[derive(Debug, Clone)]
pub struct AuthContext {
    pub password: Vec<u8>,
    /// Current scramble; replaced by an auth switch
    pub salt: Vec<u8>,
    /// TLS or Unix socket
    pub secure: bool,
    /// PEM public key, configured or received from the server
    pub server_public_key: Option<Vec<u8>>,
}

/// The closed set of authentication plugins.
#[derive(Clone)]
pub enum AuthPlugin {
    NativePassword,
    CachingSha2Password,
    Sha256Password,
    ClearPassword,
    OldPassword,
    Ed25519,
    Gssapi(Arc<dyn AuthHandler>),
    Dialog(Option<Arc<dyn AuthHandler>>),
    Custom {
        name: String,
        handler: Arc<dyn AuthHandler>,
    },
}

impl std::fmt::Debug for AuthPlugin {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "AuthPlugin({})", self.name())
    }
}

impl AuthPlugin {
    /// Pick the plugin for a server-requested name.
    ///
    /// A registered handler wins over the built-in implementation. Names
    /// with neither are a terminal error.
    pub fn resolve(name: &str, handlers: &HashMap<String, Arc<dyn AuthHandler>>) -> Result<Self> {
        if let Some(handler) = handlers.get(name) {
            let handler = Arc::clone(handler);
            return Ok(match name {
                plugins::DIALOG => AuthPlugin::Dialog(Some(handler)),
                plugins::AUTH_GSSAPI_CLIENT => AuthPlugin::Gssapi(handler),
                _ => AuthPlugin::Custom {
                    name: name.to_string(),
                    handler,
                },
            });
        }

        match name {
            plugins::MYSQL_NATIVE_PASSWORD => Ok(AuthPlugin::NativePassword),
            plugins::CACHING_SHA2_PASSWORD => Ok(AuthPlugin::CachingSha2Password),
            plugins::SHA256_PASSWORD => Ok(AuthPlugin::Sha256Password),
            plugins::MYSQL_CLEAR_PASSWORD => Ok(AuthPlugin::ClearPassword),
            plugins::MYSQL_OLD_PASSWORD => Ok(AuthPlugin::OldPassword),
            plugins::CLIENT_ED25519 => Ok(AuthPlugin::Ed25519),
            plugins::DIALOG => Ok(AuthPlugin::Dialog(None)),
            other => Err(not_configured(other)),
        }
    }

    pub fn name(&self) -> &str {
        match self {
            AuthPlugin::NativePassword => plugins::MYSQL_NATIVE_PASSWORD,
            AuthPlugin::CachingSha2Password => plugins::CACHING_SHA2_PASSWORD,
            AuthPlugin::Sha256Password => plugins::SHA256_PASSWORD,
            AuthPlugin::ClearPassword => plugins::MYSQL_CLEAR_PASSWORD,
            AuthPlugin::OldPassword => plugins::MYSQL_OLD_PASSWORD,
            AuthPlugin::Ed25519 => plugins::CLIENT_ED25519,
            AuthPlugin::Gssapi(_) => plugins::AUTH_GSSAPI_CLIENT,
            AuthPlugin::Dialog(_) => plugins::DIALOG,
            AuthPlugin::Custom { name, .. } => name,
        }
    }

    /// First response for this plugin given the current scramble.
    ///
    /// `dialog` has no initial response; its first round is driven by the
    /// server's prompt.
    pub fn initial_response(&self, ctx: &AuthContext) -> Result<Vec<u8>> {
        match self {
            AuthPlugin::NativePassword => Ok(scramble_native_password(&ctx.password, &ctx.salt)),
            AuthPlugin::CachingSha2Password => Ok(scramble_caching_sha2(&ctx.password, &ctx.salt)),
            AuthPlugin::Sha256Password => {
                if ctx.secure {
                    Ok(with_nul(&ctx.password))
                } else if ctx.password.is_empty() {
                    Ok(vec![0])
                } else if let Some(pem) = &ctx.server_public_key {
                    rsa_encrypt_password(&ctx.password, &ctx.salt, pem)
                } else {
                    Ok(vec![MORE_DATA])
                }
            }
            AuthPlugin::ClearPassword => {
                if ctx.secure {
                    Ok(with_nul(&ctx.password))
                } else {
                    Err(config_error(
                        "mysql_clear_password requires a secure channel (TLS or Unix socket)",
                    ))
                }
            }
            AuthPlugin::OldPassword => {
                let mut data = scramble_old_password(&ctx.password, &ctx.salt);
                data.push(0);
                Ok(data)
            }
            AuthPlugin::Ed25519 => ed25519_password(&ctx.password, &ctx.salt),
            AuthPlugin::Gssapi(handler) | AuthPlugin::Custom { handler, .. } => {
                handler.authenticate(&ctx.salt)
            }
            AuthPlugin::Dialog(_) => Ok(Vec::new()),
        }
    }

    /// Handle an auth switch to this plugin. `data` is the switch payload
    /// after the plugin name. Returns the server's next packet.
    pub fn switch<C: AuthChannel>(
        &self,
        ch: &mut C,
        ctx: &mut AuthContext,
        data: &[u8],
    ) -> Result<Vec<u8>> {
        ctx.salt = strip_nul(data).to_vec();
        match self {
            AuthPlugin::Dialog(handler) => run_dialog(ch, ctx, handler.as_deref(), data),
            AuthPlugin::Sha256Password if !ctx.secure && !ctx.password.is_empty() => {
                match ctx.server_public_key.clone() {
                    Some(pem) => {
                        let encrypted = rsa_encrypt_password(&ctx.password, &ctx.salt, &pem)?;
                        ch.roundtrip(&encrypted)
                    }
                    None => ch.roundtrip(&[MORE_DATA]),
                }
            }
            AuthPlugin::Gssapi(handler) | AuthPlugin::Custom { handler, .. } => {
                let response = handler.authenticate(data)?;
                ch.roundtrip(&response)
            }
            _ => {
                let response = self.initial_response(ctx)?;
                ch.roundtrip(&response)
            }
        }
    }

    /// Handle an extra-auth-data packet (first byte 0x01) for this plugin.
    /// Returns the server's next packet.
    pub fn more_data<C: AuthChannel>(
        &self,
        ch: &mut C,
        ctx: &mut AuthContext,
        packet: &[u8],
    ) -> Result<Vec<u8>> {
        let body = packet.get(1..).unwrap_or_default();
        match self {
            AuthPlugin::CachingSha2Password => caching_sha2_more_data(ch, ctx, body),
            AuthPlugin::Sha256Password => {
                ctx.server_public_key = Some(body.to_vec());
                if ctx.password.is_empty() {
                    return ch.roundtrip(&[]);
                }
                let encrypted = rsa_encrypt_password(&ctx.password, &ctx.salt, body)?;
                ch.roundtrip(&encrypted)
            }
            AuthPlugin::Gssapi(handler) | AuthPlugin::Custom { handler, .. } => {
                let response = handler.authenticate(body)?;
                ch.roundtrip(&response)
            }
            other => Err(auth_error(format!(
                "Received extra packet for auth method '{}'",
                other.name()
            ))),
        }
    }
}

fn caching_sha2_more_data<C: AuthChannel>(
    ch: &mut C,
    ctx: &mut AuthContext,
    body: &[u8],
) -> Result<Vec<u8>> {
    match body.first().copied() {
        Some(caching_sha2::FAST_AUTH_SUCCESS) => {
            tracing::debug!("caching_sha2 fast auth succeeded");
            ch.recv()
        }
        Some(caching_sha2::PERFORM_FULL_AUTH) => {
            tracing::debug!(secure = ctx.secure, "caching_sha2 full auth");
            if ctx.secure {
                return ch.roundtrip(&with_nul(&ctx.password));
            }
            let pem = match ctx.server_public_key.clone() {
                Some(pem) => pem,
                None => {
                    let reply = ch.roundtrip(&[caching_sha2::REQUEST_PUBLIC_KEY])?;
                    if reply.first() != Some(&MORE_DATA) {
                        return Err(protocol_error(format!(
                            "caching sha2: Unknown packet for public key: {:?}",
                            reply.first()
                        )));
                    }
                    let pem = reply[1..].to_vec();
                    ctx.server_public_key = Some(pem.clone());
                    pem
                }
            };
            let encrypted = rsa_encrypt_password(&ctx.password, &ctx.salt, &pem)?;
            ch.roundtrip(&encrypted)
        }
        other => Err(protocol_error(format!(
            "caching sha2: Unknown result for fast auth: {other:?}"
        ))),
    }
}

/// Run `dialog` rounds starting from the first prompt packet.
///
/// Each prompt is `flag` + text; bit 0 of the flag marks the last round.
fn run_dialog<C: AuthChannel>(
    ch: &mut C,
    ctx: &AuthContext,
    handler: Option<&dyn AuthHandler>,
    first: &[u8],
) -> Result<Vec<u8>> {
    let mut packet = first.to_vec();
    loop {
        let Some((&flag, prompt)) = packet.split_first() else {
            return Err(protocol_error("Empty dialog prompt"));
        };
        let echo = flag & 0x06 == 0x02;
        let last = flag & 0x01 == 0x01;
        tracing::debug!(echo, last, "dialog prompt");

        let response = if prompt == b"Password: " {
            with_nul(&ctx.password)
        } else if let Some(handler) = handler {
            with_nul(&handler.prompt(echo, prompt)?)
        } else {
            return Err(not_configured(plugins::DIALOG));
        };

        let reply = ch.roundtrip(&response)?;
        if reply.first() == Some(&0x00) || last {
            return Ok(reply);
        }
        packet = reply;
    }
}

pub(crate) fn not_configured(name: &str) -> s2wire_core::Error {
    connection_error(
        ConnectionErrorKind::Authentication,
        Some(CR_AUTH_PLUGIN_CANNOT_LOAD),
        format!("Authentication plugin '{name}' not configured"),
    )
}

fn with_nul(data: &[u8]) -> Vec<u8> {
    let mut out = Vec::with_capacity(data.len() + 1);
    out.extend_from_slice(data);
    out.push(0);
    out
}

fn strip_nul(data: &[u8]) -> &[u8] {
    data.strip_suffix(&[0]).unwrap_or(data)
}

/// Compute the mysql_native_password response.
///
/// Empty password gives an empty response.
pub fn scramble_native_password(password: &[u8], salt: &[u8]) -> Vec<u8> {
    if password.is_empty() {
        return vec![];
    }
    let seed = &salt[..salt.len().min(SCRAMBLE_LENGTH)];

    let stage1: [u8; 20] = Sha1::digest(password).into();
    let stage2: [u8; 20] = Sha1::digest(stage1).into();

    let mut hasher = Sha1::new();
    hasher.update(seed);
    hasher.update(stage2);
    let stage3: [u8; 20] = hasher.finalize().into();

    stage1.iter().zip(stage3.iter()).map(|(a, b)| a ^ b).collect()
}

/// Compute the caching_sha2_password fast-auth response.
///
/// Empty password gives an empty response.
pub fn scramble_caching_sha2(password: &[u8], salt: &[u8]) -> Vec<u8> {
    if password.is_empty() {
        return vec![];
    }
    let seed = strip_nul(salt);

    let p1: [u8; 32] = Sha256::digest(password).into();
    let p2: [u8; 32] = Sha256::digest(p1).into();

    let mut hasher = Sha256::new();
    hasher.update(p2);
    hasher.update(seed);
    let p3: [u8; 32] = hasher.finalize().into();

    p1.iter().zip(p3.iter()).map(|(a, b)| a ^ b).collect()
}

/// RSA-OAEP(SHA1) of `password + NUL` XORed with the scramble.
pub fn rsa_encrypt_password(password: &[u8], salt: &[u8], public_key_pem: &[u8]) -> Result<Vec<u8>> {
    let seed = &salt[..salt.len().min(SCRAMBLE_LENGTH)];
    if seed.is_empty() {
        return Err(auth_error("Cannot encrypt password: empty scramble"));
    }

    let mut message = with_nul(password);
    for (i, b) in message.iter_mut().enumerate() {
        *b ^= seed[i % seed.len()];
    }

    let pem = std::str::from_utf8(public_key_pem)
        .map_err(|e| auth_error(format!("Public key is not valid UTF-8 PEM: {e}")))?;
    let key = RsaPublicKey::from_public_key_pem(pem.trim())
        .or_else(|_| RsaPublicKey::from_pkcs1_pem(pem.trim()))
        .map_err(|e| auth_error(format!("Failed to parse RSA public key PEM: {e}")))?;

    key.encrypt(&mut OsRng, rsa::Oaep::new::<Sha1>(), &message)
        .map_err(|e| auth_error(format!("RSA OAEP encryption failed: {e}")))
}

/// Pre-4.1 password hash: two 31-bit words.
fn hash_password_323(password: &[u8]) -> (u64, u64) {
    let mut nr: u64 = 1_345_345_333;
    let mut add: u64 = 7;
    let mut nr2: u64 = 0x1234_5671;

    for &c in password.iter().filter(|&&c| c != b' ' && c != b'\t') {
        let c = u64::from(c);
        nr ^= ((((nr & 63) + add) * c) + (nr << 8)) & 0xFFFF_FFFF;
        nr2 = (nr2 + ((nr2 << 8) ^ nr)) & 0xFFFF_FFFF;
        add = (add + c) & 0xFFFF_FFFF;
    }

    (nr & 0x7FFF_FFFF, nr2 & 0x7FFF_FFFF)
}

/// Linear congruential generator used by the pre-4.1 scramble.
struct Rand323 {
    seed1: u64,
    seed2: u64,
}

impl Rand323 {
    const MAX_VALUE: u64 = 0x3FFF_FFFF;

    fn new(seed1: u64, seed2: u64) -> Self {
        Self {
            seed1: seed1 % Self::MAX_VALUE,
            seed2: seed2 % Self::MAX_VALUE,
        }
    }

    #[allow(clippy::cast_precision_loss)]
    fn next_value(&mut self) -> f64 {
        self.seed1 = (self.seed1 * 3 + self.seed2) % Self::MAX_VALUE;
        self.seed2 = (self.seed1 + self.seed2 + 33) % Self::MAX_VALUE;
        self.seed1 as f64 / Self::MAX_VALUE as f64
    }
}

/// Compute the mysql_old_password scramble (without the NUL terminator).
#[allow(clippy::cast_possible_truncation, clippy::cast_sign_loss)]
pub fn scramble_old_password(password: &[u8], salt: &[u8]) -> Vec<u8> {
    let message = &salt[..salt.len().min(SCRAMBLE_LENGTH_323)];
    let (p1, p2) = hash_password_323(password);
    let (m1, m2) = hash_password_323(message);
    let mut rng = Rand323::new(p1 ^ m1, p2 ^ m2);

    let mut out: Vec<u8> = (0..message.len())
        .map(|_| (rng.next_value() * 31.0) as u8 + 64)
        .collect();
    let extra = (rng.next_value() * 31.0) as u8;
    for b in &mut out {
        *b ^= extra;
    }
    out
}

/// MariaDB `client_ed25519`: Ed25519 signature of the scramble, with the
/// expanded secret key derived as `SHA512(password)`.
#[cfg(feature = "ed25519")]
pub fn ed25519_password(password: &[u8], scramble: &[u8]) -> Result<Vec<u8>> {
    use ed25519_dalek::VerifyingKey;
    use ed25519_dalek::hazmat::{ExpandedSecretKey, raw_sign};
    use sha2::Sha512;

    let expanded: [u8; 64] = Sha512::digest(password).into();
    let esk = ExpandedSecretKey::from_bytes(&expanded);
    let verifying_key = VerifyingKey::from(&esk);
    Ok(raw_sign::<Sha512>(&esk, scramble, &verifying_key)
        .to_bytes()
        .to_vec())
}

#[cfg(not(feature = "ed25519"))]
pub fn ed25519_password(_password: &[u8], _scramble: &[u8]) -> Result<Vec<u8>> {
    Err(auth_error(
        "client_ed25519 authentication requires the 'ed25519' feature of s2wire-mysql",
    ))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::VecDeque;

    /// Scripted server: records sent packets and replays canned replies.
    struct Script {
        sent: Vec<Vec<u8>>,
        replies: VecDeque<Vec<u8>>,
    }

    impl Script {
        fn new(replies: Vec<Vec<u8>>) -> Self {
            Self {
                sent: Vec::new(),
                replies: replies.into(),
            }
        }
    }

    impl AuthChannel for Script {
        fn send(&mut self, data: &[u8]) -> Result<()> {
            self.sent.push(data.to_vec());
            Ok(())
        }

        fn recv(&mut self) -> Result<Vec<u8>> {
            self.replies
                .pop_front()
                .ok_or_else(|| protocol_error("script exhausted"))
        }
    }

    struct Answer(&'static [u8]);

    impl AuthHandler for Answer {
        fn authenticate(&self, data: &[u8]) -> Result<Vec<u8>> {
            let mut out = self.0.to_vec();
            out.extend_from_slice(data);
            Ok(out)
        }

        fn prompt(&self, _echo: bool, _prompt: &[u8]) -> Result<Vec<u8>> {
            Ok(self.0.to_vec())
        }
    }

    const OK: &[u8] = &[0x00, 0x00, 0x00, 0x02, 0x00, 0x00, 0x00];

    fn ctx(password: &str, secure: bool) -> AuthContext {
        AuthContext {
            password: password.as_bytes().to_vec(),
            salt: b"abcdefghijklmnopqrst".to_vec(),
            secure,
            server_public_key: None,
        }
    }

    #[test]
    fn test_native_password_empty() {
        assert!(scramble_native_password(b"", &[0; 20]).is_empty());
    }

    #[test]
    fn test_native_password_is_xor_of_stages() {
        let salt = b"01234567890123456789";
        let result = scramble_native_password(b"secret", salt);
        assert_eq!(result.len(), 20);

        // Server-side check: SHA1(result XOR SHA1(salt + stored)) == stored
        let stage1: [u8; 20] = Sha1::digest(b"secret").into();
        let stored: [u8; 20] = Sha1::digest(stage1).into();
        let mut h = Sha1::new();
        h.update(salt);
        h.update(stored);
        let mask: [u8; 20] = h.finalize().into();
        let recovered: Vec<u8> = result.iter().zip(mask.iter()).map(|(a, b)| a ^ b).collect();
        assert_eq!(&Sha1::digest(&recovered)[..], &stored[..]);
    }

    #[test]
    fn test_native_password_ignores_salt_tail() {
        let mut salt = b"01234567890123456789".to_vec();
        let short = scramble_native_password(b"pw", &salt);
        salt.push(0);
        assert_eq!(scramble_native_password(b"pw", &salt), short);
    }

    #[test]
    fn test_caching_sha2_deterministic() {
        let salt = [7u8; 20];
        let a = scramble_caching_sha2(b"secret", &salt);
        let b = scramble_caching_sha2(b"secret", &salt);
        assert_eq!(a.len(), 32);
        assert_eq!(a, b);
        assert_ne!(a, scramble_caching_sha2(b"secret2", &salt));
        assert!(scramble_caching_sha2(b"", &salt).is_empty());

        let mut with_nul = salt.to_vec();
        with_nul.push(0);
        assert_eq!(scramble_caching_sha2(b"secret", &with_nul), a);
    }

    #[test]
    fn test_old_password_shape() {
        let a = scramble_old_password(b"secret", b"abcdefgh12345");
        assert_eq!(a.len(), 8);
        assert_eq!(a, scramble_old_password(b"secret", b"abcdefgh"));
        assert_ne!(a, scramble_old_password(b"secreT", b"abcdefgh"));
        // Spaces and tabs are ignored by the hash
        assert_eq!(hash_password_323(b"se cret"), hash_password_323(b"secret"));
        assert_eq!(hash_password_323(b""), (1_345_345_333, 0x1234_5671));
    }

    #[test]
    fn test_resolve_builtin_and_unknown() {
        let handlers = HashMap::new();
        let plugin = AuthPlugin::resolve("caching_sha2_password", &handlers).unwrap();
        assert_eq!(plugin.name(), "caching_sha2_password");
        assert!(matches!(
            AuthPlugin::resolve("dialog", &handlers).unwrap(),
            AuthPlugin::Dialog(None)
        ));

        let err = AuthPlugin::resolve("auth_gssapi_client", &handlers).unwrap_err();
        assert_eq!(
            err.to_string(),
            "Connection error (2059): Authentication plugin 'auth_gssapi_client' not configured"
        );
        assert!(AuthPlugin::resolve("made_up", &handlers).is_err());
    }

    #[test]
    fn test_resolve_prefers_registered_handler() {
        let mut handlers: HashMap<String, Arc<dyn AuthHandler>> = HashMap::new();
        handlers.insert("mysql_native_password".to_string(), Arc::new(Answer(b"x")));
        handlers.insert("auth_gssapi_client".to_string(), Arc::new(Answer(b"k")));
        assert!(matches!(
            AuthPlugin::resolve("mysql_native_password", &handlers).unwrap(),
            AuthPlugin::Custom { .. }
        ));
        assert!(matches!(
            AuthPlugin::resolve("auth_gssapi_client", &handlers).unwrap(),
            AuthPlugin::Gssapi(_)
        ));
    }

    #[test]
    fn test_clear_password_requires_secure_channel() {
        let err = AuthPlugin::ClearPassword
            .initial_response(&ctx("secret", false))
            .unwrap_err();
        assert!(matches!(err, s2wire_core::Error::Config(_)));

        let data = AuthPlugin::ClearPassword
            .initial_response(&ctx("secret", true))
            .unwrap();
        assert_eq!(data, b"secret\0");
    }

    #[test]
    fn test_sha256_initial_response() {
        let plugin = AuthPlugin::Sha256Password;
        assert_eq!(plugin.initial_response(&ctx("pw", true)).unwrap(), b"pw\0");
        assert_eq!(plugin.initial_response(&ctx("pw", false)).unwrap(), vec![MORE_DATA]);
        assert_eq!(plugin.initial_response(&ctx("", false)).unwrap(), vec![0]);
    }

    #[test]
    fn test_caching_sha2_fast_success_reads_final_ok() {
        let mut ch = Script::new(vec![OK.to_vec()]);
        let mut c = ctx("secret", false);
        let reply = AuthPlugin::CachingSha2Password
            .more_data(&mut ch, &mut c, &[MORE_DATA, caching_sha2::FAST_AUTH_SUCCESS])
            .unwrap();
        assert_eq!(reply, OK);
        assert!(ch.sent.is_empty());
    }

    #[test]
    fn test_caching_sha2_full_auth_over_tls_sends_cleartext() {
        let mut ch = Script::new(vec![OK.to_vec()]);
        let mut c = ctx("secret", true);
        AuthPlugin::CachingSha2Password
            .more_data(&mut ch, &mut c, &[MORE_DATA, caching_sha2::PERFORM_FULL_AUTH])
            .unwrap();
        assert_eq!(ch.sent, vec![b"secret\0".to_vec()]);
    }

    #[test]
    fn test_caching_sha2_full_auth_requests_key() {
        // Server answers the key request with garbage instead of a PEM
        let mut ch = Script::new(vec![vec![MORE_DATA, b'n', b'o']]);
        let mut c = ctx("secret", false);
        let err = AuthPlugin::CachingSha2Password
            .more_data(&mut ch, &mut c, &[MORE_DATA, caching_sha2::PERFORM_FULL_AUTH])
            .unwrap_err();
        assert_eq!(ch.sent, vec![vec![caching_sha2::REQUEST_PUBLIC_KEY]]);
        assert!(err.to_string().contains("RSA public key"));
    }

    #[test]
    fn test_caching_sha2_unknown_status() {
        let mut ch = Script::new(vec![]);
        let mut c = ctx("secret", false);
        let err = AuthPlugin::CachingSha2Password
            .more_data(&mut ch, &mut c, &[MORE_DATA, 0x09])
            .unwrap_err();
        assert!(matches!(err, s2wire_core::Error::Protocol(_)));
    }

    #[test]
    fn test_extra_packet_for_native_is_error() {
        let mut ch = Script::new(vec![]);
        let mut c = ctx("secret", false);
        let err = AuthPlugin::NativePassword
            .more_data(&mut ch, &mut c, &[MORE_DATA, 1])
            .unwrap_err();
        assert!(err.to_string().contains("mysql_native_password"));
    }

    #[test]
    fn test_switch_replaces_salt() {
        let mut ch = Script::new(vec![OK.to_vec()]);
        let mut c = ctx("secret", false);
        let mut data = b"98765432109876543210".to_vec();
        data.push(0);
        AuthPlugin::NativePassword.switch(&mut ch, &mut c, &data).unwrap();
        assert_eq!(c.salt, b"98765432109876543210");
        assert_eq!(
            ch.sent,
            vec![scramble_native_password(b"secret", b"98765432109876543210")]
        );
    }

    #[test]
    fn test_dialog_password_prompt() {
        let mut ch = Script::new(vec![OK.to_vec()]);
        let mut c = ctx("secret", false);
        let mut first = vec![0x03];
        first.extend_from_slice(b"Password: ");
        AuthPlugin::Dialog(None).switch(&mut ch, &mut c, &first).unwrap();
        assert_eq!(ch.sent, vec![b"secret\0".to_vec()]);
    }

    #[test]
    fn test_dialog_custom_prompt_without_handler() {
        let mut ch = Script::new(vec![]);
        let mut c = ctx("secret", false);
        let mut first = vec![0x02];
        first.extend_from_slice(b"OTP: ");
        let err = AuthPlugin::Dialog(None)
            .switch(&mut ch, &mut c, &first)
            .unwrap_err();
        assert!(err.to_string().contains("'dialog' not configured"));
    }

    #[test]
    fn test_dialog_multiple_rounds_with_handler() {
        let mut second = vec![0x01];
        second.extend_from_slice(b"OTP: ");
        let mut ch = Script::new(vec![second, OK.to_vec()]);
        let mut c = ctx("secret", false);
        let mut first = vec![0x02];
        first.extend_from_slice(b"Password: ");
        let handler: Arc<dyn AuthHandler> = Arc::new(Answer(b"123456"));
        let reply = AuthPlugin::Dialog(Some(handler))
            .switch(&mut ch, &mut c, &first)
            .unwrap();
        assert_eq!(reply, OK);
        assert_eq!(ch.sent, vec![b"secret\0".to_vec(), b"123456\0".to_vec()]);
    }

    #[test]
    fn test_custom_handler_receives_switch_data() {
        let mut ch = Script::new(vec![OK.to_vec()]);
        let mut c = ctx("", false);
        let plugin = AuthPlugin::Custom {
            name: "token_auth".to_string(),
            handler: Arc::new(Answer(b"tok:")),
        };
        plugin.switch(&mut ch, &mut c, b"nonce\0").unwrap();
        assert_eq!(ch.sent, vec![b"tok:nonce\0".to_vec()]);
    }

    #[cfg(feature = "ed25519")]
    #[test]
    fn test_ed25519_signature_verifies() {
        use ed25519_dalek::hazmat::ExpandedSecretKey;
        use ed25519_dalek::{Signature, VerifyingKey};
        use sha2::Sha512;

        let scramble = b"0123456789abcdef0123456789abcdef";
        let sig = ed25519_password(b"secret", scramble).unwrap();
        assert_eq!(sig.len(), 64);

        let expanded: [u8; 64] = Sha512::digest(b"secret").into();
        let vk = VerifyingKey::from(&ExpandedSecretKey::from_bytes(&expanded));
        let sig = Signature::from_slice(&sig).unwrap();
        assert!(vk.verify_strict(scramble, &sig).is_ok());
    }

    #[cfg(not(feature = "ed25519"))]
    #[test]
    fn test_ed25519_needs_feature() {
        let err = AuthPlugin::Ed25519
            .initial_response(&ctx("secret", false))
            .unwrap_err();
        assert!(err.to_string().contains("ed25519"));
    }
}
