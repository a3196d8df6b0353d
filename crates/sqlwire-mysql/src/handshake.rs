//! Connection handshake: greeting, capability negotiation and the
//! authentication exchange.
//!
//! ```text
//! server                          client
//!   greeting (seq 0)        ->
//!                           <-    [SSL request (seq 1), TLS handshake]
//!                           <-    handshake response
//!   OK | ERR | auth switch  ->
//!   | more data (0x01)
//! ```

use std::collections::BTreeMap;

use sqlwire_core::{ConnectionErrorKind, Error, ProtocolErrorKind, Result};

use crate::auth::{self, AuthPlugin, AuthSession, auth_error, caching_sha2};
use crate::config::MySqlConfig;
use crate::protocol::{
    Command, ErrPacket, OkPacket, PacketReader, PacketWriter, ServerStatus, capabilities,
};
use crate::stream::{Channel, PacketStream};

/// The only handshake protocol version this driver speaks.
pub const PROTOCOL_VERSION: u8 = 10;

/// `max_packet_size` announced in the handshake response.
pub const CLIENT_MAX_PACKET: u32 = 0xFF_FF_FF;

/// ER_MUST_CHANGE_PASSWORD_LOGIN
pub const ER_MUST_CHANGE_PASSWORD_LOGIN: u16 = 1862;
/// ER_MUST_CHANGE_PASSWORD
pub const ER_MUST_CHANGE_PASSWORD: u16 = 1820;

/// Initial handshake packet sent by the server.
#[derive(Debug, Clone)]
pub struct Greeting {
    pub protocol_version: u8,
    pub server_version: String,
    /// `(major, minor, patch)` parsed from `server_version`
    pub version: (u16, u16, u16),
    /// Connection id, the target of `KILL QUERY`
    pub thread_id: u32,
    /// Auth data part 1 followed by part 2, trailing NUL stripped
    pub scramble: Vec<u8>,
    pub capabilities: u32,
    pub charset: u8,
    pub status: ServerStatus,
    /// Empty when the server does not advertise `CLIENT_PLUGIN_AUTH`
    pub auth_plugin: String,
}

impl Greeting {
    pub fn parse(payload: &[u8]) -> Result<Self> {
        let mut reader = PacketReader::new(payload);

        let protocol_version = reader.read_u8()?;
        if protocol_version != PROTOCOL_VERSION {
            return Err(Error::connection(
                ConnectionErrorKind::Unsupported,
                format!("unsupported handshake protocol version {protocol_version}"),
            ));
        }

        let server_version = reader.read_null_string();
        let thread_id = reader.read_u32_le()?;
        let mut scramble = reader.read_bytes(8)?.to_vec();
        reader.skip(1)?;

        let mut capabilities = u32::from(reader.read_u16_le()?);
        let mut charset = 0;
        let mut status = ServerStatus::default();
        let mut auth_plugin = String::new();

        if !reader.is_empty() {
            charset = reader.read_u8()?;
            status = ServerStatus(reader.read_u16_le()?);
            capabilities |= u32::from(reader.read_u16_le()?) << 16;
            let auth_data_len = reader.read_u8()?;
            reader.skip(10)?;

            if capabilities & capabilities::CLIENT_SECURE_CONNECTION != 0 {
                let len = usize::from(auth_data_len).saturating_sub(8).max(13);
                let part2 = reader.read_bytes(len.min(reader.remaining()))?;
                scramble.extend_from_slice(part2);
                if scramble.last() == Some(&0) {
                    scramble.pop();
                }
            }

            if capabilities & capabilities::CLIENT_PLUGIN_AUTH != 0 {
                auth_plugin = reader.read_null_string();
            }
        }

        Ok(Self {
            protocol_version,
            version: parse_version(&server_version),
            server_version,
            thread_id,
            scramble,
            capabilities,
            charset,
            status,
            auth_plugin,
        })
    }

    pub fn version_at_least(&self, major: u16, minor: u16, patch: u16) -> bool {
        self.version >= (major, minor, patch)
    }
}

/// Parse the leading `major.minor.patch` of a server version string.
///
/// MariaDB prefixes its real version with `5.5.5-` for old clients.
pub fn parse_version(version: &str) -> (u16, u16, u16) {
    let version = version.strip_prefix("5.5.5-").unwrap_or(version);
    let numeric = version
        .split(|c: char| !(c.is_ascii_digit() || c == '.'))
        .next()
        .unwrap_or("");
    let mut parts = numeric.split('.').map(|p| p.parse::<u16>().unwrap_or(0));
    (
        parts.next().unwrap_or(0),
        parts.next().unwrap_or(0),
        parts.next().unwrap_or(0),
    )
}

/// Capability flags the client requests, given what the server offers.
pub fn client_flags(config: &MySqlConfig, server_caps: u32) -> u32 {
    use crate::protocol::capabilities as cap;

    let mut flags = cap::CLIENT_MULTI_RESULTS
        | cap::CLIENT_PROTOCOL_41
        | cap::CLIENT_TRANSACTIONS
        | cap::CLIENT_LONG_PASSWORD
        | cap::CLIENT_SESSION_TRACK;

    if config.local_infile {
        flags |= cap::CLIENT_LOCAL_FILES;
    }
    if !config.use_affected_rows {
        flags |= cap::CLIENT_FOUND_ROWS;
    }
    if config.allow_batch {
        flags |= cap::CLIENT_MULTI_STATEMENTS;
    }
    if config.interactive {
        flags |= cap::CLIENT_INTERACTIVE;
    }

    let mut wanted = cap::CLIENT_LONG_FLAG
        | cap::CLIENT_SECURE_CONNECTION
        | cap::CLIENT_PS_MULTI_RESULTS
        | cap::CLIENT_PLUGIN_AUTH
        | cap::CLIENT_CONNECT_ATTRS
        | cap::CLIENT_CAN_HANDLE_EXPIRED_PASSWORDS
        | cap::CLIENT_QUERY_ATTRIBUTES;
    if config.compression {
        wanted |= cap::CLIENT_COMPRESS;
    }
    if config.database.as_deref().is_some_and(|db| !db.is_empty()) {
        wanted |= cap::CLIENT_CONNECT_WITH_DB;
    }
    if config.ssl_mode.should_try_ssl() {
        wanted |= cap::CLIENT_SSL;
    }

    flags | (wanted & server_caps)
}

/// Connection attributes: the driver's own plus the configured extras.
pub fn connect_attributes(config: &MySqlConfig) -> BTreeMap<String, String> {
    let mut attrs = BTreeMap::new();
    attrs.insert("_client_name".to_string(), "sqlwire-mysql".to_string());
    attrs.insert(
        "_client_version".to_string(),
        env!("CARGO_PKG_VERSION").to_string(),
    );
    attrs.insert("_os".to_string(), std::env::consts::OS.to_string());
    attrs.insert("_pid".to_string(), std::process::id().to_string());
    attrs.insert("_platform".to_string(), std::env::consts::ARCH.to_string());
    for (key, value) in &config.attributes {
        attrs.insert(key.clone(), value.clone());
    }
    attrs
}

fn write_attributes(writer: &mut PacketWriter, attributes: &BTreeMap<String, String>) {
    let mut block = PacketWriter::new();
    for (key, value) in attributes {
        block.write_lenenc_string(key);
        block.write_lenenc_string(value);
    }
    writer.write_lenenc_bytes(block.as_bytes());
}

/// HandshakeResponse41.
#[derive(Debug, Clone)]
pub struct HandshakeResponse<'a> {
    pub capabilities: u32,
    pub max_packet_size: u32,
    pub charset: u8,
    pub user: &'a str,
    pub auth_response: &'a [u8],
    pub database: Option<&'a str>,
    pub auth_plugin: &'a str,
    pub attributes: &'a BTreeMap<String, String>,
}

impl HandshakeResponse<'_> {
    pub fn encode(&self) -> Vec<u8> {
        let caps = self.capabilities;
        let mut writer = PacketWriter::with_capacity(128);
        writer.write_u32_le(caps);
        writer.write_u32_le(self.max_packet_size);
        writer.write_u8(self.charset);
        writer.write_zeros(23);
        writer.write_null_string(self.user);

        if caps & capabilities::CLIENT_PLUGIN_AUTH_LENENC_CLIENT_DATA != 0 {
            writer.write_lenenc_bytes(self.auth_response);
        } else if caps & capabilities::CLIENT_SECURE_CONNECTION != 0 {
            writer.write_u8(self.auth_response.len() as u8);
            writer.write_bytes(self.auth_response);
        } else {
            writer.write_null_bytes(self.auth_response);
        }

        if caps & capabilities::CLIENT_CONNECT_WITH_DB != 0 {
            writer.write_null_string(self.database.unwrap_or(""));
        }
        if caps & capabilities::CLIENT_PLUGIN_AUTH != 0 {
            writer.write_null_string(self.auth_plugin);
        }
        if caps & capabilities::CLIENT_CONNECT_ATTRS != 0 {
            write_attributes(&mut writer, self.attributes);
        }
        writer.into_bytes()
    }
}

/// `COM_CHANGE_USER` payload.
#[derive(Debug, Clone)]
pub struct ChangeUser<'a> {
    pub capabilities: u32,
    pub charset: u8,
    pub user: &'a str,
    pub auth_response: &'a [u8],
    pub database: Option<&'a str>,
    pub auth_plugin: &'a str,
    pub attributes: &'a BTreeMap<String, String>,
}

impl ChangeUser<'_> {
    pub fn encode(&self) -> Vec<u8> {
        let caps = self.capabilities;
        let mut writer = PacketWriter::command(Command::ChangeUser);
        writer.write_null_string(self.user);
        if caps & capabilities::CLIENT_SECURE_CONNECTION != 0 {
            writer.write_u8(self.auth_response.len() as u8);
            writer.write_bytes(self.auth_response);
        } else {
            writer.write_null_bytes(self.auth_response);
        }
        writer.write_null_string(self.database.unwrap_or(""));
        writer.write_u16_le(u16::from(self.charset));
        if caps & capabilities::CLIENT_PLUGIN_AUTH != 0 {
            writer.write_null_string(self.auth_plugin);
        }
        if caps & capabilities::CLIENT_CONNECT_ATTRS != 0 {
            write_attributes(&mut writer, self.attributes);
        }
        writer.into_bytes()
    }
}

/// Map an ERR packet received during login.
pub fn login_error(err: ErrPacket) -> Error {
    let kind = if err.error_code == ER_MUST_CHANGE_PASSWORD_LOGIN {
        ConnectionErrorKind::PasswordExpired
    } else {
        ConnectionErrorKind::Authentication
    };
    let state = err.sql_state.as_deref().unwrap_or("HY000");
    Error::connection(
        kind,
        format!("{} ({}, SQLSTATE {})", err.error_message, err.error_code, state),
    )
}

/// Result of a finished authentication exchange.
#[derive(Debug, Clone)]
pub struct AuthOutcome {
    pub ok: OkPacket,
    /// Plugin in effect when the server accepted the credentials
    pub plugin: AuthPlugin,
    pub scramble: Vec<u8>,
}

/// Drive the exchange that follows a handshake response or
/// `COM_CHANGE_USER` until the server accepts or rejects it.
pub(crate) fn authenticate<S: Channel>(
    stream: &mut PacketStream<S>,
    mut session: AuthSession,
    password: &str,
) -> Result<AuthOutcome> {
    loop {
        let packet = stream.read_packet()?;
        match packet.first().copied() {
            Some(0x00) => {
                return Ok(AuthOutcome {
                    ok: OkPacket::parse(&packet)?,
                    plugin: session.plugin,
                    scramble: session.scramble,
                });
            }
            Some(0xFF) => return Err(login_error(ErrPacket::parse(&packet)?)),
            Some(0xFE) => {
                if packet.len() == 1 {
                    return Err(Error::connection(
                        ConnectionErrorKind::Unsupported,
                        "server requested pre-4.1 password authentication",
                    ));
                }
                let mut reader = PacketReader::new(&packet[1..]);
                let name = reader.read_null_string();
                let mut data = reader.read_rest().to_vec();
                if data.last() == Some(&0) {
                    data.pop();
                }
                let next = AuthPlugin::from_name(&name)?;
                tracing::debug!(
                    from = session.plugin.name(),
                    to = next.name(),
                    "auth plugin switch"
                );
                session.switch(next, data);
                let secure = stream.get_ref().is_secure();
                let response = session.initial_response(password, secure)?;
                stream.send_packet(&response)?;
            }
            Some(0x01) => more_data(stream, &mut session, password, &packet[1..])?,
            _ => {
                return Err(Error::protocol(
                    ProtocolErrorKind::UnexpectedPacket,
                    format!(
                        "unexpected packet during authentication (header 0x{:02X})",
                        packet.first().copied().unwrap_or(0)
                    ),
                ));
            }
        }
    }
}

/// Handle an AuthMoreData packet (`0x01` already stripped).
fn more_data<S: Channel>(
    stream: &mut PacketStream<S>,
    session: &mut AuthSession,
    password: &str,
    data: &[u8],
) -> Result<()> {
    let secure = stream.get_ref().is_secure();
    match session.plugin {
        AuthPlugin::CachingSha2 => match data.first().copied() {
            Some(caching_sha2::FAST_AUTH_SUCCESS) => Ok(()),
            Some(caching_sha2::PERFORM_FULL_AUTH) => {
                if secure || password.is_empty() {
                    return stream.send_packet(&auth::cleartext_password(password));
                }
                stream.send_packet(&[caching_sha2::REQUEST_PUBLIC_KEY])?;
                let key = stream.read_packet()?;
                match key.split_first() {
                    Some((0x01, pem)) => send_encrypted(stream, password, &session.scramble, pem),
                    Some((0xFF, _)) => Err(login_error(ErrPacket::parse(&key)?)),
                    _ => Err(auth_error("server did not send its RSA public key")),
                }
            }
            _ => Err(auth_error("unexpected caching_sha2_password state")),
        },
        AuthPlugin::Sha256 => send_encrypted(stream, password, &session.scramble, data),
        // An established context has nothing left to send; the OK follows.
        AuthPlugin::Windows => match session.windows_step(data)? {
            Some(token) => stream.send_packet(&token),
            None => Ok(()),
        },
        plugin => Err(Error::protocol(
            ProtocolErrorKind::UnexpectedPacket,
            format!("unexpected auth data for {}", plugin.name()),
        )),
    }
}

fn send_encrypted<S: Channel>(
    stream: &mut PacketStream<S>,
    password: &str,
    scramble: &[u8],
    pem: &[u8],
) -> Result<()> {
    let encrypted = auth::encrypt_password_rsa(password, scramble, pem)?;
    stream.send_packet(&encrypted)
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::stream::tests::{MockChannel, frame};
    use rand::rngs::OsRng;
    use rsa::RsaPrivateKey;
    use rsa::pkcs8::{EncodePublicKey, LineEnding};
    use sha1::Sha1;

    pub(crate) const SCRAMBLE: [u8; 20] = [
        0x3a, 0x51, 0x2c, 0x6e, 0x11, 0x07, 0x42, 0x5d, 0x68, 0x7c, 0x24, 0x19, 0x33, 0x55, 0x60,
        0x4b, 0x2f, 0x01, 0x18, 0x72,
    ];

    pub(crate) const SERVER_CAPS: u32 = capabilities::CLIENT_LONG_PASSWORD
        | capabilities::CLIENT_LONG_FLAG
        | capabilities::CLIENT_CONNECT_WITH_DB
        | capabilities::CLIENT_PROTOCOL_41
        | capabilities::CLIENT_TRANSACTIONS
        | capabilities::CLIENT_SECURE_CONNECTION
        | capabilities::CLIENT_MULTI_STATEMENTS
        | capabilities::CLIENT_MULTI_RESULTS
        | capabilities::CLIENT_PS_MULTI_RESULTS
        | capabilities::CLIENT_PLUGIN_AUTH
        | capabilities::CLIENT_CONNECT_ATTRS
        | capabilities::CLIENT_COMPRESS
        | capabilities::CLIENT_DEPRECATE_EOF;

    /// A protocol-10 greeting as sent by MySQL 8.
    pub(crate) fn greeting_packet(
        version: &str,
        thread_id: u32,
        caps: u32,
        plugin: &str,
    ) -> Vec<u8> {
        let mut w = PacketWriter::new();
        w.write_u8(PROTOCOL_VERSION);
        w.write_null_string(version);
        w.write_u32_le(thread_id);
        w.write_bytes(&SCRAMBLE[..8]);
        w.write_u8(0);
        w.write_u16_le(caps as u16);
        w.write_u8(0xFF);
        w.write_u16_le(0x0002);
        w.write_u16_le((caps >> 16) as u16);
        w.write_u8(21);
        w.write_zeros(10);
        w.write_bytes(&SCRAMBLE[8..]);
        w.write_u8(0);
        w.write_null_string(plugin);
        w.into_bytes()
    }

    fn ok_payload() -> Vec<u8> {
        vec![0x00, 0x00, 0x00, 0x02, 0x00, 0x00, 0x00]
    }

    /// Client packets captured by a mock, split into payloads.
    pub(crate) fn client_packets(bytes: &[u8]) -> Vec<Vec<u8>> {
        let mut out = Vec::new();
        let mut pos = 0;
        while pos + 4 <= bytes.len() {
            let len = u32::from_le_bytes([bytes[pos], bytes[pos + 1], bytes[pos + 2], 0]) as usize;
            out.push(bytes[pos + 4..pos + 4 + len].to_vec());
            pos += 4 + len;
        }
        out
    }

    #[test]
    fn test_parse_greeting() {
        let payload =
            greeting_packet("8.0.36-0ubuntu0.22.04.1", 77, SERVER_CAPS, "caching_sha2_password");
        let greeting = Greeting::parse(&payload).unwrap();
        assert_eq!(greeting.server_version, "8.0.36-0ubuntu0.22.04.1");
        assert_eq!(greeting.version, (8, 0, 36));
        assert_eq!(greeting.thread_id, 77);
        assert_eq!(greeting.scramble, SCRAMBLE.to_vec());
        assert_eq!(greeting.capabilities, SERVER_CAPS);
        assert_eq!(greeting.charset, 0xFF);
        assert!(greeting.status.autocommit());
        assert_eq!(greeting.auth_plugin, "caching_sha2_password");
        assert!(greeting.version_at_least(5, 7, 3));
    }

    #[test]
    fn test_parse_greeting_rejects_old_protocol() {
        let mut payload = greeting_packet("5.0.0", 1, SERVER_CAPS, "");
        payload[0] = 9;
        let err = Greeting::parse(&payload).unwrap_err();
        assert!(matches!(
            err,
            Error::Connection(ref c) if c.kind == ConnectionErrorKind::Unsupported
        ));
    }

    #[test]
    fn test_parse_version() {
        assert_eq!(parse_version("5.7.44-log"), (5, 7, 44));
        assert_eq!(parse_version("5.5.5-10.6.12-MariaDB"), (10, 6, 12));
        assert_eq!(parse_version("8.4"), (8, 4, 0));
        assert_eq!(parse_version("garbage"), (0, 0, 0));
    }

    #[test]
    fn test_client_flags_follow_config_and_server() {
        let config = MySqlConfig::new().database("app").compression(true);
        let flags = client_flags(&config, SERVER_CAPS);
        assert!(flags & capabilities::CLIENT_CONNECT_WITH_DB != 0);
        assert!(flags & capabilities::CLIENT_COMPRESS != 0);
        assert!(flags & capabilities::CLIENT_FOUND_ROWS != 0);
        assert!(flags & capabilities::CLIENT_MULTI_STATEMENTS != 0);
        assert!(flags & capabilities::CLIENT_LOCAL_FILES == 0);
        // Never requested even when offered.
        assert!(flags & capabilities::CLIENT_DEPRECATE_EOF == 0);
        // Server does not offer SSL.
        assert!(flags & capabilities::CLIENT_SSL == 0);

        let config = MySqlConfig::new()
            .use_affected_rows(true)
            .allow_batch(false)
            .local_infile(true);
        let flags = client_flags(&config, capabilities::CLIENT_PROTOCOL_41);
        assert!(flags & capabilities::CLIENT_FOUND_ROWS == 0);
        assert!(flags & capabilities::CLIENT_MULTI_STATEMENTS == 0);
        assert!(flags & capabilities::CLIENT_LOCAL_FILES != 0);
        assert!(flags & capabilities::CLIENT_PLUGIN_AUTH == 0);
        assert!(flags & capabilities::CLIENT_SESSION_TRACK != 0);
    }

    #[test]
    fn test_handshake_response_layout() {
        let attrs = BTreeMap::from([("_client_name".to_string(), "sqlwire-mysql".to_string())]);
        let caps = capabilities::CLIENT_PROTOCOL_41
            | capabilities::CLIENT_SECURE_CONNECTION
            | capabilities::CLIENT_CONNECT_WITH_DB
            | capabilities::CLIENT_PLUGIN_AUTH
            | capabilities::CLIENT_CONNECT_ATTRS;
        let response = HandshakeResponse {
            capabilities: caps,
            max_packet_size: CLIENT_MAX_PACKET,
            charset: 45,
            user: "app",
            auth_response: &[1, 2, 3],
            database: Some("shop"),
            auth_plugin: "mysql_native_password",
            attributes: &attrs,
        }
        .encode();

        let mut reader = PacketReader::new(&response);
        assert_eq!(reader.read_u32_le().unwrap(), caps);
        assert_eq!(reader.read_u32_le().unwrap(), CLIENT_MAX_PACKET);
        assert_eq!(reader.read_u8().unwrap(), 45);
        assert!(reader.read_bytes(23).unwrap().iter().all(|&b| b == 0));
        assert_eq!(reader.read_null_string(), "app");
        assert_eq!(reader.read_u8().unwrap(), 3);
        assert_eq!(reader.read_bytes(3).unwrap(), &[1, 2, 3]);
        assert_eq!(reader.read_null_string(), "shop");
        assert_eq!(reader.read_null_string(), "mysql_native_password");

        let block = reader.read_lenenc_bytes().unwrap();
        let mut attrs = PacketReader::new(block);
        assert_eq!(attrs.read_lenenc_string().unwrap(), "_client_name");
        assert_eq!(attrs.read_lenenc_string().unwrap(), "sqlwire-mysql");
        assert!(reader.is_empty());
    }

    #[test]
    fn test_connect_attributes_include_extras() {
        let config = MySqlConfig::new().attribute("program_name", "billing");
        let attrs = connect_attributes(&config);
        assert_eq!(attrs["_client_name"], "sqlwire-mysql");
        assert_eq!(attrs["program_name"], "billing");
        assert!(attrs.contains_key("_pid"));
        assert!(attrs.contains_key("_os"));
        assert!(attrs.contains_key("_platform"));
    }

    fn run_auth(
        server: Vec<u8>,
        plugin: AuthPlugin,
        password: &str,
        secure: bool,
    ) -> (Result<AuthOutcome>, Vec<Vec<u8>>) {
        let (mut channel, tap) = MockChannel::tapped(server);
        channel.secure = secure;
        let mut stream = PacketStream::new(channel);
        // Greeting and handshake response are already exchanged.
        stream.set_sequence(2);
        let session = AuthSession::new(plugin, SCRAMBLE.to_vec());
        let result = authenticate(&mut stream, session, password);
        let sent = client_packets(&tap.lock());
        (result, sent)
    }

    #[test]
    fn test_auth_ok_immediately() {
        let (result, sent) =
            run_auth(frame(2, &ok_payload()), AuthPlugin::NativePassword, "pw", false);
        let outcome = result.unwrap();
        assert_eq!(outcome.plugin, AuthPlugin::NativePassword);
        assert!(sent.is_empty());
    }

    #[test]
    fn test_caching_sha2_fast_auth() {
        let mut server = frame(2, &[0x01, caching_sha2::FAST_AUTH_SUCCESS]);
        server.extend(frame(3, &ok_payload()));
        let (result, sent) = run_auth(server, AuthPlugin::CachingSha2, "pw", false);
        assert!(result.is_ok());
        assert!(sent.is_empty());
    }

    #[test]
    fn test_caching_sha2_full_auth_secure_sends_cleartext() {
        let mut server = frame(2, &[0x01, caching_sha2::PERFORM_FULL_AUTH]);
        server.extend(frame(4, &ok_payload()));
        let (result, sent) = run_auth(server, AuthPlugin::CachingSha2, "s3cret", true);
        assert!(result.is_ok());
        assert_eq!(sent, vec![b"s3cret\0".to_vec()]);
    }

    #[test]
    fn test_caching_sha2_full_auth_rsa() {
        let private = RsaPrivateKey::new(&mut OsRng, 1024).unwrap();
        let pem = private.to_public_key().to_public_key_pem(LineEnding::LF).unwrap();

        let mut server = frame(2, &[0x01, caching_sha2::PERFORM_FULL_AUTH]);
        let mut key_packet = vec![0x01];
        key_packet.extend_from_slice(pem.as_bytes());
        server.extend(frame(4, &key_packet));
        server.extend(frame(6, &ok_payload()));

        let (result, sent) = run_auth(server, AuthPlugin::CachingSha2, "s3cret", false);
        assert!(result.is_ok());
        assert_eq!(sent.len(), 2);
        assert_eq!(sent[0], vec![caching_sha2::REQUEST_PUBLIC_KEY]);
        let plain = private.decrypt(rsa::Oaep::new::<Sha1>(), &sent[1]).unwrap();
        assert_eq!(plain, auth::xor_password_with_seed("s3cret", &SCRAMBLE));
    }

    #[test]
    fn test_auth_switch_to_native() {
        let new_seed = [0x11u8; 20];
        let mut switch = vec![0xFE];
        switch.extend_from_slice(b"mysql_native_password\0");
        switch.extend_from_slice(&new_seed);
        switch.push(0);
        let mut server = frame(2, &switch);
        server.extend(frame(4, &ok_payload()));

        let (result, sent) = run_auth(server, AuthPlugin::CachingSha2, "pw", false);
        let outcome = result.unwrap();
        assert_eq!(outcome.plugin, AuthPlugin::NativePassword);
        assert_eq!(outcome.scramble, new_seed.to_vec());
        assert_eq!(sent, vec![auth::mysql_native_password("pw", &new_seed)]);
    }

    #[test]
    fn test_auth_switch_to_unknown_plugin_fails() {
        let mut switch = vec![0xFE];
        switch.extend_from_slice(b"auth_gssapi_client\0");
        switch.extend_from_slice(&[1; 8]);
        let (result, _) = run_auth(frame(2, &switch), AuthPlugin::NativePassword, "pw", false);
        assert!(matches!(
            result.unwrap_err(),
            Error::Connection(ref c) if c.kind == ConnectionErrorKind::Unsupported
        ));
    }

    #[cfg(not(windows))]
    #[test]
    fn test_auth_switch_to_windows_unsupported_off_windows() {
        let mut switch = vec![0xFE];
        switch.extend_from_slice(b"authentication_windows_client\0");
        let (result, sent) = run_auth(frame(2, &switch), AuthPlugin::NativePassword, "pw", false);
        let err = result.unwrap_err();
        assert!(matches!(
            err,
            Error::Connection(ref c) if c.kind == ConnectionErrorKind::Unsupported
        ));
        assert!(!err.is_fatal());
        assert!(sent.is_empty());
    }

    #[test]
    fn test_windows_data_without_context_fails() {
        let (result, _) = run_auth(frame(2, &[0x01, 0x60, 0x82]), AuthPlugin::Windows, "", false);
        assert!(matches!(
            result.unwrap_err(),
            Error::Connection(ref c) if c.kind == ConnectionErrorKind::Authentication
        ));
    }

    #[test]
    fn test_access_denied_and_expired_password() {
        let mut denied = vec![0xFF, 0x15, 0x04, b'#'];
        denied.extend_from_slice(b"28000Access denied for user 'app'@'localhost'");
        let (result, _) = run_auth(frame(2, &denied), AuthPlugin::NativePassword, "pw", false);
        let err = result.unwrap_err();
        assert!(matches!(
            err,
            Error::Connection(ref c) if c.kind == ConnectionErrorKind::Authentication
        ));
        assert!(err.to_string().contains("Access denied"));
        assert!(err.is_fatal());

        let mut expired = vec![0xFF];
        expired.extend_from_slice(&ER_MUST_CHANGE_PASSWORD_LOGIN.to_le_bytes());
        expired.extend_from_slice(b"#HY000Your password has expired.");
        let (result, _) = run_auth(frame(2, &expired), AuthPlugin::NativePassword, "pw", false);
        assert!(matches!(
            result.unwrap_err(),
            Error::Connection(ref c) if c.kind == ConnectionErrorKind::PasswordExpired
        ));
    }
}
