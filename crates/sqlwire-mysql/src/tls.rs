//! TLS support for MySQL connections.
//!
//! # MySQL TLS Handshake Flow
//!
//! 1. Server sends initial handshake with `CLIENT_SSL` capability
//! 2. If SSL is requested, client sends short SSL request packet:
//!    - 4 bytes: capability flags (with `CLIENT_SSL`)
//!    - 4 bytes: max packet size
//!    - 1 byte: character set
//!    - 23 bytes: reserved (zeros)
//! 3. Client performs TLS handshake over the raw socket
//! 4. Client sends full handshake response over TLS (sequence 2)
//! 5. Server sends auth result over TLS
//!
//! # Feature Flag
//!
//! The rustls stream requires the `tls` feature. Without it, `Preferred`
//! mode silently stays on plaintext and stricter modes fail to connect.

use sqlwire_core::{ConnectionErrorKind, Error};

use crate::config::{SslMode, TlsConfig};
use crate::protocol::{PacketWriter, capabilities};

#[cfg(feature = "tls")]
use crate::stream::Channel;
#[cfg(feature = "tls")]
use sqlwire_core::ConnectionError;
#[cfg(feature = "tls")]
use std::io::{Read, Write};
#[cfg(feature = "tls")]
use std::sync::Arc;

/// Whether this build can speak TLS at all.
pub const fn tls_available() -> bool {
    cfg!(feature = "tls")
}

/// Build the SSL request payload (32 bytes).
pub fn build_ssl_request(client_caps: u32, max_packet_size: u32, character_set: u8) -> Vec<u8> {
    let mut writer = PacketWriter::with_capacity(32);
    writer.write_u32_le(client_caps | capabilities::CLIENT_SSL);
    writer.write_u32_le(max_packet_size);
    writer.write_u8(character_set);
    writer.write_zeros(23);
    writer.into_bytes()
}

pub const fn server_supports_ssl(server_caps: u32) -> bool {
    server_caps & capabilities::CLIENT_SSL != 0
}

/// Decide whether to upgrade to TLS.
///
/// `Preferred` falls back to plaintext only when the server (or this
/// build) cannot do TLS. The stricter modes fail instead.
pub fn validate_ssl_mode(ssl_mode: SslMode, server_caps: u32) -> Result<bool, Error> {
    let server_supports = server_supports_ssl(server_caps);

    match ssl_mode {
        SslMode::Disabled => Ok(false),
        SslMode::Preferred => Ok(server_supports && tls_available()),
        SslMode::Required | SslMode::VerifyCa | SslMode::VerifyIdentity => {
            if !server_supports {
                Err(tls_error("SSL required but server does not support it"))
            } else if !tls_available() {
                Err(tls_error(
                    "SSL required but this build lacks TLS support; enable the `tls` feature",
                ))
            } else {
                Ok(true)
            }
        }
    }
}

/// Check that the TLS material fits the requested mode.
pub fn validate_tls_config(ssl_mode: SslMode, tls_config: &TlsConfig) -> Result<(), Error> {
    if tls_config.client_cert_path.is_some() != tls_config.client_key_path.is_some() {
        return Err(tls_error(
            "client certificate and client key must be configured together",
        ));
    }
    if matches!(ssl_mode, SslMode::VerifyCa | SslMode::VerifyIdentity)
        && tls_config.ca_cert_path.is_none()
        && !tls_config.danger_skip_verify
    {
        return Err(tls_error(
            "VerifyCa/VerifyIdentity need a CA certificate (or skip_verify)",
        ));
    }
    Ok(())
}

/// Wrap `channel` in TLS after the SSL request went out.
#[cfg(feature = "tls")]
pub(crate) fn upgrade(
    channel: Box<dyn Channel>,
    tls_config: &TlsConfig,
    host: &str,
    ssl_mode: SslMode,
) -> Result<Box<dyn Channel>, Error> {
    Ok(Box::new(TlsStream::connect(channel, tls_config, host, ssl_mode)?))
}

#[cfg(not(feature = "tls"))]
pub(crate) fn upgrade(
    _channel: Box<dyn crate::stream::Channel>,
    _tls_config: &TlsConfig,
    _host: &str,
    _ssl_mode: SslMode,
) -> Result<Box<dyn crate::stream::Channel>, Error> {
    Err(tls_error(
        "TLS negotiated but this build lacks TLS support; enable the `tls` feature",
    ))
}

fn tls_error(message: impl Into<String>) -> Error {
    Error::connection(ConnectionErrorKind::Ssl, message)
}

#[cfg(feature = "tls")]
fn tls_error_with(
    message: impl Into<String>,
    source: impl std::error::Error + Send + Sync + 'static,
) -> Error {
    Error::Connection(ConnectionError {
        kind: ConnectionErrorKind::Ssl,
        message: message.into(),
        source: Some(Box::new(source)),
    })
}

/// Channel encrypted with rustls.
#[cfg(feature = "tls")]
pub struct TlsStream<S: Channel> {
    conn: rustls::ClientConnection,
    stream: S,
}

#[cfg(feature = "tls")]
impl<S: Channel> std::fmt::Debug for TlsStream<S> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TlsStream")
            .field("protocol_version", &self.conn.protocol_version())
            .field("is_handshaking", &self.conn.is_handshaking())
            .finish_non_exhaustive()
    }
}

#[cfg(feature = "tls")]
impl<S: Channel> TlsStream<S> {
    /// Run the TLS handshake over `stream`.
    ///
    /// Any failure here is reported as [`ConnectionErrorKind::Ssl`] with the
    /// rustls or socket error attached; the caller does not retry.
    pub fn connect(
        mut stream: S,
        tls_config: &TlsConfig,
        host: &str,
        ssl_mode: SslMode,
    ) -> Result<Self, Error> {
        let config = build_client_config(tls_config, ssl_mode)?;

        let sni_name = tls_config.server_name.as_deref().unwrap_or(host);
        let server_name = rustls::pki_types::ServerName::try_from(sni_name.to_string())
            .map_err(|e| tls_error_with(format!("invalid server name '{sni_name}'"), e))?;

        let mut conn = rustls::ClientConnection::new(Arc::new(config), server_name)
            .map_err(|e| tls_error_with("failed to create TLS session", e))?;

        while conn.is_handshaking() {
            while conn.wants_write() {
                conn.write_tls(&mut stream)
                    .map_err(|e| tls_error_with("TLS handshake write failed", e))?;
            }
            if conn.wants_read() {
                let n = conn
                    .read_tls(&mut stream)
                    .map_err(|e| tls_error_with("TLS handshake read failed", e))?;
                if n == 0 {
                    return Err(tls_error("server closed the connection during TLS handshake"));
                }
                conn.process_new_packets()
                    .map_err(|e| tls_error_with("TLS handshake rejected", e))?;
            }
        }
        stream.flush().map_err(|e| tls_error_with("TLS handshake flush failed", e))?;

        tracing::debug!(
            protocol = ?conn.protocol_version(),
            cipher = ?conn.negotiated_cipher_suite().map(|s| s.suite()),
            "TLS established"
        );
        Ok(TlsStream { conn, stream })
    }

    pub fn protocol_version(&self) -> Option<rustls::ProtocolVersion> {
        self.conn.protocol_version()
    }
}

#[cfg(feature = "tls")]
impl<S: Channel> Read for TlsStream<S> {
    fn read(&mut self, buf: &mut [u8]) -> std::io::Result<usize> {
        loop {
            match self.conn.reader().read(buf) {
                Ok(n) if n > 0 => return Ok(n),
                Ok(_) => {}
                Err(e) if e.kind() == std::io::ErrorKind::WouldBlock => {}
                Err(e) => return Err(e),
            }

            if !self.conn.wants_read() {
                return Ok(0);
            }
            if self.conn.read_tls(&mut self.stream)? == 0 {
                return Ok(0);
            }
            self.conn
                .process_new_packets()
                .map_err(|e| std::io::Error::new(std::io::ErrorKind::InvalidData, e))?;
        }
    }
}

#[cfg(feature = "tls")]
impl<S: Channel> Write for TlsStream<S> {
    fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
        let n = self.conn.writer().write(buf)?;
        while self.conn.wants_write() {
            self.conn.write_tls(&mut self.stream)?;
        }
        Ok(n)
    }

    fn flush(&mut self) -> std::io::Result<()> {
        self.conn.writer().flush()?;
        while self.conn.wants_write() {
            self.conn.write_tls(&mut self.stream)?;
        }
        self.stream.flush()
    }
}

#[cfg(feature = "tls")]
impl<S: Channel> Channel for TlsStream<S> {
    fn set_timeout(&mut self, timeout: Option<std::time::Duration>) -> std::io::Result<()> {
        self.stream.set_timeout(timeout)
    }

    fn shutdown(&mut self) {
        self.conn.send_close_notify();
        let _ = self.conn.write_tls(&mut self.stream);
        self.stream.shutdown();
    }

    fn is_secure(&self) -> bool {
        true
    }
}

/// Build a rustls ClientConfig for the mode and material.
#[cfg(feature = "tls")]
fn build_client_config(
    tls_config: &TlsConfig,
    ssl_mode: SslMode,
) -> Result<rustls::ClientConfig, Error> {
    let provider = Arc::new(rustls::crypto::ring::default_provider());

    let builder = rustls::ClientConfig::builder_with_provider(provider)
        .with_protocol_versions(&[&rustls::version::TLS12, &rustls::version::TLS13])
        .map_err(|e| tls_error_with("failed to set TLS versions", e))?;

    // Preferred/Required encrypt without authenticating the server, like
    // the stock MySQL client. Verify modes check against the CA.
    let verify = matches!(ssl_mode, SslMode::VerifyCa | SslMode::VerifyIdentity);
    if tls_config.danger_skip_verify || !verify {
        let builder = builder
            .dangerous()
            .with_custom_certificate_verifier(Arc::new(danger::NoVerifier));
        return add_client_auth(builder, tls_config);
    }

    let mut root_store = rustls::RootCertStore::empty();
    if let Some(ca_path) = &tls_config.ca_cert_path {
        for cert in load_certs(ca_path)? {
            root_store
                .add(cert)
                .map_err(|e| tls_error_with("failed to add CA certificate", e))?;
        }
    } else {
        root_store.extend(webpki_roots::TLS_SERVER_ROOTS.iter().cloned());
    }

    if ssl_mode == SslMode::VerifyCa {
        let inner = rustls::client::WebPkiServerVerifier::builder(Arc::new(root_store))
            .build()
            .map_err(|e| tls_error_with("failed to build certificate verifier", e))?;
        let builder = builder
            .dangerous()
            .with_custom_certificate_verifier(Arc::new(danger::ChainOnlyVerifier { inner }));
        return add_client_auth(builder, tls_config);
    }

    add_client_auth(builder.with_root_certificates(root_store), tls_config)
}

#[cfg(feature = "tls")]
fn load_certs(
    path: &std::path::Path,
) -> Result<Vec<rustls::pki_types::CertificateDer<'static>>, Error> {
    let file = std::fs::File::open(path)
        .map_err(|e| tls_error_with(format!("failed to open '{}'", path.display()), e))?;
    let certs = rustls_pemfile::certs(&mut std::io::BufReader::new(file))
        .collect::<Result<Vec<_>, _>>()
        .map_err(|e| tls_error_with(format!("failed to parse '{}'", path.display()), e))?;
    if certs.is_empty() {
        return Err(tls_error(format!(
            "no certificates found in '{}'",
            path.display()
        )));
    }
    Ok(certs)
}

#[cfg(feature = "tls")]
fn add_client_auth(
    builder: rustls::ConfigBuilder<rustls::ClientConfig, rustls::client::WantsClientCert>,
    tls_config: &TlsConfig,
) -> Result<rustls::ClientConfig, Error> {
    let (Some(cert_path), Some(key_path)) =
        (&tls_config.client_cert_path, &tls_config.client_key_path)
    else {
        return Ok(builder.with_no_client_auth());
    };

    let certs = load_certs(cert_path)?;
    let key_file = std::fs::File::open(key_path)
        .map_err(|e| tls_error_with(format!("failed to open '{}'", key_path.display()), e))?;
    let key = rustls_pemfile::private_key(&mut std::io::BufReader::new(key_file))
        .map_err(|e| tls_error_with("failed to parse client key", e))?
        .ok_or_else(|| tls_error(format!("no private key found in '{}'", key_path.display())))?;

    builder
        .with_client_auth_cert(certs, key)
        .map_err(|e| tls_error_with("failed to configure client certificate", e))
}

#[cfg(feature = "tls")]
mod danger {
    use std::sync::Arc;

    use rustls::client::WebPkiServerVerifier;
    use rustls::client::danger::{HandshakeSignatureValid, ServerCertVerified, ServerCertVerifier};
    use rustls::pki_types::{CertificateDer, ServerName, UnixTime};
    use rustls::{CertificateError, DigitallySignedStruct, Error as RustlsError, SignatureScheme};

    /// Accepts any certificate.
    #[derive(Debug)]
    pub(super) struct NoVerifier;

    impl ServerCertVerifier for NoVerifier {
        fn verify_server_cert(
            &self,
            _end_entity: &CertificateDer<'_>,
            _intermediates: &[CertificateDer<'_>],
            _server_name: &ServerName<'_>,
            _ocsp_response: &[u8],
            _now: UnixTime,
        ) -> Result<ServerCertVerified, RustlsError> {
            Ok(ServerCertVerified::assertion())
        }

        fn verify_tls12_signature(
            &self,
            _message: &[u8],
            _cert: &CertificateDer<'_>,
            _dss: &DigitallySignedStruct,
        ) -> Result<HandshakeSignatureValid, RustlsError> {
            Ok(HandshakeSignatureValid::assertion())
        }

        fn verify_tls13_signature(
            &self,
            _message: &[u8],
            _cert: &CertificateDer<'_>,
            _dss: &DigitallySignedStruct,
        ) -> Result<HandshakeSignatureValid, RustlsError> {
            Ok(HandshakeSignatureValid::assertion())
        }

        fn supported_verify_schemes(&self) -> Vec<SignatureScheme> {
            rustls::crypto::ring::default_provider()
                .signature_verification_algorithms
                .supported_schemes()
        }
    }

    /// Verifies the chain against the CA but not the host name (VerifyCa).
    #[derive(Debug)]
    pub(super) struct ChainOnlyVerifier {
        pub(super) inner: Arc<WebPkiServerVerifier>,
    }

    impl ServerCertVerifier for ChainOnlyVerifier {
        fn verify_server_cert(
            &self,
            end_entity: &CertificateDer<'_>,
            intermediates: &[CertificateDer<'_>],
            server_name: &ServerName<'_>,
            ocsp_response: &[u8],
            now: UnixTime,
        ) -> Result<ServerCertVerified, RustlsError> {
            match self
                .inner
                .verify_server_cert(end_entity, intermediates, server_name, ocsp_response, now)
            {
                Err(RustlsError::InvalidCertificate(
                    CertificateError::NotValidForName
                    | CertificateError::NotValidForNameContext { .. },
                )) => Ok(ServerCertVerified::assertion()),
                other => other,
            }
        }

        fn verify_tls12_signature(
            &self,
            message: &[u8],
            cert: &CertificateDer<'_>,
            dss: &DigitallySignedStruct,
        ) -> Result<HandshakeSignatureValid, RustlsError> {
            self.inner.verify_tls12_signature(message, cert, dss)
        }

        fn verify_tls13_signature(
            &self,
            message: &[u8],
            cert: &CertificateDer<'_>,
            dss: &DigitallySignedStruct,
        ) -> Result<HandshakeSignatureValid, RustlsError> {
            self.inner.verify_tls13_signature(message, cert, dss)
        }

        fn supported_verify_schemes(&self) -> Vec<SignatureScheme> {
            self.inner.supported_verify_schemes()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::charset;

    #[test]
    fn test_build_ssl_request() {
        let payload = build_ssl_request(
            capabilities::CLIENT_PROTOCOL_41,
            16 * 1024 * 1024,
            charset::UTF8MB4_GENERAL_CI,
        );
        assert_eq!(payload.len(), 32);

        let caps = u32::from_le_bytes([payload[0], payload[1], payload[2], payload[3]]);
        assert!(caps & capabilities::CLIENT_SSL != 0);
        assert!(caps & capabilities::CLIENT_PROTOCOL_41 != 0);
        assert_eq!(payload[8], charset::UTF8MB4_GENERAL_CI);
        assert!(payload[9..].iter().all(|&b| b == 0));
    }

    #[test]
    fn test_server_supports_ssl() {
        assert!(server_supports_ssl(capabilities::CLIENT_SSL));
        assert!(!server_supports_ssl(capabilities::CLIENT_PROTOCOL_41));
    }

    #[test]
    fn test_validate_ssl_mode() {
        assert!(!validate_ssl_mode(SslMode::Disabled, capabilities::CLIENT_SSL).unwrap());

        // Preferred falls back only when TLS is impossible.
        assert!(!validate_ssl_mode(SslMode::Preferred, 0).unwrap());
        assert_eq!(
            validate_ssl_mode(SslMode::Preferred, capabilities::CLIENT_SSL).unwrap(),
            tls_available()
        );

        for mode in [SslMode::Required, SslMode::VerifyCa, SslMode::VerifyIdentity] {
            let err = validate_ssl_mode(mode, 0).unwrap_err();
            assert!(matches!(
                err,
                Error::Connection(ref c) if c.kind == ConnectionErrorKind::Ssl
            ));
            assert_eq!(
                validate_ssl_mode(mode, capabilities::CLIENT_SSL).is_ok(),
                tls_available()
            );
        }
    }

    #[test]
    fn test_validate_tls_config() {
        let config = TlsConfig::new();
        assert!(validate_tls_config(SslMode::Required, &config).is_ok());
        assert!(validate_tls_config(SslMode::VerifyCa, &config).is_err());
        assert!(validate_tls_config(SslMode::VerifyIdentity, &config).is_err());

        let config = TlsConfig::new().ca_cert("/path/to/ca.pem");
        assert!(validate_tls_config(SslMode::VerifyIdentity, &config).is_ok());

        let config = TlsConfig::new().skip_verify(true);
        assert!(validate_tls_config(SslMode::VerifyCa, &config).is_ok());

        let config = TlsConfig::new()
            .ca_cert("/path/to/ca.pem")
            .client_cert("/path/to/client.pem");
        assert!(validate_tls_config(SslMode::VerifyCa, &config).is_err());
    }
}
