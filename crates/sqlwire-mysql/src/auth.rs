//! MySQL authentication plugins.
//!
//! - `mysql_native_password`: SHA1 challenge/response
//! - `caching_sha2_password`: SHA256 fast path, full auth over a secure
//!   channel or with the server's RSA key
//! - `sha256_password`: cleartext over a secure channel, RSA otherwise
//! - `mysql_clear_password`: cleartext, secure channels only
//! - `authentication_windows_client`: SSPI token exchange, Windows only
//!
//! # mysql_native_password
//!
//! ```text
//! SHA1(password) XOR SHA1(seed + SHA1(SHA1(password)))
//! ```
//!
//! # caching_sha2_password
//!
//! ```text
//! XOR(SHA256(password), SHA256(SHA256(SHA256(password)) + seed))
//! ```

use rand::rngs::OsRng;
use rsa::RsaPublicKey;
use rsa::pkcs1::DecodeRsaPublicKey;
use rsa::pkcs8::DecodePublicKey;
use sha1::Sha1;
use sha2::{Digest, Sha256};
use sqlwire_core::{ConnectionError, ConnectionErrorKind, Error, Result};

use crate::windows_auth::{self, WindowsAuth};

/// Well-known authentication plugin names.
pub mod plugins {
    pub const MYSQL_NATIVE_PASSWORD: &str = "mysql_native_password";
    pub const CACHING_SHA2_PASSWORD: &str = "caching_sha2_password";
    pub const SHA256_PASSWORD: &str = "sha256_password";
    pub const MYSQL_CLEAR_PASSWORD: &str = "mysql_clear_password";
    pub const MYSQL_OLD_PASSWORD: &str = "mysql_old_password";
    pub const AUTHENTICATION_WINDOWS_CLIENT: &str = "authentication_windows_client";
}

/// Second byte of a caching_sha2_password `0x01` packet.
pub mod caching_sha2 {
    /// Client asks for the server's RSA public key.
    pub const REQUEST_PUBLIC_KEY: u8 = 0x02;
    pub const FAST_AUTH_SUCCESS: u8 = 0x03;
    pub const PERFORM_FULL_AUTH: u8 = 0x04;
}

/// sha256_password: "send me your public key".
pub const SHA256_REQUEST_PUBLIC_KEY: u8 = 0x01;

/// Supported authentication plugins.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AuthPlugin {
    NativePassword,
    CachingSha2,
    Sha256,
    ClearPassword,
    Windows,
}

impl AuthPlugin {
    /// Resolve a plugin by the name the server announced.
    pub fn from_name(name: &str) -> Result<Self> {
        match name {
            plugins::MYSQL_NATIVE_PASSWORD | "" => Ok(AuthPlugin::NativePassword),
            plugins::CACHING_SHA2_PASSWORD => Ok(AuthPlugin::CachingSha2),
            plugins::SHA256_PASSWORD => Ok(AuthPlugin::Sha256),
            plugins::MYSQL_CLEAR_PASSWORD => Ok(AuthPlugin::ClearPassword),
            plugins::AUTHENTICATION_WINDOWS_CLIENT => Ok(AuthPlugin::Windows),
            plugins::MYSQL_OLD_PASSWORD => Err(Error::connection(
                ConnectionErrorKind::Unsupported,
                "mysql_old_password (pre-4.1 hashing) is not supported",
            )),
            other => Err(Error::connection(
                ConnectionErrorKind::Unsupported,
                format!("authentication plugin '{other}' is not supported"),
            )),
        }
    }

    pub const fn name(self) -> &'static str {
        match self {
            AuthPlugin::NativePassword => plugins::MYSQL_NATIVE_PASSWORD,
            AuthPlugin::CachingSha2 => plugins::CACHING_SHA2_PASSWORD,
            AuthPlugin::Sha256 => plugins::SHA256_PASSWORD,
            AuthPlugin::ClearPassword => plugins::MYSQL_CLEAR_PASSWORD,
            AuthPlugin::Windows => plugins::AUTHENTICATION_WINDOWS_CLIENT,
        }
    }

    /// User name to log in with. Windows authentication falls back to a
    /// placeholder the server replaces with the Windows account.
    pub fn login_user(self, configured: &str) -> &str {
        if self == AuthPlugin::Windows && configured.is_empty() {
            windows_auth::DEFAULT_USER
        } else {
            configured
        }
    }

    /// First auth response for `scramble`.
    ///
    /// `secure` is true on TLS and Unix socket channels, where a cleartext
    /// password may be sent. The Windows plugin keeps state between rounds
    /// and answers through [`AuthSession`] instead.
    pub fn initial_response(
        self,
        password: &str,
        scramble: &[u8],
        secure: bool,
    ) -> Result<Vec<u8>> {
        match self {
            AuthPlugin::NativePassword => Ok(mysql_native_password(password, scramble)),
            AuthPlugin::CachingSha2 => Ok(caching_sha2_password(password, scramble)),
            AuthPlugin::Sha256 => {
                if password.is_empty() {
                    Ok(vec![0])
                } else if secure {
                    Ok(cleartext_password(password))
                } else {
                    Ok(vec![SHA256_REQUEST_PUBLIC_KEY])
                }
            }
            AuthPlugin::ClearPassword => {
                if !secure {
                    return Err(auth_error(
                        "mysql_clear_password requires a TLS or Unix socket connection",
                    ));
                }
                Ok(cleartext_password(password))
            }
            AuthPlugin::Windows => Err(auth_error(
                "authentication_windows_client needs an AuthSession for its SSPI context",
            )),
        }
    }
}

/// Client side of one authentication exchange: the plugin in effect, its
/// scramble and, for Windows authentication, the SSPI context.
#[derive(Debug)]
pub struct AuthSession {
    pub plugin: AuthPlugin,
    pub scramble: Vec<u8>,
    windows: Option<WindowsAuth>,
}

impl AuthSession {
    pub fn new(plugin: AuthPlugin, scramble: Vec<u8>) -> Self {
        Self {
            plugin,
            scramble,
            windows: None,
        }
    }

    /// Move to the plugin the server switched to.
    pub fn switch(&mut self, plugin: AuthPlugin, scramble: Vec<u8>) {
        self.plugin = plugin;
        self.scramble = scramble;
        self.windows = None;
    }

    /// First response for the current plugin.
    pub fn initial_response(&mut self, password: &str, secure: bool) -> Result<Vec<u8>> {
        if self.plugin != AuthPlugin::Windows {
            return self.plugin.initial_response(password, &self.scramble, secure);
        }
        let mut sspi = WindowsAuth::new()?;
        let token = sspi.step(None)?.unwrap_or_default();
        self.windows = Some(sspi);
        Ok(token)
    }

    /// Feed a server SSPI token; returns the next client token, if any.
    pub fn windows_step(&mut self, server_token: &[u8]) -> Result<Option<Vec<u8>>> {
        match self.windows.as_mut() {
            Some(sspi) => sspi.step(Some(server_token)),
            None => Err(auth_error("server sent SSPI data before the exchange began")),
        }
    }
}

pub(crate) fn auth_error(message: impl Into<String>) -> Error {
    Error::connection(ConnectionErrorKind::Authentication, message)
}

/// Strip the NUL the server appends to the 20-byte scramble.
fn seed_of(auth_data: &[u8]) -> &[u8] {
    match auth_data {
        [seed @ .., 0] if auth_data.len() == 21 => seed,
        _ => auth_data,
    }
}

/// Compute the mysql_native_password response (empty for no password).
pub fn mysql_native_password(password: &str, auth_data: &[u8]) -> Vec<u8> {
    if password.is_empty() {
        return vec![];
    }
    let seed = &auth_data[..auth_data.len().min(20)];

    let stage1: [u8; 20] = Sha1::digest(password.as_bytes()).into();
    let stage2: [u8; 20] = Sha1::digest(stage1).into();
    let mut hasher = Sha1::new();
    hasher.update(seed);
    hasher.update(stage2);
    let stage3: [u8; 20] = hasher.finalize().into();

    stage1.iter().zip(stage3.iter()).map(|(a, b)| a ^ b).collect()
}

/// Compute the caching_sha2_password fast-auth response (empty for no password).
pub fn caching_sha2_password(password: &str, auth_data: &[u8]) -> Vec<u8> {
    if password.is_empty() {
        return vec![];
    }
    let seed = seed_of(auth_data);

    let password_hash: [u8; 32] = Sha256::digest(password.as_bytes()).into();
    let password_hash_hash: [u8; 32] = Sha256::digest(password_hash).into();
    let mut hasher = Sha256::new();
    hasher.update(password_hash_hash);
    hasher.update(seed);
    let scramble: [u8; 32] = hasher.finalize().into();

    password_hash
        .iter()
        .zip(scramble.iter())
        .map(|(a, b)| a ^ b)
        .collect()
}

/// Password followed by NUL.
pub fn cleartext_password(password: &str) -> Vec<u8> {
    let mut out = Vec::with_capacity(password.len() + 1);
    out.extend_from_slice(password.as_bytes());
    out.push(0);
    out
}

/// XOR the NUL-terminated password with the repeating seed.
pub fn xor_password_with_seed(password: &str, seed: &[u8]) -> Vec<u8> {
    let mut out = cleartext_password(password);
    if !seed.is_empty() {
        for (i, b) in out.iter_mut().enumerate() {
            *b ^= seed[i % seed.len()];
        }
    }
    out
}

/// Encrypt the password with the server's RSA public key (OAEP, SHA1).
///
/// Used for full authentication on channels that are not secure.
pub fn encrypt_password_rsa(
    password: &str,
    auth_data: &[u8],
    public_key_pem: &[u8],
) -> Result<Vec<u8>> {
    let seed = seed_of(auth_data);
    if seed.is_empty() {
        return Err(auth_error("cannot encrypt password: empty scramble"));
    }
    let obfuscated = xor_password_with_seed(password, seed);

    let pem = std::str::from_utf8(public_key_pem)
        .map_err(|e| key_error("server public key is not valid PEM text", e))?;
    let key = RsaPublicKey::from_public_key_pem(pem.trim())
        .or_else(|_| RsaPublicKey::from_pkcs1_pem(pem.trim()))
        .map_err(|e| key_error("failed to parse server RSA public key", e))?;

    key.encrypt(&mut OsRng, rsa::Oaep::new::<Sha1>(), &obfuscated)
        .map_err(|e| key_error("RSA encryption of password failed", e))
}

fn key_error(message: &str, source: impl std::error::Error + Send + Sync + 'static) -> Error {
    Error::Connection(ConnectionError {
        kind: ConnectionErrorKind::Authentication,
        message: format!("{message}: {source}"),
        source: Some(Box::new(source)),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use rsa::RsaPrivateKey;
    use rsa::pkcs8::{EncodePublicKey, LineEnding};

    #[test]
    fn test_mysql_native_password_empty() {
        assert!(mysql_native_password("", &[0; 20]).is_empty());
    }

    #[test]
    fn test_mysql_native_password_known_vector() {
        // SHA1("secret") XOR SHA1(seed ++ SHA1(SHA1("secret"))) with a zero seed,
        // checked by recomputing the server side: SHA1(stage1) == SHA1(SHA1(pw)).
        let seed = [0u8; 20];
        let response = mysql_native_password("secret", &seed);
        assert_eq!(response.len(), 20);

        let stage2: [u8; 20] = Sha1::digest(Sha1::digest(b"secret")).into();
        let mut hasher = Sha1::new();
        hasher.update(seed);
        hasher.update(stage2);
        let stage3: [u8; 20] = hasher.finalize().into();
        let recovered: Vec<u8> = response.iter().zip(stage3).map(|(a, b)| a ^ b).collect();
        let check: [u8; 20] = Sha1::digest(&recovered).into();
        assert_eq!(check, stage2);
    }

    #[test]
    fn test_mysql_native_password_uses_first_20_bytes() {
        let mut seed = vec![7u8; 20];
        let a = mysql_native_password("pw", &seed);
        seed.push(0);
        assert_eq!(a, mysql_native_password("pw", &seed));
    }

    #[test]
    fn test_caching_sha2_password_with_nul() {
        let mut seed = vec![3u8; 20];
        let a = caching_sha2_password("secret", &seed);
        assert_eq!(a.len(), 32);
        seed.push(0);
        assert_eq!(a, caching_sha2_password("secret", &seed));
        assert!(caching_sha2_password("", &seed).is_empty());
    }

    #[test]
    fn test_plugin_from_name() {
        assert_eq!(
            AuthPlugin::from_name("caching_sha2_password").unwrap(),
            AuthPlugin::CachingSha2
        );
        assert_eq!(AuthPlugin::from_name("").unwrap(), AuthPlugin::NativePassword);

        for name in ["mysql_old_password", "authentication_kerberos_client"] {
            let err = AuthPlugin::from_name(name).unwrap_err();
            assert!(matches!(
                err,
                Error::Connection(ref c) if c.kind == ConnectionErrorKind::Unsupported
            ));
        }
    }

    #[test]
    fn test_windows_plugin_name_and_user() {
        let plugin = AuthPlugin::from_name("authentication_windows_client").unwrap();
        assert_eq!(plugin, AuthPlugin::Windows);
        assert_eq!(plugin.name(), plugins::AUTHENTICATION_WINDOWS_CLIENT);
        assert_eq!(plugin.login_user(""), "auth_windows");
        assert_eq!(plugin.login_user("alice"), "alice");
        assert_eq!(AuthPlugin::NativePassword.login_user(""), "");
        assert!(plugin.initial_response("", &[], true).is_err());
    }

    #[cfg(not(windows))]
    #[test]
    fn test_windows_session_unsupported_off_windows() {
        let mut session = AuthSession::new(AuthPlugin::Windows, Vec::new());
        let err = session.initial_response("", false).unwrap_err();
        assert!(matches!(
            err,
            Error::Connection(ref c) if c.kind == ConnectionErrorKind::Unsupported
        ));
        assert!(session.windows_step(&[1, 2, 3]).is_err());
    }

    #[test]
    fn test_session_switch_resets_plugin_state() {
        let mut session = AuthSession::new(AuthPlugin::NativePassword, vec![1; 20]);
        session.switch(AuthPlugin::ClearPassword, vec![2; 20]);
        assert_eq!(session.plugin, AuthPlugin::ClearPassword);
        assert_eq!(session.scramble, vec![2; 20]);
        assert_eq!(session.initial_response("pw", true).unwrap(), b"pw\0".to_vec());
    }

    #[test]
    fn test_initial_responses() {
        let seed = [1u8; 20];
        assert_eq!(
            AuthPlugin::Sha256.initial_response("pw", &seed, false).unwrap(),
            vec![SHA256_REQUEST_PUBLIC_KEY]
        );
        assert_eq!(
            AuthPlugin::Sha256.initial_response("pw", &seed, true).unwrap(),
            b"pw\0".to_vec()
        );
        assert_eq!(AuthPlugin::Sha256.initial_response("", &seed, false).unwrap(), vec![0]);

        assert!(AuthPlugin::ClearPassword.initial_response("pw", &seed, false).is_err());
        assert_eq!(
            AuthPlugin::ClearPassword.initial_response("pw", &seed, true).unwrap(),
            b"pw\0".to_vec()
        );
    }

    #[test]
    fn test_xor_password_with_seed() {
        let seed = [1, 2, 3, 4, 5, 6, 7, 8];
        let result = xor_password_with_seed("test", &seed);
        assert_eq!(result.len(), 5);
        let recovered: Vec<u8> = result
            .iter()
            .enumerate()
            .map(|(i, &b)| b ^ seed[i % seed.len()])
            .collect();
        assert_eq!(recovered, b"test\0");
    }

    #[test]
    fn test_encrypt_password_rsa_decrypts() {
        let private = RsaPrivateKey::new(&mut OsRng, 1024).unwrap();
        let pem = private
            .to_public_key()
            .to_public_key_pem(LineEnding::LF)
            .unwrap();
        let seed = [9u8; 20];

        let encrypted = encrypt_password_rsa("hunter2", &seed, pem.as_bytes()).unwrap();
        let decrypted = private.decrypt(rsa::Oaep::new::<Sha1>(), &encrypted).unwrap();
        assert_eq!(decrypted, xor_password_with_seed("hunter2", &seed));
    }

    #[test]
    fn test_encrypt_password_rsa_bad_key() {
        let err = encrypt_password_rsa("pw", &[1; 20], b"not a key").unwrap_err();
        assert!(matches!(
            err,
            Error::Connection(ref c) if c.kind == ConnectionErrorKind::Authentication
        ));
    }
}
