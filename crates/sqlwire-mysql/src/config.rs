//! MySQL connection configuration.
//!
//! [`MySqlConfig`] is the resolved set of connection settings. It is built
//! by the caller (no URL or option-string parsing happens here) and shared
//! read-only with every physical driver opened from it.

use std::collections::BTreeMap;
use std::fmt::Write as _;
use std::path::PathBuf;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::protocol::charset;

/// SSL mode for MySQL connections.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum SslMode {
    /// Do not use SSL
    Disabled,
    /// Use SSL if the server supports it, plaintext otherwise
    #[default]
    Preferred,
    /// Require SSL, accept any certificate the trust policy allows
    Required,
    /// Require SSL and verify the server certificate chain
    VerifyCa,
    /// Require SSL and verify the certificate matches the host name
    VerifyIdentity,
}

impl SslMode {
    /// Check if SSL should be attempted.
    pub const fn should_try_ssl(self) -> bool {
        !matches!(self, SslMode::Disabled)
    }

    /// Check if SSL is required.
    pub const fn is_required(self) -> bool {
        matches!(
            self,
            SslMode::Required | SslMode::VerifyCa | SslMode::VerifyIdentity
        )
    }
}

/// Certificate material and verification options for TLS.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TlsConfig {
    /// CA certificate (PEM) used to verify the server
    pub ca_cert_path: Option<PathBuf>,
    /// Client certificate (PEM) for mutual TLS
    pub client_cert_path: Option<PathBuf>,
    /// Client private key (PEM) for mutual TLS
    pub client_key_path: Option<PathBuf>,
    /// Accept any server certificate. Only for testing.
    pub danger_skip_verify: bool,
    /// SNI / verification name, when it differs from the host
    pub server_name: Option<String>,
}

impl TlsConfig {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn ca_cert(mut self, path: impl Into<PathBuf>) -> Self {
        self.ca_cert_path = Some(path.into());
        self
    }

    pub fn client_cert(mut self, path: impl Into<PathBuf>) -> Self {
        self.client_cert_path = Some(path.into());
        self
    }

    pub fn client_key(mut self, path: impl Into<PathBuf>) -> Self {
        self.client_key_path = Some(path.into());
        self
    }

    pub fn skip_verify(mut self, skip: bool) -> Self {
        self.danger_skip_verify = skip;
        self
    }

    pub fn server_name(mut self, name: impl Into<String>) -> Self {
        self.server_name = Some(name.into());
        self
    }
}

/// Where the server listens.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Endpoint {
    Tcp { host: String, port: u16 },
    /// Unix domain socket path
    Unix(PathBuf),
}

impl Endpoint {
    /// Host name used for TLS verification and logging.
    pub fn host(&self) -> &str {
        match self {
            Endpoint::Tcp { host, .. } => host,
            Endpoint::Unix(_) => "localhost",
        }
    }

    /// Unix sockets never leave the machine, so cleartext secrets may cross them.
    pub const fn is_local_socket(&self) -> bool {
        matches!(self, Endpoint::Unix(_))
    }
}

impl std::fmt::Display for Endpoint {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Endpoint::Tcp { host, port } => write!(f, "{host}:{port}"),
            Endpoint::Unix(path) => write!(f, "unix:{}", path.display()),
        }
    }
}

/// MySQL connection configuration.
#[derive(Debug, Clone)]
pub struct MySqlConfig {
    pub endpoint: Endpoint,
    pub user: String,
    pub password: Option<String>,
    /// Default schema selected at login
    pub database: Option<String>,
    /// Collation id sent in the handshake
    pub charset: u8,

    pub connect_timeout: Duration,
    /// Per-operation read/write timeout; `None` blocks forever
    pub command_timeout: Option<Duration>,
    /// TCP keepalive idle time; `None` leaves keepalive off
    pub keepalive: Option<Duration>,
    /// Bound for the out-of-band `KILL QUERY` connection
    pub cancel_timeout: Duration,

    pub ssl_mode: SslMode,
    pub tls: TlsConfig,

    /// Negotiate `CLIENT_COMPRESS`
    pub compression: bool,
    /// Overrides `@@max_allowed_packet` when set
    pub max_packet_size: Option<u64>,
    /// Allow multiple statements per `COM_QUERY`
    pub allow_batch: bool,
    /// Report affected rows instead of found rows
    pub use_affected_rows: bool,
    pub interactive: bool,
    /// Extra connection attributes sent at login
    pub attributes: BTreeMap<String, String>,

    /// Honor `LOAD DATA LOCAL INFILE` requests
    pub local_infile: bool,
    /// Requested files must resolve under this directory
    pub local_infile_dir: Option<PathBuf>,

    pub pooling: bool,
    pub min_pool_size: usize,
    pub max_pool_size: usize,
    /// Maximum age of a pooled driver; zero means unlimited
    pub connection_lifetime: Duration,
    /// Reset session state when a pooled driver is reused
    pub connection_reset: bool,
    /// Idle drivers older than this are evicted (down to `min_pool_size`)
    pub max_idle_time: Duration,

    /// Wrap drivers in [`crate::TracingDriver`]
    pub tracing: bool,
}

impl Default for MySqlConfig {
    fn default() -> Self {
        Self {
            endpoint: Endpoint::Tcp {
                host: "localhost".to_string(),
                port: 3306,
            },
            user: String::new(),
            password: None,
            database: None,
            charset: charset::DEFAULT_CHARSET,
            connect_timeout: Duration::from_secs(15),
            command_timeout: Some(Duration::from_secs(30)),
            keepalive: None,
            cancel_timeout: Duration::from_secs(5),
            ssl_mode: SslMode::default(),
            tls: TlsConfig::default(),
            compression: false,
            max_packet_size: None,
            allow_batch: true,
            use_affected_rows: false,
            interactive: false,
            attributes: BTreeMap::new(),
            local_infile: false,
            local_infile_dir: None,
            pooling: true,
            min_pool_size: 0,
            max_pool_size: 100,
            connection_lifetime: Duration::ZERO,
            connection_reset: false,
            max_idle_time: Duration::from_secs(180),
            tracing: false,
        }
    }
}

impl MySqlConfig {
    /// Create a new configuration with default values.
    pub fn new() -> Self {
        Self::default()
    }

    /// Connect over TCP to `host`, keeping the current port.
    pub fn host(mut self, host: impl Into<String>) -> Self {
        let port = match &self.endpoint {
            Endpoint::Tcp { port, .. } => *port,
            Endpoint::Unix(_) => 3306,
        };
        self.endpoint = Endpoint::Tcp {
            host: host.into(),
            port,
        };
        self
    }

    /// Set the TCP port.
    pub fn port(mut self, port: u16) -> Self {
        if let Endpoint::Tcp { port: p, .. } = &mut self.endpoint {
            *p = port;
        } else {
            self.endpoint = Endpoint::Tcp {
                host: "localhost".to_string(),
                port,
            };
        }
        self
    }

    /// Connect through a Unix domain socket.
    pub fn unix_socket(mut self, path: impl Into<PathBuf>) -> Self {
        self.endpoint = Endpoint::Unix(path.into());
        self
    }

    pub fn user(mut self, user: impl Into<String>) -> Self {
        self.user = user.into();
        self
    }

    pub fn password(mut self, password: impl Into<String>) -> Self {
        self.password = Some(password.into());
        self
    }

    pub fn database(mut self, database: impl Into<String>) -> Self {
        self.database = Some(database.into());
        self
    }

    pub fn charset(mut self, charset: u8) -> Self {
        self.charset = charset;
        self
    }

    pub fn connect_timeout(mut self, timeout: Duration) -> Self {
        self.connect_timeout = timeout;
        self
    }

    pub fn command_timeout(mut self, timeout: Option<Duration>) -> Self {
        self.command_timeout = timeout;
        self
    }

    pub fn keepalive(mut self, interval: Option<Duration>) -> Self {
        self.keepalive = interval;
        self
    }

    pub fn cancel_timeout(mut self, timeout: Duration) -> Self {
        self.cancel_timeout = timeout;
        self
    }

    pub fn ssl_mode(mut self, mode: SslMode) -> Self {
        self.ssl_mode = mode;
        self
    }

    pub fn tls_config(mut self, tls: TlsConfig) -> Self {
        self.tls = tls;
        self
    }

    pub fn compression(mut self, enabled: bool) -> Self {
        self.compression = enabled;
        self
    }

    pub fn max_packet_size(mut self, size: u64) -> Self {
        self.max_packet_size = Some(size);
        self
    }

    pub fn allow_batch(mut self, enabled: bool) -> Self {
        self.allow_batch = enabled;
        self
    }

    pub fn use_affected_rows(mut self, enabled: bool) -> Self {
        self.use_affected_rows = enabled;
        self
    }

    pub fn interactive(mut self, enabled: bool) -> Self {
        self.interactive = enabled;
        self
    }

    /// Set a connection attribute.
    pub fn attribute(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.attributes.insert(key.into(), value.into());
        self
    }

    /// Enable or disable local infile handling.
    ///
    /// # Security Warning
    /// A server that can request local files can read anything this process
    /// can. Pair this with [`MySqlConfig::local_infile_dir`] when possible.
    pub fn local_infile(mut self, enabled: bool) -> Self {
        self.local_infile = enabled;
        self
    }

    pub fn local_infile_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.local_infile_dir = Some(dir.into());
        self
    }

    pub fn pooling(mut self, enabled: bool) -> Self {
        self.pooling = enabled;
        self
    }

    pub fn min_pool_size(mut self, size: usize) -> Self {
        self.min_pool_size = size;
        self
    }

    pub fn max_pool_size(mut self, size: usize) -> Self {
        self.max_pool_size = size;
        self
    }

    pub fn connection_lifetime(mut self, lifetime: Duration) -> Self {
        self.connection_lifetime = lifetime;
        self
    }

    pub fn connection_reset(mut self, enabled: bool) -> Self {
        self.connection_reset = enabled;
        self
    }

    pub fn max_idle_time(mut self, idle: Duration) -> Self {
        self.max_idle_time = idle;
        self
    }

    pub fn tracing(mut self, enabled: bool) -> Self {
        self.tracing = enabled;
        self
    }

    /// Normalized key of every connection and pool setting.
    ///
    /// Configs with equal keys share one pool, so its bounds and the
    /// timeouts of its drivers match each caller's settings. The password is
    /// part of the key so drivers never cross credentials.
    pub fn pool_key(&self) -> String {
        let mut key = String::with_capacity(128);
        let _ = write!(
            key,
            "endpoint={};user={};password={};database={};charset={};ssl={:?};compress={};",
            self.endpoint,
            self.user,
            self.password.as_deref().unwrap_or(""),
            self.database.as_deref().unwrap_or(""),
            self.charset,
            self.ssl_mode,
            self.compression,
        );
        let _ = write!(
            key,
            "batch={};affected={};interactive={};infile={};infile_dir={};",
            self.allow_batch,
            self.use_affected_rows,
            self.interactive,
            self.local_infile,
            self.local_infile_dir
                .as_deref()
                .map(|p| p.display().to_string())
                .unwrap_or_default(),
        );
        let _ = write!(
            key,
            "ca={};cert={};key={};skip_verify={};sni={};tracing={}",
            path_or_empty(self.tls.ca_cert_path.as_ref()),
            path_or_empty(self.tls.client_cert_path.as_ref()),
            path_or_empty(self.tls.client_key_path.as_ref()),
            self.tls.danger_skip_verify,
            self.tls.server_name.as_deref().unwrap_or(""),
            self.tracing,
        );
        let _ = write!(
            key,
            ";connect_timeout={:?};command_timeout={:?};keepalive={:?};cancel_timeout={:?}",
            self.connect_timeout, self.command_timeout, self.keepalive, self.cancel_timeout,
        );
        let _ = write!(key, ";max_packet={:?}", self.max_packet_size);
        let _ = write!(
            key,
            ";min_pool={};max_pool={};lifetime={:?};reset={};max_idle={:?}",
            self.min_pool_size,
            self.max_pool_size,
            self.connection_lifetime,
            self.connection_reset,
            self.max_idle_time,
        );
        for (k, v) in &self.attributes {
            let _ = write!(key, ";attr.{k}={v}");
        }
        key
    }
}

fn path_or_empty(path: Option<&PathBuf>) -> String {
    path.map(|p| p.display().to_string()).unwrap_or_default()
}
