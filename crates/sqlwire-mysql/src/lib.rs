//! Blocking MySQL driver for SQLWire.
//!
//! This crate speaks the MySQL client/server protocol directly over
//! `std::net` sockets. It provides:
//!
//! - Packet framing with sequence numbers and split/joined large packets
//! - The compressed protocol (zlib) and TLS upgrade (`tls` feature)
//! - Authentication: mysql_native_password, caching_sha2_password,
//!   sha256_password, mysql_clear_password and, on Windows,
//!   authentication_windows_client (SSPI)
//! - Text and binary (prepared statement) query protocols with server cursors
//! - `LOAD DATA LOCAL INFILE` restricted to a configured directory
//! - Out-of-band `KILL QUERY` cancellation and timeout recovery
//! - Pooling through `sqlwire-pool`
//!
//! # Example
//!
//! ```rust,ignore
//! use sqlwire_mysql::{Driver, MySqlConfig, MySqlPoolRegistry, connect};
//!
//! let config = MySqlConfig::new()
//!     .host("localhost")
//!     .port(3306)
//!     .user("root")
//!     .database("mydb");
//!
//! let registry = MySqlPoolRegistry::new();
//! let mut conn = connect(&registry, &config)?;
//! conn.query("SELECT id, name FROM users")?;
//! while let Some(row) = conn.next_row()? {
//!     println!("{:?}", row.get_by_name("name"));
//! }
//! ```

pub mod auth;
pub mod cancel;
pub mod compress;
pub mod config;
pub mod driver;
pub mod handshake;
pub mod pool;
pub mod protocol;
pub mod stream;
pub mod tls;
pub mod tracing_driver;
pub mod types;
pub mod windows_auth;

pub use cancel::{CancelHandle, cancel_query};
pub use config::{Endpoint, MySqlConfig, SslMode, TlsConfig};
pub use driver::{Driver, NativeDriver, PreparedStatement, ResultSet, StatementGuard};
pub use pool::{Connection, MySqlConnectionFactory, MySqlPoolRegistry, connect};
pub use protocol::ServerStatus;
pub use tracing_driver::{TracingDriver, open_driver};
pub use types::{ColumnDef, FieldType};
