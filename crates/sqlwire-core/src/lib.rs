//! Core types for SQLWire.
//!
//! This crate holds the pieces shared by the protocol driver and the pool:
//!
//! - [`Error`] and its classification helpers
//! - [`Value`] for parameters and decoded columns
//! - [`Row`] with shared [`ColumnInfo`]

pub mod error;
pub mod row;
pub mod value;

pub use error::{
    ConfigError, ConnectionError, ConnectionErrorKind, Error, PoolError, PoolErrorKind,
    ProtocolError, ProtocolErrorKind, QueryError, QueryErrorKind, Result, TimeoutError, TypeError,
};
pub use row::{ColumnInfo, FromValue, Row};
pub use value::{Date, DateTime, Time, Value};
