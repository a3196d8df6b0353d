//! MySQL wire protocol definitions.
//!
//! MySQL packets have a 4-byte header:
//! - 3 bytes: payload length (little-endian)
//! - 1 byte: sequence number
//!
//! A single physical packet carries at most 2^24 - 1 payload bytes. Larger
//! logical payloads are split, and a payload that ends exactly on a block
//! boundary is followed by an empty packet.

pub mod prepared;
pub mod reader;
pub mod writer;

use sqlwire_core::{Error, ProtocolErrorKind, QueryError, Result};

pub use prepared::{BinaryRowDecoder, ParamBinding, StmtPrepareOk};
pub use reader::PacketReader;
pub use writer::PacketWriter;

/// Maximum payload size for a single physical packet (2^24 - 1 bytes).
pub const MAX_BLOCK_SIZE: usize = 0xFF_FF_FF;

/// MySQL capability flags (client and server).
#[allow(dead_code)]
pub mod capabilities {
    pub const CLIENT_LONG_PASSWORD: u32 = 1;
    pub const CLIENT_FOUND_ROWS: u32 = 1 << 1;
    pub const CLIENT_LONG_FLAG: u32 = 1 << 2;
    pub const CLIENT_CONNECT_WITH_DB: u32 = 1 << 3;
    pub const CLIENT_NO_SCHEMA: u32 = 1 << 4;
    pub const CLIENT_COMPRESS: u32 = 1 << 5;
    pub const CLIENT_ODBC: u32 = 1 << 6;
    pub const CLIENT_LOCAL_FILES: u32 = 1 << 7;
    pub const CLIENT_IGNORE_SPACE: u32 = 1 << 8;
    pub const CLIENT_PROTOCOL_41: u32 = 1 << 9;
    pub const CLIENT_INTERACTIVE: u32 = 1 << 10;
    pub const CLIENT_SSL: u32 = 1 << 11;
    pub const CLIENT_IGNORE_SIGPIPE: u32 = 1 << 12;
    pub const CLIENT_TRANSACTIONS: u32 = 1 << 13;
    pub const CLIENT_RESERVED: u32 = 1 << 14;
    pub const CLIENT_SECURE_CONNECTION: u32 = 1 << 15;
    pub const CLIENT_MULTI_STATEMENTS: u32 = 1 << 16;
    pub const CLIENT_MULTI_RESULTS: u32 = 1 << 17;
    pub const CLIENT_PS_MULTI_RESULTS: u32 = 1 << 18;
    pub const CLIENT_PLUGIN_AUTH: u32 = 1 << 19;
    pub const CLIENT_CONNECT_ATTRS: u32 = 1 << 20;
    pub const CLIENT_PLUGIN_AUTH_LENENC_CLIENT_DATA: u32 = 1 << 21;
    pub const CLIENT_CAN_HANDLE_EXPIRED_PASSWORDS: u32 = 1 << 22;
    pub const CLIENT_SESSION_TRACK: u32 = 1 << 23;
    pub const CLIENT_DEPRECATE_EOF: u32 = 1 << 24;
    pub const CLIENT_QUERY_ATTRIBUTES: u32 = 1 << 27;
}

/// MySQL command codes (COM_xxx) issued by this driver.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum Command {
    Quit = 0x01,
    InitDb = 0x02,
    Query = 0x03,
    Ping = 0x0e,
    ChangeUser = 0x11,
    StmtPrepare = 0x16,
    StmtExecute = 0x17,
    StmtClose = 0x19,
    StmtReset = 0x1a,
    StmtFetch = 0x1c,
    ResetConnection = 0x1f,
}

impl Command {
    pub const fn name(self) -> &'static str {
        match self {
            Command::Quit => "COM_QUIT",
            Command::InitDb => "COM_INIT_DB",
            Command::Query => "COM_QUERY",
            Command::Ping => "COM_PING",
            Command::ChangeUser => "COM_CHANGE_USER",
            Command::StmtPrepare => "COM_STMT_PREPARE",
            Command::StmtExecute => "COM_STMT_EXECUTE",
            Command::StmtClose => "COM_STMT_CLOSE",
            Command::StmtReset => "COM_STMT_RESET",
            Command::StmtFetch => "COM_STMT_FETCH",
            Command::ResetConnection => "COM_RESET_CONNECTION",
        }
    }
}

/// MySQL server status flags.
#[allow(dead_code)]
pub mod server_status {
    pub const SERVER_STATUS_IN_TRANS: u16 = 0x0001;
    pub const SERVER_STATUS_AUTOCOMMIT: u16 = 0x0002;
    pub const SERVER_MORE_RESULTS_EXISTS: u16 = 0x0008;
    pub const SERVER_STATUS_NO_GOOD_INDEX_USED: u16 = 0x0010;
    pub const SERVER_STATUS_NO_INDEX_USED: u16 = 0x0020;
    pub const SERVER_STATUS_CURSOR_EXISTS: u16 = 0x0040;
    pub const SERVER_STATUS_LAST_ROW_SENT: u16 = 0x0080;
    pub const SERVER_STATUS_DB_DROPPED: u16 = 0x0100;
    pub const SERVER_STATUS_NO_BACKSLASH_ESCAPES: u16 = 0x0200;
    pub const SERVER_STATUS_METADATA_CHANGED: u16 = 0x0400;
    pub const SERVER_QUERY_WAS_SLOW: u16 = 0x0800;
    pub const SERVER_PS_OUT_PARAMS: u16 = 0x1000;
    pub const SERVER_STATUS_IN_TRANS_READONLY: u16 = 0x2000;
    pub const SERVER_SESSION_STATE_CHANGED: u16 = 0x4000;
}

/// Server status bits as of the last OK or EOF packet.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct ServerStatus(pub u16);

impl ServerStatus {
    pub const fn contains(self, flag: u16) -> bool {
        self.0 & flag != 0
    }

    pub const fn in_transaction(self) -> bool {
        self.contains(server_status::SERVER_STATUS_IN_TRANS)
    }

    pub const fn autocommit(self) -> bool {
        self.contains(server_status::SERVER_STATUS_AUTOCOMMIT)
    }

    /// Another result set follows the current one.
    pub const fn more_results(self) -> bool {
        self.contains(server_status::SERVER_MORE_RESULTS_EXISTS)
    }

    pub const fn cursor_exists(self) -> bool {
        self.contains(server_status::SERVER_STATUS_CURSOR_EXISTS)
    }

    pub const fn last_row_sent(self) -> bool {
        self.contains(server_status::SERVER_STATUS_LAST_ROW_SENT)
    }
}

/// MySQL character set codes.
#[allow(dead_code)]
pub mod charset {
    pub const LATIN1_SWEDISH_CI: u8 = 8;
    pub const UTF8_GENERAL_CI: u8 = 33;
    pub const UTF8MB4_GENERAL_CI: u8 = 45;
    pub const BINARY: u8 = 63;
    pub const UTF8MB4_UNICODE_CI: u8 = 224;
    pub const UTF8MB4_0900_AI_CI: u8 = 255;

    /// Default charset for new connections (utf8mb4).
    pub const DEFAULT_CHARSET: u8 = UTF8MB4_GENERAL_CI;

    /// Look up a collation id by charset or collation name.
    pub fn from_name(name: &str) -> Option<u8> {
        match name.to_ascii_lowercase().as_str() {
            "latin1" | "latin1_swedish_ci" => Some(LATIN1_SWEDISH_CI),
            "utf8" | "utf8mb3" | "utf8_general_ci" => Some(UTF8_GENERAL_CI),
            "utf8mb4" | "utf8mb4_general_ci" => Some(UTF8MB4_GENERAL_CI),
            "utf8mb4_unicode_ci" => Some(UTF8MB4_UNICODE_CI),
            "utf8mb4_0900_ai_ci" => Some(UTF8MB4_0900_AI_CI),
            "binary" => Some(BINARY),
            _ => None,
        }
    }
}

/// A MySQL packet header.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PacketHeader {
    /// Payload length (3 bytes, max 2^24 - 1)
    pub payload_length: u32,
    /// Sequence number (wraps at 255)
    pub sequence_id: u8,
}

impl PacketHeader {
    pub const SIZE: usize = 4;

    pub fn from_bytes(bytes: &[u8; 4]) -> Self {
        Self {
            payload_length: u32::from_le_bytes([bytes[0], bytes[1], bytes[2], 0]),
            sequence_id: bytes[3],
        }
    }

    pub fn to_bytes(&self) -> [u8; 4] {
        let len = self.payload_length.to_le_bytes();
        [len[0], len[1], len[2], self.sequence_id]
    }
}

/// Server response packet types.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PacketType {
    /// OK packet (0x00)
    Ok,
    /// Error packet (0xFF)
    Error,
    /// EOF packet (0xFE, short)
    Eof,
    /// Local infile request (0xFB)
    LocalInfile,
    /// Anything else: column count, column definition, row
    Data,
}

impl PacketType {
    /// Classify a packet from its payload.
    ///
    /// 0xFE is only an EOF marker when the packet is shorter than 9 bytes;
    /// longer packets starting with 0xFE are rows with an 8-byte lenenc value.
    pub fn of(payload: &[u8]) -> Self {
        match payload.first() {
            Some(0x00) => PacketType::Ok,
            Some(0xFF) => PacketType::Error,
            Some(0xFE) if payload.len() < 9 => PacketType::Eof,
            Some(0xFB) => PacketType::LocalInfile,
            _ => PacketType::Data,
        }
    }
}

/// Parsed OK packet.
#[derive(Debug, Clone, Default)]
pub struct OkPacket {
    pub affected_rows: u64,
    pub last_insert_id: u64,
    pub status: ServerStatus,
    pub warnings: u16,
    /// Human-readable info string (if any)
    pub info: String,
}

impl OkPacket {
    /// Parse an OK packet (protocol 4.1 layout).
    ///
    /// Also accepts an EOF-style `0xFE` header, which servers use to end
    /// result sets when EOF deprecation is negotiated.
    pub fn parse(payload: &[u8]) -> Result<Self> {
        let mut reader = PacketReader::new(payload);
        match reader.read_u8()? {
            0x00 | 0xFE => {}
            other => {
                return Err(Error::protocol(
                    ProtocolErrorKind::UnexpectedPacket,
                    format!("expected OK packet, got header 0x{other:02X}"),
                ));
            }
        }
        let affected_rows = reader.read_lenenc_int()?;
        let last_insert_id = reader.read_lenenc_int()?;
        let status = ServerStatus(reader.read_u16_le()?);
        let warnings = reader.read_u16_le()?;
        let info = reader.read_rest_string();
        Ok(Self {
            affected_rows,
            last_insert_id,
            status,
            warnings,
            info,
        })
    }
}

/// Parsed Error packet.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ErrPacket {
    pub error_code: u16,
    /// SQL state; absent from servers that omit the `#` marker
    pub sql_state: Option<String>,
    pub error_message: String,
}

impl ErrPacket {
    /// Parse an ERR packet: `0xFF`, code (2), optional `#` + 5-char state, message.
    pub fn parse(payload: &[u8]) -> Result<Self> {
        let mut reader = PacketReader::new(payload);
        if reader.read_u8()? != 0xFF {
            return Err(Error::protocol(
                ProtocolErrorKind::UnexpectedPacket,
                "expected ERR packet",
            ));
        }
        let error_code = reader.read_u16_le()?;
        let sql_state = if reader.peek() == Some(b'#') {
            reader.skip(1)?;
            Some(reader.read_string(5)?)
        } else {
            None
        };
        let error_message = reader.read_rest_string();
        Ok(Self {
            error_code,
            sql_state,
            error_message,
        })
    }

    /// Convert to a server-reported query error.
    pub fn into_error(self) -> Error {
        Error::Query(QueryError::from_server(
            self.error_code,
            self.sql_state,
            self.error_message,
        ))
    }
}

/// Parsed EOF packet.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct EofPacket {
    pub warnings: u16,
    pub status: ServerStatus,
}

impl EofPacket {
    pub fn parse(payload: &[u8]) -> Result<Self> {
        let mut reader = PacketReader::new(payload);
        if reader.read_u8()? != 0xFE {
            return Err(Error::protocol(
                ProtocolErrorKind::UnexpectedPacket,
                "expected EOF packet",
            ));
        }
        // Pre-4.1 servers send a bare 0xFE.
        if reader.is_empty() {
            return Ok(Self {
                warnings: 0,
                status: ServerStatus::default(),
            });
        }
        let warnings = reader.read_u16_le()?;
        let status = ServerStatus(reader.read_u16_le()?);
        Ok(Self { warnings, status })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_packet_header_bytes() {
        let header = PacketHeader {
            payload_length: 0x0012_3456,
            sequence_id: 7,
        };
        assert_eq!(header.to_bytes(), [0x56, 0x34, 0x12, 7]);
        assert_eq!(PacketHeader::from_bytes(&[0x56, 0x34, 0x12, 7]), header);

        let max = PacketHeader {
            payload_length: MAX_BLOCK_SIZE as u32,
            sequence_id: 255,
        };
        assert_eq!(max.to_bytes(), [0xFF, 0xFF, 0xFF, 255]);
    }

    #[test]
    fn test_packet_type_detection() {
        assert_eq!(PacketType::of(&[0x00, 0, 0, 2, 0, 0, 0]), PacketType::Ok);
        assert_eq!(PacketType::of(&[0xFF, 0x15, 0x04]), PacketType::Error);
        assert_eq!(PacketType::of(&[0xFE, 0, 0, 2, 0]), PacketType::Eof);
        assert_eq!(PacketType::of(&[0xFE; 12]), PacketType::Data);
        assert_eq!(PacketType::of(b"\xFBdata.csv"), PacketType::LocalInfile);
        assert_eq!(PacketType::of(&[0x03]), PacketType::Data);
    }

    #[test]
    fn test_parse_ok_packet() {
        let data = [0x00, 0x01, 0x2A, 0x02, 0x00, 0x03, 0x00];
        let ok = OkPacket::parse(&data).unwrap();
        assert_eq!(ok.affected_rows, 1);
        assert_eq!(ok.last_insert_id, 42);
        assert!(ok.status.autocommit());
        assert_eq!(ok.warnings, 3);
        assert!(ok.info.is_empty());
    }

    #[test]
    fn test_parse_err_packet_with_state() {
        let mut data = vec![0xFF, 0x26, 0x04, b'#'];
        data.extend_from_slice(b"23000");
        data.extend_from_slice(b"Duplicate entry '1' for key 'PRIMARY'");
        let err = ErrPacket::parse(&data).unwrap();
        assert_eq!(err.error_code, 1062);
        assert_eq!(err.sql_state.as_deref(), Some("23000"));
        assert_eq!(err.error_message, "Duplicate entry '1' for key 'PRIMARY'");

        let converted = err.into_error();
        assert_eq!(converted.server_code(), Some(1062));
        assert_eq!(converted.sqlstate(), Some("23000"));
        assert!(!converted.is_fatal());
    }

    #[test]
    fn test_parse_err_packet_without_state() {
        let mut data = vec![0xFF, 0x26, 0x04];
        data.extend_from_slice(b"Duplicate entry");
        let err = ErrPacket::parse(&data).unwrap();
        assert_eq!(err.error_code, 1062);
        assert_eq!(err.sql_state, None);
        assert_eq!(err.error_message, "Duplicate entry");
    }

    #[test]
    fn test_parse_eof_packet() {
        let eof = EofPacket::parse(&[0xFE, 0x01, 0x00, 0x0A, 0x00]).unwrap();
        assert_eq!(eof.warnings, 1);
        assert!(eof.status.more_results());
        assert!(eof.status.autocommit());
    }

    #[test]
    fn test_charset_from_name() {
        assert_eq!(charset::from_name("UTF8MB4"), Some(charset::UTF8MB4_GENERAL_CI));
        assert_eq!(charset::from_name("klingon"), None);
    }
}
