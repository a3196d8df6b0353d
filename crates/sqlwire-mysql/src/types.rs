//! MySQL type system and value codecs.
//!
//! This module provides:
//! - MySQL field type codes and column flags
//! - Column definition packet parsing
//! - Text protocol decoding (every value arrives as a string)
//! - Binary protocol decoding and parameter encoding

use sqlwire_core::{Date, DateTime, Error, ProtocolErrorKind, Result, Time, Value};

use crate::protocol::{PacketReader, PacketWriter, charset};

/// MySQL field type codes (`MYSQL_TYPE_*`).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum FieldType {
    Decimal = 0x00,
    Tiny = 0x01,
    Short = 0x02,
    Long = 0x03,
    Float = 0x04,
    Double = 0x05,
    Null = 0x06,
    Timestamp = 0x07,
    LongLong = 0x08,
    Int24 = 0x09,
    Date = 0x0A,
    Time = 0x0B,
    DateTime = 0x0C,
    Year = 0x0D,
    NewDate = 0x0E,
    VarChar = 0x0F,
    Bit = 0x10,
    Timestamp2 = 0x11,
    DateTime2 = 0x12,
    Time2 = 0x13,
    Json = 0xF5,
    NewDecimal = 0xF6,
    Enum = 0xF7,
    Set = 0xF8,
    TinyBlob = 0xF9,
    MediumBlob = 0xFA,
    LongBlob = 0xFB,
    Blob = 0xFC,
    VarString = 0xFD,
    String = 0xFE,
    Geometry = 0xFF,
}

impl FieldType {
    /// Parse a field type from a byte. Unknown codes decode as strings.
    pub fn from_u8(value: u8) -> Self {
        match value {
            0x00 => FieldType::Decimal,
            0x01 => FieldType::Tiny,
            0x02 => FieldType::Short,
            0x03 => FieldType::Long,
            0x04 => FieldType::Float,
            0x05 => FieldType::Double,
            0x06 => FieldType::Null,
            0x07 => FieldType::Timestamp,
            0x08 => FieldType::LongLong,
            0x09 => FieldType::Int24,
            0x0A => FieldType::Date,
            0x0B => FieldType::Time,
            0x0C => FieldType::DateTime,
            0x0D => FieldType::Year,
            0x0E => FieldType::NewDate,
            0x0F => FieldType::VarChar,
            0x10 => FieldType::Bit,
            0x11 => FieldType::Timestamp2,
            0x12 => FieldType::DateTime2,
            0x13 => FieldType::Time2,
            0xF5 => FieldType::Json,
            0xF6 => FieldType::NewDecimal,
            0xF7 => FieldType::Enum,
            0xF8 => FieldType::Set,
            0xF9 => FieldType::TinyBlob,
            0xFA => FieldType::MediumBlob,
            0xFB => FieldType::LongBlob,
            0xFC => FieldType::Blob,
            0xFD => FieldType::VarString,
            0xFF => FieldType::Geometry,
            _ => FieldType::String,
        }
    }

    pub const fn is_integer(self) -> bool {
        matches!(
            self,
            FieldType::Tiny
                | FieldType::Short
                | FieldType::Long
                | FieldType::LongLong
                | FieldType::Int24
                | FieldType::Year
        )
    }

    pub const fn is_blob(self) -> bool {
        matches!(
            self,
            FieldType::TinyBlob
                | FieldType::MediumBlob
                | FieldType::LongBlob
                | FieldType::Blob
                | FieldType::Geometry
        )
    }

    pub const fn is_string(self) -> bool {
        matches!(
            self,
            FieldType::VarChar
                | FieldType::VarString
                | FieldType::String
                | FieldType::Enum
                | FieldType::Set
        )
    }

    pub const fn is_temporal(self) -> bool {
        matches!(
            self,
            FieldType::Date
                | FieldType::Time
                | FieldType::DateTime
                | FieldType::Timestamp
                | FieldType::NewDate
                | FieldType::Timestamp2
                | FieldType::DateTime2
                | FieldType::Time2
        )
    }
}

/// Column flags in result set metadata.
#[allow(dead_code)]
pub mod column_flags {
    pub const NOT_NULL: u16 = 1;
    pub const PRIMARY_KEY: u16 = 2;
    pub const UNIQUE_KEY: u16 = 4;
    pub const MULTIPLE_KEY: u16 = 8;
    pub const BLOB: u16 = 16;
    pub const UNSIGNED: u16 = 32;
    pub const ZEROFILL: u16 = 64;
    pub const BINARY: u16 = 128;
    pub const ENUM: u16 = 256;
    pub const AUTO_INCREMENT: u16 = 512;
    pub const TIMESTAMP: u16 = 1024;
    pub const SET: u16 = 2048;
}

/// Column definition from a result set or a prepare response.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ColumnDef {
    pub catalog: String,
    pub schema: String,
    /// Table name (or alias)
    pub table: String,
    pub org_table: String,
    /// Column name (or alias)
    pub name: String,
    pub org_name: String,
    /// Collation id
    pub charset: u16,
    /// Declared display length
    pub column_length: u32,
    pub column_type: FieldType,
    pub flags: u16,
    pub decimals: u8,
}

impl ColumnDef {
    /// Parse a protocol 4.1 column definition packet.
    pub fn parse(payload: &[u8]) -> Result<Self> {
        let mut reader = PacketReader::new(payload);
        let catalog = reader.read_lenenc_string()?;
        let schema = reader.read_lenenc_string()?;
        let table = reader.read_lenenc_string()?;
        let org_table = reader.read_lenenc_string()?;
        let name = reader.read_lenenc_string()?;
        let org_name = reader.read_lenenc_string()?;
        // Length of the fixed-size block that follows, always 0x0C.
        let fixed_len = reader.read_lenenc_int()?;
        if fixed_len < 10 {
            return Err(Error::protocol(
                ProtocolErrorKind::Malformed,
                format!("column definition fixed block too short: {fixed_len}"),
            ));
        }
        let charset = reader.read_u16_le()?;
        let column_length = reader.read_u32_le()?;
        let column_type = FieldType::from_u8(reader.read_u8()?);
        let flags = reader.read_u16_le()?;
        let decimals = reader.read_u8()?;

        Ok(Self {
            catalog,
            schema,
            table,
            org_table,
            name,
            org_name,
            charset,
            column_length,
            column_type,
            flags,
            decimals,
        })
    }

    pub const fn is_not_null(&self) -> bool {
        self.flags & column_flags::NOT_NULL != 0
    }

    pub const fn is_primary_key(&self) -> bool {
        self.flags & column_flags::PRIMARY_KEY != 0
    }

    pub const fn is_unsigned(&self) -> bool {
        self.flags & column_flags::UNSIGNED != 0
    }

    pub const fn is_auto_increment(&self) -> bool {
        self.flags & column_flags::AUTO_INCREMENT != 0
    }

    /// Binary collation: string types carry raw bytes, not text.
    pub const fn is_binary(&self) -> bool {
        self.charset == charset::BINARY as u16
    }
}

fn parse_or_text<T: std::str::FromStr>(text: &str, f: impl FnOnce(T) -> Value) -> Value {
    text.parse::<T>()
        .map_or_else(|_| Value::Text(text.to_string()), f)
}

/// Decode a text protocol row: one length-encoded string per column,
/// `0xFB` for NULL.
pub fn decode_text_row(columns: &[ColumnDef], payload: &[u8]) -> Result<Vec<Value>> {
    let mut reader = PacketReader::new(payload);
    columns
        .iter()
        .map(|column| {
            Ok(match reader.read_lenenc_bytes_or_null()? {
                Some(data) => decode_text_value(column, data),
                None => Value::Null,
            })
        })
        .collect()
}

/// Decode a text protocol value.
///
/// Unsigned columns widen to the next signed variant so no value wraps.
/// Values that do not parse under their declared type fall back to text.
pub fn decode_text_value(column: &ColumnDef, data: &[u8]) -> Value {
    let unsigned = column.is_unsigned();
    let field_type = column.column_type;

    if field_type.is_blob() || field_type == FieldType::Bit {
        return Value::Bytes(data.to_vec());
    }
    // Numeric and temporal columns also report the binary collation.
    if field_type.is_string() && column.is_binary() {
        return Value::Bytes(data.to_vec());
    }

    let text = String::from_utf8_lossy(data);
    match field_type {
        FieldType::Tiny if unsigned => parse_or_text(&text, |v: u8| Value::SmallInt(i16::from(v))),
        FieldType::Tiny => parse_or_text(&text, Value::TinyInt),
        FieldType::Short if unsigned => parse_or_text(&text, |v: u16| Value::Int(i32::from(v))),
        FieldType::Short | FieldType::Year => parse_or_text(&text, Value::SmallInt),
        FieldType::Long | FieldType::Int24 if unsigned => {
            parse_or_text(&text, |v: u32| Value::BigInt(i64::from(v)))
        }
        FieldType::Long | FieldType::Int24 => parse_or_text(&text, Value::Int),
        FieldType::LongLong if unsigned => parse_or_text(&text, Value::from_u64),
        FieldType::LongLong => parse_or_text(&text, Value::BigInt),
        FieldType::Float => parse_or_text(&text, Value::Float),
        FieldType::Double => parse_or_text(&text, Value::Double),
        FieldType::Decimal | FieldType::NewDecimal => Value::Decimal(text.into_owned()),
        FieldType::Date | FieldType::NewDate => {
            Date::parse(&text).map_or_else(|| Value::Text(text.into_owned()), Value::Date)
        }
        FieldType::Time | FieldType::Time2 => {
            Time::parse(&text).map_or_else(|| Value::Text(text.into_owned()), Value::Time)
        }
        FieldType::DateTime
        | FieldType::DateTime2
        | FieldType::Timestamp
        | FieldType::Timestamp2 => {
            DateTime::parse(&text).map_or_else(|| Value::Text(text.into_owned()), Value::DateTime)
        }
        FieldType::Json => serde_json::from_str(&text)
            .map_or_else(|_| Value::Text(text.into_owned()), Value::Json),
        FieldType::Null => Value::Null,
        _ => Value::Text(text.into_owned()),
    }
}

/// Decode one non-NULL binary protocol value, advancing the reader.
pub fn decode_binary_value(reader: &mut PacketReader<'_>, column: &ColumnDef) -> Result<Value> {
    let unsigned = column.is_unsigned();
    let value = match column.column_type {
        FieldType::Tiny if unsigned => Value::SmallInt(i16::from(reader.read_u8()?)),
        FieldType::Tiny => Value::TinyInt(reader.read_i8()?),
        FieldType::Short if unsigned => Value::Int(i32::from(reader.read_u16_le()?)),
        FieldType::Short | FieldType::Year => Value::SmallInt(reader.read_i16_le()?),
        FieldType::Long | FieldType::Int24 if unsigned => {
            Value::BigInt(i64::from(reader.read_u32_le()?))
        }
        FieldType::Long | FieldType::Int24 => Value::Int(reader.read_i32_le()?),
        FieldType::LongLong if unsigned => Value::from_u64(reader.read_u64_le()?),
        FieldType::LongLong => Value::BigInt(reader.read_i64_le()?),
        FieldType::Float => Value::Float(reader.read_f32_le()?),
        FieldType::Double => Value::Double(reader.read_f64_le()?),
        FieldType::Null => Value::Null,
        FieldType::Date | FieldType::NewDate => Value::Date(decode_binary_datetime(reader)?.date),
        FieldType::DateTime
        | FieldType::DateTime2
        | FieldType::Timestamp
        | FieldType::Timestamp2 => Value::DateTime(decode_binary_datetime(reader)?),
        FieldType::Time | FieldType::Time2 => Value::Time(decode_binary_time(reader)?),
        _ => {
            // Everything else is a length-encoded byte string, decoded like text.
            let bytes = reader.read_lenenc_bytes()?;
            decode_text_value(column, bytes)
        }
    };
    Ok(value)
}

/// Binary DATE/DATETIME/TIMESTAMP: length byte 0, 4, 7 or 11.
fn decode_binary_datetime(reader: &mut PacketReader<'_>) -> Result<DateTime> {
    let len = reader.read_u8()?;
    let mut dt = DateTime::default();
    if len >= 4 {
        dt.date = Date::new(reader.read_u16_le()?, reader.read_u8()?, reader.read_u8()?);
    }
    if len >= 7 {
        dt.hour = reader.read_u8()?;
        dt.minute = reader.read_u8()?;
        dt.second = reader.read_u8()?;
    }
    if len >= 11 {
        dt.micros = reader.read_u32_le()?;
    }
    if !matches!(len, 0 | 4 | 7 | 11) {
        return Err(Error::protocol(
            ProtocolErrorKind::Malformed,
            format!("invalid binary datetime length {len}"),
        ));
    }
    Ok(dt)
}

/// Binary TIME: length byte 0, 8 or 12.
fn decode_binary_time(reader: &mut PacketReader<'_>) -> Result<Time> {
    let len = reader.read_u8()?;
    let mut t = Time::default();
    match len {
        0 => {}
        8 | 12 => {
            t.negative = reader.read_u8()? != 0;
            t.days = reader.read_u32_le()?;
            t.hours = reader.read_u8()?;
            t.minutes = reader.read_u8()?;
            t.seconds = reader.read_u8()?;
            if len == 12 {
                t.micros = reader.read_u32_le()?;
            }
        }
        other => {
            return Err(Error::protocol(
                ProtocolErrorKind::Malformed,
                format!("invalid binary time length {other}"),
            ));
        }
    }
    Ok(t)
}

/// Wire type for a bound parameter: field type plus the unsigned flag.
pub fn param_type(value: &Value) -> (FieldType, bool) {
    match value {
        Value::Null => (FieldType::Null, false),
        Value::Bool(_) | Value::TinyInt(_) => (FieldType::Tiny, false),
        Value::SmallInt(_) => (FieldType::Short, false),
        Value::Int(_) => (FieldType::Long, false),
        Value::BigInt(_) => (FieldType::LongLong, false),
        Value::UBigInt(_) => (FieldType::LongLong, true),
        Value::Float(_) => (FieldType::Float, false),
        Value::Double(_) => (FieldType::Double, false),
        Value::Decimal(_) => (FieldType::NewDecimal, false),
        Value::Text(_) | Value::Json(_) => (FieldType::VarString, false),
        Value::Bytes(_) => (FieldType::Blob, false),
        Value::Date(_) => (FieldType::Date, false),
        Value::Time(_) => (FieldType::Time, false),
        Value::DateTime(_) => (FieldType::DateTime, false),
    }
}

/// Encode a non-NULL parameter value in binary protocol layout.
pub fn encode_binary_param(writer: &mut PacketWriter, value: &Value) {
    match value {
        Value::Null => {}
        Value::Bool(b) => writer.write_u8(u8::from(*b)),
        Value::TinyInt(i) => writer.write_bytes(&i.to_le_bytes()),
        Value::SmallInt(i) => writer.write_bytes(&i.to_le_bytes()),
        Value::Int(i) => writer.write_bytes(&i.to_le_bytes()),
        Value::BigInt(i) => writer.write_bytes(&i.to_le_bytes()),
        Value::UBigInt(u) => writer.write_u64_le(*u),
        Value::Float(f) => writer.write_bytes(&f.to_le_bytes()),
        Value::Double(f) => writer.write_bytes(&f.to_le_bytes()),
        Value::Decimal(s) | Value::Text(s) => writer.write_lenenc_string(s),
        Value::Bytes(b) => writer.write_lenenc_bytes(b),
        Value::Json(j) => writer.write_lenenc_string(&j.to_string()),
        Value::Date(d) => {
            if d.is_zero() {
                writer.write_u8(0);
            } else {
                writer.write_u8(4);
                write_date(writer, *d);
            }
        }
        Value::DateTime(dt) => {
            let has_time = dt.hour != 0 || dt.minute != 0 || dt.second != 0;
            if dt.micros != 0 {
                writer.write_u8(11);
            } else if has_time {
                writer.write_u8(7);
            } else if !dt.date.is_zero() {
                writer.write_u8(4);
            } else {
                writer.write_u8(0);
                return;
            }
            write_date(writer, dt.date);
            if has_time || dt.micros != 0 {
                writer.write_u8(dt.hour);
                writer.write_u8(dt.minute);
                writer.write_u8(dt.second);
            }
            if dt.micros != 0 {
                writer.write_u32_le(dt.micros);
            }
        }
        Value::Time(t) => {
            if t.is_zero() {
                writer.write_u8(0);
                return;
            }
            writer.write_u8(if t.micros != 0 { 12 } else { 8 });
            writer.write_u8(u8::from(t.negative));
            writer.write_u32_le(t.days);
            writer.write_u8(t.hours);
            writer.write_u8(t.minutes);
            writer.write_u8(t.seconds);
            if t.micros != 0 {
                writer.write_u32_le(t.micros);
            }
        }
    }
}

fn write_date(writer: &mut PacketWriter, date: Date) {
    writer.write_u16_le(date.year);
    writer.write_u8(date.month);
    writer.write_u8(date.day);
}
