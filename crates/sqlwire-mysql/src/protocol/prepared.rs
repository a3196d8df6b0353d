//! Prepared statement (binary protocol) packets.
//!
//! Covers the COM_STMT_PREPARE response, COM_STMT_EXECUTE payload
//! construction and binary result row decoding.

use sqlwire_core::{Error, ProtocolErrorKind, Result, Value};

use super::{Command, PacketReader, PacketWriter};
use crate::types::{ColumnDef, FieldType, decode_binary_value, encode_binary_param, param_type};

/// COM_STMT_EXECUTE cursor flags.
pub mod cursor_type {
    pub const NO_CURSOR: u8 = 0x00;
    pub const READ_ONLY: u8 = 0x01;
}

/// First packet of a COM_STMT_PREPARE response.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StmtPrepareOk {
    pub statement_id: u32,
    pub num_columns: u16,
    pub num_params: u16,
    pub warnings: u16,
}

impl StmtPrepareOk {
    /// Parse `0x00, stmt_id(4), num_columns(2), num_params(2), reserved(1), warnings(2)`.
    pub fn parse(payload: &[u8]) -> Result<Self> {
        if payload.len() < 12 {
            return Err(Error::protocol(
                ProtocolErrorKind::Malformed,
                format!("COM_STMT_PREPARE response too short: {} bytes", payload.len()),
            ));
        }
        let mut reader = PacketReader::new(payload);
        if reader.read_u8()? != 0x00 {
            return Err(Error::protocol(
                ProtocolErrorKind::UnexpectedPacket,
                "expected COM_STMT_PREPARE OK",
            ));
        }
        let statement_id = reader.read_u32_le()?;
        let num_columns = reader.read_u16_le()?;
        let num_params = reader.read_u16_le()?;
        reader.skip(1)?;
        let warnings = reader.read_u16_le()?;
        Ok(Self {
            statement_id,
            num_columns,
            num_params,
            warnings,
        })
    }
}

/// Tracks the parameter types last sent for a statement.
///
/// The server remembers the bound types after the first execute, so the
/// type block is only resent when a parameter's wire type changes.
#[derive(Debug, Clone, Default)]
pub struct ParamBinding {
    sent_types: Option<Vec<(FieldType, bool)>>,
}

impl ParamBinding {
    pub fn new() -> Self {
        Self::default()
    }

    /// Whether the next execute must include the type block.
    pub fn needs_rebind(&self, params: &[Value]) -> bool {
        match &self.sent_types {
            None => true,
            Some(types) => {
                types.len() != params.len()
                    || types.iter().zip(params).any(|(t, p)| *t != param_type(p))
            }
        }
    }

    /// Forget the sent types, e.g. after COM_STMT_RESET.
    pub fn clear(&mut self) {
        self.sent_types = None;
    }

    /// Build a COM_STMT_EXECUTE payload and record the types sent.
    pub fn build_execute(&mut self, statement_id: u32, cursor: u8, params: &[Value]) -> Vec<u8> {
        let mut writer = PacketWriter::command(Command::StmtExecute);
        writer.write_u32_le(statement_id);
        writer.write_u8(cursor);
        // Iteration count is always 1.
        writer.write_u32_le(1);

        if !params.is_empty() {
            let mut null_bitmap = vec![0u8; params.len().div_ceil(8)];
            for (i, param) in params.iter().enumerate() {
                if param.is_null() {
                    null_bitmap[i / 8] |= 1 << (i % 8);
                }
            }
            writer.write_bytes(&null_bitmap);

            let rebind = self.needs_rebind(params);
            writer.write_u8(u8::from(rebind));
            if rebind {
                let types: Vec<_> = params.iter().map(param_type).collect();
                for (field_type, unsigned) in &types {
                    writer.write_u8(*field_type as u8);
                    writer.write_u8(if *unsigned { 0x80 } else { 0x00 });
                }
                self.sent_types = Some(types);
            }

            for param in params.iter().filter(|p| !p.is_null()) {
                encode_binary_param(&mut writer, param);
            }
        }

        writer.into_bytes()
    }
}

/// Build a COM_STMT_CLOSE payload. The server sends no response.
pub fn build_stmt_close(statement_id: u32) -> Vec<u8> {
    let mut writer = PacketWriter::command(Command::StmtClose);
    writer.write_u32_le(statement_id);
    writer.into_bytes()
}

/// Build a COM_STMT_RESET payload.
pub fn build_stmt_reset(statement_id: u32) -> Vec<u8> {
    let mut writer = PacketWriter::command(Command::StmtReset);
    writer.write_u32_le(statement_id);
    writer.into_bytes()
}

/// Build a COM_STMT_FETCH payload.
pub fn build_stmt_fetch(statement_id: u32, num_rows: u32) -> Vec<u8> {
    let mut writer = PacketWriter::command(Command::StmtFetch);
    writer.write_u32_le(statement_id);
    writer.write_u32_le(num_rows);
    writer.into_bytes()
}

/// Decodes binary protocol rows against a fixed column set.
#[derive(Debug, Clone, Copy)]
pub struct BinaryRowDecoder<'c> {
    columns: &'c [ColumnDef],
}

impl<'c> BinaryRowDecoder<'c> {
    /// The first two bits of a binary row's NULL bitmap are reserved.
    const BITMAP_OFFSET: usize = 2;

    pub fn new(columns: &'c [ColumnDef]) -> Self {
        Self { columns }
    }

    /// Decode one row: `0x00`, NULL bitmap, then the non-NULL values in order.
    pub fn decode(&self, payload: &[u8]) -> Result<Vec<Value>> {
        let mut reader = PacketReader::new(payload);
        let header = reader.read_u8()?;
        if header != 0x00 {
            return Err(Error::protocol(
                ProtocolErrorKind::Malformed,
                format!("binary row header 0x{header:02X}"),
            ));
        }
        let bitmap_len = (self.columns.len() + 7 + Self::BITMAP_OFFSET) / 8;
        let null_bitmap = reader.read_bytes(bitmap_len)?;

        let mut values = Vec::with_capacity(self.columns.len());
        for (i, column) in self.columns.iter().enumerate() {
            let bit = i + Self::BITMAP_OFFSET;
            if null_bitmap[bit / 8] & (1 << (bit % 8)) != 0 {
                values.push(Value::Null);
            } else {
                values.push(decode_binary_value(&mut reader, column)?);
            }
        }
        Ok(values)
    }
}
