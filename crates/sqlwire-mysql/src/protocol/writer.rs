//! Payload builder for outgoing packets.
//!
//! The writer only produces payload bytes. Headers, splitting and sequence
//! numbers belong to [`crate::stream::PacketStream`].

use crate::protocol::Command;

/// A writer for MySQL protocol data.
#[derive(Debug, Default)]
pub struct PacketWriter {
    buffer: Vec<u8>,
}

impl PacketWriter {
    pub fn new() -> Self {
        Self::with_capacity(256)
    }

    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            buffer: Vec::with_capacity(capacity),
        }
    }

    /// Start a command payload with its command byte.
    pub fn command(command: Command) -> Self {
        let mut writer = Self::new();
        writer.write_u8(command as u8);
        writer
    }

    pub fn len(&self) -> usize {
        self.buffer.len()
    }

    pub fn is_empty(&self) -> bool {
        self.buffer.is_empty()
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.buffer
    }

    pub fn into_bytes(self) -> Vec<u8> {
        self.buffer
    }

    pub fn write_u8(&mut self, value: u8) {
        self.buffer.push(value);
    }

    pub fn write_u16_le(&mut self, value: u16) {
        self.buffer.extend_from_slice(&value.to_le_bytes());
    }

    /// Write the low 3 bytes of `value`, little-endian.
    pub fn write_u24_le(&mut self, value: u32) {
        self.buffer.extend_from_slice(&value.to_le_bytes()[..3]);
    }

    pub fn write_u32_le(&mut self, value: u32) {
        self.buffer.extend_from_slice(&value.to_le_bytes());
    }

    pub fn write_u64_le(&mut self, value: u64) {
        self.buffer.extend_from_slice(&value.to_le_bytes());
    }

    /// Write a length-encoded integer.
    ///
    /// - below 251: one byte
    /// - below 2^16: 0xFC + 2 bytes
    /// - below 2^24: 0xFD + 3 bytes
    /// - otherwise: 0xFE + 8 bytes
    pub fn write_lenenc_int(&mut self, value: u64) {
        if value < 251 {
            self.write_u8(value as u8);
        } else if value < 0x1_0000 {
            self.write_u8(0xFC);
            self.write_u16_le(value as u16);
        } else if value < 0x100_0000 {
            self.write_u8(0xFD);
            self.write_u24_le(value as u32);
        } else {
            self.write_u8(0xFE);
            self.write_u64_le(value);
        }
    }

    pub fn write_lenenc_string(&mut self, s: &str) {
        self.write_lenenc_bytes(s.as_bytes());
    }

    pub fn write_lenenc_bytes(&mut self, data: &[u8]) {
        self.write_lenenc_int(data.len() as u64);
        self.buffer.extend_from_slice(data);
    }

    pub fn write_null_string(&mut self, s: &str) {
        self.write_null_bytes(s.as_bytes());
    }

    pub fn write_null_bytes(&mut self, data: &[u8]) {
        self.buffer.extend_from_slice(data);
        self.buffer.push(0);
    }

    pub fn write_bytes(&mut self, data: &[u8]) {
        self.buffer.extend_from_slice(data);
    }

    /// Write zeros (padding).
    pub fn write_zeros(&mut self, count: usize) {
        self.buffer.resize(self.buffer.len() + count, 0);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::PacketReader;

    #[test]
    fn test_write_fixed_ints() {
        let mut writer = PacketWriter::new();
        writer.write_u8(0x42);
        writer.write_u16_le(0x1234);
        writer.write_u24_le(0x0012_3456);
        writer.write_u32_le(0x1234_5678);
        assert_eq!(
            writer.as_bytes(),
            &[0x42, 0x34, 0x12, 0x56, 0x34, 0x12, 0x78, 0x56, 0x34, 0x12]
        );
    }

    #[test]
    fn test_lenenc_prefix_thresholds() {
        let cases: [(u64, u8, usize); 8] = [
            (0, 0x00, 1),
            (250, 0xFA, 1),
            (251, 0xFC, 3),
            (65_535, 0xFC, 3),
            (65_536, 0xFD, 4),
            (16_777_215, 0xFD, 4),
            (16_777_216, 0xFE, 9),
            (u64::MAX, 0xFE, 9),
        ];
        for (value, prefix, width) in cases {
            let mut writer = PacketWriter::new();
            writer.write_lenenc_int(value);
            let bytes = writer.into_bytes();
            assert_eq!(bytes.len(), width, "width for {value}");
            if width > 1 {
                assert_eq!(bytes[0], prefix, "prefix for {value}");
            }
            let mut reader = PacketReader::new(&bytes);
            assert_eq!(reader.read_lenenc_int().unwrap(), value);
            assert!(reader.is_empty());
        }
    }

    #[test]
    fn test_write_strings() {
        let mut writer = PacketWriter::new();
        writer.write_null_string("root");
        writer.write_lenenc_string("hello");
        assert_eq!(writer.as_bytes(), b"root\0\x05hello");
    }

    #[test]
    fn test_command_prefix() {
        let mut writer = PacketWriter::command(Command::Query);
        writer.write_bytes(b"SELECT 1");
        assert_eq!(writer.as_bytes(), b"\x03SELECT 1");
    }
}
