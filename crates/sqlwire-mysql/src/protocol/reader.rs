//! Cursor over an assembled packet payload.
//!
//! Every read is bounds-checked; running off the end of the payload is a
//! malformed-packet protocol error rather than a panic.

use sqlwire_core::{Error, ProtocolErrorKind, Result};

/// A reader for MySQL protocol data.
#[derive(Debug)]
pub struct PacketReader<'a> {
    data: &'a [u8],
    pos: usize,
}

fn truncated(what: &str, need: usize, have: usize) -> Error {
    Error::protocol(
        ProtocolErrorKind::Malformed,
        format!("truncated packet reading {what}: need {need} bytes, have {have}"),
    )
}

impl<'a> PacketReader<'a> {
    /// Create a new reader from a byte slice.
    pub fn new(data: &'a [u8]) -> Self {
        Self { data, pos: 0 }
    }

    /// Get remaining bytes in the buffer.
    pub fn remaining(&self) -> usize {
        self.data.len().saturating_sub(self.pos)
    }

    /// Current offset into the payload.
    pub fn position(&self) -> usize {
        self.pos
    }

    /// Check if we've reached the end of the data.
    pub fn is_empty(&self) -> bool {
        self.pos >= self.data.len()
    }

    /// Peek at the next byte without advancing.
    pub fn peek(&self) -> Option<u8> {
        self.data.get(self.pos).copied()
    }

    fn take<const N: usize>(&mut self, what: &str) -> Result<[u8; N]> {
        let bytes = self.read_bytes(N).map_err(|_| truncated(what, N, self.remaining()))?;
        let mut out = [0u8; N];
        out.copy_from_slice(bytes);
        Ok(out)
    }

    pub fn read_u8(&mut self) -> Result<u8> {
        Ok(self.take::<1>("u8")?[0])
    }

    pub fn read_u16_le(&mut self) -> Result<u16> {
        Ok(u16::from_le_bytes(self.take("u16")?))
    }

    /// Read a 3-byte little-endian integer.
    pub fn read_u24_le(&mut self) -> Result<u32> {
        let [a, b, c] = self.take("u24")?;
        Ok(u32::from_le_bytes([a, b, c, 0]))
    }

    pub fn read_u32_le(&mut self) -> Result<u32> {
        Ok(u32::from_le_bytes(self.take("u32")?))
    }

    pub fn read_u64_le(&mut self) -> Result<u64> {
        Ok(u64::from_le_bytes(self.take("u64")?))
    }

    pub fn read_i8(&mut self) -> Result<i8> {
        Ok(i8::from_le_bytes(self.take("i8")?))
    }

    pub fn read_i16_le(&mut self) -> Result<i16> {
        Ok(i16::from_le_bytes(self.take("i16")?))
    }

    pub fn read_i32_le(&mut self) -> Result<i32> {
        Ok(i32::from_le_bytes(self.take("i32")?))
    }

    pub fn read_i64_le(&mut self) -> Result<i64> {
        Ok(i64::from_le_bytes(self.take("i64")?))
    }

    pub fn read_f32_le(&mut self) -> Result<f32> {
        Ok(f32::from_le_bytes(self.take("f32")?))
    }

    pub fn read_f64_le(&mut self) -> Result<f64> {
        Ok(f64::from_le_bytes(self.take("f64")?))
    }

    /// Read a length-encoded integer that may be NULL.
    ///
    /// - 0x00-0xFA: the byte is the value
    /// - 0xFB: NULL
    /// - 0xFC / 0xFD / 0xFE: 2 / 3 / 8 byte value follows
    /// - 0xFF: invalid here (it starts an ERR packet)
    pub fn read_lenenc_int_or_null(&mut self) -> Result<Option<u64>> {
        let first = self.read_u8()?;
        match first {
            0x00..=0xFA => Ok(Some(u64::from(first))),
            0xFB => Ok(None),
            0xFC => self.read_u16_le().map(|v| Some(u64::from(v))),
            0xFD => self.read_u24_le().map(|v| Some(u64::from(v))),
            0xFE => self.read_u64_le().map(Some),
            0xFF => Err(Error::protocol(
                ProtocolErrorKind::Malformed,
                "0xFF is not a valid length-encoded integer prefix",
            )),
        }
    }

    /// Read a length-encoded integer, treating NULL as malformed.
    pub fn read_lenenc_int(&mut self) -> Result<u64> {
        self.read_lenenc_int_or_null()?.ok_or_else(|| {
            Error::protocol(
                ProtocolErrorKind::Malformed,
                "unexpected NULL length-encoded integer",
            )
        })
    }

    /// Read a length-encoded byte string, `None` for SQL NULL.
    pub fn read_lenenc_bytes_or_null(&mut self) -> Result<Option<&'a [u8]>> {
        match self.read_lenenc_int_or_null()? {
            Some(len) => {
                let len = usize::try_from(len)
                    .map_err(|_| truncated("lenenc bytes", usize::MAX, self.remaining()))?;
                self.read_bytes(len).map(Some)
            }
            None => Ok(None),
        }
    }

    /// Read a length-encoded byte string.
    pub fn read_lenenc_bytes(&mut self) -> Result<&'a [u8]> {
        let len = self.read_lenenc_int()?;
        let len = usize::try_from(len)
            .map_err(|_| truncated("lenenc bytes", usize::MAX, self.remaining()))?;
        self.read_bytes(len)
    }

    /// Read a length-encoded string (lossy UTF-8).
    pub fn read_lenenc_string(&mut self) -> Result<String> {
        self.read_lenenc_bytes()
            .map(|b| String::from_utf8_lossy(b).into_owned())
    }

    /// Read a NUL-terminated byte string. A missing terminator consumes the rest.
    pub fn read_null_bytes(&mut self) -> &'a [u8] {
        let rest = &self.data[self.pos.min(self.data.len())..];
        match rest.iter().position(|&b| b == 0) {
            Some(end) => {
                self.pos += end + 1;
                &rest[..end]
            }
            None => {
                self.pos = self.data.len();
                rest
            }
        }
    }

    /// Read a NUL-terminated string (lossy UTF-8).
    pub fn read_null_string(&mut self) -> String {
        String::from_utf8_lossy(self.read_null_bytes()).into_owned()
    }

    /// Read a fixed-length string (lossy UTF-8).
    pub fn read_string(&mut self, len: usize) -> Result<String> {
        let bytes = self.read_bytes(len)?;
        Ok(String::from_utf8_lossy(bytes).into_owned())
    }

    /// Read remaining data as a string.
    pub fn read_rest_string(&mut self) -> String {
        String::from_utf8_lossy(self.read_rest()).into_owned()
    }

    /// Read a fixed number of bytes.
    pub fn read_bytes(&mut self, len: usize) -> Result<&'a [u8]> {
        if self.remaining() < len {
            return Err(truncated("bytes", len, self.remaining()));
        }
        let bytes = &self.data[self.pos..self.pos + len];
        self.pos += len;
        Ok(bytes)
    }

    /// Read remaining bytes.
    pub fn read_rest(&mut self) -> &'a [u8] {
        let rest = &self.data[self.pos.min(self.data.len())..];
        self.pos = self.data.len();
        rest
    }

    /// Skip a number of bytes.
    pub fn skip(&mut self, n: usize) -> Result<()> {
        self.read_bytes(n).map(|_| ())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_read_fixed_ints() {
        let mut reader = PacketReader::new(&[
            0x42, 0x34, 0x12, 0x56, 0x34, 0x12, 0x78, 0x56, 0x34, 0x12,
        ]);
        assert_eq!(reader.read_u8().unwrap(), 0x42);
        assert_eq!(reader.read_u16_le().unwrap(), 0x1234);
        assert_eq!(reader.read_u24_le().unwrap(), 0x0012_3456);
        assert_eq!(reader.read_u32_le().unwrap(), 0x1234_5678);
        assert!(reader.is_empty());
        assert!(reader.read_u8().is_err());
    }

    #[test]
    fn test_read_u64_le() {
        let mut reader = PacketReader::new(&[0x01, 0x02, 0x03, 0x04, 0x05, 0x06, 0x07, 0x08]);
        assert_eq!(reader.read_u64_le().unwrap(), 0x0807_0605_0403_0201);
    }

    #[test]
    fn test_read_lenenc_int() {
        let mut reader = PacketReader::new(&[0xFA]);
        assert_eq!(reader.read_lenenc_int().unwrap(), 250);

        let mut reader = PacketReader::new(&[0xFC, 0x34, 0x12]);
        assert_eq!(reader.read_lenenc_int().unwrap(), 0x1234);

        let mut reader = PacketReader::new(&[0xFD, 0x56, 0x34, 0x12]);
        assert_eq!(reader.read_lenenc_int().unwrap(), 0x0012_3456);

        let mut reader = PacketReader::new(&[0xFE, 0x01, 0x02, 0x03, 0x04, 0x05, 0x06, 0x07, 0x08]);
        assert_eq!(reader.read_lenenc_int().unwrap(), 0x0807_0605_0403_0201);
    }

    #[test]
    fn test_read_lenenc_null_and_invalid() {
        let mut reader = PacketReader::new(&[0xFB]);
        assert_eq!(reader.read_lenenc_int_or_null().unwrap(), None);

        let mut reader = PacketReader::new(&[0xFB]);
        assert!(reader.read_lenenc_int().is_err());

        let mut reader = PacketReader::new(&[0xFF]);
        assert!(reader.read_lenenc_int_or_null().is_err());

        // prefix promises 2 bytes but only 1 follows
        let mut reader = PacketReader::new(&[0xFC, 0x01]);
        let err = reader.read_lenenc_int().unwrap_err();
        assert!(matches!(err, Error::Protocol(ref p) if p.kind == ProtocolErrorKind::Malformed));
    }

    #[test]
    fn test_read_null_string() {
        let mut reader = PacketReader::new(b"hello\0world\0tail");
        assert_eq!(reader.read_null_string(), "hello");
        assert_eq!(reader.read_null_string(), "world");
        assert_eq!(reader.read_null_string(), "tail");
        assert!(reader.is_empty());
    }

    #[test]
    fn test_read_lenenc_bytes_or_null() {
        let mut reader = PacketReader::new(&[0x02, b'h', b'i', 0xFB, 0x00]);
        assert_eq!(reader.read_lenenc_bytes_or_null().unwrap(), Some(&b"hi"[..]));
        assert_eq!(reader.read_lenenc_bytes_or_null().unwrap(), None);
        assert_eq!(reader.read_lenenc_bytes_or_null().unwrap(), Some(&b""[..]));
    }

    #[test]
    fn test_read_lenenc_string_truncated() {
        let mut reader = PacketReader::new(&[0x05, b'h', b'e']);
        assert!(reader.read_lenenc_string().is_err());
    }
}
