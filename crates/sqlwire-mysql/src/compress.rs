//! Compressed protocol framing.
//!
//! Once `CLIENT_COMPRESS` is negotiated every byte the packet framer
//! produces travels inside compressed frames:
//!
//! - 3 bytes: length of the frame payload
//! - 1 byte: compressed sequence number
//! - 3 bytes: length before compression, 0 if the payload is stored as is
//!
//! Writes are cached until the framer flushes a complete logical packet,
//! then sent as one frame (or several, if the packet exceeds the block size).

use std::collections::HashMap;
use std::io::{self, Read, Write};
use std::sync::Arc;
use std::time::Duration;

use flate2::Compression;
use flate2::read::ZlibDecoder;
use flate2::write::ZlibEncoder;
use parking_lot::Mutex;

use crate::protocol::MAX_BLOCK_SIZE;
use crate::stream::Channel;

/// Compressed frame header length.
pub const COMPRESSED_HEADER_SIZE: usize = 7;

/// Payloads shorter than this are sent uncompressed.
pub const MIN_COMPRESS_LENGTH: usize = 50;

const MIN_SIZE_CLASS: u32 = 10;
const MAX_PER_CLASS: usize = 4;

/// Reusable byte buffers grouped by power-of-two capacity.
///
/// Callers take a buffer with [`BufferPool::get`] and hand it back with
/// [`BufferPool::put`] when done. Buffers that are never returned are
/// simply dropped.
#[derive(Debug, Default)]
pub struct BufferPool {
    classes: Mutex<HashMap<u32, Vec<Vec<u8>>>>,
}

impl BufferPool {
    pub fn new() -> Self {
        Self::default()
    }

    /// Smallest class whose buffers all hold at least `len` bytes.
    fn class_for_request(len: usize) -> u32 {
        len.max(1).next_power_of_two().trailing_zeros().max(MIN_SIZE_CLASS)
    }

    /// Largest class this capacity fully covers.
    fn class_for_capacity(capacity: usize) -> Option<u32> {
        if capacity < (1 << MIN_SIZE_CLASS) {
            return None;
        }
        Some(usize::BITS - 1 - capacity.leading_zeros())
    }

    /// Take an empty buffer with capacity for at least `len` bytes.
    pub fn get(&self, len: usize) -> Vec<u8> {
        let class = Self::class_for_request(len);
        if let Some(mut buf) = self.classes.lock().get_mut(&class).and_then(Vec::pop) {
            buf.clear();
            return buf;
        }
        Vec::with_capacity(1 << class)
    }

    /// Return a buffer for reuse.
    pub fn put(&self, buf: Vec<u8>) {
        let Some(class) = Self::class_for_capacity(buf.capacity()) else {
            return;
        };
        let mut classes = self.classes.lock();
        let slot = classes.entry(class).or_default();
        if slot.len() < MAX_PER_CLASS {
            slot.push(buf);
        }
    }

    /// Number of pooled buffers, across all classes.
    pub fn pooled(&self) -> usize {
        self.classes.lock().values().map(Vec::len).sum()
    }
}

/// A [`Channel`] wrapper speaking the compressed protocol.
pub struct CompressedStream<S> {
    inner: S,
    sequence: u8,
    write_cache: Vec<u8>,
    read_buf: Vec<u8>,
    read_pos: usize,
    header: [u8; COMPRESSED_HEADER_SIZE],
    header_filled: usize,
    payload: Option<Vec<u8>>,
    payload_filled: usize,
    buffers: Arc<BufferPool>,
}

impl<S> std::fmt::Debug for CompressedStream<S> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CompressedStream")
            .field("sequence", &self.sequence)
            .field("cached", &self.write_cache.len())
            .field("buffered", &(self.read_buf.len() - self.read_pos))
            .field("partial_frame", &(self.header_filled > 0))
            .finish_non_exhaustive()
    }
}

impl<S: Channel> CompressedStream<S> {
    pub fn new(inner: S, buffers: Arc<BufferPool>) -> Self {
        Self {
            inner,
            sequence: 0,
            write_cache: Vec::new(),
            read_buf: Vec::new(),
            read_pos: 0,
            header: [0; COMPRESSED_HEADER_SIZE],
            header_filled: 0,
            payload: None,
            payload_filled: 0,
            buffers,
        }
    }

    pub fn get_ref(&self) -> &S {
        &self.inner
    }

    pub fn get_mut(&mut self) -> &mut S {
        &mut self.inner
    }

    /// Compressed sequence expected on the next frame.
    pub fn sequence(&self) -> u8 {
        self.sequence
    }

    fn write_frame(&mut self, chunk: &[u8]) -> io::Result<()> {
        let mut compressed = None;
        if chunk.len() >= MIN_COMPRESS_LENGTH {
            let mut encoder =
                ZlibEncoder::new(self.buffers.get(chunk.len()), Compression::default());
            encoder.write_all(chunk)?;
            let out = encoder.finish()?;
            if out.len() < chunk.len() {
                compressed = Some(out);
            } else {
                self.buffers.put(out);
            }
        }

        let (body, uncompressed_len) = match &compressed {
            Some(out) => (out.as_slice(), chunk.len()),
            None => (chunk, 0),
        };

        let mut frame = self.buffers.get(COMPRESSED_HEADER_SIZE + body.len());
        frame.extend_from_slice(&(body.len() as u32).to_le_bytes()[..3]);
        frame.push(self.sequence);
        frame.extend_from_slice(&(uncompressed_len as u32).to_le_bytes()[..3]);
        frame.extend_from_slice(body);
        self.sequence = self.sequence.wrapping_add(1);

        let result = self.inner.write_all(&frame);
        self.buffers.put(frame);
        if let Some(out) = compressed {
            self.buffers.put(out);
        }
        result
    }

    /// Read and unpack the next frame into the read buffer.
    ///
    /// A frame cut short by a read timeout stays buffered; the next call
    /// resumes where the previous one stopped, so the stream stays in sync.
    fn fill_frame(&mut self) -> io::Result<bool> {
        while self.header_filled < COMPRESSED_HEADER_SIZE {
            let n = read_some(&mut self.inner, &mut self.header[self.header_filled..])?;
            if n == 0 {
                // A clean close between frames reads as end of stream.
                if self.header_filled == 0 {
                    return Ok(false);
                }
                return Err(truncated_frame());
            }
            self.header_filled += n;
        }

        let header = self.header;
        let payload_len = u32::from_le_bytes([header[0], header[1], header[2], 0]) as usize;
        let uncompressed_len = u32::from_le_bytes([header[4], header[5], header[6], 0]) as usize;

        if self.payload.is_none() {
            let sequence = header[3];
            if sequence != self.sequence {
                return Err(io::Error::new(
                    io::ErrorKind::InvalidData,
                    format!(
                        "compressed packets out of order: expected sequence {}, got {sequence}",
                        self.sequence
                    ),
                ));
            }
            self.sequence = sequence.wrapping_add(1);
            let mut payload = self.buffers.get(payload_len);
            payload.resize(payload_len, 0);
            self.payload = Some(payload);
            self.payload_filled = 0;
        }

        if let Some(payload) = self.payload.as_mut() {
            while self.payload_filled < payload.len() {
                let n = read_some(&mut self.inner, &mut payload[self.payload_filled..])?;
                if n == 0 {
                    return Err(truncated_frame());
                }
                self.payload_filled += n;
            }
        }
        let payload = self.payload.take().unwrap_or_default();
        self.header_filled = 0;
        self.payload_filled = 0;

        self.read_buf.clear();
        self.read_pos = 0;
        if uncompressed_len == 0 {
            self.read_buf.extend_from_slice(&payload);
        } else {
            self.read_buf.reserve(uncompressed_len);
            ZlibDecoder::new(payload.as_slice()).read_to_end(&mut self.read_buf)?;
            if self.read_buf.len() != uncompressed_len {
                self.buffers.put(payload);
                return Err(io::Error::new(
                    io::ErrorKind::InvalidData,
                    format!(
                        "compressed frame inflated to {} bytes, header says {uncompressed_len}",
                        self.read_buf.len()
                    ),
                ));
            }
        }
        self.buffers.put(payload);
        Ok(true)
    }
}

fn read_some<R: Read + ?Sized>(reader: &mut R, buf: &mut [u8]) -> io::Result<usize> {
    loop {
        match reader.read(buf) {
            Err(e) if e.kind() == io::ErrorKind::Interrupted => {}
            result => return result,
        }
    }
}

fn truncated_frame() -> io::Error {
    io::Error::new(io::ErrorKind::UnexpectedEof, "connection closed inside a compressed frame")
}

impl<S: Channel> Read for CompressedStream<S> {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        while self.read_pos >= self.read_buf.len() {
            if !self.fill_frame()? {
                return Ok(0);
            }
        }
        let available = &self.read_buf[self.read_pos..];
        let n = available.len().min(buf.len());
        buf[..n].copy_from_slice(&available[..n]);
        self.read_pos += n;
        Ok(n)
    }
}

impl<S: Channel> Write for CompressedStream<S> {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.write_cache.extend_from_slice(buf);
        Ok(buf.len())
    }

    /// Send everything cached since the last flush.
    fn flush(&mut self) -> io::Result<()> {
        if !self.write_cache.is_empty() {
            let cache = std::mem::take(&mut self.write_cache);
            let mut result = Ok(());
            for chunk in cache.chunks(MAX_BLOCK_SIZE) {
                result = self.write_frame(chunk);
                if result.is_err() {
                    break;
                }
            }
            self.write_cache = cache;
            self.write_cache.clear();
            result?;
        }
        self.inner.flush()
    }
}

impl<S: Channel> Channel for CompressedStream<S> {
    fn set_timeout(&mut self, timeout: Option<Duration>) -> io::Result<()> {
        self.inner.set_timeout(timeout)
    }

    fn reset_sequence(&mut self) {
        self.sequence = 0;
        self.inner.reset_sequence();
    }

    fn shutdown(&mut self) {
        self.inner.shutdown();
    }

    fn is_secure(&self) -> bool {
        self.inner.is_secure()
    }
}
