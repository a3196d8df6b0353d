//! Byte transport and the packet framer that runs over it.
//!
//! [`Transport`] is the raw socket. [`Channel`] is what the framer needs
//! from whatever sits below it (plain socket, TLS, or the compression
//! layer). [`PacketStream`] turns a channel into logical MySQL packets.

use std::io::{self, Read, Write};
use std::net::{TcpStream, ToSocketAddrs};
#[cfg(unix)]
use std::os::unix::net::UnixStream;
use std::time::Duration;

use socket2::{SockRef, TcpKeepalive};
use sqlwire_core::{ConnectionError, ConnectionErrorKind, Error, ProtocolErrorKind, Result};

use crate::config::Endpoint;
use crate::protocol::{ErrPacket, MAX_BLOCK_SIZE, PacketHeader};

/// A bidirectional byte stream the framer can drive.
pub trait Channel: Read + Write + Send {
    /// Apply a read and write timeout. `None` blocks forever.
    fn set_timeout(&mut self, timeout: Option<Duration>) -> io::Result<()>;

    /// The packet sequence restarted at zero (a new command began).
    fn reset_sequence(&mut self) {}

    /// Close both directions. Errors are ignored.
    fn shutdown(&mut self) {}

    /// Whether secrets may be sent in cleartext over this channel.
    fn is_secure(&self) -> bool {
        false
    }
}

/// Raw socket to the server.
#[derive(Debug)]
pub enum Transport {
    Tcp(TcpStream),
    #[cfg(unix)]
    Unix(UnixStream),
}

impl Transport {
    /// Connect to `endpoint`, trying each resolved address in turn.
    pub fn connect(
        endpoint: &Endpoint,
        connect_timeout: Duration,
        keepalive: Option<Duration>,
    ) -> Result<Self> {
        match endpoint {
            Endpoint::Tcp { host, port } => {
                let addrs = (host.as_str(), *port).to_socket_addrs().map_err(|e| {
                    connect_error(
                        ConnectionErrorKind::Connect,
                        format!("failed to resolve {endpoint}: {e}"),
                        e,
                    )
                })?;

                let mut last_err = None;
                for addr in addrs {
                    match TcpStream::connect_timeout(&addr, connect_timeout) {
                        Ok(stream) => {
                            stream.set_nodelay(true).ok();
                            if let Some(idle) = keepalive {
                                let ka = TcpKeepalive::new().with_time(idle);
                                if let Err(e) = SockRef::from(&stream).set_tcp_keepalive(&ka) {
                                    tracing::warn!(error = %e, "failed to enable TCP keepalive");
                                }
                            }
                            tracing::debug!(%addr, "tcp connected");
                            return Ok(Transport::Tcp(stream));
                        }
                        Err(e) => {
                            tracing::debug!(%addr, error = %e, "tcp connect attempt failed");
                            last_err = Some(e);
                        }
                    }
                }

                let err = last_err.unwrap_or_else(|| {
                    io::Error::new(io::ErrorKind::NotFound, "host resolved to no addresses")
                });
                let kind = match err.kind() {
                    io::ErrorKind::ConnectionRefused => ConnectionErrorKind::Refused,
                    _ => ConnectionErrorKind::Connect,
                };
                if matches!(err.kind(), io::ErrorKind::TimedOut | io::ErrorKind::WouldBlock) {
                    return Err(Error::timeout("connect", Some(connect_timeout)));
                }
                Err(connect_error(
                    kind,
                    format!("failed to connect to {endpoint}: {err}"),
                    err,
                ))
            }
            #[cfg(unix)]
            Endpoint::Unix(path) => {
                let stream = UnixStream::connect(path).map_err(|e| {
                    let kind = match e.kind() {
                        io::ErrorKind::ConnectionRefused => ConnectionErrorKind::Refused,
                        _ => ConnectionErrorKind::Connect,
                    };
                    connect_error(kind, format!("failed to connect to {endpoint}: {e}"), e)
                })?;
                Ok(Transport::Unix(stream))
            }
            #[cfg(not(unix))]
            Endpoint::Unix(_) => Err(Error::connection(
                ConnectionErrorKind::Unsupported,
                "unix sockets are not available on this platform",
            )),
        }
    }
}

fn connect_error(kind: ConnectionErrorKind, message: String, source: io::Error) -> Error {
    Error::Connection(ConnectionError {
        kind,
        message,
        source: Some(Box::new(source)),
    })
}

impl Read for Transport {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        match self {
            Transport::Tcp(s) => s.read(buf),
            #[cfg(unix)]
            Transport::Unix(s) => s.read(buf),
        }
    }
}

impl Write for Transport {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        match self {
            Transport::Tcp(s) => s.write(buf),
            #[cfg(unix)]
            Transport::Unix(s) => s.write(buf),
        }
    }

    fn flush(&mut self) -> io::Result<()> {
        match self {
            Transport::Tcp(s) => s.flush(),
            #[cfg(unix)]
            Transport::Unix(s) => s.flush(),
        }
    }
}

impl Channel for Transport {
    fn set_timeout(&mut self, timeout: Option<Duration>) -> io::Result<()> {
        match self {
            Transport::Tcp(s) => {
                s.set_read_timeout(timeout)?;
                s.set_write_timeout(timeout)
            }
            #[cfg(unix)]
            Transport::Unix(s) => {
                s.set_read_timeout(timeout)?;
                s.set_write_timeout(timeout)
            }
        }
    }

    fn shutdown(&mut self) {
        let _ = match self {
            Transport::Tcp(s) => s.shutdown(std::net::Shutdown::Both),
            #[cfg(unix)]
            Transport::Unix(s) => s.shutdown(std::net::Shutdown::Both),
        };
    }

    fn is_secure(&self) -> bool {
        match self {
            Transport::Tcp(_) => false,
            #[cfg(unix)]
            Transport::Unix(_) => true,
        }
    }
}

impl<C: Channel + ?Sized> Channel for Box<C> {
    fn set_timeout(&mut self, timeout: Option<Duration>) -> io::Result<()> {
        (**self).set_timeout(timeout)
    }

    fn reset_sequence(&mut self) {
        (**self).reset_sequence();
    }

    fn shutdown(&mut self) {
        (**self).shutdown();
    }

    fn is_secure(&self) -> bool {
        (**self).is_secure()
    }
}

/// Map an I/O failure during `operation` to the driver error taxonomy.
///
/// Timed-out reads and writes become [`Error::Timeout`]; they are only
/// recoverable when no bytes of the packet were transferred, so `partial`
/// escalates them. End of stream is a protocol error. Everything else is
/// a lost connection.
pub(crate) fn map_io_error(
    err: io::Error,
    operation: &'static str,
    timeout: Option<Duration>,
    partial: bool,
) -> Error {
    match err.kind() {
        io::ErrorKind::WouldBlock | io::ErrorKind::TimedOut => {
            let e = Error::timeout(operation, timeout);
            if partial { e.escalate() } else { e }
        }
        io::ErrorKind::UnexpectedEof => Error::protocol(
            ProtocolErrorKind::UnexpectedEof,
            format!("connection closed by server during {operation}"),
        ),
        _ => Error::Connection(ConnectionError {
            kind: ConnectionErrorKind::Disconnected,
            message: format!("{operation} failed: {err}"),
            source: Some(Box::new(err)),
        }),
    }
}

/// Fill `buf` completely, looping over short reads.
///
/// `consumed` says whether earlier bytes of the same logical packet were
/// already read; it decides whether a timeout here can be recovered.
fn read_full<R: Read + ?Sized>(
    reader: &mut R,
    buf: &mut [u8],
    timeout: Option<Duration>,
    consumed: bool,
) -> Result<()> {
    let mut filled = 0;
    while filled < buf.len() {
        match reader.read(&mut buf[filled..]) {
            Ok(0) => {
                return Err(Error::protocol(
                    ProtocolErrorKind::UnexpectedEof,
                    format!(
                        "connection closed by server: expected {} more bytes",
                        buf.len() - filled
                    ),
                ));
            }
            Ok(n) => filled += n,
            Err(e) if e.kind() == io::ErrorKind::Interrupted => {}
            Err(e) => return Err(map_io_error(e, "read", timeout, consumed || filled > 0)),
        }
    }
    Ok(())
}

/// MySQL packet framer.
///
/// Owns the sequence byte for one physical connection. Outgoing payloads
/// are split into blocks of at most [`MAX_BLOCK_SIZE`] bytes; incoming
/// blocks are reassembled into one logical packet.
#[derive(Debug)]
pub struct PacketStream<S> {
    inner: S,
    sequence: u8,
    max_block_size: usize,
    max_packet_size: u64,
    timeout: Option<Duration>,
}

impl<S: Channel> PacketStream<S> {
    pub fn new(inner: S) -> Self {
        Self {
            inner,
            sequence: 0,
            max_block_size: MAX_BLOCK_SIZE,
            max_packet_size: u64::MAX,
            timeout: None,
        }
    }

    /// Sequence byte expected on the next packet in either direction.
    pub fn sequence(&self) -> u8 {
        self.sequence
    }

    pub fn set_sequence(&mut self, sequence: u8) {
        self.sequence = sequence;
    }

    /// Start a new command exchange: sequence back to zero.
    pub fn reset_sequence(&mut self) {
        self.sequence = 0;
        self.inner.reset_sequence();
    }

    pub fn max_block_size(&self) -> usize {
        self.max_block_size
    }

    pub fn max_packet_size(&self) -> u64 {
        self.max_packet_size
    }

    /// Largest logical payload the server accepts.
    pub fn set_max_packet_size(&mut self, size: u64) {
        self.max_packet_size = size;
    }

    pub fn timeout(&self) -> Option<Duration> {
        self.timeout
    }

    pub fn set_timeout(&mut self, timeout: Option<Duration>) -> Result<()> {
        self.inner
            .set_timeout(timeout)
            .map_err(|e| map_io_error(e, "set timeout", timeout, false))?;
        self.timeout = timeout;
        Ok(())
    }

    pub fn get_ref(&self) -> &S {
        &self.inner
    }

    pub fn get_mut(&mut self) -> &mut S {
        &mut self.inner
    }

    pub fn shutdown(&mut self) {
        self.inner.shutdown();
    }

    /// Swap the channel (TLS upgrade, compression) keeping framer state.
    pub fn map_inner<T: Channel>(self, f: impl FnOnce(S) -> Result<T>) -> Result<PacketStream<T>> {
        Ok(PacketStream {
            inner: f(self.inner)?,
            sequence: self.sequence,
            max_block_size: self.max_block_size,
            max_packet_size: self.max_packet_size,
            timeout: self.timeout,
        })
    }

    /// Write one logical packet, splitting it into physical blocks.
    ///
    /// A payload that ends exactly on a block boundary (the empty payload
    /// included) is followed by an empty block so the reader knows it ended.
    pub fn send_packet(&mut self, payload: &[u8]) -> Result<()> {
        if payload.len() as u64 > self.max_packet_size {
            return Err(Error::protocol(
                ProtocolErrorKind::PacketTooLarge,
                format!(
                    "packet too large: {} bytes exceeds max_allowed_packet {}",
                    payload.len(),
                    self.max_packet_size
                ),
            ));
        }

        let timeout = self.timeout;
        let mut written_any = false;
        for chunk in payload.chunks(self.max_block_size) {
            self.write_block(chunk)
                .map_err(|e| map_io_error(e, "write", timeout, written_any))?;
            written_any = true;
        }
        if payload.len() % self.max_block_size == 0 {
            self.write_block(&[])
                .map_err(|e| map_io_error(e, "write", timeout, written_any))?;
        }

        self.inner
            .flush()
            .map_err(|e| map_io_error(e, "flush", timeout, true))
    }

    fn write_block(&mut self, chunk: &[u8]) -> io::Result<()> {
        let header = PacketHeader {
            payload_length: chunk.len() as u32,
            sequence_id: self.sequence,
        };
        self.sequence = self.sequence.wrapping_add(1);
        let mut block = Vec::with_capacity(PacketHeader::SIZE + chunk.len());
        block.extend_from_slice(&header.to_bytes());
        block.extend_from_slice(chunk);
        self.inner.write_all(&block)
    }

    /// Read one logical packet, reassembling multi-block payloads.
    ///
    /// A sequence byte that does not match the expected value is a fatal
    /// desync.
    pub fn read_packet(&mut self) -> Result<Vec<u8>> {
        let mut payload = Vec::new();
        let mut consumed = false;
        loop {
            let mut header_buf = [0u8; PacketHeader::SIZE];
            read_full(&mut self.inner, &mut header_buf, self.timeout, consumed)?;
            let header = PacketHeader::from_bytes(&header_buf);

            if header.sequence_id != self.sequence {
                return Err(Error::protocol(
                    ProtocolErrorKind::SequenceMismatch,
                    format!(
                        "packets out of order: expected sequence {}, got {}",
                        self.sequence, header.sequence_id
                    ),
                ));
            }
            self.sequence = header.sequence_id.wrapping_add(1);

            let len = header.payload_length as usize;
            let start = payload.len();
            payload.resize(start + len, 0);
            read_full(&mut self.inner, &mut payload[start..], self.timeout, true)?;
            consumed = true;

            if len < self.max_block_size {
                return Ok(payload);
            }
        }
    }

    /// Read a packet, turning an ERR packet into a server error.
    pub fn receive(&mut self) -> Result<Vec<u8>> {
        let payload = self.read_packet()?;
        if payload.first() == Some(&0xFF) {
            return Err(ErrPacket::parse(&payload)?.into_error());
        }
        Ok(payload)
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use parking_lot::Mutex;
    use std::io::Cursor;
    use std::sync::Arc;

    /// In-memory duplex pipe: reads come from a scripted buffer, writes
    /// are captured. `chunk` limits how many bytes a single read returns.
    #[derive(Debug, Default)]
    pub(crate) struct MockChannel {
        pub(crate) input: Cursor<Vec<u8>>,
        pub(crate) output: Vec<u8>,
        pub(crate) chunk: Option<usize>,
        pub(crate) secure: bool,
        pub(crate) shut_down: bool,
        pub(crate) timeout: Option<Duration>,
        /// Input offset where one read times out before data flows again.
        pub(crate) stall_at: Option<u64>,
        /// Copy of everything written, readable after the mock is boxed away.
        pub(crate) tap: Option<Arc<Mutex<Vec<u8>>>>,
    }

    impl MockChannel {
        pub(crate) fn new(input: Vec<u8>) -> Self {
            Self {
                input: Cursor::new(input),
                ..Self::default()
            }
        }

        pub(crate) fn tapped(input: Vec<u8>) -> (Self, Arc<Mutex<Vec<u8>>>) {
            let tap = Arc::new(Mutex::new(Vec::new()));
            let channel = Self {
                tap: Some(Arc::clone(&tap)),
                ..Self::new(input)
            };
            (channel, tap)
        }

        pub(crate) fn trickle(input: Vec<u8>, chunk: usize) -> Self {
            Self {
                chunk: Some(chunk),
                ..Self::new(input)
            }
        }
    }

    impl Read for MockChannel {
        fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
            let limit = self.chunk.map_or(buf.len(), |c| c.min(buf.len()));
            if self.stall_at == Some(self.input.position()) {
                self.stall_at = None;
                return Err(io::Error::new(io::ErrorKind::WouldBlock, "stalled"));
            }
            if limit > 0
                && self.input.position() as usize >= self.input.get_ref().len()
                && self.timeout.is_some()
            {
                return Err(io::Error::new(io::ErrorKind::WouldBlock, "no data"));
            }
            self.input.read(&mut buf[..limit])
        }
    }

    impl Write for MockChannel {
        fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
            self.output.extend_from_slice(buf);
            if let Some(tap) = &self.tap {
                tap.lock().extend_from_slice(buf);
            }
            Ok(buf.len())
        }

        fn flush(&mut self) -> io::Result<()> {
            Ok(())
        }
    }

    impl Channel for MockChannel {
        fn set_timeout(&mut self, timeout: Option<Duration>) -> io::Result<()> {
            self.timeout = timeout;
            Ok(())
        }

        fn shutdown(&mut self) {
            self.shut_down = true;
        }

        fn is_secure(&self) -> bool {
            self.secure
        }
    }

    /// Frame `payload` as a single server packet.
    pub(crate) fn frame(sequence: u8, payload: &[u8]) -> Vec<u8> {
        let header = PacketHeader {
            payload_length: payload.len() as u32,
            sequence_id: sequence,
        };
        let mut out = header.to_bytes().to_vec();
        out.extend_from_slice(payload);
        out
    }

    fn round_trip(len: usize) {
        let payload: Vec<u8> = (0..len).map(|i| (i % 251) as u8).collect();
        let mut writer = PacketStream::new(MockChannel::default());
        writer.send_packet(&payload).unwrap();
        let wire = std::mem::take(&mut writer.get_mut().output);

        let mut reader = PacketStream::new(MockChannel::new(wire));
        let read = reader.read_packet().unwrap();
        assert_eq!(read.len(), len);
        assert!(read == payload, "payload mismatch for length {len}");
        assert_eq!(reader.sequence(), writer.sequence());
    }

    #[test]
    fn test_framing_round_trip_boundaries() {
        for len in [0, 1, MAX_BLOCK_SIZE - 1, MAX_BLOCK_SIZE, MAX_BLOCK_SIZE + 1] {
            round_trip(len);
        }
    }

    #[test]
    fn test_exact_block_gets_terminator() {
        let payload = vec![7u8; MAX_BLOCK_SIZE];
        let mut stream = PacketStream::new(MockChannel::default());
        stream.send_packet(&payload).unwrap();
        let wire = &stream.get_ref().output;
        assert_eq!(wire.len(), 4 + MAX_BLOCK_SIZE + 4);
        assert_eq!(&wire[..4], &[0xFF, 0xFF, 0xFF, 0]);
        assert_eq!(&wire[wire.len() - 4..], &[0, 0, 0, 1]);
        assert_eq!(stream.sequence(), 2);
    }

    #[test]
    fn test_empty_payload_single_block() {
        let mut stream = PacketStream::new(MockChannel::default());
        stream.send_packet(&[]).unwrap();
        assert_eq!(stream.get_ref().output, vec![0, 0, 0, 0]);
    }

    #[test]
    fn test_sequence_monotonic_and_wraps() {
        let mut stream = PacketStream::new(MockChannel::default());
        stream.set_sequence(250);
        for _ in 0..10 {
            stream.send_packet(b"x").unwrap();
        }
        let wire = &stream.get_ref().output;
        for i in 0..10u8 {
            let seq = wire[usize::from(i) * 5 + 3];
            assert_eq!(seq, 250u8.wrapping_add(i));
        }
        assert_eq!(stream.sequence(), 4);

        stream.reset_sequence();
        assert_eq!(stream.sequence(), 0);
    }

    #[test]
    fn test_sequence_mismatch_is_fatal() {
        let mut stream = PacketStream::new(MockChannel::new(frame(3, b"hello")));
        let err = stream.read_packet().unwrap_err();
        assert!(
            matches!(err, Error::Protocol(ref p) if p.kind == ProtocolErrorKind::SequenceMismatch)
        );
        assert!(err.is_fatal());
    }

    #[test]
    fn test_short_stream_is_fatal() {
        let mut wire = frame(0, b"hello world");
        wire.truncate(8);
        let mut stream = PacketStream::new(MockChannel::new(wire));
        let err = stream.read_packet().unwrap_err();
        assert!(matches!(
            err,
            Error::Protocol(ref p) if p.kind == ProtocolErrorKind::UnexpectedEof
        ));
        assert!(err.is_fatal());
    }

    #[test]
    fn test_tolerates_one_byte_reads() {
        let mut wire = frame(0, b"first");
        wire.extend(frame(1, b"second"));
        let mut stream = PacketStream::new(MockChannel::trickle(wire, 1));
        assert_eq!(stream.read_packet().unwrap(), b"first");
        assert_eq!(stream.read_packet().unwrap(), b"second");
    }

    #[test]
    fn test_receive_decodes_err_packet() {
        let mut err = vec![0xFF, 0x26, 0x04, b'#'];
        err.extend_from_slice(b"23000Duplicate entry");
        let mut stream = PacketStream::new(MockChannel::new(frame(0, &err)));
        let e = stream.receive().unwrap_err();
        assert_eq!(e.server_code(), Some(1062));
        assert_eq!(e.sqlstate(), Some("23000"));
        assert!(!e.is_fatal());
    }

    #[test]
    fn test_packet_too_large_writes_nothing() {
        let mut stream = PacketStream::new(MockChannel::default());
        stream.set_max_packet_size(4);
        let err = stream.send_packet(b"12345").unwrap_err();
        assert!(matches!(
            err,
            Error::Protocol(ref p) if p.kind == ProtocolErrorKind::PacketTooLarge
        ));
        assert!(!err.is_fatal());
        assert!(stream.get_ref().output.is_empty());
        assert_eq!(stream.sequence(), 0);
    }

    #[test]
    fn test_timeout_before_any_byte_is_recoverable() {
        let mut stream = PacketStream::new(MockChannel::default());
        stream.set_timeout(Some(Duration::from_millis(5))).unwrap();
        let err = stream.read_packet().unwrap_err();
        assert!(err.is_timeout());
        assert!(!err.is_fatal());
    }

    #[test]
    fn test_timeout_mid_packet_escalates() {
        let mut wire = frame(0, b"hello");
        wire.truncate(6);
        let mut stream = PacketStream::new(MockChannel::new(wire));
        stream.set_timeout(Some(Duration::from_millis(5))).unwrap();
        let err = stream.read_packet().unwrap_err();
        assert!(err.is_timeout());
        assert!(err.is_fatal());
    }
}
