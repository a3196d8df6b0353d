//! Physical MySQL driver.
//!
//! [`NativeDriver`] owns one authenticated session: the framed channel,
//! negotiated capabilities, server status and the read position inside
//! the current response. Exactly one command is in flight at a time, which
//! `&mut self` on every operation enforces.
//!
//! Result rows are pulled through [`Driver::next_row`]. A result that is
//! abandoned is drained before the next command goes out, so the packet
//! sequence never desyncs.

use std::fs::File;
use std::io::{ErrorKind, Read};
use std::path::Path;
use std::sync::Arc;
use std::time::{Duration, Instant};

use sqlwire_core::{
    ColumnInfo, ConfigError, ConnectionErrorKind, Error, ProtocolErrorKind, Result, Row, Value,
};

use crate::auth::{AuthPlugin, AuthSession};
use crate::cancel::{CancelHandle, cancel_query};
use crate::compress::{BufferPool, CompressedStream};
use crate::config::MySqlConfig;
use crate::handshake::{
    self, CLIENT_MAX_PACKET, ChangeUser, ER_MUST_CHANGE_PASSWORD, Greeting, HandshakeResponse,
};
use crate::protocol::prepared::{
    build_stmt_close, build_stmt_fetch, build_stmt_reset, cursor_type,
};
use crate::protocol::{
    BinaryRowDecoder, Command, EofPacket, ErrPacket, OkPacket, PacketReader, PacketType,
    PacketWriter, ParamBinding, ServerStatus, StmtPrepareOk, capabilities,
};
use crate::stream::{Channel, PacketStream, Transport};
use crate::tls;
use crate::types::{ColumnDef, decode_text_row};

/// Framed channel used by the driver, whatever layers sit underneath.
pub type BoxedStream = PacketStream<Box<dyn Channel>>;

/// Largest chunk read from a local file per packet.
const LOCAL_INFILE_CHUNK: usize = 64 * 1024;

/// Operations every physical driver supports.
///
/// Implemented by [`NativeDriver`] and by the [`crate::TracingDriver`]
/// decorator.
pub trait Driver: Send {
    /// Connect, authenticate and run post-connect configuration.
    fn open(&mut self) -> Result<()>;

    /// Send `COM_QUIT` (best effort) and drop the channel.
    fn close(&mut self);

    /// Server connection id.
    fn thread_id(&self) -> u32;

    fn server_version(&self) -> &str;

    /// Negotiated capability flags.
    fn capabilities(&self) -> u32;

    /// Server status as of the last OK or EOF packet.
    fn status(&self) -> ServerStatus;

    /// A fatal error happened, or the driver was closed.
    fn is_broken(&self) -> bool;

    /// Only password-change statements are accepted.
    fn is_password_expired(&self) -> bool;

    fn created_at(&self) -> Instant;

    /// Replace the per-operation read/write timeout. Zero blocks forever.
    fn reset_timeout(&mut self, timeout: Duration) -> Result<()>;

    /// Run `sql` over the text protocol and return the first result.
    fn query(&mut self, sql: &str) -> Result<ResultSet>;

    /// Next row of the current result, `None` once it is exhausted.
    fn next_row(&mut self) -> Result<Option<Row>>;

    /// Skip what is left of the current result and read the next one.
    fn next_result(&mut self) -> Result<Option<ResultSet>>;

    fn prepare(&mut self, sql: &str) -> Result<PreparedStatement>;

    fn execute(&mut self, statement: &mut PreparedStatement, params: &[Value])
    -> Result<ResultSet>;

    /// Pull up to `rows` rows from an open cursor.
    fn fetch(&mut self, statement: &PreparedStatement, rows: u32) -> Result<ResultSet>;

    fn close_statement(&mut self, statement_id: u32) -> Result<()>;

    fn reset_statement(&mut self, statement_id: u32) -> Result<()>;

    fn ping(&mut self) -> Result<()>;

    /// `COM_INIT_DB`.
    fn set_database(&mut self, database: &str) -> Result<()>;

    /// Clear session state for reuse from a pool.
    fn reset(&mut self) -> Result<()>;

    fn change_user(&mut self, user: &str, password: Option<&str>, database: Option<&str>)
    -> Result<()>;

    /// Best-effort `COM_QUIT`.
    fn quit(&mut self);

    /// Handle another thread can use to `KILL QUERY` on this session.
    fn cancel_handle(&self) -> CancelHandle;
}

/// Header of one result in a command's response.
///
/// The counters are running totals over the results of the current
/// command, so a multi-statement batch reports its overall affected rows.
#[derive(Debug, Clone)]
pub struct ResultSet {
    columns: Arc<Vec<ColumnDef>>,
    column_info: Arc<ColumnInfo>,
    pub affected_rows: u64,
    pub last_insert_id: u64,
    pub warnings: u16,
    pub info: String,
    pub status: ServerStatus,
}

impl ResultSet {
    pub fn columns(&self) -> &[ColumnDef] {
        &self.columns
    }

    pub fn column_info(&self) -> Arc<ColumnInfo> {
        Arc::clone(&self.column_info)
    }

    pub fn field_count(&self) -> usize {
        self.columns.len()
    }

    /// Column metadata was sent, so rows (possibly zero) follow.
    pub fn has_rows(&self) -> bool {
        !self.columns.is_empty()
    }

    /// Another result follows this one.
    pub fn has_more_results(&self) -> bool {
        self.status.more_results()
    }
}

/// Server-side prepared statement handle.
#[derive(Debug, Clone)]
pub struct PreparedStatement {
    pub id: u32,
    pub sql: String,
    pub params: Vec<ColumnDef>,
    columns: Arc<Vec<ColumnDef>>,
    column_info: Arc<ColumnInfo>,
    cursor: u8,
    binding: ParamBinding,
}

impl PreparedStatement {
    fn new(id: u32, sql: &str, params: Vec<ColumnDef>, columns: Vec<ColumnDef>) -> Self {
        let column_info = Arc::new(column_info(&columns));
        Self {
            id,
            sql: sql.to_string(),
            params,
            columns: Arc::new(columns),
            column_info,
            cursor: cursor_type::NO_CURSOR,
            binding: ParamBinding::new(),
        }
    }

    pub fn columns(&self) -> &[ColumnDef] {
        &self.columns
    }

    pub fn param_count(&self) -> usize {
        self.params.len()
    }

    /// Execute with a read-only server cursor; rows then come from
    /// [`Driver::fetch`].
    pub fn use_cursor(&mut self, enabled: bool) {
        self.cursor = if enabled {
            cursor_type::READ_ONLY
        } else {
            cursor_type::NO_CURSOR
        };
    }
}

fn column_info(columns: &[ColumnDef]) -> ColumnInfo {
    ColumnInfo::new(columns.iter().map(|c| c.name.clone()).collect())
}

/// Where the driver stands inside the current response.
#[derive(Debug, Clone, Default)]
enum ReadState {
    #[default]
    Idle,
    /// Row packets are pending.
    Rows {
        columns: Arc<Vec<ColumnDef>>,
        info: Arc<ColumnInfo>,
        binary: bool,
    },
    /// A result header (OK, ERR or column count) is expected next.
    Header { binary: bool },
}

#[derive(Debug, Clone, Copy, Default)]
struct Totals {
    affected_rows: u64,
    last_insert_id: u64,
    warnings: u16,
}

/// Protocol-speaking driver over TCP or a Unix socket.
pub struct NativeDriver {
    config: MySqlConfig,
    stream: Option<BoxedStream>,
    buffers: Arc<BufferPool>,
    read_state: ReadState,
    totals: Totals,
    thread_id: u32,
    server_version: String,
    version: (u16, u16, u16),
    capabilities: u32,
    status: ServerStatus,
    plugin: AuthPlugin,
    scramble: Vec<u8>,
    timeout: Option<Duration>,
    broken: bool,
    password_expired: bool,
    created_at: Instant,
}

impl std::fmt::Debug for NativeDriver {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("NativeDriver")
            .field("endpoint", &self.config.endpoint)
            .field("thread_id", &self.thread_id)
            .field("server_version", &self.server_version)
            .field("broken", &self.broken)
            .field("password_expired", &self.password_expired)
            .finish_non_exhaustive()
    }
}

fn disconnected() -> Error {
    Error::connection(
        ConnectionErrorKind::Disconnected,
        "connection is closed or broken",
    )
}

fn password_expired_error() -> Error {
    Error::connection(
        ConnectionErrorKind::PasswordExpired,
        "password expired: only SET PASSWORD or ALTER USER may run",
    )
}

fn unexpected(what: &str, packet: &[u8]) -> Error {
    Error::protocol(
        ProtocolErrorKind::UnexpectedPacket,
        format!(
            "unexpected packet (header 0x{:02X}) while reading {what}",
            packet.first().copied().unwrap_or(0)
        ),
    )
}

fn config_error(message: String, source: std::io::Error) -> Error {
    Error::Config(ConfigError {
        message,
        source: Some(Box::new(source)),
    })
}

/// Statements accepted while the password is expired.
fn is_password_change(sql: &str) -> bool {
    let words: Vec<String> = sql
        .split_whitespace()
        .take(2)
        .map(str::to_ascii_uppercase)
        .collect();
    matches!(
        words.iter().map(String::as_str).collect::<Vec<_>>().as_slice(),
        ["SET", "PASSWORD"] | ["ALTER", "USER"]
    )
}

fn attach_sql(err: Error, sql: &str) -> Error {
    match err {
        Error::Query(q) => Error::Query(q.with_sql(sql)),
        other => other,
    }
}

impl NativeDriver {
    /// Create an unopened driver.
    pub fn new(config: MySqlConfig) -> Self {
        Self::with_buffers(config, Arc::new(BufferPool::new()))
    }

    /// Create an unopened driver sharing compression buffers with others.
    pub fn with_buffers(config: MySqlConfig, buffers: Arc<BufferPool>) -> Self {
        let timeout = config.command_timeout;
        Self {
            config,
            stream: None,
            buffers,
            read_state: ReadState::Idle,
            totals: Totals::default(),
            thread_id: 0,
            server_version: String::new(),
            version: (0, 0, 0),
            capabilities: 0,
            status: ServerStatus::default(),
            plugin: AuthPlugin::NativePassword,
            scramble: Vec::new(),
            timeout,
            broken: false,
            password_expired: false,
            created_at: Instant::now(),
        }
    }

    /// Create and open a driver.
    pub fn connect(config: MySqlConfig) -> Result<Self> {
        let mut driver = Self::new(config);
        driver.open()?;
        Ok(driver)
    }

    pub fn config(&self) -> &MySqlConfig {
        &self.config
    }

    /// Run the handshake over an already connected channel.
    pub(crate) fn open_channel(&mut self, channel: Box<dyn Channel>) -> Result<()> {
        self.broken = false;
        self.password_expired = false;
        self.read_state = ReadState::Idle;
        self.created_at = Instant::now();

        let result = self
            .handshake(channel)
            .and_then(|()| self.post_connect());
        if let Err(err) = &result {
            tracing::warn!(endpoint = %self.config.endpoint, error = %err, "MySQL connect failed");
            if let Some(stream) = self.stream.as_mut() {
                stream.shutdown();
            }
            self.stream = None;
            self.broken = true;
        }
        result
    }

    fn handshake(&mut self, channel: Box<dyn Channel>) -> Result<()> {
        let mut stream = PacketStream::new(channel);
        stream.set_timeout(Some(self.config.connect_timeout))?;

        let packet = stream.read_packet()?;
        if packet.first() == Some(&0xFF) {
            let err = ErrPacket::parse(&packet)?;
            return Err(Error::connection(
                ConnectionErrorKind::Connect,
                format!(
                    "server refused connection: {} ({})",
                    err.error_message, err.error_code
                ),
            ));
        }
        let greeting = Greeting::parse(&packet)?;

        let ssl_mode = self.config.ssl_mode;
        if ssl_mode.should_try_ssl() {
            tls::validate_tls_config(ssl_mode, &self.config.tls)?;
        }
        let use_tls = tls::validate_ssl_mode(ssl_mode, greeting.capabilities)?;
        let mut caps = handshake::client_flags(&self.config, greeting.capabilities);
        if !use_tls {
            caps &= !capabilities::CLIENT_SSL;
        }

        if use_tls {
            stream.send_packet(&tls::build_ssl_request(
                caps,
                CLIENT_MAX_PACKET,
                self.config.charset,
            ))?;
            let host = self.config.endpoint.host().to_string();
            let tls_config = &self.config.tls;
            stream = stream.map_inner(|inner| tls::upgrade(inner, tls_config, &host, ssl_mode))?;
            tracing::debug!(host = %host, ?ssl_mode, "TLS upgrade complete");
        }

        let plugin = AuthPlugin::from_name(&greeting.auth_plugin)?;
        let password = self.config.password.clone().unwrap_or_default();
        let secure = stream.get_ref().is_secure();
        let mut session = AuthSession::new(plugin, greeting.scramble.clone());
        let auth_response = session.initial_response(&password, secure)?;
        let attributes = handshake::connect_attributes(&self.config);
        let response = HandshakeResponse {
            capabilities: caps,
            max_packet_size: CLIENT_MAX_PACKET,
            charset: self.config.charset,
            user: plugin.login_user(&self.config.user),
            auth_response: &auth_response,
            database: self.config.database.as_deref(),
            auth_plugin: plugin.name(),
            attributes: &attributes,
        }
        .encode();
        stream.send_packet(&response)?;

        let outcome = handshake::authenticate(&mut stream, session, &password)?;

        if caps & capabilities::CLIENT_COMPRESS != 0 {
            let buffers = Arc::clone(&self.buffers);
            stream = stream.map_inner(|inner| {
                Ok(Box::new(CompressedStream::new(inner, buffers)) as Box<dyn Channel>)
            })?;
            tracing::debug!(thread_id = greeting.thread_id, "compression enabled");
        }
        stream.set_timeout(self.timeout)?;

        self.thread_id = greeting.thread_id;
        self.server_version = greeting.server_version;
        self.version = greeting.version;
        self.capabilities = caps;
        self.status = outcome.ok.status;
        self.plugin = outcome.plugin;
        self.scramble = outcome.scramble;
        self.stream = Some(stream);

        tracing::info!(
            endpoint = %self.config.endpoint,
            server_version = %self.server_version,
            thread_id = self.thread_id,
            capabilities = format_args!("{caps:#010x}"),
            tls = use_tls,
            "MySQL driver opened"
        );
        Ok(())
    }

    /// Narrow the max packet size and detect an expired password.
    fn post_connect(&mut self) -> Result<()> {
        let server_max = match self.query_scalar("SELECT @@max_allowed_packet") {
            Ok(value) => value.and_then(|v| v.as_u64()),
            Err(err) if err.server_code() == Some(ER_MUST_CHANGE_PASSWORD) => {
                tracing::warn!(thread_id = self.thread_id, "password expired; session restricted");
                self.password_expired = true;
                None
            }
            Err(err) => return Err(err),
        };
        if let Some(max) = self.config.max_packet_size.or(server_max) {
            self.stream_mut()?.set_max_packet_size(max);
        }
        Ok(())
    }

    fn query_scalar(&mut self, sql: &str) -> Result<Option<Value>> {
        self.query(sql)?;
        let value = self.next_row()?.and_then(|row| row.get(0).cloned());
        self.run(Self::drain)?;
        Ok(value)
    }

    fn stream_mut(&mut self) -> Result<&mut BoxedStream> {
        self.stream.as_mut().ok_or_else(disconnected)
    }

    /// Run one driver operation under the fatal-error discipline.
    fn run<T>(&mut self, op: impl FnOnce(&mut Self) -> Result<T>) -> Result<T> {
        if self.broken || self.stream.is_none() {
            return Err(disconnected());
        }
        op(self).map_err(|err| self.handle_error(err))
    }

    fn handle_error(&mut self, err: Error) -> Error {
        if err.is_timeout() && !err.is_fatal() {
            return self.recover_from_timeout(err);
        }
        if err.is_fatal() {
            self.mark_broken(&err);
        }
        err
    }

    /// Cancel the running statement and drain its response.
    ///
    /// Only a timeout inside a result can be recovered; anywhere else the
    /// position in the response is unknown.
    fn recover_from_timeout(&mut self, err: Error) -> Error {
        if matches!(self.read_state, ReadState::Idle) {
            let err = err.escalate();
            self.mark_broken(&err);
            return err;
        }

        tracing::warn!(thread_id = self.thread_id, error = %err, "command timed out; cancelling");
        if let Err(cancel_err) = cancel_query(&self.config, self.thread_id) {
            tracing::debug!(thread_id = self.thread_id, error = %cancel_err, "cancel failed");
        }

        let cancel_timeout = Some(self.config.cancel_timeout);
        let drained = self
            .stream_mut()
            .and_then(|s| s.set_timeout(cancel_timeout))
            .and_then(|()| self.drain());
        let restored = drained.and_then(|()| {
            let timeout = self.timeout;
            self.stream_mut()?.set_timeout(timeout)
        });

        match restored {
            Ok(()) => err,
            Err(drain_err) => {
                tracing::debug!(error = %drain_err, "drain after cancel failed");
                let err = err.escalate();
                self.mark_broken(&err);
                err
            }
        }
    }

    fn mark_broken(&mut self, err: &Error) {
        if !self.broken {
            tracing::error!(
                thread_id = self.thread_id,
                error = %err,
                "fatal error; closing connection"
            );
        }
        self.broken = true;
        self.read_state = ReadState::Idle;
        if let Some(stream) = self.stream.as_mut() {
            stream.shutdown();
        }
    }

    /// Finish any pending response and start a new command exchange.
    fn begin_command(&mut self) -> Result<&mut BoxedStream> {
        self.drain()?;
        self.totals = Totals::default();
        let stream = self.stream_mut()?;
        stream.reset_sequence();
        Ok(stream)
    }

    fn send_command(&mut self, payload: &[u8]) -> Result<()> {
        self.begin_command()?.send_packet(payload)
    }

    /// Read and discard whatever is left of the current response.
    ///
    /// Server errors met along the way end the response and are dropped.
    fn drain(&mut self) -> Result<()> {
        loop {
            let step = match self.read_state {
                ReadState::Idle => return Ok(()),
                ReadState::Rows { .. } => self.read_row().map(drop),
                ReadState::Header { binary } => self.read_result_header(binary).map(drop),
            };
            match step {
                Ok(()) | Err(Error::Query(_)) => {}
                Err(err) => return Err(err),
            }
        }
    }

    fn apply_ok(&mut self, ok: &OkPacket) {
        self.status = ok.status;
        self.totals.affected_rows = self.totals.affected_rows.saturating_add(ok.affected_rows);
        if ok.last_insert_id != 0 {
            self.totals.last_insert_id = ok.last_insert_id;
        }
        self.totals.warnings = self.totals.warnings.saturating_add(ok.warnings);
    }

    fn result(
        &self,
        columns: Arc<Vec<ColumnDef>>,
        column_info: Arc<ColumnInfo>,
        info: String,
    ) -> ResultSet {
        ResultSet {
            columns,
            column_info,
            affected_rows: self.totals.affected_rows,
            last_insert_id: self.totals.last_insert_id,
            warnings: self.totals.warnings,
            info,
            status: self.status,
        }
    }

    /// Read one result header: OK, ERR, local infile request or the
    /// column block of a result set.
    fn read_result_header(&mut self, binary: bool) -> Result<ResultSet> {
        loop {
            let packet = self.stream_mut()?.read_packet()?;
            match PacketType::of(&packet) {
                PacketType::Ok => {
                    let ok = OkPacket::parse(&packet)?;
                    self.apply_ok(&ok);
                    self.read_state = if ok.status.more_results() {
                        ReadState::Header { binary }
                    } else {
                        ReadState::Idle
                    };
                    return Ok(self.result(Arc::default(), Arc::default(), ok.info));
                }
                PacketType::Error => {
                    self.read_state = ReadState::Idle;
                    return Err(ErrPacket::parse(&packet)?.into_error());
                }
                PacketType::LocalInfile if !binary => {
                    self.send_local_infile(&packet[1..])?;
                }
                PacketType::LocalInfile | PacketType::Eof => {
                    return Err(unexpected("result header", &packet));
                }
                PacketType::Data => {
                    let count = PacketReader::new(&packet).read_lenenc_int()?;
                    let (columns, eof) = self.read_definitions(count)?;
                    let eof = eof.ok_or_else(|| unexpected("column count", &packet))?;
                    self.status = eof.status;
                    self.totals.warnings = self.totals.warnings.saturating_add(eof.warnings);

                    let columns = Arc::new(columns);
                    let info = Arc::new(column_info(&columns));
                    self.read_state = if binary && eof.status.cursor_exists() {
                        ReadState::Idle
                    } else {
                        ReadState::Rows {
                            columns: Arc::clone(&columns),
                            info: Arc::clone(&info),
                            binary,
                        }
                    };
                    return Ok(self.result(columns, info, String::new()));
                }
            }
        }
    }

    /// Read `count` column definitions and the EOF packet closing them.
    fn read_definitions(&mut self, count: u64) -> Result<(Vec<ColumnDef>, Option<EofPacket>)> {
        if count == 0 {
            return Ok((Vec::new(), None));
        }
        let stream = self.stream_mut()?;
        let mut columns = Vec::with_capacity(count.min(4096) as usize);
        for _ in 0..count {
            columns.push(ColumnDef::parse(&stream.read_packet()?)?);
        }
        let eof = stream.read_packet()?;
        if PacketType::of(&eof) != PacketType::Eof {
            return Err(unexpected("column definitions", &eof));
        }
        Ok((columns, Some(EofPacket::parse(&eof)?)))
    }

    /// Read one row packet of the current result.
    fn read_row(&mut self) -> Result<Option<Row>> {
        let ReadState::Rows {
            columns,
            info,
            binary,
        } = &self.read_state
        else {
            return Ok(None);
        };
        let (columns, info, binary) = (Arc::clone(columns), Arc::clone(info), *binary);

        let packet = self.stream_mut()?.read_packet()?;
        match packet.first() {
            Some(0xFE) if packet.len() < 9 => {
                let eof = EofPacket::parse(&packet)?;
                self.status = eof.status;
                self.totals.warnings = self.totals.warnings.saturating_add(eof.warnings);
                self.read_state = if eof.status.more_results() {
                    ReadState::Header { binary }
                } else {
                    ReadState::Idle
                };
                Ok(None)
            }
            Some(0xFF) => {
                self.read_state = ReadState::Idle;
                Err(ErrPacket::parse(&packet)?.into_error())
            }
            _ => {
                let values = if binary {
                    BinaryRowDecoder::new(&columns).decode(&packet)?
                } else {
                    decode_text_row(&columns, &packet)?
                };
                Ok(Some(Row::with_columns(info, values)))
            }
        }
    }

    /// Answer a `LOAD DATA LOCAL INFILE` request.
    ///
    /// A refused request still sends the empty terminator so the server
    /// can finish the statement; its reply is consumed here.
    fn send_local_infile(&mut self, request: &[u8]) -> Result<()> {
        let requested = String::from_utf8_lossy(request).into_owned();
        let file = self.open_local_file(&requested);
        let chunk_size = {
            let stream = self.stream_mut()?;
            (stream.max_packet_size().min(LOCAL_INFILE_CHUNK as u64) as usize).max(1)
        };

        let mut file = match file {
            Ok(file) => file,
            Err(err) => return self.abort_local_infile(err),
        };

        let mut buf = vec![0u8; chunk_size];
        let mut total = 0usize;
        loop {
            let n = match file.read(&mut buf) {
                Ok(0) => break,
                Ok(n) => n,
                Err(e) if e.kind() == ErrorKind::Interrupted => continue,
                Err(e) => {
                    return self.abort_local_infile(config_error(
                        format!("failed reading local infile '{requested}': {e}"),
                        e,
                    ));
                }
            };
            self.stream_mut()?.send_packet(&buf[..n])?;
            total += n;
        }
        self.stream_mut()?.send_packet(&[])?;
        tracing::debug!(path = %requested, bytes = total, "local infile sent");
        Ok(())
    }

    fn abort_local_infile(&mut self, err: Error) -> Result<()> {
        let stream = self.stream_mut()?;
        stream.send_packet(&[])?;
        let reply = stream.read_packet()?;
        if PacketType::of(&reply) == PacketType::Ok {
            let ok = OkPacket::parse(&reply)?;
            self.apply_ok(&ok);
        }
        self.read_state = ReadState::Idle;
        tracing::warn!(error = %err, "local infile request refused");
        Err(err)
    }

    fn open_local_file(&self, requested: &str) -> Result<File> {
        if !self.config.local_infile {
            return Err(Error::connection(
                ConnectionErrorKind::Unsupported,
                "LOAD DATA LOCAL INFILE is disabled; enable local_infile",
            ));
        }
        let path = Path::new(requested);
        let Some(dir) = &self.config.local_infile_dir else {
            return File::open(path)
                .map_err(|e| config_error(format!("cannot open local infile '{requested}'"), e));
        };

        let root = dir.canonicalize().map_err(|e| {
            config_error(format!("cannot resolve local_infile_dir '{}'", dir.display()), e)
        })?;
        let candidate = if path.is_relative() {
            root.join(path)
        } else {
            path.to_path_buf()
        };
        let resolved = candidate
            .canonicalize()
            .map_err(|e| config_error(format!("cannot resolve local infile '{requested}'"), e))?;
        if !resolved.starts_with(&root) {
            return Err(Error::config(format!(
                "local infile '{requested}' is outside '{}'",
                root.display()
            )));
        }
        File::open(&resolved)
            .map_err(|e| config_error(format!("cannot open local infile '{requested}'"), e))
    }

    fn query_inner(&mut self, sql: &str) -> Result<ResultSet> {
        let changing_password = self.password_expired && is_password_change(sql);
        if self.password_expired && !changing_password {
            return Err(password_expired_error());
        }

        let mut writer = PacketWriter::command(Command::Query);
        writer.write_bytes(sql.as_bytes());
        self.send_command(writer.as_bytes())?;
        self.read_state = ReadState::Header { binary: false };

        let result = self.read_result_header(false).map_err(|e| attach_sql(e, sql))?;
        if changing_password {
            tracing::info!(thread_id = self.thread_id, "password changed; session unrestricted");
            self.password_expired = false;
        }
        Ok(result)
    }

    fn prepare_inner(&mut self, sql: &str) -> Result<PreparedStatement> {
        if self.password_expired {
            return Err(password_expired_error());
        }
        let mut writer = PacketWriter::command(Command::StmtPrepare);
        writer.write_bytes(sql.as_bytes());
        self.send_command(writer.as_bytes())?;

        let packet = self
            .stream_mut()?
            .receive()
            .map_err(|e| attach_sql(e, sql))?;
        let ok = StmtPrepareOk::parse(&packet)?;
        let (params, _) = self.read_definitions(u64::from(ok.num_params))?;
        let (columns, _) = self.read_definitions(u64::from(ok.num_columns))?;
        Ok(PreparedStatement::new(ok.statement_id, sql, params, columns))
    }

    fn execute_inner(
        &mut self,
        statement: &mut PreparedStatement,
        params: &[Value],
    ) -> Result<ResultSet> {
        if self.password_expired {
            return Err(password_expired_error());
        }
        if params.len() != statement.params.len() {
            return Err(Error::Custom(format!(
                "statement expects {} parameters, got {}",
                statement.params.len(),
                params.len()
            )));
        }

        let payload = statement
            .binding
            .build_execute(statement.id, statement.cursor, params);
        if let Err(err) = self.send_command(&payload) {
            statement.binding.clear();
            return Err(err);
        }
        self.read_state = ReadState::Header { binary: true };
        self.read_result_header(true)
            .map_err(|e| attach_sql(e, &statement.sql))
    }

    fn fetch_inner(&mut self, statement: &PreparedStatement, rows: u32) -> Result<ResultSet> {
        self.send_command(&build_stmt_fetch(statement.id, rows))?;
        self.read_state = ReadState::Rows {
            columns: Arc::clone(&statement.columns),
            info: Arc::clone(&statement.column_info),
            binary: true,
        };
        Ok(self.result(
            Arc::clone(&statement.columns),
            Arc::clone(&statement.column_info),
            String::new(),
        ))
    }

    /// Send a command whose reply is a single OK packet.
    fn simple_command(&mut self, payload: &[u8]) -> Result<OkPacket> {
        self.send_command(payload)?;
        let packet = self.stream_mut()?.receive()?;
        if PacketType::of(&packet) != PacketType::Ok {
            return Err(unexpected("command reply", &packet));
        }
        let ok = OkPacket::parse(&packet)?;
        self.apply_ok(&ok);
        Ok(ok)
    }

    fn change_user_inner(
        &mut self,
        user: &str,
        password: Option<&str>,
        database: Option<&str>,
    ) -> Result<()> {
        let pw = password.unwrap_or("");
        let plugin = self.plugin;
        let scramble = self.scramble.clone();
        let attributes = handshake::connect_attributes(&self.config);
        let caps = self.capabilities;
        let charset = self.config.charset;

        let stream = self.begin_command()?;
        let secure = stream.get_ref().is_secure();
        let mut session = AuthSession::new(plugin, scramble);
        let auth_response = session.initial_response(pw, secure)?;
        let payload = ChangeUser {
            capabilities: caps,
            charset,
            user: plugin.login_user(user),
            auth_response: &auth_response,
            database,
            auth_plugin: plugin.name(),
            attributes: &attributes,
        }
        .encode();
        stream.send_packet(&payload)?;
        let outcome = handshake::authenticate(stream, session, pw)?;

        self.status = outcome.ok.status;
        self.plugin = outcome.plugin;
        self.scramble = outcome.scramble;
        self.config.user = user.to_string();
        self.config.password = password.map(str::to_string);
        self.config.database = database.map(str::to_string);
        tracing::debug!(thread_id = self.thread_id, user = %user, "user changed");
        Ok(())
    }
}

impl Driver for NativeDriver {
    fn open(&mut self) -> Result<()> {
        let transport = Transport::connect(
            &self.config.endpoint,
            self.config.connect_timeout,
            self.config.keepalive,
        )?;
        self.open_channel(Box::new(transport))
    }

    fn close(&mut self) {
        if self.stream.is_some() {
            self.quit();
            tracing::debug!(thread_id = self.thread_id, "MySQL driver closed");
        }
        self.stream = None;
        self.read_state = ReadState::Idle;
    }

    fn thread_id(&self) -> u32 {
        self.thread_id
    }

    fn server_version(&self) -> &str {
        &self.server_version
    }

    fn capabilities(&self) -> u32 {
        self.capabilities
    }

    fn status(&self) -> ServerStatus {
        self.status
    }

    fn is_broken(&self) -> bool {
        self.broken || self.stream.is_none()
    }

    fn is_password_expired(&self) -> bool {
        self.password_expired
    }

    fn created_at(&self) -> Instant {
        self.created_at
    }

    fn reset_timeout(&mut self, timeout: Duration) -> Result<()> {
        let timeout = (!timeout.is_zero()).then_some(timeout);
        self.run(|d| {
            d.stream_mut()?.set_timeout(timeout)?;
            d.timeout = timeout;
            Ok(())
        })
    }

    fn query(&mut self, sql: &str) -> Result<ResultSet> {
        self.run(|d| d.query_inner(sql))
    }

    fn next_row(&mut self) -> Result<Option<Row>> {
        if matches!(self.read_state, ReadState::Idle) {
            return Ok(None);
        }
        self.run(Self::read_row)
    }

    fn next_result(&mut self) -> Result<Option<ResultSet>> {
        self.run(|d| {
            while matches!(d.read_state, ReadState::Rows { .. }) {
                d.read_row()?;
            }
            match d.read_state {
                ReadState::Header { binary } => d.read_result_header(binary).map(Some),
                _ => Ok(None),
            }
        })
    }

    fn prepare(&mut self, sql: &str) -> Result<PreparedStatement> {
        self.run(|d| d.prepare_inner(sql))
    }

    fn execute(
        &mut self,
        statement: &mut PreparedStatement,
        params: &[Value],
    ) -> Result<ResultSet> {
        self.run(|d| d.execute_inner(statement, params))
    }

    fn fetch(&mut self, statement: &PreparedStatement, rows: u32) -> Result<ResultSet> {
        self.run(|d| d.fetch_inner(statement, rows))
    }

    fn close_statement(&mut self, statement_id: u32) -> Result<()> {
        self.run(|d| d.send_command(&build_stmt_close(statement_id)))
    }

    fn reset_statement(&mut self, statement_id: u32) -> Result<()> {
        self.run(|d| d.simple_command(&build_stmt_reset(statement_id)).map(drop))
    }

    fn ping(&mut self) -> Result<()> {
        self.run(|d| {
            d.simple_command(PacketWriter::command(Command::Ping).as_bytes())
                .map(drop)
        })
    }

    fn set_database(&mut self, database: &str) -> Result<()> {
        self.run(|d| {
            let mut writer = PacketWriter::command(Command::InitDb);
            writer.write_bytes(database.as_bytes());
            d.simple_command(writer.as_bytes())?;
            d.config.database = Some(database.to_string());
            Ok(())
        })
    }

    fn reset(&mut self) -> Result<()> {
        if self.version >= (5, 7, 3) {
            self.run(|d| {
                d.simple_command(PacketWriter::command(Command::ResetConnection).as_bytes())
                    .map(drop)
            })
        } else {
            let user = self.config.user.clone();
            let password = self.config.password.clone();
            let database = self.config.database.clone();
            self.change_user(&user, password.as_deref(), database.as_deref())
        }
    }

    fn change_user(
        &mut self,
        user: &str,
        password: Option<&str>,
        database: Option<&str>,
    ) -> Result<()> {
        self.run(|d| d.change_user_inner(user, password, database))
    }

    fn quit(&mut self) {
        if let Some(mut stream) = self.stream.take() {
            if !self.broken {
                stream.reset_sequence();
                let _ = stream.send_packet(PacketWriter::command(Command::Quit).as_bytes());
            }
            stream.shutdown();
        }
        self.read_state = ReadState::Idle;
    }

    fn cancel_handle(&self) -> CancelHandle {
        CancelHandle::new(self.config.clone(), self.thread_id)
    }
}

impl Drop for NativeDriver {
    fn drop(&mut self) {
        self.close();
    }
}

/// Prepared statement closed with `COM_STMT_CLOSE` when dropped.
///
/// Closing is skipped once the driver is broken; the server frees the
/// statement with the session.
pub struct StatementGuard<'d, D: Driver + ?Sized> {
    driver: &'d mut D,
    statement: Option<PreparedStatement>,
}

impl<'d, D: Driver + ?Sized> StatementGuard<'d, D> {
    pub fn prepare(driver: &'d mut D, sql: &str) -> Result<Self> {
        let statement = driver.prepare(sql)?;
        Ok(Self {
            driver,
            statement: Some(statement),
        })
    }

    pub fn statement(&self) -> Option<&PreparedStatement> {
        self.statement.as_ref()
    }

    pub fn execute(&mut self, params: &[Value]) -> Result<ResultSet> {
        let statement = self.statement.as_mut().ok_or_else(disconnected)?;
        self.driver.execute(statement, params)
    }

    pub fn next_row(&mut self) -> Result<Option<Row>> {
        self.driver.next_row()
    }

    pub fn driver(&mut self) -> &mut D {
        self.driver
    }

    /// Close now and report the outcome.
    pub fn close(mut self) -> Result<()> {
        match self.statement.take() {
            Some(statement) => self.driver.close_statement(statement.id),
            None => Ok(()),
        }
    }
}

impl<D: Driver + ?Sized> Drop for StatementGuard<'_, D> {
    fn drop(&mut self) {
        let Some(statement) = self.statement.take() else {
            return;
        };
        if self.driver.is_broken() {
            return;
        }
        if let Err(err) = self.driver.close_statement(statement.id) {
            tracing::debug!(statement_id = statement.id, error = %err, "statement close failed");
        }
    }
}
