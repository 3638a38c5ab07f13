//! Physical connection.
//!
//! A [`PhysicalConnection`] owns one network session: the transport, the
//! negotiated charset, server capabilities, the server-side statement
//! table, the streaming-result marker and the optional wire trace.
//!
//! It is shared as a [`SharedConnection`], a mutex around the connection.
//! One request/response exchange happens under one lock acquisition so
//! packets of different callers never interleave. Streaming results
//! release the lock between rows; while one is open every other command
//! fails fast with [`Error::StreamingConflict`].
//!
//! Any transport or framing failure marks the connection dead. Statement
//! level failures (server ERR packets, oversized payloads) leave it usable.

use std::collections::HashMap;
use std::fmt;
use std::io::{Read, Write};
use std::net::{TcpStream, ToSocketAddrs};
use std::sync::{Arc, Weak};

use parking_lot::{Mutex, MutexGuard};
use tidewire_core::error::{ConnectionError, QueryError};
use tidewire_core::{ConnectionErrorKind, Error, QueryErrorKind, Result, Value};

use crate::auth::{self, AuthPlugin};
use crate::charset::{CharsetNegotiator, CharsetPlan, Collation, Encoding};
use crate::config::MySqlConfig;
use crate::protocol::{
    Command, ErrPacket, ExecuteParam, MAX_PACKET_SIZE, OkPacket, PacketHeader, PacketReader,
    PacketType, PacketWriter, StmtPrepareOk, build_stmt_close_packet, build_stmt_execute_packet,
    build_stmt_fetch_packet, build_stmt_prepare_packet, build_stmt_reset_packet,
    build_stmt_send_long_data_packet, capabilities, encode_command, parse_stmt_prepare_ok,
    server_status,
};
use crate::trace::{Direction, WireTrace};
use crate::types::{ColumnDef, decode_binary_row, decode_text_row};

/// Byte stream a connection runs over.
pub trait Transport: Read + Write + Send + fmt::Debug {}

impl<T: Read + Write + Send + fmt::Debug> Transport for T {}

/// Server facts learned from the initial handshake.
#[derive(Debug, Clone)]
pub struct ServerInfo {
    /// Server capability flags
    pub capabilities: u32,
    /// Server version string
    pub server_version: String,
    /// Connection ID
    pub connection_id: u32,
    /// Server default collation id
    pub default_collation: u8,
}

/// Result of a command that either returned rows or an OK packet.
#[derive(Debug, Clone, Default)]
pub struct QueryResult {
    pub columns: Arc<Vec<ColumnDef>>,
    pub rows: Vec<Vec<Value>>,
    pub affected_rows: u64,
    pub last_insert_id: u64,
    pub warnings: u16,
    pub info: String,
}

impl QueryResult {
    /// Does this result carry a row set (possibly empty)?
    pub fn has_rows(&self) -> bool {
        !self.columns.is_empty()
    }

    fn from_ok(ok: OkPacket) -> Self {
        Self {
            affected_rows: ok.affected_rows,
            last_insert_id: ok.last_insert_id,
            warnings: ok.warnings,
            info: ok.info,
            ..Self::default()
        }
    }
}

/// First response to a command.
#[derive(Debug)]
pub enum Response {
    Ok(OkPacket),
    Columns(Vec<ColumnDef>),
}

/// A statement prepared on the server.
#[derive(Debug, Clone)]
pub struct ServerStatement {
    pub id: u32,
    pub params: Vec<ColumnDef>,
    pub columns: Arc<Vec<ColumnDef>>,
    pub warnings: u16,
}

/// Token identifying the streaming result that currently owns a connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct StreamToken(u64);

/// Outcome of starting a streamed command.
#[derive(Debug)]
pub enum StreamStart {
    /// Rows are waiting on the wire; the token owns the connection.
    Rows(StreamToken, Arc<Vec<ColumnDef>>),
    /// The command produced no row set.
    Done(QueryResult),
}

/// Outcome of executing with a cursor.
#[derive(Debug)]
pub enum CursorStart {
    /// The server opened a cursor over these columns.
    Open(Arc<Vec<ColumnDef>>),
    /// No cursor: the statement returned an OK packet or inline rows.
    Done(QueryResult),
}

#[derive(Debug)]
struct ActiveStream {
    token: StreamToken,
    columns: Arc<Vec<ColumnDef>>,
    binary: bool,
}

/// One network session with a MySQL server.
pub struct PhysicalConnection {
    transport: Box<dyn Transport>,
    config: MySqlConfig,
    server: ServerInfo,
    client_capabilities: u32,
    negotiator: CharsetNegotiator,
    charset: CharsetPlan,
    session_time_zone: String,
    max_allowed_packet: usize,
    status_flags: u16,
    affected_rows: u64,
    last_insert_id: u64,
    warnings: u16,
    statements: HashMap<u32, String>,
    /// Statement ids closed while a stream owned the wire.
    pending_closes: Vec<u32>,
    active_stream: Option<ActiveStream>,
    next_stream: u64,
    dead: bool,
    trace: Option<WireTrace>,
    sequence_id: u8,
}

impl fmt::Debug for PhysicalConnection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PhysicalConnection")
            .field("connection_id", &self.server.connection_id)
            .field("host", &self.config.host)
            .field("port", &self.config.port)
            .field("database", &self.config.database)
            .field("charset", &self.charset.charset)
            .field("dead", &self.dead)
            .finish_non_exhaustive()
    }
}

impl PhysicalConnection {
    /// Open a TCP connection and run the handshake.
    ///
    /// Charset options are validated before the socket is opened.
    #[tracing::instrument(level = "debug", skip(config), fields(host = %config.host, port = config.port))]
    pub fn connect(config: MySqlConfig) -> Result<Self> {
        let negotiator = config.charset_negotiator()?;

        let addr = config
            .socket_addr()
            .to_socket_addrs()
            .map_err(|e| {
                Error::Connection(ConnectionError {
                    kind: ConnectionErrorKind::DnsResolution,
                    message: format!("cannot resolve {}: {}", config.socket_addr(), e),
                    source: Some(Box::new(e)),
                })
            })?
            .next()
            .ok_or_else(|| {
                Error::connection(
                    ConnectionErrorKind::DnsResolution,
                    format!("no address for {}", config.socket_addr()),
                )
            })?;

        let stream = TcpStream::connect_timeout(&addr, config.connect_timeout).map_err(|e| {
            let kind = if e.kind() == std::io::ErrorKind::ConnectionRefused {
                ConnectionErrorKind::Refused
            } else {
                ConnectionErrorKind::Connect
            };
            Error::Connection(ConnectionError {
                kind,
                message: format!("failed to connect to {}: {}", config.socket_addr(), e),
                source: Some(Box::new(e)),
            })
        })?;
        stream.set_nodelay(true).ok();
        stream.set_read_timeout(Some(config.connect_timeout)).ok();
        stream.set_write_timeout(Some(config.connect_timeout)).ok();

        let conn = Self::handshake(Box::new(stream), config, negotiator)?;
        tracing::debug!(
            connection_id = conn.server.connection_id,
            server_version = %conn.server.server_version,
            charset = %conn.charset.charset,
            max_allowed_packet = conn.max_allowed_packet,
            "connected"
        );
        Ok(conn)
    }

    /// Run the handshake over an already-open transport.
    pub fn handshake(
        transport: Box<dyn Transport>,
        config: MySqlConfig,
        negotiator: CharsetNegotiator,
    ) -> Result<Self> {
        let trace = (config.trace_packets > 0).then(|| WireTrace::new(config.trace_packets));
        let mut conn = Self {
            transport,
            max_allowed_packet: config.max_allowed_packet,
            server: ServerInfo {
                capabilities: 0,
                server_version: String::new(),
                connection_id: 0,
                default_collation: 0,
            },
            client_capabilities: 0,
            charset: negotiator.plan(0),
            negotiator,
            config,
            session_time_zone: "SYSTEM".to_string(),
            status_flags: 0,
            affected_rows: 0,
            last_insert_id: 0,
            warnings: 0,
            statements: HashMap::new(),
            pending_closes: Vec::new(),
            active_stream: None,
            next_stream: 0,
            dead: false,
            trace,
            sequence_id: 0,
        };

        let (seed, plugin) = conn.read_handshake()?;
        conn.charset = conn.negotiator.plan(conn.server.default_collation);
        tracing::debug!(
            server_default = conn.server.default_collation,
            handshake_collation = conn.charset.handshake_collation,
            directive = ?conn.charset.directive,
            "charset negotiated"
        );

        conn.send_handshake_response(&seed, plugin)?;
        conn.handle_auth_result(&seed, plugin)?;

        if let Some(directive) = conn.charset.directive.clone() {
            conn.execute(&directive)?;
        }
        conn.load_session_variables()?;
        Ok(conn)
    }

    /// Connection ID assigned by the server.
    pub fn connection_id(&self) -> u32 {
        self.server.connection_id
    }

    /// Server version string.
    pub fn server_version(&self) -> &str {
        &self.server.server_version
    }

    /// Server handshake facts.
    pub fn server_info(&self) -> &ServerInfo {
        &self.server
    }

    /// Configuration this connection was opened with.
    pub fn config(&self) -> &MySqlConfig {
        &self.config
    }

    /// Encoding used for outbound SQL and columns without a known charset.
    pub fn session_encoding(&self) -> Encoding {
        self.charset.session_encoding
    }

    /// Charset name the session uses.
    pub fn charset_name(&self) -> &str {
        &self.charset.charset
    }

    /// Session collation, when known.
    pub fn collation(&self) -> Option<&'static Collation> {
        self.charset.collation
    }

    /// Session time zone as reported by the server.
    pub fn session_time_zone(&self) -> &str {
        &self.session_time_zone
    }

    /// Largest payload the server accepts.
    pub fn max_allowed_packet(&self) -> usize {
        self.max_allowed_packet
    }

    /// Server status flags from the last response.
    pub fn status_flags(&self) -> u16 {
        self.status_flags
    }

    /// Is a transaction open on the server?
    pub fn in_transaction(&self) -> bool {
        self.status_flags & server_status::SERVER_STATUS_IN_TRANS != 0
    }

    /// Does the server treat backslashes as ordinary characters?
    pub fn no_backslash_escapes(&self) -> bool {
        self.status_flags & server_status::SERVER_STATUS_NO_BACKSLASH_ESCAPES != 0
    }

    /// Rows affected by the last statement.
    pub fn affected_rows(&self) -> u64 {
        self.affected_rows
    }

    /// Last generated AUTO_INCREMENT value.
    pub fn last_insert_id(&self) -> u64 {
        self.last_insert_id
    }

    /// Warnings raised by the last statement.
    pub fn warnings(&self) -> u16 {
        self.warnings
    }

    /// Has the connection failed or been closed?
    pub fn is_dead(&self) -> bool {
        self.dead
    }

    /// Mark the connection unusable.
    pub fn mark_dead(&mut self) {
        if !self.dead {
            tracing::debug!(connection_id = self.server.connection_id, "connection marked dead");
        }
        self.dead = true;
    }

    /// Is a streaming result set open on this connection?
    pub fn has_active_stream(&self) -> bool {
        self.active_stream.is_some()
    }

    /// Server statement ids currently open.
    pub fn open_statements(&self) -> Vec<u32> {
        let mut ids: Vec<u32> = self.statements.keys().copied().collect();
        ids.sort_unstable();
        ids
    }

    /// Is `statement_id` a live server statement on this connection?
    pub fn has_statement(&self, statement_id: u32) -> bool {
        self.statements.contains_key(&statement_id)
    }

    /// Wire trace ring, when enabled.
    pub fn wire_trace(&self) -> Option<&WireTrace> {
        self.trace.as_ref()
    }

    /// Fail if the connection is dead or owned by a streaming result.
    pub fn ensure_ready(&self) -> Result<()> {
        if self.dead {
            return Err(Error::connection(
                ConnectionErrorKind::Disconnected,
                "connection is no longer usable",
            ));
        }
        if self.active_stream.is_some() {
            return Err(Error::StreamingConflict);
        }
        Ok(())
    }

    /// Run `op`, marking the connection dead when it fails fatally.
    fn guarded<T>(&mut self, op: impl FnOnce(&mut Self) -> Result<T>) -> Result<T> {
        let result = op(self);
        if let Err(e) = &result {
            if e.is_fatal() && !self.dead {
                tracing::warn!(
                    connection_id = self.server.connection_id,
                    error = %e,
                    "fatal connection error"
                );
                self.dead = true;
            }
        }
        result
    }

    // ==================== Text protocol ====================

    /// Run SQL and buffer the first result; further results are drained.
    pub fn query(&mut self, sql: &str) -> Result<QueryResult> {
        let mut results = self.query_multi(sql)?;
        Ok(if results.is_empty() {
            QueryResult::default()
        } else {
            results.swap_remove(0)
        })
    }

    /// Run SQL that may contain several statements; one result each.
    pub fn query_multi(&mut self, sql: &str) -> Result<Vec<QueryResult>> {
        self.ensure_ready()?;
        tracing::trace!(sql, "COM_QUERY");
        let body = self.session_encoding().encode(sql);
        self.guarded(|c| {
            c.send_command(Command::Query, &body)?;
            c.read_all_results(false)
        })
        .map_err(|e| with_sql(e, sql))
    }

    /// Run SQL and return the affected row count.
    pub fn execute(&mut self, sql: &str) -> Result<u64> {
        Ok(self.query(sql)?.affected_rows)
    }

    /// Send a query and leave its rows on the wire for streaming.
    pub fn start_stream(&mut self, sql: &str) -> Result<StreamStart> {
        self.ensure_ready()?;
        tracing::trace!(sql, "COM_QUERY (streaming)");
        let body = self.session_encoding().encode(sql);
        self.guarded(|c| {
            c.send_command(Command::Query, &body)?;
            c.begin_stream_response(false)
        })
        .map_err(|e| with_sql(e, sql))
    }

    fn begin_stream_response(&mut self, binary: bool) -> Result<StreamStart> {
        match self.read_response()? {
            Response::Ok(ok) => {
                let result = QueryResult::from_ok(ok);
                self.drain_more_results(binary)?;
                Ok(StreamStart::Done(result))
            }
            Response::Columns(columns) => {
                self.next_stream += 1;
                let token = StreamToken(self.next_stream);
                let columns = Arc::new(columns);
                self.active_stream = Some(ActiveStream {
                    token,
                    columns: Arc::clone(&columns),
                    binary,
                });
                Ok(StreamStart::Rows(token, columns))
            }
        }
    }

    fn owns_stream(&self, token: StreamToken) -> bool {
        self.active_stream.as_ref().is_some_and(|s| s.token == token)
    }

    /// Read the next streamed row; `None` ends the stream and releases it.
    pub fn next_stream_row(&mut self, token: StreamToken) -> Result<Option<Vec<Value>>> {
        let Some(stream) = self.active_stream.as_ref().filter(|s| s.token == token) else {
            return Err(Error::InvalidArgument(
                "streaming result no longer owns the connection".to_string(),
            ));
        };
        let (columns, binary) = (Arc::clone(&stream.columns), stream.binary);
        match self.guarded(|c| c.read_row(&columns, binary)) {
            Ok(Some(row)) => Ok(Some(row)),
            Ok(None) => {
                self.active_stream = None;
                self.guarded(|c| c.drain_more_results(binary))?;
                self.flush_pending_closes()?;
                Ok(None)
            }
            Err(e) => {
                self.active_stream = None;
                if !self.dead {
                    self.flush_pending_closes()?;
                }
                Err(e)
            }
        }
    }

    /// Discard the rest of a streamed result.
    pub fn close_stream(&mut self, token: StreamToken) -> Result<()> {
        if !self.owns_stream(token) {
            return Ok(());
        }
        let mut discarded = 0usize;
        while self.next_stream_row(token)?.is_some() {
            discarded += 1;
        }
        if discarded > 0 {
            tracing::debug!(discarded, "streaming result closed early");
        }
        Ok(())
    }

    /// Discard whatever streaming result owns the connection.
    pub fn discard_active_stream(&mut self) -> Result<()> {
        match self.active_stream.as_ref().map(|s| s.token) {
            Some(token) => self.close_stream(token),
            None => Ok(()),
        }
    }

    /// Ping the server.
    pub fn ping(&mut self) -> Result<()> {
        self.ensure_ready()?;
        self.guarded(|c| {
            c.send_command(Command::Ping, &[])?;
            c.read_ok()
        })
        .map(|_| ())
    }

    /// Switch the default database.
    pub fn select_database(&mut self, database: &str) -> Result<()> {
        self.ensure_ready()?;
        let body = self.session_encoding().encode(database);
        self.guarded(|c| {
            c.send_command(Command::InitDb, &body)?;
            c.read_ok()
        })?;
        self.config.database = Some(database.to_string());
        Ok(())
    }

    /// Change charset (and optionally collation) mid-session.
    ///
    /// Issues one `SET NAMES` directive; the session encoding switches once
    /// the server accepts it.
    pub fn set_names(&mut self, charset: &str, collation: Option<&str>) -> Result<()> {
        let plan = self.negotiator.plan_switch(charset, collation)?;
        if let Some(directive) = &plan.directive {
            self.execute(directive)?;
        }
        tracing::debug!(charset = %plan.charset, encoding = %plan.session_encoding, "session charset switched");
        self.charset = plan;
        Ok(())
    }

    pub fn begin(&mut self) -> Result<()> {
        self.execute("START TRANSACTION").map(|_| ())
    }

    pub fn commit(&mut self) -> Result<()> {
        self.execute("COMMIT").map(|_| ())
    }

    pub fn rollback(&mut self) -> Result<()> {
        self.execute("ROLLBACK").map(|_| ())
    }

    pub fn set_autocommit(&mut self, enabled: bool) -> Result<()> {
        self.execute(if enabled {
            "SET autocommit=1"
        } else {
            "SET autocommit=0"
        })
        .map(|_| ())
    }

    /// COM_RESET_CONNECTION: drops session state and server statements.
    pub fn reset_session(&mut self) -> Result<()> {
        self.ensure_ready()?;
        self.guarded(|c| {
            c.send_command(Command::ResetConnection, &[])?;
            c.read_ok()
        })?;
        self.statements.clear();
        self.pending_closes.clear();
        Ok(())
    }

    /// Send COM_QUIT and mark the connection dead.
    pub fn close(&mut self) {
        if self.dead {
            return;
        }
        if self.active_stream.is_none() {
            // best effort: the server closes the socket without answering
            let _ = self.send_command(Command::Quit, &[]);
        }
        self.statements.clear();
        self.pending_closes.clear();
        self.dead = true;
    }

    // ==================== Server-side statements ====================

    /// COM_STMT_PREPARE.
    #[tracing::instrument(level = "debug", skip(self), fields(connection_id = self.server.connection_id))]
    pub fn prepare(&mut self, sql: &str) -> Result<ServerStatement> {
        self.ensure_ready()?;
        let payload = build_stmt_prepare_packet(sql, self.session_encoding());
        let stmt = self
            .guarded(|c| {
                c.send_payload(&payload)?;
                let first = c.read_packet()?;
                if first.first() == Some(&0xFF) {
                    return Err(c.query_error(&first));
                }
                let ok: StmtPrepareOk = parse_stmt_prepare_ok(&first)?;
                let params = c.read_column_block(ok.num_params as usize)?;
                let columns = c.read_column_block(ok.num_columns as usize)?;
                Ok(ServerStatement {
                    id: ok.statement_id,
                    params,
                    columns: Arc::new(columns),
                    warnings: ok.warnings,
                })
            })
            .map_err(|e| with_sql(e, sql))?;
        self.statements.insert(stmt.id, sql.to_string());
        tracing::debug!(statement_id = stmt.id, params = stmt.params.len(), "prepared");
        Ok(stmt)
    }

    /// Send one parameter's data in chunks with COM_STMT_SEND_LONG_DATA.
    ///
    /// `chunk_size` is capped so each command fits in `max_allowed_packet`.
    pub fn send_long_data(
        &mut self,
        statement_id: u32,
        param: u16,
        data: &mut dyn Read,
        chunk_size: usize,
    ) -> Result<u64> {
        self.ensure_ready()?;
        let chunk_size = chunk_size.clamp(1, self.max_allowed_packet.saturating_sub(7).max(1));
        let mut buf = vec![0u8; chunk_size];
        let mut total = 0u64;
        self.guarded(|c| {
            loop {
                let n = read_full(data, &mut buf)?;
                if n == 0 {
                    break;
                }
                let payload = build_stmt_send_long_data_packet(statement_id, param, &buf[..n]);
                c.send_payload(&payload)?;
                total += n as u64;
                if n < buf.len() {
                    break;
                }
            }
            Ok(())
        })?;
        tracing::trace!(statement_id, param, bytes = total, "long data sent");
        Ok(total)
    }

    /// COM_STMT_EXECUTE; rows stay on the wire for the caller.
    pub fn execute_statement(
        &mut self,
        stmt: &ServerStatement,
        params: &[ExecuteParam<'_>],
        cursor: bool,
    ) -> Result<Response> {
        self.ensure_ready()?;
        let payload = build_stmt_execute_packet(stmt.id, params, cursor, self.session_encoding());
        self.guarded(|c| {
            c.send_payload(&payload)?;
            c.read_response()
        })
    }

    /// Execute and buffer every row.
    pub fn execute_statement_buffered(
        &mut self,
        stmt: &ServerStatement,
        params: &[ExecuteParam<'_>],
    ) -> Result<QueryResult> {
        match self.execute_statement(stmt, params, false)? {
            Response::Ok(ok) => {
                let result = QueryResult::from_ok(ok);
                self.guarded(|c| c.drain_more_results(true))?;
                Ok(result)
            }
            Response::Columns(columns) => self.guarded(|c| {
                let result = c.read_rows_into(columns, true)?;
                c.drain_more_results(true)?;
                Ok(result)
            }),
        }
    }

    /// Execute and leave the binary rows for streaming.
    pub fn execute_statement_streaming(
        &mut self,
        stmt: &ServerStatement,
        params: &[ExecuteParam<'_>],
    ) -> Result<StreamStart> {
        self.ensure_ready()?;
        let payload = build_stmt_execute_packet(stmt.id, params, false, self.session_encoding());
        self.guarded(|c| {
            c.send_payload(&payload)?;
            c.begin_stream_response(true)
        })
    }

    /// Execute with a read-only cursor; rows then come from [`fetch`](Self::fetch).
    pub fn execute_statement_cursor(
        &mut self,
        stmt: &ServerStatement,
        params: &[ExecuteParam<'_>],
    ) -> Result<CursorStart> {
        match self.execute_statement(stmt, params, true)? {
            Response::Ok(ok) => {
                let result = QueryResult::from_ok(ok);
                self.guarded(|c| c.drain_more_results(true))?;
                Ok(CursorStart::Done(result))
            }
            Response::Columns(columns) => self.guarded(|c| match c.read_row(&columns, true)? {
                // EOF carrying SERVER_STATUS_CURSOR_EXISTS
                None => Ok(CursorStart::Open(Arc::new(columns))),
                // the server ignored the cursor request and sent rows inline
                Some(first) => {
                    let mut result = c.read_rows_into(columns, true)?;
                    result.rows.insert(0, first);
                    c.drain_more_results(true)?;
                    Ok(CursorStart::Done(result))
                }
            }),
        }
    }

    /// COM_STMT_FETCH: up to `rows` rows from an open cursor.
    ///
    /// Returns the rows and whether the cursor is exhausted.
    pub fn fetch(
        &mut self,
        statement_id: u32,
        rows: u32,
        columns: &[ColumnDef],
    ) -> Result<(Vec<Vec<Value>>, bool)> {
        self.ensure_ready()?;
        let payload = build_stmt_fetch_packet(statement_id, rows.max(1));
        self.guarded(|c| {
            c.send_payload(&payload)?;
            let mut out = Vec::new();
            while let Some(row) = c.read_row(columns, true)? {
                out.push(row);
            }
            let done = c.status_flags & server_status::SERVER_STATUS_LAST_ROW_SENT != 0
                || out.len() < rows.max(1) as usize;
            Ok((out, done))
        })
    }

    /// COM_STMT_RESET.
    pub fn reset_statement(&mut self, statement_id: u32) -> Result<()> {
        self.ensure_ready()?;
        let payload = build_stmt_reset_packet(statement_id);
        self.guarded(|c| {
            c.send_payload(&payload)?;
            c.read_ok()
        })
        .map(|_| ())
    }

    /// COM_STMT_CLOSE. Unknown ids are ignored. While a streaming result
    /// owns the connection the close is queued and sent once the stream ends.
    pub fn close_statement(&mut self, statement_id: u32) -> Result<()> {
        if !self.statements.contains_key(&statement_id) {
            return Ok(());
        }
        self.statements.remove(&statement_id);
        if self.dead {
            return Ok(());
        }
        if self.active_stream.is_some() {
            tracing::debug!(statement_id, "statement close deferred until the stream ends");
            self.pending_closes.push(statement_id);
            return Ok(());
        }
        let payload = build_stmt_close_packet(statement_id);
        self.guarded(|c| c.send_payload(&payload))
    }

    fn flush_pending_closes(&mut self) -> Result<()> {
        for statement_id in std::mem::take(&mut self.pending_closes) {
            let payload = build_stmt_close_packet(statement_id);
            self.guarded(|c| c.send_payload(&payload))?;
        }
        Ok(())
    }

    /// Close every server statement this connection holds.
    pub fn close_all_statements(&mut self) -> Result<()> {
        for id in self.open_statements() {
            self.close_statement(id)?;
        }
        Ok(())
    }

    // ==================== Framing ====================

    fn check_packet_size(&self, size: usize) -> Result<()> {
        if size > self.max_allowed_packet {
            tracing::debug!(size, max = self.max_allowed_packet, "payload exceeds max_allowed_packet");
            return Err(Error::PacketTooBig {
                size,
                max: self.max_allowed_packet,
            });
        }
        Ok(())
    }

    /// Send a command; fails before writing anything if it is too large.
    fn send_command(&mut self, command: Command, body: &[u8]) -> Result<()> {
        self.check_packet_size(body.len() + 1)?;
        let framed = encode_command(command, body);
        if let Some(trace) = &mut self.trace {
            let mut head = vec![command as u8];
            head.extend_from_slice(&body[..body.len().min(crate::trace::PREVIEW_BYTES)]);
            trace.record(Direction::Sent, 0, &head);
        }
        self.sequence_id = ((body.len() + 1) / MAX_PACKET_SIZE + 1) as u8;
        self.write_raw(&framed)
    }

    /// Send a payload whose first byte is the command.
    fn send_payload(&mut self, payload: &[u8]) -> Result<()> {
        self.check_packet_size(payload.len())?;
        let framed = PacketWriter::build_packet_from_payload(payload, 0);
        if let Some(trace) = &mut self.trace {
            trace.record(Direction::Sent, 0, payload);
        }
        self.sequence_id = (payload.len() / MAX_PACKET_SIZE + 1) as u8;
        self.write_raw(&framed)
    }

    /// Send a payload continuing the current sequence (handshake and auth).
    fn write_packet(&mut self, payload: &[u8]) -> Result<()> {
        let framed = PacketWriter::build_packet_from_payload(payload, self.sequence_id);
        if let Some(trace) = &mut self.trace {
            trace.record(Direction::Sent, self.sequence_id, payload);
        }
        self.sequence_id = self
            .sequence_id
            .wrapping_add((payload.len() / MAX_PACKET_SIZE + 1) as u8);
        self.write_raw(&framed)
    }

    fn write_raw(&mut self, bytes: &[u8]) -> Result<()> {
        self.transport
            .write_all(bytes)
            .and_then(|()| self.transport.flush())
            .map_err(|e| disconnected("failed to write packet", e))
    }

    /// Read one logical packet, joining continuation frames.
    fn read_packet(&mut self) -> Result<Vec<u8>> {
        let mut payload = Vec::new();
        loop {
            let mut head = [0u8; PacketHeader::SIZE];
            self.transport
                .read_exact(&mut head)
                .map_err(|e| disconnected("failed to read packet header", e))?;
            let header = PacketHeader::from_bytes(&head);
            let len = header.payload_length as usize;
            let start = payload.len();
            payload.resize(start + len, 0);
            self.transport
                .read_exact(&mut payload[start..])
                .map_err(|e| disconnected("failed to read packet payload", e))?;
            self.sequence_id = header.sequence_id.wrapping_add(1);
            if let Some(trace) = &mut self.trace {
                trace.record(Direction::Received, header.sequence_id, &payload[start..]);
            }
            if len < MAX_PACKET_SIZE {
                return Ok(payload);
            }
        }
    }

    // ==================== Responses ====================

    fn deprecate_eof(&self) -> bool {
        self.client_capabilities & capabilities::CLIENT_DEPRECATE_EOF != 0
    }

    fn apply_ok(&mut self, ok: &OkPacket) {
        self.status_flags = ok.status_flags;
        self.affected_rows = ok.affected_rows;
        self.last_insert_id = ok.last_insert_id;
        self.warnings = ok.warnings;
    }

    fn query_error(&self, payload: &[u8]) -> Error {
        match PacketReader::new(payload).parse_err_packet() {
            Ok(err) => query_error(&err),
            Err(e) => e,
        }
    }

    fn read_ok(&mut self) -> Result<OkPacket> {
        match self.read_response()? {
            Response::Ok(ok) => Ok(ok),
            Response::Columns(_) => Err(Error::protocol("expected OK packet, got a result set")),
        }
    }

    /// Read the first response packet of a command.
    fn read_response(&mut self) -> Result<Response> {
        let payload = self.read_packet()?;
        let Some(&first) = payload.first() else {
            return Err(Error::protocol("empty response packet"));
        };
        match PacketType::from_first_byte(first, payload.len() as u32) {
            PacketType::Ok => {
                let ok = PacketReader::new(&payload).parse_ok_packet()?;
                self.apply_ok(&ok);
                Ok(Response::Ok(ok))
            }
            PacketType::Error => Err(self.query_error(&payload)),
            PacketType::LocalInfile => {
                // Refuse by sending an empty file; the server then answers.
                self.write_packet(&[])?;
                if let Err(e) = self.read_response() {
                    if e.is_fatal() {
                        return Err(e);
                    }
                }
                Err(Error::Query(QueryError {
                    kind: QueryErrorKind::Permission,
                    sql: None,
                    sqlstate: None,
                    code: None,
                    message: "LOAD DATA LOCAL INFILE is not supported".to_string(),
                    source: None,
                }))
            }
            PacketType::Eof | PacketType::Data => {
                let count = PacketReader::new(&payload).read_lenenc_len()?;
                let columns = self.read_column_block(count)?;
                Ok(Response::Columns(columns))
            }
        }
    }

    /// Read `count` column definitions plus the EOF that follows them on
    /// servers without `CLIENT_DEPRECATE_EOF`.
    fn read_column_block(&mut self, count: usize) -> Result<Vec<ColumnDef>> {
        let mut columns = Vec::with_capacity(count);
        for _ in 0..count {
            let payload = self.read_packet()?;
            columns.push(ColumnDef::parse(
                &payload,
                self.negotiator.mapping(),
                self.charset.session_encoding,
            )?);
        }
        if count > 0 && !self.deprecate_eof() {
            let eof = self.read_packet()?;
            if eof.first() != Some(&0xFE) {
                return Err(Error::protocol("expected EOF after column definitions"));
            }
        }
        Ok(columns)
    }

    /// Read one row; `None` at the end of the row set.
    fn read_row(&mut self, columns: &[ColumnDef], binary: bool) -> Result<Option<Vec<Value>>> {
        let payload = self.read_packet()?;
        let Some(&first) = payload.first() else {
            return Err(Error::protocol("empty row packet"));
        };
        match PacketType::from_first_byte(first, payload.len() as u32) {
            PacketType::Eof => {
                let mut reader = PacketReader::new(&payload);
                if self.deprecate_eof() {
                    let ok = reader.parse_ok_packet()?;
                    self.status_flags = ok.status_flags;
                    self.warnings = ok.warnings;
                } else {
                    let eof = reader.parse_eof_packet()?;
                    self.status_flags = eof.status_flags;
                    self.warnings = eof.warnings;
                }
                Ok(None)
            }
            PacketType::Error => Err(self.query_error(&payload)),
            _ if binary => decode_binary_row(columns, &payload).map(Some),
            _ => decode_text_row(columns, &payload).map(Some),
        }
    }

    fn read_rows_into(&mut self, columns: Vec<ColumnDef>, binary: bool) -> Result<QueryResult> {
        let mut rows = Vec::new();
        while let Some(row) = self.read_row(&columns, binary)? {
            rows.push(row);
        }
        Ok(QueryResult {
            columns: Arc::new(columns),
            rows,
            affected_rows: 0,
            last_insert_id: 0,
            warnings: self.warnings,
            info: String::new(),
        })
    }

    fn more_results(&self) -> bool {
        self.status_flags & server_status::SERVER_MORE_RESULTS_EXISTS != 0
    }

    fn read_all_results(&mut self, binary: bool) -> Result<Vec<QueryResult>> {
        let mut results = Vec::new();
        loop {
            let result = match self.read_response()? {
                Response::Ok(ok) => QueryResult::from_ok(ok),
                Response::Columns(columns) => self.read_rows_into(columns, binary)?,
            };
            results.push(result);
            if !self.more_results() {
                return Ok(results);
            }
        }
    }

    fn drain_more_results(&mut self, binary: bool) -> Result<()> {
        while self.more_results() {
            match self.read_response()? {
                Response::Ok(_) => {}
                Response::Columns(columns) => while self.read_row(&columns, binary)?.is_some() {},
            }
        }
        Ok(())
    }

    // ==================== Handshake ====================

    fn read_handshake(&mut self) -> Result<(Vec<u8>, AuthPlugin)> {
        let payload = self.read_packet()?;
        if payload.first() == Some(&0xFF) {
            let err = self.query_error(&payload);
            return Err(Error::connection(ConnectionErrorKind::Connect, err.to_string()));
        }
        let mut reader = PacketReader::new(&payload);

        let protocol_version = reader.read_u8()?;
        if protocol_version != 10 {
            return Err(Error::protocol(format!(
                "unsupported protocol version {protocol_version}"
            )));
        }
        self.server.server_version = reader.read_null_string()?;
        self.server.connection_id = reader.read_u32_le()?;
        let mut seed = reader.read_bytes(8)?.to_vec();
        reader.skip(1)?;
        let caps_lower = reader.read_u16_le()?;
        self.server.default_collation = reader.read_u8()?;
        self.status_flags = reader.read_u16_le()?;
        let caps_upper = reader.read_u16_le()?;
        let caps = u32::from(caps_lower) | (u32::from(caps_upper) << 16);
        self.server.capabilities = caps;

        if caps & capabilities::CLIENT_PROTOCOL_41 == 0 {
            return Err(Error::protocol("server does not speak protocol 4.1"));
        }

        let auth_data_len = usize::from(reader.read_u8()?);
        reader.skip(10)?;
        if caps & capabilities::CLIENT_SECURE_CONNECTION != 0 {
            let len = auth_data_len.saturating_sub(8).max(13);
            let part = reader.read_bytes(len.min(reader.remaining()))?;
            seed.extend_from_slice(part.strip_suffix(&[0]).unwrap_or(part));
        }
        let plugin_name = if caps & capabilities::CLIENT_PLUGIN_AUTH != 0 {
            reader.read_null_string()?
        } else {
            auth::MYSQL_NATIVE_PASSWORD.to_string()
        };
        let plugin = AuthPlugin::from_name(&plugin_name)?;
        self.client_capabilities = self.config.capability_flags() & caps;
        Ok((seed, plugin))
    }

    fn send_handshake_response(&mut self, seed: &[u8], plugin: AuthPlugin) -> Result<()> {
        let caps = self.client_capabilities;
        let password = self.config.password.clone().unwrap_or_default();
        let auth_response = plugin.scramble(&password, seed);

        let mut writer = PacketWriter::new();
        writer.write_u32_le(caps);
        writer.write_u32_le(MAX_PACKET_SIZE as u32);
        writer.write_u8(self.charset.handshake_collation);
        writer.write_zeros(23);
        writer.write_null_string(&self.config.user);

        if caps & capabilities::CLIENT_PLUGIN_AUTH_LENENC_CLIENT_DATA != 0 {
            writer.write_lenenc_bytes(&auth_response);
        } else {
            writer.write_u8(auth_response.len() as u8);
            writer.write_bytes(&auth_response);
        }
        if caps & capabilities::CLIENT_CONNECT_WITH_DB != 0 {
            writer.write_null_string(self.config.database.as_deref().unwrap_or(""));
        }
        if caps & capabilities::CLIENT_PLUGIN_AUTH != 0 {
            writer.write_null_string(plugin.name());
        }
        if caps & capabilities::CLIENT_CONNECT_ATTRS != 0 {
            let mut attrs = PacketWriter::new();
            let mut keys: Vec<&String> = self.config.attributes.keys().collect();
            keys.sort();
            for key in keys {
                attrs.write_lenenc_string(key);
                attrs.write_lenenc_string(&self.config.attributes[key]);
            }
            writer.write_lenenc_bytes(attrs.as_bytes());
        }

        self.write_packet(writer.as_bytes())
    }

    fn handle_auth_result(&mut self, seed: &[u8], plugin: AuthPlugin) -> Result<()> {
        let mut seed = seed.to_vec();
        let mut plugin = plugin;
        loop {
            let payload = self.read_packet()?;
            match payload.first() {
                Some(0x00) => {
                    let ok = PacketReader::new(&payload).parse_ok_packet()?;
                    self.apply_ok(&ok);
                    return Ok(());
                }
                Some(0xFF) => {
                    let err = self.query_error(&payload);
                    return Err(Error::connection(
                        ConnectionErrorKind::Authentication,
                        format!("authentication failed: {err}"),
                    ));
                }
                Some(0xFE) => {
                    let mut reader = PacketReader::new(&payload[1..]);
                    plugin = AuthPlugin::from_name(&reader.read_null_string()?)?;
                    let data = reader.read_rest();
                    seed = data.strip_suffix(&[0]).unwrap_or(data).to_vec();
                    tracing::debug!(plugin = plugin.name(), "auth switch");
                    let password = self.config.password.clone().unwrap_or_default();
                    let response = plugin.scramble(&password, &seed);
                    self.write_packet(&response)?;
                }
                Some(0x01) => self.handle_auth_more_data(&payload[1..], &seed)?,
                _ => return Err(Error::protocol("unexpected packet during authentication")),
            }
        }
    }

    /// `caching_sha2_password` follow-up (0x01 prefixed packets).
    fn handle_auth_more_data(&mut self, data: &[u8], seed: &[u8]) -> Result<()> {
        match data.first() {
            Some(&auth::caching_sha2::FAST_AUTH_SUCCESS) => Ok(()),
            Some(&auth::caching_sha2::PERFORM_FULL_AUTH) => {
                tracing::debug!("caching_sha2_password full authentication over RSA");
                self.write_packet(&[auth::caching_sha2::REQUEST_PUBLIC_KEY])
            }
            // Anything else is the PEM public key we asked for
            Some(_) => {
                let password = self.config.password.clone().unwrap_or_default();
                let encrypted = auth::rsa_encrypt_password(&password, seed, data)?;
                self.write_packet(&encrypted)
            }
            None => Err(Error::protocol("empty auth continuation packet")),
        }
    }

    fn load_session_variables(&mut self) -> Result<()> {
        let result = self.query("SELECT @@max_allowed_packet, @@session.time_zone")?;
        if let Some(row) = result.rows.first() {
            if let Some(max) = row.first().and_then(Value::as_u64) {
                self.max_allowed_packet = usize::try_from(max).unwrap_or(usize::MAX);
            }
            if let Some(Value::Text(tz)) = row.get(1) {
                self.session_time_zone.clone_from(tz);
            }
        }
        Ok(())
    }
}

fn read_full(source: &mut dyn Read, buf: &mut [u8]) -> Result<usize> {
    let mut filled = 0;
    while filled < buf.len() {
        match source.read(&mut buf[filled..]) {
            Ok(0) => break,
            Ok(n) => filled += n,
            Err(e) if e.kind() == std::io::ErrorKind::Interrupted => {}
            Err(e) => {
                // the parameter source failed, not the connection
                return Err(Error::InvalidArgument(format!(
                    "failed to read stream parameter: {e}"
                )));
            }
        }
    }
    Ok(filled)
}

fn disconnected(context: &str, e: std::io::Error) -> Error {
    Error::Connection(ConnectionError {
        kind: ConnectionErrorKind::Disconnected,
        message: format!("{context}: {e}"),
        source: Some(Box::new(e)),
    })
}

fn with_sql(err: Error, sql: &str) -> Error {
    match err {
        Error::Query(mut q) if q.sql.is_none() => {
            q.sql = Some(sql.to_string());
            Error::Query(q)
        }
        other => other,
    }
}

/// Map a server ERR packet to a query error.
pub fn query_error(err: &ErrPacket) -> Error {
    let kind = match err.error_code {
        1062 | 1451 | 1452 | 1048 | 1216 | 1217 | 3819 => QueryErrorKind::Constraint,
        1064 | 1149 => QueryErrorKind::Syntax,
        1146 | 1054 | 1049 | 1051 => QueryErrorKind::NotFound,
        1044 | 1045 | 1142 | 1143 | 1227 => QueryErrorKind::Permission,
        1264 | 1265 | 1406 => QueryErrorKind::DataTruncation,
        1213 => QueryErrorKind::Deadlock,
        1205 | 3024 => QueryErrorKind::Timeout,
        _ => QueryErrorKind::Database,
    };
    Error::Query(QueryError {
        kind,
        sql: None,
        sqlstate: (!err.sql_state.is_empty()).then(|| err.sql_state.clone()),
        code: Some(err.error_code),
        message: err.error_message.clone(),
        source: None,
    })
}

/// A physical connection behind a mutex, shared by statements, result
/// sets and locators.
#[derive(Debug, Clone)]
pub struct SharedConnection(Arc<Mutex<PhysicalConnection>>);

impl SharedConnection {
    pub fn new(conn: PhysicalConnection) -> Self {
        Self(Arc::new(Mutex::new(conn)))
    }

    /// Connect and wrap.
    pub fn connect(config: MySqlConfig) -> Result<Self> {
        PhysicalConnection::connect(config).map(Self::new)
    }

    /// Lock for one exchange.
    pub fn lock(&self) -> MutexGuard<'_, PhysicalConnection> {
        self.0.lock()
    }

    pub fn downgrade(&self) -> WeakConnection {
        WeakConnection(Arc::downgrade(&self.0))
    }

    /// Do both handles refer to the same physical connection?
    pub fn ptr_eq(&self, other: &SharedConnection) -> bool {
        Arc::ptr_eq(&self.0, &other.0)
    }
}

/// Non-owning reference to a [`SharedConnection`].
#[derive(Debug, Clone)]
pub struct WeakConnection(Weak<Mutex<PhysicalConnection>>);

impl WeakConnection {
    pub fn upgrade(&self) -> Option<SharedConnection> {
        self.0.upgrade().map(SharedConnection)
    }
}
