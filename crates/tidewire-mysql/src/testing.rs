//! In-process MySQL server for tests.
//!
//! [`MockServer`] listens on `127.0.0.1:0` and speaks enough of the
//! protocol for the driver: handshake, COM_QUERY (with multi-statements),
//! the prepared statement commands including cursors and long data,
//! COM_PING, COM_INIT_DB and COM_RESET_CONNECTION.
//!
//! Every SQL text, whether sent as a query or produced by executing a
//! prepared statement with its decoded parameters, is answered by a
//! handler closure returning a [`Reply`]. Commands are recorded in a log
//! that tests can inspect.

use std::collections::{HashMap, VecDeque};
use std::io::{Read, Write};
use std::net::{SocketAddr, TcpListener, TcpStream};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::thread::JoinHandle;

use parking_lot::Mutex;
use tidewire_core::{Error, Result, Value};

use crate::auth;
use crate::charset::Encoding;
use crate::config::MySqlConfig;
use crate::connection::SharedConnection;
use crate::protocol::prepared::{CURSOR_TYPE_READ_ONLY, encode_binary_value};
use crate::protocol::{
    Command, MAX_PACKET_SIZE, PacketHeader, PacketReader, PacketWriter, capabilities,
    server_status,
};
use crate::sql::{ParsedSql, split_statements};
use crate::types::{BINARY_COLLATION, ColumnDef, FieldType, column_flags, read_binary_value};

/// Session variables the driver reads after connecting.
const SESSION_QUERY: &str = "SELECT @@max_allowed_packet, @@session.time_zone";

/// Mock server settings.
#[derive(Debug, Clone)]
pub struct MockOptions {
    pub server_version: String,
    /// Collation id announced in the handshake
    pub default_collation: u8,
    /// Reported as `@@max_allowed_packet`
    pub max_allowed_packet: u64,
    pub time_zone: String,
    /// Offer `CLIENT_DEPRECATE_EOF`
    pub deprecate_eof: bool,
    /// `mysql_native_password` or `caching_sha2_password` (fast path)
    pub auth_plugin: &'static str,
    /// Set `SERVER_STATUS_NO_BACKSLASH_ESCAPES` in every status
    pub no_backslash_escapes: bool,
}

impl Default for MockOptions {
    fn default() -> Self {
        Self {
            server_version: "8.0.36-mock".to_string(),
            default_collation: 255,
            max_allowed_packet: 16 * 1024 * 1024,
            time_zone: "SYSTEM".to_string(),
            deprecate_eof: true,
            auth_plugin: auth::MYSQL_NATIVE_PASSWORD,
            no_backslash_escapes: false,
        }
    }
}

/// Column of a mock result set.
#[derive(Debug, Clone, PartialEq)]
pub struct MockColumn {
    pub name: String,
    pub field_type: FieldType,
    pub flags: u16,
    pub charset: u16,
    pub schema: String,
    pub table: String,
    pub decimals: u8,
}

impl MockColumn {
    /// Column without an origin table. Blob-like types use the binary
    /// charset, everything else `utf8mb4_general_ci`.
    pub fn new(name: &str, field_type: FieldType) -> Self {
        let binary = matches!(
            field_type,
            FieldType::Blob
                | FieldType::TinyBlob
                | FieldType::MediumBlob
                | FieldType::LongBlob
                | FieldType::Bit
                | FieldType::Geometry
        );
        Self {
            name: name.to_string(),
            field_type,
            flags: if binary { column_flags::BLOB | column_flags::BINARY } else { 0 },
            charset: if binary { BINARY_COLLATION } else { 45 },
            schema: String::new(),
            table: String::new(),
            decimals: 0,
        }
    }

    /// Mark the column as coming from `schema.table`.
    pub fn table(mut self, schema: &str, table: &str) -> Self {
        self.schema = schema.to_string();
        self.table = table.to_string();
        self
    }

    pub fn flags(mut self, flags: u16) -> Self {
        self.flags |= flags;
        self
    }

    pub fn primary_key(self) -> Self {
        self.flags(column_flags::PRIMARY_KEY | column_flags::NOT_NULL)
    }

    pub fn unsigned(self) -> Self {
        self.flags(column_flags::UNSIGNED)
    }

    pub fn charset(mut self, collation: u16) -> Self {
        self.charset = collation;
        self
    }

    pub fn decimals(mut self, decimals: u8) -> Self {
        self.decimals = decimals;
        self
    }

    fn packet(&self) -> Vec<u8> {
        let mut w = PacketWriter::new();
        for s in [
            "def",
            self.schema.as_str(),
            self.table.as_str(),
            self.table.as_str(),
            self.name.as_str(),
            self.name.as_str(),
        ] {
            w.write_lenenc_string(s);
        }
        w.write_lenenc_int(0x0c);
        w.write_u16_le(self.charset);
        w.write_u32_le(1024);
        w.write_u8(self.field_type as u8);
        w.write_u16_le(self.flags);
        w.write_u8(self.decimals);
        w.write_u16_le(0);
        w.into_bytes()
    }
}

/// Rows returned by a mock statement.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct MockRows {
    pub columns: Vec<MockColumn>,
    pub rows: Vec<Vec<Value>>,
}

/// Handler answer for one SQL statement.
#[derive(Debug, Clone, PartialEq)]
pub enum Reply {
    Ok {
        affected_rows: u64,
        last_insert_id: u64,
    },
    Rows(MockRows),
    Error {
        code: u16,
        sql_state: String,
        message: String,
    },
    /// Drop the connection without answering
    Hangup,
    /// Send the rows, then drop the connection before the terminator
    RowsThenHangup(MockRows),
    /// Ask the client for a local file, then answer with `then` once the
    /// upload ends
    LocalInfile { file: String, then: Box<Reply> },
}

impl Reply {
    pub fn ok() -> Self {
        Self::affected(0)
    }

    pub fn affected(affected_rows: u64) -> Self {
        Reply::Ok {
            affected_rows,
            last_insert_id: 0,
        }
    }

    pub fn inserted(affected_rows: u64, last_insert_id: u64) -> Self {
        Reply::Ok {
            affected_rows,
            last_insert_id,
        }
    }

    pub fn rows(columns: Vec<MockColumn>, rows: Vec<Vec<Value>>) -> Self {
        Reply::Rows(MockRows { columns, rows })
    }

    /// Single row, single column.
    pub fn scalar(name: &str, field_type: FieldType, value: Value) -> Self {
        Self::rows(vec![MockColumn::new(name, field_type)], vec![vec![value]])
    }

    pub fn rows_then_hangup(columns: Vec<MockColumn>, rows: Vec<Vec<Value>>) -> Self {
        Reply::RowsThenHangup(MockRows { columns, rows })
    }

    pub fn local_infile(file: &str, then: Reply) -> Self {
        Reply::LocalInfile {
            file: file.to_string(),
            then: Box::new(then),
        }
    }

    pub fn error(code: u16, sql_state: &str, message: &str) -> Self {
        Reply::Error {
            code,
            sql_state: sql_state.to_string(),
            message: message.to_string(),
        }
    }
}

/// A command the mock server received.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Logged {
    Handshake {
        collation: u8,
        user: String,
        database: Option<String>,
    },
    Query(String),
    Prepare(String),
    /// The prepared SQL with its parameters substituted
    Execute {
        statement_id: u32,
        sql: String,
        cursor: bool,
    },
    LongData {
        statement_id: u32,
        param: u16,
        bytes: usize,
    },
    Fetch {
        statement_id: u32,
        rows: u32,
    },
    Close(u32),
    Reset(u32),
    Ping,
    InitDb(String),
    ResetConnection,
    Quit,
}

type Handler = Arc<dyn Fn(&str) -> Reply + Send + Sync>;

struct Shared {
    options: MockOptions,
    handler: Handler,
    log: Mutex<Vec<Logged>>,
    next_connection_id: AtomicU32,
}

/// A running mock server. Dropping it stops accepting connections.
pub struct MockServer {
    addr: SocketAddr,
    shared: Arc<Shared>,
    stop: Arc<AtomicBool>,
    acceptor: Option<JoinHandle<()>>,
}

impl std::fmt::Debug for MockServer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MockServer").field("addr", &self.addr).finish_non_exhaustive()
    }
}

impl MockServer {
    /// Start a server answering SQL with `handler`.
    pub fn start<F>(options: MockOptions, handler: F) -> std::io::Result<Self>
    where
        F: Fn(&str) -> Reply + Send + Sync + 'static,
    {
        let listener = TcpListener::bind("127.0.0.1:0")?;
        let addr = listener.local_addr()?;
        let shared = Arc::new(Shared {
            options,
            handler: Arc::new(handler),
            log: Mutex::new(Vec::new()),
            next_connection_id: AtomicU32::new(1),
        });
        let stop = Arc::new(AtomicBool::new(false));

        let acceptor = {
            let shared = Arc::clone(&shared);
            let stop = Arc::clone(&stop);
            std::thread::spawn(move || {
                for stream in listener.incoming() {
                    if stop.load(Ordering::Acquire) {
                        break;
                    }
                    let Ok(stream) = stream else { continue };
                    let shared = Arc::clone(&shared);
                    std::thread::spawn(move || {
                        let id = shared.next_connection_id.fetch_add(1, Ordering::Relaxed);
                        if let Err(e) = Session::new(stream, shared, id).run() {
                            tracing::trace!(error = %e, connection_id = id, "mock session ended");
                        }
                    });
                }
            })
        };

        Ok(Self {
            addr,
            shared,
            stop,
            acceptor: Some(acceptor),
        })
    }

    /// Start with default options.
    pub fn with_handler<F>(handler: F) -> std::io::Result<Self>
    where
        F: Fn(&str) -> Reply + Send + Sync + 'static,
    {
        Self::start(MockOptions::default(), handler)
    }

    pub fn port(&self) -> u16 {
        self.addr.port()
    }

    /// Configuration pointing at this server.
    pub fn config(&self) -> MySqlConfig {
        MySqlConfig::new()
            .host("127.0.0.1")
            .port(self.addr.port())
            .user("tidewire")
            .password("secret")
            .connect_timeout(std::time::Duration::from_secs(5))
    }

    pub fn connect(&self) -> Result<SharedConnection> {
        SharedConnection::connect(self.config())
    }

    pub fn connect_with(&self, config: MySqlConfig) -> Result<SharedConnection> {
        SharedConnection::connect(config)
    }

    /// Everything received so far, across connections.
    pub fn log(&self) -> Vec<Logged> {
        self.shared.log.lock().clone()
    }

    /// Text of every COM_QUERY received.
    pub fn queries(&self) -> Vec<String> {
        self.log()
            .into_iter()
            .filter_map(|entry| match entry {
                Logged::Query(sql) => Some(sql),
                _ => None,
            })
            .collect()
    }

    /// Wait until something matching `wanted` is logged. Commands with no
    /// reply (quit, statement close) reach the log after the client moved on.
    pub fn wait_for(&self, wanted: impl Fn(&Logged) -> bool) -> bool {
        let until = std::time::Instant::now() + std::time::Duration::from_secs(2);
        loop {
            if self.shared.log.lock().iter().any(&wanted) {
                return true;
            }
            if std::time::Instant::now() >= until {
                return false;
            }
            std::thread::sleep(std::time::Duration::from_millis(5));
        }
    }

    pub fn clear_log(&self) {
        self.shared.log.lock().clear();
    }
}

impl Drop for MockServer {
    fn drop(&mut self) {
        self.stop.store(true, Ordering::Release);
        // wake the acceptor so it sees the flag
        let _ = TcpStream::connect(self.addr);
        if let Some(handle) = self.acceptor.take() {
            let _ = handle.join();
        }
    }
}

#[derive(Debug, Default)]
struct MockStatement {
    sql: Option<ParsedSql>,
    types: Vec<(FieldType, bool)>,
    long_data: HashMap<u16, Vec<u8>>,
    cursor_columns: Vec<MockColumn>,
    cursor: VecDeque<Vec<Value>>,
}

struct Session {
    stream: TcpStream,
    shared: Arc<Shared>,
    connection_id: u32,
    seq: u8,
    deprecate_eof: bool,
    in_transaction: bool,
    statements: HashMap<u32, MockStatement>,
    next_statement: u32,
}

impl Session {
    fn new(stream: TcpStream, shared: Arc<Shared>, connection_id: u32) -> Self {
        Self {
            stream,
            shared,
            connection_id,
            seq: 0,
            deprecate_eof: false,
            in_transaction: false,
            statements: HashMap::new(),
            next_statement: 1,
        }
    }

    fn record(&self, entry: Logged) {
        self.shared.log.lock().push(entry);
    }

    fn status(&self) -> u16 {
        let mut status = server_status::SERVER_STATUS_AUTOCOMMIT;
        if self.in_transaction {
            status |= server_status::SERVER_STATUS_IN_TRANS;
        }
        if self.shared.options.no_backslash_escapes {
            status |= server_status::SERVER_STATUS_NO_BACKSLASH_ESCAPES;
        }
        status
    }

    // ==================== Framing ====================

    fn read_packet(&mut self) -> Result<Vec<u8>> {
        let mut payload = Vec::new();
        loop {
            let mut head = [0u8; PacketHeader::SIZE];
            self.stream.read_exact(&mut head)?;
            let header = PacketHeader::from_bytes(&head);
            let start = payload.len();
            payload.resize(start + header.payload_length as usize, 0);
            self.stream.read_exact(&mut payload[start..])?;
            self.seq = header.sequence_id.wrapping_add(1);
            if (header.payload_length as usize) < MAX_PACKET_SIZE {
                return Ok(payload);
            }
        }
    }

    fn send(&mut self, payload: &[u8]) -> Result<()> {
        let framed = PacketWriter::build_packet_from_payload(payload, self.seq);
        self.seq = self
            .seq
            .wrapping_add((payload.len() / MAX_PACKET_SIZE + 1) as u8);
        self.stream.write_all(&framed)?;
        Ok(())
    }

    fn send_ok(&mut self, affected_rows: u64, last_insert_id: u64, extra_status: u16) -> Result<()> {
        let mut w = PacketWriter::new();
        w.write_u8(0x00);
        w.write_lenenc_int(affected_rows);
        w.write_lenenc_int(last_insert_id);
        w.write_u16_le(self.status() | extra_status);
        w.write_u16_le(0);
        self.send(w.as_bytes())
    }

    fn send_err(&mut self, code: u16, sql_state: &str, message: &str) -> Result<()> {
        let mut w = PacketWriter::new();
        w.write_u8(0xFF);
        w.write_u16_le(code);
        w.write_u8(b'#');
        w.write_bytes(format!("{sql_state:<5.5}").as_bytes());
        w.write_bytes(message.as_bytes());
        self.send(w.as_bytes())
    }

    /// End of a row set: EOF, or an OK packet with an 0xFE header.
    fn send_terminator(&mut self, extra_status: u16) -> Result<()> {
        let status = self.status() | extra_status;
        let mut w = PacketWriter::new();
        w.write_u8(0xFE);
        if self.deprecate_eof {
            w.write_lenenc_int(0);
            w.write_lenenc_int(0);
            w.write_u16_le(status);
            w.write_u16_le(0);
        } else {
            w.write_u16_le(0);
            w.write_u16_le(status);
        }
        self.send(w.as_bytes())
    }

    fn send_eof_if_needed(&mut self) -> Result<()> {
        if self.deprecate_eof {
            Ok(())
        } else {
            let mut w = PacketWriter::new();
            w.write_u8(0xFE);
            w.write_u16_le(0);
            w.write_u16_le(self.status());
            self.send(w.as_bytes())
        }
    }

    fn send_columns(&mut self, columns: &[MockColumn]) -> Result<()> {
        let mut w = PacketWriter::new();
        w.write_lenenc_int(columns.len() as u64);
        self.send(w.as_bytes())?;
        for col in columns {
            self.send(&col.packet())?;
        }
        self.send_eof_if_needed()
    }

    fn send_rows(&mut self, rows: &MockRows, binary: bool, extra_status: u16) -> Result<()> {
        self.send_row_data(rows, binary)?;
        self.send_terminator(extra_status)
    }

    fn send_row_data(&mut self, rows: &MockRows, binary: bool) -> Result<()> {
        self.send_columns(&rows.columns)?;
        for row in &rows.rows {
            let payload = if binary {
                binary_row(&rows.columns, row)
            } else {
                text_row(row)
            };
            self.send(&payload)?;
        }
        Ok(())
    }

    fn send_reply(&mut self, reply: Reply, binary: bool, extra_status: u16) -> Result<bool> {
        match reply {
            Reply::Ok {
                affected_rows,
                last_insert_id,
            } => self.send_ok(affected_rows, last_insert_id, extra_status)?,
            Reply::Rows(rows) => self.send_rows(&rows, binary, extra_status)?,
            Reply::Error {
                code,
                sql_state,
                message,
            } => {
                self.send_err(code, &sql_state, &message)?;
                return Ok(false);
            }
            Reply::Hangup => return Err(hangup()),
            Reply::RowsThenHangup(rows) => {
                self.send_row_data(&rows, binary)?;
                return Err(hangup());
            }
            Reply::LocalInfile { file, then } => {
                let mut w = PacketWriter::new();
                w.write_u8(0xFB);
                w.write_bytes(file.as_bytes());
                self.send(w.as_bytes())?;
                // the upload ends with an empty packet
                while !self.read_packet()?.is_empty() {}
                return self.send_reply(*then, binary, extra_status);
            }
        }
        Ok(true)
    }

    fn answer(&self, sql: &str) -> Reply {
        if sql.trim().eq_ignore_ascii_case(SESSION_QUERY) {
            let options = &self.shared.options;
            return Reply::rows(
                vec![
                    MockColumn::new("@@max_allowed_packet", FieldType::LongLong).unsigned(),
                    MockColumn::new("@@session.time_zone", FieldType::VarString),
                ],
                vec![vec![
                    Value::UnsignedBigInt(options.max_allowed_packet),
                    Value::Text(options.time_zone.clone()),
                ]],
            );
        }
        (self.shared.handler)(sql)
    }

    fn track_transaction(&mut self, sql: &str) {
        let upper = sql.trim().to_ascii_uppercase();
        if upper == "BEGIN" || upper.starts_with("START TRANSACTION") {
            self.in_transaction = true;
        } else if upper == "COMMIT" || upper == "ROLLBACK" {
            self.in_transaction = false;
        }
    }

    // ==================== Commands ====================

    fn run(mut self) -> Result<()> {
        self.handshake()?;
        loop {
            let packet = self.read_packet()?;
            let Some((&command, body)) = packet.split_first() else {
                continue;
            };
            match Command::from_u8(command) {
                Some(Command::Quit) => {
                    self.record(Logged::Quit);
                    return Ok(());
                }
                Some(Command::InitDb) => {
                    self.record(Logged::InitDb(String::from_utf8_lossy(body).into_owned()));
                    self.send_ok(0, 0, 0)?;
                }
                Some(Command::Query) => self.query(&String::from_utf8_lossy(body))?,
                Some(Command::Ping) => {
                    self.record(Logged::Ping);
                    self.send_ok(0, 0, 0)?;
                }
                Some(Command::ResetConnection) => {
                    self.record(Logged::ResetConnection);
                    self.statements.clear();
                    self.in_transaction = false;
                    self.send_ok(0, 0, 0)?;
                }
                Some(Command::StmtPrepare) => self.prepare(&String::from_utf8_lossy(body))?,
                Some(Command::StmtExecute) => self.execute(body)?,
                Some(Command::StmtSendLongData) => {
                    let mut r = PacketReader::new(body);
                    let statement_id = r.read_u32_le()?;
                    let param = r.read_u16_le()?;
                    let data = r.read_rest();
                    self.record(Logged::LongData {
                        statement_id,
                        param,
                        bytes: data.len(),
                    });
                    if let Some(stmt) = self.statements.get_mut(&statement_id) {
                        stmt.long_data.entry(param).or_default().extend_from_slice(data);
                    }
                }
                Some(Command::StmtClose) => {
                    let statement_id = PacketReader::new(body).read_u32_le()?;
                    self.record(Logged::Close(statement_id));
                    self.statements.remove(&statement_id);
                }
                Some(Command::StmtReset) => {
                    let statement_id = PacketReader::new(body).read_u32_le()?;
                    self.record(Logged::Reset(statement_id));
                    match self.statements.get_mut(&statement_id) {
                        Some(stmt) => {
                            stmt.long_data.clear();
                            stmt.cursor.clear();
                            self.send_ok(0, 0, 0)?;
                        }
                        None => self.unknown_statement()?,
                    }
                }
                Some(Command::StmtFetch) => self.fetch(body)?,
                None => self.send_err(1047, "08S01", "Unknown command")?,
            }
        }
    }

    fn unknown_statement(&mut self) -> Result<()> {
        self.send_err(1243, "HY000", "Unknown prepared statement handler")
    }

    fn handshake(&mut self) -> Result<()> {
        let options = &self.shared.options;
        let mut caps = capabilities::CLIENT_PROTOCOL_41
            | capabilities::CLIENT_LONG_PASSWORD
            | capabilities::CLIENT_LONG_FLAG
            | capabilities::CLIENT_CONNECT_WITH_DB
            | capabilities::CLIENT_TRANSACTIONS
            | capabilities::CLIENT_SECURE_CONNECTION
            | capabilities::CLIENT_MULTI_STATEMENTS
            | capabilities::CLIENT_MULTI_RESULTS
            | capabilities::CLIENT_PS_MULTI_RESULTS
            | capabilities::CLIENT_PLUGIN_AUTH
            | capabilities::CLIENT_CONNECT_ATTRS
            | capabilities::CLIENT_PLUGIN_AUTH_LENENC_CLIENT_DATA;
        if options.deprecate_eof {
            caps |= capabilities::CLIENT_DEPRECATE_EOF;
        }

        let mut w = PacketWriter::new();
        w.write_u8(10);
        w.write_null_string(&options.server_version);
        w.write_u32_le(self.connection_id);
        w.write_bytes(b"01234567");
        w.write_u8(0);
        w.write_u16_le(caps as u16);
        w.write_u8(options.default_collation);
        w.write_u16_le(server_status::SERVER_STATUS_AUTOCOMMIT);
        w.write_u16_le((caps >> 16) as u16);
        w.write_u8(21);
        w.write_zeros(10);
        w.write_bytes(b"89abcdefghij");
        w.write_u8(0);
        w.write_null_string(options.auth_plugin);
        let plugin = options.auth_plugin;
        self.seq = 0;
        self.send(w.as_bytes())?;

        let response = self.read_packet()?;
        let mut r = PacketReader::new(&response);
        let client_caps = r.read_u32_le()?;
        r.skip(4)?;
        let collation = r.read_u8()?;
        r.skip(23)?;
        let user = r.read_null_string()?;
        if client_caps & capabilities::CLIENT_PLUGIN_AUTH_LENENC_CLIENT_DATA != 0 {
            r.read_lenenc_bytes()?;
        } else {
            let len = usize::from(r.read_u8()?);
            r.skip(len)?;
        }
        let database = if client_caps & capabilities::CLIENT_CONNECT_WITH_DB != 0 {
            Some(r.read_null_string()?).filter(|db| !db.is_empty())
        } else {
            None
        };
        self.deprecate_eof = client_caps & capabilities::CLIENT_DEPRECATE_EOF != 0;
        self.record(Logged::Handshake {
            collation,
            user,
            database,
        });

        if plugin == auth::CACHING_SHA2_PASSWORD {
            self.send(&[0x01, auth::caching_sha2::FAST_AUTH_SUCCESS])?;
        }
        self.send_ok(0, 0, 0)
    }

    fn query(&mut self, sql: &str) -> Result<()> {
        self.record(Logged::Query(sql.to_string()));
        let statements = split_statements(sql);
        if statements.is_empty() {
            return self.send_err(1065, "42000", "Query was empty");
        }
        let last = statements.len() - 1;
        for (i, statement) in statements.iter().enumerate() {
            let more = if i < last {
                server_status::SERVER_MORE_RESULTS_EXISTS
            } else {
                0
            };
            self.track_transaction(statement);
            let reply = self.answer(statement);
            if !self.send_reply(reply, false, more)? {
                break;
            }
        }
        Ok(())
    }

    fn prepare(&mut self, sql: &str) -> Result<()> {
        self.record(Logged::Prepare(sql.to_string()));
        let parsed = ParsedSql::parse(sql);
        let params = parsed.param_count();

        // probe row-returning statements for their columns
        let first_word = sql
            .trim_start()
            .split(|c: char| !c.is_ascii_alphabetic())
            .next()
            .unwrap_or("")
            .to_ascii_uppercase();
        let columns = if matches!(first_word.as_str(), "SELECT" | "SHOW" | "WITH") {
            let probe = parsed.interpolate(&vec![Value::Null; params], false)?;
            match self.answer(&probe) {
                Reply::Rows(rows) | Reply::RowsThenHangup(rows) => rows.columns,
                Reply::Error {
                    code,
                    sql_state,
                    message,
                } => return self.send_err(code, &sql_state, &message),
                Reply::Hangup => return Err(hangup()),
                Reply::Ok { .. } | Reply::LocalInfile { .. } => Vec::new(),
            }
        } else {
            Vec::new()
        };

        let id = self.next_statement;
        self.next_statement += 1;
        self.statements.insert(
            id,
            MockStatement {
                sql: Some(parsed),
                ..MockStatement::default()
            },
        );

        let mut w = PacketWriter::new();
        w.write_u8(0x00);
        w.write_u32_le(id);
        w.write_u16_le(columns.len() as u16);
        w.write_u16_le(params as u16);
        w.write_u8(0);
        w.write_u16_le(0);
        self.send(w.as_bytes())?;

        if params > 0 {
            let param = MockColumn::new("?", FieldType::VarString);
            for _ in 0..params {
                self.send(&param.packet())?;
            }
            self.send_eof_if_needed()?;
        }
        if !columns.is_empty() {
            for col in &columns {
                self.send(&col.packet())?;
            }
            self.send_eof_if_needed()?;
        }
        Ok(())
    }

    fn execute(&mut self, body: &[u8]) -> Result<()> {
        let mut r = PacketReader::new(body);
        let statement_id = r.read_u32_le()?;
        let flags = r.read_u8()?;
        r.skip(4)?;
        let cursor = flags & CURSOR_TYPE_READ_ONLY != 0;

        let sql = {
            let Some(stmt) = self.statements.get_mut(&statement_id) else {
                return self.unknown_statement();
            };
            let Some(parsed) = stmt.sql.as_ref() else {
                return self.unknown_statement();
            };
            let count = parsed.param_count();
            let mut values = Vec::with_capacity(count);
            if count > 0 {
                let bitmap = r.read_bytes(count.div_ceil(8))?.to_vec();
                if r.read_u8()? == 1 {
                    stmt.types = (0..count)
                        .map(|_| {
                            let ty = FieldType::from_u8(r.read_u8()?);
                            let flag = r.read_u8()?;
                            Ok((ty, flag & 0x80 != 0))
                        })
                        .collect::<Result<Vec<_>>>()?;
                }
                for i in 0..count {
                    if bitmap[i / 8] & (1 << (i % 8)) != 0 {
                        values.push(Value::Null);
                        continue;
                    }
                    let (ty, unsigned) = stmt.types.get(i).copied().ok_or_else(|| {
                        Error::protocol("execute without parameter types")
                    })?;
                    let col = param_column(ty, unsigned);
                    let value = match stmt.long_data.remove(&(i as u16)) {
                        Some(data) => crate::types::decode_text_value(&col, &data),
                        None => read_binary_value(&mut r, &col)?,
                    };
                    values.push(value);
                }
            }
            stmt.long_data.clear();
            parsed.interpolate(&values, false)?
        };

        self.record(Logged::Execute {
            statement_id,
            sql: sql.clone(),
            cursor,
        });
        match self.answer(&sql) {
            Reply::Rows(rows) if cursor => {
                self.send_columns(&rows.columns)?;
                self.send_terminator(server_status::SERVER_STATUS_CURSOR_EXISTS)?;
                if let Some(stmt) = self.statements.get_mut(&statement_id) {
                    stmt.cursor_columns = rows.columns;
                    stmt.cursor = rows.rows.into();
                }
                Ok(())
            }
            reply => self.send_reply(reply, true, 0).map(|_| ()),
        }
    }

    fn fetch(&mut self, body: &[u8]) -> Result<()> {
        let mut r = PacketReader::new(body);
        let statement_id = r.read_u32_le()?;
        let wanted = r.read_u32_le()?;
        self.record(Logged::Fetch {
            statement_id,
            rows: wanted,
        });
        let Some(stmt) = self.statements.get_mut(&statement_id) else {
            return self.unknown_statement();
        };
        let take = (wanted as usize).min(stmt.cursor.len());
        let rows: Vec<Vec<Value>> = stmt.cursor.drain(..take).collect();
        let done = stmt.cursor.is_empty();
        let columns = stmt.cursor_columns.clone();
        for row in &rows {
            self.send(&binary_row(&columns, row))?;
        }
        let mut status = server_status::SERVER_STATUS_CURSOR_EXISTS;
        if done {
            status |= server_status::SERVER_STATUS_LAST_ROW_SENT;
        }
        self.send_terminator(status)
    }
}

fn hangup() -> Error {
    Error::Io(std::io::Error::new(
        std::io::ErrorKind::ConnectionAborted,
        "mock server hung up",
    ))
}

fn param_column(field_type: FieldType, unsigned: bool) -> ColumnDef {
    let binary = matches!(
        field_type,
        FieldType::Blob
            | FieldType::TinyBlob
            | FieldType::MediumBlob
            | FieldType::LongBlob
            | FieldType::Bit
            | FieldType::Geometry
    );
    ColumnDef::synthetic(
        "?",
        field_type,
        if unsigned { column_flags::UNSIGNED } else { 0 },
        if binary { BINARY_COLLATION } else { 45 },
    )
}

fn text_value(value: &Value) -> Option<Vec<u8>> {
    Some(match value {
        Value::Null => return None,
        Value::Bool(b) => if *b { "1" } else { "0" }.into(),
        Value::TinyInt(v) => v.to_string().into_bytes(),
        Value::SmallInt(v) => v.to_string().into_bytes(),
        Value::Int(v) => v.to_string().into_bytes(),
        Value::BigInt(v) => v.to_string().into_bytes(),
        Value::UnsignedBigInt(v) => v.to_string().into_bytes(),
        Value::Float(v) => v.to_string().into_bytes(),
        Value::Double(v) => v.to_string().into_bytes(),
        Value::Decimal(d) => d.to_string().into_bytes(),
        Value::Text(s) => s.clone().into_bytes(),
        Value::Bytes(b) => b.clone(),
        Value::Json(j) => j.to_string().into_bytes(),
        Value::Date(d) => d.format("%Y-%m-%d").to_string().into_bytes(),
        Value::Time(t) => t.format("%H:%M:%S%.6f").to_string().into_bytes(),
        Value::Timestamp(ts) => ts.format("%Y-%m-%d %H:%M:%S%.6f").to_string().into_bytes(),
    })
}

fn text_row(values: &[Value]) -> Vec<u8> {
    let mut w = PacketWriter::new();
    for value in values {
        match text_value(value) {
            Some(bytes) => w.write_lenenc_bytes(&bytes),
            None => w.write_u8(0xFB),
        }
    }
    w.into_bytes()
}

/// Binary row laid out for `columns`. Fixed-width types are written at
/// the column's width whatever integer variant the handler used.
fn binary_row(columns: &[MockColumn], values: &[Value]) -> Vec<u8> {
    let mut w = PacketWriter::new();
    w.write_u8(0x00);
    let mut bitmap = vec![0u8; (values.len() + 7 + 2) / 8];
    for (i, value) in values.iter().enumerate() {
        if value.is_null() {
            let bit = i + 2;
            bitmap[bit / 8] |= 1 << (bit % 8);
        }
    }
    w.write_bytes(&bitmap);
    for (col, value) in columns.iter().zip(values) {
        if !value.is_null() {
            binary_cell(&mut w, col.field_type, value);
        }
    }
    w.into_bytes()
}

fn binary_cell(w: &mut PacketWriter, field_type: FieldType, value: &Value) {
    let int = || {
        value
            .as_i64()
            .or_else(|| value.as_u64().map(|u| u as i64))
            .unwrap_or_default()
    };
    match field_type {
        FieldType::Tiny => w.write_u8(int() as u8),
        FieldType::Short | FieldType::Year => w.write_u16_le(int() as u16),
        FieldType::Int24 | FieldType::Long => w.write_u32_le(int() as u32),
        FieldType::LongLong => match value {
            Value::UnsignedBigInt(u) => w.write_u64_le(*u),
            _ => w.write_u64_le(int() as u64),
        },
        FieldType::Float => w.write_u32_le((value.as_f64().unwrap_or_default() as f32).to_bits()),
        FieldType::Double => w.write_u64_le(value.as_f64().unwrap_or_default().to_bits()),
        FieldType::Date
        | FieldType::NewDate
        | FieldType::DateTime
        | FieldType::Timestamp
        | FieldType::DateTime2
        | FieldType::Timestamp2
        | FieldType::Time
        | FieldType::Time2 => encode_binary_value(w, value, Encoding::Utf8),
        FieldType::Null => {}
        _ => w.write_lenenc_bytes(&text_value(value).unwrap_or_default()),
    }
}
