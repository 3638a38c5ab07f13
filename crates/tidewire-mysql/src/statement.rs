//! Statement execution.
//!
//! A [`Statement`] runs one SQL text with `?` placeholders in one of two
//! ways:
//!
//! - **client-rewritten** (default): parameters are substituted locally
//!   as SQL literals and the text is sent with COM_QUERY
//! - **server-held** (`use_server_prepared_statements`): the text is
//!   prepared once per physical connection and executions send the
//!   statement id plus binary parameters
//!
//! The physical connection is resolved through the statement's
//! [`ConnectionContext`] on every execution, never cached.

use std::fmt;
use std::io::{Cursor, Read};
use std::sync::Arc;

use tidewire_core::{Error, Result, Value};

use crate::config::MySqlConfig;
use crate::connection::{
    CursorStart, PhysicalConnection, QueryResult, ServerStatement, SharedConnection, StreamStart,
    WeakConnection,
};
use crate::protocol::prepared::{ExecuteParam, LongData};
use crate::result_set::ResultSet;
use crate::routing::{ConnectionContext, report};
use crate::sql::{InsertValues, ParsedSql};
use crate::types::FieldType;

/// Most placeholders one server statement may carry.
const MAX_SERVER_PARAMS: usize = u16::MAX as usize;

/// Lifecycle of a statement.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StatementState {
    Created,
    Prepared,
    Executing,
    Executed,
    /// The last execution failed; the statement may be executed again.
    Failed,
    Closed,
}

/// Outcome of one row of a batch.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UpdateCount {
    Count(u64),
    /// The row ran as part of a merged statement; its own count is unknown.
    SuccessNoInfo,
}

/// How the bytes of a stream parameter are interpreted.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StreamKind {
    Binary,
    /// UTF-8 text, re-encoded in the session charset
    Character,
}

impl StreamKind {
    fn value(self, bytes: Vec<u8>) -> Result<Value> {
        match self {
            StreamKind::Binary => Ok(Value::Bytes(bytes)),
            StreamKind::Character => String::from_utf8(bytes).map(Value::Text).map_err(|e| {
                Error::InvalidArgument(format!("character stream is not valid UTF-8: {e}"))
            }),
        }
    }
}

struct StreamParam {
    reader: Box<dyn Read + Send>,
    length: Option<u64>,
    kind: StreamKind,
}

impl StreamParam {
    fn limited(&mut self) -> impl Read + '_ {
        (&mut self.reader).take(self.length.unwrap_or(u64::MAX))
    }

    fn read_all(&mut self) -> Result<Value> {
        let mut buf = Vec::new();
        self.limited()
            .read_to_end(&mut buf)
            .map_err(|e| Error::InvalidArgument(format!("failed to read stream parameter: {e}")))?;
        self.kind.value(buf)
    }
}

enum Param {
    Value(Value),
    Stream(StreamParam),
}

impl fmt::Debug for Param {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Param::Value(v) => f.debug_tuple("Value").field(v).finish(),
            Param::Stream(s) => f
                .debug_struct("Stream")
                .field("length", &s.length)
                .field("kind", &s.kind)
                .finish(),
        }
    }
}

/// Execution options, taken from the connection's [`MySqlConfig`] unless
/// set explicitly.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StatementOptions {
    pub server_side: bool,
    pub rewrite_batches: bool,
    pub streaming: bool,
    /// Rows per COM_STMT_FETCH; 0 disables cursor fetch
    pub fetch_size: u32,
    pub emulate_locators: bool,
    pub chunk_size: usize,
}

impl StatementOptions {
    pub fn from_config(config: &MySqlConfig) -> Self {
        Self {
            server_side: config.use_server_prepared_statements,
            rewrite_batches: config.rewrite_batched_statements,
            streaming: config.streaming_results,
            fetch_size: if config.use_cursor_fetch {
                config.default_fetch_size
            } else {
                0
            },
            emulate_locators: config.emulate_locators,
            chunk_size: config.blob_send_chunk_size.max(1),
        }
    }

    fn cursor_fetch(&self) -> bool {
        self.server_side && self.fetch_size > 0
    }
}

/// A SQL statement with placeholders.
pub struct Statement {
    context: Arc<dyn ConnectionContext>,
    parsed: ParsedSql,
    options: StatementOptions,
    params: Vec<Option<Param>>,
    batch: Vec<Vec<Value>>,
    prepared: Option<(WeakConnection, ServerStatement)>,
    state: StatementState,
    affected_rows: u64,
    last_insert_id: u64,
    warnings: u16,
}

impl fmt::Debug for Statement {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Statement")
            .field("sql", &self.parsed.sql())
            .field("state", &self.state)
            .field("options", &self.options)
            .field("params", &self.params)
            .field("batch", &self.batch.len())
            .field("server_id", &self.prepared.as_ref().map(|(_, s)| s.id))
            .finish()
    }
}

fn unset(index: usize) -> Error {
    Error::InvalidArgument(format!("parameter at index {index} is not set"))
}

impl Statement {
    /// Create a statement using the connection's configured options.
    pub fn new(context: Arc<dyn ConnectionContext>, sql: &str) -> Result<Self> {
        context.ensure_valid()?;
        let options = {
            let conn = context.active_connection()?;
            let conn = conn.lock();
            StatementOptions::from_config(conn.config())
        };
        Self::with_options(context, sql, options)
    }

    /// Create a statement with explicit options.
    pub fn with_options(
        context: Arc<dyn ConnectionContext>,
        sql: &str,
        options: StatementOptions,
    ) -> Result<Self> {
        context.ensure_valid()?;
        let parsed = ParsedSql::parse(sql);
        let mut params = Vec::new();
        params.resize_with(parsed.param_count(), || None);
        context.statement_opened();
        Ok(Self {
            context,
            parsed,
            options,
            params,
            batch: Vec::new(),
            prepared: None,
            state: StatementState::Created,
            affected_rows: 0,
            last_insert_id: 0,
            warnings: 0,
        })
    }

    /// Create and prepare a statement. Server-held statements are
    /// prepared on the active connection right away.
    pub fn prepare(context: Arc<dyn ConnectionContext>, sql: &str) -> Result<Self> {
        let mut stmt = Self::new(context, sql)?;
        stmt.prepare_now()?;
        Ok(stmt)
    }

    fn prepare_now(&mut self) -> Result<()> {
        self.check_open()?;
        if self.options.server_side {
            let conn = self.context.active_connection()?;
            self.release_foreign(&conn);
            let prepared = {
                let mut physical = conn.lock();
                self.server_statement(&conn, &mut physical).map(drop)
            };
            report(self.context.as_ref(), prepared)?;
        }
        if self.state == StatementState::Created {
            self.state = StatementState::Prepared;
        }
        Ok(())
    }

    pub fn sql(&self) -> &str {
        self.parsed.sql()
    }

    pub fn state(&self) -> StatementState {
        self.state
    }

    pub fn options(&self) -> &StatementOptions {
        &self.options
    }

    pub fn param_count(&self) -> usize {
        self.params.len()
    }

    /// Rows affected by the last execution (summed over a batch).
    pub fn affected_rows(&self) -> u64 {
        self.affected_rows
    }

    pub fn last_insert_id(&self) -> u64 {
        self.last_insert_id
    }

    /// Server warning count of the last execution.
    pub fn warnings(&self) -> u16 {
        self.warnings
    }

    fn check_open(&self) -> Result<()> {
        if self.state == StatementState::Closed {
            return Err(Error::InvalidArgument("statement is closed".to_string()));
        }
        self.context.ensure_valid()
    }

    // ==================== Parameters ====================

    fn slot(&mut self, index: usize) -> Result<&mut Option<Param>> {
        let count = self.params.len();
        self.params.get_mut(index).ok_or_else(|| {
            Error::InvalidArgument(format!(
                "parameter index {index} out of range ({count} parameters)"
            ))
        })
    }

    /// Bind a value to the placeholder at `index` (0-based).
    pub fn bind(&mut self, index: usize, value: impl Into<Value>) -> Result<()> {
        self.check_open()?;
        *self.slot(index)? = Some(Param::Value(value.into()));
        Ok(())
    }

    pub fn bind_null(&mut self, index: usize) -> Result<()> {
        self.bind(index, Value::Null)
    }

    /// Bind every placeholder in order.
    pub fn bind_all(&mut self, values: &[Value]) -> Result<()> {
        if values.len() != self.params.len() {
            return Err(Error::InvalidArgument(format!(
                "statement has {} parameters, {} supplied",
                self.params.len(),
                values.len()
            )));
        }
        for (i, v) in values.iter().enumerate() {
            self.bind(i, v.clone())?;
        }
        Ok(())
    }

    /// Bind a reader. At most `length` bytes are read when given; an empty
    /// reader binds an empty value, not NULL.
    pub fn bind_stream(
        &mut self,
        index: usize,
        reader: impl Read + Send + 'static,
        length: Option<u64>,
        kind: StreamKind,
    ) -> Result<()> {
        self.check_open()?;
        *self.slot(index)? = Some(Param::Stream(StreamParam {
            reader: Box::new(reader),
            length,
            kind,
        }));
        Ok(())
    }

    pub fn bind_binary_stream(
        &mut self,
        index: usize,
        reader: impl Read + Send + 'static,
        length: Option<u64>,
    ) -> Result<()> {
        self.bind_stream(index, reader, length, StreamKind::Binary)
    }

    pub fn bind_character_stream(
        &mut self,
        index: usize,
        reader: impl Read + Send + 'static,
        length: Option<u64>,
    ) -> Result<()> {
        self.bind_stream(index, reader, length, StreamKind::Character)
    }

    pub fn clear_parameters(&mut self) {
        for slot in &mut self.params {
            *slot = None;
        }
    }

    /// Every parameter as a value, reading stream parameters to the end.
    /// Streams are replaced by the value they produced.
    fn take_values(&mut self) -> Result<Vec<Value>> {
        for slot in &mut self.params {
            if let Some(Param::Stream(stream)) = slot {
                let value = stream.read_all()?;
                *slot = Some(Param::Value(value));
            }
        }
        self.params
            .iter()
            .enumerate()
            .map(|(i, slot)| match slot {
                Some(Param::Value(v)) => Ok(v.clone()),
                _ => Err(unset(i)),
            })
            .collect()
    }

    /// Queue the current parameters as one batch row.
    pub fn add_batch(&mut self) -> Result<()> {
        self.check_open()?;
        let row = self.take_values()?;
        self.batch.push(row);
        Ok(())
    }

    pub fn clear_batch(&mut self) {
        self.batch.clear();
    }

    pub fn batch_len(&self) -> usize {
        self.batch.len()
    }

    // ==================== Execution ====================

    fn run<T>(&mut self, op: impl FnOnce(&mut Self) -> Result<T>) -> Result<T> {
        self.check_open()?;
        self.state = StatementState::Executing;
        let result = op(self).and_then(|value| {
            // the handle may have been closed while the exchange ran
            self.context.ensure_valid()?;
            Ok(value)
        });
        match result {
            Ok(value) => {
                self.state = StatementState::Executed;
                Ok(value)
            }
            Err(e) => {
                tracing::debug!(error = %e, sql = self.parsed.sql(), "statement failed");
                self.state = StatementState::Failed;
                if e.is_fatal() {
                    self.context.connection_failed(&e);
                }
                Err(e)
            }
        }
    }

    fn record(&mut self, result: &QueryResult) {
        self.affected_rows = result.affected_rows;
        self.last_insert_id = result.last_insert_id;
        self.warnings = result.warnings;
    }

    fn buffered(&self, result: QueryResult) -> ResultSet {
        ResultSet::buffered(
            result.columns,
            result.rows,
            Arc::clone(&self.context),
            self.options.emulate_locators,
        )
    }

    fn streamed(&mut self, conn: &SharedConnection, start: StreamStart) -> ResultSet {
        match start {
            StreamStart::Rows(token, columns) => {
                ResultSet::streaming(columns, conn.clone(), token, Arc::clone(&self.context))
            }
            StreamStart::Done(result) => {
                self.record(&result);
                self.buffered(result)
            }
        }
    }

    /// Execute and return the rows.
    pub fn execute_query(&mut self) -> Result<ResultSet> {
        self.run(|stmt| {
            let conn = stmt.context.active_connection()?;
            if stmt.options.server_side {
                stmt.query_server(&conn)
            } else {
                stmt.query_client(&conn)
            }
        })
    }

    /// Execute and return the affected row count.
    pub fn execute_update(&mut self) -> Result<u64> {
        self.run(|stmt| {
            let conn = stmt.context.source_connection()?;
            let result = if stmt.options.server_side {
                stmt.release_foreign(&conn);
                let mut physical = conn.lock();
                let server = stmt.server_statement(&conn, &mut physical)?;
                let values = stmt.bind_server(&mut physical, &server)?;
                physical.execute_statement_buffered(&server, &execute_params(&values))?
            } else {
                let values = stmt.take_values()?;
                let mut physical = conn.lock();
                let sql = stmt
                    .parsed
                    .interpolate(&values, physical.no_backslash_escapes())?;
                physical.query(&sql)?
            };
            stmt.record(&result);
            Ok(result.affected_rows)
        })
    }

    fn query_client(&mut self, conn: &SharedConnection) -> Result<ResultSet> {
        let values = self.take_values()?;
        let mut physical = conn.lock();
        let sql = self
            .parsed
            .interpolate(&values, physical.no_backslash_escapes())?;
        if self.options.streaming {
            let start = physical.start_stream(&sql)?;
            drop(physical);
            Ok(self.streamed(conn, start))
        } else {
            let result = physical.query(&sql)?;
            drop(physical);
            self.record(&result);
            Ok(self.buffered(result))
        }
    }

    fn query_server(&mut self, conn: &SharedConnection) -> Result<ResultSet> {
        self.release_foreign(conn);
        let mut physical = conn.lock();
        let server = self.server_statement(conn, &mut physical)?;
        let values = self.bind_server(&mut physical, &server)?;
        let params = execute_params(&values);

        if self.options.cursor_fetch() && !server.columns.is_empty() {
            let start = physical.execute_statement_cursor(&server, &params)?;
            drop(physical);
            return Ok(match start {
                CursorStart::Open(columns) => ResultSet::cursor(
                    columns,
                    conn.clone(),
                    server.id,
                    self.options.fetch_size,
                    Arc::clone(&self.context),
                ),
                CursorStart::Done(result) => {
                    self.record(&result);
                    self.buffered(result)
                }
            });
        }
        if self.options.streaming {
            let start = physical.execute_statement_streaming(&server, &params)?;
            drop(physical);
            return Ok(self.streamed(conn, start));
        }
        let result = physical.execute_statement_buffered(&server, &params)?;
        drop(physical);
        self.record(&result);
        Ok(self.buffered(result))
    }

    // ==================== Server statements ====================

    /// Close a server statement left on a connection other than `conn`.
    fn release_foreign(&mut self, conn: &SharedConnection) {
        let Some((weak, server)) = &self.prepared else {
            return;
        };
        match weak.upgrade() {
            Some(previous) if previous.ptr_eq(conn) => {}
            Some(previous) => {
                tracing::debug!(statement_id = server.id, "re-preparing on a different connection");
                if let Err(e) = previous.lock().close_statement(server.id) {
                    tracing::warn!(error = %e, "failed to close statement on previous connection");
                }
                self.prepared = None;
            }
            None => self.prepared = None,
        }
    }

    /// The server statement for this SQL on `conn`, preparing it if needed.
    fn server_statement(
        &mut self,
        conn: &SharedConnection,
        physical: &mut PhysicalConnection,
    ) -> Result<ServerStatement> {
        if let Some((weak, server)) = &self.prepared {
            let same = weak.upgrade().is_some_and(|c| c.ptr_eq(conn));
            if same && physical.has_statement(server.id) {
                return Ok(server.clone());
            }
        }
        let server = physical.prepare(self.parsed.sql())?;
        if server.params.len() != self.params.len() {
            tracing::debug!(
                server = server.params.len(),
                local = self.params.len(),
                "server and local placeholder counts differ"
            );
            self.params.resize_with(server.params.len(), || None);
        }
        self.prepared = Some((conn.downgrade(), server.clone()));
        if self.state == StatementState::Created {
            self.state = StatementState::Prepared;
        }
        Ok(server)
    }

    /// Resolve parameters for COM_STMT_EXECUTE. Binary streams larger than
    /// one chunk go out with COM_STMT_SEND_LONG_DATA and come back as
    /// `None`; everything else is bound inline.
    fn bind_server(
        &mut self,
        physical: &mut PhysicalConnection,
        server: &ServerStatement,
    ) -> Result<Vec<Option<Value>>> {
        let chunk = self.options.chunk_size;
        let mut values = Vec::with_capacity(self.params.len());
        for (i, slot) in self.params.iter_mut().enumerate() {
            let resolved = match slot.as_mut() {
                None => return Err(unset(i)),
                Some(Param::Value(v)) => {
                    values.push(Some(v.clone()));
                    continue;
                }
                Some(Param::Stream(stream)) if stream.kind == StreamKind::Character => {
                    Some(stream.read_all()?)
                }
                Some(Param::Stream(stream)) => {
                    let mut limited = stream.limited();
                    let mut head = Vec::with_capacity(chunk.min(64 * 1024));
                    (&mut limited)
                        .take(chunk as u64)
                        .read_to_end(&mut head)
                        .map_err(|e| {
                            Error::InvalidArgument(format!("failed to read stream parameter: {e}"))
                        })?;
                    if head.len() < chunk {
                        Some(Value::Bytes(head))
                    } else {
                        let param = u16::try_from(i).map_err(|_| {
                            Error::InvalidArgument(format!("parameter index {i} too large"))
                        })?;
                        let mut source = Cursor::new(head).chain(limited);
                        let sent = physical.send_long_data(server.id, param, &mut source, chunk)?;
                        tracing::debug!(statement_id = server.id, param, bytes = sent, "stream sent as long data");
                        None
                    }
                }
            };
            match resolved {
                Some(value) => {
                    values.push(Some(value.clone()));
                    *slot = Some(Param::Value(value));
                }
                None => {
                    // the reader is spent; the slot must be bound again
                    values.push(None);
                    *slot = None;
                }
            }
        }
        Ok(values)
    }

    // ==================== Batches ====================

    /// Execute every queued batch row. The queue is emptied even when the
    /// batch fails.
    pub fn execute_batch(&mut self) -> Result<Vec<UpdateCount>> {
        let rows = std::mem::take(&mut self.batch);
        if rows.is_empty() {
            self.check_open()?;
            return Ok(Vec::new());
        }
        self.run(|stmt| {
            let conn = stmt.context.source_connection()?;
            let insert = if stmt.options.rewrite_batches {
                stmt.parsed.insert_values()
            } else {
                None
            };
            let counts = match (stmt.options.server_side, insert) {
                (false, Some(insert)) => stmt.batch_client_insert(&conn, &insert, &rows)?,
                (false, None) if stmt.options.rewrite_batches => {
                    stmt.batch_client_multi(&conn, &rows)?
                }
                (false, None) => stmt.batch_client_each(&conn, &rows)?,
                (true, Some(insert)) => stmt.batch_server_insert(&conn, &insert, &rows)?,
                (true, None) => stmt.batch_server_each(&conn, &rows)?,
            };
            tracing::debug!(rows = rows.len(), affected = stmt.affected_rows, "batch executed");
            Ok(counts)
        })
    }

    fn batch_client_insert(
        &mut self,
        conn: &SharedConnection,
        insert: &InsertValues,
        rows: &[Vec<Value>],
    ) -> Result<Vec<UpdateCount>> {
        let mut physical = conn.lock();
        let nbe = physical.no_backslash_escapes();
        let rendered = rows
            .iter()
            .map(|row| insert.render_row(row, nbe))
            .collect::<Result<Vec<_>>>()?;
        let limit = physical.max_allowed_packet();
        self.affected_rows = 0;
        let mut first_id = None;
        for range in pack(rendered.iter().map(String::len), insert.overhead() + 1, 1, limit) {
            let sql = insert.assemble(rendered[range].iter().map(String::as_str));
            let result = physical.query(&sql)?;
            self.affected_rows += result.affected_rows;
            first_id.get_or_insert(result.last_insert_id);
            self.warnings = result.warnings;
        }
        self.last_insert_id = first_id.unwrap_or_default();
        Ok(vec![UpdateCount::SuccessNoInfo; rows.len()])
    }

    fn batch_client_multi(
        &mut self,
        conn: &SharedConnection,
        rows: &[Vec<Value>],
    ) -> Result<Vec<UpdateCount>> {
        let mut physical = conn.lock();
        let nbe = physical.no_backslash_escapes();
        let rendered = rows
            .iter()
            .map(|row| self.parsed.interpolate(row, nbe))
            .collect::<Result<Vec<_>>>()?;
        let limit = physical.max_allowed_packet();
        let mut counts = Vec::with_capacity(rows.len());
        self.affected_rows = 0;
        for range in pack(rendered.iter().map(String::len), 1, 1, limit) {
            let sql = rendered[range].join(";");
            for result in physical.query_multi(&sql)? {
                self.affected_rows += result.affected_rows;
                self.record_batch_row(&result);
                counts.push(UpdateCount::Count(result.affected_rows));
            }
        }
        Ok(counts)
    }

    fn batch_client_each(
        &mut self,
        conn: &SharedConnection,
        rows: &[Vec<Value>],
    ) -> Result<Vec<UpdateCount>> {
        let mut physical = conn.lock();
        let nbe = physical.no_backslash_escapes();
        let mut counts = Vec::with_capacity(rows.len());
        self.affected_rows = 0;
        for row in rows {
            let sql = self.parsed.interpolate(row, nbe)?;
            let result = physical.query(&sql)?;
            self.affected_rows += result.affected_rows;
            self.record_batch_row(&result);
            counts.push(UpdateCount::Count(result.affected_rows));
        }
        Ok(counts)
    }

    fn batch_server_each(
        &mut self,
        conn: &SharedConnection,
        rows: &[Vec<Value>],
    ) -> Result<Vec<UpdateCount>> {
        self.release_foreign(conn);
        let mut physical = conn.lock();
        let server = self.server_statement(conn, &mut physical)?;
        let mut counts = Vec::with_capacity(rows.len());
        self.affected_rows = 0;
        for row in rows {
            let params: Vec<ExecuteParam<'_>> = row.iter().map(ExecuteParam::Value).collect();
            let result = physical.execute_statement_buffered(&server, &params)?;
            self.affected_rows += result.affected_rows;
            self.record_batch_row(&result);
            counts.push(UpdateCount::Count(result.affected_rows));
        }
        Ok(counts)
    }

    /// Prepare a multi-row insert per chunk of rows and execute it with
    /// the flattened parameters.
    fn batch_server_insert(
        &mut self,
        conn: &SharedConnection,
        insert: &InsertValues,
        rows: &[Vec<Value>],
    ) -> Result<Vec<UpdateCount>> {
        let mut physical = conn.lock();
        let nbe = physical.no_backslash_escapes();
        // literal sizes bound the binary encoding from above
        let sizes = rows
            .iter()
            .map(|row| insert.render_row(row, nbe).map(|r| r.len()))
            .collect::<Result<Vec<_>>>()?;
        let limit = physical.max_allowed_packet();
        let per_row = insert.row_params().max(1);
        self.affected_rows = 0;
        let mut first_id = None;
        for range in pack(sizes.into_iter(), insert.overhead() + 1, 1, limit) {
            for chunk in rows[range].chunks(MAX_SERVER_PARAMS / per_row) {
                let sql = insert.assemble(std::iter::repeat(insert.row()).take(chunk.len()));
                let server = physical.prepare(&sql)?;
                let params: Vec<ExecuteParam<'_>> =
                    chunk.iter().flatten().map(ExecuteParam::Value).collect();
                let executed = physical.execute_statement_buffered(&server, &params);
                let closed = physical.close_statement(server.id);
                let result = executed?;
                closed?;
                self.affected_rows += result.affected_rows;
                first_id.get_or_insert(result.last_insert_id);
                self.warnings = result.warnings;
            }
        }
        self.last_insert_id = first_id.unwrap_or_default();
        Ok(vec![UpdateCount::SuccessNoInfo; rows.len()])
    }

    fn record_batch_row(&mut self, result: &QueryResult) {
        if result.last_insert_id != 0 {
            self.last_insert_id = result.last_insert_id;
        }
        self.warnings = result.warnings;
    }

    // ==================== Close ====================

    /// Close the statement and its server-side handle. Closing twice is a
    /// no-op.
    pub fn close(&mut self) -> Result<()> {
        if self.state == StatementState::Closed {
            return Ok(());
        }
        self.state = StatementState::Closed;
        self.params.clear();
        self.batch.clear();
        let result = match self.prepared.take().and_then(|(weak, s)| weak.upgrade().map(|c| (c, s))) {
            Some((conn, server)) => conn.lock().close_statement(server.id),
            None => Ok(()),
        };
        self.context.statement_closed();
        report(self.context.as_ref(), result)
    }
}

impl Drop for Statement {
    fn drop(&mut self) {
        if let Err(e) = self.close() {
            tracing::warn!(error = %e, "failed to close statement");
        }
    }
}

fn execute_params(values: &[Option<Value>]) -> Vec<ExecuteParam<'_>> {
    values
        .iter()
        .map(|v| match v {
            Some(v) => ExecuteParam::Value(v),
            None => ExecuteParam::LongData(LongData {
                field_type: FieldType::Blob,
            }),
        })
        .collect()
}

/// Group consecutive items so each group's `overhead` plus item sizes
/// plus separators stays within `limit`. An item too large on its own
/// still gets a group; sending it reports the size error.
fn pack(
    sizes: impl Iterator<Item = usize>,
    overhead: usize,
    separator: usize,
    limit: usize,
) -> Vec<std::ops::Range<usize>> {
    let mut groups = Vec::new();
    let mut start = 0;
    let mut total = overhead;
    let mut len = 0;
    for (i, size) in sizes.enumerate() {
        len = i + 1;
        if i == start {
            total += size;
        } else if total + separator + size > limit {
            groups.push(start..i);
            start = i;
            total = overhead + size;
        } else {
            total += separator + size;
        }
    }
    if len > start {
        groups.push(start..len);
    }
    groups
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_pack_respects_limit() {
        let groups = pack([10, 10, 10, 10].into_iter(), 5, 1, 27);
        assert_eq!(groups, vec![0..2, 2..4]);
    }

    #[test]
    fn test_pack_oversized_item_gets_own_group() {
        let groups = pack([3, 100, 3].into_iter(), 0, 1, 10);
        assert_eq!(groups, vec![0..1, 1..2, 2..3]);
    }

    #[test]
    fn test_pack_single_group() {
        assert_eq!(pack([1, 2, 3].into_iter(), 0, 0, 100), vec![0..3]);
        assert!(pack(std::iter::empty(), 0, 0, 100).is_empty());
    }

    #[test]
    fn test_stream_kinds() {
        assert_eq!(StreamKind::Binary.value(vec![]).unwrap(), Value::Bytes(vec![]));
        assert_eq!(
            StreamKind::Character.value(b"abc".to_vec()).unwrap(),
            Value::Text("abc".to_string())
        );
        assert!(StreamKind::Character.value(vec![0xFF]).is_err());
    }

    #[test]
    fn test_stream_length_limits_read() {
        let mut stream = StreamParam {
            reader: Box::new(Cursor::new(b"abcdef".to_vec())),
            length: Some(3),
            kind: StreamKind::Binary,
        };
        assert_eq!(stream.read_all().unwrap(), Value::Bytes(b"abc".to_vec()));
    }

    #[test]
    fn test_options_from_config() {
        let config = MySqlConfig::new()
            .use_server_prepared_statements(true)
            .use_cursor_fetch(true, 5);
        let options = StatementOptions::from_config(&config);
        assert!(options.server_side);
        assert!(options.cursor_fetch());
        assert_eq!(options.fetch_size, 5);

        let config = MySqlConfig::new().use_cursor_fetch(true, 5);
        assert!(!StatementOptions::from_config(&config).cursor_fetch());
    }
}
