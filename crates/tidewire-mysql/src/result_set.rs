//! Result sets.
//!
//! A [`ResultSet`] reads rows from one of three sources:
//!
//! - **buffered**: every row was read when the statement executed; the
//!   result is scrollable and may be updatable
//! - **streaming**: rows stay on the wire and are read one at a time; the
//!   physical connection belongs to the result set until it is exhausted
//!   or closed, and other commands fail with [`Error::StreamingConflict`]
//! - **cursor**: rows come from a server-side cursor in batches of the
//!   fetch size; the connection stays free between batches
//!
//! Accessors take a column index (0-based) or a label (case-insensitive).

use std::collections::VecDeque;
use std::sync::Arc;

use chrono::{NaiveDate, NaiveDateTime, NaiveTime};
use rust_decimal::prelude::ToPrimitive;
use tidewire_core::error::{QueryError, TypeError};
use tidewire_core::{ColumnInfo, Decimal, Error, FromValue, QueryErrorKind, Result, Row, Value};

use crate::connection::{SharedConnection, StreamToken};
use crate::lob::{Blob, Clob, LocatorKey, LocatorScope, RowKey, quote_identifier};
use crate::routing::{ConnectionContext, report};
use crate::types::{ColumnDef, format_value_for_sql};

/// Column reference accepted by result set accessors.
pub trait ColumnIndex {
    fn resolve(&self, columns: &ColumnInfo) -> Result<usize>;
}

impl ColumnIndex for usize {
    fn resolve(&self, columns: &ColumnInfo) -> Result<usize> {
        if *self < columns.len() {
            Ok(*self)
        } else {
            Err(Error::InvalidArgument(format!(
                "column index {} out of range ({} columns)",
                self,
                columns.len()
            )))
        }
    }
}

impl ColumnIndex for &str {
    fn resolve(&self, columns: &ColumnInfo) -> Result<usize> {
        columns
            .index_of(self)
            .ok_or_else(|| Error::InvalidArgument(format!("no column labelled '{self}'")))
    }
}

impl ColumnIndex for String {
    fn resolve(&self, columns: &ColumnInfo) -> Result<usize> {
        self.as_str().resolve(columns)
    }
}

enum Source {
    Buffered {
        rows: Vec<Vec<Value>>,
        /// 0 = before first, `rows.len() + 1` = after last
        cursor: usize,
    },
    Streaming {
        conn: SharedConnection,
        token: StreamToken,
        current: Option<Vec<Value>>,
        read: usize,
        done: bool,
    },
    Cursor {
        conn: SharedConnection,
        statement_id: u32,
        fetch_size: u32,
        pending: VecDeque<Vec<Value>>,
        current: Option<Vec<Value>>,
        read: usize,
        exhausted: bool,
    },
}

impl std::fmt::Debug for Source {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Source::Buffered { rows, cursor } => f
                .debug_struct("Buffered")
                .field("rows", &rows.len())
                .field("cursor", cursor)
                .finish(),
            Source::Streaming { read, done, .. } => f
                .debug_struct("Streaming")
                .field("read", read)
                .field("done", done)
                .finish(),
            Source::Cursor {
                statement_id,
                read,
                exhausted,
                ..
            } => f
                .debug_struct("Cursor")
                .field("statement_id", statement_id)
                .field("read", read)
                .field("exhausted", exhausted)
                .finish(),
        }
    }
}

/// Rows produced by a statement.
#[derive(Debug)]
pub struct ResultSet {
    columns: Arc<Vec<ColumnDef>>,
    labels: Arc<ColumnInfo>,
    source: Source,
    context: Arc<dyn ConnectionContext>,
    scope: LocatorScope,
    emulate_locators: bool,
    staged: Vec<Option<Value>>,
    was_null: bool,
    warnings: Vec<String>,
    preserve_warnings: bool,
    closed: bool,
}

impl ResultSet {
    fn with_source(
        columns: Arc<Vec<ColumnDef>>,
        source: Source,
        context: Arc<dyn ConnectionContext>,
        emulate_locators: bool,
    ) -> Self {
        let labels = Arc::new(ColumnInfo::new(
            columns.iter().map(|c| c.name.clone()).collect(),
        ));
        Self {
            staged: vec![None; columns.len()],
            scope: LocatorScope::new(&context),
            columns,
            labels,
            source,
            context,
            emulate_locators,
            was_null: false,
            warnings: Vec::new(),
            preserve_warnings: false,
            closed: false,
        }
    }

    /// Result set over rows already read.
    pub fn buffered(
        columns: Arc<Vec<ColumnDef>>,
        rows: Vec<Vec<Value>>,
        context: Arc<dyn ConnectionContext>,
        emulate_locators: bool,
    ) -> Self {
        Self::with_source(
            columns,
            Source::Buffered { rows, cursor: 0 },
            context,
            emulate_locators,
        )
    }

    /// Result set reading a stream that owns `conn`.
    pub fn streaming(
        columns: Arc<Vec<ColumnDef>>,
        conn: SharedConnection,
        token: StreamToken,
        context: Arc<dyn ConnectionContext>,
    ) -> Self {
        Self::with_source(
            columns,
            Source::Streaming {
                conn,
                token,
                current: None,
                read: 0,
                done: false,
            },
            context,
            false,
        )
    }

    /// Result set fetching from a server cursor.
    pub fn cursor(
        columns: Arc<Vec<ColumnDef>>,
        conn: SharedConnection,
        statement_id: u32,
        fetch_size: u32,
        context: Arc<dyn ConnectionContext>,
    ) -> Self {
        Self::with_source(
            columns,
            Source::Cursor {
                conn,
                statement_id,
                fetch_size: fetch_size.max(1),
                pending: VecDeque::new(),
                current: None,
                read: 0,
                exhausted: false,
            },
            context,
            false,
        )
    }

    /// Column definitions.
    pub fn columns(&self) -> &[ColumnDef] {
        &self.columns
    }

    pub fn column_count(&self) -> usize {
        self.columns.len()
    }

    /// Index of the column with `label` (case-insensitive).
    pub fn find_column(&self, label: &str) -> Result<usize> {
        label.resolve(&self.labels)
    }

    pub fn is_closed(&self) -> bool {
        self.closed
    }

    pub fn is_streaming(&self) -> bool {
        matches!(self.source, Source::Streaming { .. })
    }

    pub fn is_scrollable(&self) -> bool {
        matches!(self.source, Source::Buffered { .. })
    }

    fn check_open(&self) -> Result<()> {
        if self.closed {
            return Err(Error::InvalidArgument("result set is closed".to_string()));
        }
        self.context.ensure_valid()
    }

    fn forward_only(&self) -> Error {
        Error::InvalidArgument("result set is forward-only".to_string())
    }

    // ==================== Navigation ====================

    /// Advance to the next row. Returns `false` past the last row.
    pub fn next(&mut self) -> Result<bool> {
        self.check_open()?;
        self.clear_staged();
        let advanced = self.advance();
        report(self.context.as_ref(), advanced)
    }

    fn advance(&mut self) -> Result<bool> {
        match &mut self.source {
            Source::Buffered { rows, cursor } => {
                if *cursor <= rows.len() {
                    *cursor += 1;
                }
                Ok(*cursor <= rows.len())
            }
            Source::Streaming {
                conn,
                token,
                current,
                read,
                done,
            } => {
                if *done {
                    *current = None;
                    return Ok(false);
                }
                let row = conn.lock().next_stream_row(*token);
                match row {
                    Ok(Some(row)) => {
                        *current = Some(row);
                        *read += 1;
                        Ok(true)
                    }
                    Ok(None) => {
                        *current = None;
                        *done = true;
                        Ok(false)
                    }
                    Err(e) => {
                        *current = None;
                        *done = true;
                        Err(e)
                    }
                }
            }
            Source::Cursor {
                conn,
                statement_id,
                fetch_size,
                pending,
                current,
                read,
                exhausted,
            } => {
                if pending.is_empty() && !*exhausted {
                    let (rows, done) = conn.lock().fetch(*statement_id, *fetch_size, &self.columns)?;
                    tracing::trace!(statement_id = *statement_id, rows = rows.len(), done, "cursor fetch");
                    pending.extend(rows);
                    *exhausted = done;
                }
                *current = pending.pop_front();
                if current.is_some() {
                    *read += 1;
                }
                Ok(current.is_some())
            }
        }
    }

    fn buffered_mut(&mut self) -> Result<(&mut Vec<Vec<Value>>, &mut usize)> {
        match &mut self.source {
            Source::Buffered { rows, cursor } => Ok((rows, cursor)),
            _ => Err(Error::InvalidArgument("result set is forward-only".to_string())),
        }
    }

    fn scroll(&mut self, to: impl FnOnce(usize, usize) -> usize) -> Result<bool> {
        self.check_open()?;
        self.clear_staged();
        let (rows, cursor) = self.buffered_mut()?;
        let len = rows.len();
        *cursor = to(*cursor, len).min(len + 1);
        Ok(*cursor >= 1 && *cursor <= len)
    }

    /// Move to the previous row. Returns `false` before the first row.
    pub fn previous(&mut self) -> Result<bool> {
        self.scroll(|cursor, _| cursor.saturating_sub(1))
    }

    pub fn first(&mut self) -> Result<bool> {
        self.scroll(|_, len| usize::from(len > 0))
    }

    pub fn last(&mut self) -> Result<bool> {
        self.scroll(|_, len| len)
    }

    /// Move to row `row` (1-based); negative values count from the end.
    pub fn absolute(&mut self, row: i64) -> Result<bool> {
        self.scroll(|_, len| {
            let len = len as i64;
            let target = if row >= 0 { row } else { len + 1 + row };
            target.clamp(0, len + 1) as usize
        })
    }

    pub fn before_first(&mut self) -> Result<()> {
        self.scroll(|_, _| 0).map(|_| ())
    }

    pub fn after_last(&mut self) -> Result<()> {
        self.scroll(|_, len| len + 1).map(|_| ())
    }

    /// Current row number (1-based), 0 when not on a row.
    pub fn row_number(&self) -> usize {
        match &self.source {
            Source::Buffered { rows, cursor } => {
                if *cursor >= 1 && *cursor <= rows.len() {
                    *cursor
                } else {
                    0
                }
            }
            Source::Streaming { current, read, .. } | Source::Cursor { current, read, .. } => {
                if current.is_some() { *read } else { 0 }
            }
        }
    }

    /// Rows held in memory; `None` for streaming and cursor results.
    pub fn buffered_len(&self) -> Option<usize> {
        match &self.source {
            Source::Buffered { rows, .. } => Some(rows.len()),
            _ => None,
        }
    }

    fn current_row(&self) -> Result<&Vec<Value>> {
        let row = match &self.source {
            Source::Buffered { rows, cursor } => cursor.checked_sub(1).and_then(|i| rows.get(i)),
            Source::Streaming { current, .. } | Source::Cursor { current, .. } => current.as_ref(),
        };
        row.ok_or_else(|| Error::InvalidArgument("not positioned on a row".to_string()))
    }

    /// The current row as a [`Row`].
    pub fn row(&self) -> Result<Row> {
        self.check_open()?;
        Ok(Row::with_columns(
            Arc::clone(&self.labels),
            self.current_row()?.clone(),
        ))
    }

    // ==================== Warnings ====================

    /// Keep accumulating warnings instead of replacing them.
    pub fn preserve_warnings(&mut self, preserve: bool) {
        self.preserve_warnings = preserve;
    }

    pub fn warnings(&self) -> &[String] {
        &self.warnings
    }

    pub fn clear_warnings(&mut self) {
        self.warnings.clear();
    }

    fn warn(&mut self, message: String) {
        tracing::debug!(%message, "result set warning");
        if !self.preserve_warnings {
            self.warnings.clear();
        }
        self.warnings.push(message);
    }

    // ==================== Accessors ====================

    /// Did the last accessor read SQL NULL?
    pub fn was_null(&self) -> bool {
        self.was_null
    }

    fn read<C: ColumnIndex>(&mut self, col: C) -> Result<(usize, Value)> {
        self.check_open()?;
        let index = col.resolve(&self.labels)?;
        let value = match &self.staged[index] {
            Some(staged) => staged.clone(),
            None => self.current_row()?[index].clone(),
        };
        self.was_null = value.is_null();
        Ok((index, value))
    }

    /// Current value of a column, as decoded.
    pub fn get_value<C: ColumnIndex>(&mut self, col: C) -> Result<Value> {
        self.read(col).map(|(_, v)| v)
    }

    /// Strict typed access through [`FromValue`].
    pub fn get<T: FromValue, C: ColumnIndex>(&mut self, col: C) -> Result<T> {
        let (index, value) = self.read(col)?;
        T::from_value(&value).map_err(|e| self.with_column(e, index))
    }

    fn with_column(&self, err: Error, index: usize) -> Error {
        match err {
            Error::Type(mut t) if t.column.is_none() => {
                t.column = Some(self.columns[index].name.clone());
                Error::Type(t)
            }
            other => other,
        }
    }

    fn type_error(&self, index: usize, expected: &'static str, actual: String) -> Error {
        Error::Type(TypeError {
            expected,
            actual,
            column: Some(self.columns[index].name.clone()),
        })
    }

    /// Integer access; fractional values truncate toward zero with a warning.
    pub fn get_i64<C: ColumnIndex>(&mut self, col: C) -> Result<Option<i64>> {
        let (index, value) = self.read(col)?;
        let exact = match &value {
            Value::Null => return Ok(None),
            Value::Text(s) => match s.trim().parse::<i64>() {
                Ok(v) => return Ok(Some(v)),
                Err(_) => value.as_decimal(),
            },
            other => match other.as_i64() {
                Some(v) => return Ok(Some(v)),
                None => other.as_decimal(),
            },
        };
        let Some(decimal) = exact else {
            return Err(self.type_error(index, "i64", value.type_name().to_string()));
        };
        let truncated = decimal.trunc();
        let Some(v) = truncated.to_i64() else {
            return Err(self.type_error(index, "i64", format!("value {decimal} out of range")));
        };
        if truncated != decimal {
            let name = self.columns[index].name.clone();
            self.warn(format!("value {decimal} in column '{name}' truncated to {v}"));
        }
        Ok(Some(v))
    }

    pub fn get_i32<C: ColumnIndex>(&mut self, col: C) -> Result<Option<i32>> {
        let index = col.resolve(&self.labels)?;
        match self.get_i64(index)? {
            None => Ok(None),
            Some(v) => i32::try_from(v)
                .map(Some)
                .map_err(|_| self.type_error(index, "i32", format!("value {v} out of range"))),
        }
    }

    pub fn get_u64<C: ColumnIndex>(&mut self, col: C) -> Result<Option<u64>> {
        let (index, value) = self.read(col)?;
        match value {
            Value::Null => Ok(None),
            Value::UnsignedBigInt(v) => Ok(Some(v)),
            _ => {
                let v = self.get_i64(index)?.unwrap_or_default();
                u64::try_from(v)
                    .map(Some)
                    .map_err(|_| self.type_error(index, "u64", format!("value {v} out of range")))
            }
        }
    }

    pub fn get_bool<C: ColumnIndex>(&mut self, col: C) -> Result<Option<bool>> {
        let (index, value) = self.read(col)?;
        match &value {
            Value::Null => Ok(None),
            Value::Text(s) => match s.trim() {
                "1" | "true" | "TRUE" => Ok(Some(true)),
                "0" | "false" | "FALSE" => Ok(Some(false)),
                _ => Err(self.type_error(index, "bool", format!("text '{s}'"))),
            },
            other => other
                .as_bool()
                .map(Some)
                .ok_or_else(|| self.type_error(index, "bool", other.type_name().to_string())),
        }
    }

    pub fn get_f64<C: ColumnIndex>(&mut self, col: C) -> Result<Option<f64>> {
        let (index, value) = self.read(col)?;
        match &value {
            Value::Null => Ok(None),
            Value::Text(s) => s
                .trim()
                .parse()
                .map(Some)
                .map_err(|_| self.type_error(index, "f64", format!("text '{s}'"))),
            other => other
                .as_f64()
                .map(Some)
                .ok_or_else(|| self.type_error(index, "f64", other.type_name().to_string())),
        }
    }

    /// Exact decimal; floating point values convert through their
    /// shortest representation.
    pub fn get_decimal<C: ColumnIndex>(&mut self, col: C) -> Result<Option<Decimal>> {
        self.get::<Option<Decimal>, C>(col)
    }

    /// Text rendering of any value. Decimals keep their scale.
    pub fn get_string<C: ColumnIndex>(&mut self, col: C) -> Result<Option<String>> {
        let (index, value) = self.read(col)?;
        Ok(match value {
            Value::Null => None,
            Value::Text(s) => Some(s),
            Value::Bytes(b) => Some(self.columns[index].encoding.decode(&b)),
            Value::Bool(b) => Some(if b { "1" } else { "0" }.to_string()),
            Value::TinyInt(v) => Some(v.to_string()),
            Value::SmallInt(v) => Some(v.to_string()),
            Value::Int(v) => Some(v.to_string()),
            Value::BigInt(v) => Some(v.to_string()),
            Value::UnsignedBigInt(v) => Some(v.to_string()),
            Value::Float(v) => Some(v.to_string()),
            Value::Double(v) => Some(v.to_string()),
            Value::Decimal(d) => Some(d.to_string()),
            Value::Date(d) => Some(d.format("%Y-%m-%d").to_string()),
            Value::Time(t) => Some(t.format("%H:%M:%S%.f").to_string()),
            Value::Timestamp(ts) => Some(ts.format("%Y-%m-%d %H:%M:%S%.f").to_string()),
            Value::Json(j) => Some(j.to_string()),
        })
    }

    pub fn get_bytes<C: ColumnIndex>(&mut self, col: C) -> Result<Option<Vec<u8>>> {
        self.get::<Option<Vec<u8>>, C>(col)
    }

    pub fn get_date<C: ColumnIndex>(&mut self, col: C) -> Result<Option<NaiveDate>> {
        self.get::<Option<NaiveDate>, C>(col)
    }

    pub fn get_time<C: ColumnIndex>(&mut self, col: C) -> Result<Option<NaiveTime>> {
        self.get::<Option<NaiveTime>, C>(col)
    }

    pub fn get_timestamp<C: ColumnIndex>(&mut self, col: C) -> Result<Option<NaiveDateTime>> {
        self.get::<Option<NaiveDateTime>, C>(col)
    }

    // ==================== LOBs ====================

    /// Locator for `index` when locators are emulated and the row has a
    /// primary key that does not include the LOB column itself.
    fn locator_key(&self, index: usize) -> Option<LocatorKey> {
        if !self.emulate_locators || !self.columns[index].is_blob() {
            return None;
        }
        let (table, pk) = self.origin()?;
        if pk.is_empty() || pk.contains(&index) {
            return None;
        }
        let row = self.current_row().ok()?;
        let col = &self.columns[index];
        Some(LocatorKey::new(
            RowKey::new(&table.0, &table.1, self.key_values(&pk, row)),
            &col.org_name,
        ))
    }

    pub fn get_blob<C: ColumnIndex>(&mut self, col: C) -> Result<Option<Blob>> {
        let (index, value) = self.read(col)?;
        if value.is_null() {
            return Ok(None);
        }
        if self.staged[index].is_none() {
            if let Some(key) = self.locator_key(index) {
                return Ok(Some(Blob::locator(&self.scope, key)));
            }
        }
        match value {
            Value::Bytes(b) => Ok(Some(Blob::from(b))),
            Value::Text(s) => Ok(Some(Blob::from(s.into_bytes()))),
            other => Err(self.type_error(index, "BLOB", other.type_name().to_string())),
        }
    }

    pub fn get_clob<C: ColumnIndex>(&mut self, col: C) -> Result<Option<Clob>> {
        let (index, value) = self.read(col)?;
        if value.is_null() {
            return Ok(None);
        }
        if self.staged[index].is_none() {
            if let Some(key) = self.locator_key(index) {
                return Ok(Some(Clob::locator(&self.scope, key)));
            }
        }
        match value {
            Value::Text(s) => Ok(Some(Clob::from(s))),
            Value::Bytes(b) => Ok(Some(Clob::from(self.columns[index].encoding.decode(&b)))),
            other => Err(self.type_error(index, "CLOB", other.type_name().to_string())),
        }
    }

    // ==================== Updates ====================

    /// Origin `(schema, table)` shared by every column, plus the indexes
    /// of its primary-key columns.
    fn origin(&self) -> Option<((String, String), Vec<usize>)> {
        let first = self.columns.first()?;
        if !self
            .columns
            .iter()
            .all(|c| c.has_origin() && c.org_table == first.org_table && c.schema == first.schema)
        {
            return None;
        }
        let pk = self
            .columns
            .iter()
            .enumerate()
            .filter(|(_, c)| c.is_primary_key())
            .map(|(i, _)| i)
            .collect();
        Some(((first.schema.clone(), first.org_table.clone()), pk))
    }

    fn key_values(&self, indexes: &[usize], row: &[Value]) -> Vec<(String, Value)> {
        indexes
            .iter()
            .map(|&i| (self.columns[i].org_name.clone(), row[i].clone()))
            .collect()
    }

    /// Can rows be updated and deleted through this result set?
    pub fn is_updatable(&self) -> bool {
        self.is_scrollable() && self.origin().is_some()
    }

    /// Key of the current row: primary key columns, or every column when
    /// the table has no visible key.
    fn current_key(&self) -> Result<RowKey> {
        self.updatable_origin()?;
        self.key_for(self.current_row()?)
    }

    fn updatable_origin(&self) -> Result<((String, String), Vec<usize>)> {
        let Some(origin) = self.origin() else {
            return Err(Error::InvalidArgument(
                "result set is not updatable: columns do not come from one table".to_string(),
            ));
        };
        if !self.is_scrollable() {
            return Err(self.forward_only());
        }
        Ok(origin)
    }

    fn key_for(&self, row: &[Value]) -> Result<RowKey> {
        let ((schema, table), pk) = self.updatable_origin()?;
        let key_columns: Vec<usize> = if pk.is_empty() {
            (0..self.columns.len()).collect()
        } else {
            pk
        };
        Ok(RowKey::new(&schema, &table, self.key_values(&key_columns, row)))
    }

    /// Stage a new value for a column of the current row.
    pub fn update_value<C: ColumnIndex>(&mut self, col: C, value: impl Into<Value>) -> Result<()> {
        self.check_open()?;
        self.current_key()?;
        let index = col.resolve(&self.labels)?;
        self.staged[index] = Some(value.into());
        Ok(())
    }

    /// Discard staged values.
    pub fn cancel_row_updates(&mut self) {
        self.clear_staged();
    }

    fn clear_staged(&mut self) {
        for slot in &mut self.staged {
            *slot = None;
        }
    }

    fn not_found(sql: String) -> Error {
        Error::Query(QueryError {
            kind: QueryErrorKind::NotFound,
            sql: Some(sql),
            sqlstate: None,
            code: None,
            message: "row no longer exists in its table".to_string(),
            source: None,
        })
    }

    /// Write staged values back to the row's table and refresh the row.
    ///
    /// The row is read back by key after the update, so values the server
    /// computes (defaults, triggers, truncation) show up in the result set.
    pub fn update_row(&mut self) -> Result<()> {
        self.check_open()?;
        let written = self.write_row();
        report(self.context.as_ref(), written)
    }

    fn write_row(&mut self) -> Result<()> {
        let key = self.current_key()?;
        let changes: Vec<(usize, Value)> = self
            .staged
            .iter()
            .enumerate()
            .filter_map(|(i, v)| v.clone().map(|v| (i, v)))
            .collect();
        if changes.is_empty() {
            return Ok(());
        }
        let mut staged_row = self.current_row()?.clone();
        for (i, v) in &changes {
            staged_row[*i] = v.clone();
        }
        // the key may itself have been updated
        let new_key = self.key_for(&staged_row)?;

        let conn = self.context.source_connection()?;
        let refreshed = {
            let mut conn = conn.lock();
            let nbe = conn.no_backslash_escapes();
            let assignments: Vec<String> = changes
                .iter()
                .map(|(i, v)| {
                    format!(
                        "{} = {}",
                        quote_identifier(&self.columns[*i].org_name),
                        format_value_for_sql(v, nbe)
                    )
                })
                .collect();
            let sql = format!(
                "UPDATE {} SET {} {} LIMIT 1",
                key.table,
                assignments.join(", "),
                key.where_clause(nbe)
            );
            tracing::trace!(%sql, "updatable result set: update row");
            if conn.execute(&sql)? == 0 {
                return Err(Self::not_found(sql));
            }

            let select_list: Vec<String> = self
                .columns
                .iter()
                .map(|c| quote_identifier(&c.org_name))
                .collect();
            let sql = format!(
                "SELECT {} FROM {} {} LIMIT 1",
                select_list.join(", "),
                new_key.table,
                new_key.where_clause(nbe)
            );
            tracing::trace!(%sql, "updatable result set: refresh row");
            conn.query(&sql)?
                .rows
                .into_iter()
                .next()
                .filter(|row| row.len() == self.columns.len())
        };

        let row = refreshed.unwrap_or_else(|| {
            tracing::debug!("updated row not found by its new key; keeping staged values");
            staged_row
        });
        let (rows, cursor) = self.buffered_mut()?;
        if let Some(slot) = cursor.checked_sub(1).and_then(|i| rows.get_mut(i)) {
            *slot = row;
        }
        self.clear_staged();
        tracing::debug!("row updated");
        Ok(())
    }

    /// Delete the current row from its table and from this result set.
    ///
    /// The cursor moves back one row, so `next()` lands on the row that
    /// followed the deleted one.
    pub fn delete_row(&mut self) -> Result<()> {
        self.check_open()?;
        let removed = self.remove_row();
        report(self.context.as_ref(), removed)
    }

    fn remove_row(&mut self) -> Result<()> {
        let key = self.current_key()?;
        let conn = self.context.source_connection()?;
        {
            let mut conn = conn.lock();
            let sql = format!(
                "DELETE FROM {} {} LIMIT 1",
                key.table,
                key.where_clause(conn.no_backslash_escapes())
            );
            tracing::trace!(%sql, "updatable result set: delete row");
            if conn.execute(&sql)? == 0 {
                return Err(Self::not_found(sql));
            }
        }
        let (rows, cursor) = self.buffered_mut()?;
        if let Some(i) = cursor.checked_sub(1).filter(|i| *i < rows.len()) {
            rows.remove(i);
            *cursor -= 1;
        }
        self.clear_staged();
        Ok(())
    }

    // ==================== Close ====================

    /// Release the result set. Streaming results discard their remaining
    /// rows; LOB locators obtained from it become stale.
    pub fn close(&mut self) -> Result<()> {
        if self.closed {
            return Ok(());
        }
        self.closed = true;
        self.scope.invalidate();
        let closed = match &mut self.source {
            Source::Streaming {
                conn, token, done, ..
            } if !*done => {
                *done = true;
                conn.lock().close_stream(*token)
            }
            Source::Buffered { rows, .. } => {
                rows.clear();
                Ok(())
            }
            _ => Ok(()),
        };
        report(self.context.as_ref(), closed)
    }
}

impl Drop for ResultSet {
    fn drop(&mut self) {
        if let Err(e) = self.close() {
            tracing::warn!(error = %e, "failed to close result set");
        }
    }
}
