//! Large objects.
//!
//! [`Blob`] and [`Clob`] are either materialized (an in-memory copy of the
//! column value) or locator-backed. A locator remembers the origin table,
//! column and primary key of the row it came from and turns every read
//! and write into a small query against that row:
//!
//! | operation | SQL |
//! |---|---|
//! | length | `SELECT LENGTH(col)` / `SELECT CHAR_LENGTH(col)` |
//! | read | `SELECT SUBSTRING(col, pos, len)` |
//! | write | `UPDATE .. SET col = INSERT(col, pos, len, new)` |
//! | append | `UPDATE .. SET col = CONCAT(IFNULL(col, ''), new)` |
//! | truncate | `UPDATE .. SET col = LEFT(col, len)` |
//! | search | `SELECT LOCATE(pattern, col, start)` |
//!
//! Reads run on the context's active connection, writes on its source
//! connection. A locator holds only a weak reference to its context and
//! a validity flag shared with the result set it came from; once that
//! result set closes, every operation fails with [`Error::StaleLocator`].
//!
//! Offsets are 0-based (bytes for BLOBs, characters for CLOBs);
//! `position` takes and returns 1-based positions.

use std::io::{self, Read};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};

use tidewire_core::{BoundsError, Error, Result, Value};

use crate::routing::{ConnectionContext, report};
use crate::types::{escape_bytes, escape_string, format_value_for_sql};

/// Bytes (or characters) fetched per round trip by LOB streams.
pub const STREAM_CHUNK: usize = 64 * 1024;

/// Quote an identifier with backticks.
pub fn quote_identifier(name: &str) -> String {
    format!("`{}`", name.replace('`', "``"))
}

/// A table row identified by key column values.
#[derive(Debug, Clone, PartialEq)]
pub struct RowKey {
    /// Qualified, quoted table name
    pub table: String,
    /// Quoted key column names with their values
    pub key: Vec<(String, Value)>,
}

impl RowKey {
    pub fn new(schema: &str, table: &str, key: Vec<(String, Value)>) -> Self {
        let table = if schema.is_empty() {
            quote_identifier(table)
        } else {
            format!("{}.{}", quote_identifier(schema), quote_identifier(table))
        };
        Self {
            table,
            key: key
                .into_iter()
                .map(|(name, value)| (quote_identifier(&name), value))
                .collect(),
        }
    }

    /// `WHERE` clause selecting the row; NULL-safe.
    pub fn where_clause(&self, no_backslash_escapes: bool) -> String {
        let conditions: Vec<String> = self
            .key
            .iter()
            .map(|(name, value)| {
                format!("{name} <=> {}", format_value_for_sql(value, no_backslash_escapes))
            })
            .collect();
        format!("WHERE {}", conditions.join(" AND "))
    }
}

/// The row and column a locator points at.
#[derive(Debug, Clone, PartialEq)]
pub struct LocatorKey {
    pub row: RowKey,
    /// Quoted column name
    pub column: String,
}

impl LocatorKey {
    pub fn new(row: RowKey, column: &str) -> Self {
        Self {
            row,
            column: quote_identifier(column),
        }
    }
}

#[derive(Debug, Clone)]
struct Locator {
    context: Weak<dyn ConnectionContext>,
    valid: Arc<AtomicBool>,
    origin: LocatorKey,
    /// Character semantics (CLOB) rather than bytes (BLOB)
    characters: bool,
    cached_length: Option<u64>,
}

impl Locator {
    fn context(&self) -> Result<Arc<dyn ConnectionContext>> {
        if !self.valid.load(Ordering::Acquire) {
            return Err(Error::StaleLocator);
        }
        self.context.upgrade().ok_or(Error::StaleLocator)
    }

    /// Run a single-value query on the active connection.
    fn select(&self, expr: impl FnOnce(bool) -> String) -> Result<Value> {
        let context = self.context()?;
        let conn = context.active_connection()?;
        let result = {
            let mut conn = conn.lock();
            let nbe = conn.no_backslash_escapes();
            let sql = format!(
                "SELECT {} FROM {} {}",
                expr(nbe),
                self.origin.row.table,
                self.origin.row.where_clause(nbe)
            );
            conn.query(&sql)
        };
        Ok(report(context.as_ref(), result)?
            .rows
            .into_iter()
            .next()
            .and_then(|row| row.into_iter().next())
            .unwrap_or(Value::Null))
    }

    /// Run an `UPDATE ... SET col = <expr>` on the source connection.
    fn update(&self, expr: impl FnOnce(bool) -> String) -> Result<()> {
        let context = self.context()?;
        let conn = context.source_connection()?;
        let result = {
            let mut conn = conn.lock();
            let nbe = conn.no_backslash_escapes();
            let sql = format!(
                "UPDATE {} SET {} = {} {}",
                self.origin.row.table,
                self.origin.column,
                expr(nbe),
                self.origin.row.where_clause(nbe)
            );
            conn.execute(&sql)
        };
        report(context.as_ref(), result).map(drop)
    }

    fn length(&mut self) -> Result<u64> {
        if let Some(len) = self.cached_length {
            // still fail fast once the result set is gone
            self.context()?;
            return Ok(len);
        }
        let func = if self.characters { "CHAR_LENGTH" } else { "LENGTH" };
        let column = self.origin.column.clone();
        let len = self
            .select(|_| format!("{func}({column})"))?
            .as_u64()
            .unwrap_or(0);
        self.cached_length = Some(len);
        Ok(len)
    }

    fn substring(&self, offset: u64, len: usize) -> Result<Value> {
        let column = &self.origin.column;
        self.select(|_| format!("SUBSTRING({column}, {}, {len})", offset + 1))
    }

    /// Write `literal` (with `count` units) at `offset`.
    fn write(&mut self, offset: u64, literal: impl FnOnce(bool) -> String, count: u64) -> Result<()> {
        let len = self.length()?;
        if offset > len {
            return Err(out_of_range(offset, count, len));
        }
        let column = self.origin.column.clone();
        if offset == len {
            self.update(|nbe| format!("CONCAT(IFNULL({column}, ''), {})", literal(nbe)))?;
        } else {
            self.update(|nbe| {
                format!("INSERT({column}, {}, {count}, {})", offset + 1, literal(nbe))
            })?;
        }
        self.cached_length = Some(len.max(offset + count));
        Ok(())
    }

    fn truncate(&mut self, len: u64) -> Result<()> {
        let current = self.length()?;
        if len >= current {
            return Ok(());
        }
        let column = self.origin.column.clone();
        self.update(|_| format!("LEFT({column}, {len})"))?;
        self.cached_length = Some(len);
        Ok(())
    }

    fn locate(&self, pattern: impl FnOnce(bool) -> String, start: u64) -> Result<Option<u64>> {
        let column = &self.origin.column;
        let found = self
            .select(|nbe| format!("LOCATE({}, {column}, {start})", pattern(nbe)))?
            .as_u64()
            .unwrap_or(0);
        Ok((found > 0).then_some(found))
    }
}

fn out_of_range(offset: u64, len: u64, available: u64) -> Error {
    Error::IndexBounds(BoundsError {
        offset: usize::try_from(offset).unwrap_or(usize::MAX),
        len: usize::try_from(len).unwrap_or(usize::MAX),
        available: usize::try_from(available).unwrap_or(usize::MAX),
    })
}

fn check_start(start: u64) -> Result<()> {
    if start < 1 {
        return Err(Error::InvalidArgument(format!(
            "search start must be at least 1, got {start}"
        )));
    }
    Ok(())
}

/// Shared handle to the validity flag of a result set's locators.
#[derive(Debug, Clone)]
pub struct LocatorScope {
    context: Weak<dyn ConnectionContext>,
    valid: Arc<AtomicBool>,
}

impl LocatorScope {
    pub fn new(context: &Arc<dyn ConnectionContext>) -> Self {
        Self {
            context: Arc::downgrade(context),
            valid: Arc::new(AtomicBool::new(true)),
        }
    }

    /// Invalidate every locator created from this scope.
    pub fn invalidate(&self) {
        self.valid.store(false, Ordering::Release);
    }

    pub fn is_valid(&self) -> bool {
        self.valid.load(Ordering::Acquire)
    }

    fn locator(&self, origin: LocatorKey, characters: bool) -> Locator {
        Locator {
            context: self.context.clone(),
            valid: Arc::clone(&self.valid),
            origin,
            characters,
            cached_length: None,
        }
    }
}

#[derive(Debug, Clone)]
enum BlobStorage {
    Materialized(Vec<u8>),
    Locator(Locator),
}

/// A binary large object.
#[derive(Debug, Clone)]
pub struct Blob {
    storage: BlobStorage,
}

impl From<Vec<u8>> for Blob {
    fn from(bytes: Vec<u8>) -> Self {
        Self {
            storage: BlobStorage::Materialized(bytes),
        }
    }
}

impl Blob {
    /// Locator-backed BLOB for `origin`.
    pub fn locator(scope: &LocatorScope, origin: LocatorKey) -> Self {
        Self {
            storage: BlobStorage::Locator(scope.locator(origin, false)),
        }
    }

    pub fn is_locator(&self) -> bool {
        matches!(self.storage, BlobStorage::Locator(_))
    }

    /// Length in bytes.
    pub fn length(&mut self) -> Result<u64> {
        match &mut self.storage {
            BlobStorage::Materialized(data) => Ok(data.len() as u64),
            BlobStorage::Locator(loc) => loc.length(),
        }
    }

    /// Up to `len` bytes starting at `offset`.
    pub fn get_bytes(&mut self, offset: u64, len: usize) -> Result<Vec<u8>> {
        let total = self.length()?;
        if offset > total {
            return Err(out_of_range(offset, len as u64, total));
        }
        match &self.storage {
            BlobStorage::Materialized(data) => {
                let start = offset as usize;
                let end = start.saturating_add(len).min(data.len());
                Ok(data[start..end].to_vec())
            }
            BlobStorage::Locator(loc) => {
                if len == 0 || offset == total {
                    return Ok(Vec::new());
                }
                Ok(match loc.substring(offset, len)? {
                    Value::Bytes(b) => b,
                    Value::Text(s) => s.into_bytes(),
                    _ => Vec::new(),
                })
            }
        }
    }

    /// Whole content.
    pub fn to_vec(&mut self) -> Result<Vec<u8>> {
        let len = self.length()?;
        self.get_bytes(0, usize::try_from(len).unwrap_or(usize::MAX))
    }

    /// Write `bytes` at `offset`, overwriting and extending as needed.
    ///
    /// `offset` may equal the current length (append) but not exceed it.
    pub fn set_bytes(&mut self, offset: u64, bytes: &[u8]) -> Result<usize> {
        match &mut self.storage {
            BlobStorage::Materialized(data) => {
                if offset > data.len() as u64 {
                    return Err(out_of_range(offset, bytes.len() as u64, data.len() as u64));
                }
                let start = offset as usize;
                let overlap = (data.len() - start).min(bytes.len());
                data[start..start + overlap].copy_from_slice(&bytes[..overlap]);
                data.extend_from_slice(&bytes[overlap..]);
            }
            BlobStorage::Locator(loc) => {
                if bytes.is_empty() {
                    return Ok(0);
                }
                loc.write(offset, |_| escape_bytes(bytes), bytes.len() as u64)?;
            }
        }
        Ok(bytes.len())
    }

    /// Write `len` bytes of `bytes` starting at `src_offset`.
    pub fn set_bytes_range(
        &mut self,
        offset: u64,
        bytes: &[u8],
        src_offset: usize,
        len: usize,
    ) -> Result<usize> {
        BoundsError::check(src_offset, len, bytes.len())?;
        self.set_bytes(offset, &bytes[src_offset..src_offset + len])
    }

    /// Shorten to `len` bytes; longer lengths leave the value unchanged.
    pub fn truncate(&mut self, len: u64) -> Result<()> {
        match &mut self.storage {
            BlobStorage::Materialized(data) => {
                data.truncate(usize::try_from(len).unwrap_or(usize::MAX));
                Ok(())
            }
            BlobStorage::Locator(loc) => loc.truncate(len),
        }
    }

    /// 1-based position of `pattern` at or after `start`.
    pub fn position(&mut self, pattern: &[u8], start: u64) -> Result<Option<u64>> {
        check_start(start)?;
        let total = self.length()?;
        if start > total {
            return Ok(None);
        }
        match &self.storage {
            BlobStorage::Materialized(data) => {
                let from = (start - 1) as usize;
                if pattern.is_empty() {
                    return Ok(Some(start));
                }
                Ok(data[from..]
                    .windows(pattern.len())
                    .position(|w| w == pattern)
                    .map(|i| (from + i) as u64 + 1))
            }
            BlobStorage::Locator(loc) => loc.locate(|_| escape_bytes(pattern), start),
        }
    }

    /// Chunked reader over the content.
    pub fn binary_stream(&mut self) -> Result<LobStream> {
        let len = self.length()?;
        Ok(match &self.storage {
            BlobStorage::Materialized(data) => LobStream::memory(data.clone()),
            BlobStorage::Locator(loc) => LobStream::locator(loc.clone(), len),
        })
    }
}

#[derive(Debug, Clone)]
enum ClobStorage {
    Materialized(String),
    Locator(Locator),
}

/// A character large object.
#[derive(Debug, Clone)]
pub struct Clob {
    storage: ClobStorage,
}

impl From<String> for Clob {
    fn from(text: String) -> Self {
        Self {
            storage: ClobStorage::Materialized(text),
        }
    }
}

fn byte_index(s: &str, chars: u64) -> usize {
    usize::try_from(chars)
        .ok()
        .and_then(|n| s.char_indices().nth(n))
        .map_or(s.len(), |(i, _)| i)
}

impl Clob {
    /// Locator-backed CLOB for `origin`.
    pub fn locator(scope: &LocatorScope, origin: LocatorKey) -> Self {
        Self {
            storage: ClobStorage::Locator(scope.locator(origin, true)),
        }
    }

    pub fn is_locator(&self) -> bool {
        matches!(self.storage, ClobStorage::Locator(_))
    }

    /// Length in characters.
    pub fn length(&mut self) -> Result<u64> {
        match &mut self.storage {
            ClobStorage::Materialized(text) => Ok(text.chars().count() as u64),
            ClobStorage::Locator(loc) => loc.length(),
        }
    }

    /// Up to `len` characters starting at `offset`.
    pub fn substring(&mut self, offset: u64, len: usize) -> Result<String> {
        let total = self.length()?;
        if offset > total {
            return Err(out_of_range(offset, len as u64, total));
        }
        match &self.storage {
            ClobStorage::Materialized(text) => {
                let start = byte_index(text, offset);
                let end = start + byte_index(&text[start..], len as u64);
                Ok(text[start..end].to_string())
            }
            ClobStorage::Locator(loc) => {
                if len == 0 || offset == total {
                    return Ok(String::new());
                }
                Ok(match loc.substring(offset, len)? {
                    Value::Text(s) => s,
                    Value::Bytes(b) => String::from_utf8_lossy(&b).into_owned(),
                    _ => String::new(),
                })
            }
        }
    }

    /// Whole content.
    pub fn to_string_value(&mut self) -> Result<String> {
        let len = self.length()?;
        self.substring(0, usize::try_from(len).unwrap_or(usize::MAX))
    }

    /// Write `text` at character `offset`, overwriting and extending.
    pub fn set_string(&mut self, offset: u64, text: &str) -> Result<usize> {
        let count = text.chars().count();
        match &mut self.storage {
            ClobStorage::Materialized(current) => {
                let total = current.chars().count() as u64;
                if offset > total {
                    return Err(out_of_range(offset, count as u64, total));
                }
                let start = byte_index(current, offset);
                let end = start + byte_index(&current[start..], count as u64);
                current.replace_range(start..end, text);
            }
            ClobStorage::Locator(loc) => {
                if text.is_empty() {
                    return Ok(0);
                }
                loc.write(offset, |nbe| escape_string(text, nbe), count as u64)?;
            }
        }
        Ok(count)
    }

    /// Write `len` characters of `text` starting at character `src_offset`.
    pub fn set_string_range(
        &mut self,
        offset: u64,
        text: &str,
        src_offset: usize,
        len: usize,
    ) -> Result<usize> {
        BoundsError::check(src_offset, len, text.chars().count())?;
        let start = byte_index(text, src_offset as u64);
        let end = start + byte_index(&text[start..], len as u64);
        self.set_string(offset, &text[start..end])
    }

    /// Shorten to `len` characters.
    pub fn truncate(&mut self, len: u64) -> Result<()> {
        match &mut self.storage {
            ClobStorage::Materialized(text) => {
                let end = byte_index(text, len);
                text.truncate(end);
                Ok(())
            }
            ClobStorage::Locator(loc) => loc.truncate(len),
        }
    }

    /// 1-based character position of `pattern` at or after `start`.
    pub fn position(&mut self, pattern: &str, start: u64) -> Result<Option<u64>> {
        check_start(start)?;
        let total = self.length()?;
        if start > total {
            return Ok(None);
        }
        match &self.storage {
            ClobStorage::Materialized(text) => {
                let from = byte_index(text, start - 1);
                Ok(text[from..]
                    .find(pattern)
                    .map(|i| text[..from + i].chars().count() as u64 + 1))
            }
            ClobStorage::Locator(loc) => loc.locate(|nbe| escape_string(pattern, nbe), start),
        }
    }

    /// Chunked reader yielding the UTF-8 bytes of the content.
    pub fn character_stream(&mut self) -> Result<LobStream> {
        let len = self.length()?;
        Ok(match &self.storage {
            ClobStorage::Materialized(text) => LobStream::memory(text.clone().into_bytes()),
            ClobStorage::Locator(loc) => LobStream::locator(loc.clone(), len),
        })
    }
}

/// [`Read`] over a LOB, fetching locator content one chunk at a time.
#[derive(Debug)]
pub struct LobStream {
    source: StreamSource,
    buffer: Vec<u8>,
    pos: usize,
}

#[derive(Debug)]
enum StreamSource {
    Memory,
    Locator {
        locator: Locator,
        next: u64,
        end: u64,
    },
}

impl LobStream {
    fn memory(data: Vec<u8>) -> Self {
        Self {
            source: StreamSource::Memory,
            buffer: data,
            pos: 0,
        }
    }

    fn locator(locator: Locator, len: u64) -> Self {
        Self {
            source: StreamSource::Locator {
                locator,
                next: 0,
                end: len,
            },
            buffer: Vec::new(),
            pos: 0,
        }
    }

    fn refill(&mut self) -> Result<()> {
        let StreamSource::Locator { locator, next, end } = &mut self.source else {
            return Ok(());
        };
        if *next >= *end {
            return Ok(());
        }
        let chunk = (*end - *next).min(STREAM_CHUNK as u64) as usize;
        self.buffer = match locator.substring(*next, chunk)? {
            Value::Bytes(b) => b,
            Value::Text(s) => s.into_bytes(),
            _ => Vec::new(),
        };
        self.pos = 0;
        *next += chunk as u64;
        if self.buffer.is_empty() {
            // row shrank underneath us
            *next = *end;
        }
        Ok(())
    }
}

impl Read for LobStream {
    fn read(&mut self, out: &mut [u8]) -> io::Result<usize> {
        if self.pos >= self.buffer.len() {
            self.refill().map_err(io::Error::other)?;
        }
        let available = &self.buffer[self.pos.min(self.buffer.len())..];
        let n = available.len().min(out.len());
        out[..n].copy_from_slice(&available[..n]);
        self.pos += n;
        Ok(n)
    }
}
