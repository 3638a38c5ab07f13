//! SQL text handling for client-side statements.
//!
//! [`ParsedSql`] finds the `?` placeholders of a statement, skipping
//! string literals, quoted identifiers and comments, and substitutes
//! literal values for them. It also recognises `INSERT ... VALUES (...)`
//! statements whose single row group can be repeated to merge a batch
//! into one multi-row insert.

use std::sync::LazyLock;

use regex::Regex;
use tidewire_core::{Error, Result, Value};

use crate::types::format_value_for_sql;

static INSERT_VALUES: LazyLock<Option<Regex>> = LazyLock::new(|| {
    Regex::new(r"(?is)^\s*(?:INSERT|REPLACE)\b.*?\bVALUES?\s*\(").ok()
});

static ON_DUPLICATE: LazyLock<Option<Regex>> =
    LazyLock::new(|| Regex::new(r"(?i)^ON\s+DUPLICATE\s+KEY\s+UPDATE\b").ok());

/// A statement with its placeholder positions.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ParsedSql {
    sql: String,
    /// Byte offsets of `?` placeholders
    placeholders: Vec<usize>,
    /// `sql` with literal and comment bodies blanked out
    masked: String,
}

impl ParsedSql {
    pub fn parse(sql: &str) -> Self {
        let (placeholders, masked) = scan(sql);
        Self {
            sql: sql.to_string(),
            placeholders,
            masked,
        }
    }

    pub fn sql(&self) -> &str {
        &self.sql
    }

    pub fn param_count(&self) -> usize {
        self.placeholders.len()
    }

    /// Replace each placeholder with the literal form of its value.
    pub fn interpolate(&self, params: &[Value], no_backslash_escapes: bool) -> Result<String> {
        if params.len() != self.placeholders.len() {
            return Err(Error::InvalidArgument(format!(
                "statement has {} parameters, {} supplied",
                self.placeholders.len(),
                params.len()
            )));
        }
        let mut out = String::with_capacity(self.sql.len() + params.len() * 16);
        let mut last = 0;
        for (&pos, value) in self.placeholders.iter().zip(params) {
            out.push_str(&self.sql[last..pos]);
            out.push_str(&format_value_for_sql(value, no_backslash_escapes));
            last = pos + 1;
        }
        out.push_str(&self.sql[last..]);
        Ok(out)
    }

    /// Split an `INSERT ... VALUES (row)` statement around its row group.
    ///
    /// Returns `None` when the statement is not a single-row insert, or
    /// when placeholders appear outside the row group.
    pub fn insert_values(&self) -> Option<InsertValues> {
        let re = INSERT_VALUES.as_ref()?;
        let open = re.find(&self.masked)?.end() - 1;
        let close = matching_paren(&self.masked, open)?;

        let tail = self.masked[close + 1..].trim();
        let tail = tail.strip_suffix(';').unwrap_or(tail).trim_end();
        let tail_ok = tail.is_empty() || ON_DUPLICATE.as_ref().is_some_and(|re| re.is_match(tail));
        if !tail_ok {
            return None;
        }
        if self.placeholders.iter().any(|&p| p < open || p > close) {
            return None;
        }

        let row = &self.sql[open..=close];
        let tail = self.sql[close + 1..].trim_end();
        Some(InsertValues {
            head: self.sql[..open].to_string(),
            row: ParsedSql::parse(row),
            tail: tail.strip_suffix(';').unwrap_or(tail).to_string(),
        })
    }
}

/// An insert split into `head`, one `(row)` group and `tail`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InsertValues {
    head: String,
    row: ParsedSql,
    tail: String,
}

impl InsertValues {
    /// Everything up to and including `VALUES`.
    pub fn head(&self) -> &str {
        &self.head
    }

    /// Text after the row group, e.g. an `ON DUPLICATE KEY UPDATE` clause.
    pub fn tail(&self) -> &str {
        &self.tail
    }

    /// The `(...)` row group as written, placeholders included.
    pub fn row(&self) -> &str {
        self.row.sql()
    }

    /// Placeholders in one row group.
    pub fn row_params(&self) -> usize {
        self.row.param_count()
    }

    /// One row group with its parameters substituted.
    pub fn render_row(&self, params: &[Value], no_backslash_escapes: bool) -> Result<String> {
        self.row.interpolate(params, no_backslash_escapes)
    }

    /// Assemble a multi-row insert from rendered row groups.
    pub fn assemble<'a>(&self, rows: impl IntoIterator<Item = &'a str>) -> String {
        let mut sql = self.head.clone();
        for (i, row) in rows.into_iter().enumerate() {
            if i > 0 {
                sql.push(',');
            }
            sql.push_str(row);
        }
        sql.push_str(&self.tail);
        sql
    }

    /// Bytes the head and tail contribute to every assembled statement.
    pub fn overhead(&self) -> usize {
        self.head.len() + self.tail.len()
    }
}

/// Split text holding several `;`-separated statements. Separators
/// inside literals and comments do not count; empty pieces are dropped.
pub fn split_statements(sql: &str) -> Vec<&str> {
    let (_, masked) = scan(sql);
    let mut out = Vec::new();
    let mut start = 0;
    for (i, b) in masked.bytes().enumerate() {
        if b == b';' {
            out.push(&sql[start..i]);
            start = i + 1;
        }
    }
    out.push(&sql[start..]);
    out.retain(|s| !s.trim().is_empty());
    out
}

fn matching_paren(masked: &str, open: usize) -> Option<usize> {
    let mut depth = 0usize;
    for (i, b) in masked.bytes().enumerate().skip(open) {
        match b {
            b'(' => depth += 1,
            b')' => {
                depth -= 1;
                if depth == 0 {
                    return Some(i);
                }
            }
            _ => {}
        }
    }
    None
}

/// Find placeholders and build the masked copy.
///
/// Quoted and commented regions are replaced byte-for-byte with spaces in
/// the mask, so offsets in the mask and the original agree.
fn scan(sql: &str) -> (Vec<usize>, String) {
    let bytes = sql.as_bytes();
    let mut mask = bytes.to_vec();
    let mut placeholders = Vec::new();
    let mut i = 0;

    let blank = |mask: &mut Vec<u8>, from: usize, to: usize| {
        for b in &mut mask[from..to] {
            *b = b' ';
        }
    };

    while i < bytes.len() {
        match bytes[i] {
            b'?' => {
                placeholders.push(i);
                i += 1;
            }
            quote @ (b'\'' | b'"' | b'`') => {
                let start = i;
                i += 1;
                while i < bytes.len() {
                    if bytes[i] == b'\\' && quote != b'`' {
                        i += 2;
                        continue;
                    }
                    if bytes[i] == quote {
                        if bytes.get(i + 1) == Some(&quote) {
                            i += 2;
                            continue;
                        }
                        break;
                    }
                    i += 1;
                }
                i = (i + 1).min(bytes.len());
                blank(&mut mask, start, i);
            }
            b'#' => {
                let start = i;
                while i < bytes.len() && bytes[i] != b'\n' {
                    i += 1;
                }
                blank(&mut mask, start, i);
            }
            b'-' if bytes.get(i + 1) == Some(&b'-')
                && bytes.get(i + 2).is_none_or(|c| c.is_ascii_whitespace()) =>
            {
                let start = i;
                while i < bytes.len() && bytes[i] != b'\n' {
                    i += 1;
                }
                blank(&mut mask, start, i);
            }
            b'/' if bytes.get(i + 1) == Some(&b'*') => {
                let start = i;
                i += 2;
                while i < bytes.len() && !(bytes[i] == b'*' && bytes.get(i + 1) == Some(&b'/')) {
                    i += 1;
                }
                i = (i + 2).min(bytes.len());
                blank(&mut mask, start, i);
            }
            _ => i += 1,
        }
    }

    // Only whole multi-byte sequences inside blanked regions were touched,
    // and they are now ASCII spaces.
    let masked = String::from_utf8(mask).unwrap_or_else(|e| {
        String::from_utf8_lossy(e.as_bytes()).into_owned()
    });
    (placeholders, masked)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::str::FromStr;
    use tidewire_core::Decimal;

    #[test]
    fn test_placeholders_skip_literals_and_comments() {
        let parsed = ParsedSql::parse(
            "SELECT '?', \"?\", `a?b`, ? -- trailing ?\n, ? # hash ?\n /* ? */ FROM t WHERE x = 'it''s ?'",
        );
        assert_eq!(parsed.param_count(), 2);
    }

    #[test]
    fn test_backslash_escaped_quote_does_not_end_literal() {
        let parsed = ParsedSql::parse(r"SELECT 'a\'?' , ?");
        assert_eq!(parsed.param_count(), 1);
    }

    #[test]
    fn test_double_dash_needs_whitespace() {
        // `1--?` is arithmetic, not a comment
        let parsed = ParsedSql::parse("SELECT 1--?");
        assert_eq!(parsed.param_count(), 1);
    }

    #[test]
    fn test_interpolate() {
        let parsed = ParsedSql::parse("INSERT INTO t VALUES (?, ?, ?)");
        let sql = parsed
            .interpolate(
                &[
                    Value::Int(1),
                    Value::Text("o'k".to_string()),
                    Value::Decimal(Decimal::from_str("-964372.8000000000").unwrap()),
                ],
                false,
            )
            .unwrap();
        assert_eq!(sql, "INSERT INTO t VALUES (1, 'o''k', -964372.8000000000)");
    }

    #[test]
    fn test_interpolate_count_mismatch() {
        let parsed = ParsedSql::parse("SELECT ?, ?");
        let err = parsed.interpolate(&[Value::Int(1)], false).unwrap_err();
        assert!(matches!(err, Error::InvalidArgument(_)));
    }

    #[test]
    fn test_insert_values_split() {
        let parsed = ParsedSql::parse("insert into t (a, b) values (?, '(x)');");
        let insert = parsed.insert_values().unwrap();
        assert_eq!(insert.head(), "insert into t (a, b) values ");
        assert_eq!(insert.tail(), "");
        let rows: Vec<String> = (1..=3)
            .map(|i| insert.render_row(&[Value::Int(i)], false).unwrap())
            .collect();
        assert_eq!(
            insert.assemble(rows.iter().map(String::as_str)),
            "insert into t (a, b) values (1, '(x)'),(2, '(x)'),(3, '(x)')"
        );
    }

    #[test]
    fn test_insert_values_with_on_duplicate() {
        let parsed =
            ParsedSql::parse("INSERT INTO t VALUES (?, ?) ON DUPLICATE KEY UPDATE b = VALUES(b)");
        let insert = parsed.insert_values().unwrap();
        assert_eq!(insert.tail(), " ON DUPLICATE KEY UPDATE b = VALUES(b)");
    }

    #[test]
    fn test_insert_values_rejected() {
        for sql in [
            "UPDATE t SET a = ?",
            "INSERT INTO t SELECT * FROM u WHERE a = ?",
            "INSERT INTO t VALUES (?), (?)",
            "INSERT INTO t VALUES (1) ON DUPLICATE KEY UPDATE a = ?",
            "INSERT INTO t (a) VALUES (?",
        ] {
            assert!(ParsedSql::parse(sql).insert_values().is_none(), "{sql}");
        }
    }

    #[test]
    fn test_split_statements() {
        assert_eq!(
            split_statements("UPDATE t SET a = ';'; DELETE FROM t -- x;y\n;"),
            vec!["UPDATE t SET a = ';'", " DELETE FROM t -- x;y\n"]
        );
        assert!(split_statements(" ; ").is_empty());
    }

    #[test]
    fn test_values_keyword_inside_literal_is_ignored() {
        let parsed = ParsedSql::parse("INSERT INTO t (note) SELECT 'VALUES (?)'");
        assert_eq!(parsed.param_count(), 0);
        assert!(parsed.insert_values().is_none());
    }
}
