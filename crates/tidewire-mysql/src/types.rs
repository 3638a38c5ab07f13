//! MySQL type system and value conversion.
//!
//! This module provides:
//! - MySQL field type constants and column flags
//! - Column definition parsing with per-column encodings
//! - Row decoding for the text and binary protocols
//! - SQL literal formatting for client-side parameter substitution
//!
//! # Numeric mapping
//!
//! Unsigned columns are promoted to the next wider signed variant so no
//! value changes sign: `TINYINT UNSIGNED` becomes [`Value::SmallInt`],
//! `SMALLINT UNSIGNED` and `MEDIUMINT` become [`Value::Int`],
//! `INT UNSIGNED` becomes [`Value::BigInt`] and `BIGINT UNSIGNED` keeps
//! its own [`Value::UnsignedBigInt`]. Exact numerics decode to
//! [`Value::Decimal`] with their scale intact.

use std::str::FromStr;

use chrono::{NaiveDate, NaiveDateTime, NaiveTime};
use tidewire_core::{Decimal, Result, Value};

use crate::charset::{CharsetMapping, Encoding};
use crate::protocol::PacketReader;

/// Collation id of the `binary` charset.
pub const BINARY_COLLATION: u16 = 63;

/// MySQL field type codes.
///
/// These are the `MYSQL_TYPE_*` constants from the MySQL C API.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum FieldType {
    /// DECIMAL (MYSQL_TYPE_DECIMAL)
    Decimal = 0x00,
    /// TINYINT (MYSQL_TYPE_TINY)
    Tiny = 0x01,
    /// SMALLINT (MYSQL_TYPE_SHORT)
    Short = 0x02,
    /// INT (MYSQL_TYPE_LONG)
    Long = 0x03,
    /// FLOAT (MYSQL_TYPE_FLOAT)
    Float = 0x04,
    /// DOUBLE (MYSQL_TYPE_DOUBLE)
    Double = 0x05,
    /// NULL (MYSQL_TYPE_NULL)
    Null = 0x06,
    /// TIMESTAMP (MYSQL_TYPE_TIMESTAMP)
    Timestamp = 0x07,
    /// BIGINT (MYSQL_TYPE_LONGLONG)
    LongLong = 0x08,
    /// MEDIUMINT (MYSQL_TYPE_INT24)
    Int24 = 0x09,
    /// DATE (MYSQL_TYPE_DATE)
    Date = 0x0A,
    /// TIME (MYSQL_TYPE_TIME)
    Time = 0x0B,
    /// DATETIME (MYSQL_TYPE_DATETIME)
    DateTime = 0x0C,
    /// YEAR (MYSQL_TYPE_YEAR)
    Year = 0x0D,
    /// NEWDATE (MYSQL_TYPE_NEWDATE) - internal use
    NewDate = 0x0E,
    /// VARCHAR (MYSQL_TYPE_VARCHAR)
    VarChar = 0x0F,
    /// BIT (MYSQL_TYPE_BIT)
    Bit = 0x10,
    /// TIMESTAMP2 (MYSQL_TYPE_TIMESTAMP2)
    Timestamp2 = 0x11,
    /// DATETIME2 (MYSQL_TYPE_DATETIME2)
    DateTime2 = 0x12,
    /// TIME2 (MYSQL_TYPE_TIME2)
    Time2 = 0x13,
    /// JSON (MYSQL_TYPE_JSON)
    Json = 0xF5,
    /// NEWDECIMAL (MYSQL_TYPE_NEWDECIMAL)
    NewDecimal = 0xF6,
    /// ENUM (MYSQL_TYPE_ENUM)
    Enum = 0xF7,
    /// SET (MYSQL_TYPE_SET)
    Set = 0xF8,
    /// TINYBLOB (MYSQL_TYPE_TINY_BLOB)
    TinyBlob = 0xF9,
    /// MEDIUMBLOB (MYSQL_TYPE_MEDIUM_BLOB)
    MediumBlob = 0xFA,
    /// LONGBLOB (MYSQL_TYPE_LONG_BLOB)
    LongBlob = 0xFB,
    /// BLOB (MYSQL_TYPE_BLOB)
    Blob = 0xFC,
    /// VARCHAR (MYSQL_TYPE_VAR_STRING)
    VarString = 0xFD,
    /// CHAR (MYSQL_TYPE_STRING)
    String = 0xFE,
    /// GEOMETRY (MYSQL_TYPE_GEOMETRY)
    Geometry = 0xFF,
}

impl FieldType {
    /// Parse a field type from a byte.
    #[must_use]
    pub fn from_u8(value: u8) -> Self {
        match value {
            0x00 => FieldType::Decimal,
            0x01 => FieldType::Tiny,
            0x02 => FieldType::Short,
            0x03 => FieldType::Long,
            0x04 => FieldType::Float,
            0x05 => FieldType::Double,
            0x06 => FieldType::Null,
            0x07 => FieldType::Timestamp,
            0x08 => FieldType::LongLong,
            0x09 => FieldType::Int24,
            0x0A => FieldType::Date,
            0x0B => FieldType::Time,
            0x0C => FieldType::DateTime,
            0x0D => FieldType::Year,
            0x0E => FieldType::NewDate,
            0x0F => FieldType::VarChar,
            0x10 => FieldType::Bit,
            0x11 => FieldType::Timestamp2,
            0x12 => FieldType::DateTime2,
            0x13 => FieldType::Time2,
            0xF5 => FieldType::Json,
            0xF6 => FieldType::NewDecimal,
            0xF7 => FieldType::Enum,
            0xF8 => FieldType::Set,
            0xF9 => FieldType::TinyBlob,
            0xFA => FieldType::MediumBlob,
            0xFB => FieldType::LongBlob,
            0xFC => FieldType::Blob,
            0xFD => FieldType::VarString,
            0xFE => FieldType::String,
            0xFF => FieldType::Geometry,
            _ => FieldType::String,
        }
    }

    /// Check if this is an integer type.
    #[must_use]
    pub const fn is_integer(self) -> bool {
        matches!(
            self,
            FieldType::Tiny
                | FieldType::Short
                | FieldType::Long
                | FieldType::LongLong
                | FieldType::Int24
                | FieldType::Year
        )
    }

    /// Check if this is a floating-point type.
    #[must_use]
    pub const fn is_float(self) -> bool {
        matches!(self, FieldType::Float | FieldType::Double)
    }

    /// Check if this is a decimal type.
    #[must_use]
    pub const fn is_decimal(self) -> bool {
        matches!(self, FieldType::Decimal | FieldType::NewDecimal)
    }

    /// Check if this is a string type.
    #[must_use]
    pub const fn is_string(self) -> bool {
        matches!(
            self,
            FieldType::VarChar
                | FieldType::VarString
                | FieldType::String
                | FieldType::Enum
                | FieldType::Set
        )
    }

    /// Check if this is a binary/blob type.
    #[must_use]
    pub const fn is_blob(self) -> bool {
        matches!(
            self,
            FieldType::TinyBlob
                | FieldType::MediumBlob
                | FieldType::LongBlob
                | FieldType::Blob
                | FieldType::Geometry
        )
    }

    /// Check if this is a date/time type.
    #[must_use]
    pub const fn is_temporal(self) -> bool {
        matches!(
            self,
            FieldType::Date
                | FieldType::Time
                | FieldType::DateTime
                | FieldType::Timestamp
                | FieldType::NewDate
                | FieldType::Timestamp2
                | FieldType::DateTime2
                | FieldType::Time2
        )
    }

    /// Get the type name as a string.
    #[must_use]
    pub const fn name(self) -> &'static str {
        match self {
            FieldType::Decimal | FieldType::NewDecimal => "DECIMAL",
            FieldType::Tiny => "TINYINT",
            FieldType::Short => "SMALLINT",
            FieldType::Long => "INT",
            FieldType::Float => "FLOAT",
            FieldType::Double => "DOUBLE",
            FieldType::Null => "NULL",
            FieldType::Timestamp | FieldType::Timestamp2 => "TIMESTAMP",
            FieldType::LongLong => "BIGINT",
            FieldType::Int24 => "MEDIUMINT",
            FieldType::Date | FieldType::NewDate => "DATE",
            FieldType::Time | FieldType::Time2 => "TIME",
            FieldType::DateTime | FieldType::DateTime2 => "DATETIME",
            FieldType::Year => "YEAR",
            FieldType::VarChar | FieldType::VarString => "VARCHAR",
            FieldType::Bit => "BIT",
            FieldType::Json => "JSON",
            FieldType::Enum => "ENUM",
            FieldType::Set => "SET",
            FieldType::TinyBlob => "TINYBLOB",
            FieldType::MediumBlob => "MEDIUMBLOB",
            FieldType::LongBlob => "LONGBLOB",
            FieldType::Blob => "BLOB",
            FieldType::String => "CHAR",
            FieldType::Geometry => "GEOMETRY",
        }
    }
}

/// Column flags in result set metadata.
#[allow(dead_code)]
pub mod column_flags {
    pub const NOT_NULL: u16 = 1;
    pub const PRIMARY_KEY: u16 = 2;
    pub const UNIQUE_KEY: u16 = 4;
    pub const MULTIPLE_KEY: u16 = 8;
    pub const BLOB: u16 = 16;
    pub const UNSIGNED: u16 = 32;
    pub const ZEROFILL: u16 = 64;
    pub const BINARY: u16 = 128;
    pub const ENUM: u16 = 256;
    pub const AUTO_INCREMENT: u16 = 512;
    pub const TIMESTAMP: u16 = 1024;
    pub const SET: u16 = 2048;
    pub const NO_DEFAULT_VALUE: u16 = 4096;
    pub const ON_UPDATE_NOW: u16 = 8192;
    pub const NUM: u16 = 32768;
}

/// Column definition from a result set.
#[derive(Debug, Clone, PartialEq)]
pub struct ColumnDef {
    /// Catalog name (always "def")
    pub catalog: String,
    /// Schema (database) name
    pub schema: String,
    /// Table name (or alias)
    pub table: String,
    /// Original table name
    pub org_table: String,
    /// Column name (or alias)
    pub name: String,
    /// Original column name
    pub org_name: String,
    /// Collation id of the column's charset
    pub charset: u16,
    /// Column length
    pub column_length: u32,
    /// Column type
    pub column_type: FieldType,
    /// Column flags
    pub flags: u16,
    /// Number of decimals
    pub decimals: u8,
    /// Encoding used to turn this column's bytes into text
    pub encoding: Encoding,
}

impl ColumnDef {
    /// Parse a column definition packet (protocol 4.1).
    ///
    /// The column's encoding comes from its collation id, resolved through
    /// `mapping`; unknown ids fall back to `session`.
    pub fn parse(data: &[u8], mapping: &CharsetMapping, session: Encoding) -> Result<Self> {
        let mut reader = PacketReader::new(data);
        let catalog = reader.read_lenenc_string()?;
        let schema = reader.read_lenenc_string()?;
        let table = reader.read_lenenc_string()?;
        let org_table = reader.read_lenenc_string()?;
        let name = reader.read_lenenc_string()?;
        let org_name = reader.read_lenenc_string()?;
        // Length of the fixed-size block, always 0x0c
        let _fixed_len = reader.read_lenenc_int()?;
        let charset = reader.read_u16_le()?;
        let column_length = reader.read_u32_le()?;
        let column_type = FieldType::from_u8(reader.read_u8()?);
        let flags = reader.read_u16_le()?;
        let decimals = reader.read_u8()?;

        let encoding = if charset == BINARY_COLLATION {
            Encoding::Binary
        } else {
            mapping.encoding_for_collation(charset).unwrap_or(session)
        };

        Ok(Self {
            catalog,
            schema,
            table,
            org_table,
            name,
            org_name,
            charset,
            column_length,
            column_type,
            flags,
            decimals,
            encoding,
        })
    }

    /// Build a definition without a packet, e.g. for parameter metadata.
    pub fn synthetic(name: &str, column_type: FieldType, flags: u16, charset: u16) -> Self {
        Self {
            catalog: "def".to_string(),
            schema: String::new(),
            table: String::new(),
            org_table: String::new(),
            name: name.to_string(),
            org_name: name.to_string(),
            charset,
            column_length: 0,
            column_type,
            flags,
            decimals: 0,
            encoding: if charset == BINARY_COLLATION {
                Encoding::Binary
            } else {
                Encoding::Utf8
            },
        }
    }

    /// Check if the column is NOT NULL.
    #[must_use]
    pub const fn is_not_null(&self) -> bool {
        self.flags & column_flags::NOT_NULL != 0
    }

    /// Check if the column is a primary key.
    #[must_use]
    pub const fn is_primary_key(&self) -> bool {
        self.flags & column_flags::PRIMARY_KEY != 0
    }

    /// Check if the column is unsigned.
    #[must_use]
    pub const fn is_unsigned(&self) -> bool {
        self.flags & column_flags::UNSIGNED != 0
    }

    /// Check if the column is auto-increment.
    #[must_use]
    pub const fn is_auto_increment(&self) -> bool {
        self.flags & column_flags::AUTO_INCREMENT != 0
    }

    /// Check if the column carries binary (not character) data.
    #[must_use]
    pub const fn is_binary(&self) -> bool {
        self.charset == BINARY_COLLATION
    }

    /// Check if the column is a BLOB or TEXT type.
    #[must_use]
    pub const fn is_blob(&self) -> bool {
        self.flags & column_flags::BLOB != 0 || self.column_type.is_blob()
    }

    /// Does this column come from a base table (needed for updates and locators)?
    pub fn has_origin(&self) -> bool {
        !self.org_table.is_empty() && !self.org_name.is_empty()
    }
}

fn fallback_text(col: &ColumnDef, data: &[u8]) -> Value {
    Value::Text(col.encoding.decode(data))
}

fn parse_number<T: FromStr>(col: &ColumnDef, text: &str, wrap: impl FnOnce(T) -> Value) -> Value {
    match text.trim().parse::<T>() {
        Ok(v) => wrap(v),
        Err(_) => {
            tracing::warn!(
                column = %col.name,
                column_type = col.column_type.name(),
                value = text,
                "numeric column value did not parse; returned as text"
            );
            Value::Text(text.to_string())
        }
    }
}

/// Parse an exact decimal, keeping its scale.
///
/// Values beyond the range of [`Decimal`] come back as text.
pub fn parse_decimal(col: &ColumnDef, text: &str) -> Value {
    match Decimal::from_str_exact(text.trim()) {
        Ok(d) => Value::Decimal(d),
        Err(e) => {
            tracing::warn!(
                column = %col.name,
                value = text,
                error = %e,
                "decimal value outside representable range; returned as text"
            );
            Value::Text(text.to_string())
        }
    }
}

fn is_zero_date(text: &str) -> bool {
    text.starts_with("0000-00-00")
}

fn parse_text_date(text: &str) -> Value {
    if is_zero_date(text) {
        return Value::Null;
    }
    NaiveDate::parse_from_str(text, "%Y-%m-%d")
        .map_or_else(|_| Value::Text(text.to_string()), Value::Date)
}

fn parse_text_datetime(text: &str) -> Value {
    if is_zero_date(text) {
        return Value::Null;
    }
    NaiveDateTime::parse_from_str(text, "%Y-%m-%d %H:%M:%S%.f")
        .map_or_else(|_| Value::Text(text.to_string()), Value::Timestamp)
}

/// TIME values are durations on the server; only those inside one day map
/// to [`NaiveTime`]. Negative and multi-day values stay as text.
fn parse_text_time(text: &str) -> Value {
    NaiveTime::parse_from_str(text, "%H:%M:%S%.f")
        .map_or_else(|_| Value::Text(text.to_string()), Value::Time)
}

/// Decode a text protocol value.
///
/// In the text protocol every value arrives as a string; the column
/// definition decides how to interpret it.
pub fn decode_text_value(col: &ColumnDef, data: &[u8]) -> Value {
    let unsigned = col.is_unsigned();
    match col.column_type {
        FieldType::Tiny if unsigned => {
            parse_number(col, &ascii(data), |v: u8| Value::SmallInt(i16::from(v)))
        }
        FieldType::Tiny => parse_number(col, &ascii(data), Value::TinyInt),
        FieldType::Short if unsigned => {
            parse_number(col, &ascii(data), |v: u16| Value::Int(i32::from(v)))
        }
        FieldType::Short | FieldType::Year => parse_number(col, &ascii(data), Value::SmallInt),
        FieldType::Int24 => parse_number(col, &ascii(data), Value::Int),
        FieldType::Long if unsigned => {
            parse_number(col, &ascii(data), |v: u32| Value::BigInt(i64::from(v)))
        }
        FieldType::Long => parse_number(col, &ascii(data), Value::Int),
        FieldType::LongLong if unsigned => parse_number(col, &ascii(data), Value::UnsignedBigInt),
        FieldType::LongLong => parse_number(col, &ascii(data), Value::BigInt),
        FieldType::Float => parse_number(col, &ascii(data), Value::Float),
        FieldType::Double => parse_number(col, &ascii(data), Value::Double),
        FieldType::Decimal | FieldType::NewDecimal => parse_decimal(col, &ascii(data)),

        FieldType::Date | FieldType::NewDate => parse_text_date(&ascii(data)),
        FieldType::DateTime
        | FieldType::Timestamp
        | FieldType::DateTime2
        | FieldType::Timestamp2 => parse_text_datetime(&ascii(data)),
        FieldType::Time | FieldType::Time2 => parse_text_time(&ascii(data)),

        FieldType::Bit | FieldType::Geometry => Value::Bytes(data.to_vec()),
        FieldType::Json => {
            let text = col.encoding.decode(data);
            serde_json::from_str(&text).map_or(Value::Text(text), Value::Json)
        }
        FieldType::Null => Value::Null,

        // Strings and blobs: the charset decides between text and bytes
        _ if col.is_binary() => Value::Bytes(data.to_vec()),
        _ => fallback_text(col, data),
    }
}

fn ascii(data: &[u8]) -> String {
    String::from_utf8_lossy(data).into_owned()
}

/// Decode one text-protocol row.
///
/// Each column is a length-encoded string; `0xFB` marks NULL.
pub fn decode_text_row(columns: &[ColumnDef], payload: &[u8]) -> Result<Vec<Value>> {
    let mut reader = PacketReader::new(payload);
    columns
        .iter()
        .map(|col| {
            Ok(match reader.read_lenenc_field()? {
                Some(data) => decode_text_value(col, data),
                None => Value::Null,
            })
        })
        .collect()
}

/// Decode one binary-protocol row.
///
/// Layout: `0x00` header, NULL bitmap of `(n + 7 + 2) / 8` bytes with a
/// two-bit offset, then the non-NULL values back to back.
pub fn decode_binary_row(columns: &[ColumnDef], payload: &[u8]) -> Result<Vec<Value>> {
    let mut reader = PacketReader::new(payload);
    let header = reader.read_u8()?;
    if header != 0x00 {
        return Err(tidewire_core::Error::protocol(format!(
            "binary row must start with 0x00, got 0x{header:02X}"
        )));
    }
    let bitmap = reader.read_bytes((columns.len() + 7 + 2) / 8)?;
    let mut values = Vec::with_capacity(columns.len());
    for (i, col) in columns.iter().enumerate() {
        let bit = i + 2;
        if bitmap[bit / 8] & (1 << (bit % 8)) != 0 {
            values.push(Value::Null);
        } else {
            values.push(read_binary_value(&mut reader, col)?);
        }
    }
    Ok(values)
}

/// Read one binary-protocol value for `col` from `reader`.
pub fn read_binary_value(reader: &mut PacketReader<'_>, col: &ColumnDef) -> Result<Value> {
    let unsigned = col.is_unsigned();
    Ok(match col.column_type {
        FieldType::Tiny => {
            let b = reader.read_u8()?;
            if unsigned {
                Value::SmallInt(i16::from(b))
            } else {
                Value::TinyInt(b as i8)
            }
        }
        FieldType::Short | FieldType::Year => {
            let v = reader.read_u16_le()?;
            if unsigned && col.column_type == FieldType::Short {
                Value::Int(i32::from(v))
            } else {
                Value::SmallInt(v as i16)
            }
        }
        FieldType::Int24 | FieldType::Long => {
            let v = reader.read_u32_le()?;
            if unsigned && col.column_type == FieldType::Long {
                Value::BigInt(i64::from(v))
            } else {
                Value::Int(v as i32)
            }
        }
        FieldType::LongLong => {
            let v = reader.read_u64_le()?;
            if unsigned {
                Value::UnsignedBigInt(v)
            } else {
                Value::BigInt(v as i64)
            }
        }
        FieldType::Float => Value::Float(f32::from_bits(reader.read_u32_le()?)),
        FieldType::Double => Value::Double(f64::from_bits(reader.read_u64_le()?)),
        FieldType::Date
        | FieldType::NewDate
        | FieldType::DateTime
        | FieldType::Timestamp
        | FieldType::DateTime2
        | FieldType::Timestamp2 => {
            let len = reader.read_u8()? as usize;
            decode_binary_datetime(col.column_type, reader.read_bytes(len)?)
        }
        FieldType::Time | FieldType::Time2 => {
            let len = reader.read_u8()? as usize;
            decode_binary_time(reader.read_bytes(len)?)
        }
        FieldType::Null => Value::Null,
        _ => decode_text_value(col, reader.read_lenenc_bytes()?),
    })
}

/// Binary DATE/DATETIME: 0, 4, 7 or 11 bytes of
/// year(2) month day hour minute second micros(4).
fn decode_binary_datetime(field_type: FieldType, data: &[u8]) -> Value {
    if data.len() < 4 {
        return Value::Null;
    }
    let year = i32::from(u16::from_le_bytes([data[0], data[1]]));
    let (month, day) = (u32::from(data[2]), u32::from(data[3]));
    if year == 0 && month == 0 && day == 0 {
        return Value::Null;
    }
    let (hour, minute, second) = match data {
        [_, _, _, _, h, m, s, ..] => (u32::from(*h), u32::from(*m), u32::from(*s)),
        _ => (0, 0, 0),
    };
    let micros = match data {
        [_, _, _, _, _, _, _, a, b, c, d, ..] => u32::from_le_bytes([*a, *b, *c, *d]),
        _ => 0,
    };
    let Some(date) = NaiveDate::from_ymd_opt(year, month, day) else {
        return Value::Text(format!("{year:04}-{month:02}-{day:02}"));
    };
    if matches!(field_type, FieldType::Date | FieldType::NewDate) {
        return Value::Date(date);
    }
    date.and_hms_micro_opt(hour, minute, second, micros)
        .map_or_else(
            || {
                Value::Text(format!(
                    "{year:04}-{month:02}-{day:02} {hour:02}:{minute:02}:{second:02}.{micros:06}"
                ))
            },
            Value::Timestamp,
        )
}

/// Binary TIME: 0, 8 or 12 bytes of
/// negative(1) days(4) hour minute second micros(4).
fn decode_binary_time(data: &[u8]) -> Value {
    if data.len() < 8 {
        return Value::Time(NaiveTime::MIN);
    }
    let negative = data[0] != 0;
    let days = u32::from_le_bytes([data[1], data[2], data[3], data[4]]);
    let (hour, minute, second) = (u32::from(data[5]), u32::from(data[6]), u32::from(data[7]));
    let micros = match data {
        [_, _, _, _, _, _, _, _, a, b, c, d, ..] => u32::from_le_bytes([*a, *b, *c, *d]),
        _ => 0,
    };
    if !negative && days == 0 {
        if let Some(t) = NaiveTime::from_hms_micro_opt(hour, minute, second, micros) {
            return Value::Time(t);
        }
    }
    let sign = if negative { "-" } else { "" };
    let hours = days * 24 + hour;
    let mut text = format!("{sign}{hours:02}:{minute:02}:{second:02}");
    if micros > 0 {
        text.push_str(&format!(".{micros:06}"));
    }
    Value::Text(text)
}

/// Escape a string for use in MySQL text protocol.
///
/// With `no_backslash_escapes` (the server's `NO_BACKSLASH_ESCAPES` SQL
/// mode) only quotes are doubled.
pub fn escape_string(s: &str, no_backslash_escapes: bool) -> String {
    let mut result = String::with_capacity(s.len() + 2);
    result.push('\'');
    for ch in s.chars() {
        match ch {
            '\'' => result.push_str("''"),
            _ if no_backslash_escapes => result.push(ch),
            '\\' => result.push_str("\\\\"),
            '\0' => result.push_str("\\0"),
            '\n' => result.push_str("\\n"),
            '\r' => result.push_str("\\r"),
            '\x1a' => result.push_str("\\Z"),
            _ => result.push(ch),
        }
    }
    result.push('\'');
    result
}

/// Escape bytes as a hex literal.
pub fn escape_bytes(data: &[u8]) -> String {
    use std::fmt::Write;

    let mut result = String::with_capacity(data.len() * 2 + 3);
    result.push_str("X'");
    for byte in data {
        let _ = write!(result, "{byte:02X}");
    }
    result.push('\'');
    result
}

fn format_float(v: f64) -> String {
    if v.is_nan() {
        "NULL".to_string()
    } else if v.is_infinite() {
        if v.is_sign_positive() { "1e308" } else { "-1e308" }.to_string()
    } else {
        v.to_string()
    }
}

/// Format a value as a SQL literal for client-side substitution.
///
/// Decimals are written from their exact representation and temporal
/// values with an explicit format string per call.
pub fn format_value_for_sql(value: &Value, no_backslash_escapes: bool) -> String {
    match value {
        Value::Null => "NULL".to_string(),
        Value::Bool(b) => if *b { "TRUE" } else { "FALSE" }.to_string(),
        Value::TinyInt(i) => i.to_string(),
        Value::SmallInt(i) => i.to_string(),
        Value::Int(i) => i.to_string(),
        Value::BigInt(i) => i.to_string(),
        Value::UnsignedBigInt(u) => u.to_string(),
        Value::Float(f) => {
            if f.is_finite() {
                f.to_string()
            } else {
                format_float(f64::from(*f))
            }
        }
        Value::Double(f) => format_float(*f),
        Value::Decimal(d) => d.to_string(),
        Value::Text(s) => escape_string(s, no_backslash_escapes),
        Value::Bytes(b) => escape_bytes(b),
        Value::Json(j) => escape_string(&j.to_string(), no_backslash_escapes),
        Value::Date(d) => format!("'{}'", d.format("%Y-%m-%d")),
        Value::Time(t) => format!("'{}'", t.format("%H:%M:%S%.6f")),
        Value::Timestamp(t) => format!("'{}'", t.format("%Y-%m-%d %H:%M:%S%.6f")),
    }
}
