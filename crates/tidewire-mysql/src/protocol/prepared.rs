//! MySQL prepared statement (binary protocol) commands.
//!
//! Builders here return the command payload (command byte included) but
//! not the packet framing: the connection checks the payload against the
//! server's `max_allowed_packet` before framing and sending it.
//!
//! # Protocol Flow
//!
//! 1. **Prepare**: COM_STMT_PREPARE with SQL
//!    - Server returns statement ID, param count, column count
//!    - Server sends param column definitions (if any)
//!    - Server sends result column definitions (if any)
//!
//! 2. **Long data** (optional): COM_STMT_SEND_LONG_DATA per chunk
//!    - No server response
//!
//! 3. **Execute**: COM_STMT_EXECUTE with statement ID + binary params
//!    - Server returns a binary result set or an OK packet
//!    - With a read-only cursor the server returns only column
//!      definitions; rows come from COM_STMT_FETCH
//!
//! 4. **Close**: COM_STMT_CLOSE with statement ID
//!    - No server response

use chrono::{Datelike, NaiveDate, NaiveDateTime, NaiveTime, Timelike};
use tidewire_core::{Error, Result, Value};

use super::{Command, PacketReader, PacketWriter};
use crate::charset::Encoding;
use crate::types::FieldType;

/// `CURSOR_TYPE_READ_ONLY` flag for COM_STMT_EXECUTE.
pub const CURSOR_TYPE_READ_ONLY: u8 = 0x01;

/// Response from COM_STMT_PREPARE.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StmtPrepareOk {
    /// Unique statement identifier (used in execute/close)
    pub statement_id: u32,
    /// Number of columns in result set (0 for non-SELECT)
    pub num_columns: u16,
    /// Number of parameters (placeholders) in the SQL
    pub num_params: u16,
    /// Number of warnings generated during prepare
    pub warnings: u16,
}

/// A parameter whose bytes were already sent with COM_STMT_SEND_LONG_DATA.
///
/// The execute packet then carries only its type; the value slot is empty.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LongData {
    pub field_type: FieldType,
}

/// One parameter slot of COM_STMT_EXECUTE.
#[derive(Debug, Clone, Copy)]
pub enum ExecuteParam<'a> {
    Value(&'a Value),
    LongData(LongData),
}

impl ExecuteParam<'_> {
    fn is_null(&self) -> bool {
        matches!(self, ExecuteParam::Value(Value::Null))
    }

    fn type_and_flags(&self) -> (FieldType, u8) {
        match self {
            ExecuteParam::Value(v) => (
                value_to_field_type(v),
                if matches!(v, Value::UnsignedBigInt(_)) {
                    0x80
                } else {
                    0x00
                },
            ),
            ExecuteParam::LongData(l) => (l.field_type, 0x00),
        }
    }
}

/// Build a COM_STMT_PREPARE payload.
pub fn build_stmt_prepare_packet(sql: &str, encoding: Encoding) -> Vec<u8> {
    let sql = encoding.encode(sql);
    let mut writer = PacketWriter::with_capacity(1 + sql.len());
    writer.write_u8(Command::StmtPrepare as u8);
    writer.write_bytes(&sql);
    writer.into_bytes()
}

/// Build a COM_STMT_EXECUTE payload.
///
/// Layout:
/// - Command byte (0x17)
/// - Statement ID (4 bytes, little-endian)
/// - Flags (1 byte): 0x00 = no cursor, 0x01 = read-only cursor
/// - Iteration count (4 bytes, always 1)
/// - NULL bitmap (if num_params > 0)
/// - New params bound flag (1 byte, always 1)
/// - Parameter types, then non-NULL parameter values
pub fn build_stmt_execute_packet(
    statement_id: u32,
    params: &[ExecuteParam<'_>],
    cursor_read_only: bool,
    encoding: Encoding,
) -> Vec<u8> {
    let mut writer = PacketWriter::with_capacity(64 + params.len() * 16);

    writer.write_u8(Command::StmtExecute as u8);
    writer.write_u32_le(statement_id);
    writer.write_u8(if cursor_read_only {
        CURSOR_TYPE_READ_ONLY
    } else {
        0x00
    });
    writer.write_u32_le(1);

    if params.is_empty() {
        return writer.into_bytes();
    }

    let mut null_bitmap = vec![0u8; params.len().div_ceil(8)];
    for (i, param) in params.iter().enumerate() {
        if param.is_null() {
            null_bitmap[i / 8] |= 1 << (i % 8);
        }
    }
    writer.write_bytes(&null_bitmap);

    // new_params_bound: types are always resent
    writer.write_u8(1);

    for param in params {
        let (field_type, flags) = param.type_and_flags();
        writer.write_u8(field_type as u8);
        writer.write_u8(flags);
    }

    for param in params {
        if let ExecuteParam::Value(v) = param {
            encode_binary_value(&mut writer, v, encoding);
        }
    }

    writer.into_bytes()
}

/// Build a COM_STMT_SEND_LONG_DATA payload for one chunk of a parameter.
pub fn build_stmt_send_long_data_packet(statement_id: u32, param_id: u16, data: &[u8]) -> Vec<u8> {
    let mut writer = PacketWriter::with_capacity(7 + data.len());
    writer.write_u8(Command::StmtSendLongData as u8);
    writer.write_u32_le(statement_id);
    writer.write_u16_le(param_id);
    writer.write_bytes(data);
    writer.into_bytes()
}

/// Build a COM_STMT_FETCH payload requesting up to `num_rows` cursor rows.
pub fn build_stmt_fetch_packet(statement_id: u32, num_rows: u32) -> Vec<u8> {
    let mut writer = PacketWriter::with_capacity(9);
    writer.write_u8(Command::StmtFetch as u8);
    writer.write_u32_le(statement_id);
    writer.write_u32_le(num_rows);
    writer.into_bytes()
}

/// Build a COM_STMT_CLOSE payload. The server does not answer it.
pub fn build_stmt_close_packet(statement_id: u32) -> Vec<u8> {
    let mut writer = PacketWriter::with_capacity(5);
    writer.write_u8(Command::StmtClose as u8);
    writer.write_u32_le(statement_id);
    writer.into_bytes()
}

/// Build a COM_STMT_RESET payload.
///
/// Discards long data accumulated with COM_STMT_SEND_LONG_DATA and
/// closes any open cursor on the statement.
pub fn build_stmt_reset_packet(statement_id: u32) -> Vec<u8> {
    let mut writer = PacketWriter::with_capacity(5);
    writer.write_u8(Command::StmtReset as u8);
    writer.write_u32_le(statement_id);
    writer.into_bytes()
}

/// Parse a COM_STMT_PREPARE_OK response.
///
/// # Format
///
/// - Status: 0x00 (1 byte)
/// - Statement ID (4 bytes)
/// - Number of columns (2 bytes)
/// - Number of parameters (2 bytes)
/// - Reserved: 0x00 (1 byte)
/// - Warning count (2 bytes, optional)
pub fn parse_stmt_prepare_ok(data: &[u8]) -> Result<StmtPrepareOk> {
    let mut reader = PacketReader::new(data);
    let status = reader.read_u8()?;
    if status != 0x00 {
        return Err(Error::protocol(format!(
            "expected COM_STMT_PREPARE_OK, got status 0x{status:02X}"
        )));
    }
    let statement_id = reader.read_u32_le()?;
    let num_columns = reader.read_u16_le()?;
    let num_params = reader.read_u16_le()?;
    reader.skip(1)?;
    let warnings = if reader.remaining() >= 2 {
        reader.read_u16_le()?
    } else {
        0
    };

    Ok(StmtPrepareOk {
        statement_id,
        num_columns,
        num_params,
        warnings,
    })
}

/// Determine the MySQL field type for a Value.
pub fn value_to_field_type(value: &Value) -> FieldType {
    match value {
        Value::Null => FieldType::Null,
        Value::Bool(_) | Value::TinyInt(_) => FieldType::Tiny,
        Value::SmallInt(_) => FieldType::Short,
        Value::Int(_) => FieldType::Long,
        Value::BigInt(_) | Value::UnsignedBigInt(_) => FieldType::LongLong,
        Value::Float(_) => FieldType::Float,
        Value::Double(_) => FieldType::Double,
        Value::Decimal(_) => FieldType::NewDecimal,
        Value::Text(_) => FieldType::VarString,
        Value::Bytes(_) => FieldType::Blob,
        Value::Json(_) => FieldType::Json,
        Value::Date(_) => FieldType::Date,
        Value::Time(_) => FieldType::Time,
        Value::Timestamp(_) => FieldType::DateTime,
    }
}

/// Encode a value in the binary protocol. Parameters and result rows
/// share the layout.
pub(crate) fn encode_binary_value(writer: &mut PacketWriter, value: &Value, encoding: Encoding) {
    match value {
        // NULL lives in the bitmap only
        Value::Null => {}
        Value::Bool(b) => writer.write_u8(u8::from(*b)),
        Value::TinyInt(i) => writer.write_u8(*i as u8),
        Value::SmallInt(i) => writer.write_u16_le(*i as u16),
        Value::Int(i) => writer.write_u32_le(*i as u32),
        Value::BigInt(i) => writer.write_u64_le(*i as u64),
        Value::UnsignedBigInt(u) => writer.write_u64_le(*u),
        Value::Float(f) => writer.write_u32_le(f.to_bits()),
        Value::Double(f) => writer.write_u64_le(f.to_bits()),
        Value::Decimal(d) => writer.write_lenenc_string(&d.to_string()),
        Value::Text(s) => writer.write_lenenc_bytes(&encoding.encode(s)),
        Value::Bytes(b) => writer.write_lenenc_bytes(b),
        Value::Json(j) => writer.write_lenenc_string(&j.to_string()),
        Value::Date(d) => encode_binary_date(writer, *d),
        Value::Time(t) => encode_binary_time(writer, *t),
        Value::Timestamp(ts) => encode_binary_datetime(writer, *ts),
    }
}

fn encode_binary_date(writer: &mut PacketWriter, date: NaiveDate) {
    writer.write_u8(4);
    writer.write_u16_le(date.year() as u16);
    writer.write_u8(date.month() as u8);
    writer.write_u8(date.day() as u8);
}

fn encode_binary_time(writer: &mut PacketWriter, time: NaiveTime) {
    let micros = time.nanosecond() / 1_000;
    if time == NaiveTime::MIN {
        writer.write_u8(0);
        return;
    }
    writer.write_u8(if micros == 0 { 8 } else { 12 });
    // not negative, zero days
    writer.write_u8(0);
    writer.write_u32_le(0);
    writer.write_u8(time.hour() as u8);
    writer.write_u8(time.minute() as u8);
    writer.write_u8(time.second() as u8);
    if micros != 0 {
        writer.write_u32_le(micros);
    }
}

fn encode_binary_datetime(writer: &mut PacketWriter, ts: NaiveDateTime) {
    let micros = ts.nanosecond() / 1_000;
    writer.write_u8(if micros == 0 { 7 } else { 11 });
    writer.write_u16_le(ts.year() as u16);
    writer.write_u8(ts.month() as u8);
    writer.write_u8(ts.day() as u8);
    writer.write_u8(ts.hour() as u8);
    writer.write_u8(ts.minute() as u8);
    writer.write_u8(ts.second() as u8);
    if micros != 0 {
        writer.write_u32_le(micros);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{ColumnDef, column_flags, read_binary_value};
    use tidewire_core::Decimal;

    fn values(params: &[Value]) -> Vec<ExecuteParam<'_>> {
        params.iter().map(ExecuteParam::Value).collect()
    }

    #[test]
    fn test_build_stmt_prepare_packet() {
        let payload = build_stmt_prepare_packet("SELECT * FROM users WHERE id = ?", Encoding::Utf8);
        assert_eq!(payload[0], Command::StmtPrepare as u8);
        assert_eq!(&payload[1..], b"SELECT * FROM users WHERE id = ?");
    }

    #[test]
    fn test_build_stmt_close_packet() {
        let payload = build_stmt_close_packet(42);
        assert_eq!(payload, [Command::StmtClose as u8, 42, 0, 0, 0]);
    }

    #[test]
    fn test_build_fetch_and_long_data() {
        assert_eq!(
            build_stmt_fetch_packet(7, 100),
            [Command::StmtFetch as u8, 7, 0, 0, 0, 100, 0, 0, 0]
        );
        assert_eq!(
            build_stmt_send_long_data_packet(7, 2, b"abc"),
            [Command::StmtSendLongData as u8, 7, 0, 0, 0, 2, 0, b'a', b'b', b'c']
        );
    }

    #[test]
    fn test_parse_stmt_prepare_ok() {
        let data = [
            0x00, // status
            0x01, 0x00, 0x00, 0x00, // statement_id = 1
            0x03, 0x00, // num_columns = 3
            0x02, 0x00, // num_params = 2
            0x00, // reserved
            0x00, 0x00, // warnings = 0
        ];

        let result = parse_stmt_prepare_ok(&data).unwrap();
        assert_eq!(result.statement_id, 1);
        assert_eq!(result.num_columns, 3);
        assert_eq!(result.num_params, 2);
        assert_eq!(result.warnings, 0);
    }

    #[test]
    fn test_parse_stmt_prepare_ok_invalid() {
        assert!(parse_stmt_prepare_ok(&[0x00, 0x01]).is_err());
        let mut data = [0u8; 12];
        data[0] = 0xFF;
        assert!(matches!(parse_stmt_prepare_ok(&data), Err(Error::Protocol(_))));
    }

    #[test]
    fn test_build_stmt_execute_no_params() {
        let payload = build_stmt_execute_packet(1, &[], false, Encoding::Utf8);
        assert_eq!(payload, [Command::StmtExecute as u8, 1, 0, 0, 0, 0, 1, 0, 0, 0]);
    }

    #[test]
    fn test_build_stmt_execute_with_cursor() {
        let payload = build_stmt_execute_packet(1, &[], true, Encoding::Utf8);
        assert_eq!(payload[5], CURSOR_TYPE_READ_ONLY);
    }

    #[test]
    fn test_build_stmt_execute_with_params() {
        let params = vec![Value::Int(42), Value::Text("hello".to_string())];
        let payload = build_stmt_execute_packet(1, &values(&params), false, Encoding::Utf8);

        // NULL bitmap, new params bound
        assert_eq!(payload[10], 0x00);
        assert_eq!(payload[11], 0x01);
        assert_eq!(payload[12], FieldType::Long as u8);
        assert_eq!(payload[13], 0x00);
        assert_eq!(payload[14], FieldType::VarString as u8);
        assert_eq!(payload[15], 0x00);
        assert_eq!(&payload[16..20], &42u32.to_le_bytes());
        assert_eq!(&payload[20..], b"\x05hello");
    }

    #[test]
    fn test_build_stmt_execute_with_null() {
        let params = vec![Value::Null, Value::Int(42)];
        let payload = build_stmt_execute_packet(1, &values(&params), false, Encoding::Utf8);
        assert_eq!(payload[10], 0x01);
    }

    #[test]
    fn test_unsigned_param_sets_flag() {
        let params = vec![Value::UnsignedBigInt(u64::MAX)];
        let payload = build_stmt_execute_packet(1, &values(&params), false, Encoding::Utf8);
        assert_eq!(payload[12], FieldType::LongLong as u8);
        assert_eq!(payload[13], 0x80);
        assert_eq!(&payload[14..], &u64::MAX.to_le_bytes());
    }

    #[test]
    fn test_decimal_param_is_exact_text() {
        let d: Decimal = "-964372.8000000000".parse().unwrap();
        let params = vec![Value::Decimal(d)];
        let payload = build_stmt_execute_packet(1, &values(&params), false, Encoding::Utf8);
        assert_eq!(payload[12], FieldType::NewDecimal as u8);
        assert_eq!(&payload[14..], b"\x12-964372.8000000000");
    }

    #[test]
    fn test_empty_bytes_bind_length_zero() {
        let params = vec![Value::Bytes(Vec::new())];
        let payload = build_stmt_execute_packet(1, &values(&params), false, Encoding::Utf8);
        // not NULL, one zero length byte and nothing more
        assert_eq!(payload[10], 0x00);
        assert_eq!(&payload[14..], &[0x00]);
    }

    #[test]
    fn test_long_data_slot_has_no_value() {
        let v = Value::Int(1);
        let params = [
            ExecuteParam::LongData(LongData {
                field_type: FieldType::Blob,
            }),
            ExecuteParam::Value(&v),
        ];
        let payload = build_stmt_execute_packet(1, &params, false, Encoding::Utf8);
        assert_eq!(payload[12], FieldType::Blob as u8);
        assert_eq!(&payload[16..], &1u32.to_le_bytes());
    }

    #[test]
    fn test_text_param_uses_session_encoding() {
        let params = vec![Value::Text("é".to_string())];
        let payload = build_stmt_execute_packet(1, &values(&params), false, Encoding::Latin1);
        assert_eq!(&payload[14..], &[1, 0xE9]);
    }

    #[test]
    fn test_temporal_params_decode_back() {
        let ts = NaiveDate::from_ymd_opt(2021, 11, 5)
            .unwrap()
            .and_hms_micro_opt(6, 7, 8, 9)
            .unwrap();
        let cases = [
            (Value::Timestamp(ts), FieldType::DateTime),
            (Value::Date(ts.date()), FieldType::Date),
            (Value::Time(ts.time()), FieldType::Time),
        ];
        for (value, field_type) in cases {
            let mut writer = PacketWriter::new();
            encode_binary_value(&mut writer, &value, Encoding::Utf8);
            let col = ColumnDef::synthetic("t", field_type, column_flags::BINARY, 63);
            let bytes = writer.into_bytes();
            let mut reader = PacketReader::new(&bytes);
            assert_eq!(read_binary_value(&mut reader, &col).unwrap(), value);
        }
    }

    #[test]
    fn test_value_to_field_type() {
        assert_eq!(value_to_field_type(&Value::Null), FieldType::Null);
        assert_eq!(value_to_field_type(&Value::Bool(true)), FieldType::Tiny);
        assert_eq!(value_to_field_type(&Value::SmallInt(1)), FieldType::Short);
        assert_eq!(value_to_field_type(&Value::Int(1)), FieldType::Long);
        assert_eq!(value_to_field_type(&Value::BigInt(1)), FieldType::LongLong);
        assert_eq!(value_to_field_type(&Value::Double(1.0)), FieldType::Double);
        assert_eq!(value_to_field_type(&Value::Text(String::new())), FieldType::VarString);
        assert_eq!(value_to_field_type(&Value::Bytes(vec![])), FieldType::Blob);
    }
}
