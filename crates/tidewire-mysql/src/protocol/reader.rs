//! Cursor over a packet payload.
//!
//! Every read is bounds-checked; running off the end of the payload is a
//! [`ProtocolError`](tidewire_core::ProtocolError), which callers treat as
//! fatal for the connection.

use crate::protocol::{EofPacket, ErrPacket, OkPacket};
use tidewire_core::{Error, ProtocolError, Result};

/// A reader for MySQL protocol data.
#[derive(Debug, Clone)]
pub struct PacketReader<'a> {
    data: &'a [u8],
    pos: usize,
}

/// Leading byte of a length-encoded field that denotes SQL NULL.
pub const NULL_MARKER: u8 = 0xFB;

impl<'a> PacketReader<'a> {
    /// Create a new reader from a byte slice.
    pub fn new(data: &'a [u8]) -> Self {
        Self { data, pos: 0 }
    }

    /// Current offset into the payload.
    pub fn position(&self) -> usize {
        self.pos
    }

    /// Get remaining bytes in the buffer.
    pub fn remaining(&self) -> usize {
        self.data.len().saturating_sub(self.pos)
    }

    /// Check if we've reached the end of the data.
    pub fn is_empty(&self) -> bool {
        self.pos >= self.data.len()
    }

    /// Peek at the next byte without advancing.
    pub fn peek(&self) -> Option<u8> {
        self.data.get(self.pos).copied()
    }

    fn short(&self, what: &str, needed: usize) -> Error {
        Error::Protocol(ProtocolError {
            message: format!(
                "malformed packet: {} needs {} bytes at offset {}, {} left",
                what,
                needed,
                self.pos,
                self.remaining()
            ),
            raw_data: Some(self.data.iter().take(64).copied().collect()),
            source: None,
        })
    }

    fn take<const N: usize>(&mut self, what: &str) -> Result<[u8; N]> {
        let data = self.data;
        let chunk = data
            .get(self.pos..self.pos + N)
            .ok_or_else(|| self.short(what, N))?;
        self.pos += N;
        let mut out = [0u8; N];
        out.copy_from_slice(chunk);
        Ok(out)
    }

    /// Read a single byte.
    pub fn read_u8(&mut self) -> Result<u8> {
        self.take::<1>("u8").map(|b| b[0])
    }

    /// Read a u16 (little-endian).
    pub fn read_u16_le(&mut self) -> Result<u16> {
        self.take::<2>("u16").map(u16::from_le_bytes)
    }

    /// Read a u24 (little-endian, 3 bytes).
    pub fn read_u24_le(&mut self) -> Result<u32> {
        self.take::<3>("u24")
            .map(|b| u32::from(b[0]) | (u32::from(b[1]) << 8) | (u32::from(b[2]) << 16))
    }

    /// Read a u32 (little-endian).
    pub fn read_u32_le(&mut self) -> Result<u32> {
        self.take::<4>("u32").map(u32::from_le_bytes)
    }

    /// Read a u64 (little-endian).
    pub fn read_u64_le(&mut self) -> Result<u64> {
        self.take::<8>("u64").map(u64::from_le_bytes)
    }

    /// Read a length-encoded integer.
    ///
    /// - 0x00-0xFA: 1-byte value
    /// - 0xFC: 2-byte value follows
    /// - 0xFD: 3-byte value follows
    /// - 0xFE: 8-byte value follows
    ///
    /// Returns `None` for the 0xFB NULL marker.
    pub fn read_lenenc_int(&mut self) -> Result<Option<u64>> {
        let first = self.read_u8()?;
        match first {
            0x00..=0xFA => Ok(Some(u64::from(first))),
            NULL_MARKER => Ok(None),
            0xFC => self.read_u16_le().map(|v| Some(u64::from(v))),
            0xFD => self.read_u24_le().map(|v| Some(u64::from(v))),
            0xFE => self.read_u64_le().map(Some),
            0xFF => Err(self.short("length-encoded integer (0xFF prefix)", 1)),
        }
    }

    /// Read a length-encoded integer that must not be NULL.
    pub fn read_lenenc_len(&mut self) -> Result<usize> {
        match self.read_lenenc_int()? {
            Some(len) => usize::try_from(len).map_err(|_| self.short("length", usize::MAX)),
            None => Err(self.short("non-null length", 1)),
        }
    }

    /// Read a length-encoded field, `None` meaning SQL NULL.
    pub fn read_lenenc_field(&mut self) -> Result<Option<&'a [u8]>> {
        if self.peek() == Some(NULL_MARKER) {
            self.pos += 1;
            return Ok(None);
        }
        let len = self.read_lenenc_len()?;
        self.read_bytes(len).map(Some)
    }

    /// Read a length-encoded byte slice.
    pub fn read_lenenc_bytes(&mut self) -> Result<&'a [u8]> {
        let len = self.read_lenenc_len()?;
        self.read_bytes(len)
    }

    /// Read a length-encoded string (metadata is always UTF-8 on the wire).
    pub fn read_lenenc_string(&mut self) -> Result<String> {
        self.read_lenenc_bytes()
            .map(|b| String::from_utf8_lossy(b).into_owned())
    }

    /// Read a null-terminated string. A missing terminator ends at the payload end.
    pub fn read_null_string(&mut self) -> Result<String> {
        let rest = &self.data[self.pos.min(self.data.len())..];
        let len = rest.iter().position(|&b| b == 0).unwrap_or(rest.len());
        let s = String::from_utf8_lossy(&rest[..len]).into_owned();
        self.pos += (len + 1).min(rest.len());
        Ok(s)
    }

    /// Read a fixed-length string.
    pub fn read_string(&mut self, len: usize) -> Result<String> {
        self.read_bytes(len)
            .map(|b| String::from_utf8_lossy(b).into_owned())
    }

    /// Read remaining data as a string.
    pub fn read_rest_string(&mut self) -> String {
        String::from_utf8_lossy(self.read_rest()).into_owned()
    }

    /// Read a fixed number of bytes.
    pub fn read_bytes(&mut self, len: usize) -> Result<&'a [u8]> {
        if self.remaining() < len {
            return Err(self.short("byte run", len));
        }
        let bytes = &self.data[self.pos..self.pos + len];
        self.pos += len;
        Ok(bytes)
    }

    /// Read remaining bytes.
    pub fn read_rest(&mut self) -> &'a [u8] {
        let rest = &self.data[self.pos.min(self.data.len())..];
        self.pos = self.data.len();
        rest
    }

    /// Skip a number of bytes.
    pub fn skip(&mut self, n: usize) -> Result<()> {
        self.read_bytes(n).map(|_| ())
    }

    /// Parse an OK packet (leading 0x00 or 0xFE marker optional).
    pub fn parse_ok_packet(&mut self) -> Result<OkPacket> {
        if matches!(self.peek(), Some(0x00 | 0xFE)) {
            self.pos += 1;
        }

        let affected_rows = self.read_lenenc_int()?.unwrap_or(0);
        let last_insert_id = self.read_lenenc_int()?.unwrap_or(0);
        let status_flags = self.read_u16_le()?;
        let warnings = self.read_u16_le()?;
        let info = self.read_rest_string();

        Ok(OkPacket {
            affected_rows,
            last_insert_id,
            status_flags,
            warnings,
            info,
        })
    }

    /// Parse an ERR packet (leading 0xFF marker optional).
    pub fn parse_err_packet(&mut self) -> Result<ErrPacket> {
        if self.peek() == Some(0xFF) {
            self.pos += 1;
        }

        let error_code = self.read_u16_le()?;
        let sql_state = if self.peek() == Some(b'#') {
            self.pos += 1;
            self.read_string(5)?
        } else {
            String::new()
        };
        let error_message = self.read_rest_string();

        Ok(ErrPacket {
            error_code,
            sql_state,
            error_message,
        })
    }

    /// Parse a classic EOF packet (leading 0xFE marker optional).
    pub fn parse_eof_packet(&mut self) -> Result<EofPacket> {
        if self.peek() == Some(0xFE) {
            self.pos += 1;
        }

        let warnings = self.read_u16_le()?;
        let status_flags = self.read_u16_le()?;

        Ok(EofPacket {
            warnings,
            status_flags,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_fixed_width_reads() {
        let mut reader = PacketReader::new(&[0x42, 0x34, 0x12, 0x56, 0x34, 0x12]);
        assert_eq!(reader.read_u8().unwrap(), 0x42);
        assert_eq!(reader.read_u16_le().unwrap(), 0x1234);
        assert_eq!(reader.read_u24_le().unwrap(), 0x0012_3456);
        assert!(reader.is_empty());
        assert!(reader.read_u8().is_err());
    }

    #[test]
    fn test_short_read_is_protocol_error() {
        let mut reader = PacketReader::new(&[0x01, 0x02, 0x03]);
        let err = reader.read_u32_le().unwrap_err();
        assert!(matches!(err, Error::Protocol(_)));
        // failed reads do not advance
        assert_eq!(reader.position(), 0);
    }

    #[test]
    fn test_read_lenenc_int() {
        let mut reader = PacketReader::new(&[0x42]);
        assert_eq!(reader.read_lenenc_int().unwrap(), Some(0x42));

        let mut reader = PacketReader::new(&[0xFC, 0x34, 0x12]);
        assert_eq!(reader.read_lenenc_int().unwrap(), Some(0x1234));

        let mut reader = PacketReader::new(&[0xFD, 0x56, 0x34, 0x12]);
        assert_eq!(reader.read_lenenc_int().unwrap(), Some(0x0012_3456));

        let mut reader = PacketReader::new(&[0xFE, 0x01, 0x02, 0x03, 0x04, 0x05, 0x06, 0x07, 0x08]);
        assert_eq!(
            reader.read_lenenc_int().unwrap(),
            Some(0x0807_0605_0403_0201)
        );

        let mut reader = PacketReader::new(&[0xFB]);
        assert_eq!(reader.read_lenenc_int().unwrap(), None);

        let mut reader = PacketReader::new(&[0xFC, 0x34]);
        assert!(reader.read_lenenc_int().is_err());
    }

    #[test]
    fn test_lenenc_field_null_vs_empty() {
        let mut reader = PacketReader::new(&[0xFB, 0x00, 0x02, b'o', b'k']);
        assert_eq!(reader.read_lenenc_field().unwrap(), None);
        assert_eq!(reader.read_lenenc_field().unwrap(), Some(&b""[..]));
        assert_eq!(reader.read_lenenc_field().unwrap(), Some(&b"ok"[..]));
        assert!(reader.read_lenenc_field().is_err());
    }

    #[test]
    fn test_lenenc_field_length_past_end() {
        let mut reader = PacketReader::new(&[0x05, b'a', b'b']);
        assert!(matches!(
            reader.read_lenenc_field(),
            Err(Error::Protocol(_))
        ));
    }

    #[test]
    fn test_read_null_string() {
        let mut reader = PacketReader::new(b"hello\0world");
        assert_eq!(reader.read_null_string().unwrap(), "hello");
        assert_eq!(reader.read_null_string().unwrap(), "world");
        assert!(reader.is_empty());
    }

    #[test]
    fn test_parse_ok_packet() {
        let data = [0x00, 0x01, 0x2A, 0x02, 0x00, 0x00, 0x00];
        let ok = PacketReader::new(&data).parse_ok_packet().unwrap();
        assert_eq!(ok.affected_rows, 1);
        assert_eq!(ok.last_insert_id, 42);
        assert_eq!(ok.status_flags, 2);
        assert_eq!(ok.warnings, 0);
        assert!(ok.info.is_empty());
    }

    #[test]
    fn test_parse_ok_packet_with_eof_header() {
        let data = [0xFE, 0x00, 0x00, 0x22, 0x00, 0x01, 0x00];
        let ok = PacketReader::new(&data).parse_ok_packet().unwrap();
        assert_eq!(ok.status_flags, 0x22);
        assert_eq!(ok.warnings, 1);
    }

    #[test]
    fn test_parse_err_packet() {
        let mut data = vec![0xFF, 0x15, 0x04, b'#'];
        data.extend_from_slice(b"28000");
        data.extend_from_slice(b"Access denied");
        let err = PacketReader::new(&data).parse_err_packet().unwrap();
        assert_eq!(err.error_code, 1045);
        assert_eq!(err.sql_state, "28000");
        assert_eq!(err.error_message, "Access denied");
    }

    #[test]
    fn test_parse_eof_packet() {
        let data = [0xFE, 0x00, 0x00, 0x02, 0x00];
        let eof = PacketReader::new(&data).parse_eof_packet().unwrap();
        assert_eq!(eof.warnings, 0);
        assert_eq!(eof.status_flags, 2);
    }
}
