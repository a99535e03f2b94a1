//! RESP (REdis Serialization Protocol) wire codec.
//!
//! Follows the teacher's buffer-cursor idiom (a struct tracking `position`
//! over a borrowed byte slice, exposing typed `read_*` methods that each
//! bounds-check before advancing) but specialized to RESP framing instead
//! of PostgreSQL's binary replication messages.
//!
//! The decoder is byte-safe: only frame *headers* (array/bulk-string
//! length lines) are scanned for a `\r\n` terminator. Bulk-string payloads
//! are sliced by their declared length, so embedded `\r`/`\n` bytes never
//! confuse the parser.

use crate::errors::{StoreError, StoreResult};

/// A decoded RESP value, used for building replies. Mirrors the RESP type
/// set named in spec.md: simple string, error, integer, bulk string
/// (including the null bulk), and arrays of frames.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Value {
    Simple(String),
    Error(String),
    Integer(i64),
    Bulk(Vec<u8>),
    NullBulk,
    Array(Vec<Value>),
    NullArray,
}

impl Value {
    pub fn bulk_from_str(s: impl Into<String>) -> Self {
        Value::Bulk(s.into().into_bytes())
    }

    /// Encodes this value to its RESP wire representation.
    pub fn encode(&self) -> Vec<u8> {
        match self {
            Value::Simple(s) => encode_simple_string(s),
            Value::Error(s) => encode_error(s),
            Value::Integer(n) => encode_integer(*n),
            Value::Bulk(bytes) => encode_bulk_string(Some(bytes)),
            Value::NullBulk => encode_bulk_string(None),
            Value::NullArray => b"*-1\r\n".to_vec(),
            Value::Array(items) => {
                let mut out = format!("*{}\r\n", items.len()).into_bytes();
                for item in items {
                    out.extend_from_slice(&item.encode());
                }
                out
            }
        }
    }
}

pub fn encode_simple_string(s: &str) -> Vec<u8> {
    format!("+{s}\r\n").into_bytes()
}

pub fn encode_error(s: &str) -> Vec<u8> {
    format!("-{s}\r\n").into_bytes()
}

pub fn encode_integer(n: i64) -> Vec<u8> {
    format!(":{n}\r\n").into_bytes()
}

/// `$len\r\n<bytes>\r\n`, or `$-1\r\n` for `None`.
pub fn encode_bulk_string(data: Option<&[u8]>) -> Vec<u8> {
    match data {
        None => b"$-1\r\n".to_vec(),
        Some(bytes) => {
            let mut out = format!("${}\r\n", bytes.len()).into_bytes();
            out.extend_from_slice(bytes);
            out.extend_from_slice(b"\r\n");
            out
        }
    }
}

/// The snapshot-transfer framing: `$len\r\n<bytes>` with **no** trailing
/// CRLF. Structurally distinct from a RESP bulk string (spec.md §4.1 /
/// §9) — kept as its own function rather than a `Value` variant so it can
/// never accidentally be CRLF-terminated by the generic encoder.
pub fn encode_bulk_payload(data: &[u8]) -> Vec<u8> {
    let mut out = format!("${}\r\n", data.len()).into_bytes();
    out.extend_from_slice(data);
    out
}

/// Cursor over a borrowed byte buffer used while decoding a single
/// top-level RESP array.
struct Cursor<'a> {
    buf: &'a [u8],
    pos: usize,
}

impl<'a> Cursor<'a> {
    fn new(buf: &'a [u8]) -> Self {
        Self { buf, pos: 0 }
    }

    fn remaining(&self) -> &'a [u8] {
        &self.buf[self.pos..]
    }

    /// Scans forward from the current position for a `\r\n` terminator and
    /// returns the line's bytes (excluding the terminator), advancing past
    /// it. Returns `None` if no terminator is present yet (need more data)
    /// — this never happens mid bulk-string payload, only on header lines.
    fn read_line(&mut self) -> Option<&'a [u8]> {
        let rest = self.remaining();
        let mut i = 0;
        while i + 1 < rest.len() {
            if rest[i] == b'\r' && rest[i + 1] == b'\n' {
                let line = &rest[..i];
                self.pos += i + 2;
                return Some(line);
            }
            i += 1;
        }
        None
    }

    fn read_exact(&mut self, n: usize) -> Option<&'a [u8]> {
        let rest = self.remaining();
        if rest.len() < n {
            return None;
        }
        let out = &rest[..n];
        self.pos += n;
        Some(out)
    }

    fn expect_crlf(&mut self) -> StoreResult<()> {
        let rest = self.remaining();
        if rest.len() < 2 {
            return Err(StoreError::protocol("truncated bulk string terminator"));
        }
        if &rest[..2] != b"\r\n" {
            return Err(StoreError::protocol("expected CRLF after bulk string data"));
        }
        self.pos += 2;
        Ok(())
    }
}

fn parse_length(line: &[u8], what: &str) -> StoreResult<i64> {
    let text = std::str::from_utf8(line)
        .map_err(|_| StoreError::protocol(format!("non-UTF8 {what} length")))?;
    text.parse::<i64>()
        .map_err(|_| StoreError::protocol(format!("invalid {what} length: {text:?}")))
}

/// Attempts to decode one complete top-level command (an array of bulk
/// strings) from `buf`.
///
/// Returns:
/// - `Ok(Some((args, consumed)))` on a complete frame.
/// - `Ok(None)` if `buf` doesn't yet contain a complete frame.
/// - `Err(StoreError::Protocol { .. })` on malformed framing.
pub fn decode_command(buf: &[u8]) -> StoreResult<Option<(Vec<Vec<u8>>, usize)>> {
    if buf.is_empty() {
        return Ok(None);
    }
    if buf[0] != b'*' {
        return Err(StoreError::protocol(format!(
            "expected array header '*', got {:?}",
            buf[0] as char
        )));
    }

    let mut cursor = Cursor::new(buf);
    cursor.pos = 1; // consumed '*'

    let count_line = match cursor.read_line() {
        Some(line) => line,
        None => return Ok(None),
    };
    let count = parse_length(count_line, "array")?;
    if count < 0 {
        return Err(StoreError::protocol("negative array length"));
    }

    let mut args = Vec::with_capacity(count as usize);
    for _ in 0..count {
        let header_start = cursor.pos;
        let header_line = match cursor.read_line() {
            Some(line) => line,
            None => return Ok(None),
        };
        if header_line.first() != Some(&b'$') {
            return Err(StoreError::protocol(format!(
                "expected bulk string header '$', got {:?}",
                buf.get(header_start).map(|b| *b as char)
            )));
        }
        let len = parse_length(&header_line[1..], "bulk string")?;
        if len < 0 {
            return Err(StoreError::protocol("negative bulk string length"));
        }
        let len = len as usize;

        let data = match cursor.read_exact(len) {
            Some(data) => data.to_vec(),
            None => return Ok(None),
        };
        // `expect_crlf` needs the two trailing bytes to be present; if
        // they're not, this is "need more data", not malformed framing.
        if cursor.remaining().len() < 2 {
            return Ok(None);
        }
        cursor.expect_crlf()?;

        args.push(data);
    }

    Ok(Some((args, cursor.pos)))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn encodes_simple_string() {
        assert_eq!(encode_simple_string("PONG"), b"+PONG\r\n");
    }

    #[test]
    fn encodes_error() {
        assert_eq!(encode_error("ERR bad thing"), b"-ERR bad thing\r\n");
    }

    #[test]
    fn encodes_integer() {
        assert_eq!(encode_integer(42), b":42\r\n");
    }

    #[test]
    fn encodes_bulk_string_and_null() {
        assert_eq!(encode_bulk_string(Some(b"bar")), b"$3\r\nbar\r\n");
        assert_eq!(encode_bulk_string(None), b"$-1\r\n");
    }

    #[test]
    fn bulk_payload_has_no_trailing_crlf() {
        let encoded = encode_bulk_payload(b"hello");
        assert_eq!(encoded, b"$5\r\nhello");
        assert!(!encoded.ends_with(b"\r\n"));
    }

    #[test]
    fn round_trips_ping() {
        let encoded = Value::Array(vec![Value::bulk_from_str("PING")]).encode();
        let (args, consumed) = decode_command(&encoded).unwrap().unwrap();
        assert_eq!(consumed, encoded.len());
        assert_eq!(args, vec![b"PING".to_vec()]);
    }

    #[test]
    fn round_trips_set_with_binary_payload() {
        let value = vec![0u8, b'\r', b'\n', 1, 2, 255];
        let encoded = Value::Array(vec![
            Value::bulk_from_str("SET"),
            Value::bulk_from_str("k"),
            Value::Bulk(value.clone()),
        ])
        .encode();
        let (args, consumed) = decode_command(&encoded).unwrap().unwrap();
        assert_eq!(consumed, encoded.len());
        assert_eq!(args, vec![b"SET".to_vec(), b"k".to_vec(), value]);
    }

    #[test]
    fn incomplete_frame_needs_more_bytes() {
        let full = Value::Array(vec![Value::bulk_from_str("PING")]).encode();
        for cut in 1..full.len() {
            assert_eq!(decode_command(&full[..cut]).unwrap(), None);
        }
    }

    #[test]
    fn rejects_negative_bulk_length() {
        let err = decode_command(b"*1\r\n$-5\r\n").unwrap_err();
        assert!(err.is_fatal());
    }

    #[test]
    fn rejects_malformed_array_header() {
        let err = decode_command(b"hello\r\n").unwrap_err();
        assert!(err.is_fatal());
    }

    #[test]
    fn decodes_two_frames_back_to_back() {
        let mut buf = Value::Array(vec![Value::bulk_from_str("PING")]).encode();
        let second = Value::Array(vec![Value::bulk_from_str("PING")]).encode();
        buf.extend_from_slice(&second);

        let (_, consumed1) = decode_command(&buf).unwrap().unwrap();
        let (_, consumed2) = decode_command(&buf[consumed1..]).unwrap().unwrap();
        assert_eq!(consumed1 + consumed2, buf.len());
    }
}
