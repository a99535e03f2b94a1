//! Loader for the subset of the RDB file format this server persists and
//! restores: string keys, optional per-key expiry, no compression.
//!
//! Grounded in the same "magic, then metadata/selector opcodes, then
//! size-prefixed records, then a terminator" structure as any RDB reader,
//! scanned with the teacher's buffer-cursor style (bounds-checked `read_*`
//! methods over a position index) rather than a streaming parser
//! combinator, since the whole file is read into memory up front.

use std::path::Path;

use tracing::warn;

use crate::errors::StoreResult;

const MAGIC: &[u8] = b"REDIS0011";

const OP_AUX: u8 = 0xFA;
const OP_RESIZEDB: u8 = 0xFB;
const OP_EXPIRETIME_MS: u8 = 0xFC;
const OP_EXPIRETIME_S: u8 = 0xFD;
const OP_SELECTDB: u8 = 0xFE;
const OP_EOF: u8 = 0xFF;
const TYPE_STRING: u8 = 0x00;

/// One loaded key: (key, value, absolute expiry in ms if any).
pub type LoadedEntry = (Vec<u8>, Vec<u8>, Option<u64>);

struct Cursor<'a> {
    buf: &'a [u8],
    pos: usize,
}

impl<'a> Cursor<'a> {
    fn new(buf: &'a [u8]) -> Self {
        Self { buf, pos: 0 }
    }

    fn read_u8(&mut self) -> Option<u8> {
        let b = *self.buf.get(self.pos)?;
        self.pos += 1;
        Some(b)
    }

    fn read_bytes(&mut self, n: usize) -> Option<&'a [u8]> {
        let end = self.pos.checked_add(n)?;
        let slice = self.buf.get(self.pos..end)?;
        self.pos = end;
        Some(slice)
    }

    /// Two-bit size-prefix encoding: 00 = 6-bit inline, 01 = 14-bit big
    /// endian, 10 = 32-bit big endian, 11 = special encoding (unsupported
    /// here; callers treat this as end-of-support-for-this-file).
    fn read_size(&mut self) -> Option<u64> {
        let first = self.read_u8()?;
        match first >> 6 {
            0b00 => Some((first & 0x3F) as u64),
            0b01 => {
                let second = self.read_u8()?;
                Some((((first & 0x3F) as u64) << 8) | second as u64)
            }
            0b10 => {
                let bytes = self.read_bytes(4)?;
                Some(u32::from_be_bytes(bytes.try_into().unwrap()) as u64)
            }
            _ => None,
        }
    }

    fn read_string(&mut self) -> Option<Vec<u8>> {
        let len = self.read_size()?;
        self.read_bytes(len as usize).map(|b| b.to_vec())
    }
}

fn encode_size(out: &mut Vec<u8>, n: u64) {
    if n <= 0x3F {
        out.push(n as u8);
    } else if n <= 0x3FFF {
        out.push(0b01_000000 | ((n >> 8) as u8));
        out.push((n & 0xFF) as u8);
    } else {
        out.push(0b10_000000);
        out.extend_from_slice(&(n as u32).to_be_bytes());
    }
}

fn encode_string(out: &mut Vec<u8>, bytes: &[u8]) {
    encode_size(out, bytes.len() as u64);
    out.extend_from_slice(bytes);
}

/// Serializes live string entries into the same RDB subset `load` reads
/// back, for the snapshot bulk payload sent to a newly attached follower.
pub fn encode(entries: &[LoadedEntry]) -> Vec<u8> {
    let mut out = MAGIC.to_vec();
    for (key, value, expires_at_ms) in entries {
        if let Some(ms) = expires_at_ms {
            out.push(OP_EXPIRETIME_MS);
            out.extend_from_slice(&ms.to_le_bytes());
        }
        out.push(TYPE_STRING);
        encode_string(&mut out, key);
        encode_string(&mut out, value);
    }
    out.push(OP_EOF);
    out
}

/// Loads the snapshot at `path`. A missing file is not an error: it means
/// the server is starting with an empty keyspace. Already-expired entries
/// (relative to `now_ms`) are silently dropped. An unrecognized record
/// type stops the scan and returns whatever was parsed before it.
pub fn load(path: &Path, now_ms: u64) -> StoreResult<Vec<LoadedEntry>> {
    let bytes = match std::fs::read(path) {
        Ok(bytes) => bytes,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
        Err(e) => return Err(e.into()),
    };

    if bytes.len() < MAGIC.len() || &bytes[..MAGIC.len()] != MAGIC {
        warn!(path = %path.display(), "snapshot file has an unrecognized magic header, ignoring");
        return Ok(Vec::new());
    }

    let mut cursor = Cursor::new(&bytes);
    cursor.pos = MAGIC.len();
    let mut out = Vec::new();

    loop {
        let opcode = match cursor.read_u8() {
            Some(b) => b,
            None => break,
        };

        match opcode {
            OP_EOF => break,
            OP_SELECTDB => {
                if cursor.read_size().is_none() {
                    warn!("truncated SELECTDB record, stopping snapshot load");
                    break;
                }
            }
            OP_RESIZEDB => {
                if cursor.read_size().is_none() || cursor.read_size().is_none() {
                    warn!("truncated RESIZEDB record, stopping snapshot load");
                    break;
                }
            }
            OP_AUX => {
                if cursor.read_string().is_none() || cursor.read_string().is_none() {
                    warn!("truncated AUX record, stopping snapshot load");
                    break;
                }
            }
            OP_EXPIRETIME_MS => {
                let Some(expiry_bytes) = cursor.read_bytes(8) else {
                    warn!("truncated expiry-ms record, stopping snapshot load");
                    break;
                };
                let expires_at_ms = u64::from_le_bytes(expiry_bytes.try_into().unwrap());
                match read_typed_record(&mut cursor) {
                    Some((key, value)) => push_if_live(&mut out, key, value, Some(expires_at_ms), now_ms),
                    None => break,
                }
            }
            OP_EXPIRETIME_S => {
                let Some(expiry_bytes) = cursor.read_bytes(4) else {
                    warn!("truncated expiry-s record, stopping snapshot load");
                    break;
                };
                let expires_at_ms =
                    u32::from_le_bytes(expiry_bytes.try_into().unwrap()) as u64 * 1000;
                match read_typed_record(&mut cursor) {
                    Some((key, value)) => push_if_live(&mut out, key, value, Some(expires_at_ms), now_ms),
                    None => break,
                }
            }
            TYPE_STRING => match read_key_value(&mut cursor) {
                Some((key, value)) => push_if_live(&mut out, key, value, None, now_ms),
                None => break,
            },
            other => {
                warn!(opcode = other, "unsupported record type, stopping snapshot load");
                break;
            }
        }
    }

    Ok(out)
}

fn read_typed_record(cursor: &mut Cursor<'_>) -> Option<(Vec<u8>, Vec<u8>)> {
    match cursor.read_u8() {
        Some(TYPE_STRING) => read_key_value(cursor),
        _ => None,
    }
}

fn read_key_value(cursor: &mut Cursor<'_>) -> Option<(Vec<u8>, Vec<u8>)> {
    let key = cursor.read_string()?;
    let value = cursor.read_string()?;
    Some((key, value))
}

fn push_if_live(
    out: &mut Vec<LoadedEntry>,
    key: Vec<u8>,
    value: Vec<u8>,
    expires_at_ms: Option<u64>,
    now_ms: u64,
) {
    if matches!(expires_at_ms, Some(at) if at <= now_ms) {
        return;
    }
    out.push((key, value, expires_at_ms));
}

#[cfg(test)]
mod tests {
    use super::*;

    fn size_6bit(n: u8) -> Vec<u8> {
        vec![n & 0x3F]
    }

    fn string_record(s: &[u8]) -> Vec<u8> {
        let mut out = size_6bit(s.len() as u8);
        out.extend_from_slice(s);
        out
    }

    #[test]
    fn missing_file_is_empty_not_error() {
        let result = load(Path::new("/nonexistent/path/dump.rdb"), 0).unwrap();
        assert!(result.is_empty());
    }

    #[test]
    fn bad_magic_is_empty() {
        let path = std::env::temp_dir().join("snapshot_test_bad_magic.rdb");
        std::fs::write(&path, b"NOTREDIS").unwrap();
        let result = load(&path, 0).unwrap();
        assert!(result.is_empty());
        std::fs::remove_file(&path).unwrap();
    }

    #[test]
    fn loads_simple_string_without_expiry() {
        let mut file = MAGIC.to_vec();
        file.push(TYPE_STRING);
        file.extend(string_record(b"foo"));
        file.extend(string_record(b"bar"));
        file.push(OP_EOF);

        let path = std::env::temp_dir().join("snapshot_test_simple.rdb");
        std::fs::write(&path, &file).unwrap();
        let entries = load(&path, 0).unwrap();
        std::fs::remove_file(&path).unwrap();

        assert_eq!(entries, vec![(b"foo".to_vec(), b"bar".to_vec(), None)]);
    }

    #[test]
    fn encode_then_load_round_trips() {
        let entries = vec![
            (b"a".to_vec(), b"1".to_vec(), None),
            (b"b".to_vec(), b"2".to_vec(), Some(5_000)),
        ];
        let bytes = encode(&entries);
        let path = std::env::temp_dir().join("snapshot_test_roundtrip.rdb");
        std::fs::write(&path, &bytes).unwrap();
        let loaded = load(&path, 0).unwrap();
        std::fs::remove_file(&path).unwrap();

        assert_eq!(loaded.len(), 2);
        assert!(loaded.contains(&(b"a".to_vec(), b"1".to_vec(), None)));
        assert!(loaded.contains(&(b"b".to_vec(), b"2".to_vec(), Some(5_000))));
    }

    #[test]
    fn drops_already_expired_entries() {
        let mut file = MAGIC.to_vec();
        file.push(OP_EXPIRETIME_MS);
        file.extend_from_slice(&100u64.to_le_bytes());
        file.push(TYPE_STRING);
        file.extend(string_record(b"foo"));
        file.extend(string_record(b"bar"));
        file.push(OP_EOF);

        let path = std::env::temp_dir().join("snapshot_test_expired.rdb");
        std::fs::write(&path, &file).unwrap();
        let entries = load(&path, 1_000).unwrap();
        std::fs::remove_file(&path).unwrap();

        assert!(entries.is_empty());
    }

    #[test]
    fn keeps_future_expiry() {
        let mut file = MAGIC.to_vec();
        file.push(OP_EXPIRETIME_MS);
        file.extend_from_slice(&5_000u64.to_le_bytes());
        file.push(TYPE_STRING);
        file.extend(string_record(b"foo"));
        file.extend(string_record(b"bar"));
        file.push(OP_EOF);

        let path = std::env::temp_dir().join("snapshot_test_future.rdb");
        std::fs::write(&path, &file).unwrap();
        let entries = load(&path, 1_000).unwrap();
        std::fs::remove_file(&path).unwrap();

        assert_eq!(entries, vec![(b"foo".to_vec(), b"bar".to_vec(), Some(5_000))]);
    }

    #[test]
    fn stops_on_unsupported_record_type_but_keeps_prior_entries() {
        let mut file = MAGIC.to_vec();
        file.push(TYPE_STRING);
        file.extend(string_record(b"foo"));
        file.extend(string_record(b"bar"));
        file.push(0x01); // unsupported type byte
        file.push(OP_EOF);

        let path = std::env::temp_dir().join("snapshot_test_unsupported.rdb");
        std::fs::write(&path, &file).unwrap();
        let entries = load(&path, 0).unwrap();
        std::fs::remove_file(&path).unwrap();

        assert_eq!(entries, vec![(b"foo".to_vec(), b"bar".to_vec(), None)]);
    }

    #[test]
    fn skips_aux_and_selectdb_and_resizedb_records() {
        let mut file = MAGIC.to_vec();
        file.push(OP_AUX);
        file.extend(string_record(b"redis-ver"));
        file.extend(string_record(b"7.0.0"));
        file.push(OP_SELECTDB);
        file.extend(size_6bit(0));
        file.push(OP_RESIZEDB);
        file.extend(size_6bit(1));
        file.extend(size_6bit(0));
        file.push(TYPE_STRING);
        file.extend(string_record(b"foo"));
        file.extend(string_record(b"bar"));
        file.push(OP_EOF);

        let path = std::env::temp_dir().join("snapshot_test_aux.rdb");
        std::fs::write(&path, &file).unwrap();
        let entries = load(&path, 0).unwrap();
        std::fs::remove_file(&path).unwrap();

        assert_eq!(entries, vec![(b"foo".to_vec(), b"bar".to_vec(), None)]);
    }
}
