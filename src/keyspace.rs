//! The in-memory data model: strings with expiry and append-only streams.
//!
//! A single `std::sync::Mutex` guards the whole map, matching the "a
//! single coarse lock over the keyspace is acceptable" allowance in
//! spec.md §5 — the same "one lock around a plain collection, touched from
//! many tasks" shape the teacher uses for its `ReplicationState` (guarded
//! there by virtue of being owned by a single task; here several
//! connection tasks share it, so it's wrapped explicitly).

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::{SystemTime, UNIX_EPOCH};

use crate::errors::{StoreError, StoreResult};
use crate::resp::Value;

/// A clock injection point, per spec.md §4.3 ("implementations ... must
/// expose an injection point for tests").
pub type Clock = Arc<dyn Fn() -> u64 + Send + Sync>;

/// The real wall-clock, in milliseconds since the Unix epoch.
pub fn system_clock() -> Clock {
    Arc::new(|| {
        SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .expect("system clock is before the Unix epoch")
            .as_millis() as u64
    })
}

/// A stream entry identifier: `(ms, seq)`, rendered `"ms-seq"`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct EntryId {
    pub ms: u64,
    pub seq: u64,
}

impl EntryId {
    pub const ZERO: EntryId = EntryId { ms: 0, seq: 0 };
    pub const MAX: EntryId = EntryId {
        ms: u64::MAX,
        seq: u64::MAX,
    };

    pub fn render(&self) -> String {
        format!("{}-{}", self.ms, self.seq)
    }
}

impl std::fmt::Display for EntryId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.render())
    }
}

type Fields = Vec<(Vec<u8>, Vec<u8>)>;

enum Entry {
    String {
        bytes: Vec<u8>,
        expires_at_ms: Option<u64>,
    },
    Stream {
        entries: Vec<(EntryId, Fields)>,
    },
}

/// The ID spec accepted by XADD: `*`, `ms-*`, or `ms-seq`.
enum IdSpec {
    Auto,
    AutoSeq(u64),
    Explicit(EntryId),
}

fn parse_id_spec(spec: &str) -> StoreResult<IdSpec> {
    if spec == "*" {
        return Ok(IdSpec::Auto);
    }
    let (ms_str, seq_str) = spec
        .split_once('-')
        .ok_or_else(|| StoreError::user("Invalid stream ID specified as stream command argument"))?;
    let ms: u64 = ms_str
        .parse()
        .map_err(|_| StoreError::user("Invalid stream ID specified as stream command argument"))?;
    if seq_str == "*" {
        return Ok(IdSpec::AutoSeq(ms));
    }
    let seq: u64 = seq_str
        .parse()
        .map_err(|_| StoreError::user("Invalid stream ID specified as stream command argument"))?;
    Ok(IdSpec::Explicit(EntryId { ms, seq }))
}

/// Parses an XRANGE/XREAD boundary ID. `expand_seq` fills in the implicit
/// sequence number for a bare `ms` value: `0` for a start bound, `u64::MAX`
/// for an end bound (spec.md §4.3).
fn parse_range_bound(spec: &str, default_seq: u64) -> StoreResult<EntryId> {
    match spec {
        "-" => Ok(EntryId::ZERO),
        "+" => Ok(EntryId::MAX),
        _ => {
            if let Some((ms_str, seq_str)) = spec.split_once('-') {
                let ms: u64 = ms_str
                    .parse()
                    .map_err(|_| StoreError::user("Invalid stream ID specified as stream command argument"))?;
                let seq: u64 = seq_str.parse().map_err(|_| {
                    StoreError::user("Invalid stream ID specified as stream command argument")
                })?;
                Ok(EntryId { ms, seq })
            } else {
                let ms: u64 = spec
                    .parse()
                    .map_err(|_| StoreError::user("Invalid stream ID specified as stream command argument"))?;
                Ok(EntryId {
                    ms,
                    seq: default_seq,
                })
            }
        }
    }
}

/// The keyspace: a mapping from byte-string keys to tagged value entries.
pub struct Keyspace {
    clock: Clock,
    data: Mutex<HashMap<Vec<u8>, Entry>>,
}

impl Keyspace {
    pub fn new(clock: Clock) -> Self {
        Self {
            clock,
            data: Mutex::new(HashMap::new()),
        }
    }

    pub fn now_ms(&self) -> u64 {
        (self.clock)()
    }

    /// Live string entries, for snapshot production. Streams are not part
    /// of the persisted snapshot format.
    pub fn snapshot_entries(&self) -> Vec<(Vec<u8>, Vec<u8>, Option<u64>)> {
        let now = self.now_ms();
        let data = self.data.lock().unwrap();
        data.iter()
            .filter_map(|(k, entry)| match entry {
                Entry::String {
                    bytes,
                    expires_at_ms,
                } if !is_expired(*expires_at_ms, now) => {
                    Some((k.clone(), bytes.clone(), *expires_at_ms))
                }
                _ => None,
            })
            .collect()
    }

    /// Loads entries produced by the snapshot loader. Callers are expected
    /// to have already filtered expired-at-load entries.
    pub fn load_string(&self, key: Vec<u8>, value: Vec<u8>, expires_at_ms: Option<u64>) {
        let mut data = self.data.lock().unwrap();
        data.insert(
            key,
            Entry::String {
                bytes: value,
                expires_at_ms,
            },
        );
    }

    pub fn set(&self, key: Vec<u8>, value: Vec<u8>, px_ms: Option<u64>) {
        let expires_at_ms = px_ms.map(|px| self.now_ms() + px);
        let mut data = self.data.lock().unwrap();
        data.insert(
            key,
            Entry::String {
                bytes: value,
                expires_at_ms,
            },
        );
    }

    pub fn get(&self, key: &[u8]) -> Option<Vec<u8>> {
        let now = self.now_ms();
        let mut data = self.data.lock().unwrap();
        match data.get(key) {
            Some(Entry::String {
                bytes,
                expires_at_ms,
            }) => {
                if is_expired(*expires_at_ms, now) {
                    data.remove(key);
                    None
                } else {
                    Some(bytes.clone())
                }
            }
            _ => None,
        }
    }

    /// Every live key whose entry is a String, sweeping expired String
    /// entries observed during the scan.
    pub fn keys_all(&self) -> Value {
        let now = self.now_ms();
        let mut data = self.data.lock().unwrap();
        let expired: Vec<Vec<u8>> = data
            .iter()
            .filter_map(|(k, entry)| match entry {
                Entry::String {
                    expires_at_ms, ..
                } if is_expired(*expires_at_ms, now) => Some(k.clone()),
                _ => None,
            })
            .collect();
        for key in &expired {
            data.remove(key);
        }

        let live: Vec<Value> = data
            .iter()
            .filter_map(|(k, entry)| match entry {
                Entry::String { .. } => Some(Value::Bulk(k.clone())),
                Entry::Stream { .. } => None,
            })
            .collect();
        Value::Array(live)
    }

    pub fn type_of(&self, key: &[u8]) -> &'static str {
        let now = self.now_ms();
        let mut data = self.data.lock().unwrap();
        match data.get(key) {
            Some(Entry::String {
                expires_at_ms, ..
            }) => {
                if is_expired(*expires_at_ms, now) {
                    data.remove(key);
                    "none"
                } else {
                    "string"
                }
            }
            Some(Entry::Stream { .. }) => "stream",
            None => "none",
        }
    }

    pub fn xadd(&self, key: &[u8], id_spec: &str, fields: Vec<(Vec<u8>, Vec<u8>)>) -> StoreResult<String> {
        let spec = parse_id_spec(id_spec)?;
        let now = self.now_ms();
        let mut data = self.data.lock().unwrap();

        let entries = match data.entry(key.to_vec()).or_insert_with(|| Entry::Stream {
            entries: Vec::new(),
        }) {
            Entry::Stream { entries } => entries,
            Entry::String { .. } => {
                return Err(StoreError::user("key exists but is not a stream"));
            }
        };

        let top = entries.last().map(|(id, _)| *id);

        let final_id = match spec {
            IdSpec::Auto => {
                let ms = match top {
                    Some(top) => now.max(top.ms),
                    None => now,
                };
                let seq = match top {
                    Some(top) if top.ms == ms => top.seq + 1,
                    _ => 0,
                };
                EntryId { ms, seq }
            }
            IdSpec::AutoSeq(ms) => {
                let seq = match top {
                    Some(top) if top.ms == ms => top.seq + 1,
                    _ => {
                        if ms == 0 {
                            1
                        } else {
                            0
                        }
                    }
                };
                EntryId { ms, seq }
            }
            IdSpec::Explicit(id) => id,
        };

        if final_id == EntryId::ZERO {
            return Err(StoreError::user(
                "The ID specified in XADD must be greater than 0-0",
            ));
        }
        if let Some(top) = top
            && final_id <= top
        {
            return Err(StoreError::user(
                "The ID specified in XADD is equal or smaller than the target stream top item",
            ));
        }

        entries.push((final_id, fields));
        Ok(final_id.render())
    }

    pub fn xrange(&self, key: &[u8], start: &str, end: &str) -> StoreResult<Option<Value>> {
        let data = self.data.lock().unwrap();
        let entries = match data.get(key) {
            Some(Entry::Stream { entries }) => entries,
            Some(Entry::String { .. }) => return Ok(None),
            None => return Ok(None),
        };

        let start_id = parse_range_bound(start, 0)?;
        let end_id = parse_range_bound(end, u64::MAX)?;

        let items: Vec<Value> = entries
            .iter()
            .filter(|(id, _)| *id >= start_id && *id <= end_id)
            .map(|(id, fields)| encode_stream_entry(*id, fields))
            .collect();

        Ok(Some(Value::Array(items)))
    }

    pub fn xread(&self, keys: &[Vec<u8>], last_ids: &[EntryId]) -> Option<Value> {
        let data = self.data.lock().unwrap();
        let mut outer = Vec::new();

        for (key, last_id) in keys.iter().zip(last_ids.iter()) {
            let entries = match data.get(key) {
                Some(Entry::Stream { entries }) => entries,
                _ => continue,
            };

            let matched: Vec<Value> = entries
                .iter()
                .filter(|(id, _)| id > last_id)
                .map(|(id, fields)| encode_stream_entry(*id, fields))
                .collect();

            if !matched.is_empty() {
                outer.push(Value::Array(vec![Value::Bulk(key.clone()), Value::Array(matched)]));
            }
        }

        if outer.is_empty() {
            None
        } else {
            Some(Value::Array(outer))
        }
    }
}

fn is_expired(expires_at_ms: Option<u64>, now: u64) -> bool {
    matches!(expires_at_ms, Some(at) if now >= at)
}

fn encode_stream_entry(id: EntryId, fields: &Fields) -> Value {
    let mut flat = Vec::with_capacity(fields.len() * 2);
    for (k, v) in fields {
        flat.push(Value::Bulk(k.clone()));
        flat.push(Value::Bulk(v.clone()));
    }
    Value::Array(vec![Value::bulk_from_str(id.render()), Value::Array(flat)])
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU64, Ordering};

    fn fake_clock() -> (Clock, Arc<AtomicU64>) {
        let now = Arc::new(AtomicU64::new(1_000));
        let handle = now.clone();
        let clock: Clock = Arc::new(move || handle.load(Ordering::SeqCst));
        (clock, now)
    }

    #[test]
    fn set_then_get_round_trips() {
        let (clock, _) = fake_clock();
        let ks = Keyspace::new(clock);
        ks.set(b"foo".to_vec(), b"bar".to_vec(), None);
        assert_eq!(ks.get(b"foo"), Some(b"bar".to_vec()));
        assert_eq!(ks.type_of(b"foo"), "string");
    }

    #[test]
    fn px_expiry_makes_key_absent() {
        let (clock, now) = fake_clock();
        let ks = Keyspace::new(clock);
        ks.set(b"foo".to_vec(), b"bar".to_vec(), Some(100));
        assert_eq!(ks.get(b"foo"), Some(b"bar".to_vec()));
        now.fetch_add(150, Ordering::SeqCst);
        assert_eq!(ks.get(b"foo"), None);
        if let Value::Array(items) = ks.keys_all() {
            assert!(items.is_empty());
        } else {
            panic!("expected array");
        }
    }

    #[test]
    fn xadd_rejects_zero_zero() {
        let (clock, _) = fake_clock();
        let ks = Keyspace::new(clock);
        let err = ks.xadd(b"s", "0-0", vec![]).unwrap_err();
        assert_eq!(
            err.to_string(),
            "The ID specified in XADD must be greater than 0-0"
        );
    }

    #[test]
    fn xadd_rejects_non_increasing_id() {
        let (clock, _) = fake_clock();
        let ks = Keyspace::new(clock);
        ks.xadd(b"s", "1-1", vec![(b"field".to_vec(), b"val".to_vec())])
            .unwrap();
        let err = ks.xadd(b"s", "1-1", vec![(b"field".to_vec(), b"val".to_vec())]).unwrap_err();
        assert!(err.to_string().contains("equal or smaller"));
    }

    #[test]
    fn xadd_auto_id_uses_now_and_seq_zero_for_new_ms() {
        let (clock, _) = fake_clock();
        let ks = Keyspace::new(clock);
        let id = ks.xadd(b"s", "*", vec![]).unwrap();
        assert_eq!(id, "1000-0");
    }

    #[test]
    fn xadd_type_mismatch() {
        let (clock, _) = fake_clock();
        let ks = Keyspace::new(clock);
        ks.set(b"k".to_vec(), b"v".to_vec(), None);
        let err = ks.xadd(b"k", "1-1", vec![]).unwrap_err();
        assert_eq!(err.to_string(), "key exists but is not a stream");
    }

    #[test]
    fn xrange_is_inclusive_and_ordered() {
        let (clock, _) = fake_clock();
        let ks = Keyspace::new(clock);
        ks.xadd(b"s", "1-1", vec![(b"a".to_vec(), b"1".to_vec())]).unwrap();
        ks.xadd(b"s", "1-2", vec![(b"b".to_vec(), b"2".to_vec())]).unwrap();

        let result = ks.xrange(b"s", "-", "+").unwrap().unwrap();
        match result {
            Value::Array(items) => assert_eq!(items.len(), 2),
            _ => panic!("expected array"),
        }
    }

    #[test]
    fn xrange_unknown_key_is_none() {
        let (clock, _) = fake_clock();
        let ks = Keyspace::new(clock);
        assert!(ks.xrange(b"nope", "-", "+").unwrap().is_none());
    }

    #[test]
    fn xread_only_returns_newer_entries() {
        let (clock, _) = fake_clock();
        let ks = Keyspace::new(clock);
        ks.xadd(b"s", "1-1", vec![(b"a".to_vec(), b"1".to_vec())]).unwrap();
        ks.xadd(b"s", "1-2", vec![(b"b".to_vec(), b"2".to_vec())]).unwrap();

        let result = ks.xread(&[b"s".to_vec()], &[EntryId { ms: 1, seq: 1 }]);
        match result {
            Some(Value::Array(outer)) => assert_eq!(outer.len(), 1),
            _ => panic!("expected one stream with newer entries"),
        }

        assert!(ks.xread(&[b"s".to_vec()], &[EntryId { ms: 1, seq: 2 }]).is_none());
    }
}
