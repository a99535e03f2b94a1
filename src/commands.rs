//! Command dispatch: turns decoded RESP arguments into a reply `Value`
//! plus, for write commands, the raw bytes to propagate to followers.

use crate::config::ServerConfig;
use crate::errors::{StoreError, StoreResult};
use crate::keyspace::{EntryId, Keyspace};
use crate::replication::Replication;
use crate::resp::Value;

fn to_upper_ascii(bytes: &[u8]) -> String {
    String::from_utf8_lossy(bytes).to_ascii_uppercase()
}

fn arg_str(bytes: &[u8]) -> StoreResult<&str> {
    std::str::from_utf8(bytes).map_err(|_| StoreError::protocol("non-UTF8 argument"))
}

/// Dispatches one decoded command. `is_follower_link` marks a connection
/// that has completed a PSYNC handshake and is therefore a follower, not a
/// regular client — REPLCONF/PSYNC only make sense from such a peer, and a
/// follower link should never itself be told to attach as a follower.
pub struct Dispatcher<'a> {
    pub keyspace: &'a Keyspace,
    pub config: &'a ServerConfig,
    pub replication: &'a Replication,
}

/// The outcome of dispatching one command.
pub enum Outcome {
    /// A normal reply to send back to the client.
    Reply(Value),
    /// This connection just completed PSYNC and should switch into
    /// follower-link mode: send `reply`, then the snapshot bulk payload.
    BecomeFollower { reply: Value, snapshot: Vec<u8> },
    /// REPLCONF GETACK was received; the reply carries the offset that was
    /// current *before* this frame was counted.
    Ack(Value),
    /// `REPLCONF ACK <n>` — noted, but per protocol elicits no reply.
    NoReply,
}

impl<'a> Dispatcher<'a> {
    pub fn dispatch(&self, args: &[Vec<u8>], is_follower_link: bool) -> StoreResult<Outcome> {
        let verb = to_upper_ascii(&args[0]);

        let reply = match verb.as_str() {
            "PING" => Value::Simple("PONG".to_string()),
            "ECHO" => Value::Bulk(args.get(1).cloned().unwrap_or_default()),
            "GET" => self.get(args)?,
            "SET" => return self.set(args),
            "KEYS" => self.keys(args)?,
            "TYPE" => self.type_of(args)?,
            "CONFIG" => self.config_get(args)?,
            "INFO" => self.info(args)?,
            "XADD" => self.xadd(args)?,
            "XRANGE" => self.xrange(args)?,
            "XREAD" => self.xread(args)?,
            "REPLCONF" => return self.replconf(args),
            "PSYNC" => return self.psync(args, is_follower_link),
            _ => return Err(StoreError::UnknownCommand),
        };

        Ok(Outcome::Reply(reply))
    }

    fn get(&self, args: &[Vec<u8>]) -> StoreResult<Value> {
        let key = args
            .get(1)
            .ok_or_else(|| StoreError::user("wrong number of arguments for 'get' command"))?;
        Ok(match self.keyspace.get(key) {
            Some(bytes) => Value::Bulk(bytes),
            None => Value::NullBulk,
        })
    }

    fn set(&self, args: &[Vec<u8>]) -> StoreResult<Outcome> {
        if args.len() < 3 {
            return Err(StoreError::user("wrong number of arguments for 'set' command"));
        }
        let key = args[1].clone();
        let value = args[2].clone();

        let mut px_ms = None;
        let mut i = 3;
        while i < args.len() {
            let opt = to_upper_ascii(&args[i]);
            match opt.as_str() {
                "PX" => {
                    let raw = args
                        .get(i + 1)
                        .ok_or_else(|| StoreError::user("syntax error"))?;
                    let parsed: i64 = arg_str(raw)?
                        .parse()
                        .map_err(|_| StoreError::user("PX value must be an integer"))?;
                    px_ms = Some(parsed as u64);
                    i += 2;
                }
                _ => return Err(StoreError::user("syntax error")),
            }
        }

        self.keyspace.set(key, value, px_ms);
        Ok(Outcome::Reply(Value::Simple("OK".to_string())))
    }

    fn keys(&self, args: &[Vec<u8>]) -> StoreResult<Value> {
        let pattern = args
            .get(1)
            .ok_or_else(|| StoreError::user("wrong number of arguments for 'keys' command"))?;
        if pattern.as_slice() != b"*" {
            return Err(StoreError::user("KEYS only supports the '*' pattern"));
        }
        Ok(self.keyspace.keys_all())
    }

    fn type_of(&self, args: &[Vec<u8>]) -> StoreResult<Value> {
        let key = args
            .get(1)
            .ok_or_else(|| StoreError::user("wrong number of arguments for 'type' command"))?;
        Ok(Value::Simple(self.keyspace.type_of(key).to_string()))
    }

    fn config_get(&self, args: &[Vec<u8>]) -> StoreResult<Value> {
        let sub = args
            .get(1)
            .map(|b| to_upper_ascii(b))
            .ok_or_else(|| StoreError::user("wrong number of arguments for 'config' command"))?;
        if sub != "GET" {
            return Err(StoreError::user("unsupported CONFIG subcommand"));
        }
        let param = args
            .get(2)
            .ok_or_else(|| StoreError::user("wrong number of arguments for 'config|get' command"))?;
        let param = arg_str(param)?;
        Ok(match self.config.config_get(param) {
            Some(value) => Value::Array(vec![Value::bulk_from_str(param), Value::bulk_from_str(value)]),
            None => Value::Array(vec![]),
        })
    }

    fn info(&self, args: &[Vec<u8>]) -> StoreResult<Value> {
        let section = args.get(1).map(|b| to_upper_ascii(b)).unwrap_or_default();
        if !section.is_empty() && section != "REPLICATION" {
            return Ok(Value::Bulk(Vec::new()));
        }
        Ok(Value::Bulk(self.replication.info_replication().into_bytes()))
    }

    fn xadd(&self, args: &[Vec<u8>]) -> StoreResult<Value> {
        if args.len() < 5 || (args.len() - 3) % 2 != 0 {
            return Err(StoreError::user("wrong number of arguments for 'xadd' command"));
        }
        let key = &args[1];
        let id_spec = arg_str(&args[2])?;
        let mut fields = Vec::new();
        let mut i = 3;
        while i + 1 < args.len() {
            fields.push((args[i].clone(), args[i + 1].clone()));
            i += 2;
        }
        let id = self.keyspace.xadd(key, id_spec, fields)?;
        Ok(Value::bulk_from_str(id))
    }

    fn xrange(&self, args: &[Vec<u8>]) -> StoreResult<Value> {
        if args.len() != 4 {
            return Err(StoreError::user("wrong number of arguments for 'xrange' command"));
        }
        let key = &args[1];
        let start = arg_str(&args[2])?;
        let end = arg_str(&args[3])?;
        Ok(match self.keyspace.xrange(key, start, end)? {
            Some(value) => value,
            None => Value::NullBulk,
        })
    }

    fn xread(&self, args: &[Vec<u8>]) -> StoreResult<Value> {
        let streams_at = args
            .iter()
            .position(|a| to_upper_ascii(a) == "STREAMS")
            .ok_or_else(|| StoreError::user("syntax error"))?;
        let rest = &args[streams_at + 1..];
        if rest.is_empty() || rest.len() % 2 != 0 {
            return Err(StoreError::user("Unbalanced XREAD list of streams: for each stream key an ID or '$' must be specified."));
        }
        let half = rest.len() / 2;
        let keys: Vec<Vec<u8>> = rest[..half].to_vec();
        let mut last_ids = Vec::with_capacity(half);
        for raw in &rest[half..] {
            let text = arg_str(raw)?;
            let (ms_str, seq_str) = text
                .split_once('-')
                .ok_or_else(|| StoreError::user("Invalid stream ID specified as stream command argument"))?;
            let ms: u64 = ms_str
                .parse()
                .map_err(|_| StoreError::user("Invalid stream ID specified as stream command argument"))?;
            let seq: u64 = seq_str
                .parse()
                .map_err(|_| StoreError::user("Invalid stream ID specified as stream command argument"))?;
            last_ids.push(EntryId { ms, seq });
        }

        Ok(match self.keyspace.xread(&keys, &last_ids) {
            Some(value) => value,
            None => Value::NullBulk,
        })
    }

    fn replconf(&self, args: &[Vec<u8>]) -> StoreResult<Outcome> {
        let sub = args
            .get(1)
            .map(|b| to_upper_ascii(b))
            .ok_or_else(|| StoreError::user("wrong number of arguments for 'replconf' command"))?;
        match sub.as_str() {
            "GETACK" => Ok(Outcome::Ack(Value::Array(vec![
                Value::bulk_from_str("REPLCONF"),
                Value::bulk_from_str("ACK"),
                Value::bulk_from_str(self.replication.applied_offset().to_string()),
            ]))),
            "ACK" => Ok(Outcome::NoReply),
            _ => Ok(Outcome::Reply(Value::Simple("OK".to_string()))),
        }
    }

    fn psync(&self, args: &[Vec<u8>], _is_follower_link: bool) -> StoreResult<Outcome> {
        if args.len() != 3 {
            return Err(StoreError::user("wrong number of arguments for 'psync' command"));
        }
        let reply_line = self.replication.full_resync_line();
        let snapshot = crate::snapshot::encode(&self.keyspace.snapshot_entries());
        Ok(Outcome::BecomeFollower {
            reply: Value::Simple(reply_line),
            snapshot,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::keyspace::system_clock;
    use crate::replication::Role;
    use std::path::PathBuf;

    fn args(parts: &[&str]) -> Vec<Vec<u8>> {
        parts.iter().map(|p| p.as_bytes().to_vec()).collect()
    }

    fn fixture() -> (Keyspace, ServerConfig, Replication) {
        let keyspace = Keyspace::new(system_clock());
        let config = ServerConfig {
            dir: PathBuf::from("tmp"),
            dbfilename: "dump.rdb".to_string(),
            port: 6379,
            replica_of: None,
        };
        let replication = Replication::new(Role::Leader);
        (keyspace, config, replication)
    }

    fn reply(outcome: Outcome) -> Value {
        match outcome {
            Outcome::Reply(v) => v,
            _ => panic!("expected a Reply outcome"),
        }
    }

    #[test]
    fn ping_and_echo() {
        let (keyspace, config, replication) = fixture();
        let dispatcher = Dispatcher {
            keyspace: &keyspace,
            config: &config,
            replication: &replication,
        };
        assert_eq!(
            reply(dispatcher.dispatch(&args(&["PING"]), false).unwrap()),
            Value::Simple("PONG".to_string())
        );
        assert_eq!(
            reply(dispatcher.dispatch(&args(&["ECHO", "hey"]), false).unwrap()),
            Value::Bulk(b"hey".to_vec())
        );
    }

    #[test]
    fn set_then_get_round_trips() {
        let (keyspace, config, replication) = fixture();
        let dispatcher = Dispatcher {
            keyspace: &keyspace,
            config: &config,
            replication: &replication,
        };
        assert!(matches!(
            dispatcher.dispatch(&args(&["SET", "foo", "bar"]), false).unwrap(),
            Outcome::Reply(Value::Simple(s)) if s == "OK"
        ));
        assert_eq!(
            reply(dispatcher.dispatch(&args(&["GET", "foo"]), false).unwrap()),
            Value::Bulk(b"bar".to_vec())
        );
        assert_eq!(
            reply(dispatcher.dispatch(&args(&["TYPE", "foo"]), false).unwrap()),
            Value::Simple("string".to_string())
        );
    }

    #[test]
    fn set_rejects_non_integer_px() {
        let (keyspace, config, replication) = fixture();
        let dispatcher = Dispatcher {
            keyspace: &keyspace,
            config: &config,
            replication: &replication,
        };
        let err = dispatcher
            .dispatch(&args(&["SET", "foo", "bar", "PX", "soon"]), false)
            .unwrap_err();
        assert_eq!(err.to_string(), "PX value must be an integer");
    }

    #[test]
    fn unknown_command_is_reported() {
        let (keyspace, config, replication) = fixture();
        let dispatcher = Dispatcher {
            keyspace: &keyspace,
            config: &config,
            replication: &replication,
        };
        assert!(matches!(
            dispatcher.dispatch(&args(&["NOPE"]), false),
            Err(StoreError::UnknownCommand)
        ));
    }

    #[test]
    fn xadd_zero_zero_is_rejected_with_exact_redis_message() {
        let (keyspace, config, replication) = fixture();
        let dispatcher = Dispatcher {
            keyspace: &keyspace,
            config: &config,
            replication: &replication,
        };
        let err = dispatcher
            .dispatch(&args(&["XADD", "s", "0-0", "field", "val"]), false)
            .unwrap_err();
        assert_eq!(err.to_string(), "The ID specified in XADD must be greater than 0-0");
    }

    #[test]
    fn xread_splits_streams_and_ids_into_parallel_halves() {
        let (keyspace, config, replication) = fixture();
        let dispatcher = Dispatcher {
            keyspace: &keyspace,
            config: &config,
            replication: &replication,
        };
        dispatcher
            .dispatch(&args(&["XADD", "a", "1-1", "x", "1"]), false)
            .unwrap();
        dispatcher
            .dispatch(&args(&["XADD", "b", "1-1", "y", "2"]), false)
            .unwrap();

        let result = reply(
            dispatcher
                .dispatch(
                    &args(&["XREAD", "STREAMS", "a", "b", "0-0", "0-0"]),
                    false,
                )
                .unwrap(),
        );
        match result {
            Value::Array(streams) => assert_eq!(streams.len(), 2),
            _ => panic!("expected array of two streams"),
        }
    }

    #[test]
    fn replconf_ack_elicits_no_reply_but_getack_does() {
        let (keyspace, config, replication) = fixture();
        let dispatcher = Dispatcher {
            keyspace: &keyspace,
            config: &config,
            replication: &replication,
        };
        assert!(matches!(
            dispatcher.dispatch(&args(&["REPLCONF", "ACK", "0"]), false).unwrap(),
            Outcome::NoReply
        ));
        assert!(matches!(
            dispatcher.dispatch(&args(&["REPLCONF", "GETACK", "*"]), false).unwrap(),
            Outcome::Ack(_)
        ));
    }
}
