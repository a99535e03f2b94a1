//! Configuration for the key/value server.
//!
//! Parses CLI flags with `clap`'s derive API and turns them into a
//! validated `ServerConfig` the server loop and `CONFIG GET` command can
//! both read from.

use std::path::PathBuf;

use clap::Parser;

use crate::errors::{StoreError, StoreResult};

/// Raw CLI arguments before validation.
#[derive(Parser, Debug)]
#[command(
    name = "respd",
    about = "A Redis-protocol-compatible in-memory key/value server",
    version
)]
pub struct Args {
    /// Directory holding the snapshot file.
    #[arg(long, default_value = "tmp")]
    pub dir: String,

    /// Snapshot filename within `--dir`.
    #[arg(long, default_value = "dump.rdb")]
    pub dbfilename: String,

    /// TCP port to listen on.
    #[arg(long, default_value_t = 6379)]
    pub port: u16,

    /// "<host> <port>" of the leader to replicate from. Enables follower mode.
    #[arg(long)]
    pub replicaof: Option<String>,
}

/// Validated, ready-to-use server configuration.
#[derive(Debug, Clone)]
pub struct ServerConfig {
    pub dir: PathBuf,
    pub dbfilename: String,
    pub port: u16,
    pub replica_of: Option<(String, u16)>,
}

impl ServerConfig {
    /// Builds a `ServerConfig` from parsed CLI args, validating the
    /// `--replicaof` value before the server ever binds a socket.
    pub fn from_args(args: Args) -> StoreResult<Self> {
        let replica_of = match args.replicaof {
            Some(spec) => Some(parse_replicaof(&spec)?),
            None => None,
        };

        Ok(Self {
            dir: PathBuf::from(args.dir),
            dbfilename: args.dbfilename,
            port: args.port,
            replica_of,
        })
    }

    /// Full path to the configured snapshot file.
    pub fn snapshot_path(&self) -> PathBuf {
        self.dir.join(&self.dbfilename)
    }

    /// Value returned by `CONFIG GET <param>`, or `None` for unknown params.
    pub fn config_get(&self, param: &str) -> Option<String> {
        match param {
            "dir" => Some(self.dir.to_string_lossy().into_owned()),
            "db_file_name" => Some(self.dbfilename.clone()),
            _ => None,
        }
    }
}

/// Parses `"<host> <port>"` into a `(host, port)` pair.
fn parse_replicaof(spec: &str) -> StoreResult<(String, u16)> {
    let mut parts = spec.split_whitespace();
    let host = parts
        .next()
        .ok_or_else(|| StoreError::config("--replicaof must be \"<host> <port>\""))?;
    let port_str = parts
        .next()
        .ok_or_else(|| StoreError::config("--replicaof must be \"<host> <port>\""))?;
    if parts.next().is_some() {
        return Err(StoreError::config(
            "--replicaof must be \"<host> <port>\" (too many parts)",
        ));
    }
    let port: u16 = port_str
        .parse()
        .map_err(|_| StoreError::config(format!("--replicaof has an invalid port: {port_str}")))?;
    Ok((host.to_string(), port))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_valid_replicaof() {
        let (host, port) = parse_replicaof("localhost 6380").unwrap();
        assert_eq!(host, "localhost");
        assert_eq!(port, 6380);
    }

    #[test]
    fn rejects_missing_port() {
        assert!(parse_replicaof("localhost").is_err());
    }

    #[test]
    fn rejects_non_numeric_port() {
        assert!(parse_replicaof("localhost notaport").is_err());
    }

    #[test]
    fn config_get_known_and_unknown_keys() {
        let cfg = ServerConfig {
            dir: PathBuf::from("/tmp"),
            dbfilename: "dump.rdb".to_string(),
            port: 6379,
            replica_of: None,
        };
        assert_eq!(cfg.config_get("dir"), Some("/tmp".to_string()));
        assert_eq!(cfg.config_get("db_file_name"), Some("dump.rdb".to_string()));
        assert_eq!(cfg.config_get("maxmemory"), None);
    }
}