//! The follower side of the replication handshake and apply loop: connects
//! out to a leader, completes the PING/REPLCONF/PSYNC handshake, loads the
//! snapshot it receives, then applies the leader's write stream forever.

use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tracing::{info, warn};

use crate::commands::{Dispatcher, Outcome};
use crate::config::ServerConfig;
use crate::errors::{StoreError, StoreResult};
use crate::keyspace::Keyspace;
use crate::replication::Replication;
use crate::resp::{self, Value};
use crate::snapshot;

/// Reads a single `\r\n`-terminated line from the stream.
async fn read_line(stream: &mut TcpStream) -> StoreResult<String> {
    let mut line = Vec::new();
    let mut byte = [0u8; 1];
    loop {
        let n = stream.read(&mut byte).await?;
        if n == 0 {
            return Err(StoreError::handshake("leader closed connection"));
        }
        if byte[0] == b'\n' && line.last() == Some(&b'\r') {
            line.pop();
            break;
        }
        line.push(byte[0]);
    }
    String::from_utf8(line).map_err(|_| StoreError::handshake("non-UTF8 handshake line"))
}

async fn send_command(stream: &mut TcpStream, parts: &[&str]) -> StoreResult<()> {
    let value = Value::Array(parts.iter().map(|p| Value::bulk_from_str(*p)).collect());
    stream.write_all(&value.encode()).await?;
    Ok(())
}

async fn expect_simple(stream: &mut TcpStream, expected_prefix: &str) -> StoreResult<String> {
    let line = read_line(stream).await?;
    if !line.starts_with('+') {
        return Err(StoreError::handshake(format!(
            "expected a simple-string reply, got {line:?}"
        )));
    }
    if !line[1..].starts_with(expected_prefix) {
        return Err(StoreError::handshake(format!(
            "unexpected handshake reply: {line:?}"
        )));
    }
    Ok(line[1..].to_string())
}

/// Reads the PSYNC snapshot payload: a `$len\r\n` header followed by
/// exactly `len` bytes, with **no** trailing CRLF (spec.md §4.1 / §9).
async fn read_snapshot_payload(stream: &mut TcpStream) -> StoreResult<Vec<u8>> {
    let header = read_line(stream).await?;
    let len: usize = header
        .strip_prefix('$')
        .and_then(|n| n.parse().ok())
        .ok_or_else(|| StoreError::handshake(format!("bad snapshot header: {header:?}")))?;
    let mut payload = vec![0u8; len];
    stream.read_exact(&mut payload).await?;
    Ok(payload)
}

/// Runs the handshake, loads the snapshot, then applies the leader's
/// write stream until the connection drops. Callers are expected to retry
/// (with backoff) on error.
pub async fn run(
    config: &ServerConfig,
    keyspace: &Keyspace,
    replication: &Replication,
    leader_host: &str,
    leader_port: u16,
) -> StoreResult<()> {
    let mut stream = TcpStream::connect((leader_host, leader_port)).await?;
    info!(leader_host, leader_port, "connecting to leader");

    send_command(&mut stream, &["PING"]).await?;
    expect_simple(&mut stream, "PONG").await?;

    send_command(
        &mut stream,
        &["REPLCONF", "listening-port", &config.port.to_string()],
    )
    .await?;
    expect_simple(&mut stream, "OK").await?;

    send_command(&mut stream, &["REPLCONF", "capa", "psync2"]).await?;
    expect_simple(&mut stream, "OK").await?;

    send_command(&mut stream, &["PSYNC", "?", "-1"]).await?;
    let fullresync = expect_simple(&mut stream, "FULLRESYNC").await?;
    info!(fullresync, "leader accepted PSYNC, receiving snapshot");

    let snapshot_bytes = read_snapshot_payload(&mut stream).await?;
    std::fs::write(config.snapshot_path(), &snapshot_bytes)?;
    let now = keyspace.now_ms();
    for (key, value, expires_at_ms) in snapshot::load(&config.snapshot_path(), now)? {
        keyspace.load_string(key, value, expires_at_ms);
    }

    let dispatcher = Dispatcher {
        keyspace,
        config,
        replication,
    };

    let mut buf: Vec<u8> = Vec::new();
    let mut chunk = [0u8; 8192];
    loop {
        loop {
            match resp::decode_command(&buf) {
                Ok(Some((args, consumed))) => {
                    let frame = buf[..consumed].to_vec();
                    buf.drain(..consumed);
                    let offset_before = replication.advance_offset(frame.len());

                    match dispatcher.dispatch(&args, true) {
                        Ok(Outcome::Ack(_)) => {
                            let reply = Value::Array(vec![
                                Value::bulk_from_str("REPLCONF"),
                                Value::bulk_from_str("ACK"),
                                Value::bulk_from_str(offset_before.to_string()),
                            ]);
                            stream.write_all(&reply.encode()).await?;
                        }
                        Ok(_) => {}
                        Err(e) => warn!(error = %e, "error applying replicated command"),
                    }
                }
                Ok(None) => break,
                Err(e) => return Err(e),
            }
        }

        let n = stream.read(&mut chunk).await?;
        if n == 0 {
            return Err(StoreError::handshake("leader closed replication stream"));
        }
        buf.extend_from_slice(&chunk[..n]);
    }
}
