//! Per-client connection handling: one tokio task per accepted socket,
//! decoding frames from a growing buffer and dispatching each to a reply
//! — or, once a peer completes PSYNC, switching into a write-only
//! follower-link forwarding loop.

use std::sync::Arc;

use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tracing::{debug, warn};

use crate::commands::{Dispatcher, Outcome};
use crate::config::ServerConfig;
use crate::errors::{StoreError, StoreResult};
use crate::keyspace::Keyspace;
use crate::replication::{Replication, Role};
use crate::resp::{self, Value};

fn is_write_command(verb: &[u8]) -> bool {
    let verb = String::from_utf8_lossy(verb).to_ascii_uppercase();
    matches!(verb.as_str(), "SET" | "XADD")
}

pub async fn handle(
    mut stream: TcpStream,
    keyspace: Arc<Keyspace>,
    config: Arc<ServerConfig>,
    replication: Arc<Replication>,
) {
    let peer = stream
        .peer_addr()
        .map(|a| a.to_string())
        .unwrap_or_else(|_| "unknown".to_string());

    if let Err(e) = run(&mut stream, &keyspace, &config, &replication).await {
        debug!(peer, error = %e, "connection closed");
    }
}

async fn run(
    stream: &mut TcpStream,
    keyspace: &Keyspace,
    config: &ServerConfig,
    replication: &Replication,
) -> StoreResult<()> {
    let dispatcher = Dispatcher {
        keyspace,
        config,
        replication,
    };

    let mut buf: Vec<u8> = Vec::new();
    let mut chunk = [0u8; 8192];

    loop {
        loop {
            let (args, consumed) = match resp::decode_command(&buf) {
                Ok(Some(frame)) => frame,
                Ok(None) => break,
                Err(e) => {
                    warn!(error = %e, "closing connection after protocol error");
                    return Err(e);
                }
            };
            let raw_frame = buf[..consumed].to_vec();
            buf.drain(..consumed);

            if args.is_empty() {
                continue;
            }

            match dispatcher.dispatch(&args, false) {
                Ok(Outcome::Reply(value)) => {
                    stream.write_all(&value.encode()).await?;
                    if replication.role() == Role::Leader && is_write_command(&args[0]) {
                        replication.propagate(&raw_frame);
                    }
                }
                Ok(Outcome::Ack(value)) => {
                    stream.write_all(&value.encode()).await?;
                }
                Ok(Outcome::NoReply) => {}
                Ok(Outcome::BecomeFollower { reply, snapshot }) => {
                    stream.write_all(&reply.encode()).await?;
                    stream.write_all(&resp::encode_bulk_payload(&snapshot)).await?;
                    return forward_to_follower(stream, replication).await;
                }
                Err(e) if e.is_fatal() => {
                    warn!(error = %e, "closing connection after fatal error");
                    return Err(e);
                }
                Err(e) => {
                    let message = match &e {
                        StoreError::UnknownCommand => "ERR unknown command".to_string(),
                        other => format!("ERR {other}"),
                    };
                    stream.write_all(&Value::Error(message).encode()).await?;
                }
            }
        }

        let n = stream.read(&mut chunk).await?;
        if n == 0 {
            return Ok(());
        }
        buf.extend_from_slice(&chunk[..n]);
    }
}

/// A connection that just completed PSYNC becomes a pure write sink:
/// every command the leader propagates is forwarded verbatim. The socket
/// is still polled for readability so a closed connection is noticed.
async fn forward_to_follower(stream: &mut TcpStream, replication: &Replication) -> StoreResult<()> {
    let mut rx = replication.register_follower();
    let mut discard = [0u8; 1024];

    loop {
        tokio::select! {
            frame = rx.recv() => {
                match frame {
                    Some(bytes) => stream.write_all(&bytes).await?,
                    None => return Ok(()),
                }
            }
            n = stream.read(&mut discard) => {
                if n? == 0 {
                    return Ok(());
                }
            }
        }
    }
}
