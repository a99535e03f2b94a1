//! The TCP accept loop: binds the listening socket, spawns one task per
//! accepted connection, and (when running as a follower) spawns the
//! outbound replication task that attaches to the leader.
//!
//! The accept loop itself borrows its shape from a plain
//! `TcpListener::bind` + `loop { listener.accept().await }` dispatcher;
//! the shutdown-signal flag checked between iterations follows the
//! teacher's `shutdown_signal: Arc<AtomicBool>` / `perform_graceful_shutdown`
//! pattern, driven here by a `tokio::signal::ctrl_c()` task instead of a
//! WAL-loop poll.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tokio::net::TcpListener;
use tracing::{error, info, warn};

use crate::config::ServerConfig;
use crate::connection;
use crate::errors::StoreResult;
use crate::keyspace::{system_clock, Keyspace};
use crate::replication::{follower, Replication, Role};
use crate::snapshot;

pub async fn run(config: ServerConfig) -> StoreResult<()> {
    let keyspace = Arc::new(Keyspace::new(system_clock()));

    let now = keyspace.now_ms();
    for (key, value, expires_at_ms) in snapshot::load(&config.snapshot_path(), now)? {
        keyspace.load_string(key, value, expires_at_ms);
    }

    let role = if config.replica_of.is_some() {
        Role::Follower
    } else {
        Role::Leader
    };
    let replication = Arc::new(Replication::new(role));

    let listener = TcpListener::bind(("0.0.0.0", config.port)).await?;
    info!(port = config.port, role = ?role, "listening");

    let shutdown_signal = Arc::new(AtomicBool::new(false));
    {
        let shutdown_signal = shutdown_signal.clone();
        tokio::spawn(async move {
            if tokio::signal::ctrl_c().await.is_ok() {
                info!("shutdown signal received");
                shutdown_signal.store(true, Ordering::SeqCst);
            }
        });
    }

    if let Some((host, port)) = config.replica_of.clone() {
        let config = Arc::new(config.clone());
        let keyspace = keyspace.clone();
        let replication = replication.clone();
        tokio::spawn(async move {
            run_follower_link(config, keyspace, replication, host, port).await;
        });
    }

    let config = Arc::new(config);
    loop {
        if shutdown_signal.load(Ordering::SeqCst) {
            info!("shutdown signal received, stopping accept loop");
            return Ok(());
        }

        let accept = tokio::time::timeout(Duration::from_millis(200), listener.accept()).await;
        let (stream, peer) = match accept {
            Ok(Ok(pair)) => pair,
            Ok(Err(e)) => {
                warn!(error = %e, "accept failed");
                continue;
            }
            Err(_) => continue,
        };

        info!(%peer, "accepted connection");
        let keyspace = keyspace.clone();
        let config = config.clone();
        let replication = replication.clone();
        tokio::spawn(connection::handle(stream, keyspace, config, replication));
    }
}

/// Keeps the outbound replication link to the leader alive, retrying with
/// a fixed backoff if it drops.
async fn run_follower_link(
    config: Arc<ServerConfig>,
    keyspace: Arc<Keyspace>,
    replication: Arc<Replication>,
    host: String,
    port: u16,
) {
    loop {
        if let Err(e) = follower::run(&config, &keyspace, &replication, &host, port).await {
            error!(error = %e, "replication link to leader failed, retrying");
        }
        tokio::time::sleep(Duration::from_secs(1)).await;
    }
}
