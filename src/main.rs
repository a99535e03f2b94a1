//! A Redis-protocol-compatible in-memory key/value server with leader/
//! follower replication.

mod commands;
mod config;
mod connection;
mod errors;
mod keyspace;
mod replication;
mod resp;
mod server;
mod snapshot;

use clap::Parser;
use tracing::error;
use tracing_subscriber::{fmt, EnvFilter};

use crate::config::{Args, ServerConfig};

#[tokio::main]
async fn main() -> std::process::ExitCode {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));

    fmt()
        .with_env_filter(filter)
        .with_target(false)
        .with_thread_ids(false)
        .with_thread_names(false)
        .init();

    let args = Args::parse();

    let config = match ServerConfig::from_args(args) {
        Ok(config) => config,
        Err(e) => {
            error!(error = %e, "invalid configuration");
            return std::process::ExitCode::FAILURE;
        }
    };

    match server::run(config).await {
        Ok(()) => std::process::ExitCode::SUCCESS,
        Err(e) => {
            error!(error = %e, "server exited with an error");
            std::process::ExitCode::FAILURE
        }
    }
}
