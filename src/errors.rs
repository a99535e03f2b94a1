//! Error taxonomy for the key/value server.
//!
//! Mirrors the shape of a typical `thiserror` error enum: named struct
//! variants carrying a message, a `#[from]` conversion at the IO boundary,
//! and small constructor helpers so call sites read
//! `StoreError::protocol("...")` instead of building the variant by hand.

use thiserror::Error;

/// Top-level error type returned by codec, keyspace, replication and
/// configuration code.
#[derive(Error, Debug)]
pub enum StoreError {
    /// Malformed RESP framing. The connection handler closes the socket
    /// when it sees this variant.
    #[error("protocol error: {message}")]
    Protocol { message: String },

    /// A recognized command was given bad arguments. The connection
    /// handler replies with a single `-ERR ...` line and keeps the
    /// connection open.
    #[error("{message}")]
    UserError { message: String },

    /// An unrecognized command verb.
    #[error("unknown command")]
    UnknownCommand,

    /// The follower->leader handshake failed at some step.
    #[error("replication handshake error: {message}")]
    Handshake { message: String },

    /// CLI or snapshot configuration is invalid.
    #[error("configuration error: {message}")]
    Config { message: String },

    /// Network/IO failure (peer closed, write failure, bind failure, ...).
    #[error("io error")]
    Io(#[from] std::io::Error),
}

/// Result type alias used throughout the crate.
pub type StoreResult<T> = std::result::Result<T, StoreError>;

impl StoreError {
    pub fn protocol<S: Into<String>>(message: S) -> Self {
        Self::Protocol {
            message: message.into(),
        }
    }

    pub fn user<S: Into<String>>(message: S) -> Self {
        Self::UserError {
            message: message.into(),
        }
    }

    pub fn handshake<S: Into<String>>(message: S) -> Self {
        Self::Handshake {
            message: message.into(),
        }
    }

    pub fn config<S: Into<String>>(message: S) -> Self {
        Self::Config {
            message: message.into(),
        }
    }

    /// Whether this error should close the connection (protocol-level /
    /// IO failure) as opposed to just eliciting an `-ERR` reply.
    pub fn is_fatal(&self) -> bool {
        matches!(self, Self::Protocol { .. } | Self::Io(_))
    }
}
