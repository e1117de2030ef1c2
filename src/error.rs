//! Error taxonomy for the CPV protocol stack.
//!
//! Per the propagation policy: only startup failures are meant to surface
//! as `Result`s to a caller. Everything a running session encounters
//! (a reset peer, a malformed line, a missing measurement) is logged and
//! handled locally — see `node` and `client` for where that happens.

use thiserror::Error;

/// Fatal errors that abort node startup.
#[derive(Debug, Error)]
pub enum NodeError {
    #[error("failed to bind listener on {addr}: {source}")]
    Bind {
        addr: String,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to open delay log {path}: {source}")]
    LogOpen {
        path: String,
        #[source]
        source: std::io::Error,
    },
}

/// A malformed or unrecognized wire message. Never fatal — the caller logs
/// and drops the single offending line, the connection stays open.
#[derive(Debug, Error)]
pub enum WireError {
    #[error("empty message")]
    Empty,

    #[error("unknown message type {0:?}")]
    UnknownType(String),

    #[error("wrong field count for {command}: expected {expected}, got {got}")]
    WrongArity {
        command: &'static str,
        expected: usize,
        got: usize,
    },

    #[error("malformed field {field:?} in {command}: {value:?}")]
    BadField {
        command: &'static str,
        field: &'static str,
        value: String,
    },
}
